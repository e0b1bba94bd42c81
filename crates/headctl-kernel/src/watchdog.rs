//! [`Watchdog`] – per-source activity monitor.
//!
//! Every non-autonomous control source is armed when it announces itself
//! active. The control loop calls [`Watchdog::heartbeat`] whenever that
//! source produces a command; a source whose deadline passes is reported by
//! [`Watchdog::expired`] so the arbiter can fall through the priority chain.
//!
//! All methods take the current [`Instant`] explicitly so the control loop
//! evaluates every deadline against the same tick timestamp.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use headctl_types::SourceKind;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceHealth {
    /// Active within its deadline.
    Healthy,
    /// Silent for longer than its deadline, or never armed.
    TimedOut,
}

struct Deadline {
    last_heartbeat: Instant,
    timeout: Duration,
}

impl Deadline {
    fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats from armed sources.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use headctl_kernel::watchdog::{SourceHealth, Watchdog};
/// use headctl_types::SourceKind;
///
/// let start = Instant::now();
/// let mut wd = Watchdog::new();
/// wd.arm(SourceKind::Remote, Duration::from_secs(1), start);
///
/// assert_eq!(wd.health(SourceKind::Remote, start), SourceHealth::Healthy);
/// assert_eq!(
///     wd.health(SourceKind::Remote, start + Duration::from_secs(2)),
///     SourceHealth::TimedOut
/// );
/// ```
#[derive(Default)]
pub struct Watchdog {
    deadlines: HashMap<SourceKind, Deadline>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `source` with a `timeout`, counting from `now`.
    ///
    /// Re-arming an existing source resets its deadline.
    pub fn arm(&mut self, source: SourceKind, timeout: Duration, now: Instant) {
        self.deadlines.insert(
            source,
            Deadline {
                last_heartbeat: now,
                timeout,
            },
        );
    }

    /// Stop watching `source`.
    pub fn disarm(&mut self, source: SourceKind) {
        self.deadlines.remove(&source);
    }

    /// Record activity for `source`. No-ops for sources that are not armed.
    pub fn heartbeat(&mut self, source: SourceKind, now: Instant) {
        if let Some(deadline) = self.deadlines.get_mut(&source) {
            deadline.last_heartbeat = now;
        }
    }

    /// Returns [`SourceHealth::TimedOut`] for sources that are not armed.
    pub fn health(&self, source: SourceKind, now: Instant) -> SourceHealth {
        match self.deadlines.get(&source) {
            Some(d) if d.silent_for(now) <= d.timeout => SourceHealth::Healthy,
            _ => SourceHealth::TimedOut,
        }
    }

    /// Time since the last heartbeat of an armed source.
    pub fn silent_for(&self, source: SourceKind, now: Instant) -> Option<Duration> {
        self.deadlines.get(&source).map(|d| d.silent_for(now))
    }

    /// Every armed source whose deadline has been exceeded, highest priority
    /// first.
    pub fn expired(&self, now: Instant) -> Vec<SourceKind> {
        let mut expired: Vec<SourceKind> = self
            .deadlines
            .keys()
            .copied()
            .filter(|&source| self.health(source, now) == SourceHealth::TimedOut)
            .collect();
        expired.sort_by(|a, b| b.cmp(a));
        expired
    }
}
