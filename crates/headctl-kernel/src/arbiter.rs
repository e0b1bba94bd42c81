//! [`ControlArbiter`] – the single owner of "who drives the head right now".
//!
//! # Priority
//!
//! | Rank | Source |
//! |---|---|
//! | 1 | [`SourceKind::Remote`] – live manual control |
//! | 2 | [`SourceKind::Bundle`] – triggered animation playback |
//! | 3 | [`SourceKind::Thermal`] – heat-source tracking |
//! | 4 | [`SourceKind::Autonomous`] – idle motion, always available |
//!
//! # Rules
//!
//! * An `Active` signal marks a source available. If it outranks the current
//!   owner it takes over immediately.
//! * An `Inactive` signal withdraws a source. If it was the owner, control
//!   falls to the highest source still available (ultimately Autonomous).
//! * A non-autonomous source that stays silent past the watchdog timeout is
//!   withdrawn exactly as if it had sent `Inactive`.
//!
//! The arbiter never looks at sensor values or playback clocks; it reacts to
//! handoff signals and heartbeats only.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use headctl_types::{Handoff, HandoffSignal, HeadError, SourceKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::watchdog::Watchdog;

/// Why ownership changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    /// A higher-priority source announced itself.
    Preempted,
    /// The owner announced it was done.
    Relinquished,
    /// The owner went silent past its watchdog deadline.
    Timeout,
}

/// A change of actuator ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SourceKind,
    pub to: SourceKind,
    pub reason: SwitchReason,
}

pub struct ControlArbiter {
    current: SourceKind,
    last_switch: Instant,
    available: BTreeSet<SourceKind>,
    watchdog: Watchdog,
    timeout: Duration,
}

impl ControlArbiter {
    /// Start with Autonomous in control. `timeout` is the watchdog deadline
    /// applied to every other source.
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            current: SourceKind::Autonomous,
            last_switch: now,
            available: BTreeSet::from([SourceKind::Autonomous]),
            watchdog: Watchdog::new(),
            timeout,
        }
    }

    pub fn current(&self) -> SourceKind {
        self.current
    }

    pub fn last_switch(&self) -> Instant {
        self.last_switch
    }

    pub fn is_available(&self, source: SourceKind) -> bool {
        self.available.contains(&source)
    }

    /// Apply one handoff signal.
    pub fn handle(&mut self, signal: HandoffSignal, now: Instant) -> Option<Transition> {
        match signal.handoff {
            Handoff::Active => self.activate(signal.source, now),
            Handoff::Inactive => self.withdraw(signal.source, SwitchReason::Relinquished, now),
        }
    }

    /// Record that `source` produced a command.
    pub fn heartbeat(&mut self, source: SourceKind, now: Instant) {
        self.watchdog.heartbeat(source, now);
    }

    /// Withdraw every source whose watchdog expired.
    ///
    /// Returns the resulting ownership change, if the owner was among them.
    pub fn check_watchdog(&mut self, now: Instant) -> Option<Transition> {
        let mut transition = None;
        for source in self.watchdog.expired(now) {
            let silent_ms = self
                .watchdog
                .silent_for(source, now)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default();
            let err = HeadError::SourceTimeout {
                kind: source,
                silent_ms,
            };
            warn!(error = %err, "control source timed out; treating as relinquished");
            if let Some(t) = self.withdraw(source, SwitchReason::Timeout, now) {
                transition = Some(merge(transition, t));
            }
        }
        transition
    }

    fn activate(&mut self, source: SourceKind, now: Instant) -> Option<Transition> {
        if source == SourceKind::Autonomous {
            return None;
        }
        self.available.insert(source);
        self.watchdog.arm(source, self.timeout, now);
        if source > self.current {
            Some(self.switch_to(source, SwitchReason::Preempted, now))
        } else {
            None
        }
    }

    fn withdraw(
        &mut self,
        source: SourceKind,
        reason: SwitchReason,
        now: Instant,
    ) -> Option<Transition> {
        if source == SourceKind::Autonomous {
            return None;
        }
        self.available.remove(&source);
        self.watchdog.disarm(source);
        if source != self.current {
            return None;
        }
        let next = self
            .available
            .iter()
            .next_back()
            .copied()
            .unwrap_or(SourceKind::Autonomous);
        Some(self.switch_to(next, reason, now))
    }

    fn switch_to(&mut self, to: SourceKind, reason: SwitchReason, now: Instant) -> Transition {
        let from = self.current;
        self.current = to;
        self.last_switch = now;
        info!(%from, %to, ?reason, "control handed off");
        Transition { from, to, reason }
    }
}

/// Collapse two successive transitions within one check into a single hop.
fn merge(first: Option<Transition>, second: Transition) -> Transition {
    match first {
        Some(f) => Transition {
            from: f.from,
            to: second.to,
            reason: second.reason,
        },
        None => second,
    }
}
