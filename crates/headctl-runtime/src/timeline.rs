//! [`PlaybackSession`] – plays one bundle against the wall clock.
//!
//! For a session started at `start` with a start `delay`, the playback
//! position at `now` is `now − start − delay`.
//!
//! | Position | State | Output |
//! |---|---|---|
//! | negative | `Pending` | nothing |
//! | `0..duration` | `Playing` | interpolated gaze/mouth, stepped eyelids, audio cursor |
//! | `≥ duration`, looping | `Playing` | position wraps modulo duration |
//! | `≥ duration`, not looping | `Stopped` | final pose once, then nothing |
//!
//! The session never talks to the arbiter. It reports lifecycle
//! [`SessionEvent`]s and the control loop turns them into handoff signals.

use std::sync::Arc;
use std::time::{Duration, Instant};

use headctl_bundle::AnimationBundle;
use headctl_types::{EyelidState, GazePosition, PlaybackState, PlayRequest, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackOptions {
    pub delay: Duration,
    pub looping: bool,
    /// Hand control back to autonomous motion on natural completion.
    pub resume_auto: bool,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            looping: false,
            resume_auto: true,
        }
    }
}

impl From<&PlayRequest> for PlaybackOptions {
    fn from(req: &PlayRequest) -> Self {
        Self {
            delay: Duration::from_millis(req.delay_ms),
            looping: req.looping,
            resume_auto: req.resume_auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The delay elapsed and the first frame is being played.
    Started,
    /// A looping session wrapped around for the `iteration`-th time.
    Looped { iteration: u32 },
    /// The session ended, naturally or by an explicit stop.
    Finished { resume_autonomous: bool },
}

/// Output of one [`PlaybackSession::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineFrame {
    pub state: PlaybackState,
    pub gaze: Option<GazePosition>,
    pub mouth: Option<u8>,
    /// `None` when the bundle has no eyelid track.
    pub eyelids: Option<EyelidState>,
    /// Position inside the audio segment, while it is still sounding.
    pub audio_ms: Option<u32>,
    pub event: Option<SessionEvent>,
}

impl TimelineFrame {
    fn empty(state: PlaybackState) -> Self {
        Self {
            state,
            gaze: None,
            mouth: None,
            eyelids: None,
            audio_ms: None,
            event: None,
        }
    }
}

pub struct PlaybackSession {
    id: SessionId,
    bundle: Arc<AnimationBundle>,
    start: Instant,
    options: PlaybackOptions,
    state: PlaybackState,
    iteration: u32,
}

impl PlaybackSession {
    pub fn new(
        id: SessionId,
        bundle: Arc<AnimationBundle>,
        options: PlaybackOptions,
        start: Instant,
    ) -> Self {
        Self {
            id,
            bundle,
            start,
            options,
            state: PlaybackState::Pending,
            iteration: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn bundle(&self) -> &Arc<AnimationBundle> {
        &self.bundle
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn options(&self) -> PlaybackOptions {
        self.options
    }

    /// Evaluate the timeline at `now`.
    pub fn advance(&mut self, now: Instant) -> TimelineFrame {
        if self.state == PlaybackState::Stopped {
            return TimelineFrame::empty(PlaybackState::Stopped);
        }

        let elapsed = now.saturating_duration_since(self.start);
        let Some(position) = elapsed.checked_sub(self.options.delay) else {
            return TimelineFrame::empty(PlaybackState::Pending);
        };

        let mut event = None;
        if self.state == PlaybackState::Pending {
            self.state = PlaybackState::Playing;
            event = Some(SessionEvent::Started);
        }

        let duration = self.bundle.duration_ms as f64;
        let mut t = position.as_secs_f64() * 1000.0;

        if t >= duration {
            if self.options.looping && duration > 0.0 {
                let iteration = (t / duration).floor() as u32;
                if iteration > self.iteration {
                    self.iteration = iteration;
                    event = event.or(Some(SessionEvent::Looped { iteration }));
                }
                t %= duration;
            } else {
                self.state = PlaybackState::Stopped;
                let mut frame = self.sample(duration);
                frame.audio_ms = None;
                frame.event = Some(SessionEvent::Finished {
                    resume_autonomous: self.options.resume_auto,
                });
                return frame;
            }
        }

        let mut frame = self.sample(t);
        frame.event = event;
        frame
    }

    /// Force the session to `Stopped`. An explicit stop always resumes
    /// autonomous motion. Returns `None` if already stopped.
    pub fn stop(&mut self) -> Option<SessionEvent> {
        if self.state == PlaybackState::Stopped {
            return None;
        }
        self.state = PlaybackState::Stopped;
        Some(SessionEvent::Finished {
            resume_autonomous: true,
        })
    }

    fn sample(&self, t_ms: f64) -> TimelineFrame {
        let audio = &self.bundle.audio;
        let audio_ms = (!audio.is_silent() && t_ms < audio.duration_ms as f64).then_some(t_ms as u32);
        TimelineFrame {
            state: self.state,
            gaze: self.bundle.gaze.sample(t_ms),
            mouth: self.bundle.mouth.sample(t_ms),
            eyelids: self.bundle.eyelids.sample(t_ms),
            audio_ms,
            event: None,
        }
    }
}
