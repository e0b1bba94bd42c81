//! [`ControlLoop`] – the fixed-period real-time task.
//!
//! The loop exclusively owns the [`ControlArbiter`], the
//! [`ThermalDetector`], the idle generator and the active
//! [`PlaybackSession`]. Everything else reaches it through channels:
//!
//! | Channel | Producer | Semantics |
//! |---|---|---|
//! | `mpsc<LoopIntent>` | daemon, remote ingress | bounded, never dropped |
//! | `watch<Option<SensorSample>>` | sensor poller | newest frame supersedes older |
//! | `mpsc<LoopEvent>` (unbounded) | this loop | session completion back to the daemon |
//!
//! Each tick:
//!
//! 1. **Intents** – apply queued play / stop / remote input.
//! 2. **Sense** – feed the newest thermal sample to the detector.
//! 3. **Play** – advance the active session.
//! 4. **Watchdog** – withdraw sources that went silent.
//! 5. **Emit** – take at most one position per actuator from the owner and
//!    send it. `Claim` / `Relinquish` announce when the head leaves or returns
//!    to live autonomous motion, and blink edges follow eyelid changes.
//!
//! A bundle that finishes on its own keeps the head for the tick it ends on so
//! its closing pose reaches the actuators; the next owner takes over on the
//! following tick.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headctl_bundle::AnimationBundle;
use headctl_hal::EndpointRegistry;
use headctl_kernel::{ControlArbiter, Transition};
use headctl_perception::{DetectorConfig, ThermalDetector, TrackingState};
use headctl_types::{
    ActuatorCommand, ControlVector, EyelidState, HandoffSignal, PlaybackState, SessionId,
    SourceKind, ThermalFrame,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::audio::AudioSink;
use crate::autonomous::IdleMotion;
use crate::timeline::{PlaybackOptions, PlaybackSession, SessionEvent, TimelineFrame};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Mouth position sent when live autonomous motion resumes.
pub const MOUTH_REST: u8 = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    pub tick: Duration,
    /// Silence after which a non-autonomous source loses control.
    pub watchdog_timeout: Duration,
    pub detector: DetectorConfig,
    pub idle_seed: u64,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            watchdog_timeout: Duration::from_millis(1000),
            detector: DetectorConfig::default(),
            idle_seed: rand::random(),
        }
    }
}

/// Requests from other tasks, applied at the next tick boundary.
#[derive(Debug, Clone)]
pub enum LoopIntent {
    Play {
        session_id: SessionId,
        bundle: Arc<AnimationBundle>,
        options: PlaybackOptions,
    },
    Stop,
    /// A decoded live-control datagram.
    Remote(ActuatorCommand),
}

#[derive(Debug, Clone)]
pub enum SensorSample {
    Frame(ThermalFrame),
    /// The sensor could not be read.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// A session ended on its own (not replaced, not stopped).
    SessionFinished { session_id: SessionId },
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub owner: SourceKind,
    pub commands: Vec<ActuatorCommand>,
    pub transitions: Vec<Transition>,
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlLoop
// ─────────────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    config: ControlLoopConfig,
    arbiter: ControlArbiter,
    detector: ThermalDetector,
    idle: IdleMotion,
    session: Option<PlaybackSession>,
    registry: EndpointRegistry,
    audio: Box<dyn AudioSink>,
    intents: mpsc::Receiver<LoopIntent>,
    sensor: watch::Receiver<Option<SensorSample>>,
    events: mpsc::UnboundedSender<LoopEvent>,
    /// Newest remote position per opcode.
    remote_pending: BTreeMap<u8, ActuatorCommand>,
    /// Remote blink edges, in arrival order.
    remote_edges: Vec<ActuatorCommand>,
    thermal_pending: Option<ControlVector>,
    /// Source whose output the previous emission carried.
    emitting: SourceKind,
    /// Eyelids closed by bundle blink edges and not yet reopened.
    lids: EyelidState,
    /// `Claim` has been announced and not yet answered by `Relinquish`.
    claimed: bool,
    intents_closed: bool,
}

impl ControlLoop {
    pub fn new(
        config: ControlLoopConfig,
        registry: EndpointRegistry,
        audio: Box<dyn AudioSink>,
        intents: mpsc::Receiver<LoopIntent>,
        sensor: watch::Receiver<Option<SensorSample>>,
        events: mpsc::UnboundedSender<LoopEvent>,
        now: Instant,
    ) -> Self {
        Self {
            arbiter: ControlArbiter::new(config.watchdog_timeout, now),
            detector: ThermalDetector::new(config.detector),
            idle: IdleMotion::new(config.idle_seed, now),
            config,
            session: None,
            registry,
            audio,
            intents,
            sensor,
            events,
            remote_pending: BTreeMap::new(),
            remote_edges: Vec::new(),
            thermal_pending: None,
            emitting: SourceKind::Autonomous,
            lids: EyelidState::OPEN,
            claimed: false,
            intents_closed: false,
        }
    }

    pub fn owner(&self) -> SourceKind {
        self.arbiter.current()
    }

    pub fn session_state(&self) -> Option<PlaybackState> {
        self.session.as_ref().map(PlaybackSession::state)
    }

    /// Drive ticks until every intent sender has been dropped, then release
    /// the actuators.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.config.tick.as_millis() as u64, "control loop started");
        loop {
            interval.tick().await;
            let report = self.tick(Instant::now()).await;
            for t in &report.transitions {
                debug!(from = %t.from, to = %t.to, reason = ?t.reason, "tick transition");
            }
            if self.intents_closed {
                break;
            }
        }
        self.shutdown(Instant::now()).await;
    }

    /// Run one tick at `now`.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let mut transitions = Vec::new();

        self.drain_intents(now, &mut transitions);
        self.consume_sensor(now, &mut transitions);
        let frame = self.advance_session(now, &mut transitions);
        if let Some(t) = self.arbiter.check_watchdog(now) {
            transitions.push(t);
        }
        self.reconcile_sources();

        let owner = self.arbiter.current();
        let commands = self.collect_commands(owner, frame, now);
        for command in &commands {
            if let Err(e) = self.registry.dispatch(command).await {
                warn!(error = %e, ?command, "actuator command dropped");
            }
        }

        TickReport {
            owner,
            commands,
            transitions,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Intents
    // ─────────────────────────────────────────────────────────────────────────

    fn drain_intents(&mut self, now: Instant, transitions: &mut Vec<Transition>) {
        loop {
            match self.intents.try_recv() {
                Ok(intent) => self.apply_intent(intent, now, transitions),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.intents_closed = true;
                    break;
                }
            }
        }
    }

    fn apply_intent(&mut self, intent: LoopIntent, now: Instant, transitions: &mut Vec<Transition>) {
        match intent {
            LoopIntent::Play {
                session_id,
                bundle,
                options,
            } => {
                if let Some(mut old) = self.session.take() {
                    info!(session_id = %old.id(), "playback replaced by a new request");
                    if old.stop().is_some() {
                        self.audio.stop();
                    }
                }
                self.signal(HandoffSignal::inactive(SourceKind::Bundle), now, transitions);
                info!(%session_id, bundle = %bundle.id, delay_ms = options.delay.as_millis() as u64, looping = options.looping, "playback session created");
                self.session = Some(PlaybackSession::new(session_id, bundle, options, now));
            }
            LoopIntent::Stop => {
                if let Some(mut session) = self.session.take() {
                    info!(session_id = %session.id(), "playback stopped");
                    if session.stop().is_some() {
                        self.audio.stop();
                    }
                }
                self.signal(HandoffSignal::inactive(SourceKind::Bundle), now, transitions);
                self.idle.set_enabled(true);
            }
            LoopIntent::Remote(command) => match command {
                ActuatorCommand::Claim => {
                    self.signal(HandoffSignal::active(SourceKind::Remote), now, transitions);
                }
                ActuatorCommand::Relinquish => {
                    self.clear_remote();
                    self.signal(HandoffSignal::inactive(SourceKind::Remote), now, transitions);
                }
                command if !self.arbiter.is_available(SourceKind::Remote) => {
                    debug!(?command, "remote command without claim discarded");
                }
                command => {
                    self.arbiter.heartbeat(SourceKind::Remote, now);
                    if command.is_positional() {
                        self.remote_pending.insert(command.opcode(), command);
                    } else {
                        self.remote_edges.push(command);
                    }
                }
            },
        }
    }

    fn clear_remote(&mut self) {
        self.remote_pending.clear();
        self.remote_edges.clear();
    }

    fn signal(&mut self, signal: HandoffSignal, now: Instant, transitions: &mut Vec<Transition>) {
        if let Some(t) = self.arbiter.handle(signal, now) {
            transitions.push(t);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sensing
    // ─────────────────────────────────────────────────────────────────────────

    fn consume_sensor(&mut self, now: Instant, transitions: &mut Vec<Transition>) {
        match self.sensor.has_changed() {
            Ok(true) => {}
            Ok(false) => return,
            Err(_) => {
                // Poller is gone.
                if let Some(signal) = self.detector.sensor_lost() {
                    self.signal(signal, now, transitions);
                }
                return;
            }
        }

        let sample = self.sensor.borrow_and_update().clone();
        match sample {
            Some(SensorSample::Frame(frame)) => {
                let out = self.detector.process(&frame);
                if let Some(signal) = out.handoff {
                    self.signal(signal, now, transitions);
                }
                if out.state == TrackingState::Tracking {
                    self.arbiter.heartbeat(SourceKind::Thermal, now);
                }
                if let Some(v) = out.vector {
                    self.thermal_pending = Some(v);
                }
            }
            Some(SensorSample::Lost) => {
                self.thermal_pending = None;
                if let Some(signal) = self.detector.sensor_lost() {
                    self.signal(signal, now, transitions);
                }
            }
            None => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Playback
    // ─────────────────────────────────────────────────────────────────────────

    /// Advance the active session. A `Stopped` frame is returned only when
    /// the session ended on its own while the bundle owned the head.
    fn advance_session(
        &mut self,
        now: Instant,
        transitions: &mut Vec<Transition>,
    ) -> Option<TimelineFrame> {
        let (frame, session_id, bundle) = {
            let session = self.session.as_mut()?;
            (session.advance(now), session.id(), Arc::clone(session.bundle()))
        };

        match frame.event {
            Some(SessionEvent::Started) => {
                info!(%session_id, bundle = %bundle.id, "playback started");
                self.signal(HandoffSignal::active(SourceKind::Bundle), now, transitions);
                self.audio
                    .start(&bundle.id, &bundle.audio, frame.audio_ms.unwrap_or(0));
            }
            Some(SessionEvent::Looped { iteration }) => {
                debug!(%session_id, iteration, "playback looped");
                if let Some(offset) = frame.audio_ms {
                    self.audio.start(&bundle.id, &bundle.audio, offset);
                }
            }
            Some(SessionEvent::Finished { resume_autonomous }) => {
                info!(%session_id, resume_autonomous, "playback finished");
                let owned = self.arbiter.current() == SourceKind::Bundle;
                self.audio.stop();
                self.session = None;
                self.signal(HandoffSignal::inactive(SourceKind::Bundle), now, transitions);
                self.idle.set_enabled(resume_autonomous);
                if self.events.send(LoopEvent::SessionFinished { session_id }).is_err() {
                    warn!(%session_id, "session completion not delivered; daemon is gone");
                }
                return owned.then_some(frame);
            }
            None => {}
        }

        if frame.state == PlaybackState::Playing {
            self.arbiter.heartbeat(SourceKind::Bundle, now);
        }
        Some(frame)
    }

    /// Bring per-source state in line with sources the watchdog withdrew.
    fn reconcile_sources(&mut self) {
        if self.detector.is_tracking() && !self.arbiter.is_available(SourceKind::Thermal) {
            self.detector.sensor_lost();
        }
        if !self.arbiter.is_available(SourceKind::Remote) {
            self.clear_remote();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emission
    // ─────────────────────────────────────────────────────────────────────────

    fn collect_commands(
        &mut self,
        owner: SourceKind,
        frame: Option<TimelineFrame>,
        now: Instant,
    ) -> Vec<ActuatorCommand> {
        let mut commands = Vec::with_capacity(4);

        if let Some(closing) = frame.filter(|f| f.state == PlaybackState::Stopped) {
            // The head stays with the bundle for its closing pose.
            self.push_pose(&closing, &mut commands);
            return commands;
        }

        let autonomous_live = owner == SourceKind::Autonomous && self.idle.is_enabled();
        let mut resumed = false;
        if !autonomous_live && !self.claimed {
            commands.push(ActuatorCommand::Claim);
            self.claimed = true;
        } else if autonomous_live && self.claimed {
            commands.push(ActuatorCommand::Relinquish);
            self.claimed = false;
            resumed = true;
        }

        let regained = owner != self.emitting;
        self.emitting = owner;
        let holding = owner == SourceKind::Autonomous && !self.idle.is_enabled();
        if owner != SourceKind::Bundle && !holding && self.lids != EyelidState::OPEN {
            commands.extend(self.lids.transition_to(EyelidState::OPEN));
            self.lids = EyelidState::OPEN;
        }
        let thermal = self.thermal_pending.take();

        match owner {
            SourceKind::Autonomous => {
                if regained || resumed {
                    self.idle.resync();
                }
                commands.extend(self.idle.next(now).map(ActuatorCommand::gaze));
                if resumed {
                    commands.push(ActuatorCommand::Mouth {
                        position: MOUTH_REST,
                    });
                }
            }
            SourceKind::Thermal => {
                let v = if regained {
                    Some(self.detector.smoothed())
                } else {
                    thermal
                };
                commands.extend(v.map(|v| ActuatorCommand::gaze(v.to_gaze())));
            }
            SourceKind::Bundle => {
                if let Some(f) = frame.filter(|f| f.state == PlaybackState::Playing) {
                    self.push_pose(&f, &mut commands);
                }
            }
            SourceKind::Remote => {
                commands.extend(std::mem::take(&mut self.remote_pending).into_values());
                commands.append(&mut self.remote_edges);
            }
        }
        commands
    }

    /// Gaze, blink edges towards the frame's eyelids, then mouth.
    fn push_pose(&mut self, frame: &TimelineFrame, commands: &mut Vec<ActuatorCommand>) {
        commands.extend(frame.gaze.map(ActuatorCommand::gaze));
        if let Some(lids) = frame.eyelids {
            commands.extend(self.lids.transition_to(lids));
            self.lids = lids;
        }
        commands.extend(frame.mouth.map(|position| ActuatorCommand::Mouth { position }));
    }

    async fn shutdown(&mut self, now: Instant) {
        let mut transitions = Vec::new();
        self.apply_intent(LoopIntent::Stop, now, &mut transitions);
        for command in self.lids.transition_to(EyelidState::OPEN) {
            if let Err(e) = self.registry.dispatch(&command).await {
                warn!(error = %e, "could not reopen eyelids on shutdown");
            }
        }
        self.lids = EyelidState::OPEN;
        if self.claimed {
            if let Err(e) = self.registry.dispatch(&ActuatorCommand::Relinquish).await {
                warn!(error = %e, "could not release actuators on shutdown");
            }
            self.claimed = false;
        }
        info!("control loop stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::recording::{Cue, RecordingSink};
    use crate::timeline::tests::{blinking_bundle, ramp_bundle};
    use headctl_hal::{SentLog, SimEndpoint};
    use headctl_kernel::SwitchReason;
    use headctl_types::{ActuatorTarget, Eye, GazePosition};

    struct Harness {
        lp: ControlLoop,
        intents: mpsc::Sender<LoopIntent>,
        sensor: watch::Sender<Option<SensorSample>>,
        events: mpsc::UnboundedReceiver<LoopEvent>,
        gaze_log: SentLog,
        mouth_log: SentLog,
        audio: RecordingSink,
        t0: Instant,
    }

    fn harness() -> Harness {
        harness_with(ControlLoopConfig {
            idle_seed: 11,
            ..ControlLoopConfig::default()
        })
    }

    fn harness_with(config: ControlLoopConfig) -> Harness {
        let t0 = Instant::now();
        let gaze = SimEndpoint::new(ActuatorTarget::Gaze);
        let mouth = SimEndpoint::new(ActuatorTarget::Mouth);
        let (gaze_log, mouth_log) = (gaze.log(), mouth.log());
        let registry = EndpointRegistry::new()
            .with(Box::new(gaze))
            .with(Box::new(mouth));
        let audio = RecordingSink::default();
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (sensor_tx, sensor_rx) = watch::channel(None);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let lp = ControlLoop::new(
            config,
            registry,
            Box::new(audio.clone()),
            intent_rx,
            sensor_rx,
            event_tx,
            t0,
        );
        Harness {
            lp,
            intents: intent_tx,
            sensor: sensor_tx,
            events: event_rx,
            gaze_log,
            mouth_log,
            audio,
            t0,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn hot_frame(col: usize) -> SensorSample {
        let mut pixels = vec![21.0; 64];
        pixels[3 * 8 + col] = 40.0;
        SensorSample::Frame(ThermalFrame::new(8, 8, pixels).unwrap())
    }

    fn cold_frame() -> SensorSample {
        SensorSample::Frame(ThermalFrame::new(8, 8, vec![21.0; 64]).unwrap())
    }

    fn play(delay_ms: u64, looping: bool, resume_auto: bool) -> (SessionId, LoopIntent) {
        play_bundle(ramp_bundle(), delay_ms, looping, resume_auto)
    }

    fn play_bundle(
        bundle: Arc<AnimationBundle>,
        delay_ms: u64,
        looping: bool,
        resume_auto: bool,
    ) -> (SessionId, LoopIntent) {
        let session_id = SessionId::new_v4();
        let intent = LoopIntent::Play {
            session_id,
            bundle,
            options: PlaybackOptions {
                delay: ms(delay_ms),
                looping,
                resume_auto,
            },
        };
        (session_id, intent)
    }

    fn has_gaze(commands: &[ActuatorCommand]) -> bool {
        commands
            .iter()
            .any(|c| matches!(c, ActuatorCommand::Gaze { .. }))
    }

    #[tokio::test]
    async fn idle_motion_owns_the_head_by_default() {
        let mut h = harness();
        let report = h.lp.tick(h.t0).await;
        assert_eq!(report.owner, SourceKind::Autonomous);
        assert_eq!(report.commands, vec![ActuatorCommand::Gaze { x: 127, y: 127 }]);
        assert_eq!(h.gaze_log.take(), report.commands);
    }

    #[tokio::test]
    async fn delayed_bundle_plays_then_hands_back() {
        let mut h = harness();
        let (session_id, intent) = play(200, false, true);
        h.intents.send(intent).await.unwrap();

        // Pending: autonomous keeps control.
        let r = h.lp.tick(h.t0).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert_eq!(h.lp.session_state(), Some(PlaybackState::Pending));
        let r = h.lp.tick(h.t0 + ms(100)).await;
        assert!(!r.commands.contains(&ActuatorCommand::Claim));

        let r = h.lp.tick(h.t0 + ms(200)).await;
        assert_eq!(r.owner, SourceKind::Bundle);
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::Claim,
                ActuatorCommand::Gaze { x: 0, y: 0 },
                ActuatorCommand::Mouth { position: 0 },
            ]
        );

        let r = h.lp.tick(h.t0 + ms(700)).await;
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::gaze(GazePosition::new(128, 128)),
                ActuatorCommand::Mouth { position: 50 },
            ]
        );

        // The closing pose goes out on the tick the bundle ends.
        let r = h.lp.tick(h.t0 + ms(1200)).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert_eq!(r.transitions[0].reason, SwitchReason::Relinquished);
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::Gaze { x: 255, y: 255 },
                ActuatorCommand::Mouth { position: 100 },
            ]
        );
        assert_eq!(h.lp.session_state(), None);
        assert_eq!(
            h.events.try_recv().unwrap(),
            LoopEvent::SessionFinished { session_id }
        );

        let r = h.lp.tick(h.t0 + ms(1220)).await;
        assert_eq!(r.commands.first(), Some(&ActuatorCommand::Relinquish));
        assert!(has_gaze(&r.commands));
        assert_eq!(
            r.commands.last(),
            Some(&ActuatorCommand::Mouth {
                position: MOUTH_REST
            })
        );
        assert_eq!(h.mouth_log.last(), Some(ActuatorCommand::Mouth { position: MOUTH_REST }));
        assert_eq!(
            h.audio.0.lock().clone(),
            vec![
                Cue::Start {
                    bundle: "ramp".to_string(),
                    offset_ms: 0
                },
                Cue::Stop
            ]
        );
    }

    #[tokio::test]
    async fn higher_priority_claim_wins_the_next_tick() {
        let mut h = harness();
        h.sensor.send_replace(Some(hot_frame(0)));
        let r = h.lp.tick(h.t0).await;
        assert_eq!(r.owner, SourceKind::Thermal);
        assert_eq!(r.commands[0], ActuatorCommand::Claim);
        assert!(has_gaze(&r.commands));

        h.sensor.send_replace(Some(hot_frame(7)));
        h.intents
            .send(LoopIntent::Remote(ActuatorCommand::Claim))
            .await
            .unwrap();
        h.intents
            .send(LoopIntent::Remote(ActuatorCommand::Gaze { x: 9, y: 99 }))
            .await
            .unwrap();
        let r = h.lp.tick(h.t0 + ms(20)).await;
        assert_eq!(r.owner, SourceKind::Remote);
        assert_eq!(r.commands, vec![ActuatorCommand::Gaze { x: 9, y: 99 }]);
    }

    #[tokio::test]
    async fn newest_remote_command_per_target_wins() {
        let mut h = harness();
        for cmd in [
            ActuatorCommand::Claim,
            ActuatorCommand::Mouth { position: 1 },
            ActuatorCommand::Gaze { x: 1, y: 1 },
            ActuatorCommand::Mouth { position: 2 },
        ] {
            h.intents.send(LoopIntent::Remote(cmd)).await.unwrap();
        }
        let r = h.lp.tick(h.t0).await;
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::Claim,
                ActuatorCommand::Gaze { x: 1, y: 1 },
                ActuatorCommand::Mouth { position: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn remote_blinks_pass_through_in_order() {
        let mut h = harness();
        for cmd in [
            ActuatorCommand::Claim,
            ActuatorCommand::BlinkStart { eye: Eye::Left },
            ActuatorCommand::LeftEyelid { position: 40 },
            ActuatorCommand::BlinkEnd { eye: Eye::Left },
            ActuatorCommand::Gaze { x: 5, y: 6 },
        ] {
            h.intents.send(LoopIntent::Remote(cmd)).await.unwrap();
        }
        let r = h.lp.tick(h.t0).await;
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::Claim,
                ActuatorCommand::Gaze { x: 5, y: 6 },
                ActuatorCommand::LeftEyelid { position: 40 },
                ActuatorCommand::BlinkStart { eye: Eye::Left },
                ActuatorCommand::BlinkEnd { eye: Eye::Left },
            ]
        );
    }

    #[tokio::test]
    async fn remote_command_without_claim_is_discarded() {
        let mut h = harness();
        h.intents
            .send(LoopIntent::Remote(ActuatorCommand::Mouth { position: 200 }))
            .await
            .unwrap();
        let r = h.lp.tick(h.t0).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert!(h.mouth_log.is_empty());
    }

    #[tokio::test]
    async fn stop_mid_playback_halts_bundle_commands() {
        let mut h = harness();
        let (_, intent) = play(0, true, false);
        h.intents.send(intent).await.unwrap();
        let r = h.lp.tick(h.t0).await;
        assert_eq!(r.owner, SourceKind::Bundle);

        h.intents.send(LoopIntent::Stop).await.unwrap();
        let r = h.lp.tick(h.t0 + ms(20)).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert_eq!(r.commands[0], ActuatorCommand::Relinquish);
        assert_eq!(h.lp.session_state(), None);
        assert!(h.events.try_recv().is_err(), "explicit stop is not a completion");

        // Stopping again is harmless.
        h.intents.send(LoopIntent::Stop).await.unwrap();
        let r = h.lp.tick(h.t0 + ms(40)).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert!(r.transitions.is_empty());
        assert!(!r.commands.contains(&ActuatorCommand::Relinquish));
    }

    #[tokio::test]
    async fn resume_auto_false_holds_pose_until_stop() {
        let mut h = harness();
        let (_, intent) = play(0, false, false);
        h.intents.send(intent).await.unwrap();
        h.lp.tick(h.t0).await;

        let r = h.lp.tick(h.t0 + ms(1000)).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert_eq!(
            r.commands,
            vec![
                ActuatorCommand::Gaze { x: 255, y: 255 },
                ActuatorCommand::Mouth { position: 100 },
            ]
        );

        // Frozen: no idle gaze, no rest position, claim still held.
        let r = h.lp.tick(h.t0 + ms(1500)).await;
        assert!(r.commands.is_empty());
        assert_eq!(h.mouth_log.last(), Some(ActuatorCommand::Mouth { position: 100 }));

        h.intents.send(LoopIntent::Stop).await.unwrap();
        let r = h.lp.tick(h.t0 + ms(1520)).await;
        assert_eq!(r.commands[0], ActuatorCommand::Relinquish);
        assert!(has_gaze(&r.commands));
        assert_eq!(
            r.commands.last(),
            Some(&ActuatorCommand::Mouth {
                position: MOUTH_REST
            })
        );
    }

    #[tokio::test]
    async fn closing_pose_reaches_actuators_at_tick_rate() {
        let mut h = harness();
        let (_, intent) = play(0, false, false);
        h.intents.send(intent).await.unwrap();
        for t in (0..=1500).step_by(20) {
            h.lp.tick(h.t0 + ms(t)).await;
        }
        assert_eq!(h.gaze_log.last(), Some(ActuatorCommand::Gaze { x: 255, y: 255 }));
        assert_eq!(h.mouth_log.last(), Some(ActuatorCommand::Mouth { position: 100 }));
    }

    #[tokio::test]
    async fn bundle_eyelids_become_blink_edges() {
        let mut h = harness();
        let (_, intent) = play_bundle(blinking_bundle(), 0, false, true);
        h.intents.send(intent).await.unwrap();
        for t in (0..=1100).step_by(20) {
            h.lp.tick(h.t0 + ms(t)).await;
        }
        let blinks: Vec<_> = h
            .gaze_log
            .take()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    ActuatorCommand::BlinkStart { .. } | ActuatorCommand::BlinkEnd { .. }
                )
            })
            .collect();
        assert_eq!(
            blinks,
            vec![
                ActuatorCommand::BlinkStart { eye: Eye::Both },
                ActuatorCommand::BlinkEnd { eye: Eye::Both },
                // Closing pose, then reopened once idle motion takes over.
                ActuatorCommand::BlinkStart { eye: Eye::Left },
                ActuatorCommand::BlinkEnd { eye: Eye::Left },
            ]
        );
    }

    #[tokio::test]
    async fn preempted_bundle_reopens_closed_eyelids() {
        let mut h = harness();
        let (_, intent) = play_bundle(blinking_bundle(), 0, true, true);
        h.intents.send(intent).await.unwrap();
        h.lp.tick(h.t0).await;
        let r = h.lp.tick(h.t0 + ms(450)).await;
        assert!(r.commands.contains(&ActuatorCommand::BlinkStart { eye: Eye::Both }));

        h.intents
            .send(LoopIntent::Remote(ActuatorCommand::Claim))
            .await
            .unwrap();
        let r = h.lp.tick(h.t0 + ms(470)).await;
        assert_eq!(r.owner, SourceKind::Remote);
        assert_eq!(r.commands, vec![ActuatorCommand::BlinkEnd { eye: Eye::Both }]);
    }

    #[tokio::test]
    async fn thermal_holds_control_across_sample_gaps() {
        // Five frames per second against the default one-second watchdog.
        let mut h = harness();
        let mut owners = Vec::new();
        for t in (0..=2000).step_by(20) {
            if t % 200 == 0 {
                h.sensor.send_replace(Some(hot_frame(4)));
            }
            owners.push(h.lp.tick(h.t0 + ms(t)).await.owner);
        }
        assert!(owners.iter().all(|&o| o == SourceKind::Thermal));
        let claims = h
            .gaze_log
            .take()
            .into_iter()
            .filter(|c| matches!(c, ActuatorCommand::Claim | ActuatorCommand::Relinquish))
            .count();
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn completions_survive_a_slow_daemon() {
        let mut h = harness();
        let mut expected = Vec::new();
        for i in 0..40u64 {
            let base = h.t0 + ms(i * 1100);
            let (id, intent) = play(0, false, true);
            expected.push(LoopEvent::SessionFinished { session_id: id });
            h.intents.send(intent).await.unwrap();
            h.lp.tick(base).await;
            h.lp.tick(base + ms(1000)).await;
        }
        let mut received = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            received.push(event);
        }
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn new_play_replaces_running_session() {
        let mut h = harness();
        let (_, first) = play(0, true, true);
        h.intents.send(first).await.unwrap();
        h.lp.tick(h.t0).await;

        let (second_id, second) = play(100, false, true);
        h.intents.send(second).await.unwrap();
        let r = h.lp.tick(h.t0 + ms(20)).await;
        // The replacement is pending, so control falls back meanwhile.
        assert_eq!(r.owner, SourceKind::Autonomous);

        let r = h.lp.tick(h.t0 + ms(120)).await;
        assert_eq!(r.owner, SourceKind::Bundle);
        h.lp.tick(h.t0 + ms(1200)).await;
        assert_eq!(
            h.events.try_recv().unwrap(),
            LoopEvent::SessionFinished {
                session_id: second_id
            }
        );
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn silent_remote_times_out() {
        let mut h = harness();
        h.intents
            .send(LoopIntent::Remote(ActuatorCommand::Claim))
            .await
            .unwrap();
        assert_eq!(h.lp.tick(h.t0).await.owner, SourceKind::Remote);
        assert_eq!(h.lp.tick(h.t0 + ms(900)).await.owner, SourceKind::Remote);

        let r = h.lp.tick(h.t0 + ms(1100)).await;
        assert_eq!(r.owner, SourceKind::Autonomous);
        assert_eq!(r.transitions[0].reason, SwitchReason::Timeout);
        assert_eq!(r.commands[0], ActuatorCommand::Relinquish);
    }

    #[tokio::test]
    async fn thermal_releases_on_cold_frame_and_on_sensor_loss() {
        let mut h = harness();
        h.sensor.send_replace(Some(hot_frame(2)));
        assert_eq!(h.lp.tick(h.t0).await.owner, SourceKind::Thermal);
        h.sensor.send_replace(Some(cold_frame()));
        assert_eq!(h.lp.tick(h.t0 + ms(200)).await.owner, SourceKind::Autonomous);

        h.sensor.send_replace(Some(hot_frame(2)));
        assert_eq!(h.lp.tick(h.t0 + ms(400)).await.owner, SourceKind::Thermal);
        h.sensor.send_replace(Some(SensorSample::Lost));
        assert_eq!(h.lp.tick(h.t0 + ms(600)).await.owner, SourceKind::Autonomous);
    }

    #[tokio::test]
    async fn thermal_regains_control_after_bundle() {
        let mut h = harness();
        h.sensor.send_replace(Some(hot_frame(0)));
        h.lp.tick(h.t0).await;
        let (_, intent) = play(0, false, true);
        h.intents.send(intent).await.unwrap();
        assert_eq!(h.lp.tick(h.t0 + ms(20)).await.owner, SourceKind::Bundle);

        // Keep thermal alive while the bundle plays.
        for i in 1..5 {
            h.sensor.send_replace(Some(hot_frame(0)));
            h.lp.tick(h.t0 + ms(20 + i * 200)).await;
        }
        h.sensor.send_replace(Some(hot_frame(0)));
        let r = h.lp.tick(h.t0 + ms(1020)).await;
        assert_eq!(r.owner, SourceKind::Thermal);
        assert_eq!(r.commands[0], ActuatorCommand::Gaze { x: 255, y: 255 });

        // Thermal re-emits its current position on regaining control.
        let r = h.lp.tick(h.t0 + ms(1040)).await;
        assert_eq!(r.owner, SourceKind::Thermal);
        assert!(has_gaze(&r.commands));
        assert!(!r.commands.contains(&ActuatorCommand::Claim));
    }

    #[tokio::test]
    async fn run_exits_and_releases_when_senders_drop() {
        let h = harness();
        let Harness {
            lp,
            intents,
            gaze_log,
            ..
        } = h;
        intents
            .send(LoopIntent::Remote(ActuatorCommand::Claim))
            .await
            .unwrap();
        drop(intents);
        tokio::time::timeout(Duration::from_secs(2), lp.run())
            .await
            .unwrap();
        let sent = gaze_log.take();
        assert_eq!(sent.first(), Some(&ActuatorCommand::Claim));
        assert_eq!(sent.last(), Some(&ActuatorCommand::Relinquish));
    }
}
