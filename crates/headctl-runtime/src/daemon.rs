//! [`Daemon`] – the broker-facing orchestration layer.
//!
//! Turns inbound topic messages into [`LoopIntent`]s and keeps the retained
//! status document current:
//!
//! | Input | Effect | Status |
//! |---|---|---|
//! | link connected | (re)subscribe inbound topics | republished |
//! | `animation/play` | resolve + validate bundle, start session | `playing` |
//! | `animation/stop` | stop any session | `idle` (always) |
//! | `system` | power command, if allowed | `{"online":false}` |
//! | session finished | only for the current session | `idle` |
//!
//! A rejected request (bad JSON, path violation, corrupt or missing bundle)
//! is logged and leaves the state untouched.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use headctl_bundle::BundleStore;
use headctl_middleware::{BrokerLink, InboundTopic, LinkEvent, Message, TopicSet};
use headctl_types::{
    DaemonState, HeadError, PlayRequest, SessionId, StatusReport, SystemCommand, SystemRequest,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::control_loop::{LoopEvent, LoopIntent};
use crate::timeline::PlaybackOptions;

// ─────────────────────────────────────────────────────────────────────────────
// Power control
// ─────────────────────────────────────────────────────────────────────────────

/// Executes host power commands.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// Whether power commands may run at all.
    fn is_enabled(&self) -> bool;

    async fn execute(&self, command: SystemCommand) -> Result<(), HeadError>;
}

/// Runs the host's `shutdown` / `reboot` binaries with a fixed argv.
#[derive(Debug, Clone, Copy)]
pub struct SystemPower {
    enabled: bool,
}

impl SystemPower {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn argv(command: SystemCommand) -> (&'static str, &'static [&'static str]) {
        match command {
            SystemCommand::Shutdown => ("shutdown", &["-h", "now"]),
            SystemCommand::Reboot => ("reboot", &[]),
        }
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn execute(&self, command: SystemCommand) -> Result<(), HeadError> {
        if !self.enabled {
            return Err(HeadError::Io("power commands are disabled".to_string()));
        }
        let (program, args) = Self::argv(command);
        info!(program, ?args, "executing power command");
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| HeadError::Io(format!("{program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(HeadError::Io(format!("{program} exited with {status}")))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Daemon
// ─────────────────────────────────────────────────────────────────────────────

/// Why [`Daemon::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonExit {
    /// The shutdown future resolved.
    Shutdown,
    /// A power command was executed.
    System(SystemCommand),
    /// The link's event stream ended.
    LinkClosed,
}

pub struct Daemon {
    link: Arc<dyn BrokerLink>,
    topics: TopicSet,
    store: BundleStore,
    intents: mpsc::Sender<LoopIntent>,
    loop_events: mpsc::UnboundedReceiver<LoopEvent>,
    power: Box<dyn PowerControl>,
    state: DaemonState,
    current: Option<(SessionId, String)>,
}

impl Daemon {
    pub fn new(
        link: Arc<dyn BrokerLink>,
        topics: TopicSet,
        store: BundleStore,
        intents: mpsc::Sender<LoopIntent>,
        loop_events: mpsc::UnboundedReceiver<LoopEvent>,
        power: Box<dyn PowerControl>,
    ) -> Self {
        Self {
            link,
            topics,
            store,
            intents,
            loop_events,
            power,
            state: DaemonState::Idle,
            current: None,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn current_animation(&self) -> Option<&str> {
        self.current.as_ref().map(|(_, name)| name.as_str())
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::online(self.state, self.current_animation().map(str::to_string))
    }

    /// Serve the link until `shutdown` resolves, a power command runs, or the
    /// link closes.
    pub async fn run<F>(mut self, shutdown: F) -> DaemonExit
    where
        F: Future<Output = ()>,
    {
        let mut events = self.link.events();
        tokio::pin!(shutdown);
        info!(status_topic = %self.topics.status, "orchestration daemon started");

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break DaemonExit::Shutdown,
                event = events.next() => match event {
                    Some(LinkEvent::Connected) => self.on_connected().await,
                    Some(LinkEvent::Disconnected(e)) => {
                        warn!(error = %e, "broker link down; waiting for reconnect");
                    }
                    Some(LinkEvent::Message(message)) => {
                        if let Some(exit) = self.on_message(message).await {
                            break exit;
                        }
                    }
                    None => break DaemonExit::LinkClosed,
                },
                Some(event) = self.loop_events.recv() => self.on_loop_event(event).await,
            }
        };

        if exit == DaemonExit::Shutdown {
            info!("shutdown requested; stopping playback");
            self.stop_playback().await;
            self.publish(&StatusReport::offline()).await;
        }
        info!(?exit, "orchestration daemon stopped");
        exit
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Event handlers
    // ─────────────────────────────────────────────────────────────────────────

    async fn on_connected(&mut self) {
        for filter in self.topics.inbound() {
            if let Err(e) = self.link.subscribe(filter).await {
                warn!(filter, error = %e, "subscribe failed");
            }
        }
        self.publish_status().await;
    }

    async fn on_message(&mut self, message: Message) -> Option<DaemonExit> {
        let Some(kind) = self.topics.classify(&message.topic) else {
            debug!(topic = %message.topic, "message on unexpected topic ignored");
            return None;
        };
        match kind {
            InboundTopic::Play => match serde_json::from_slice::<PlayRequest>(&message.payload) {
                Ok(request) => self.handle_play(request).await,
                Err(e) => warn!(error = %e, "invalid play request ignored"),
            },
            InboundTopic::Stop => self.handle_stop().await,
            InboundTopic::System => {
                match serde_json::from_slice::<SystemRequest>(&message.payload) {
                    Ok(request) => return self.handle_system(request.command).await,
                    Err(e) => warn!(error = %e, "invalid system request ignored"),
                }
            }
        }
        None
    }

    async fn on_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::SessionFinished { session_id } => {
                if self.current.as_ref().map(|(id, _)| *id) != Some(session_id) {
                    debug!(%session_id, "finish event for a superseded session ignored");
                    return;
                }
                self.current = None;
                self.state = DaemonState::Idle;
                self.publish_status().await;
            }
        }
    }

    async fn handle_play(&mut self, request: PlayRequest) {
        let bundle = match self.store.load(&request.file).await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(file = %request.file, error = %e, "play request rejected");
                return;
            }
        };

        let session_id = SessionId::new_v4();
        let intent = LoopIntent::Play {
            session_id,
            bundle,
            options: PlaybackOptions::from(&request),
        };
        if self.intents.send(intent).await.is_err() {
            error!(file = %request.file, "control loop is gone; play request dropped");
            return;
        }

        info!(%session_id, file = %request.file, "play request accepted");
        self.current = Some((session_id, request.file));
        self.state = DaemonState::Playing;
        self.publish_status().await;
    }

    async fn handle_stop(&mut self) {
        self.stop_playback().await;
        self.publish_status().await;
    }

    async fn handle_system(&mut self, command: SystemCommand) -> Option<DaemonExit> {
        if !self.power.is_enabled() {
            warn!(?command, "power commands are disabled; request refused");
            return None;
        }

        info!(?command, "system command accepted");
        self.stop_playback().await;
        self.publish(&StatusReport::offline()).await;
        match self.power.execute(command).await {
            Ok(()) => Some(DaemonExit::System(command)),
            Err(e) => {
                error!(?command, error = %e, "system command failed");
                self.publish_status().await;
                None
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn stop_playback(&mut self) {
        if self.intents.send(LoopIntent::Stop).await.is_err() {
            debug!("control loop already gone");
        }
        if let Some((session_id, _)) = self.current.take() {
            info!(%session_id, "playback stop requested");
        }
        self.state = DaemonState::Idle;
        self.store.evict_unused();
    }

    async fn publish_status(&self) {
        self.publish(&self.status()).await;
    }

    async fn publish(&self, report: &StatusReport) {
        let payload = match serde_json::to_vec(report) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "status serialisation failed");
                return;
            }
        };
        if let Err(e) = self
            .link
            .publish(&self.topics.status, Bytes::from(payload), true)
            .await
        {
            warn!(error = %e, "status publish failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use headctl_bundle::format::encode;
    use headctl_bundle::{AnimationBundle, AudioSegment, Channel, Keyframe};
    use headctl_middleware::{MemoryLink, MessageBus, TopicSubscriber};
    use headctl_types::GazePosition;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    #[derive(Clone, Default)]
    struct RecordingPower {
        enabled: bool,
        executed: Arc<Mutex<Vec<SystemCommand>>>,
    }

    #[async_trait]
    impl PowerControl for RecordingPower {
        fn is_enabled(&self) -> bool {
            self.enabled
        }

        async fn execute(&self, command: SystemCommand) -> Result<(), HeadError> {
            self.executed.lock().push(command);
            Ok(())
        }
    }

    struct Harness {
        daemon: Daemon,
        bus: MessageBus,
        topics: TopicSet,
        intents: mpsc::Receiver<LoopIntent>,
        events: mpsc::UnboundedSender<LoopEvent>,
        power: RecordingPower,
        _dir: TempDir,
    }

    fn write_bundle(dir: &std::path::Path, name: &str) {
        let bundle = AnimationBundle {
            id: name.to_string(),
            duration_ms: 400,
            gaze: Channel::new(vec![
                Keyframe::new(0, GazePosition::CENTRE),
                Keyframe::new(400, GazePosition::new(30, 220)),
            ])
            .unwrap(),
            mouth: Channel::new(vec![Keyframe::new(0, 0), Keyframe::new(400, 255)]).unwrap(),
            eyelids: Channel::default(),
            audio: AudioSegment::silent(),
        };
        std::fs::write(dir.join(name), encode(&bundle)).unwrap();
    }

    fn harness(power_enabled: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "wave.hbdl");
        std::fs::write(dir.path().join("broken.hbdl"), b"HBDL\x09\x00garbage").unwrap();

        let bus = MessageBus::default();
        let topics = TopicSet::new("head-01");
        let will = Message::new(topics.status.clone(), r#"{"online":false}"#, true);
        let link = Arc::new(MemoryLink::connect(bus.clone(), Some(will)));
        let (intent_tx, intent_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let power = RecordingPower {
            enabled: power_enabled,
            ..RecordingPower::default()
        };
        let daemon = Daemon::new(
            link,
            topics.clone(),
            BundleStore::open(dir.path()).unwrap(),
            intent_tx,
            event_rx,
            Box::new(power.clone()),
        );
        Harness {
            daemon,
            bus,
            topics,
            intents: intent_rx,
            events: event_tx,
            power,
            _dir: dir,
        }
    }

    fn retained_status(h: &Harness) -> Option<serde_json::Value> {
        h.bus
            .retained(&h.topics.status)
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
    }

    fn play(file: &str) -> PlayRequest {
        serde_json::from_value(serde_json::json!({ "file": file })).unwrap()
    }

    #[tokio::test]
    async fn accepted_play_publishes_playing() {
        let mut h = harness(false);
        h.daemon.handle_play(play("wave.hbdl")).await;
        assert_eq!(h.daemon.state(), DaemonState::Playing);
        assert!(matches!(h.intents.try_recv(), Ok(LoopIntent::Play { .. })));
        assert_eq!(
            retained_status(&h).unwrap(),
            serde_json::json!({"online": true, "state": "playing", "current_animation": "wave.hbdl"})
        );
    }

    #[tokio::test]
    async fn rejected_play_changes_nothing() {
        let mut h = harness(false);
        for file in ["../wave.hbdl", "/etc/passwd", "missing.hbdl", "broken.hbdl"] {
            h.daemon.handle_play(play(file)).await;
            assert_eq!(h.daemon.state(), DaemonState::Idle, "{file}");
        }
        assert!(h.intents.try_recv().is_err());
        assert!(retained_status(&h).is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut h = harness(false);
        h.daemon.handle_play(play("wave.hbdl")).await;
        let idle = serde_json::json!({"online": true, "state": "idle", "current_animation": null});
        for _ in 0..2 {
            h.daemon.handle_stop().await;
            assert_eq!(h.daemon.state(), DaemonState::Idle);
            assert_eq!(retained_status(&h).unwrap(), idle);
        }
        let mut stops = 0;
        while let Ok(intent) = h.intents.try_recv() {
            if matches!(intent, LoopIntent::Stop) {
                stops += 1;
            }
        }
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn only_the_current_session_finishing_returns_to_idle() {
        let mut h = harness(false);
        h.daemon.handle_play(play("wave.hbdl")).await;
        let Ok(LoopIntent::Play { session_id, .. }) = h.intents.try_recv() else {
            panic!("expected a play intent");
        };

        h.daemon
            .on_loop_event(LoopEvent::SessionFinished {
                session_id: SessionId::new_v4(),
            })
            .await;
        assert_eq!(h.daemon.state(), DaemonState::Playing);

        h.daemon
            .on_loop_event(LoopEvent::SessionFinished { session_id })
            .await;
        assert_eq!(h.daemon.state(), DaemonState::Idle);
        assert_eq!(h.daemon.current_animation(), None);
    }

    #[tokio::test]
    async fn power_commands_refused_when_disabled() {
        let mut h = harness(false);
        h.daemon.handle_play(play("wave.hbdl")).await;
        let exit = h.daemon.handle_system(SystemCommand::Shutdown).await;
        assert_eq!(exit, None);
        assert_eq!(h.daemon.state(), DaemonState::Playing);
        assert!(h.power.executed.lock().is_empty());
    }

    #[tokio::test]
    async fn power_command_publishes_offline_then_runs() {
        let mut h = harness(true);
        let exit = h.daemon.handle_system(SystemCommand::Reboot).await;
        assert_eq!(exit, Some(DaemonExit::System(SystemCommand::Reboot)));
        assert_eq!(*h.power.executed.lock(), vec![SystemCommand::Reboot]);
        assert_eq!(
            retained_status(&h).unwrap(),
            serde_json::json!({"online": false})
        );
    }

    #[test]
    fn power_argv_is_fixed() {
        assert_eq!(
            SystemPower::argv(SystemCommand::Shutdown),
            ("shutdown", &["-h", "now"][..])
        );
        assert_eq!(SystemPower::argv(SystemCommand::Reboot), ("reboot", &[][..]));
    }

    #[tokio::test]
    async fn disabled_system_power_refuses_to_execute() {
        let power = SystemPower::new(false);
        assert!(!power.is_enabled());
        assert!(power.execute(SystemCommand::Reboot).await.is_err());
    }

    async fn next_status(sub: &mut TopicSubscriber) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&msg.payload).unwrap()
    }

    #[tokio::test]
    async fn serves_the_link_end_to_end() {
        let h = harness(false);
        let Harness {
            daemon,
            bus,
            topics,
            mut intents,
            events,
            _dir,
            ..
        } = h;
        let mut status = bus.subscribe(topics.status.clone());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(daemon.run(async {
            let _ = stop_rx.await;
        }));

        // Initial status proves the inbound subscriptions are in place.
        assert_eq!(next_status(&mut status).await["state"], "idle");

        bus.publish(Message::new(topics.play.clone(), "not json", false));
        bus.publish(Message::new(
            topics.play.clone(),
            r#"{"file":"wave.hbdl","delay_ms":200,"loop":true}"#,
            false,
        ));
        let playing = next_status(&mut status).await;
        assert_eq!(playing["state"], "playing");
        assert_eq!(playing["current_animation"], "wave.hbdl");

        let Some(LoopIntent::Play {
            session_id,
            options,
            ..
        }) = intents.recv().await
        else {
            panic!("expected a play intent");
        };
        assert_eq!(options.delay, Duration::from_millis(200));
        assert!(options.looping && options.resume_auto);

        events
            .send(LoopEvent::SessionFinished { session_id })
            .unwrap();
        assert_eq!(next_status(&mut status).await["state"], "idle");

        stop_tx.send(()).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, DaemonExit::Shutdown);
        assert!(matches!(intents.recv().await, Some(LoopIntent::Stop)));
        assert_eq!(
            bus.retained(&topics.status).unwrap().payload,
            Bytes::from_static(br#"{"online":false}"#)
        );
    }
}
