use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier handed out for every accepted play request.
pub type SessionId = Uuid;

/// Physical actuator endpoint a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorTarget {
    /// The eye / gaze controller.
    Gaze,
    /// The jaw / mouth controller.
    Mouth,
}

impl std::fmt::Display for ActuatorTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorTarget::Gaze => write!(f, "gaze"),
            ActuatorTarget::Mouth => write!(f, "mouth"),
        }
    }
}

/// Absolute gaze position, one byte per axis (0..=255, 128 is centre).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GazePosition {
    pub x: u8,
    pub y: u8,
}

impl GazePosition {
    pub const CENTRE: GazePosition = GazePosition { x: 128, y: 128 };

    pub fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }
}

/// Which eyelid(s) a blink addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eye {
    Left,
    Right,
    Both,
}

impl Eye {
    /// Offset of this eye inside the blink opcode block.
    fn index(self) -> u8 {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
            Eye::Both => 2,
        }
    }
}

/// The closed set of commands understood by the actuator endpoints.
///
/// Built once per tick, consumed immediately, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ActuatorCommand {
    /// Hand the actuators back to their on-board idle behaviour.
    Relinquish,
    /// Take exclusive control of the actuators.
    Claim,
    /// Move the eyes to an absolute position.
    Gaze { x: u8, y: u8 },
    /// Set the left eyelid opening (0 closed, 255 fully open).
    LeftEyelid { position: u8 },
    /// Set the right eyelid opening.
    RightEyelid { position: u8 },
    /// Close the eyelid(s) and keep them closed.
    BlinkStart { eye: Eye },
    /// Reopen eyelid(s) closed by [`ActuatorCommand::BlinkStart`].
    BlinkEnd { eye: Eye },
    /// Move the jaw to an absolute position.
    Mouth { position: u8 },
}

impl ActuatorCommand {
    pub const OP_RELINQUISH: u8 = 0x00;
    pub const OP_CLAIM: u8 = 0x01;
    pub const OP_GAZE: u8 = 0x20;
    pub const OP_LEFT_EYELID: u8 = 0x30;
    pub const OP_RIGHT_EYELID: u8 = 0x31;
    /// First of six blink opcodes: start/end pairs for left, right, both.
    pub const OP_BLINK_BASE: u8 = 0x40;
    pub const OP_MOUTH: u8 = 0x50;

    /// Endpoint this command must be delivered to.
    ///
    /// Handoff announcements travel on the gaze link; the mouth controller has
    /// no idle behaviour of its own to suspend. Eyelids belong to the eye
    /// controller.
    pub fn target(&self) -> ActuatorTarget {
        match self {
            ActuatorCommand::Mouth { .. } => ActuatorTarget::Mouth,
            ActuatorCommand::Relinquish
            | ActuatorCommand::Claim
            | ActuatorCommand::Gaze { .. }
            | ActuatorCommand::LeftEyelid { .. }
            | ActuatorCommand::RightEyelid { .. }
            | ActuatorCommand::BlinkStart { .. }
            | ActuatorCommand::BlinkEnd { .. } => ActuatorTarget::Gaze,
        }
    }

    /// Wire opcode (first byte of the datagram).
    pub fn opcode(&self) -> u8 {
        match self {
            ActuatorCommand::Relinquish => Self::OP_RELINQUISH,
            ActuatorCommand::Claim => Self::OP_CLAIM,
            ActuatorCommand::Gaze { .. } => Self::OP_GAZE,
            ActuatorCommand::LeftEyelid { .. } => Self::OP_LEFT_EYELID,
            ActuatorCommand::RightEyelid { .. } => Self::OP_RIGHT_EYELID,
            ActuatorCommand::BlinkStart { eye } => Self::OP_BLINK_BASE + 2 * eye.index(),
            ActuatorCommand::BlinkEnd { eye } => Self::OP_BLINK_BASE + 2 * eye.index() + 1,
            ActuatorCommand::Mouth { .. } => Self::OP_MOUTH,
        }
    }

    /// Blink command for `opcode`, if it lies in the blink block.
    pub fn blink_from_opcode(opcode: u8) -> Option<Self> {
        let offset = opcode.checked_sub(Self::OP_BLINK_BASE)?;
        let eye = match offset / 2 {
            0 => Eye::Left,
            1 => Eye::Right,
            2 => Eye::Both,
            _ => return None,
        };
        Some(if offset % 2 == 0 {
            ActuatorCommand::BlinkStart { eye }
        } else {
            ActuatorCommand::BlinkEnd { eye }
        })
    }

    /// Absolute set-points, where only the newest value matters.
    /// Blinks and handoffs are edges and must not be coalesced.
    pub fn is_positional(&self) -> bool {
        matches!(
            self,
            ActuatorCommand::Gaze { .. }
                | ActuatorCommand::Mouth { .. }
                | ActuatorCommand::LeftEyelid { .. }
                | ActuatorCommand::RightEyelid { .. }
        )
    }

    pub fn gaze(position: GazePosition) -> Self {
        ActuatorCommand::Gaze {
            x: position.x,
            y: position.y,
        }
    }
}

/// Which eyelids an animation holds closed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EyelidState {
    pub left_closed: bool,
    pub right_closed: bool,
}

impl EyelidState {
    pub const OPEN: EyelidState = EyelidState {
        left_closed: false,
        right_closed: false,
    };

    pub fn new(left_closed: bool, right_closed: bool) -> Self {
        Self {
            left_closed,
            right_closed,
        }
    }

    /// Closed eyes expressed as blink addresses; two closed lids are one
    /// `Both` blink.
    fn closed(self) -> Vec<Eye> {
        match (self.left_closed, self.right_closed) {
            (true, true) => vec![Eye::Both],
            (true, false) => vec![Eye::Left],
            (false, true) => vec![Eye::Right],
            (false, false) => Vec::new(),
        }
    }

    /// Blink edges that move the eyelids from `self` to `next`: ends for
    /// lids that open, then starts for lids that close.
    pub fn transition_to(self, next: EyelidState) -> Vec<ActuatorCommand> {
        let (before, after) = (self.closed(), next.closed());
        let ends = before
            .iter()
            .filter(|e| !after.contains(e))
            .map(|&eye| ActuatorCommand::BlinkEnd { eye });
        let starts = after
            .iter()
            .filter(|e| !before.contains(e))
            .map(|&eye| ActuatorCommand::BlinkStart { eye });
        ends.chain(starts).collect()
    }
}

/// The producers competing for the actuators, ordered by priority
/// (`Autonomous` lowest, `Remote` highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Built-in idle motion generator. Always available.
    Autonomous,
    /// Heat-source tracking driven by the thermal sensor.
    Thermal,
    /// Externally triggered bundle playback.
    Bundle,
    /// Live remote / manual control.
    Remote,
}

impl SourceKind {
    /// Every source, highest priority first.
    pub const BY_PRIORITY: [SourceKind; 4] = [
        SourceKind::Remote,
        SourceKind::Bundle,
        SourceKind::Thermal,
        SourceKind::Autonomous,
    ];
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Autonomous => write!(f, "autonomous"),
            SourceKind::Thermal => write!(f, "thermal"),
            SourceKind::Bundle => write!(f, "bundle"),
            SourceKind::Remote => write!(f, "remote"),
        }
    }
}

/// Direction of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handoff {
    Active,
    Inactive,
}

/// Explicit announcement a source sends to the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandoffSignal {
    pub source: SourceKind,
    pub handoff: Handoff,
}

impl HandoffSignal {
    pub fn active(source: SourceKind) -> Self {
        Self {
            source,
            handoff: Handoff::Active,
        }
    }

    pub fn inactive(source: SourceKind) -> Self {
        Self {
            source,
            handoff: Handoff::Inactive,
        }
    }
}

/// Normalised two-axis control output in `-1.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlVector {
    pub x: f32,
    pub y: f32,
}

impl ControlVector {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Map each axis from `-1.0..=1.0` onto the `0..=255` actuator range.
    pub fn to_gaze(self) -> GazePosition {
        GazePosition {
            x: axis_to_byte(self.x),
            y: axis_to_byte(self.y),
        }
    }
}

fn axis_to_byte(v: f32) -> u8 {
    if v.is_nan() {
        return 128;
    }
    ((v.clamp(-1.0, 1.0) + 1.0) * 127.5) as u8
}

/// One sample from the thermal sensor: a row-major temperature grid in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalFrame {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

impl ThermalFrame {
    /// Build a frame, checking the pixel count against the grid dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::SensorFault`] for an empty grid or a pixel count
    /// that does not match `width * height`.
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> Result<Self, HeadError> {
        if width == 0 || height == 0 || pixels.len() != width * height {
            return Err(HeadError::SensorFault(format!(
                "expected {width}x{height} grid, got {} pixels",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
            timestamp: Utc::now(),
        })
    }

    /// Temperature at (`row`, `col`).
    pub fn at(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels.get(row * self.width + col).copied()
    }

    /// Hottest pixel in the frame.
    pub fn peak(&self) -> f32 {
        self.pixels.iter().copied().fold(f32::MIN, f32::max)
    }
}

/// Lifecycle of a playback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    /// Accepted, waiting for its start delay to elapse.
    Pending,
    Playing,
    Stopped,
}

/// State reported by the orchestration daemon on its status topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub state: DaemonState,
    pub current_animation: Option<String>,
}

/// Retained status document, e.g.
/// `{"online":true,"state":"playing","current_animation":"wave.hbdl"}` or
/// the last-will `{"online":false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub online: bool,
    #[serde(flatten)]
    pub playback: Option<PlaybackStatus>,
}

impl StatusReport {
    pub fn online(state: DaemonState, current_animation: Option<String>) -> Self {
        Self {
            online: true,
            playback: Some(PlaybackStatus {
                state,
                current_animation,
            }),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            playback: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Payload of `robot/{id}/animation/play`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRequest {
    /// Bundle name, resolved inside the configured bundle directory.
    pub file: String,
    #[serde(default, alias = "delay")]
    pub delay_ms: u64,
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default = "default_true")]
    pub resume_auto: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemCommand {
    Shutdown,
    Reboot,
}

/// Payload of `robot/{id}/system`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRequest {
    pub command: SystemCommand,
}

#[derive(Debug, Error, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HeadError {
    #[error("Malformed Packet: {0}")]
    MalformedPacket(String),

    #[error("Corrupt Bundle: {0}")]
    CorruptBundle(String),

    #[error("Path Violation: '{0}' resolves outside the bundle directory")]
    PathViolation(String),

    #[error("Bundle Not Found: {0}")]
    BundleNotFound(String),

    #[error("Source Timeout: {kind} went silent for {silent_ms} ms")]
    SourceTimeout { kind: SourceKind, silent_ms: u64 },

    #[error("Broker Disconnect: {0}")]
    BrokerDisconnect(String),

    #[error("Fatal Startup Error: {0}")]
    FatalStartup(String),

    #[error("Transport Error on {target}: {details}")]
    Transport { target: ActuatorTarget, details: String },

    #[error("Sensor Fault: {0}")]
    SensorFault(String),

    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("I/O Error: {0}")]
    Io(String),
}
