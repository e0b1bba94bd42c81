//! Configuration – reads `~/.headctl/config.toml` (or `--config <path>`).
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `HEADCTL_*`
//! environment variables, command-line flags. [`Config::validate`] runs once
//! after all layers are applied.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use headctl_perception::DetectorConfig;
use headctl_types::HeadError;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: String::new(),
            keep_alive_secs: 30,
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field(
                "password",
                if self.password.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("keep_alive_secs", &self.keep_alive_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub host: String,
    pub gaze_port: u16,
    pub mouth_port: u16,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            gaze_port: 5005,
            mouth_port: 5006,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Live manual-control listener; disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    pub rate_per_sec: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen: None,
            rate_per_sec: headctl_runtime::remote::DEFAULT_RATE_PER_SEC,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub tick_ms: u64,
    pub watchdog_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            watchdog_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    pub enabled: bool,
    pub sample_hz: u32,
    #[serde(flatten)]
    pub detector: DetectorConfig,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_hz: 5,
            detector: DetectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Allow `shutdown` / `reboot` requests to actually run.
    pub allow_power_commands: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub robot_id: String,
    pub bundle_dir: PathBuf,
    pub broker: BrokerConfig,
    pub actuators: ActuatorConfig,
    pub remote: RemoteConfig,
    pub control: ControlConfig,
    pub thermal: ThermalConfig,
    pub system: SystemConfig,
}

impl Config {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.control.tick_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.control.watchdog_ms)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.thermal.sample_hz.max(1)))
    }

    /// Reject configurations the daemon cannot start with.
    ///
    /// # Errors
    ///
    /// [`HeadError::FatalStartup`] naming the first problem found.
    pub fn validate(&self) -> Result<(), HeadError> {
        let fatal = |msg: String| Err(HeadError::FatalStartup(msg));

        if self.robot_id.is_empty() {
            return fatal("robot_id is required".to_string());
        }
        if self.robot_id.contains(['/', '+', '#']) {
            return fatal(format!(
                "robot_id {:?} must not contain topic separators or wildcards",
                self.robot_id
            ));
        }
        if self.bundle_dir.as_os_str().is_empty() {
            return fatal("bundle_dir is required".to_string());
        }
        if !self.bundle_dir.is_dir() {
            return fatal(format!(
                "bundle_dir {} is not a directory",
                self.bundle_dir.display()
            ));
        }
        if !(5..=200).contains(&self.control.tick_ms) {
            return fatal(format!(
                "control.tick_ms must be within 5..=200, got {}",
                self.control.tick_ms
            ));
        }
        if self.control.watchdog_ms <= self.control.tick_ms {
            return fatal(format!(
                "control.watchdog_ms ({}) must exceed control.tick_ms ({})",
                self.control.watchdog_ms, self.control.tick_ms
            ));
        }
        if self.thermal.sample_hz == 0 {
            return fatal("thermal.sample_hz must be positive".to_string());
        }
        // Thermal heartbeats arrive once per frame; at least two frames must
        // fit inside the watchdog window.
        let frame_ms = self.sample_period().as_millis() as u64;
        if self.thermal.enabled && self.control.watchdog_ms < 2 * frame_ms {
            return fatal(format!(
                "control.watchdog_ms ({}) must be at least twice the thermal sample period ({frame_ms} ms)",
                self.control.watchdog_ms
            ));
        }
        self.thermal.detector.validate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.headctl/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".headctl").join("config.toml")
}

/// Load the config from `explicit`, or from the default path.
///
/// A missing default file yields the defaults; a missing explicit file is an
/// error. Environment overrides are applied in both cases.
pub fn load(explicit: Option<&Path>) -> Result<Config, HeadError> {
    let mut cfg = match explicit {
        Some(path) => load_from(path)?.ok_or_else(|| {
            HeadError::FatalStartup(format!("config file {} not found", path.display()))
        })?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Parse the file at `path`. Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, HeadError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        HeadError::FatalStartup(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| HeadError::FatalStartup(format!("failed to parse config: {e}")))?;
    warn_if_exposed(path, &cfg);
    Ok(Some(cfg))
}

/// Apply `HEADCTL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HEADCTL_ROBOT_ID` | `robot_id` |
/// | `HEADCTL_BUNDLE_DIR` | `bundle_dir` |
/// | `HEADCTL_BROKER_HOST` | `broker.host` |
/// | `HEADCTL_BROKER_PORT` | `broker.port` |
/// | `HEADCTL_BROKER_USERNAME` | `broker.username` |
/// | `HEADCTL_BROKER_PASSWORD` | `broker.password` |
/// | `HEADCTL_ACTUATOR_HOST` | `actuators.host` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HEADCTL_ROBOT_ID") {
        cfg.robot_id = v;
    }
    if let Ok(v) = std::env::var("HEADCTL_BUNDLE_DIR") {
        cfg.bundle_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("HEADCTL_BROKER_HOST") {
        cfg.broker.host = v;
    }
    if let Ok(v) = std::env::var("HEADCTL_BROKER_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.broker.port = port;
    }
    if let Ok(v) = std::env::var("HEADCTL_BROKER_USERNAME") {
        cfg.broker.username = Some(v);
    }
    if let Ok(v) = std::env::var("HEADCTL_BROKER_PASSWORD") {
        cfg.broker.password = v;
    }
    if let Ok(v) = std::env::var("HEADCTL_ACTUATOR_HOST") {
        cfg.actuators.host = v;
    }
}

/// Broker credentials in a group- or world-readable file get a warning.
fn warn_if_exposed(path: &Path, cfg: &Config) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if cfg.broker.password.is_empty() {
            return;
        }
        if let Ok(meta) = fs::metadata(path)
            && meta.permissions().mode() & 0o077 != 0
        {
            warn!(
                path = %path.display(),
                "config holds a broker password but is readable by other users; chmod 600 it"
            );
        }
    }
    #[cfg(not(unix))]
    let _ = (path, cfg);
}
