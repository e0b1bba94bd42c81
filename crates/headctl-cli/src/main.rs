//! `headctl` – animatronic head controller.
//!
//! * `headctl run` loads the configuration, validates it once, and wires the
//!   control loop, sensor poller, remote-control ingress and orchestration
//!   daemon together. Ctrl-C stops playback, publishes offline status and
//!   exits 0.
//! * `headctl inspect <bundle>` decodes and validates a bundle file and prints
//!   a summary.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use headctl_bundle::{BundleStore, format};
use headctl_hal::{EndpointRegistry, SimEndpoint, SimulatedThermalSensor, UdpEndpoint};
use headctl_middleware::{BrokerLink, Message, MqttLink, MqttSettings, TopicSet};
use headctl_runtime::audio::LogAudioSink;
use headctl_runtime::remote::RemoteIngress;
use headctl_runtime::sensing::poll_sensor;
use headctl_runtime::telemetry::init_tracing;
use headctl_runtime::{ControlLoop, ControlLoopConfig, Daemon, DaemonExit, SystemPower};
use headctl_types::{ActuatorTarget, StatusReport};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// CLI arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "headctl")]
#[command(about = "Animatronic head controller: arbitration, bundle playback and broker control")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller daemon
    Run(RunArgs),
    /// Decode and validate a bundle file
    Inspect {
        /// Path to the bundle
        bundle: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Config file (default: ~/.headctl/config.toml)
    #[arg(long, env = "HEADCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the robot identifier used in topic names
    #[arg(long)]
    robot_id: Option<String>,

    /// Override the bundle directory
    #[arg(long)]
    bundle_dir: Option<PathBuf>,

    /// Record actuator commands instead of sending UDP, and use the
    /// simulated thermal sensor
    #[arg(long)]
    simulate: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Installed before the runtime exists; hold for the whole process.
    let _guard = init_tracing("headctl");

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Inspect { bundle } => inspect(&bundle),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "headctl failed");
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(id) = args.robot_id {
        cfg.robot_id = id;
    }
    if let Some(dir) = args.bundle_dir {
        cfg.bundle_dir = dir;
    }
    cfg.validate()?;
    info!(config = ?cfg, simulate = args.simulate, "configuration loaded");

    print_banner(&cfg, args.simulate);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(serve(cfg, args.simulate))
}

// ─────────────────────────────────────────────────────────────────────────────
// Task wiring
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: Config, simulate: bool) -> Result<()> {
    let store = BundleStore::open(&cfg.bundle_dir)?;
    let topics = TopicSet::new(&cfg.robot_id);
    let registry = build_registry(&cfg, simulate).await?;

    // ── Ctrl-C ────────────────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Shutdown signal received – stopping playback …".yellow().bold());
        stop_tx.send_replace(true);
    }) {
        warn!(error = %e, "failed to install the signal handler; Ctrl-C will not shut down cleanly");
    }

    // ── Control loop ──────────────────────────────────────────────────────
    let (intent_tx, intent_rx) = mpsc::channel(64);
    let (sensor_tx, sensor_rx) = watch::channel(None);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let control = ControlLoop::new(
        ControlLoopConfig {
            tick: cfg.tick(),
            watchdog_timeout: cfg.watchdog_timeout(),
            detector: cfg.thermal.detector,
            idle_seed: rand::random(),
        },
        registry,
        Box::new(LogAudioSink::default()),
        intent_rx,
        sensor_rx,
        event_tx,
        Instant::now(),
    );
    let control_task = tokio::spawn(control.run());

    // ── Thermal sensor ────────────────────────────────────────────────────
    let sensor_task = if simulate {
        Some(tokio::spawn(poll_sensor(
            SimulatedThermalSensor::new(rand::random()),
            cfg.sample_period(),
            cfg.tick(),
            sensor_tx,
        )))
    } else {
        if cfg.thermal.enabled {
            warn!("no thermal sensor driver is linked into this build; tracking stays off");
        }
        drop(sensor_tx);
        None
    };

    // ── Remote manual control ─────────────────────────────────────────────
    let remote_task = match cfg.remote.listen {
        Some(addr) => {
            let ingress = RemoteIngress::bind(addr, cfg.remote.rate_per_sec, intent_tx.clone()).await?;
            Some(tokio::spawn(ingress.run()))
        }
        None => None,
    };

    // ── Broker + daemon ───────────────────────────────────────────────────
    let will = Message::new(
        topics.status.clone(),
        serde_json::to_vec(&StatusReport::offline())?,
        true,
    );
    let settings = MqttSettings {
        client_id: format!("headctl-{}", cfg.robot_id),
        host: cfg.broker.host.clone(),
        port: cfg.broker.port,
        username: cfg.broker.username.clone(),
        password: (!cfg.broker.password.is_empty()).then(|| cfg.broker.password.clone()),
        keep_alive: Duration::from_secs(cfg.broker.keep_alive_secs),
        will,
    };
    let mqtt = Arc::new(MqttLink::connect(&settings));
    let link: Arc<dyn BrokerLink> = mqtt.clone();

    let daemon = Daemon::new(
        link,
        topics,
        store,
        intent_tx,
        event_rx,
        Box::new(SystemPower::new(cfg.system.allow_power_commands)),
    );
    let exit = daemon
        .run(async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        })
        .await;

    // ── Teardown ──────────────────────────────────────────────────────────
    for task in [remote_task, sensor_task].into_iter().flatten() {
        task.abort();
        let _ = task.await;
    }
    // Every intent sender is gone now, so the loop releases the actuators
    // and returns.
    match tokio::time::timeout(Duration::from_secs(2), control_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "control loop task failed"),
        Err(_) => warn!("control loop did not stop in time"),
    }
    if let Err(e) = mqtt.disconnect().await {
        warn!(error = %e, "broker disconnect failed");
    }

    match exit {
        DaemonExit::Shutdown => {
            println!("{}", "  ✓ Offline status published. Bye.".green());
            Ok(())
        }
        DaemonExit::System(command) => {
            println!("{} {command:?}", "  ✓ Power command issued:".green());
            Ok(())
        }
        DaemonExit::LinkClosed => anyhow::bail!("broker link closed unexpectedly"),
    }
}

async fn build_registry(cfg: &Config, simulate: bool) -> Result<EndpointRegistry> {
    if simulate {
        return Ok(EndpointRegistry::new()
            .with(Box::new(SimEndpoint::new(ActuatorTarget::Gaze)))
            .with(Box::new(SimEndpoint::new(ActuatorTarget::Mouth))));
    }

    let mut registry = EndpointRegistry::new();
    for (target, port) in [
        (ActuatorTarget::Gaze, cfg.actuators.gaze_port),
        (ActuatorTarget::Mouth, cfg.actuators.mouth_port),
    ] {
        let peer = tokio::net::lookup_host((cfg.actuators.host.as_str(), port))
            .await
            .with_context(|| format!("cannot resolve actuator host {}", cfg.actuators.host))?
            .next()
            .with_context(|| format!("actuator host {} has no address", cfg.actuators.host))?;
        registry.register(Box::new(UdpEndpoint::bind(target, peer).await?));
    }
    Ok(registry)
}

// ─────────────────────────────────────────────────────────────────────────────
// inspect
// ─────────────────────────────────────────────────────────────────────────────

fn inspect(path: &Path) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let id = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let bundle = format::decode(id, &data)?;

    println!();
    println!("  {} {}", "Bundle".bold(), bundle.id.bold().cyan());
    println!("    duration         {} ms", bundle.duration_ms);
    println!("    gaze keyframes   {}", bundle.gaze.len());
    println!("    mouth keyframes  {}", bundle.mouth.len());
    if !bundle.eyelids.is_empty() {
        println!("    eyelid keyframes {}", bundle.eyelids.len());
    }
    if bundle.audio.is_silent() {
        println!("    audio            {}", "none".dimmed());
    } else {
        println!(
            "    audio            {:?}, {} ms, {} bytes",
            bundle.audio.encoding,
            bundle.audio.duration_ms,
            bundle.audio.data.len()
        );
    }
    println!("  {}", "✓ valid".green());
    println!();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner(cfg: &Config, simulate: bool) {
    println!();
    println!(
        "  {} {}",
        "headctl".bold().cyan(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  robot      {}", cfg.robot_id.bold());
    println!("  bundles    {}", cfg.bundle_dir.display());
    println!("  broker     {}:{}", cfg.broker.host, cfg.broker.port);
    if simulate {
        println!("  actuators  {}", "simulated".yellow());
    } else {
        println!(
            "  actuators  {} (gaze :{}, mouth :{})",
            cfg.actuators.host, cfg.actuators.gaze_port, cfg.actuators.mouth_port
        );
    }
    println!();
}
