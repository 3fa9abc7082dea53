//! `winkey` — control the winkey daemon over D-Bus.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use winkeyd::config::{Config, SettingsUpdate};

#[zbus::proxy(
    interface = "org.winkey.Tracker1",
    default_service = "org.winkey.Tracker1",
    default_path = "/org/winkey/Tracker1"
)]
trait Tracker {
    fn start_tracking(&self, camera: u32) -> zbus::Result<()>;
    fn stop_tracking(&self) -> zbus::Result<bool>;
    fn start_preview(&self, camera: u32) -> zbus::Result<()>;
    fn stop_preview(&self) -> zbus::Result<bool>;
    fn set_display(&self, enabled: bool) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
    fn save_snapshot(&self, path: &str) -> zbus::Result<bool>;
    fn apply_settings(&self, update: &str) -> zbus::Result<bool>;
}

/// Winkey - wink to type
#[derive(Parser)]
#[command(name = "winkey")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show session and eye-tracking status
    Status,
    /// Start eye tracking
    Start {
        /// Camera index (default: camera_index from the config)
        #[arg(long)]
        camera: Option<u32>,
    },
    /// Stop eye tracking
    Stop,
    /// Turn the camera preview on or off
    Preview {
        state: Toggle,
        /// Camera index (default: camera_index from the config)
        #[arg(long)]
        camera: Option<u32>,
    },
    /// Turn frame relaying to the display on or off
    Display { state: Toggle },
    /// Save the last displayed frame
    Snapshot { path: PathBuf },
    /// Change settings of the running daemon
    Apply(ApplyArgs),
    /// Validate a config file and print the effective configuration
    CheckConfig { path: Option<PathBuf> },
}

#[derive(Args, Debug, Default)]
struct ApplyArgs {
    /// Openness below which an open eye closes
    #[arg(long)]
    close_threshold: Option<f32>,
    /// Openness above which a closed eye reopens
    #[arg(long)]
    open_threshold: Option<f32>,
    /// Run the landmark model on every Nth frame
    #[arg(long)]
    process_interval: Option<u32>,
    /// Capture width (restarts the running session)
    #[arg(long)]
    width: Option<u32>,
    /// Capture height (restarts the running session)
    #[arg(long)]
    height: Option<u32>,
    /// Capture rate (restarts the running session)
    #[arg(long)]
    fps: Option<u32>,
    /// Both-eyes-closed pulse length in milliseconds
    #[arg(long)]
    pulse_ms: Option<u64>,
    /// Minimum spacing between camera reads in milliseconds
    #[arg(long)]
    min_frame_interval_ms: Option<u64>,
    /// Mark tracked eye contours on displayed frames
    #[arg(long)]
    show_landmarks: Option<Toggle>,
}

impl ApplyArgs {
    fn update(&self) -> SettingsUpdate {
        SettingsUpdate {
            close_threshold: self.close_threshold,
            open_threshold: self.open_threshold,
            process_interval: self.process_interval,
            width: self.width,
            height: self.height,
            fps: self.fps,
            pulse_ms: self.pulse_ms,
            min_frame_interval_ms: self.min_frame_interval_ms,
            show_landmarks: self.show_landmarks.map(|t| t == Toggle::On),
            ..SettingsUpdate::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Camera from the flag, else from the local config, else 0.
fn camera_index(flag: Option<u32>) -> u32 {
    flag.unwrap_or_else(|| match Config::load(None) {
        Ok(config) => config.camera_index,
        Err(e) => {
            tracing::warn!(error = %e, "could not read config; using camera 0");
            0
        }
    })
}

/// The daemon has its own working directory, so send absolute paths.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("resolving current directory")?
        .join(path))
}

fn check_config(path: Option<&Path>) -> Result<bool> {
    match Config::load(path) {
        Ok(config) => {
            println!("configuration OK");
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(true)
        }
        Err(e) => {
            eprintln!("{e}");
            Ok(false)
        }
    }
}

async fn connect(system: bool) -> Result<TrackerProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    TrackerProxy::new(&conn)
        .await
        .context("connecting to winkeyd (is it running?)")
}

async fn run(cli: Cli) -> Result<bool> {
    if let Commands::CheckConfig { path } = &cli.command {
        return check_config(path.as_deref());
    }

    let proxy = connect(cli.system).await?;
    match cli.command {
        Commands::Status => {
            let raw = proxy.status().await?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("daemon returned invalid status JSON")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Start { camera } => {
            let camera = camera_index(camera);
            proxy.start_tracking(camera).await?;
            println!("tracking started on camera {camera}");
        }
        Commands::Stop => {
            if proxy.stop_tracking().await? {
                println!("tracking stopped");
            } else {
                println!("tracking was not running");
            }
        }
        Commands::Preview { state: Toggle::On, camera } => {
            let camera = camera_index(camera);
            proxy.start_preview(camera).await?;
            println!("preview started on camera {camera}");
        }
        Commands::Preview { state: Toggle::Off, .. } => {
            if proxy.stop_preview().await? {
                println!("preview stopped");
            } else {
                println!("preview was not running");
            }
        }
        Commands::Display { state } => {
            proxy.set_display(state == Toggle::On).await?;
            println!("display {}", if state == Toggle::On { "on" } else { "off" });
        }
        Commands::Snapshot { path } => {
            let path = absolute(&path)?;
            let path_str = path
                .to_str()
                .context("snapshot path is not valid UTF-8")?;
            if proxy.save_snapshot(path_str).await? {
                println!("saved {}", path.display());
            } else {
                println!("no frame to save yet");
                return Ok(false);
            }
        }
        Commands::Apply(args) => {
            let update = args.update();
            if update.is_empty() {
                anyhow::bail!("nothing to apply; pass at least one setting");
            }
            let table = toml::to_string(&update).context("encoding settings")?;
            if proxy.apply_settings(&table).await? {
                println!("settings applied; session restarted");
            } else {
                println!("settings applied");
            }
        }
        Commands::CheckConfig { .. } => unreachable!("handled above"),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(true) => std::process::ExitCode::SUCCESS,
        Ok(false) => std::process::ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}
