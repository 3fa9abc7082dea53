use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{watch, Mutex};
use tracing_subscriber::EnvFilter;
use winkey_core::{shared_gate, DetectorError, LandmarkDetector};
use winkey_hw::{CameraBackend, ReplayBackend};

use winkeyd::config::{CameraSource, Config};
use winkeyd::dbus_interface::{AppState, TrackerService};
use winkeyd::display::{DisplayConsumer, LatestFrame};
use winkeyd::engine::spawn_controller;
use winkeyd::session::{DetectorFactory, SessionController, SessionSettings, SessionShared};
use winkeyd::{inject, BUS_NAME, OBJECT_PATH};

#[derive(Parser)]
#[command(name = "winkeyd", version, about = "Eye-gesture keyboard daemon")]
struct Args {
    /// Config file (default: $WINKEY_CONFIG, then $XDG_CONFIG_HOME/winkey/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn camera_backend(config: &Config) -> Result<Box<dyn CameraBackend>> {
    let source = config
        .camera_source()
        .map_err(anyhow::Error::msg)?;
    Ok(match source {
        CameraSource::Replay(dir) => {
            tracing::info!(dir = %dir.display(), "using replay camera");
            Box::new(ReplayBackend::new(dir))
        }
        #[cfg(feature = "v4l")]
        CameraSource::V4l => Box::new(winkey_hw::V4lBackend::new()),
        #[cfg(not(feature = "v4l"))]
        CameraSource::V4l => {
            tracing::warn!("built without the v4l feature; camera sessions will fail");
            Box::new(winkey_hw::UnsupportedBackend::new(
                "winkeyd was built without the v4l feature",
            ))
        }
    })
}

#[cfg(feature = "onnx")]
fn detector_factory(config: &Config) -> DetectorFactory {
    let path = config.model_path.clone();
    Box::new(move || -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        Ok(Box::new(winkey_core::FaceMeshLandmarker::load(&path)?))
    })
}

#[cfg(not(feature = "onnx"))]
fn detector_factory(_config: &Config) -> DetectorFactory {
    Box::new(|| -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        Err(DetectorError::Unavailable(
            "winkeyd was built without the onnx feature".into(),
        ))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    tracing::info!("winkeyd starting");

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    let settings = SessionSettings::from_config(&config)?;
    let shared = SessionShared::new(config.display_enabled);

    let controller = SessionController::new(
        settings,
        camera_backend(&config)?,
        detector_factory(&config),
        shared_gate(inject::build_injector(&config)),
        shared.clone(),
    );
    let controller = spawn_controller(controller)?;

    if config.preview_on_start && config.display_enabled {
        if let Err(e) = controller.start_preview(config.camera_index).await {
            tracing::warn!(camera = config.camera_index, error = %e, "initial preview failed");
        }
    }

    let latest = LatestFrame::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let display = tokio::spawn(DisplayConsumer::new(&shared, latest.clone()).run(shutdown_rx));

    let session_bus = config.session_bus;
    let service = TrackerService {
        state: Arc::new(Mutex::new(AppState {
            config,
            controller: controller.clone(),
            status: shared.status.clone(),
            latest,
        })),
    };
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = if session_bus { "session" } else { "system" }, name = BUS_NAME, "winkeyd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("winkeyd shutting down");

    if let Err(e) = controller.shutdown().await {
        tracing::error!(error = %e, "controller shutdown failed");
    }
    let _ = shutdown_tx.send(true);
    let _ = display.await;

    Ok(())
}
