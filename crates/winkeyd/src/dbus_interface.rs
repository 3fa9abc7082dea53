use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use winkey_core::StatusBoard;
use zbus::interface;

use crate::config::{Config, SettingsUpdate};
use crate::display::LatestFrame;
use crate::engine::{ControllerHandle, EngineError};
use crate::session::SessionSettings;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub controller: ControllerHandle,
    pub status: StatusBoard,
    pub latest: LatestFrame,
}

/// D-Bus control interface of the winkey daemon.
///
/// Bus name: org.winkey.Tracker1
/// Object path: /org/winkey/Tracker1
pub struct TrackerService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(context: &str, e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "{context}");
    zbus::fdo::Error::Failed(e.to_string())
}

fn invalid(e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "rejected settings update");
    zbus::fdo::Error::InvalidArgs(e.to_string())
}

#[interface(name = "org.winkey.Tracker1")]
impl TrackerService {
    /// Start eye tracking on the given camera, replacing any preview.
    async fn start_tracking(&self, camera: u32) -> zbus::fdo::Result<()> {
        tracing::info!(camera, "start tracking requested");
        let controller = self.state.lock().await.controller.clone();
        controller
            .start_tracking(camera)
            .await
            .map_err(|e| failed("start tracking failed", e))
    }

    /// Stop tracking. Returns false if tracking was not running.
    async fn stop_tracking(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop tracking requested");
        let controller = self.state.lock().await.controller.clone();
        controller
            .stop_tracking()
            .await
            .map_err(|e| failed("stop tracking failed", e))
    }

    /// Start (or restart) the camera preview.
    async fn start_preview(&self, camera: u32) -> zbus::fdo::Result<()> {
        tracing::info!(camera, "start preview requested");
        let controller = self.state.lock().await.controller.clone();
        controller
            .start_preview(camera)
            .await
            .map_err(|e| failed("start preview failed", e))
    }

    /// Stop the preview. Returns false if no preview was running.
    async fn stop_preview(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop preview requested");
        let controller = self.state.lock().await.controller.clone();
        controller
            .stop_preview()
            .await
            .map_err(|e| failed("stop preview failed", e))
    }

    /// Enable or disable relaying frames to the display.
    async fn set_display(&self, enabled: bool) -> zbus::fdo::Result<()> {
        tracing::info!(enabled, "set display requested");
        let mut state = self.state.lock().await;
        state
            .controller
            .set_display(enabled)
            .await
            .map_err(|e| failed("set display failed", e))?;
        state.config.display_enabled = enabled;
        Ok(())
    }

    /// Apply a TOML table of settings to the running daemon.
    ///
    /// Keys are those of the config file that can change at runtime. The
    /// whole update is rejected if any value is invalid. Returns true if
    /// the active session was restarted for a new capture format.
    async fn apply_settings(&self, update: &str) -> zbus::fdo::Result<bool> {
        let update = SettingsUpdate::from_toml(update).map_err(invalid)?;
        if update.is_empty() {
            return Err(invalid("no settings given"));
        }
        tracing::info!(?update, "apply settings requested");

        let mut state = self.state.lock().await;
        let config = state.config.with_update(&update).map_err(invalid)?;
        let settings = SessionSettings::from_config(&config).map_err(invalid)?;
        let result = state.controller.apply_settings(settings).await;
        // The controller keeps new settings even if the restart fails.
        if !matches!(result, Err(EngineError::ChannelClosed)) {
            state.config = config;
        }
        result.map_err(|e| failed("apply settings failed", e))
    }

    /// Return the current tracking status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let snapshot = state.status.snapshot();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera_source": state.config.camera_source,
            "camera_index": state.config.camera_index,
            "display_enabled": state.config.display_enabled,
            "injector": state.config.injector.to_string(),
            "close_threshold": state.config.close_threshold,
            "open_threshold": state.config.open_threshold,
            "process_interval": state.config.process_interval,
            "show_landmarks": state.config.show_landmarks,
            "status": snapshot,
        })
        .to_string())
    }

    /// Save the last displayed frame to `path` (format from the extension).
    ///
    /// Returns false if no frame has been displayed yet.
    async fn save_snapshot(&self, path: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(path, "snapshot requested");
        let latest = self.state.lock().await.latest.clone();
        let path = Path::new(path).to_path_buf();
        tokio::task::spawn_blocking(move || latest.save(&path))
            .await
            .map_err(|e| failed("snapshot task failed", e))?
            .map_err(|e| failed("snapshot failed", e))
    }
}
