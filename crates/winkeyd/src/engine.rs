use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use winkey_core::InputInjector;

use crate::session::{SessionController, SessionSettings};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] winkey_hw::CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] winkey_core::DetectorError),
    #[error("a tracking session is already running")]
    TrackingActive,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("controller thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the control thread.
enum ControlRequest {
    StartPreview {
        camera: u32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StartTracking {
        camera: u32,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    StopPreview {
        reply: oneshot::Sender<bool>,
    },
    StopTracking {
        reply: oneshot::Sender<bool>,
    },
    SetDisplay {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    ApplySettings {
        settings: SessionSettings,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to the control thread.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Open `camera` and relay frames for display.
    pub async fn start_preview(&self, camera: u32) -> Result<(), EngineError> {
        self.request(|reply| ControlRequest::StartPreview { camera, reply })
            .await?
    }

    /// Stop any preview, load the detector and start tracking on `camera`.
    pub async fn start_tracking(&self, camera: u32) -> Result<(), EngineError> {
        self.request(|reply| ControlRequest::StartTracking { camera, reply })
            .await?
    }

    /// Returns whether a preview was running.
    pub async fn stop_preview(&self) -> Result<bool, EngineError> {
        self.request(|reply| ControlRequest::StopPreview { reply })
            .await
    }

    /// Returns whether tracking was running.
    pub async fn stop_tracking(&self) -> Result<bool, EngineError> {
        self.request(|reply| ControlRequest::StopTracking { reply })
            .await
    }

    pub async fn set_display(&self, enabled: bool) -> Result<(), EngineError> {
        self.request(|reply| ControlRequest::SetDisplay { enabled, reply })
            .await
    }

    /// Hand new settings to the controller. Returns whether the running
    /// session was restarted to pick them up.
    pub async fn apply_settings(&self, settings: SessionSettings) -> Result<bool, EngineError> {
        self.request(|reply| ControlRequest::ApplySettings { settings, reply })
            .await?
    }

    /// Stop all sessions, release keys and camera, and end the control thread.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.request(|reply| ControlRequest::Shutdown { reply })
            .await
    }
}

/// Run `controller` on a dedicated OS thread.
///
/// Session starts block on camera opens and model loads, and stops wait for
/// worker threads, so none of it runs on the async runtime. The thread
/// shuts the controller down when asked or when every handle is dropped.
pub fn spawn_controller<I: InputInjector + 'static>(
    mut controller: SessionController<I>,
) -> Result<ControllerHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<ControlRequest>(8);

    std::thread::Builder::new()
        .name("winkey-control".into())
        .spawn(move || {
            tracing::info!("control thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    ControlRequest::StartPreview { camera, reply } => {
                        let result = controller.start_preview(camera);
                        if let Err(e) = &result {
                            tracing::warn!(camera, error = %e, "start preview failed");
                        }
                        let _ = reply.send(result);
                    }
                    ControlRequest::StartTracking { camera, reply } => {
                        let result = controller.start_tracking(camera);
                        if let Err(e) = &result {
                            tracing::warn!(camera, error = %e, "start tracking failed");
                        }
                        let _ = reply.send(result);
                    }
                    ControlRequest::StopPreview { reply } => {
                        let _ = reply.send(controller.stop_preview());
                    }
                    ControlRequest::StopTracking { reply } => {
                        let _ = reply.send(controller.stop_tracking());
                    }
                    ControlRequest::SetDisplay { enabled, reply } => {
                        controller.set_display(enabled);
                        let _ = reply.send(());
                    }
                    ControlRequest::ApplySettings { settings, reply } => {
                        let result = controller.apply_settings(settings);
                        if let Err(e) = &result {
                            tracing::warn!(error = %e, "restart after settings change failed");
                        }
                        let _ = reply.send(result);
                    }
                    ControlRequest::Shutdown { reply } => {
                        controller.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            controller.shutdown();
            tracing::info!("control thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(ControllerHandle { tx })
}
