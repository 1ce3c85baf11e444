//! Owns listener lifecycles and the control surface (§6, §9, §11
//! "Daemon/CLI bootstrap"). This crate is library-only: `apps/cli` is the
//! actual `firefly` binary and drives [`run`] from its `main`.

mod control;
mod error;
mod ipc;
mod service;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

pub use control::{ControlRequest, ControlResponse};
pub use error::{DaemonError, Result};
pub use ipc::{default_socket_path, ControlServer};
pub use service::{build_matcher, DaemonService};

use firefly_settings::Settings;

/// Builds the service, starts every configured listener and the control
/// socket, then blocks until either Ctrl+C or a `Shutdown` control request
/// arrives, at which point everything is torn down and this returns.
pub async fn run(settings: Settings, socket_path: PathBuf) -> Result<()> {
    let mut service = DaemonService::new(settings).await;
    service.start().await?;
    let shutdown_notify = service.shutdown_notify();
    let service = Arc::new(Mutex::new(service));

    let mut control = ControlServer::new(socket_path);
    control.start(service.clone()).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
        _ = shutdown_notify.notified() => {
            info!("shutdown requested over control socket");
        }
    }

    control.stop().await;
    service.lock().await.stop();

    Ok(())
}
