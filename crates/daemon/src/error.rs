use thiserror::Error;

/// Errors from owning listener lifecycles and the control socket (§7).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] firefly_core::CoreError),

    #[error(transparent)]
    Settings(#[from] firefly_settings::SettingsError),

    #[error(transparent)]
    Meek(#[from] firefly_meek::MeekError),

    #[error("control socket error: {0}")]
    Control(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
