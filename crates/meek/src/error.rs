use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeekError {
    #[error("meek session terminated by peer: {0}")]
    Terminated(String),

    #[error("meek transport retries exhausted")]
    RetriesExhausted,

    #[error("meek protocol error: {0}")]
    Protocol(String),

    #[error("no relay available (all above failure threshold)")]
    NoRelayAvailable,

    #[error(transparent)]
    Core(#[from] firefly_core::CoreError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

pub type Result<T> = std::result::Result<T, MeekError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_display() {
        let err = MeekError::Terminated("quota exceeded".to_string());
        assert_eq!(
            err.to_string(),
            "meek session terminated by peer: quota exceeded"
        );
    }
}
