use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("missing host")]
    MissingHost,
    #[error("invalid request target: {0}")]
    InvalidTarget(String),
    #[error("forward request timed out")]
    Timeout,
    #[error(transparent)]
    Core(#[from] firefly_core::CoreError),
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HttpProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_host_display() {
        assert_eq!(HttpProxyError::MissingHost.to_string(), "missing host");
    }
}
