use thiserror::Error;

/// Error taxonomy shared across the SOCKS5, HTTP, and meek surfaces.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("address unreachable: {0}")]
    AddressUnreachable(String),

    #[error("timeout")]
    Timeout,

    #[error("peer closed")]
    PeerClosed,

    #[error("transport retries exhausted")]
    TransportRetryExhausted,

    #[error("application error: {0}")]
    ApplicationError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_protocol() {
        let err = CoreError::Protocol("bad version".to_string());
        assert_eq!(err.to_string(), "protocol error: bad version");
    }

    #[test]
    fn test_error_display_format() {
        let err = CoreError::Format("unknown addrtype".to_string());
        assert_eq!(err.to_string(), "format error: unknown addrtype");
    }

    #[test]
    fn test_error_display_timeout() {
        assert_eq!(CoreError::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_result_type_ok() {
        let result: Result<i32> = Ok(7);
        assert!(result.is_ok());
    }
}
