//! The daemon's control surface (§6 "Daemon control surface", §9): a closed
//! set of typed request/reply messages exchanged one JSON object per line
//! over [`crate::ipc`]'s transport, replacing the source's `IPC_`-prefixed
//! dynamic actor dispatch with an explicit enum pair.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A request sent to the daemon over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Report which listeners are up and the active matcher's data sources.
    Status,
    /// Reload the hosts/blacklist data from `path` (or the configured
    /// defaults when `path` is `None`) and publish a new matcher snapshot.
    ReloadMatcher { path: Option<PathBuf> },
    /// Stop all listeners and terminate the daemon.
    Shutdown,
}

/// The daemon's reply to a [`ControlRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ControlResponse {
    Status {
        socks5_addr: Option<String>,
        http_addr: Option<String>,
        meek_addr: Option<String>,
        meek_client_addr: Option<String>,
        hosts_path: Option<PathBuf>,
        blacklist_path: Option<PathBuf>,
    },
    MatcherReloaded,
    ShuttingDown,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_request_roundtrip() {
        let json = serde_json::to_string(&ControlRequest::Status).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ControlRequest::Status));
    }

    #[test]
    fn test_reload_matcher_with_path_roundtrip() {
        let req = ControlRequest::ReloadMatcher {
            path: Some(PathBuf::from("/etc/firefly/hosts")),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        match back {
            ControlRequest::ReloadMatcher { path } => {
                assert_eq!(path, Some(PathBuf::from("/etc/firefly/hosts")))
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_reload_matcher_without_path_roundtrip() {
        let req = ControlRequest::ReloadMatcher { path: None };
        let json = serde_json::to_string(&req).unwrap();
        let back: ControlRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ControlRequest::ReloadMatcher { path: None }));
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = ControlResponse::Error {
            message: "bad path".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: ControlResponse = serde_json::from_str(&json).unwrap();
        match back {
            ControlResponse::Error { message } => assert_eq!(message, "bad path"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_status_response_tag_present() {
        let resp = ControlResponse::Status {
            socks5_addr: Some("127.0.0.1:1080".to_string()),
            http_addr: None,
            meek_addr: None,
            meek_client_addr: None,
            hosts_path: None,
            blacklist_path: None,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"response\":\"status\""));
    }
}
