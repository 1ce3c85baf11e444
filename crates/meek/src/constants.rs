//! Tunable constants for the meek client and server (§4.8, §4.9, §5).

use std::time::Duration;

/// Hex characters of a UUID used as a session id.
pub const SESSION_ID_LENGTH: usize = 16;

/// A meek POST body never exceeds this many bytes; larger queued data is
/// split across successive POSTs.
pub const MAX_PAYLOAD_LENGTH: usize = 65536;

/// Retries of a single roundtrip before giving up and bumping the relay's
/// failure counter.
pub const CLIENT_MAX_TRIES: u32 = 3;
pub const CLIENT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Poll backoff: starts at INITIAL, doubles on every empty roundtrip, caps
/// at MAX; resets to INITIAL on any non-empty roundtrip.
pub const CLIENT_INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const CLIENT_POLL_INTERVAL_MULTIPLIER: u32 = 2;
pub const CLIENT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A relay is excluded from `select_relay` once its failure count reaches this.
pub const CLIENT_MAX_FAILURE: u32 = 3;

/// Shared idle timer across both session directions.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-side: how long a POST is held open waiting for fresh data, and the
/// hard ceiling regardless of how much keeps trickling in.
pub const SERVER_TURNAROUND_TIMEOUT: Duration = Duration::from_secs(2);
pub const SERVER_TURNAROUND_MAX: Duration = Duration::from_secs(25);

/// Period of the server's session-sweep housekeeping task.
pub const SERVER_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub const HEADER_SESSION_ID: &str = "x-session-id";
pub const HEADER_MSGTYPE: &str = "x-msg-type";
pub const HEADER_UDP_PKTS: &str = "x-udp-pkts";
pub const HEADER_MODE: &str = "x-mode";
pub const HEADER_ERROR: &str = "x-error";

pub const MSGTYPE_DATA: &str = "data";
pub const MSGTYPE_TERMINATE: &str = "terminate";
pub const MODE_STREAM: &str = "stream";
