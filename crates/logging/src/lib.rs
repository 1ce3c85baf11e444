//! Structured logging bootstrap (§11 "Logging"), shared by the daemon binary
//! and anything else that wants the same filter/format policy.
//!
//! Grounded on the teacher's `crates/daemon/src/main.rs` `init_logging()`
//! (`EnvFilter::try_from_default_env`, `tracing_subscriber::registry()`
//! layered with `fmt::layer()`), lifted out into its own crate since the
//! teacher inlined it in a binary and this workspace has more than one
//! binary that wants it.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs a global `tracing` subscriber: `RUST_LOG` if set, else
/// `info,firefly=debug`.
pub fn init() {
    init_with_default_filter("info,firefly=debug");
}

/// Same as [`init`] but with a caller-supplied fallback filter when
/// `RUST_LOG` is unset, so a binary can run quieter or louder by default.
pub fn init_with_default_filter(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
