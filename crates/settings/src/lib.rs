//! Firefly settings (§11 "Configuration"): a JSON-backed `Settings` struct
//! covering listener bind addresses, timeouts, the meek relay list, and the
//! hosts/blacklist data file paths, plus the line-oriented loaders that turn
//! those files into `firefly_matcher` types.

mod config;
mod error;
mod hostsfile;
mod paths;

pub use config::{
    default_settings_path, ListenerSettings, MatcherSettings, MeekRelaySetting, MeekSettings,
    Settings, TimeoutSettings,
};
pub use error::{Result, SettingsError};
pub use hostsfile::{load_blacklist_set, load_hosts_table};
pub use paths::default_config_dir;
