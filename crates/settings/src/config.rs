//! Settings structure: listener bind addresses, timeouts, the meek relay
//! list, and paths to the hosts/blacklist data files (§11 "Configuration").
//!
//! Grounded on the teacher's `crates/settings/src/config.rs`
//! (`Settings::load_or_default`/`.save()`/`.save_to()`, the
//! `config_path: Option<PathBuf>` `#[serde(skip)]` field), retargeted from
//! VPN node/network settings to listener/timeout/meek-relay/matcher
//! settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SettingsError};
use crate::paths::default_config_dir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub listeners: ListenerSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub meek: MeekSettings,

    #[serde(default)]
    pub matcher: MatcherSettings,

    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listeners: ListenerSettings::default(),
            timeouts: TimeoutSettings::default(),
            meek: MeekSettings::default(),
            matcher: MatcherSettings::default(),
            config_path: None,
        }
    }
}

impl Settings {
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings = serde_json::from_str(&content)
                .map_err(|e| SettingsError::ParseError(e.to_string()))?;
            settings.config_path = Some(path.clone());
            info!(path = ?path, "loaded settings");
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.clone());
            Ok(settings)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SettingsError::ParseError(e.to_string()))?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!(path = ?path, "saved settings");
        Ok(())
    }
}

pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}

/// Where the listeners bind (§6 "External interfaces"). `http`,
/// `meek_server`, and `meek_client` are optional: a deployment may run
/// SOCKS5 only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    #[serde(default = "default_socks5_addr")]
    pub socks5_addr: String,

    #[serde(default)]
    pub http_addr: Option<String>,

    #[serde(default)]
    pub meek_server_addr: Option<String>,

    /// A local SOCKS5-speaking address that tunnels each session through
    /// `meek.relays` instead of dialing directly (§4.8 "Session startup").
    #[serde(default)]
    pub meek_client_addr: Option<String>,
}

fn default_socks5_addr() -> String {
    "127.0.0.1:1080".to_string()
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            socks5_addr: default_socks5_addr(),
            http_addr: None,
            meek_server_addr: None,
            meek_client_addr: None,
        }
    }
}

/// Session and connect timeouts (§4.8 "Idle teardown", §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_idle_secs")]
    pub session_idle_secs: u64,

    #[serde(default = "default_connect_secs")]
    pub connect_timeout_secs: u64,
}

fn default_idle_secs() -> u64 {
    60
}

fn default_connect_secs() -> u64 {
    10
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            session_idle_secs: default_idle_secs(),
            connect_timeout_secs: default_connect_secs(),
        }
    }
}

/// One configured meek front-end candidate, matching `firefly_meek::RelayConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeekRelaySetting {
    pub fronturl: String,
    pub hostname: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default)]
    pub stream: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeekSettings {
    #[serde(default)]
    pub relays: Vec<MeekRelaySetting>,

    #[serde(default = "default_probe_secs")]
    pub probe_timeout_secs: u64,
}

fn default_probe_secs() -> u64 {
    5
}

/// Paths to the hosts/blacklist data files and the inline custom glob lists
/// and channel fallback URL fed into `firefly_matcher::BlacklistMatcher`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatcherSettings {
    #[serde(default)]
    pub hosts_path: Option<PathBuf>,

    #[serde(default)]
    pub blacklist_path: Option<PathBuf>,

    #[serde(default)]
    pub custom_blacklist: Vec<String>,

    #[serde(default)]
    pub custom_whitelist: Vec<String>,

    #[serde(default = "default_channel_url")]
    pub channel_url: String,
}

fn default_channel_url() -> String {
    "socks5://127.0.0.1:1080".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.listeners.socks5_addr, "127.0.0.1:1080");
        assert_eq!(settings.timeouts.session_idle_secs, 60);
        assert!(settings.meek.relays.is_empty());
        assert!(settings.matcher.hosts_path.is_none());
    }

    #[test]
    fn test_settings_roundtrip_through_json() {
        let mut settings = Settings::default();
        settings.meek.relays.push(MeekRelaySetting {
            fronturl: "https://cdn.example/".to_string(),
            hostname: "meek.example".to_string(),
            verify: true,
            stream: true,
        });
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.meek.relays.len(), 1);
        assert_eq!(parsed.meek.relays[0].fronturl, "https://cdn.example/");
    }

    #[test]
    fn test_load_from_missing_path_returns_default() {
        let path = std::env::temp_dir().join("firefly-settings-missing-test.json");
        let _ = std::fs::remove_file(&path);
        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.listeners.socks5_addr, default_socks5_addr());
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "firefly-settings-save-test-{}.json",
            std::process::id()
        ));
        let mut settings = Settings::load_from(&path).unwrap();
        settings.listeners.socks5_addr = "0.0.0.0:2000".to_string();
        settings.save().unwrap();

        let reloaded = Settings::load_from(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(reloaded.listeners.socks5_addr, "0.0.0.0:2000");
    }
}
