//! Cross-platform config directory resolution.

use std::path::PathBuf;

/// `$XDG_CONFIG_HOME/firefly`, falling back to `$HOME/.config/firefly`, and
/// finally to `./firefly` if neither environment variable is set.
pub fn default_config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("firefly");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".config").join("firefly");
    }
    PathBuf::from("firefly")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_dir_ends_with_firefly() {
        assert_eq!(default_config_dir().file_name().unwrap(), "firefly");
    }
}
