//! Line-oriented loaders for the hosts-override table and the blacklist
//! suffix set. The original's hosts/blacklist tables were pulled from a
//! remote downstream channel (out of scope here, per the Non-goal on data
//! file downloads); this crate only loads them from local files, in a
//! simple line format decided for this implementation (§9 open question).
//!
//! Hosts file: one entry per line, `#`-prefixed and blank lines skipped:
//! `host group redirect v4_csv_or_dash v6_csv_or_dash`
//!
//! Blacklist file: one suffix label per line, `#`-prefixed and blank lines
//! skipped.

use std::collections::HashSet;
use std::path::Path;

use firefly_matcher::{HostsEntry, HostsTable};

use crate::error::{Result, SettingsError};

pub fn load_hosts_table(path: &Path, has_ipv6: bool) -> Result<HostsTable> {
    let mut table = HostsTable::new(has_ipv6);
    if !path.exists() {
        return Ok(table);
    }
    let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SettingsError::ParseError(format!(
                "hosts file line {}: expected 5 fields, got {}",
                lineno + 1,
                fields.len()
            )));
        }
        let (host, group, redirect, v4_csv, v6_csv) =
            (fields[0], fields[1], fields[2], fields[3], fields[4]);
        let redirect = redirect == "1";
        let v4 = parse_csv_list(v4_csv, lineno + 1)?;
        let v6 = parse_csv_list(v6_csv, lineno + 1)?;
        table.insert(
            host,
            HostsEntry {
                v4,
                v6,
                redirect,
                group: group.to_string(),
            },
        );
    }
    Ok(table)
}

fn parse_csv_list<T: std::str::FromStr>(field: &str, lineno: usize) -> Result<Vec<T>> {
    if field == "-" {
        return Ok(Vec::new());
    }
    field
        .split(',')
        .map(|s| {
            s.parse()
                .map_err(|_| SettingsError::ParseError(format!("hosts file line {lineno}: bad address {s:?}")))
        })
        .collect()
}

pub fn load_blacklist_set(path: &Path) -> Result<HashSet<String>> {
    let mut set = HashSet::new();
    if !path.exists() {
        return Ok(set);
    }
    let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        set.insert(line.to_string());
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "firefly-settings-test-{}-{}-{name}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn test_missing_hosts_file_returns_empty_table() {
        let table = load_hosts_table(Path::new("/nonexistent/hosts.txt"), false).unwrap();
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_hosts_file_parses_entry() {
        let path = temp_path("hosts.txt");
        std::fs::write(&path, "# comment\nfoo.test default 1 93.184.216.34 -\n").unwrap();
        let table = load_hosts_table(&path, false).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(table.count(), 1);
        assert!(table.find("foo.test").is_some());
    }

    #[test]
    fn test_blacklist_file_skips_comments_and_blanks() {
        let path = temp_path("blacklist.txt");
        std::fs::write(&path, "# comment\n\ncensored.test\n").unwrap();
        let set = load_blacklist_set(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("censored.test"));
    }
}
