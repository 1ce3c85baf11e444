//! Custom whitelist/blacklist globs plus the suffix-label blacklist set
//! (§4.5 rules 2-4). Grounded on `BlacklistMatcher.find` (`matcher.py`).

use std::collections::HashSet;

use firefly_core::ForwardDecision;

use crate::glob::glob_match;

#[derive(Debug, Clone)]
pub struct BlacklistMatcher {
    blacklist: HashSet<String>,
    custom_blacklist: Vec<String>,
    custom_whitelist: Vec<String>,
    channel_url: String,
}

impl BlacklistMatcher {
    pub fn new(
        blacklist: HashSet<String>,
        custom_blacklist: Vec<String>,
        custom_whitelist: Vec<String>,
        channel_url: impl Into<String>,
    ) -> Self {
        Self {
            blacklist,
            custom_blacklist,
            custom_whitelist,
            channel_url: channel_url.into(),
        }
    }

    pub fn count(&self) -> usize {
        self.blacklist.len()
    }

    /// `None` means "no verdict from this matcher" (caller falls through to
    /// `Direct`); `Some(Channel)` means the suffix/custom blacklist matched.
    /// A custom-whitelist hit returns `Some(Direct)` so it short-circuits
    /// even when a broader blacklist suffix would otherwise also match.
    pub fn find(&self, host: &str) -> Option<ForwardDecision> {
        if self.custom_whitelist.iter().any(|pat| glob_match(pat, host)) {
            return Some(ForwardDecision::Direct);
        }

        if self.custom_blacklist.iter().any(|pat| glob_match(pat, host)) {
            return Some(self.channel());
        }

        let labels: Vec<&str> = host.split('.').collect();
        for i in (0..labels.len()).rev() {
            let suffix = labels[i..].join(".");
            if self.blacklist.contains(&suffix) {
                return Some(self.channel());
            }
        }

        None
    }

    fn channel(&self) -> ForwardDecision {
        ForwardDecision::Channel {
            url: self.channel_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(blacklist: &[&str], custom_black: &[&str], custom_white: &[&str]) -> BlacklistMatcher {
        BlacklistMatcher::new(
            blacklist.iter().map(|s| s.to_string()).collect(),
            custom_black.iter().map(|s| s.to_string()).collect(),
            custom_white.iter().map(|s| s.to_string()).collect(),
            "socks5://127.0.0.1:9000",
        )
    }

    #[test]
    fn test_suffix_match_blacklist() {
        let m = make(&["c.d"], &[], &[]);
        assert_eq!(
            m.find("a.b.c.d"),
            Some(ForwardDecision::Channel {
                url: "socks5://127.0.0.1:9000".to_string()
            })
        );
    }

    #[test]
    fn test_suffix_no_match_for_unrelated_tld() {
        let m = make(&["c.d"], &[], &[]);
        assert_eq!(m.find("x.cd"), None);
    }

    #[test]
    fn test_whitelist_wins_over_blacklist() {
        let m = make(&["censored.test"], &[], &["*.censored.test"]);
        assert_eq!(m.find("www.censored.test"), Some(ForwardDecision::Direct));
    }

    #[test]
    fn test_custom_blacklist_glob() {
        let m = make(&[], &["*.censored.test"], &[]);
        assert!(matches!(m.find("www.censored.test"), Some(ForwardDecision::Channel { .. })));
    }

    #[test]
    fn test_no_match_returns_none() {
        let m = make(&["censored.test"], &[], &[]);
        assert_eq!(m.find("example.com"), None);
    }

    #[test]
    fn test_empty_blacklist() {
        let m = make(&[], &[], &[]);
        assert_eq!(m.count(), 0);
        assert_eq!(m.find("anything.test"), None);
    }
}
