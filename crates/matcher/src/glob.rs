//! A small shell-glob matcher (`*`, `?`) for the custom whitelist/blacklist
//! entries. Narrow enough in scope that no general-purpose glob crate is
//! warranted; see DESIGN.md.

pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    match_from(&p, 0, &t, 0)
}

fn match_from(p: &[char], pi: usize, t: &[char], ti: usize) -> bool {
    if pi == p.len() {
        return ti == t.len();
    }
    match p[pi] {
        '*' => {
            // Try consuming zero or more characters of `t`.
            for k in ti..=t.len() {
                if match_from(p, pi + 1, t, k) {
                    return true;
                }
            }
            false
        }
        '?' => ti < t.len() && match_from(p, pi + 1, t, ti + 1),
        c => ti < t.len() && t[ti] == c && match_from(p, pi + 1, t, ti + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_exact_match() {
        assert!(glob_match("example.com", "example.com"));
    }

    #[test]
    fn test_glob_star_prefix() {
        assert!(glob_match("*.example.com", "foo.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
    }

    #[test]
    fn test_glob_no_match() {
        assert!(!glob_match("foo.test", "bar.test"));
    }
}
