//! Exclude/include pattern matching over relative paths.
//!
//! Patterns come in two flavours: a leading `$` marks the remainder as a raw
//! regular expression; everything else is a simple glob where `*` matches any
//! run of characters. Matching is case-insensitive and anchored at the start
//! of the relative path only, so `tmp\*` filters a whole subtree.

use regex::{Regex, RegexBuilder};

use crate::VaultError;

/// A compiled, ordered list of path filter rules.
pub struct PathFilter {
    rules: Vec<Regex>,
}

impl PathFilter {
    /// Compiles the given patterns. Empty or all-empty input yields a filter
    /// that matches nothing.
    pub fn new<I, S>(patterns: I) -> Result<Self, VaultError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if pattern.is_empty() {
                continue;
            }
            rules.push(compile_rule(pattern)?);
        }
        Ok(Self { rules })
    }

    /// True if any rule matches the relative path.
    pub fn is_match(&self, relative_path: &str) -> bool {
        let probe = normalize(relative_path);
        self.rules.iter().any(|r| r.is_match(&probe))
    }

    /// True if no rules were configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(pattern: &str) -> Result<Regex, VaultError> {
    let source = match pattern.strip_prefix('$') {
        Some(raw) => raw.to_string(),
        None => {
            let mut regex = String::from("^");
            for c in normalize(pattern).chars() {
                if c == '*' {
                    regex.push_str(".*");
                } else {
                    regex.push_str(&regex::escape(&c.to_string()));
                }
            }
            regex
        }
    };

    Ok(RegexBuilder::new(&source).case_insensitive(true).build()?)
}

/// Backslash-separated paths are normalised to forward slashes so the same
/// patterns work against paths produced on either platform.
fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_nothing() {
        let f = PathFilter::new(Vec::<String>::new()).unwrap();
        assert!(f.is_empty());
        assert!(!f.is_match("anything/at/all.txt"));
    }

    #[test]
    fn glob_star_matches_any_run() {
        let f = PathFilter::new(["*.tmp"]).unwrap();
        assert!(f.is_match("scratch.tmp"));
        assert!(f.is_match("deep/nested/scratch.tmp"));
        assert!(!f.is_match("scratch.txt"));
    }

    #[test]
    fn glob_is_anchored_at_start() {
        let f = PathFilter::new(["cache/*"]).unwrap();
        assert!(f.is_match("cache/a.bin"));
        assert!(!f.is_match("other/cache-file"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let f = PathFilter::new(["Thumbs.db"]).unwrap();
        assert!(f.is_match("thumbs.DB"));
    }

    #[test]
    fn dollar_prefix_is_raw_regex() {
        let f = PathFilter::new([r"$\.bak\d+$"]).unwrap();
        assert!(f.is_match("notes.bak12"));
        assert!(!f.is_match("notes.bak"));
    }

    #[test]
    fn glob_metacharacters_are_literal() {
        let f = PathFilter::new(["a+b(c)"]).unwrap();
        assert!(f.is_match("a+b(c)"));
        assert!(!f.is_match("aab(c)"));
    }

    #[test]
    fn backslash_separators_are_normalised() {
        let f = PathFilter::new([r"logs\*"]).unwrap();
        assert!(f.is_match("logs/2024/app.log"));
        assert!(f.is_match(r"logs\2024\app.log"));
    }

    #[test]
    fn bad_regex_is_an_error() {
        assert!(PathFilter::new(["$([unclosed"]).is_err());
    }
}
