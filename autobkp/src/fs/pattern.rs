//! Include/exclude path patterns.
//!
//! A pattern without `/` is matched against every component name of a
//! relative path, so `__pycache__` or `*.tmp` hit at any depth. A pattern
//! containing `/` is matched against the whole `/`-joined relative path,
//! where `*` stays inside one component and `**` spans any number of them.
//! Pattern syntax is that of [`glob::Pattern`], character classes included.

use glob::{MatchOptions, Pattern, PatternError};
use std::path::Path;

const PATH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    /// Matched against each component name
    names: Vec<Pattern>,
    /// Matched against the full relative path
    paths: Vec<Pattern>,
}

impl PatternSet {
    pub fn new(patterns: &[String]) -> Result<Self, PatternError> {
        let mut set = PatternSet::default();
        for raw in patterns {
            let pattern = raw.trim().trim_matches('/');
            if pattern.is_empty() {
                continue;
            }
            if pattern.contains('/') {
                set.paths.push(Pattern::new(pattern)?);
            } else {
                set.names.push(Pattern::new(pattern)?);
            }
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty()
    }

    /// True if any pattern matches `relative`.
    pub fn matches(&self, relative: &Path) -> bool {
        let components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if components.is_empty() {
            return false;
        }

        if self
            .names
            .iter()
            .any(|p| components.iter().any(|name| p.matches(name)))
        {
            return true;
        }

        let joined = components.join("/");
        self.paths.iter().any(|p| p.matches_with(&joined, PATH_OPTIONS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> PatternSet {
        PatternSet::new(&patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_wildcards() {
        let patterns = set(&["*.tmp", "data?.csv"]);
        assert!(patterns.matches(Path::new("build.tmp")));
        assert!(patterns.matches(Path::new("data1.csv")));
        assert!(!patterns.matches(Path::new("build.tmp.txt")));
        assert!(!patterns.matches(Path::new("data10.csv")));
    }

    #[test]
    fn test_character_classes() {
        let patterns = set(&["[ab].txt", "log[0-9].txt", "[!.]*.bak"]);
        assert!(patterns.matches(Path::new("a.txt")));
        assert!(patterns.matches(Path::new("nested/b.txt")));
        assert!(patterns.matches(Path::new("log3.txt")));
        assert!(patterns.matches(Path::new("notes.bak")));
        assert!(!patterns.matches(Path::new("c.txt")));
        assert!(!patterns.matches(Path::new("logx.txt")));
    }

    #[test]
    fn test_name_patterns_match_any_component() {
        let excludes = set(&["__pycache__", "*.pyc"]);
        assert!(excludes.matches(Path::new("pkg/__pycache__/mod.cpython.pyc")));
        assert!(excludes.matches(Path::new("__pycache__")));
        assert!(excludes.matches(Path::new("a/b/c.pyc")));
        assert!(!excludes.matches(Path::new("pkg/mod.py")));
    }

    #[test]
    fn test_path_patterns() {
        let patterns = set(&["**/cache/*", "docs/*.md"]);
        assert!(patterns.matches(Path::new("a/b/cache/x.bin")));
        assert!(patterns.matches(Path::new("cache/x.bin")));
        assert!(patterns.matches(Path::new("docs/readme.md")));
        assert!(!patterns.matches(Path::new("docs/api/readme.md")));
        assert!(!patterns.matches(Path::new("a/cache")));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(PatternSet::new(&["[unclosed".to_string()]).is_err());
    }

    #[test]
    fn test_empty_set() {
        let patterns = set(&["", "  "]);
        assert!(patterns.is_empty());
        assert!(!patterns.matches(Path::new("anything")));
    }
}
