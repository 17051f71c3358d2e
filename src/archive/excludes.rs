//! Compiled glob exclude patterns.
//!
//! Patterns match against the archive-relative path in forward-slash
//! form. `*` stays within a path segment; `**` crosses segments;
//! character classes and `{a,b}` alternation work as usual. Two
//! conveniences mirror common ignore-file behaviour: a pattern floats to
//! any depth (`node_modules/**` works no matter where the tree sits in
//! the archive), and a pattern ending in `/**` also matches the
//! directory itself so the walker can prune the whole subtree.

use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

pub struct ExcludeSet {
    set: GlobSet,
    pattern_count: usize,
}

impl ExcludeSet {
    /// Compile the pattern list. Invalid patterns fail here, before any
    /// filesystem work starts.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            add_floating(&mut builder, pattern)?;
            // A subtree pattern must also exclude the directory itself,
            // otherwise the walker could not prune before descending.
            if let Some(dir) = pattern.strip_suffix("/**") {
                add_floating(&mut builder, dir)?;
            }
        }
        let set = builder.build().context("failed to build exclude set")?;

        Ok(Self {
            set,
            pattern_count: patterns.len(),
        })
    }

    /// Whether the archive-relative path is excluded.
    pub fn is_match(&self, path: &str) -> bool {
        self.pattern_count > 0 && self.set.is_match(path)
    }

    pub fn is_empty(&self) -> bool {
        self.pattern_count == 0
    }
}

/// Add the pattern both as written and anchored at any depth.
fn add_floating(builder: &mut GlobSetBuilder, pattern: &str) -> Result<()> {
    builder.add(compile(pattern)?);
    if !pattern.starts_with("**/") {
        builder.add(compile(&format!("**/{}", pattern))?);
    }
    Ok(())
}

fn compile(pattern: &str) -> Result<Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("failed to compile exclude pattern {}", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[&str]) -> ExcludeSet {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        ExcludeSet::new(&patterns).unwrap()
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let excludes = set(&[]);
        assert!(excludes.is_empty());
        assert!(!excludes.is_match("anything"));
    }

    #[test]
    fn test_extension_pattern_matches_any_depth() {
        let excludes = set(&["*.log"]);
        assert!(excludes.is_match("app.log"));
        assert!(excludes.is_match("root/sub/app.log"));
        assert!(!excludes.is_match("app.log.txt"));
    }

    #[test]
    fn test_star_stays_within_segment() {
        let excludes = set(&["root/*.log"]);
        assert!(excludes.is_match("root/app.log"));
        assert!(!excludes.is_match("root/sub/app.log"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let excludes = set(&["root/**/*.tmp"]);
        assert!(excludes.is_match("root/a/b/c/x.tmp"));
        assert!(!excludes.is_match("other/x.tmp"));
    }

    #[test]
    fn test_subtree_pattern_matches_directory_itself() {
        let excludes = set(&["node_modules/**"]);
        assert!(excludes.is_match("node_modules"));
        assert!(excludes.is_match("node_modules/pkg/index.js"));
        assert!(!excludes.is_match("src/index.js"));
    }

    #[test]
    fn test_patterns_float_to_any_depth() {
        let excludes = set(&["node_modules/**", ".git/**"]);
        assert!(excludes.is_match("backups/proj/node_modules"));
        assert!(excludes.is_match("backups/proj/node_modules/pkg/index.js"));
        assert!(excludes.is_match("home/user/repo/.git/config"));
        assert!(!excludes.is_match("backups/proj/src/main.js"));
    }

    #[test]
    fn test_character_class_and_alternation() {
        let excludes = set(&["file[0-9].txt", "{cache,tmp}/**"]);
        assert!(excludes.is_match("file3.txt"));
        assert!(!excludes.is_match("filex.txt"));
        assert!(excludes.is_match("cache/a"));
        assert!(excludes.is_match("tmp/b"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let excludes = set(&["*.log"]);
        assert!(!excludes.is_match("app.LOG"));
    }

    #[test]
    fn test_invalid_pattern_fails_at_construction() {
        let patterns = vec!["[".to_string()];
        assert!(ExcludeSet::new(&patterns).is_err());
    }
}
