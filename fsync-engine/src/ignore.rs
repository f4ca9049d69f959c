//! Ignore rules for the snapshotter: an ordered glob list, first match wins.

use glob::Pattern;

use crate::errors::{Result, SyncError};

/// Ordered set of glob patterns matched against relative paths.
///
/// Patterns are tried in order and the first match decides; a pattern without
/// a slash also matches any path component, so `node_modules` ignores the
/// directory at any depth.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut compiled = Vec::new();
        for raw in patterns {
            let raw = raw.as_ref();
            let pattern = Pattern::new(raw).map_err(|e| SyncError::InvalidPattern {
                pattern: raw.to_string(),
                message: e.to_string(),
            })?;
            compiled.push(pattern);
        }
        Ok(Self { patterns: compiled })
    }

    /// Empty set that ignores nothing.
    pub fn none() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Whether the relative path is ignored.
    pub fn matches(&self, rel_path: &str) -> bool {
        for pattern in &self.patterns {
            if pattern.matches(rel_path) {
                return true;
            }
            // Bare patterns apply to individual components.
            if !pattern.as_str().contains('/')
                && rel_path.split('/').any(|part| pattern.matches(part))
            {
                return true;
            }
        }
        false
    }
}

impl Default for IgnoreSet {
    /// The stock ignore list; callers may replace it entirely.
    fn default() -> Self {
        Self::new(["node_modules", ".git", ".DS_Store", "*.tmp", "Thumbs.db"])
            .unwrap_or_else(|_| Self::none())
    }
}
