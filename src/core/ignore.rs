//! Ignore-rule parsing and path matching.
//!
//! Rules use a loose, unanchored subset of `.gitignore` syntax. A bare name
//! such as `go.mod` ignores a file with that name anywhere in the tree, and
//! there is no `!negation` support. Tree listings and the ignore preview both
//! go through [`match_path`], so the two never disagree about a path.

use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

/// One pattern line from a `.gitignore` file or the custom-ignore settings text.
#[derive(Debug, Clone)]
pub struct IgnoreRule {
    /// Raw text as authored (trimmed).
    pub original: String,
    /// `original` without its trailing `/`.
    pub pattern: String,
    /// `true` if `original` ended with `/`.
    pub is_dir: bool,
    glob: Option<GlobMatcher>,
}

impl IgnoreRule {
    /// Builds a rule from a single, already trimmed line.
    pub fn new(line: &str) -> Self {
        let is_dir = line.ends_with('/');
        let pattern = line.strip_suffix('/').unwrap_or(line).to_string();
        let glob = if pattern.contains('*') {
            compile_glob(&pattern)
        } else {
            None
        };
        Self {
            original: line.to_string(),
            pattern,
            is_dir,
            glob,
        }
    }

    /// Checks a normalized, `/`-separated relative path against this rule.
    ///
    /// Strategies are tried in order: exact basename, directory rule,
    /// wildcard (basename, then full path), and finally path prefix or
    /// containment of the pattern as a whole segment.
    pub fn matches(&self, path: &str) -> bool {
        let pattern = self.pattern.as_str();
        let file_name = base_name(path);

        if file_name == pattern {
            return true;
        }

        let prefix = format!("{pattern}/");
        let infix = format!("/{pattern}/");

        if self.is_dir
            && (path == pattern
                || path.starts_with(&prefix)
                || path.contains(&infix)
                || path.strip_suffix(pattern).is_some_and(|rest| rest.ends_with('/')))
        {
            return true;
        }

        if let Some(glob) = &self.glob {
            if glob.is_match(file_name) || glob.is_match(path) {
                return true;
            }
        }

        path.starts_with(&prefix) || path.contains(&infix)
    }
}

/// Parses rule text into an ordered list of rules.
///
/// Blank lines and `#` comments are dropped here, so they never reach matching.
/// Both `\n` and `\r\n` line endings are accepted.
pub fn parse_rules(text: &str) -> Vec<IgnoreRule> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(IgnoreRule::new)
        .collect()
}

/// Returns the original text of the first rule matching `path`, if any.
pub fn match_path<'r>(path: &str, rules: &'r [IgnoreRule]) -> Option<&'r str> {
    rules
        .iter()
        .find(|rule| rule.matches(path))
        .map(|rule| rule.original.as_str())
}

/// Convenience wrapper over [`match_path`].
pub fn is_ignored(path: &str, rules: &[IgnoreRule]) -> bool {
    match_path(path, rules).is_some()
}

/// Converts a relative path into the `/`-separated form the matcher expects.
pub fn normalize_rel_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `*` and `?` never cross a `/`. A pattern that fails to compile simply
/// never matches as a wildcard; the literal strategies still apply.
fn compile_glob(pattern: &str) -> Option<GlobMatcher> {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            tracing::debug!("Ignoring malformed wildcard in rule '{}': {}", pattern, e);
            None
        }
    }
}
