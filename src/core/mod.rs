pub mod error;
pub mod ignore;
pub mod preview;
pub mod scanner;
pub mod tree;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::file_detection::ContentType;

/// One filesystem entry relative to a scan root.
///
/// The ignore flags describe the entry's own path only. Whether a whole
/// subtree disappears from a selection is derived on read, see
/// [`tree::subtree_fully_ignored`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: PathBuf,
    /// `/`-separated path relative to the scan root; `"."` for the root itself.
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub content_type: ContentType,
    pub is_gitignored: bool,
    pub is_custom_ignored: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    pub fn is_ignored(&self) -> bool {
        self.is_gitignored || self.is_custom_ignored
    }
}

/// What went wrong with a single entry during an otherwise successful scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningKind {
    /// A directory could not be listed (permissions, vanished mid-scan).
    Unreadable,
    /// A symlink pointing back into an ancestor; its subtree was skipped.
    SymlinkCycle,
    /// A symlink whose target could not be resolved.
    BrokenSymlink,
    /// The depth guard stopped the walk at this directory.
    MaxDepth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanWarning {
    pub kind: WarningKind,
    pub rel_path: String,
    pub message: String,
}

/// The ignore sources a tree is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanOptions {
    pub use_gitignore: bool,
    pub use_custom_ignore: bool,
}

impl ScanOptions {
    pub fn new(use_gitignore: bool, use_custom_ignore: bool) -> Self {
        Self {
            use_gitignore,
            use_custom_ignore,
        }
    }

    /// Switches off the sources a caller opted out of; never switches one on.
    pub fn with_overrides(self, no_gitignore: bool, no_custom_ignore: bool) -> Self {
        Self::new(
            self.use_gitignore && !no_gitignore,
            self.use_custom_ignore && !no_custom_ignore,
        )
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::new(true, true)
    }
}

/// The result of a tree build: the tree plus any non-fatal problems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub nodes: Vec<FileNode>,
    pub warnings: Vec<ScanWarning>,
}

pub use error::CoreError;
pub use ignore::{is_ignored, match_path, normalize_rel_path, parse_rules, IgnoreRule};
pub use preview::{test_ignore_rules, DirCount, IgnorePreview};
pub use scanner::TreeBuilder;
