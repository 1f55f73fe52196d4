//! Previews which files a block of ignore rules would hide.
//!
//! This is a read-only application of the matcher over an existing tree, so
//! it reports exactly what a scan with the same rules would flag.

use super::ignore::{match_path, parse_rules};
use super::FileNode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_SAMPLE_FILES: usize = 100;
pub const MAX_TOP_DIRS: usize = 10;

const ROOT_GROUP: &str = "(root)";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnorePreview {
    pub total_files: usize,
    /// Top-level directory (or `(root)`) -> matched file count.
    pub by_directory: HashMap<String, usize>,
    /// Original rule text -> matched file count.
    pub by_rule: HashMap<String, usize>,
    pub sample_files: Vec<String>,
    pub top_dirs: Vec<DirCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirCount {
    pub dir: String,
    pub count: usize,
}

/// Counts the files in `nodes` that `rules_text` would ignore.
///
/// Only files are counted; a file is attributed to the first rule matching it.
pub fn test_ignore_rules(nodes: &[FileNode], rules_text: &str) -> IgnorePreview {
    let rules = parse_rules(rules_text);
    let mut preview = IgnorePreview::default();
    if rules.is_empty() {
        return preview;
    }

    for node in super::tree::walk(nodes).filter(|n| !n.is_dir) {
        let path = node.rel_path.replace('\\', "/");
        let Some(rule) = match_path(&path, &rules) else {
            continue;
        };

        preview.total_files += 1;
        *preview.by_directory.entry(top_dir(&path).to_string()).or_default() += 1;
        *preview.by_rule.entry(rule.to_string()).or_default() += 1;
        if preview.sample_files.len() < MAX_SAMPLE_FILES {
            preview.sample_files.push(node.rel_path.clone());
        }
    }

    preview.top_dirs = top_dirs(&preview.by_directory, MAX_TOP_DIRS);
    preview
}

fn top_dir(path: &str) -> &str {
    match path.split_once('/') {
        Some((first, _)) => first,
        None => ROOT_GROUP,
    }
}

/// Highest counts first; equal counts ordered by name so the output is stable.
fn top_dirs(by_dir: &HashMap<String, usize>, limit: usize) -> Vec<DirCount> {
    let mut dirs: Vec<DirCount> = by_dir
        .iter()
        .map(|(dir, count)| DirCount {
            dir: dir.clone(),
            count: *count,
        })
        .collect();
    dirs.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.dir.cmp(&b.dir)));
    dirs.truncate(limit);
    dirs
}
