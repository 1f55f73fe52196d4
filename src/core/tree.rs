//! Read-side helpers over `FileNode` trees: traversal, lookup, copy-on-write
//! subtree replacement, derived ignore state, and ASCII rendering.

use super::FileNode;
use std::cmp::Ordering;

/// Pre-order iterator over a forest of nodes.
pub struct Walk<'a> {
    stack: Vec<&'a FileNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a FileNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

pub fn walk(nodes: &[FileNode]) -> Walk<'_> {
    Walk {
        stack: nodes.iter().rev().collect(),
    }
}

/// Number of non-directory nodes in the forest.
pub fn count_files(nodes: &[FileNode]) -> usize {
    walk(nodes).filter(|n| !n.is_dir).count()
}

pub fn find<'a>(nodes: &'a [FileNode], rel_path: &str) -> Option<&'a FileNode> {
    for node in nodes {
        if node.rel_path == rel_path {
            return Some(node);
        }
        if node.is_dir && is_ancestor(&node.rel_path, rel_path) {
            return find(&node.children, rel_path);
        }
    }
    None
}

pub fn find_mut<'a>(nodes: &'a mut [FileNode], rel_path: &str) -> Option<&'a mut FileNode> {
    for node in nodes.iter_mut() {
        if node.rel_path == rel_path {
            return Some(node);
        }
        if node.is_dir && is_ancestor(&node.rel_path, rel_path) {
            return find_mut(&mut node.children, rel_path);
        }
    }
    None
}

/// Returns a copy of `nodes` with the node at `replacement.rel_path` swapped
/// for `replacement`, or `None` if no such node exists. The input is untouched.
pub fn replace_subtree(nodes: &[FileNode], replacement: FileNode) -> Option<Vec<FileNode>> {
    let mut updated = nodes.to_vec();
    let slot = find_mut(&mut updated, &replacement.rel_path)?;
    *slot = replacement;
    Some(updated)
}

/// `true` if `ancestor` is a strict ancestor directory of `rel_path`.
pub fn is_ancestor(ancestor: &str, rel_path: &str) -> bool {
    if ancestor == "." {
        return rel_path != ".";
    }
    rel_path
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Derived ignore state of a subtree, used for tri-state selection display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreState {
    /// Nothing in the subtree is ignored.
    Included,
    /// Some, but not all, of the subtree is ignored.
    Partial,
    /// The node itself, or every entry below it, is ignored.
    Ignored,
}

pub fn ignore_state(node: &FileNode) -> IgnoreState {
    if node.is_ignored() {
        return IgnoreState::Ignored;
    }
    if !node.is_dir || node.children.is_empty() {
        return IgnoreState::Included;
    }

    let mut any_ignored = false;
    let mut all_ignored = true;
    for child in &node.children {
        match ignore_state(child) {
            IgnoreState::Included => all_ignored = false,
            IgnoreState::Partial => {
                any_ignored = true;
                all_ignored = false;
            }
            IgnoreState::Ignored => any_ignored = true,
        }
    }

    match (any_ignored, all_ignored) {
        (_, true) => IgnoreState::Ignored,
        (true, false) => IgnoreState::Partial,
        (false, false) => IgnoreState::Included,
    }
}

/// Whether the whole subtree vanishes once ignored entries are hidden.
pub fn subtree_fully_ignored(node: &FileNode) -> bool {
    ignore_state(node) == IgnoreState::Ignored
}

/// Folders first, then case-insensitive by name.
pub fn display_order(a: &FileNode, b: &FileNode) -> Ordering {
    match (a.is_dir, b.is_dir) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a
            .name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name)),
    }
}

/// Recursively sorts children into presentation order.
pub fn sort_for_display(nodes: &mut [FileNode]) {
    nodes.sort_by(display_order);
    for node in nodes.iter_mut() {
        sort_for_display(&mut node.children);
    }
}

/// Renders a directory tree as text for context exports.
///
/// Ignored entries are left out unless `include_ignored` is set.
pub fn render_ascii(root: &FileNode, include_ignored: bool) -> String {
    let mut result = format!("{}/\n", root.name);
    render_children(&root.children, &mut result, "", include_ignored);
    result
}

fn render_children(children: &[FileNode], result: &mut String, prefix: &str, include_ignored: bool) {
    let mut visible: Vec<&FileNode> = children
        .iter()
        .filter(|c| include_ignored || !c.is_ignored())
        .collect();
    visible.sort_by(|a, b| display_order(a, b));

    for (i, node) in visible.iter().enumerate() {
        let is_last = i == visible.len() - 1;
        let connector = if is_last { "└── " } else { "├── " };
        let icon = if node.is_dir { "📁 " } else { "📄 " };

        result.push_str(&format!("{prefix}{connector}{icon}{}\n", node.name));

        if !node.children.is_empty() {
            let new_prefix = if is_last {
                format!("{prefix}    ")
            } else {
                format!("{prefix}│   ")
            };
            render_children(&node.children, result, &new_prefix, include_ignored);
        }
    }
}
