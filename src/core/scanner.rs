//! Builds `FileNode` trees from the filesystem.
//!
//! The walk keeps an explicit frontier of pending directories and processes it
//! level by level. Directory reads of one level run in parallel on a bounded
//! rayon pool; their results are folded into an arena afterwards, and the
//! owned tree is assembled only once the walk has finished.

use super::ignore::{is_ignored, parse_rules, IgnoreRule};
use super::{CoreError, FileNode, ScanOutcome, ScanWarning, WarningKind};
use crate::config::provider::RuleSource;
use crate::utils::file_detection::{content_type_for, ContentType};
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const GITIGNORE_FILE: &str = ".gitignore";
pub const DEFAULT_MAX_DEPTH: usize = 64;

pub struct TreeBuilder {
    rules: Arc<dyn RuleSource>,
    max_depth: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl TreeBuilder {
    pub fn new(rules: Arc<dyn RuleSource>) -> Self {
        Self {
            rules,
            max_depth: DEFAULT_MAX_DEPTH,
            pool: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Caps the number of concurrent directory reads. `0` keeps rayon's global pool.
    pub fn with_workers(mut self, workers: usize) -> Self {
        if workers == 0 {
            self.pool = None;
            return self;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("tree-scan-{i}"))
            .build()
        {
            Ok(pool) => self.pool = Some(Arc::new(pool)),
            Err(e) => tracing::warn!("Could not build scan pool, using global pool: {}", e),
        }
        self
    }

    /// Builds the tree for `root`.
    ///
    /// The result holds a single root node (`rel_path == "."`) whose children
    /// are the directory's contents.
    pub fn build(
        &self,
        root: &Path,
        use_gitignore: bool,
        use_custom_ignore: bool,
    ) -> Result<ScanOutcome, CoreError> {
        self.build_with_cancel(root, use_gitignore, use_custom_ignore, &AtomicBool::new(false))
    }

    /// Like [`TreeBuilder::build`], but stops with [`CoreError::Cancelled`]
    /// once `cancel` is set. The flag is checked before every directory read.
    pub fn build_with_cancel(
        &self,
        root: &Path,
        use_gitignore: bool,
        use_custom_ignore: bool,
        cancel: &AtomicBool,
    ) -> Result<ScanOutcome, CoreError> {
        validate_dir(root)?;
        let rules = self.load_rules(root, use_gitignore, use_custom_ignore);

        tracing::info!("📂 Building tree for {}", root.display());
        let (node, warnings) = self.walk(root, None, &rules, cancel)?;
        tracing::info!(
            "✅ Tree for {} built: {} entries, {} warnings",
            root.display(),
            super::tree::walk(std::slice::from_ref(&node)).count(),
            warnings.len()
        );

        Ok(ScanOutcome {
            nodes: vec![node],
            warnings,
        })
    }

    /// Rebuilds only `root/rel_dir`, keeping every `rel_path` relative to `root`
    /// and applying the root's rules. Used for scoped rescans.
    pub fn build_subtree(
        &self,
        root: &Path,
        rel_dir: &str,
        use_gitignore: bool,
        use_custom_ignore: bool,
        cancel: &AtomicBool,
    ) -> Result<(FileNode, Vec<ScanWarning>), CoreError> {
        validate_dir(root)?;
        if rel_dir.is_empty() || rel_dir == "." {
            let mut outcome =
                self.build_with_cancel(root, use_gitignore, use_custom_ignore, cancel)?;
            let node = outcome
                .nodes
                .pop()
                .ok_or_else(|| CoreError::InvalidRoot(root.to_path_buf()))?;
            return Ok((node, outcome.warnings));
        }
        validate_dir(&root.join(rel_dir))?;
        let rules = self.load_rules(root, use_gitignore, use_custom_ignore);
        tracing::debug!("Rebuilding subtree {} of {}", rel_dir, root.display());
        self.walk(root, Some(rel_dir), &rules, cancel)
    }

    fn load_rules(&self, root: &Path, use_gitignore: bool, use_custom_ignore: bool) -> ActiveRules {
        let gitignore = use_gitignore.then(|| {
            let path = root.join(GITIGNORE_FILE);
            match fs::read_to_string(&path) {
                Ok(text) => parse_rules(&text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => {
                    tracing::warn!("Could not read {}: {}", path.display(), e);
                    Vec::new()
                }
            }
        });
        let custom = use_custom_ignore.then(|| parse_rules(&self.rules.custom_ignore_rules()));
        ActiveRules { gitignore, custom }
    }

    fn walk(
        &self,
        root: &Path,
        start: Option<&str>,
        rules: &ActiveRules,
        cancel: &AtomicBool,
    ) -> Result<(FileNode, Vec<ScanWarning>), CoreError> {
        let start_abs = match start {
            Some(rel) => root.join(rel),
            None => root.to_path_buf(),
        };
        let start_rel = start.unwrap_or(".").to_string();
        let start_rel_key = start_rel.clone();
        let canonical = fs::canonicalize(&start_abs).map_err(|e| CoreError::Io(e, start_abs.clone()))?;

        let (is_gitignored, is_custom_ignored) = match start {
            Some(rel) => rules.flags(rel),
            None => (false, false),
        };
        let start_name = start_abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| start_abs.display().to_string());

        let mut arena = vec![Slot::new(FileNode {
            name: start_name,
            path: start_abs.clone(),
            rel_path: start_rel,
            is_dir: true,
            size: 0,
            content_type: ContentType::Unknown,
            is_gitignored,
            is_custom_ignored,
            children: Vec::new(),
        })];
        let mut warnings = Vec::new();
        let depth_base = start.map_or(0, |rel| rel.split('/').count());
        // A subtree still has to recognise links back into the directories above it.
        let mut lineage: Vec<PathBuf> = match start {
            Some(_) => {
                let canonical_root =
                    fs::canonicalize(root).map_err(|e| CoreError::Io(e, root.to_path_buf()))?;
                canonical
                    .ancestors()
                    .skip(1)
                    .take_while(|a| a.starts_with(&canonical_root))
                    .map(Path::to_path_buf)
                    .collect()
            }
            None => Vec::new(),
        };
        lineage.reverse();
        lineage.push(canonical);

        let mut frontier = vec![PendingDir {
            index: 0,
            path: start_abs,
            rel_path: start_rel_key,
            depth: depth_base,
            lineage,
        }];

        while !frontier.is_empty() {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("🛑 Tree build cancelled");
                return Err(CoreError::Cancelled);
            }

            let listings = self.read_level(&frontier, cancel);

            if cancel.load(Ordering::Relaxed) {
                tracing::info!("🛑 Tree build cancelled");
                return Err(CoreError::Cancelled);
            }

            let mut next = Vec::new();
            for (dir, listing) in frontier.into_iter().zip(listings) {
                let parent_rel = dir.rel_path.as_str();
                let entries = match listing {
                    Ok(entries) => entries,
                    Err(e) => {
                        push_warning(&mut warnings, WarningKind::Unreadable, parent_rel, e.to_string());
                        continue;
                    }
                };

                for entry in entries {
                    let rel_path = if parent_rel == "." {
                        entry.name.clone()
                    } else {
                        format!("{parent_rel}/{}", entry.name)
                    };
                    let (is_gitignored, is_custom_ignored) = rules.flags(&rel_path);

                    let (is_dir, size) = match &entry.kind {
                        EntryKind::File { size } | EntryKind::SymlinkFile { size } => (false, *size),
                        EntryKind::Dir | EntryKind::SymlinkDir => (true, 0),
                        EntryKind::BrokenSymlink(reason) => {
                            push_warning(&mut warnings, WarningKind::BrokenSymlink, &rel_path, reason.clone());
                            (false, 0)
                        }
                    };
                    let content_type = if is_dir {
                        ContentType::Unknown
                    } else {
                        content_type_for(&entry.path)
                    };

                    let index = arena.len();
                    arena.push(Slot::new(FileNode {
                        name: entry.name.clone(),
                        path: entry.path.clone(),
                        rel_path: rel_path.clone(),
                        is_dir,
                        size,
                        content_type,
                        is_gitignored,
                        is_custom_ignored,
                        children: Vec::new(),
                    }));
                    arena[dir.index].children.push(index);

                    if !is_dir {
                        continue;
                    }
                    if dir.depth + 1 > self.max_depth {
                        push_warning(
                            &mut warnings,
                            WarningKind::MaxDepth,
                            &rel_path,
                            format!("depth limit of {} reached", self.max_depth),
                        );
                        continue;
                    }

                    let canonical = match entry.kind {
                        EntryKind::SymlinkDir => match fs::canonicalize(&entry.path) {
                            Ok(target) => target,
                            Err(e) => {
                                push_warning(&mut warnings, WarningKind::BrokenSymlink, &rel_path, e.to_string());
                                continue;
                            }
                        },
                        _ => match dir.lineage.last() {
                            Some(parent) => parent.join(&entry.name),
                            None => entry.path.clone(),
                        },
                    };
                    if dir.lineage.contains(&canonical) {
                        push_warning(
                            &mut warnings,
                            WarningKind::SymlinkCycle,
                            &rel_path,
                            format!("links back to {}", canonical.display()),
                        );
                        continue;
                    }

                    let mut lineage = dir.lineage.clone();
                    lineage.push(canonical);
                    next.push(PendingDir {
                        index,
                        path: entry.path,
                        rel_path,
                        depth: dir.depth + 1,
                        lineage,
                    });
                }
            }
            frontier = next;
        }

        let node = assemble(arena).ok_or_else(|| CoreError::InvalidRoot(root.to_path_buf()))?;
        Ok((node, warnings))
    }

    fn read_level(&self, frontier: &[PendingDir], cancel: &AtomicBool) -> Vec<io::Result<Vec<RawEntry>>> {
        let read = || -> Vec<io::Result<Vec<RawEntry>>> {
            frontier
                .par_iter()
                .map(|dir| {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "scan cancelled"));
                    }
                    read_entries(&dir.path)
                })
                .collect()
        };
        match &self.pool {
            Some(pool) => pool.install(read),
            None => read(),
        }
    }
}

struct ActiveRules {
    gitignore: Option<Vec<IgnoreRule>>,
    custom: Option<Vec<IgnoreRule>>,
}

impl ActiveRules {
    fn flags(&self, rel_path: &str) -> (bool, bool) {
        let gitignored = self
            .gitignore
            .as_deref()
            .is_some_and(|rules| is_ignored(rel_path, rules));
        let custom = self
            .custom
            .as_deref()
            .is_some_and(|rules| is_ignored(rel_path, rules));
        (gitignored, custom)
    }
}

struct PendingDir {
    index: usize,
    path: PathBuf,
    rel_path: String,
    depth: usize,
    /// Canonical paths of this directory and all of its ancestors.
    lineage: Vec<PathBuf>,
}

struct Slot {
    node: Option<FileNode>,
    children: Vec<usize>,
}

impl Slot {
    fn new(node: FileNode) -> Self {
        Self {
            node: Some(node),
            children: Vec::new(),
        }
    }
}

struct RawEntry {
    name: String,
    path: PathBuf,
    kind: EntryKind,
}

enum EntryKind {
    File { size: u64 },
    Dir,
    SymlinkFile { size: u64 },
    SymlinkDir,
    BrokenSymlink(String),
}

fn validate_dir(path: &Path) -> Result<(), CoreError> {
    match fs::metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        _ => Err(CoreError::InvalidRoot(path.to_path_buf())),
    }
}

/// Lists one directory, sorted by name. Only metadata is touched.
fn read_entries(dir: &Path) -> io::Result<Vec<RawEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                tracing::warn!("Could not stat {}: {}", path.display(), e);
                continue;
            }
        };

        let kind = if file_type.is_symlink() {
            match fs::metadata(&path) {
                Ok(md) if md.is_dir() => EntryKind::SymlinkDir,
                Ok(md) => EntryKind::SymlinkFile { size: md.len() },
                Err(e) => EntryKind::BrokenSymlink(e.to_string()),
            }
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else {
            let size = entry.metadata().map(|md| md.len()).unwrap_or(0);
            EntryKind::File { size }
        };

        entries.push(RawEntry { name, path, kind });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn push_warning(warnings: &mut Vec<ScanWarning>, kind: WarningKind, rel_path: &str, message: String) {
    tracing::warn!("⚠️ {:?} at '{}': {}", kind, rel_path, message);
    warnings.push(ScanWarning {
        kind,
        rel_path: rel_path.to_string(),
        message,
    });
}

/// Turns the arena into an owned tree. Children always sit at higher indices
/// than their parent, so a single reverse pass suffices.
fn assemble(mut arena: Vec<Slot>) -> Option<FileNode> {
    let mut built: Vec<Option<FileNode>> = (0..arena.len()).map(|_| None).collect();
    for i in (0..arena.len()).rev() {
        let child_ids = std::mem::take(&mut arena[i].children);
        if let Some(mut node) = arena[i].node.take() {
            node.children = child_ids.into_iter().filter_map(|c| built[c].take()).collect();
            built[i] = Some(node);
        }
    }
    built.into_iter().next().flatten()
}
