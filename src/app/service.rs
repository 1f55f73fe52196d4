//! The entry points a host (CLI, desktop shell, API layer) drives.
//!
//! `ProjectService` owns the builder, the snapshot cache and the watcher, and
//! runs the blocking tree walk off the async executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::cache::{canonical_root, ScanOptions, ScanSnapshot, SnapshotCache};
use super::proxy::EventProxy;
use super::watcher::TreeWatcher;
use crate::config::provider::RuleSource;
use crate::config::AppConfig;
use crate::core::{self, tree, CoreError, IgnorePreview, TreeBuilder};

pub struct ProjectService<P: EventProxy> {
    builder: Arc<TreeBuilder>,
    cache: Arc<SnapshotCache>,
    watcher: TreeWatcher<P>,
}

impl<P: EventProxy> ProjectService<P> {
    /// Wires the service from settings. `rules` supplies the custom-ignore
    /// text and its change stream; `proxy` receives watcher events.
    pub fn new(rules: Arc<dyn RuleSource>, config: &AppConfig, proxy: P) -> Self {
        let builder = Arc::new(
            TreeBuilder::new(Arc::clone(&rules))
                .with_max_depth(config.max_depth)
                .with_workers(config.scan_workers),
        );
        let cache = Arc::new(SnapshotCache::new());
        let watcher = TreeWatcher::new(Arc::clone(&builder), Arc::clone(&cache), rules, proxy)
            .with_debounce(Duration::from_millis(config.debounce_ms));
        Self {
            builder,
            cache,
            watcher,
        }
    }

    /// Returns the tree for `root`, building it unless a snapshot with the
    /// same options is already cached.
    ///
    /// Builds share a lock with the watcher, so a listing of the watched root
    /// and options waits for a running rescan and then serves its result.
    pub async fn list_files(
        &self,
        root: &Path,
        use_gitignore: bool,
        use_custom_ignore: bool,
    ) -> Result<Arc<ScanSnapshot>, CoreError> {
        let root = canonical_root(root)?;
        let options = ScanOptions::new(use_gitignore, use_custom_ignore);
        if let Some(snapshot) = self.cache.get(&root, options) {
            tracing::debug!("Serving cached tree for {}", root.display());
            return Ok(snapshot);
        }
        let _scan = self.cache.lock_scans(&root, options).await;
        if let Some(snapshot) = self.cache.get(&root, options) {
            tracing::debug!("Tree for {} was built while waiting", root.display());
            return Ok(snapshot);
        }
        self.rebuild(root, options).await
    }

    /// Rebuilds now. Goes through the watcher when one is running so rescans
    /// of the watched root stay serialized; otherwise rebuilds every cached
    /// root with the options it was built with.
    pub async fn refresh_and_rescan(&self) -> Result<(), CoreError> {
        if self.watcher.refresh_and_rescan() {
            return Ok(());
        }
        for (root, options) in self.cache.keys() {
            let _scan = self.cache.lock_scans(&root, options).await;
            if let Err(e) = self.rebuild(root.clone(), options).await {
                tracing::warn!("Could not refresh {}: {}", root.display(), e);
            }
        }
        Ok(())
    }

    /// Starts watching `root`, replacing any previous watch. Toggles flipped
    /// in settings later on are applied to the running watch.
    pub fn watch(&self, root: &Path, options: ScanOptions) -> Result<PathBuf, CoreError> {
        self.watcher.start(root, options)
    }

    pub fn unwatch(&self) {
        self.watcher.stop();
    }

    /// Stops watching `root` if it is the watched one and forgets its snapshot.
    pub fn close_project(&self, root: &Path) {
        let root = canonical_root(root).unwrap_or_else(|_| root.to_path_buf());
        if self.watcher.watched_root().as_deref() == Some(root.as_path()) {
            self.watcher.stop();
        }
        if self.cache.remove(&root) > 0 {
            tracing::info!("Closed project {}", root.display());
        }
    }

    /// The most recently built snapshot of `root`, whatever its options.
    pub fn snapshot(&self, root: &Path) -> Option<Arc<ScanSnapshot>> {
        let root = canonical_root(root).ok()?;
        self.cache.latest(&root)
    }

    pub fn snapshot_with(&self, root: &Path, options: ScanOptions) -> Option<Arc<ScanSnapshot>> {
        let root = canonical_root(root).ok()?;
        self.cache.get(&root, options)
    }

    pub fn watcher(&self) -> &TreeWatcher<P> {
        &self.watcher
    }

    /// Previews what `rules_text` would hide under `root`.
    ///
    /// Any cached tree will do since ignored entries are always present in
    /// it; without one, the tree is built without ignore rules and not cached.
    pub async fn test_ignore_rules(
        &self,
        root: &Path,
        rules_text: &str,
    ) -> Result<IgnorePreview, CoreError> {
        let root = canonical_root(root)?;
        let preview = match self.cache.latest(&root) {
            Some(snapshot) => core::test_ignore_rules(&snapshot.nodes, rules_text),
            None => {
                let builder = Arc::clone(&self.builder);
                let outcome =
                    tokio::task::spawn_blocking(move || builder.build(&root, false, false))
                        .await??;
                core::test_ignore_rules(&outcome.nodes, rules_text)
            }
        };
        Ok(preview)
    }

    /// The matched sample paths only.
    pub async fn test_ignore_rules_flat(
        &self,
        root: &Path,
        rules_text: &str,
    ) -> Result<Vec<String>, CoreError> {
        Ok(self.test_ignore_rules(root, rules_text).await?.sample_files)
    }

    /// Number of files in the cached tree for `root`.
    pub fn file_count(&self, root: &Path) -> Option<usize> {
        self.snapshot(root).map(|s| tree::count_files(&s.nodes))
    }

    /// Callers hold the scan lock for `root` and `options`.
    async fn rebuild(
        &self,
        root: PathBuf,
        options: ScanOptions,
    ) -> Result<Arc<ScanSnapshot>, CoreError> {
        let generation = self.cache.next_generation();
        let builder = Arc::clone(&self.builder);
        let build_root = root.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            builder.build(&build_root, options.use_gitignore, options.use_custom_ignore)
        })
        .await??;

        let snapshot = ScanSnapshot::new(root.clone(), options, outcome, generation);
        match self.cache.publish(snapshot) {
            Some(published) => Ok(published),
            // A newer build finished first; hand back that one.
            None => self
                .cache
                .get(&root, options)
                .ok_or_else(|| CoreError::Rescan {
                    root,
                    message: "snapshot vanished during publish".to_string(),
                }),
        }
    }
}
