//! Published tree snapshots, one per project root and option set.
//!
//! Snapshots are immutable once published. A rebuild produces a new
//! `ScanSnapshot` and swaps the `Arc` in, so readers holding an older one
//! never observe a half-updated tree.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::OwnedMutexGuard;

pub use crate::core::ScanOptions;
use crate::core::{CoreError, FileNode, ScanOutcome, ScanWarning};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSnapshot {
    pub root: PathBuf,
    pub options: ScanOptions,
    pub nodes: Vec<FileNode>,
    pub warnings: Vec<ScanWarning>,
    /// Monotonic across the whole cache; a higher value is a newer build.
    pub generation: u64,
    pub scanned_at: DateTime<Local>,
}

impl ScanSnapshot {
    pub fn new(root: PathBuf, options: ScanOptions, outcome: ScanOutcome, generation: u64) -> Self {
        Self {
            root,
            options,
            nodes: outcome.nodes,
            warnings: outcome.warnings,
            generation,
            scanned_at: Local::now(),
        }
    }

    /// The single root node of the tree.
    pub fn root_node(&self) -> Option<&FileNode> {
        self.nodes.first()
    }
}

type CacheKey = (PathBuf, ScanOptions);

/// Snapshots keyed by root and the options they were built with, so a
/// listing with other flags never evicts the watched tree.
#[derive(Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<CacheKey, Arc<ScanSnapshot>>>,
    /// One lock per key; every build that publishes under a key holds it.
    scan_locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the generation number for a build that is about to start.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The snapshot of `root` built with `options`.
    pub fn get(&self, root: &Path, options: ScanOptions) -> Option<Arc<ScanSnapshot>> {
        self.read().get(&(root.to_path_buf(), options)).cloned()
    }

    /// The most recently built snapshot of `root`, whatever its options.
    pub fn latest(&self, root: &Path) -> Option<Arc<ScanSnapshot>> {
        self.read()
            .iter()
            .filter(|((key, _), _)| key == root)
            .map(|(_, snapshot)| snapshot)
            .max_by_key(|snapshot| snapshot.generation)
            .cloned()
    }

    /// Makes `snapshot` the current one for its root and options.
    ///
    /// Returns `None` without replacing anything when a snapshot from a newer
    /// build is already in place, so a slow build can never roll the cache back.
    pub fn publish(&self, snapshot: ScanSnapshot) -> Option<Arc<ScanSnapshot>> {
        let key = (snapshot.root.clone(), snapshot.options);
        let mut entries = self.write();
        if let Some(current) = entries.get(&key) {
            if current.generation > snapshot.generation {
                tracing::debug!(
                    "Discarding stale snapshot for {} (generation {} < {})",
                    snapshot.root.display(),
                    snapshot.generation,
                    current.generation
                );
                return None;
            }
        }
        let snapshot = Arc::new(snapshot);
        entries.insert(key, Arc::clone(&snapshot));
        Some(snapshot)
    }

    /// Forgets every snapshot of `root`. Returns how many were dropped.
    pub fn remove(&self, root: &Path) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|(key, _), _| key != root);
        lock(&self.scan_locks).retain(|(key, _), _| key != root);
        before - entries.len()
    }

    pub fn keys(&self) -> Vec<(PathBuf, ScanOptions)> {
        self.read().keys().cloned().collect()
    }

    /// Waits until no other build for `root` and `options` is running.
    ///
    /// Hold the guard from before the generation is reserved until the
    /// result is published.
    pub async fn lock_scans(&self, root: &Path, options: ScanOptions) -> OwnedMutexGuard<()> {
        let scan_lock = {
            let mut locks = lock(&self.scan_locks);
            Arc::clone(locks.entry((root.to_path_buf(), options)).or_default())
        };
        scan_lock.lock_owned().await
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, Arc<ScanSnapshot>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, Arc<ScanSnapshot>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves `root` to the canonical path used as the cache and watch key.
pub fn canonical_root(root: &Path) -> Result<PathBuf, CoreError> {
    let canonical =
        std::fs::canonicalize(root).map_err(|_| CoreError::InvalidRoot(root.to_path_buf()))?;
    if !canonical.is_dir() {
        return Err(CoreError::InvalidRoot(root.to_path_buf()));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(root: &str, generation: u64) -> ScanSnapshot {
        with_options(root, ScanOptions::default(), generation)
    }

    fn with_options(root: &str, options: ScanOptions, generation: u64) -> ScanSnapshot {
        ScanSnapshot::new(PathBuf::from(root), options, ScanOutcome::default(), generation)
    }

    fn current(cache: &SnapshotCache, root: &str) -> Arc<ScanSnapshot> {
        cache.get(Path::new(root), ScanOptions::default()).unwrap()
    }

    #[test]
    fn test_newer_generation_replaces_older() {
        let cache = SnapshotCache::new();
        cache.publish(snapshot("/p", 1)).unwrap();
        let held = current(&cache, "/p");

        cache.publish(snapshot("/p", 2)).unwrap();

        assert_eq!(current(&cache, "/p").generation, 2);
        // Readers keep whatever they already hold.
        assert_eq!(held.generation, 1);
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let cache = SnapshotCache::new();
        cache.publish(snapshot("/p", 5)).unwrap();

        assert!(cache.publish(snapshot("/p", 3)).is_none());
        assert_eq!(current(&cache, "/p").generation, 5);
    }

    #[test]
    fn test_generations_increase() {
        let cache = SnapshotCache::new();
        let a = cache.next_generation();
        let b = cache.next_generation();
        assert!(b > a);
    }

    #[test]
    fn test_options_are_part_of_the_key() {
        let cache = SnapshotCache::new();
        let plain = ScanOptions::new(false, false);
        cache.publish(snapshot("/p", 1)).unwrap();
        cache.publish(with_options("/p", plain, 2)).unwrap();

        // A newer build with other options leaves the first entry alone.
        assert_eq!(current(&cache, "/p").generation, 1);
        assert_eq!(cache.get(Path::new("/p"), plain).unwrap().generation, 2);
        assert!(cache
            .get(Path::new("/p"), ScanOptions::new(false, true))
            .is_none());
        // A stale build under one key is judged against that key only.
        assert!(cache.publish(snapshot("/p", 1)).is_some());
        assert_eq!(cache.latest(Path::new("/p")).unwrap().generation, 2);
        assert_eq!(cache.keys().len(), 2);
    }

    #[test]
    fn test_remove_drops_every_option_set() {
        let cache = SnapshotCache::new();
        cache.publish(snapshot("/p", 1)).unwrap();
        cache.publish(with_options("/p", ScanOptions::new(true, false), 2)).unwrap();
        cache.publish(snapshot("/q", 3)).unwrap();

        assert_eq!(cache.remove(Path::new("/p")), 2);
        assert!(cache.latest(Path::new("/p")).is_none());
        assert_eq!(cache.keys(), vec![(PathBuf::from("/q"), ScanOptions::default())]);
    }

    #[tokio::test]
    async fn test_scan_lock_serializes_builds_per_key() {
        let cache = Arc::new(SnapshotCache::new());
        let held = cache.lock_scans(Path::new("/p"), ScanOptions::default()).await;

        // Other option sets are not blocked.
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            cache.lock_scans(Path::new("/p"), ScanOptions::new(false, false)),
        )
        .await;
        assert!(other.is_ok());

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let _guard = cache.lock_scans(Path::new("/p"), ScanOptions::default()).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_canonical_root_rejects_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(matches!(canonical_root(&file), Err(CoreError::InvalidRoot(_))));
        assert!(matches!(
            canonical_root(&dir.path().join("missing")),
            Err(CoreError::InvalidRoot(_))
        ));
        assert!(canonical_root(dir.path()).is_ok());
    }
}
