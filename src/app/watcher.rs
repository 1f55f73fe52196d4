//! Keeps the snapshot of a watched project root current.
//!
//! OS notifications for the root are funneled into one controller task. The
//! task waits for the burst to go quiet, then rebuilds the deepest directory
//! that covers every change it saw, splices that subtree into a copy of the
//! current tree, and publishes the result.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::cache::{canonical_root, ScanOptions, ScanSnapshot, SnapshotCache};
use super::events::TreeEvent;
use super::proxy::EventProxy;
use crate::config::provider::RuleSource;
use crate::core::scanner::GITIGNORE_FILE;
use crate::core::{normalize_rel_path, tree, CoreError, ScanOutcome, ScanWarning, TreeBuilder};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// A burst that never goes quiet still gets rebuilt after this many windows.
const MAX_DEBOUNCE_WINDOWS: u32 = 10;

const GIT_DIR: &str = ".git";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchState {
    Stopped,
    Idle,
    Debouncing,
    Rescanning,
}

/// Input to the controller task.
#[derive(Debug)]
pub(crate) enum WatchInput {
    /// Absolute paths reported by the OS watch.
    Changed(Vec<PathBuf>),
    /// Rebuild everything now, skipping the quiet period.
    Refresh,
}

/// State shared between a [`TreeWatcher`] and the controller task it spawned.
struct WatchShared {
    root: PathBuf,
    /// Follows the saved ignore toggles while the watch runs.
    options: Mutex<ScanOptions>,
    state: Mutex<WatchState>,
    cancel: Arc<AtomicBool>,
    /// Held while a result is published; `stop` takes it to fence out
    /// results that were already in flight.
    publish_gate: Mutex<()>,
    rescans: AtomicUsize,
}

impl WatchShared {
    fn new(root: PathBuf, options: ScanOptions) -> Self {
        Self {
            root,
            options: Mutex::new(options),
            state: Mutex::new(WatchState::Idle),
            cancel: Arc::new(AtomicBool::new(false)),
            publish_gate: Mutex::new(()),
            rescans: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> WatchState {
        *lock(&self.state)
    }

    fn options(&self) -> ScanOptions {
        *lock(&self.options)
    }

    fn set_state(&self, state: WatchState) {
        if state != WatchState::Stopped && self.is_cancelled() {
            return;
        }
        *lock(&self.state) = state;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

struct ActiveWatch {
    shared: Arc<WatchShared>,
    input: mpsc::UnboundedSender<WatchInput>,
    task: JoinHandle<()>,
    os_watcher: Option<RecommendedWatcher>,
}

/// Watches at most one project root at a time.
///
/// `start` and `refresh_and_rescan` must be called from within a Tokio runtime.
pub struct TreeWatcher<P: EventProxy> {
    builder: Arc<TreeBuilder>,
    cache: Arc<SnapshotCache>,
    rules: Arc<dyn RuleSource>,
    proxy: P,
    debounce: Duration,
    active: Mutex<Option<ActiveWatch>>,
}

impl<P: EventProxy> TreeWatcher<P> {
    pub fn new(
        builder: Arc<TreeBuilder>,
        cache: Arc<SnapshotCache>,
        rules: Arc<dyn RuleSource>,
        proxy: P,
    ) -> Self {
        Self {
            builder,
            cache,
            rules,
            proxy,
            debounce: DEFAULT_DEBOUNCE,
            active: Mutex::new(None),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Starts watching `root`, replacing any previous watch.
    ///
    /// Returns the canonical root used as the snapshot key. Starting the same
    /// root with the same options again is a no-op.
    pub fn start(&self, root: &Path, options: ScanOptions) -> Result<PathBuf, CoreError> {
        self.start_with(root, options, true).map(|(root, _)| root)
    }

    /// With `os_events` off, the watch is fed only through the returned sender.
    fn start_with(
        &self,
        root: &Path,
        options: ScanOptions,
        os_events: bool,
    ) -> Result<(PathBuf, mpsc::UnboundedSender<WatchInput>), CoreError> {
        let root = canonical_root(root)?;
        let mut active = lock(&self.active);

        if let Some(current) = active.as_ref() {
            if current.shared.root == root
                && current.shared.options() == options
                && !current.task.is_finished()
            {
                tracing::debug!("Already watching {}", root.display());
                return Ok((root, current.input.clone()));
            }
        }
        // The old watch is fenced off before the new one exists.
        if let Some(previous) = active.take() {
            self.shutdown(previous, "watch replaced");
        }

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let os_watcher = if os_events {
            Some(create_os_watcher(&root, input_tx.clone())?)
        } else {
            None
        };
        *active = Some(self.spawn(root.clone(), options, input_tx.clone(), input_rx, os_watcher));
        Ok((root, input_tx))
    }

    /// Stops the current watch. Once this returns, no further snapshot from
    /// that watch is published.
    pub fn stop(&self) {
        if let Some(active) = lock(&self.active).take() {
            self.shutdown(active, "stopped");
        }
    }

    /// Forces an immediate full rebuild of the watched root.
    ///
    /// Returns `false` when nothing is being watched.
    pub fn refresh_and_rescan(&self) -> bool {
        match lock(&self.active).as_ref() {
            Some(active) => active.input.send(WatchInput::Refresh).is_ok(),
            None => false,
        }
    }

    pub fn state(&self) -> WatchState {
        lock(&self.active)
            .as_ref()
            .map_or(WatchState::Stopped, |active| active.shared.state())
    }

    pub fn watched_root(&self) -> Option<PathBuf> {
        lock(&self.active)
            .as_ref()
            .map(|active| active.shared.root.clone())
    }

    /// The options the current watch builds with.
    pub fn options(&self) -> Option<ScanOptions> {
        lock(&self.active)
            .as_ref()
            .map(|active| active.shared.options())
    }

    /// Number of snapshots produced by the current watch, including the initial one.
    pub fn rescan_count(&self) -> usize {
        lock(&self.active)
            .as_ref()
            .map_or(0, |active| active.shared.rescans.load(Ordering::SeqCst))
    }

    fn spawn(
        &self,
        root: PathBuf,
        options: ScanOptions,
        input_tx: mpsc::UnboundedSender<WatchInput>,
        input_rx: mpsc::UnboundedReceiver<WatchInput>,
        os_watcher: Option<RecommendedWatcher>,
    ) -> ActiveWatch {
        let shared = Arc::new(WatchShared::new(root, options));
        let controller = Controller {
            builder: Arc::clone(&self.builder),
            cache: Arc::clone(&self.cache),
            proxy: self.proxy.clone(),
            debounce: self.debounce,
            shared: Arc::clone(&shared),
            saved_options: self.rules.scan_options(),
            rules: Arc::clone(&self.rules),
            rules_rx: Some(self.rules.subscribe()),
        };
        let task = tokio::spawn(controller.run(input_rx));
        ActiveWatch {
            shared,
            input: input_tx,
            task,
            os_watcher,
        }
    }

    fn shutdown(&self, active: ActiveWatch, reason: &str) {
        {
            let _gate = lock(&active.shared.publish_gate);
            active.shared.cancel.store(true, Ordering::SeqCst);
        }
        active.task.abort();
        drop(active.os_watcher);
        active.shared.set_state(WatchState::Stopped);

        let root = active.shared.root.clone();
        tracing::info!("🛑 Stopped watching {} ({})", root.display(), reason);
        self.proxy.send_event(TreeEvent::WatchStopped {
            root,
            reason: reason.to_string(),
        });
    }

    /// Starts a watch fed only by `WatchInput`s sent through the returned sender.
    #[cfg(test)]
    fn start_simulated(
        &self,
        root: &Path,
        options: ScanOptions,
    ) -> Result<mpsc::UnboundedSender<WatchInput>, CoreError> {
        self.start_with(root, options, false).map(|(_, input)| input)
    }
}

impl<P: EventProxy> Drop for TreeWatcher<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The per-watch task: waits for changes, debounces them, and rebuilds.
struct Controller<P> {
    builder: Arc<TreeBuilder>,
    cache: Arc<SnapshotCache>,
    proxy: P,
    debounce: Duration,
    shared: Arc<WatchShared>,
    rules: Arc<dyn RuleSource>,
    /// The toggles as last read from the rule source.
    saved_options: ScanOptions,
    rules_rx: Option<watch::Receiver<u64>>,
}

impl<P: EventProxy> Controller<P> {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<WatchInput>) {
        let root = self.shared.root.clone();
        tracing::info!("👀 Watching {}", root.display());

        self.rescan(&PendingChanges::initial()).await;

        loop {
            self.shared.set_state(WatchState::Idle);
            let mut pending = PendingChanges::default();

            tokio::select! {
                received = input.recv() => match received {
                    Some(change) => pending.absorb(change, &root),
                    None => break,
                },
                changed = rules_changed(&mut self.rules_rx) => {
                    if !changed {
                        self.rules_rx = None;
                        continue;
                    }
                    tracing::info!("Ignore rules changed, rescanning {}", root.display());
                    self.follow_saved_options();
                    pending.refresh();
                }
            }

            if pending.is_empty() {
                continue;
            }

            if !pending.immediate {
                self.shared.set_state(WatchState::Debouncing);
                let deadline = Instant::now() + self.debounce * MAX_DEBOUNCE_WINDOWS;
                let quiet = tokio::time::sleep(self.debounce);
                tokio::pin!(quiet);

                loop {
                    tokio::select! {
                        _ = &mut quiet => break,
                        received = input.recv() => match received {
                            Some(change) => {
                                pending.absorb(change, &root);
                                if pending.immediate {
                                    break;
                                }
                                let next = (Instant::now() + self.debounce).min(deadline);
                                quiet.as_mut().reset(next);
                            }
                            None => {
                                self.shared.set_state(WatchState::Stopped);
                                return;
                            }
                        },
                        changed = rules_changed(&mut self.rules_rx) => {
                            if changed {
                                self.follow_saved_options();
                                pending.refresh();
                                break;
                            }
                            self.rules_rx = None;
                        }
                    }
                }
            }

            if self.shared.is_cancelled() {
                break;
            }
            // Anything arriving from here on waits in `input` and becomes
            // the next batch.
            self.rescan(&pending).await;
        }

        self.shared.set_state(WatchState::Stopped);
    }

    /// Applies toggles flipped in settings to the watch's options. A toggle
    /// the user did not touch keeps whatever the watch was started with.
    fn follow_saved_options(&mut self) {
        let saved = self.rules.scan_options();
        let previous = std::mem::replace(&mut self.saved_options, saved);
        let mut options = self.shared.options();
        if saved.use_gitignore != previous.use_gitignore {
            options.use_gitignore = saved.use_gitignore;
        }
        if saved.use_custom_ignore != previous.use_custom_ignore {
            options.use_custom_ignore = saved.use_custom_ignore;
        }
        let mut current = lock(&self.shared.options);
        if *current != options {
            tracing::info!(
                "Watch options for {} now {:?}",
                self.shared.root.display(),
                options
            );
            *current = options;
        }
    }

    async fn rescan(&self, pending: &PendingChanges) {
        let root = self.shared.root.clone();
        let options = self.shared.options();
        self.shared.set_state(WatchState::Rescanning);

        // Listings of the same root and options wait for this build.
        let _scan = self.cache.lock_scans(&root, options).await;
        let current = self.cache.get(&root, options);
        if pending.initial && current.is_some() {
            tracing::debug!("Reusing cached tree for {}", root.display());
            return;
        }
        let generation = self.cache.next_generation();
        let scope = current
            .as_deref()
            .and_then(|snapshot| resolve_scope(snapshot, pending.scope()));
        tracing::info!(
            "🔄 Rescanning {} ({})",
            root.display(),
            scope.as_deref().unwrap_or("full")
        );

        let builder = Arc::clone(&self.builder);
        let cancel = Arc::clone(&self.shared.cancel);
        let build_root = root.clone();
        let result = tokio::task::spawn_blocking(move || {
            rebuild(
                &builder,
                &build_root,
                options,
                current.as_deref(),
                scope.as_deref(),
                &cancel,
            )
        })
        .await
        .unwrap_or_else(|e| Err(CoreError::from(e)));

        self.publish(root, options, generation, result);
    }

    fn publish(
        &self,
        root: PathBuf,
        options: ScanOptions,
        generation: u64,
        result: Result<ScanOutcome, CoreError>,
    ) {
        let _gate = lock(&self.shared.publish_gate);
        if self.shared.is_cancelled() {
            tracing::debug!("Dropping rescan result for stopped watch on {}", root.display());
            return;
        }

        match result {
            Ok(outcome) => {
                self.shared.rescans.fetch_add(1, Ordering::SeqCst);
                let snapshot = ScanSnapshot::new(root, options, outcome, generation);
                if let Some(published) = self.cache.publish(snapshot) {
                    self.proxy.send_event(TreeEvent::TreeUpdated(published));
                }
            }
            Err(CoreError::Cancelled) => {
                tracing::debug!("Rescan of {} cancelled", root.display());
            }
            Err(e) => {
                tracing::error!("❌ Rescan of {} failed: {}", root.display(), e);
                self.proxy.send_event(TreeEvent::RescanFailed {
                    root,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Resolves when the rule source announces a change. `false` means the
/// source is gone and will never announce one again.
async fn rules_changed(rules_rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rules_rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Changes collected during one debounce window.
#[derive(Debug, Default)]
struct PendingChanges {
    /// Parent directories (relative to the root) of every changed path.
    dirs: BTreeSet<String>,
    full: bool,
    immediate: bool,
    /// The build that starts a watch; skipped when the tree is already cached.
    initial: bool,
}

impl PendingChanges {
    fn initial() -> Self {
        Self {
            full: true,
            initial: true,
            ..Default::default()
        }
    }

    fn refresh(&mut self) {
        self.full = true;
        self.immediate = true;
    }

    fn absorb(&mut self, input: WatchInput, root: &Path) {
        match input {
            WatchInput::Refresh => self.refresh(),
            WatchInput::Changed(paths) => {
                for path in paths {
                    self.record(root, &path);
                }
            }
        }
    }

    fn record(&mut self, root: &Path, path: &Path) {
        let Ok(rel) = path.strip_prefix(root) else {
            return;
        };
        if is_git_internal(rel) {
            return;
        }
        let rel = normalize_rel_path(rel);
        // The root itself, or the file that feeds the root's rules.
        if rel.is_empty() || rel == GITIGNORE_FILE {
            self.full = true;
            return;
        }
        let parent = match rel.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => ".".to_string(),
        };
        self.dirs.insert(parent);
    }

    fn is_empty(&self) -> bool {
        !self.full && self.dirs.is_empty()
    }

    /// The deepest directory containing every change, or `None` for the whole tree.
    fn scope(&self) -> Option<String> {
        if self.full {
            return None;
        }
        let mut dirs = self.dirs.iter();
        let first = dirs.next()?.clone();
        let common = dirs.fold(first, |acc, dir| common_ancestor(&acc, dir));
        (common != ".").then_some(common)
    }
}

fn common_ancestor(a: &str, b: &str) -> String {
    if a == "." || b == "." {
        return ".".to_string();
    }
    let shared: Vec<&str> = a
        .split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    if shared.is_empty() {
        ".".to_string()
    } else {
        shared.join("/")
    }
}

/// Walks `scope` up until it names a directory present in `snapshot`.
/// A directory created since the last build is covered by its nearest known parent.
fn resolve_scope(snapshot: &ScanSnapshot, scope: Option<String>) -> Option<String> {
    let mut scope = scope?;
    loop {
        if tree::find(&snapshot.nodes, &scope).is_some_and(|node| node.is_dir) {
            return Some(scope);
        }
        scope = scope.rsplit_once('/')?.0.to_string();
    }
}

fn is_git_internal(rel: &Path) -> bool {
    rel.components()
        .any(|c| matches!(c, Component::Normal(name) if name == GIT_DIR))
}

/// Rebuilds `scope` and splices it into `current`, or rebuilds the whole root
/// when there is no usable scope.
fn rebuild(
    builder: &TreeBuilder,
    root: &Path,
    options: ScanOptions,
    current: Option<&ScanSnapshot>,
    scope: Option<&str>,
    cancel: &AtomicBool,
) -> Result<ScanOutcome, CoreError> {
    if let (Some(current), Some(rel_dir)) = (current, scope) {
        match builder.build_subtree(
            root,
            rel_dir,
            options.use_gitignore,
            options.use_custom_ignore,
            cancel,
        ) {
            Ok((node, warnings)) => {
                if let Some(nodes) = tree::replace_subtree(&current.nodes, node) {
                    let mut merged: Vec<ScanWarning> = current
                        .warnings
                        .iter()
                        .filter(|w| w.rel_path != rel_dir && !tree::is_ancestor(rel_dir, &w.rel_path))
                        .cloned()
                        .collect();
                    merged.extend(warnings);
                    return Ok(ScanOutcome {
                        nodes,
                        warnings: merged,
                    });
                }
            }
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(e) => {
                tracing::debug!("Scoped rebuild of {} failed ({}), rebuilding all", rel_dir, e);
            }
        }
    }
    builder.build_with_cancel(
        root,
        options.use_gitignore,
        options.use_custom_ignore,
        cancel,
    )
}

fn create_os_watcher(
    root: &Path,
    input: mpsc::UnboundedSender<WatchInput>,
) -> Result<RecommendedWatcher, CoreError> {
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let paths: Vec<PathBuf> = if event.need_rescan() {
                    vec![watch_root.clone()]
                } else {
                    event
                        .paths
                        .into_iter()
                        .filter(|p| {
                            p.strip_prefix(&watch_root)
                                .map_or(true, |rel| !is_git_internal(rel))
                        })
                        .collect()
                };
                if !paths.is_empty() && input.send(WatchInput::Changed(paths)).is_err() {
                    tracing::debug!("Watch controller gone, dropping event");
                }
            }
            Err(e) => tracing::warn!("Watch error under {}: {}", watch_root.display(), e),
        }
    })
    .map_err(|source| CoreError::WatchEstablishment {
        root: root.to_path_buf(),
        source,
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|source| CoreError::WatchEstablishment {
            root: root.to_path_buf(),
            source,
        })?;
    Ok(watcher)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::provider::{SettingsStore, StaticRules};
    use crate::config::AppConfig;
    use std::fs;
    use tempfile::TempDir;

    const TEST_DEBOUNCE: Duration = Duration::from_millis(100);

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "docs/guide.md", "# Guide");
        write(dir.path(), "README.md", "hi");
        dir
    }

    struct Fixture {
        watcher: TreeWatcher<mpsc::UnboundedSender<TreeEvent>>,
        cache: Arc<SnapshotCache>,
        events: mpsc::UnboundedReceiver<TreeEvent>,
    }

    fn fixture(rules: Arc<dyn RuleSource>, debounce: Duration) -> Fixture {
        let cache = Arc::new(SnapshotCache::new());
        let builder = Arc::new(TreeBuilder::new(Arc::clone(&rules)));
        let (tx, events) = mpsc::unbounded_channel();
        let watcher = TreeWatcher::new(builder, Arc::clone(&cache), rules, tx).with_debounce(debounce);
        Fixture {
            watcher,
            cache,
            events,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TreeEvent>) -> TreeEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a tree event")
            .expect("event channel closed")
    }

    async fn assert_quiet(events: &mut mpsc::UnboundedReceiver<TreeEvent>, wait: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(wait, events.recv()).await {
            panic!("unexpected event: {event:?}");
        }
    }

    async fn next_snapshot(events: &mut mpsc::UnboundedReceiver<TreeEvent>) -> Arc<ScanSnapshot> {
        match next_event(events).await {
            TreeEvent::TreeUpdated(snapshot) => snapshot,
            other => panic!("expected TreeUpdated, got {other:?}"),
        }
    }

    async fn wait_for_state<P: EventProxy>(watcher: &TreeWatcher<P>, state: WatchState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while watcher.state() != state {
            assert!(Instant::now() < deadline, "watcher never reached {state:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_burst_of_events_triggers_one_rebuild() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let input = fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        let initial = next_snapshot(&mut fx.events).await;

        for i in 0..5 {
            let rel = format!("src/gen{i}.rs");
            write(dir.path(), &rel, "// generated");
            input.send(WatchInput::Changed(vec![root.join(&rel)])).unwrap();
        }

        let updated = next_snapshot(&mut fx.events).await;
        assert_quiet(&mut fx.events, Duration::from_millis(400)).await;

        assert_eq!(fx.watcher.rescan_count(), 2);
        assert!(updated.generation > initial.generation);
        assert_eq!(tree::count_files(&updated.nodes), 8);
        assert!(tree::find(&updated.nodes, "src/gen4.rs").is_some());
        // The earlier snapshot is untouched.
        assert!(tree::find(&initial.nodes, "src/gen4.rs").is_none());
    }

    #[tokio::test]
    async fn test_events_during_rescan_cause_one_follow_up() {
        let dir = project();
        let options = ScanOptions::default();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let input = fx.watcher.start_simulated(dir.path(), options).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        next_snapshot(&mut fx.events).await;
        wait_for_state(&fx.watcher, WatchState::Idle).await;

        // While the lock is held the next rebuild stays in Rescanning.
        let held = fx.cache.lock_scans(&root, options).await;
        write(dir.path(), "src/first.rs", "");
        input.send(WatchInput::Changed(vec![root.join("src/first.rs")])).unwrap();
        wait_for_state(&fx.watcher, WatchState::Rescanning).await;

        for i in 0..3 {
            let rel = format!("src/late{i}.rs");
            write(dir.path(), &rel, "");
            input.send(WatchInput::Changed(vec![root.join(&rel)])).unwrap();
        }
        drop(held);

        let in_flight = next_snapshot(&mut fx.events).await;
        let follow_up = next_snapshot(&mut fx.events).await;
        assert_quiet(&mut fx.events, Duration::from_millis(400)).await;

        assert_eq!(fx.watcher.rescan_count(), 3);
        assert!(follow_up.generation > in_flight.generation);
        assert!(tree::find(&in_flight.nodes, "src/first.rs").is_some());
        assert!(tree::find(&follow_up.nodes, "src/late2.rs").is_some());
    }

    #[tokio::test]
    async fn test_starting_the_same_watch_again_is_a_no_op() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let input = fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        next_snapshot(&mut fx.events).await;

        let again = fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();

        assert!(again.same_channel(&input));
        assert_quiet(&mut fx.events, Duration::from_millis(300)).await;
        assert_eq!(fx.watcher.rescan_count(), 1);

        write(dir.path(), "added.txt", "");
        again.send(WatchInput::Changed(vec![root.join("added.txt")])).unwrap();
        let updated = next_snapshot(&mut fx.events).await;
        assert!(tree::find(&updated.nodes, "added.txt").is_some());
        assert_eq!(fx.watcher.rescan_count(), 2);
    }

    #[tokio::test]
    async fn test_switching_roots_stops_the_old_watch_first() {
        let first = project();
        let second = project();
        write(second.path(), "only_here.txt", "");
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let old_input = fx.watcher.start_simulated(first.path(), ScanOptions::default()).unwrap();
        let old_root = fx.watcher.watched_root().unwrap();
        next_snapshot(&mut fx.events).await;

        fx.watcher.start_simulated(second.path(), ScanOptions::default()).unwrap();
        let new_root = fx.watcher.watched_root().unwrap();

        match next_event(&mut fx.events).await {
            TreeEvent::WatchStopped { root, .. } => assert_eq!(root, old_root),
            other => panic!("expected WatchStopped, got {other:?}"),
        }
        let snapshot = next_snapshot(&mut fx.events).await;
        assert_eq!(snapshot.root, new_root);
        assert!(tree::find(&snapshot.nodes, "only_here.txt").is_some());

        // The replaced watch no longer rebuilds anything.
        write(first.path(), "late.txt", "");
        let _ = old_input.send(WatchInput::Changed(vec![old_root.join("late.txt")]));
        assert_quiet(&mut fx.events, Duration::from_millis(400)).await;
        assert_eq!(fx.watcher.rescan_count(), 1);
        assert!(fx
            .cache
            .get(&old_root, ScanOptions::default())
            .is_some_and(|s| tree::find(&s.nodes, "late.txt").is_none()));
    }

    #[tokio::test]
    async fn test_saved_toggle_change_switches_watch_options() {
        let dir = project();
        write(dir.path(), ".gitignore", "docs/\n");
        let store = Arc::new(SettingsStore::new(AppConfig {
            custom_ignore_rules: "*.md".to_string(),
            ..Default::default()
        }));
        let mut fx = fixture(store.clone(), TEST_DEBOUNCE);
        // Custom rules switched off for this watch only.
        fx.watcher
            .start_simulated(dir.path(), ScanOptions::new(true, false))
            .unwrap();
        let root = fx.watcher.watched_root().unwrap();
        let initial = next_snapshot(&mut fx.events).await;
        assert!(tree::find(&initial.nodes, "docs").unwrap().is_gitignored);

        store.update(|c| c.use_gitignore = false).unwrap();

        let updated = next_snapshot(&mut fx.events).await;
        let expected = ScanOptions::new(false, false);
        assert_eq!(updated.options, expected);
        assert_eq!(fx.watcher.options(), Some(expected));
        assert!(!tree::find(&updated.nodes, "docs").unwrap().is_gitignored);
        assert!(!tree::find(&updated.nodes, "README.md").unwrap().is_custom_ignored);
        assert!(Arc::ptr_eq(&fx.cache.get(&root, expected).unwrap(), &updated));
    }

    #[tokio::test]
    async fn test_git_internal_events_are_ignored() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let input = fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        next_snapshot(&mut fx.events).await;

        input
            .send(WatchInput::Changed(vec![root.join(".git/index"), root.join(".git/refs/heads/main")]))
            .unwrap();

        assert_quiet(&mut fx.events, Duration::from_millis(400)).await;
        assert_eq!(fx.watcher.rescan_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_prevents_further_publication() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let input = fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        let before = next_snapshot(&mut fx.events).await;

        input.send(WatchInput::Changed(vec![root.join("src/main.rs")])).unwrap();
        fx.watcher.stop();

        match next_event(&mut fx.events).await {
            TreeEvent::WatchStopped { root: stopped, .. } => assert_eq!(stopped, root),
            other => panic!("expected WatchStopped, got {other:?}"),
        }
        let _ = input.send(WatchInput::Changed(vec![root.join("README.md")]));
        assert_quiet(&mut fx.events, Duration::from_millis(400)).await;

        assert_eq!(fx.watcher.state(), WatchState::Stopped);
        assert_eq!(fx.cache.get(&root, ScanOptions::default()).unwrap().generation, before.generation);
    }

    #[tokio::test]
    async fn test_refresh_skips_the_debounce_window() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), Duration::from_secs(30));
        fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        next_snapshot(&mut fx.events).await;

        write(dir.path(), "notes.txt", "new");
        assert!(fx.watcher.refresh_and_rescan());

        let updated = next_snapshot(&mut fx.events).await;
        assert!(tree::find(&updated.nodes, "notes.txt").is_some());
    }

    #[tokio::test]
    async fn test_rule_change_triggers_rescan() {
        let dir = project();
        let store = Arc::new(SettingsStore::new(AppConfig {
            custom_ignore_rules: String::new(),
            ..Default::default()
        }));
        let mut fx = fixture(store.clone(), TEST_DEBOUNCE);
        fx.watcher
            .start_simulated(dir.path(), ScanOptions::new(false, true))
            .unwrap();
        let initial = next_snapshot(&mut fx.events).await;
        assert!(!tree::find(&initial.nodes, "docs").unwrap().is_custom_ignored);

        store.update_custom_ignore_rules("docs/").unwrap();

        let updated = next_snapshot(&mut fx.events).await;
        assert!(tree::find(&updated.nodes, "docs").unwrap().is_custom_ignored);
        assert!(tree::find(&updated.nodes, "docs/guide.md").unwrap().is_custom_ignored);
    }

    #[tokio::test]
    async fn test_failed_rescan_keeps_last_snapshot() {
        let dir = project();
        let mut fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        fx.watcher.start_simulated(dir.path(), ScanOptions::default()).unwrap();
        let root = fx.watcher.watched_root().unwrap();
        let good = next_snapshot(&mut fx.events).await;

        fs::remove_dir_all(dir.path()).unwrap();
        assert!(fx.watcher.refresh_and_rescan());

        match next_event(&mut fx.events).await {
            TreeEvent::RescanFailed { root: failed, .. } => assert_eq!(failed, root),
            other => panic!("expected RescanFailed, got {other:?}"),
        }
        assert_eq!(fx.cache.get(&root, ScanOptions::default()).unwrap().generation, good.generation);
    }

    #[tokio::test]
    async fn test_start_rejects_missing_root() {
        let dir = TempDir::new().unwrap();
        let fx = fixture(Arc::new(StaticRules::new("")), TEST_DEBOUNCE);
        let result = fx
            .watcher
            .start(&dir.path().join("missing"), ScanOptions::default());
        assert!(matches!(result, Err(CoreError::InvalidRoot(_))));
        assert_eq!(fx.watcher.state(), WatchState::Stopped);
    }

    #[test]
    fn test_scope_is_deepest_common_directory() {
        let root = Path::new("/p");
        let mut pending = PendingChanges::default();
        pending.absorb(
            WatchInput::Changed(vec![
                PathBuf::from("/p/src/app/a.rs"),
                PathBuf::from("/p/src/app/b.rs"),
            ]),
            root,
        );
        assert_eq!(pending.scope().as_deref(), Some("src/app"));

        pending.absorb(WatchInput::Changed(vec![PathBuf::from("/p/src/lib/c.rs")]), root);
        assert_eq!(pending.scope().as_deref(), Some("src"));

        pending.absorb(WatchInput::Changed(vec![PathBuf::from("/p/docs/x.md")]), root);
        assert_eq!(pending.scope(), None);
        assert!(!pending.is_empty());
    }

    #[test]
    fn test_gitignore_change_forces_full_rebuild() {
        let root = Path::new("/p");
        let mut pending = PendingChanges::default();
        pending.absorb(
            WatchInput::Changed(vec![
                PathBuf::from("/p/src/a.rs"),
                PathBuf::from("/p/.gitignore"),
            ]),
            root,
        );
        assert!(pending.full);
        assert_eq!(pending.scope(), None);
    }

    #[test]
    fn test_noise_outside_root_and_in_git_is_dropped() {
        let root = Path::new("/p");
        let mut pending = PendingChanges::default();
        pending.absorb(
            WatchInput::Changed(vec![
                PathBuf::from("/elsewhere/a.rs"),
                PathBuf::from("/p/.git/HEAD"),
                PathBuf::from("/p/sub/.git/index"),
            ]),
            root,
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_common_ancestor() {
        assert_eq!(common_ancestor("a/b/c", "a/b/d"), "a/b");
        assert_eq!(common_ancestor("a/b", "a/b"), "a/b");
        assert_eq!(common_ancestor("ab", "a"), ".");
        assert_eq!(common_ancestor(".", "a"), ".");
    }

    #[test]
    fn test_scoped_rebuild_only_touches_scope() {
        let dir = project();
        let builder = TreeBuilder::new(Arc::new(StaticRules::new("")));
        let options = ScanOptions::default();
        let outcome = builder.build(dir.path(), true, true).unwrap();
        let current = ScanSnapshot::new(dir.path().to_path_buf(), options, outcome, 1);

        write(dir.path(), "src/new.rs", "");
        write(dir.path(), "docs/new.md", "");

        let rebuilt = rebuild(
            &builder,
            dir.path(),
            options,
            Some(&current),
            Some("src"),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert!(tree::find(&rebuilt.nodes, "src/new.rs").is_some());
        assert!(tree::find(&rebuilt.nodes, "docs/new.md").is_none());
        assert!(tree::find(&rebuilt.nodes, "docs/guide.md").is_some());
    }

    #[test]
    fn test_new_directory_resolves_to_known_parent() {
        let dir = project();
        let builder = TreeBuilder::new(Arc::new(StaticRules::new("")));
        let outcome = builder.build(dir.path(), true, true).unwrap();
        let current = ScanSnapshot::new(dir.path().to_path_buf(), ScanOptions::default(), outcome, 1);

        assert_eq!(
            resolve_scope(&current, Some("src/fresh/deeper".to_string())).as_deref(),
            Some("src")
        );
        assert_eq!(resolve_scope(&current, Some("brand_new".to_string())), None);
    }
}
