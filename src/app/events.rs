//! Defines the events published to subscribers of a watched project.

use std::path::PathBuf;
use std::sync::Arc;

use super::cache::ScanSnapshot;

/// Events sent from the watcher to whoever listens on its [`EventProxy`].
///
/// [`EventProxy`]: super::proxy::EventProxy
#[derive(Debug, Clone)]
pub enum TreeEvent {
    /// A rebuild finished and its snapshot is now the current one.
    TreeUpdated(Arc<ScanSnapshot>),
    /// A rebuild failed. The previously published snapshot is still current.
    RescanFailed { root: PathBuf, message: String },
    /// The watch on `root` ended and no further updates will follow.
    WatchStopped { root: PathBuf, reason: String },
}

impl TreeEvent {
    pub fn root(&self) -> &PathBuf {
        match self {
            TreeEvent::TreeUpdated(snapshot) => &snapshot.root,
            TreeEvent::RescanFailed { root, .. } => root,
            TreeEvent::WatchStopped { root, .. } => root,
        }
    }
}
