//! Process-level services built on top of `core`: the snapshot cache, the
//! watcher that keeps it current, and the facade hosts call into.

pub mod cache;
pub mod events;
pub mod proxy;
pub mod service;
pub mod watcher;

pub use cache::{ScanOptions, ScanSnapshot, SnapshotCache};
pub use events::TreeEvent;
pub use proxy::EventProxy;
pub use service::ProjectService;
pub use watcher::{TreeWatcher, WatchState};
