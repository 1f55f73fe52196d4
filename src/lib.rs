//! Project file-tree scanning with layered ignore rules and watcher-driven
//! incremental rescans.

pub mod app;
pub mod config;
pub mod core;
pub mod utils;
