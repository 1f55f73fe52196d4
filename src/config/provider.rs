//! The configuration provider the scanner and watcher are built against.
//!
//! Components receive an `Arc<dyn RuleSource>` at construction instead of
//! reaching into global settings, and learn about rule changes by
//! subscribing to its revision stream.

use super::{settings, AppConfig};
use crate::core::ScanOptions;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::sync::watch;

/// Supplies the custom-ignore rule text and announces changes to it.
pub trait RuleSource: Send + Sync {
    /// Current custom-ignore text, unparsed.
    fn custom_ignore_rules(&self) -> String;

    /// Which ignore sources the user has switched on.
    fn scan_options(&self) -> ScanOptions {
        ScanOptions::default()
    }

    /// A receiver whose value (a revision counter) changes whenever the rules do.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Fixed rule text. Used for one-shot scans and in tests.
pub struct StaticRules {
    rules: String,
    revision: watch::Sender<u64>,
}

impl StaticRules {
    pub fn new(rules: impl Into<String>) -> Self {
        Self {
            rules: rules.into(),
            revision: watch::Sender::new(0),
        }
    }
}

impl RuleSource for StaticRules {
    fn custom_ignore_rules(&self) -> String {
        self.rules.clone()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// Settings held in memory, optionally persisted to a JSON file on change.
pub struct SettingsStore {
    config: RwLock<AppConfig>,
    path: Option<PathBuf>,
    revision: watch::Sender<u64>,
}

impl SettingsStore {
    /// An unpersisted store.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: RwLock::new(config),
            path: None,
            revision: watch::Sender::new(0),
        }
    }

    /// Loads the store from `path` (or the platform default) and writes
    /// changes back to the same place.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let config = settings::load_config(path.as_deref())?;
        let path = match path {
            Some(path) => Some(path),
            None => settings::get_config_file_path(),
        };
        Ok(Self {
            config: RwLock::new(config),
            path,
            revision: watch::Sender::new(0),
        })
    }

    pub fn snapshot(&self) -> AppConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the custom-ignore text, persists it, and notifies subscribers.
    pub fn update_custom_ignore_rules(&self, rules: impl Into<String>) -> Result<()> {
        let rules = rules.into();
        self.update(|config| config.custom_ignore_rules = rules)
    }

    /// Applies `update_fn`, persists the result, and notifies subscribers if
    /// anything that affects scanning changed.
    pub fn update<F>(&self, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let (before, after) = {
            let mut guard = match self.config.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = guard.clone();
            update_fn(&mut guard);
            (before, guard.clone())
        };

        if let Some(path) = &self.path {
            settings::save_config(&after, Some(path))?;
        }

        let rules_changed = before.custom_ignore_rules != after.custom_ignore_rules
            || before.use_gitignore != after.use_gitignore
            || before.use_custom_ignore != after.use_custom_ignore;
        if rules_changed {
            self.revision.send_modify(|rev| *rev += 1);
            tracing::info!("Ignore settings changed (revision {})", *self.revision.borrow());
        }
        Ok(())
    }
}

impl RuleSource for SettingsStore {
    fn custom_ignore_rules(&self) -> String {
        self.snapshot().custom_ignore_rules
    }

    fn scan_options(&self) -> ScanOptions {
        self.snapshot().scan_options()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rule_update_bumps_revision() {
        let store = SettingsStore::new(AppConfig::default());
        let rx = store.subscribe();

        store.update_custom_ignore_rules("*.log").unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), 1);
        assert_eq!(store.custom_ignore_rules(), "*.log");
    }

    #[test]
    fn test_unrelated_update_does_not_notify() {
        let store = SettingsStore::new(AppConfig::default());
        let rx = store.subscribe();

        store.update(|c| c.debounce_ms = 10).unwrap();

        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.snapshot().debounce_ms, 10);
    }

    #[test]
    fn test_opened_store_persists_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::open(Some(path.clone())).unwrap();

        store.update_custom_ignore_rules("tmp/").unwrap();

        let reloaded = settings::load_config(Some(&path)).unwrap();
        assert_eq!(reloaded.custom_ignore_rules, "tmp/");
    }

    #[test]
    fn test_toggle_update_is_reported() {
        let store = SettingsStore::new(AppConfig::default());
        let rx = store.subscribe();
        assert_eq!(store.scan_options(), ScanOptions::new(true, true));

        store.update(|c| c.use_gitignore = false).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(store.scan_options(), ScanOptions::new(false, true));
    }

    #[test]
    fn test_static_rules_never_change() {
        let rules = StaticRules::new("vendor/");
        assert_eq!(rules.custom_ignore_rules(), "vendor/");
        assert!(!rules.subscribe().has_changed().unwrap());
    }
}
