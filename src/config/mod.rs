pub mod provider;
pub mod settings;

use crate::core::ScanOptions;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted settings. Ignore rules are stored as raw text and parsed on
/// every scan; parsed rules are never written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub custom_ignore_rules: String,
    pub use_gitignore: bool,
    pub use_custom_ignore: bool,
    /// Quiet period before a burst of filesystem events triggers a rescan.
    pub debounce_ms: u64,
    pub max_depth: usize,
    /// Concurrent directory reads per scan; `0` uses rayon's default.
    pub scan_workers: usize,
    pub last_directory: Option<PathBuf>,
}

impl AppConfig {
    /// The ignore sources switched on in these settings.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions::new(self.use_gitignore, self.use_custom_ignore)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let common_patterns = [
            "node_modules/",
            "venv/",
            ".venv/",
            "target/",
            "dist/",
            "build/",
            ".idea/",
            ".vscode/",
            ".git/",
            "__pycache__/",
            "*.log",
            "*.tmp",
            "*.env",
            ".DS_Store",
            "Thumbs.db",
            "*.pyc",
            "*.class",
            "*.o",
            "*.obj",
            "package-lock.json",
            "*.lock",
        ];
        let binary_extensions = [
            "*.png", "*.jpg", "*.jpeg", "*.gif", "*.ico", "*.webp", "*.exe", "*.dll", "*.so",
            "*.dylib", "*.zip", "*.tar", "*.gz", "*.pdf", "*.db", "*.sqlite",
        ];

        let mut custom_ignore_rules = String::from("# Dependencies and build output\n");
        for pattern in common_patterns {
            custom_ignore_rules.push_str(pattern);
            custom_ignore_rules.push('\n');
        }
        custom_ignore_rules.push_str("# Binary files\n");
        for ext in binary_extensions {
            custom_ignore_rules.push_str(ext);
            custom_ignore_rules.push('\n');
        }

        Self {
            custom_ignore_rules,
            use_gitignore: true,
            use_custom_ignore: true,
            debounce_ms: 300,
            max_depth: crate::core::scanner::DEFAULT_MAX_DEPTH,
            scan_workers: 0,
            last_directory: None,
        }
    }
}
