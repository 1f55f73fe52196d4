use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use context_file_tree::app::{ProjectService, TreeEvent};
use context_file_tree::config::provider::SettingsStore;
use context_file_tree::core::tree;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "context-file-tree")]
#[command(version)]
#[command(about = "Scan project trees with layered ignore rules", long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tree of a project as JSON
    List {
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Do not apply the root .gitignore, even if settings enable it
        #[arg(long)]
        no_gitignore: bool,

        /// Do not apply the custom ignore rules, even if settings enable them
        #[arg(long)]
        no_custom_ignore: bool,

        /// Print an ASCII tree without ignored entries instead of JSON
        #[arg(long)]
        ascii: bool,
    },

    /// Show which files a set of rules would ignore
    Preview {
        #[arg(default_value = ".")]
        root: PathBuf,

        /// Rules text, one per line, or `@path` to read them from a file
        #[arg(short, long)]
        rules: String,
    },

    /// Watch a project and report every rebuilt tree
    Watch {
        #[arg(default_value = ".")]
        root: PathBuf,

        #[arg(long)]
        no_gitignore: bool,

        #[arg(long)]
        no_custom_ignore: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(SettingsStore::open(cli.config.clone())?);
    let config = store.snapshot();
    let (events_tx, events_rx) = broadcast::channel::<TreeEvent>(64);
    let service = ProjectService::new(store.clone(), &config, events_tx);

    match cli.command {
        Commands::List {
            root,
            no_gitignore,
            no_custom_ignore,
            ascii,
        } => {
            let options = config
                .scan_options()
                .with_overrides(no_gitignore, no_custom_ignore);
            let snapshot = service
                .list_files(&root, options.use_gitignore, options.use_custom_ignore)
                .await?;
            remember_directory(&store, &snapshot.root);
            if ascii {
                if let Some(node) = snapshot.root_node() {
                    print!("{}", tree::render_ascii(node, false));
                }
            } else {
                println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            }
        }
        Commands::Preview { root, rules } => {
            let rules = match rules.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("Could not read rules from {path}"))?,
                None => rules,
            };
            let preview = service.test_ignore_rules(&root, &rules).await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
        Commands::Watch {
            root,
            no_gitignore,
            no_custom_ignore,
        } => {
            let options = config
                .scan_options()
                .with_overrides(no_gitignore, no_custom_ignore);
            let root = service.watch(&root, options)?;
            remember_directory(&store, &root);
            watch_until_interrupted(&root, events_rx).await?;
            service.unwatch();
        }
    }

    Ok(())
}

async fn watch_until_interrupted(
    watched: &Path,
    mut events: broadcast::Receiver<TreeEvent>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(event) if event.root() != watched => {
                    tracing::debug!("Ignoring event for {}", event.root().display());
                }
                Ok(TreeEvent::TreeUpdated(snapshot)) => println!(
                    "{} generation {}: {} files, {} warnings",
                    snapshot.root.display(),
                    snapshot.generation,
                    tree::count_files(&snapshot.nodes),
                    snapshot.warnings.len()
                ),
                Ok(TreeEvent::RescanFailed { root, message }) => {
                    eprintln!("{}: rescan failed: {}", root.display(), message);
                }
                Ok(TreeEvent::WatchStopped { root, reason }) => {
                    eprintln!("{}: watch stopped: {}", root.display(), reason);
                    return Ok(());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} stale tree events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

fn remember_directory(store: &SettingsStore, root: &Path) {
    let root = root.to_path_buf();
    if let Err(e) = store.update(|config| config.last_directory = Some(root)) {
        tracing::warn!("Could not save last directory: {}", e);
    }
}

