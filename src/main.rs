use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use pathwatch::{PathWatcherManager, Settings, WatchOptions};

/// Watch directories and print change batches as they arrive.
#[derive(Parser)]
#[command(name = "pathwatch")]
#[command(about = "Consolidated filesystem watching")]
struct Cli {
    /// Directories to watch (overlapping paths share one OS watch)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Batch window in milliseconds (overrides config)
    #[arg(short, long)]
    batch_window_ms: Option<u64>,

    /// Print the coverage tree after attaching
    #[arg(long)]
    dump_tree: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load().context("failed to load configuration")?;
    if let Some(window) = cli.batch_window_ms {
        settings.batch_window_ms = window;
    }
    pathwatch::logging::init_with_config(&settings.logging);

    let manager = PathWatcherManager::new(&settings);

    let mut watchers = Vec::new();
    let mut subscriptions = Vec::new();
    for path in &cli.paths {
        let watcher = manager
            .watch(path.clone(), WatchOptions::default())
            .await
            .with_context(|| format!("failed to watch {}", path.display()))?;

        let label = path.display().to_string();
        subscriptions.push(watcher.on_did_change(move |events| {
            for event in events {
                match &event.old_path {
                    Some(old) => {
                        println!("[{label}] {} {} (was {})", event.action, event.path.display(), old.display());
                    }
                    None => println!("[{label}] {} {}", event.action, event.path.display()),
                }
            }
        }));
        let label = path.display().to_string();
        subscriptions.push(watcher.on_did_error(move |err| {
            eprintln!("[{label}] error: {err}");
        }));
        watchers.push(watcher);
    }

    if cli.dump_tree {
        print!("{}", manager.dump_tree());
    }
    eprintln!(
        "watching {} paths with {} OS watches, ctrl-c to stop",
        cli.paths.len(),
        manager.native_count()
    );

    tokio::signal::ctrl_c().await?;

    drop(subscriptions);
    for watcher in &watchers {
        watcher.dispose();
    }
    manager.stop_all().await;
    Ok(())
}
