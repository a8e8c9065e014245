//! Save Sync - Main entry point
//!
//! Command-line frontend for the save sync engine.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use save_sync::backup::BackupStore;
use save_sync::config::Config;
use save_sync::control::{Controller, ControllerSettings, Frontend, ManualOutcome};
use save_sync::engine::{EngineOptions, ReconcileOutcome, SyncEngine, SyncResult};
use save_sync::events::{SyncEvent, Trigger};
use save_sync::registry::{Direction, PairRegistry, Side};
use save_sync::utils;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;

/// Config files looked up in the working directory when `--config` is absent
const DEFAULT_CONFIG_FILES: [&str; 2] = ["save-sync.toml", "config.json"];

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured games
    List,

    /// Overwrite one side of a game with the other, after confirmation
    Sync {
        /// Game name or 0-based index
        game: String,

        #[arg(short, long, value_enum)]
        direction: DirectionArg,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Sync every game from its newer side
    Reconcile,

    /// Reconcile, then keep syncing on changes until interrupted
    Watch,

    /// List backups of both sides of a game, newest first
    Backups {
        game: String,
    },

    /// Copy a backup back over one side of a game
    Restore {
        backup: PathBuf,

        game: String,

        #[arg(short, long, value_enum)]
        side: SideArg,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DirectionArg {
    SourceToDest,
    DestToSource,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::SourceToDest => Direction::SourceToDest,
            DirectionArg::DestToSource => Direction::DestToSource,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SideArg {
    Source,
    Dest,
}

impl From<SideArg> for Side {
    fn from(arg: SideArg) -> Self {
        match arg {
            SideArg::Source => Side::Source,
            SideArg::Dest => Side::Dest,
        }
    }
}

/// Terminal frontend: y/N prompts on stdin, events on stdout
struct ConsoleFrontend {
    assume_yes: bool,
}

impl Frontend for ConsoleFrontend {
    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        print!("{}\nProceed? [y/N] ", message);
        let _ = io::stdout().flush();

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }

    fn notify(&self, event: &SyncEvent) {
        // Manual outcomes are printed by the command that asked for them
        if !is_manual(event) {
            println!("{}", event);
        }
    }
}

fn is_manual(event: &SyncEvent) -> bool {
    match event {
        SyncEvent::SyncStarted { trigger, .. } | SyncEvent::SyncFailed { trigger, .. } => {
            *trigger == Trigger::Manual
        }
        SyncEvent::SyncCompleted(report) => report.trigger == Trigger::Manual,
        SyncEvent::SyncDeclined { .. } => true,
        _ => false,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.clone().or_else(default_config_path);
    let config = Config::load(config_path.as_deref())
        .with_context(|| match &config_path {
            Some(path) => format!("loading {}", path.display()),
            None => "loading default configuration".to_string(),
        })?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting save-sync v{} ({} games)",
        env!("CARGO_PKG_VERSION"),
        config.games.len()
    );

    let registry = Arc::new(PairRegistry::from_config(&config.games)?);
    let engine = SyncEngine::new(
        Arc::clone(&registry),
        BackupStore::new(),
        EngineOptions::from(&config.sync),
    );

    match args.command {
        Commands::List => {
            if registry.is_empty() {
                println!("No games configured");
            }
            for (index, pair) in registry.pairs().iter().enumerate() {
                println!("{:>3}  {}", index, pair.name);
                println!("     {}: {}", config.labels.source, pair.source_path.display());
                println!("     {}: {}", config.labels.dest, pair.dest_path.display());
            }
        }

        Commands::Sync {
            game,
            direction,
            yes,
        } => {
            let pair = registry.resolve(&game)?;
            let index = registry
                .pairs()
                .iter()
                .position(|p| p.name == pair.name)
                .context("resolved pair missing from registry")?;

            let frontend = Arc::new(ConsoleFrontend { assume_yes: yes });
            let (controller, task) = Controller::spawn(engine, frontend, ControllerSettings::from(&config));

            let outcome = controller.manual_sync(index, direction.into()).await;
            drop(controller);
            let _ = task.await;

            match outcome? {
                ManualOutcome::Completed(report) => println!("{}", report),
                ManualOutcome::Declined => println!("Cancelled, nothing was changed"),
            }
        }

        Commands::Reconcile => {
            let results = engine.reconcile_all().await;
            print_results(&results);
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                bail!("{} of {} games failed to reconcile", failed, results.len());
            }
        }

        Commands::Watch => {
            if registry.is_empty() {
                bail!("No games configured, nothing to watch");
            }

            let frontend = Arc::new(ConsoleFrontend { assume_yes: false });
            let (controller, task) = Controller::spawn(engine, frontend, ControllerSettings::from(&config));

            let results = controller.start_auto_reconcile().await?;
            print_results(&results);
            tracing::info!("Watching {} games, press Ctrl+C to stop", registry.len());

            shutdown_signal().await;

            tracing::info!("Shutting down...");
            controller.stop_auto_reconcile().await?;
            drop(controller);
            if let Err(e) = task.await {
                tracing::error!("Controller task failed: {}", e);
            }
            tracing::info!("Watcher stopped");
        }

        Commands::Backups { game } => {
            let pair = registry.resolve(&game)?;
            for (side, label) in [(Side::Source, &config.labels.source), (Side::Dest, &config.labels.dest)] {
                let backups = engine.backups().list(pair.path(side))?;
                println!("{} ({}): {} backups", label, pair.path(side).display(), backups.len());
                for entry in backups {
                    let created = chrono::DateTime::from_timestamp(entry.created, 0)
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| entry.created.to_string());
                    println!("  {}  {}", created, entry.path.display());
                }
            }
        }

        Commands::Restore {
            backup,
            game,
            side,
            yes,
        } => {
            let pair = registry.resolve(&game)?.clone();
            let side = Side::from(side);
            let message = format!(
                "Replace {} with backup {}?\nThe current contents are backed up first.",
                pair.path(side).display(),
                backup.display()
            );

            let frontend = ConsoleFrontend { assume_yes: yes };
            let confirmed = tokio::task::spawn_blocking(move || frontend.confirm(&message)).await?;
            if !confirmed {
                println!("Cancelled, nothing was changed");
                return Ok(());
            }

            let report = engine.restore_backup(&pair, side, &backup).await?;
            println!(
                "[{}] restored {} files from {} (previous contents saved to {})",
                report.pair,
                report.files,
                report.restored_from.display(),
                report.safety_backup.display()
            );
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
}

fn print_results(results: &[SyncResult]) {
    for result in results {
        match &result.outcome {
            Ok(ReconcileOutcome::Synced(report)) => println!("{}", report),
            Ok(ReconcileOutcome::InSync) => println!("[{}] already in sync", result.pair),
            Ok(ReconcileOutcome::BothEmpty) => println!("[{}] both sides empty", result.pair),
            Err(e) => println!("[{}] failed ({}): {}", result.pair, e.kind(), e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
