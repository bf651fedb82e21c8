//! Deprecation watch CLI
//!
//! Local and CI entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use deprecations::{
    cache::{CacheStorage, FileSystemStorage},
    config,
    error::Result,
    pipeline::{self, ChangeDetector},
    storage::{DeprecationStore, JsonStore},
    utils::{self, fs},
};

/// Deprecation watch - AI model deprecation feed builder
#[derive(Parser, Debug)]
#[command(
    name = "deprecations",
    version,
    about = "Collects AI model deprecation notices into a cached, deduplicated feed"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "data/config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape all configured providers, merge, and publish the feed
    Run,

    /// Print records changed between two snapshots
    Changes {
        /// Previously published snapshot
        #[arg(long)]
        previous: PathBuf,

        /// Current snapshot
        #[arg(long)]
        current: PathBuf,

        /// Write the changed records here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// List stored deprecations
    List {
        /// Only this provider (case-insensitive)
        #[arg(long)]
        provider: Option<String>,
    },

    /// Inspect or clear the cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Validate the configuration file
    Validate,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show backend, location and size
    Info,
    /// Remove every cached entry and HTTP response
    Clear,
}

/// Initialize logging based on verbosity flag. `RUST_LOG` wins over the flag;
/// the run report follows whatever level results.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
    utils::log::init(log::max_level());
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = config::load_config(&cli.config)?;
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Run => {
            let backend = config::select_cache_backend(&config.cache);
            let cache = config::build_cache_manager(&backend, &config.cache);
            let http = config::build_http_cache(&backend, &config.cache, &config.http)?;
            let store: Arc<dyn DeprecationStore> = Arc::new(JsonStore::new(&config.paths.data_dir));
            let scrapers = pipeline::build_scrapers(&config, &http, &cache);

            let report = pipeline::run_pipeline(&config, &backend, &cache, store, &scrapers).await?;
            println!("{}", report.health_report);

            if let Some(keys) = &report.cache_action {
                println!("cache-path={}", keys.path.display());
                println!("cache-key={}", keys.key);
                println!("cache-restore-keys={}", keys.restore_keys.join(","));
            }

            if report.result.all_failed() {
                log::error!(
                    "All {} scrapers failed",
                    report.result.total_scrapers
                );
                std::process::exit(2);
            }
        }

        Command::Changes {
            previous,
            current,
            output,
        } => {
            let previous = ChangeDetector::load_previous(&previous).await;
            let current = ChangeDetector::load_previous(&current).await;
            let changes = ChangeDetector::new().detect(&current, &previous);
            log::info!(
                "{} changed, {} unchanged",
                changes.change_count(),
                changes.unchanged
            );

            match output {
                Some(path) => fs::write_json(&path, &changes.changed).await?,
                None => println!("{}", serde_json::to_string_pretty(&changes.changed)?),
            }
        }

        Command::List { provider } => {
            let store = JsonStore::new(&config.paths.data_dir);
            let records = match provider {
                Some(name) => store.get_by_provider(&name).await?,
                None => store.get_all().await?,
            };
            for record in &records {
                println!("{record}");
            }
            log::info!("{} deprecations", records.len());
        }

        Command::Cache { action } => {
            let backend = config::select_cache_backend(&config.cache);
            match action {
                CacheAction::Info => {
                    let info = backend.info().await?;
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                CacheAction::Clear => {
                    let removed = backend.shared().clear().await?;
                    let http_removed = FileSystemStorage::new(&config.cache.http_dir).clear().await?;
                    log::info!("Removed {removed} cache entries and {http_removed} HTTP responses");
                }
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            config.validate()?;
            log::info!("✓ Config OK ({} providers)", config.providers.len());
        }
    }

    Ok(())
}
