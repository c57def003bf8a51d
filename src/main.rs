//! dbkernel - plugin and driver host for a database client.
//!
//! Usage:
//!   dbkernel plugins list                  Show the plugin catalog
//!   dbkernel plugins install <ID>          Install a catalogued plugin
//!   dbkernel plugins start [ID]            Start one or all enabled plugins
//!   dbkernel drivers list                  Show the driver repository
//!   dbkernel drivers load <DIR>            Load every driver package in DIR
//!   dbkernel drivers download <DATABASE>   Fetch and load a driver
//!   dbkernel --help                        Show help

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail, eyre};
use tracing_subscriber::EnvFilter;

use dbkernel_core::{EventBus, HostConfig, ModuleRegistry};
use dbkernel_loader::{
    DriverRegistry, DriverRepository, DynamicModuleLoader, InlineExecutor, LocalFetcher,
    WorkerPool,
};
use dbkernel_plugin::PluginManager;

#[derive(Parser)]
#[command(
    name = "dbkernel",
    version,
    about = "Plugin and driver host for a database client",
    long_about = "dbkernel manages the plugin catalog and loads database drivers from \
                  external packages.\n\n\
                  Data lives below --root in `plugins/` and `drivers/`. Set RUST_LOG \
                  for diagnostics."
)]
struct Cli {
    /// Directory holding `plugins/` and `drivers/`
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Output format
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Manage database drivers
    Drivers {
        #[command(subcommand)]
        action: DriverAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List catalogued plugins
    List {
        /// Only show plugins in this category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Install a catalogued plugin
    Install {
        id: String,

        /// Package to install from, overriding the catalog entry
        #[arg(short, long)]
        package: Option<PathBuf>,
    },

    /// Stop and uninstall a plugin
    Uninstall { id: String },

    /// Enable a plugin
    Enable { id: String },

    /// Stop and disable a plugin
    Disable { id: String },

    /// Start one plugin, or every enabled plugin
    Start {
        id: Option<String>,

        /// Seconds to keep plugins running before shutting down
        #[arg(short = 't', long, default_value = "0")]
        run_for: u64,
    },
}

#[derive(Subcommand)]
enum DriverAction {
    /// List the driver repository
    List,

    /// Load every driver package in a directory
    Load { dir: PathBuf },

    /// Fetch a driver from the repository and load it
    Download { database: String },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Everything the commands share, built once.
struct Host {
    config: HostConfig,
    loader: Arc<DynamicModuleLoader>,
    manager: PluginManager,
}

impl Host {
    fn new(root: &Path) -> Self {
        let config = HostConfig::rooted_at(root);
        let events = Arc::new(EventBus::new());
        events.subscribe(EventBus::ALL, |event| {
            tracing::debug!(kind = event.kind(), ?event, "event");
        });

        let drivers = Arc::new(DriverRegistry::new());
        let loader = Arc::new(
            DynamicModuleLoader::new(&config.host_exports, drivers).with_events(events.clone()),
        );
        let manager = PluginManager::new(
            config.clone(),
            loader.clone(),
            Arc::new(ModuleRegistry::new()),
            WorkerPool::current(),
            events,
        );
        manager.load_manifest();

        Self {
            config,
            loader,
            manager,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let host = Host::new(&cli.root);

    let outcome = match cli.command {
        Command::Plugins { action } => run_plugins(&host, action, cli.format).await,
        Command::Drivers { action } => run_drivers(&host, action, cli.format).await,
    };

    host.manager.shutdown().await;
    outcome
}

async fn run_plugins(host: &Host, action: PluginAction, format: OutputFormat) -> Result<()> {
    let manager = &host.manager;
    match action {
        PluginAction::List { category } => {
            let plugins = match category {
                Some(category) => manager.plugins_in_category(&category),
                None => manager.plugins(),
            };
            match format {
                OutputFormat::Text => {
                    println!();
                    println!("{}", "─".repeat(70));
                    println!(" {:<24} {:<10} {:<14} {:<10}", "ID", "VERSION", "CATEGORY", "STATUS");
                    println!("{}", "─".repeat(70));
                    for plugin in &plugins {
                        println!(
                            " {:<24} {:<10} {:<14} {:<10}",
                            truncate(&plugin.id, 24),
                            plugin.version,
                            truncate(&plugin.category, 14),
                            plugin.status
                        );
                    }
                    println!();
                    println!(" {} plugin(s)", plugins.len());
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plugins)?),
            }
        }
        PluginAction::Install { id, package } => {
            let mut descriptor = manager
                .plugin(&id)
                .ok_or_else(|| eyre!("No plugin '{id}' in the catalog"))?;
            if let Some(package) = package {
                descriptor.package_path = Some(package);
            }
            if !manager.install_plugin(descriptor).context("Install failed")? {
                bail!("Package for '{id}' not found in {}", host.config.plugin_dir.display());
            }
            eprintln!("Installed {id}");
        }
        PluginAction::Uninstall { id } => {
            manager.uninstall_plugin(&id).await.context("Uninstall failed")?;
            eprintln!("Uninstalled {id}");
        }
        PluginAction::Enable { id } => {
            if !manager.enable_plugin(&id)? {
                bail!("No plugin '{id}' in the catalog");
            }
            eprintln!("Enabled {id}");
        }
        PluginAction::Disable { id } => {
            if !manager.disable_plugin(&id).await? {
                bail!("No plugin '{id}' in the catalog");
            }
            eprintln!("Disabled {id}");
        }
        PluginAction::Start { id, run_for } => {
            let results = match id {
                Some(id) => {
                    let started = manager.start_plugin(&id).await;
                    vec![(id, started)]
                }
                None => manager.start_all_enabled_plugins().await,
            };
            if run_for > 0 {
                tokio::time::sleep(Duration::from_secs(run_for)).await;
            }
            for (id, started) in &results {
                let status = manager
                    .status(id)
                    .map_or_else(|| "unknown".to_string(), |s| s.to_string());
                println!(" {:<24} {:<8} {}", id, if *started { "started" } else { "skipped" }, status);
            }
        }
    }
    Ok(())
}

async fn run_drivers(host: &Host, action: DriverAction, format: OutputFormat) -> Result<()> {
    let driver_dir = &host.config.driver_dir;
    match action {
        DriverAction::List => {
            let repository = DriverRepository::load_or_seed(host.config.repository_path())
                .context("Failed to read driver repository")?;
            match format {
                OutputFormat::Text => {
                    println!();
                    for entry in repository.entries() {
                        let marker = if DriverRepository::is_downloaded(driver_dir, entry) {
                            "✓"
                        } else {
                            " "
                        };
                        println!(
                            " {marker} {:<14} {:<36} {}",
                            entry.database_name, entry.driver_unit, entry.package_file_name
                        );
                    }
                    println!();
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(repository.entries())?)
                }
            }
        }
        DriverAction::Load { dir } => {
            let pool = WorkerPool::current();
            let (tx, rx) = tokio::sync::oneshot::channel();
            let task = host.loader.load_all_packages_async(
                dir,
                &pool,
                Arc::new(InlineExecutor),
                |progress| {
                    eprintln!(
                        "[{}/{}] {}",
                        progress.current_index,
                        progress.total,
                        progress.current_file.display()
                    );
                },
                move |result| {
                    let _ = tx.send(result);
                },
            );
            task.await.context("Driver loading task failed")?;
            let result = rx.await.context("Driver loading finished without a result")?;

            match format {
                OutputFormat::Text => {
                    println!("{}", result.message);
                    for id in &result.loaded_identifiers {
                        println!("   {id}");
                    }
                    for failure in &result.unit_failures {
                        println!(" ! {failure}");
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }
        DriverAction::Download { database } => {
            let repository = DriverRepository::load_or_seed(host.config.repository_path())
                .context("Failed to read driver repository")?;
            let load = repository
                .download(&database, driver_dir, &LocalFetcher, &host.loader)
                .await
                .with_context(|| format!("Failed to download driver for {database}"))?;
            println!("Loaded {} driver(s) from {}", load.handles.len(), load.package.display());
            for id in load.identifiers() {
                println!("   {id}");
            }
        }
    }
    Ok(())
}

/// Truncate a string to fit within max_len characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}
