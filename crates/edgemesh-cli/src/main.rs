mod config;
mod serve_cmd;
mod status_cmd;
mod streams;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use edgemesh_core::bus::EventBus;
use edgemesh_core::coordinator::{Coordinator, CoordinatorConfig};
use edgemesh_core::monitor::{self, MonitorConfig};
use edgemesh_db::pool;

use config::EdgeMeshConfig;

#[derive(Parser)]
#[command(name = "edgemesh", about = "Coordinator for a LAN pool of worker nodes")]
struct Cli {
    /// Store file path (overrides EDGE_MESH_STORE_PATH env var)
    #[arg(long, global = true)]
    store_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an edgemesh config file
    Init {
        /// Shared secret agents must present (omit for open endpoints)
        #[arg(long, conflicts_with = "generate_secret")]
        secret: Option<String>,
        /// Generate a random shared secret
        #[arg(long)]
        generate_secret: bool,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the coordinator: HTTP surface plus background monitors
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
    /// Show cluster and job status
    Status,
}

/// Execute the `edgemesh init` command: write the config file.
fn cmd_init(
    store_path: Option<&str>,
    secret: Option<String>,
    generate_secret: bool,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let store = store_path
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| {
            edgemesh_db::config::StoreConfig::default_path()
                .to_string_lossy()
                .into_owned()
        });
    let shared_secret = if generate_secret {
        Some(config::generate_shared_secret())
    } else {
        secret
    };

    let cfg = config::ConfigFile {
        store: config::StoreSection {
            path: store.clone(),
        },
        auth: config::AuthSection {
            shared_secret: shared_secret.clone(),
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  store.path = {store}");
    match &shared_secret {
        Some(secret) if secret.len() > 16 => {
            println!(
                "  auth.shared_secret = {}...{}",
                &secret[..8],
                &secret[secret.len() - 8..]
            );
        }
        Some(_) => println!("  auth.shared_secret = (set)"),
        None => println!("  auth.shared_secret = (none, agent endpoints open)"),
    }
    println!();
    println!("Next: run `edgemesh serve` to start the coordinator.");

    Ok(())
}

/// Open the store, run migrations, and build the coordinator.
async fn build_coordinator(
    resolved: &EdgeMeshConfig,
) -> anyhow::Result<(sqlx::SqlitePool, Arc<Coordinator>)> {
    let db_pool = pool::create_pool(&resolved.store_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let coordinator = Arc::new(Coordinator::new(
        db_pool.clone(),
        EventBus::new(),
        CoordinatorConfig::from_env(),
    ));
    Ok((db_pool, coordinator))
}

/// Execute the `edgemesh serve` command.
async fn cmd_serve(cli_store_path: Option<&str>, bind: &str, port: u16) -> anyhow::Result<()> {
    let resolved = EdgeMeshConfig::resolve(cli_store_path)?;
    let (db_pool, coordinator) = build_coordinator(&resolved).await?;

    let cancel = CancellationToken::new();
    let monitors = monitor::spawn_monitors(
        Arc::clone(&coordinator),
        MonitorConfig::from_env(),
        cancel.clone(),
    );

    let state = serve_cmd::AppState {
        coordinator,
        shared_secret: resolved.shared_secret,
    };
    let result = serve_cmd::run_serve(state, bind, port, cancel).await;

    for handle in monitors {
        let _ = handle.await;
    }
    db_pool.close().await;
    result
}

/// Execute the `edgemesh status` command.
async fn cmd_status(cli_store_path: Option<&str>) -> anyhow::Result<()> {
    let resolved = EdgeMeshConfig::resolve(cli_store_path)?;
    let (db_pool, coordinator) = build_coordinator(&resolved).await?;

    let result = status_cmd::run_status(&coordinator).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            secret,
            generate_secret,
            force,
        } => cmd_init(cli.store_path.as_deref(), secret, generate_secret, force),
        Commands::Serve { bind, port } => {
            cmd_serve(cli.store_path.as_deref(), &bind, port).await
        }
        Commands::Status => cmd_status(cli.store_path.as_deref()).await,
    }
}
