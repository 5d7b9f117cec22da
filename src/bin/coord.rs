//! Coordinator binary

use clap::{Parser, Subcommand};
use minishard::{Config, Coordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minishard-coord")]
#[command(about = "minishard coordinator with an in-process replica cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and its local nodes
    Serve {
        /// Coordinator ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Number of replica nodes to run in-process
        #[arg(long)]
        nodes: Option<usize>,

        /// Directory for persistent cluster state
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File and environment first, CLI flags win.
    let mut config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            nodes,
            db,
        } => {
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind;
            }
            if let Some(nodes) = nodes {
                config.coordinator.local_nodes = nodes;
            }
            if db.is_some() {
                config.coordinator.db_path = db;
            }
            config.validate()?;

            Coordinator::new(config).serve().await?;
        }
    }

    Ok(())
}
