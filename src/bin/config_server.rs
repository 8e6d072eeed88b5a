//! Config replica member binary

use clap::{Parser, Subcommand};
use minicatalog::common::{Config, MemberSpec, StorageKind};
use minicatalog::CatalogServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minicatalog-config")]
#[command(about = "minicatalog config replica member")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one member of the config replica set
    Serve {
        /// Member ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Data directory
        #[arg(long)]
        data: Option<PathBuf>,

        /// Replica set name
        #[arg(long)]
        set_name: Option<String>,

        /// Replica set members as id=url (repeat or comma-separate)
        #[arg(long = "member", value_delimiter = ',')]
        members: Vec<String>,

        /// Keep the log in memory only
        #[arg(long)]
        in_memory: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // File and MINICATALOG__* environment first, CLI flags override
    let mut config = Config::load(cli.config.as_deref())?;

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
            data,
            set_name,
            members,
            in_memory,
        } => {
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.server.bind_addr = bind.parse()?;
            }
            if let Some(data) = data {
                config.server.data_dir = data;
            }
            if let Some(set_name) = set_name {
                config.server.set_name = set_name;
            }
            if !members.is_empty() {
                config.server.members = members
                    .iter()
                    .map(|m| MemberSpec::parse(m))
                    .collect::<minicatalog::Result<_>>()?;
            }
            if in_memory {
                config.server.storage = StorageKind::Memory;
            }

            let server = CatalogServer::from_config(config)?;
            server.serve().await?;
        }
    }

    Ok(())
}
