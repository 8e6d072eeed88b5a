//! CLI for catalog administration

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use reqwest::StatusCode;
use serde_json::{json, Value};

/// Leader redirects followed before giving up
const MAX_REDIRECTS: usize = 5;

#[derive(Parser)]
#[command(name = "minicatalog")]
#[command(about = "minicatalog config server CLI")]
#[command(version)]
struct Cli {
    /// Any member of the config replica set
    #[arg(long, default_value = "http://localhost:7000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a shard by connection target (set/host:port,...)
    AddShard { target: String },

    /// Drop cached routing for a namespace
    FlushRouting { namespace: String },

    /// Drop cached database info
    FlushDatabase { db: String },

    /// Ensure the sessions collection and refresh the session cache
    RefreshSessions,

    /// Make a member the leader
    StepUp { member: String },

    /// Restart a member
    Restart {
        member: String,

        /// Wipe the member's durable state first
        #[arg(long)]
        wipe: bool,

        /// Return before the member has rejoined
        #[arg(long)]
        no_wait: bool,
    },

    /// Insert a JSON document directly on the config replica set
    Insert {
        namespace: String,
        /// Document as JSON
        document: String,
    },

    /// Create a database on the least loaded shard
    CreateDatabase { name: String },

    /// Shard a collection
    ShardCollection { namespace: String },

    /// List registered shards
    Shards,

    /// Show cluster status
    Status,
}

/// Send a command, following `NotPrimary` leader hints.
async fn send(
    client: &reqwest::Client,
    base: &str,
    path: &str,
    body: Option<Value>,
) -> anyhow::Result<Value> {
    let mut base = base.trim_end_matches('/').to_string();
    for _ in 0..=MAX_REDIRECTS {
        let url = format!("{}{}", base, path);
        let request = match &body {
            Some(body) => client.post(&url).json(body),
            None => client.get(&url),
        };
        let response = request.send().await?;
        let status = response.status();
        let reply: Value = response.json().await?;

        if status == StatusCode::TEMPORARY_REDIRECT {
            match reply.get("leaderUrl").and_then(Value::as_str) {
                Some(leader) => {
                    tracing::debug!(leader, "following leader hint");
                    base = leader.trim_end_matches('/').to_string();
                    continue;
                }
                None => bail!("no primary available: {}", errmsg(&reply)),
            }
        }
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = reply.get("code").and_then(Value::as_str).unwrap_or("Unknown");
            bail!("{}: {}", code, errmsg(&reply));
        }
        return Ok(reply);
    }
    Err(anyhow!("too many leader redirects"))
}

fn errmsg(reply: &Value) -> &str {
    reply
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let (path, body) = match cli.command {
        Commands::AddShard { target } => ("/admin/addShard", Some(json!({ "addShard": target }))),
        Commands::FlushRouting { namespace } => (
            "/admin/flushRoutingTableCacheUpdates",
            Some(json!({ "namespace": namespace })),
        ),
        Commands::FlushDatabase { db } => {
            ("/admin/flushDatabaseCacheUpdates", Some(json!({ "db": db })))
        }
        Commands::RefreshSessions => ("/admin/refreshLogicalSessionCacheNow", Some(json!({}))),
        Commands::StepUp { member } => ("/admin/stepUp", Some(json!({ "member": member }))),
        Commands::Restart {
            member,
            wipe,
            no_wait,
        } => (
            "/admin/restart",
            Some(json!({
                "member": member,
                "preserveState": !wipe,
                "wait": !no_wait,
            })),
        ),
        Commands::Insert {
            namespace,
            document,
        } => {
            let document: Value = serde_json::from_str(&document)?;
            (
                "/admin/insert",
                Some(json!({ "namespace": namespace, "document": document })),
            )
        }
        Commands::CreateDatabase { name } => {
            ("/admin/createDatabase", Some(json!({ "name": name })))
        }
        Commands::ShardCollection { namespace } => (
            "/admin/shardCollection",
            Some(json!({ "namespace": namespace })),
        ),
        Commands::Shards => ("/admin/shards", None),
        Commands::Status => ("/admin/status", None),
    };

    let reply = send(&client, &cli.server, path, body).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);

    Ok(())
}
