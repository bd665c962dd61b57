//! Folio sync server binary

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use folio::auth::TokenTable;
use folio::server::Server;

/// Folio sync server - per-tenant authoritative event stores
#[derive(Parser)]
#[command(name = "folio-server")]
#[command(version = "0.1.0")]
#[command(about = "Folio sync server - per-tenant authoritative event stores")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:4915")]
    listen: SocketAddr,

    /// Data directory (default: ~/.folio/server)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Token table JSON file: {"<token>": "<user_id>"}
    #[arg(short, long)]
    tokens: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("could not determine home directory")?
            .join(".folio")
            .join("server"),
    };

    let auth = match &args.tokens {
        Some(path) => {
            let table = TokenTable::load(path)
                .with_context(|| format!("failed to load token table {}", path.display()))?;
            info!(tokens = table.len(), "Loaded token table");
            table
        }
        None => {
            warn!("No token table given; every request will be unauthorized");
            TokenTable::default()
        }
    };

    let server = Server::bind(args.listen, data_dir, Arc::new(auth))
        .await
        .context("failed to bind sync server")?;
    server.run().await?;
    Ok(())
}
