mod cli;
mod commands;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use tapedeck_core::config::{load_dotenv, Config};
use tapedeck_store::{Database, PgRepository};

use crate::cli::{CliArgs, Command};

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = Config::from_env();
    if !config.postgres.is_configured() {
        anyhow::bail!("no database configured; set PG_URL or PG_USERNAME");
    }

    let db = Arc::new(Database::new(&config.postgres));
    let repo = PgRepository::new(db);
    let mut stdout = std::io::stdout().lock();

    match args.command {
        Command::Instances { action } => {
            commands::instances(&repo, &repo, action, args.json, &mut stdout).await
        }
        Command::Assignments { action } => {
            commands::assignments(&repo, action, args.json, &mut stdout).await
        }
    }
}
