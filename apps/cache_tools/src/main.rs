use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use client_core::config::{load_settings, prepare_database_url};
use storage::{KeyValueStore, Storage};

#[derive(Parser, Debug)]
struct Cli {
    /// Cache database; defaults to the configured one.
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List cached keys with their age.
    List,
    /// Delete every key starting with a prefix (e.g. `company_team`).
    Purge {
        #[arg(long)]
        prefix: String,
    },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let raw_database_url = cli
        .database_url
        .or_else(|| load_settings().cache_database_url)
        .unwrap_or_else(|| "sqlite://./data/crm_cache.db".to_string());
    let database_url = prepare_database_url(&raw_database_url)?;
    let storage = Storage::new(&database_url).await?;

    match cli.command {
        Command::List => {
            let now = Utc::now();
            for entry in storage.entries().await? {
                let age_ms = now
                    .signed_duration_since(entry.fetched_at)
                    .num_milliseconds();
                let state = if age_ms < entry.ttl_ms { "fresh" } else { "stale" };
                println!(
                    "{:<40} {:>8}s {:<5} {} bytes",
                    entry.key,
                    age_ms / 1000,
                    state,
                    entry.value_json.len()
                );
            }
        }
        Command::Purge { prefix } => {
            let removed = storage.remove_prefix(&prefix).await?;
            println!("removed {removed} entries with prefix '{prefix}'");
        }
        Command::Clear => {
            let removed = storage.clear().await?;
            println!("removed {removed} entries");
        }
    }

    Ok(())
}
