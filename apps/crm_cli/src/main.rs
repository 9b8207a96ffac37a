use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::SETTINGS_FILE, load_settings_from, CacheSource, Cached, CompositeLoad, CrmSession,
    MoveOutcome, PipelineBoard,
};
use serde_json::Value;
use shared::domain::{DealId, PipelineId, StageId};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = SETTINGS_FILE)]
    config: PathBuf,
    /// Overrides the configured API base url.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the deal board of a pipeline.
    Board {
        #[arg(long)]
        pipeline: i64,
        #[arg(long)]
        refresh: bool,
    },
    /// Move a deal to another stage.
    Move {
        #[arg(long)]
        pipeline: i64,
        #[arg(long)]
        deal: i64,
        #[arg(long)]
        stage: i64,
    },
    /// Company dashboard (profile and stats), or the customer one.
    Dashboard {
        #[arg(long)]
        customer: bool,
        #[arg(long)]
        refresh: bool,
    },
    Team {
        #[arg(long)]
        role: Option<String>,
    },
    Invite {
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "sales")]
        role: String,
    },
    /// Deal totals and win rate across the caller's companies.
    Stats,
    /// Drop everything cached for this login.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings_from(&cli.config);
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    if cli.token.is_some() {
        settings.access_token = cli.token;
    }
    let session = CrmSession::from_settings(&settings).await?;

    match cli.command {
        Command::Board { pipeline, refresh } => {
            let pipeline = PipelineId(pipeline);
            let board = if refresh {
                session.refresh_board(pipeline).await?
            } else {
                session.load_board(pipeline).await?
            };
            print_board(&board);
        }
        Command::Move {
            pipeline,
            deal,
            stage,
        } => {
            session.load_board(PipelineId(pipeline)).await?;
            match session.move_deal(DealId(deal), StageId(stage)).await {
                MoveOutcome::Committed(deal) => println!(
                    "deal {} moved to {} ({}%)",
                    deal.id,
                    deal.stage_name.as_deref().unwrap_or("?"),
                    deal.probability
                ),
                MoveOutcome::RolledBack { message, .. } => bail!("{message}"),
                MoveOutcome::Ignored(reason) => println!("nothing to do: {reason:?}"),
            }
        }
        Command::Dashboard { customer, refresh } => {
            let load = match (customer, refresh) {
                (false, false) => session.load_company_dashboard().await,
                (false, true) => session.refresh_company_dashboard().await,
                (true, false) => session.load_customer_dashboard().await,
                (true, true) => session.refresh_customer_dashboard().await,
            };
            print_composite(load)?;
        }
        Command::Team { role } => {
            let filters: Vec<(&str, &str)> = role
                .as_deref()
                .map(|role| vec![("role", role)])
                .unwrap_or_default();
            let team = session.company_team(&filters).await?;
            note_source(&team);
            for member in &team.value.team_members {
                println!(
                    "{:>5}  {:<30} {:<12} {}",
                    member.id, member.email, member.role, member.full_name
                );
            }
            println!("{} member(s)", team.value.count);
        }
        Command::Invite { email, role } => {
            let response = session.invite_team_member(email, role).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Stats => {
            let stats = session.deal_stats().await?;
            note_source(&stats);
            println!(
                "total value {:.2}, win rate {:.1}%, average deal {:.2}",
                stats.value.total_deals_value,
                stats.value.win_rate_percent,
                stats.value.average_deal_size
            );
        }
        Command::Logout => {
            session.logout().await;
            println!("cache cleared");
        }
    }

    Ok(())
}

fn note_source<T>(cached: &Cached<T>) {
    if cached.source == CacheSource::StaleFallback {
        warn!("cli: backend unreachable, showing cached data");
    }
}

fn print_board(board: &Cached<PipelineBoard>) {
    note_source(board);
    for column in board.value.columns() {
        println!(
            "== {} ({}%) - {} deal(s), {:.2}",
            column.stage.name,
            column.stage.win_probability_percent,
            column.deals.len(),
            column.total_value()
        );
        for deal in &column.deals {
            println!(
                "   #{:<6} {:<40} {:>12.2} {}",
                deal.id.0, deal.title, deal.value, deal.currency
            );
        }
    }
}

fn print_composite(load: CompositeLoad) -> Result<()> {
    let state = load.screen_state();
    let load = load.into_screen_result()?;
    println!("screen state: {state:?}");

    let mut results: Vec<_> = load.iter().collect();
    results.sort_by_key(|(key, _)| key.to_string());
    for (key, result) in results {
        match result {
            Ok(cached) => {
                let value: &Value = &cached.value;
                println!("{key}: {}", serde_json::to_string_pretty(value)?);
            }
            Err(err) => println!("{key}: {}", err.user_message("Failed to load")),
        }
    }
    Ok(())
}
