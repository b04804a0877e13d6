mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use swr_core::{epoch, PageId};
use swr_sync::{SurveySync, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "swr-cli", version)]
#[command(about = "Sync survey action fields into per-page wide reporting tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the survey schema and layout registry if missing
    Init,
    /// Report layout, watermark and counts for one survey page
    RefreshInfo {
        #[arg(long)]
        page_id: PageId,
    },
    /// List survey pages with records newer than their watermark
    StalePages {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run one pass over a page starting at `since`
    ProcessPage {
        #[arg(long)]
        page_id: PageId,
        /// `YYYY-MM-DD HH:MM:SS`; defaults to 1900-01-01 00:00:00
        #[arg(long, value_parser = parse_since)]
        since: Option<NaiveDateTime>,
    },
    /// Scan for stale pages and process or dispatch each one
    ProcessStale {
        #[arg(long)]
        limit: Option<usize>,
        /// Hand pages to the configured worker instead of running them here
        #[arg(long = "async")]
        use_async_worker: bool,
    },
}

fn parse_since(raw: &str) -> Result<NaiveDateTime, String> {
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .ok_or_else(|| format!("expected YYYY-MM-DD HH:MM:SS, got '{raw}'"))
}

async fn run(command: Commands) -> Result<Value> {
    let config = SyncConfig::from_env()?;
    let engine = SurveySync::connect(&config)
        .await
        .context("failed to open sync engine")?;

    let value = match command {
        Commands::Init => {
            engine.init().await?;
            json!({"outcome": "initialized"})
        }
        Commands::RefreshInfo { page_id } => serde_json::to_value(engine.refresh_info(page_id).await?)?,
        Commands::StalePages { limit } => {
            let limit = limit.unwrap_or(config.stale_limit);
            serde_json::to_value(engine.find_stale_pages(limit).await?)?
        }
        Commands::ProcessPage { page_id, since } => {
            let since = since.unwrap_or_else(epoch);
            serde_json::to_value(engine.process_page(page_id, since).await?)?
        }
        Commands::ProcessStale {
            limit,
            use_async_worker,
        } => {
            let limit = limit.unwrap_or(config.stale_limit);
            serde_json::to_value(engine.process_stale_pages(limit, use_async_worker).await?)?
        }
    };
    Ok(value)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let command = cli.command.unwrap_or(Commands::ProcessStale {
        limit: None,
        use_async_worker: false,
    });

    match run(command).await {
        Ok(value) => {
            println!("{value:#}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            println!("{:#}", json!({ "error": err.root_cause().to_string() }));
            ExitCode::FAILURE
        }
    }
}
