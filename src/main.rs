//! run-engine: start one intraday execution session for one account.
//!
//! Logs in, loads the day's entries against the broker order book, runs the
//! single-writer event loop until the 15:15 cutoff (or an interrupt), then
//! hands off to the Close-of-Business reconciler. One process per account.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bracketbot::broker::noren::NorenGateway;
use bracketbot::broker::paper::PaperGateway;
use bracketbot::broker::retry::Retrying;
use bracketbot::engine::session::run_session;
use bracketbot::models::Config;

#[derive(Debug, Parser)]
#[command(name = "run-engine", about = "Start an intraday execution session")]
struct Cli {
    /// Trading account id.
    #[arg(long, env = "ACCOUNT")]
    account: String,

    /// Dry-run against the in-process paper gateway (no broker access).
    #[arg(long)]
    paper: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    std::env::set_var("ACCOUNT", &cli.account);
    let cfg = Config::from_env()?;

    info!("=====================================================");
    info!("starting engine for {}", cfg.account);
    let started = std::time::Instant::now();

    if cli.paper || cfg.broker.is_none() {
        if !cli.paper {
            info!("no broker credentials found; falling back to paper mode");
        }
        run_session(cfg, Retrying::new(PaperGateway::new())).await?;
    } else {
        let creds = cfg.broker.clone().context("broker credentials missing")?;
        run_session(cfg, Retrying::new(NorenGateway::new(creds))).await?;
    }

    info!("engine finished in {:.1}s", started.elapsed().as_secs_f64());
    info!("=====================================================");
    Ok(())
}
