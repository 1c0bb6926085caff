//! Close-of-Business CLI: re-run the reconciler for an account and date.
//!
//! Loads the frozen table the session stored at flatten (stage `Pre-COB`),
//! then repeats the three CoB steps. Safe to run any number of times; each
//! step replaces its own records for the (account, date) pair.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bracketbot::broker::noren::NorenGateway;
use bracketbot::broker::paper::PaperGateway;
use bracketbot::broker::retry::Retrying;
use bracketbot::broker::BrokerGateway;
use bracketbot::cob::CloseOfBusiness;
use bracketbot::engine::session::session_date;
use bracketbot::models::Config;
use bracketbot::storage::{LogService, STAGE_COB, STAGE_PRE_COB};

#[derive(Debug, Parser)]
#[command(name = "run-cob", about = "Re-run Close-of-Business reconciliation")]
struct Cli {
    /// Trading account id.
    #[arg(long, env = "ACCOUNT")]
    account: String,

    /// Session date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    date: Option<String>,

    /// Reconcile without broker access (no final order book).
    #[arg(long)]
    offline: bool,
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
    let date = cli.date.unwrap_or_else(session_date);

    let log = Arc::new(LogService::open(&cfg.database_path)?);
    // Prefer the flatten-time snapshot; fall back to a prior COB run.
    let mut params = log.load_params(&cfg.account, &date, STAGE_PRE_COB)?;
    if params.is_empty() {
        params = log.load_params(&cfg.account, &date, STAGE_COB)?;
    }
    if params.is_empty() {
        bail!("no stored params for {} / {}", cfg.account, date);
    }
    info!("reconciling {} positions for {} / {}", params.len(), cfg.account, date);

    let cob = CloseOfBusiness::new(cfg.clone(), date, params, log);
    if cli.offline || cfg.broker.is_none() {
        // The paper gateway serves an empty book; broker trades are skipped.
        cob.run(&Retrying::new(PaperGateway::new())).await
    } else {
        let creds = cfg.broker.clone().context("broker credentials missing")?;
        let gateway = Retrying::new(NorenGateway::new(creds));
        gateway.login().await.context("broker login failed")?;
        cob.run(&gateway).await
    }
}
