//! Session runner: wires the loader, the websocket, the wall clock and the
//! engine together, then hands the frozen table to the CoB reconciler.
//!
//! The clock task is just another event producer: ALERT and FLATTEN enter the
//! same queue as market events, so nothing trades after FLATTEN has been
//! dequeued.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveTime};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::broker::{BrokerGateway, SocketEvent};
use crate::cob::CloseOfBusiness;
use crate::engine::loader::load_params;
use crate::engine::{Engine, EngineEvent};
use crate::models::Config;
use crate::storage::{LogService, STAGE_PRE_COB};

/// Today's session date key, exchange-local.
pub fn session_date() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// What the 1-second clock should enqueue at `now`.
fn clock_actions(
    now: NaiveTime,
    alert_pending: bool,
    alert_time: NaiveTime,
    cutoff_time: NaiveTime,
) -> (bool, bool) {
    let fire_flatten = now >= cutoff_time;
    let fire_alert = alert_pending && !fire_flatten && now >= alert_time;
    (fire_alert, fire_flatten)
}

/// Run one full account session: login, load, stream, flatten, reconcile.
pub async fn run_session<G>(cfg: Config, gateway: G) -> Result<()>
where
    G: BrokerGateway + 'static,
{
    let log = Arc::new(LogService::open(&cfg.database_path)?);
    let date = session_date();

    gateway.login().await.context("broker login failed")?;
    let positions = load_params(&cfg, &gateway, &log, &date).await?;

    if positions.is_empty() {
        error!("no params entries; nothing to trade");
        return Ok(());
    }
    if !positions.iter().any(|p| p.is_active()) {
        log.log_params(&cfg.account, &date, STAGE_PRE_COB, &positions)?;
        error!("no active params entries; session over before it started");
        return Ok(());
    }

    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<SocketEvent>();
    let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();

    gateway
        .start_socket(socket_tx.clone())
        .await
        .context("websocket start failed")?;

    // Socket callbacks feed the single writer queue.
    let forward_tx = engine_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = socket_rx.recv().await {
            if forward_tx.send(EngineEvent::Socket(event)).is_err() {
                break;
            }
        }
    });

    // The wall clock is the second producer.
    let clock_tx = engine_tx.clone();
    let (alert_time, cutoff_time) = (cfg.alert_time, cfg.cutoff_time);
    tokio::spawn(async move {
        let mut alert_pending = true;
        let mut ticker = interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let (fire_alert, fire_flatten) =
                clock_actions(Local::now().time(), alert_pending, alert_time, cutoff_time);
            if fire_alert {
                if clock_tx.send(EngineEvent::Alert).is_err() {
                    return;
                }
                alert_pending = false;
            }
            if fire_flatten {
                let _ = clock_tx.send(EngineEvent::Flatten);
                return;
            }
        }
    });

    // Explicit termination takes the same flatten path as the cutoff.
    let signal_tx = engine_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; flattening early");
            let _ = signal_tx.send(EngineEvent::Flatten);
        }
    });

    let mut engine = Engine::new(
        cfg.account.clone(),
        date.clone(),
        gateway,
        Arc::clone(&log),
        positions,
        socket_tx,
    );
    info!("session live for {} ({} rows)", cfg.account, engine.positions().len());
    engine.run(&mut engine_rx).await;

    let (positions, gateway) = engine.into_parts();
    log.log_params(&cfg.account, &date, STAGE_PRE_COB, &positions)?;

    let cob = CloseOfBusiness::new(cfg, date, positions, log);
    cob.run(&gateway).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    #[test]
    fn test_clock_idle_before_alert() {
        let (alert, flatten) = clock_actions(t(9, 15, 0), true, t(9, 30, 0), t(15, 15, 0));
        assert!(!alert);
        assert!(!flatten);
    }

    #[test]
    fn test_clock_fires_alert_once_window_opens() {
        let (alert, flatten) = clock_actions(t(9, 30, 0), true, t(9, 30, 0), t(15, 15, 0));
        assert!(alert);
        assert!(!flatten);
        // Already sent: stays quiet.
        let (alert, _) = clock_actions(t(9, 31, 0), false, t(9, 30, 0), t(15, 15, 0));
        assert!(!alert);
    }

    #[test]
    fn test_clock_fires_flatten_at_cutoff() {
        let (alert, flatten) = clock_actions(t(15, 15, 0), true, t(9, 30, 0), t(15, 15, 0));
        assert!(flatten);
        // Flatten preempts a late pending alert; nothing should enqueue
        // after it.
        assert!(!alert);
    }
}
