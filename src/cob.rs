//! Close-of-Business reconciler.
//!
//! Post-session bookkeeping over the frozen position table: the canonical
//! params snapshot, the broker-observed trades with realized P&L, and the
//! backtest accuracy replay over the day's one-minute candles. Every step
//! deletes its own prior records for (account, date) before inserting, so the
//! whole run is safe to repeat from the standalone `run-cob` binary.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::backtest::{replay, ReplayParams};
use crate::broker::types::OrderMsg;
use crate::broker::BrokerGateway;
use crate::models::{Config, OrderStatus, Position};
use crate::storage::{
    LogService, MtmRow, TradeLogRow, STAGE_COB, TRADE_TYPE_BACKTEST, TRADE_TYPE_BROKER,
};
use crate::ticks::read_tick_data;

pub struct CloseOfBusiness {
    cfg: Config,
    date: String,
    params: Vec<Position>,
    log: Arc<LogService>,
}

impl CloseOfBusiness {
    pub fn new(cfg: Config, date: String, params: Vec<Position>, log: Arc<LogService>) -> Self {
        Self {
            cfg,
            date,
            params,
            log,
        }
    }

    pub async fn run<G: BrokerGateway>(&self, gateway: &G) -> Result<()> {
        info!("CoB for {} / {}", self.cfg.account, self.date);
        self.store_params()?;
        self.store_broker_trades(gateway).await?;
        self.store_bt_trades()?;
        info!("CoB complete");
        Ok(())
    }

    /// Step 1: the full table as the session's canonical record.
    fn store_params(&self) -> Result<()> {
        if self.params.is_empty() {
            error!("no params to store");
            return Ok(());
        }
        self.log
            .log_params(&self.cfg.account, &self.date, STAGE_COB, &self.params)
    }

    /// Step 2: official fills from the final order book, one entry + exit
    /// pair per filled position, P&L on the exit leg.
    async fn store_broker_trades<G: BrokerGateway>(&self, gateway: &G) -> Result<()> {
        let order_book = match gateway.order_book().await {
            Some(book) => book,
            None => {
                warn!("final order book unavailable; broker trades not stored");
                return Ok(());
            }
        };
        let by_id: HashMap<&str, &OrderMsg> = order_book
            .iter()
            .map(|row| (row.order_no.as_str(), row))
            .collect();

        let mut rows = Vec::new();
        for p in &self.params {
            if !p.has_entry_fill() {
                continue;
            }
            let book_row = |id: &Option<String>| id.as_deref().and_then(|id| by_id.get(id).copied());

            let entry_price = book_row(&p.entry_order_id)
                .and_then(OrderMsg::entry_fill_price)
                .filter(|px| *px > 0.0)
                .or(p.entry_price);
            let Some(entry_price) = entry_price else {
                warn!("{}: filled entry without a price, skipped", p.scrip);
                continue;
            };

            rows.push(TradeLogRow {
                position_idx: p.index,
                scrip: p.scrip.clone(),
                model: p.model.clone(),
                direction: p.direction().to_string(),
                quantity: p.quantity,
                price: entry_price,
                trade_ts: p.entry_ts.unwrap_or_default(),
                pnl: None,
            });

            // Exit leg: the stop fill when the stop completed, else the
            // target fill. The book is authoritative over the frozen table
            // because the flatten path converts stops after the freeze.
            let sl_row = book_row(&p.sl_order_id);
            let target_row = book_row(&p.target_order_id);
            let sl_complete = sl_row.map(|r| r.status == "COMPLETE").unwrap_or(false)
                || p.sl_order_status == Some(OrderStatus::Complete);
            let target_complete = target_row.map(|r| r.status == "COMPLETE").unwrap_or(false)
                || p.target_order_status == Some(OrderStatus::Complete);

            let exit = if sl_complete {
                sl_row
                    .and_then(|r| r.avg_price().or_else(|| r.trigger_price()))
                    .filter(|px| *px > 0.0)
                    .or(p.sl_price)
                    .map(|px| (px, p.sl_ts))
            } else if target_complete {
                target_row
                    .and_then(OrderMsg::target_leg_price)
                    .filter(|px| *px > 0.0)
                    .or(p.target_price)
                    .map(|px| (px, p.target_ts))
            } else {
                None
            };

            let Some((exit_price, exit_ts)) = exit else {
                warn!("{}: no exit fill found for filled entry", p.scrip);
                continue;
            };
            let pnl = p.quantity as f64 * p.signal as f64 * (exit_price - entry_price);
            rows.push(TradeLogRow {
                position_idx: p.index,
                scrip: p.scrip.clone(),
                model: p.model.clone(),
                direction: if p.signal == 1 { "SELL" } else { "BUY" }.to_string(),
                quantity: p.quantity,
                price: exit_price,
                trade_ts: exit_ts.unwrap_or_default(),
                pnl: Some(pnl),
            });
        }

        self.log
            .replace_trades(&self.cfg.account, &self.date, TRADE_TYPE_BROKER, &rows)
    }

    /// Step 3: replay the session per filled position for the accuracy
    /// comparison; rows whose entry never filled are skipped.
    fn store_bt_trades(&self) -> Result<()> {
        let mut trade_rows = Vec::new();
        let mut mtm_rows = Vec::new();

        for p in &self.params {
            if !p.has_entry_fill() {
                continue;
            }
            let (Some(entry_ts), Some(entry_price)) = (p.entry_ts, p.entry_price) else {
                continue;
            };
            let candles = match read_tick_data(&self.cfg.tick_data_path(&p.scrip)) {
                Ok(candles) => candles,
                Err(e) => {
                    error!("{}: tick data unavailable, replay skipped: {:#}", p.scrip, e);
                    continue;
                }
            };
            let outcome = replay(
                &ReplayParams {
                    signal: p.signal,
                    quantity: p.quantity,
                    entry_ts,
                    entry_price,
                    target: p.target,
                    tick: p.tick,
                    sl_pct: p.sl_pct,
                    trail_sl_pct: p.trail_sl_pct,
                },
                &candles,
            );

            if let Some(trade) = outcome.trade {
                info!(
                    "{}: replay exit {} at {:.2} (live pnl basis {:.2})",
                    p.scrip,
                    trade.exit_reason.as_str(),
                    trade.exit_price,
                    trade.pnl
                );
                trade_rows.push(TradeLogRow {
                    position_idx: p.index,
                    scrip: p.scrip.clone(),
                    model: p.model.clone(),
                    direction: p.direction().to_string(),
                    quantity: p.quantity,
                    price: trade.entry_price,
                    trade_ts: trade.entry_ts,
                    pnl: None,
                });
                trade_rows.push(TradeLogRow {
                    position_idx: p.index,
                    scrip: p.scrip.clone(),
                    model: p.model.clone(),
                    direction: if p.signal == 1 { "SELL" } else { "BUY" }.to_string(),
                    quantity: p.quantity,
                    price: trade.exit_price,
                    trade_ts: trade.exit_ts,
                    pnl: Some(trade.pnl),
                });
            }
            mtm_rows.extend(outcome.mtm.iter().map(|point| MtmRow {
                scrip: p.scrip.clone(),
                minute_ts: point.ts,
                mtm: point.value,
            }));
        }

        self.log.replace_trades(
            &self.cfg.account,
            &self.date,
            TRADE_TYPE_BACKTEST,
            &trade_rows,
        )?;
        self.log
            .replace_mtm(&self.cfg.account, &self.date, TRADE_TYPE_BACKTEST, &mtm_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::PaperGateway;
    use crate::models::{ActiveFlag, EntryRow};
    use chrono::NaiveTime;
    use std::io::Write;
    use std::path::Path;

    fn config(dir: &Path) -> Config {
        Config {
            account: "ACCT".to_string(),
            data_dir: dir.to_path_buf(),
            tick_data_dir: dir.to_path_buf(),
            database_path: dir.join("t.db"),
            alert_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            cutoff_time: NaiveTime::from_hms_opt(15, 15, 0).unwrap(),
            broker: None,
        }
    }

    fn filled_position() -> Position {
        let mut p = Position::from_entry(
            0,
            EntryRow {
                scrip: "NSE_ACME".to_string(),
                symbol: "ACME-EQ".to_string(),
                exchange: "NSE".to_string(),
                token: "22".to_string(),
                model: "gspcV2".to_string(),
                signal: 1,
                quantity: 10,
                target: 110.0,
                tick: 0.05,
                sl_pct: 1.0,
                trail_sl_pct: 0.5,
            },
        );
        p.entry_order_id = Some("2001".to_string());
        p.entry_order_status = Some(OrderStatus::Complete);
        p.entry_price = Some(100.0);
        p.entry_ts = Some(1_700_000_015);
        p.sl_order_id = Some("2002".to_string());
        p.sl_order_status = Some(OrderStatus::Canceled);
        p.sl_price = Some(99.0);
        p.target_order_id = Some("2003".to_string());
        p.target_order_status = Some(OrderStatus::Complete);
        p.target_price = Some(110.0);
        p.target_ts = Some(1_700_000_200);
        p.active = ActiveFlag::No;
        p
    }

    fn book_for(p: &Position) -> Vec<OrderMsg> {
        vec![
            OrderMsg {
                order_no: "2001".to_string(),
                status: "COMPLETE".to_string(),
                avgprc: Some("100.10".to_string()),
                ..Default::default()
            },
            OrderMsg {
                order_no: "2002".to_string(),
                status: "CANCELED".to_string(),
                trgprc: Some(format!("{:.2}", p.sl_price.unwrap())),
                ..Default::default()
            },
            OrderMsg {
                order_no: "2003".to_string(),
                status: "COMPLETE".to_string(),
                prc: Some("110.00".to_string()),
                ..Default::default()
            },
        ]
    }

    fn write_ticks(dir: &Path) {
        let mut f = std::fs::File::create(dir.join("NSE_ACME.csv")).unwrap();
        f.write_all(
            b"time,open,high,low,close\n\
              1700000040,100,101,99.5,100.5\n\
              1700000100,100.5,110.5,100,109\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_cob_persists_all_three_records() {
        let dir = tempfile::tempdir().unwrap();
        write_ticks(dir.path());
        let cfg = config(dir.path());
        let log = Arc::new(LogService::open(&cfg.database_path).unwrap());
        let p = filled_position();
        let gateway = PaperGateway::new();
        gateway.set_order_book(Some(book_for(&p)));

        let cob = CloseOfBusiness::new(cfg, "2023-11-01".to_string(), vec![p], Arc::clone(&log));
        cob.run(&gateway).await.unwrap();

        let snapshot = log.load_params("ACCT", "2023-11-01", STAGE_COB).unwrap();
        assert_eq!(snapshot.len(), 1);

        let broker = log.trades("ACCT", "2023-11-01", TRADE_TYPE_BROKER).unwrap();
        assert_eq!(broker.len(), 2);
        // Official fill from the book, not the optimistic table value.
        assert_eq!(broker[0].price, 100.10);
        assert_eq!(broker[0].direction, "BUY");
        assert_eq!(broker[1].direction, "SELL");
        // pnl = 10 * 1 * (110.00 - 100.10)
        assert!((broker[1].pnl.unwrap() - 99.0).abs() < 1e-9);

        let bt = log.trades("ACCT", "2023-11-01", TRADE_TYPE_BACKTEST).unwrap();
        assert_eq!(bt.len(), 2);
        // The replay reaches the 110 target from the table's entry price.
        assert!((bt[1].price - 110.0).abs() < 1e-9);
        assert!((bt[1].pnl.unwrap() - 100.0).abs() < 1e-9);

        let mtm = log.mtm("ACCT", "2023-11-01", TRADE_TYPE_BACKTEST).unwrap();
        assert!(!mtm.is_empty());
    }

    #[tokio::test]
    async fn test_cob_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_ticks(dir.path());
        let cfg = config(dir.path());
        let log = Arc::new(LogService::open(&cfg.database_path).unwrap());
        let p = filled_position();
        let gateway = PaperGateway::new();
        gateway.set_order_book(Some(book_for(&p)));

        let cob = CloseOfBusiness::new(cfg, "2023-11-01".to_string(), vec![p], Arc::clone(&log));
        cob.run(&gateway).await.unwrap();
        cob.run(&gateway).await.unwrap();

        assert_eq!(log.trades("ACCT", "2023-11-01", TRADE_TYPE_BROKER).unwrap().len(), 2);
        assert_eq!(log.trades("ACCT", "2023-11-01", TRADE_TYPE_BACKTEST).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unfilled_rows_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        write_ticks(dir.path());
        let cfg = config(dir.path());
        let log = Arc::new(LogService::open(&cfg.database_path).unwrap());
        // Entry never triggered: INVALID row stays out of both trade logs.
        let mut p = filled_position();
        p.entry_order_id = None;
        p.entry_order_status = Some(OrderStatus::Invalid);
        p.entry_price = None;
        p.entry_ts = None;
        let gateway = PaperGateway::new();

        let cob = CloseOfBusiness::new(cfg, "2023-11-01".to_string(), vec![p], Arc::clone(&log));
        cob.run(&gateway).await.unwrap();

        assert!(log.trades("ACCT", "2023-11-01", TRADE_TYPE_BROKER).unwrap().is_empty());
        assert!(log.trades("ACCT", "2023-11-01", TRADE_TYPE_BACKTEST).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sl_exit_is_preferred_when_stop_completed() {
        let dir = tempfile::tempdir().unwrap();
        write_ticks(dir.path());
        let cfg = config(dir.path());
        let log = Arc::new(LogService::open(&cfg.database_path).unwrap());
        let mut p = filled_position();
        p.sl_order_status = Some(OrderStatus::Complete);
        p.sl_ts = Some(1_700_000_150);
        p.target_order_status = Some(OrderStatus::Canceled);
        let mut book = book_for(&p);
        book[1].status = "COMPLETE".to_string();
        book[1].avgprc = Some("98.95".to_string());
        book[2].status = "CANCELED".to_string();
        let gateway = PaperGateway::new();
        gateway.set_order_book(Some(book));

        let cob = CloseOfBusiness::new(cfg, "2023-11-01".to_string(), vec![p], Arc::clone(&log));
        cob.run(&gateway).await.unwrap();

        let broker = log.trades("ACCT", "2023-11-01", TRADE_TYPE_BROKER).unwrap();
        assert_eq!(broker.len(), 2);
        assert!((broker[1].price - 98.95).abs() < 1e-9);
        assert!(broker[1].pnl.unwrap() < 0.0);
    }
}
