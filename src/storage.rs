//! Sqlite-backed log service: session snapshots and trade records.
//!
//! Three tables keyed by (account, date) with delete-then-insert replace
//! semantics so every writer is idempotent:
//!   - `params_hist`: full position-table snapshots per stage (BOD, Post-BOD,
//!     Pre-COB, COB), one JSON payload per row.
//!   - `trade_log`: entry/exit trade rows, broker-observed or backtested.
//!   - `trades_mtm`: per-minute mark-to-market from the CoB replay.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::models::Position;

pub const TRADE_TYPE_BROKER: &str = "BROKER";
pub const TRADE_TYPE_BACKTEST: &str = "BACKTEST";

pub const STAGE_BOD: &str = "BOD";
pub const STAGE_POST_BOD: &str = "Post-BOD";
pub const STAGE_PRE_COB: &str = "Pre-COB";
pub const STAGE_COB: &str = "COB";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS params_hist (
    account      TEXT NOT NULL,
    cob_date     TEXT NOT NULL,
    stage        TEXT NOT NULL,
    position_idx INTEGER NOT NULL,
    payload      TEXT NOT NULL,
    PRIMARY KEY (account, cob_date, stage, position_idx)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS trade_log (
    account      TEXT NOT NULL,
    trade_date   TEXT NOT NULL,
    trade_type   TEXT NOT NULL,
    position_idx INTEGER NOT NULL,
    scrip        TEXT NOT NULL,
    model        TEXT NOT NULL,
    direction    TEXT NOT NULL,
    quantity     INTEGER NOT NULL,
    price        REAL NOT NULL,
    trade_ts     INTEGER NOT NULL,
    pnl          REAL
);

CREATE INDEX IF NOT EXISTS idx_trade_log_day
    ON trade_log(account, trade_date, trade_type);

CREATE TABLE IF NOT EXISTS trades_mtm (
    account      TEXT NOT NULL,
    trade_date   TEXT NOT NULL,
    trade_type   TEXT NOT NULL,
    scrip        TEXT NOT NULL,
    minute_ts    INTEGER NOT NULL,
    mtm          REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_mtm_day
    ON trades_mtm(account, trade_date, trade_type);
"#;

/// One entry or exit record in `trade_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogRow {
    pub position_idx: usize,
    pub scrip: String,
    pub model: String,
    /// "BUY" / "SELL" for this leg.
    pub direction: String,
    pub quantity: u32,
    pub price: f64,
    pub trade_ts: i64,
    /// Populated on the exit leg only.
    pub pnl: Option<f64>,
}

/// One per-minute mark in `trades_mtm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtmRow {
    pub scrip: String,
    pub minute_ts: i64,
    pub mtm: f64,
}

pub struct LogService {
    conn: Mutex<Connection>,
}

impl LogService {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open database {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("schema init failed")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Snapshot the full position table for one stage of the session.
    pub fn log_params(
        &self,
        account: &str,
        date: &str,
        stage: &str,
        positions: &[Position],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM params_hist WHERE account = ?1 AND cob_date = ?2 AND stage = ?3",
            params![account, date, stage],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO params_hist (account, cob_date, stage, position_idx, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for position in positions {
                let payload = serde_json::to_string(position)?;
                stmt.execute(params![account, date, stage, position.index as i64, payload])?;
            }
        }
        tx.commit()?;
        info!(
            account,
            date, stage, "stored params snapshot ({} rows)", positions.len()
        );
        Ok(())
    }

    /// Load a stage snapshot back, ordered by position index.
    pub fn load_params(&self, account: &str, date: &str, stage: &str) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM params_hist
             WHERE account = ?1 AND cob_date = ?2 AND stage = ?3
             ORDER BY position_idx",
        )?;
        let rows = stmt.query_map(params![account, date, stage], |row| {
            row.get::<_, String>(0)
        })?;
        let mut positions = Vec::new();
        for payload in rows {
            positions.push(serde_json::from_str(&payload?)?);
        }
        Ok(positions)
    }

    /// Replace the day's trade rows for one trade type.
    pub fn replace_trades(
        &self,
        account: &str,
        date: &str,
        trade_type: &str,
        rows: &[TradeLogRow],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM trade_log WHERE account = ?1 AND trade_date = ?2 AND trade_type = ?3",
            params![account, date, trade_type],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trade_log
                 (account, trade_date, trade_type, position_idx, scrip, model,
                  direction, quantity, price, trade_ts, pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for row in rows {
                stmt.execute(params![
                    account,
                    date,
                    trade_type,
                    row.position_idx as i64,
                    row.scrip,
                    row.model,
                    row.direction,
                    row.quantity,
                    row.price,
                    row.trade_ts,
                    row.pnl,
                ])?;
            }
        }
        tx.commit()?;
        info!(
            account,
            date, trade_type, "stored {} trade rows", rows.len()
        );
        Ok(())
    }

    pub fn trades(&self, account: &str, date: &str, trade_type: &str) -> Result<Vec<TradeLogRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT position_idx, scrip, model, direction, quantity, price, trade_ts, pnl
             FROM trade_log
             WHERE account = ?1 AND trade_date = ?2 AND trade_type = ?3
             ORDER BY position_idx, trade_ts",
        )?;
        let rows = stmt.query_map(params![account, date, trade_type], |row| {
            Ok(TradeLogRow {
                position_idx: row.get::<_, i64>(0)? as usize,
                scrip: row.get(1)?,
                model: row.get(2)?,
                direction: row.get(3)?,
                quantity: row.get::<_, i64>(4)? as u32,
                price: row.get(5)?,
                trade_ts: row.get(6)?,
                pnl: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Replace the day's mark-to-market curve for one trade type.
    pub fn replace_mtm(
        &self,
        account: &str,
        date: &str,
        trade_type: &str,
        rows: &[MtmRow],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM trades_mtm WHERE account = ?1 AND trade_date = ?2 AND trade_type = ?3",
            params![account, date, trade_type],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO trades_mtm (account, trade_date, trade_type, scrip, minute_ts, mtm)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for row in rows {
                stmt.execute(params![
                    account,
                    date,
                    trade_type,
                    row.scrip,
                    row.minute_ts,
                    row.mtm
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mtm(&self, account: &str, date: &str, trade_type: &str) -> Result<Vec<MtmRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT scrip, minute_ts, mtm FROM trades_mtm
             WHERE account = ?1 AND trade_date = ?2 AND trade_type = ?3
             ORDER BY scrip, minute_ts",
        )?;
        let rows = stmt.query_map(params![account, date, trade_type], |row| {
            Ok(MtmRow {
                scrip: row.get(0)?,
                minute_ts: row.get(1)?,
                mtm: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}
