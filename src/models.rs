//! Core data model: the per-position record, its lifecycle enums, and the
//! engine configuration loaded from the environment.
//!
//! One `Position` row exists per line of the day's entries file; the row index
//! in the table is the stable key that round-trips through the broker inside
//! the order `remarks` tag.

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle flag for a position row.
///
/// `Y` = working, `N` = closed or invalid, `S` = a trailing-SL modify was
/// rejected by the broker; the row stays exposed until the session cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveFlag {
    #[serde(rename = "Y")]
    Yes,
    #[serde(rename = "N")]
    No,
    #[serde(rename = "S")]
    SlRejected,
}

impl fmt::Display for ActiveFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveFlag::Yes => write!(f, "Y"),
            ActiveFlag::No => write!(f, "N"),
            ActiveFlag::SlRejected => write!(f, "S"),
        }
    }
}

/// Broker-native order status, plus the engine-assigned `INVALID` for entries
/// whose signal strength was non-positive at the first quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "TRIGGER_PENDING")]
    TriggerPending,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "INVALID")]
    Invalid,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(OrderStatus::Open),
            "TRIGGER_PENDING" => Some(OrderStatus::TriggerPending),
            "COMPLETE" => Some(OrderStatus::Complete),
            // Both spellings show up in broker payloads.
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "PENDING" => Some(OrderStatus::Pending),
            "INVALID" => Some(OrderStatus::Invalid),
            _ => None,
        }
    }

}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Open => "OPEN",
            OrderStatus::TriggerPending => "TRIGGER_PENDING",
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Invalid => "INVALID",
        };
        write!(f, "{}", s)
    }
}

/// One row of the `<ACCOUNT>-Entries.csv` predictions file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRow {
    pub scrip: String,
    pub symbol: String,
    pub exchange: String,
    pub token: String,
    pub model: String,
    /// +1 buy, -1 sell
    pub signal: i32,
    pub quantity: u32,
    pub target: f64,
    pub tick: f64,
    pub sl_pct: f64,
    pub trail_sl_pct: f64,
}

/// A position row: one candidate trade and the state of its three order legs.
///
/// Mutated exclusively by the event processor while the socket is live, frozen
/// at flatten, read-only for the CoB reconciler afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Stable table index; round-trips through the broker in `remarks`.
    pub index: usize,

    pub scrip: String,
    pub symbol: String,
    pub exchange: String,
    pub token: String,
    pub model: String,
    pub signal: i32,
    pub quantity: u32,
    pub target: f64,
    pub tick: f64,
    pub sl_pct: f64,
    pub trail_sl_pct: f64,

    /// `Some("-1")` between bracket placement and the first order update.
    pub entry_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub target_order_id: Option<String>,

    pub entry_order_status: Option<OrderStatus>,
    pub sl_order_status: Option<OrderStatus>,
    pub target_order_status: Option<OrderStatus>,

    pub entry_price: Option<f64>,
    pub sl_price: Option<f64>,
    pub target_price: Option<f64>,

    pub entry_ts: Option<i64>,
    pub sl_ts: Option<i64>,
    pub target_ts: Option<i64>,

    /// `signal * (target - ltp)` at evaluation time.
    pub strength: Option<f64>,
    pub sl_update_cnt: u32,
    pub active: ActiveFlag,
}

impl Position {
    pub fn from_entry(index: usize, row: EntryRow) -> Self {
        Self {
            index,
            scrip: row.scrip,
            symbol: row.symbol,
            exchange: row.exchange,
            token: row.token,
            model: row.model,
            signal: row.signal,
            quantity: row.quantity,
            target: row.target,
            tick: row.tick,
            sl_pct: row.sl_pct,
            trail_sl_pct: row.trail_sl_pct,
            entry_order_id: None,
            sl_order_id: None,
            target_order_id: None,
            entry_order_status: None,
            sl_order_status: None,
            target_order_status: None,
            entry_price: None,
            sl_price: None,
            target_price: None,
            entry_ts: None,
            sl_ts: None,
            target_ts: None,
            strength: None,
            sl_update_cnt: 0,
            active: ActiveFlag::Yes,
        }
    }

    /// Subscription key: `{exchange}|{token}`.
    pub fn instrument_key(&self) -> String {
        format!("{}|{}", self.exchange, self.token)
    }

    pub fn is_active(&self) -> bool {
        self.active == ActiveFlag::Yes
    }

    /// A row that still has live broker legs at cutoff: working, or parked in
    /// the SL-modify-rejected state.
    pub fn is_exposed(&self) -> bool {
        matches!(self.active, ActiveFlag::Yes | ActiveFlag::SlRejected)
    }

    pub fn has_entry_fill(&self) -> bool {
        self.entry_ts.is_some() && self.entry_order_status == Some(OrderStatus::Complete)
    }

    /// "BUY" / "SELL" for the entry leg.
    pub fn direction(&self) -> &'static str {
        if self.signal == 1 {
            "BUY"
        } else {
            "SELL"
        }
    }
}

/// Engine configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Trading account id (`ACCOUNT`).
    pub account: String,
    /// Directory holding `<ACCOUNT>-Entries.csv`.
    pub data_dir: PathBuf,
    /// One-minute candle files for the CoB backtest, one `<scrip>.csv` each.
    pub tick_data_dir: PathBuf,
    /// Sqlite database path.
    pub database_path: PathBuf,
    /// Post-BOD snapshot/alert time, local exchange clock.
    pub alert_time: NaiveTime,
    /// Hard session cutoff: flatten everything at this local time.
    pub cutoff_time: NaiveTime,
    pub broker: Option<BrokerCredentials>,
}

/// Credentials for the Noren (Shoonya) broker binding.
#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub user_id: String,
    pub password: String,
    pub api_key: String,
    pub vendor_code: String,
    pub imei: String,
    /// Second factor (TOTP/PAN) supplied by the operator's secret store.
    pub factor2: String,
    pub base_url: String,
    pub ws_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let account = std::env::var("ACCOUNT").context("ACCOUNT env var is required")?;
        if account.trim().is_empty() {
            bail!("ACCOUNT env var is empty");
        }

        let data_dir = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| "./generated".to_string())
            .into();
        let tick_data_dir = std::env::var("TICK_DATA_DIR")
            .unwrap_or_else(|_| "./tick-data".to_string())
            .into();
        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./bracketbot.db".to_string())
            .into();

        let alert_time = parse_hhmm(
            &std::env::var("ALERT_TIME").unwrap_or_else(|_| "09:30".to_string()),
        )
        .context("invalid ALERT_TIME")?;
        let cutoff_time = parse_hhmm(
            &std::env::var("CUTOFF_TIME").unwrap_or_else(|_| "15:15".to_string()),
        )
        .context("invalid CUTOFF_TIME")?;

        Ok(Self {
            account,
            data_dir,
            tick_data_dir,
            database_path,
            alert_time,
            cutoff_time,
            broker: BrokerCredentials::from_env(),
        })
    }

    pub fn entries_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}-Entries.csv", self.account))
    }

    pub fn tick_data_path(&self, scrip: &str) -> PathBuf {
        Path::new(&self.tick_data_dir).join(format!("{}.csv", scrip))
    }
}

impl BrokerCredentials {
    /// `None` when any required variable is missing; the caller then falls
    /// back to the paper gateway.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            user_id: std::env::var("NOREN_USER").ok()?,
            password: std::env::var("NOREN_PASSWORD").ok()?,
            api_key: std::env::var("NOREN_API_KEY").ok()?,
            vendor_code: std::env::var("NOREN_VENDOR_CODE").ok()?,
            imei: std::env::var("NOREN_IMEI").unwrap_or_else(|_| "bracketbot".to_string()),
            factor2: std::env::var("NOREN_FACTOR2").ok()?,
            base_url: std::env::var("NOREN_BASE_URL")
                .unwrap_or_else(|_| "https://api.shoonya.com/NorenWClientTP".to_string()),
            ws_url: std::env::var("NOREN_WS_URL")
                .unwrap_or_else(|_| "wss://api.shoonya.com/NorenWSTP/".to_string()),
        })
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> EntryRow {
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
        }
    }

    #[test]
    fn test_position_from_entry_starts_clean() {
        let p = Position::from_entry(3, entry());
        assert_eq!(p.index, 3);
        assert_eq!(p.active, ActiveFlag::Yes);
        assert_eq!(p.sl_update_cnt, 0);
        assert!(p.entry_order_id.is_none());
        assert!(p.strength.is_none());
        assert_eq!(p.instrument_key(), "NSE|22");
    }

    #[test]
    fn test_active_flag_serializes_as_single_letter() {
        let json = serde_json::to_string(&ActiveFlag::SlRejected).unwrap();
        assert_eq!(json, "\"S\"");
        let back: ActiveFlag = serde_json::from_str("\"Y\"").unwrap();
        assert_eq!(back, ActiveFlag::Yes);
    }

    #[test]
    fn test_order_status_parse_accepts_both_cancel_spellings() {
        assert_eq!(OrderStatus::parse("CANCELLED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::parse("CANCELED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::parse("bogus"), None);
    }

    #[test]
    fn test_position_round_trips_through_json() {
        let mut p = Position::from_entry(0, entry());
        p.entry_order_id = Some("23110100001".to_string());
        p.entry_order_status = Some(OrderStatus::Complete);
        p.entry_price = Some(100.25);
        p.active = ActiveFlag::No;

        let json = serde_json::to_string(&p).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.entry_order_id.as_deref(), Some("23110100001"));
        assert_eq!(back.entry_order_status, Some(OrderStatus::Complete));
        assert_eq!(back.active, ActiveFlag::No);
    }
}
