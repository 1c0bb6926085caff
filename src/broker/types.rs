//! Broker wire types.
//!
//! The Noren wire format carries every numeric field as a string; the structs
//! keep the raw strings and expose typed accessors so a half-populated payload
//! never aborts a callback.

use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wall-clock as epoch seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Broker timestamps come as `dd-mm-YYYY HH:MM:SS` in the exchange-local
/// clock; `"0"`, empty or unparseable values fall back to "now".
pub fn parse_exchange_ts(raw: &str) -> i64 {
    if raw.is_empty() || raw == "0" {
        return now_epoch();
    }
    match NaiveDateTime::parse_from_str(raw, "%d-%m-%Y %H:%M:%S") {
        Ok(naive) => Local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp())
            .unwrap_or_else(now_epoch),
        Err(_) => now_epoch(),
    }
}

fn parse_f64(raw: &Option<String>) -> Option<f64> {
    raw.as_deref().and_then(|s| s.trim().parse::<f64>().ok())
}

/// A market tick from the touchline feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteTick {
    /// Instrument token (`tk`).
    #[serde(rename = "tk")]
    pub token: String,
    /// Exchange segment (`e`).
    #[serde(rename = "e", default)]
    pub exchange: Option<String>,
    /// Last traded price (`lp`); absent on depth-only ticks.
    #[serde(rename = "lp", default)]
    pub lp: Option<String>,
    /// Feed time, epoch seconds (`ft`).
    #[serde(rename = "ft", default)]
    pub ft: Option<String>,
}

impl QuoteTick {
    pub fn ltp(&self) -> Option<f64> {
        parse_f64(&self.lp)
    }

    pub fn feed_ts(&self) -> i64 {
        self.ft
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or_else(now_epoch)
    }
}

/// An order-book row or a live order-update event. The broker uses the same
/// field set for both, so the classifier and the loader share this shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderMsg {
    /// Broker order number.
    #[serde(rename = "norenordno", default)]
    pub order_no: String,
    /// Native status string (`OPEN`, `TRIGGER_PENDING`, `COMPLETE`, ...).
    #[serde(default)]
    pub status: String,
    /// Engine correlation tag: `"<LEG>:<model>:<scrip>:<index>"`.
    #[serde(default)]
    pub remarks: Option<String>,
    /// Product type: `I` intraday, `B` bracket.
    #[serde(rename = "prd", default)]
    pub product: Option<String>,
    #[serde(rename = "prctyp", default)]
    pub price_type: Option<String>,
    #[serde(rename = "tsym", default)]
    pub symbol: Option<String>,
    #[serde(rename = "exch", default)]
    pub exchange: Option<String>,
    #[serde(rename = "qty", default)]
    pub quantity: Option<String>,
    /// Limit price.
    #[serde(rename = "prc", default)]
    pub prc: Option<String>,
    /// Average fill price.
    #[serde(rename = "avgprc", default)]
    pub avgprc: Option<String>,
    /// Stop trigger price.
    #[serde(rename = "trgprc", default)]
    pub trgprc: Option<String>,
    /// Bracket child-order number; present only on SL/target children.
    #[serde(rename = "snonum", default)]
    pub child_order_no: Option<String>,
    /// Bracket child type flag: `"1"` = stop-loss child, else target child.
    #[serde(rename = "snoordt", default)]
    pub child_order_type: Option<String>,
    /// Exchange timestamp `dd-mm-YYYY HH:MM:SS`.
    #[serde(rename = "exch_tm", default)]
    pub exchange_time: Option<String>,
    #[serde(rename = "rejreason", default)]
    pub reject_reason: Option<String>,
}

impl OrderMsg {
    pub fn price(&self) -> Option<f64> {
        parse_f64(&self.prc)
    }

    pub fn avg_price(&self) -> Option<f64> {
        parse_f64(&self.avgprc)
    }

    pub fn trigger_price(&self) -> Option<f64> {
        parse_f64(&self.trgprc)
    }

    /// Fill price for an entry leg: average price when filled, limit price
    /// otherwise.
    pub fn entry_fill_price(&self) -> Option<f64> {
        self.avg_price().or_else(|| self.price())
    }

    /// Price for a target leg: the limit price, falling back to the fill
    /// average when the limit comes back as zero.
    pub fn target_leg_price(&self) -> Option<f64> {
        match self.price() {
            Some(p) if p != 0.0 => Some(p),
            _ => self.avg_price(),
        }
    }

    pub fn event_ts(&self) -> i64 {
        parse_exchange_ts(self.exchange_time.as_deref().unwrap_or("0"))
    }

    pub fn is_bracket(&self) -> bool {
        self.product.as_deref() == Some("B")
    }
}

/// Order side on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionSide {
    Buy,
    Sell,
}

impl TransactionSide {
    pub fn from_signal(signal: i32) -> Self {
        if signal == 1 {
            TransactionSide::Buy
        } else {
            TransactionSide::Sell
        }
    }

    pub fn wire(self) -> &'static str {
        match self {
            TransactionSide::Buy => "B",
            TransactionSide::Sell => "S",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    Intraday,
    Bracket,
}

impl ProductType {
    pub fn wire(self) -> &'static str {
        match self {
            ProductType::Intraday => "I",
            ProductType::Bracket => "B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceType {
    Market,
    Limit,
    StopLossMarket,
}

impl PriceType {
    pub fn wire(self) -> &'static str {
        match self {
            PriceType::Market => "MKT",
            PriceType::Limit => "LMT",
            PriceType::StopLossMarket => "SL-MKT",
        }
    }
}

impl fmt::Display for PriceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire())
    }
}

/// Outbound order placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub side: TransactionSide,
    pub product: ProductType,
    pub exchange: String,
    pub symbol: String,
    pub quantity: u32,
    pub price_type: PriceType,
    /// Two-decimal price string, `"0.00"` for market orders.
    pub price: String,
    pub trigger_price: Option<String>,
    pub retention: String,
    pub remarks: String,
    /// Bracket stop-loss distance from entry, as a price range.
    pub book_loss_range: Option<String>,
    /// Bracket take-profit distance from entry, as a price range.
    pub book_profit_range: Option<String>,
}

/// Outbound order modification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyOrder {
    pub order_no: String,
    pub exchange: String,
    pub symbol: String,
    pub new_quantity: u32,
    pub new_price_type: PriceType,
    pub new_trigger_price: Option<String>,
}

/// Acknowledgement for a placement: the broker-assigned order number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_no: String,
}

/// A logged-in broker session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub token: String,
}
