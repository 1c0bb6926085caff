//! Day-start loader: entries file in, reconciled position table out.
//!
//! Builds the table from the predictions CSV, then overlays whatever bracket
//! legs already exist in the broker's order book (engine restarts mid-session
//! land here), and snapshots the result as the BOD params record. The table
//! it returns establishes the invariants the event processor relies on.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::broker::classify::{classify, LegKind};
use crate::broker::types::OrderMsg;
use crate::broker::BrokerGateway;
use crate::models::{ActiveFlag, Config, EntryRow, OrderStatus, Position};
use crate::storage::{LogService, STAGE_BOD};

/// Order-book statuses worth stitching back onto the table.
const LOADABLE_STATUSES: [OrderStatus; 5] = [
    OrderStatus::Open,
    OrderStatus::TriggerPending,
    OrderStatus::Complete,
    OrderStatus::Canceled,
    OrderStatus::Rejected,
];

/// Parse `<ACCOUNT>-Entries.csv`. A missing or malformed file is fatal: the
/// session cannot start without its predictions.
pub fn read_entries(path: &Path) -> Result<Vec<EntryRow>> {
    let file = File::open(path)
        .with_context(|| format!("entries file missing: {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => line?,
        None => bail!("entries file is empty: {}", path.display()),
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let col = |name: &str| -> Result<usize> {
        columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .with_context(|| format!("entries file missing column '{}'", name))
    };
    let scrip = col("scrip")?;
    let symbol = col("symbol")?;
    let exchange = col("exchange")?;
    let token = col("token")?;
    let model = col("model")?;
    let signal = col("signal")?;
    let quantity = col("quantity")?;
    let target = col("target")?;
    let tick = col("tick")?;
    let sl_pct = col("sl_pct")?;
    let trail_sl_pct = col("trail_sl_pct")?;

    let mut rows = Vec::new();
    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let field = |idx: usize| -> Result<&str> {
            fields
                .get(idx)
                .copied()
                .with_context(|| format!("entries row {} truncated", line_no + 2))
        };
        let parse_f64 = |idx: usize, name: &str| -> Result<f64> {
            field(idx)?
                .parse()
                .with_context(|| format!("bad {} at entries row {}", name, line_no + 2))
        };
        let signal_value: i32 = field(signal)?
            .parse()
            .with_context(|| format!("bad signal at entries row {}", line_no + 2))?;
        if signal_value != 1 && signal_value != -1 {
            bail!("signal must be +1 or -1 at entries row {}", line_no + 2);
        }
        rows.push(EntryRow {
            scrip: field(scrip)?.to_string(),
            symbol: field(symbol)?.to_string(),
            exchange: field(exchange)?.to_string(),
            token: field(token)?.to_string(),
            model: field(model)?.to_string(),
            signal: signal_value,
            quantity: field(quantity)?
                .parse()
                .with_context(|| format!("bad quantity at entries row {}", line_no + 2))?,
            target: parse_f64(target, "target")?,
            tick: parse_f64(tick, "tick")?,
            sl_pct: parse_f64(sl_pct, "sl_pct")?,
            trail_sl_pct: parse_f64(trail_sl_pct, "trail_sl_pct")?,
        });
    }
    Ok(rows)
}

#[derive(Default)]
struct LegTriple {
    entry: Option<OrderMsg>,
    sl: Option<OrderMsg>,
    target: Option<OrderMsg>,
}

/// Pivot classified order-book rows by position index into leg triples.
fn pivot_order_book(order_book: &[OrderMsg]) -> HashMap<usize, LegTriple> {
    let mut pivoted: HashMap<usize, LegTriple> = HashMap::new();
    for row in order_book {
        let Some(status) = OrderStatus::parse(&row.status) else {
            continue;
        };
        if !row.is_bracket() || !LOADABLE_STATUSES.contains(&status) {
            continue;
        }
        if row.remarks.as_deref().unwrap_or("").is_empty() {
            continue;
        }
        let Some(classified) = classify(row) else {
            continue;
        };
        let Some(idx) = classified.index else {
            debug!("order-book row {} has no index tag", row.order_no);
            continue;
        };
        let triple = pivoted.entry(idx).or_default();
        let slot = match classified.leg {
            LegKind::Entry => &mut triple.entry,
            LegKind::StopLoss => &mut triple.sl,
            LegKind::Target => &mut triple.target,
        };
        *slot = Some(row.clone());
    }
    pivoted
}

/// Build the day's position table (steps 1-6 of the day-start procedure).
pub async fn load_params<G: BrokerGateway>(
    cfg: &Config,
    gateway: &G,
    log: &LogService,
    session_date: &str,
) -> Result<Vec<Position>> {
    let entries = read_entries(&cfg.entries_path())?;
    let mut positions: Vec<Position> = entries
        .into_iter()
        .enumerate()
        .map(|(idx, row)| Position::from_entry(idx, row))
        .collect();

    let order_book = match gateway.order_book().await {
        Some(book) => book,
        None => {
            // Null order book means a fresh day: proceed with bare entries.
            warn!("order book unavailable at load; starting from entries only");
            Vec::new()
        }
    };

    let pivoted = pivot_order_book(&order_book);
    for (idx, legs) in pivoted {
        let Some(position) = positions.get_mut(idx) else {
            warn!("order book references row {} beyond the entries file", idx);
            continue;
        };
        // Left join from the entry leg, like a restart would find it.
        let Some(entry) = legs.entry else {
            continue;
        };
        position.entry_order_id = Some(entry.order_no.clone());
        position.entry_order_status = OrderStatus::parse(&entry.status);
        position.entry_ts = Some(entry.event_ts());
        if let Some(px) = entry.entry_fill_price() {
            if px > 0.0 {
                position.entry_price = Some(px);
            }
        }

        if let Some(sl) = &legs.sl {
            position.sl_order_id = Some(sl.order_no.clone());
            position.sl_order_status = OrderStatus::parse(&sl.status);
            position.sl_ts = Some(sl.event_ts());
            if let Some(px) = sl.trigger_price() {
                position.sl_price = Some(px);
            }
        }
        if let Some(target) = &legs.target {
            position.target_order_id = Some(target.order_no.clone());
            position.target_order_status = OrderStatus::parse(&target.status);
            position.target_ts = Some(target.event_ts());
            if let Some(px) = target.target_leg_price() {
                position.target_price = Some(px);
            }
        }

        let working = position.target_order_status == Some(OrderStatus::Open)
            && position.sl_order_status == Some(OrderStatus::TriggerPending);
        position.active = if working { ActiveFlag::Yes } else { ActiveFlag::No };

        if let Some(entry_price) = position.entry_price {
            position.strength = Some((position.target - entry_price).abs());
        }
    }

    log.log_params(&cfg.account, session_date, STAGE_BOD, &positions)?;
    info!(
        "loaded {} positions ({} active) for {}",
        positions.len(),
        positions.iter().filter(|p| p.is_active()).count(),
        cfg.account
    );
    Ok(positions)
}
