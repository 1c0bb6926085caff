//! Deterministic session replay for the CoB accuracy comparison.
//!
//! Re-runs one filled position against the day's one-minute candles with the
//! exact risk math the live engine used (entry price, stop placement,
//! trailing updates, target). The output is the simulated trade pair plus a
//! per-minute mark-to-market curve; comparing it against the broker trade for
//! the same row measures how much the live fills drifted from the model.

use serde::{Deserialize, Serialize};

use crate::risk::{calc_sl, calc_target, round_price, trail_stop};
use crate::ticks::Candle;

/// Inputs for one replay: the position's prediction plus its realized entry.
#[derive(Debug, Clone)]
pub struct ReplayParams {
    pub signal: i32,
    pub quantity: u32,
    pub entry_ts: i64,
    pub entry_price: f64,
    pub target: f64,
    pub tick: f64,
    pub sl_pct: f64,
    pub trail_sl_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    SlHit,
    TargetHit,
    SessionEnd,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::SlHit => "SL-HIT",
            ExitReason::TargetHit => "TARGET-HIT",
            ExitReason::SessionEnd => "SESSION-END",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTrade {
    pub entry_ts: i64,
    pub entry_price: f64,
    pub exit_ts: i64,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub pnl: f64,
}

/// One per-minute mark-to-market observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MtmPoint {
    pub ts: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub trade: Option<ReplayTrade>,
    pub mtm: Vec<MtmPoint>,
    pub sl_updates: u32,
}

/// Replay one position over the candles at and after its entry minute.
///
/// Exit rules per candle, in order: stop touch (conservative when a single
/// candle spans both levels), target touch, then a trailing-stop recompute on
/// the candle close. A position still open after the last candle exits at
/// that close.
pub fn replay(params: &ReplayParams, candles: &[Candle]) -> ReplayOutcome {
    let entry_minute = params.entry_ts - params.entry_ts % 60;
    let session: Vec<&Candle> = candles.iter().filter(|c| c.time >= entry_minute).collect();
    if session.is_empty() {
        return ReplayOutcome::default();
    }

    let entry = params.entry_price;
    let signal = params.signal as f64;
    let qty = params.quantity as f64;
    let strength = (params.target - entry).abs();
    let target_px = round_price(
        calc_target(params.target, entry, params.signal, strength),
        params.tick,
    );
    let mut sl = calc_sl(entry, params.signal, params.sl_pct, params.tick);

    let mut outcome = ReplayOutcome::default();

    for candle in &session {
        let exit = if params.signal == 1 {
            if candle.low <= sl {
                Some((sl, ExitReason::SlHit))
            } else if candle.high >= target_px {
                Some((target_px, ExitReason::TargetHit))
            } else {
                None
            }
        } else if candle.high >= sl {
            Some((sl, ExitReason::SlHit))
        } else if candle.low <= target_px {
            Some((target_px, ExitReason::TargetHit))
        } else {
            None
        };

        if let Some((exit_price, exit_reason)) = exit {
            let pnl = qty * signal * (exit_price - entry);
            outcome.mtm.push(MtmPoint {
                ts: candle.time,
                value: pnl,
            });
            outcome.trade = Some(ReplayTrade {
                entry_ts: params.entry_ts,
                entry_price: entry,
                exit_ts: candle.time,
                exit_price,
                exit_reason,
                pnl,
            });
            return outcome;
        }

        if let Some(new_sl) = trail_stop(
            sl,
            candle.close,
            params.signal,
            params.sl_pct,
            params.trail_sl_pct,
            params.tick,
        ) {
            sl = new_sl;
            outcome.sl_updates += 1;
        }

        outcome.mtm.push(MtmPoint {
            ts: candle.time,
            value: qty * signal * (candle.close - entry),
        });
    }

    let last = session[session.len() - 1];
    outcome.trade = Some(ReplayTrade {
        entry_ts: params.entry_ts,
        entry_price: entry,
        exit_ts: last.time,
        exit_price: last.close,
        exit_reason: ExitReason::SessionEnd,
        pnl: qty * signal * (last.close - entry),
    });
    outcome
}
