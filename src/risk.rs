//! Risk math for the order lifecycle.
//!
//! Everything here is pure: stop-loss placement, tick rounding, signal
//! strength gating, trailing-stop recomputation and target adjustment. The
//! event processor and the backtest replay share these functions so a session
//! and its replay cannot drift apart.

use crate::models::Position;

/// Round a price to the nearest tick.
pub fn round_price(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}

/// Format a price for broker submission (two decimals).
pub fn fmt_price(price: f64) -> String {
    format!("{:.2}", price)
}

/// Stop-loss for a fresh entry: `sl_pct` percent away from the entry against
/// the trade direction, rounded to the tick.
///
/// `signal` is +1 for a buy, -1 for a sell.
pub fn calc_sl(entry: f64, signal: i32, sl_pct: f64, tick: f64) -> f64 {
    let sl = entry - signal as f64 * entry * sl_pct / 100.0;
    round_price(sl, tick)
}

/// Signed distance from last traded price to the predicted target, in the
/// direction of the signal. Positive means the predicted move has not yet
/// played out; zero or negative invalidates the entry.
pub fn signal_strength(signal: i32, target: f64, ltp: f64) -> f64 {
    signal as f64 * (target - ltp)
}

/// Trailing-stop update check.
///
/// Returns the new stop trigger iff the market has moved more than
/// `(sl_pct + trail_sl_pct)` percent of `ltp` away from the current stop;
/// exactly at the threshold is not an update.
pub fn trail_stop(
    current_sl: f64,
    ltp: f64,
    signal: i32,
    sl_pct: f64,
    trail_sl_pct: f64,
    tick: f64,
) -> Option<f64> {
    let threshold = ltp * (sl_pct + trail_sl_pct) / 100.0;
    if (ltp - current_sl).abs() > threshold {
        let new_sl = ltp - signal as f64 * ltp * sl_pct / 100.0;
        Some(round_price(new_sl, tick))
    } else {
        None
    }
}

/// [`trail_stop`] applied to a position row; no-op while the row has no
/// armed stop.
pub fn get_new_sl(position: &Position, ltp: f64) -> Option<f64> {
    let current_sl = position.sl_price?;
    trail_stop(
        current_sl,
        ltp,
        position.signal,
        position.sl_pct,
        position.trail_sl_pct,
        position.tick,
    )
}

/// Target price for a fill that may already be through its predicted target.
///
/// A buy that fills at or above the original target (sell: at or below) has
/// nothing left to run to; the target is extended by `strength` in the trade's
/// direction. Otherwise the original prediction stands.
pub fn calc_target(original_target: f64, entry_price: f64, signal: i32, strength: f64) -> f64 {
    if signal == 1 && entry_price >= original_target {
        entry_price + strength
    } else if signal == -1 && entry_price <= original_target {
        entry_price - strength
    } else {
        original_target
    }
}
