//! One-minute candle files for the CoB accuracy replay.
//!
//! One `<scrip>.csv` per instrument under the tick-data directory, header
//! `time,open,high,low,close` with `time` in epoch seconds. Rows come back
//! sorted by time; blank lines are skipped, anything else malformed is an
//! error (the replay must not silently run on partial data).

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

pub fn read_tick_data(path: &Path) -> Result<Vec<Candle>> {
    let file = File::open(path)
        .with_context(|| format!("tick data file missing: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut candles = Vec::new();
    let mut lines = reader.lines();

    let header = match lines.next() {
        Some(line) => line?,
        None => bail!("tick data file is empty: {}", path.display()),
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let col = |name: &str| -> Result<usize> {
        columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .with_context(|| format!("tick data missing column '{}': {}", name, path.display()))
    };
    let (t, o, h, l, c) = (col("time")?, col("open")?, col("high")?, col("low")?, col("close")?);

    for (line_no, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let field = |idx: usize| -> Result<&str> {
            fields.get(idx).copied().with_context(|| {
                format!("tick data row {} truncated: {}", line_no + 2, path.display())
            })
        };
        candles.push(Candle {
            time: field(t)?
                .parse()
                .with_context(|| format!("bad time at row {}", line_no + 2))?,
            open: field(o)?
                .parse()
                .with_context(|| format!("bad open at row {}", line_no + 2))?,
            high: field(h)?
                .parse()
                .with_context(|| format!("bad high at row {}", line_no + 2))?,
            low: field(l)?
                .parse()
                .with_context(|| format!("bad low at row {}", line_no + 2))?,
            close: field(c)?
                .parse()
                .with_context(|| format!("bad close at row {}", line_no + 2))?,
        });
    }

    candles.sort_by_key(|c| c.time);
    Ok(candles)
}
