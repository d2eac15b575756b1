//! Pair-indexed market data: external mid-prices and traded volumes over
//! the flattened coin set, plus the volume-limit calibration modes.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::SimError;

/// Unordered pairs `(i, j)` with `i < j` over `n` coins, in the canonical
/// enumeration order every pair-indexed table follows.
pub fn coin_pairs(n: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(n * (n.saturating_sub(1)) / 2);
    for i in 0..n {
        for j in i + 1..n {
            pairs.push((i, j));
        }
    }
    pairs
}

/// Wide table of per-pair prices and volumes indexed by timestamp.
///
/// `prices[t][k]` is the mid-price of pair `k = (i, j)`: coin `i`
/// denominated in coin `j`. `volumes[t][k]` is the aggregate traded size
/// across the pair in whole-token units.
#[derive(Debug, Clone)]
pub struct Market {
    pub timestamps: Vec<DateTime<Utc>>,
    pub pairs: Vec<(usize, usize)>,
    pub prices: Vec<Vec<f64>>,
    pub volumes: Vec<Vec<f64>>,
}

impl Market {
    pub fn new(
        timestamps: Vec<DateTime<Utc>>,
        pairs: Vec<(usize, usize)>,
        prices: Vec<Vec<f64>>,
        volumes: Vec<Vec<f64>>,
    ) -> Result<Self, SimError> {
        if prices.len() != timestamps.len() || volumes.len() != timestamps.len() {
            return Err(SimError::Config(
                "price/volume rows do not match the timestamp index".into(),
            ));
        }
        let width = pairs.len();
        if prices.iter().any(|r| r.len() != width) || volumes.iter().any(|r| r.len() != width) {
            return Err(SimError::Config(
                "price/volume row width does not match the pair set".into(),
            ));
        }
        Ok(Market {
            timestamps,
            pairs,
            prices,
            volumes,
        })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn n_pairs(&self) -> usize {
        self.pairs.len()
    }

    /// Keep rows `[start, end)`.
    pub fn truncate(&mut self, start: usize, end: usize) -> Result<(), SimError> {
        if start >= end || end > self.len() {
            return Err(SimError::Config(format!(
                "truncation [{start}, {end}) out of range for {} rows",
                self.len()
            )));
        }
        self.timestamps.drain(..start);
        self.timestamps.truncate(end - start);
        self.prices.drain(..start);
        self.prices.truncate(end - start);
        self.volumes.drain(..start);
        self.volumes.truncate(end - start);
        Ok(())
    }

    /// Fraction of rows with a missing (zero or non-finite) price, per pair.
    pub fn missing_fraction(&self) -> Vec<f64> {
        let rows = self.len().max(1) as f64;
        (0..self.n_pairs())
            .map(|k| {
                let missing = self
                    .prices
                    .iter()
                    .filter(|row| row[k] == 0.0 || !row[k].is_finite())
                    .count();
                missing as f64 / rows
            })
            .collect()
    }

    /// Total traded volume per pair across the whole series.
    pub fn volume_totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_pairs()];
        for row in &self.volumes {
            for (t, v) in totals.iter_mut().zip(row) {
                *t += v;
            }
        }
        totals
    }

    /// Load a market from two wide CSVs (`timestamp` column first, one
    /// column per pair in enumeration order).
    pub fn from_csv_files(prices_path: &Path, volumes_path: &Path, n_coins: usize) -> Result<Self, SimError> {
        let (t1, prices) = load_wide_csv(prices_path)?;
        let (t2, volumes) = load_wide_csv(volumes_path)?;
        if t1 != t2 {
            return Err(SimError::Config(
                "price and volume files disagree on timestamps".into(),
            ));
        }
        Market::new(t1, coin_pairs(n_coins), prices, volumes)
    }
}

fn load_wide_csv(path: &Path) -> Result<(Vec<DateTime<Utc>>, Vec<Vec<f64>>), SimError> {
    let mut rdr = csv::Reader::from_path(path)
        .map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
    let mut timestamps = Vec::new();
    let mut rows = Vec::new();
    for record in rdr.records() {
        let record =
            record.map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
        let ts = record
            .get(0)
            .ok_or_else(|| SimError::Config("empty CSV row".into()))?;
        let ts = ts
            .parse::<DateTime<Utc>>()
            .map_err(|e| SimError::Config(format!("bad timestamp {ts}: {e}")))?;
        let mut row = Vec::with_capacity(record.len() - 1);
        for field in record.iter().skip(1) {
            row.push(
                field
                    .parse::<f64>()
                    .map_err(|e| SimError::Config(format!("bad value {field}: {e}")))?,
            );
        }
        timestamps.push(ts);
        rows.push(row);
    }
    Ok((timestamps, rows))
}

/// Pool shape for volume-limit calibration.
#[derive(Debug, Clone, Copy)]
pub enum PoolShape {
    Flat { n: usize },
    Meta { n_outer: usize, n_base: usize },
}

/// How historic pool volume is distributed into per-pair trade caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolMode {
    /// Caps proportional to each pair's share of external volume.
    PairProportional,
    /// Historic volume split equally across pairs.
    EqualSplit,
    /// Equal split on meta-asset pairs, proportional on base-only pairs.
    /// Falls back to proportional for flat pools.
    Hybrid,
}

impl VolMode {
    pub fn from_flag(v: u8) -> Result<Self, SimError> {
        match v {
            1 => Ok(VolMode::PairProportional),
            2 => Ok(VolMode::EqualSplit),
            3 => Ok(VolMode::Hybrid),
            _ => Err(SimError::Config(format!("vol_mode must be 1, 2 or 3, got {v}"))),
        }
    }
}

/// Per-pair volume multipliers calibrated from 2-month historic volume.
///
/// `hist_volume` carries one entry for a flat pool, two (meta, base) for a
/// metapool. The multiplier scales external pair volume into a per-step
/// trade cap, so a pair with no external volume gets a zero cap.
pub fn vol_mult(
    mode: VolMode,
    shape: PoolShape,
    hist_volume: &[f64],
    market: &Market,
) -> Result<Vec<f64>, SimError> {
    let totals = market.volume_totals();
    let share = |hist: f64, total: f64| if total > 0.0 { hist / total } else { 0.0 };

    match shape {
        PoolShape::Flat { n } => {
            let pairs = coin_pairs(n);
            if pairs.len() != totals.len() {
                return Err(SimError::Config("pair count mismatch for flat pool".into()));
            }
            let hist = *hist_volume
                .first()
                .ok_or_else(|| SimError::Config("missing historic volume".into()))?;
            let mode = if mode == VolMode::Hybrid {
                VolMode::PairProportional
            } else {
                mode
            };
            match mode {
                VolMode::PairProportional => {
                    let all: f64 = totals.iter().sum();
                    Ok(vec![share(hist, all); pairs.len()])
                }
                _ => {
                    let per_pair = hist / pairs.len() as f64;
                    Ok(totals.iter().map(|&t| share(per_pair, t)).collect())
                }
            }
        }
        PoolShape::Meta { n_outer, n_base } => {
            let n_total = n_outer + n_base - 1;
            let max_coin = n_outer - 1;
            let pairs = coin_pairs(n_total);
            if pairs.len() != totals.len() {
                return Err(SimError::Config("pair count mismatch for metapool".into()));
            }
            if hist_volume.len() < 2 {
                return Err(SimError::Config(
                    "metapool needs meta and base historic volumes".into(),
                ));
            }
            let (meta_hist, base_hist) = (hist_volume[0], hist_volume[1]);

            let is_meta: Vec<bool> = pairs.iter().map(|&(i, _)| i < max_coin).collect();
            let meta_total: f64 = totals
                .iter()
                .zip(&is_meta)
                .filter(|(_, &m)| m)
                .map(|(t, _)| t)
                .sum();
            let base_total: f64 = totals
                .iter()
                .zip(&is_meta)
                .filter(|(_, &m)| !m)
                .map(|(t, _)| t)
                .sum();
            let n_meta_pairs = is_meta.iter().filter(|&&m| m).count() as f64;
            let n_base_pairs = is_meta.len() as f64 - n_meta_pairs;

            let out = totals
                .iter()
                .zip(&is_meta)
                .map(|(&t, &meta)| match (mode, meta) {
                    (VolMode::PairProportional, true) => share(meta_hist, meta_total),
                    (VolMode::PairProportional, false) => share(base_hist, base_total),
                    (VolMode::EqualSplit, true) => share(meta_hist / n_meta_pairs, t),
                    (VolMode::EqualSplit, false) => share(base_hist / n_base_pairs, t),
                    (VolMode::Hybrid, true) => share(meta_hist / n_meta_pairs, t),
                    (VolMode::Hybrid, false) => share(base_hist, base_total),
                })
                .collect();
            Ok(out)
        }
    }
}
