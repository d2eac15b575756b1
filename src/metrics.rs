//! Post-run aggregation: annualized returns from the pool-value series
//! and per-grid-point summary rows.

use chrono::{DateTime, Utc};

use crate::sim::StepSeries;

/// Fallback step length when the timestamp index has no uniform frequency.
pub const DEFAULT_STEP_MINUTES: f64 = 30.0;

/// Step length in minutes inferred from the timestamp index; falls back
/// to 30 when the spacing is not uniform.
pub fn infer_step_minutes(timestamps: &[DateTime<Utc>]) -> f64 {
    if timestamps.len() < 2 {
        return DEFAULT_STEP_MINUTES;
    }
    let first = (timestamps[1] - timestamps[0]).num_seconds();
    if first <= 0 {
        return DEFAULT_STEP_MINUTES;
    }
    let uniform = timestamps
        .windows(2)
        .all(|w| (w[1] - w[0]).num_seconds() == first);
    if uniform {
        first as f64 / 60.0
    } else {
        DEFAULT_STEP_MINUTES
    }
}

/// Log returns between consecutive pool values.
pub fn log_returns(pool_value: &[f64]) -> Vec<f64> {
    pool_value
        .windows(2)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

/// Annualized return `exp(mean(log_returns)·Y) - 1` with
/// `Y = 60/step_minutes · 24 · 365`. Non-finite returns (from NaN steps)
/// are skipped so a single failed step does not poison the whole run.
pub fn annualized_return(pool_value: &[f64], step_minutes: f64) -> f64 {
    let returns: Vec<f64> = log_returns(pool_value)
        .into_iter()
        .filter(|r| r.is_finite())
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let yearmult = 60.0 / step_minutes * 24.0 * 365.0;
    (mean * yearmult).exp() - 1.0
}

/// One summary row per grid point.
#[derive(Debug, Clone)]
pub struct GridSummary {
    pub a: u128,
    pub fee: u128,
    pub annualized_return: f64,
    pub median_depth: f64,
    pub mean_balance: f64,
    pub total_volume: f64,
    pub mean_err: f64,
}

pub fn summarize(a: u128, fee: u128, series: &StepSeries) -> GridSummary {
    let step_minutes = infer_step_minutes(&series.timestamps);
    GridSummary {
        a,
        fee,
        annualized_return: annualized_return(&series.pool_value, step_minutes),
        median_depth: median(&series.depth),
        mean_balance: mean(&series.bal),
        total_volume: series.volume.iter().filter(|v| v.is_finite()).sum(),
        mean_err: mean(&series.err),
    }
}

fn mean(values: &[f64]) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.iter().sum::<f64>() / finite.len() as f64
}

fn median(values: &[f64]) -> f64 {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    }
}
