//! Rate-limited REST fetch of per-coin price/volume series against a
//! reference currency, combined into the pairwise tables the driver
//! consumes: pair prices by division, pair volumes by summation.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::Deserialize;

use crate::error::SimError;
use crate::market::{coin_pairs, Market};

pub const API_URL: &str = "https://api.coingecko.com/api/v3";

const MAX_ATTEMPTS: usize = 50;
const RETRY_DELAY_MS: u64 = 100;

#[derive(Debug, Deserialize)]
struct MarketChart {
    prices: Vec<(i64, f64)>,
    total_volumes: Vec<(i64, f64)>,
}

/// One coin's series on the hourly sample grid.
#[derive(Debug, Clone)]
pub struct CoinSeries {
    pub prices: Vec<f64>,
    pub volumes: Vec<f64>,
}

/// Fetch `days` of price/volume history for one coin id, retrying while
/// the API rate-limits us.
fn market_chart(
    client: &reqwest::blocking::Client,
    base_url: &str,
    coin_id: &str,
    vs_currency: &str,
    days: u32,
) -> Result<MarketChart, SimError> {
    let url = format!("{base_url}/coins/{coin_id}/market_chart");
    for _ in 0..MAX_ATTEMPTS {
        let resp = client
            .get(&url)
            .query(&[("vs_currency", vs_currency), ("days", &days.to_string())])
            .send()
            .map_err(|e| SimError::DataUnavailable(format!("{coin_id}: {e}")))?;
        if resp.status().is_success() {
            return resp
                .json::<MarketChart>()
                .map_err(|e| SimError::DataUnavailable(format!("{coin_id}: {e}")));
        }
        thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
    }
    Err(SimError::DataUnavailable(format!(
        "{coin_id}: rate-limited after {MAX_ATTEMPTS} attempts"
    )))
}

/// Hourly sample grid ending yesterday 23:30 UTC, spanning `days + 1`.
fn sample_grid(days: u32) -> Result<Vec<DateTime<Utc>>, SimError> {
    let end = (Utc::now() - ChronoDuration::days(1))
        .duration_trunc(ChronoDuration::days(1))
        .map_err(|e| SimError::DataUnavailable(e.to_string()))?
        + ChronoDuration::hours(23)
        + ChronoDuration::minutes(30);
    let start = end - ChronoDuration::days(days as i64 + 1);
    let mut samples = Vec::new();
    let mut t = start;
    while t <= end {
        samples.push(t);
        t += ChronoDuration::hours(1);
    }
    Ok(samples)
}

/// Forward-fill an `(ms, value)` series onto the sample grid.
fn reindex(series: &[(i64, f64)], samples: &[DateTime<Utc>]) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut cursor = 0usize;
    let mut current = series.first().map(|&(_, v)| v).unwrap_or(0.0);
    for &t in samples {
        let t_ms = t.timestamp_millis();
        while cursor < series.len() && series[cursor].0 <= t_ms {
            current = series[cursor].1;
            cursor += 1;
        }
        out.push(current);
    }
    out
}

/// Fetch each coin's series and combine them into the per-pair market:
/// `price[(i,j)] = price_i / price_j`, `volume[(i,j)] = vol_i + vol_j`.
pub fn pool_prices(
    client: &reqwest::blocking::Client,
    base_url: &str,
    coin_ids: &[String],
    vs_currency: &str,
    days: u32,
) -> Result<Market, SimError> {
    let samples = sample_grid(days)?;

    let mut series = Vec::with_capacity(coin_ids.len());
    for id in coin_ids {
        let chart = market_chart(client, base_url, id, vs_currency, days + 3)?;
        // drop the in-progress last sample before reindexing
        let prices = &chart.prices[..chart.prices.len().saturating_sub(1)];
        let volumes = &chart.total_volumes[..chart.total_volumes.len().saturating_sub(1)];
        series.push(CoinSeries {
            prices: reindex(prices, &samples),
            volumes: reindex(volumes, &samples),
        });
    }

    let pairs = coin_pairs(coin_ids.len());
    let mut prices = Vec::with_capacity(samples.len());
    let mut volumes = Vec::with_capacity(samples.len());
    for t in 0..samples.len() {
        let mut price_row = Vec::with_capacity(pairs.len());
        let mut vol_row = Vec::with_capacity(pairs.len());
        for &(i, j) in &pairs {
            let denom = series[j].prices[t];
            price_row.push(if denom > 0.0 {
                series[i].prices[t] / denom
            } else {
                0.0
            });
            vol_row.push(series[i].volumes[t] + series[j].volumes[t]);
        }
        prices.push(price_row);
        volumes.push(vol_row);
    }

    Market::new(samples, pairs, prices, volumes)
}
