//! GraphQL fetchers: 2-month historic pool volume and redemption-price
//! series. Both run before the grid fans out; a failure here is fatal for
//! the whole invocation.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crate::error::SimError;
use crate::pool::PRECISION;

pub const VOLUME_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/convex-community/volume-mainnet";
pub const REDEMPTION_SUBGRAPH_URL: &str =
    "https://api.thegraph.com/subgraphs/name/reflexer-labs/rai-mainnet";

fn post_query(
    client: &reqwest::blocking::Client,
    url: &str,
    query: String,
) -> Result<Value, SimError> {
    let resp = client
        .post(url)
        .json(&json!({ "query": query }))
        .send()
        .map_err(|e| SimError::DataUnavailable(format!("{url}: {e}")))?;
    resp.json::<Value>()
        .map_err(|e| SimError::DataUnavailable(format!("{url}: {e}")))
}

/// Sum of the most recent 60 daily volume snapshots for a pool address,
/// in whole-token units.
pub fn pool_volume(
    client: &reqwest::blocking::Client,
    url: &str,
    address: &str,
) -> Result<f64, SimError> {
    let query = format!(
        r#"{{
  swapVolumeSnapshots(
    where: {{pool: "{address}", period: 86400}},
    orderBy: timestamp,
    orderDirection: desc,
    first: 60
  ) {{
    volume
  }}
}}"#
    );
    let body = post_query(client, url, query)?;
    let snapshots = body["data"]["swapVolumeSnapshots"]
        .as_array()
        .ok_or_else(|| SimError::DataUnavailable(format!("no volume snapshots for {address}")))?;
    let mut total = 0.0;
    for snap in snapshots {
        let vol = match &snap["volume"] {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        total += vol.ok_or_else(|| {
            SimError::DataUnavailable(format!("malformed volume snapshot for {address}"))
        })?;
    }
    Ok(total)
}

/// One observed redemption price, integer-scaled to 10^18.
#[derive(Debug, Clone, Copy)]
pub struct RedemptionPoint {
    pub timestamp: DateTime<Utc>,
    pub price: u128,
}

/// Most recent `first` redemption prices, sorted ascending by time.
pub fn redemption_prices(
    client: &reqwest::blocking::Client,
    url: &str,
    first: usize,
) -> Result<Vec<RedemptionPoint>, SimError> {
    let query = format!(
        r#"{{
  redemptionPrices(orderBy: timestamp, orderDirection: desc, first: {first}) {{
    timestamp
    value
  }}
}}"#
    );
    let body = post_query(client, url, query)?;
    let rows = body["data"]["redemptionPrices"]
        .as_array()
        .ok_or_else(|| SimError::DataUnavailable("no redemption prices returned".into()))?;

    let mut points = Vec::with_capacity(rows.len());
    for row in rows {
        let ts = row["timestamp"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| row["timestamp"].as_i64())
            .ok_or_else(|| SimError::DataUnavailable("malformed redemption timestamp".into()))?;
        let value = row["value"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| row["value"].as_f64())
            .ok_or_else(|| SimError::DataUnavailable("malformed redemption value".into()))?;
        let timestamp = Utc
            .timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| SimError::DataUnavailable("redemption timestamp out of range".into()))?;
        points.push(RedemptionPoint {
            timestamp,
            price: (value * PRECISION as f64) as u128,
        });
    }
    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}

/// Forward-fill the redemption series onto the market timestamps. Rows
/// before the first observation take the first observed price.
pub fn reindex_ffill(points: &[RedemptionPoint], timestamps: &[DateTime<Utc>]) -> Vec<u128> {
    let mut out = Vec::with_capacity(timestamps.len());
    let mut cursor = 0usize;
    let mut current = points.first().map(|p| p.price).unwrap_or(PRECISION);
    for &t in timestamps {
        while cursor < points.len() && points[cursor].timestamp <= t {
            current = points[cursor].price;
            cursor += 1;
        }
        out.push(current);
    }
    out
}

/// Load a redemption series from a local CSV (`timestamp,price` rows,
/// price integer-scaled to 10^18).
pub fn redemption_from_csv(path: &std::path::Path) -> Result<Vec<RedemptionPoint>, SimError> {
    let mut rdr = csv::Reader::from_path(path)
        .map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
    let mut points = Vec::new();
    for record in rdr.records() {
        let record =
            record.map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
        let ts = record
            .get(0)
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
            .ok_or_else(|| SimError::Config("bad redemption timestamp".into()))?;
        let price = record
            .get(1)
            .and_then(|s| s.parse::<u128>().ok())
            .ok_or_else(|| SimError::Config("bad redemption price".into()))?;
        points.push(RedemptionPoint {
            timestamp: ts,
            price,
        });
    }
    points.sort_by_key(|p| p.timestamp);
    Ok(points)
}
