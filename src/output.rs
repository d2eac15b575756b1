//! Result persistence: per-grid-point time series, the grid summary
//! table, and the data-availability text file.

use std::path::Path;

use crate::market::Market;
use crate::metrics::{summarize, GridSummary};
use crate::sim::StepSeries;
use crate::sweep::GridPointResult;

/// Save one grid point's step series to CSV.
pub fn save_series_csv(
    series: &StepSeries,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["timestamp", "err", "bal", "pool_value", "depth", "volume"])?;
    for t in 0..series.timestamps.len() {
        wtr.write_record(&[
            series.timestamps[t].to_rfc3339(),
            format!("{:.12}", series.err[t]),
            format!("{:.8}", series.bal[t]),
            format!("{:.6}", series.pool_value[t]),
            format!("{:.12}", series.depth[t]),
            format!("{:.6}", series.volume[t]),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Save one grid point's holdings and rates per step.
pub fn save_holdings_csv(
    series: &StepSeries,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    let n = series.holdings.first().map(|h| h.len()).unwrap_or(0);
    let mut header = vec!["timestamp".to_string()];
    header.extend((0..n).map(|i| format!("x{i}")));
    header.extend((0..n).map(|i| format!("p{i}")));
    wtr.write_record(&header)?;
    for t in 0..series.timestamps.len() {
        let mut row = vec![series.timestamps[t].to_rfc3339()];
        row.extend(series.holdings[t].iter().map(|x| x.to_string()));
        row.extend(series.rates[t].iter().map(|p| p.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Save the per-grid-point summary table.
pub fn save_summary_csv(
    summaries: &[GridSummary],
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "A",
        "fee",
        "annualized_return",
        "median_depth",
        "mean_balance",
        "total_volume",
        "mean_err",
    ])?;
    for s in summaries {
        wtr.write_record(&[
            s.a.to_string(),
            s.fee.to_string(),
            format!("{:.8}", s.annualized_return),
            format!("{:.12}", s.median_depth),
            format!("{:.8}", s.mean_balance),
            format!("{:.4}", s.total_volume),
            format!("{:.12}", s.mean_err),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Simulation period and per-pair data availability, as plain text.
pub fn save_availability_txt(
    market: &Market,
    coins: &[String],
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut txt = String::new();
    if let (Some(start), Some(end)) = (market.timestamps.first(), market.timestamps.last()) {
        txt.push_str(&format!(
            "Simulation period: {} to {}\n",
            start.format("%m/%d/%y"),
            end.format("%m/%d/%y")
        ));
    }
    txt.push_str("Data Availability:\n");
    let missing = market.missing_fraction();
    for (k, &(i, j)) in market.pairs.iter().enumerate() {
        let label = match (coins.get(i), coins.get(j)) {
            (Some(a), Some(b)) => format!("{a}/{b}"),
            _ => format!("{i}/{j}"),
        };
        txt.push_str(&format!(
            "{label}: {:.1}%\n",
            (1.0 - missing[k]) * 100.0
        ));
    }
    if missing.iter().any(|&m| m > 0.3) {
        txt.push_str("CAUTION: Limited price data used in simulation\n");
    }
    std::fs::write(path, txt)?;
    Ok(())
}

/// Save everything for a finished grid run under `output_dir/pool_name`.
/// Returns the summary rows for the successful points.
pub fn save_all(
    results: &[GridPointResult],
    market: &Market,
    coins: &[String],
    pool_name: &str,
    output_dir: &Path,
) -> Result<Vec<GridSummary>, Box<dyn std::error::Error>> {
    let dir = output_dir.join(pool_name);
    std::fs::create_dir_all(&dir)?;

    let mut summaries = Vec::new();
    for result in results {
        let tag = format!("A{}_fee{}", result.a, result.fee);
        match &result.series {
            Some(series) => {
                save_series_csv(series, &dir.join(format!("{tag}_timeseries.csv")))?;
                save_holdings_csv(series, &dir.join(format!("{tag}_holdings.csv")))?;
                summaries.push(summarize(result.a, result.fee, series));
            }
            None => {
                let msg = result.error.as_deref().unwrap_or("unknown failure");
                std::fs::write(dir.join(format!("{tag}_error.txt")), msg)?;
            }
        }
    }

    save_summary_csv(&summaries, &dir.join("summary.csv"))?;
    save_availability_txt(market, coins, &dir.join("pooltext.txt"))?;
    Ok(summaries)
}
