//! The per-timestep driver: run the joint arbitrage, apply the trades,
//! record the step metrics.
//!
//! The driver is robust by design: a step whose invariant iteration fails
//! records NaN metrics and the run continues; a trade the pool cannot
//! absorb is dropped.

use chrono::{DateTime, Utc};

use crate::arb::{optarbs, price_depth, Trade};
use crate::market::Market;
use crate::metapool::Pool;
use crate::pool::{mul_div, PRECISION};

/// Relative price move used for the per-step depth measurement.
pub const DEPTH_SIZE: f64 = 0.001;

/// An executed trade `(i, j, dx, dy_net)`.
#[derive(Debug, Clone)]
pub struct TradeExec {
    pub i: usize,
    pub j: usize,
    pub dx: u128,
    pub dy: u128,
}

/// Per-step output series of one simulation run.
#[derive(Debug, Clone, Default)]
pub struct StepSeries {
    pub timestamps: Vec<DateTime<Utc>>,
    /// Sum of absolute per-pair price errors after the step's trades.
    pub err: Vec<f64>,
    /// Balance index in [0, 1].
    pub bal: Vec<f64>,
    /// Pool value (D) in whole-token units.
    pub pool_value: Vec<f64>,
    /// Mean price depth across pairs.
    pub depth: Vec<f64>,
    /// Realized trade volume in whole-token units.
    pub volume: Vec<f64>,
    /// Raw holdings per step.
    pub holdings: Vec<Vec<u128>>,
    /// Rate multipliers per step (base virtual price and redemption
    /// substituted where applicable).
    pub rates: Vec<Vec<u128>>,
}

/// Apply a trade list in order, dropping trades the pool cannot absorb.
///
/// Returns the executed trades and the summed volume `dx·rates[i]/10^18`.
/// For metapools only trades touching the meta asset are counted.
pub fn do_trades(pool: &mut Pool, trades: &[Trade]) -> (Vec<TradeExec>, u128) {
    let rates = pool.volume_rates();
    let meta_cut = match pool {
        Pool::Meta(m) => Some(m.max_coin()),
        Pool::Flat(_) => None,
    };
    let mut done = Vec::with_capacity(trades.len());
    let mut volume = 0u128;
    for &(i, j, dx) in trades {
        if let Ok((dy, _fee)) = pool.exchange(i, j, dx) {
            let counted = match meta_cut {
                None => true,
                Some(mc) => i < mc || j < mc,
            };
            if counted {
                volume += mul_div(dx, rates[i], PRECISION);
            }
            done.push(TradeExec { i, j, dx, dy });
        }
    }
    (done, volume)
}

/// Drive `pool` through the whole market series, arbitraging toward the
/// external prices at every step subject to the per-pair volume caps.
///
/// `redemption`, when present, is written into `rates[0]` before each
/// step; pool value is then measured with the redemption slot pinned to
/// its initial value so it stays in a stable unit of account.
pub fn run_sim(
    pool: &mut Pool,
    market: &Market,
    vol_mult: &[f64],
    redemption: Option<&[u128]>,
) -> StepSeries {
    let r0 = redemption.and_then(|r| r.first().copied());
    let mut out = StepSeries::default();

    for t in 0..market.len() {
        if let Some(r) = redemption {
            pool.set_redemption_rate(r[t]);
        }

        let limits: Vec<f64> = market.volumes[t]
            .iter()
            .zip(vol_mult)
            .map(|(&v, &m)| v * m)
            .collect();

        let result = optarbs(pool, &market.prices[t], &limits);
        let (_done, vol) = do_trades(pool, &result.trades);

        out.timestamps.push(market.timestamps[t]);
        out.volume.push(vol as f64 / 1e18);
        out.err.push(result.errors.iter().map(|e| e.abs()).sum());
        out.depth.push(match price_depth(pool, DEPTH_SIZE) {
            Ok(d) if !d.is_empty() => d.iter().sum::<f64>() / d.len() as f64,
            _ => f64::NAN,
        });
        out.pool_value.push(match pool.pool_value(r0) {
            Ok(v) => v as f64 / 1e18,
            Err(_) => f64::NAN,
        });
        out.bal.push(pool.balance_metric().unwrap_or(f64::NAN));
        out.holdings.push(pool.holdings().to_vec());
        out.rates.push(pool.rates_snapshot().unwrap_or_default());
    }

    out
}
