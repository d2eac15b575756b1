//! Fan the simulation out across the `(A, fee)` grid.
//!
//! Every grid point owns a freshly built pool and read-only references to
//! the market data, so points run independently on a rayon pool sized by
//! the caller. A failed point surfaces an empty result with the recorded
//! error and never takes the rest of the grid down with it.

use std::panic::{catch_unwind, AssertUnwindSafe};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::error::SimError;
use crate::market::Market;
use crate::registry::PoolTemplate;
use crate::sim::{run_sim, StepSeries};

/// One `(A, fee)` combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridPoint {
    pub a: u128,
    pub fee: u128,
}

/// Per-point output: the step series on success, the recorded error on
/// failure.
#[derive(Debug, Clone)]
pub struct GridPointResult {
    pub a: u128,
    pub fee: u128,
    pub series: Option<StepSeries>,
    pub error: Option<String>,
}

/// Cartesian product in `A_list x fee_list` order; results keep it.
pub fn grid_points(a_list: &[u128], fee_list: &[u128]) -> Vec<GridPoint> {
    let mut points = Vec::with_capacity(a_list.len() * fee_list.len());
    for &a in a_list {
        for &fee in fee_list {
            points.push(GridPoint { a, fee });
        }
    }
    points
}

/// Run the whole grid with `ncpu` workers.
pub fn run_grid(
    template: &PoolTemplate,
    a_list: &[u128],
    fee_list: &[u128],
    market: &Market,
    vol_mult: &[f64],
    redemption: Option<&[u128]>,
    ncpu: usize,
) -> Result<Vec<GridPointResult>, SimError> {
    let points = grid_points(a_list, fee_list);
    let bar = ProgressBar::new(points.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} grid points {elapsed_precise}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let workers = rayon::ThreadPoolBuilder::new()
        .num_threads(ncpu.max(1))
        .build()
        .map_err(|e| SimError::Config(format!("worker pool: {e}")))?;

    let results = workers.install(|| {
        points
            .par_iter()
            .map(|pt| {
                let out = run_point(template, pt, market, vol_mult, redemption);
                bar.inc(1);
                out
            })
            .collect()
    });
    bar.finish_and_clear();
    Ok(results)
}

fn run_point(
    template: &PoolTemplate,
    pt: &GridPoint,
    market: &Market,
    vol_mult: &[f64],
    redemption: Option<&[u128]>,
) -> GridPointResult {
    let run = catch_unwind(AssertUnwindSafe(|| {
        let mut pool = template.build(Some(pt.a), Some(pt.fee))?;
        Ok::<StepSeries, SimError>(run_sim(&mut pool, market, vol_mult, redemption))
    }));
    match run {
        Ok(Ok(series)) => GridPointResult {
            a: pt.a,
            fee: pt.fee,
            series: Some(series),
            error: None,
        },
        Ok(Err(e)) => GridPointResult {
            a: pt.a,
            fee: pt.fee,
            series: None,
            error: Some(e.to_string()),
        },
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".into());
            GridPointResult {
                a: pt.a,
                fee: pt.fee,
                series: None,
                error: Some(msg),
            }
        }
    }
}
