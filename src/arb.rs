//! Arbitrage solvers: the single-pair root finder and the joint
//! least-squares solver that produces the per-step trade list.
//!
//! Every objective evaluation steps the actual pool and rolls it back via
//! snapshot/restore. Trades compose non-commutatively, so the joint
//! objective is evaluated by applying the whole ordered sequence before
//! measuring the per-pair price errors.

use std::cmp::Ordering;

use crate::error::SimError;
use crate::market::coin_pairs;
use crate::metapool::Pool;
use crate::pool::{MIN_TRADE, PROBE_DX};

/// A directed trade `(i, j, dx)` in coin-i virtual units.
pub type Trade = (usize, usize, u128);

/// Result of the joint solve: the trades to execute (descending initial
/// size order) and the post-trade price errors per considered pair.
#[derive(Debug, Clone)]
pub struct ArbResult {
    pub trades: Vec<Trade>,
    pub errors: Vec<f64>,
}

/// Result of the single-pair solve.
#[derive(Debug, Clone)]
pub struct OptArb {
    pub trade: Trade,
    pub error: f64,
}

const BRENT_XTOL: f64 = 2e-12;
const BRENT_RTOL: f64 = 4.0 * f64::EPSILON;
const BRENT_MAX_ITER: usize = 100;

const LSQ_GTOL: f64 = 1e-15;
const LSQ_XTOL: f64 = 1e-15;
const LSQ_MAX_ITER: usize = 60;

/// Price error after trading `dx` of `i` for `j`: pool marginal price
/// minus the external target. Positive means the pool still overprices
/// `j` in units of `i`. The pool is restored before returning.
pub fn arb_error(pool: &mut Pool, i: usize, j: usize, dx: u128, p: f64) -> Result<f64, SimError> {
    let snap = pool.snapshot();
    let res = pool
        .exchange(i, j, dx)
        .and_then(|_| pool.dydx_fee(i, j, PROBE_DX))
        .map(|price| price - p);
    pool.restore(&snap);
    res
}

/// Optimal one-pair arbitrage: the `dx` driving the pool's fee-adjusted
/// marginal price to the external price `p`, bracketed between the
/// minimum trade and the size that would leave 1% of the counter-coin.
pub fn optarb(pool: &mut Pool, i: usize, j: usize, p: f64) -> Result<OptArb, SimError> {
    let hi = arb_high(pool, i, j)?;
    let lo = MIN_TRADE as f64;
    if hi <= lo {
        return Err(SimError::Solver("degenerate arbitrage bracket".into()));
    }
    let root = brentq(|dx| arb_error(pool, i, j, dx as u128, p), lo, hi)?;
    let dx = root as u128;
    let error = arb_error(pool, i, j, dx, p)?;
    Ok(OptArb {
        trade: (i, j, dx),
        error,
    })
}

/// Upper bracket: enough of coin `i` to leave 1% of coin `j`, measured on
/// the base pool when both sides live there, on the outer level otherwise.
fn arb_high(pool: &Pool, i: usize, j: usize) -> Result<f64, SimError> {
    match pool {
        Pool::Flat(p) => {
            let xp = p.xp();
            let y = p.y(j, i, xp[j] / 100, &xp)?;
            Ok(y.saturating_sub(xp[i]) as f64)
        }
        Pool::Meta(m) => {
            let (base_i, base_j, meta_i, meta_j) = m.split(i, j);
            if base_i >= 0 && base_j >= 0 {
                let xp = m.base.xp();
                let y = m
                    .base
                    .y(base_j as usize, base_i as usize, xp[base_j as usize] / 100, &xp)?;
                Ok(y.saturating_sub(xp[base_i as usize]) as f64)
            } else {
                let xp = m.xp_live()?;
                let y = m.outer.y(meta_j, meta_i, xp[meta_j] / 100, &xp)?;
                Ok(y.saturating_sub(m.outer.xp()[meta_i]) as f64)
            }
        }
    }
}

/// Joint arbitrage across all pairs of the flattened coin set.
///
/// `prices[k]` is the external price for the k-th unordered pair,
/// `limits[k]` the volume cap in whole-token units. Falls back to a
/// zero-trade vector (errors recorded with no trades applied) if the
/// joint solve fails.
pub fn optarbs(pool: &mut Pool, prices: &[f64], limits: &[f64]) -> ArbResult {
    let pairs = coin_pairs(pool.n_total());
    let n = pairs.len();

    let mut x0 = Vec::with_capacity(n);
    let mut lo = Vec::with_capacity(n);
    let mut hi = Vec::with_capacity(n);
    let mut coins = Vec::with_capacity(n);
    let mut targs = Vec::with_capacity(n);

    for (k, &(i, j)) in pairs.iter().enumerate() {
        let p = prices[k];
        let cap = limits[k] * 1e18 + 1.0;

        let fwd = arb_error(pool, i, j, MIN_TRADE, p).unwrap_or(f64::NEG_INFINITY);
        if fwd > 0.0 {
            let seed = match optarb(pool, i, j, p) {
                Ok(r) => (r.trade.2 as f64).min(limits[k] * 1e18),
                Err(_) => 0.0,
            };
            x0.push(seed);
            coins.push((i, j));
            targs.push(p);
        } else {
            let rev = arb_error(pool, j, i, MIN_TRADE, 1.0 / p).unwrap_or(f64::NEG_INFINITY);
            if rev > 0.0 {
                let seed = match optarb(pool, j, i, 1.0 / p) {
                    Ok(r) => (r.trade.2 as f64).min(limits[k] * 1e18),
                    Err(_) => 0.0,
                };
                x0.push(seed);
                coins.push((j, i));
                targs.push(1.0 / p);
            } else {
                x0.push(0.0);
                coins.push((i, j));
                targs.push(p);
            }
        }
        lo.push(0.0);
        hi.push(cap);
    }

    // Largest expected trades first: the joint objective sees their
    // combined effect and the trade sequence is order-sensitive.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x0[b].partial_cmp(&x0[a]).unwrap_or(Ordering::Equal));
    let x0: Vec<f64> = order.iter().map(|&k| x0[k]).collect();
    let lo: Vec<f64> = order.iter().map(|&k| lo[k]).collect();
    let hi: Vec<f64> = order.iter().map(|&k| hi[k]).collect();
    let coins: Vec<(usize, usize)> = order.iter().map(|&k| coins[k]).collect();
    let targs: Vec<f64> = order.iter().map(|&k| targs[k]).collect();

    match least_squares(pool, &x0, &lo, &hi, &coins, &targs) {
        Ok((dxs, errors)) => {
            let mut trades = Vec::new();
            for (k, &(i, j)) in coins.iter().enumerate() {
                let dx = if dxs[k].is_nan() { 0 } else { dxs[k] as u128 };
                if dx > 0 {
                    trades.push((i, j, dx));
                }
            }
            ArbResult { trades, errors }
        }
        Err(_) => {
            let zeros = vec![0.0; n];
            let errors = residuals(pool, &zeros, &coins, &targs)
                .unwrap_or_else(|_| vec![f64::NAN; n]);
            ArbResult {
                trades: Vec::new(),
                errors,
            }
        }
    }
}

/// Per-pair price errors after applying all trades in order. Dropped
/// trades (insufficient liquidity) are skipped; the pool is restored
/// exactly, base LP supply included, before returning.
fn residuals(
    pool: &mut Pool,
    dxs: &[f64],
    coins: &[(usize, usize)],
    targs: &[f64],
) -> Result<Vec<f64>, SimError> {
    let snap = pool.snapshot();
    for (k, &(i, j)) in coins.iter().enumerate() {
        let dx = if dxs[k].is_nan() { 0 } else { dxs[k] as u128 };
        if dx > 0 {
            match pool.exchange(i, j, dx) {
                Ok(_) | Err(SimError::InsufficientLiquidity) => {}
                Err(e) => {
                    pool.restore(&snap);
                    return Err(e);
                }
            }
        }
    }
    let mut out = Vec::with_capacity(coins.len());
    for (k, &(i, j)) in coins.iter().enumerate() {
        match pool.dydx_fee(i, j, PROBE_DX) {
            Ok(price) => out.push(price - targs[k]),
            Err(e) => {
                pool.restore(&snap);
                return Err(e);
            }
        }
    }
    pool.restore(&snap);
    Ok(out)
}

/// Box-constrained Levenberg-Marquardt on the trade vector. Steps are
/// clamped into `[lo, hi]`; the Jacobian is forward-differenced.
fn least_squares(
    pool: &mut Pool,
    x0: &[f64],
    lo: &[f64],
    hi: &[f64],
    coins: &[(usize, usize)],
    targs: &[f64],
) -> Result<(Vec<f64>, Vec<f64>), SimError> {
    let n = x0.len();
    let mut x: Vec<f64> = x0
        .iter()
        .enumerate()
        .map(|(k, &v)| v.clamp(lo[k], hi[k]))
        .collect();
    let mut r = residuals(pool, &x, coins, targs)?;
    let mut cost = 0.5 * dot(&r, &r);
    let mut lambda = 1e-3;

    for _ in 0..LSQ_MAX_ITER {
        let jac = jacobian(pool, &x, &r, lo, hi, coins, targs)?;

        let mut g = vec![0.0; n];
        for (row, &ri) in jac.iter().zip(r.iter()) {
            for (k, gk) in g.iter_mut().enumerate() {
                *gk += row[k] * ri;
            }
        }
        // first-order optimality scaled by the box width: trade sizes run
        // to 1e27 so the raw gradient is meaninglessly small
        let converged = g
            .iter()
            .enumerate()
            .all(|(k, v)| (v * (hi[k] - lo[k])).abs() < LSQ_GTOL);
        if converged {
            break;
        }

        let mut jtj = vec![vec![0.0; n]; n];
        for row in &jac {
            for a in 0..n {
                for b in 0..n {
                    jtj[a][b] += row[a] * row[b];
                }
            }
        }

        let mut accepted = false;
        for _ in 0..10 {
            let mut h = jtj.clone();
            for (k, hk) in h.iter_mut().enumerate() {
                hk[k] += lambda * jtj[k][k].max(1e-30);
            }
            let rhs: Vec<f64> = g.iter().map(|v| -v).collect();
            let delta = match solve_linear(h, rhs) {
                Some(d) => d,
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };
            let x_new: Vec<f64> = x
                .iter()
                .enumerate()
                .map(|(k, &v)| (v + delta[k]).clamp(lo[k], hi[k]))
                .collect();
            let r_new = residuals(pool, &x_new, coins, targs)?;
            let cost_new = 0.5 * dot(&r_new, &r_new);
            if cost_new.is_finite() && cost_new < cost {
                let step: f64 = x_new
                    .iter()
                    .zip(&x)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
                    .sqrt();
                let x_norm = dot(&x, &x).sqrt();
                x = x_new;
                r = r_new;
                cost = cost_new;
                lambda = (lambda * 0.3).max(1e-12);
                accepted = true;
                if step < LSQ_XTOL * (LSQ_XTOL + x_norm) {
                    return Ok((x, r));
                }
                break;
            }
            lambda *= 10.0;
        }
        if !accepted {
            break;
        }
    }
    Ok((x, r))
}

fn jacobian(
    pool: &mut Pool,
    x: &[f64],
    r: &[f64],
    lo: &[f64],
    hi: &[f64],
    coins: &[(usize, usize)],
    targs: &[f64],
) -> Result<Vec<Vec<f64>>, SimError> {
    let n = x.len();
    let m = r.len();
    let mut jac = vec![vec![0.0; n]; m];
    for k in 0..n {
        let mut step = (x[k].abs() * 1e-8).max(1e10);
        if x[k] + step > hi[k] {
            step = -step;
        }
        let mut xp = x.to_vec();
        xp[k] = (x[k] + step).clamp(lo[k], hi[k]);
        let actual = xp[k] - x[k];
        if actual == 0.0 {
            continue;
        }
        let rp = residuals(pool, &xp, coins, targs)?;
        for (row, (&rpi, &ri)) in jac.iter_mut().zip(rp.iter().zip(r.iter())) {
            row[k] = (rpi - ri) / actual;
        }
    }
    Ok(jac)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Gaussian elimination with partial pivoting; `None` for singular systems.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&p, &q| {
            a[p][col]
                .abs()
                .partial_cmp(&a[q][col].abs())
                .unwrap_or(Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-300 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let f = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= f * a[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for col in (0..n).rev() {
        let mut s = b[col];
        for k in col + 1..n {
            s -= a[col][k] * x[k];
        }
        x[col] = s / a[col][col];
    }
    Some(x)
}

/// Classic Brent root finder over a sign-changing bracket.
fn brentq<F>(mut f: F, xa: f64, xb: f64) -> Result<f64, SimError>
where
    F: FnMut(f64) -> Result<f64, SimError>,
{
    let (mut a, mut b) = (xa, xb);
    let mut fa = f(a)?;
    let mut fb = f(b)?;
    if fa == 0.0 {
        return Ok(a);
    }
    if fb == 0.0 {
        return Ok(b);
    }
    if fa.signum() == fb.signum() {
        return Err(SimError::Solver("root not bracketed".into()));
    }
    let (mut c, mut fc) = (a, fa);
    let mut d = b - a;
    let mut e = d;

    for _ in 0..BRENT_MAX_ITER {
        if fb.signum() == fc.signum() {
            c = a;
            fc = fa;
            d = b - a;
            e = d;
        }
        if fc.abs() < fb.abs() {
            a = b;
            b = c;
            c = a;
            fa = fb;
            fb = fc;
            fc = fa;
        }
        let tol = 2.0 * BRENT_RTOL * b.abs() + 0.5 * BRENT_XTOL;
        let m = 0.5 * (c - b);
        if m.abs() <= tol || fb == 0.0 {
            return Ok(b);
        }
        if e.abs() < tol || fa.abs() <= fb.abs() {
            d = m;
            e = m;
        } else {
            let s = fb / fa;
            let (mut p, mut q);
            if a == c {
                p = 2.0 * m * s;
                q = 1.0 - s;
            } else {
                let qa = fa / fc;
                let rb = fb / fc;
                p = s * (2.0 * m * qa * (qa - rb) - (b - a) * (rb - 1.0));
                q = (qa - 1.0) * (rb - 1.0) * (s - 1.0);
            }
            if p > 0.0 {
                q = -q;
            } else {
                p = -p;
            }
            if 2.0 * p < (3.0 * m * q - (tol * q).abs()).min((e * q).abs()) {
                e = d;
                d = p / q;
            } else {
                d = m;
                e = m;
            }
        }
        a = b;
        fa = fb;
        b += if d.abs() > tol {
            d
        } else if m > 0.0 {
            tol
        } else {
            -tol
        };
        fb = f(b)?;
    }
    Ok(b)
}

/// Proportion of pool holdings needed to move each pair's price by
/// `size` (default 0.1%), both directions per pair. Metapools are
/// measured transiently as flat pools against their base LP.
pub fn price_depth(pool: &Pool, size: f64) -> Result<Vec<f64>, SimError> {
    let flat = pool.depth_view()?;
    let pairs = coin_pairs(flat.n);
    let sum_xp: u128 = flat.xp().iter().sum();
    if sum_xp == 0 {
        return Err(SimError::InsufficientLiquidity);
    }
    let mut view = Pool::Flat(flat);
    let mut depth = Vec::with_capacity(pairs.len() * 2);
    for &(i, j) in &pairs {
        for (a, b) in [(i, j), (j, i)] {
            let target = view.dydx_fee(a, b, PROBE_DX)? * (1.0 - size);
            let res = optarb(&mut view, a, b, target)?;
            depth.push(res.trade.2 as f64 / sum_xp as f64);
        }
    }
    Ok(depth)
}
