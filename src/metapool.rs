//! Metapool composition and the `Pool` sum type the simulator drives.
//!
//! A metapool is an outer pool whose last slot holds the LP token of a
//! base pool. Trades over the flattened coin set are split on
//! `base_i = i - max_coin`: negative means the outer pool's own coins,
//! non-negative means a base coin reached through deposit/withdraw on the
//! base. The base pool is kept in LP precision (rates of 10^18, balances
//! pre-normalized), the convention all cross-pool accounting relies on.

use num_bigint::BigInt;
use num_traits::Pow;

use crate::error::SimError;
use crate::pool::{big, mul_div, ratio_f64, FlatPool, FEE_DENOM, PRECISION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaPool {
    pub outer: FlatPool,
    pub base: FlatPool,
}

impl MetaPool {
    pub fn new(outer: FlatPool, base: FlatPool) -> Result<Self, SimError> {
        if outer.n < 2 {
            return Err(SimError::Config("metapool outer side needs >= 2 slots".into()));
        }
        Ok(MetaPool { outer, base })
    }

    /// Index of the outer slot holding the base LP token.
    pub fn max_coin(&self) -> usize {
        self.outer.n - 1
    }

    /// Flattened coin count: outer coins plus base coins, minus the LP slot.
    pub fn n_total(&self) -> usize {
        self.outer.n + self.base.n - 1
    }

    /// Outer rates with the LP slot refreshed to the base virtual price.
    pub fn live_rates(&self) -> Result<Vec<u128>, SimError> {
        let mut rates = self.outer.rates.clone();
        rates[self.max_coin()] = self.base.virtual_price()?;
        Ok(rates)
    }

    /// Outer virtual balances under `live_rates`.
    pub fn xp_live(&self) -> Result<Vec<u128>, SimError> {
        Ok(FlatPool::xp_of(&self.outer.balances, &self.live_rates()?))
    }

    /// Split flattened indices into (base_i, base_j, meta_i, meta_j).
    pub(crate) fn split(&self, i: usize, j: usize) -> (isize, isize, usize, usize) {
        let mc = self.max_coin();
        let base_i = i as isize - mc as isize;
        let base_j = j as isize - mc as isize;
        let meta_i = if base_i < 0 { i } else { mc };
        let meta_j = if base_j < 0 { j } else { mc };
        (base_i, base_j, meta_i, meta_j)
    }

    /// Swap `dx` of flattened coin `i` for flattened coin `j`.
    ///
    /// Returns `(dy_net, fee)` in coin-j real units. Fees compose: the
    /// outer fee is charged once on the meta-level leg and the base
    /// pool's one-sided deposit/withdraw fee on the base leg.
    pub fn exchange(&mut self, i: usize, j: usize, dx: u128) -> Result<(u128, u128), SimError> {
        let (base_i, base_j, meta_i, meta_j) = self.split(i, j);

        if base_i >= 0 && base_j >= 0 {
            let (dy, base_fee) = self.base.exchange(base_i as usize, base_j as usize, dx)?;
            let outer_fee = mul_div(dy, self.outer.fee, FEE_DENOM);
            if dy <= outer_fee {
                return Err(SimError::InsufficientLiquidity);
            }
            return Ok((dy - outer_fee, base_fee + outer_fee));
        }

        let rates = self.live_rates()?;
        let xp = FlatPool::xp_of(&self.outer.balances, &rates);
        let mc = self.max_coin();

        let x = if base_i < 0 {
            self.outer.balances[i] += dx;
            xp[i] + mul_div(dx, rates[i], PRECISION)
        } else {
            let mut base_inputs = vec![0u128; self.base.n];
            base_inputs[base_i as usize] = dx;
            let dx_lp = self.base.add_liquidity(&base_inputs)?;
            self.outer.balances[mc] += dx_lp;
            xp[mc] + mul_div(dx_lp, rates[mc], PRECISION)
        };

        let y = self.outer.y(meta_i, meta_j, x, &xp)?;
        let gross = xp[meta_j]
            .checked_sub(y)
            .ok_or(SimError::InsufficientLiquidity)?;
        if gross <= 1 {
            return Err(SimError::InsufficientLiquidity);
        }
        let dy = gross - 1;
        let dy_fee = mul_div(dy, self.outer.fee, FEE_DENOM);

        let dy_nofee_real = mul_div(dy, PRECISION, rates[meta_j]);
        let dy_real = mul_div(dy - dy_fee, PRECISION, rates[meta_j]);
        self.outer.balances[meta_j] = self.outer.balances[meta_j]
            .checked_sub(dy_real)
            .ok_or(SimError::InsufficientLiquidity)?;

        if base_j >= 0 {
            let dy_out = self
                .base
                .remove_liquidity_one_coin(dy_real, base_j as usize)?;
            let dy_nofee_out =
                self.base
                    .calc_withdraw_one_coin(dy_nofee_real, base_j as usize, false)?;
            Ok((dy_out, dy_nofee_out.saturating_sub(dy_out)))
        } else {
            Ok((dy_real, mul_div(dy_fee, PRECISION, rates[meta_j])))
        }
    }

    /// Non-mutating output quote mirroring `exchange`.
    pub fn dy(&self, i: usize, j: usize, dx: u128) -> Result<u128, SimError> {
        let (base_i, base_j, meta_i, meta_j) = self.split(i, j);

        if base_i >= 0 && base_j >= 0 {
            let dy = self.base.dy(base_i as usize, base_j as usize, dx)?;
            let base_fee = mul_div(dy, self.base.fee, FEE_DENOM);
            let dy = dy - base_fee;
            return Ok(dy - mul_div(dy, self.outer.fee, FEE_DENOM));
        }

        let rates = self.live_rates()?;
        let xp = FlatPool::xp_of(&self.outer.balances, &rates);
        let mc = self.max_coin();

        let x = if base_i < 0 {
            xp[i] + mul_div(dx, rates[i], PRECISION)
        } else {
            let mut base_inputs = vec![0u128; self.base.n];
            base_inputs[base_i as usize] = dx;
            let dx_lp = self.base.calc_token_amount(&base_inputs)?;
            xp[mc] + mul_div(dx_lp, rates[mc], PRECISION)
        };

        let y = self.outer.y(meta_i, meta_j, x, &xp)?;
        let gross = xp[meta_j]
            .checked_sub(y)
            .ok_or(SimError::InsufficientLiquidity)?;
        if gross <= 1 {
            return Err(SimError::InsufficientLiquidity);
        }
        let dy = gross - 1;
        let dy_fee = mul_div(dy, self.outer.fee, FEE_DENOM);
        let dy_real = mul_div(dy - dy_fee, PRECISION, rates[meta_j]);

        if base_j >= 0 {
            self.base
                .calc_withdraw_one_coin(dy_real, base_j as usize, true)
        } else {
            Ok(dy_real)
        }
    }

    /// Marginal fee-adjusted price over flattened indices.
    ///
    /// Primary-to-base goes through the derivative of the base invariant
    /// (`dz/dx_i = dz/dw · dw/dx_i`, `w` the base LP slot); base-to-primary
    /// probes through a deposit quote of size `dx`.
    pub fn dydx_fee(&self, i: usize, j: usize, dx: u128) -> Result<f64, SimError> {
        let (base_i, base_j, _, _) = self.split(i, j);

        if base_i >= 0 && base_j >= 0 {
            return self.base.dydx_fee(base_i as usize, base_j as usize);
        }

        let rates = self.live_rates()?;
        let xp = FlatPool::xp_of(&self.outer.balances, &rates);
        let mc = self.max_coin();

        if base_i < 0 {
            let bp = &self.base;
            let base_xp = bp.xp();
            let n = bp.n;
            let d = big(bp.d()?);
            let d_pow = Pow::pow(&d, (n + 1) as u32);
            let a_pow = big(bp.a) * Pow::pow(&big(n as u128), (n + 1) as u32);
            let x_prod: BigInt = base_xp.iter().map(|&x| big(x)).product();
            let xj = big(base_xp[base_j as usize]);

            let num = -(&a_pow * &x_prod + &d_pow / &xj);
            let den = Pow::pow(&big(n as u128), n as u32) * &x_prod
                - &a_pow * &x_prod
                - Pow::pow(&d, n as u32) * (n as u32 + 1);
            let d_prime = ratio_f64(&num, &den);

            let dwdz = self.outer.dydx_fee_xp(i, mc, &xp)?;

            let fee = if bp.fee > 0 {
                let sum_base: u128 = base_xp.iter().sum();
                bp.fee - mul_div(bp.fee, base_xp[base_j as usize], sum_base) + 500_000
            } else {
                0
            };
            Ok(dwdz / d_prime * (1.0 - fee as f64 / FEE_DENOM as f64))
        } else {
            let mut base_inputs = vec![0u128; self.base.n];
            base_inputs[base_i as usize] = dx;
            let dw = self.base.calc_token_amount(&base_inputs)?;
            let x = xp[mc] + mul_div(dw, rates[mc], PRECISION);

            let y = self.outer.y(mc, j, x, &xp)?;
            let gross = xp[j]
                .checked_sub(y)
                .ok_or(SimError::InsufficientLiquidity)?;
            if gross <= 1 {
                return Err(SimError::InsufficientLiquidity);
            }
            let dy = gross - 1;
            let dy_fee = mul_div(dy, self.outer.fee, FEE_DENOM);
            let dy_real = mul_div(dy - dy_fee, PRECISION, rates[j]);
            Ok(dy_real as f64 / dx as f64)
        }
    }
}

/// A pool under simulation: plain, or a metapool over a base pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pool {
    Flat(FlatPool),
    Meta(MetaPool),
}

/// By-value copy of everything a trade can touch. Restoring one must
/// reproduce the pre-trade state exactly, base LP supply included; the
/// arbitrage solvers lean on that for every objective evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    balances: Vec<u128>,
    base_balances: Option<Vec<u128>>,
    base_lp_supply: Option<u128>,
}

impl Pool {
    pub fn n_total(&self) -> usize {
        match self {
            Pool::Flat(p) => p.n,
            Pool::Meta(m) => m.n_total(),
        }
    }

    pub fn exchange(&mut self, i: usize, j: usize, dx: u128) -> Result<(u128, u128), SimError> {
        match self {
            Pool::Flat(p) => p.exchange(i, j, dx),
            Pool::Meta(m) => m.exchange(i, j, dx),
        }
    }

    /// Marginal fee-adjusted price; `dx` is the probe size used where a
    /// closed form is not available.
    pub fn dydx_fee(&self, i: usize, j: usize, dx: u128) -> Result<f64, SimError> {
        match self {
            Pool::Flat(p) => p.dydx_fee(i, j),
            Pool::Meta(m) => m.dydx_fee(i, j, dx),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        match self {
            Pool::Flat(p) => PoolSnapshot {
                balances: p.balances.clone(),
                base_balances: None,
                base_lp_supply: None,
            },
            Pool::Meta(m) => PoolSnapshot {
                balances: m.outer.balances.clone(),
                base_balances: Some(m.base.balances.clone()),
                base_lp_supply: Some(m.base.lp_supply),
            },
        }
    }

    pub fn restore(&mut self, snap: &PoolSnapshot) {
        match self {
            Pool::Flat(p) => {
                p.balances.clone_from(&snap.balances);
            }
            Pool::Meta(m) => {
                m.outer.balances.clone_from(&snap.balances);
                if let Some(b) = &snap.base_balances {
                    m.base.balances.clone_from(b);
                }
                if let Some(t) = snap.base_lp_supply {
                    m.base.lp_supply = t;
                }
            }
        }
    }

    /// Write an externally supplied redemption rate into slot 0.
    pub fn set_redemption_rate(&mut self, r: u128) {
        match self {
            Pool::Flat(p) => p.rates[0] = r,
            Pool::Meta(m) => m.outer.rates[0] = r,
        }
    }

    /// Raw balances of the pool's own slots (outer side for metapools).
    pub fn holdings(&self) -> &[u128] {
        match self {
            Pool::Flat(p) => &p.balances,
            Pool::Meta(m) => &m.outer.balances,
        }
    }

    /// Rate vector used to value trade volume per flattened coin index.
    pub fn volume_rates(&self) -> Vec<u128> {
        match self {
            Pool::Flat(p) => p.rates.clone(),
            Pool::Meta(m) => {
                let mc = m.max_coin();
                let mut rates = m.outer.rates[..mc].to_vec();
                rates.extend_from_slice(&m.base.rates);
                rates
            }
        }
    }

    /// Current rates as recorded per step (base virtual price substituted
    /// into the LP slot for metapools).
    pub fn rates_snapshot(&self) -> Result<Vec<u128>, SimError> {
        match self {
            Pool::Flat(p) => Ok(p.rates.clone()),
            Pool::Meta(m) => m.live_rates(),
        }
    }

    /// Pool value measured as D, in a stable unit of account: for
    /// redemption-priced metapools the redemption slot is pinned to its
    /// initial value `r0` so value does not drift with the peg.
    pub fn pool_value(&self, r0: Option<u128>) -> Result<u128, SimError> {
        match self {
            Pool::Flat(p) => p.d(),
            Pool::Meta(m) => {
                let mut rates = m.live_rates()?;
                if let Some(r0) = r0 {
                    let mc = m.max_coin();
                    rates[mc - 1] = r0;
                }
                let xp = FlatPool::xp_of(&m.outer.balances, &rates);
                m.outer.d_xp(&xp)
            }
        }
    }

    /// Balance index in [0, 1]: 1 at perfect balance, 0 when all holdings
    /// sit in one coin.
    pub fn balance_metric(&self) -> Result<f64, SimError> {
        let (xp, n) = match self {
            Pool::Flat(p) => (p.xp(), p.n),
            Pool::Meta(m) => (m.xp_live()?, m.outer.n),
        };
        let total: u128 = xp.iter().sum();
        if total == 0 {
            return Ok(0.0);
        }
        let n_f = n as f64;
        let dev: f64 = xp
            .iter()
            .map(|&x| (x as f64 / total as f64 - 1.0 / n_f).abs())
            .sum();
        Ok(1.0 - dev / (2.0 * (n_f - 1.0) / n_f))
    }

    /// Flat view used for depth measurements: metapools are transiently
    /// priced against their base LP at the current virtual price.
    pub fn depth_view(&self) -> Result<FlatPool, SimError> {
        match self {
            Pool::Flat(p) => Ok(p.clone()),
            Pool::Meta(m) => {
                let mut flat = m.outer.clone();
                flat.rates = m.live_rates()?;
                Ok(flat)
            }
        }
    }

    pub fn virtual_price(&self) -> Result<u128, SimError> {
        match self {
            Pool::Flat(p) => p.virtual_price(),
            Pool::Meta(m) => {
                let xp = m.xp_live()?;
                let d = m.outer.d_xp(&xp)?;
                Ok(mul_div(d, PRECISION, m.outer.lp_supply))
            }
        }
    }
}
