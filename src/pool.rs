//! Flat (plain) stableswap pool math.
//!
//! All invariant and quadratic iterations run over `BigInt`: the D and y
//! loops form products on the order of `D^(n+1)`, far past 128 bits.
//! Division is floored at every step and the left-to-right product order
//! inside `D_P` and `c` is load-bearing; reordering shifts the floored
//! result and the trajectories diverge visibly over a long run.

use num_bigint::BigInt;
use num_traits::{Pow, Signed, ToPrimitive, Zero};

use crate::error::SimError;

/// 10^18, the common scale virtual balances are normalized to.
pub const PRECISION: u128 = 1_000_000_000_000_000_000;
/// Fee denominator, 10^10.
pub const FEE_DENOM: u128 = 10_000_000_000;
/// Probe size (virtual units) for marginal-price and dynamic-fee estimates.
pub const PROBE_DX: u128 = 1_000_000_000_000;
/// Minimum sensible trade in virtual units.
pub const MIN_TRADE: u128 = 1_000_000_000_000;
/// Iteration cap for the D and y fixed-point loops.
pub const MAX_ITER: usize = 256;

pub(crate) fn big(v: u128) -> BigInt {
    BigInt::from(v)
}

pub(crate) fn to_u128(v: &BigInt) -> u128 {
    v.to_u128().expect("intermediate value out of u128 range")
}

/// Floor of `a * b / d` without overflowing.
pub(crate) fn mul_div(a: u128, b: u128, d: u128) -> u128 {
    to_u128(&(big(a) * big(b) / big(d)))
}

/// `num / den` as f64, keeping precision for operands far beyond 2^53.
pub(crate) fn ratio_f64(num: &BigInt, den: &BigInt) -> f64 {
    let q = num / den;
    let r = num - &q * den;
    let den_f = den.to_f64().unwrap_or(f64::INFINITY);
    q.to_f64().unwrap_or(f64::INFINITY) + r.to_f64().unwrap_or(0.0) / den_f
}

/// Initial deposit: a total `D` split evenly across coins, or explicit
/// raw balances.
#[derive(Debug, Clone)]
pub enum Deposit {
    Total(u128),
    Balances(Vec<u128>),
}

/// Mutable state of a plain stableswap pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatPool {
    /// Amplification, already scaled by `n^(n-1)` as in the pool contracts.
    pub a: u128,
    /// Number of coins.
    pub n: usize,
    /// Swap fee numerator over 10^10.
    pub fee: u128,
    /// Dynamic-fee multiplier; `None` for constant-fee pools.
    pub fee_mul: Option<u128>,
    /// Per-coin rate multipliers over 10^18. Carries decimal normalization
    /// and, for a metapool's LP slot, the base-pool virtual price.
    pub rates: Vec<u128>,
    /// Raw balances in each coin's own units.
    pub balances: Vec<u128>,
    /// Outstanding LP tokens.
    pub lp_supply: u128,
    /// True when `rates[0]` tracks an external redemption price.
    pub redemption_priced: bool,
}

impl FlatPool {
    pub fn new(
        a: u128,
        deposit: Deposit,
        n: usize,
        rates: Option<Vec<u128>>,
        lp_supply: Option<u128>,
        fee: u128,
        fee_mul: Option<u128>,
    ) -> Result<Self, SimError> {
        if n < 2 {
            return Err(SimError::Config("pool needs at least 2 coins".into()));
        }
        let rates = rates.unwrap_or_else(|| vec![PRECISION; n]);
        if rates.len() != n {
            return Err(SimError::Config(format!(
                "expected {} rate multipliers, got {}",
                n,
                rates.len()
            )));
        }
        let balances = match deposit {
            Deposit::Total(d) => rates
                .iter()
                .map(|&p| mul_div(d / n as u128, PRECISION, p))
                .collect(),
            Deposit::Balances(b) => {
                if b.len() != n {
                    return Err(SimError::Config(format!(
                        "expected {} balances, got {}",
                        n,
                        b.len()
                    )));
                }
                b
            }
        };
        let mut pool = FlatPool {
            a,
            n,
            fee,
            fee_mul,
            rates,
            balances,
            lp_supply: 0,
            redemption_priced: false,
        };
        pool.lp_supply = match lp_supply {
            Some(t) => t,
            None => pool.d()?,
        };
        Ok(pool)
    }

    /// Virtual balances: `balances[i] * rates[i] / 10^18`.
    pub fn xp(&self) -> Vec<u128> {
        Self::xp_of(&self.balances, &self.rates)
    }

    pub(crate) fn xp_of(balances: &[u128], rates: &[u128]) -> Vec<u128> {
        balances
            .iter()
            .zip(rates)
            .map(|(&x, &p)| mul_div(x, p, PRECISION))
            .collect()
    }

    /// The stableswap invariant over the current virtual balances.
    pub fn d(&self) -> Result<u128, SimError> {
        self.d_xp(&self.xp())
    }

    /// Invariant over an arbitrary virtual-balance vector:
    ///
    /// `A·n^n·S + D = A·n^n·D + D^(n+1) / (n^n · prod(xp))`
    ///
    /// solved by the fixed-point
    /// `D <- (Ann·S + DP·n)·D / ((Ann-1)·D + (n+1)·DP)` seeded at `S`.
    pub fn d_xp(&self, xp: &[u128]) -> Result<u128, SimError> {
        let s: BigInt = xp.iter().map(|&x| big(x)).sum();
        if s.is_zero() {
            return Ok(0);
        }
        if xp.iter().any(|&x| x == 0) {
            return Err(SimError::Convergence("D"));
        }
        let n = big(self.n as u128);
        let ann = big(self.a) * &n;
        let mut d = s.clone();
        let mut d_prev = BigInt::zero();
        let mut iters = 0;
        while (&d - &d_prev).abs() > BigInt::from(1u8) {
            if iters >= MAX_ITER {
                return Err(SimError::Convergence("D"));
            }
            iters += 1;
            let mut d_p = d.clone();
            for &x in xp {
                d_p = &d_p * &d / (&n * big(x));
            }
            d_prev = d.clone();
            d = (&ann * &s + &d_p * &n) * &d / ((&ann - 1u32) * &d + (&n + 1u32) * &d_p);
        }
        Ok(to_u128(&d))
    }

    /// New `xp[j]` after setting `xp[i] = x` while preserving D.
    ///
    /// Quadratic fixed-point `y <- (y^2 + c) / (2y + b)` seeded at `D`.
    pub fn y(&self, i: usize, j: usize, x: u128, xp: &[u128]) -> Result<u128, SimError> {
        let d = big(self.d_xp(xp)?);
        let n = big(self.n as u128);
        let ann = big(self.a) * &n;
        let mut full: Vec<u128> = xp.to_vec();
        full[i] = x;
        let xx: Vec<BigInt> = (0..self.n)
            .filter(|&k| k != j)
            .map(|k| big(full[k]))
            .collect();
        if xx.iter().any(|v| v.is_zero()) {
            return Err(SimError::Convergence("y"));
        }
        let mut c = d.clone();
        for v in &xx {
            c = &c * &d / (v * &n);
        }
        c = &c * &d / (&n * &ann);
        let b: BigInt = xx.iter().sum::<BigInt>() + &d / &ann - &d;
        self.quadratic(c, b, d, None)
    }

    /// Same quadratic, but against a target invariant `d_target` with the
    /// current `xp` minus index `i`. Used by one-sided withdrawals.
    pub fn y_d(&self, i: usize, d_target: u128) -> Result<u128, SimError> {
        let d = big(d_target);
        let n = big(self.n as u128);
        let ann = big(self.a) * &n;
        let xx: Vec<BigInt> = self
            .xp()
            .iter()
            .enumerate()
            .filter(|&(k, _)| k != i)
            .map(|(_, &x)| big(x))
            .collect();
        if xx.iter().any(|v| v.is_zero()) {
            return Err(SimError::Convergence("y"));
        }
        let mut c = d.clone();
        for v in &xx {
            c = &c * &d / (v * &n);
        }
        c = &c * &d / (&n * &ann);
        let b: BigInt = xx.iter().sum::<BigInt>() + &d / &ann;
        let offset = d.clone();
        self.quadratic(c, b, d, Some(offset))
    }

    /// Shared y/y_D iteration. With `offset` the denominator becomes
    /// `2y + b - offset`.
    fn quadratic(
        &self,
        c: BigInt,
        b: BigInt,
        seed: BigInt,
        offset: Option<BigInt>,
    ) -> Result<u128, SimError> {
        let mut y = seed;
        let mut y_prev = BigInt::zero();
        let mut iters = 0;
        while (&y - &y_prev).abs() > BigInt::from(1u8) {
            if iters >= MAX_ITER {
                return Err(SimError::Convergence("y"));
            }
            iters += 1;
            y_prev = y.clone();
            let den = match &offset {
                None => &y * 2u32 + &b,
                Some(d) => &y * 2u32 + &b - d,
            };
            y = (&y * &y + &c) / den;
        }
        Ok(to_u128(&y))
    }

    /// Output of trading `dx` of coin `i` for coin `j`, pre-fee, without
    /// mutating the pool.
    pub fn dy(&self, i: usize, j: usize, dx: u128) -> Result<u128, SimError> {
        let xp = self.xp();
        let y = self.y(i, j, xp[i] + dx, &xp)?;
        if y >= xp[j] {
            return Err(SimError::InsufficientLiquidity);
        }
        Ok(xp[j] - y)
    }

    /// Execute a swap of `dx` virtual units of coin `i` for coin `j`.
    ///
    /// Returns `(dy_net, fee)` in coin-j virtual units. The fee stays in
    /// the pool, credited back into `balances[j]`, so the virtual price
    /// never decreases across an exchange.
    pub fn exchange(&mut self, i: usize, j: usize, dx: u128) -> Result<(u128, u128), SimError> {
        let xp = self.xp();
        let x = xp[i] + dx;
        let y = self.y(i, j, x, &xp)?;
        if y >= xp[j] {
            return Err(SimError::InsufficientLiquidity);
        }
        let dy = xp[j] - y;
        let fee_rate = match self.fee_mul {
            None => self.fee,
            Some(_) => self.dynamic_fee((xp[i] + x) / 2, (xp[j] + y) / 2),
        };
        let fee = mul_div(dy, fee_rate, FEE_DENOM);
        if dy <= fee {
            return Err(SimError::InsufficientLiquidity);
        }
        self.balances[i] = mul_div(x, PRECISION, self.rates[i]);
        self.balances[j] = mul_div(y + fee, PRECISION, self.rates[j]);
        Ok((dy - fee, fee))
    }

    /// Imbalance-scaled fee rate for dynamic-fee pools. The squared sum is
    /// formed before the ratio so large balances cannot overflow it.
    pub fn dynamic_fee(&self, xpi: u128, xpj: u128) -> u128 {
        let fee_mul = match self.fee_mul {
            Some(m) => m,
            None => return self.fee,
        };
        let xps2 = big(xpi) + big(xpj);
        let xps2 = &xps2 * &xps2;
        let num = big(fee_mul) * big(self.fee);
        let den = (big(fee_mul) - big(FEE_DENOM)) * 4u32 * big(xpi) * big(xpj) / xps2
            + big(FEE_DENOM);
        to_u128(&(num / den))
    }

    fn d_balances(&self, balances: &[u128]) -> Result<u128, SimError> {
        self.d_xp(&Self::xp_of(balances, &self.rates))
    }

    fn imbalance_fee(&self) -> u128 {
        self.fee * self.n as u128 / (4 * (self.n as u128 - 1))
    }

    /// Deposit `amounts` (raw units) and mint LP tokens.
    ///
    /// The mint is measured against fee-deducted balances; the committed
    /// balances keep the fee, so it accrues to remaining LPs.
    pub fn add_liquidity(&mut self, amounts: &[u128]) -> Result<u128, SimError> {
        let (new, mint) = self.deposit_mint(amounts)?;
        self.balances = new;
        self.lp_supply += mint;
        Ok(mint)
    }

    /// Mint estimate for a deposit, without committing anything.
    pub fn calc_token_amount(&self, amounts: &[u128]) -> Result<u128, SimError> {
        let (_, mint) = self.deposit_mint(amounts)?;
        Ok(mint)
    }

    fn deposit_mint(&self, amounts: &[u128]) -> Result<(Vec<u128>, u128), SimError> {
        let imb_fee = self.imbalance_fee();
        let old = &self.balances;
        let d0 = self.d()?;
        let new: Vec<u128> = old.iter().zip(amounts).map(|(&o, &a)| o + a).collect();
        let d1 = self.d_balances(&new)?;
        let mut mint_balances = new.clone();
        for i in 0..self.n {
            let ideal = mul_div(d1, old[i], d0);
            let diff = ideal.abs_diff(new[i]);
            mint_balances[i] -= mul_div(imb_fee, diff, FEE_DENOM);
        }
        let d2 = self.d_balances(&mint_balances)?;
        let mint = big(self.lp_supply) * (big(d2) - big(d0)) / big(d0);
        Ok((new, to_u128(&mint.max(BigInt::zero()))))
    }

    /// Withdraw `amounts` (raw units), burning LP from the holder. The
    /// imbalance fee is charged against the burn measurement only.
    pub fn remove_liquidity_imbalance(&mut self, amounts: &[u128]) -> Result<u128, SimError> {
        let imb_fee = self.imbalance_fee();
        let old = self.balances.clone();
        let d0 = self.d()?;
        let mut new = Vec::with_capacity(self.n);
        for (o, &a) in old.iter().zip(amounts) {
            let left = o
                .checked_sub(a)
                .ok_or(SimError::InsufficientLiquidity)?;
            new.push(left);
        }
        let d1 = self.d_balances(&new)?;
        let mut burn_balances = new.clone();
        for i in 0..self.n {
            let ideal = mul_div(d1, old[i], d0);
            let diff = ideal.abs_diff(new[i]);
            burn_balances[i] = burn_balances[i]
                .checked_sub(mul_div(imb_fee, diff, FEE_DENOM))
                .ok_or(SimError::InsufficientLiquidity)?;
        }
        let d2 = self.d_balances(&burn_balances)?;
        let burn = to_u128(&(big(self.lp_supply) * (big(d0) - big(d2)) / big(d0)));
        if burn > self.lp_supply {
            return Err(SimError::InsufficientLiquidity);
        }
        self.balances = new;
        self.lp_supply -= burn;
        Ok(burn)
    }

    /// One-coin withdrawal quote. The fee term
    /// `fee - fee·xp[i]/Σxp + 5·10^5` rewards withdrawals that rebalance
    /// the pool; the additive offset follows the contract's rounding
    /// convention and must stay as-is.
    pub fn calc_withdraw_one_coin(
        &self,
        token_amount: u128,
        i: usize,
        apply_fee: bool,
    ) -> Result<u128, SimError> {
        let xp = self.xp();
        let sum_xp: u128 = xp.iter().sum();
        if sum_xp == 0 || self.lp_supply == 0 {
            return Err(SimError::InsufficientLiquidity);
        }
        let fee = if self.fee > 0 && apply_fee {
            self.fee - mul_div(self.fee, xp[i], sum_xp) + 500_000
        } else {
            0
        };
        let d0 = self.d_xp(&xp)?;
        let d1 = d0 - mul_div(token_amount, d0, self.lp_supply);
        let dy = xp[i]
            .checked_sub(self.y_d(i, d1)?)
            .ok_or(SimError::InsufficientLiquidity)?;
        Ok(dy - mul_div(dy, fee, FEE_DENOM))
    }

    /// Burn `token_amount` LP and withdraw entirely in coin `i`.
    ///
    /// Operates in LP precision: the withdrawn amount is subtracted from
    /// `balances[i]` directly, which is only consistent for pools whose
    /// rates are 10^18 (the convention base pools are normalized to).
    pub fn remove_liquidity_one_coin(
        &mut self,
        token_amount: u128,
        i: usize,
    ) -> Result<u128, SimError> {
        let dy = self.calc_withdraw_one_coin(token_amount, i, true)?;
        if dy > self.balances[i] || token_amount > self.lp_supply {
            return Err(SimError::InsufficientLiquidity);
        }
        self.balances[i] -= dy;
        self.lp_supply -= token_amount;
        Ok(dy)
    }

    /// `D · 10^18 / lp_supply`: the value of one LP token.
    pub fn virtual_price(&self) -> Result<u128, SimError> {
        if self.lp_supply == 0 {
            return Err(SimError::InsufficientLiquidity);
        }
        Ok(mul_div(self.d()?, PRECISION, self.lp_supply))
    }

    /// Marginal price `dy/dx · (1 - fee)` via the closed form
    ///
    /// `dydx = xp_j(xp_i·A_pow·x_prod + D_pow) / (xp_i(xp_j·A_pow·x_prod + D_pow))`
    ///
    /// with `A_pow = A·n^(n+1)` and `D_pow = D^(n+1)`.
    pub fn dydx_fee(&self, i: usize, j: usize) -> Result<f64, SimError> {
        self.dydx_fee_xp(i, j, &self.xp())
    }

    pub(crate) fn dydx_fee_xp(&self, i: usize, j: usize, xp: &[u128]) -> Result<f64, SimError> {
        let n = self.n;
        let d = big(self.d_xp(xp)?);
        let d_pow = Pow::pow(&d, (n + 1) as u32);
        let x_prod: BigInt = xp.iter().map(|&x| big(x)).product();
        let a_pow = big(self.a) * Pow::pow(&big(n as u128), (n + 1) as u32);
        let xi = big(xp[i]);
        let xj = big(xp[j]);
        let num = &xj * (&xi * &a_pow * &x_prod + &d_pow);
        let den = &xi * (&xj * &a_pow * &x_prod + &d_pow);
        let dydx = ratio_f64(&num, &den);
        let fee_factor = match self.fee_mul {
            None => self.fee as f64 / FEE_DENOM as f64,
            Some(_) => {
                let moved = (dydx * PROBE_DX as f64) as u128;
                let rate =
                    self.dynamic_fee(xp[i] + PROBE_DX / 2, xp[j].saturating_sub(moved / 2));
                rate as f64 / FEE_DENOM as f64
            }
        };
        Ok(dydx * (1.0 - fee_factor))
    }
}
