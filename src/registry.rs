//! Pool-template registry and the abstracted on-chain query surface.
//!
//! The registry is a `;`-separated CSV keyed by pool name:
//!
//! ```text
//! name;address;coins;precmul;tokentype;basepool;feemul
//! 3pool;0xbebc...;['DAI','USDC','USDT'];[1e18,1e30,1e30];['','',''];;
//! ```
//!
//! `precmul` entries are rate multipliers in 10^18 units; the literal
//! `r` marks a redemption-priced slot. `tokentype` entries `c`/`y` mark
//! compound/yearn-style rebasing coins whose live rate must be queried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::SimError;
use crate::metapool::{MetaPool, Pool};
use crate::pool::{mul_div, FlatPool, PRECISION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Plain,
    Compound,
    Yearn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecMul {
    Fixed(u128),
    Redemption,
}

/// One parsed registry row.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub name: String,
    pub address: String,
    pub coins: Vec<String>,
    pub precmul: Vec<PrecMul>,
    pub tokentype: Vec<TokenKind>,
    pub basepool: Option<String>,
    pub feemul: Option<u128>,
}

impl PoolEntry {
    pub fn is_redemption_priced(&self) -> bool {
        self.precmul.first() == Some(&PrecMul::Redemption)
    }
}

pub fn load_registry(path: &Path) -> Result<HashMap<String, PoolEntry>, SimError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))?;

    let mut out = HashMap::new();
    for record in rdr.records() {
        let record = record.map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
        let name = field(0);
        if name.is_empty() {
            continue;
        }
        let coins = parse_list(&field(2));
        let precmul = parse_list(&field(3))
            .iter()
            .map(|s| parse_precmul(s))
            .collect::<Result<Vec<_>, _>>()?;
        let tokentype = parse_list(&field(4))
            .iter()
            .map(|s| parse_tokenkind(s))
            .collect::<Result<Vec<_>, _>>()?;
        if precmul.len() != coins.len() {
            return Err(SimError::Config(format!(
                "pool {name}: {} coins but {} precmul entries",
                coins.len(),
                precmul.len()
            )));
        }
        let basepool = match field(5).as_str() {
            "" | "None" => None,
            b => Some(b.to_string()),
        };
        let feemul = match field(6).as_str() {
            "" | "None" => None,
            f => Some(f.parse::<u128>().map_err(|e| {
                SimError::Config(format!("pool {name}: bad feemul {f}: {e}"))
            })?),
        };
        out.insert(
            name.clone(),
            PoolEntry {
                name,
                address: field(1),
                coins,
                precmul,
                tokentype,
                basepool,
                feemul,
            },
        );
    }
    Ok(out)
}

fn parse_list(raw: &str) -> Vec<String> {
    let inner = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().is_empty() {
        return Vec::new();
    }
    inner
        .split(',')
        .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
        .collect()
}

fn parse_precmul(s: &str) -> Result<PrecMul, SimError> {
    if s == "r" {
        return Ok(PrecMul::Redemption);
    }
    // allow 1e18-style exponents alongside plain integers
    if let Some(v) = parse_u128_maybe_exp(s) {
        return Ok(PrecMul::Fixed(v));
    }
    Err(SimError::Config(format!("bad precmul entry: {s}")))
}

fn parse_u128_maybe_exp(s: &str) -> Option<u128> {
    if let Ok(v) = s.parse::<u128>() {
        return Some(v);
    }
    let (mantissa, exp) = s.split_once(['e', 'E'])?;
    let mantissa = mantissa.parse::<u128>().ok()?;
    let exp = exp.parse::<u32>().ok()?;
    mantissa.checked_mul(10u128.checked_pow(exp)?)
}

fn parse_tokenkind(s: &str) -> Result<TokenKind, SimError> {
    match s {
        "" => Ok(TokenKind::Plain),
        "c" => Ok(TokenKind::Compound),
        "y" => Ok(TokenKind::Yearn),
        other => Err(SimError::Config(format!("bad tokentype entry: {other}"))),
    }
}

/// The on-chain query surface, abstracted so templates can be built from
/// a live node or a recorded snapshot alike. All values are `uint256` on
/// chain; everything this simulator needs fits `u128`.
pub trait ChainSource {
    fn a(&self, pool: &str) -> Result<u128, SimError>;
    fn fee(&self, pool: &str) -> Result<u128, SimError>;
    fn balance(&self, pool: &str, i: usize) -> Result<u128, SimError>;
    fn virtual_price(&self, pool: &str) -> Result<u128, SimError>;
    fn coin_address(&self, pool: &str, i: usize) -> Result<String, SimError>;
    /// `exchangeRateStored` (compound) or `getPricePerFullShare` (yearn).
    fn token_rate(&self, kind: TokenKind, coin: &str) -> Result<u128, SimError>;
}

/// Recorded pool state, one JSON file per address.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolStateSnapshot {
    pub a: u128,
    pub fee: u128,
    pub balances: Vec<u128>,
    pub virtual_price: u128,
    #[serde(default)]
    pub coins: Vec<String>,
    /// 2-month traded volume in whole-token units, when recorded.
    #[serde(default)]
    pub volume_2mo: Option<f64>,
}

/// Chain source backed by snapshot files in a directory.
#[derive(Debug, Clone)]
pub struct FileChainSource {
    dir: PathBuf,
}

impl FileChainSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileChainSource { dir: dir.into() }
    }

    pub fn state(&self, pool: &str) -> Result<PoolStateSnapshot, SimError> {
        let path = self.dir.join(format!("{pool}.json"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))
    }
}

impl ChainSource for FileChainSource {
    fn a(&self, pool: &str) -> Result<u128, SimError> {
        Ok(self.state(pool)?.a)
    }

    fn fee(&self, pool: &str) -> Result<u128, SimError> {
        Ok(self.state(pool)?.fee)
    }

    fn balance(&self, pool: &str, i: usize) -> Result<u128, SimError> {
        self.state(pool)?
            .balances
            .get(i)
            .copied()
            .ok_or_else(|| SimError::DataUnavailable(format!("{pool}: no balance {i}")))
    }

    fn virtual_price(&self, pool: &str) -> Result<u128, SimError> {
        Ok(self.state(pool)?.virtual_price)
    }

    fn coin_address(&self, pool: &str, i: usize) -> Result<String, SimError> {
        self.state(pool)?
            .coins
            .get(i)
            .cloned()
            .ok_or_else(|| SimError::DataUnavailable(format!("{pool}: no coin {i}")))
    }

    fn token_rate(&self, kind: TokenKind, coin: &str) -> Result<u128, SimError> {
        if kind == TokenKind::Plain {
            return Ok(PRECISION);
        }
        // rates are recorded per coin address regardless of kind
        let path = self.dir.join("token_rates.json");
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| SimError::DataUnavailable(format!("{}: {}", path.display(), e)))?;
        let rates: HashMap<String, u128> = serde_json::from_str(&raw)
            .map_err(|e| SimError::Config(format!("{}: {}", path.display(), e)))?;
        rates
            .get(coin)
            .copied()
            .ok_or_else(|| SimError::DataUnavailable(format!("no recorded rate for {coin}")))
    }
}

/// Everything needed to construct a fresh pool for one grid point.
#[derive(Debug, Clone)]
pub struct PoolTemplate {
    pub a: u128,
    pub n: usize,
    /// Even-split total deposit, or explicit balances.
    pub total_deposit: Option<u128>,
    pub balances: Option<Vec<u128>>,
    pub rates: Vec<u128>,
    pub fee: u128,
    pub fee_mul: Option<u128>,
    pub lp_supply: Option<u128>,
    pub redemption_priced: bool,
    /// Nested base pool for metapools; recursion depth is at most one.
    pub base: Option<Box<PoolTemplate>>,
}

impl PoolTemplate {
    /// Build the pool with optional `(A, fee)` overrides on the outer
    /// pool. The base pool always keeps its own parameters.
    pub fn build(&self, a: Option<u128>, fee: Option<u128>) -> Result<Pool, SimError> {
        match &self.base {
            None => {
                let mut pool = self.build_flat(a, fee, None)?;
                pool.redemption_priced = self.redemption_priced;
                Ok(Pool::Flat(pool))
            }
            Some(base) => {
                let base = base.build_flat(None, None, None)?;
                let vp = base.virtual_price()?;
                let mut outer = self.build_flat(a, fee, Some(vp))?;
                outer.redemption_priced = self.redemption_priced;
                Ok(Pool::Meta(MetaPool::new(outer, base)?))
            }
        }
    }

    /// Flat construction; `lp_slot_rate` substitutes the base virtual
    /// price into the last slot for the even-split seeding only, the way
    /// metapools are seeded (the stored rate stays as configured).
    fn build_flat(
        &self,
        a: Option<u128>,
        fee: Option<u128>,
        lp_slot_rate: Option<u128>,
    ) -> Result<FlatPool, SimError> {
        let a = a.unwrap_or(self.a);
        let fee = fee.unwrap_or(self.fee);
        let balances = match (&self.balances, self.total_deposit) {
            (Some(b), _) => b.clone(),
            (None, Some(d)) => {
                let mut split_rates = self.rates.clone();
                if let Some(vp) = lp_slot_rate {
                    split_rates[self.n - 1] = vp;
                }
                split_rates
                    .iter()
                    .map(|&p| mul_div(d / self.n as u128, PRECISION, p))
                    .collect()
            }
            (None, None) => {
                return Err(SimError::Config(
                    "template needs balances or a total deposit".into(),
                ))
            }
        };
        FlatPool::new(
            a,
            crate::pool::Deposit::Balances(balances),
            self.n,
            Some(self.rates.clone()),
            self.lp_supply,
            fee,
            self.fee_mul,
        )
    }
}

/// Resolve a registry entry (and its base pool, if any) into a template,
/// querying live balances, rates and LP calibration through `chain`.
///
/// With `balanced` the template seeds every grid point from an even
/// split of the current invariant rather than the live balances.
/// `redemption_rate` supplies the current redemption price for pools
/// whose first precmul is the `r` literal.
pub fn build_template(
    entry: &PoolEntry,
    base_entry: Option<&PoolEntry>,
    chain: &dyn ChainSource,
    balanced: bool,
    redemption_rate: Option<u128>,
) -> Result<PoolTemplate, SimError> {
    let a = chain.a(&entry.address)?;
    let fee = chain.fee(&entry.address)?;

    match base_entry {
        None => {
            let balances = normalized_balances(entry, chain, redemption_rate)?;
            let n = balances.len();
            let rates = slot_rates(entry, n, redemption_rate)?;
            let probe = FlatPool::new(
                a,
                crate::pool::Deposit::Balances(balances.clone()),
                n,
                Some(rates.clone()),
                None,
                fee,
                entry.feemul,
            )?;
            let d_balanced = probe.d()?;
            let lp_supply = mul_div(d_balanced, PRECISION, chain.virtual_price(&entry.address)?);
            Ok(PoolTemplate {
                a,
                n,
                total_deposit: balanced.then_some(d_balanced),
                balances: (!balanced).then_some(balances),
                rates,
                fee,
                fee_mul: entry.feemul,
                lp_supply: Some(lp_supply),
                redemption_priced: entry.is_redemption_priced(),
                base: None,
            })
        }
        Some(base) => {
            let base_template = build_template(base, None, chain, balanced, None)?;

            let n = entry.coins.len() + 1;
            let mut outer_balances = normalized_balances(entry, chain, redemption_rate)?;
            // the LP slot stays in raw units; its rate is the live base
            // virtual price
            outer_balances.push(chain.balance(&entry.address, entry.coins.len())?);
            let mut rates = slot_rates(entry, entry.coins.len(), redemption_rate)?;
            rates.push(PRECISION);

            let base_flat = base_template.build_flat(None, None, None)?;
            let vp = base_flat.virtual_price()?;
            let total_deposit = if balanced {
                let mut live_rates = rates.clone();
                live_rates[n - 1] = vp;
                let xp = FlatPool::xp_of(&outer_balances, &live_rates);
                let probe = FlatPool::new(
                    a,
                    crate::pool::Deposit::Balances(outer_balances.clone()),
                    n,
                    Some(rates.clone()),
                    None,
                    fee,
                    entry.feemul,
                )?;
                Some(probe.d_xp(&xp)?)
            } else {
                None
            };

            Ok(PoolTemplate {
                a,
                n,
                total_deposit,
                balances: (!balanced).then_some(outer_balances),
                rates,
                fee,
                fee_mul: entry.feemul,
                lp_supply: None,
                redemption_priced: entry.is_redemption_priced(),
                base: Some(Box::new(base_template)),
            })
        }
    }
}

/// Live balances folded to 10^18 precision through precmul and, for
/// rebasing coins, the queried token rate.
fn normalized_balances(
    entry: &PoolEntry,
    chain: &dyn ChainSource,
    redemption_rate: Option<u128>,
) -> Result<Vec<u128>, SimError> {
    let mut out = Vec::with_capacity(entry.coins.len());
    for i in 0..entry.coins.len() {
        let raw = chain.balance(&entry.address, i)?;
        let precmul = match entry.precmul[i] {
            PrecMul::Fixed(p) => p,
            // redemption-priced slots stay in raw units; the redemption
            // rate is applied through rates[0] at simulation time
            PrecMul::Redemption => {
                redemption_rate.ok_or_else(|| {
                    SimError::Config(format!("pool {}: no redemption rate supplied", entry.name))
                })?;
                out.push(raw);
                continue;
            }
        };
        let kind = entry.tokentype.get(i).copied().unwrap_or(TokenKind::Plain);
        let rate = match kind {
            TokenKind::Plain => PRECISION,
            kind => chain.token_rate(kind, &chain.coin_address(&entry.address, i)?)?,
        };
        out.push(mul_div(mul_div(raw, precmul, PRECISION), rate, PRECISION));
    }
    Ok(out)
}

/// Rate multipliers per slot: 10^18 for pre-normalized slots, the live
/// redemption price for `r` slots.
fn slot_rates(
    entry: &PoolEntry,
    n: usize,
    redemption_rate: Option<u128>,
) -> Result<Vec<u128>, SimError> {
    let mut rates = vec![PRECISION; n];
    if entry.is_redemption_priced() {
        rates[0] = redemption_rate.ok_or_else(|| {
            SimError::Config(format!("pool {}: no redemption rate supplied", entry.name))
        })?;
    }
    Ok(rates)
}
