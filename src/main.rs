use std::path::PathBuf;

use clap::Parser;

use stablesim::error::SimError;
use stablesim::market::{vol_mult, Market, PoolShape, VolMode};
use stablesim::output;
use stablesim::registry::{build_template, load_registry, FileChainSource, PoolEntry};
use stablesim::subgraph;
use stablesim::sweep::run_grid;

#[derive(Parser)]
#[command(
    name = "stablesim",
    about = "Sweep amplified-invariant pool parameters against historical market data"
)]
struct Cli {
    /// Pool name from the registry CSV
    pool_name: String,

    /// Use a reduced 2x2 test grid
    #[arg(long)]
    test: bool,

    /// Comma-separated A values (default: 2^(6..13.5) half-steps)
    #[arg(long = "A", value_name = "LIST", value_delimiter = ',')]
    a: Option<Vec<f64>>,

    /// Comma-separated fees as decimal fractions, e.g. 0.0004
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    fee: Option<Vec<f64>>,

    /// Override the volume multiplier with a single scalar
    #[arg(long)]
    vol_mult: Option<f64>,

    /// Volume-limit mode: 1 proportional, 2 equal split, 3 hybrid
    #[arg(long, default_value_t = 1)]
    vol_mode: u8,

    /// Price data source
    #[arg(long, default_value = "local", value_parser = ["external", "local"])]
    src: String,

    /// Worker count for the grid sweep
    #[arg(long, default_value_t = 4)]
    ncpu: usize,

    /// Truncate the data rows to start,end
    #[arg(long, value_name = "START,END", value_delimiter = ',')]
    trunc: Option<Vec<usize>>,

    /// Directory holding the registry, chain snapshots and local data
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory for result tables
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let registry = load_registry(&cli.data_dir.join("pools.csv"))?;
    let entry = registry
        .get(&cli.pool_name)
        .ok_or_else(|| SimError::Config(format!("pool {} not in registry", cli.pool_name)))?;
    let base_entry = match &entry.basepool {
        None => None,
        Some(name) => Some(registry.get(name).ok_or_else(|| {
            SimError::Config(format!("base pool {name} not in registry"))
        })?),
    };

    let chain = FileChainSource::new(cli.data_dir.join("chain"));
    let client = reqwest::blocking::Client::new();
    let pool_dir = cli.data_dir.join(&cli.pool_name);

    // Flattened coin list over the outer and base pools
    let mut coins: Vec<String> = entry.coins.clone();
    if let Some(base) = base_entry {
        coins.extend(base.coins.iter().cloned());
    }
    let n_total = coins.len();

    println!("[{}] Loading market data ({})...", cli.pool_name, cli.src);
    let mut market = match cli.src.as_str() {
        "external" => {
            stablesim::coingecko::pool_prices(&client, stablesim::coingecko::API_URL, &coins, "usd", 60)?
        }
        _ => Market::from_csv_files(
            &pool_dir.join("prices.csv"),
            &pool_dir.join("volumes.csv"),
            n_total,
        )?,
    };
    if let Some(trunc) = &cli.trunc {
        if trunc.len() != 2 {
            return Err(SimError::Config("--trunc takes exactly start,end".into()).into());
        }
        market.truncate(trunc[0], trunc[1])?;
    }

    // Redemption series, forward-filled to the market index
    let redemption = if entry.is_redemption_priced() {
        let points = match cli.src.as_str() {
            "external" => subgraph::redemption_prices(
                &client,
                subgraph::REDEMPTION_SUBGRAPH_URL,
                1000,
            )?,
            _ => subgraph::redemption_from_csv(&pool_dir.join("redemption.csv"))?,
        };
        if points.is_empty() {
            return Err(SimError::DataUnavailable("empty redemption series".into()).into());
        }
        Some(subgraph::reindex_ffill(&points, &market.timestamps))
    } else {
        None
    };
    let redemption_last = redemption.as_ref().map(|r| r[r.len() - 1]);

    println!("[{}] Fetching pool data...", cli.pool_name);
    let template = build_template(entry, base_entry, &chain, true, redemption_last)?;

    let shape = match base_entry {
        None => PoolShape::Flat {
            n: entry.coins.len(),
        },
        Some(base) => PoolShape::Meta {
            n_outer: entry.coins.len() + 1,
            n_base: base.coins.len(),
        },
    };

    let multipliers = match cli.vol_mult {
        Some(m) => vec![m; market.n_pairs()],
        None => {
            let hist = historic_volumes(&cli, entry, base_entry, &chain, &client)?;
            vol_mult(VolMode::from_flag(cli.vol_mode)?, shape, &hist, &market)?
        }
    };
    println!("Volume multipliers: {multipliers:?}");

    let (a_list, fee_list) = parameter_grids(&cli);
    println!(
        "[{}] Running {} grid points on {} workers...",
        cli.pool_name,
        a_list.len() * fee_list.len(),
        cli.ncpu
    );

    let results = run_grid(
        &template,
        &a_list,
        &fee_list,
        &market,
        &multipliers,
        redemption.as_deref(),
        cli.ncpu,
    )?;

    let summaries = output::save_all(&results, &market, &coins, &cli.pool_name, &cli.output_dir)?;

    for s in &summaries {
        println!(
            "  A={:<6} fee={:<9} ar={:>8.4}% depth={:.6} bal={:.4} volume={:.0}",
            s.a,
            s.fee,
            s.annualized_return * 100.0,
            s.median_depth,
            s.mean_balance,
            s.total_volume
        );
    }
    for r in results.iter().filter(|r| r.error.is_some()) {
        eprintln!(
            "  A={} fee={} failed: {}",
            r.a,
            r.fee,
            r.error.as_deref().unwrap_or("")
        );
    }
    println!(
        "Saved results to {}",
        cli.output_dir.join(&cli.pool_name).display()
    );
    Ok(())
}

/// 2-month pool volume per address: recorded snapshot field locally, the
/// volume subgraph otherwise.
fn historic_volumes(
    cli: &Cli,
    entry: &PoolEntry,
    base_entry: Option<&PoolEntry>,
    chain: &FileChainSource,
    client: &reqwest::blocking::Client,
) -> Result<Vec<f64>, SimError> {
    let mut addresses = vec![entry.address.clone()];
    if let Some(base) = base_entry {
        addresses.push(base.address.clone());
    }
    addresses
        .iter()
        .map(|addr| match cli.src.as_str() {
            "external" => subgraph::pool_volume(client, subgraph::VOLUME_SUBGRAPH_URL, addr),
            _ => chain.state(addr)?.volume_2mo.ok_or_else(|| {
                SimError::DataUnavailable(format!("no recorded 2-month volume for {addr}"))
            }),
        })
        .collect()
}

fn parameter_grids(cli: &Cli) -> (Vec<u128>, Vec<u128>) {
    if cli.test {
        return (vec![100, 1000], vec![3_000_000, 4_000_000]);
    }
    let a_list: Vec<u128> = match &cli.a {
        Some(list) => list.iter().map(|a| a.round() as u128).collect(),
        // 2^6 .. 2^13.5 in half-exponent steps
        None => (12..28)
            .map(|k| 2f64.powf(k as f64 / 2.0).round() as u128)
            .collect(),
    };
    let fee_list = match &cli.fee {
        Some(fees) => fees.iter().map(|f| (f * 1e10).round() as u128).collect(),
        None => (0..5u128).map(|k| 2_000_000 + k * 1_000_000).collect(),
    };
    (a_list, fee_list)
}
