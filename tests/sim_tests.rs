use chrono::{Duration, TimeZone, Utc};
use stablesim::market::{coin_pairs, Market};
use stablesim::metrics::{annualized_return, infer_step_minutes, summarize};
use stablesim::pool::PRECISION;
use stablesim::registry::PoolTemplate;
use stablesim::sim::run_sim;
use stablesim::sweep::{grid_points, run_grid};

/// Synthetic market: flat unit prices, zero volume, 30-minute steps.
fn flat_market(n_coins: usize, steps: usize) -> Market {
    let start = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
    let pairs = coin_pairs(n_coins);
    let timestamps = (0..steps)
        .map(|k| start + Duration::minutes(30 * k as i64))
        .collect();
    let prices = vec![vec![1.0; pairs.len()]; steps];
    let volumes = vec![vec![0.0; pairs.len()]; steps];
    Market::new(timestamps, pairs, prices, volumes).unwrap()
}

fn three_pool_template() -> PoolTemplate {
    PoolTemplate {
        a: 2000,
        n: 3,
        total_deposit: Some(850_000_000 * PRECISION),
        balances: None,
        rates: vec![
            PRECISION,
            1_000_000_000_000_000_000_000_000_000_000,
            1_000_000_000_000_000_000_000_000_000_000,
        ],
        fee: 4_000_000,
        fee_mul: None,
        lp_supply: None,
        redemption_priced: false,
        base: None,
    }
}

#[test]
fn test_quiet_market_leaves_the_pool_still() {
    let market = flat_market(3, 10);
    let mut pool = three_pool_template().build(None, None).unwrap();
    let series = run_sim(&mut pool, &market, &[0.0; 3], None);

    assert_eq!(series.timestamps.len(), 10);
    for t in 0..10 {
        assert_eq!(series.volume[t], 0.0, "no volume budget means no trades");
        assert!(
            (series.bal[t] - 1.0).abs() < 1e-9,
            "even split must stay perfectly balanced, got {}",
            series.bal[t]
        );
        assert_eq!(
            series.pool_value[t], series.pool_value[0],
            "pool value must stay constant with no trades"
        );
        assert_eq!(
            series.holdings[t], series.holdings[0],
            "holdings must not move"
        );
        assert!(series.depth[t] > 0.0);
    }

    let step_minutes = infer_step_minutes(&series.timestamps);
    assert_eq!(step_minutes, 30.0);
    assert_eq!(annualized_return(&series.pool_value, step_minutes), 0.0);
}

#[test]
fn test_grid_ordering_and_quiet_grid() {
    let market = flat_market(3, 6);
    let template = three_pool_template();
    let a_list = [100u128, 1000];
    let fee_list = [3_000_000u128, 4_000_000];

    let points = grid_points(&a_list, &fee_list);
    let expected: Vec<(u128, u128)> = vec![
        (100, 3_000_000),
        (100, 4_000_000),
        (1000, 3_000_000),
        (1000, 4_000_000),
    ];
    assert_eq!(
        points.iter().map(|p| (p.a, p.fee)).collect::<Vec<_>>(),
        expected
    );

    let results = run_grid(
        &template,
        &a_list,
        &fee_list,
        &market,
        &[0.0; 3],
        None,
        2,
    )
    .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(
        results.iter().map(|r| (r.a, r.fee)).collect::<Vec<_>>(),
        expected,
        "results must keep A_list x fee_list order"
    );

    for result in &results {
        let series = result.series.as_ref().expect("grid point failed");
        assert!(series.volume.iter().all(|&v| v == 0.0));
        assert!(series.bal.iter().all(|&b| (b - 1.0).abs() < 1e-9));
        let summary = summarize(result.a, result.fee, series);
        assert_eq!(summary.annualized_return, 0.0);
        assert_eq!(summary.total_volume, 0.0);
    }
}

#[test]
fn test_identical_runs_are_bit_identical() {
    let market = flat_market(3, 6);
    let template = three_pool_template();
    let a_list = [1000u128];
    let fee_list = [4_000_000u128];

    let run = || {
        run_grid(&template, &a_list, &fee_list, &market, &[0.0; 3], None, 1).unwrap()
    };
    let first = run();
    let second = run();

    for (a, b) in first.iter().zip(&second) {
        let sa = a.series.as_ref().unwrap();
        let sb = b.series.as_ref().unwrap();
        assert_eq!(sa.holdings, sb.holdings, "holdings series must match bit-for-bit");
        assert_eq!(sa.rates, sb.rates);
        assert!(sa
            .pool_value
            .iter()
            .zip(&sb.pool_value)
            .all(|(x, y)| x.to_bits() == y.to_bits()));
    }
}

#[test]
fn test_mispriced_market_generates_volume_and_convergence() {
    // one pair persistently mispriced, generous volume budget
    let start = Utc.with_ymd_and_hms(2021, 6, 1, 0, 0, 0).unwrap();
    let pairs = coin_pairs(3);
    let steps = 4;
    let timestamps = (0..steps)
        .map(|k| start + Duration::minutes(30 * k as i64))
        .collect();
    // coin 0 trades cheap against both others, a consistent triangle
    let prices = vec![vec![0.999, 0.999, 1.0]; steps];
    let volumes = vec![vec![1e9; pairs.len()]; steps];
    let market = Market::new(timestamps, pairs, prices, volumes).unwrap();

    let mut pool = three_pool_template().build(None, None).unwrap();
    let series = run_sim(&mut pool, &market, &[1.0; 3], None);

    assert!(
        series.volume[0] > 0.0,
        "the mispricing must be arbitraged on the first step"
    );
    assert!(
        series.volume[1] < series.volume[0] * 0.1,
        "once arbitraged, later steps need almost no volume: {} vs {}",
        series.volume[1],
        series.volume[0]
    );
    assert!(
        series.err[1] <= series.err[0] + 1e-6,
        "residual error must not grow after the first step"
    );
    // fees accrued: the pool gained value in its own unit of account
    assert!(series.pool_value[steps - 1] >= series.pool_value[0]);
}

#[test]
fn test_redemption_series_is_written_into_rates() {
    let market = flat_market(3, 4);
    let mut template = three_pool_template();
    template.rates = vec![PRECISION; 3];
    template.redemption_priced = true;

    let redemption: Vec<u128> = (0..4)
        .map(|k| PRECISION + k as u128 * PRECISION / 1000)
        .collect();

    let mut pool = template.build(None, None).unwrap();
    let series = run_sim(&mut pool, &market, &[0.0; 3], Some(&redemption));

    for t in 0..4 {
        assert_eq!(
            series.rates[t][0], redemption[t],
            "step {} must carry the step's redemption price",
            t
        );
    }
}
