use approx::assert_relative_eq;
use stablesim::pool::{Deposit, FlatPool, FEE_DENOM, PRECISION};

/// Mainnet 3-pool snapshot: A = 2000 (contract-scaled), 0.04% fee,
/// 18/6/6-decimal coins.
fn three_pool() -> FlatPool {
    FlatPool::new(
        2000,
        Deposit::Balances(vec![
            295949605740077243186725223,
            284320067518878,
            288200854907854,
        ]),
        3,
        Some(vec![
            PRECISION,
            1_000_000_000_000_000_000_000_000_000_000,
            1_000_000_000_000_000_000_000_000_000_000,
        ]),
        Some(849743149250065202008212976),
        4_000_000,
        None,
    )
    .unwrap()
}

#[test]
fn test_mainnet_invariant_and_virtual_price() {
    let pool = three_pool();
    let vp = pool.virtual_price().unwrap();
    assert!(
        vp.abs_diff(1022038799187029697) <= 1,
        "virtual price {} off from mainnet reference",
        vp
    );

    // D equals lp_supply * virtual_price / 1e18 by definition
    let d = pool.d().unwrap();
    let reconstructed = (pool.lp_supply as f64) * (vp as f64) / 1e18;
    assert_relative_eq!(d as f64, reconstructed, max_relative = 1e-12);
}

#[test]
fn test_d_seeded_from_even_split_matches_sum() {
    // At perfect balance the invariant equals the sum of virtual balances
    let pool = FlatPool::new(
        1000,
        Deposit::Total(3_000_000 * PRECISION),
        3,
        None,
        None,
        4_000_000,
        None,
    )
    .unwrap();
    let xp = pool.xp();
    let sum: u128 = xp.iter().sum();
    let d = pool.d().unwrap();
    assert!(
        d.abs_diff(sum) <= 3,
        "balanced D {} should equal sum of balances {}",
        d,
        sum
    );
}

#[test]
fn test_exchange_moves_balances_and_preserves_d() {
    let mut pool = three_pool();
    let d_before = pool.d().unwrap();
    let bal0_before = pool.balances[0];
    let bal1_before = pool.balances[1];

    let dx = 1_000_000_000_000_000_000_000_000u128; // 10^24 virtual
    let (dy_net, fee) = pool.exchange(0, 1, dx).unwrap();
    assert!(dy_net > 0, "exchange must produce positive output");
    assert!(fee > 0, "fee must be charged");

    // coin 0 has an 1e18 rate, so raw == virtual
    assert_eq!(pool.balances[0], bal0_before + dx);

    // coin 1 drops by the net output in raw units (rate 1e30 -> / 1e12)
    let raw_out = (bal1_before - pool.balances[1]) as f64;
    assert_relative_eq!(raw_out, dy_net as f64 / 1e12, max_relative = 1e-9);

    // D grows by the fee credited back, bounded by the fee share of dx
    let d_after = pool.d().unwrap();
    assert!(d_after >= d_before, "D must not decrease across exchange");
    let max_growth = dx as f64 * 4e-4 * 3.0;
    assert!(
        (d_after - d_before) as f64 <= max_growth,
        "D grew {} which exceeds the fee bound {}",
        d_after - d_before,
        max_growth
    );
}

#[test]
fn test_quote_matches_exchange_pre_fee() {
    let pool = three_pool();
    let dx = 5_000_000_000_000_000_000_000u128;
    let quote = pool.dy(0, 2, dx).unwrap();

    let mut traded = pool.clone();
    let (dy_net, fee) = traded.exchange(0, 2, dx).unwrap();
    assert_eq!(quote, dy_net + fee, "quote must equal pre-fee output");
}

#[test]
fn test_round_trip_costs_at_most_two_fees() {
    let mut pool = three_pool();
    let d_start = pool.d().unwrap();
    let dx = 1_000_000_000_000_000_000_000_000u128;

    let (dy_net, _) = pool.exchange(0, 1, dx).unwrap();
    let (back, _) = pool.exchange(1, 0, dy_net).unwrap();

    assert!(back < dx, "round trip cannot profit");
    // two fee legs plus a little slippage
    let cost = (dx - back) as f64;
    assert!(
        cost <= dx as f64 * (2.0 * 4e-4 + 1e-4),
        "round trip cost {} exceeds two fee shares of {}",
        cost,
        dx
    );
    assert!(pool.d().unwrap() >= d_start);
}

#[test]
fn test_virtual_price_never_decreases_across_exchanges() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut pool = three_pool();
    let mut rng = StdRng::seed_from_u64(7);
    let mut vp_prev = pool.virtual_price().unwrap();

    for _ in 0..40 {
        let i = rng.gen_range(0..3);
        let mut j = rng.gen_range(0..3);
        if j == i {
            j = (j + 1) % 3;
        }
        let dx = rng.gen_range(1_000_000_000_000u128..10_000_000_000_000_000_000_000_000u128);
        if pool.exchange(i, j, dx).is_ok() {
            let vp = pool.virtual_price().unwrap();
            assert!(
                vp >= vp_prev,
                "virtual price fell {} -> {} after trade",
                vp_prev,
                vp
            );
            vp_prev = vp;
        }
    }
}

#[test]
fn test_marginal_price_product_at_balance() {
    let pool = FlatPool::new(
        2000,
        Deposit::Total(3_000_000 * PRECISION),
        3,
        None,
        None,
        4_000_000,
        None,
    )
    .unwrap();
    let fwd = pool.dydx_fee(0, 1).unwrap();
    let rev = pool.dydx_fee(1, 0).unwrap();
    let fee_factor = 1.0 - 4_000_000 as f64 / FEE_DENOM as f64;
    let expected = fee_factor * fee_factor;

    let product = fwd * rev;
    assert!(
        product <= expected + 1e-12,
        "price product {} above fee-squared bound {}",
        product,
        expected
    );
    assert!(
        product >= expected - 1e-12,
        "price product {} below fee-squared bound {}",
        product,
        expected
    );
}

#[test]
fn test_dynamic_fee_rises_with_imbalance() {
    let pool = FlatPool::new(
        2000,
        Deposit::Total(2_000_000 * PRECISION),
        2,
        None,
        None,
        4_000_000,
        Some(2 * FEE_DENOM),
    )
    .unwrap();

    let balanced = pool.dynamic_fee(1_000_000 * PRECISION, 1_000_000 * PRECISION);
    assert_eq!(balanced, 4_000_000, "balanced dynamic fee equals base fee");

    let skewed = pool.dynamic_fee(1_900_000 * PRECISION, 100_000 * PRECISION);
    assert!(
        skewed > balanced,
        "imbalance must raise the dynamic fee: {} vs {}",
        skewed,
        balanced
    );
    // capped by feemul * fee
    assert!(skewed <= 8_000_000);
}

#[test]
fn test_dynamic_fee_affects_exchange_output() {
    let make = |fee_mul: Option<u128>| {
        FlatPool::new(
            2000,
            Deposit::Balances(vec![1_900_000 * PRECISION, 100_000 * PRECISION]),
            2,
            None,
            None,
            4_000_000,
            fee_mul,
        )
        .unwrap()
    };
    let mut flat_fee = make(None);
    let mut dyn_fee = make(Some(2 * FEE_DENOM));
    let dx = 10_000 * PRECISION;

    let (out_flat, _) = flat_fee.exchange(0, 1, dx).unwrap();
    let (out_dyn, _) = dyn_fee.exchange(0, 1, dx).unwrap();
    assert!(
        out_dyn < out_flat,
        "imbalanced dynamic-fee pool must charge more: {} vs {}",
        out_dyn,
        out_flat
    );
}

#[test]
fn test_insufficient_liquidity_is_reported() {
    // a 100% fee swallows the whole output
    let mut pool = FlatPool::new(
        100,
        Deposit::Total(2_000_000 * PRECISION),
        2,
        None,
        None,
        FEE_DENOM,
        None,
    )
    .unwrap();
    let err = pool.exchange(0, 1, 1_000 * PRECISION);
    assert!(matches!(
        err,
        Err(stablesim::SimError::InsufficientLiquidity)
    ));
}
