use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stablesim::metapool::{MetaPool, Pool};
use stablesim::pool::{Deposit, FlatPool, PRECISION, PROBE_DX};

/// Mainnet 3-pool normalized to LP precision (rates 10^18, balances in
/// virtual units), the convention base pools are stored in.
fn base_pool() -> FlatPool {
    FlatPool::new(
        2000,
        Deposit::Balances(vec![
            295949605740077243186725223,
            284320067518878000000000000,
            288200854907854000000000000,
        ]),
        3,
        None,
        Some(849743149250065202008212976),
        4_000_000,
        None,
    )
    .unwrap()
}

/// Factory metapool over the 3-pool: a 2-decimal primary coin (rate
/// 10^34) paired against the base LP slot.
fn metapool() -> MetaPool {
    let outer = FlatPool::new(
        1000,
        Deposit::Balances(vec![762951074, 12971664836474542835562756]),
        2,
        Some(vec![10_000_000_000_000_000_000_000_000_000_000_000, PRECISION]),
        Some(20312687702458911532611097),
        4_000_000,
        None,
    )
    .unwrap();
    MetaPool::new(outer, base_pool()).unwrap()
}

#[test]
fn test_flattened_indexing() {
    let meta = metapool();
    assert_eq!(meta.max_coin(), 1);
    assert_eq!(meta.n_total(), 4);
    let rates = meta.live_rates().unwrap();
    assert_eq!(rates[1], meta.base.virtual_price().unwrap());
}

#[test]
fn test_primary_to_base_exchange_burns_base_lp() {
    let mut meta = metapool();
    let base_lp_before = meta.base.lp_supply;
    let outer_lp_slot_before = meta.outer.balances[1];
    let primary_before = meta.outer.balances[0];
    let base_coin_before = meta.base.balances[1];

    // meta coin to base coin 1 (flattened index 2)
    let (dy, fee) = meta.exchange(0, 2, 1_000_000_000).unwrap();
    assert!(dy > 0);
    assert!(fee > 0);

    assert_eq!(meta.outer.balances[0], primary_before + 1_000_000_000);

    // the outer pool pays in base LP, burned through the base withdrawal:
    // the LP slot and the base supply drop by the same amount
    let lp_spent = outer_lp_slot_before - meta.outer.balances[1];
    let lp_burned = base_lp_before - meta.base.lp_supply;
    assert!(lp_burned > 0);
    assert_eq!(
        lp_spent, lp_burned,
        "outer LP slot and base supply must move together"
    );

    // the withdrawn coin left the base pool
    assert_eq!(meta.base.balances[1], base_coin_before - dy);
}

#[test]
fn test_base_to_primary_exchange_mints_base_lp() {
    let mut meta = metapool();
    let base_lp_before = meta.base.lp_supply;
    let outer_lp_slot_before = meta.outer.balances[1];
    let primary_before = meta.outer.balances[0];

    // base coin 0 (flattened index 1) into the meta coin
    let dx = 1_000_000_000_000_000_000_000_000u128;
    let (dy, _fee) = meta.exchange(1, 0, dx).unwrap();
    assert!(dy > 0);

    // the deposit minted base LP into the outer pool's slot
    let lp_minted = meta.base.lp_supply - base_lp_before;
    assert!(lp_minted > 0);
    assert_eq!(meta.outer.balances[1], outer_lp_slot_before + lp_minted);

    // the primary coin left the outer pool
    assert_eq!(meta.outer.balances[0], primary_before - dy);
}

#[test]
fn test_base_only_exchange_stays_in_base() {
    let mut meta = metapool();
    let outer_before = meta.outer.balances.clone();
    let base_lp_before = meta.base.lp_supply;

    let dx = 1_000_000_000_000_000_000_000_000u128;
    let (dy, _fee) = meta.exchange(1, 2, dx).unwrap();
    assert!(dy > 0);

    assert_eq!(
        meta.outer.balances, outer_before,
        "base-only trades must not touch the outer pool"
    );
    assert_eq!(meta.base.lp_supply, base_lp_before);
}

#[test]
fn test_quote_matches_exchange() {
    let meta = metapool();
    for (i, j, dx) in [
        (0usize, 2usize, 1_000_000_000u128),
        (1, 0, 1_000_000_000_000_000_000_000_000),
        (1, 3, 1_000_000_000_000_000_000_000_000),
    ] {
        let quote = meta.dy(i, j, dx).unwrap();
        let mut traded = meta.clone();
        let (dy, _fee) = traded.exchange(i, j, dx).unwrap();
        assert_relative_eq!(quote as f64, dy as f64, max_relative = 1e-9);
    }
}

#[test]
fn test_snapshot_restore_is_exact() {
    let mut pool = Pool::Meta(metapool());
    let pristine = pool.clone();
    let snap = pool.snapshot();

    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..25 {
        let i = rng.gen_range(0..4);
        let mut j = rng.gen_range(0..4);
        if j == i {
            j = (j + 1) % 4;
        }
        let dx = rng.gen_range(1_000_000_000_000u128..100_000_000_000_000_000_000u128);
        let _ = pool.exchange(i, j, dx);
    }
    assert_ne!(pool, pristine, "trades must have moved the pool");

    pool.restore(&snap);
    assert_eq!(
        pool, pristine,
        "restore must reproduce the pre-trade state exactly, base LP included"
    );
}

#[test]
fn test_marginal_price_tracks_realized_price() {
    let meta = metapool();
    // base -> primary marginal price versus a trade large enough to
    // register in the primary coin's 2-decimal grid
    let dx = 10_000_000_000_000_000u128;
    let price = meta.dydx_fee(1, 0, dx).unwrap();
    let quote = meta.dy(1, 0, dx).unwrap();
    assert!(quote > 0);
    let realized = quote as f64 / dx as f64;
    assert_relative_eq!(price, realized, max_relative = 1e-12);

    // primary -> base closed form is finite and positive
    let fwd = meta.dydx_fee(0, 2, PROBE_DX).unwrap();
    assert!(fwd.is_finite() && fwd > 0.0);
}

#[test]
fn test_base_pool_virtual_price_feeds_lp_slot() {
    let meta = metapool();
    let vp = meta.base.virtual_price().unwrap();
    assert!(
        vp > PRECISION,
        "accrued fees keep the base virtual price above 1"
    );
    let xp = meta.xp_live().unwrap();
    let expected = meta.outer.balances[1] as f64 * vp as f64 / 1e18;
    assert_relative_eq!(xp[1] as f64, expected, max_relative = 1e-12);
}
