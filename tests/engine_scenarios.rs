//! Integration tests for the CDP engine.
//!
//! These tests drive complete liquidation, stability pool and redemption
//! flows through the engine facade with in-memory collaborators.

use cdp_engine::core::pools::ActivePool;
use cdp_engine::prelude::*;

// ═══════════════════════════════════════════════════════════════════════════════
// TEST HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

type TestEngine = CdpEngine<FixedPriceFeed, InMemorySortedPositions, InMemoryTokenLedger>;

const YEAR: u64 = 365 * 24 * 60 * 60;

fn d(s: &str) -> Decimal18 {
    s.parse().unwrap()
}

fn user(name: &str) -> Address {
    Address::from_label(name)
}

fn engine_at(price: &str) -> TestEngine {
    CdpEngine::new(
        EngineConfig::default(),
        FixedPriceFeed::new(d(price)),
        InMemorySortedPositions::new(),
        InMemoryTokenLedger::new(),
    )
    .unwrap()
}

fn within(a: Decimal18, b: Decimal18, wei: u128) -> bool {
    a.abs_diff(b) <= Decimal18::from_wei(wei)
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDISTRIBUTION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_redistribution_to_survivor() {
    let mut engine = engine_at("200");
    let (alice, bob, carol, keeper) = (user("alice"), user("bob"), user("carol"), user("keeper"));

    engine.open_position(alice, d("2"), d("180")).unwrap();
    engine.open_position(bob, d("4"), d("180")).unwrap();
    engine.price_feed_mut().set_price(d("100"));

    let totals = engine
        .liquidate(alice, LiquidationMode::Normal, keeper)
        .unwrap();
    assert_eq!(totals.total_debt_redistributed, d("200"));
    assert_eq!(totals.total_coll_redistributed, d("1.99"));
    assert!(totals.total_debt_offset.is_zero());

    // Survivor holds the whole redistribution until touched
    assert_eq!(engine.pending_collateral_reward(&bob).unwrap(), d("1.99"));
    assert_eq!(engine.pending_debt_reward(&bob).unwrap(), d("200"));
    assert!(engine.has_pending_rewards(&bob));

    let reconciled = engine.apply_pending_rewards(&bob).unwrap();
    assert_eq!(reconciled.collateral(), d("5.99"));
    assert_eq!(reconciled.debt(), d("400"));
    assert!(!engine.has_pending_rewards(&bob));
    assert!(engine.rewards().default_pool().balance(Asset::Debt).is_zero());

    // Gas compensation reached the caller
    assert_eq!(engine.ledger().collateral_balance(&keeper), d("0.01"));
    assert_eq!(engine.ledger().stable_balance(&keeper), d("20"));

    // A new position's stake is scaled by the post-liquidation snapshot ratio
    assert_eq!(engine.rewards().total_stakes_snapshot(), d("4"));
    assert_eq!(engine.rewards().total_collateral_snapshot(), d("5.99"));
    let summary = engine.open_position(carol, d("5.99"), d("180")).unwrap();
    assert_eq!(summary.stake, d("4"));
    assert_eq!(engine.rewards().total_stakes(), d("8"));
}

#[test]
fn test_batch_and_sequential_redistribution_conserve_debt() {
    fn setup() -> TestEngine {
        let mut engine = engine_at("200");
        engine.open_position(user("a"), d("2"), d("180")).unwrap();
        engine.open_position(user("b"), d("2.1"), d("180")).unwrap();
        engine.open_position(user("c"), d("10"), d("180")).unwrap();
        engine.open_position(user("d"), d("20"), d("180")).unwrap();
        engine.price_feed_mut().set_price(d("100"));
        engine
    }

    let mut sequential = setup();
    sequential
        .liquidate(user("a"), LiquidationMode::Normal, user("keeper"))
        .unwrap();
    sequential
        .liquidate(user("b"), LiquidationMode::Normal, user("keeper"))
        .unwrap();

    let mut batch = setup();
    let totals = batch
        .liquidate_batch(&[user("a"), user("b")], LiquidationMode::Normal, user("keeper"))
        .unwrap();
    assert_eq!(totals.liquidated.len(), 2);

    for engine in [&sequential, &batch] {
        let survivors = engine
            .entire_debt_and_coll(&user("c"))
            .unwrap()
            .debt()
            .checked_add(engine.entire_debt_and_coll(&user("d")).unwrap().debt())
            .unwrap();
        assert!(within(survivors, engine.entire_system_debt().unwrap(), 100));
        assert!(within(survivors, d("800"), 100));
        assert_eq!(engine.rewards().active_count(), 2);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stability_pool_absorbs_full_liquidation() {
    let mut engine = engine_at("200");
    let (alice, dave, keeper) = (user("alice"), user("dave"), user("keeper"));

    engine.open_position(alice, d("20"), d("1980")).unwrap();
    engine.open_position(dave, d("100"), d("2000")).unwrap();
    engine.provide_to_pool(dave, d("2000"), None).unwrap();
    engine.price_feed_mut().set_price(d("100"));

    let totals = engine
        .liquidate(alice, LiquidationMode::Normal, keeper)
        .unwrap();
    assert_eq!(totals.total_debt_offset, d("2000"));
    assert_eq!(totals.total_coll_offset, d("19.9"));

    let pool = engine.stability_pool();
    assert_eq!(pool.current_epoch(), 1);
    assert_eq!(pool.current_scale(), 0);
    assert_eq!(pool.p(), U256::exp10(18));
    assert!(pool.total_deposits().is_zero());
    assert!(engine.compounded_deposit(&dave).unwrap().is_zero());
    assert_eq!(engine.depositor_collateral_gain(&dave).unwrap(), d("19.9"));
    assert!(engine.ledger().stable_balance(&STABILITY_POOL_ACCOUNT).is_zero());
    assert_eq!(pool.sum_at(0, 0), U256::from(9_950_000_000_000_000u64));
    assert_eq!(pool.offset_errors(), (U256::zero(), U256::zero()));
    assert_eq!(engine.rewards().position_count(), 2);
    assert_eq!(engine.statistics().unwrap().depositors, 1);

    // The gain can be moved into the depositor's own position
    let change = engine.withdraw_collateral_gain_to_position(dave).unwrap();
    assert_eq!(change.collateral_gain, d("19.9"));
    let view = engine.entire_debt_and_coll(&dave).unwrap();
    assert_eq!(view.collateral(), d("119.9"));
    assert_eq!(engine.rewards().position(&dave).unwrap().stake(), d("119.9"));
    assert!(engine.stability_pool().collateral_balance().is_zero());
}

#[test]
fn test_partial_offset_then_redistribution() {
    let mut engine = engine_at("200");
    let (alice, bob) = (user("alice"), user("bob"));

    engine.open_position(alice, d("20"), d("1980")).unwrap();
    engine.open_position(bob, d("100"), d("2000")).unwrap();
    engine.provide_to_pool(bob, d("1000"), None).unwrap();
    engine.price_feed_mut().set_price(d("100"));

    let totals = engine
        .liquidate(alice, LiquidationMode::Normal, user("keeper"))
        .unwrap();
    assert_eq!(totals.total_debt_offset, d("1000"));
    assert_eq!(totals.total_coll_offset, d("9.95"));
    assert_eq!(totals.total_debt_redistributed, d("1000"));
    assert_eq!(totals.total_coll_redistributed, d("9.95"));

    assert_eq!(engine.pending_debt_reward(&bob).unwrap(), d("1000"));
    assert_eq!(engine.pending_collateral_reward(&bob).unwrap(), d("9.95"));
    assert_eq!(engine.depositor_collateral_gain(&bob).unwrap(), d("9.95"));
    assert!(engine.compounded_deposit(&bob).unwrap().is_zero());
}

#[test]
fn test_batch_offset_matches_sequential() {
    fn setup() -> TestEngine {
        let mut engine = engine_at("200");
        engine.open_position(user("a"), d("10"), d("980")).unwrap();
        engine.open_position(user("b"), d("10"), d("980")).unwrap();
        engine.open_position(user("c"), d("200"), d("4980")).unwrap();
        engine.provide_to_pool(user("c"), d("3000"), None).unwrap();
        engine.price_feed_mut().set_price(d("100"));
        engine
    }

    let mut sequential = setup();
    for name in ["a", "b"] {
        sequential
            .liquidate(user(name), LiquidationMode::Normal, user("keeper"))
            .unwrap();
    }

    let mut batch = setup();
    batch
        .liquidate_batch(&[user("a"), user("b")], LiquidationMode::Normal, user("keeper"))
        .unwrap();

    let c = user("c");
    assert!(within(
        sequential.compounded_deposit(&c).unwrap(),
        batch.compounded_deposit(&c).unwrap(),
        1_000_000
    ));
    assert!(within(batch.compounded_deposit(&c).unwrap(), d("1000"), 1_000_000));
    assert!(within(
        sequential.depositor_collateral_gain(&c).unwrap(),
        batch.depositor_collateral_gain(&c).unwrap(),
        1_000_000
    ));
    assert!(within(batch.depositor_collateral_gain(&c).unwrap(), d("19.9"), 1_000_000));

    for engine in [&sequential, &batch] {
        assert_eq!(engine.ledger().collateral_balance(&user("keeper")), d("0.1"));
        assert_eq!(engine.ledger().stable_balance(&user("keeper")), d("40"));
    }
}

#[test]
fn test_front_end_kickback_splits_secondary_gains() {
    let mut engine = engine_at("100");
    let (dave, front_end) = (user("dave"), user("frontend"));

    engine.open_position(dave, d("100"), d("2000")).unwrap();
    engine.register_front_end(front_end, d("0.8")).unwrap();
    engine.provide_to_pool(dave, d("1000"), Some(front_end)).unwrap();
    assert_eq!(engine.compounded_front_end_stake(&front_end).unwrap(), d("1000"));

    engine.set_time(engine.now() + YEAR);
    let change = engine.withdraw_from_pool(dave, Decimal18::ZERO).unwrap();
    assert!(!engine.stability_pool().g_at(0, 0).is_zero());

    let depositor_gain = engine.ledger().secondary_balance(&dave);
    let front_end_gain = engine.ledger().secondary_balance(&front_end);
    assert_eq!(depositor_gain, change.depositor_secondary_gain);
    assert!(!front_end_gain.is_zero());
    let front_end_share = front_end_gain.mul(d("4")).unwrap();
    assert!(within(front_end_share, depositor_gain, 10_000));
    // Everything issued so far went to this single deposit
    let issued = engine.stability_pool().issuance().total_issued();
    assert!(within(
        depositor_gain.checked_add(front_end_gain).unwrap(),
        issued,
        1_000_000_000
    ));

    engine
        .ledger_mut()
        .transfer_stable(&dave, &front_end, d("1"))
        .unwrap();
    assert_eq!(
        engine.provide_to_pool(front_end, d("1"), None),
        Err(Error::FrontEndCannotDeposit(front_end))
    );
}

#[test]
fn test_withdraw_blocked_by_undercollateralized_position() {
    let mut engine = engine_at("200");
    let (alice, bob) = (user("alice"), user("bob"));

    engine.open_position(alice, d("2"), d("180")).unwrap();
    engine.open_position(bob, d("100"), d("2000")).unwrap();
    engine.provide_to_pool(bob, d("500"), None).unwrap();
    engine.price_feed_mut().set_price(d("100"));

    assert_eq!(
        engine.withdraw_from_pool(bob, d("100")),
        Err(Error::UndercollateralizedPositionsExist)
    );
    // Claiming gains only is still allowed
    engine.withdraw_from_pool(bob, Decimal18::ZERO).unwrap();
}

#[test]
fn test_repeated_large_offsets_shift_scale() {
    let mut pool = StabilityPool::new(&EngineConfig::default());
    let mut active = ActivePool::new();
    let million = Decimal18::from_integer(1_000_000);
    active.credit(Asset::Debt, million.mul(d("3")).unwrap()).unwrap();
    active.credit(Asset::Collateral, million).unwrap();

    let (alice, bob) = (user("alice"), user("bob"));
    pool.provide(alice, million, None, 0).unwrap();

    // Each offset leaves 1/100000 of the pool behind
    let mut offset_once = |pool: &mut StabilityPool| {
        let total = pool.total_deposits();
        let debt = total.checked_sub(total.div_int(100_000).unwrap()).unwrap();
        let coll = debt.div_int(100).unwrap();
        pool.offset(debt, coll, &mut active, 0).unwrap();
        assert!(pool.p() >= U256::exp10(9));
        pool.current_scale()
    };

    let mut scales = Vec::new();
    for _ in 0..3 {
        scales.push(offset_once(&mut pool));
    }
    pool.provide(bob, million, None, 0).unwrap();
    let before = pool.total_deposits();
    scales.push(offset_once(&mut pool));

    assert_eq!(scales, vec![0, 1, 1, 2]);
    assert_eq!(pool.current_epoch(), 0);

    // Bob spans exactly one scale change and keeps full precision
    let expected = before.div_int(100_000).unwrap();
    let bob_deposit = pool.compounded_deposit(&bob).unwrap();
    assert!(bob_deposit <= expected);
    assert!(bob_deposit.abs_diff(expected) <= Decimal18::from_raw(expected.raw() / U256::exp10(6)));
    assert!(bob_deposit.abs_diff(d("10")) <= Decimal18::from_raw(U256::exp10(13)));

    let bob_gain = pool.depositor_collateral_gain(&bob).unwrap();
    assert!(bob_gain.abs_diff(d("9999.9")) <= Decimal18::from_raw(U256::exp10(16)));

    // Alice's remainder fell two scales below her snapshot. Exact arithmetic
    // would leave her about 1e-14, but a snapshot more than one scale behind
    // compounds to zero before the dust threshold is ever consulted.
    assert_eq!(pool.compounded_deposit(&alice).unwrap(), Decimal18::ZERO);
    scales.push(offset_once(&mut pool));
    assert_eq!(scales[4], 2);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECOVERY MODE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_recovery_mode_capped_liquidation_and_surplus_claim() {
    let mut engine = engine_at("100");
    let (alice, bob, keeper) = (user("alice"), user("bob"), user("keeper"));

    engine.open_position(alice, d("2.6"), d("180")).unwrap();
    engine.open_position(bob, d("30"), d("1980")).unwrap();
    engine.provide_to_pool(bob, d("1000"), None).unwrap();

    let price = engine.price().unwrap();
    let mode = engine.current_mode(price).unwrap();
    assert!(matches!(mode, LiquidationMode::Recovery { .. }));

    let totals = engine.liquidate(alice, mode, keeper).unwrap();
    assert_eq!(totals.total_coll_gas_compensation, d("0.011"));
    assert_eq!(totals.total_coll_offset, d("2.189"));
    assert_eq!(totals.total_coll_surplus, d("0.4"));
    assert!(totals.total_debt_redistributed.is_zero());
    assert_eq!(totals.liquidated_collateral().unwrap(), d("2.189"));

    assert!(within(engine.compounded_deposit(&bob).unwrap(), d("800"), 10_000));
    assert_eq!(engine.depositor_collateral_gain(&bob).unwrap(), d("2.189"));
    assert_eq!(engine.surplus_pool().claimable(&alice), d("0.4"));

    assert_eq!(engine.claim_coll_surplus(alice).unwrap(), d("0.4"));
    assert_eq!(engine.ledger().collateral_balance(&alice), d("0.4"));
    assert_eq!(
        engine.claim_coll_surplus(alice),
        Err(Error::NoCollateralSurplus(alice))
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// ATOMICITY
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_last_position_cannot_be_liquidated() {
    let mut engine = engine_at("200");
    engine.open_position(user("alice"), d("2"), d("180")).unwrap();
    engine.price_feed_mut().set_price(d("100"));
    let before = engine.state_hash().unwrap();

    assert_eq!(
        engine.liquidate(user("alice"), LiquidationMode::Normal, user("keeper")),
        Err(Error::OnlyOnePositionInSystem)
    );
    assert_eq!(engine.state_hash().unwrap(), before);
    assert!(engine.sorted_positions().contains(&user("alice")));
}

#[test]
fn test_failed_operations_leave_state_unchanged() {
    let mut engine = engine_at("100");
    engine.open_position(user("alice"), d("10"), d("500")).unwrap();
    engine.open_position(user("bob"), d("10"), d("500")).unwrap();
    let before = engine.state_hash().unwrap();
    let events = engine.events().total_recorded();

    assert!(engine.provide_to_pool(user("alice"), d("501"), None).is_err());
    assert!(engine
        .adjust_position(user("alice"), PositionAdjustment::withdraw(d("6")))
        .is_err());
    assert!(engine
        .redeem_from_position(user("bob"), user("alice"), d("350"))
        .is_err());
    assert!(engine.withdraw_from_pool(user("alice"), d("1")).is_err());

    assert_eq!(engine.state_hash().unwrap(), before);
    assert_eq!(engine.events().total_recorded(), events);
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDEMPTION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_redemption_reduces_then_closes_position() {
    let mut engine = engine_at("100");
    let (alice, bob) = (user("alice"), user("bob"));
    engine.open_position(alice, d("10"), d("500")).unwrap();
    engine.open_position(bob, d("20"), d("500")).unwrap();

    assert!(matches!(
        engine.redeem_from_position(bob, alice, d("350")),
        Err(Error::DebtBelowMinimum { .. })
    ));

    let partial = engine.redeem_from_position(bob, alice, d("100")).unwrap();
    assert!(!partial.closed);
    assert_eq!(partial.collateral_sent, d("1"));
    let view = engine.entire_debt_and_coll(&alice).unwrap();
    assert_eq!(view.debt(), d("420"));
    assert_eq!(view.collateral(), d("9"));

    let closing = engine.redeem_from_position(bob, alice, d("400")).unwrap();
    assert!(closing.closed);
    assert_eq!(closing.collateral_sent, d("4"));
    assert_eq!(closing.coll_surplus, d("5"));
    assert_eq!(engine.rewards().status(&alice), PositionStatus::ClosedByRedemption);
    assert!(!engine.sorted_positions().contains(&alice));

    assert!(engine.ledger().stable_balance(&bob).is_zero());
    assert_eq!(engine.ledger().collateral_balance(&bob), d("5"));
    assert_eq!(engine.ledger().stable_balance(&GAS_POOL_ACCOUNT), d("20"));

    assert_eq!(engine.claim_coll_surplus(alice).unwrap(), d("5"));
    assert_eq!(engine.entire_system_debt().unwrap(), d("520"));
    assert_eq!(engine.entire_system_collateral().unwrap(), d("20"));
}

#[test]
fn test_custom_reserve_and_minimum_debt() {
    let config = EngineConfig::default()
        .with_debt_gas_compensation(d("10"))
        .with_min_net_debt(d("50"));
    let mut engine = CdpEngine::new(
        config,
        FixedPriceFeed::new(d("100")),
        InMemorySortedPositions::new(),
        InMemoryTokenLedger::new(),
    )
    .unwrap();

    let summary = engine.open_position(user("alice"), d("1"), d("50")).unwrap();
    assert_eq!(summary.debt, d("60"));
    assert_eq!(engine.ledger().stable_balance(&GAS_POOL_ACCOUNT), d("10"));
    assert!(matches!(
        engine.open_position(user("bob"), d("1"), d("49")),
        Err(Error::DebtBelowMinimum { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS AND EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_execute_operations_and_event_log() {
    let mut engine = engine_at("200");
    let ops = vec![
        Operation::OpenPosition {
            owner: user("alice"),
            collateral: d("2"),
            net_debt: d("180"),
        },
        Operation::OpenPosition {
            owner: user("bob"),
            collateral: d("4"),
            net_debt: d("180"),
        },
    ];
    for op in ops {
        engine.execute(op).unwrap();
    }
    engine.price_feed_mut().set_price(d("100"));

    let result = engine
        .execute(Operation::Liquidate {
            position: user("alice"),
            liquidator: user("keeper"),
            mode: None,
        })
        .unwrap();
    match result {
        OperationResult::Liquidation(totals) => assert_eq!(totals.liquidated, vec![user("alice")]),
        other => panic!("unexpected result {:?}", other),
    }

    let log = engine.events();
    assert_eq!(log.filter_by_type("PositionLiquidated").len(), 1);
    assert_eq!(log.filter_by_type("LTermsUpdated").len(), 1);
    assert_eq!(log.filter_by_type("Liquidation").len(), 1);
    match &log.last().unwrap().event {
        EngineEvent::Liquidation { liquidated, .. } => assert_eq!(*liquidated, 1),
        other => panic!("unexpected event {:?}", other),
    }
}
