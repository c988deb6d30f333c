//! End-to-end matching scenarios with literal expected values.

use sim_core::{
    Asset, Bond, Currency, Side, SimError, Simulation, SimulationState, Stock,
};

fn stock_market(steps: u32) -> Simulation {
    let assets: Vec<Box<dyn Asset>> = vec![
        Box::new(Currency::new("CAD")),
        Box::new(Stock::new("STOCK", "CAD")),
    ];
    Simulation::new(assets, steps, 1.0).unwrap()
}

fn bond_market(steps: u32, rate: f32) -> Simulation {
    let assets: Vec<Box<dyn Asset>> = vec![
        Box::new(Currency::new("CAD")),
        Box::new(Bond::new("BOND", "CAD", rate, 100.0)),
    ];
    Simulation::new(assets, steps, 1.0).unwrap()
}

#[test]
fn exact_match_fills_both_orders_and_clears_book() {
    let sim = stock_market(10);
    let cad = sim.asset_id("CAD").unwrap();
    let stock = sim.asset_id("STOCK").unwrap();
    let u0 = sim.add_user("U0").unwrap();
    let u1 = sim.add_user("U1").unwrap();

    let bid_id = sim
        .submit_limit_order(u0, stock, Side::Bid, 100.0, 5.0)
        .unwrap();
    let ask_id = sim
        .submit_limit_order(u1, stock, Side::Ask, 100.0, 5.0)
        .unwrap();

    let result = sim.process_step().unwrap();

    let transactions = &result.transactions[&stock];
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].buyer, u0);
    assert_eq!(transactions[0].seller, u1);
    assert_eq!(transactions[0].price, 100.0);
    assert_eq!(transactions[0].volume, 5.0);

    let transacted = &result.transacted_orders[&stock];
    assert_eq!(transacted[&bid_id], 5.0);
    assert_eq!(transacted[&ask_id], 5.0);

    let book = &result.order_book_per_asset[&stock];
    assert!(book.bid.is_empty());
    assert!(book.ask.is_empty());

    assert_eq!(result.portfolios[u0 as usize][stock as usize], 5.0);
    assert_eq!(result.portfolios[u0 as usize][cad as usize], -500.0);
    assert_eq!(result.portfolios[u1 as usize][stock as usize], -5.0);
    assert_eq!(result.portfolios[u1 as usize][cad as usize], 500.0);
}

#[test]
fn partial_fill_leaves_remainder_resting() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let u0 = sim.add_user("U0").unwrap();
    let u1 = sim.add_user("U1").unwrap();

    let bid_id = sim
        .submit_limit_order(u0, stock, Side::Bid, 101.0, 3.0)
        .unwrap();
    let ask_id = sim
        .submit_limit_order(u1, stock, Side::Ask, 100.0, 10.0)
        .unwrap();

    let result = sim.process_step().unwrap();

    // The ask arrives second and crosses the resting bid, so the trade
    // executes at the resting bid's price.
    let transactions = &result.transactions[&stock];
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].price, 101.0);
    assert_eq!(transactions[0].volume, 3.0);

    let transacted = &result.transacted_orders[&stock];
    assert_eq!(transacted[&bid_id], 3.0);
    assert_eq!(transacted[&ask_id], 3.0);

    let book = &result.order_book_per_asset[&stock];
    assert!(book.bid.is_empty());
    assert_eq!(book.ask.len(), 1);
    assert_eq!(book.ask[0].order_id, ask_id);
    assert_eq!(book.ask[0].volume, 7.0);
}

#[test]
fn aggressive_bid_sweeps_multiple_ask_levels() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let maker = sim.add_user("MAKER").unwrap();
    let buyer = sim.add_user("BUYER").unwrap();

    sim.submit_limit_order(maker, stock, Side::Ask, 100.0, 5.0)
        .unwrap();
    let deep_ask = sim
        .submit_limit_order(maker, stock, Side::Ask, 101.0, 5.0)
        .unwrap();
    let bid_id = sim
        .submit_limit_order(buyer, stock, Side::Bid, 102.0, 8.0)
        .unwrap();

    let result = sim.process_step().unwrap();

    let transactions = &result.transactions[&stock];
    assert_eq!(transactions.len(), 2);
    assert_eq!((transactions[0].price, transactions[0].volume), (100.0, 5.0));
    assert_eq!((transactions[1].price, transactions[1].volume), (101.0, 3.0));

    assert_eq!(result.transacted_orders[&stock][&bid_id], 8.0);

    let book = &result.order_book_per_asset[&stock];
    assert!(book.bid.is_empty());
    assert_eq!(book.ask.len(), 1);
    assert_eq!(book.ask[0].order_id, deep_ask);
    assert_eq!(book.ask[0].price, 101.0);
    assert_eq!(book.ask[0].volume, 2.0);
}

#[test]
fn market_order_truncates_on_missing_liquidity() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let maker = sim.add_user("MAKER").unwrap();
    let buyer = sim.add_user("BUYER").unwrap();

    sim.submit_limit_order(maker, stock, Side::Ask, 100.0, 2.0)
        .unwrap();
    sim.submit_market_order(buyer, stock, Side::BUY, 5.0)
        .unwrap();

    let result = sim.process_step().unwrap();

    let transactions = &result.transactions[&stock];
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].price, 100.0);
    assert_eq!(transactions[0].volume, 2.0);
    assert_eq!(transactions[0].buyer, buyer);
    assert_eq!(transactions[0].seller, maker);

    // The unfilled remainder of 3 is dropped without error.
    let book = &result.order_book_per_asset[&stock];
    assert!(book.ask.is_empty());
    assert!(book.bid.is_empty());
}

#[test]
fn market_order_with_no_liquidity_is_a_no_op() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let buyer = sim.add_user("BUYER").unwrap();

    sim.submit_market_order(buyer, stock, Side::BUY, 5.0)
        .unwrap();
    let result = sim.process_step().unwrap();

    assert!(result.transactions[&stock].is_empty());
    assert!(result.transacted_orders[&stock].is_empty());
}

#[test]
fn bond_coupon_accrues_each_step() {
    let sim = bond_market(10, 0.05);
    let cad = sim.asset_id("CAD").unwrap();
    let bond = sim.asset_id("BOND").unwrap();
    let u0 = sim.add_user("U0").unwrap();

    sim.portfolio().add(u0, bond, 2.0).unwrap();

    let result = sim.process_step().unwrap();

    // 2 bonds * rate 0.05 * face 100 * dt 0.1
    let cash = result.portfolios[u0 as usize][cad as usize];
    assert!((cash - 1.0).abs() < 1e-5, "coupon was {cash}");
    assert_eq!(result.portfolios[u0 as usize][bond as usize], 2.0);
}

#[test]
fn bond_liquidates_at_face_value_on_final_step() {
    let sim = bond_market(1, 0.0);
    let cad = sim.asset_id("CAD").unwrap();
    let bond = sim.asset_id("BOND").unwrap();
    let u0 = sim.add_user("U0").unwrap();

    sim.portfolio().add(u0, bond, 3.0).unwrap();

    let result = sim.process_step().unwrap();
    assert!(!result.has_next_step);
    assert_eq!(result.portfolios[u0 as usize][bond as usize], 0.0);
    assert_eq!(result.portfolios[u0 as usize][cad as usize], 300.0);
}

#[test]
fn cancel_of_unknown_order_is_not_recorded() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let u0 = sim.add_user("U0").unwrap();

    let resting = sim
        .submit_limit_order(u0, stock, Side::Bid, 99.0, 1.0)
        .unwrap();
    sim.process_step().unwrap();

    sim.submit_cancel_order(u0, stock, 4242).unwrap();
    let result = sim.process_step().unwrap();

    assert!(result.cancelled_orders[&stock].is_empty());
    assert_eq!(result.order_book_per_asset[&stock].bid.len(), 1);
    assert_eq!(result.order_book_per_asset[&stock].bid[0].order_id, resting);
}

#[test]
fn submit_then_cancel_restores_the_book() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let maker = sim.add_user("MAKER").unwrap();
    let u1 = sim.add_user("U1").unwrap();

    sim.submit_limit_order(maker, stock, Side::Bid, 98.0, 4.0)
        .unwrap();
    sim.submit_limit_order(maker, stock, Side::Ask, 102.0, 4.0)
        .unwrap();
    let before = sim.process_step().unwrap();

    let transient = sim
        .submit_limit_order(u1, stock, Side::Bid, 99.0, 2.0)
        .unwrap();
    sim.process_step().unwrap();
    sim.submit_cancel_order(u1, stock, transient).unwrap();
    let after = sim.process_step().unwrap();

    assert_eq!(after.cancelled_orders[&stock], vec![transient]);
    assert_eq!(
        before.order_book_per_asset[&stock],
        after.order_book_per_asset[&stock]
    );
    assert_eq!(
        before.book_depth_per_asset[&stock],
        after.book_depth_per_asset[&stock]
    );
}

#[test]
fn price_time_priority_fills_older_order_first() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let u0 = sim.add_user("U0").unwrap();
    let u1 = sim.add_user("U1").unwrap();
    let u2 = sim.add_user("U2").unwrap();

    let first = sim
        .submit_limit_order(u0, stock, Side::Bid, 100.0, 2.0)
        .unwrap();
    let second = sim
        .submit_limit_order(u1, stock, Side::Bid, 100.0, 2.0)
        .unwrap();
    sim.process_step().unwrap();

    sim.submit_limit_order(u2, stock, Side::Ask, 100.0, 2.0)
        .unwrap();
    let result = sim.process_step().unwrap();

    let transactions = &result.transactions[&stock];
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].buyer, u0);
    assert!(result.transacted_orders[&stock].contains_key(&first));
    assert!(!result.transacted_orders[&stock].contains_key(&second));

    let book = &result.order_book_per_asset[&stock];
    assert_eq!(book.bid.len(), 1);
    assert_eq!(book.bid[0].order_id, second);
}

#[test]
fn terminal_step_fires_end_hooks_then_rejects_further_steps() {
    let sim = stock_market(2);
    let stock = sim.asset_id("STOCK").unwrap();
    let cad = sim.asset_id("CAD").unwrap();
    let u0 = sim.add_user("U0").unwrap();
    sim.portfolio().add(u0, stock, 1.0).unwrap();

    assert_eq!(sim.state(), SimulationState::Created);

    let first = sim.process_step().unwrap();
    assert!(first.has_next_step);
    assert_eq!(sim.state(), SimulationState::Running);

    let last = sim.process_step().unwrap();
    assert!(!last.has_next_step);
    assert_eq!(last.current_step, 2);
    assert_eq!(sim.state(), SimulationState::Ended);

    // The stock position was marked to the default mid of 100 at the end.
    assert_eq!(last.portfolios[u0 as usize][stock as usize], 0.0);
    assert_eq!(last.portfolios[u0 as usize][cad as usize], 100.0);

    assert_eq!(sim.process_step().unwrap_err(), SimError::SimulationEnded);
}

#[test]
fn reset_and_replay_reproduces_identical_results() {
    let sim = stock_market(3);
    let stock = sim.asset_id("STOCK").unwrap();
    let u0 = sim.add_user("U0").unwrap();
    let u1 = sim.add_user("U1").unwrap();

    let run = |sim: &Simulation| -> Vec<serde_json::Value> {
        sim.submit_limit_order(u0, stock, Side::Bid, 100.0, 5.0)
            .unwrap();
        sim.submit_limit_order(u1, stock, Side::Ask, 100.5, 5.0)
            .unwrap();
        let first = sim.process_step().unwrap();

        sim.submit_limit_order(u1, stock, Side::Ask, 100.0, 2.0)
            .unwrap();
        sim.submit_market_order(u0, stock, Side::BUY, 1.0).unwrap();
        let second = sim.process_step().unwrap();

        vec![
            serde_json::to_value(first).unwrap(),
            serde_json::to_value(second).unwrap(),
        ]
    };

    let original = run(&sim);
    sim.reset_simulation().unwrap();
    let replayed = run(&sim);

    assert_eq!(original, replayed);
}

#[test]
fn submission_validation_errors() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let cad = sim.asset_id("CAD").unwrap();
    let u0 = sim.add_user("U0").unwrap();

    assert!(matches!(
        sim.submit_limit_order(99, stock, Side::Bid, 100.0, 1.0),
        Err(SimError::UnknownId(_, 99))
    ));
    assert!(matches!(
        sim.submit_limit_order(u0, 99, Side::Bid, 100.0, 1.0),
        Err(SimError::UnknownId(_, 99))
    ));
    assert!(matches!(
        sim.submit_limit_order(u0, stock, Side::Bid, 0.0, 1.0),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        sim.submit_limit_order(u0, stock, Side::Bid, 100.0, -1.0),
        Err(SimError::InvalidArgument(_))
    ));
    // The cash asset has no book to trade on.
    assert!(matches!(
        sim.submit_limit_order(u0, cad, Side::Bid, 1.0, 1.0),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        sim.submit_market_order(u0, stock, Side::SELL, 0.0),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn seeding_is_rejected_after_the_first_step() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let maker = sim.add_user("MAKER").unwrap();

    sim.seed_limit_order(maker, stock, Side::Bid, 99.0, 1.0)
        .unwrap();
    assert!(matches!(
        sim.seed_limit_order(maker, stock, Side::Ask, 99.0, 1.0),
        Err(SimError::InvalidArgument(_))
    ));

    sim.process_step().unwrap();
    assert!(matches!(
        sim.seed_limit_order(maker, stock, Side::Ask, 105.0, 1.0),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn statistics_track_cost_vwap_and_liquidation() {
    let sim = stock_market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let cad = sim.asset_id("CAD").unwrap();
    let maker = sim.add_user("MAKER").unwrap();
    let taker = sim.add_user("TAKER").unwrap();

    sim.submit_limit_order(maker, stock, Side::Ask, 100.0, 2.0)
        .unwrap();
    sim.submit_limit_order(maker, stock, Side::Ask, 102.0, 2.0)
        .unwrap();
    sim.submit_limit_order(taker, stock, Side::Bid, 102.0, 4.0)
        .unwrap();
    let result = sim.process_step().unwrap();

    let stats = &result.statistics_per_user_per_asset[&stock][&taker];
    assert_eq!(stats.position, 4.0);
    assert_eq!(stats.cost, 100.0 * 2.0 + 102.0 * 2.0);
    assert!((stats.vwap - 101.0).abs() < 1e-4);
    assert_eq!(stats.realized, 0.0);

    // Both books are empty and there were trades, so the mark falls back
    // to the last trade price of 102.
    assert_eq!(stats.unrealized, 4.0 * 102.0 - 404.0);
    let cash = result.portfolios[taker as usize][cad as usize];
    assert_eq!(stats.net_liquidation_value, cash + 4.0 * 102.0);

    // Statistics exist only for tradeable assets.
    assert!(!result.statistics_per_user_per_asset.contains_key(&cad));
}
