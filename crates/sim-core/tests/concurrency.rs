//! Concurrent submitters against a single stepping thread.

use std::collections::HashSet;
use std::thread;

use sim_core::{Asset, Currency, OrderId, Side, Simulation, Stock};

fn market(steps: u32) -> Simulation {
    let assets: Vec<Box<dyn Asset>> = vec![
        Box::new(Currency::new("CAD")),
        Box::new(Stock::new("STOCK", "CAD")),
    ];
    Simulation::new(assets, steps, 1.0).unwrap()
}

#[test]
fn parallel_submissions_are_all_processed_once() {
    const THREADS: u32 = 4;
    const ORDERS_PER_THREAD: u32 = 50;

    let sim = market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    for thread_index in 0..THREADS {
        sim.add_user(format!("T{thread_index}")).unwrap();
    }

    let per_thread: Vec<Vec<OrderId>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|thread_index| {
                let sim = &sim;
                scope.spawn(move || {
                    (0..ORDERS_PER_THREAD)
                        .map(|order_index| {
                            // Bids strictly below all asks: nothing crosses,
                            // so every order survives to the book.
                            let (side, price) = if thread_index % 2 == 0 {
                                (Side::Bid, 90.0 - order_index as f32 * 0.01)
                            } else {
                                (Side::Ask, 110.0 + order_index as f32 * 0.01)
                            };
                            sim.submit_limit_order(thread_index, stock, side, price, 1.0)
                                .unwrap()
                        })
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let result = sim.process_step().unwrap();
    let submitted = &result.submitted_limit_orders[&stock];

    assert_eq!(submitted.len(), (THREADS * ORDERS_PER_THREAD) as usize);
    let unique: HashSet<_> = submitted.iter().collect();
    assert_eq!(unique.len(), submitted.len());

    // Every id a thread received is in the step's submitted list, and the
    // ids of one thread appear in that thread's submission order.
    for ids in &per_thread {
        let positions: Vec<usize> = ids
            .iter()
            .map(|id| submitted.iter().position(|s| s == id).unwrap())
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    let book = &result.order_book_per_asset[&stock];
    assert_eq!(book.bid.len() + book.ask.len(), submitted.len());
}

#[test]
fn submissions_racing_the_stepper_are_processed_exactly_once() {
    const ORDERS: u32 = 200;

    let sim = market(100_000);
    let stock = sim.asset_id("STOCK").unwrap();
    let user = sim.add_user("RACER").unwrap();

    let (expected, mut seen) = thread::scope(|scope| {
        let submitter = {
            let sim = &sim;
            scope.spawn(move || {
                (0..ORDERS)
                    .map(|index| {
                        sim.submit_limit_order(
                            user,
                            stock,
                            Side::Bid,
                            50.0 + (index % 40) as f32 * 0.25,
                            1.0,
                        )
                        .unwrap()
                    })
                    .collect::<Vec<OrderId>>()
            })
        };

        let mut seen: Vec<OrderId> = Vec::new();
        while !submitter.is_finished() {
            let result = sim.process_step().unwrap();
            seen.extend(result.submitted_limit_orders[&stock].iter().copied());
        }
        let expected = submitter.join().unwrap();
        (expected, seen)
    });

    // One flushing step for anything still queued.
    let result = sim.process_step().unwrap();
    seen.extend(result.submitted_limit_orders[&stock].iter().copied());

    let mut expected_sorted = expected.clone();
    expected_sorted.sort_unstable();
    let mut seen_sorted = seen.clone();
    seen_sorted.sort_unstable();
    assert_eq!(expected_sorted, seen_sorted);

    // A single submitter's orders are drained in submission order.
    assert_eq!(seen, expected);
}

#[test]
fn observers_see_a_consistent_market_between_steps() {
    let sim = market(10);
    let stock = sim.asset_id("STOCK").unwrap();
    let maker = sim.add_user("MAKER").unwrap();

    sim.submit_limit_order(maker, stock, Side::Bid, 99.0, 5.0)
        .unwrap();
    sim.submit_limit_order(maker, stock, Side::Ask, 101.0, 5.0)
        .unwrap();
    sim.process_step().unwrap();

    thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sim = &sim;
                scope.spawn(move || {
                    for _ in 0..100 {
                        let bid = sim.top_bid(stock).unwrap();
                        let ask = sim.top_ask(stock).unwrap();
                        assert!(bid.price < ask.price);
                        assert_eq!(sim.bid_count(stock).unwrap(), 1);
                        assert_eq!(sim.open_user_orders(maker, stock).unwrap().len(), 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    });
}
