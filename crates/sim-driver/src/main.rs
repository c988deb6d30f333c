//! Scripted demonstration driver for the market simulator.
//!
//! Builds a small CAD / BOND / ACME market, seeds the books, then runs
//! trader threads submitting a deterministic order script against a
//! stepping loop until the simulation ends. Progress is logged per step;
//! `--json` additionally prints the final step result to stdout.

use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use sim_core::{Asset, Bond, Currency, Side, Simulation, StepResult, Stock, UserId};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "sim-driver")]
#[clap(about = "Scripted demonstration run of the market simulator")]
struct Args {
    /// Number of simulation steps (N).
    #[clap(long, default_value = "20")]
    steps: u32,

    /// Simulated horizon (T).
    #[clap(long, default_value = "1.0")]
    horizon: f32,

    /// Number of trader threads.
    #[clap(long, default_value = "4")]
    traders: u32,

    /// Print the final step result as JSON on stdout.
    #[clap(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let assets: Vec<Box<dyn Asset>> = vec![
        Box::new(Currency::new("CAD")),
        Box::new(Bond::new("BOND", "CAD", 0.05, 100.0)),
        Box::new(Stock::new("ACME", "CAD")),
    ];
    let sim = Simulation::new(assets, args.steps, args.horizon)
        .context("failed to build the simulation")?;

    let bond = sim.asset_id("BOND")?;
    let acme = sim.asset_id("ACME")?;

    let maker = sim.add_user("MAKER")?;
    seed_books(&sim, maker, bond, acme)?;

    let traders: Vec<UserId> = (0..args.traders)
        .map(|index| sim.add_user(format!("TRADER-{index}")))
        .collect::<Result<_, _>>()?;
    for &trader in &traders {
        // A starting cash balance, purely cosmetic: margin is unlimited.
        sim.portfolio().add(trader, sim.asset_id("CAD")?, 10_000.0)?;
    }

    info!(
        steps = args.steps,
        traders = traders.len(),
        "market ready, stepping"
    );

    let mut last_result: Option<StepResult> = None;
    let mut step = 0u32;
    while sim.has_next_step() {
        thread::scope(|scope| {
            for (index, &trader) in traders.iter().enumerate() {
                let sim = &sim;
                scope.spawn(move || submit_script(sim, trader, index as u32, step, bond, acme));
            }
        });

        let result = sim.process_step().context("step failed")?;
        let trades: usize = result.transactions.values().map(Vec::len).sum();
        info!(
            step = result.current_step,
            trades,
            submitted = result
                .submitted_limit_orders
                .values()
                .map(Vec::len)
                .sum::<usize>(),
            "step complete"
        );
        last_result = Some(result);
        step += 1;
    }

    if let Some(result) = last_result {
        summarize(&sim, &result)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

/// Resting liquidity around 100 on both tradeable books.
fn seed_books(sim: &Simulation, maker: UserId, bond: u32, acme: u32) -> Result<()> {
    for level in 0..5u32 {
        let offset = level as f32 * 0.5;
        for asset in [bond, acme] {
            sim.seed_limit_order(maker, asset, Side::Bid, 99.0 - offset, 10.0)?;
            sim.seed_limit_order(maker, asset, Side::Ask, 101.0 + offset, 10.0)?;
        }
    }
    Ok(())
}

/// One trader's deterministic submissions for one step.
fn submit_script(sim: &Simulation, trader: UserId, index: u32, step: u32, bond: u32, acme: u32) {
    let phase = (step + index) % 4;
    let drift = (step % 7) as f32 * 0.25;
    // Submission failures here would indicate a driver bug; surface them.
    let submit = |asset: u32, side: Side, price: f32, volume: f32| {
        sim.submit_limit_order(trader, asset, side, price, volume)
            .expect("scripted submission rejected");
    };
    match phase {
        0 => submit(acme, Side::Bid, 99.5 + drift, 3.0),
        1 => submit(acme, Side::Ask, 100.5 + drift, 3.0),
        2 => submit(bond, Side::Bid, 98.75 + drift, 2.0),
        _ => {
            sim.submit_market_order(trader, acme, Side::BUY, 1.0)
                .expect("scripted submission rejected");
        }
    }
}

fn summarize(sim: &Simulation, result: &StepResult) -> Result<()> {
    for (asset_id, ticker) in &result.asset_id_to_ticker {
        let trades = sim.transactions(*asset_id)?.len();
        info!(%ticker, trades, "asset summary");
    }
    for (user_id, username) in &result.user_id_to_username {
        let holdings = sim.user_portfolio(*user_id)?;
        info!(%username, ?holdings, "final portfolio");
    }
    Ok(())
}
