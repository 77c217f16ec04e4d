//! CDP engine simulator
//!
//! Replays a JSON scenario of engine operations against a fresh engine with
//! in-memory collaborators and prints the resulting accumulators.
//!
//! Account fields may name accounts by label: any string starting with `@`
//! is replaced by the address derived from the rest of the string.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use cdp_engine::prelude::*;

/// CDP engine simulator - replay liquidation and stability pool scenarios
#[derive(Parser)]
#[command(name = "cdp-sim")]
#[command(version = cdp_engine::VERSION)]
#[command(about = "Replay scenarios against the CDP accounting engine", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging of accumulator updates
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file
    Run {
        /// Scenario JSON file
        scenario: PathBuf,

        /// Engine configuration JSON file
        #[arg(short, long, env = "CDP_CONFIG")]
        config: Option<PathBuf>,

        /// Continue after a failing step
        #[arg(short, long)]
        keep_going: bool,

        /// Print the event log after the run
        #[arg(long)]
        events: bool,

        /// Decimal places shown in the summary
        #[arg(short, long, default_value_t = 4)]
        precision: u32,
    },

    /// Print the default configuration as JSON
    Config,
}

/// Scenario file layout
#[derive(Deserialize)]
struct Scenario {
    /// Initial collateral price
    price: Decimal18,
    /// Operations in order
    steps: Vec<Value>,
}

type SimEngine = CdpEngine<FixedPriceFeed, InMemorySortedPositions, InMemoryTokenLedger>;

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_command(&cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Run {
            scenario,
            config,
            keep_going,
            events,
            precision,
        } => cmd_run(scenario, config.as_ref(), *keep_going, *events, *precision),
        Commands::Config => {
            let config = EngineConfig::default();
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    Ok(config.apply_env()?)
}

/// Amount rounded down to `dp` places, or `n/a` when it is out of range
fn human(value: Decimal18, dp: u32) -> String {
    value
        .to_decimal(dp)
        .map(|v| v.normalize().to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

fn print_summary(engine: &SimEngine, stats: &EngineStatistics, dp: u32) -> anyhow::Result<()> {
    let price = engine.price()?;
    let rows = [
        ("price", price),
        ("total collateral ratio", engine.tcr(price)?),
        ("system collateral", stats.entire_system_collateral),
        ("system debt", stats.entire_system_debt),
        ("pool deposits", stats.pool_deposits),
        ("pool collateral", stats.pool_collateral),
        ("gas pool reserve", stats.gas_pool_reserve),
        ("collateral surplus", stats.coll_surplus),
        ("secondary issued", stats.secondary_issued),
    ];
    for (label, value) in rows {
        println!("{:<24} {}", label, human(value, dp));
    }
    let mode = if engine.is_recovery_mode(price)? { "recovery" } else { "normal" };
    println!("{:<24} {}", "mode", mode);
    println!("{:<24} {}", "active positions", stats.active_positions);
    Ok(())
}

/// Replace `@label` strings with derived addresses
fn resolve_labels(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(label) = s.strip_prefix('@') {
                *s = Address::from_label(label).to_hex();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(resolve_labels),
        Value::Object(map) => map.values_mut().for_each(resolve_labels),
        _ => {}
    }
}

fn cmd_run(
    path: &PathBuf,
    config: Option<&PathBuf>,
    keep_going: bool,
    show_events: bool,
    precision: u32,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw).context("parsing scenario")?;

    let mut engine: SimEngine = CdpEngine::new(
        config,
        FixedPriceFeed::new(scenario.price),
        InMemorySortedPositions::new(),
        InMemoryTokenLedger::new(),
    )?;

    let mut failures = 0usize;
    for (index, mut step) in scenario.steps.into_iter().enumerate() {
        resolve_labels(&mut step);
        let op: Operation = serde_json::from_value(step)
            .with_context(|| format!("parsing step {}", index))?;
        let name = op.operation_type();

        let outcome = match op {
            Operation::SetPrice { price } => {
                engine.price_feed_mut().set_price(price);
                Ok(OperationResult::Done)
            }
            other => engine.execute(other),
        };

        match outcome {
            Ok(result) => {
                println!("[{:>3}] {:<34} ok  {}", index, name, serde_json::to_string(&result)?);
            }
            Err(e) if keep_going => {
                failures += 1;
                println!("[{:>3}] {:<34} ERR {} (code {})", index, name, e, e.code());
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("step {} ({}) failed", index, name)));
            }
        }
    }

    let stats = engine.statistics()?;
    println!();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!();
    print_summary(&engine, &stats, precision)?;
    println!("state hash: {}", engine.state_hash()?.to_hex());
    if failures > 0 {
        println!("{} step(s) failed", failures);
    }

    if show_events {
        println!();
        for recorded in engine.events().iter() {
            println!(
                "#{:<5} t={:<10} {}",
                recorded.sequence,
                recorded.timestamp,
                serde_json::to_string(&recorded.event)?
            );
        }
    }
    Ok(())
}
