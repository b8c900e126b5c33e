//! ledgerlock-demo - drive the coordinator from the command line
//!
//! Usage:
//!   ledgerlock-demo opposing --strategy closure
//!   ledgerlock-demo random --threads 8 --operations 500 --format json

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledgerlock_core::{
    init_tracing, ContextId, DetectionStrategy, Error, EventSink, ManagerConfig, OperationEvent,
    ResourceId, TracingSink, TransactionCoordinator,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "ledgerlock-demo")]
#[command(about = "Concurrent transfers with deadlock detection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Detection strategy: dfs, closure (overrides LEDGERLOCK_STRATEGY)
    #[arg(short, long, global = true)]
    strategy: Option<String>,

    /// Lock acquisition timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Context slots for the closure strategy
    #[arg(long, global = true)]
    max_contexts: Option<usize>,

    /// Output format: text, json
    #[arg(long, default_value = "text", global = true)]
    format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Two transfers that lock the same accounts in opposite order
    Opposing {
        /// Starting balance of both accounts
        #[arg(long, default_value = "1000")]
        balance: i64,
    },

    /// Random transfers between a handful of accounts
    Random {
        /// Worker threads (defaults to twice the CPU count)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Transfers per thread
        #[arg(short, long, default_value = "200")]
        operations: usize,

        /// Number of accounts
        #[arg(short, long, default_value = "6")]
        accounts: u64,

        /// RNG seed
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

/// Logs like `TracingSink` but parks each operation at its first lock until
/// every participant holds one.
struct RendezvousSink {
    barrier: Barrier,
}

impl EventSink for RendezvousSink {
    fn record(&self, event: &OperationEvent) {
        TracingSink.record(event);
    }

    fn lock_acquired(&self, _context: ContextId, _resource: ResourceId, position: usize) {
        if position == 0 {
            self.barrier.wait();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ManagerConfig::default();
    config
        .apply_env_overrides()
        .context("reading LEDGERLOCK_* environment")?;

    if let Some(strategy) = &cli.strategy {
        config.detection_strategy = strategy.parse::<DetectionStrategy>()?;
    }
    if let Some(max) = cli.max_contexts {
        config.max_concurrent_contexts = Some(max);
    }
    if config.detection_strategy == DetectionStrategy::TransitiveClosure {
        config.max_concurrent_contexts.get_or_insert(64);
    }
    if let Some(ms) = cli.timeout_ms {
        config.acquisition_timeout = Duration::from_millis(ms);
    }
    config.validate()?;
    init_tracing(&config.logging);

    if cli.format != "text" && cli.format != "json" {
        bail!("unknown output format: {}", cli.format);
    }

    let (bank, elapsed) = match cli.command {
        Commands::Opposing { balance } => run_opposing(config, balance)?,
        Commands::Random {
            threads,
            operations,
            accounts,
            seed,
        } => {
            let threads = threads.unwrap_or_else(|| num_cpus::get() * 2);
            run_random(config, threads, operations, accounts, seed)?
        }
    };

    report(&bank, elapsed, &cli.format)
}

fn run_opposing(config: ManagerConfig, balance: i64) -> Result<(Arc<TransactionCoordinator>, Duration)> {
    let bank = TransactionCoordinator::with_balances(
        config,
        [(ResourceId(1), balance), (ResourceId(2), balance)],
    )?
    .with_sink(Arc::new(RendezvousSink {
        barrier: Barrier::new(2),
    }));
    let bank = Arc::new(bank);

    let start = Instant::now();
    let handles: Vec<_> = [(1, 2, balance / 5), (2, 1, balance * 3 / 10)]
        .into_iter()
        .map(|(from, to, amount)| {
            let bank = Arc::clone(&bank);
            thread::spawn(move || {
                let result = bank.transfer(ResourceId(from), ResourceId(to), amount);
                (from, to, amount, result)
            })
        })
        .collect();

    for handle in handles {
        let (from, to, amount, result) = handle
            .join()
            .map_err(|_| anyhow::anyhow!("transfer thread panicked"))?;
        match result {
            Ok(receipt) => println!("{} -> {} ({}): ok, op {}", from, to, amount, receipt.operation_id),
            Err(e) => println!("{} -> {} ({}): {}", from, to, amount, e),
        }
    }

    Ok((bank, start.elapsed()))
}

fn run_random(
    config: ManagerConfig,
    threads: usize,
    operations: usize,
    accounts: u64,
    seed: u64,
) -> Result<(Arc<TransactionCoordinator>, Duration)> {
    if accounts < 2 {
        bail!("need at least two accounts");
    }
    let bank = Arc::new(TransactionCoordinator::with_balances(
        config,
        (1..=accounts).map(|id| (ResourceId(id), 1000)),
    )?);

    let start = Instant::now();
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let bank = Arc::clone(&bank);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                for _ in 0..operations {
                    let from = rng.gen_range(1..=accounts);
                    let to = (from + rng.gen_range(1..accounts) - 1) % accounts + 1;
                    let amount = rng.gen_range(1..=100);
                    match bank.transfer(ResourceId(from), ResourceId(to), amount) {
                        Ok(_)
                        | Err(Error::DeadlockDetected { .. })
                        | Err(Error::Unavailable { .. })
                        | Err(Error::InvalidRequest(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    Ok((bank, start.elapsed()))
}

fn report(bank: &TransactionCoordinator, elapsed: Duration, format: &str) -> Result<()> {
    bank.assert_quiescent()?;

    let ledger = bank.ledger();
    let balances: Vec<_> = ledger
        .resources()
        .into_iter()
        .map(|r| Ok((r, ledger.get_value(r)?)))
        .collect::<ledgerlock_core::Result<_>>()?;
    let stats = bank.stats();
    let graph = bank.inspect_graph();

    if format == "json" {
        let out = json!({
            "strategy": bank.config().detection_strategy,
            "elapsed_ms": elapsed.as_millis() as u64,
            "balances": balances.iter().map(|(r, v)| json!({"resource": r, "value": v})).collect::<Vec<_>>(),
            "total": ledger.total(),
            "stats": stats,
            "graph": graph,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("strategy: {}", bank.config().detection_strategy);
    println!("elapsed:  {:?}", elapsed);
    for (resource, value) in &balances {
        println!("  {:<8} {:>10}", resource.to_string(), value);
    }
    println!("  {:<8} {:>10}", "total", ledger.total());
    println!();
    println!(
        "ok {} | deadlock {} | unavailable {} | invalid {} | probes {} | locks {}",
        stats.success,
        stats.deadlocks,
        stats.unavailable,
        stats.invalid,
        stats.detector_probes,
        stats.lock_acquisitions
    );
    println!("wait-for graph: {}", serde_json::to_string(&graph)?);
    Ok(())
}
