//! Overseer DST Simulator CLI
//!
//! Run deterministic chaos scenarios against the observer, or serve a
//! simulated world over TCP for the `overseer` binary to watch.

use clap::Parser;
use overseer_env::{serve_endpoint, serve_registry, EnvError, PartitionEndpoint};
use overseer_sim::scenarios::ScenarioId;
use overseer_sim::{ScenarioResult, ScenarioRunner, SimConfig, SimWorld};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Overseer Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "overseer-sim")]
#[command(about = "Run deterministic simulation tests for the Overseer observer", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of partitions
    #[arg(short, long, default_value = "4")]
    partitions: usize,

    /// Scenario to run (lockstep, staggered, sparse_stats, racing_reads,
    /// flaky_link, blackout, protocol_violation, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of random seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// World ticks per run
    #[arg(short, long, default_value = "200")]
    ticks: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export frames and metrics of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// With --export, also write the merged stats table to this CSV file
    #[arg(long, requires = "export")]
    stats_csv: Option<String>,

    /// Serve a live world over TCP with the registry on this address
    #[arg(long)]
    serve: Option<String>,

    /// Real milliseconds between world ticks in --serve mode
    #[arg(long, default_value = "100")]
    tick_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Determine base seed
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if let Some(registry_addr) = &args.serve {
        let config = SimConfig {
            seed: base_seed,
            partitions: args.partitions.max(1),
            width: 8 * args.partitions.max(1) as i32,
            tick_ms: args.tick_ms,
            ..SimConfig::default()
        };
        if let Err(e) = serve_world(config, registry_addr).await {
            error!("Serving failed: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if !args.json {
        info!("Overseer DST Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!(
                "Available scenarios: {}, all",
                ScenarioId::all()
                    .iter()
                    .map(ScenarioId::name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            std::process::exit(1);
        })]
    };

    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            std::process::exit(1);
        }

        info!("Running with export to: {}", export_path);
        let (result, export) = ScenarioRunner::new(base_seed, args.partitions)
            .with_ticks(args.ticks)
            .run_recorded(scenarios[0])
            .await;

        if let Err(e) = export.write_to_file(export_path) {
            error!("Failed to write export: {}", e);
        } else {
            info!("Exported {} frames to {}", export.frames.len(), export_path);
        }
        if let Some(csv_path) = &args.stats_csv {
            match export.write_stats_csv(csv_path) {
                Ok(()) => info!("Stats table written to {}", csv_path),
                Err(e) => error!("Failed to write stats table: {}", e),
            }
        }

        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return;
    }

    // Track results
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed, args.partitions).with_ticks(args.ticks);

        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            if !args.json {
                report(&result);
            }
            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }

    // Summary
    let total = all_results.len();
    let passed = total - failed_count;

    if args.json {
        // JSON output for CI parsing
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => error!("Failed to encode summary: {}", e),
        }
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED - {} refreshes, step {}",
            result.scenario.name(),
            result.seed,
            result.metrics.observer.refreshes,
            result.observed_step
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}

/// Serves every partition and a registry over TCP, ticking the world in real time.
async fn serve_world(config: SimConfig, registry_addr: &str) -> Result<(), EnvError> {
    let tick = Duration::from_millis(config.tick_ms.max(1));
    let mut world = SimWorld::new(config);

    let mut bindings = HashMap::new();
    for partition in world.partitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        bindings.insert(partition.pid().registry_name(), listener.local_addr()?);

        let pid = partition.pid();
        let endpoint: Arc<dyn PartitionEndpoint> = partition.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_endpoint(listener, endpoint).await {
                error!(%pid, "Partition endpoint stopped: {}", e);
            }
        });
    }

    let registry = TcpListener::bind(registry_addr).await?;
    info!(
        "Serving {} partitions (seed={}), registry on {}",
        world.partition_count(),
        world.context.seed(),
        registry_addr
    );
    tokio::spawn(async move {
        if let Err(e) = serve_registry(registry, bindings).await {
            error!("Registry stopped: {}", e);
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                world.tick();
                if world.tick_count() % 50 == 0 {
                    debug!(
                        "  t={:.1}s | step={} | held={}",
                        world.time(),
                        world.coordinator_step(),
                        world.hold.is_held()
                    );
                }
            }
        }
    }

    info!("Shutting down after {} ticks", world.tick_count());
    Ok(())
}
