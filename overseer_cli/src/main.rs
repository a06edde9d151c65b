//! Overseer - live observer for a partitioned simulation
//!
//! Connects to a partition registry, mirrors the configured fields of the
//! viewed partition, and merges every partition's statistics until Ctrl-C.
//! On exit the merged table is written as CSV.

use anyhow::{bail, Context, Result};
use clap::Parser;
use overseer_core::{
    shared, ContinuousMirror, DoubleGridMirror, IntGridMirror, ObserverConfig, ObserverSession,
    PollLoop, StatsReconciler,
};
use overseer_env::{Directory, PartitionId, TcpDirectory, TokioContext};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Overseer live observer
#[derive(Parser, Debug)]
#[command(name = "overseer")]
#[command(about = "Observe a partitioned simulation served over TCP", long_about = None)]
struct Args {
    /// JSON config file (flags below override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Registry address
    #[arg(short, long)]
    registry: Option<String>,

    /// Minimum milliseconds between remote step queries
    #[arg(long)]
    refresh_ms: Option<u64>,

    /// Partition whose fields are mirrored
    #[arg(long)]
    view: Option<u32>,

    /// Fields to mirror, as name=index:kind (kind: double, int, points)
    #[arg(long, default_value = "heat=0:double,bugs=1:int,flock=2:points")]
    fields: String,

    /// Seconds between two mirror summaries
    #[arg(long, default_value = "5")]
    summary_secs: u64,

    /// Where to write the merged stats table on exit
    #[arg(long, default_value = "stats.csv")]
    csv: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MirrorKind {
    Double,
    Int,
    Points,
}

/// One `name=index:kind` entry of `--fields`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldSpec {
    name: String,
    index: usize,
    kind: MirrorKind,
}

impl FromStr for FieldSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected name=index:kind, got '{}'", s))?;
        let (index, kind) = rest.split_once(':').unwrap_or((rest, "double"));
        let index = index
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("bad storage index '{}' for {}", index, name))?;
        let kind = match kind.trim().to_lowercase().as_str() {
            "double" => MirrorKind::Double,
            "int" => MirrorKind::Int,
            "points" | "continuous" => MirrorKind::Points,
            other => return Err(format!("unknown mirror kind '{}' for {}", other, name)),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err("field name is empty".to_string());
        }
        Ok(Self {
            name: name.to_string(),
            index,
            kind,
        })
    }
}

fn parse_fields(list: &str) -> Result<Vec<FieldSpec>, String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FieldSpec::from_str)
        .collect()
}

/// Typed handle on a registered mirror, for summaries.
enum MirrorHandle {
    Double(Arc<RwLock<DoubleGridMirror>>),
    Int(Arc<RwLock<IntGridMirror>>),
    Points(Arc<RwLock<ContinuousMirror>>),
}

impl MirrorHandle {
    fn register(spec: &FieldSpec, session: &mut ObserverSession) -> Self {
        match spec.kind {
            MirrorKind::Double => {
                let mirror = shared(DoubleGridMirror::new());
                session.register_field(spec.name.clone(), mirror.clone(), spec.index);
                MirrorHandle::Double(mirror)
            }
            MirrorKind::Int => {
                let mirror = shared(IntGridMirror::new());
                session.register_field(spec.name.clone(), mirror.clone(), spec.index);
                MirrorHandle::Int(mirror)
            }
            MirrorKind::Points => {
                let mirror = shared(ContinuousMirror::new());
                session.register_field(spec.name.clone(), mirror.clone(), spec.index);
                MirrorHandle::Points(mirror)
            }
        }
    }

    async fn summary(&self) -> String {
        match self {
            MirrorHandle::Double(m) => {
                let m = m.read().await;
                format!(
                    "step={:?} {}x{} mean={:.3}",
                    m.step(),
                    m.width(),
                    m.height(),
                    m.mean().unwrap_or(0.0)
                )
            }
            MirrorHandle::Int(m) => {
                let m = m.read().await;
                format!("step={:?} {}x{} total={}", m.step(), m.width(), m.height(), m.total())
            }
            MirrorHandle::Points(m) => {
                let m = m.read().await;
                format!("step={:?} points={}", m.step(), m.len())
            }
        }
    }
}

fn load_config(args: &Args) -> Result<ObserverConfig> {
    let mut config = match &args.config {
        Some(path) => ObserverConfig::from_json_file(path)?,
        None => ObserverConfig::default(),
    };
    if let Some(registry) = &args.registry {
        config.registry_addr = registry.clone();
    }
    if let Some(ms) = args.refresh_ms {
        config.refresh_interval_ms = ms;
    }
    if let Some(view) = args.view {
        config.viewed_partition = view;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = load_config(&args)?;
    let fields = parse_fields(&args.fields).map_err(anyhow::Error::msg)?;
    if fields.is_empty() {
        bail!("no fields to mirror");
    }

    info!("Overseer v0.1.0 - registry {}", config.registry_addr);
    let directory: Arc<dyn Directory> = Arc::new(TcpDirectory::new(
        config.registry_addr.clone(),
        config.call_timeout(),
    ));
    let mut session = ObserverSession::connect(directory)
        .await
        .with_context(|| format!("connecting through {}", config.registry_addr))?;
    session.set_viewed_partition(PartitionId(config.viewed_partition))?;

    let mirrors: Vec<(String, MirrorHandle)> = fields
        .iter()
        .map(|spec| (spec.name.clone(), MirrorHandle::register(spec, &mut session)))
        .collect();
    info!(
        "Session {} - {} partitions, world {}, {} fields on {}",
        session.id(),
        session.partition_count(),
        session.world_bounds(),
        mirrors.len(),
        session.viewed_partition()
    );

    let session = Arc::new(Mutex::new(session));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    PollLoop::new(TokioContext::shared(), session.clone(), config.poll_config()).spawn(shutdown_rx);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut summary = tokio::time::interval(Duration::from_secs(args.summary_secs.max(1)));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = summary.tick() => {
                let (steps, time, metrics) = {
                    let session = session.lock().await;
                    (session.remote_steps(), session.remote_time(), session.metrics())
                };
                info!(
                    "step={} t={:.2}s refreshes={} failures={} records={}",
                    steps, time, metrics.refreshes, metrics.failures, metrics.stat_records
                );
                for (name, mirror) in &mirrors {
                    info!("  {:<8} {}", name, mirror.summary().await);
                }
            }
        }
    }

    info!("Stopping observer");
    if shutdown_tx.send(true).is_err() {
        warn!("Poll loop already stopped");
    }

    // The poll loop holds the session for a whole cycle, so this waits for
    // any cycle in progress to release the remote lock.
    let queues = session.lock().await.drain_stats();
    let table = StatsReconciler::from(queues).full_table();
    let file = std::fs::File::create(&args.csv)
        .with_context(|| format!("creating {}", args.csv.display()))?;
    table.write_csv(file)?;
    info!(
        "Wrote {} rows (complete through {:?}) to {}",
        table.rows.len(),
        table.complete_through,
        args.csv.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_fields() {
        let fields = parse_fields("heat=0:double,bugs=1:int,flock=2:points").unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1].name, "bugs");
        assert_eq!(fields[1].index, 1);
        assert_eq!(fields[2].kind, MirrorKind::Points);
    }

    #[test]
    fn test_field_kind_defaults_to_double() {
        let spec: FieldSpec = "temp=4".parse().unwrap();
        assert_eq!(spec.kind, MirrorKind::Double);
        assert_eq!(spec.index, 4);
    }

    #[test]
    fn test_bad_fields_are_rejected() {
        assert!("heat".parse::<FieldSpec>().is_err());
        assert!("heat=x:double".parse::<FieldSpec>().is_err());
        assert!("heat=0:float".parse::<FieldSpec>().is_err());
        assert!("=0:int".parse::<FieldSpec>().is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from(["overseer", "--registry", "10.0.0.1:7000", "--view", "2"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.registry_addr, "10.0.0.1:7000");
        assert_eq!(config.viewed_partition, 2);
        assert_eq!(config.refresh_interval_ms, 1000);
    }
}
