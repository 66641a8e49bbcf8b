//! Workload generator for the flash write-side engine.
//!
//! This binary drives an in-process `AsyncPool` with a mix of puts,
//! writebacks, flushes and deletes while a drainer task issues periodic
//! drains. With `--replicas` the pool replicates to in-process replica pools
//! over a lossy loopback network. A JSON stats report is written at the end.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use holo_flash::flusher::DEFAULT_BATCH;
use holo_flash::{
    ActionDir, ActionState, AsyncPool, AsyncRequest, BackgroundFlusher, ContainerId, Dispatch,
    Error, FanoutReplicator, FjallFlash, FlashStore, MemFlash, ObjectMeta, PoolConfig,
    PoolStatsSnapshot, ReplicaApplier, ReplicationConfig, Target,
};
use holo_msg::{
    lock_map, shared, Correlator, LoopbackNetwork, Message, Messenger, NodeId, ResponseMap,
    SchedulerHandle, ServiceHandler, ServiceId, SharedResponseMap, TimeoutConfig,
    TimeoutScheduler,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time::{self, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const PRIMARY: NodeId = 1;
const REPLICA_SERVICE: ServiceId = 7;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// Flash engine backing the primary pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, serde::Serialize)]
#[serde(rename_all = "snake_case")]
enum Engine {
    Mem,
    Fjall,
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Worker count of the primary pool.
    #[arg(long, env = "HOLO_FLASH_THREADS", default_value_t = 4)]
    threads: usize,

    /// Concurrent foreground flushes (clamped to --threads).
    #[arg(long, env = "HOLO_FLASH_MAX_FLUSHES", default_value_t = 8)]
    max_flushes: usize,

    /// Concurrent background flushes (clamped to --threads).
    #[arg(long, env = "HOLO_FLASH_MAX_BG_FLUSHES", default_value_t = 8)]
    max_background_flushes: usize,

    /// Minimum pause between background flush passes.
    #[arg(long, env = "HOLO_WORKLOAD_BG_FLUSH_SLEEP_FLOOR", default_value = "100ms")]
    background_flush_sleep_floor: humantime::Duration,

    /// Capacity of each worker inbox.
    #[arg(long, env = "HOLO_FLASH_QUEUE_DEPTH", default_value_t = 4096)]
    queue_depth: usize,

    /// Number of concurrent submitting clients.
    #[arg(long, default_value_t = 8)]
    clients: usize,

    /// Containers written to; every container is replicated when --replicas > 0.
    #[arg(long, default_value_t = 4)]
    containers: u64,

    /// Keys per container.
    #[arg(long, default_value_t = 1024)]
    keys: usize,

    /// Payload size in bytes. Also sizes each worker's data arena.
    #[arg(long, default_value_t = 512)]
    object_size: usize,

    /// Percent of operations that are plain puts.
    #[arg(long, default_value_t = 70)]
    put_pct: u8,

    /// Percent of operations that are cache writebacks.
    #[arg(long, default_value_t = 15)]
    writeback_pct: u8,

    /// Percent of operations that are cache flushes. The rest are deletes.
    #[arg(long, default_value_t = 10)]
    flush_pct: u8,

    /// Pause between drains issued by the drainer task (0s disables it).
    #[arg(long, default_value = "500ms")]
    drain_interval: humantime::Duration,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, value_enum, default_value = "mem")]
    engine: Engine,

    /// Data directory for `--engine fjall`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Worker dispatch: round-robin or key-affinity.
    #[arg(long, env = "HOLO_FLASH_DISPATCH", default_value_t = Dispatch::RoundRobin)]
    dispatch: Dispatch,

    /// Number of in-process replicas (0 disables replication).
    #[arg(long, default_value_t = 0)]
    replicas: usize,

    /// Percent of replication requests silently dropped on the way out.
    #[arg(long, default_value_t = 0)]
    replica_drop_pct: u8,

    /// Age after which an unanswered replication request fails.
    #[arg(long, env = "HOLO_WORKLOAD_REPLY_TIMEOUT", default_value = "500ms")]
    reply_timeout: humantime::Duration,

    /// Timeout scheduler tick.
    #[arg(long, env = "HOLO_WORKLOAD_TICK", default_value = "50ms")]
    tick: humantime::Duration,

    /// Write the JSON stats report to this path.
    #[arg(long, default_value = ".tmp/holo-workload/report.json")]
    out: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpKind {
    Put,
    Writeback,
    Flush,
    Delete,
}

impl OpKind {
    fn pick(roll: u8, args: &RunArgs) -> Self {
        let writeback = args.put_pct + args.writeback_pct;
        let flush = writeback + args.flush_pct;
        if roll < args.put_pct {
            OpKind::Put
        } else if roll < writeback {
            OpKind::Writeback
        } else if roll < flush {
            OpKind::Flush
        } else {
            OpKind::Delete
        }
    }

    fn label(self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Writeback => "writeback",
            OpKind::Flush => "flush",
            OpKind::Delete => "delete",
        }
    }
}

/// Settings embedded in the report for reproducibility.
#[derive(serde::Serialize, Debug, Clone)]
struct ReportMeta {
    engine: Engine,
    seed: u64,
    clients: usize,
    containers: u64,
    keys: usize,
    object_size: usize,
    put_pct: u8,
    writeback_pct: u8,
    flush_pct: u8,
    delete_pct: u8,
    duration_ms: u64,
    drain_interval_ms: u64,
    replicas: usize,
    replica_drop_pct: u8,
    reply_timeout_ms: u64,
    tick_ms: u64,
}

#[derive(serde::Serialize, Debug, Default, Clone, Copy)]
struct Latency {
    count: usize,
    p50_us: u64,
    p99_us: u64,
    max_us: u64,
}

impl Latency {
    fn from_samples(mut samples: Vec<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let at = |pct: usize| samples[(samples.len() - 1) * pct / 100];
        Self {
            count: samples.len(),
            p50_us: at(50),
            p99_us: at(99),
            max_us: samples[samples.len() - 1],
        }
    }
}

#[derive(serde::Serialize, Debug)]
struct OpSummary {
    submitted: u64,
    completed: u64,
    by_kind: BTreeMap<&'static str, u64>,
    errors: BTreeMap<&'static str, u64>,
    ack_latency: Latency,
    completion_latency: Latency,
}

#[derive(serde::Serialize, Debug, Default)]
struct DrainSummary {
    drains: u64,
    failed: u64,
    latency: Latency,
}

#[derive(serde::Serialize, Debug)]
struct ReplicationSummary {
    replicas: Vec<NodeId>,
    live: Vec<NodeId>,
    dropped: u64,
    tracked: u64,
    resolved: u64,
    timed_out: u64,
    node_dead: u64,
    rollovers: u64,
    timeout_scans: u64,
    outstanding: usize,
    replica_writes: BTreeMap<NodeId, u64>,
}

/// Full report serialized at the end of a run.
#[derive(serde::Serialize, Debug)]
struct Report {
    meta: ReportMeta,
    config: PoolConfig,
    elapsed_ms: u64,
    ops: OpSummary,
    drains: DrainSummary,
    pool: PoolStatsSnapshot,
    replication: Option<ReplicationSummary>,
}

/// Per-client counters merged into the report.
#[derive(Default)]
struct ClientReport {
    submitted: u64,
    completed: u64,
    by_kind: BTreeMap<&'static str, u64>,
    errors: BTreeMap<&'static str, u64>,
    ack_us: Vec<u64>,
    completion_us: Vec<u64>,
}

impl ClientReport {
    fn record_error(&mut self, err: &Error) {
        tracing::debug!(error = %err, "operation failed");
        *self.errors.entry(error_label(err)).or_default() += 1;
    }

    fn merge(&mut self, other: ClientReport) {
        self.submitted += other.submitted;
        self.completed += other.completed;
        for (kind, n) in other.by_kind {
            *self.by_kind.entry(kind).or_default() += n;
        }
        for (kind, n) in other.errors {
            *self.errors.entry(kind).or_default() += n;
        }
        self.ack_us.extend(other.ack_us);
        self.completion_us.extend(other.completion_us);
    }
}

fn error_label(err: &Error) -> &'static str {
    match err {
        Error::ApplyFailed { .. } => "apply_failed",
        Error::ReplicationFailed { .. } => "replication_failed",
        Error::Timeout { .. } => "timeout",
        Error::NodeDead { .. } => "node_dead",
        Error::ConfigInvalid(_) => "config_invalid",
        Error::AllocationFailed { .. } => "allocation_failed",
        Error::KeyTooLong { .. } => "key_too_long",
        Error::InvalidKey => "invalid_key",
        Error::ObjectTooLarge { .. } => "object_too_large",
        Error::PoolClosed => "pool_closed",
        Error::NotStarted => "not_started",
        Error::AlreadyStarted => "already_started",
    }
}

/// Messenger that drops a share of outbound traffic and hands the rest to
/// the loopback network.
struct LossyMessenger {
    net: Arc<LoopbackNetwork>,
    drop_pct: u8,
    rng: Mutex<SmallRng>,
    dropped: AtomicU64,
}

impl LossyMessenger {
    fn new(net: Arc<LoopbackNetwork>, drop_pct: u8, seed: u64) -> Self {
        Self {
            net,
            drop_pct,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
            dropped: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Messenger for LossyMessenger {
    async fn send(&self, msg: Message) -> anyhow::Result<()> {
        if self.drop_pct > 0 {
            let roll: u8 = self
                .rng
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .gen_range(0..100);
            if roll < self.drop_pct {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %msg.key, dest = %msg.dest, "dropping message");
                return Ok(());
            }
        }
        self.net.send(msg).await
    }
}

/// The primary only receives replies; requests addressed to it are refused.
struct RepliesOnly;

#[async_trait]
impl ServiceHandler for RepliesOnly {
    async fn handle(&self, request: &Message) -> anyhow::Result<Bytes> {
        anyhow::bail!("node {PRIMARY} serves no requests (from {})", request.src)
    }
}

/// In-process replicas plus the primary's side of the messaging layer.
struct Replication {
    map: SharedResponseMap,
    scheduler: SchedulerHandle,
    messenger: Arc<LossyMessenger>,
    replicator: Arc<FanoutReplicator>,
    nodes: Vec<(NodeId, AsyncPool)>,
}

impl Replication {
    async fn start(
        count: usize,
        config: &PoolConfig,
        timeouts: TimeoutConfig,
        drop_pct: u8,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let net = LoopbackNetwork::new();
        let mut nodes = Vec::with_capacity(count);
        for i in 0..count {
            let node = PRIMARY + 1 + i as NodeId;
            let cache = Arc::new(ActionDir::new(config.max_object_size));
            let action = Arc::new(ActionState::new(Arc::new(MemFlash::new()), cache));
            let pool = AsyncPool::alloc(config.clone(), action)
                .with_context(|| format!("alloc replica {node}"))?;
            pool.start()
                .await
                .with_context(|| format!("start replica {node}"))?;
            let correlator = Arc::new(Correlator::new(
                node,
                shared(ResponseMap::new(timeouts)),
                net.clone(),
            ));
            correlator.spawn_inbox(net.register(node), Arc::new(ReplicaApplier::new(pool.clone())));
            nodes.push((node, pool));
        }

        let map = shared(ResponseMap::new(timeouts));
        let messenger = Arc::new(LossyMessenger::new(net.clone(), drop_pct, seed));
        let correlator = Arc::new(Correlator::new(PRIMARY, map.clone(), messenger.clone()));
        correlator.spawn_inbox(net.register(PRIMARY), Arc::new(RepliesOnly));
        let scheduler = TimeoutScheduler::spawn(map.clone(), timeouts.tick);
        let replicas = nodes.iter().map(|(node, _)| *node).collect();
        let replicator = FanoutReplicator::alloc(
            ReplicationConfig::all_of(REPLICA_SERVICE, replicas),
            correlator,
        )?;

        Ok(Self {
            map,
            scheduler,
            messenger,
            replicator: Arc::new(replicator),
            nodes,
        })
    }

    fn summary(&self) -> ReplicationSummary {
        let (stats, outstanding) = {
            let map = lock_map(&self.map);
            (map.stats(), map.len())
        };
        ReplicationSummary {
            replicas: self.nodes.iter().map(|(node, _)| *node).collect(),
            live: self.replicator.live_replicas(),
            dropped: self.messenger.dropped.load(Ordering::Relaxed),
            tracked: stats.tracked,
            resolved: stats.resolved,
            timed_out: stats.timed_out,
            node_dead: stats.node_dead,
            rollovers: stats.rollovers,
            timeout_scans: stats.timeout_scans,
            outstanding,
            replica_writes: self
                .nodes
                .iter()
                .map(|(node, pool)| {
                    let totals = pool.stats().totals();
                    (*node, totals.puts + totals.writebacks + totals.deletes)
                })
                .collect(),
        }
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        for (node, pool) in self.nodes {
            pool.shutdown()
                .await?
                .join()
                .await
                .with_context(|| format!("join replica {node}"))?;
        }
        self.scheduler.shutdown().await
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and dispatch to the selected subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.cmd {
        // Run the workload generator.
        Command::Run(args) => run(args).await,
    }
}

/// Run the workload and write the JSON report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.containers > 0, "--containers must be > 0");
    anyhow::ensure!(args.keys > 0, "--keys must be > 0");
    anyhow::ensure!(args.object_size > 0, "--object-size must be > 0");
    anyhow::ensure!(
        args.put_pct as u32 + args.writeback_pct as u32 + args.flush_pct as u32 <= 100,
        "--put-pct + --writeback-pct + --flush-pct must be <= 100"
    );
    anyhow::ensure!(
        args.replica_drop_pct <= 100,
        "--replica-drop-pct must be <= 100"
    );

    let duration: Duration = args.duration.into();
    let drain_interval: Duration = args.drain_interval.into();
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let timeouts = TimeoutConfig {
        reply_timeout: args.reply_timeout.into(),
        tick: args.tick.into(),
    }
    .validate()?;

    let config = PoolConfig {
        threads: args.threads,
        max_flushes_in_progress: args.max_flushes,
        max_background_flushes_in_progress: args.max_background_flushes,
        background_flush_sleep_floor: args.background_flush_sleep_floor.into(),
        max_object_size: args.object_size,
        queue_depth: args.queue_depth,
        dispatch: args.dispatch,
        ..PoolConfig::from_env()
    }
    .validate()?;

    let flash: Arc<dyn FlashStore> = match args.engine {
        Engine::Mem => Arc::new(MemFlash::new()),
        Engine::Fjall => {
            let dir = args
                .data_dir
                .as_ref()
                .context("--data-dir is required with --engine fjall")?;
            Arc::new(FjallFlash::open(dir).with_context(|| format!("open {}", dir.display()))?)
        }
    };

    let replication = if args.replicas > 0 {
        Some(
            Replication::start(
                args.replicas,
                &config,
                timeouts,
                args.replica_drop_pct,
                seed.rotate_left(17),
            )
            .await?,
        )
    } else {
        None
    };

    let cache = Arc::new(ActionDir::new(config.max_object_size));
    let mut action = ActionState::new(flash, cache);
    if let Some(replication) = &replication {
        action = action.with_replicator(replication.replicator.clone());
        for container in 0..args.containers {
            action.set_replication(container, true);
        }
    }
    let pool = AsyncPool::alloc(config.clone(), Arc::new(action))?;
    pool.start().await?;
    let flusher = BackgroundFlusher::spawn(pool.clone(), DEFAULT_BATCH);

    tracing::info!(
        threads = config.threads,
        clients = args.clients,
        engine = ?args.engine,
        replicas = args.replicas,
        seed,
        duration = %args.duration,
        "workload started"
    );

    let start = time::Instant::now();
    let deadline = start + duration;

    let drainer = if drain_interval.is_zero() {
        None
    } else {
        let pool = pool.clone();
        Some(tokio::spawn(run_drainer(pool, drain_interval, deadline)))
    };

    let args = Arc::new(args);
    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let pool = pool.clone();
        let args = args.clone();
        // Mix the base seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(pool, &args, seed, deadline).await
        }));
    }

    let mut ops = ClientReport::default();
    for task in tasks {
        ops.merge(task.await.context("client task panicked")??);
    }
    let mut drains = match drainer {
        Some(task) => task.await.context("drainer task panicked")?,
        None => DrainSummary::default(),
    };

    flusher.shutdown().await?;
    // One last consistency point so the report covers every acknowledged op.
    pool.drain().await?;
    drains.drains += 1;
    let elapsed = start.elapsed();

    let pool_stats = pool.stats();
    let replication_summary = replication.as_ref().map(Replication::summary);
    pool.shutdown().await?.join().await.context("join workers")?;
    if let Some(replication) = replication {
        replication.shutdown().await?;
    }

    let meta = ReportMeta {
        engine: args.engine,
        seed,
        clients: args.clients,
        containers: args.containers,
        keys: args.keys,
        object_size: args.object_size,
        put_pct: args.put_pct,
        writeback_pct: args.writeback_pct,
        flush_pct: args.flush_pct,
        delete_pct: 100 - args.put_pct - args.writeback_pct - args.flush_pct,
        duration_ms: duration.as_millis() as u64,
        drain_interval_ms: drain_interval.as_millis() as u64,
        replicas: args.replicas,
        replica_drop_pct: args.replica_drop_pct,
        reply_timeout_ms: timeouts.reply_timeout.as_millis() as u64,
        tick_ms: timeouts.tick.as_millis() as u64,
    };
    let report = Report {
        meta,
        config,
        elapsed_ms: elapsed.as_millis() as u64,
        ops: OpSummary {
            submitted: ops.submitted,
            completed: ops.completed,
            by_kind: ops.by_kind,
            errors: ops.errors,
            ack_latency: Latency::from_samples(ops.ack_us),
            completion_latency: Latency::from_samples(ops.completion_us),
        },
        drains,
        pool: pool_stats,
        replication: replication_summary,
    };

    print_summary(&report);
    write_report(&args.out, &report).context("write report")?;
    eprintln!("wrote report: {}", args.out.display());
    Ok(())
}

/// Submit operations from one client until the deadline.
async fn run_client(
    pool: AsyncPool,
    args: &RunArgs,
    seed: u64,
    deadline: time::Instant,
) -> anyhow::Result<ClientReport> {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut report = ClientReport::default();
    let cache = pool.cache().clone();
    let mut value = vec![0u8; args.object_size];

    while time::Instant::now() < deadline {
        let container: ContainerId = rng.gen_range(0..args.containers);
        let target = Target::new(container, 0);
        let key = format!("k{:08}", rng.gen_range(0..args.keys)).into_bytes();
        let op = OpKind::pick(rng.gen_range(0..100), args);
        rng.fill(&mut value[..]);

        let request = match op {
            // The worker hands the buffer back with the ack; reuse it below.
            OpKind::Put => AsyncRequest::put(target, key, std::mem::take(&mut value)),
            OpKind::Writeback => AsyncRequest::writeback(cache.upsert(
                target,
                &key,
                value.clone(),
                ObjectMeta::default(),
            )?),
            OpKind::Flush => AsyncRequest::flush(cache.upsert(
                target,
                &key,
                value.clone(),
                ObjectMeta::default(),
            )?),
            OpKind::Delete => AsyncRequest::delete(target, key),
        };

        let started = time::Instant::now();
        let submitted = pool.submit(request).await;
        report.submitted += 1;
        *report.by_kind.entry(op.label()).or_default() += 1;
        let mut submitted = match submitted {
            Ok(submitted) => submitted,
            Err(Error::PoolClosed) => break,
            Err(err) => {
                report.record_error(&err);
                value.resize(args.object_size, 0);
                continue;
            }
        };
        report.ack_us.push(started.elapsed().as_micros() as u64);
        if let Some(buffer) = submitted.take_buffer() {
            value = buffer;
        }
        value.resize(args.object_size, 0);

        match submitted.wait().await {
            Ok(()) => {
                report.completed += 1;
                report
                    .completion_us
                    .push(started.elapsed().as_micros() as u64);
            }
            Err(err) => report.record_error(&err),
        }
    }
    Ok(report)
}

/// Drain the pool every `interval` until the deadline.
async fn run_drainer(pool: AsyncPool, interval: Duration, deadline: time::Instant) -> DrainSummary {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let mut summary = DrainSummary::default();
    let mut samples = Vec::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = time::sleep_until(deadline) => break,
        }
        let started = time::Instant::now();
        match pool.drain().await {
            Ok(()) => {
                summary.drains += 1;
                samples.push(started.elapsed().as_micros() as u64);
            }
            Err(Error::PoolClosed) => break,
            Err(err) => {
                summary.failed += 1;
                tracing::warn!(error = %err, "drain failed");
            }
        }
    }
    summary.latency = Latency::from_samples(samples);
    summary
}

fn print_summary(report: &Report) {
    let totals = report.pool.totals();
    let secs = (report.elapsed_ms as f64 / 1000.0).max(f64::EPSILON);
    tracing::info!(
        submitted = report.ops.submitted,
        completed = report.ops.completed,
        ops_per_sec = (report.ops.completed as f64 / secs) as u64,
        ack_p99_us = report.ops.ack_latency.p99_us,
        completion_p99_us = report.ops.completion_latency.p99_us,
        "operations"
    );
    tracing::info!(
        drains = report.drains.drains,
        failed = report.drains.failed,
        p99_us = report.drains.latency.p99_us,
        "drains"
    );
    tracing::info!(
        puts = totals.puts,
        writebacks = totals.writebacks,
        flushes = totals.flushes,
        background_flushes = totals.background_flushes,
        deletes = totals.deletes,
        bytes_written = totals.bytes_written,
        replicated = totals.replicated,
        flush_peak = report.pool.flush.peak,
        "pool"
    );
    for (kind, count) in &report.ops.errors {
        tracing::warn!(kind = *kind, count = *count, "operation errors");
    }
    if let Some(replication) = &report.replication {
        tracing::info!(
            dropped = replication.dropped,
            timed_out = replication.timed_out,
            rollovers = replication.rollovers,
            timeout_scans = replication.timeout_scans,
            outstanding = replication.outstanding,
            "replication"
        );
    }
}

/// Serialize and write the report JSON.
fn write_report(path: &PathBuf, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
