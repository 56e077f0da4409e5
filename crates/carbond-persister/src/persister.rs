use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carbond_points::{Channel, MetricBatch};
use carbond_whisper::{TimeSeriesPoint, Whisper};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use crate::aggregation::{AggregationError, WhisperAggregation};
use crate::schemas::{SchemaError, WhisperSchemas};

const LANE_CAPACITY: usize = 32;
const STAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PersisterError {
    #[error("storage schemas: {0}")]
    Schemas(#[from] SchemaError),

    #[error("storage aggregation: {0}")]
    Aggregation(#[from] AggregationError),
}

/// Settings of the whisper persister. Any change requires a respawn; see
/// [`respawn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersisterSettings {
    pub enabled: bool,
    /// Prefix for the synthetic checkpoint metrics.
    pub graph_prefix: String,
    /// Root directory for the `.wsp` tree.
    pub root_path: PathBuf,
    pub workers: usize,
    /// Pacing for archive updates; 0 disables.
    pub max_updates_per_second: u64,
    pub schemas_file: PathBuf,
    pub aggregation_file: Option<PathBuf>,
}

impl Default for PersisterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            graph_prefix: "carbon.".to_string(),
            root_path: PathBuf::from("/data/graphite/whisper"),
            workers: 1,
            max_updates_per_second: 0,
            schemas_file: PathBuf::from("/data/graphite/schemas"),
            aggregation_file: None,
        }
    }
}

/// Lane index for a metric: all batches of one metric land on one lane, so
/// no two workers ever touch the same archive file.
pub fn shard(metric: &str, workers: u32) -> u32 {
    crc32fast::hash(metric.as_bytes()) % workers
}

struct Counters {
    update_operations: AtomicU32,
    commited_points: AtomicU32,
    created: AtomicU32,
}

impl Counters {
    fn new() -> Self {
        Self {
            update_operations: AtomicU32::new(0),
            commited_points: AtomicU32::new(0),
            created: AtomicU32::new(0),
        }
    }

    /// Read a counter and clear what was read, leaving concurrent adds.
    fn load_and_clear(counter: &AtomicU32) -> u32 {
        let value = counter.load(Ordering::Relaxed);
        counter.fetch_sub(value, Ordering::Relaxed);
        value
    }
}

/// Everything a store operation needs, shared across workers.
struct StoreCtx {
    root: PathBuf,
    schemas: WhisperSchemas,
    aggregation: WhisperAggregation,
    counters: Counters,
}

/// The persister: consumes the cache's egress channel and writes whisper
/// files, solo or through a crc32-sharded worker pool.
pub struct Persister {
    settings: PersisterSettings,
    input: Channel,
    stats: Channel,
    ctx: Arc<StoreCtx>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Persister {
    /// Load the schema tables and construct a stopped persister. `input`
    /// is the cache egress channel; `stats` is the cache ingress, where
    /// checkpoint metrics are reported.
    pub fn new(
        settings: PersisterSettings,
        input: Channel,
        stats: Channel,
    ) -> Result<Self, PersisterError> {
        let schemas = WhisperSchemas::load(&settings.schemas_file)?;
        let aggregation = match &settings.aggregation_file {
            Some(path) => WhisperAggregation::load(path)?,
            None => WhisperAggregation::default(),
        };

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(StoreCtx {
                root: settings.root_path.clone(),
                schemas,
                aggregation,
                counters: Counters::new(),
            }),
            settings,
            input,
            stats,
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    pub fn settings(&self) -> &PersisterSettings {
        &self.settings
    }

    /// Spawn the stat task and the worker pool.
    pub fn start(&mut self) {
        // (Re)apply pacing on the egress channel; 0 removes it.
        self.input.throttle(self.settings.max_updates_per_second);

        self.handles.push(tokio::spawn(stat_worker(
            Arc::clone(&self.ctx),
            self.stats.clone(),
            self.settings.graph_prefix.clone(),
            self.shutdown_tx.subscribe(),
        )));

        if self.settings.workers <= 1 {
            self.handles.push(tokio::spawn(solo_worker(
                self.input.clone(),
                Arc::clone(&self.ctx),
                self.shutdown_tx.subscribe(),
            )));
        } else {
            let mut lanes = Vec::with_capacity(self.settings.workers);
            for _ in 0..self.settings.workers {
                let (lane_tx, lane_rx) = mpsc::channel(LANE_CAPACITY);
                lanes.push(lane_tx);
                self.handles
                    .push(tokio::spawn(lane_worker(lane_rx, Arc::clone(&self.ctx))));
            }
            self.handles.push(tokio::spawn(shuffler(
                self.input.clone(),
                lanes,
                self.shutdown_tx.subscribe(),
            )));
        }

        info!(
            workers = self.settings.workers,
            root = %self.settings.root_path.display(),
            max_updates_per_second = self.settings.max_updates_per_second,
            "persister started"
        );
    }

    /// Signal every task to exit and wait for each of them.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("persister stopped");
    }
}

/// Stop the old persister and start a fresh one when settings changed.
/// Disabled settings leave the egress channel without a consumer: cache
/// backpressure takes over, visible as growing size and overflow.
pub async fn respawn(
    old: Option<Persister>,
    settings: PersisterSettings,
    input: Channel,
    stats: Channel,
) -> Result<Option<Persister>, PersisterError> {
    if let Some(persister) = &old {
        if *persister.settings() == settings {
            return Ok(old);
        }
    }

    if let Some(persister) = old {
        persister.stop().await;
    }

    if !settings.enabled {
        info!("persister disabled");
        return Ok(None);
    }

    let mut persister = Persister::new(settings, input, stats)?;
    persister.start();
    Ok(Some(persister))
}

async fn solo_worker(input: Channel, ctx: Arc<StoreCtx>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            batch = input.recv() => store(Arc::clone(&ctx), batch).await,
        }
    }

    // Same backlog drain the shuffler does: a batch already sitting in the
    // egress channel at shutdown is persisted, not dropped.
    while let Some(batch) = input.try_recv() {
        store(Arc::clone(&ctx), batch).await;
    }
}

async fn shuffler(
    input: Channel,
    lanes: Vec<mpsc::Sender<MetricBatch>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = lanes.len() as u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            batch = input.recv() => {
                let lane = shard(&batch.metric, workers) as usize;
                if lanes[lane].send(batch).await.is_err() {
                    return;
                }
            }
        }
    }

    // Drain the backlog into the lanes before letting them close; the lane
    // workers then finish their queues and exit.
    while let Some(batch) = input.try_recv() {
        let lane = shard(&batch.metric, workers) as usize;
        if lanes[lane].send(batch).await.is_err() {
            return;
        }
    }
}

async fn lane_worker(mut lane: mpsc::Receiver<MetricBatch>, ctx: Arc<StoreCtx>) {
    // Runs until the shuffler closes the lane.
    while let Some(batch) = lane.recv().await {
        store(Arc::clone(&ctx), batch).await;
    }
}

/// Commit one batch, never propagating a failure: a batch that cannot be
/// stored is logged and dropped so the pipeline always advances.
async fn store(ctx: Arc<StoreCtx>, batch: MetricBatch) {
    let result = tokio::task::spawn_blocking(move || store_sync(&ctx, batch)).await;
    if let Err(e) = result {
        error!(error = %e, "persister store task failed");
    }
}

fn store_sync(ctx: &StoreCtx, batch: MetricBatch) {
    let path = metric_path(&ctx.root, &batch.metric);

    let mut archive = match Whisper::open(&path) {
        Ok(archive) => archive,
        Err(_) => {
            let Some(schema) = ctx.schemas.matches(&batch.metric) else {
                error!(metric = %batch.metric, "no storage schema defined");
                return;
            };
            let policy = ctx.aggregation.matches(&batch.metric);

            debug!(
                path = %path.display(),
                schema = %schema.name,
                retention = %schema.retention_str,
                aggregation = %policy.name,
                method = %policy.method,
                x_files_factor = policy.x_files_factor as f64,
                "creating whisper file"
            );

            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!(path = %path.display(), error = %e, "mkdir failed");
                    return;
                }
            }

            match Whisper::create(
                &path,
                &schema.retentions,
                policy.method,
                policy.x_files_factor,
            ) {
                Ok(archive) => {
                    ctx.counters.created.fetch_add(1, Ordering::Relaxed);
                    archive
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to create whisper file");
                    return;
                }
            }
        }
    };

    let points: Vec<TimeSeriesPoint> = batch
        .data
        .iter()
        .map(|p| TimeSeriesPoint {
            time: p.timestamp,
            value: p.value,
        })
        .collect();

    ctx.counters
        .commited_points
        .fetch_add(batch.len() as u32, Ordering::Relaxed);
    ctx.counters.update_operations.fetch_add(1, Ordering::Relaxed);

    // The archive layer does blocking I/O and may panic on a corrupt file;
    // either way the batch is consumed, never retried.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        archive.update_many(&points)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(path = %path.display(), error = %e, "archive update failed, batch dropped");
        }
        Err(_) => {
            error!(path = %path.display(), "archive update panicked, batch dropped");
        }
    }
}

/// `a.b.c` -> `<root>/a/b/c.wsp`
fn metric_path(root: &Path, metric: &str) -> PathBuf {
    root.join(metric.replace('.', "/") + ".wsp")
}

async fn stat_worker(
    ctx: Arc<StoreCtx>,
    stats: Channel,
    graph_prefix: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + STAT_INTERVAL, STAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => emit_checkpoint(&ctx, &stats, &graph_prefix).await,
        }
    }
}

/// Load-and-clear the counters and feed them back through the cache, so
/// the persister's own telemetry rides the normal pipeline.
async fn emit_checkpoint(ctx: &StoreCtx, stats: &Channel, graph_prefix: &str) {
    let update_operations = Counters::load_and_clear(&ctx.counters.update_operations);
    let commited_points = Counters::load_and_clear(&ctx.counters.commited_points);
    let created = Counters::load_and_clear(&ctx.counters.created);

    info!(
        update_operations,
        commited_points, created, "persister checkpoint"
    );

    let stat = |name: &str, value: f64| {
        let metric = format!("{}persister.{}", graph_prefix, name);
        async move { stats.send(MetricBatch::now_point(metric, value)).await }
    };

    stat("updateOperations", update_operations as f64).await;
    stat("commitedPoints", commited_points as f64).await;
    if update_operations > 0 {
        stat(
            "pointsPerUpdate",
            commited_points as f64 / update_operations as f64,
        )
        .await;
    } else {
        stat("pointsPerUpdate", 0.0).await;
    }
    stat("created", created as f64).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir, schemas: &str) -> StoreCtx {
        StoreCtx {
            root: dir.path().to_path_buf(),
            schemas: WhisperSchemas::parse(schemas).unwrap(),
            aggregation: WhisperAggregation::default(),
            counters: Counters::new(),
        }
    }

    fn recent_batch(metric: &str, count: usize) -> MetricBatch {
        let now = carbond_points::now_unix();
        let mut batch = MetricBatch::new(metric);
        for i in 0..count {
            batch.append(carbond_points::Point {
                timestamp: now - count as i64 + i as i64,
                value: i as f64,
            });
        }
        batch
    }

    #[test]
    fn store_creates_and_updates_archives() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, "[default]\npattern = .*\nretentions = 1s:1h\n");

        store_sync(&ctx, recent_batch("hosts.web01.load", 5));

        let path = dir.path().join("hosts/web01/load.wsp");
        assert!(path.exists());
        assert_eq!(ctx.counters.created.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.counters.update_operations.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.counters.commited_points.load(Ordering::Relaxed), 5);

        // Second store opens the existing file instead of creating.
        store_sync(&ctx, recent_batch("hosts.web01.load", 3));
        assert_eq!(ctx.counters.created.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.counters.update_operations.load(Ordering::Relaxed), 2);

        let archive = Whisper::open(&path).unwrap();
        let now = carbond_points::now_unix();
        let series = archive.fetch(now - 10, now).unwrap();
        assert!(series.values.iter().flatten().count() >= 3);
    }

    #[test]
    fn unmatched_metric_is_dropped_without_a_file() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, "[narrow]\npattern = ^only\\.\nretentions = 1s:1h\n");

        store_sync(&ctx, recent_batch("something.else", 2));

        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
        assert_eq!(ctx.counters.created.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.counters.update_operations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shard_is_deterministic_and_balanced() {
        let workers = 4u32;
        let mut rng = StdRng::seed_from_u64(0x6361_7262);
        let mut lanes = HashMap::new();
        let total = 10_000usize;

        for _ in 0..total {
            let metric: String = (0..32)
                .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
                .collect();
            let lane = shard(&metric, workers);
            assert_eq!(lane, shard(&metric, workers));
            *lanes.entry(lane).or_insert(0usize) += 1;
        }

        let received: usize = lanes.values().sum();
        assert_eq!(received, total);

        let expected = total / workers as usize;
        for (&lane, &count) in &lanes {
            assert!(lane < workers);
            let deviation = count.abs_diff(expected) as f64 / expected as f64;
            assert!(
                deviation < 0.1,
                "lane {lane} holds {count}, more than 10% off {expected}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_loads_and_clears_counters() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, "[default]\npattern = .*\nretentions = 1s:1h\n");
        ctx.counters.update_operations.store(4, Ordering::Relaxed);
        ctx.counters.commited_points.store(40, Ordering::Relaxed);
        ctx.counters.created.store(2, Ordering::Relaxed);

        let stats = Channel::new(64);
        emit_checkpoint(&ctx, &stats, "carbon.").await;

        let mut seen = HashMap::new();
        for _ in 0..4 {
            let batch = stats.try_recv().unwrap();
            seen.insert(batch.metric.clone(), batch.data[0].value);
        }
        assert_eq!(seen["carbon.persister.updateOperations"], 4.0);
        assert_eq!(seen["carbon.persister.commitedPoints"], 40.0);
        assert_eq!(seen["carbon.persister.pointsPerUpdate"], 10.0);
        assert_eq!(seen["carbon.persister.created"], 2.0);

        assert_eq!(ctx.counters.update_operations.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.counters.commited_points.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.counters.created.load(Ordering::Relaxed), 0);

        // An idle period reports zeros, not stale values.
        emit_checkpoint(&ctx, &stats, "carbon.").await;
        let mut zeros = HashMap::new();
        for _ in 0..4 {
            let batch = stats.try_recv().unwrap();
            zeros.insert(batch.metric.clone(), batch.data[0].value);
        }
        assert_eq!(zeros["carbon.persister.pointsPerUpdate"], 0.0);
    }

    /// Schemas file plus settings for a live persister rooted in `dir`.
    fn persister_fixture(dir: &TempDir, workers: usize) -> (PersisterSettings, PathBuf) {
        let schemas_path = dir.path().join("schemas.conf");
        std::fs::write(&schemas_path, "[default]\npattern = .*\nretentions = 1s:1h\n").unwrap();

        let data_dir = dir.path().join("whisper");
        let settings = PersisterSettings {
            enabled: true,
            root_path: data_dir.clone(),
            workers,
            schemas_file: schemas_path,
            ..PersisterSettings::default()
        };
        (settings, data_dir)
    }

    #[tokio::test]
    async fn pool_persists_across_lanes_in_metric_order() {
        let dir = TempDir::new().unwrap();
        let (settings, data_dir) = persister_fixture(&dir, 4);

        let input = Channel::new(64);
        let stats = Channel::new(64);

        let persister = respawn(None, settings, input.clone(), stats)
            .await
            .unwrap()
            .unwrap();

        let now = carbond_points::now_unix();
        let metrics = ["alpha.one", "alpha.two", "beta.three", "gamma.four"];
        for (i, metric) in metrics.iter().enumerate() {
            // Two batches per metric; their points must land in order.
            input
                .send(MetricBatch::one_point(*metric, 1.0, now - 4 + i as i64 % 2))
                .await;
            input
                .send(MetricBatch::one_point(*metric, 2.0, now - 2))
                .await;
        }

        // Let steady-state routing handle the batches; the shutdown drain
        // path has its own tests below.
        tokio::time::sleep(Duration::from_millis(200)).await;
        persister.stop().await;

        for metric in metrics {
            let path = metric_path(&data_dir, metric);
            assert!(path.exists(), "{} missing", path.display());
            let archive = Whisper::open(&path).unwrap();
            let series = archive.fetch(now - 6, now).unwrap();
            let values: Vec<f64> = series.values.iter().flatten().copied().collect();
            assert!(values.contains(&1.0), "{metric}: {values:?}");
            assert!(values.contains(&2.0), "{metric}: {values:?}");
        }
    }

    /// Fill the egress channel and stop the persister before its workers
    /// ever run, so the whole backlog is still queued when the shutdown
    /// signal fires. Every batch must land on disk via the drain path.
    async fn stop_drains_queued_backlog(workers: usize) {
        let dir = TempDir::new().unwrap();
        let (settings, data_dir) = persister_fixture(&dir, workers);

        let input = Channel::new(64);
        let stats = Channel::new(64);

        let persister = respawn(None, settings, input.clone(), stats)
            .await
            .unwrap()
            .unwrap();

        let now = carbond_points::now_unix();
        let metrics = ["drain.one", "drain.two", "drain.three", "drain.four"];
        for (i, metric) in metrics.iter().enumerate() {
            input
                .send(MetricBatch::one_point(*metric, (i + 1) as f64, now - 2))
                .await;
        }

        // Single-threaded test runtime: the worker tasks have not been
        // polled yet, so nothing has been consumed when stop is called.
        assert_eq!(input.len(), metrics.len());

        persister.stop().await;
        assert!(input.try_recv().is_none(), "backlog left behind");

        for (i, metric) in metrics.iter().enumerate() {
            let path = metric_path(&data_dir, metric);
            assert!(path.exists(), "{} missing", path.display());
            let archive = Whisper::open(&path).unwrap();
            let series = archive.fetch(now - 4, now).unwrap();
            let values: Vec<f64> = series.values.iter().flatten().copied().collect();
            assert_eq!(values, vec![(i + 1) as f64], "{metric}");
        }
    }

    #[tokio::test]
    async fn solo_worker_drains_backlog_on_stop() {
        stop_drains_queued_backlog(1).await;
    }

    #[tokio::test]
    async fn pool_drains_backlog_on_stop() {
        stop_drains_queued_backlog(4).await;
    }
}
