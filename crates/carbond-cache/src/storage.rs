use std::collections::HashMap;
use std::time::Instant;

use carbond_points::{Channel, MetricBatch};
use tracing::info;

use crate::query::{Query, Reply};
use crate::settings::CacheSettings;

#[derive(Debug)]
pub(crate) struct QueueItem {
    pub metric: String,
    pub count: usize,
}

/// All mutable cache state. Owned by the worker task alone; nothing here
/// needs a lock.
pub(crate) struct CacheState {
    pub settings: CacheSettings,
    store: HashMap<String, MetricBatch>,
    /// `(metric, point count)` ascending by count; popped from the tail.
    /// Rebuilt at checkpoint, so entries go stale and are skipped on pop.
    queue: Vec<QueueItem>,
    size: usize,
    query_cnt: usize,
    overflow_cnt: usize,
}

impl CacheState {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            store: HashMap::new(),
            queue: Vec::new(),
            size: 0,
            query_cnt: 0,
            overflow_cnt: 0,
        }
    }

    #[cfg(test)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    pub fn overflow_cnt(&self) -> usize {
        self.overflow_cnt
    }

    /// Merge a batch into the store, or install it fresh.
    pub fn add(&mut self, batch: MetricBatch) {
        self.size += batch.len();
        match self.store.get_mut(&batch.metric) {
            Some(existing) => existing.data.extend(batch.data),
            None => {
                self.store.insert(batch.metric.clone(), batch);
            }
        }
    }

    /// Ingress path: merge unless the cache is at capacity, in which case
    /// the batch is dropped and counted. Never an error.
    pub fn accept(&mut self, batch: MetricBatch) {
        if self.settings.max_size == 0 || self.size < self.settings.max_size {
            self.add(batch);
        } else {
            self.overflow_cnt += 1;
        }
    }

    /// Remove and return the next batch to persist: largest point count at
    /// the last checkpoint first, any metric at all when the queue has run
    /// dry.
    pub fn pop(&mut self) -> Option<MetricBatch> {
        while let Some(item) = self.queue.pop() {
            if let Some(batch) = self.store.remove(&item.metric) {
                self.size -= batch.len();
                return Some(batch);
            }
            // Stale entry: popped since the queue was built.
        }

        let metric = self.store.keys().next()?.clone();
        let batch = self.store.remove(&metric)?;
        self.size -= batch.len();
        Some(batch)
    }

    /// Answer a query with a deep copy, preferring the batch currently in
    /// flight between `pop` and the egress channel.
    pub fn handle_query(&mut self, query: Query, pending: Option<&MetricBatch>) {
        self.query_cnt += 1;

        let points = match pending {
            Some(batch) if batch.metric == query.metric => Some(batch.clone()),
            _ => self.store.get(&query.metric).cloned(),
        };

        let _ = query.reply.send(Reply { points });
    }

    fn stat(&mut self, name: &str, value: f64) {
        let metric = format!("{}cache.{}", self.settings.graph_prefix, name);
        self.add(MetricBatch::now_point(metric.clone(), value));
        self.queue.push(QueueItem { metric, count: 1 });
    }

    /// Rebuild the write queue and emit the period's stats. The stat
    /// batches are merged straight into the store; routing them through the
    /// ingress channel could wedge the worker against its own backpressure.
    pub fn checkpoint(&mut self, input: &Channel) {
        let start = Instant::now();
        let input_len_before = input.len();

        let mut queue: Vec<QueueItem> = self
            .store
            .iter()
            .map(|(metric, batch)| QueueItem {
                metric: metric.clone(),
                count: batch.len(),
            })
            .collect();
        queue.sort_by_key(|item| item.count);
        self.queue = queue;

        let input_len_after = input.len();
        let worktime = start.elapsed();

        info!(
            time = ?worktime,
            size = self.size,
            metrics = self.store.len(),
            queries = self.query_cnt,
            overflow = self.overflow_cnt,
            input_len_before = input_len_before,
            input_len_after = input_len_after,
            input_capacity = input.capacity(),
            "cache checkpoint"
        );

        // Each stat call observes the store as mutated by the previous
        // ones; `metrics` therefore includes the `size` stat entry.
        let v = self.size as f64;
        self.stat("size", v);
        let v = self.store.len() as f64;
        self.stat("metrics", v);
        let v = self.query_cnt as f64;
        self.stat("queries", v);
        let v = self.overflow_cnt as f64;
        self.stat("overflow", v);
        self.stat("checkpointTime", worktime.as_secs_f64());
        self.stat("inputLenBeforeCheckpoint", input_len_before as f64);
        self.stat("inputLenAfterCheckpoint", input_len_after as f64);

        self.query_cnt = 0;
        self.overflow_cnt = 0;
    }
}
