use std::time::Duration;

use carbond_points::{Channel, MetricBatch};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{error, info, warn};

use crate::query::Query;
use crate::settings::{CacheSettings, SettingsRequest};
use crate::storage::CacheState;

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(1);

/// The in-memory cache: one ingress channel, one egress channel, a query
/// channel and a settings plane, all multiplexed by a single worker task.
pub struct Cache {
    input: Channel,
    output: Channel,
    query_tx: mpsc::Sender<Query>,
    settings_tx: mpsc::Sender<SettingsRequest>,
    shutdown_tx: watch::Sender<bool>,
    inner: Mutex<Inner>,
    checkpoint_interval: Duration,
}

struct Inner {
    settings: CacheSettings,
    running: bool,
    /// Receiver ends parked here until `start` hands them to the worker.
    parked: Option<Parked>,
    worker: Option<JoinHandle<()>>,
}

struct Parked {
    query_rx: mpsc::Receiver<Query>,
    settings_rx: mpsc::Receiver<SettingsRequest>,
}

impl Cache {
    pub fn new() -> Self {
        Self::with_checkpoint_interval(CHECKPOINT_INTERVAL)
    }

    /// Same as [`new`](Cache::new) with a custom checkpoint period.
    pub fn with_checkpoint_interval(checkpoint_interval: Duration) -> Self {
        let settings = CacheSettings::default();
        let input = Channel::new(settings.input_capacity);
        let output = Channel::new(settings.output_capacity);
        let (query_tx, query_rx) = mpsc::channel(settings.query_capacity);
        let (settings_tx, settings_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            input,
            output,
            query_tx,
            settings_tx,
            shutdown_tx,
            inner: Mutex::new(Inner {
                settings,
                running: false,
                parked: Some(Parked { query_rx, settings_rx }),
                worker: None,
            }),
            checkpoint_interval,
        }
    }

    /// The inbound batch stream, fed by receivers and stat emitters.
    pub fn input(&self) -> Channel {
        self.input.clone()
    }

    /// The outbound stream of batches ready to persist.
    pub fn output(&self) -> Channel {
        self.output.clone()
    }

    /// Producer handle for the query channel, used by carbonlink.
    pub fn query_sender(&self) -> mpsc::Sender<Query> {
        self.query_tx.clone()
    }

    /// Spawn the worker. Idempotent once running.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        let Some(parked) = inner.parked.take() else {
            return;
        };

        let worker = CacheWorker {
            state: CacheState::new(inner.settings.clone()),
            input: self.input.clone(),
            output: self.output.clone(),
            query_rx: parked.query_rx,
            settings_rx: parked.settings_rx,
            shutdown_rx: self.shutdown_tx.subscribe(),
            checkpoint_interval: self.checkpoint_interval,
        };
        inner.worker = Some(tokio::spawn(worker.run()));
        inner.running = true;
    }

    /// Stop the worker and wait for it. Unpersisted samples are dropped by
    /// design.
    pub async fn stop(&self) {
        let worker = {
            let mut inner = self.inner.lock();
            inner.running = false;
            inner.worker.take()
        };
        let _ = self.shutdown_tx.send(true);
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Read (new = None) or change the cache settings.
    ///
    /// While the worker runs this is a request/reply over its settings
    /// channel with a 1 second timeout on each leg; a timeout logs and
    /// yields `None`. Before start, changes apply inline.
    pub async fn settings(&self, new: Option<CacheSettings>) -> Option<CacheSettings> {
        {
            let mut inner = self.inner.lock();
            if !inner.running {
                if let Some(new) = new {
                    apply_settings(&mut inner.settings, new, &self.input, &self.output);
                }
                return Some(inner.settings.clone());
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = SettingsRequest { new, reply: reply_tx };

        match timeout(SETTINGS_TIMEOUT, self.settings_tx.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                error!("cache settings query timeout");
                return None;
            }
        }

        match timeout(SETTINGS_TIMEOUT, reply_rx).await {
            Ok(Ok(settings)) => Some(settings),
            Ok(Err(_)) | Err(_) => {
                error!("cache settings reply wait timeout");
                None
            }
        }
    }

    /// Read-modify-write helper over [`settings`](Cache::settings).
    pub async fn edit_settings<F>(&self, edit: F) -> Option<CacheSettings>
    where
        F: FnOnce(&mut CacheSettings),
    {
        let mut settings = self.settings(None).await?;
        edit(&mut settings);
        self.settings(Some(settings)).await
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply changed fields, logging each one. Capacity changes are forwarded
/// to the channels, which rebind without dropping buffered batches.
fn apply_settings(
    current: &mut CacheSettings,
    new: CacheSettings,
    input: &Channel,
    output: &Channel,
) {
    if new.max_size != current.max_size {
        info!(old = current.max_size, new = new.max_size, "cache.max_size changed");
        current.max_size = new.max_size;
    }
    if new.graph_prefix != current.graph_prefix {
        info!(
            old = %current.graph_prefix,
            new = %new.graph_prefix,
            "cache.graph_prefix changed"
        );
        current.graph_prefix = new.graph_prefix;
    }
    if new.input_capacity != current.input_capacity {
        info!(
            old = current.input_capacity,
            new = new.input_capacity,
            "cache.input_capacity changed"
        );
        current.input_capacity = new.input_capacity;
        input.resize(new.input_capacity);
    }
    if new.output_capacity != current.output_capacity {
        info!(
            old = current.output_capacity,
            new = new.output_capacity,
            "cache.output_capacity changed"
        );
        current.output_capacity = new.output_capacity;
        output.resize(new.output_capacity);
    }
    if new.query_capacity != current.query_capacity {
        warn!(
            old = current.query_capacity,
            new = new.query_capacity,
            "cache.query_capacity change takes effect on restart"
        );
        current.query_capacity = new.query_capacity;
    }
}

struct CacheWorker {
    state: CacheState,
    input: Channel,
    output: Channel,
    query_rx: mpsc::Receiver<Query>,
    settings_rx: mpsc::Receiver<SettingsRequest>,
    shutdown_rx: watch::Receiver<bool>,
    checkpoint_interval: Duration,
}

impl CacheWorker {
    async fn run(self) {
        let CacheWorker {
            mut state,
            input,
            output,
            mut query_rx,
            mut settings_rx,
            mut shutdown_rx,
            checkpoint_interval,
        } = self;

        let mut egress = output.sender();
        let mut ticker = interval_at(
            Instant::now() + checkpoint_interval,
            checkpoint_interval,
        );
        let mut pending: Option<MetricBatch> = None;

        loop {
            if pending.is_none() {
                pending = state.pop();
            }

            tokio::select! {
                _ = ticker.tick() => {
                    state.checkpoint(&input);
                }

                Some(query) = query_rx.recv() => {
                    state.handle_query(query, pending.as_ref());
                }

                Some(request) = settings_rx.recv() => {
                    if let Some(new) = request.new {
                        apply_settings(&mut state.settings, new, &input, &output);
                    }
                    let _ = request.reply.send(state.settings.clone());
                }

                slot = egress.reserve(), if pending.is_some() => {
                    if let Some(batch) = pending.take() {
                        slot.send(batch);
                    }
                }

                batch = input.recv() => {
                    state.accept(batch);
                }

                _ = shutdown_rx.changed() => {
                    info!("cache worker exiting");
                    break;
                }
            }
        }
    }
}
