use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::MetricBatch;

const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(5 * 60);

/// A bounded FIFO of [`MetricBatch`] with two runtime-mutable parameters:
/// capacity and rate limit.
///
/// Internally the channel is a chain of generations of bounded buffers. A
/// [`resize`](Channel::resize) or [`throttle`](Channel::throttle) installs a
/// fresh buffer for producers; superseded buffers stay drainable and the
/// consumer empties them strictly in creation order, so a reconfiguration
/// never drops or reorders items. A superseded buffer is retired once it is
/// closed, or once it has sat empty and idle for the quiescence interval
/// (default 5 minutes).
///
/// Throttled generations (rate > 0) interpose a relay task that admits one
/// item per `1s / rate`. The relay never drops: it terminates by draining
/// its input to completion. Ticks that fire while the input is empty are
/// discarded, so there is no burst budget.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    recv_state: tokio::sync::Mutex<RecvState>,
    epoch_tx: watch::Sender<u64>,
    retired_tx: watch::Sender<u64>,
    quiescence: Duration,
}

struct State {
    capacity: usize,
    rate_per_sec: u64,
    tx: mpsc::Sender<MetricBatch>,
    /// Consumer endpoints installed by `apply` but not yet adopted by the
    /// receive side, in creation order.
    pending_rx: Vec<mpsc::Receiver<MetricBatch>>,
    epoch: u64,
}

struct RecvState {
    current: mpsc::Receiver<MetricBatch>,
    quarantined: VecDeque<OldGen>,
    epoch_rx: watch::Receiver<u64>,
}

struct OldGen {
    rx: mpsc::Receiver<MetricBatch>,
    last_activity: Instant,
}

impl OldGen {
    fn new(rx: mpsc::Receiver<MetricBatch>) -> Self {
        Self {
            rx,
            last_activity: Instant::now(),
        }
    }
}

impl Shared {
    fn current_tx(&self) -> mpsc::Sender<MetricBatch> {
        self.state.lock().tx.clone()
    }

    fn note_retired(&self) {
        self.retired_tx.send_modify(|n| *n += 1);
    }
}

impl Channel {
    /// Create a channel with the default 5-minute quiescence interval.
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        Self::with_quiescence(capacity, DEFAULT_QUIESCENCE)
    }

    pub fn with_quiescence(capacity: usize, quiescence: Duration) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (retired_tx, _) = watch::channel(0u64);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    capacity,
                    rate_per_sec: 0,
                    tx,
                    pending_rx: Vec::new(),
                    epoch: 0,
                }),
                recv_state: tokio::sync::Mutex::new(RecvState {
                    current: rx,
                    quarantined: VecDeque::new(),
                    epoch_rx,
                }),
                epoch_tx,
                retired_tx,
                quiescence,
            }),
        }
    }

    /// Blocking send; never drops. Re-targets the live buffer if a
    /// reconfiguration lands mid-send.
    pub async fn send(&self, batch: MetricBatch) {
        let mut batch = batch;
        loop {
            let tx = self.shared.current_tx();
            match tx.send(batch).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(b)) => {
                    batch = b;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Receive the next item. Items of a superseded buffer are always
    /// delivered before items of a newer one. The channel has one logical
    /// consumer; concurrent callers serialize on an internal lock.
    pub async fn recv(&self) -> MetricBatch {
        let mut rs = self.shared.recv_state.lock().await;
        rs.recv(&self.shared).await
    }

    /// Non-blocking receive, used to drain a backlog at shutdown.
    pub fn try_recv(&self) -> Option<MetricBatch> {
        let mut rs = self.shared.recv_state.try_lock().ok()?;
        rs.try_recv(&self.shared)
    }

    /// Cached producer handle for hot paths; see [`Sender`].
    pub fn sender(&self) -> Sender {
        Sender {
            shared: Arc::clone(&self.shared),
            weak: self.shared.current_tx().downgrade(),
        }
    }

    /// Install a new buffer of `new_capacity`. The old buffer stays
    /// drainable until empty and idle for the quiescence interval.
    pub fn resize(&self, new_capacity: usize) {
        let mut st = self.shared.state.lock();
        st.capacity = new_capacity.max(1);
        self.apply(&mut st);
    }

    /// Enable (rate > 0) or disable (rate = 0) pacing. Takes effect through
    /// a new buffer generation, like `resize`.
    pub fn throttle(&self, rate_per_sec: u64) {
        let mut st = self.shared.state.lock();
        st.rate_per_sec = rate_per_sec;
        self.apply(&mut st);
    }

    fn apply(&self, st: &mut State) {
        let (in_tx, in_rx) = mpsc::channel(st.capacity);
        let consumer_rx = if st.rate_per_sec > 0 {
            let (out_tx, out_rx) = mpsc::channel(st.capacity);
            spawn_throttle(in_rx, out_tx, st.rate_per_sec);
            out_rx
        } else {
            in_rx
        };

        st.tx = in_tx;
        st.pending_rx.push(consumer_rx);
        st.epoch += 1;
        debug!(
            epoch = st.epoch,
            capacity = st.capacity,
            rate_per_sec = st.rate_per_sec,
            "channel reconfigured"
        );
        let _ = self.shared.epoch_tx.send(st.epoch);
    }

    /// Number of items buffered in the live producer-side buffer.
    pub fn len(&self) -> usize {
        let st = self.shared.state.lock();
        st.tx.max_capacity() - st.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the live buffer.
    pub fn capacity(&self) -> usize {
        self.shared.state.lock().tx.max_capacity()
    }

    /// Watch of the generation counter; bumps whenever the underlying
    /// buffer is rebound by `resize` or `throttle`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.epoch_tx.subscribe()
    }

    /// Watch of the count of superseded buffers that have been fully
    /// drained and closed.
    pub fn retired(&self) -> watch::Receiver<u64> {
        self.shared.retired_tx.subscribe()
    }
}

impl RecvState {
    fn adopt(&mut self, shared: &Shared) {
        let mut gens: Vec<mpsc::Receiver<MetricBatch>> = {
            let mut st = shared.state.lock();
            if st.pending_rx.is_empty() {
                return;
            }
            st.pending_rx.drain(..).collect()
        };

        let Some(newest) = gens.pop() else { return };
        let old = std::mem::replace(&mut self.current, newest);
        self.quarantined.push_back(OldGen::new(old));
        // Generations skipped over in one adoption still drain in order.
        for rx in gens {
            self.quarantined.push_back(OldGen::new(rx));
        }
    }

    async fn recv(&mut self, shared: &Shared) -> MetricBatch {
        loop {
            if self.epoch_rx.has_changed().unwrap_or(false) {
                self.epoch_rx.mark_unchanged();
                self.adopt(shared);
            }

            if let Some(front) = self.quarantined.front_mut() {
                let deadline = front.last_activity + shared.quiescence;
                tokio::select! {
                    item = front.rx.recv() => match item {
                        Some(batch) => {
                            if let Some(g) = self.quarantined.front_mut() {
                                g.last_activity = Instant::now();
                            }
                            return batch;
                        }
                        None => {
                            // Fully drained and all producers let go.
                            self.quarantined.pop_front();
                            shared.note_retired();
                        }
                    },
                    _ = sleep_until(deadline) => {
                        let empty = self.quarantined.front().map_or(true, |g| g.rx.is_empty());
                        if empty {
                            self.quarantined.pop_front();
                            shared.note_retired();
                        } else if let Some(g) = self.quarantined.front_mut() {
                            g.last_activity = Instant::now();
                        }
                    },
                    res = self.epoch_rx.changed() => {
                        if res.is_ok() {
                            self.adopt(shared);
                        }
                    },
                }
            } else {
                tokio::select! {
                    item = self.current.recv() => match item {
                        Some(batch) => return batch,
                        None => {
                            // The live buffer only closes when a newer
                            // generation replaced it; wait for the edge.
                            if self.epoch_rx.changed().await.is_ok() {
                                self.adopt(shared);
                            }
                        }
                    },
                    res = self.epoch_rx.changed() => {
                        if res.is_ok() {
                            self.adopt(shared);
                        }
                    },
                }
            }
        }
    }

    fn try_recv(&mut self, shared: &Shared) -> Option<MetricBatch> {
        if self.epoch_rx.has_changed().unwrap_or(false) {
            self.epoch_rx.mark_unchanged();
            self.adopt(shared);
        }

        while let Some(front) = self.quarantined.front_mut() {
            match front.rx.try_recv() {
                Ok(batch) => {
                    front.last_activity = Instant::now();
                    return Some(batch);
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.quarantined.pop_front();
                    shared.note_retired();
                }
                // Older generation still open but momentarily empty: do not
                // overtake it with newer items.
                Err(mpsc::error::TryRecvError::Empty) => return None,
            }
        }

        self.current.try_recv().ok()
    }
}

/// Cached producer handle.
///
/// Holds a weak reference to the live buffer so that an idle handle never
/// keeps a superseded generation open; the handle re-fetches the buffer the
/// first time a send fails after a reconfiguration.
pub struct Sender {
    shared: Arc<Shared>,
    weak: mpsc::WeakSender<MetricBatch>,
}

impl Sender {
    fn refresh(&mut self) -> mpsc::Sender<MetricBatch> {
        let tx = self.shared.current_tx();
        self.weak = tx.downgrade();
        tx
    }

    /// Blocking send; never drops.
    pub async fn send(&mut self, batch: MetricBatch) {
        let mut batch = batch;
        loop {
            let tx = match self.weak.upgrade() {
                Some(tx) => tx,
                None => self.refresh(),
            };
            match tx.send(batch).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(b)) => {
                    batch = b;
                    self.refresh();
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Wait for room in the channel without committing an item. The
    /// returned slot sends without blocking, so a worker can hold its batch
    /// while multiplexing and hand it over only once the slot is granted.
    pub async fn reserve(&mut self) -> SendSlot {
        loop {
            let tx = match self.weak.upgrade() {
                Some(tx) => tx,
                None => self.refresh(),
            };
            match tx.reserve_owned().await {
                Ok(permit) => return SendSlot(permit),
                Err(_) => {
                    self.refresh();
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

/// A granted send slot; consumed by delivering one batch.
pub struct SendSlot(mpsc::OwnedPermit<MetricBatch>);

impl SendSlot {
    pub fn send(self, batch: MetricBatch) {
        self.0.send(batch);
    }
}

fn spawn_throttle(
    mut in_rx: mpsc::Receiver<MetricBatch>,
    out_tx: mpsc::Sender<MetricBatch>,
    rate_per_sec: u64,
) {
    let step = Duration::from_nanos(1_000_000_000 / rate_per_sec.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(step);
        // Ticks burnt while the input sat empty are gone for good: a hard
        // rate cap, not a burst budget.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match in_rx.recv().await {
                Some(batch) => {
                    if out_tx.send(batch).await.is_err() {
                        return;
                    }
                }
                // Generation superseded and fully drained.
                None => return,
            }
        }
    });
}
