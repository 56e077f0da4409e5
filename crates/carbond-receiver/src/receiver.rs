use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carbond_points::{Channel, MetricBatch};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::info;

use crate::{tcp, udp};

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Pickle,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Pickle => "pickle",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Prefix for the synthetic checkpoint metrics.
    pub graph_prefix: String,
    /// UDP only: log messages that arrived chopped by the MTU.
    pub log_incomplete: bool,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            graph_prefix: "carbon.".to_string(),
            log_incomplete: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub metrics_received: AtomicU32,
    pub errors: AtomicU32,
    /// Currently connected clients (tcp, pickle).
    pub active: AtomicI32,
    /// Messages chunked by the MTU (udp).
    pub incomplete_received: AtomicU32,
}

impl Counters {
    pub fn load_and_clear(counter: &AtomicU32) -> u32 {
        let value = counter.load(Ordering::Relaxed);
        counter.fetch_sub(value, Ordering::Relaxed);
        value
    }
}

/// A running wire listener.
pub struct Receiver {
    protocol: Protocol,
    addr: SocketAddr,
    pub(crate) counters: Arc<Counters>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Receiver {
    /// Bind `addr` and start serving; port 0 picks an ephemeral port.
    pub async fn listen(
        protocol: Protocol,
        addr: SocketAddr,
        out: Channel,
        settings: ReceiverSettings,
    ) -> std::io::Result<Self> {
        let counters = Arc::new(Counters::default());
        let (shutdown_tx, _) = watch::channel(false);
        let mut handles = Vec::new();

        let bound_addr = match protocol {
            Protocol::Tcp | Protocol::Pickle => {
                let listener = TcpListener::bind(addr).await?;
                let bound = listener.local_addr()?;
                handles.push(tokio::spawn(tcp::accept_loop(
                    listener,
                    protocol,
                    out.clone(),
                    Arc::clone(&counters),
                    shutdown_tx.subscribe(),
                )));
                bound
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr).await?;
                let bound = socket.local_addr()?;
                handles.push(tokio::spawn(udp::read_loop(
                    socket,
                    out.clone(),
                    Arc::clone(&counters),
                    settings.log_incomplete,
                    shutdown_tx.subscribe(),
                )));
                bound
            }
        };

        handles.push(tokio::spawn(checkpoint_worker(
            protocol,
            Arc::clone(&counters),
            out,
            settings.graph_prefix.clone(),
            shutdown_tx.subscribe(),
        )));

        info!(addr = %bound_addr, protocol = protocol.as_str(), "receiver listening");
        Ok(Self {
            protocol,
            addr: bound_addr,
            counters,
            shutdown_tx,
            handles,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn checkpoint_worker(
    protocol: Protocol,
    counters: Arc<Counters>,
    out: Channel,
    graph_prefix: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + CHECKPOINT_INTERVAL, CHECKPOINT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => do_checkpoint(protocol, &counters, &out, &graph_prefix).await,
        }
    }
}

pub(crate) async fn do_checkpoint(
    protocol: Protocol,
    counters: &Counters,
    out: &Channel,
    graph_prefix: &str,
) {
    let stat = |name: &str, value: f64| {
        let metric = format!("{}{}.{}", graph_prefix, protocol.as_str(), name);
        async move { out.send(MetricBatch::now_point(metric, value)).await }
    };

    let received = Counters::load_and_clear(&counters.metrics_received);
    stat("metricsReceived", received as f64).await;
    let errors = Counters::load_and_clear(&counters.errors);
    stat("errors", errors as f64).await;

    match protocol {
        Protocol::Tcp | Protocol::Pickle => {
            stat("active", counters.active.load(Ordering::Relaxed) as f64).await;
        }
        Protocol::Udp => {
            let incomplete = Counters::load_and_clear(&counters.incomplete_received);
            stat("incompleteReceived", incomplete as f64).await;
        }
    }
}
