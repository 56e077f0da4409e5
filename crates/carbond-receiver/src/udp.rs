use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carbond_points::{parse_line, Channel};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::receiver::Counters;

/// Datagrams get chopped at the MTU; a trailing partial line is kept per
/// peer for a short while and glued onto the peer's next datagram.
struct IncompleteStorage {
    records: HashMap<String, IncompleteRecord>,
    expires: Duration,
    max_size: usize,
    next_purge: Instant,
}

struct IncompleteRecord {
    deadline: Instant,
    data: Vec<u8>,
}

impl IncompleteStorage {
    fn new(expires: Duration) -> Self {
        Self {
            records: HashMap::new(),
            expires,
            max_size: 10_000,
            next_purge: Instant::now() + Duration::from_secs(1),
        }
    }

    fn store(&mut self, peer: &str, data: Vec<u8>) {
        self.records.insert(
            peer.to_string(),
            IncompleteRecord {
                deadline: Instant::now() + self.expires,
                data,
            },
        );
        self.check_and_clear();
    }

    fn pop(&mut self, peer: &str) -> Option<Vec<u8>> {
        let record = self.records.remove(peer)?;
        (record.deadline >= Instant::now()).then_some(record.data)
    }

    fn purge(&mut self) {
        let now = Instant::now();
        self.records.retain(|_, record| record.deadline >= now);
        self.next_purge = now + Duration::from_secs(1);
    }

    /// Bounded memory: purge at most once a second, and only under
    /// pressure.
    fn check_and_clear(&mut self) {
        if self.records.len() < self.max_size {
            return;
        }
        if self.next_purge > Instant::now() {
            return;
        }
        self.purge();
    }
}

pub(crate) async fn read_loop(
    socket: UdpSocket,
    out: Channel,
    counters: Arc<Counters>,
    log_incomplete: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sender = out.sender();
    let mut buf = [0u8; 2048];
    let mut incomplete = IncompleteStorage::new(Duration::from_secs(5));

    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "udp receive failed");
                    continue;
                }
            },
        };

        let peer_key = peer.to_string();
        let mut data = incomplete.pop(&peer_key).unwrap_or_default();
        data.extend_from_slice(&buf[..len]);

        let mut lines = data.split(|&b| b == b'\n').peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            if is_last && !line.is_empty() {
                // Trailing partial line: park it for this peer.
                if log_incomplete {
                    warn!(
                        peer = %peer,
                        line = %String::from_utf8_lossy(line),
                        "incomplete message"
                    );
                }
                incomplete.store(&peer_key, line.to_vec());
                counters.incomplete_received.fetch_add(1, Ordering::Relaxed);
                break;
            }
            if line.is_empty() {
                continue;
            }

            match parse_line(&String::from_utf8_lossy(line)) {
                Ok(batch) => {
                    counters.metrics_received.fetch_add(1, Ordering::Relaxed);
                    sender.send(batch).await;
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                    info!(error = %e, "dropped udp line");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{Protocol, Receiver, ReceiverSettings};
    use tokio::time::timeout;

    #[tokio::test]
    async fn datagram_lines_reach_the_channel() {
        let out = Channel::new(64);
        let receiver = Receiver::listen(
            Protocol::Udp,
            "127.0.0.1:0".parse().unwrap(),
            out.clone(),
            ReceiverSettings::default(),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"hello.world 42 1422698155\n", receiver.addr())
            .await
            .unwrap();

        let batch = timeout(Duration::from_secs(5), out.recv()).await.unwrap();
        assert_eq!(batch.metric, "hello.world");

        receiver.stop().await;
    }

    #[tokio::test]
    async fn split_lines_are_glued_per_peer() {
        let out = Channel::new(64);
        let receiver = Receiver::listen(
            Protocol::Udp,
            "127.0.0.1:0".parse().unwrap(),
            out.clone(),
            ReceiverSettings::default(),
        )
        .await
        .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(b"first.metric 1 10\nsecond.metric 2 ", receiver.addr())
            .await
            .unwrap();
        // The tail of the first datagram completes in the second one.
        client.send_to(b"20\n", receiver.addr()).await.unwrap();

        let first = timeout(Duration::from_secs(5), out.recv()).await.unwrap();
        assert_eq!(first.metric, "first.metric");

        let second = timeout(Duration::from_secs(5), out.recv()).await.unwrap();
        assert_eq!(second.metric, "second.metric");
        assert_eq!(second.data[0].timestamp, 20);

        assert_eq!(
            receiver.counters.incomplete_received.load(Ordering::Relaxed),
            1
        );

        receiver.stop().await;
    }

    #[test]
    fn expired_fragments_are_not_reused() {
        let mut storage = IncompleteStorage::new(Duration::ZERO);
        storage.store("peer", b"partial".to_vec());
        // Deadline is already in the past.
        std::thread::sleep(Duration::from_millis(5));
        assert!(storage.pop("peer").is_none());
        assert!(storage.pop("unknown").is_none());
    }

    #[test]
    fn purge_drops_only_expired_records() {
        let mut storage = IncompleteStorage::new(Duration::from_secs(60));
        storage.store("fresh", b"a".to_vec());
        storage.records.insert(
            "stale".to_string(),
            IncompleteRecord {
                deadline: Instant::now() - Duration::from_secs(1),
                data: b"b".to_vec(),
            },
        );

        storage.purge();
        assert!(storage.records.contains_key("fresh"));
        assert!(!storage.records.contains_key("stale"));
    }
}
