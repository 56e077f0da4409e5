use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use serde_pickle::value::{HashableValue, Value};
use serde_pickle::{DeOptions, SerOptions};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::query::{Query, Reply};

/// graphite-web never sends more than a metric name and a type tag.
const MAX_REQUEST_BYTES: u32 = 1024;

#[derive(Debug, Clone)]
pub struct CarbonlinkSettings {
    /// Per-connection read deadline.
    pub read_timeout: Duration,
    /// How long a request may wait on the cache worker before it gets an
    /// empty answer.
    pub query_timeout: Duration,
}

impl Default for CarbonlinkSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Error)]
pub enum CarbonlinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("can't unpickle request: {0}")]
    Pickle(#[from] serde_pickle::Error),

    #[error("oversized request ({0} bytes)")]
    Oversize(u32),

    #[error("bad request: {0}")]
    BadRequest(&'static str),
}

/// The query sidecar: serves graphite-web's `cache-query` requests over a
/// length-prefixed pickle protocol, answered from the cache worker's query
/// channel.
pub struct CarbonlinkListener {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CarbonlinkListener {
    /// Bind and start serving. Bind to port 0 to get an ephemeral port,
    /// readable via [`addr`](CarbonlinkListener::addr).
    pub async fn listen(
        addr: SocketAddr,
        queries: mpsc::Sender<Query>,
        settings: CarbonlinkSettings,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,

                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let queries = queries.clone();
                            let settings = settings.clone();
                            let mut conn_shutdown = shutdown_rx.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = conn_shutdown.changed() => {}
                                    _ = handle_connection(stream, peer, queries, settings) => {}
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "carbonlink accept failed");
                        }
                    },
                }
            }
        });

        info!(addr = %local_addr, "carbonlink listening");
        Ok(Self {
            addr: local_addr,
            shutdown_tx,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    queries: mpsc::Sender<Query>,
    settings: CarbonlinkSettings,
) {
    loop {
        let data = match timeout(settings.read_timeout, read_frame(&mut stream)).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "carbonlink request read failed");
                break;
            }
            Err(_) => {
                debug!(peer = %peer, "carbonlink read timeout");
                break;
            }
        };

        let metric = match decode_request(&data) {
            Ok(metric) => metric,
            Err(e) => {
                warn!(peer = %peer, error = %e, "carbonlink request rejected");
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if queries
            .send(Query { metric, reply: reply_tx })
            .await
            .is_err()
        {
            break;
        }

        let reply = match timeout(settings.query_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => {
                warn!(peer = %peer, "carbonlink cache query timed out, answering empty");
                Reply::default()
            }
        };

        let frame = match encode_reply(&reply) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "carbonlink reply encoding failed");
                break;
            }
        };
        if stream.write_all(&frame).await.is_err() {
            break;
        }
    }
}

/// Read one length-prefixed frame; `None` on clean EOF.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>, CarbonlinkError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_REQUEST_BYTES {
        return Err(CarbonlinkError::Oversize(len));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

/// Extract the metric name from a `cache-query` request dict. Python 2
/// senders pickle strings as bytes, so both spellings are accepted.
fn decode_request(data: &[u8]) -> Result<String, CarbonlinkError> {
    let value: Value = serde_pickle::from_slice(data, DeOptions::new())?;
    let Value::Dict(entries) = value else {
        return Err(CarbonlinkError::BadRequest("not a dict"));
    };

    let mut query_type = None;
    let mut metric = None;
    for (key, val) in entries {
        match key_as_str(&key) {
            Some("type") => query_type = value_to_string(val),
            Some("metric") => metric = value_to_string(val),
            _ => {}
        }
    }

    match query_type.as_deref() {
        Some("cache-query") => {}
        Some(_) => return Err(CarbonlinkError::BadRequest("unknown query type")),
        None => return Err(CarbonlinkError::BadRequest("missing type")),
    }
    metric.ok_or(CarbonlinkError::BadRequest("missing metric"))
}

fn key_as_str(key: &HashableValue) -> Option<&str> {
    match key {
        HashableValue::String(s) => Some(s.as_str()),
        HashableValue::Bytes(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        _ => None,
    }
}

#[derive(Serialize)]
struct CacheReply {
    datapoints: Vec<(i32, f64)>,
}

fn encode_reply(reply: &Reply) -> Result<Vec<u8>, CarbonlinkError> {
    let datapoints = reply
        .points
        .as_ref()
        .map(|batch| {
            batch
                .data
                .iter()
                .map(|p| (p.timestamp as i32, p.value))
                .collect()
        })
        .unwrap_or_default();

    let payload = serde_pickle::to_vec(&CacheReply { datapoints }, SerOptions::new())?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbond_points::MetricBatch;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Deserialize)]
    struct DecodedReply {
        datapoints: Vec<(i64, f64)>,
    }

    /// Answer queries from a fixed map, like the cache worker would.
    fn spawn_stub_cache() -> mpsc::Sender<Query> {
        let (tx, mut rx) = mpsc::channel::<Query>(16);
        tokio::spawn(async move {
            while let Some(query) = rx.recv().await {
                let points = (query.metric == "hello.world").then(|| {
                    let mut batch = MetricBatch::one_point("hello.world", 42.0, 10);
                    batch.append(carbond_points::Point { timestamp: 12, value: 15.0 });
                    batch
                });
                let _ = query.reply.send(Reply { points });
            }
        });
        tx
    }

    fn encode_request(query_type: &str, metric: &str) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert("type".to_string(), query_type.to_string());
        dict.insert("metric".to_string(), metric.to_string());
        let payload = serde_pickle::to_vec(&dict, SerOptions::new()).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> DecodedReply {
        stream.write_all(request).await.unwrap();

        let mut len_buf = [0u8; 4];
        timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf))
            .await
            .unwrap()
            .unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        serde_pickle::from_slice(&body, DeOptions::new()).unwrap()
    }

    #[tokio::test]
    async fn pickle_query_round_trip() {
        let listener = CarbonlinkListener::listen(
            "127.0.0.1:0".parse().unwrap(),
            spawn_stub_cache(),
            CarbonlinkSettings::default(),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(listener.addr()).await.unwrap();

        let reply = round_trip(&mut stream, &encode_request("cache-query", "hello.world")).await;
        assert_eq!(reply.datapoints, vec![(10, 42.0), (12, 15.0)]);

        let reply = round_trip(&mut stream, &encode_request("cache-query", "no.such")).await;
        assert!(reply.datapoints.is_empty());

        listener.stop().await;
    }

    #[tokio::test]
    async fn oversized_request_closes_connection() {
        let listener = CarbonlinkListener::listen(
            "127.0.0.1:0".parse().unwrap(),
            spawn_stub_cache(),
            CarbonlinkSettings::default(),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(listener.addr()).await.unwrap();
        stream.write_all(&5000u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0u8; 64]).await.unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "server should close the connection");

        listener.stop().await;
    }

    #[tokio::test]
    async fn unknown_query_type_closes_connection() {
        let listener = CarbonlinkListener::listen(
            "127.0.0.1:0".parse().unwrap(),
            spawn_stub_cache(),
            CarbonlinkSettings::default(),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(listener.addr()).await.unwrap();
        stream
            .write_all(&encode_request("cache-set", "x"))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        listener.stop().await;
    }

    #[test]
    fn decode_accepts_bytes_and_strings() {
        let mut dict = BTreeMap::new();
        dict.insert("type".to_string(), "cache-query".to_string());
        dict.insert("metric".to_string(), "a.b".to_string());
        let payload = serde_pickle::to_vec(&dict, SerOptions::new()).unwrap();
        assert_eq!(decode_request(&payload).unwrap(), "a.b");
    }
}
