use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use carbond_points::{parse_line, Channel};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::pickle::parse_pickle_points;
use crate::receiver::{Counters, Protocol};

const READ_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// A pickle frame larger than this is a broken or hostile sender.
const MAX_PICKLE_FRAME: u32 = 16 * 1024 * 1024;

pub(crate) async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    out: Channel,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    let out = out.clone();
                    let counters = Arc::clone(&counters);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        counters.active.fetch_add(1, Ordering::Relaxed);
                        match protocol {
                            Protocol::Pickle => {
                                handle_pickle(stream, out, &counters, conn_shutdown).await;
                            }
                            _ => handle_plaintext(stream, out, &counters, conn_shutdown).await,
                        }
                        counters.active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(e) => {
                    warn!(protocol = protocol.as_str(), error = %e, "failed to accept connection");
                }
            },
        }
    }
}

/// One `metric value timestamp` line per read; parse errors are counted
/// and logged, the connection lives on.
async fn handle_plaintext(
    stream: TcpStream,
    out: Channel,
    counters: &Counters,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sender = out.sender();
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = shutdown.changed() => break,
            read = timeout(READ_DEADLINE, reader.read_line(&mut line)) => read,
        };

        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) if !line.ends_with('\n') => {
                // EOF mid-line.
                if !line.trim().is_empty() {
                    warn!(line = %line.trim_end(), "unfinished line");
                }
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "tcp read failed");
                break;
            }
            Err(_) => break, // read deadline
        }

        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(batch) => {
                counters.metrics_received.fetch_add(1, Ordering::Relaxed);
                sender.send(batch).await;
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                info!(error = %e, "dropped plaintext line");
            }
        }
    }
}

/// Length-prefixed pickle frames, each a list of `(metric, (ts, value))`.
async fn handle_pickle(
    mut stream: TcpStream,
    out: Channel,
    counters: &Counters,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sender = out.sender();

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = timeout(READ_DEADLINE, read_pickle_frame(&mut stream)) => frame,
        };

        let data = match frame {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "can't read pickle message");
                break;
            }
            Err(_) => break, // read deadline
        };

        match parse_pickle_points(&data) {
            Ok(batches) => {
                for batch in batches {
                    counters
                        .metrics_received
                        .fetch_add(batch.len() as u32, Ordering::Relaxed);
                    sender.send(batch).await;
                }
            }
            Err(e) => {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                info!(error = %e, "can't unpickle message");
                break;
            }
        }
    }
}

async fn read_pickle_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_PICKLE_FRAME {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("pickle frame of {len} bytes"),
        ));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{Receiver, ReceiverSettings};
    use serde_pickle::SerOptions;
    use tokio::io::AsyncWriteExt;

    async fn recv_with_deadline(out: &Channel) -> carbond_points::MetricBatch {
        timeout(Duration::from_secs(5), out.recv()).await.unwrap()
    }

    #[tokio::test]
    async fn plaintext_lines_reach_the_channel() {
        let out = Channel::new(64);
        let receiver = Receiver::listen(
            Protocol::Tcp,
            "127.0.0.1:0".parse().unwrap(),
            out.clone(),
            ReceiverSettings::default(),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(receiver.addr()).await.unwrap();
        stream
            .write_all(b"hello.world 42.15 1422698155\nnot a metric\nother.one 1 1422698160\n")
            .await
            .unwrap();

        let first = recv_with_deadline(&out).await;
        assert_eq!(first.metric, "hello.world");
        assert_eq!(first.data[0].value, 42.15);

        let second = recv_with_deadline(&out).await;
        assert_eq!(second.metric, "other.one");

        drop(stream);
        // Parse failures count as errors without killing the connection.
        assert_eq!(receiver.counters.errors.load(Ordering::Relaxed), 1);
        assert_eq!(receiver.counters.metrics_received.load(Ordering::Relaxed), 2);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn pickle_frames_fan_out_into_batches() {
        let out = Channel::new(64);
        let receiver = Receiver::listen(
            Protocol::Pickle,
            "127.0.0.1:0".parse().unwrap(),
            out.clone(),
            ReceiverSettings::default(),
        )
        .await
        .unwrap();

        let rows: Vec<(String, (i64, f64))> = vec![
            ("pickled.one".to_string(), (1422698155, 42.0)),
            ("pickled.two".to_string(), (1422698156, 43.0)),
        ];
        let payload = serde_pickle::to_vec(&rows, SerOptions::new()).unwrap();

        let mut stream = TcpStream::connect(receiver.addr()).await.unwrap();
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&payload).await.unwrap();

        let first = recv_with_deadline(&out).await;
        assert_eq!(first.metric, "pickled.one");
        assert_eq!(first.data[0].timestamp, 1422698155);

        let second = recv_with_deadline(&out).await;
        assert_eq!(second.metric, "pickled.two");
        assert_eq!(second.data[0].value, 43.0);

        receiver.stop().await;
    }

    #[tokio::test]
    async fn oversized_pickle_frame_counts_as_error() {
        let out = Channel::new(64);
        let receiver = Receiver::listen(
            Protocol::Pickle,
            "127.0.0.1:0".parse().unwrap(),
            out.clone(),
            ReceiverSettings::default(),
        )
        .await
        .unwrap();

        let mut stream = TcpStream::connect(receiver.addr()).await.unwrap();
        stream
            .write_all(&(MAX_PICKLE_FRAME + 1).to_be_bytes())
            .await
            .unwrap();

        // Server drops the connection.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        receiver.stop().await;
    }
}
