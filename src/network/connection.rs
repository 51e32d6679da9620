//! A single multiplexed broker connection.
//!
//! The socket is split between two tasks. The writer owns the write half and
//! the correlation id counter: it registers each request in the pending map
//! before writing its frame, so frames go out in submission order. The reader
//! owns the read half and completes pending requests by correlation id.
//!
//! When either task fails, every pending request is failed with a retriable
//! error and the broker id is broadcast as disconnected.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::constants::CONNECTION_QUEUE_DEPTH;
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::metrics;
use crate::protocol::{ApiKey, ProduceResponse, Request, Response};
use crate::types::{BrokerId, CorrelationId};

type Reply = oneshot::Sender<Result<Response>>;

struct Outbound {
    request: Request,
    reply: Reply,
}

struct Pending {
    api_key: ApiKey,
    reply: Reply,
    sent_at: Instant,
}

/// State shared by the handle and both I/O tasks.
struct Shared {
    broker: BrokerId,
    pending: DashMap<i32, Pending>,
    closed: AtomicBool,
    /// Set when the connection was closed on purpose rather than lost.
    deliberate: AtomicBool,
    shutdown: watch::Sender<bool>,
    disconnects: broadcast::Sender<BrokerId>,
}

impl Shared {
    /// Tear the connection down, failing whatever is still pending.
    ///
    /// Only the first call has an effect. An explicit shutdown is not
    /// announced as a disconnect.
    fn terminate(&self, error: Error, announce: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.deliberate.store(!announce, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        metrics::ACTIVE_CONNECTIONS.dec();

        let ids: Vec<i32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let failed = ids.len();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(error.clone()));
            }
        }

        if announce {
            warn!(broker = %self.broker, failed, error = %error, "Broker connection lost");
            let _ = self.disconnects.send(self.broker);
        } else {
            debug!(broker = %self.broker, failed, "Broker connection closed");
        }
    }

    fn lost(&self, reason: impl Into<String>) {
        let error = Error::Retriable {
            reason: reason.into(),
            context: ErrorContext::new().code(KafkaCode::NetworkException),
        };
        self.terminate(error, true);
    }
}

/// Handle to a live broker connection.
pub(crate) struct BrokerConnection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
}

impl BrokerConnection {
    /// Open a TCP connection and spawn its reader and writer.
    pub(crate) async fn connect(
        broker: BrokerId,
        address: &str,
        client_id: String,
        connect_timeout: Duration,
        max_response_size: usize,
        disconnects: broadcast::Sender<BrokerId>,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(%broker, address, error = %e, "Connect failed");
                return Err(Error::IoError(e.kind()));
            }
            Err(_) => {
                debug!(%broker, address, "Connect timed out");
                return Err(Error::IoError(io::ErrorKind::TimedOut));
            }
        };
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(CONNECTION_QUEUE_DEPTH);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            broker,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            deliberate: AtomicBool::new(false),
            shutdown,
            disconnects,
        });
        metrics::ACTIVE_CONNECTIONS.inc();
        debug!(%broker, address, "Connected to broker");

        tokio::spawn(write_loop(
            shared.clone(),
            write_half,
            rx,
            client_id,
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            max_response_size,
            shutdown_rx,
        ));

        Ok(Self { shared, outbound })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Queue `request` and wait up to `request_timeout` for its response.
    pub(crate) async fn send(&self, request: Request, request_timeout: Duration) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::retriable(format!(
                "connection to broker {} is closed",
                self.shared.broker
            )));
        }

        let api_key = request.api_key();
        let (reply, rx) = oneshot::channel();
        self.outbound
            .send(Outbound { request, reply })
            .await
            .map_err(|_| {
                Error::retriable(format!("connection to broker {} is closed", self.shared.broker))
            })?;

        match timeout(request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The writer dropped the request without answering: the connection went
            // away while it was still queued.
            Ok(Err(_)) if self.shared.deliberate.load(Ordering::SeqCst) => Err(Error::Closed),
            Ok(Err(_)) => Err(Error::retriable(format!(
                "connection to broker {} lost before {} was sent",
                self.shared.broker,
                api_key.as_str()
            ))),
            Err(_) => {
                // The receiver is gone; drop its pending entry, and any other
                // abandoned one, so a broker that never answers does not grow
                // the map.
                self.shared.pending.retain(|_, pending| !pending.reply.is_closed());
                Err(Error::Retriable {
                    reason: format!("{} request timed out", api_key.as_str()),
                    context: ErrorContext::new().code(KafkaCode::RequestTimedOut),
                })
            }
        }
    }

    #[cfg(test)]
    fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Close the connection, failing outstanding requests with `error`.
    pub(crate) fn shutdown(&self, error: Error) {
        self.shared.terminate(error, false);
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.shared.terminate(Error::Closed, false);
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    client_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut correlation_id = CorrelationId::default();

    loop {
        let outbound = tokio::select! {
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let Outbound { request, reply } = outbound;
        let api_key = request.api_key();
        let frame = match request.encode_frame(correlation_id, &client_id) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e));
                continue;
            }
        };

        let expects_response = request.expects_response();
        let id = correlation_id.value();
        correlation_id = correlation_id.next();

        let reply = if expects_response {
            shared.pending.insert(
                id,
                Pending {
                    api_key,
                    reply,
                    sent_at: Instant::now(),
                },
            );
            // Lost a race with terminate(): fail the request here.
            if shared.closed.load(Ordering::SeqCst) {
                if let Some((_, pending)) = shared.pending.remove(&id) {
                    let _ = pending
                        .reply
                        .send(Err(Error::retriable("connection closed")));
                }
                break;
            }
            None
        } else {
            Some(reply)
        };

        trace!(broker = %shared.broker, correlation_id = id, api = api_key.as_str(), bytes = frame.len(), "Writing request");
        if let Err(e) = socket.write_all(&frame).await {
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::IoError(e.kind())));
            }
            shared.lost(format!("write to broker {} failed: {}", shared.broker, e));
            return;
        }

        if let Some(reply) = reply {
            metrics::record_request(api_key.as_str(), "success", 0.0);
            let _ = reply.send(Ok(Response::Produce(ProduceResponse::default())));
        }
    }

    let _ = socket.shutdown().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    mut socket: OwnedReadHalf,
    max_response_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return,
            frame = read_frame(&mut socket, max_response_size) => frame,
        };

        let mut frame = match frame {
            Ok(frame) => frame,
            Err(reason) => {
                shared.lost(reason);
                return;
            }
        };

        if frame.len() < 4 {
            shared.lost(format!("short response frame ({} bytes)", frame.len()));
            return;
        }
        let correlation_id = frame.get_i32();

        let Some((_, pending)) = shared.pending.remove(&correlation_id) else {
            // Usually a response that arrived after its request timed out.
            debug!(broker = %shared.broker, correlation_id, "Response for unknown correlation id");
            continue;
        };

        let elapsed = pending.sent_at.elapsed().as_secs_f64();
        let result = Response::parse(pending.api_key, frame);
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_request(pending.api_key.as_str(), status, elapsed);
        trace!(broker = %shared.broker, correlation_id, api = pending.api_key.as_str(), "Response received");

        let _ = pending.reply.send(result);
    }
}

/// Read one size-prefixed frame. Errors are returned as a reason string.
async fn read_frame(
    socket: &mut OwnedReadHalf,
    max_response_size: usize,
) -> std::result::Result<Bytes, String> {
    let mut size_buf = [0u8; 4];
    socket
        .read_exact(&mut size_buf)
        .await
        .map_err(|e| format!("read failed: {}", e))?;

    let size = (&size_buf[..]).get_i32();
    if size < 0 {
        return Err(format!("invalid negative response size: {}", size));
    }
    let size = size as usize;
    if size > max_response_size {
        return Err(format!(
            "response size {} exceeds maximum allowed size {}",
            size, max_response_size
        ));
    }

    let mut data = vec![0u8; size];
    socket
        .read_exact(&mut data)
        .await
        .map_err(|e| format!("connection closed mid-response: {}", e))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MetadataRequest;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_timed_out_request_leaves_no_pending_entry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        // Accept and read requests, never answer them.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut sink = vec![0u8; 4096];
            while socket.read(&mut sink).await.is_ok_and(|n| n > 0) {}
        });

        let (disconnects, _) = broadcast::channel(4);
        let connection = BrokerConnection::connect(
            BrokerId::new(1),
            &address,
            "test".to_string(),
            Duration::from_secs(1),
            1024 * 1024,
            disconnects,
        )
        .await
        .unwrap();

        for _ in 0..3 {
            let error = connection
                .send(MetadataRequest::all().into(), Duration::from_millis(50))
                .await
                .unwrap_err();
            assert_eq!(error.kafka_code(), Some(KafkaCode::RequestTimedOut));
        }
        assert_eq!(connection.pending_requests(), 0);
        assert!(!connection.is_closed());

        connection.shutdown(Error::Closed);
        server.abort();
    }
}
