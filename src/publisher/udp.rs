use super::retry::RetryPolicy;
use super::wire::{EncodeError, WireEncoder};
use crate::pipeline::{Batch, SpoolerReceiver};
use crate::source::event::Event;
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("send still failing after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("send rejected: {0}")]
    Permanent(#[source] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Anything that can hand one datagram to the network
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
}

/// Connected UDP socket to the collector
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(peer: SocketAddr) -> io::Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        debug!(local = ?socket.local_addr().ok(), peer = %peer, "UDP socket ready");
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload).await
    }
}

#[derive(Debug, Default)]
pub struct PublisherStats {
    sent: AtomicU64,
    datagrams: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    truncated: AtomicU64,
    split: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    /// Events whose every datagram reached the socket
    pub sent: u64,
    pub datagrams: u64,
    pub retries: u64,
    /// Events given up on after encoding or send failures
    pub dropped: u64,
    /// Events shortened to fit one datagram
    pub truncated: u64,
    /// Events spread over several datagrams
    pub split: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            datagrams: self.datagrams.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            truncated: self.truncated.load(Ordering::Relaxed),
            split: self.split.load(Ordering::Relaxed),
        }
    }
}

/// Encodes events and sends each as its own datagram, retrying transient
/// socket errors with backoff.
pub struct UdpPublisher {
    transport: Box<dyn Transport>,
    encoder: WireEncoder,
    retry: RetryPolicy,
    stats: Arc<PublisherStats>,
}

impl UdpPublisher {
    pub fn new(transport: Box<dyn Transport>, encoder: WireEncoder, retry: RetryPolicy) -> Self {
        Self {
            transport,
            encoder,
            retry,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    pub async fn publish(&self, event: &Event) -> Result<(), SendError> {
        let encoded = self.encoder.encode(event)?;
        if encoded.truncated {
            self.stats.truncated.fetch_add(1, Ordering::Relaxed);
        }
        if encoded.is_split() {
            self.stats.split.fetch_add(1, Ordering::Relaxed);
        }

        for datagram in &encoded.datagrams {
            self.send_with_retry(datagram).await?;
            self.stats.datagrams.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send_with_retry(&self, payload: &[u8]) -> Result<(), SendError> {
        let mut attempt = 0;
        loop {
            let err = match self.transport.send(payload).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };

            if !RetryPolicy::is_retryable(&err) {
                return Err(SendError::Permanent(err));
            }
            if attempt >= self.retry.max_retries() {
                return Err(SendError::Transient {
                    attempts: attempt + 1,
                    source: err,
                });
            }

            let delay = self.retry.backoff(attempt);
            debug!(attempt = attempt + 1, delay = ?delay, error = %err, "Send failed, retrying");
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Publish a batch in order. Failed events are dropped and counted.
    /// Returns the number of events sent.
    pub async fn publish_batch(&self, batch: Batch) -> usize {
        let mut sent = 0;
        for event in batch {
            match self.publish(&event).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        path = %event.source.display(),
                        offset = event.offset,
                        error = %e,
                        "Dropping event"
                    );
                }
            }
        }
        sent
    }
}

/// Drain the spooler until every sender is gone.
pub async fn run_publisher(
    mut spooler: SpoolerReceiver,
    publisher: UdpPublisher,
    batch_size: usize,
    batch_timeout: Duration,
) -> PublisherStatsSnapshot {
    info!(batch_size, batch_timeout = ?batch_timeout, "Publisher started");

    while let Some(batch) = spooler.drain(batch_size, batch_timeout).await {
        let size = batch.len();
        let sent = publisher.publish_batch(batch).await;
        debug!(events = size, sent, "Batch published");
    }

    let stats = publisher.stats.snapshot();
    info!(
        sent = stats.sent,
        datagrams = stats.datagrams,
        retries = stats.retries,
        dropped = stats.dropped,
        "Publisher stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{OutputConfig, OversizePolicy, RetryConfig, WireFormat};
    use crate::pipeline::spooler;
    use crate::source::file_id::FileId;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Records payloads; fails the first `failures` sends with `kind`
    struct MockTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        failures: AtomicU32,
        kind: io::ErrorKind,
    }

    impl MockTransport {
        fn new(failures: u32, kind: io::ErrorKind) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            let transport = Self {
                sent: sent.clone(),
                failures: AtomicU32::new(failures),
                kind,
            };
            (transport, sent)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, payload: &[u8]) -> io::Result<usize> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::from(self.kind));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(payload.len())
        }
    }

    fn output(max_datagram_bytes: usize, on_oversize: OversizePolicy) -> OutputConfig {
        OutputConfig {
            host: "127.0.0.1".to_string(),
            port: 5000,
            format: WireFormat::Json,
            log_type: "log".to_string(),
            max_datagram_bytes,
            on_oversize,
            retry: RetryConfig::default(),
        }
    }

    fn publisher(transport: impl Transport + 'static, max_retries: u32) -> UdpPublisher {
        UdpPublisher::new(
            Box::new(transport),
            WireEncoder::with_host(&output(1024, OversizePolicy::Truncate), "test"),
            RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4)),
        )
    }

    fn event(offset: u64, text: &str) -> Event {
        Event {
            source: PathBuf::from("/tmp/x/a.log"),
            file_id: FileId::new(1, 2),
            offset,
            read_at: Utc::now(),
            line: text.as_bytes().to_vec(),
            truncated: false,
        }
    }

    fn message(payload: &[u8]) -> String {
        let doc: serde_json::Value = serde_json::from_slice(payload).unwrap();
        doc["message"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_transient_error_retried() {
        let (transport, sent) = MockTransport::new(2, io::ErrorKind::ConnectionRefused);
        let publisher = publisher(transport, 3);

        publisher.publish(&event(0, "hello")).await.unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
        let stats = publisher.stats().snapshot();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.datagrams, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_drops_and_counts() {
        let (transport, sent) = MockTransport::new(100, io::ErrorKind::ConnectionRefused);
        let publisher = publisher(transport, 2);

        let result = publisher.publish(&event(0, "lost")).await;
        assert!(matches!(result, Err(SendError::Transient { attempts: 3, .. })));

        let batch = Batch {
            events: vec![event(0, "a"), event(2, "b")],
        };
        assert_eq!(publisher.publish_batch(batch).await, 0);

        assert!(sent.lock().unwrap().is_empty());
        let stats = publisher.stats().snapshot();
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.sent, 0);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let (transport, _sent) = MockTransport::new(1, io::ErrorKind::InvalidInput);
        let publisher = publisher(transport, 5);

        let result = publisher.publish(&event(0, "bad")).await;
        assert!(matches!(result, Err(SendError::Permanent(_))));
        assert_eq!(publisher.stats().snapshot().retries, 0);
    }

    #[tokio::test]
    async fn test_split_event_counts_datagrams() {
        let (transport, sent) = MockTransport::new(0, io::ErrorKind::Other);
        let publisher = UdpPublisher::new(
            Box::new(transport),
            WireEncoder::with_host(&output(300, OversizePolicy::Split), "test"),
            RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
        );

        publisher.publish(&event(0, &"z".repeat(500))).await.unwrap();

        let stats = publisher.stats().snapshot();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.split, 1);
        assert!(stats.datagrams > 1);
        assert_eq!(stats.datagrams as usize, sent.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_run_publisher_drains_until_closed() {
        let (transport, sent) = MockTransport::new(0, io::ErrorKind::Other);
        let publisher = publisher(transport, 0);
        let (tx, rx) = spooler(8);

        tx.push(event(0, "hello")).await.unwrap();
        tx.push(event(6, "world")).await.unwrap();
        drop(tx);

        let stats = run_publisher(rx, publisher, 16, Duration::from_millis(5)).await;
        assert_eq!(stats.sent, 2);

        let sent = sent.lock().unwrap();
        let messages: Vec<String> = sent.iter().map(|p| message(p)).collect();
        assert_eq!(messages, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn test_udp_transport_delivers_datagram() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(listener.local_addr().unwrap()).await.unwrap();

        let publisher = publisher(transport, 0);
        publisher.publish(&event(0, "over the wire")).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), listener.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message(&buf[..len]), "over the wire");
    }
}
