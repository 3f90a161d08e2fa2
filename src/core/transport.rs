/// Transport seam between pooled connections and the byte-level proxy
///
/// The core never touches sockets while routing. A `Connector` produces a
/// `Transport` for a backend address, and connections hand payloads to it
/// together with a `Completion` the transport resolves once the bytes are
/// flushed (or failed).
use crate::error::ConnectionError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Producer side of a pending write
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<(), ConnectionError>>,
}

impl Completion {
    pub fn succeed(self) {
        // The caller may have dropped its handle; nothing to report then.
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, err: ConnectionError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Caller side of a pending write; resolves when the transport finishes it
#[derive(Debug)]
pub struct WriteHandle {
    connection_id: u64,
    rx: oneshot::Receiver<Result<(), ConnectionError>>,
}

impl Future for WriteHandle {
    type Output = Result<(), ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.connection_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Unavailable { id })))
    }
}

/// Create a linked completion/handle pair for a write on `connection_id`
pub fn write_pair(connection_id: u64) -> (Completion, WriteHandle) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, WriteHandle { connection_id, rx })
}

/// Established link to a backend.
///
/// `write` must not block: implementations queue the payload and resolve
/// the completion later.
pub trait Transport: Send + Sync + 'static {
    fn write(&self, payload: Bytes, completion: Completion);

    fn is_active(&self) -> bool;

    fn close(&self);
}

/// Establishes transports to backend addresses
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn Transport>>;
}

/// Plain TCP connector with a bounded connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        debug!("Connecting to backend {}", addr);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Timeout connecting to backend {}", addr);
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ));
            }
        };

        // Low latency matters more than coalescing for proxied traffic
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to configure backend stream {}: {}", addr, e);
        }

        debug!("Successfully connected to backend {}", addr);
        Ok(TcpTransport::spawn(stream))
    }
}

type PendingWrite = (Bytes, Completion);

/// TCP transport whose writes are drained by a dedicated writer task.
///
/// Only the write half is driven here; backend replies belong to the proxy
/// layer, which owns its own sockets.
pub struct TcpTransport {
    tx: mpsc::UnboundedSender<PendingWrite>,
    active: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn spawn(stream: TcpStream) -> Arc<Self> {
        let (_, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        tokio::spawn(Self::write_loop(
            writer,
            rx,
            Arc::clone(&active),
            shutdown.clone(),
        ));

        Arc::new(Self {
            tx,
            active,
            shutdown,
        })
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<PendingWrite>,
        active: Arc<AtomicBool>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                next = rx.recv() => next,
            };
            let Some((payload, completion)) = next else {
                break;
            };

            let written = async {
                writer.write_all(&payload).await?;
                writer.flush().await
            }
            .await;

            match written {
                Ok(()) => completion.succeed(),
                Err(e) => {
                    debug!("Backend write failed: {}", e);
                    completion.fail(e.into());
                    break;
                }
            }
        }

        active.store(false, Ordering::Release);
        rx.close();
        while let Some((_, completion)) = rx.recv().await {
            completion.fail(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        let _ = writer.shutdown().await;
    }
}

impl Transport for TcpTransport {
    fn write(&self, payload: Bytes, completion: Completion) {
        if let Err(mpsc::error::SendError((_, completion))) = self.tx.send((payload, completion)) {
            completion.fail(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.shutdown.cancel();
    }
}

/// In-memory transport that records every payload it is handed.
///
/// Writes complete immediately while active and fail once closed.
#[derive(Default)]
pub struct MemoryTransport {
    written: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.written.lock().clone()
    }

    /// Simulate the peer going away without an explicit close
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Transport for MemoryTransport {
    fn write(&self, payload: Bytes, completion: Completion) {
        if self.is_active() {
            self.written.lock().push(payload);
            completion.succeed();
        } else {
            completion.fail(io::Error::from(io::ErrorKind::NotConnected).into());
        }
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// How a `MemoryConnector` answers connect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryConnectMode {
    /// Hand out a fresh `MemoryTransport`
    Accept,
    /// Fail with `ConnectionRefused`
    Refuse,
    /// Never complete
    Hang,
}

/// Connector producing in-memory transports, for tests and benchmarks
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    mode: MemoryConnectMode,
}

impl MemoryConnector {
    pub fn new(mode: MemoryConnectMode) -> Self {
        Self { mode }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _addr: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        match self.mode {
            MemoryConnectMode::Accept => Ok(MemoryTransport::new()),
            MemoryConnectMode::Refuse => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            MemoryConnectMode::Hang => std::future::pending().await,
        }
    }
}
