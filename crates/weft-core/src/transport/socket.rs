//! Data-plane sockets: pair, broadcast, and load-balanced delivery.
//!
//! A binding producer owns an accept loop and a per-peer writer task; the
//! fan discipline ([`FanMode`]) decides whether a frame is cloned to every
//! peer (broadcast) or rotated across peers (load-balanced distribute).
//! A binding consumer fair-merges frames from every accepted connection
//! into one bounded queue. Connect sides establish lazily with retry, so
//! no start order is required between the two ends of an edge.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::envelope::{encode_envelope, Envelope};

use super::frame::{read_frame, write_frame};
use super::retry::connect_with_retry;
use super::{FanMode, TransportConfig, TransportError};

/// One live accepted peer of a binding producer.
#[derive(Clone)]
struct Peer {
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

/// Shared state between a binding producer and its accept loop.
struct FanShared {
    peers: Mutex<Vec<Peer>>,
    count: watch::Sender<usize>,
}

impl FanShared {
    fn add(&self, peer: Peer) {
        let mut peers = self.peers.lock();
        peers.push(peer);
        let _ = self.count.send(peers.len());
    }

    fn remove(&self, addr: SocketAddr) {
        let mut peers = self.peers.lock();
        peers.retain(|p| p.addr != addr);
        let _ = self.count.send(peers.len());
    }
}

enum OutboundInner {
    /// Connect side: one lazily established connection.
    Lazy {
        addr: SocketAddr,
        writer: Option<BufWriter<OwnedWriteHalf>>,
    },
    /// Bind side: accept loop plus fan discipline over the live peers.
    Fan {
        shared: Arc<FanShared>,
        count_rx: watch::Receiver<usize>,
        mode: FanMode,
        /// Peers that must be connected before the first frame goes out;
        /// guards against the slow-joiner race on broadcast edges.
        expected_peers: usize,
        gate_open: bool,
        next: usize,
        accept_task: JoinHandle<()>,
    },
}

/// The sending end of a data edge.
pub struct DataOutbound {
    inner: OutboundInner,
    config: TransportConfig,
}

impl DataOutbound {
    /// Binds a producer endpoint and starts accepting consumers.
    ///
    /// `expected_peers` is the number of consumers the topology compiler
    /// resolved for this endpoint; the first send waits until all of them
    /// have connected.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the listener cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        mode: FanMode,
        expected_peers: usize,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let (count_tx, count_rx) = watch::channel(0usize);
        let shared = Arc::new(FanShared {
            peers: Mutex::new(Vec::new()),
            count: count_tx,
        });
        let accept_task = tokio::spawn(accept_peers(
            listener,
            Arc::clone(&shared),
            config.queue_depth,
            config.max_frame_bytes,
        ));
        Ok(Self {
            inner: OutboundInner::Fan {
                shared,
                count_rx,
                mode,
                expected_peers,
                gate_open: expected_peers == 0,
                next: 0,
                accept_task,
            },
            config: config.clone(),
        })
    }

    /// Creates a connect-side producer towards one bound consumer.
    ///
    /// The connection is established lazily on first send, with retry, so
    /// the consumer does not need to be up yet.
    #[must_use]
    pub fn connect(addr: SocketAddr, config: &TransportConfig) -> Self {
        Self {
            inner: OutboundInner::Lazy { addr, writer: None },
            config: config.clone(),
        }
    }

    /// Encodes and sends one envelope, honoring its send-side timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the envelope's deadline
    /// elapses, [`TransportError::Closed`] when no live peer remains, or
    /// the underlying io/codec error.
    pub async fn send(&mut self, env: &Envelope) -> Result<(), TransportError> {
        let body = encode_envelope(env)?;
        let deadline = env.timeout;
        if deadline.is_zero() {
            return self.send_body(body).await;
        }
        match tokio::time::timeout(deadline, self.send_body(body)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout { after: deadline }),
        }
    }

    async fn send_body(&mut self, body: Bytes) -> Result<(), TransportError> {
        match &mut self.inner {
            OutboundInner::Lazy { addr, writer } => {
                if writer.is_none() {
                    let stream = connect_with_retry(*addr, &self.config.retry).await?;
                    let (_read, write) = stream.into_split();
                    *writer = Some(BufWriter::new(write));
                }
                // Invariant: writer is Some here.
                let w = writer.as_mut().ok_or(TransportError::Closed)?;
                match write_frame(w, &body, self.config.max_frame_bytes).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        // Drop the broken connection; the next send redials.
                        *writer = None;
                        Err(err)
                    }
                }
            }
            OutboundInner::Fan {
                shared,
                count_rx,
                mode,
                expected_peers,
                gate_open,
                next,
                ..
            } => {
                if !*gate_open {
                    while *count_rx.borrow() < *expected_peers {
                        if count_rx.changed().await.is_err() {
                            return Err(TransportError::Closed);
                        }
                    }
                    *gate_open = true;
                }
                match mode {
                    FanMode::Single | FanMode::Broadcast => {
                        let targets: Vec<Peer> = shared.peers.lock().clone();
                        let mut delivered = 0usize;
                        for peer in targets {
                            if peer.tx.send(body.clone()).await.is_ok() {
                                delivered += 1;
                            } else {
                                warn!(peer = %peer.addr, "peer gone; detaching");
                                shared.remove(peer.addr);
                            }
                        }
                        if delivered == 0 {
                            return Err(TransportError::Closed);
                        }
                        Ok(())
                    }
                    FanMode::RoundRobin => loop {
                        let target = {
                            let peers = shared.peers.lock();
                            if peers.is_empty() {
                                return Err(TransportError::Closed);
                            }
                            peers[*next % peers.len()].clone()
                        };
                        *next = next.wrapping_add(1);
                        if target.tx.send(body.clone()).await.is_ok() {
                            return Ok(());
                        }
                        warn!(peer = %target.addr, "peer gone; detaching");
                        shared.remove(target.addr);
                    },
                }
            }
        }
    }
}

impl Drop for DataOutbound {
    fn drop(&mut self) {
        if let OutboundInner::Fan { accept_task, .. } = &self.inner {
            accept_task.abort();
        }
    }
}

/// Accept loop of a binding producer: one writer task per consumer.
async fn accept_peers(
    listener: TcpListener,
    shared: Arc<FanShared>,
    queue_depth: usize,
    max_frame_bytes: usize,
) {
    let mut writers = JoinSet::new();
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);
                let (tx, rx) = mpsc::channel::<Bytes>(queue_depth);
                shared.add(Peer {
                    addr: peer_addr,
                    tx,
                });
                let shared_for_writer = Arc::clone(&shared);
                writers.spawn(write_to_peer(
                    stream,
                    peer_addr,
                    rx,
                    shared_for_writer,
                    max_frame_bytes,
                ));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn write_to_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    shared: Arc<FanShared>,
    max_frame_bytes: usize,
) {
    let (_read, write) = stream.into_split();
    let mut writer = BufWriter::new(write);
    while let Some(body) = rx.recv().await {
        if let Err(err) = write_frame(&mut writer, &body, max_frame_bytes).await {
            debug!(peer = %peer_addr, error = %err, "peer write failed; detaching");
            break;
        }
    }
    let _ = writer.shutdown().await;
    shared.remove(peer_addr);
}

/// The receiving end of a data edge.
///
/// Frames from every connection are merged into one bounded queue in
/// arrival order; bounded depth gives natural backpressure to pushers.
pub struct DataInbound {
    rx: mpsc::Receiver<Bytes>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl DataInbound {
    /// Binds a consumer endpoint: pull side of a funnel, or the bound end
    /// of an exclusive pair.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] when the listener cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr().ok();
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let max = config.max_frame_bytes;
        let accept = tokio::spawn(async move {
            let mut readers = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let _ = stream.set_nodelay(true);
                        readers.spawn(read_from_peer(stream, peer_addr, tx.clone(), max));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        });
        Ok(Self {
            rx,
            local_addr,
            tasks: vec![accept],
        })
    }

    /// Creates a connect-side consumer: the subscribe side of a broadcast
    /// (possibly to several publishers), the pull side of a distribute, or
    /// the connect end of an exclusive pair.
    #[must_use]
    pub fn connect(peers: &[SocketAddr], config: &TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let mut tasks = Vec::with_capacity(peers.len());
        for &addr in peers {
            let tx = tx.clone();
            let retry = config.retry.clone();
            let max = config.max_frame_bytes;
            tasks.push(tokio::spawn(async move {
                match connect_with_retry(addr, &retry).await {
                    Ok(stream) => read_from_peer(stream, addr, tx, max).await,
                    Err(err) => warn!(%addr, error = %err, "inbound connect failed"),
                }
            }));
        }
        Self {
            rx,
            local_addr: None,
            tasks,
        }
    }

    /// Receives the next frame body, in arrival order across all peers.
    ///
    /// Returns `None` only when every feeding task has stopped.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// The bound local address, for bind-side sockets.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for DataInbound {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_from_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    max_frame_bytes: usize,
) {
    let (mut read, _write) = stream.into_split();
    loop {
        match read_frame(&mut read, max_frame_bytes).await {
            Ok(body) => {
                if tx.send(body).await.is_err() {
                    return;
                }
            }
            Err(TransportError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!(peer = %peer_addr, "peer closed");
                return;
            }
            Err(err) => {
                warn!(peer = %peer_addr, error = %err, "read failed; dropping peer");
                return;
            }
        }
    }
}

/// Counter used by tests to pick non-colliding loopback ports.
#[cfg(test)]
static TEST_PORT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(46_600);

#[cfg(test)]
pub(crate) fn test_addr() -> SocketAddr {
    let port = TEST_PORT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("127.0.0.1:{port}").parse().expect("test addr")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::envelope::{decode_envelope, Envelope, Payload};

    fn env_with(payload: &str) -> Envelope {
        Envelope::request("test", Payload::Json(payload.to_string()))
    }

    async fn recv_env(inbound: &mut DataInbound) -> Envelope {
        let body = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("recv timed out")
            .expect("channel closed");
        decode_envelope(&body).expect("decode")
    }

    #[tokio::test]
    async fn test_pair_bind_out_connect_in() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut out = DataOutbound::bind(addr, FanMode::Single, 1, &cfg).await.unwrap();
        let mut inb = DataInbound::connect(&[addr], &cfg);
        out.send(&env_with("pair")).await.unwrap();
        let got = recv_env(&mut inb).await;
        assert_eq!(got.payload, Payload::Json("pair".to_string()));
    }

    #[tokio::test]
    async fn test_pair_bind_in_connect_out() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut inb = DataInbound::bind(addr, &cfg).await.unwrap();
        let mut out = DataOutbound::connect(addr, &cfg);
        out.send(&env_with("reverse")).await.unwrap();
        let got = recv_env(&mut inb).await;
        assert_eq!(got.payload, Payload::Json("reverse".to_string()));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut out = DataOutbound::bind(addr, FanMode::Broadcast, 2, &cfg).await.unwrap();
        let mut sub_a = DataInbound::connect(&[addr], &cfg);
        let mut sub_b = DataInbound::connect(&[addr], &cfg);
        out.send(&env_with("fanout")).await.unwrap();
        let a = recv_env(&mut sub_a).await;
        let b = recv_env(&mut sub_b).await;
        assert_eq!(a.payload, b.payload);
    }

    #[tokio::test]
    async fn test_round_robin_distributes_across_peers() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut out = DataOutbound::bind(addr, FanMode::RoundRobin, 2, &cfg).await.unwrap();
        let mut worker_a = DataInbound::connect(&[addr], &cfg);
        let mut worker_b = DataInbound::connect(&[addr], &cfg);
        for i in 0..4 {
            out.send(&env_with(&format!("job-{i}"))).await.unwrap();
        }
        // Each worker sees exactly two of the four frames.
        let mut a_seen = 0;
        for _ in 0..2 {
            recv_env(&mut worker_a).await;
            a_seen += 1;
        }
        let mut b_seen = 0;
        for _ in 0..2 {
            recv_env(&mut worker_b).await;
            b_seen += 1;
        }
        assert_eq!(a_seen + b_seen, 4);
    }

    #[tokio::test]
    async fn test_funnel_merges_many_pushers() {
        let cfg = TransportConfig::default();
        let addr = test_addr();
        let mut inb = DataInbound::bind(addr, &cfg).await.unwrap();
        let mut push_a = DataOutbound::connect(addr, &cfg);
        let mut push_b = DataOutbound::connect(addr, &cfg);
        push_a.send(&env_with("from-a")).await.unwrap();
        push_b.send(&env_with("from-b")).await.unwrap();
        let mut seen = vec![recv_env(&mut inb).await, recv_env(&mut inb).await];
        seen.sort_by(|x, y| format!("{:?}", x.payload).cmp(&format!("{:?}", y.payload)));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_send_timeout_surfaces() {
        let cfg = TransportConfig {
            retry: super::super::ConnectRetry {
                max_attempts: 1000,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_millis(100),
            },
            ..TransportConfig::default()
        };
        // Nothing listens here; the lazy connect keeps retrying until the
        // envelope deadline cuts it off.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut out = DataOutbound::connect(addr, &cfg);
        let mut env = env_with("never");
        env.timeout = Duration::from_millis(200);
        let err = out.send(&env).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
