//! UDP dispatcher: receive loop, client demultiplexing, lifecycle.
//!
//! One accept task owns the socket. Each datagram is routed to its client's
//! [`ConnectionHandler`] by the `"ip:port"` key (linear scan; the handler
//! count is bounded by the idle reaper). Handlers run inline on the
//! dispatcher task and return the datagrams to send back.

use anyhow::{Context, Result};
use satq_accel::Accelerator;
use satq_quic::ConnectionHandler;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest datagram the dispatcher accepts.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Socket readability wait per loop iteration.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimum spacing between idle-connection sweeps.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared proxy counters, updated lock-free from the dispatcher loop.
#[derive(Debug, Default)]
pub struct ProxyStats {
    total_bytes_received: AtomicU64,
    total_bytes_sent: AtomicU64,
    total_packets_received: AtomicU64,
    total_packets_sent: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
}

/// Point-in-time copy of the proxy counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyStatsSnapshot {
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub total_packets_received: u64,
    pub total_packets_sent: u64,
    pub total_connections: u64,
    pub active_connections: u64,
}

impl ProxyStats {
    fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_packets_received: self.total_packets_received.load(Ordering::Relaxed),
            total_packets_sent: self.total_packets_sent.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

type HandlerList = Arc<Mutex<Vec<Arc<ConnectionHandler>>>>;

/// The proxy dispatcher.
pub struct QuicProxy {
    bind_address: String,
    port: u16,
    accel: Arc<Accelerator>,
    acceleration_enabled: Arc<AtomicBool>,
    verbose: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handlers: HandlerList,
    stats: Arc<ProxyStats>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl QuicProxy {
    pub fn new(bind_address: impl Into<String>, port: u16, accel: Arc<Accelerator>) -> Self {
        Self {
            bind_address: bind_address.into(),
            port,
            accel,
            acceleration_enabled: Arc::new(AtomicBool::new(true)),
            verbose: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(ProxyStats::default()),
            local_addr: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            accept_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Bind the UDP socket and spawn the accept loop.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            anyhow::bail!("QUIC proxy already running");
        }

        let socket = match self.bind_socket() {
            Ok(socket) => socket,
            Err(error) => {
                self.running.store(false, Ordering::Release);
                return Err(error);
            }
        };

        let local_addr = socket.local_addr().context("reading local address")?;
        *self.local_addr.lock().unwrap() = Some(local_addr);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);

        let ctx = DispatchContext {
            socket,
            handlers: self.handlers.clone(),
            stats: self.stats.clone(),
            accel: self.accel.clone(),
            acceleration_enabled: self.acceleration_enabled.clone(),
            verbose: self.verbose.clone(),
            running: self.running.clone(),
        };
        let task = tokio::spawn(ctx.run(shutdown_rx));
        *self.accept_task.lock().await = Some(task);

        info!(addr = %local_addr, "QUIC proxy started");
        Ok(())
    }

    fn bind_socket(&self) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_address, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind_address, self.port))?;

        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("creating UDP socket")?;
        socket
            .set_reuse_address(true)
            .context("setting SO_REUSEADDR")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("binding UDP socket to {}", addr))?;
        socket
            .set_nonblocking(true)
            .context("setting non-blocking mode")?;

        UdpSocket::from_std(socket.into()).context("registering socket with the runtime")
    }

    /// Stop the accept loop, join it, and drop every handler.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }

        self.handlers.lock().unwrap().clear();
        self.stats.active_connections.store(0, Ordering::Relaxed);
        info!("QUIC proxy stopped");
    }

    /// Toggle offload for new and existing connections.
    pub fn set_acceleration_enabled(&self, enabled: bool) {
        self.acceleration_enabled.store(enabled, Ordering::Release);
        for handler in self.handlers.lock().unwrap().iter() {
            handler.set_acceleration_enabled(enabled);
        }
        debug!(enabled, "acceleration setting changed");
    }

    pub fn set_verbose_logging(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the socket actually bound to (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn stats(&self) -> ProxyStatsSnapshot {
        self.stats.snapshot()
    }

    /// Log the proxy counters, and the accelerator's when offload is on.
    pub fn print_stats(&self) {
        let stats = self.stats.snapshot();
        info!(
            active_connections = stats.active_connections,
            total_connections = stats.total_connections,
            packets_received = stats.total_packets_received,
            packets_sent = stats.total_packets_sent,
            bytes_received = stats.total_bytes_received,
            bytes_sent = stats.total_bytes_sent,
            "proxy statistics"
        );

        if self.acceleration_enabled.load(Ordering::Acquire) {
            self.accel.log_stats();
        }
    }
}

/// Everything the accept loop owns.
struct DispatchContext {
    socket: UdpSocket,
    handlers: HandlerList,
    stats: Arc<ProxyStats>,
    accel: Arc<Accelerator>,
    acceleration_enabled: Arc<AtomicBool>,
    verbose: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl DispatchContext {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut last_cleanup = Instant::now();

        loop {
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let now = Instant::now();
            if now.duration_since(last_cleanup) >= CLEANUP_INTERVAL {
                cleanup_inactive(&self.handlers, &self.stats, &self.verbose, now);
                last_cleanup = now;
            }
            refresh_send_stats(&self.handlers, &self.stats);

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                recv = tokio::time::timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf)) => {
                    let (len, peer) = match recv {
                        Err(_elapsed) => continue,
                        Ok(Err(error)) => {
                            warn!(%error, "UDP receive error");
                            continue;
                        }
                        Ok(Ok(pair)) => pair,
                    };

                    self.stats
                        .total_bytes_received
                        .fetch_add(len as u64, Ordering::Relaxed);
                    self.stats
                        .total_packets_received
                        .fetch_add(1, Ordering::Relaxed);

                    let handler = self.lookup_or_create(peer, now);
                    for datagram in handler.process_datagram(&buf[..len], now) {
                        if let Err(error) = self.socket.send_to(&datagram, peer).await {
                            warn!(%error, client = %peer, "UDP send error");
                        }
                    }
                }
            }
        }

        debug!("dispatcher loop exited");
    }

    /// Find the handler for this peer or create one. New handlers inherit
    /// the current acceleration setting.
    fn lookup_or_create(&self, peer: SocketAddr, now: Instant) -> Arc<ConnectionHandler> {
        let key = format!("{}:{}", peer.ip(), peer.port());

        let mut handlers = self.handlers.lock().unwrap();
        if let Some(handler) = handlers.iter().find(|h| h.client_key() == key) {
            return handler.clone();
        }

        if self.verbose.load(Ordering::Acquire) {
            info!(client = %key, "new connection");
        }

        let handler = Arc::new(ConnectionHandler::new(
            peer,
            self.accel.clone(),
            self.acceleration_enabled.load(Ordering::Acquire),
            now,
        ));
        handlers.push(handler.clone());

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats
            .active_connections
            .store(handlers.len() as u64, Ordering::Relaxed);

        handler
    }
}

/// Drop handlers whose idle timeout has elapsed.
fn cleanup_inactive(
    handlers: &HandlerList,
    stats: &ProxyStats,
    verbose: &AtomicBool,
    now: Instant,
) {
    let mut handlers = handlers.lock().unwrap();
    let before = handlers.len();
    handlers.retain(|handler| handler.is_active(now));
    let removed = before - handlers.len();

    stats
        .active_connections
        .store(handlers.len() as u64, Ordering::Relaxed);

    if removed > 0 && verbose.load(Ordering::Acquire) {
        info!(removed, "cleaned up inactive connections");
    }
}

/// Recompute the sent-side totals from the live handlers.
fn refresh_send_stats(handlers: &HandlerList, stats: &ProxyStats) {
    let (bytes, packets) = {
        let handlers = handlers.lock().unwrap();
        handlers.iter().fold((0u64, 0u64), |(bytes, packets), h| {
            (bytes + h.bytes_sent(), packets + h.packets_sent())
        })
    };
    stats.total_bytes_sent.store(bytes, Ordering::Relaxed);
    stats.total_packets_sent.store(packets, Ordering::Relaxed);
}
