#![forbid(unsafe_code)]

//! Weft UDP transport adapter.
//!
//! * Single `UdpSocket` bound with `SO_REUSEPORT` when supported.
//! * Async receive loop dispatches datagrams to a handler trait, behind a
//!   per-source token bucket.
//! * Oversize datagrams (beyond the wire cap) are dropped silently; there is
//!   no fragmentation layer.
//! * Transient I/O errors are logged and recovered; a persistent socket
//!   fault raises the fatal signal so the owning node can report `Stopped`.

use async_trait::async_trait;
use socket2::{Domain, Type};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::{net::UdpSocket, sync::mpsc, sync::watch};
use tracing::{debug, error, info, warn};

use weft_wire::MAX_DATAGRAM;

pub mod rate;
pub use rate::{SourceRateLimiter, TokenBucket};

// Consecutive receive failures before the socket is declared dead.
const FATAL_RECV_ERRORS: u32 = 8;

/// Trait for components that consume inbound packets.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn handle_packet(&self, src: SocketAddr, data: &[u8]);
}

/// Ingress/egress drop counters, shared with the owning node for statistics.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub dropped_oversize: AtomicU64,
    pub send_errors: AtomicU64,
}

/// UDP socket pool: wraps a single socket but keeps Arc for sharing.
#[derive(Clone)]
pub struct UdpPool {
    socket: Arc<UdpSocket>,
}

impl UdpPool {
    /// Bind on 0.0.0.0:port with reuse_port when possible.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        // Build socket manually to set reuse_port (if available).
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        // ReusePort best-effort.
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        socket.set_reuse_port(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let udp = UdpSocket::from_std(std_sock)?;
        Ok(Self {
            socket: Arc::new(udp),
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

/// Main transport adapter. Spawns the RX task and exposes the TX API.
pub struct Transport {
    pool: UdpPool,
    tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    counters: Arc<TransportCounters>,
    fatal_rx: watch::Receiver<bool>,
    close_tx: watch::Sender<bool>,
}

impl Transport {
    /// Bind and start I/O loops. Inbound datagrams pass the rate limiter and
    /// size check before reaching `handler`.
    pub async fn start<H: PacketHandler>(
        port: u16,
        handler: Arc<H>,
        limiter: Arc<SourceRateLimiter>,
    ) -> std::io::Result<Self> {
        let pool = UdpPool::bind(port).await?;
        let sock = pool.socket();
        let counters = Arc::new(TransportCounters::default());
        let (tx, mut rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(1024);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let (close_tx, mut close_rx) = watch::channel(false);

        // RX loop
        let rx_sock = sock.clone();
        let rx_counters = counters.clone();
        tokio::spawn(async move {
            // One byte of headroom distinguishes an exactly-max datagram
            // from a truncated oversize one.
            let mut buf = vec![0u8; MAX_DATAGRAM + 1];
            let mut consecutive_errors = 0u32;
            loop {
                let recv = tokio::select! {
                    _ = close_rx.changed() => break,
                    r = rx_sock.recv_from(&mut buf) => r,
                };
                match recv {
                    Ok((len, src)) => {
                        consecutive_errors = 0;
                        if len > MAX_DATAGRAM {
                            rx_counters.dropped_oversize.fetch_add(1, Ordering::Relaxed);
                            debug!(%src, len, "dropping oversize datagram");
                            continue;
                        }
                        if !limiter.allow(src, Instant::now()) {
                            continue;
                        }
                        handler.handle_packet(src, &buf[..len]).await;
                    }
                    Err(e) => {
                        error!("udp recv error: {e}");
                        consecutive_errors += 1;
                        if consecutive_errors >= FATAL_RECV_ERRORS {
                            warn!("receive loop giving up after {consecutive_errors} consecutive errors");
                            let _ = fatal_tx.send(true);
                            break;
                        }
                    }
                }
            }
        });

        // TX loop
        let tx_sock = sock.clone();
        let tx_counters = counters.clone();
        tokio::spawn(async move {
            while let Some((addr, data)) = rx.recv().await {
                if let Err(e) = tx_sock.send_to(&data, addr).await {
                    tx_counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    error!("udp send error: {e}");
                }
            }
        });

        if let Ok(local) = sock.local_addr() {
            info!("weft-transport listening on {local}");
        }
        Ok(Self {
            pool,
            tx,
            counters,
            fatal_rx,
            close_tx,
        })
    }

    /// Stop the receive loop. The socket closes once all clones are dropped.
    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    /// Queue a datagram for sending. Transient socket errors are absorbed by
    /// the TX loop; only a closed transport surfaces here.
    pub async fn send(&self, addr: SocketAddr, data: &[u8]) -> std::io::Result<()> {
        self.tx
            .send((addr, data.to_vec()))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotConnected, "transport closed"))
    }

    /// Non-blocking send used on forwarding paths: when the outbound channel
    /// is saturated the datagram is dropped and `false` returned, rather than
    /// queueing unboundedly.
    pub fn try_send(&self, addr: SocketAddr, data: &[u8]) -> bool {
        self.tx.try_send((addr, data.to_vec())).is_ok()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        let addr = self.pool.socket().local_addr()?;
        // An UNSPECIFIED bind address is not a usable destination; map it to
        // loopback so in-process peers can reach us. Externally visible
        // addresses come from peer observations, not from this call.
        let mapped = match addr.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
            }
            IpAddr::V6(v6) if v6.is_unspecified() => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
            }
            _ => addr,
        };
        Ok(mapped)
    }

    /// Resolves once the receive loop has died on a persistent socket fault.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_rx.clone()
    }

    /// Drop counters shared with the statistics surface.
    pub fn counters(&self) -> Arc<TransportCounters> {
        self.counters.clone()
    }
}

impl Clone for Transport {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            tx: self.tx.clone(),
            counters: self.counters.clone(),
            fatal_rx: self.fatal_rx.clone(),
            close_tx: self.close_tx.clone(),
        }
    }
}

/// Best-effort enumeration of local interface addresses, used to tell a
/// publicly bound socket apart from one behind a translator. The outbound
/// route probe opens no connection; `connect` on UDP only selects a route.
pub fn local_interface_addrs(bound: SocketAddr) -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    if !bound.ip().is_unspecified() {
        addrs.push(bound.ip());
    }
    if let Ok(probe) = std::net::UdpSocket::bind(("0.0.0.0", 0)) {
        if probe.connect(("198.51.100.1", 9)).is_ok() {
            if let Ok(local) = probe.local_addr() {
                if !addrs.contains(&local.ip()) {
                    addrs.push(local.ip());
                }
            }
        }
    }
    addrs
}
