//! TCP listener and accept loop.
//!
//! One listener runs per distinct listen port. Each accepted connection
//! gets its own task running a [`Session`], so a stuck client never holds
//! up the accept loop.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::header::{HeaderSniffer, SniffConfig, HEADER_SIZE};
use super::router::RouteTable;
use super::session::{Session, SessionContext, SessionOutcome, DEFAULT_CONNECT_TIMEOUT};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default idle timeout (none for raw TCP).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Pending connection backlog for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after an accept error to avoid spinning on a persistent fault.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Header sniffing configuration.
    pub sniff_config: SniffConfig,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// Idle timeout for spliced connections.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sniff_config: SniffConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Listen on every interface, IPv4 and IPv6, on `port`.
    pub fn for_port(port: u16) -> Self {
        Self::new(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections dropped for an incomplete header.
    pub invalid_headers: AtomicU64,
    /// Connections dropped with no matching route.
    pub routes_failed: AtomicU64,
    /// Backend dial failures.
    pub backend_failed: AtomicU64,
    /// Sessions that reached the splice.
    pub sessions_completed: AtomicU64,
    /// Bytes proxied to backend, header replay included.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record(&self, outcome: &SessionOutcome) {
        match outcome {
            SessionOutcome::InvalidHeader => {
                self.invalid_headers.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::NoRoute { .. } => {
                self.routes_failed.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::DialFailed { .. } | SessionOutcome::Aborted { .. } => {
                self.backend_failed.fetch_add(1, Ordering::Relaxed);
            }
            SessionOutcome::Completed { report, .. } => {
                self.sessions_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_backend.fetch_add(
                    report.to_backend.bytes + HEADER_SIZE as u64,
                    Ordering::Relaxed,
                );
                self.bytes_from_backend
                    .fetch_add(report.from_backend.bytes, Ordering::Relaxed);
            }
        }
    }
}

/// A TCP listener for the proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Port used for route lookups.
    listen_port: u16,
    /// Shared session inputs.
    session_ctx: Arc<SessionContext>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(config: ListenerConfig, route_table: Arc<RouteTable>) -> io::Result<Self> {
        let listener = bind_socket(config.bind_addr)?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let session_ctx = SessionContext {
            route_table,
            sniffer: HeaderSniffer::with_config(config.sniff_config),
            connect_timeout: config.connect_timeout,
            idle_timeout: config.idle_timeout,
        };

        Ok(Self {
            listener,
            listen_port: local_addr.port(),
            session_ctx: Arc::new(session_ctx),
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop. Only returns if the local address is lost.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    configure_accepted(&stream, peer_addr);

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let ctx = Arc::clone(&self.session_ctx);
                    let stats = Arc::clone(&self.stats);
                    let session = Session::new(peer_addr, self.listen_port);

                    tokio::spawn(
                        async move {
                            let outcome = session.run(stream, &ctx).await;
                            stats.record(&outcome);

                            drop(permit);
                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("session", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Bind and run a listener until the process exits.
///
/// A port already held by another process is logged and ends this listener
/// only; other listeners keep running.
pub async fn serve(config: ListenerConfig, route_table: Arc<RouteTable>) -> io::Result<()> {
    let bind_addr = config.bind_addr;
    let listener = match Listener::bind(config, route_table).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!(bind_addr = %bind_addr, "Port is already in use");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    listener.run().await
}

/// Per-connection socket options for an accepted client.
fn configure_accepted(stream: &TcpStream, peer_addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }
}

/// Create a non-blocking listening socket.
///
/// The IPv6 wildcard is bound dual-stack so IPv4 clients arrive as mapped
/// addresses. Hosts without IPv6 fall back to the IPv4 wildcard.
fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    match bind_with_socket2(addr) {
        Err(e) if addr.ip() == Ipv6Addr::UNSPECIFIED && e.kind() != io::ErrorKind::AddrInUse => {
            let fallback = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), addr.port());
            warn!(
                bind_addr = %addr,
                fallback_addr = %fallback,
                error = %e,
                "IPv6 bind failed, falling back to IPv4"
            );
            bind_with_socket2(fallback)
        }
        result => result,
    }
}

fn bind_with_socket2(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    // Matches tokio `TcpListener::bind`; TIME_WAIT sockets must not block a rebind.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
