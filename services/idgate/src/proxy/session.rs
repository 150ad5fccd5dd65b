//! Per-connection session: sniff, route, dial, replay, splice.
//!
//! A session owns both sockets. Every exit path drops them, which closes
//! them; nothing is pooled or reused. Failures before the splice are normal
//! outcomes and close the client without writing anything back.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::header::{HeaderSniffer, SniffResult};
use super::router::{RouteTable, RoutingDecision};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Transfer chunk size for each splice direction.
pub const SPLICE_CHUNK_SIZE: usize = 8192;

/// Shared, read-only inputs for every session on a listener.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub route_table: Arc<RouteTable>,
    pub sniffer: HeaderSniffer,
    pub connect_timeout: Duration,
    /// Bound on a single read in either splice direction.
    pub idle_timeout: Option<Duration>,
}

impl SessionContext {
    pub fn new(route_table: Arc<RouteTable>) -> Self {
        Self {
            route_table,
            sniffer: HeaderSniffer::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
        }
    }
}

/// Session lifecycle. Any state may jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Sniffing,
    Routed,
    Connecting,
    Forwarding,
    Closed,
}

/// How one splice direction ended.
#[derive(Debug, Default)]
pub struct DirectionReport {
    /// Bytes written to the destination, including before any fault.
    pub bytes: u64,
    /// Set if the direction stopped on a fault instead of EOF.
    pub error: Option<io::Error>,
}

/// Result of splicing client and backend.
#[derive(Debug, Default)]
pub struct SpliceReport {
    pub to_backend: DirectionReport,
    pub from_backend: DirectionReport,
}

impl SpliceReport {
    /// Whether both directions reached EOF cleanly.
    pub fn is_clean(&self) -> bool {
        self.to_backend.error.is_none() && self.from_backend.error.is_none()
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// No complete header (short read, timeout or socket fault).
    InvalidHeader,
    /// Header parsed but no rule applies.
    NoRoute { device_id: u32 },
    /// Backend dial failed or timed out.
    DialFailed {
        device_id: u32,
        backend: SocketAddr,
        error: io::Error,
    },
    /// Header replay to the backend failed.
    Aborted {
        device_id: u32,
        backend: SocketAddr,
        error: io::Error,
    },
    /// Both splice directions finished.
    Completed {
        device_id: u32,
        backend: SocketAddr,
        report: SpliceReport,
    },
}

/// One accepted client connection.
pub struct Session {
    peer_addr: SocketAddr,
    listen_port: u16,
    state: SessionState,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, listen_port: u16) -> Self {
        Self {
            peer_addr,
            listen_port,
            state: SessionState::Accepted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// Drive the session to completion. Both sockets are closed on return.
    pub async fn run(mut self, mut client: TcpStream, ctx: &SessionContext) -> SessionOutcome {
        let outcome = self.forward(&mut client, ctx).await;
        self.transition(SessionState::Closed);
        outcome
    }

    async fn forward(&mut self, client: &mut TcpStream, ctx: &SessionContext) -> SessionOutcome {
        self.transition(SessionState::Sniffing);
        let frame = match ctx.sniffer.sniff(client).await {
            SniffResult::Found(frame) => frame,
            SniffResult::Short { received } => {
                debug!(received, "Dropping connection: incomplete header");
                return SessionOutcome::InvalidHeader;
            }
            SniffResult::Timeout { received } => {
                debug!(received, "Dropping connection: header timeout");
                return SessionOutcome::InvalidHeader;
            }
            SniffResult::IoError(e) => {
                debug!(error = %e, "Dropping connection: read failed");
                return SessionOutcome::InvalidHeader;
            }
        };
        let device_id = frame.device_id();

        let backend_addr = match ctx.route_table.route(device_id, self.listen_port) {
            RoutingDecision::Matched(rule) | RoutingDecision::Wildcard(rule) => rule.backend,
            RoutingDecision::NoRoute => {
                debug!(
                    device_id,
                    listen_port = self.listen_port,
                    "Dropping connection: no route"
                );
                return SessionOutcome::NoRoute { device_id };
            }
        };
        self.transition(SessionState::Routed);

        self.transition(SessionState::Connecting);
        let mut backend = match dial(backend_addr, ctx.connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(
                    device_id,
                    backend_addr = %backend_addr,
                    error = %error,
                    "Backend connection failed"
                );
                return SessionOutcome::DialFailed {
                    device_id,
                    backend: backend_addr,
                    error,
                };
            }
        };
        info!(
            peer_addr = %self.peer_addr,
            backend_addr = %backend_addr,
            device_id,
            "Established"
        );

        self.transition(SessionState::Forwarding);
        if let Err(error) = backend.write_all(frame.as_bytes()).await {
            warn!(backend_addr = %backend_addr, error = %error, "Header replay failed");
            return SessionOutcome::Aborted {
                device_id,
                backend: backend_addr,
                error,
            };
        }

        let report = splice(client, &mut backend, ctx.idle_timeout).await;

        info!(
            peer_addr = %self.peer_addr,
            backend_addr = %backend_addr,
            device_id,
            bytes_to_backend = report.to_backend.bytes,
            bytes_from_backend = report.from_backend.bytes,
            clean = report.is_clean(),
            "Closed"
        );

        SessionOutcome::Completed {
            device_id,
            backend: backend_addr,
            report,
        }
    }
}

/// Open a low-latency connection to a backend.
async fn dial(addr: SocketAddr, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect timeout",
            ))
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Copy both directions concurrently until both have stopped.
///
/// A direction that reaches EOF shuts down the write side of its
/// destination so the half-close propagates; the other direction keeps
/// running. A fault stops the direction it happened in and also shuts down
/// that direction's destination.
pub async fn splice(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> SpliceReport {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let (to_backend, from_backend) = tokio::join!(
        copy_direction(&mut client_read, &mut backend_write, idle_timeout),
        copy_direction(&mut backend_read, &mut client_write, idle_timeout),
    );

    SpliceReport {
        to_backend,
        from_backend,
    }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut report = DirectionReport::default();
    let mut buf = vec![0u8; SPLICE_CHUNK_SIZE];

    loop {
        let read_result = match idle_timeout {
            Some(limit) => match timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    report.error = Some(e);
                    break;
                }
                report.bytes += n as u64;
            }
            Err(e) => {
                report.error = Some(e);
                break;
            }
        }
    }

    // Always close the destination's write side, fault or not, so the peer
    // sees EOF and the opposite direction can finish.
    let shutdown = writer.shutdown().await;
    if report.error.is_none() {
        report.error = shutdown.err();
    }
    report
}
