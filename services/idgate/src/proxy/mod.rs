//! Device-ID routed TCP proxy.
//!
//! This module provides:
//! - Backend endpoint resolution
//! - Route table keyed by listen port and device ID
//! - Header sniffing with byte-exact replay
//! - Per-connection sessions and bidirectional splice
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Session -> Header Sniffer -> Route Table -> Backend
//!                                        |
//!                              header replayed verbatim
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use idgate::proxy::{serve, ListenerConfig, RouteSpec, RouteTable};
//!
//! let table = Arc::new(RouteTable::build(&[RouteSpec::new("*", "127.0.0.1:9000", 3000)])?);
//! serve(ListenerConfig::for_port(3000), table).await?;
//! ```

mod endpoint;
mod header;
mod listener;
mod router;
mod session;

pub use endpoint::{resolve, DEFAULT_BACKEND_PORT};
pub use header::{
    ByteOrder, HeaderFrame, HeaderSniffer, SniffConfig, SniffResult, DEFAULT_SNIFF_TIMEOUT,
    DEVICE_ID_LEN, HEADER_SIZE, RESERVED_PREFIX_LEN,
};
pub use listener::{
    serve, Listener, ListenerConfig, ListenerStats, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use router::{Matcher, RouteRule, RouteSpec, RouteTable, RoutingDecision, DEFAULT_LISTEN_PORT};
pub use session::{
    splice, DirectionReport, Session, SessionContext, SessionOutcome, SessionState, SpliceReport,
    DEFAULT_CONNECT_TIMEOUT, SPLICE_CHUNK_SIZE,
};
