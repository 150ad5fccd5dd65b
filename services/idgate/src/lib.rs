pub mod config;
pub mod error;
pub mod mappings;
pub mod proxy;

pub use error::{EndpointError, RouteError};
pub use proxy::{
    serve, ByteOrder, HeaderFrame, HeaderSniffer, Listener, ListenerConfig, ListenerStats,
    Matcher, RouteRule, RouteSpec, RouteTable, RoutingDecision, SessionOutcome, SniffConfig,
    SniffResult,
};
