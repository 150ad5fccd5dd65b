//! Proxy configuration.
//!
//! Every setting can come from a flag or an `IDGATE_*` environment variable.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::proxy::{
    ByteOrder, ListenerConfig, SniffConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_SNIFF_TIMEOUT,
};

/// Proxy configuration (flags with env fallback).
#[derive(Debug, Clone, Parser)]
#[command(name = "idgate", version, about = "Route TCP connections by device ID")]
pub struct Config {
    /// JSON file with route mappings.
    #[arg(long = "routes", env = "IDGATE_ROUTES_FILE", default_value = "mappings.json")]
    pub routes_file: PathBuf,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "IDGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Address listeners bind to. `::` accepts IPv4 and IPv6.
    #[arg(long, env = "IDGATE_BIND_IP", default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED))]
    pub bind_ip: IpAddr,

    /// Maximum concurrent connections per listener.
    #[arg(long, env = "IDGATE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Time a client has to send its header, in milliseconds.
    #[arg(long, env = "IDGATE_SNIFF_TIMEOUT_MS", default_value_t = DEFAULT_SNIFF_TIMEOUT.as_millis() as u64)]
    pub sniff_timeout_ms: u64,

    /// Backend connect timeout, in milliseconds.
    #[arg(long, env = "IDGATE_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    pub connect_timeout_ms: u64,

    /// Close a splice direction after this many idle seconds.
    #[arg(long, env = "IDGATE_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Byte order of the device ID in the header.
    #[arg(long, env = "IDGATE_BYTE_ORDER", value_enum, default_value_t = ByteOrder::Little)]
    pub byte_order: ByteOrder,
}

impl Config {
    /// Listener settings for one listen port.
    pub fn listener_config(&self, port: u16) -> ListenerConfig {
        let mut config = ListenerConfig::new(SocketAddr::new(self.bind_ip, port));
        config.max_connections = self.max_connections.max(1);
        config.sniff_config = SniffConfig {
            timeout: Duration::from_millis(self.sniff_timeout_ms.max(1)),
            byte_order: self.byte_order,
        };
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms.max(1));
        config.idle_timeout = self.idle_timeout_secs.map(Duration::from_secs);
        config
    }
}
