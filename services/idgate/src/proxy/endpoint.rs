//! Backend endpoint resolution.
//!
//! Endpoints are written as `host:port` or a bare `host`, in which case
//! port 80 is assumed. Resolution is blocking and happens once while the
//! route table is built, never per connection.

use std::net::{SocketAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::EndpointError;

/// Port used when the endpoint string has no `:port` suffix.
pub const DEFAULT_BACKEND_PORT: u16 = 80;

/// Resolve an endpoint string to a single socket address.
///
/// When the resolver returns several addresses the first one is used.
pub fn resolve(spec: &str) -> Result<SocketAddr, EndpointError> {
    let (host, port) = split_host_port(spec)?;

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| EndpointError::Lookup {
            host: host.to_string(),
            source,
        })?;

    let addr = addrs
        .next()
        .ok_or_else(|| EndpointError::AddressNotFound(host.to_string()))?;

    debug!(endpoint = %spec, resolved = %addr, "Resolved backend endpoint");
    Ok(addr)
}

/// Split `host[:port]` without touching the resolver.
///
/// Exactly one `:` is allowed, so bracketed IPv6 literals are rejected.
fn split_host_port(spec: &str) -> Result<(&str, u16), EndpointError> {
    let mut parts = spec.split(':');
    let host = parts.next().unwrap_or_default();

    let port = match (parts.next(), parts.next()) {
        (None, _) => DEFAULT_BACKEND_PORT,
        (Some(port), None) => port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(spec.to_string()))?,
        (Some(_), Some(_)) => return Err(EndpointError::InvalidFormat(spec.to_string())),
    };

    Ok((host, port))
}
