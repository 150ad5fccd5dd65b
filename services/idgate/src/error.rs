//! Error types for route loading.
//!
//! Everything here is a load-time failure. Per-connection problems never
//! surface as errors; they end up in a `SessionOutcome` instead.

use std::io;

use thiserror::Error;

/// Failure to turn a `host[:port]` string into a socket address.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// More than one `:` in the endpoint string.
    #[error("invalid endpoint format: {0}")]
    InvalidFormat(String),

    /// Port segment is not a valid port number.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Name resolution succeeded but returned no addresses.
    #[error("address not found: {0}")]
    AddressNotFound(String),

    /// Name resolution itself failed.
    #[error("address lookup failed for {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Failure to compile a route mapping.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A device ID token is not an unsigned 32-bit integer.
    #[error("invalid device id: {0:?}")]
    InvalidId(String),

    /// A range token is not `A-B` with unsigned 32-bit bounds.
    #[error("invalid device id range: {0:?}")]
    InvalidRange(String),

    /// The matcher has no tokens at all.
    #[error("empty device id matcher")]
    EmptyMatcher,

    /// A second `*` rule was declared for the same listen port.
    #[error("duplicate wildcard rule for port {port}")]
    DuplicateWildcard { port: u16 },

    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

impl RouteError {
    /// Short machine-friendly reason, used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RouteError::InvalidId(_) => "invalid_id",
            RouteError::InvalidRange(_) => "invalid_range",
            RouteError::EmptyMatcher => "empty_matcher",
            RouteError::DuplicateWildcard { .. } => "duplicate_wildcard",
            RouteError::Endpoint(_) => "invalid_endpoint",
        }
    }
}
