//! Device ID header sniffing.
//!
//! Every client connection starts with a fixed 7-byte header:
//!
//! ```text
//! +---+---+---+---+---+---+---+
//! | reserved  |   device id   |
//! +---+---+---+---+---+---+---+
//!   0   1   2   3   4   5   6
//! ```
//!
//! The reserved bytes are opaque. The sniffer never rewrites anything: the
//! raw header is kept so it can be replayed to the backend verbatim.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Length of the opaque prefix before the device ID.
pub const RESERVED_PREFIX_LEN: usize = 3;

/// Length of the device ID field.
pub const DEVICE_ID_LEN: usize = 4;

/// Total header length.
pub const HEADER_SIZE: usize = RESERVED_PREFIX_LEN + DEVICE_ID_LEN;

/// Default time a client gets to deliver the full header.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte order of the device ID field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    fn decode(self, bytes: [u8; DEVICE_ID_LEN]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }

    fn encode(self, value: u32) -> [u8; DEVICE_ID_LEN] {
        match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        }
    }
}

/// A complete header as read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFrame {
    raw: [u8; HEADER_SIZE],
    device_id: u32,
}

impl HeaderFrame {
    /// Parse a header from exactly `HEADER_SIZE` bytes.
    pub fn parse(raw: &[u8], order: ByteOrder) -> Option<Self> {
        let raw: [u8; HEADER_SIZE] = raw.try_into().ok()?;
        let id_bytes: [u8; DEVICE_ID_LEN] = raw[RESERVED_PREFIX_LEN..].try_into().ok()?;

        Some(Self {
            raw,
            device_id: order.decode(id_bytes),
        })
    }

    /// Build a header the way a client would send it.
    pub fn encode(reserved: [u8; RESERVED_PREFIX_LEN], device_id: u32, order: ByteOrder) -> Self {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..RESERVED_PREFIX_LEN].copy_from_slice(&reserved);
        raw[RESERVED_PREFIX_LEN..].copy_from_slice(&order.encode(device_id));
        Self { raw, device_id }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// The header bytes exactly as received.
    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.raw
    }
}

/// Result of sniffing a connection.
#[derive(Debug)]
pub enum SniffResult {
    /// Full header received.
    Found(HeaderFrame),
    /// Peer closed before sending a full header.
    Short { received: usize },
    /// Header did not arrive within the sniff timeout.
    Timeout { received: usize },
    /// Connection-level fault while reading.
    IoError(io::Error),
}

impl SniffResult {
    /// The header, if one was captured.
    pub fn frame(&self) -> Option<&HeaderFrame> {
        match self {
            SniffResult::Found(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Configuration for header sniffing.
#[derive(Debug, Clone, Copy)]
pub struct SniffConfig {
    pub timeout: Duration,
    pub byte_order: ByteOrder,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            byte_order: ByteOrder::default(),
        }
    }
}

/// Reads the device ID header from freshly accepted connections.
#[derive(Debug, Clone, Default)]
pub struct HeaderSniffer {
    config: SniffConfig,
}

impl HeaderSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Read the header from the stream.
    ///
    /// Consumes at most `HEADER_SIZE` bytes; application payload that
    /// follows is left in the stream for the splice.
    pub async fn sniff<R: AsyncRead + Unpin>(&self, stream: &mut R) -> SniffResult {
        let mut buf = [0u8; HEADER_SIZE];
        let mut received = 0;

        let read = timeout(
            self.config.timeout,
            read_header(stream, &mut buf, &mut received),
        )
        .await;

        match read {
            Ok(Ok(())) if received == HEADER_SIZE => {
                match HeaderFrame::parse(&buf, self.config.byte_order) {
                    Some(frame) => SniffResult::Found(frame),
                    None => SniffResult::Short { received },
                }
            }
            Ok(Ok(())) => {
                debug!(received, "Peer closed before full header");
                SniffResult::Short { received }
            }
            Ok(Err(e)) => SniffResult::IoError(e),
            Err(_) => SniffResult::Timeout { received },
        }
    }
}

/// Fill `buf` until it is full or the peer hits EOF.
async fn read_header<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8; HEADER_SIZE],
    received: &mut usize,
) -> io::Result<()> {
    while *received < HEADER_SIZE {
        let n = stream.read(&mut buf[*received..]).await?;
        if n == 0 {
            break;
        }
        *received += n;
    }
    Ok(())
}
