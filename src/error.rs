use std::io;

use thiserror::Error;

/// Errors raised while decoding or encoding the IPv4/UDP headers of a tunnel packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("packet too large: {size} bytes exceeds limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },
}

/// Errors raised while walking a DNS message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("truncated message: need {needed} bytes at offset {offset}, have {len}")]
    TruncatedMessage {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("unsupported label type 0x{0:02x}")]
    BadLabel(u8),

    #[error("compression pointer loop at offset {0}")]
    PointerLoop(usize),

    #[error("name exceeds 255 octets")]
    NameTooLong,
}

/// Session-level failures. Any of these ends the current tunnel session and
/// hands control back to the supervisor.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session timed out: nothing received for {0:?}")]
    SessionTimedOut(std::time::Duration),

    #[error("relay failure: {0}")]
    RelayFailure(#[source] io::Error),

    #[error("tunnel I/O error: {0}")]
    Tunnel(#[source] io::Error),
}

impl SessionError {
    /// Whether the failure came from the upstream side rather than the tunnel itself.
    pub fn is_relay_failure(&self) -> bool {
        matches!(self, SessionError::RelayFailure(_))
    }
}

pub type PacketResult<T> = std::result::Result<T, PacketError>;
pub type DnsResult<T> = std::result::Result<T, DnsError>;
