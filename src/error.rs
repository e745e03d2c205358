//! Domain-specific error types for the doclink protocol.
//!
//! All fallible operations return `Result<T, LinkError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the doclink protocol.
///
/// Only [`LinkError::Busy`] is ever returned synchronously to a caller;
/// every other variant travels through a [`SessionDelegate`] callback.
///
/// [`SessionDelegate`]: crate::SessionDelegate
#[derive(Debug, Error)]
pub enum LinkError {
    // ── Transfer guards ──────────────────────────────────────────
    /// A second send or receive was requested while one in that
    /// direction is already in flight.
    #[error("a transfer is already in flight in this direction")]
    Busy,

    // ── Protocol errors ──────────────────────────────────────────
    /// A metadata field could not be decoded as delimiter-terminated
    /// UTF-8 text, or the declared length is not a decimal number.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// The declared payload length exceeds the configured maximum.
    #[error("declared payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    // ── Transport errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// A staged read or write exceeded its deadline.
    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    /// The peer connection dropped mid-operation.
    #[error("peer disconnected")]
    Disconnected,

    /// An internal channel to a connection task closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Discovery errors ─────────────────────────────────────────
    /// Advertisement, search, or resolution of the peer service failed.
    #[error("discovery failed: {0}")]
    Discovery(String),

    // ── Lifecycle errors ─────────────────────────────────────────
    /// An operation was attempted on a session that is already closed.
    #[error("session is closed")]
    Closed,
}

impl From<mdns_sd::Error> for LinkError {
    fn from(e: mdns_sd::Error) -> Self {
        LinkError::Discovery(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ChannelClosed
    }
}
