//! Wire-level vocabulary: the transfer unit, its staged fields, and
//! the fixed protocol constants shared by host and client.
//!
//! # Wire format
//!
//! One file in flight is serialized as three delimiter-terminated
//! UTF-8 text fields followed by the raw payload bytes:
//!
//! ```text
//! <decimal length>\n\n<type-tag>\n\n<name>\n\n<payload bytes (length bytes, only if length > 0)>
//! ```
//!
//! Fields are read back by scanning for the delimiter, never by fixed
//! offsets — there is no padding and no binary header.

use std::time::Duration;

use bytes::Bytes;

use crate::error::LinkError;

/// Two-byte field delimiter, shared by both sides.
pub const DELIMITER: &[u8; 2] = b"\n\n";

/// mDNS service type advertised by the host and browsed by the client.
pub const SERVICE_TYPE: &str = "_doclink._tcp.local.";

/// Maximum declared payload length the receiver will accept (64 MiB).
///
/// A length above this is unusable and rejected before any payload
/// bytes are read.
pub const MAX_PAYLOAD_SIZE: u64 = 64 * 1024 * 1024;

/// Ceiling on bytes buffered on the receive side: one maximal payload
/// plus an allowance for the metadata fields around it.
///
/// A peer that outruns this without a frame completing — flooding, or
/// a stream that never contains a delimiter — is dropped.
pub const MAX_BUFFER_SIZE: usize = MAX_PAYLOAD_SIZE as usize + 1024;

/// Default timeout for each metadata stage read/write.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for waiting on an inbound transfer to start and for
/// its payload to arrive, when the caller does not supply one.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

// ── FrameField ───────────────────────────────────────────────────

/// One staged element of the wire format.
///
/// A transfer is exactly the sequence `Size`, `TypeTag`, `Name`, and —
/// when the declared size is non-zero — `Payload`. Each decoded field
/// is one staged-read completion; each encoded field is one staged
/// write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameField {
    /// Declared payload length in bytes.
    Size(u64),
    /// Short file-extension-like type tag (e.g. `pkdrawing`, `png`).
    TypeTag(String),
    /// Path/name string of the file.
    Name(String),
    /// The raw payload, exactly the declared number of bytes.
    Payload(Bytes),
}

// ── TransferUnit ─────────────────────────────────────────────────

/// One file in flight: payload plus its metadata.
///
/// A unit is owned by exactly one state machine while moving through
/// its stages and is dropped the instant its terminal stage completes.
#[derive(Debug, Clone)]
pub struct TransferUnit {
    /// Raw file bytes. May be empty.
    pub payload: Bytes,
    /// Declared byte length; always `payload.len()` on the send side.
    pub size: u64,
    /// Short text type tag.
    pub type_tag: String,
    /// Caller-assigned correlation id (0 = primary file, 1 = preview
    /// image by convention — opaque to the protocol).
    pub purpose: u32,
    /// Path/name string.
    pub name: String,
}

impl TransferUnit {
    /// Build an outbound unit. The declared size is taken from the
    /// payload itself.
    ///
    /// Returns [`LinkError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn new(
        payload: Bytes,
        type_tag: impl Into<String>,
        name: impl Into<String>,
        purpose: u32,
    ) -> Result<Self, LinkError> {
        let size = payload.len() as u64;
        if size > MAX_PAYLOAD_SIZE {
            return Err(LinkError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            payload,
            size,
            type_tag: type_tag.into(),
            purpose,
            name: name.into(),
        })
    }

    /// Whether the payload stage is skipped for this unit.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}
