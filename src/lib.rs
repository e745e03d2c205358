//! # doclink
//!
//! Ad-hoc exchange of one document session — a primary file plus a
//! derived preview image — between two devices on the same local
//! network, with recovery across transient disconnections.
//!
//! This crate contains:
//! - **Frame types**: `TransferUnit`, `FrameField`, and the fixed wire
//!   constants (delimiter, service type, size limits)
//! - **Codec**: `FrameCodec` for staged delimiter-framed I/O via
//!   `tokio_util`
//! - **Connection**: `PeerLink` — the single allowed peer stream,
//!   driven by reader/writer tasks with per-stage deadlines
//! - **Discovery**: mDNS host advertisement and client browse
//! - **State**: `SendMachine` / `RecvMachine`, one transfer in flight
//!   per direction with busy guards
//! - **Session**: `Session` coordinator and the `SessionDelegate`
//!   callback surface
//! - **Error**: `LinkError` — typed, `thiserror`-based error hierarchy
//!
//! The engine is deliberately small: one peer, one transfer per
//! direction, no retries. Resume policy after a disconnect belongs to
//! the delegate, which holds the session-level bookkeeping.

pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod session;
pub mod state;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::FrameCodec;
pub use error::LinkError;
pub use frame::{
    DEFAULT_RECEIVE_TIMEOUT, DEFAULT_STAGE_TIMEOUT, DELIMITER, FrameField, MAX_BUFFER_SIZE,
    MAX_PAYLOAD_SIZE, SERVICE_TYPE, TransferUnit,
};
pub use session::{Lifecycle, Session, SessionConfig, SessionDelegate};
pub use state::{ReceivedFile, RecvMachine, RecvProgress, SendMachine, SendProgress, SendStage};
