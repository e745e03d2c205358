//! Inbound transfer state machine, mirror of the send machine.
//!
//! ```text
//! Length ──► TypeTag ──► Name ──► Payload ──► (done)
//!                          └────────────────► (done, declared size == 0)
//! ```
//!
//! Metadata stages are read until the delimiter; the payload stage
//! reads exactly the declared length. The caller-supplied timeout
//! covers the stages a human on the other side can stall — waiting
//! for the transfer to start (Length) and for the payload — while
//! TypeTag/Name between them use the short default.

use std::time::Duration;

use bytes::Bytes;

use crate::error::LinkError;
use crate::frame::{DEFAULT_STAGE_TIMEOUT, FrameField, TransferUnit};

// ── RecvStage ────────────────────────────────────────────────────

/// The field the machine expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStage {
    Length,
    TypeTag,
    Name,
    Payload,
}

/// Outcome of feeding one decoded field to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvProgress {
    /// More fields expected.
    Continue,
    /// Terminal stage completed; the unit has been retired.
    Done(ReceivedFile),
}

/// A fully reassembled inbound transfer, handed to the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub payload: Bytes,
    pub type_tag: String,
    pub name: String,
}

// ── RecvMachine ──────────────────────────────────────────────────

/// At most one inbound unit is assembled at a time; a second `begin`
/// while one is in flight fails with [`LinkError::Busy`].
#[derive(Debug, Default)]
pub struct RecvMachine {
    unit: Option<TransferUnit>,
    stage: RecvStage,
    /// Caller-supplied wait for the Length and Payload stages.
    wait_timeout: Duration,
}

impl Default for RecvStage {
    fn default() -> Self {
        RecvStage::Length
    }
}

impl RecvMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an inbound unit is currently being assembled.
    pub fn is_busy(&self) -> bool {
        self.unit.is_some()
    }

    /// Arm the machine for one inbound transfer.
    ///
    /// `timeout` bounds how long the peer may take to start the
    /// transfer and to deliver the payload; `None` uses the session
    /// default. A CLI peer waiting on a human may pass hours here.
    pub fn begin(&mut self, timeout: Option<Duration>, default: Duration) -> Result<(), LinkError> {
        if self.unit.is_some() {
            return Err(LinkError::Busy);
        }
        self.unit = Some(TransferUnit {
            payload: Bytes::new(),
            size: 0,
            type_tag: String::new(),
            purpose: 0,
            name: String::new(),
        });
        self.stage = RecvStage::Length;
        self.wait_timeout = timeout.unwrap_or(default);
        Ok(())
    }

    /// Deadline budget for the stage currently awaited.
    pub fn stage_timeout(&self) -> Duration {
        match self.stage {
            RecvStage::Length | RecvStage::Payload => self.wait_timeout,
            RecvStage::TypeTag | RecvStage::Name => DEFAULT_STAGE_TIMEOUT,
        }
    }

    /// Feed one decoded field to the machine.
    ///
    /// The codec and this machine walk the same fixed field order, so
    /// a field that does not match the awaited stage means the two
    /// fell out of step — reported as a malformed frame, not a panic.
    pub fn on_field(&mut self, field: FrameField) -> Result<RecvProgress, LinkError> {
        let Some(unit) = self.unit.as_mut() else {
            return Err(LinkError::MalformedFrame("field arrived with no read armed"));
        };
        match (self.stage, field) {
            (RecvStage::Length, FrameField::Size(size)) => {
                unit.size = size;
                self.stage = RecvStage::TypeTag;
                Ok(RecvProgress::Continue)
            }
            (RecvStage::TypeTag, FrameField::TypeTag(tag)) => {
                unit.type_tag = tag;
                self.stage = RecvStage::Name;
                Ok(RecvProgress::Continue)
            }
            (RecvStage::Name, FrameField::Name(name)) => {
                unit.name = name;
                if unit.size == 0 {
                    // Empty payload: complete right away.
                    return Ok(RecvProgress::Done(self.finish(Bytes::new())));
                }
                self.stage = RecvStage::Payload;
                Ok(RecvProgress::Continue)
            }
            (RecvStage::Payload, FrameField::Payload(payload)) => {
                Ok(RecvProgress::Done(self.finish(payload)))
            }
            _ => Err(LinkError::MalformedFrame("field out of order")),
        }
    }

    /// Drop the in-flight unit, if any. Used on disconnect.
    pub fn clear(&mut self) {
        self.unit = None;
        self.stage = RecvStage::Length;
    }

    /// Retire the unit before anyone is notified.
    fn finish(&mut self, payload: Bytes) -> ReceivedFile {
        let unit = self.unit.take();
        self.stage = RecvStage::Length;
        let (type_tag, name) = match unit {
            Some(u) => (u.type_tag, u.name),
            None => (String::new(), String::new()),
        };
        ReceivedFile {
            payload,
            type_tag,
            name,
        }
    }
}
