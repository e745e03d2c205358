//! Outbound transfer state machine.
//!
//! Drives one [`TransferUnit`] through staged writes:
//!
//! ```text
//! AwaitConnection ──► Length ──► TypeTag ──► Name ──► Payload ──► (done)
//!                                              └──────────────────► (done, size == 0)
//! ```
//!
//! The machine never touches a socket. It yields the next
//! [`FrameField`] to write; the connection layer reports each staged
//! write back via [`SendMachine::on_stage_written`].

use crate::error::LinkError;
use crate::frame::{FrameField, TransferUnit};

// ── SendStage ────────────────────────────────────────────────────

/// Stage tag carried by each staged write so the machine can resume
/// at the right place when the write completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    /// A unit is queued but no peer link exists yet.
    AwaitConnection,
    /// Writing the decimal length field.
    Length,
    /// Writing the type tag field.
    TypeTag,
    /// Writing the name field.
    Name,
    /// Writing the raw payload bytes.
    Payload,
}

/// What to do after a staged write completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendProgress {
    /// Queue the next stage's bytes.
    Next { stage: SendStage, field: FrameField },
    /// Terminal stage completed; the unit has been retired. Carries
    /// the caller-assigned purpose tag for the delegate.
    Done { purpose: u32 },
}

// ── SendMachine ──────────────────────────────────────────────────

/// At most one outbound unit exists at a time; a second `begin` while
/// one is in flight fails with [`LinkError::Busy`] and leaves the
/// in-flight unit untouched.
#[derive(Debug, Default)]
pub struct SendMachine {
    unit: Option<TransferUnit>,
    stage: SendStage,
}

impl Default for SendStage {
    fn default() -> Self {
        SendStage::AwaitConnection
    }
}

impl SendMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an outbound unit is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.unit.is_some()
    }

    /// Record a unit for transmission.
    ///
    /// Transmission does not start here — the caller invokes
    /// [`start`](Self::start) once a peer link is available.
    pub fn begin(&mut self, unit: TransferUnit) -> Result<(), LinkError> {
        if self.unit.is_some() {
            return Err(LinkError::Busy);
        }
        self.unit = Some(unit);
        self.stage = SendStage::AwaitConnection;
        Ok(())
    }

    /// Leave `AwaitConnection` and yield the first field to write.
    ///
    /// Returns `None` when there is nothing to send or transmission
    /// already started (a reconnect must not restart mid-unit stages).
    pub fn start(&mut self) -> Option<(SendStage, FrameField)> {
        let unit = self.unit.as_ref()?;
        if self.stage != SendStage::AwaitConnection {
            return None;
        }
        self.stage = SendStage::Length;
        Some((SendStage::Length, FrameField::Size(unit.size)))
    }

    /// A staged write completed; advance and yield what comes next.
    ///
    /// Stage tags that do not match the machine's current stage are
    /// ignored (stale completions from a torn-down link).
    pub fn on_stage_written(&mut self, stage: SendStage) -> Option<SendProgress> {
        let unit = self.unit.as_ref()?;
        if stage != self.stage {
            return None;
        }
        match stage {
            SendStage::AwaitConnection => None,
            SendStage::Length => {
                self.stage = SendStage::TypeTag;
                Some(SendProgress::Next {
                    stage: SendStage::TypeTag,
                    field: FrameField::TypeTag(unit.type_tag.clone()),
                })
            }
            SendStage::TypeTag => {
                self.stage = SendStage::Name;
                Some(SendProgress::Next {
                    stage: SendStage::Name,
                    field: FrameField::Name(unit.name.clone()),
                })
            }
            SendStage::Name => {
                if unit.is_empty() {
                    // No payload stage for empty units.
                    return Some(self.finish());
                }
                self.stage = SendStage::Payload;
                Some(SendProgress::Next {
                    stage: SendStage::Payload,
                    field: FrameField::Payload(unit.payload.clone()),
                })
            }
            SendStage::Payload => Some(self.finish()),
        }
    }

    /// Drop the in-flight unit, if any. Used on disconnect.
    pub fn clear(&mut self) {
        self.unit = None;
        self.stage = SendStage::AwaitConnection;
    }

    fn finish(&mut self) -> SendProgress {
        // Retire the unit before anyone is notified.
        let unit = self.unit.take();
        self.stage = SendStage::AwaitConnection;
        SendProgress::Done {
            purpose: unit.map(|u| u.purpose).unwrap_or_default(),
        }
    }
}
