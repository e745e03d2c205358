//! Framing codec: staged decode/encode of [`FrameField`]s.
//!
//! The decoder is stateful — it cycles through the fixed field order
//! `Size → TypeTag → Name → Payload` and back, scanning for the
//! two-byte delimiter on text stages and taking exactly the declared
//! byte count on the payload stage. The payload stage is skipped
//! entirely when the declared size is zero.
//!
//! The encoder is stateless: it writes one field per call and trusts
//! the send state machine to feed fields in order.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LinkError;
use crate::frame::{DELIMITER, FrameField, MAX_PAYLOAD_SIZE};

// ── Decoder state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeStage {
    Size,
    TypeTag { size: u64 },
    Name { size: u64 },
    Payload { size: u64 },
}

/// Staged codec for the delimiter-framed wire format.
#[derive(Debug)]
pub struct FrameCodec {
    stage: DecodeStage,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            stage: DecodeStage::Size,
        }
    }

    /// Rearm the decoder at the Size stage.
    ///
    /// Used after a malformed frame or a reconnect; any partially
    /// decoded state is discarded.
    pub fn reset(&mut self) {
        self.stage = DecodeStage::Size;
    }

    /// Scan `src` for the field delimiter and split off the text in
    /// front of it. Returns `None` until the delimiter has arrived.
    fn take_text_field(src: &mut BytesMut) -> Result<Option<String>, LinkError> {
        let pos = src
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER);
        let Some(pos) = pos else {
            return Ok(None);
        };
        let field = src.split_to(pos);
        src.advance(DELIMITER.len());
        let text = std::str::from_utf8(&field)
            .map_err(|_| LinkError::MalformedFrame("field is not valid utf-8"))?;
        Ok(Some(text.to_owned()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = FrameField;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            DecodeStage::Size => {
                let Some(text) = Self::take_text_field(src)? else {
                    return Ok(None);
                };
                let size: u64 = text
                    .parse()
                    .map_err(|_| LinkError::MalformedFrame("size field is not a decimal number"))?;
                if size > MAX_PAYLOAD_SIZE {
                    return Err(LinkError::PayloadTooLarge {
                        size,
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                // The declared size rides along through the remaining
                // stages so the payload stage knows how much to take.
                self.stage = DecodeStage::TypeTag { size };
                Ok(Some(FrameField::Size(size)))
            }
            DecodeStage::TypeTag { size } => {
                let Some(text) = Self::take_text_field(src)? else {
                    return Ok(None);
                };
                self.stage = DecodeStage::Name { size };
                Ok(Some(FrameField::TypeTag(text)))
            }
            DecodeStage::Name { size } => {
                let Some(text) = Self::take_text_field(src)? else {
                    return Ok(None);
                };
                self.stage = if size == 0 {
                    DecodeStage::Size
                } else {
                    DecodeStage::Payload { size }
                };
                Ok(Some(FrameField::Name(text)))
            }
            DecodeStage::Payload { size } => {
                if (src.len() as u64) < size {
                    return Ok(None);
                }
                let payload = src.split_to(size as usize).freeze();
                self.stage = DecodeStage::Size;
                Ok(Some(FrameField::Payload(payload)))
            }
        }
    }
}

impl Encoder<FrameField> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, item: FrameField, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            FrameField::Size(size) => {
                dst.extend_from_slice(size.to_string().as_bytes());
                dst.extend_from_slice(DELIMITER);
            }
            FrameField::TypeTag(text) | FrameField::Name(text) => {
                dst.extend_from_slice(text.as_bytes());
                dst.extend_from_slice(DELIMITER);
            }
            FrameField::Payload(bytes) => {
                dst.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }
}

/// Encode a single field to a frozen byte chunk, ready for a staged
/// write.
pub fn encode_field(field: FrameField) -> Bytes {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::new();
    // Encoding writes every field unconditionally and cannot fail.
    let _ = codec.encode(field, &mut buf);
    buf.freeze()
}
