use crate::pdu::PduError;
use crate::util::ByteConversionError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum PromptResponseRequired {
    Nak = 0,
    KeepAlive = 1,
}

/// Prompt PDU, CCSDS 727.0-B-5 5.2.7. Only used in acknowledged mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PromptPdu {
    pub response_required: PromptResponseRequired,
}

impl PromptPdu {
    pub fn new(response_required: PromptResponseRequired) -> Self {
        Self { response_required }
    }

    pub fn written_len(&self) -> usize {
        1
    }

    pub(crate) fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        if buf.is_empty() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: 0,
                expected: 1,
            }
            .into());
        }
        buf[0] = (self.response_required as u8) << 7;
        Ok(1)
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        if buf.is_empty() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: 0,
                expected: 1,
            }
            .into());
        }
        // unwrap okay, 1-bit field conversion can not fail.
        let response_required = PromptResponseRequired::try_from((buf[0] >> 7) & 0b1).unwrap();
        Ok(Self { response_required })
    }
}
