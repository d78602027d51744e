use crate::pdu::tlv::{EntityIdTlv, FilestoreResponseTlv, Tlv, TlvType};
use crate::pdu::{ConditionCode, PduError};
use crate::util::ByteConversionError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum DeliveryCode {
    #[default]
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FileStatus {
    DiscardDeliberately = 0b00,
    DiscardedFilestoreRejection = 0b01,
    Retained = 0b10,
    #[default]
    Unreported = 0b11,
}

/// Finished PDU, CCSDS 727.0-B-5 5.2.3.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinishedPdu {
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub filestore_responses: Vec<FilestoreResponseTlv>,
    pub fault_location: Option<EntityIdTlv>,
}

impl FinishedPdu {
    pub fn new_default(
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        Self {
            condition_code,
            delivery_code,
            file_status,
            filestore_responses: Vec::new(),
            fault_location: None,
        }
    }

    pub fn written_len(&self) -> usize {
        let mut len = 1;
        for response in &self.filestore_responses {
            // TLV value length does not depend on conversion failures, to_tlv only fails
            // for oversized values which the constructor rejects.
            len += response
                .to_tlv()
                .map(|tlv| tlv.len_full())
                .unwrap_or_default();
        }
        len + self.fault_location.as_ref().map_or(0, |fl| fl.len_full())
    }

    pub(crate) fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let expected = self.written_len();
        if buf.len() < expected {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected,
            }
            .into());
        }
        let mut current_idx = 0;
        buf[current_idx] = ((self.condition_code as u8) << 4)
            | ((self.delivery_code as u8) << 2)
            | (self.file_status as u8);
        current_idx += 1;
        for response in &self.filestore_responses {
            current_idx += response.to_tlv()?.write_to_bytes(&mut buf[current_idx..])?;
        }
        if let Some(fault_location) = &self.fault_location {
            current_idx += fault_location.write_to_bytes(&mut buf[current_idx..])?;
        }
        Ok(current_idx)
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        if buf.is_empty() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: 0,
                expected: 1,
            }
            .into());
        }
        let condition_code = ConditionCode::try_from((buf[0] >> 4) & 0b1111)
            .map_err(|_| PduError::InvalidConditionCode((buf[0] >> 4) & 0b1111))?;
        // unwrap okay for 1-bit and 2-bit field conversions.
        let delivery_code = DeliveryCode::try_from((buf[0] >> 2) & 0b1).unwrap();
        let file_status = FileStatus::try_from(buf[0] & 0b11).unwrap();
        let mut filestore_responses = Vec::new();
        let mut fault_location = None;
        let mut current_idx = 1;
        while current_idx < buf.len() {
            let tlv = Tlv::from_bytes(&buf[current_idx..])?;
            current_idx += tlv.len_full();
            match tlv.tlv_type() {
                Some(TlvType::FilestoreResponse) => {
                    filestore_responses.push(FilestoreResponseTlv::from_tlv(&tlv)?);
                }
                Some(TlvType::EntityId) => {
                    fault_location = Some(EntityIdTlv::from_tlv(&tlv)?);
                }
                // Unknown or unexpected TLVs in the Finished PDU are skipped.
                _ => (),
            }
        }
        Ok(Self {
            condition_code,
            delivery_code,
            file_status,
            filestore_responses,
            fault_location,
        })
    }
}
