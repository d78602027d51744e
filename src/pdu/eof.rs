use crate::pdu::tlv::EntityIdTlv;
use crate::pdu::{
    fss_len, read_fss_field, write_fss_field, ConditionCode, LargeFileFlag, PduError,
};
use crate::util::ByteConversionError;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// EOF PDU, CCSDS 727.0-B-5 5.2.2.
///
/// The fault location field is only present for condition codes other than
/// [ConditionCode::NoError].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EofPdu {
    pub condition_code: ConditionCode,
    pub file_checksum: u32,
    pub file_size: u64,
    pub fault_location: Option<EntityIdTlv>,
}

impl EofPdu {
    pub fn new_no_error(file_checksum: u32, file_size: u64) -> Self {
        Self {
            condition_code: ConditionCode::NoError,
            file_checksum,
            file_size,
            fault_location: None,
        }
    }

    pub fn new_for_condition(
        condition_code: ConditionCode,
        file_checksum: u32,
        file_size: u64,
        fault_location: Option<EntityIdTlv>,
    ) -> Self {
        Self {
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        }
    }

    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        1 + 4
            + fss_len(file_flag)
            + self.fault_location.as_ref().map_or(0, |fl| fl.len_full())
    }

    pub(crate) fn write_to_bytes(
        &self,
        file_flag: LargeFileFlag,
        buf: &mut [u8],
    ) -> Result<usize, PduError> {
        let expected = self.written_len(file_flag);
        if buf.len() < expected {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected,
            }
            .into());
        }
        let mut current_idx = 0;
        buf[current_idx] = (self.condition_code as u8) << 4;
        current_idx += 1;
        buf[current_idx..current_idx + 4].copy_from_slice(&self.file_checksum.to_be_bytes());
        current_idx += 4;
        current_idx += write_fss_field(file_flag, self.file_size, &mut buf[current_idx..])?;
        if let Some(fault_location) = &self.fault_location {
            current_idx += fault_location.write_to_bytes(&mut buf[current_idx..])?;
        }
        Ok(current_idx)
    }

    pub(crate) fn from_bytes(file_flag: LargeFileFlag, buf: &[u8]) -> Result<Self, PduError> {
        let min_len = 1 + 4 + fss_len(file_flag);
        if buf.len() < min_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: min_len,
            }
            .into());
        }
        let condition_code = ConditionCode::try_from((buf[0] >> 4) & 0b1111)
            .map_err(|_| PduError::InvalidConditionCode((buf[0] >> 4) & 0b1111))?;
        let mut current_idx = 1;
        let file_checksum =
            u32::from_be_bytes(buf[current_idx..current_idx + 4].try_into().unwrap());
        current_idx += 4;
        let (fss, file_size) = read_fss_field(file_flag, &buf[current_idx..])?;
        current_idx += fss;
        let fault_location = if buf.len() > current_idx {
            Some(EntityIdTlv::from_bytes(&buf[current_idx..])?)
        } else {
            None
        };
        Ok(Self {
            condition_code,
            file_checksum,
            file_size,
            fault_location,
        })
    }
}
