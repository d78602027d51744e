use crate::pdu::{fss_len, read_fss_field, write_fss_field, LargeFileFlag, PduError};
use crate::pdu::SegmentMetadataFlag;
use crate::util::ByteConversionError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum RecordContinuationState {
    NoStartNoEnd = 0b00,
    StartWithoutEnd = 0b01,
    EndWithoutStart = 0b10,
    #[default]
    StartAndEnd = 0b11,
}

/// Optional metadata prefix of a file data PDU, used with record boundary preservation.
/// The metadata length field is 6 bits wide, so at most 63 metadata octets are possible.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmentMetadata {
    pub record_continuation_state: RecordContinuationState,
    pub metadata: Vec<u8>,
}

impl SegmentMetadata {
    pub const MAX_METADATA_LEN: usize = 63;

    pub fn new(
        record_continuation_state: RecordContinuationState,
        metadata: &[u8],
    ) -> Result<Self, PduError> {
        if metadata.len() > Self::MAX_METADATA_LEN {
            return Err(PduError::Format);
        }
        Ok(Self {
            record_continuation_state,
            metadata: metadata.to_vec(),
        })
    }

    pub fn written_len(&self) -> usize {
        1 + self.metadata.len()
    }
}

/// File data PDU, CCSDS 727.0-B-5 5.3.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FileDataPdu {
    pub segment_metadata: Option<SegmentMetadata>,
    pub offset: u64,
    pub file_data: Vec<u8>,
}

impl FileDataPdu {
    pub fn new_no_seg_metadata(offset: u64, file_data: &[u8]) -> Self {
        Self {
            segment_metadata: None,
            offset,
            file_data: file_data.to_vec(),
        }
    }

    pub fn new_with_seg_metadata(
        segment_metadata: SegmentMetadata,
        offset: u64,
        file_data: &[u8],
    ) -> Self {
        Self {
            segment_metadata: Some(segment_metadata),
            offset,
            file_data: file_data.to_vec(),
        }
    }

    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        self.segment_metadata
            .as_ref()
            .map_or(0, |sm| sm.written_len())
            + fss_len(file_flag)
            + self.file_data.len()
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
        if let Some(segment_metadata) = &self.segment_metadata {
            buf[current_idx] = ((segment_metadata.record_continuation_state as u8) << 6)
                | segment_metadata.metadata.len() as u8;
            current_idx += 1;
            buf[current_idx..current_idx + segment_metadata.metadata.len()]
                .copy_from_slice(&segment_metadata.metadata);
            current_idx += segment_metadata.metadata.len();
        }
        current_idx += write_fss_field(file_flag, self.offset, &mut buf[current_idx..])?;
        buf[current_idx..current_idx + self.file_data.len()].copy_from_slice(&self.file_data);
        current_idx += self.file_data.len();
        Ok(current_idx)
    }

    pub(crate) fn from_bytes(
        file_flag: LargeFileFlag,
        seg_metadata_flag: SegmentMetadataFlag,
        buf: &[u8],
    ) -> Result<Self, PduError> {
        let mut current_idx = 0;
        let segment_metadata = if seg_metadata_flag == SegmentMetadataFlag::Present {
            if buf.is_empty() {
                return Err(ByteConversionError::FromSliceTooSmall {
                    found: 0,
                    expected: 1,
                }
                .into());
            }
            // unwrap okay, 2-bit field conversion can not fail.
            let record_continuation_state =
                RecordContinuationState::try_from((buf[0] >> 6) & 0b11).unwrap();
            let metadata_len = (buf[0] & 0b11_1111) as usize;
            current_idx += 1;
            if buf.len() < current_idx + metadata_len {
                return Err(ByteConversionError::FromSliceTooSmall {
                    found: buf.len(),
                    expected: current_idx + metadata_len,
                }
                .into());
            }
            let metadata = buf[current_idx..current_idx + metadata_len].to_vec();
            current_idx += metadata_len;
            Some(SegmentMetadata {
                record_continuation_state,
                metadata,
            })
        } else {
            None
        };
        let (fss, offset) = read_fss_field(file_flag, &buf[current_idx..])?;
        current_idx += fss;
        Ok(Self {
            segment_metadata,
            offset,
            file_data: buf[current_idx..].to_vec(),
        })
    }
}
