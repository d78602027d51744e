//! CFDP Packet Data Unit (PDU) support.
//!
//! This module implements the PDU format of CCSDS 727.0-B-5 chapter 5: the common PDU
//! header with its variable width entity ID and sequence number fields, the file data
//! PDU and all seven file directive PDUs. Each PDU is modelled as an owned body
//! structure plus the [PduHeader], combined in the [CfdpPdu] tagged union which is what
//! the transaction handlers consume and produce.
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::util::{ByteConversionError, UnsignedByteField};

pub mod ack;
pub mod eof;
pub mod file_data;
pub mod finished;
pub mod keep_alive;
pub mod lv;
pub mod metadata;
pub mod nak;
pub mod prompt;
pub mod tlv;

pub use ack::AckPdu;
pub use eof::EofPdu;
pub use file_data::{FileDataPdu, RecordContinuationState, SegmentMetadata};
pub use finished::{DeliveryCode, FileStatus, FinishedPdu};
pub use keep_alive::KeepAlivePdu;
pub use metadata::MetadataPdu;
pub use nak::NakPdu;
pub use prompt::{PromptPdu, PromptResponseRequired};

/// Currently only the CFDP version 2 (version field value 0b001) of CCSDS 727.0-B-5 is
/// supported.
pub const CFDP_VERSION_2: u8 = 0b001;
pub const FIXED_HEADER_LEN: usize = 4;

/// CRC algorithm used for the optional PDU CRC, CCSDS 727.0-B-5 4.1.1.
pub const CRC_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum PduType {
    FileDirective = 0,
    FileData = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum Direction {
    TowardsReceiver = 0,
    TowardsSender = 1,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    #[default]
    Unacknowledged = 1,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum CrcFlag {
    #[default]
    NoCrc = 0,
    WithCrc = 1,
}

/// Available larger file flag values. Large file support enables the use of 64-bit file
/// size and offset fields.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum LargeFileFlag {
    /// 32-bit file size and offset fields.
    #[default]
    Normal = 0,
    /// 64-bit file size and offset fields.
    Large = 1,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SegmentMetadataFlag {
    #[default]
    NotPresent = 0,
    Present = 1,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SegmentationControl {
    #[default]
    NoRecordBoundariesPreservation = 0,
    WithRecordBoundariesPreservation = 1,
}

/// Transaction condition codes, CCSDS 727.0-B-5 5.2.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ConditionCode {
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    SuspendRequestReceived = 0b1110,
    CancelRequestReceived = 0b1111,
}

impl ConditionCode {
    /// Fault condition codes are all codes which can trigger the fault handling
    /// procedures, which excludes the codes reported for regular cancellation and
    /// suspension.
    pub fn is_fault(&self) -> bool {
        !matches!(
            self,
            Self::NoError | Self::SuspendRequestReceived | Self::CancelRequestReceived
        )
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum TransactionStatus {
    /// The entity is not aware of the transaction.
    #[default]
    Undefined = 0b00,
    Active = 0b01,
    /// The entity was previously aware of this transaction.
    Terminated = 0b10,
    /// The entity is unable to determine whether it was previously aware of this
    /// transaction because records are no longer retained.
    Unreported = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FileDirectiveType {
    EofPdu = 0x04,
    FinishedPdu = 0x05,
    AckPdu = 0x06,
    MetadataPdu = 0x07,
    NakPdu = 0x08,
    PromptPdu = 0x09,
    KeepAlivePdu = 0x0c,
}

/// Which of the two local handler types an incoming PDU has to be routed to,
/// CCSDS 727.0-B-5 4.5.3.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PduError {
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
    /// Found version ID invalid, not equal to [CFDP_VERSION_2].
    #[error("CFDP version missmatch, found {0}, expected {ver}", ver = CFDP_VERSION_2)]
    CfdpVersionMissmatch(u8),
    #[error(
        "missmatch of PDU source ID length {src_id_len} and destination ID length {dest_id_len}"
    )]
    SourceDestIdLenMissmatch {
        src_id_len: usize,
        dest_id_len: usize,
    },
    /// The directive type field contained a value not in the range of permitted values.
    #[error("invalid directive type, found {found}, expected {expected:?}")]
    InvalidDirectiveType {
        found: u8,
        expected: Option<FileDirectiveType>,
    },
    /// Invalid condition code. Contains the raw detected value.
    #[error("invalid condition code {0}")]
    InvalidConditionCode(u8),
    /// The ACK PDU only acknowledges EOF and Finished PDUs.
    #[error("invalid acked directive code {0}")]
    InvalidAckedDirectiveCode(u8),
    #[error("invalid NAK segment request list length {0}")]
    InvalidSegmentRequestLen(usize),
    #[error("file size {0} too large for 32-bit file size field")]
    FileSizeTooLarge(u64),
    /// The CRC flag for a PDU is enabled and the checksum check failed. Contains the raw
    /// 16-bit CRC of the received PDU block.
    #[error("PDU checksum error for checksum {0}")]
    Checksum(u16),
    /// Generic error for invalid PDU formats.
    #[error("generic PDU format error")]
    Format,
    /// Error handling a TLV field.
    #[error("TLV error: {0}")]
    Tlv(#[from] tlv::TlvError),
}

impl From<lv::LvDataTooLarge> for PduError {
    fn from(_: lv::LvDataTooLarge) -> Self {
        Self::Format
    }
}

/// Common configuration component for the PDU header.
///
/// Only the source entity ID, destination entity ID and the transaction sequence number
/// change between transactions. The remaining fields are session or entity level
/// configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CommonPduConfig {
    source_entity_id: UnsignedByteField,
    dest_entity_id: UnsignedByteField,
    pub transaction_seq_num: UnsignedByteField,
    pub trans_mode: TransmissionMode,
    pub file_flag: LargeFileFlag,
    pub crc_flag: CrcFlag,
    pub direction: Direction,
}

impl Default for CommonPduConfig {
    fn default() -> Self {
        Self {
            source_entity_id: UnsignedByteField::new(1, 0),
            dest_entity_id: UnsignedByteField::new(1, 0),
            transaction_seq_num: UnsignedByteField::new(1, 0),
            trans_mode: TransmissionMode::default(),
            file_flag: LargeFileFlag::default(),
            crc_flag: CrcFlag::default(),
            direction: Direction::TowardsReceiver,
        }
    }
}

impl CommonPduConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
        transaction_seq_num: impl Into<UnsignedByteField>,
        trans_mode: TransmissionMode,
        file_flag: LargeFileFlag,
        crc_flag: CrcFlag,
        direction: Direction,
    ) -> Result<Self, PduError> {
        let (source_entity_id, dest_entity_id) =
            Self::check_and_convert_ids(source_id.into(), dest_id.into())?;
        Ok(Self {
            source_entity_id,
            dest_entity_id,
            transaction_seq_num: transaction_seq_num.into(),
            trans_mode,
            file_flag,
            crc_flag,
            direction,
        })
    }

    pub fn new_with_byte_fields(
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
        transaction_seq_num: impl Into<UnsignedByteField>,
    ) -> Result<Self, PduError> {
        Self::new(
            source_id,
            dest_id,
            transaction_seq_num,
            TransmissionMode::default(),
            LargeFileFlag::default(),
            CrcFlag::default(),
            Direction::TowardsReceiver,
        )
    }

    /// The source and destination ID fields must have the same width because the header
    /// only carries one entity ID length field.
    fn check_and_convert_ids(
        source_id: UnsignedByteField,
        dest_id: UnsignedByteField,
    ) -> Result<(UnsignedByteField, UnsignedByteField), PduError> {
        if source_id.size() != dest_id.size() {
            return Err(PduError::SourceDestIdLenMissmatch {
                src_id_len: source_id.size(),
                dest_id_len: dest_id.size(),
            });
        }
        Ok((source_id, dest_id))
    }

    pub fn set_source_and_dest_id(
        &mut self,
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
    ) -> Result<(), PduError> {
        let (source_id, dest_id) = Self::check_and_convert_ids(source_id.into(), dest_id.into())?;
        self.source_entity_id = source_id;
        self.dest_entity_id = dest_id;
        Ok(())
    }

    #[inline]
    pub fn source_id(&self) -> UnsignedByteField {
        self.source_entity_id
    }

    #[inline]
    pub fn dest_id(&self) -> UnsignedByteField {
        self.dest_entity_id
    }
}

/// Write a file size sensitive (FSS) value, which is 64-bit wide for large file
/// transfers and 32-bit wide otherwise.
pub(crate) fn write_fss_field(
    file_flag: LargeFileFlag,
    value: u64,
    buf: &mut [u8],
) -> Result<usize, PduError> {
    Ok(if file_flag == LargeFileFlag::Large {
        if buf.len() < core::mem::size_of::<u64>() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: core::mem::size_of::<u64>(),
            }
            .into());
        }
        buf[0..core::mem::size_of::<u64>()].copy_from_slice(&value.to_be_bytes());
        core::mem::size_of::<u64>()
    } else {
        if value > u32::MAX as u64 {
            return Err(PduError::FileSizeTooLarge(value));
        }
        if buf.len() < core::mem::size_of::<u32>() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: core::mem::size_of::<u32>(),
            }
            .into());
        }
        buf[0..core::mem::size_of::<u32>()].copy_from_slice(&(value as u32).to_be_bytes());
        core::mem::size_of::<u32>()
    })
}

pub(crate) fn read_fss_field(
    file_flag: LargeFileFlag,
    buf: &[u8],
) -> Result<(usize, u64), ByteConversionError> {
    Ok(if file_flag == LargeFileFlag::Large {
        if buf.len() < core::mem::size_of::<u64>() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: core::mem::size_of::<u64>(),
            });
        }
        (8, u64::from_be_bytes(buf[0..8].try_into().unwrap()))
    } else {
        if buf.len() < core::mem::size_of::<u32>() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: core::mem::size_of::<u32>(),
            });
        }
        (4, u32::from_be_bytes(buf[0..4].try_into().unwrap()).into())
    })
}

pub(crate) fn fss_len(file_flag: LargeFileFlag) -> usize {
    if file_flag == LargeFileFlag::Large {
        8
    } else {
        4
    }
}

/// Derive the total length of a PDU block from its first four (fixed header) bytes.
///
/// Useful for stream parsing, where this determines how many bytes have to be read
/// before [CfdpPdu::from_bytes] can be called on the full block.
pub fn pdu_len_from_fixed_header(buf: &[u8]) -> Result<usize, PduError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(ByteConversionError::FromSliceTooSmall {
            found: buf.len(),
            expected: FIXED_HEADER_LEN,
        }
        .into());
    }
    let entity_id_len = (((buf[3] >> 4) & 0b111) + 1) as usize;
    let seq_num_len = ((buf[3] & 0b111) + 1) as usize;
    let datafield_len = u16::from_be_bytes(buf[1..3].try_into().unwrap()) as usize;
    Ok(FIXED_HEADER_LEN + 2 * entity_id_len + seq_num_len + datafield_len)
}

/// Common header for all CFDP PDUs, CCSDS 727.0-B-5 5.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PduHeader {
    pdu_type: PduType,
    pdu_conf: CommonPduConfig,
    seg_metadata_flag: SegmentMetadataFlag,
    seg_ctrl: SegmentationControl,
    pdu_datafield_len: u16,
}

impl PduHeader {
    pub fn new_for_file_data(
        pdu_conf: CommonPduConfig,
        pdu_datafield_len: u16,
        seg_metadata_flag: SegmentMetadataFlag,
        seg_ctrl: SegmentationControl,
    ) -> Self {
        Self {
            pdu_type: PduType::FileData,
            pdu_conf,
            seg_metadata_flag,
            seg_ctrl,
            pdu_datafield_len,
        }
    }

    pub fn new_for_file_directive(pdu_conf: CommonPduConfig, pdu_datafield_len: u16) -> Self {
        Self {
            pdu_type: PduType::FileDirective,
            pdu_conf,
            seg_metadata_flag: SegmentMetadataFlag::NotPresent,
            seg_ctrl: SegmentationControl::NoRecordBoundariesPreservation,
            pdu_datafield_len,
        }
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN
            + self.pdu_conf.source_entity_id.size()
            + self.pdu_conf.transaction_seq_num.size()
            + self.pdu_conf.dest_entity_id.size()
    }

    #[inline]
    pub fn pdu_datafield_len(&self) -> usize {
        self.pdu_datafield_len.into()
    }

    /// Full length of the PDU when written to a raw buffer, which is the header length
    /// plus the PDU datafield length.
    #[inline]
    pub fn pdu_len(&self) -> usize {
        self.header_len() + self.pdu_datafield_len as usize
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    #[inline]
    pub fn common_pdu_conf(&self) -> &CommonPduConfig {
        &self.pdu_conf
    }

    #[inline]
    pub fn seg_metadata_flag(&self) -> SegmentMetadataFlag {
        self.seg_metadata_flag
    }

    #[inline]
    pub fn seg_ctrl(&self) -> SegmentationControl {
        self.seg_ctrl
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        // The constructors do not allow passing entity IDs with different sizes, so this
        // should never happen.
        assert_eq!(
            self.pdu_conf.source_entity_id.size(),
            self.pdu_conf.dest_entity_id.size(),
            "unexpected missmatch of source and destination entity ID length"
        );
        if buf.len() < self.header_len() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.header_len(),
            });
        }
        let mut current_idx = 0;
        buf[current_idx] = (CFDP_VERSION_2 << 5)
            | ((self.pdu_type as u8) << 4)
            | ((self.pdu_conf.direction as u8) << 3)
            | ((self.pdu_conf.trans_mode as u8) << 2)
            | ((self.pdu_conf.crc_flag as u8) << 1)
            | (self.pdu_conf.file_flag as u8);
        current_idx += 1;
        buf[current_idx..current_idx + 2].copy_from_slice(&self.pdu_datafield_len.to_be_bytes());
        current_idx += 2;
        buf[current_idx] = ((self.seg_ctrl as u8) << 7)
            | (((self.pdu_conf.source_entity_id.size() - 1) as u8) << 4)
            | ((self.seg_metadata_flag as u8) << 3)
            | ((self.pdu_conf.transaction_seq_num.size() - 1) as u8);
        current_idx += 1;
        current_idx += self
            .pdu_conf
            .source_entity_id
            .write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += self
            .pdu_conf
            .transaction_seq_num
            .write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += self
            .pdu_conf
            .dest_entity_id
            .write_to_be_bytes(&mut buf[current_idx..])?;
        Ok(current_idx)
    }

    /// Parse the header from a raw buffer. Returns the header and the number of parsed
    /// bytes, which is the header length.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), PduError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: FIXED_HEADER_LEN,
            }
            .into());
        }
        let cfdp_version_raw = (buf[0] >> 5) & 0b111;
        if cfdp_version_raw != CFDP_VERSION_2 {
            return Err(PduError::CfdpVersionMissmatch(cfdp_version_raw));
        }
        // unwrap for single bit fields: These conversions can not fail.
        let pdu_type = PduType::try_from((buf[0] >> 4) & 0b1).unwrap();
        let direction = Direction::try_from((buf[0] >> 3) & 0b1).unwrap();
        let trans_mode = TransmissionMode::try_from((buf[0] >> 2) & 0b1).unwrap();
        let crc_flag = CrcFlag::try_from((buf[0] >> 1) & 0b1).unwrap();
        let file_flag = LargeFileFlag::try_from(buf[0] & 0b1).unwrap();
        let pdu_datafield_len = u16::from_be_bytes(buf[1..3].try_into().unwrap());
        let seg_ctrl = SegmentationControl::try_from((buf[3] >> 7) & 0b1).unwrap();
        let entity_id_len = (((buf[3] >> 4) & 0b111) + 1) as usize;
        let seg_metadata_flag = SegmentMetadataFlag::try_from((buf[3] >> 3) & 0b1).unwrap();
        let seq_num_len = ((buf[3] & 0b111) + 1) as usize;
        if buf.len() < FIXED_HEADER_LEN + 2 * entity_id_len + seq_num_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: FIXED_HEADER_LEN + 2 * entity_id_len + seq_num_len,
            }
            .into());
        }
        let mut current_idx = FIXED_HEADER_LEN;
        // Lengths and buffer bounds were verified above.
        let source_id =
            UnsignedByteField::new_from_be_bytes(entity_id_len, &buf[current_idx..]).unwrap();
        current_idx += entity_id_len;
        let transaction_seq_num =
            UnsignedByteField::new_from_be_bytes(seq_num_len, &buf[current_idx..]).unwrap();
        current_idx += seq_num_len;
        let dest_id =
            UnsignedByteField::new_from_be_bytes(entity_id_len, &buf[current_idx..]).unwrap();
        current_idx += entity_id_len;
        let pdu_conf = CommonPduConfig::new(
            source_id,
            dest_id,
            transaction_seq_num,
            trans_mode,
            file_flag,
            crc_flag,
            direction,
        )?;
        Ok((
            Self {
                pdu_type,
                pdu_conf,
                seg_metadata_flag,
                seg_ctrl,
                pdu_datafield_len,
            },
            current_idx,
        ))
    }
}

/// PDU datafield contents for all PDU types.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PduBody {
    FileData(FileDataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Metadata(MetadataPdu),
    Nak(NakPdu),
    Prompt(PromptPdu),
    KeepAlive(KeepAlivePdu),
}

impl PduBody {
    pub fn directive_type(&self) -> Option<FileDirectiveType> {
        match self {
            PduBody::FileData(_) => None,
            PduBody::Eof(_) => Some(FileDirectiveType::EofPdu),
            PduBody::Finished(_) => Some(FileDirectiveType::FinishedPdu),
            PduBody::Ack(_) => Some(FileDirectiveType::AckPdu),
            PduBody::Metadata(_) => Some(FileDirectiveType::MetadataPdu),
            PduBody::Nak(_) => Some(FileDirectiveType::NakPdu),
            PduBody::Prompt(_) => Some(FileDirectiveType::PromptPdu),
            PduBody::KeepAlive(_) => Some(FileDirectiveType::KeepAlivePdu),
        }
    }

    /// Serialized datafield length including the directive code octet for file
    /// directives, excluding the optional PDU CRC.
    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        match self {
            PduBody::FileData(body) => body.written_len(file_flag),
            PduBody::Eof(body) => 1 + body.written_len(file_flag),
            PduBody::Finished(body) => 1 + body.written_len(),
            PduBody::Ack(body) => 1 + body.written_len(),
            PduBody::Metadata(body) => 1 + body.written_len(file_flag),
            PduBody::Nak(body) => 1 + body.written_len(file_flag),
            PduBody::Prompt(body) => 1 + body.written_len(),
            PduBody::KeepAlive(body) => 1 + body.written_len(file_flag),
        }
    }

    fn write_to_bytes(&self, file_flag: LargeFileFlag, buf: &mut [u8]) -> Result<usize, PduError> {
        if buf.len() < self.written_len(file_flag) {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.written_len(file_flag),
            }
            .into());
        }
        if let PduBody::FileData(body) = self {
            return body.write_to_bytes(file_flag, buf);
        }
        // unwrap okay, all variants except FileData are directives.
        buf[0] = self.directive_type().unwrap().into();
        let written = match self {
            PduBody::Eof(body) => body.write_to_bytes(file_flag, &mut buf[1..])?,
            PduBody::Finished(body) => body.write_to_bytes(&mut buf[1..])?,
            PduBody::Ack(body) => body.write_to_bytes(&mut buf[1..])?,
            PduBody::Metadata(body) => body.write_to_bytes(file_flag, &mut buf[1..])?,
            PduBody::Nak(body) => body.write_to_bytes(file_flag, &mut buf[1..])?,
            PduBody::Prompt(body) => body.write_to_bytes(&mut buf[1..])?,
            PduBody::KeepAlive(body) => body.write_to_bytes(file_flag, &mut buf[1..])?,
            PduBody::FileData(_) => unreachable!(),
        };
        Ok(1 + written)
    }

    fn from_bytes(header: &PduHeader, datafield: &[u8]) -> Result<Self, PduError> {
        if header.pdu_type() == PduType::FileData {
            return Ok(PduBody::FileData(FileDataPdu::from_bytes(
                header.common_pdu_conf().file_flag,
                header.seg_metadata_flag(),
                datafield,
            )?));
        }
        if datafield.is_empty() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: 0,
                expected: 1,
            }
            .into());
        }
        let directive_type = FileDirectiveType::try_from(datafield[0]).map_err(|_| {
            PduError::InvalidDirectiveType {
                found: datafield[0],
                expected: None,
            }
        })?;
        let file_flag = header.common_pdu_conf().file_flag;
        let body = &datafield[1..];
        Ok(match directive_type {
            FileDirectiveType::EofPdu => PduBody::Eof(EofPdu::from_bytes(file_flag, body)?),
            FileDirectiveType::FinishedPdu => PduBody::Finished(FinishedPdu::from_bytes(body)?),
            FileDirectiveType::AckPdu => PduBody::Ack(AckPdu::from_bytes(body)?),
            FileDirectiveType::MetadataPdu => {
                PduBody::Metadata(MetadataPdu::from_bytes(file_flag, body)?)
            }
            FileDirectiveType::NakPdu => PduBody::Nak(NakPdu::from_bytes(file_flag, body)?),
            FileDirectiveType::PromptPdu => PduBody::Prompt(PromptPdu::from_bytes(body)?),
            FileDirectiveType::KeepAlivePdu => {
                PduBody::KeepAlive(KeepAlivePdu::from_bytes(file_flag, body)?)
            }
        })
    }
}

/// A full CFDP PDU, consisting of the [PduHeader] and the typed [PduBody].
///
/// The constructors derive the header PDU type, datafield length and segment metadata
/// flag from the body, so header and body can not go out of sync.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CfdpPdu {
    header: PduHeader,
    body: PduBody,
}

impl CfdpPdu {
    /// Create a file directive PDU. Panics if the body is a file data body, use
    /// [Self::new_file_data] for those.
    pub fn new_file_directive(pdu_conf: CommonPduConfig, body: PduBody) -> Self {
        assert!(
            !matches!(body, PduBody::FileData(_)),
            "file data body passed to file directive constructor"
        );
        let datafield_len = Self::datafield_len(&pdu_conf, &body);
        Self {
            header: PduHeader::new_for_file_directive(pdu_conf, datafield_len),
            body,
        }
    }

    pub fn new_file_data(
        pdu_conf: CommonPduConfig,
        body: FileDataPdu,
        seg_ctrl: SegmentationControl,
    ) -> Self {
        let seg_metadata_flag = if body.segment_metadata.is_some() {
            SegmentMetadataFlag::Present
        } else {
            SegmentMetadataFlag::NotPresent
        };
        let body = PduBody::FileData(body);
        let datafield_len = Self::datafield_len(&pdu_conf, &body);
        Self {
            header: PduHeader::new_for_file_data(
                pdu_conf,
                datafield_len,
                seg_metadata_flag,
                seg_ctrl,
            ),
            body,
        }
    }

    fn datafield_len(pdu_conf: &CommonPduConfig, body: &PduBody) -> u16 {
        let mut len = body.written_len(pdu_conf.file_flag);
        if pdu_conf.crc_flag == CrcFlag::WithCrc {
            len += 2;
        }
        len as u16
    }

    #[inline]
    pub fn pdu_header(&self) -> &PduHeader {
        &self.header
    }

    #[inline]
    pub fn body(&self) -> &PduBody {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> PduBody {
        self.body
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        self.header.pdu_type()
    }

    #[inline]
    pub fn file_directive_type(&self) -> Option<FileDirectiveType> {
        self.body.directive_type()
    }

    #[inline]
    pub fn source_id(&self) -> UnsignedByteField {
        self.header.common_pdu_conf().source_id()
    }

    #[inline]
    pub fn dest_id(&self) -> UnsignedByteField {
        self.header.common_pdu_conf().dest_id()
    }

    #[inline]
    pub fn transaction_seq_num(&self) -> UnsignedByteField {
        self.header.common_pdu_conf().transaction_seq_num
    }

    #[inline]
    pub fn transmission_mode(&self) -> TransmissionMode {
        self.header.common_pdu_conf().trans_mode
    }

    #[inline]
    pub fn len_written(&self) -> usize {
        self.header.pdu_len()
    }

    /// Which local handler type consumes this PDU, CCSDS 727.0-B-5 4.5.3.
    pub fn packet_target(&self) -> PacketTarget {
        match &self.body {
            // Section b) of 4.5.3: These PDUs are targeted towards the file receiver.
            PduBody::FileData(_) | PduBody::Metadata(_) | PduBody::Eof(_) | PduBody::Prompt(_) => {
                PacketTarget::DestEntity
            }
            // Section c) of 4.5.3: These PDUs are targeted towards the file sender.
            PduBody::Nak(_) | PduBody::Finished(_) | PduBody::KeepAlive(_) => {
                PacketTarget::SourceEntity
            }
            // Section a) of 4.5.3: The recipient depends on the acknowledged PDU type.
            // The EOF acknowledgement goes back to the file sender, the Finished
            // acknowledgement back to the file receiver.
            PduBody::Ack(ack) => {
                if ack.acked_directive == FileDirectiveType::EofPdu {
                    PacketTarget::SourceEntity
                } else {
                    PacketTarget::DestEntity
                }
            }
        }
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        let expected_len = self.len_written();
        if buf.len() < expected_len {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: expected_len,
            }
            .into());
        }
        let mut current_idx = self.header.write_to_bytes(buf)?;
        current_idx += self
            .body
            .write_to_bytes(self.header.common_pdu_conf().file_flag, &mut buf[current_idx..])?;
        if self.header.common_pdu_conf().crc_flag == CrcFlag::WithCrc {
            let crc = CRC_CCITT_FALSE.checksum(&buf[0..current_idx]);
            buf[current_idx..current_idx + 2].copy_from_slice(&crc.to_be_bytes());
            current_idx += 2;
        }
        debug_assert_eq!(current_idx, expected_len);
        Ok(current_idx)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        // This is the correct way to do this. See
        // [this issue](https://github.com/rust-lang/rust-clippy/issues/4483) for caveats
        // of more "efficient" implementations.
        let mut vec = vec![0; self.len_written()];
        self.write_to_bytes(&mut vec)?;
        Ok(vec)
    }

    /// Parse a full PDU block. Verifies that the buffer holds the full length announced
    /// in the header and checks the PDU CRC if the CRC flag is set.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (header, header_len) = PduHeader::from_bytes(buf)?;
        let pdu_len = header.pdu_len();
        if buf.len() < pdu_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: pdu_len,
            }
            .into());
        }
        let mut datafield_end = pdu_len;
        if header.common_pdu_conf().crc_flag == CrcFlag::WithCrc {
            // A CRC over the whole block including the appended checksum yields 0.
            let crc = CRC_CCITT_FALSE.checksum(&buf[0..pdu_len]);
            if crc != 0 {
                return Err(PduError::Checksum(u16::from_be_bytes(
                    buf[pdu_len - 2..pdu_len].try_into().unwrap(),
                )));
            }
            datafield_end -= 2;
        }
        if datafield_end < header_len {
            return Err(PduError::Format);
        }
        let body = PduBody::from_bytes(&header, &buf[header_len..datafield_end])?;
        Ok(Self { header, body })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn common_pdu_conf(crc_flag: CrcFlag, file_flag: LargeFileFlag) -> CommonPduConfig {
        let mut pdu_conf = CommonPduConfig::new_with_byte_fields(5u8, 10u8, 25u16)
            .expect("generating common PDU config failed");
        pdu_conf.crc_flag = crc_flag;
        pdu_conf.file_flag = file_flag;
        pdu_conf
    }

    pub fn verify_raw_header(buf: &[u8]) {
        assert_eq!((buf[0] >> 5) & 0b111, CFDP_VERSION_2);
    }

    #[test]
    fn test_header_basic_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let header = PduHeader::new_for_file_directive(pdu_conf, 5);
        assert_eq!(header.header_len(), 4 + 1 + 2 + 1);
        assert_eq!(header.pdu_len(), header.header_len() + 5);
        let mut buf = [0; 16];
        let written = header.write_to_bytes(&mut buf).unwrap();
        assert_eq!(written, header.header_len());
        verify_raw_header(&buf);
        let (read_back, read_len) = PduHeader::from_bytes(&buf).unwrap();
        assert_eq!(read_len, written);
        assert_eq!(read_back, header);
        assert_eq!(read_back.common_pdu_conf().source_id().value(), 5);
        assert_eq!(read_back.common_pdu_conf().dest_id().value(), 10);
        assert_eq!(read_back.common_pdu_conf().transaction_seq_num.value(), 25);
    }

    #[test]
    fn test_header_with_odd_field_widths() {
        // 3-byte entity IDs and a 5-byte sequence number are unusual but legal.
        let pdu_conf = CommonPduConfig::new_with_byte_fields(
            UnsignedByteField::new(3, 0x010203),
            UnsignedByteField::new(3, 0x040506),
            UnsignedByteField::new(5, 0x0102030405),
        )
        .unwrap();
        let header = PduHeader::new_for_file_directive(pdu_conf, 0);
        assert_eq!(header.header_len(), 4 + 3 + 5 + 3);
        let mut buf = [0; 32];
        header.write_to_bytes(&mut buf).unwrap();
        assert_eq!((buf[3] >> 4) & 0b111, 2);
        assert_eq!(buf[3] & 0b111, 4);
        let (read_back, _) = PduHeader::from_bytes(&buf).unwrap();
        assert_eq!(read_back, header);
        assert_eq!(
            read_back.common_pdu_conf().source_id().value(),
            0x010203
        );
    }

    #[test]
    fn test_header_invalid_version() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let header = PduHeader::new_for_file_directive(pdu_conf, 0);
        let mut buf = [0; 16];
        header.write_to_bytes(&mut buf).unwrap();
        buf[0] = (buf[0] & 0b0001_1111) | (0b011 << 5);
        assert_eq!(
            PduHeader::from_bytes(&buf).unwrap_err(),
            PduError::CfdpVersionMissmatch(0b011)
        );
    }

    #[test]
    fn test_mismatched_id_widths_rejected() {
        let error = CommonPduConfig::new_with_byte_fields(
            UnsignedByteField::new(1, 1),
            UnsignedByteField::new(2, 2),
            UnsignedByteField::new(1, 3),
        )
        .unwrap_err();
        assert_eq!(
            error,
            PduError::SourceDestIdLenMissmatch {
                src_id_len: 1,
                dest_id_len: 2
            }
        );
    }

    #[test]
    fn test_pdu_len_from_fixed_header() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let header = PduHeader::new_for_file_directive(pdu_conf, 12);
        let mut buf = [0; 16];
        header.write_to_bytes(&mut buf).unwrap();
        assert_eq!(
            pdu_len_from_fixed_header(&buf[0..4]).unwrap(),
            header.pdu_len()
        );
    }

    #[test]
    fn test_fss_field_limits() {
        let mut buf = [0; 8];
        assert_eq!(
            write_fss_field(LargeFileFlag::Normal, u32::MAX as u64 + 1, &mut buf).unwrap_err(),
            PduError::FileSizeTooLarge(u32::MAX as u64 + 1)
        );
        assert_eq!(
            write_fss_field(LargeFileFlag::Large, u32::MAX as u64 + 1, &mut buf).unwrap(),
            8
        );
        let (read, value) = read_fss_field(LargeFileFlag::Large, &buf).unwrap();
        assert_eq!(read, 8);
        assert_eq!(value, u32::MAX as u64 + 1);
    }

    #[test]
    fn test_full_pdu_crc_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::WithCrc, LargeFileFlag::Normal);
        let pdu = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Eof(EofPdu::new_no_error(0x12345678, 100)),
        );
        let raw = pdu.to_vec().unwrap();
        assert_eq!(raw.len(), pdu.len_written());
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        assert_eq!(read_back, pdu);
    }

    #[test]
    fn test_full_pdu_crc_corruption_detected() {
        let pdu_conf = common_pdu_conf(CrcFlag::WithCrc, LargeFileFlag::Normal);
        let pdu = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Eof(EofPdu::new_no_error(0x12345678, 100)),
        );
        let mut raw = pdu.to_vec().unwrap();
        let last = raw.len() - 3;
        raw[last] ^= 0xFF;
        assert!(matches!(
            CfdpPdu::from_bytes(&raw).unwrap_err(),
            PduError::Checksum(_)
        ));
    }

    #[test]
    fn test_boundary_field_widths_round_trip() {
        // 1 and 8 octets are the smallest and largest legal entity ID and sequence
        // number widths.
        for (id_width, seq_width) in [(1usize, 1usize), (8, 8)] {
            let pdu_conf = CommonPduConfig::new_with_byte_fields(
                UnsignedByteField::new(id_width, 0xAB),
                UnsignedByteField::new(id_width, 0xCD),
                UnsignedByteField::new(seq_width, 0xEF),
            )
            .unwrap();
            let pdu = CfdpPdu::new_file_directive(
                pdu_conf,
                PduBody::Eof(EofPdu::new_no_error(0xDEADBEEF, 100)),
            );
            let raw = pdu.to_vec().unwrap();
            let read_back = CfdpPdu::from_bytes(&raw).unwrap();
            assert_eq!(read_back, pdu);
            assert_eq!(read_back.source_id().size(), id_width);
            assert_eq!(read_back.transaction_seq_num().size(), seq_width);
        }
    }

    #[test]
    fn test_truncated_buffer_rejected() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let pdu = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Eof(EofPdu::new_no_error(0x12345678, 100)),
        );
        let raw = pdu.to_vec().unwrap();
        // The total length declared in the header exceeds the supplied buffer.
        let error = CfdpPdu::from_bytes(&raw[0..raw.len() - 1]).unwrap_err();
        assert!(matches!(
            error,
            PduError::ByteConversion(ByteConversionError::FromSliceTooSmall { .. })
        ));
    }

    #[test]
    fn test_invalid_directive_code() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let header = PduHeader::new_for_file_directive(pdu_conf, 1);
        let mut buf = [0; 16];
        let header_len = header.write_to_bytes(&mut buf).unwrap();
        buf[header_len] = 0x2F;
        assert_eq!(
            CfdpPdu::from_bytes(&buf).unwrap_err(),
            PduError::InvalidDirectiveType {
                found: 0x2F,
                expected: None
            }
        );
    }

    #[test]
    fn test_packet_target_routing() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let eof = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Eof(EofPdu::new_no_error(0, 0)),
        );
        assert_eq!(eof.packet_target(), PacketTarget::DestEntity);
        let ack_of_eof = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Ack(AckPdu::new_for_eof(
                ConditionCode::NoError,
                TransactionStatus::Active,
            )),
        );
        assert_eq!(ack_of_eof.packet_target(), PacketTarget::SourceEntity);
        let ack_of_finished = CfdpPdu::new_file_directive(
            pdu_conf,
            PduBody::Ack(
                AckPdu::new(
                    FileDirectiveType::FinishedPdu,
                    ConditionCode::NoError,
                    TransactionStatus::Active,
                )
                .unwrap(),
            ),
        );
        assert_eq!(ack_of_finished.packet_target(), PacketTarget::DestEntity);
    }
}
