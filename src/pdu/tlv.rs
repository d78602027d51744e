//! Generic CFDP type-length-value (TLV) field support and the typed TLVs built on it.
use crate::pdu::lv::Lv;
use crate::util::{ByteConversionError, UnsignedByteField};
use derive_new::new;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const MAX_TLV_LEN: usize = u8::MAX as usize;

/// TLV type identifiers as specified in CCSDS 727.0-B-5 5.4.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum TlvType {
    FilestoreRequest = 0x00,
    FilestoreResponse = 0x01,
    MsgToUser = 0x02,
    FaultHandler = 0x04,
    FlowLabel = 0x05,
    EntityId = 0x06,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TlvError {
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("TLV data with size {0} larger than maximum of 255 bytes")]
    DataTooLarge(usize),
    #[error("unexpected TLV type {found}, expected {expected}")]
    UnexpectedType { found: u8, expected: u8 },
    #[error("invalid value length {0} for typed TLV")]
    InvalidValueLength(usize),
}

/// Raw type-length-value field: one type octet, one length octet and up to 255 value
/// octets. Typed accessors for the standard TLVs are provided by the dedicated
/// structures in this module, unknown types are passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tlv {
    tlv_type: u8,
    data: Vec<u8>,
}

impl Tlv {
    pub fn new(tlv_type: u8, data: &[u8]) -> Result<Self, TlvError> {
        if data.len() > MAX_TLV_LEN {
            return Err(TlvError::DataTooLarge(data.len()));
        }
        Ok(Self {
            tlv_type,
            data: data.to_vec(),
        })
    }

    pub fn new_typed(tlv_type: TlvType, data: &[u8]) -> Result<Self, TlvError> {
        Self::new(tlv_type.into(), data)
    }

    #[inline]
    pub fn tlv_type_raw(&self) -> u8 {
        self.tlv_type
    }

    /// Standard TLV type, if the raw type octet maps to one.
    pub fn tlv_type(&self) -> Option<TlvType> {
        TlvType::try_from(self.tlv_type).ok()
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.data
    }

    /// Full serialized length including the type and length octets.
    #[inline]
    pub fn len_full(&self) -> usize {
        self.data.len() + 2
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.len_full() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.len_full(),
            });
        }
        buf[0] = self.tlv_type;
        buf[1] = self.data.len() as u8;
        buf[2..2 + self.data.len()].copy_from_slice(&self.data);
        Ok(self.len_full())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ByteConversionError> {
        if buf.len() < 2 {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: 2,
            });
        }
        let value_len = buf[1] as usize;
        if buf.len() < 2 + value_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: 2 + value_len,
            });
        }
        Ok(Self {
            tlv_type: buf[0],
            data: buf[2..2 + value_len].to_vec(),
        })
    }
}

/// Entity ID TLV, used as the fault location field of the EOF and Finished PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityIdTlv {
    pub entity_id: UnsignedByteField,
}

impl EntityIdTlv {
    pub fn len_full(&self) -> usize {
        2 + self.entity_id.size()
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.len_full() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.len_full(),
            });
        }
        buf[0] = TlvType::EntityId.into();
        buf[1] = self.entity_id.size() as u8;
        self.entity_id.write_to_be_bytes(&mut buf[2..])?;
        Ok(self.len_full())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, TlvError> {
        let tlv = Tlv::from_bytes(buf)?;
        Self::from_tlv(&tlv)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, TlvError> {
        if tlv.tlv_type_raw() != u8::from(TlvType::EntityId) {
            return Err(TlvError::UnexpectedType {
                found: tlv.tlv_type_raw(),
                expected: TlvType::EntityId.into(),
            });
        }
        let value = tlv.value();
        if value.is_empty() || value.len() > 8 {
            return Err(TlvError::InvalidValueLength(value.len()));
        }
        Ok(Self {
            entity_id: UnsignedByteField::new_from_be_bytes(value.len(), value)?,
        })
    }
}

/// Filestore action codes for filestore request and response TLVs, CCSDS 727.0-B-5 5.4.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FilestoreActionCode {
    CreateFile = 0,
    DeleteFile = 1,
    RenameFile = 2,
    AppendFile = 3,
    ReplaceFile = 4,
    CreateDirectory = 5,
    RemoveDirectory = 6,
    DenyFile = 7,
    DenyDirectory = 8,
}

impl FilestoreActionCode {
    /// Whether the action takes a second file name operand.
    pub fn has_second_file_name(&self) -> bool {
        matches!(
            self,
            Self::RenameFile | Self::AppendFile | Self::ReplaceFile
        )
    }
}

/// Filestore request TLV carried in the Metadata PDU options field.
#[derive(Debug, Clone, PartialEq, Eq, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreRequestTlv {
    pub action_code: FilestoreActionCode,
    pub first_file_name: Lv,
    pub second_file_name: Lv,
}

impl FilestoreRequestTlv {
    fn value_len(&self) -> usize {
        let mut len = 1 + self.first_file_name.len_full();
        if self.action_code.has_second_file_name() {
            len += self.second_file_name.len_full();
        }
        len
    }

    pub fn to_tlv(&self) -> Result<Tlv, TlvError> {
        let mut value = vec![0; self.value_len()];
        value[0] = u8::from(self.action_code) << 4;
        let mut current_idx = 1;
        current_idx += self
            .first_file_name
            .write_to_bytes(&mut value[current_idx..])?;
        if self.action_code.has_second_file_name() {
            self.second_file_name
                .write_to_bytes(&mut value[current_idx..])?;
        }
        Tlv::new_typed(TlvType::FilestoreRequest, &value)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, TlvError> {
        if tlv.tlv_type_raw() != u8::from(TlvType::FilestoreRequest) {
            return Err(TlvError::UnexpectedType {
                found: tlv.tlv_type_raw(),
                expected: TlvType::FilestoreRequest.into(),
            });
        }
        let value = tlv.value();
        if value.is_empty() {
            return Err(TlvError::InvalidValueLength(0));
        }
        let action_code = FilestoreActionCode::try_from(value[0] >> 4)
            .map_err(|_| TlvError::InvalidValueLength(value.len()))?;
        let first_file_name = Lv::from_bytes(&value[1..])?;
        let second_file_name = if action_code.has_second_file_name() {
            Lv::from_bytes(&value[1 + first_file_name.len_full()..])?
        } else {
            Lv::new_empty()
        };
        Ok(Self {
            action_code,
            first_file_name,
            second_file_name,
        })
    }
}

/// Filestore response TLV carried in the Finished PDU, mirroring a filestore request.
///
/// The status code is kept raw because its meaning depends on the action code and
/// 0b1111 "not performed" applies to all actions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilestoreResponseTlv {
    pub action_code: FilestoreActionCode,
    pub status_code: u8,
    pub first_file_name: Lv,
    pub second_file_name: Lv,
    pub filestore_message: Lv,
}

impl FilestoreResponseTlv {
    pub const STATUS_SUCCESS: u8 = 0b0000;
    pub const STATUS_NOT_PERFORMED: u8 = 0b1111;

    pub fn new_success(request: &FilestoreRequestTlv) -> Self {
        Self {
            action_code: request.action_code,
            status_code: Self::STATUS_SUCCESS,
            first_file_name: request.first_file_name.clone(),
            second_file_name: request.second_file_name.clone(),
            filestore_message: Lv::new_empty(),
        }
    }

    pub fn new_failure(request: &FilestoreRequestTlv, status_code: u8, message: Lv) -> Self {
        Self {
            action_code: request.action_code,
            status_code: status_code & 0b1111,
            first_file_name: request.first_file_name.clone(),
            second_file_name: request.second_file_name.clone(),
            filestore_message: message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == Self::STATUS_SUCCESS
    }

    fn value_len(&self) -> usize {
        let mut len = 1 + self.first_file_name.len_full();
        if self.action_code.has_second_file_name() {
            len += self.second_file_name.len_full();
        }
        len + self.filestore_message.len_full()
    }

    pub fn to_tlv(&self) -> Result<Tlv, TlvError> {
        let mut value = vec![0; self.value_len()];
        value[0] = (u8::from(self.action_code) << 4) | (self.status_code & 0b1111);
        let mut current_idx = 1;
        current_idx += self
            .first_file_name
            .write_to_bytes(&mut value[current_idx..])?;
        if self.action_code.has_second_file_name() {
            current_idx += self
                .second_file_name
                .write_to_bytes(&mut value[current_idx..])?;
        }
        self.filestore_message
            .write_to_bytes(&mut value[current_idx..])?;
        Tlv::new_typed(TlvType::FilestoreResponse, &value)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, TlvError> {
        if tlv.tlv_type_raw() != u8::from(TlvType::FilestoreResponse) {
            return Err(TlvError::UnexpectedType {
                found: tlv.tlv_type_raw(),
                expected: TlvType::FilestoreResponse.into(),
            });
        }
        let value = tlv.value();
        if value.is_empty() {
            return Err(TlvError::InvalidValueLength(0));
        }
        let action_code = FilestoreActionCode::try_from(value[0] >> 4)
            .map_err(|_| TlvError::InvalidValueLength(value.len()))?;
        let status_code = value[0] & 0b1111;
        let mut current_idx = 1;
        let first_file_name = Lv::from_bytes(&value[current_idx..])?;
        current_idx += first_file_name.len_full();
        let second_file_name = if action_code.has_second_file_name() {
            let lv = Lv::from_bytes(&value[current_idx..])?;
            current_idx += lv.len_full();
            lv
        } else {
            Lv::new_empty()
        };
        let filestore_message = Lv::from_bytes(&value[current_idx..])?;
        Ok(Self {
            action_code,
            status_code,
            first_file_name,
            second_file_name,
            filestore_message,
        })
    }
}

/// Messages to User TLV, passed through to the application without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MsgToUserTlv {
    pub msg: Vec<u8>,
}

impl MsgToUserTlv {
    pub fn new(msg: &[u8]) -> Result<Self, TlvError> {
        if msg.len() > MAX_TLV_LEN {
            return Err(TlvError::DataTooLarge(msg.len()));
        }
        Ok(Self { msg: msg.to_vec() })
    }

    pub fn to_tlv(&self) -> Result<Tlv, TlvError> {
        Tlv::new_typed(TlvType::MsgToUser, &self.msg)
    }

    pub fn from_tlv(tlv: &Tlv) -> Result<Self, TlvError> {
        if tlv.tlv_type_raw() != u8::from(TlvType::MsgToUser) {
            return Err(TlvError::UnexpectedType {
                found: tlv.tlv_type_raw(),
                expected: TlvType::MsgToUser.into(),
            });
        }
        Ok(Self {
            msg: tlv.value().to_vec(),
        })
    }
}
