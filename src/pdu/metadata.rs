use crate::pdu::lv::Lv;
use crate::pdu::tlv::{FilestoreRequestTlv, MsgToUserTlv, Tlv, TlvType};
use crate::pdu::{fss_len, read_fss_field, write_fss_field, LargeFileFlag, PduError};
use crate::util::ByteConversionError;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Metadata PDU, CCSDS 727.0-B-5 5.2.5.
///
/// The checksum type is kept as the raw 4-bit identifier because the set of supported
/// algorithms is extensible at runtime through the
/// [checksum registry][crate::checksum::ChecksumRegistry].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MetadataPdu {
    pub closure_requested: bool,
    pub checksum_type: u8,
    pub file_size: u64,
    pub src_file_name: Lv,
    pub dest_file_name: Lv,
    pub options: Vec<Tlv>,
}

impl MetadataPdu {
    pub fn new(
        closure_requested: bool,
        checksum_type: u8,
        file_size: u64,
        src_file_name: Lv,
        dest_file_name: Lv,
    ) -> Self {
        Self {
            closure_requested,
            checksum_type,
            file_size,
            src_file_name,
            dest_file_name,
            options: Vec::new(),
        }
    }

    /// A metadata-only transaction carries no file, both file name fields are empty.
    pub fn is_metadata_only(&self) -> bool {
        self.src_file_name.is_empty() && self.dest_file_name.is_empty()
    }

    /// All filestore request options in their order of appearance.
    pub fn filestore_requests(&self) -> Result<Vec<FilestoreRequestTlv>, PduError> {
        let mut requests = Vec::new();
        for option in &self.options {
            if option.tlv_type() == Some(TlvType::FilestoreRequest) {
                requests.push(FilestoreRequestTlv::from_tlv(option)?);
            }
        }
        Ok(requests)
    }

    /// All messages to user options in their order of appearance.
    pub fn msgs_to_user(&self) -> Result<Vec<MsgToUserTlv>, PduError> {
        let mut msgs = Vec::new();
        for option in &self.options {
            if option.tlv_type() == Some(TlvType::MsgToUser) {
                msgs.push(MsgToUserTlv::from_tlv(option)?);
            }
        }
        Ok(msgs)
    }

    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        1 + fss_len(file_flag)
            + self.src_file_name.len_full()
            + self.dest_file_name.len_full()
            + self.options.iter().map(|tlv| tlv.len_full()).sum::<usize>()
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
        buf[current_idx] =
            ((self.closure_requested as u8) << 6) | (self.checksum_type & 0b1111);
        current_idx += 1;
        current_idx += write_fss_field(file_flag, self.file_size, &mut buf[current_idx..])?;
        current_idx += self.src_file_name.write_to_bytes(&mut buf[current_idx..])?;
        current_idx += self.dest_file_name.write_to_bytes(&mut buf[current_idx..])?;
        for option in &self.options {
            current_idx += option.write_to_bytes(&mut buf[current_idx..])?;
        }
        Ok(current_idx)
    }

    pub(crate) fn from_bytes(file_flag: LargeFileFlag, buf: &[u8]) -> Result<Self, PduError> {
        let min_len = 1 + fss_len(file_flag) + 2;
        if buf.len() < min_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: min_len,
            }
            .into());
        }
        let closure_requested = (buf[0] >> 6) & 0b1 == 1;
        let checksum_type = buf[0] & 0b1111;
        let mut current_idx = 1;
        let (fss, file_size) = read_fss_field(file_flag, &buf[current_idx..])?;
        current_idx += fss;
        let src_file_name = Lv::from_bytes(&buf[current_idx..])?;
        current_idx += src_file_name.len_full();
        let dest_file_name = Lv::from_bytes(&buf[current_idx..])?;
        current_idx += dest_file_name.len_full();
        let mut options = Vec::new();
        while current_idx < buf.len() {
            let option = Tlv::from_bytes(&buf[current_idx..])?;
            current_idx += option.len_full();
            options.push(option);
        }
        Ok(Self {
            closure_requested,
            checksum_type,
            file_size,
            src_file_name,
            dest_file_name,
            options,
        })
    }
}
