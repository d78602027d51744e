//! Generic CFDP length-value (LV) field support.
use crate::util::ByteConversionError;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const MAX_LV_LEN: usize = u8::MAX as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[error("LV data with size {0} larger than maximum of 255 bytes")]
pub struct LvDataTooLarge(pub usize);

/// Length-value field as specified in CCSDS 727.0-B-5 5.1.8: one length octet followed
/// by up to 255 value octets. CFDP uses this field for the source and destination file
/// names of the Metadata PDU and inside filestore request/response TLVs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Lv {
    data: Vec<u8>,
}

impl Lv {
    pub fn new(data: &[u8]) -> Result<Self, LvDataTooLarge> {
        if data.len() > MAX_LV_LEN {
            return Err(LvDataTooLarge(data.len()));
        }
        Ok(Self {
            data: data.to_vec(),
        })
    }

    /// Helper to generate an LV field from a regular string.
    pub fn new_from_str(string: &str) -> Result<Self, LvDataTooLarge> {
        Self::new(string.as_bytes())
    }

    /// An empty LV field, serialized as one zero length octet.
    pub fn new_empty() -> Self {
        Self { data: Vec::new() }
    }

    #[inline]
    pub fn value(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the value field without the length octet.
    #[inline]
    pub fn len_value(&self) -> usize {
        self.data.len()
    }

    /// Full serialized length including the length octet.
    #[inline]
    pub fn len_full(&self) -> usize {
        self.data.len() + 1
    }

    pub fn as_str(&self) -> Result<&str, core::str::Utf8Error> {
        core::str::from_utf8(&self.data)
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.len_full() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.len_full(),
            });
        }
        buf[0] = self.data.len() as u8;
        buf[1..1 + self.data.len()].copy_from_slice(&self.data);
        Ok(self.len_full())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, ByteConversionError> {
        if buf.is_empty() {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: 0,
                expected: 1,
            });
        }
        let value_len = buf[0] as usize;
        if buf.len() < 1 + value_len {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: 1 + value_len,
            });
        }
        Ok(Self {
            data: buf[1..1 + value_len].to_vec(),
        })
    }
}
