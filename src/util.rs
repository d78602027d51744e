//! Helper types for variable-width unsigned fields as they appear in the CFDP PDU header.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ByteConversionError {
    #[error("target slice with size {found} too small, expected at least {expected} bytes")]
    ToSliceTooSmall { found: usize, expected: usize },
    #[error("source slice with size {found} too small, expected at least {expected} bytes")]
    FromSliceTooSmall { found: usize, expected: usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[error("invalid unsigned byte field width {0}, must be in range 1..=8")]
pub struct InvalidWidthError(pub usize);

/// An unsigned integer with a variable width of 1 to 8 octets, serialized big endian.
///
/// The CFDP PDU header encodes entity IDs and the transaction sequence number as fields
/// of this kind, with the actual width carried in the fixed header.
#[derive(Debug, Copy, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UnsignedByteField {
    width: usize,
    value: u64,
}

impl UnsignedByteField {
    /// Panics if the width is not in the range of 1 to 8 octets or if the value does not
    /// fit into the given width. Use [Self::new_checked] for a fallible constructor.
    pub const fn new(width: usize, value: u64) -> Self {
        assert!(width >= 1 && width <= 8, "invalid byte field width");
        assert!(
            width == 8 || value < (1u64 << (width * 8)),
            "value too large for byte field width"
        );
        Self { width, value }
    }

    pub fn new_checked(width: usize, value: u64) -> Result<Self, InvalidWidthError> {
        if !(1..=8).contains(&width) {
            return Err(InvalidWidthError(width));
        }
        if width < 8 && value >= (1u64 << (width * 8)) {
            return Err(InvalidWidthError(width));
        }
        Ok(Self { width, value })
    }

    /// Smallest field which can hold the given value.
    pub fn new_minimal(value: u64) -> Self {
        let width = core::cmp::max(1, (8 - value.leading_zeros() as usize / 8) as usize);
        Self { width, value }
    }

    pub fn new_from_be_bytes(width: usize, buf: &[u8]) -> Result<Self, ByteConversionError> {
        if buf.len() < width {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: width,
            });
        }
        let mut value = 0u64;
        for byte in buf.iter().take(width) {
            value = (value << 8) | *byte as u64;
        }
        // Width was implicitly validated by the caller-provided slice bound check above,
        // but reject out-of-range values nonetheless.
        Self::new_checked(width, value).map_err(|_| ByteConversionError::FromSliceTooSmall {
            found: buf.len(),
            expected: width,
        })
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.width
    }

    #[inline]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Re-encode the same value with a different width, for example to match the width of
    /// a peer entity ID.
    pub fn with_width(&self, width: usize) -> Result<Self, InvalidWidthError> {
        Self::new_checked(width, self.value)
    }

    pub fn write_to_be_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.width {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.width,
            });
        }
        for i in 0..self.width {
            buf[i] = (self.value >> (8 * (self.width - 1 - i))) as u8;
        }
        Ok(self.width)
    }
}

/// Equality and hashing are based on the value only, so fields with different widths but
/// the same value compare equal. This matters for transaction lookup, where the same entity
/// might be addressed with different field widths.
impl PartialEq for UnsignedByteField {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl core::hash::Hash for UnsignedByteField {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl From<u8> for UnsignedByteField {
    fn from(value: u8) -> Self {
        Self::new(1, value.into())
    }
}

impl From<u16> for UnsignedByteField {
    fn from(value: u16) -> Self {
        Self::new(2, value.into())
    }
}

impl From<u32> for UnsignedByteField {
    fn from(value: u32) -> Self {
        Self::new(4, value.into())
    }
}

impl From<u64> for UnsignedByteField {
    fn from(value: u64) -> Self {
        Self::new(8, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let field = UnsignedByteField::new(2, 0x1234);
        assert_eq!(field.size(), 2);
        assert_eq!(field.value(), 0x1234);
        let mut buf = [0; 8];
        assert_eq!(field.write_to_be_bytes(&mut buf).unwrap(), 2);
        assert_eq!(buf[0], 0x12);
        assert_eq!(buf[1], 0x34);
    }

    #[test]
    fn test_round_trip_all_widths() {
        for width in 1..=8 {
            let max_value = if width == 8 {
                u64::MAX
            } else {
                (1u64 << (width * 8)) - 1
            };
            let field = UnsignedByteField::new(width, max_value);
            let mut buf = [0; 8];
            field.write_to_be_bytes(&mut buf).unwrap();
            let read_back = UnsignedByteField::new_from_be_bytes(width, &buf).unwrap();
            assert_eq!(read_back, field);
            assert_eq!(read_back.size(), width);
        }
    }

    #[test]
    fn test_minimal_width() {
        assert_eq!(UnsignedByteField::new_minimal(0).size(), 1);
        assert_eq!(UnsignedByteField::new_minimal(255).size(), 1);
        assert_eq!(UnsignedByteField::new_minimal(256).size(), 2);
        assert_eq!(UnsignedByteField::new_minimal(u64::MAX).size(), 8);
    }

    #[test]
    fn test_invalid_width() {
        assert_eq!(
            UnsignedByteField::new_checked(0, 0).unwrap_err(),
            InvalidWidthError(0)
        );
        assert_eq!(
            UnsignedByteField::new_checked(9, 0).unwrap_err(),
            InvalidWidthError(9)
        );
        assert!(UnsignedByteField::new_checked(1, 256).is_err());
    }

    #[test]
    fn test_value_equality_across_widths() {
        assert_eq!(
            UnsignedByteField::new(1, 5),
            UnsignedByteField::new(4, 5).with_width(1).unwrap()
        );
        assert_eq!(UnsignedByteField::new(2, 5), UnsignedByteField::new(8, 5));
    }

    #[test]
    fn test_buffer_too_small() {
        let field = UnsignedByteField::new(4, 0xdeadbeef);
        let mut buf = [0; 2];
        assert_eq!(
            field.write_to_be_bytes(&mut buf).unwrap_err(),
            ByteConversionError::ToSliceTooSmall {
                found: 2,
                expected: 4
            }
        );
        assert_eq!(
            UnsignedByteField::new_from_be_bytes(4, &buf).unwrap_err(),
            ByteConversionError::FromSliceTooSmall {
                found: 2,
                expected: 4
            }
        );
    }
}
