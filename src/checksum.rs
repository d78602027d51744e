//! # File integrity checksum support
//!
//! CFDP negotiates the file integrity algorithm per transaction through the checksum
//! type field of the Metadata PDU. The type identifiers are managed by the
//! [SANA Checksum Identifiers registry](https://sanaregistry.org/r/checksum_identifiers/).
//!
//! This module provides the [ChecksumComputer] abstraction for incremental checksum
//! accumulation over out-of-order file segments, the mandatory [NullChecksum] and
//! [ModularChecksum] implementations, CRC-32 variants backed by the [crc] crate, and
//! the [ChecksumRegistry] which maps type identifiers to computer factories.
//!
//! Java-style runtime service discovery is deliberately not reproduced: additional
//! algorithms are registered explicitly at startup with [ChecksumRegistry::register].
use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// [crc::Crc] instance using [crc::CRC_32_ISO_HDLC].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/4>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32>
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum types as registered in the SANA Checksum Identifiers registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ChecksumType {
    /// Modular legacy checksum as specified in CCSDS 727.0-B-5 4.2.5.
    Modular = 0,
    Crc32Proximity1 = 1,
    Crc32C = 2,
    Crc32 = 3,
    NullChecksum = 15,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported checksum type {0}")]
pub struct UnsupportedChecksumType(pub u8);

/// Incremental checksum accumulation over file segments.
///
/// Implementations must produce the same final value regardless of the order in which
/// non-overlapping segments are fed to [Self::update], as long as each byte of the file
/// is fed exactly once at its true file offset. This property is required because the
/// receiving entity accumulates the checksum as file data PDUs arrive, which may be
/// out of order.
pub trait ChecksumComputer {
    /// Feed a file segment located at the given file offset.
    fn update(&mut self, file_offset: u64, data: &[u8]);

    /// Current accumulated checksum value.
    fn value(&self) -> u32;

    fn reset(&mut self);
}

impl core::fmt::Debug for dyn ChecksumComputer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChecksumComputer")
            .field("value", &self.value())
            .finish_non_exhaustive()
    }
}

/// Convenience helper to checksum a full in-memory byte block with a fresh computer.
pub fn compute_whole_file(computer: &mut dyn ChecksumComputer, data: &[u8]) -> u32 {
    computer.reset();
    computer.update(0, data);
    computer.value()
}

/// Null checksum, always 0. Used when no integrity check on the link is required.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullChecksum;

impl ChecksumComputer for NullChecksum {
    fn update(&mut self, _file_offset: u64, _data: &[u8]) {}

    fn value(&self) -> u32 {
        0
    }

    fn reset(&mut self) {}
}

/// Modular checksum as specified in CCSDS 727.0-B-5 4.2.5.
///
/// The file is treated as a sequence of 4-octet big endian words aligned to file offset
/// 0 which are added with the carry discarded. A segment which does not start or end on
/// a word boundary is zero padded at the front or back before summing, which makes the
/// accumulation independent of segment order and granularity.
#[derive(Debug, Default, Copy, Clone)]
pub struct ModularChecksum {
    checksum: u32,
}

impl ChecksumComputer for ModularChecksum {
    fn update(&mut self, file_offset: u64, data: &[u8]) {
        for (idx, byte) in data.iter().enumerate() {
            let byte_in_word = ((file_offset + idx as u64) % 4) as u32;
            self.checksum = self
                .checksum
                .wrapping_add((*byte as u32) << (8 * (3 - byte_in_word)));
        }
    }

    fn value(&self) -> u32 {
        self.checksum
    }

    fn reset(&mut self) {
        self.checksum = 0;
    }
}

/// Incremental CRC-32 computer.
///
/// CRC accumulation is inherently order dependent, so [Self::update] enforces strictly
/// contiguous in-order segments and ignores data fed at unexpected offsets. The
/// destination handler only uses CRC types for the final whole-file verification pass,
/// where segments are read back in order from the filestore.
pub struct CrcChecksum {
    crc: &'static Crc<u32>,
    digest_value: u32,
    expected_offset: u64,
}

impl core::fmt::Debug for CrcChecksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CrcChecksum")
            .field("digest_value", &self.digest_value)
            .field("expected_offset", &self.expected_offset)
            .finish_non_exhaustive()
    }
}

impl CrcChecksum {
    pub fn new(crc: &'static Crc<u32>) -> Self {
        Self {
            crc,
            digest_value: crc.digest().finalize(),
            expected_offset: 0,
        }
    }
}

impl ChecksumComputer for CrcChecksum {
    fn update(&mut self, file_offset: u64, data: &[u8]) {
        if file_offset != self.expected_offset {
            return;
        }
        let mut digest = if self.expected_offset == 0 {
            self.crc.digest()
        } else {
            self.crc.digest_with_initial(!self.digest_value.reverse_bits())
        };
        digest.update(data);
        self.digest_value = digest.finalize();
        self.expected_offset += data.len() as u64;
    }

    fn value(&self) -> u32 {
        self.digest_value
    }

    fn reset(&mut self) {
        self.digest_value = self.crc.digest().finalize();
        self.expected_offset = 0;
    }
}

pub type ChecksumFactory = fn() -> Box<dyn ChecksumComputer>;

/// Registry mapping checksum type identifiers to computer factories.
///
/// [Self::new_with_defaults] pre-registers the mandatory [NullChecksum] and
/// [ModularChecksum] algorithms plus the CRC-32 and CRC-32C types supported by this
/// crate. Additional types in the 0-15 identifier range register with
/// [Self::register] before first use.
#[derive(Debug, Default, Clone)]
pub struct ChecksumRegistry {
    factories: HashMap<u8, ChecksumFactory>,
}

impl ChecksumRegistry {
    pub fn new_with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(ChecksumType::NullChecksum.into(), || {
            Box::new(NullChecksum)
        });
        registry.register(ChecksumType::Modular.into(), || {
            Box::<ModularChecksum>::default()
        });
        registry.register(ChecksumType::Crc32.into(), || {
            Box::new(CrcChecksum::new(&CRC_32))
        });
        registry.register(ChecksumType::Crc32C.into(), || {
            Box::new(CrcChecksum::new(&CRC_32C))
        });
        registry
    }

    /// Register a factory for the given type identifier, replacing a previous entry.
    pub fn register(&mut self, checksum_type: u8, factory: ChecksumFactory) {
        self.factories.insert(checksum_type, factory);
    }

    pub fn supports(&self, checksum_type: u8) -> bool {
        self.factories.contains_key(&checksum_type)
    }

    pub fn create(
        &self,
        checksum_type: u8,
    ) -> Result<Box<dyn ChecksumComputer>, UnsupportedChecksumType> {
        self.factories
            .get(&checksum_type)
            .map(|factory| factory())
            .ok_or(UnsupportedChecksumType(checksum_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_DATA: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE,
        0xFF,
    ];
    const EXAMPLE_MODULAR_CHECKSUM: u32 = 0xD8EDA1C4;

    #[test]
    fn test_modular_whole_file() {
        let mut computer = ModularChecksum::default();
        assert_eq!(
            compute_whole_file(&mut computer, &EXAMPLE_DATA),
            EXAMPLE_MODULAR_CHECKSUM
        );
    }

    #[test]
    fn test_modular_incremental_out_of_order() {
        // Arbitrary segment boundaries which do not fall on word boundaries, fed out of
        // order. The result must match the whole-file computation.
        let mut computer = ModularChecksum::default();
        computer.update(7, &EXAMPLE_DATA[7..13]);
        computer.update(0, &EXAMPLE_DATA[0..3]);
        computer.update(13, &EXAMPLE_DATA[13..16]);
        computer.update(3, &EXAMPLE_DATA[3..7]);
        assert_eq!(computer.value(), EXAMPLE_MODULAR_CHECKSUM);
    }

    #[test]
    fn test_modular_unaligned_tail() {
        // 5 bytes: one full word plus a tail padded with zeroes.
        let data = [0x01, 0x02, 0x03, 0x04, 0x05];
        let mut computer = ModularChecksum::default();
        computer.update(0, &data);
        assert_eq!(computer.value(), 0x01020304u32.wrapping_add(0x05000000));
    }

    #[test]
    fn test_modular_reset() {
        let mut computer = ModularChecksum::default();
        computer.update(0, &EXAMPLE_DATA);
        computer.reset();
        assert_eq!(computer.value(), 0);
    }

    #[test]
    fn test_null_checksum() {
        let mut computer = NullChecksum;
        computer.update(0, &EXAMPLE_DATA);
        computer.update(1000, &[0xFF; 64]);
        assert_eq!(computer.value(), 0);
    }

    #[test]
    fn test_crc32_matches_oneshot() {
        let mut computer = CrcChecksum::new(&CRC_32);
        computer.update(0, &EXAMPLE_DATA[0..5]);
        computer.update(5, &EXAMPLE_DATA[5..16]);
        assert_eq!(computer.value(), CRC_32.checksum(&EXAMPLE_DATA));
    }

    #[test]
    fn test_crc32_ignores_out_of_order_segment() {
        let mut computer = CrcChecksum::new(&CRC_32);
        computer.update(8, &EXAMPLE_DATA[8..16]);
        computer.update(0, &EXAMPLE_DATA[0..8]);
        computer.update(8, &EXAMPLE_DATA[8..16]);
        assert_eq!(computer.value(), CRC_32.checksum(&EXAMPLE_DATA));
    }

    #[test]
    fn test_registry_defaults() {
        let registry = ChecksumRegistry::new_with_defaults();
        assert!(registry.supports(ChecksumType::NullChecksum.into()));
        assert!(registry.supports(ChecksumType::Modular.into()));
        assert!(registry.supports(ChecksumType::Crc32.into()));
        assert!(registry.supports(ChecksumType::Crc32C.into()));
        assert!(!registry.supports(ChecksumType::Crc32Proximity1.into()));
        let mut computer = registry
            .create(ChecksumType::Modular.into())
            .expect("creating modular computer failed");
        computer.update(0, &EXAMPLE_DATA);
        assert_eq!(computer.value(), EXAMPLE_MODULAR_CHECKSUM);
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = ChecksumRegistry::new_with_defaults();
        let error = registry.create(7).unwrap_err();
        assert_eq!(error, UnsupportedChecksumType(7));
        assert_eq!(error.to_string(), "unsupported checksum type 7");
    }

    #[test]
    fn test_registry_custom_registration() {
        let mut registry = ChecksumRegistry::new_with_defaults();
        registry.register(ChecksumType::Crc32Proximity1.into(), || {
            Box::new(NullChecksum)
        });
        assert!(registry.supports(ChecksumType::Crc32Proximity1.into()));
    }
}
