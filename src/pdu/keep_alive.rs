use crate::pdu::{fss_len, read_fss_field, write_fss_field, LargeFileFlag, PduError};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Keep Alive PDU, CCSDS 727.0-B-5 5.2.8. Reports the receive progress of the file
/// receiver back to the sender in acknowledged mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeepAlivePdu {
    pub progress: u64,
}

impl KeepAlivePdu {
    pub fn new(progress: u64) -> Self {
        Self { progress }
    }

    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        fss_len(file_flag)
    }

    pub(crate) fn write_to_bytes(
        &self,
        file_flag: LargeFileFlag,
        buf: &mut [u8],
    ) -> Result<usize, PduError> {
        write_fss_field(file_flag, self.progress, buf)
    }

    pub(crate) fn from_bytes(file_flag: LargeFileFlag, buf: &[u8]) -> Result<Self, PduError> {
        let (_, progress) = read_fss_field(file_flag, buf)?;
        Ok(Self { progress })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::tests::common_pdu_conf;
    use crate::pdu::{CfdpPdu, CrcFlag, FileDirectiveType, PduBody};

    #[test]
    fn test_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let keep_alive = KeepAlivePdu::new(4096);
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::KeepAlive(keep_alive));
        assert_eq!(
            pdu.file_directive_type(),
            Some(FileDirectiveType::KeepAlivePdu)
        );
        assert_eq!(pdu.len_written(), 8 + 1 + 4);
        let raw = pdu.to_vec().unwrap();
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::KeepAlive(read_keep_alive) => assert_eq!(read_keep_alive, keep_alive),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_large_progress() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Large);
        let keep_alive = KeepAlivePdu::new(u32::MAX as u64 + 42);
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::KeepAlive(keep_alive));
        let raw = pdu.to_vec().unwrap();
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::KeepAlive(read_keep_alive) => {
                assert_eq!(read_keep_alive.progress, u32::MAX as u64 + 42)
            }
            other => panic!("unexpected body {other:?}"),
        }
    }
}
