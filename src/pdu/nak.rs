use crate::pdu::{fss_len, read_fss_field, write_fss_field, LargeFileFlag, PduError};
use crate::util::ByteConversionError;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// A lost segment request as a `(start offset, end offset)` pair with an exclusive end.
/// The special request `(0, 0)` asks for a retransmission of the Metadata PDU.
pub type SegmentRequest = (u64, u64);

pub type SegmentRequests = SmallVec<[SegmentRequest; 16]>;

/// NAK PDU, CCSDS 727.0-B-5 5.2.6.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NakPdu {
    pub start_of_scope: u64,
    pub end_of_scope: u64,
    pub segment_requests: SegmentRequests,
}

impl NakPdu {
    pub fn new(start_of_scope: u64, end_of_scope: u64, segment_requests: SegmentRequests) -> Self {
        Self {
            start_of_scope,
            end_of_scope,
            segment_requests,
        }
    }

    /// Whether the metadata retransmission request `(0, 0)` is part of the request list.
    pub fn has_metadata_request(&self) -> bool {
        self.segment_requests.contains(&(0, 0))
    }

    /// Maximum number of segment requests which fit into a NAK PDU with the given
    /// datafield size limit.
    pub fn max_segment_requests(file_flag: LargeFileFlag, datafield_len_limit: usize) -> usize {
        // Directive code octet plus scope fields.
        let fixed = 1 + 2 * fss_len(file_flag);
        datafield_len_limit.saturating_sub(fixed) / (2 * fss_len(file_flag))
    }

    pub fn written_len(&self, file_flag: LargeFileFlag) -> usize {
        2 * fss_len(file_flag) + self.segment_requests.len() * 2 * fss_len(file_flag)
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
        current_idx += write_fss_field(file_flag, self.start_of_scope, &mut buf[current_idx..])?;
        current_idx += write_fss_field(file_flag, self.end_of_scope, &mut buf[current_idx..])?;
        for (start, end) in &self.segment_requests {
            current_idx += write_fss_field(file_flag, *start, &mut buf[current_idx..])?;
            current_idx += write_fss_field(file_flag, *end, &mut buf[current_idx..])?;
        }
        Ok(current_idx)
    }

    pub(crate) fn from_bytes(file_flag: LargeFileFlag, buf: &[u8]) -> Result<Self, PduError> {
        let fss = fss_len(file_flag);
        if buf.len() < 2 * fss {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: 2 * fss,
            }
            .into());
        }
        let mut current_idx = 0;
        let (read, start_of_scope) = read_fss_field(file_flag, &buf[current_idx..])?;
        current_idx += read;
        let (read, end_of_scope) = read_fss_field(file_flag, &buf[current_idx..])?;
        current_idx += read;
        let remaining = buf.len() - current_idx;
        if remaining % (2 * fss) != 0 {
            return Err(PduError::InvalidSegmentRequestLen(remaining));
        }
        let mut segment_requests = SegmentRequests::new();
        while current_idx < buf.len() {
            let (read, start) = read_fss_field(file_flag, &buf[current_idx..])?;
            current_idx += read;
            let (read, end) = read_fss_field(file_flag, &buf[current_idx..])?;
            current_idx += read;
            segment_requests.push((start, end));
        }
        Ok(Self {
            start_of_scope,
            end_of_scope,
            segment_requests,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::tests::common_pdu_conf;
    use crate::pdu::{CfdpPdu, CrcFlag, FileDirectiveType, PduBody};
    use smallvec::smallvec;

    #[test]
    fn test_basic_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let nak = NakPdu::new(0, 500, smallvec![(0, 0), (100, 200), (300, 400)]);
        assert!(nak.has_metadata_request());
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::Nak(nak.clone()));
        assert_eq!(pdu.file_directive_type(), Some(FileDirectiveType::NakPdu));
        // Header, directive code, two scope fields, three request pairs.
        assert_eq!(pdu.len_written(), 8 + 1 + 8 + 24);
        let raw = pdu.to_vec().unwrap();
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::Nak(read_nak) => {
                assert_eq!(read_nak, nak);
                assert_eq!(read_nak.segment_requests.as_slice(), &[
                    (0, 0),
                    (100, 200),
                    (300, 400)
                ]);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_large_file_offsets() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Large);
        let big = u32::MAX as u64 + 1;
        let nak = NakPdu::new(0, big + 100, smallvec![(big, big + 100)]);
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::Nak(nak.clone()));
        let raw = pdu.to_vec().unwrap();
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::Nak(read_nak) => assert_eq!(read_nak, nak),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_truncated_request_list() {
        // Two scope fields plus 4 trailing bytes, which is not a full request pair.
        let buf = [0; 12];
        assert_eq!(
            NakPdu::from_bytes(LargeFileFlag::Normal, &buf).unwrap_err(),
            PduError::InvalidSegmentRequestLen(4)
        );
    }

    #[test]
    fn test_max_segment_requests() {
        assert_eq!(NakPdu::max_segment_requests(LargeFileFlag::Normal, 65), 7);
        assert_eq!(NakPdu::max_segment_requests(LargeFileFlag::Large, 65), 3);
        assert_eq!(NakPdu::max_segment_requests(LargeFileFlag::Normal, 4), 0);
    }
}
