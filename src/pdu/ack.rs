use crate::pdu::{ConditionCode, FileDirectiveType, PduError, TransactionStatus};
use crate::util::ByteConversionError;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// ACK PDU, CCSDS 727.0-B-5 5.2.4. Only EOF and Finished PDUs are acknowledged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AckPdu {
    pub acked_directive: FileDirectiveType,
    pub condition_code: ConditionCode,
    pub transaction_status: TransactionStatus,
}

impl AckPdu {
    pub fn new(
        acked_directive: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<Self, PduError> {
        if acked_directive != FileDirectiveType::EofPdu
            && acked_directive != FileDirectiveType::FinishedPdu
        {
            return Err(PduError::InvalidAckedDirectiveCode(acked_directive.into()));
        }
        Ok(Self {
            acked_directive,
            condition_code,
            transaction_status,
        })
    }

    pub fn new_for_eof(condition_code: ConditionCode, transaction_status: TransactionStatus) -> Self {
        Self {
            acked_directive: FileDirectiveType::EofPdu,
            condition_code,
            transaction_status,
        }
    }

    pub fn new_for_finished(
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self {
            acked_directive: FileDirectiveType::FinishedPdu,
            condition_code,
            transaction_status,
        }
    }

    pub fn written_len(&self) -> usize {
        2
    }

    pub(crate) fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        if buf.len() < 2 {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: 2,
            }
            .into());
        }
        // The directive subtype code is 0b0001 for the acknowledgement of a Finished
        // PDU and 0b0000 otherwise.
        let subtype = if self.acked_directive == FileDirectiveType::FinishedPdu {
            0b0001
        } else {
            0b0000
        };
        buf[0] = ((self.acked_directive as u8) << 4) | subtype;
        buf[1] = ((self.condition_code as u8) << 4) | (self.transaction_status as u8);
        Ok(2)
    }

    pub(crate) fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        if buf.len() < 2 {
            return Err(ByteConversionError::FromSliceTooSmall {
                found: buf.len(),
                expected: 2,
            }
            .into());
        }
        let acked_directive_raw = (buf[0] >> 4) & 0b1111;
        let acked_directive = FileDirectiveType::try_from(acked_directive_raw)
            .map_err(|_| PduError::InvalidAckedDirectiveCode(acked_directive_raw))?;
        let condition_code = ConditionCode::try_from((buf[1] >> 4) & 0b1111)
            .map_err(|_| PduError::InvalidConditionCode((buf[1] >> 4) & 0b1111))?;
        // unwrap okay, 2-bit field conversion can not fail.
        let transaction_status = TransactionStatus::try_from(buf[1] & 0b11).unwrap();
        Self::new(acked_directive, condition_code, transaction_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::tests::common_pdu_conf;
    use crate::pdu::{CfdpPdu, CrcFlag, LargeFileFlag, PduBody};

    #[test]
    fn test_eof_ack_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let ack = AckPdu::new_for_eof(ConditionCode::NoError, TransactionStatus::Active);
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::Ack(ack));
        let raw = pdu.to_vec().unwrap();
        assert_eq!(raw[9], (0x04 << 4) | 0b0000);
        assert_eq!(raw[10], 0b01);
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::Ack(read_ack) => assert_eq!(read_ack, ack),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_finished_ack_round_trip() {
        let pdu_conf = common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal);
        let ack = AckPdu::new_for_finished(
            ConditionCode::CancelRequestReceived,
            TransactionStatus::Terminated,
        );
        let pdu = CfdpPdu::new_file_directive(pdu_conf, PduBody::Ack(ack));
        let raw = pdu.to_vec().unwrap();
        assert_eq!(raw[9], (0x05 << 4) | 0b0001);
        let read_back = CfdpPdu::from_bytes(&raw).unwrap();
        match read_back.into_body() {
            PduBody::Ack(read_ack) => assert_eq!(read_ack, ack),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_invalid_acked_directive() {
        assert_eq!(
            AckPdu::new(
                FileDirectiveType::MetadataPdu,
                ConditionCode::NoError,
                TransactionStatus::Active
            )
            .unwrap_err(),
            PduError::InvalidAckedDirectiveCode(0x07)
        );
    }
}
