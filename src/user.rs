//! Indication API towards the CFDP user, CCSDS 727.0-B-5 3.4.
use crate::pdu::file_data::SegmentMetadata;
use crate::pdu::finished::{DeliveryCode, FileStatus};
use crate::pdu::tlv::MsgToUserTlv;
use crate::pdu::ConditionCode;
use crate::util::UnsignedByteField;
use crate::{EntityType, State, TransactionId};
use derive_new::new;

/// Parameters of the Transaction-Finished indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

/// Parameters of the Metadata-Recvd indication.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct MetadataReceivedParams {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: String,
    pub dest_file_name: String,
    pub msgs_to_user: Vec<MsgToUserTlv>,
}

/// Parameters of the File-Segment-Recvd indication.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct FileSegmentRecvdParams {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub segment_metadata: Option<SegmentMetadata>,
}

/// Point-in-time transaction status delivered with the Report indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq, new)]
pub struct TransactionReport {
    pub id: TransactionId,
    pub entity_type: EntityType,
    pub progress: u64,
    pub file_size: u64,
    pub condition_code: ConditionCode,
    pub state: State,
}

/// User hook which receives all indications of the local entity, CCSDS 727.0-B-5 3.4.
///
/// Which indications are actually emitted is controlled by the
/// [IndicationConfig][crate::IndicationConfig] of the local entity, with the exception
/// of the mandatory ones which are always emitted.
pub trait CfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId);
    fn eof_sent_indication(&mut self, id: &TransactionId);
    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams);
    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams);
    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams);
    fn report_indication(&mut self, report: &TransactionReport);
    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode);
    fn resumed_indication(&mut self, id: &TransactionId, progress: u64);
    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );
    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );
    fn eof_recvd_indication(&mut self, id: &TransactionId);
    /// Emitted when the entity dispatcher removes a completed transaction from its
    /// transaction table. Late duplicate PDUs for the transaction are ignored from this
    /// point on.
    fn transaction_disposed_indication(&mut self, id: &TransactionId);
}
