//! Application facing request types consumed by the entity dispatcher.
use crate::pdu::tlv::{FilestoreRequestTlv, MsgToUserTlv, Tlv};
use crate::pdu::{ConditionCode, SegmentationControl, TransmissionMode};
use crate::util::UnsignedByteField;
use crate::{FaultHandlerCode, TransactionId};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[error("file path with length {0} larger than maximum of 255 bytes")]
pub struct FilePathTooLarge(pub usize);

/// A CFDP Put request as specified in CCSDS 727.0-B-5 3.4.1.
///
/// Optional override fields which are [None] are resolved against the remote entity
/// configuration when the transaction starts. A request without a source and
/// destination file is a metadata-only transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PutRequest {
    pub destination_id: UnsignedByteField,
    source_file: Option<String>,
    dest_file: Option<String>,
    pub trans_mode: Option<TransmissionMode>,
    pub closure_requested: Option<bool>,
    pub seg_ctrl: Option<SegmentationControl>,
    pub msgs_to_user: Vec<MsgToUserTlv>,
    pub fault_handler_overrides: Vec<(ConditionCode, FaultHandlerCode)>,
    pub flow_label: Option<Tlv>,
    pub fs_requests: Vec<FilestoreRequestTlv>,
}

impl PutRequest {
    pub fn new(
        destination_id: impl Into<UnsignedByteField>,
        source_file: Option<&str>,
        dest_file: Option<&str>,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(source_file, dest_file)?;
        Ok(Self {
            destination_id: destination_id.into(),
            source_file: source_file.map(str::to_string),
            dest_file: dest_file.map(str::to_string),
            trans_mode: None,
            closure_requested: None,
            seg_ctrl: None,
            msgs_to_user: Vec::new(),
            fault_handler_overrides: Vec::new(),
            flow_label: None,
            fs_requests: Vec::new(),
        })
    }

    /// Helper for the most common case: copy one file to the remote entity.
    pub fn new_regular_request(
        destination_id: impl Into<UnsignedByteField>,
        source_file: &str,
        dest_file: &str,
    ) -> Result<Self, FilePathTooLarge> {
        Self::new(destination_id, Some(source_file), Some(dest_file))
    }

    /// A metadata-only request without file transfer, for example to only deliver
    /// messages to user or filestore requests.
    pub fn new_metadata_only(destination_id: impl Into<UnsignedByteField>) -> Self {
        // unwrap okay, empty paths can not exceed the length limit.
        Self::new(destination_id, None, None).unwrap()
    }

    #[inline]
    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    #[inline]
    pub fn dest_file(&self) -> Option<&str> {
        self.dest_file.as_deref()
    }

    #[inline]
    pub fn is_metadata_only(&self) -> bool {
        self.source_file.is_none() && self.dest_file.is_none()
    }

    pub fn with_trans_mode(mut self, trans_mode: TransmissionMode) -> Self {
        self.trans_mode = Some(trans_mode);
        self
    }

    pub fn with_closure_requested(mut self, closure_requested: bool) -> Self {
        self.closure_requested = Some(closure_requested);
        self
    }
}

pub(crate) fn generic_path_checks(
    source_file: Option<&str>,
    dest_file: Option<&str>,
) -> Result<(), FilePathTooLarge> {
    if let Some(source_file) = source_file {
        if source_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(source_file.len()));
        }
    }
    if let Some(dest_file) = dest_file {
        if dest_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(dest_file.len()));
        }
    }
    Ok(())
}

/// Operator requests targeting an already running transaction, routed through the
/// entity dispatcher.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperatorRequest {
    /// Produce a point-in-time status report indication without mutating the
    /// transaction.
    Report(TransactionId),
    Suspend(TransactionId),
    Resume(TransactionId),
    Cancel(TransactionId),
    /// Prompt the remote receiver to emit its NAK sequence immediately. Sender side
    /// transactions in acknowledged mode only.
    PromptNak(TransactionId),
    /// Prompt the remote receiver to report its progress with a Keep Alive PDU.
    PromptKeepAlive(TransactionId),
}

impl OperatorRequest {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Report(id)
            | Self::Suspend(id)
            | Self::Resume(id)
            | Self::Cancel(id)
            | Self::PromptNak(id)
            | Self::PromptKeepAlive(id) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_put_request() {
        let request = PutRequest::new_regular_request(2u8, "/tmp/source.txt", "/tmp/dest.txt")
            .expect("creating put request failed");
        assert_eq!(request.destination_id.value(), 2);
        assert_eq!(request.source_file(), Some("/tmp/source.txt"));
        assert_eq!(request.dest_file(), Some("/tmp/dest.txt"));
        assert!(!request.is_metadata_only());
        assert!(request.trans_mode.is_none());
        assert!(request.closure_requested.is_none());
    }

    #[test]
    fn test_metadata_only_request() {
        let request = PutRequest::new_metadata_only(2u8);
        assert!(request.is_metadata_only());
    }

    #[test]
    fn test_path_too_large() {
        let long_path = "a".repeat(256);
        assert_eq!(
            PutRequest::new_regular_request(2u8, &long_path, "dest.txt").unwrap_err(),
            FilePathTooLarge(256)
        );
    }

    #[test]
    fn test_builder_overrides() {
        let request = PutRequest::new_regular_request(2u8, "a.txt", "b.txt")
            .unwrap()
            .with_trans_mode(TransmissionMode::Acknowledged)
            .with_closure_requested(true);
        assert_eq!(request.trans_mode, Some(TransmissionMode::Acknowledged));
        assert_eq!(request.closure_requested, Some(true));
    }

    #[test]
    fn test_operator_request_id_access() {
        let id = TransactionId::new(
            UnsignedByteField::new(1, 1),
            UnsignedByteField::new(2, 10),
        );
        for request in [
            OperatorRequest::Report(id),
            OperatorRequest::Suspend(id),
            OperatorRequest::Resume(id),
            OperatorRequest::Cancel(id),
            OperatorRequest::PromptNak(id),
            OperatorRequest::PromptKeepAlive(id),
        ] {
            assert_eq!(request.transaction_id(), &id);
        }
    }
}
