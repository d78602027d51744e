//! # CFDP Destination Entity Module
//!
//! The [DestinationHandler] is the primary component of this module. It models the
//! receiving CFDP entity of a transaction and converts the PDUs sent by a remote source
//! entity back into a file on the local filestore.
//!
//! A transaction is normally started by a Metadata PDU. The handler is lenient about
//! reception order: a File Data or EOF PDU for an unknown transaction also starts a
//! transaction, and the missing metadata is re-requested through the NAK `(0, 0)`
//! segment request convention in acknowledged mode.
//!
//! After the EOF (No Error) PDU was received, the handler verifies the file checksum
//! and completeness. In unacknowledged mode, an incomplete transfer runs the check
//! limit procedure of chapter 4.6.3.3 of the CFDP standard, which allows out-of-order
//! reception of file data and EOF PDUs. In acknowledged mode, the handler issues NAK
//! sequences for all missing file segments and runs the deferred lost segment procedure
//! with the NAK activity timer.
use core::time::Duration;

use crate::checksum::ChecksumRegistry;
use crate::filestore::{execute_filestore_requests, FilestoreError, VirtualFilestore};
use crate::pdu::ack::AckPdu;
use crate::pdu::eof::EofPdu;
use crate::pdu::finished::{DeliveryCode, FileStatus, FinishedPdu};
use crate::pdu::keep_alive::KeepAlivePdu;
use crate::pdu::metadata::MetadataPdu;
use crate::pdu::nak::NakPdu;
use crate::pdu::prompt::{PromptPdu, PromptResponseRequired};
use crate::pdu::tlv::{EntityIdTlv, FilestoreRequestTlv, FilestoreResponseTlv};
use crate::lost_segments::LostSegmentTracker;
use crate::pdu::{
    CfdpPdu, CommonPduConfig, ConditionCode, Direction, FileDirectiveType, PacketTarget, PduBody,
    PduError, PduType, TransactionStatus, TransmissionMode,
};
use crate::time::Countdown;
use crate::user::{
    CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams,
    TransactionReport,
};
use crate::util::UnsignedByteField;
use crate::{
    EntityType, FaultHandlerCode, GenericSendError, LocalEntityConfig, PduSendProvider,
    RemoteConfigStore, RemoteEntityConfig, State, TimerContext, TimerCreator, TransactionId,
    UserFaultHook,
};

/// Transaction steps of the destination entity handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionStep {
    Idle = 0,
    TransactionStart = 1,
    ReceivingFileDataPdus = 2,
    /// EOF was received for an incomplete transfer. The check limit procedure is
    /// running in unacknowledged mode, the deferred lost segment procedure in
    /// acknowledged mode.
    WaitingForMissingData = 3,
    TransferCompletion = 4,
    WaitingForFinishedAck = 6,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DestError {
    #[error("can not process packet type {pdu_type:?} with directive type {directive_type:?}")]
    CantProcessPacketType {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("unexpected PDU")]
    UnexpectedPdu {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("file name in metadata PDU is not valid UTF-8")]
    Utf8,
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("issue sending PDU: {0}")]
    SendError(#[from] GenericSendError),
}

#[derive(Debug)]
struct MetadataParams {
    closure_requested: bool,
    checksum_type: u8,
    file_size: u64,
    src_file_name: String,
    dest_file_name: String,
    fs_requests: Vec<FilestoreRequestTlv>,
}

impl MetadataParams {
    fn is_metadata_only(&self) -> bool {
        self.dest_file_name.is_empty()
    }
}

#[derive(Debug, Copy, Clone)]
struct EofParams {
    checksum: u32,
    file_size: u64,
}

struct TransactionParams<CountdownInstance: Countdown> {
    transaction_id: Option<TransactionId>,
    remote_cfg: Option<RemoteEntityConfig>,
    transmission_mode: Option<TransmissionMode>,
    pdu_conf: CommonPduConfig,
    metadata_params: Option<MetadataParams>,
    eof_params: Option<EofParams>,
    progress: u64,
    file_created: bool,
    lost_segments: LostSegmentTracker,
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
    filestore_responses: Vec<FilestoreResponseTlv>,
    check_timer: Option<CountdownInstance>,
    check_counter: u32,
    nak_activity_timer: Option<CountdownInstance>,
    nak_counter: u32,
    finished_ack_timer: Option<CountdownInstance>,
    finished_ack_counter: u32,
    inactivity_timer: Option<CountdownInstance>,
}

impl<CountdownInstance: Countdown> Default for TransactionParams<CountdownInstance> {
    fn default() -> Self {
        Self {
            transaction_id: None,
            remote_cfg: None,
            transmission_mode: None,
            pdu_conf: CommonPduConfig::default(),
            metadata_params: None,
            eof_params: None,
            progress: 0,
            file_created: false,
            lost_segments: LostSegmentTracker::default(),
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::Unreported,
            filestore_responses: Vec::new(),
            check_timer: None,
            check_counter: 0,
            nak_activity_timer: None,
            nak_counter: 0,
            finished_ack_timer: None,
            finished_ack_counter: 0,
            inactivity_timer: None,
        }
    }
}

impl<CountdownInstance: Countdown> TransactionParams<CountdownInstance> {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn metadata_missing(&self) -> bool {
        self.metadata_params.is_none()
    }

    fn eof_received(&self) -> bool {
        self.eof_params.is_some()
    }

    /// All file data was received and the metadata is known.
    fn file_transfer_complete(&self) -> bool {
        let Some(eof_params) = self.eof_params.as_ref() else {
            return false;
        };
        self.metadata_params.is_some()
            && self.lost_segments.is_empty()
            && self.progress >= eof_params.file_size
    }
}

/// This is the primary CFDP destination handler. It models the CFDP destination entity,
/// which is primarily responsible for receiving files sent from another CFDP source
/// entity.
///
/// The following core function is the primary interface:
///
/// 1. [Self::state_machine] drives the destination handler. It can also be used to
///    insert packets with the appropriate destination ID and target handler type into
///    the handler. Transactions are started leniently by the first Metadata, File Data
///    or EOF PDU received for an unknown transaction.
///
/// This handler does not support concurrency out of the box. The
/// [crate::entity::EntityDispatcher] uses one handler instance per active transaction.
pub struct DestinationHandler<
    PduSenderInstance: PduSendProvider,
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
> {
    local_cfg: LocalEntityConfig<UserFaultHookInstance>,
    pdu_sender: PduSenderInstance,
    remote_cfg_table: RemoteConfigStoreInstance,
    vfs: Vfs,
    checksum_registry: ChecksumRegistry,
    cksum_buffer: Vec<u8>,
    step: TransactionStep,
    state: State,
    tparams: TransactionParams<CountdownInstance>,
    timer_creator: TimerCreatorInstance,
}

impl<
        PduSenderInstance: PduSendProvider,
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
    >
    DestinationHandler<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
    >
{
    /// Creates a new instance of a destination handler.
    ///
    /// The arguments mirror [crate::source::SourceHandler::new].
    pub fn new(
        cfg: LocalEntityConfig<UserFaultHookInstance>,
        pdu_sender: PduSenderInstance,
        vfs: Vfs,
        remote_cfg_table: RemoteConfigStoreInstance,
        checksum_registry: ChecksumRegistry,
        cksum_buf_size: usize,
        timer_creator: TimerCreatorInstance,
    ) -> Self {
        Self {
            local_cfg: cfg,
            pdu_sender,
            remote_cfg_table,
            vfs,
            checksum_registry,
            cksum_buffer: vec![0; cksum_buf_size],
            step: TransactionStep::Idle,
            state: State::Idle,
            tparams: Default::default(),
            timer_creator,
        }
    }

    /// Calls [Self::state_machine], without inserting a packet.
    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<u32, DestError> {
        self.state_machine(cfdp_user, None)
    }

    /// This is the core function to drive the destination handler. It is also used to
    /// insert packets into the destination handler.
    ///
    /// The state machine should either be called if a packet with the appropriate
    /// destination ID is received, or periodically in IDLE periods to perform all CFDP
    /// related tasks, for example checking for timeouts or missed file segments.
    ///
    /// The function returns the number of sent PDU packets on success.
    pub fn state_machine(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        pdu: Option<&CfdpPdu>,
    ) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        if let Some(packet) = pdu {
            sent_packets += self.insert_packet(cfdp_user, packet)?;
        }
        match self.state {
            State::Idle => Ok(sent_packets),
            State::Busy => {
                sent_packets += self.fsm_busy(cfdp_user)?;
                Ok(sent_packets)
            }
            State::Suspended => Ok(sent_packets),
        }
    }

    #[inline]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.tparams.transaction_id
    }

    #[inline]
    pub fn transmission_mode(&self) -> Option<TransmissionMode> {
        self.tparams.transmission_mode
    }

    #[inline]
    pub fn step(&self) -> TransactionStep {
        self.step
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHookInstance> {
        &self.local_cfg
    }

    /// Progress of the file transfer in received bytes.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.tparams.progress
    }

    /// Models the Cancel.request CFDP primitive for the destination entity.
    ///
    /// Returns [true] if the transfer was cancelled properly and [false] if there is no
    /// transaction active or the passed transaction ID does not match the active one.
    pub fn cancel_request(
        &mut self,
        user: &mut impl CfdpUser,
        transaction_id: &TransactionId,
    ) -> Result<bool, DestError> {
        if self.state == State::Idle {
            return Ok(false);
        }
        if let Some(active_id) = self.transaction_id() {
            if active_id == *transaction_id {
                self.notice_of_cancellation(user, ConditionCode::CancelRequestReceived)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Models the Suspend.request CFDP primitive. Returns whether the transaction was
    /// suspended.
    pub fn suspend_request(&mut self, user: &mut impl CfdpUser) -> bool {
        if self.state != State::Busy {
            return false;
        }
        self.notice_of_suspension(user, ConditionCode::SuspendRequestReceived);
        true
    }

    /// Models the Resume.request CFDP primitive. Returns whether the transaction was
    /// resumed.
    pub fn resume_request(&mut self, user: &mut impl CfdpUser) -> bool {
        if self.state != State::Suspended {
            return false;
        }
        self.state = State::Busy;
        if let Some(timer) = self.tparams.check_timer.as_mut() {
            timer.reset();
        }
        if let Some(timer) = self.tparams.nak_activity_timer.as_mut() {
            timer.reset();
        }
        if let Some(timer) = self.tparams.finished_ack_timer.as_mut() {
            timer.reset();
        }
        if let Some(timer) = self.tparams.inactivity_timer.as_mut() {
            timer.reset();
        }
        if self.local_cfg.indication_cfg.resumed {
            user.resumed_indication(&self.transaction_id().unwrap(), self.tparams.progress);
        }
        true
    }

    /// Models the Report.request CFDP primitive. Emits a point-in-time status report
    /// through [CfdpUser::report_indication] without mutating the transaction.
    pub fn report_request(&self, user: &mut impl CfdpUser) {
        let Some(id) = self.transaction_id() else {
            return;
        };
        let file_size = self
            .tparams
            .eof_params
            .as_ref()
            .map(|eof| eof.file_size)
            .or(self.tparams.metadata_params.as_ref().map(|m| m.file_size))
            .unwrap_or_default();
        user.report_indication(&TransactionReport::new(
            id,
            EntityType::Receiving,
            self.tparams.progress,
            file_size,
            self.tparams.condition_code,
            self.state,
        ));
    }

    /// See [crate::source::SourceHandler::reset]. Resetting the handler by hand is
    /// explicitely discouraged.
    pub fn reset(&mut self) {
        self.step = TransactionStep::Idle;
        self.state = State::Idle;
        self.tparams.reset();
    }

    fn insert_packet(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, DestError> {
        if packet.packet_target() != PacketTarget::DestEntity {
            return Err(DestError::CantProcessPacketType {
                pdu_type: packet.pdu_type(),
                directive_type: packet.file_directive_type(),
            });
        }
        if let Some(timer) = self.tparams.inactivity_timer.as_mut() {
            timer.reset();
        }
        match packet.body() {
            PduBody::Metadata(_) => self.handle_metadata_pdu(user, packet),
            PduBody::FileData(_) => self.handle_file_data_pdu(user, packet),
            PduBody::Eof(_) => self.handle_eof_pdu(user, packet),
            PduBody::Prompt(prompt_pdu) => self.handle_prompt_pdu(*prompt_pdu),
            PduBody::Ack(ack_pdu) => self.handle_ack_pdu(user, ack_pdu),
            _ => Err(DestError::CantProcessPacketType {
                pdu_type: packet.pdu_type(),
                directive_type: packet.file_directive_type(),
            }),
        }
    }

    /// Common transaction start for the first PDU of an unknown transaction.
    fn start_transaction(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<(), DestError> {
        let source_id = packet.source_id();
        let Some(remote_cfg) = self.remote_cfg_table.get(source_id.value()) else {
            return Err(DestError::NoRemoteCfgFound(source_id));
        };
        self.tparams.remote_cfg = Some(*remote_cfg);
        let mut pdu_conf = *packet.pdu_header().common_pdu_conf();
        pdu_conf.direction = Direction::TowardsSender;
        self.tparams.pdu_conf = pdu_conf;
        let transaction_id = TransactionId::new(source_id, packet.transaction_seq_num());
        self.tparams.transaction_id = Some(transaction_id);
        self.tparams.transmission_mode = Some(packet.transmission_mode());
        self.state = State::Busy;
        self.step = TransactionStep::ReceivingFileDataPdus;
        if packet.transmission_mode() == TransmissionMode::Acknowledged {
            self.tparams.inactivity_timer =
                Some(
                    self.timer_creator
                        .create_countdown(TimerContext::Inactivity {
                            expiry_time: Duration::from_secs_f32(
                                self.tparams
                                    .remote_cfg
                                    .as_ref()
                                    .unwrap()
                                    .transaction_inactivity_limit_seconds,
                            ),
                        }),
                );
        }
        user.transaction_indication(&transaction_id);
        Ok(())
    }

    fn handle_metadata_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, DestError> {
        let PduBody::Metadata(metadata_pdu) = packet.body() else {
            unreachable!();
        };
        if self.state == State::Idle {
            self.start_transaction(user, packet)?;
        } else if !self.tparams.metadata_missing() {
            // Duplicate metadata, drop it.
            return Ok(0);
        }
        let metadata_arrived_late = self.tparams.progress > 0;
        let params = self.metadata_params_from_pdu(metadata_pdu)?;
        if !params.is_metadata_only() {
            if self.vfs.exists(&params.dest_file_name)? {
                self.vfs.truncate_file(&params.dest_file_name)?;
            } else {
                self.vfs.create_file(&params.dest_file_name)?;
            }
            self.tparams.file_created = true;
            self.tparams.file_status = FileStatus::Retained;
        }
        // File data received before the metadata was dropped, re-request it.
        if metadata_arrived_late {
            self.tparams
                .lost_segments
                .add_lost_segment((0, self.tparams.progress))
                .ok();
            self.tparams.lost_segments.coalesce_lost_segments();
            self.tparams.progress = 0;
        }
        let msgs_to_user = metadata_pdu.msgs_to_user()?;
        user.metadata_recvd_indication(&MetadataReceivedParams::new(
            self.transaction_id().unwrap(),
            packet.source_id(),
            params.file_size,
            params.src_file_name.clone(),
            params.dest_file_name.clone(),
            msgs_to_user,
        ));
        let metadata_only = params.is_metadata_only();
        self.tparams.metadata_params = Some(params);
        if metadata_only {
            self.tparams.delivery_code = DeliveryCode::Complete;
            self.step = TransactionStep::TransferCompletion;
        }
        Ok(0)
    }

    fn metadata_params_from_pdu(
        &self,
        metadata_pdu: &MetadataPdu,
    ) -> Result<MetadataParams, DestError> {
        let (src_file_name, dest_file_name) = if metadata_pdu.is_metadata_only() {
            (String::new(), String::new())
        } else {
            (
                metadata_pdu
                    .src_file_name
                    .as_str()
                    .map_err(|_| DestError::Utf8)?
                    .to_string(),
                metadata_pdu
                    .dest_file_name
                    .as_str()
                    .map_err(|_| DestError::Utf8)?
                    .to_string(),
            )
        };
        Ok(MetadataParams {
            closure_requested: metadata_pdu.closure_requested,
            checksum_type: metadata_pdu.checksum_type,
            file_size: metadata_pdu.file_size,
            src_file_name,
            dest_file_name,
            fs_requests: metadata_pdu.filestore_requests()?,
        })
    }

    fn handle_file_data_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, DestError> {
        let PduBody::FileData(file_data_pdu) = packet.body() else {
            unreachable!();
        };
        if self.state == State::Idle {
            // Metadata was lost, start the transaction leniently.
            self.start_transaction(user, packet)?;
        }
        if self.step != TransactionStep::ReceivingFileDataPdus
            && self.step != TransactionStep::WaitingForMissingData
        {
            return Err(DestError::UnexpectedPdu {
                pdu_type: PduType::FileData,
                directive_type: None,
            });
        }
        let offset = file_data_pdu.offset;
        // A hostile offset near the FSS maximum would wrap the segment end.
        let Some(end) = offset.checked_add(file_data_pdu.file_data.len() as u64) else {
            return self.declare_fault(user, ConditionCode::FileSizeError);
        };
        let mut sent_packets = 0;
        if self.tparams.metadata_missing() {
            // Without the metadata there is no destination file to write to. Only track
            // the reception progress, the data is re-requested with the metadata.
            self.tparams.progress = self.tparams.progress.max(end);
            return Ok(0);
        }
        if offset > self.tparams.progress {
            self.tparams
                .lost_segments
                .add_lost_segment((self.tparams.progress, offset))
                .ok();
            self.tparams.lost_segments.coalesce_lost_segments();
            if self.transmission_mode() == Some(TransmissionMode::Acknowledged)
                && self
                    .tparams
                    .remote_cfg
                    .as_ref()
                    .is_some_and(|cfg| cfg.immediate_nak_mode)
                && self.step == TransactionStep::ReceivingFileDataPdus
            {
                sent_packets += self.send_nak_sequence()?;
            }
        } else {
            // Possibly a retransmitted segment filling a tracked hole. Overlaps with
            // already received data are not an error, the write below is idempotent.
            self.tparams.lost_segments.remove_lost_segment((offset, end)).ok();
        }
        let dest_file = self
            .tparams
            .metadata_params
            .as_ref()
            .unwrap()
            .dest_file_name
            .clone();
        if let Err(_error) = self.vfs.write_data(&dest_file, offset, &file_data_pdu.file_data) {
            self.tparams.file_status = FileStatus::DiscardedFilestoreRejection;
            sent_packets += self.declare_fault(user, ConditionCode::FilestoreRejection)?;
            return Ok(sent_packets);
        }
        self.tparams.progress = self.tparams.progress.max(end);
        if self.local_cfg.indication_cfg.file_segment_recv {
            user.file_segment_recvd_indication(&FileSegmentRecvdParams::new(
                self.transaction_id().unwrap(),
                offset,
                file_data_pdu.file_data.len(),
                file_data_pdu.segment_metadata.clone(),
            ));
        }
        Ok(sent_packets)
    }

    fn handle_eof_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, DestError> {
        let PduBody::Eof(eof_pdu) = packet.body() else {
            unreachable!();
        };
        if self.state == State::Idle {
            self.start_transaction(user, packet)?;
        }
        let mut sent_packets = 0;
        if self.transmission_mode() == Some(TransmissionMode::Acknowledged) {
            sent_packets += self.send_eof_ack(eof_pdu)?;
        }
        if self.step != TransactionStep::ReceivingFileDataPdus
            && self.step != TransactionStep::WaitingForMissingData
        {
            // Duplicate EOF for a transfer already past completion, only re-acknowledge.
            return Ok(sent_packets);
        }
        if self.local_cfg.indication_cfg.eof_recv {
            user.eof_recvd_indication(&self.transaction_id().unwrap());
        }
        if eof_pdu.condition_code != ConditionCode::NoError {
            // Notice of cancellation at the sender. Terminate the transaction with the
            // condition code from the EOF (cancel) PDU.
            self.tparams.condition_code = eof_pdu.condition_code;
            self.tparams.delivery_code = DeliveryCode::Incomplete;
            self.dispose_incomplete_file_on_cancellation()?;
            self.step = TransactionStep::TransferCompletion;
            return Ok(sent_packets);
        }
        self.tparams.eof_params = Some(EofParams {
            checksum: eof_pdu.file_checksum,
            file_size: eof_pdu.file_size,
        });
        if self.tparams.progress > eof_pdu.file_size {
            sent_packets += self.declare_fault(user, ConditionCode::FileSizeError)?;
            return Ok(sent_packets);
        }
        if self
            .tparams
            .metadata_params
            .as_ref()
            .is_some_and(|m| !m.is_metadata_only() && m.file_size != eof_pdu.file_size)
        {
            sent_packets += self.declare_fault(user, ConditionCode::FileSizeError)?;
            return Ok(sent_packets);
        }
        if self.tparams.file_transfer_complete() {
            self.step = TransactionStep::TransferCompletion;
            return Ok(sent_packets);
        }
        // Transfer is not complete yet, file data PDUs might still be in transit.
        self.step = TransactionStep::WaitingForMissingData;
        if self.transmission_mode() == Some(TransmissionMode::Unacknowledged) {
            self.tparams.check_timer =
                Some(
                    self.timer_creator
                        .create_countdown(TimerContext::CheckLimit {
                            local_id: self.local_cfg.id,
                            remote_id: packet.source_id(),
                            entity_type: EntityType::Receiving,
                        }),
                );
            self.tparams.check_counter = 0;
        } else {
            // Deferred lost segment procedure, chapter 4.6.4.7.
            sent_packets += self.send_nak_sequence()?;
            self.start_nak_activity_timer();
            self.tparams.nak_counter = 0;
        }
        Ok(sent_packets)
    }

    fn handle_prompt_pdu(&mut self, prompt_pdu: PromptPdu) -> Result<u32, DestError> {
        if self.state == State::Idle
            || self.transmission_mode() != Some(TransmissionMode::Acknowledged)
        {
            return Ok(0);
        }
        match prompt_pdu.response_required {
            PromptResponseRequired::Nak => self.send_nak_sequence(),
            PromptResponseRequired::KeepAlive => {
                let keep_alive = CfdpPdu::new_file_directive(
                    self.tparams.pdu_conf,
                    PduBody::KeepAlive(KeepAlivePdu::new(self.tparams.progress)),
                );
                self.pdu_send_helper(&keep_alive)?;
                Ok(1)
            }
        }
    }

    fn handle_ack_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        ack_pdu: &AckPdu,
    ) -> Result<u32, DestError> {
        if self.step != TransactionStep::WaitingForFinishedAck
            || ack_pdu.acked_directive != FileDirectiveType::FinishedPdu
        {
            return Err(DestError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::AckPdu),
            });
        }
        self.notice_of_completion(user);
        self.reset();
        Ok(0)
    }

    fn fsm_busy(&mut self, user: &mut impl CfdpUser) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        if self.step == TransactionStep::WaitingForMissingData {
            sent_packets += self.handle_waiting_for_missing_data(user)?;
        }
        if self.step == TransactionStep::TransferCompletion {
            sent_packets += self.transfer_completion(user)?;
        }
        if self.step == TransactionStep::WaitingForFinishedAck {
            sent_packets += self.handle_finished_ack_procedures(user)?;
        }
        if self.state == State::Busy {
            sent_packets += self.handle_inactivity(user)?;
        }
        Ok(sent_packets)
    }

    fn handle_waiting_for_missing_data(
        &mut self,
        user: &mut impl CfdpUser,
    ) -> Result<u32, DestError> {
        if self.tparams.file_transfer_complete() {
            self.step = TransactionStep::TransferCompletion;
            return Ok(0);
        }
        let mut sent_packets = 0;
        if self.transmission_mode() == Some(TransmissionMode::Unacknowledged) {
            let expired = self
                .tparams
                .check_timer
                .as_ref()
                .is_some_and(|timer| timer.has_expired());
            if !expired {
                return Ok(0);
            }
            self.tparams.check_counter += 1;
            if self.tparams.check_counter
                >= self.tparams.remote_cfg.as_ref().unwrap().check_limit
            {
                sent_packets += self.declare_fault(user, ConditionCode::CheckLimitReached)?;
            } else if let Some(timer) = self.tparams.check_timer.as_mut() {
                timer.reset();
            }
        } else {
            let expired = self
                .tparams
                .nak_activity_timer
                .as_ref()
                .is_some_and(|timer| timer.has_expired());
            if !expired {
                return Ok(0);
            }
            self.tparams.nak_counter += 1;
            if self.tparams.nak_counter
                >= self
                    .tparams
                    .remote_cfg
                    .as_ref()
                    .unwrap()
                    .nak_timer_expiration_limit
            {
                sent_packets += self.declare_fault(user, ConditionCode::NakLimitReached)?;
            } else {
                sent_packets += self.send_nak_sequence()?;
                if let Some(timer) = self.tparams.nak_activity_timer.as_mut() {
                    timer.reset();
                }
            }
        }
        Ok(sent_packets)
    }

    fn handle_finished_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
    ) -> Result<u32, DestError> {
        let expired = self
            .tparams
            .finished_ack_timer
            .as_ref()
            .is_some_and(|timer| timer.has_expired());
        if !expired {
            return Ok(0);
        }
        let mut sent_packets = 0;
        self.tparams.finished_ack_counter += 1;
        if self.tparams.finished_ack_counter
            >= self
                .tparams
                .remote_cfg
                .as_ref()
                .unwrap()
                .positive_ack_timer_expiration_limit
        {
            sent_packets += self.declare_fault(user, ConditionCode::PositiveAckLimitReached)?;
        } else {
            sent_packets += self.send_finished_pdu()?;
            if let Some(timer) = self.tparams.finished_ack_timer.as_mut() {
                timer.reset();
            }
        }
        Ok(sent_packets)
    }

    fn handle_inactivity(&mut self, user: &mut impl CfdpUser) -> Result<u32, DestError> {
        let expired = self
            .tparams
            .inactivity_timer
            .as_ref()
            .is_some_and(|timer| timer.has_expired());
        if !expired {
            return Ok(0);
        }
        let sent_packets = self.declare_fault(user, ConditionCode::InactivityDetected)?;
        if let Some(timer) = self.tparams.inactivity_timer.as_mut() {
            timer.reset();
        }
        Ok(sent_packets)
    }

    fn transfer_completion(&mut self, user: &mut impl CfdpUser) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        if self.tparams.condition_code == ConditionCode::NoError {
            if self.tparams.file_transfer_complete() {
                self.tparams.delivery_code = DeliveryCode::Complete;
                if !self.checksum_check(user, &mut sent_packets)? {
                    // The fault handler decided how to continue, the condition code and
                    // step were already updated.
                    if self.state == State::Idle
                        || self.step != TransactionStep::TransferCompletion
                    {
                        return Ok(sent_packets);
                    }
                }
            }
            let fs_requests = self
                .tparams
                .metadata_params
                .as_mut()
                .map(|m| core::mem::take(&mut m.fs_requests))
                .unwrap_or_default();
            if !fs_requests.is_empty() {
                self.tparams.filestore_responses =
                    execute_filestore_requests(&self.vfs, &fs_requests);
            }
        }
        let closure_requested = self
            .tparams
            .metadata_params
            .as_ref()
            .map(|m| m.closure_requested)
            .unwrap_or_default();
        if self.transmission_mode() == Some(TransmissionMode::Acknowledged) {
            sent_packets += self.send_finished_pdu()?;
            self.step = TransactionStep::WaitingForFinishedAck;
            self.start_finished_ack_timer();
            self.tparams.finished_ack_counter = 0;
        } else {
            if closure_requested {
                sent_packets += self.send_finished_pdu()?;
            }
            self.notice_of_completion(user);
            self.reset();
        }
        Ok(sent_packets)
    }

    /// Returns whether the file was accepted. On checksum failure, the fault handler
    /// decides how the transaction continues.
    fn checksum_check(
        &mut self,
        user: &mut impl CfdpUser,
        sent_packets: &mut u32,
    ) -> Result<bool, DestError> {
        let Some(eof_params) = self.tparams.eof_params else {
            return Ok(true);
        };
        let metadata = self.tparams.metadata_params.as_ref().unwrap();
        if metadata.is_metadata_only() {
            return Ok(true);
        }
        let dest_file = metadata.dest_file_name.clone();
        let checksum_type = metadata.checksum_type;
        if !self.checksum_registry.supports(checksum_type) {
            *sent_packets +=
                self.declare_fault(user, ConditionCode::UnsupportedChecksumType)?;
            return Ok(false);
        }
        let checksum_success = self.vfs.checksum_verify(
            eof_params.checksum,
            &dest_file,
            checksum_type,
            &self.checksum_registry,
            eof_params.file_size,
            &mut self.cksum_buffer,
        )?;
        if !checksum_success {
            self.tparams.condition_code = ConditionCode::FileChecksumFailure;
            *sent_packets += self.declare_fault(user, ConditionCode::FileChecksumFailure)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn notice_of_completion(&mut self, user: &mut impl CfdpUser) {
        if self.local_cfg.indication_cfg.transaction_finished {
            user.transaction_finished_indication(&TransactionFinishedParams::new(
                self.transaction_id().unwrap(),
                self.tparams.condition_code,
                self.tparams.delivery_code,
                self.tparams.file_status,
            ));
        }
    }

    fn notice_of_cancellation(
        &mut self,
        user: &mut impl CfdpUser,
        condition_code: ConditionCode,
    ) -> Result<u32, DestError> {
        self.tparams.condition_code = condition_code;
        self.tparams.delivery_code = DeliveryCode::Incomplete;
        self.dispose_incomplete_file_on_cancellation()?;
        let mut sent_packets = 0;
        if self.transmission_mode() == Some(TransmissionMode::Acknowledged) {
            sent_packets += self.send_finished_pdu()?;
            self.step = TransactionStep::WaitingForFinishedAck;
            self.start_finished_ack_timer();
            self.tparams.finished_ack_counter = 0;
        } else {
            let closure_requested = self
                .tparams
                .metadata_params
                .as_ref()
                .map(|m| m.closure_requested)
                .unwrap_or_default();
            if closure_requested {
                sent_packets += self.send_finished_pdu()?;
            }
            self.notice_of_completion(user);
            self.reset();
        }
        Ok(sent_packets)
    }

    fn notice_of_suspension(&mut self, user: &mut impl CfdpUser, condition_code: ConditionCode) {
        self.state = State::Suspended;
        if self.local_cfg.indication_cfg.suspended {
            user.suspended_indication(&self.transaction_id().unwrap(), condition_code);
        }
    }

    fn dispose_incomplete_file_on_cancellation(&mut self) -> Result<(), DestError> {
        let dispose = self
            .tparams
            .remote_cfg
            .as_ref()
            .is_some_and(|cfg| cfg.disposition_on_cancellation);
        if !dispose || !self.tparams.file_created {
            return Ok(());
        }
        let dest_file = self
            .tparams
            .metadata_params
            .as_ref()
            .unwrap()
            .dest_file_name
            .clone();
        self.vfs.remove_file(&dest_file)?;
        self.tparams.file_created = false;
        self.tparams.file_status = FileStatus::DiscardDeliberately;
        Ok(())
    }

    fn declare_fault(
        &mut self,
        user: &mut impl CfdpUser,
        cond: ConditionCode,
    ) -> Result<u32, DestError> {
        let fh_code = self.local_cfg.fault_handler.get_fault_handler(cond);
        let transaction_id = self.transaction_id().unwrap();
        let progress = self.tparams.progress;
        let mut sent_packets = 0;
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                sent_packets += self.notice_of_cancellation(user, cond)?;
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.notice_of_suspension(user, cond);
            }
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::AbandonTransaction => {
                self.reset();
            }
        }
        self.local_cfg.fault_handler.report_fault_with_code(
            fh_code,
            transaction_id,
            cond,
            progress,
        );
        if fh_code == FaultHandlerCode::AbandonTransaction {
            user.abandoned_indication(&transaction_id, cond, progress);
        } else {
            user.fault_indication(&transaction_id, cond, progress);
        }
        Ok(sent_packets)
    }

    fn send_eof_ack(&mut self, eof_pdu: &EofPdu) -> Result<u32, DestError> {
        let ack_pdu = CfdpPdu::new_file_directive(
            self.tparams.pdu_conf,
            PduBody::Ack(AckPdu::new_for_eof(
                eof_pdu.condition_code,
                TransactionStatus::Active,
            )),
        );
        self.pdu_send_helper(&ack_pdu)?;
        Ok(1)
    }

    fn send_nak_sequence(&mut self) -> Result<u32, DestError> {
        let largest_lost_end = self
            .tparams
            .lost_segments
            .iter()
            .last()
            .map_or(0, |segment| segment.1);
        let end_of_scope = self
            .tparams
            .eof_params
            .as_ref()
            .map(|eof| eof.file_size)
            .unwrap_or(self.tparams.progress.max(largest_lost_end));
        let max_requests = NakPdu::max_segment_requests(
            self.tparams.pdu_conf.file_flag,
            self.tparams
                .remote_cfg
                .as_ref()
                .map_or(1024, |cfg| cfg.max_packet_len),
        );
        let segment_requests = if self.tparams.metadata_missing() {
            // Everything received so far was dropped, request the metadata and the
            // whole scope again.
            let mut requests = crate::pdu::nak::SegmentRequests::new();
            requests.push((0, 0));
            if end_of_scope > 0 {
                requests.push((0, end_of_scope));
            }
            requests
        } else {
            self.tparams
                .lost_segments
                .segment_requests(false, max_requests)
        };
        if segment_requests.is_empty() {
            return Ok(0);
        }
        let nak_pdu = CfdpPdu::new_file_directive(
            self.tparams.pdu_conf,
            PduBody::Nak(NakPdu::new(0, end_of_scope, segment_requests)),
        );
        self.pdu_send_helper(&nak_pdu)?;
        Ok(1)
    }

    fn send_finished_pdu(&mut self) -> Result<u32, DestError> {
        let mut finished_pdu = FinishedPdu::new_default(
            self.tparams.condition_code,
            self.tparams.delivery_code,
            self.tparams.file_status,
        );
        finished_pdu.filestore_responses = self.tparams.filestore_responses.clone();
        if self.tparams.condition_code != ConditionCode::NoError {
            finished_pdu.fault_location = Some(EntityIdTlv::new(self.local_cfg.id));
        }
        let pdu = CfdpPdu::new_file_directive(
            self.tparams.pdu_conf,
            PduBody::Finished(finished_pdu),
        );
        self.pdu_send_helper(&pdu)?;
        Ok(1)
    }

    fn start_nak_activity_timer(&mut self) {
        self.tparams.nak_activity_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::NakActivity {
                    expiry_time: Duration::from_secs_f32(
                        self.tparams
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .nak_timer_interval_seconds,
                    ),
                }),
        );
    }

    fn start_finished_ack_timer(&mut self) {
        self.tparams.finished_ack_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::PositiveAck {
                    expiry_time: Duration::from_secs_f32(
                        self.tparams
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .positive_ack_timer_interval_seconds,
                    ),
                }),
        );
    }

    fn pdu_send_helper(&self, pdu: &CfdpPdu) -> Result<(), DestError> {
        let raw_pdu = pdu.to_vec()?;
        self.pdu_sender
            .send_pdu(pdu.pdu_type(), pdu.file_directive_type(), &raw_pdu)?;
        Ok(())
    }
}
