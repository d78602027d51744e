//! # CFDP Source Entity Module
//!
//! The [SourceHandler] is the primary component of this module which converts a
//! [PutRequest] into all packet data units (PDUs) which need to be sent to a remote
//! CFDP entity to perform a File Copy operation.
//!
//! The source entity allows freedom of communication by using a user-provided
//! [PduSendProvider] instance to send all generated PDUs. It should be noted that for
//! regular file transfers, each [SourceHandler::state_machine] call will map to one
//! generated file data PDU. This allows flow control for the user of the state machine.
//!
//! The [SourceHandler::state_machine] will generally perform the following steps after
//! a valid put request was received through the [SourceHandler::put_request] method:
//!
//! 1. Generate the Metadata PDU to be sent to a remote CFDP entity.
//! 2. Generate all File Data PDUs to be sent to a remote CFDP entity if applicable
//!    (file not empty).
//! 3. Generate an EOF PDU to be sent to a remote CFDP entity.
//!
//! If this is an unacknowledged transfer with no transaction closure, the file transfer
//! will be done after these steps. In any other case:
//!
//! ### Unacknowledged transfer with requested closure
//!
//! 4. A Finished PDU will be awaited while the check limit timer is running.
//!
//! ### Acknowledged transfer
//!
//! 4. An ACK of the EOF PDU will be awaited while the positive ACK procedures of
//!    chapter 4.7 of the CFDP standard are running. NAK PDUs received during this
//!    period trigger the retransmission of the requested file segments.
//! 5. A Finished PDU will be awaited.
//! 6. An ACK of the Finished PDU will be generated to be sent to the remote CFDP
//!    entity.
use core::cell::{Cell, RefCell};
use core::ops::ControlFlow;
use core::time::Duration;

use crate::checksum::ChecksumRegistry;
use crate::filestore::{FilestoreError, VirtualFilestore};
use crate::pdu::ack::AckPdu;
use crate::pdu::eof::EofPdu;
use crate::pdu::file_data::FileDataPdu;
use crate::pdu::finished::{DeliveryCode, FileStatus, FinishedPdu};
use crate::pdu::keep_alive::KeepAlivePdu;
use crate::pdu::lv::Lv;
use crate::pdu::metadata::MetadataPdu;
use crate::pdu::nak::NakPdu;
use crate::pdu::prompt::{PromptPdu, PromptResponseRequired};
use crate::pdu::tlv::{EntityIdTlv, Tlv};
use crate::pdu::{
    fss_len, CfdpPdu, CommonPduConfig, ConditionCode, CrcFlag, Direction, FileDirectiveType,
    LargeFileFlag, PacketTarget, PduBody, PduError, PduHeader, PduType, SegmentMetadataFlag,
    SegmentationControl, TransactionStatus, TransmissionMode,
};
use crate::request::PutRequest;
use crate::segment::FileSegmenter;
use crate::time::Countdown;
use crate::user::{CfdpUser, TransactionFinishedParams, TransactionReport};
use crate::util::UnsignedByteField;
use crate::{
    EntityType, FaultHandlerCode, GenericSendError, LocalEntityConfig, PduSendProvider,
    RemoteConfigStore, RemoteEntityConfig, State, TimerContext, TimerCreator, TransactionId,
    UserFaultHook,
};

/// This enumeration models the different transaction steps of the source entity handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionStep {
    Idle = 0,
    TransactionStart = 1,
    SendingMetadata = 3,
    SendingFileData = 4,
    /// Re-transmitting missing packets in acknowledged mode
    Retransmitting = 5,
    SendingEof = 6,
    WaitingForEofAck = 7,
    WaitingForFinished = 8,
    NoticeOfCompletion = 10,
}

#[derive(Default, Debug)]
struct FileParams {
    segmenter: Option<FileSegmenter>,
    metadata_only: bool,
    /// The checksum is cached to avoid expensive re-calculation when the EOF PDU needs
    /// to be re-sent.
    checksum_completed_file: Cell<Option<u32>>,
}

impl FileParams {
    fn progress(&self) -> u64 {
        self.segmenter.as_ref().map_or(0, FileSegmenter::progress)
    }

    fn file_size(&self) -> u64 {
        self.segmenter.as_ref().map_or(0, FileSegmenter::file_size)
    }
}

// Explicit choice to put all simple internal fields into Cells.
// I think this is more efficient than wrapping the whole helper into a RefCell,
// especially because some of the individual fields are used frequently.
struct StateHelper {
    step: Cell<TransactionStep>,
    state: Cell<State>,
}

impl Default for StateHelper {
    fn default() -> Self {
        Self {
            state: Cell::new(State::Idle),
            step: Cell::new(TransactionStep::Idle),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct FinishedParams {
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
}

#[derive(Debug, Copy, Clone, Default)]
struct PositiveAckParams {
    ack_counter: u32,
    positive_ack_of_cancellation: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnomalyTracker {
    pub invalid_ack_directive_code: u8,
}

#[derive(Debug, Default, PartialEq, Eq)]
enum FsmContext {
    #[default]
    None,
    ResetWhenPossible,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SourceError {
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
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("invalid NAK PDU received")]
    InvalidNakPdu,
    #[error("maximum packet length too small to hold file data PDUs")]
    MaxPacketLenTooSmall,
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("issue sending PDU: {0}")]
    SendError(#[from] GenericSendError),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PutRequestError {
    #[error("already busy with put request")]
    AlreadyBusy,
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
    #[error("source file does not exist")]
    FileDoesNotExist,
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
}

struct TransactionParams<CountdownInstance: Countdown> {
    put_request: Option<PutRequest>,
    transaction_id: Option<TransactionId>,
    remote_cfg: Option<RemoteEntityConfig>,
    transmission_mode: Option<TransmissionMode>,
    closure_requested: bool,
    seg_ctrl: SegmentationControl,
    cond_code_eof: Cell<Option<ConditionCode>>,
    finished_params: Option<FinishedParams>,
    // File specific transfer fields
    file_params: FileParams,
    // PDU configuration is cached so it can be re-used for all PDUs generated for file
    // transfers.
    pdu_conf: CommonPduConfig,
    check_timer: Option<CountdownInstance>,
    inactivity_timer: RefCell<Option<CountdownInstance>>,
    positive_ack_params: Cell<Option<PositiveAckParams>>,
    ack_timer: RefCell<Option<CountdownInstance>>,
    last_keep_alive_progress: Cell<Option<u64>>,
}

impl<CountdownInstance: Countdown> Default for TransactionParams<CountdownInstance> {
    fn default() -> Self {
        Self {
            put_request: None,
            transaction_id: None,
            remote_cfg: None,
            transmission_mode: None,
            closure_requested: false,
            seg_ctrl: SegmentationControl::default(),
            cond_code_eof: Cell::new(None),
            finished_params: None,
            file_params: FileParams::default(),
            pdu_conf: CommonPduConfig::default(),
            check_timer: None,
            inactivity_timer: RefCell::new(None),
            positive_ack_params: Cell::new(None),
            ack_timer: RefCell::new(None),
            last_keep_alive_progress: Cell::new(None),
        }
    }
}

impl<CountdownInstance: Countdown> TransactionParams<CountdownInstance> {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// This is the primary CFDP source handler. It models the CFDP source entity, which is
/// primarily responsible for handling put requests to send files to another CFDP
/// destination entity.
///
/// As such, it contains a state machine to perform all operations necessary to perform
/// a source-to-destination file transfer. This class uses the user provided
/// [PduSendProvider] to send the CFDP PDU packets generated by the state machine.
///
/// The following core functions are the primary interface:
///
/// 1. [Self::put_request] can be used to start a transaction and perform a Copy File
///    procedure to send a file or to send a metadata only transaction.
/// 2. [Self::state_machine] is the primary interface to execute an active file
///    transfer. It generates the necessary CFDP PDUs for this process. This method is
///    also used to insert received packets with the appropriate destination ID and
///    target handler type into the state machine.
///
/// A put request will only be accepted if the handler is in the idle state.
///
/// This handler does not support concurrency out of the box. Instead, if concurrent
/// handling is required, it is recommended to create a new handler and run all active
/// handlers inside a thread pool, or move the newly created handler to a new thread.
/// The [crate::entity::EntityDispatcher] uses one handler instance per active
/// transaction.
pub struct SourceHandler<
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
    cksum_buffer: RefCell<Vec<u8>>,
    state_helper: StateHelper,
    transaction_params: TransactionParams<CountdownInstance>,
    timer_creator: TimerCreatorInstance,
    anomalies: AnomalyTracker,
}

impl<
        PduSenderInstance: PduSendProvider,
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
    >
    SourceHandler<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
    >
{
    /// Creates a new instance of a source handler.
    ///
    /// # Arguments
    ///
    /// * `cfg` - The local entity configuration for this source handler.
    /// * `pdu_sender` - [PduSendProvider] used to send CFDP PDUs generated by the
    ///   handler.
    /// * `vfs` - [VirtualFilestore] implementation used by the handler, which decouples
    ///   the CFDP implementation from the underlying filestore/filesystem.
    /// * `remote_cfg_table` - The [RemoteConfigStore] used to look up remote entities
    ///   and target specific configuration for file copy operations.
    /// * `checksum_registry` - The [ChecksumRegistry] holding all file checksum
    ///   algorithms supported by this entity.
    /// * `cksum_buf_size` - The handler requires a buffer to perform checksum
    ///   calculations. The user can specify the size of this buffer, common buffer
    ///   sizes like 2048 or 4096 bytes are recommended.
    /// * `timer_creator` - [TimerCreator] used by the CFDP handler to generate timers
    ///   required by various tasks.
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
            cksum_buffer: RefCell::new(vec![0; cksum_buf_size]),
            state_helper: Default::default(),
            transaction_params: Default::default(),
            timer_creator,
            anomalies: Default::default(),
        }
    }

    /// Calls [Self::state_machine], without inserting a packet.
    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<u32, SourceError> {
        self.state_machine(cfdp_user, None)
    }

    /// This is the core function to drive the source handler. It is also used to insert
    /// packets into the source handler.
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
    ) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        if let Some(packet) = pdu {
            sent_packets += self.insert_packet(cfdp_user, packet)?;
        }
        match self.state() {
            State::Idle => Ok(0),
            State::Busy => {
                sent_packets += self.fsm_busy(cfdp_user)?;
                Ok(sent_packets)
            }
            // All timers are frozen while the transaction is suspended.
            State::Suspended => Ok(sent_packets),
        }
    }

    #[inline]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_params.transaction_id
    }

    /// Returns the [TransmissionMode] for the active file operation.
    #[inline]
    pub fn transmission_mode(&self) -> Option<TransmissionMode> {
        self.transaction_params.transmission_mode
    }

    /// Get the [TransactionStep], which denotes the exact step of a pending CFDP
    /// transaction when applicable.
    #[inline]
    pub fn step(&self) -> TransactionStep {
        self.state_helper.step.get()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state_helper.state.get()
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHookInstance> {
        &self.local_cfg
    }

    #[inline]
    pub fn anomalies(&self) -> &AnomalyTracker {
        &self.anomalies
    }

    /// Progress of the file transfer in sent bytes.
    #[inline]
    pub fn progress(&self) -> u64 {
        self.transaction_params.file_params.progress()
    }

    /// This function is used to pass a put request to the source handler, which is also
    /// used to start a file copy operation. As such, this function models the
    /// Put.request CFDP primitive.
    ///
    /// The passed transaction sequence number and the local entity ID form the
    /// [TransactionId] of the new transaction. The caller is responsible for supplying
    /// sequence numbers which are unique for this source entity, for example from an
    /// incrementing counter.
    ///
    /// Please note that the source handler can only process one put request at a time.
    pub fn put_request(
        &mut self,
        put_request: PutRequest,
        seq_num: UnsignedByteField,
    ) -> Result<TransactionId, PutRequestError> {
        if self.state() != State::Idle {
            return Err(PutRequestError::AlreadyBusy);
        }
        let Some(remote_cfg) = self.remote_cfg_table.get(put_request.destination_id.value())
        else {
            return Err(PutRequestError::NoRemoteCfgFound(put_request.destination_id));
        };
        let remote_cfg = *remote_cfg;
        let transmission_mode = put_request
            .trans_mode
            .unwrap_or(remote_cfg.default_transmission_mode);
        let closure_requested = put_request
            .closure_requested
            .unwrap_or(remote_cfg.closure_requested_by_default);
        if let Some(source_file) = put_request.source_file() {
            if !self.vfs.exists(source_file)? {
                return Err(PutRequestError::FileDoesNotExist);
            }
        }
        let transaction_id = TransactionId::new(self.local_cfg.id, seq_num);
        // Both the source entity and destination entity ID field must have the same
        // size. We use the larger of either the Put Request destination ID or the local
        // entity ID as the size for the new entity IDs.
        let larger_entity_width = core::cmp::max(
            self.local_cfg.id.size(),
            put_request.destination_id.size(),
        );
        let create_id = |cached_id: &UnsignedByteField| {
            if larger_entity_width != cached_id.size() {
                UnsignedByteField::new(larger_entity_width, cached_id.value())
            } else {
                *cached_id
            }
        };
        // Infallible, both IDs were re-encoded to the same width.
        self.transaction_params
            .pdu_conf
            .set_source_and_dest_id(
                create_id(&self.local_cfg.id),
                create_id(&put_request.destination_id),
            )
            .map_err(|_| PutRequestError::AlreadyBusy)
            .unwrap();
        self.transaction_params.pdu_conf.direction = Direction::TowardsReceiver;
        self.transaction_params.pdu_conf.crc_flag = if remote_cfg.crc_on_transmission_by_default {
            CrcFlag::WithCrc
        } else {
            CrcFlag::NoCrc
        };
        self.transaction_params.pdu_conf.transaction_seq_num = seq_num;
        self.transaction_params.pdu_conf.trans_mode = transmission_mode;
        for (condition_code, fault_handler_code) in &put_request.fault_handler_overrides {
            self.local_cfg
                .fault_handler
                .set_fault_handler(*condition_code, *fault_handler_code);
        }
        self.transaction_params.seg_ctrl = put_request.seg_ctrl.unwrap_or_default();
        self.transaction_params.put_request = Some(put_request);
        self.transaction_params.transaction_id = Some(transaction_id);
        self.transaction_params.remote_cfg = Some(remote_cfg);
        self.transaction_params.transmission_mode = Some(transmission_mode);
        self.transaction_params.closure_requested = closure_requested;
        self.transaction_params.cond_code_eof.set(None);
        self.transaction_params.finished_params = None;
        self.state_helper.state.set(State::Busy);
        Ok(transaction_id)
    }

    fn insert_packet(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, SourceError> {
        if packet.packet_target() != PacketTarget::SourceEntity {
            return Err(SourceError::CantProcessPacketType {
                pdu_type: packet.pdu_type(),
                directive_type: packet.file_directive_type(),
            });
        }
        if let Some(timer) = self.transaction_params.inactivity_timer.borrow_mut().as_mut() {
            timer.reset();
        }
        let mut sent_packets = 0;
        match packet.body() {
            PduBody::Finished(finished_pdu) => {
                sent_packets += self.handle_finished_pdu(finished_pdu)?
            }
            PduBody::Nak(nak_pdu) => sent_packets += self.handle_nak_pdu(nak_pdu)?,
            PduBody::KeepAlive(keep_alive_pdu) => {
                sent_packets += self.handle_keep_alive_pdu(user, keep_alive_pdu)?
            }
            PduBody::Ack(ack_pdu) => sent_packets += self.handle_ack_pdu(user, ack_pdu)?,
            _ => {
                return Err(SourceError::CantProcessPacketType {
                    pdu_type: packet.pdu_type(),
                    directive_type: packet.file_directive_type(),
                });
            }
        }
        Ok(sent_packets)
    }

    /// This function models the Cancel.request CFDP primitive and is the recommended
    /// way to cancel a transaction.
    ///
    /// This method will cause a Notice of Cancellation at this entity if a transaction
    /// is active and the passed transaction ID matches the currently active transaction
    /// ID. Please note that the state machine might still be active because a cancelled
    /// transfer might still require some packets to be sent to the remote receiver
    /// entity.
    ///
    /// If no unexpected errors occur, this method returns [true] if the transfer was
    /// cancelled properly and [false] if there is no transaction active or the passed
    /// transaction ID and the active ID do not match.
    pub fn cancel_request(
        &mut self,
        user: &mut impl CfdpUser,
        transaction_id: &TransactionId,
    ) -> Result<bool, SourceError> {
        if self.state() == State::Idle {
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
        if self.state() != State::Busy {
            return false;
        }
        self.notice_of_suspension(user, ConditionCode::SuspendRequestReceived);
        true
    }

    /// Models the Resume.request CFDP primitive. Returns whether the transaction was
    /// resumed.
    pub fn resume_request(&mut self, user: &mut impl CfdpUser) -> bool {
        if self.state() != State::Suspended {
            return false;
        }
        self.state_helper.state.set(State::Busy);
        // All timers are restarted on resumption.
        if let Some(timer) = self.transaction_params.check_timer.as_mut() {
            timer.reset();
        }
        if let Some(timer) = self.transaction_params.ack_timer.borrow_mut().as_mut() {
            timer.reset();
        }
        if let Some(timer) = self.transaction_params.inactivity_timer.borrow_mut().as_mut() {
            timer.reset();
        }
        if self.local_cfg.indication_cfg.resumed {
            user.resumed_indication(&self.transaction_id().unwrap(), self.progress());
        }
        true
    }

    /// Models the Report.request CFDP primitive. Emits a point-in-time status report
    /// through [CfdpUser::report_indication] without mutating the transaction.
    pub fn report_request(&self, user: &mut impl CfdpUser) {
        let Some(id) = self.transaction_id() else {
            return;
        };
        user.report_indication(&TransactionReport::new(
            id,
            EntityType::Sending,
            self.progress(),
            self.transaction_params.file_params.file_size(),
            self.transaction_params
                .cond_code_eof
                .get()
                .unwrap_or(ConditionCode::NoError),
            self.state(),
        ));
    }

    /// Send a Prompt PDU to the remote receiver entity. Only allowed for an active
    /// transaction in acknowledged mode. Returns the number of sent packets.
    pub fn send_prompt(
        &mut self,
        response_required: PromptResponseRequired,
    ) -> Result<u32, SourceError> {
        if self.state() != State::Busy
            || self.transmission_mode() != Some(TransmissionMode::Acknowledged)
        {
            return Ok(0);
        }
        let prompt_pdu = CfdpPdu::new_file_directive(
            self.transaction_params.pdu_conf,
            PduBody::Prompt(PromptPdu::new(response_required)),
        );
        self.pdu_send_helper(&prompt_pdu)?;
        Ok(1)
    }

    /// This function is public to allow completely resetting the handler, but it is
    /// explicitely discouraged to do this. CFDP has mechanisms to detect issues and
    /// errors on itself. Resetting the handler might interfere with these mechanisms
    /// and lead to unexpected behaviour.
    pub fn reset(&mut self) {
        self.state_helper = Default::default();
        self.transaction_params.reset();
    }

    #[inline]
    fn set_step(&self, step: TransactionStep) {
        self.state_helper.step.set(step);
    }

    fn fsm_busy(&mut self, user: &mut impl CfdpUser) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        if self.step() == TransactionStep::Idle {
            self.set_step(TransactionStep::TransactionStart);
        }
        if self.step() == TransactionStep::TransactionStart {
            self.handle_transaction_start(user)?;
            self.set_step(TransactionStep::SendingMetadata);
        }
        if self.step() == TransactionStep::SendingMetadata {
            self.prepare_and_send_metadata_pdu()?;
            self.set_step(TransactionStep::SendingFileData);
            sent_packets += 1;
        }
        if self.step() == TransactionStep::SendingFileData {
            if let ControlFlow::Break(packets) = self.file_data_fsm()? {
                sent_packets += packets;
                // Exit for each file data PDU to allow flow control.
                return Ok(sent_packets);
            }
        }
        if self.step() == TransactionStep::SendingEof {
            sent_packets += self.eof_fsm(user)?;
        }
        if self.step() == TransactionStep::WaitingForEofAck {
            sent_packets += self.handle_positive_ack_procedures(user)?;
        }
        if self.step() == TransactionStep::WaitingForEofAck
            || self.step() == TransactionStep::WaitingForFinished
        {
            sent_packets += self.handle_inactivity(user)?;
        }
        if self.step() == TransactionStep::WaitingForFinished {
            sent_packets += self.handle_waiting_for_finished_pdu(user)?;
        }
        if self.step() == TransactionStep::NoticeOfCompletion {
            self.notice_of_completion(user);
            self.reset();
        }
        Ok(sent_packets)
    }

    fn handle_positive_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
    ) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        let Some(mut positive_ack_params) = self.transaction_params.positive_ack_params.get()
        else {
            return Ok(0);
        };
        let expired = self
            .transaction_params
            .ack_timer
            .borrow()
            .as_ref()
            .is_some_and(|timer| timer.has_expired());
        if !expired {
            return Ok(0);
        }
        let ack_timer_exp_limit = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .positive_ack_timer_expiration_limit;
        if positive_ack_params.ack_counter + 1 >= ack_timer_exp_limit {
            let (fault_packets_sent, ctx) =
                self.declare_fault(user, ConditionCode::PositiveAckLimitReached)?;
            sent_packets += fault_packets_sent;
            if ctx == FsmContext::ResetWhenPossible {
                self.reset();
                return Ok(sent_packets);
            }
            positive_ack_params.ack_counter = 0;
            // CFDP standard 4.11.2.2.3: Any fault declared while transferring the EOF
            // (cancel) PDU must result in abandonment of the transaction.
            positive_ack_params.positive_ack_of_cancellation = true;
        } else {
            if let Some(timer) = self.transaction_params.ack_timer.borrow_mut().as_mut() {
                timer.reset();
            }
            positive_ack_params.ack_counter += 1;
            self.prepare_and_send_eof_pdu(
                user,
                self.transaction_params
                    .file_params
                    .checksum_completed_file
                    .get()
                    .unwrap_or_default(),
            )?;
            sent_packets += 1;
        }
        self.transaction_params
            .positive_ack_params
            .set(Some(positive_ack_params));
        Ok(sent_packets)
    }

    fn handle_retransmission(&mut self, nak_pdu: &NakPdu) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        for segment_req in &nak_pdu.segment_requests {
            // Special case: Metadata PDU is re-requested.
            if segment_req.0 == 0 && segment_req.1 == 0 {
                self.prepare_and_send_metadata_pdu()?;
                sent_packets += 1;
                continue;
            }
            if segment_req.1 < segment_req.0 || segment_req.0 > self.progress() {
                return Err(SourceError::InvalidNakPdu);
            }
            let chunks: Vec<(u64, u64)> = self
                .transaction_params
                .file_params
                .segmenter
                .as_ref()
                .ok_or(SourceError::InvalidNakPdu)?
                .chunks_in_range(segment_req.0, segment_req.1)
                .collect();
            for (chunk_start, chunk_end) in chunks {
                self.send_file_data_chunk(chunk_start, chunk_end)?;
                sent_packets += 1;
            }
        }
        Ok(sent_packets)
    }

    fn handle_waiting_for_finished_pdu(
        &mut self,
        user: &mut impl CfdpUser,
    ) -> Result<u32, SourceError> {
        if self.transmission_mode() == Some(TransmissionMode::Unacknowledged)
            && self
                .transaction_params
                .check_timer
                .as_ref()
                .is_some_and(|timer| timer.has_expired())
        {
            let (sent_packets, ctx) = self.declare_fault(user, ConditionCode::CheckLimitReached)?;
            if ctx == FsmContext::ResetWhenPossible {
                self.reset();
            }
            return Ok(sent_packets);
        }
        Ok(0)
    }

    fn handle_inactivity(&mut self, user: &mut impl CfdpUser) -> Result<u32, SourceError> {
        let expired = self
            .transaction_params
            .inactivity_timer
            .borrow()
            .as_ref()
            .is_some_and(|timer| timer.has_expired());
        if !expired {
            return Ok(0);
        }
        let (sent_packets, ctx) = self.declare_fault(user, ConditionCode::InactivityDetected)?;
        if ctx == FsmContext::ResetWhenPossible {
            self.reset();
        } else if let Some(timer) = self.transaction_params.inactivity_timer.borrow_mut().as_mut()
        {
            timer.reset();
        }
        Ok(sent_packets)
    }

    fn eof_fsm(&mut self, user: &mut impl CfdpUser) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        let checksum_type = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .default_checksum_type;
        let checksum = if self.checksum_registry.supports(checksum_type) {
            self.calculate_checksum_of_transferred_data(
                self.transaction_params.file_params.file_size(),
            )?
        } else {
            let (fault_packets_sent, ctx) =
                self.declare_fault(user, ConditionCode::UnsupportedChecksumType)?;
            sent_packets += fault_packets_sent;
            if ctx == FsmContext::ResetWhenPossible {
                self.reset();
                return Ok(sent_packets);
            }
            if self.step() != TransactionStep::SendingEof {
                // The fault handling already moved the transaction along.
                return Ok(sent_packets);
            }
            0
        };
        self.transaction_params
            .file_params
            .checksum_completed_file
            .set(Some(checksum));
        self.prepare_and_send_eof_pdu(user, checksum)?;
        sent_packets += 1;
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            if self.transaction_params.closure_requested {
                self.start_check_limit_timer();
                self.set_step(TransactionStep::WaitingForFinished);
            } else {
                self.set_step(TransactionStep::NoticeOfCompletion);
            }
        } else {
            self.start_positive_ack_procedure();
            self.start_inactivity_timer();
        }
        Ok(sent_packets)
    }

    fn start_check_limit_timer(&mut self) {
        self.transaction_params.check_timer =
            Some(
                self.timer_creator
                    .create_countdown(TimerContext::CheckLimit {
                        local_id: self.local_cfg.id,
                        remote_id: self
                            .transaction_params
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .entity_id,
                        entity_type: EntityType::Sending,
                    }),
            );
    }

    fn start_inactivity_timer(&self) {
        *self.transaction_params.inactivity_timer.borrow_mut() = Some(
            self.timer_creator
                .create_countdown(TimerContext::Inactivity {
                    expiry_time: Duration::from_secs_f32(
                        self.transaction_params
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .transaction_inactivity_limit_seconds,
                    ),
                }),
        );
    }

    fn start_positive_ack_procedure(&self) {
        self.set_step(TransactionStep::WaitingForEofAck);
        match self.transaction_params.positive_ack_params.get() {
            Some(mut current) => {
                current.ack_counter = 0;
                self.transaction_params
                    .positive_ack_params
                    .set(Some(current));
            }
            None => self
                .transaction_params
                .positive_ack_params
                .set(Some(PositiveAckParams::default())),
        }
        *self.transaction_params.ack_timer.borrow_mut() = Some(
            self.timer_creator
                .create_countdown(TimerContext::PositiveAck {
                    expiry_time: Duration::from_secs_f32(
                        self.transaction_params
                            .remote_cfg
                            .as_ref()
                            .unwrap()
                            .positive_ack_timer_interval_seconds,
                    ),
                }),
        );
    }

    fn handle_transaction_start(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<(), SourceError> {
        let put_request = self.transaction_params.put_request.as_ref().unwrap();
        if put_request.source_file().is_none() {
            self.transaction_params.file_params.metadata_only = true;
        } else {
            let source_file = put_request.source_file().unwrap().to_string();
            if !self.vfs.exists(&source_file)? {
                return Err(SourceError::Filestore(FilestoreError::FileDoesNotExist));
            }
            let file_size = self.vfs.file_size(&source_file)?;
            if file_size > u32::MAX as u64 {
                self.transaction_params.pdu_conf.file_flag = LargeFileFlag::Large
            } else {
                self.transaction_params.pdu_conf.file_flag = LargeFileFlag::Normal
            }
            let segment_len = self.calculate_max_file_seg_len();
            if segment_len == 0 {
                return Err(SourceError::MaxPacketLenTooSmall);
            }
            self.transaction_params.file_params.segmenter =
                Some(FileSegmenter::new(&source_file, file_size, segment_len));
        }
        cfdp_user.transaction_indication(&self.transaction_id().unwrap());
        Ok(())
    }

    fn calculate_max_file_seg_len(&self) -> usize {
        let remote_cfg = self.transaction_params.remote_cfg.as_ref().unwrap();
        let file_data_header = PduHeader::new_for_file_data(
            self.transaction_params.pdu_conf,
            0,
            SegmentMetadataFlag::NotPresent,
            self.transaction_params.seg_ctrl,
        );
        let mut overhead = file_data_header.header_len()
            + fss_len(self.transaction_params.pdu_conf.file_flag);
        if self.transaction_params.pdu_conf.crc_flag == CrcFlag::WithCrc {
            overhead += 2;
        }
        let mut derived_max_seg_len = remote_cfg.max_packet_len.saturating_sub(overhead);
        if let Some(max_file_segment_len) = remote_cfg.max_file_segment_len {
            derived_max_seg_len = core::cmp::min(max_file_segment_len, derived_max_seg_len);
        }
        derived_max_seg_len
    }

    fn prepare_and_send_ack_pdu(
        &self,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<(), SourceError> {
        let ack_pdu = CfdpPdu::new_file_directive(
            self.transaction_params.pdu_conf,
            PduBody::Ack(AckPdu::new_for_finished(condition_code, transaction_status)),
        );
        self.pdu_send_helper(&ack_pdu)
    }

    fn prepare_and_send_metadata_pdu(&self) -> Result<(), SourceError> {
        let put_request = self.transaction_params.put_request.as_ref().unwrap();
        let checksum_type = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .default_checksum_type;
        let (src_file_name, dest_file_name) = if self.transaction_params.file_params.metadata_only
        {
            (Lv::new_empty(), Lv::new_empty())
        } else {
            (
                Lv::new_from_str(put_request.source_file().unwrap())
                    .map_err(PduError::from)?,
                Lv::new_from_str(put_request.dest_file().unwrap()).map_err(PduError::from)?,
            )
        };
        let mut metadata_pdu = MetadataPdu::new(
            self.transaction_params.closure_requested,
            checksum_type,
            self.transaction_params.file_params.file_size(),
            src_file_name,
            dest_file_name,
        );
        metadata_pdu.options = self.put_request_options(put_request)?;
        let pdu = CfdpPdu::new_file_directive(
            self.transaction_params.pdu_conf,
            PduBody::Metadata(metadata_pdu),
        );
        self.pdu_send_helper(&pdu)
    }

    fn put_request_options(&self, put_request: &PutRequest) -> Result<Vec<Tlv>, SourceError> {
        let mut options = Vec::new();
        for msg_to_user in &put_request.msgs_to_user {
            options.push(msg_to_user.to_tlv().map_err(PduError::from)?);
        }
        for fs_request in &put_request.fs_requests {
            options.push(fs_request.to_tlv().map_err(PduError::from)?);
        }
        if let Some(flow_label) = &put_request.flow_label {
            options.push(flow_label.clone());
        }
        Ok(options)
    }

    fn file_data_fsm(&mut self) -> Result<ControlFlow<u32>, SourceError> {
        if self.transaction_params.file_params.metadata_only {
            // Special case: Metadata only, no EOF is sent.
            if self.transaction_params.closure_requested {
                self.start_check_limit_timer();
                self.set_step(TransactionStep::WaitingForFinished);
            } else {
                self.set_step(TransactionStep::NoticeOfCompletion);
            }
            return Ok(ControlFlow::Continue(()));
        }
        if self.send_progressing_file_data_pdu()? {
            return Ok(ControlFlow::Break(1));
        }
        // The segmenter handed out its terminal marker segment, the EOF PDU is due now.
        self.set_step(TransactionStep::SendingEof);
        self.transaction_params
            .cond_code_eof
            .set(Some(ConditionCode::NoError));
        Ok(ControlFlow::Continue(()))
    }

    fn notice_of_completion(&mut self, cfdp_user: &mut impl CfdpUser) {
        if self.local_cfg.indication_cfg.transaction_finished {
            // The first case happens for unacknowledged file copy operations with no
            // closure.
            let finished_params = match self.transaction_params.finished_params {
                Some(finished_params) => TransactionFinishedParams {
                    id: self.transaction_id().unwrap(),
                    condition_code: finished_params.condition_code,
                    delivery_code: finished_params.delivery_code,
                    file_status: finished_params.file_status,
                },
                None => TransactionFinishedParams {
                    id: self.transaction_id().unwrap(),
                    condition_code: self
                        .transaction_params
                        .cond_code_eof
                        .get()
                        .unwrap_or(ConditionCode::NoError),
                    delivery_code: DeliveryCode::Complete,
                    file_status: FileStatus::Unreported,
                },
            };
            cfdp_user.transaction_finished_indication(&finished_params);
        }
    }

    fn send_progressing_file_data_pdu(&mut self) -> Result<bool, SourceError> {
        let Some(segmenter) = self.transaction_params.file_params.segmenter.as_mut() else {
            return Ok(false);
        };
        let Some(segment) = segmenter.next_segment(&self.vfs)? else {
            return Ok(false);
        };
        if segment.is_eof {
            return Ok(false);
        }
        let file_data_pdu = CfdpPdu::new_file_data(
            self.transaction_params.pdu_conf,
            FileDataPdu::new_no_seg_metadata(segment.offset, &segment.data),
            self.transaction_params.seg_ctrl,
        );
        self.pdu_send_helper(&file_data_pdu)?;
        Ok(true)
    }

    fn send_file_data_chunk(&self, start: u64, end: u64) -> Result<(), SourceError> {
        let segmenter = self
            .transaction_params
            .file_params
            .segmenter
            .as_ref()
            .ok_or(SourceError::InvalidNakPdu)?;
        let segment = segmenter.read_segment(&self.vfs, start, end)?;
        let file_data_pdu = CfdpPdu::new_file_data(
            self.transaction_params.pdu_conf,
            FileDataPdu::new_no_seg_metadata(segment.offset, &segment.data),
            self.transaction_params.seg_ctrl,
        );
        self.pdu_send_helper(&file_data_pdu)
    }

    fn calculate_checksum_of_transferred_data(
        &self,
        size_to_verify: u64,
    ) -> Result<u32, SourceError> {
        if self.transaction_params.file_params.metadata_only {
            return Ok(0);
        }
        let checksum_type = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .default_checksum_type;
        let Ok(mut computer) = self.checksum_registry.create(checksum_type) else {
            return Ok(0);
        };
        let put_request = self.transaction_params.put_request.as_ref().unwrap();
        Ok(self.vfs.calculate_checksum(
            put_request.source_file().unwrap(),
            computer.as_mut(),
            size_to_verify,
            &mut self.cksum_buffer.borrow_mut(),
        )?)
    }

    fn prepare_and_send_eof_pdu(
        &self,
        cfdp_user: &mut impl CfdpUser,
        checksum: u32,
    ) -> Result<(), SourceError> {
        let condition_code = self
            .transaction_params
            .cond_code_eof
            .get()
            .unwrap_or(ConditionCode::NoError);
        let fault_location = if condition_code == ConditionCode::NoError {
            None
        } else {
            Some(EntityIdTlv::new(self.local_cfg.id))
        };
        let eof_pdu = CfdpPdu::new_file_directive(
            self.transaction_params.pdu_conf,
            PduBody::Eof(EofPdu::new_for_condition(
                condition_code,
                checksum,
                self.progress(),
                fault_location,
            )),
        );
        self.pdu_send_helper(&eof_pdu)?;
        if self.local_cfg.indication_cfg.eof_sent {
            cfdp_user.eof_sent_indication(&self.transaction_id().unwrap());
        }
        Ok(())
    }

    fn pdu_send_helper(&self, pdu: &CfdpPdu) -> Result<(), SourceError> {
        let raw_pdu = pdu.to_vec()?;
        self.pdu_sender
            .send_pdu(pdu.pdu_type(), pdu.file_directive_type(), &raw_pdu)?;
        Ok(())
    }

    fn handle_finished_pdu(&mut self, finished_pdu: &FinishedPdu) -> Result<u32, SourceError> {
        // Ignore this packet when we are idle.
        if self.state() == State::Idle {
            return Ok(0);
        }
        // A Finished PDU arriving while the EOF acknowledgement is still pending
        // implies that the ACK was received by the remote entity.
        if self.step() != TransactionStep::WaitingForFinished
            && self.step() != TransactionStep::WaitingForEofAck
        {
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::FinishedPdu),
            });
        }
        self.transaction_params.finished_params = Some(FinishedParams {
            condition_code: finished_pdu.condition_code,
            delivery_code: finished_pdu.delivery_code,
            file_status: finished_pdu.file_status,
        });
        let mut sent_packets = 0;
        if self.transmission_mode() == Some(TransmissionMode::Acknowledged) {
            self.prepare_and_send_ack_pdu(
                finished_pdu.condition_code,
                TransactionStatus::Active,
            )?;
            sent_packets += 1;
        }
        self.set_step(TransactionStep::NoticeOfCompletion);
        Ok(sent_packets)
    }

    fn handle_nak_pdu(&mut self, nak_pdu: &NakPdu) -> Result<u32, SourceError> {
        if self.state() == State::Idle
            || self.transmission_mode() != Some(TransmissionMode::Acknowledged)
        {
            return Ok(0);
        }
        self.handle_retransmission(nak_pdu)
    }

    fn handle_keep_alive_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        keep_alive_pdu: &KeepAlivePdu,
    ) -> Result<u32, SourceError> {
        if self.state() == State::Idle {
            return Ok(0);
        }
        self.transaction_params
            .last_keep_alive_progress
            .set(Some(keep_alive_pdu.progress));
        let Some(discrepancy_limit) = self
            .transaction_params
            .remote_cfg
            .as_ref()
            .unwrap()
            .keep_alive_discrepancy_limit
        else {
            return Ok(0);
        };
        if self.progress().saturating_sub(keep_alive_pdu.progress) <= discrepancy_limit {
            return Ok(0);
        }
        let (sent_packets, ctx) =
            self.declare_fault(user, ConditionCode::KeepAliveLimitReached)?;
        if ctx == FsmContext::ResetWhenPossible {
            self.reset();
        }
        Ok(sent_packets)
    }

    fn handle_ack_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        ack_pdu: &AckPdu,
    ) -> Result<u32, SourceError> {
        if self.step() != TransactionStep::WaitingForEofAck {
            // Drop the packet, wrong state to handle it..
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::AckPdu),
            });
        }
        if ack_pdu.acked_directive != FileDirectiveType::EofPdu {
            self.anomalies.invalid_ack_directive_code =
                self.anomalies.invalid_ack_directive_code.wrapping_add(1);
            return Ok(0);
        }
        *self.transaction_params.ack_timer.borrow_mut() = None;
        self.transaction_params.positive_ack_params.set(None);
        if self
            .transaction_params
            .cond_code_eof
            .get()
            .unwrap_or(ConditionCode::NoError)
            != ConditionCode::NoError
        {
            // The EOF (cancel) PDU was acknowledged, the transaction ends here.
            self.notice_of_completion(user);
            self.reset();
        } else {
            self.set_step(TransactionStep::WaitingForFinished);
        }
        Ok(0)
    }

    pub fn notice_of_cancellation(
        &mut self,
        user: &mut impl CfdpUser,
        condition_code: ConditionCode,
    ) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        let ctx = self.notice_of_cancellation_internal(user, condition_code, &mut sent_packets)?;
        if ctx == FsmContext::ResetWhenPossible {
            self.reset();
        }
        Ok(sent_packets)
    }

    fn notice_of_cancellation_internal(
        &self,
        user: &mut impl CfdpUser,
        condition_code: ConditionCode,
        sent_packets: &mut u32,
    ) -> Result<FsmContext, SourceError> {
        self.transaction_params
            .cond_code_eof
            .set(Some(condition_code));
        // As specified in 4.11.2.2, prepare an EOF PDU to be sent to the remote entity.
        // Supply the checksum for the file copy progress sent so far.
        let checksum = self.calculate_checksum_of_transferred_data(self.progress())?;
        self.transaction_params
            .file_params
            .checksum_completed_file
            .set(Some(checksum));
        self.prepare_and_send_eof_pdu(user, checksum)?;
        *sent_packets += 1;
        if self.transmission_mode().unwrap() == TransmissionMode::Unacknowledged {
            // We are done.
            Ok(FsmContext::ResetWhenPossible)
        } else {
            self.start_positive_ack_procedure();
            Ok(FsmContext::default())
        }
    }

    fn notice_of_suspension(&self, user: &mut impl CfdpUser, condition_code: ConditionCode) {
        self.state_helper.state.set(State::Suspended);
        if self.local_cfg.indication_cfg.suspended {
            user.suspended_indication(&self.transaction_id().unwrap(), condition_code);
        }
    }

    // Returns the number of packets sent and a FSM context structure.
    fn declare_fault(
        &self,
        user: &mut impl CfdpUser,
        cond: ConditionCode,
    ) -> Result<(u32, FsmContext), SourceError> {
        let mut sent_packets = 0;
        let mut fh_code = self.local_cfg.fault_handler.get_fault_handler(cond);
        // CFDP standard 4.11.2.2.3: Any fault declared in the course of transferring
        // the EOF (cancel) PDU must result in abandonment of the transaction.
        if let Some(positive_ack_params) = self.transaction_params.positive_ack_params.get() {
            if positive_ack_params.positive_ack_of_cancellation {
                fh_code = FaultHandlerCode::AbandonTransaction;
            }
        }
        let mut ctx = FsmContext::default();
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                ctx = self.notice_of_cancellation_internal(user, cond, &mut sent_packets)?;
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.notice_of_suspension(user, cond);
            }
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::AbandonTransaction => {
                ctx = FsmContext::ResetWhenPossible;
            }
        }
        let transaction_id = self.transaction_id().unwrap();
        let progress = self.progress();
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
        Ok((sent_packets, ctx))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::string::String;

    use super::*;
    use crate::checksum::{ChecksumType, CRC_32};
    use crate::filestore::NativeFilestore;
    use crate::tests::{basic_remote_cfg_table, TestCfdpSender, TestCfdpUser, TestFaultHandler, LOCAL_ID, REMOTE_ID};
    use crate::{IndicationConfig, StdCountdown, StdRemoteConfigStore, StdTimerCreator};
    use tempfile::TempDir;

    const SEQ_NUM: u16 = 25;

    type TestSourceHandler = SourceHandler<
        TestCfdpSender,
        TestFaultHandler,
        NativeFilestore,
        StdRemoteConfigStore,
        StdTimerCreator,
        StdCountdown,
    >;

    struct SourceHandlerTestbench {
        handler: TestSourceHandler,
        #[allow(dead_code)]
        tempdir: TempDir,
        srcfile: String,
        destfile: String,
    }

    impl SourceHandlerTestbench {
        fn new(crc_on_transmission: bool, file_data: &[u8], max_packet_len: usize) -> Self {
            Self::new_with_cfg_table(
                file_data,
                basic_remote_cfg_table(REMOTE_ID, max_packet_len, crc_on_transmission),
            )
        }

        fn new_with_cfg_table(file_data: &[u8], cfg_table: StdRemoteConfigStore) -> Self {
            let tempdir = tempfile::tempdir().expect("creating tempdir failed");
            let srcfile = tempdir
                .path()
                .join("testfile.txt")
                .to_str()
                .unwrap()
                .to_string();
            std::fs::write(&srcfile, file_data).expect("writing test file failed");
            let local_cfg = LocalEntityConfig::new(
                LOCAL_ID,
                IndicationConfig::default(),
                TestFaultHandler::default(),
            );
            let handler = SourceHandler::new(
                local_cfg,
                TestCfdpSender::default(),
                NativeFilestore::default(),
                cfg_table,
                ChecksumRegistry::new_with_defaults(),
                1024,
                StdTimerCreator::new(Duration::from_millis(100)),
            );
            let destfile = String::from("TEST_FILE.txt");
            Self {
                handler,
                tempdir,
                srcfile,
                destfile,
            }
        }

        fn test_user(&self, file_size: u64) -> TestCfdpUser {
            TestCfdpUser::new(
                SEQ_NUM as u64,
                self.srcfile.clone(),
                self.destfile.clone(),
                file_size,
            )
        }

        fn put_request(&mut self, put_request: PutRequest) -> TransactionId {
            self.handler
                .put_request(put_request, SEQ_NUM.into())
                .expect("put request failed")
        }

        fn basic_put(&mut self) -> PutRequest {
            PutRequest::new_regular_request(REMOTE_ID, &self.srcfile, &self.destfile).unwrap()
        }

        fn next_sent_pdu(&self) -> Option<CfdpPdu> {
            self.handler
                .pdu_sender
                .retrieve_next_pdu()
                .map(|sent| CfdpPdu::from_bytes(&sent.raw_pdu).expect("invalid sent PDU"))
        }

        fn all_fault_queues_empty(&self) -> bool {
            self.handler
                .local_cfg
                .user_fault_hook()
                .borrow()
                .all_queues_empty()
        }
    }

    #[test]
    fn test_empty_file_transfer_not_acked_no_closure() {
        let mut tb = SourceHandlerTestbench::new(false, &[], 512);
        let mut user = tb.test_user(0);
        let put = tb.basic_put();
        let id = tb.put_request(put);
        assert_eq!(id.source_id(), &LOCAL_ID);
        let sent = tb.handler.state_machine_no_packet(&mut user).unwrap();
        assert_eq!(sent, 2);
        // Metadata PDU.
        let metadata = tb.next_sent_pdu().unwrap();
        assert_eq!(
            metadata.file_directive_type(),
            Some(FileDirectiveType::MetadataPdu)
        );
        match metadata.body() {
            PduBody::Metadata(metadata) => {
                assert!(!metadata.closure_requested);
                assert_eq!(metadata.file_size, 0);
                assert_eq!(metadata.src_file_name.as_str().unwrap(), tb.srcfile);
                assert_eq!(metadata.dest_file_name.as_str().unwrap(), tb.destfile);
            }
            other => panic!("unexpected body {other:?}"),
        }
        // EOF PDU, empty file checksum.
        let eof = tb.next_sent_pdu().unwrap();
        match eof.body() {
            PduBody::Eof(eof) => {
                assert_eq!(eof.condition_code, ConditionCode::NoError);
                assert_eq!(eof.file_size, 0);
                assert_eq!(eof.file_checksum, 0);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(user.eof_sent_call_count, 1);
        assert_eq!(user.transaction_indication_call_count, 1);
        assert_eq!(user.finished_indic_queue.len(), 1);
        assert_eq!(tb.handler.state(), State::Idle);
        assert!(tb.all_fault_queues_empty());
    }

    #[test]
    fn test_small_file_transfer_not_acked_no_closure() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put();
        tb.put_request(put);
        // Metadata and one file data PDU.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        let metadata = tb.next_sent_pdu().unwrap();
        assert_eq!(
            metadata.file_directive_type(),
            Some(FileDirectiveType::MetadataPdu)
        );
        let file_data_pdu = tb.next_sent_pdu().unwrap();
        match file_data_pdu.body() {
            PduBody::FileData(fd) => {
                assert_eq!(fd.offset, 0);
                assert_eq!(fd.file_data, file_data);
            }
            other => panic!("unexpected body {other:?}"),
        }
        // EOF.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        let eof = tb.next_sent_pdu().unwrap();
        match eof.body() {
            PduBody::Eof(eof) => {
                assert_eq!(eof.file_size, file_data.len() as u64);
                assert_eq!(eof.file_checksum, CRC_32.checksum(&file_data));
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(tb.next_sent_pdu().is_none());
        assert_eq!(user.finished_indic_queue.len(), 1);
        assert_eq!(tb.handler.state(), State::Idle);
        assert!(tb.all_fault_queues_empty());
    }

    #[test]
    fn test_segmented_file_transfer() {
        let mut rng = rand::thread_rng();
        let mut file_data = [0u8; 140];
        rand::Rng::fill(&mut rng, &mut file_data[..]);
        // Only room for 64 byte segments.
        let max_packet_len = 64 + 7 + 4;
        let mut tb = SourceHandlerTestbench::new(false, &file_data, max_packet_len);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put();
        tb.put_request(put);
        // Metadata + first segment.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        tb.next_sent_pdu().unwrap();
        let mut read_back = Vec::new();
        for _ in 0..2 {
            let fd = tb.next_sent_pdu().unwrap();
            match fd.body() {
                PduBody::FileData(fd) => {
                    assert_eq!(fd.offset, read_back.len() as u64);
                    read_back.extend_from_slice(&fd.file_data);
                }
                other => panic!("unexpected body {other:?}"),
            }
            if read_back.len() < file_data.len() {
                assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
            }
        }
        // Third segment and EOF.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        let fd = tb.next_sent_pdu().unwrap();
        match fd.body() {
            PduBody::FileData(fd) => read_back.extend_from_slice(&fd.file_data),
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(read_back, file_data);
        let eof = tb.next_sent_pdu().unwrap();
        assert_eq!(eof.file_directive_type(), Some(FileDirectiveType::EofPdu));
        assert_eq!(tb.handler.state(), State::Idle);
    }

    #[test]
    fn test_transfer_with_closure_requested() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put().with_closure_requested(true);
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForFinished);
        // Insert the Finished PDU.
        let finished = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::Finished(FinishedPdu::new_default(
                ConditionCode::NoError,
                DeliveryCode::Complete,
                FileStatus::Retained,
            )),
        );
        assert_eq!(tb.handler.state_machine(&mut user, Some(&finished)).unwrap(), 0);
        assert_eq!(user.finished_indic_queue.len(), 1);
        let finished_params = user.finished_indic_queue.front().unwrap();
        assert_eq!(finished_params.condition_code, ConditionCode::NoError);
        assert_eq!(finished_params.file_status, FileStatus::Retained);
        assert_eq!(tb.handler.state(), State::Idle);
    }

    fn reply_pdu_conf() -> CommonPduConfig {
        let mut pdu_conf = CommonPduConfig::default();
        pdu_conf
            .set_source_and_dest_id(LOCAL_ID, REMOTE_ID)
            .unwrap();
        pdu_conf.transaction_seq_num = SEQ_NUM.into();
        pdu_conf.direction = Direction::TowardsSender;
        pdu_conf
    }

    #[test]
    fn test_check_limit_reached_fault() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        user.expect_faults = true;
        let put = tb.basic_put().with_closure_requested(true);
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForFinished);
        // No Finished PDU arrives, the check limit timer expires.
        std::thread::sleep(Duration::from_millis(120));
        // The default fault handler cancels the transaction, which sends an EOF
        // (cancel) PDU in unacknowledged mode and resets the handler.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        // Metadata, file data and normal EOF first.
        tb.next_sent_pdu().unwrap();
        tb.next_sent_pdu().unwrap();
        tb.next_sent_pdu().unwrap();
        let eof = tb.next_sent_pdu().unwrap();
        match eof.body() {
            PduBody::Eof(eof) => {
                assert_eq!(eof.condition_code, ConditionCode::CheckLimitReached);
                assert!(eof.fault_location.is_some());
            }
            other => panic!("unexpected body {other:?}"),
        }
        let fault_hook = tb.handler.local_cfg.user_fault_hook().borrow();
        assert_eq!(fault_hook.notice_of_cancellation_queue.len(), 1);
        drop(fault_hook);
        assert_eq!(tb.handler.state(), State::Idle);
    }

    #[test]
    fn test_cancel_request() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put();
        let id = tb.put_request(put);
        // Metadata and first file data PDU sent.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert!(tb
            .handler
            .cancel_request(&mut user, &id)
            .expect("cancel request failed"));
        assert_eq!(tb.handler.state(), State::Idle);
        tb.next_sent_pdu().unwrap();
        tb.next_sent_pdu().unwrap();
        let eof = tb.next_sent_pdu().unwrap();
        match eof.body() {
            PduBody::Eof(eof) => {
                assert_eq!(eof.condition_code, ConditionCode::CancelRequestReceived);
                assert_eq!(eof.file_size, file_data.len() as u64);
            }
            other => panic!("unexpected body {other:?}"),
        }
        // Cancelling again is a no-op.
        assert!(!tb.handler.cancel_request(&mut user, &id).unwrap());
    }

    #[test]
    fn test_acknowledged_transfer_with_nak() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb
            .basic_put()
            .with_trans_mode(TransmissionMode::Acknowledged);
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        tb.next_sent_pdu().unwrap();
        tb.next_sent_pdu().unwrap();
        tb.next_sent_pdu().unwrap();
        // The remote entity requests metadata and the first 5 bytes again.
        let mut segment_requests = crate::pdu::nak::SegmentRequests::new();
        segment_requests.push((0, 0));
        segment_requests.push((0, 5));
        let nak = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::Nak(NakPdu::new(0, file_data.len() as u64, segment_requests)),
        );
        assert_eq!(tb.handler.state_machine(&mut user, Some(&nak)).unwrap(), 2);
        let metadata = tb.next_sent_pdu().unwrap();
        assert_eq!(
            metadata.file_directive_type(),
            Some(FileDirectiveType::MetadataPdu)
        );
        let fd = tb.next_sent_pdu().unwrap();
        match fd.body() {
            PduBody::FileData(fd) => {
                assert_eq!(fd.offset, 0);
                assert_eq!(fd.file_data, file_data[0..5]);
            }
            other => panic!("unexpected body {other:?}"),
        }
        // ACK of EOF, then the Finished PDU closes the transaction with a Finished ACK.
        let ack = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::Ack(AckPdu::new_for_eof(
                ConditionCode::NoError,
                TransactionStatus::Active,
            )),
        );
        assert_eq!(tb.handler.state_machine(&mut user, Some(&ack)).unwrap(), 0);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForFinished);
        let finished = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::Finished(FinishedPdu::new_default(
                ConditionCode::NoError,
                DeliveryCode::Complete,
                FileStatus::Retained,
            )),
        );
        assert_eq!(
            tb.handler.state_machine(&mut user, Some(&finished)).unwrap(),
            1
        );
        let finished_ack = tb.next_sent_pdu().unwrap();
        match finished_ack.body() {
            PduBody::Ack(ack) => {
                assert_eq!(ack.acked_directive, FileDirectiveType::FinishedPdu);
                assert_eq!(ack.condition_code, ConditionCode::NoError);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert_eq!(user.finished_indic_queue.len(), 1);
        assert_eq!(tb.handler.state(), State::Idle);
        assert!(tb.all_fault_queues_empty());
    }

    #[test]
    fn test_positive_ack_limit_cancels_and_abandons() {
        let file_data = b"Hello World!".to_vec();
        let mut cfg = RemoteEntityConfig::new_with_default_values(
            REMOTE_ID,
            512,
            true,
            false,
            TransmissionMode::Acknowledged,
            ChecksumType::Crc32,
        );
        cfg.positive_ack_timer_interval_seconds = 0.0;
        cfg.positive_ack_timer_expiration_limit = 1;
        let mut cfg_table = StdRemoteConfigStore::default();
        cfg_table.add_config(&cfg);
        let mut tb = SourceHandlerTestbench::new_with_cfg_table(&file_data, cfg_table);
        let mut user = tb.test_user(file_data.len() as u64);
        user.expect_faults = true;
        let put = tb.basic_put();
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        // First expiry reaches the limit immediately and cancels the transaction,
        // which sends an EOF (cancel) PDU.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        // Second expiry happens while transferring the EOF (cancel) PDU and must
        // abandon the transaction.
        std::thread::sleep(Duration::from_millis(5));
        tb.handler.state_machine_no_packet(&mut user).unwrap();
        assert_eq!(tb.handler.state(), State::Idle);
        let fault_hook = tb.handler.local_cfg.user_fault_hook().borrow();
        assert_eq!(fault_hook.notice_of_cancellation_queue.len(), 1);
        assert_eq!(fault_hook.abandoned_queue.len(), 1);
    }

    #[test]
    fn test_keep_alive_discrepancy_limit() {
        let file_data = b"Hello World!".to_vec();
        let mut cfg = RemoteEntityConfig::new_with_default_values(
            REMOTE_ID,
            512,
            true,
            false,
            TransmissionMode::Acknowledged,
            ChecksumType::Crc32,
        );
        cfg.keep_alive_discrepancy_limit = Some(4);
        let mut cfg_table = StdRemoteConfigStore::default();
        cfg_table.add_config(&cfg);
        let mut tb = SourceHandlerTestbench::new_with_cfg_table(&file_data, cfg_table);
        let mut user = tb.test_user(file_data.len() as u64);
        user.expect_faults = true;
        let put = tb.basic_put();
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.step(), TransactionStep::WaitingForEofAck);
        // Reported receive progress is within the allowed discrepancy.
        let keep_alive = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::KeepAlive(KeepAlivePdu::new(10)),
        );
        tb.handler.state_machine(&mut user, Some(&keep_alive)).unwrap();
        assert!(tb.all_fault_queues_empty());
        // The receiver lags more than 4 bytes behind the sent 12 bytes, which declares
        // a Keep Alive Limit Reached fault and cancels the transaction.
        let keep_alive = CfdpPdu::new_file_directive(
            reply_pdu_conf(),
            PduBody::KeepAlive(KeepAlivePdu::new(2)),
        );
        tb.handler.state_machine(&mut user, Some(&keep_alive)).unwrap();
        let fault_hook = tb.handler.local_cfg.user_fault_hook().borrow();
        assert_eq!(fault_hook.notice_of_cancellation_queue.len(), 1);
        assert_eq!(
            fault_hook.notice_of_cancellation_queue.front().unwrap().1,
            ConditionCode::KeepAliveLimitReached
        );
    }

    #[test]
    fn test_metadata_only_request() {
        let mut tb = SourceHandlerTestbench::new(false, &[], 512);
        let mut user = TestCfdpUser::new(SEQ_NUM as u64, String::new(), String::new(), 0);
        let put = PutRequest::new_metadata_only(REMOTE_ID);
        tb.handler.put_request(put, SEQ_NUM.into()).unwrap();
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        let metadata = tb.next_sent_pdu().unwrap();
        match metadata.body() {
            PduBody::Metadata(metadata) => {
                assert!(metadata.is_metadata_only());
            }
            other => panic!("unexpected body {other:?}"),
        }
        // No EOF for metadata only transactions.
        assert!(tb.next_sent_pdu().is_none());
        assert_eq!(tb.handler.state(), State::Idle);
    }

    #[test]
    fn test_put_request_no_remote_cfg() {
        let mut tb = SourceHandlerTestbench::new(false, &[], 512);
        let put = PutRequest::new_metadata_only(99u8);
        let error = tb.handler.put_request(put, SEQ_NUM.into()).unwrap_err();
        assert!(matches!(error, PutRequestError::NoRemoteCfgFound(_)));
    }

    #[test]
    fn test_put_request_missing_file() {
        let mut tb = SourceHandlerTestbench::new(false, &[], 512);
        let mut missing = PathBuf::from(tb.tempdir.path());
        missing.push("missing.txt");
        let put = PutRequest::new_regular_request(
            REMOTE_ID,
            missing.to_str().unwrap(),
            &tb.destfile.clone(),
        )
        .unwrap();
        let error = tb.handler.put_request(put, SEQ_NUM.into()).unwrap_err();
        assert!(matches!(error, PutRequestError::FileDoesNotExist));
    }

    #[test]
    fn test_suspend_and_resume() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put();
        tb.put_request(put);
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 2);
        assert!(tb.handler.suspend_request(&mut user));
        assert_eq!(tb.handler.state(), State::Suspended);
        // A second suspend is a no-op.
        assert!(!tb.handler.suspend_request(&mut user));
        // No packets are generated while suspended.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 0);
        assert!(tb.handler.resume_request(&mut user));
        // A resume on a non-suspended transaction is a no-op.
        assert!(!tb.handler.resume_request(&mut user));
        assert_eq!(user.suspended_queue.len(), 1);
        assert_eq!(user.resumed_queue.len(), 1);
        // The transfer continues to completion.
        assert_eq!(tb.handler.state_machine_no_packet(&mut user).unwrap(), 1);
        assert_eq!(tb.handler.state(), State::Idle);
    }

    #[test]
    fn test_report_request() {
        let file_data = b"Hello World!".to_vec();
        let mut tb = SourceHandlerTestbench::new(false, &file_data, 512);
        let mut user = tb.test_user(file_data.len() as u64);
        let put = tb.basic_put();
        tb.put_request(put);
        tb.handler.state_machine_no_packet(&mut user).unwrap();
        tb.handler.report_request(&mut user);
        let report = user.report_queue.pop_front().unwrap();
        assert_eq!(report.entity_type, EntityType::Sending);
        assert_eq!(report.file_size, file_data.len() as u64);
        assert_eq!(report.progress, file_data.len() as u64);
        assert_eq!(report.state, State::Busy);
    }
}
