//! This crate implements the CCSDS File Delivery Protocol (CFDP) transaction engine as
//! specified in CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called
//! packet data units (PDU). CFDP has an unacknowledged and acknowledged mode, with the
//! option to request a transaction closure for the unacknowledged mode. Using the
//! unacknowledged mode with no transaction closure is applicable for simplex
//! communication paths, while the unacknowledged mode with closure is the easiest way to
//! get a confirmation of a successful file transfer, including a checksum verification on
//! the remote side to verify file integrity. The acknowledged mode is the most complex
//! mode which includes multiple mechanisms to ensure successful packet transmission even
//! for unreliable connections, including lost segment detection. As such, it can be
//! compared to a specialized TCP for file transfers with remote systems.
//!
//! The core of this library are the [crate::dest::DestinationHandler] and the
//! [crate::source::SourceHandler] components which model the CFDP destination and source
//! entity respectively. The [crate::entity::EntityDispatcher] combines both sides behind
//! one inbound PDU and request interface and manages the transaction table. You can find
//! high-level and API documentation in the respective modules.
//!
//! The [end-to-end test](tests/end-to-end.rs) is an integration test which spawns a CFDP
//! source entity and a CFDP destination entity, moves them to separate threads and then
//! performs small file copy operations in all transmission modes. You can run it with
//! printout to the standard console using
//!
//! ```sh
//! cargo test end_to_end -- --nocapture
//! ```
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod checksum;
pub mod dest;
pub mod entity;
pub mod filestore;
pub mod lost_segments;
pub mod pdu;
pub mod request;
pub mod segment;
pub mod source;
pub mod time;
pub mod user;
pub mod util;

use core::{cell::RefCell, hash::Hash};
use core::time::Duration;
use hashbrown::HashMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::pdu::{ConditionCode, FileDirectiveType, PduType, TransmissionMode};
use crate::time::Countdown;
use crate::util::UnsignedByteField;

pub use crate::checksum::ChecksumType;
pub use crate::pdu::{CfdpPdu, PacketTarget, PduError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityType {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimerContext {
    CheckLimit {
        local_id: UnsignedByteField,
        remote_id: UnsignedByteField,
        entity_type: EntityType,
    },
    NakActivity {
        expiry_time: Duration,
    },
    PositiveAck {
        expiry_time: Duration,
    },
    Inactivity {
        expiry_time: Duration,
    },
}

/// A generic trait which allows CFDP entities to create the countdown timers required
/// by several protocol procedures.
///
/// This trait allows the creation of different check timers depending on context and
/// purpose of the timer, the runtime environment (e.g. standard clock timer vs. timer
/// using a RTC) or other factors.
///
/// The countdown timer is used by 4 mechanisms of the CFDP protocol.
///
/// ## 1. Check limit handling
///
/// The first mechanism is the check limit handling for unacknowledged transfers as
/// specified in 4.6.3.2 and 4.6.3.3 of the CFDP standard.
/// For this mechanism, the timer has different functionality depending on whether
/// the using entity is the sending entity or the receiving entity for the unacknowledged
/// transmission mode.
///
/// For the sending entity, this timer determines the expiry period for declaring a check
/// limit fault after sending an EOF PDU with requested closure. This allows a timeout of
/// the transfer. Also see 4.6.3.2 of the CFDP standard.
///
/// For the receiving entity, this timer determines the expiry period for incrementing a
/// check counter after an EOF PDU is received for an incomplete file transfer. This
/// allows out-of-order reception of file data PDUs and EOF PDUs. Also see 4.6.3.3 of the
/// CFDP standard.
///
/// ## 2. NAK activity limit
///
/// The timer will be used to perform the NAK activity check as specified in 4.6.4.7 of
/// the CFDP standard. The expiration period will be provided by the NAK timer expiration
/// limit of the remote entity configuration.
///
/// ## 3. Positive ACK procedures
///
/// The timer will be used to perform the Positive Acknowledgement Procedures as
/// specified in 4.7.1 of the CFDP standard. The expiration period will be provided by
/// the positive ACK timer interval of the remote entity configuration.
///
/// ## 4. Inactivity monitoring
///
/// The timer monitors the inactivity of an ongoing transaction as specified in 4.10 of
/// the CFDP standard. It is reset whenever a PDU belonging to the transaction arrives.
pub trait TimerCreator {
    type Countdown: Countdown;

    fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown;
}

/// Fault handler codes as specified in table 4-6 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum FaultHandlerCode {
    NoticeOfCancellation = 0b0001,
    NoticeOfSuspension = 0b0010,
    IgnoreError = 0b0011,
    AbandonTransaction = 0b0100,
}

/// This structure models the remote entity configuration information as specified in
/// chapter 8.3 of the CFDP standard.
///
/// Some of the fields which were not considered necessary for this implementation were
/// omitted. Some other fields which are not contained inside the standard but are
/// considered necessary for this implementation are included.
///
/// ## Notes on Positive Acknowledgment Procedures
///
/// The `positive_ack_timer_interval_seconds` and `positive_ack_timer_expiration_limit`
/// will be used for positive acknowledgement procedures as specified in CFDP chapter
/// 4.7. The sending entity will start the timer for any PDUs where an acknowledgment is
/// required (e.g. EOF PDU). Once the expected ACK response has not been received for
/// that interval, a counter will be incremented and the timer will be reset. Once the
/// counter exceeds the `positive_ack_timer_expiration_limit`, a Positive ACK Limit
/// Reached fault will be declared.
///
/// ## Notes on Deferred Lost Segment Procedures
///
/// This procedure will be active if an EOF (No Error) PDU is received in acknowledged
/// mode. After issuing the NAK sequence which has the whole file scope, a timer will be
/// started. The timer is reset when missing segments or missing metadata is received.
/// The timer will be deactivated if all missing data is received. If the timer expires,
/// a new NAK sequence will be issued and a counter will be incremented, which can lead
/// to a NAK Limit Reached fault being declared.
///
/// ## Fields
///
/// * `entity_id` - The ID of the remote entity.
/// * `max_packet_len` - This determines the maximum length of all PDUs generated for
///   that remote entity in addition to the `max_file_segment_len` attribute which also
///   determines the size of file data PDUs.
/// * `max_file_segment_len` - The maximum file segment length which determines the
///   maximum size of file data PDUs in addition to the `max_packet_len` attribute. If
///   this field is set to None, the maximum file segment length will be derived from the
///   maximum packet length. If this has some value which is smaller than the segment
///   value derived from `max_packet_len`, this value will be picked.
/// * `closure_requested_by_default` - If the closure requested field is not supplied as
///   part of the Put Request, it will be determined from this field in the remote
///   configuration.
/// * `crc_on_transmission_by_default` - If the CRC option is not supplied as part of the
///   Put Request, it will be determined from this field in the remote configuration.
/// * `default_transmission_mode` - If the transmission mode is not supplied as part of
///   the Put Request, it will be determined from this field in the remote configuration.
/// * `default_checksum_type` - Default checksum type used for all file transmissions to
///   this remote entity. Kept as the raw SANA identifier so that checksum types
///   registered at runtime in the [checksum::ChecksumRegistry] can be used as well.
/// * `disposition_on_cancellation` - Determines whether an incomplete received file is
///   discarded on transaction cancellation. Defaults to False.
/// * `check_limit` - This timer determines the expiry period for incrementing a check
///   counter after an EOF PDU is received for an incomplete file transfer. This allows
///   out-of-order reception of file data PDUs and EOF PDUs. Also see 4.6.3.3 of the CFDP
///   standard. Defaults to 2, so the check limit timer may expire twice.
/// * `positive_ack_timer_interval_seconds` - See the notes on the Positive
///   Acknowledgment Procedures above. Expected as floating point seconds. Defaults to 10
///   seconds.
/// * `positive_ack_timer_expiration_limit` - See the notes on the Positive
///   Acknowledgment Procedures above. Defaults to 2, so the timer may expire twice.
/// * `immediate_nak_mode` - Specifies whether a NAK sequence should be issued
///   immediately when a file data gap or lost metadata is detected in the acknowledged
///   mode. Defaults to True.
/// * `nak_timer_interval_seconds` - See the notes on the Deferred Lost Segment
///   Procedures above. Expected as floating point seconds. Defaults to 10 seconds.
/// * `nak_timer_expiration_limit` - See the notes on the Deferred Lost Segment
///   Procedures above. Defaults to 2, so the timer may expire two times.
/// * `keep_alive_discrepancy_limit` - If set, the sending entity compares the progress
///   reported in received Keep Alive PDUs against its own transmission progress. A
///   discrepancy larger than this limit declares a Keep Alive Limit Reached fault as
///   specified in chapter 4.6.5.3 of the CFDP standard. Defaults to None, which
///   disables the check.
/// * `transaction_inactivity_limit_seconds` - Expiry period of the transaction
///   inactivity timer as specified in chapter 4.10 of the CFDP standard. Expected as
///   floating point seconds. Defaults to 60 seconds.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    pub max_packet_len: usize,
    pub max_file_segment_len: Option<usize>,
    pub closure_requested_by_default: bool,
    pub crc_on_transmission_by_default: bool,
    pub default_transmission_mode: TransmissionMode,
    pub default_checksum_type: u8,
    pub positive_ack_timer_interval_seconds: f32,
    pub positive_ack_timer_expiration_limit: u32,
    pub check_limit: u32,
    pub disposition_on_cancellation: bool,
    pub immediate_nak_mode: bool,
    pub nak_timer_interval_seconds: f32,
    pub nak_timer_expiration_limit: u32,
    pub keep_alive_discrepancy_limit: Option<u64>,
    pub transaction_inactivity_limit_seconds: f32,
}

impl RemoteEntityConfig {
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_packet_len: usize,
        closure_requested_by_default: bool,
        crc_on_transmission_by_default: bool,
        default_transmission_mode: TransmissionMode,
        default_checksum_type: impl Into<u8>,
    ) -> Self {
        Self {
            entity_id,
            max_file_segment_len: None,
            max_packet_len,
            closure_requested_by_default,
            crc_on_transmission_by_default,
            default_transmission_mode,
            default_checksum_type: default_checksum_type.into(),
            check_limit: 2,
            positive_ack_timer_interval_seconds: 10.0,
            positive_ack_timer_expiration_limit: 2,
            disposition_on_cancellation: false,
            immediate_nak_mode: true,
            nak_timer_interval_seconds: 10.0,
            nak_timer_expiration_limit: 2,
            keep_alive_discrepancy_limit: None,
            transaction_inactivity_limit_seconds: 60.0,
        }
    }
}

pub trait RemoteConfigStore {
    /// Retrieve the remote entity configuration for the given remote ID.
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig>;
    /// Add a new remote configuration. Returns [true] if a configuration for the remote
    /// ID already existed and was replaced.
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool;
    /// Remove a configuration. Returns [true] if the configuration was removed
    /// successfully, and [false] if no configuration exists for the given remote ID.
    fn remove_config(&mut self, remote_id: u64) -> bool;
}

/// This is a thin wrapper around a [HashMap] to store remote entity configurations.
/// It implements the full [RemoteConfigStore] trait.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StdRemoteConfigStore(pub HashMap<u64, RemoteEntityConfig>);

impl RemoteConfigStore for StdRemoteConfigStore {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }
    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0.get_mut(&remote_id)
    }
    fn add_config(&mut self, cfg: &RemoteEntityConfig) -> bool {
        self.0.insert(cfg.entity_id.value(), *cfg).is_some()
    }
    fn remove_config(&mut self, remote_id: u64) -> bool {
        self.0.remove(&remote_id).is_some()
    }
}

/// A single remote entity configuration also implements the [RemoteConfigStore], but
/// [RemoteConfigStore::add_config] and [RemoteConfigStore::remove_config] are no-ops
/// and always return [false].
impl RemoteConfigStore for RemoteEntityConfig {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        if remote_id == self.entity_id.value() {
            return Some(self);
        }
        None
    }

    fn add_config(&mut self, _cfg: &RemoteEntityConfig) -> bool {
        false
    }

    fn remove_config(&mut self, _remote_id: u64) -> bool {
        false
    }
}

/// This trait introduces some callbacks which will be called when a particular CFDP
/// fault handler is called.
///
/// It is passed into the CFDP handlers as part of the local entity configuration and
/// provides a way to specify custom user error handlers. This allows to implement some
/// CFDP features like fault handler logging, which would not be possible generically
/// otherwise.
///
/// For each error reported by the [FaultHandler], the appropriate fault handler callback
/// will be called depending on the [FaultHandlerCode].
pub trait UserFaultHook {
    fn notice_of_suspension_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    );

    fn notice_of_cancellation_cb(
        &mut self,
        transaction_id: TransactionId,
        cond: ConditionCode,
        progress: u64,
    );

    fn abandoned_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64);

    fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64);
}

/// Dummy fault hook which implements [UserFaultHook] but only provides empty
/// implementations.
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DummyFaultHook {}

impl UserFaultHook for DummyFaultHook {
    fn notice_of_suspension_cb(
        &mut self,
        _transaction_id: TransactionId,
        _cond: ConditionCode,
        _progress: u64,
    ) {
    }

    fn notice_of_cancellation_cb(
        &mut self,
        _transaction_id: TransactionId,
        _cond: ConditionCode,
        _progress: u64,
    ) {
    }

    fn abandoned_cb(
        &mut self,
        _transaction_id: TransactionId,
        _cond: ConditionCode,
        _progress: u64,
    ) {
    }

    fn ignore_cb(&mut self, _transaction_id: TransactionId, _cond: ConditionCode, _progress: u64) {}
}

/// This structure is used to implement the fault handling as specified in chapter 4.8
/// of the CFDP standard.
///
/// It does so by mapping each applicable [ConditionCode] to a fault handler which is
/// denoted by the four [FaultHandlerCode]s. This code is used to select the error
/// handling inside the CFDP handler itself in addition to dispatching to a user-provided
/// callback function provided by the [UserFaultHook].
///
/// Some notes on the provided default settings:
///
/// - Checksum failures will be ignored by default. This is because for unacknowledged
///   transfers, cancelling the transfer immediately would interfere with the check limit
///   mechanism specified in chapter 4.6.3.3.
/// - Unsupported checksum types will also be ignored by default. Even if the checksum
///   type is not supported the file transfer might still have worked properly.
///
/// For all other faults, the default fault handling operation will be to cancel the
/// transaction. These defaults can be overriden by using the [Self::set_fault_handler]
/// method. Please note that in any case, fault handler overrides can be specified by the
/// sending CFDP entity.
pub struct FaultHandler<UserHandler: UserFaultHook> {
    handler_array: [FaultHandlerCode; 10],
    // Could also change the user fault handler trait to have non mutable methods, but
    // that limits flexbility on the user side..
    pub user_hook: RefCell<UserHandler>,
}

impl<UserHandler: UserFaultHook> FaultHandler<UserHandler> {
    fn condition_code_to_array_index(conditon_code: ConditionCode) -> Option<usize> {
        Some(match conditon_code {
            ConditionCode::PositiveAckLimitReached => 0,
            ConditionCode::KeepAliveLimitReached => 1,
            ConditionCode::InvalidTransmissionMode => 2,
            ConditionCode::FilestoreRejection => 3,
            ConditionCode::FileChecksumFailure => 4,
            ConditionCode::FileSizeError => 5,
            ConditionCode::NakLimitReached => 6,
            ConditionCode::InactivityDetected => 7,
            ConditionCode::CheckLimitReached => 8,
            ConditionCode::UnsupportedChecksumType => 9,
            _ => return None,
        })
    }

    pub fn new(user_fault_handler: UserHandler) -> Self {
        let mut init_array = [FaultHandlerCode::NoticeOfCancellation; 10];
        init_array
            [Self::condition_code_to_array_index(ConditionCode::FileChecksumFailure).unwrap()] =
            FaultHandlerCode::IgnoreError;
        init_array[Self::condition_code_to_array_index(ConditionCode::UnsupportedChecksumType)
            .unwrap()] = FaultHandlerCode::IgnoreError;
        Self {
            handler_array: init_array,
            user_hook: RefCell::new(user_fault_handler),
        }
    }

    pub fn set_fault_handler(
        &mut self,
        condition_code: ConditionCode,
        fault_handler: FaultHandlerCode,
    ) {
        let Some(array_idx) = Self::condition_code_to_array_index(condition_code) else {
            return;
        };
        self.handler_array[array_idx] = fault_handler;
    }

    pub fn get_fault_handler(&self, condition_code: ConditionCode) -> FaultHandlerCode {
        let Some(array_idx) = Self::condition_code_to_array_index(condition_code) else {
            return FaultHandlerCode::IgnoreError;
        };
        self.handler_array[array_idx]
    }

    pub fn report_fault(
        &self,
        transaction_id: TransactionId,
        condition: ConditionCode,
        progress: u64,
    ) -> FaultHandlerCode {
        let Some(array_idx) = Self::condition_code_to_array_index(condition) else {
            return FaultHandlerCode::IgnoreError;
        };
        self.report_fault_with_code(self.handler_array[array_idx], transaction_id, condition, progress)
    }

    /// Like [Self::report_fault], but with an externally determined fault handler code.
    /// The CFDP handlers use this to escalate faults to a transaction abandonment where
    /// the standard requires it.
    pub fn report_fault_with_code(
        &self,
        fh_code: FaultHandlerCode,
        transaction_id: TransactionId,
        condition: ConditionCode,
        progress: u64,
    ) -> FaultHandlerCode {
        let mut handler_mut = self.user_hook.borrow_mut();
        match fh_code {
            FaultHandlerCode::NoticeOfCancellation => {
                handler_mut.notice_of_cancellation_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::NoticeOfSuspension => {
                handler_mut.notice_of_suspension_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::IgnoreError => {
                handler_mut.ignore_cb(transaction_id, condition, progress);
            }
            FaultHandlerCode::AbandonTransaction => {
                handler_mut.abandoned_cb(transaction_id, condition, progress);
            }
        }
        fh_code
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self {
            eof_sent: true,
            eof_recv: true,
            file_segment_recv: true,
            transaction_finished: true,
            suspended: true,
            resumed: true,
        }
    }
}

/// Each CFDP entity handler has a [LocalEntityConfig]uration.
pub struct LocalEntityConfig<UserFaultHookImpl: UserFaultHook> {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub fault_handler: FaultHandler<UserFaultHookImpl>,
}

impl<UserFaultHookImpl: UserFaultHook> LocalEntityConfig<UserFaultHookImpl> {
    pub fn new(
        id: UnsignedByteField,
        indication_cfg: IndicationConfig,
        hook: UserFaultHookImpl,
    ) -> Self {
        Self {
            id,
            indication_cfg,
            fault_handler: FaultHandler::new(hook),
        }
    }

    pub fn user_fault_hook_mut(&mut self) -> &mut RefCell<UserFaultHookImpl> {
        &mut self.fault_handler.user_hook
    }

    pub fn user_fault_hook(&self) -> &RefCell<UserFaultHookImpl> {
        &self.fault_handler.user_hook
    }
}

/// Generic error type for sending a PDU via a message queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
    #[error("queue is full, fill count {0:?}")]
    QueueFull(Option<u32>),
    #[error("other send error")]
    Other,
}

/// Sink for all PDUs generated by the handlers, for example a link layer or a message
/// queue towards a network task.
pub trait PduSendProvider {
    fn send_pdu(
        &self,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;
}

impl PduSendProvider for std::sync::mpsc::Sender<Vec<u8>> {
    fn send_pdu(
        &self,
        _pdu_type: PduType,
        _file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError> {
        self.send(raw_pdu.to_vec())
            .map_err(|_| GenericSendError::RxDisconnected)?;
        Ok(())
    }
}

/// Simple implementation of the [Countdown] trait assuming a standard runtime.
#[derive(Debug)]
pub struct StdCountdown {
    expiry_time: Duration,
    start_time: std::time::Instant,
}

impl StdCountdown {
    pub fn new(expiry_time: Duration) -> Self {
        Self {
            expiry_time,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn expiry_time_seconds(&self) -> u64 {
        self.expiry_time.as_secs()
    }
}

impl Countdown for StdCountdown {
    fn has_expired(&self) -> bool {
        if self.start_time.elapsed() > self.expiry_time {
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.start_time = std::time::Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct StdTimerCreator {
    pub check_limit_timeout: Duration,
}

impl StdTimerCreator {
    pub const fn new(check_limit_timeout: Duration) -> Self {
        Self {
            check_limit_timeout,
        }
    }
}

impl Default for StdTimerCreator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TimerCreator for StdTimerCreator {
    type Countdown = StdCountdown;

    fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown {
        match timer_context {
            TimerContext::CheckLimit {
                local_id: _,
                remote_id: _,
                entity_type: _,
            } => StdCountdown::new(self.check_limit_timeout),
            TimerContext::NakActivity { expiry_time } => StdCountdown::new(expiry_time),
            TimerContext::PositiveAck { expiry_time } => StdCountdown::new(expiry_time),
            TimerContext::Inactivity { expiry_time } => StdCountdown::new(expiry_time),
        }
    }
}

/// The CFDP transaction ID of a CFDP transaction consists of the source entity ID and
/// the sequence number of that transfer which is also determined by the CFDP source
/// entity.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.source_id.value().hash(state);
        self.seq_num.value().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.source_id.value() == other.source_id.value()
            && self.seq_num.value() == other.seq_num.value()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
    Idle = 0,
    Busy = 1,
    Suspended = 2,
}

#[cfg(test)]
pub(crate) mod tests {
    use core::cell::RefCell;
    use std::collections::VecDeque;
    use std::string::String;
    use std::vec::Vec;

    use crate::user::{
        CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams,
        TransactionReport,
    };

    use super::*;

    pub const LOCAL_ID: UnsignedByteField = UnsignedByteField::new(2, 1);
    pub const REMOTE_ID: UnsignedByteField = UnsignedByteField::new(2, 2);

    pub struct FileSegmentRecvdParamsNoSegMetadata {
        #[allow(dead_code)]
        pub id: TransactionId,
        pub offset: u64,
        pub length: usize,
    }

    #[derive(Default)]
    pub struct TestCfdpUser {
        pub next_expected_seq_num: u64,
        pub expected_full_src_name: String,
        pub expected_full_dest_name: String,
        pub expected_file_size: u64,
        pub transaction_indication_call_count: u32,
        pub eof_sent_call_count: u32,
        pub eof_recvd_call_count: u32,
        pub finished_indic_queue: VecDeque<TransactionFinishedParams>,
        pub metadata_recv_queue: VecDeque<MetadataReceivedParams>,
        pub file_seg_recvd_queue: VecDeque<FileSegmentRecvdParamsNoSegMetadata>,
        pub report_queue: VecDeque<TransactionReport>,
        pub suspended_queue: VecDeque<(TransactionId, ConditionCode)>,
        pub resumed_queue: VecDeque<(TransactionId, u64)>,
        pub fault_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub abandoned_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub disposed_queue: VecDeque<TransactionId>,
        pub expect_faults: bool,
    }

    impl TestCfdpUser {
        pub fn new(
            next_expected_seq_num: u64,
            expected_full_src_name: String,
            expected_full_dest_name: String,
            expected_file_size: u64,
        ) -> Self {
            Self {
                next_expected_seq_num,
                expected_full_src_name,
                expected_full_dest_name,
                expected_file_size,
                ..Default::default()
            }
        }

        pub fn generic_id_check(&self, id: &crate::TransactionId) {
            assert_eq!(id.source_id(), &LOCAL_ID);
            assert_eq!(id.seq_num().value(), self.next_expected_seq_num);
        }
    }

    impl CfdpUser for TestCfdpUser {
        fn transaction_indication(&mut self, id: &crate::TransactionId) {
            self.generic_id_check(id);
            self.transaction_indication_call_count += 1;
        }

        fn eof_sent_indication(&mut self, id: &crate::TransactionId) {
            self.generic_id_check(id);
            self.eof_sent_call_count += 1;
        }

        fn transaction_finished_indication(
            &mut self,
            finished_params: &TransactionFinishedParams,
        ) {
            self.generic_id_check(&finished_params.id);
            self.finished_indic_queue.push_back(*finished_params);
        }

        fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
            self.generic_id_check(&md_recvd_params.id);
            assert_eq!(md_recvd_params.src_file_name, self.expected_full_src_name);
            assert_eq!(md_recvd_params.dest_file_name, self.expected_full_dest_name);
            assert_eq!(md_recvd_params.source_id, LOCAL_ID);
            assert_eq!(md_recvd_params.file_size, self.expected_file_size);
            self.metadata_recv_queue.push_back(md_recvd_params.clone());
        }

        fn file_segment_recvd_indication(
            &mut self,
            segment_recvd_params: &FileSegmentRecvdParams,
        ) {
            self.generic_id_check(&segment_recvd_params.id);
            self.file_seg_recvd_queue
                .push_back(FileSegmentRecvdParamsNoSegMetadata {
                    id: segment_recvd_params.id,
                    offset: segment_recvd_params.offset,
                    length: segment_recvd_params.length,
                })
        }

        fn report_indication(&mut self, report: &TransactionReport) {
            self.report_queue.push_back(*report);
        }

        fn suspended_indication(
            &mut self,
            id: &crate::TransactionId,
            condition_code: ConditionCode,
        ) {
            self.suspended_queue.push_back((*id, condition_code));
        }

        fn resumed_indication(&mut self, id: &crate::TransactionId, progress: u64) {
            self.resumed_queue.push_back((*id, progress));
        }

        fn fault_indication(
            &mut self,
            id: &crate::TransactionId,
            condition_code: ConditionCode,
            progress: u64,
        ) {
            if !self.expect_faults {
                panic!("unexpected fault indication");
            }
            self.fault_queue.push_back((*id, condition_code, progress));
        }

        fn abandoned_indication(
            &mut self,
            id: &crate::TransactionId,
            condition_code: ConditionCode,
            progress: u64,
        ) {
            if !self.expect_faults {
                panic!("unexpected abandoned indication");
            }
            self.abandoned_queue
                .push_back((*id, condition_code, progress));
        }

        fn eof_recvd_indication(&mut self, id: &crate::TransactionId) {
            self.generic_id_check(id);
            self.eof_recvd_call_count += 1;
        }

        fn transaction_disposed_indication(&mut self, id: &crate::TransactionId) {
            self.disposed_queue.push_back(*id);
        }
    }

    #[derive(Default, Debug)]
    pub(crate) struct TestFaultHandler {
        pub notice_of_suspension_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub notice_of_cancellation_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub abandoned_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub ignored_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
    }

    impl UserFaultHook for TestFaultHandler {
        fn notice_of_suspension_cb(
            &mut self,
            transaction_id: TransactionId,
            cond: ConditionCode,
            progress: u64,
        ) {
            self.notice_of_suspension_queue
                .push_back((transaction_id, cond, progress))
        }

        fn notice_of_cancellation_cb(
            &mut self,
            transaction_id: TransactionId,
            cond: ConditionCode,
            progress: u64,
        ) {
            self.notice_of_cancellation_queue
                .push_back((transaction_id, cond, progress))
        }

        fn abandoned_cb(
            &mut self,
            transaction_id: TransactionId,
            cond: ConditionCode,
            progress: u64,
        ) {
            self.abandoned_queue
                .push_back((transaction_id, cond, progress))
        }

        fn ignore_cb(&mut self, transaction_id: TransactionId, cond: ConditionCode, progress: u64) {
            self.ignored_queue
                .push_back((transaction_id, cond, progress))
        }
    }

    impl TestFaultHandler {
        pub(crate) fn suspension_queue_empty(&self) -> bool {
            self.notice_of_suspension_queue.is_empty()
        }
        pub(crate) fn cancellation_queue_empty(&self) -> bool {
            self.notice_of_cancellation_queue.is_empty()
        }
        pub(crate) fn ignored_queue_empty(&self) -> bool {
            self.ignored_queue.is_empty()
        }
        pub(crate) fn abandoned_queue_empty(&self) -> bool {
            self.abandoned_queue.is_empty()
        }
        pub(crate) fn all_queues_empty(&self) -> bool {
            self.suspension_queue_empty()
                && self.cancellation_queue_empty()
                && self.ignored_queue_empty()
                && self.abandoned_queue_empty()
        }
    }

    pub struct SentPdu {
        pub pdu_type: PduType,
        pub file_directive_type: Option<FileDirectiveType>,
        pub raw_pdu: Vec<u8>,
    }

    #[derive(Default)]
    pub struct TestCfdpSender {
        pub packet_queue: RefCell<VecDeque<SentPdu>>,
    }

    impl PduSendProvider for TestCfdpSender {
        fn send_pdu(
            &self,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.packet_queue.borrow_mut().push_back(SentPdu {
                pdu_type,
                file_directive_type,
                raw_pdu: raw_pdu.to_vec(),
            });
            Ok(())
        }
    }

    impl TestCfdpSender {
        pub fn retrieve_next_pdu(&self) -> Option<SentPdu> {
            self.packet_queue.borrow_mut().pop_front()
        }
        pub fn queue_empty(&self) -> bool {
            self.packet_queue.borrow_mut().is_empty()
        }
    }

    pub fn basic_remote_cfg_table(
        dest_id: impl Into<UnsignedByteField>,
        max_packet_len: usize,
        crc_on_transmission_by_default: bool,
    ) -> StdRemoteConfigStore {
        let mut table = StdRemoteConfigStore::default();
        let remote_entity_cfg = RemoteEntityConfig::new_with_default_values(
            dest_id.into(),
            max_packet_len,
            false,
            crc_on_transmission_by_default,
            TransmissionMode::Unacknowledged,
            ChecksumType::Crc32,
        );
        table.add_config(&remote_entity_cfg);
        table
    }

    #[test]
    fn test_transaction_id() {
        let transaction_id = TransactionId::new(
            UnsignedByteField::new(2, 1),
            UnsignedByteField::new(2, 2),
        );
        assert_eq!(transaction_id.source_id().value(), 1);
        assert_eq!(transaction_id.seq_num().value(), 2);
    }

    #[test]
    fn test_fault_handler_defaults() {
        let fault_handler = FaultHandler::new(TestFaultHandler::default());
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::FileChecksumFailure),
            FaultHandlerCode::IgnoreError
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::UnsupportedChecksumType),
            FaultHandlerCode::IgnoreError
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::PositiveAckLimitReached),
            FaultHandlerCode::NoticeOfCancellation
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::NoError),
            FaultHandlerCode::IgnoreError
        );
    }

    #[test]
    fn test_fault_handler_reporting() {
        let mut fault_handler = FaultHandler::new(TestFaultHandler::default());
        fault_handler
            .set_fault_handler(ConditionCode::FileSizeError, FaultHandlerCode::NoticeOfSuspension);
        let id = TransactionId::new(LOCAL_ID, UnsignedByteField::new(2, 10));
        let code = fault_handler.report_fault(id, ConditionCode::FileSizeError, 42);
        assert_eq!(code, FaultHandlerCode::NoticeOfSuspension);
        let hook = fault_handler.user_hook.borrow();
        assert_eq!(hook.notice_of_suspension_queue.len(), 1);
        assert_eq!(hook.notice_of_suspension_queue[0], (id, ConditionCode::FileSizeError, 42));
    }

    #[test]
    fn test_remote_config_store() {
        let mut store = basic_remote_cfg_table(REMOTE_ID, 512, true);
        assert!(store.get(REMOTE_ID.value()).is_some());
        assert!(store.get(99).is_none());
        let cfg = store.get_mut(REMOTE_ID.value()).unwrap();
        cfg.check_limit = 5;
        assert_eq!(store.get(REMOTE_ID.value()).unwrap().check_limit, 5);
        assert!(store.remove_config(REMOTE_ID.value()));
        assert!(!store.remove_config(REMOTE_ID.value()));
    }

    #[test]
    fn test_single_remote_config_as_store() {
        let mut cfg = RemoteEntityConfig::new_with_default_values(
            REMOTE_ID,
            512,
            true,
            false,
            TransmissionMode::Unacknowledged,
            ChecksumType::Crc32,
        );
        assert!(cfg.get(REMOTE_ID.value()).is_some());
        assert!(cfg.get(5).is_none());
        assert!(!cfg.remove_config(REMOTE_ID.value()));
    }

    #[test]
    fn test_std_countdown() {
        let mut countdown = StdCountdown::new(Duration::from_millis(50));
        assert!(!countdown.has_expired());
        assert_eq!(countdown.expiry_time_seconds(), 0);
        std::thread::sleep(Duration::from_millis(60));
        assert!(countdown.has_expired());
        countdown.reset();
        assert!(!countdown.has_expired());
    }
}
