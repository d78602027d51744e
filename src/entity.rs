//! # CFDP Entity Dispatcher Module
//!
//! The [EntityDispatcher] multiplexes multiple concurrent CFDP transactions over one
//! local entity. It owns a transaction table which maps transaction IDs to dedicated
//! [SourceHandler] or [DestinationHandler] instances and routes inbound PDUs,
//! application put requests and operator requests to the correct handler.
//!
//! The dispatcher is the single place where raw PDUs enter the entity. Received byte
//! buffers are deserialized once with [CfdpPdu::from_bytes] and demultiplexed based on
//! the packet target and the transaction ID encoded in the PDU header.
use crate::checksum::ChecksumRegistry;
use crate::dest::{DestError, DestinationHandler};
use crate::filestore::VirtualFilestore;
use crate::pdu::prompt::PromptResponseRequired;
use crate::pdu::{CfdpPdu, ConditionCode, PacketTarget, PduBody, PduError};
use crate::request::{OperatorRequest, PutRequest};
use crate::source::{PutRequestError, SourceError, SourceHandler};
use crate::time::Countdown;
use crate::user::CfdpUser;
use crate::util::UnsignedByteField;
use crate::{
    IndicationConfig, LocalEntityConfig, PduSendProvider, RemoteConfigStore,
    RemoteEntityConfig, State, TimerCreator, TransactionId, UserFaultHook,
};
use hashbrown::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DispatcherError {
    #[error("error deserializing PDU: {0}")]
    Pdu(#[from] PduError),
    #[error("source handler error: {0}")]
    Source(#[from] SourceError),
    #[error("destination handler error: {0}")]
    Dest(#[from] DestError),
    #[error("put request error: {0}")]
    PutRequest(#[from] PutRequestError),
    #[error("no remote entity configuration found for {0:?}")]
    NoRemoteCfgFound(UnsignedByteField),
}

enum TransactionHandler<
    PduSenderInstance: PduSendProvider,
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
> {
    Source(
        SourceHandler<
            PduSenderInstance,
            UserFaultHookInstance,
            Vfs,
            RemoteEntityConfig,
            TimerCreatorInstance,
            CountdownInstance,
        >,
    ),
    Dest(
        DestinationHandler<
            PduSenderInstance,
            UserFaultHookInstance,
            Vfs,
            RemoteEntityConfig,
            TimerCreatorInstance,
            CountdownInstance,
        >,
    ),
}

impl<
        PduSenderInstance: PduSendProvider,
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
    >
    TransactionHandler<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        TimerCreatorInstance,
        CountdownInstance,
    >
{
    fn state(&self) -> State {
        match self {
            Self::Source(handler) => handler.state(),
            Self::Dest(handler) => handler.state(),
        }
    }
}

/// Entity-level dispatcher which runs multiple concurrent CFDP transactions.
///
/// One handler instance is created per transaction from cloneable building blocks: the
/// PDU sender, the virtual filestore, the user fault hook and the timer creator. Each
/// handler receives a copy of the [RemoteEntityConfig] of its transaction peer, looked
/// up once in the dispatcher-level [RemoteConfigStore] when the transaction starts.
///
/// Completed transaction IDs are remembered so that late duplicate PDUs, for example a
/// retransmitted EOF after the Finished PDU was already processed, do not spawn ghost
/// transactions.
pub struct EntityDispatcher<
    PduSenderInstance: PduSendProvider + Clone,
    UserFaultHookInstance: UserFaultHook + Clone,
    Vfs: VirtualFilestore + Clone,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance> + Clone,
    CountdownInstance: Countdown,
> {
    local_id: UnsignedByteField,
    indication_cfg: IndicationConfig,
    fault_hook: UserFaultHookInstance,
    pdu_sender: PduSenderInstance,
    vfs: Vfs,
    remote_cfg_table: RemoteConfigStoreInstance,
    checksum_registry: ChecksumRegistry,
    cksum_buf_size: usize,
    timer_creator: TimerCreatorInstance,
    seq_num_width: usize,
    seq_num_counter: u64,
    transactions: HashMap<
        TransactionId,
        TransactionHandler<
            PduSenderInstance,
            UserFaultHookInstance,
            Vfs,
            TimerCreatorInstance,
            CountdownInstance,
        >,
    >,
    completed: HashSet<TransactionId>,
}

impl<
        PduSenderInstance: PduSendProvider + Clone,
        UserFaultHookInstance: UserFaultHook + Clone,
        Vfs: VirtualFilestore + Clone,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance> + Clone,
        CountdownInstance: Countdown,
    >
    EntityDispatcher<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
    >
{
    /// Creates a new entity dispatcher.
    ///
    /// # Arguments
    ///
    /// * `local_id` - ID of this CFDP entity.
    /// * `indication_cfg` - Indication configuration applied to all transactions.
    /// * `fault_hook` - Fault hook template, cloned into each transaction handler.
    /// * `pdu_sender` - [PduSendProvider] cloned into each transaction handler.
    /// * `vfs` - [VirtualFilestore] cloned into each transaction handler.
    /// * `remote_cfg_table` - Configurations for all remote entities this entity
    ///   communicates with.
    /// * `checksum_registry` - Checksum algorithms supported by this entity.
    /// * `cksum_buf_size` - Size of the per-handler checksum calculation buffer.
    /// * `timer_creator` - [TimerCreator] cloned into each transaction handler.
    /// * `seq_num_width` - Byte width of generated transaction sequence numbers, 1 to
    ///   8 octets.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: UnsignedByteField,
        indication_cfg: IndicationConfig,
        fault_hook: UserFaultHookInstance,
        pdu_sender: PduSenderInstance,
        vfs: Vfs,
        remote_cfg_table: RemoteConfigStoreInstance,
        checksum_registry: ChecksumRegistry,
        cksum_buf_size: usize,
        timer_creator: TimerCreatorInstance,
        seq_num_width: usize,
    ) -> Self {
        Self {
            local_id,
            indication_cfg,
            fault_hook,
            pdu_sender,
            vfs,
            remote_cfg_table,
            checksum_registry,
            cksum_buf_size,
            timer_creator,
            seq_num_width,
            seq_num_counter: 0,
            transactions: HashMap::new(),
            completed: HashSet::new(),
        }
    }

    #[inline]
    pub fn local_id(&self) -> UnsignedByteField {
        self.local_id
    }

    /// Number of transactions currently in the transaction table.
    #[inline]
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    #[inline]
    pub fn is_transaction_active(&self, id: &TransactionId) -> bool {
        self.transactions.contains_key(id)
    }

    /// IDs of all transactions currently in the transaction table.
    pub fn transaction_ids(&self) -> impl Iterator<Item = &TransactionId> {
        self.transactions.keys()
    }

    pub fn remote_cfg_table_mut(&mut self) -> &mut RemoteConfigStoreInstance {
        &mut self.remote_cfg_table
    }

    /// Models the Put.request CFDP primitive, CCSDS 727.0-B-5 3.4.1.
    ///
    /// Allocates a transaction sequence number, creates a dedicated source handler for
    /// the transaction and starts it. The returned [TransactionId] is the key for all
    /// subsequent operator requests targeting this transaction.
    pub fn put(&mut self, request: PutRequest) -> Result<TransactionId, DispatcherError> {
        let Some(remote_cfg) = self.remote_cfg_table.get(request.destination_id.value()) else {
            return Err(DispatcherError::NoRemoteCfgFound(request.destination_id));
        };
        let remote_cfg = *remote_cfg;
        let seq_num = self.next_seq_num();
        let mut handler = SourceHandler::new(
            self.local_cfg(),
            self.pdu_sender.clone(),
            self.vfs.clone(),
            remote_cfg,
            self.checksum_registry.clone(),
            self.cksum_buf_size,
            self.timer_creator.clone(),
        );
        let transaction_id = handler.put_request(request, seq_num)?;
        self.transactions
            .insert(transaction_id, TransactionHandler::Source(handler));
        Ok(transaction_id)
    }

    /// Deserializes a raw PDU and routes it with [Self::insert_packet].
    pub fn insert_raw_packet(
        &mut self,
        user: &mut impl CfdpUser,
        raw_pdu: &[u8],
    ) -> Result<u32, DispatcherError> {
        let pdu = CfdpPdu::from_bytes(raw_pdu)?;
        self.insert_packet(user, &pdu)
    }

    /// Routes a PDU to the handler of its transaction, per CCSDS 727.0-B-5 4.5.3.
    ///
    /// A Metadata, File Data or EOF PDU for an unknown transaction starts a new
    /// destination handler. PDUs for already completed transactions are dropped
    /// silently. Any other PDU for an unknown transaction is dropped with a fault
    /// indication to the user, carrying [ConditionCode::NoError] because the standard
    /// does not define a condition code for this event. Returns the number of PDUs
    /// sent in reaction.
    pub fn insert_packet(
        &mut self,
        user: &mut impl CfdpUser,
        packet: &CfdpPdu,
    ) -> Result<u32, DispatcherError> {
        let transaction_id =
            TransactionId::new(packet.source_id(), packet.transaction_seq_num());
        if self.completed.contains(&transaction_id) {
            return Ok(0);
        }
        let target = packet.packet_target();
        if !self.transactions.contains_key(&transaction_id) {
            if target != PacketTarget::DestEntity
                || !matches!(
                    packet.body(),
                    PduBody::Metadata(_) | PduBody::FileData(_) | PduBody::Eof(_)
                )
            {
                user.fault_indication(&transaction_id, ConditionCode::NoError, 0);
                return Ok(0);
            }
            let Some(remote_cfg) = self.remote_cfg_table.get(packet.source_id().value())
            else {
                return Err(DispatcherError::NoRemoteCfgFound(packet.source_id()));
            };
            let remote_cfg = *remote_cfg;
            let handler = DestinationHandler::new(
                self.local_cfg(),
                self.pdu_sender.clone(),
                self.vfs.clone(),
                remote_cfg,
                self.checksum_registry.clone(),
                self.cksum_buf_size,
                self.timer_creator.clone(),
            );
            self.transactions
                .insert(transaction_id, TransactionHandler::Dest(handler));
        }
        let handler = self.transactions.get_mut(&transaction_id).unwrap();
        let sent_packets = match (handler, target) {
            (TransactionHandler::Source(handler), PacketTarget::SourceEntity) => {
                handler.state_machine(user, Some(packet))?
            }
            (TransactionHandler::Dest(handler), PacketTarget::DestEntity) => {
                handler.state_machine(user, Some(packet))?
            }
            // Handler role does not match the packet target, drop the PDU.
            _ => return Ok(0),
        };
        self.dispose_if_finished(user, transaction_id);
        Ok(sent_packets)
    }

    /// Drives all active transactions. Should be called periodically to handle
    /// timeouts and retransmissions. Returns the number of sent PDUs.
    pub fn state_machine(&mut self, user: &mut impl CfdpUser) -> Result<u32, DispatcherError> {
        let ids: Vec<TransactionId> = self.transactions.keys().copied().collect();
        let mut sent_packets = 0;
        for id in ids {
            let Some(handler) = self.transactions.get_mut(&id) else {
                continue;
            };
            sent_packets += match handler {
                TransactionHandler::Source(handler) => handler.state_machine_no_packet(user)?,
                TransactionHandler::Dest(handler) => handler.state_machine_no_packet(user)?,
            };
            self.dispose_if_finished(user, id);
        }
        Ok(sent_packets)
    }

    /// Routes an [OperatorRequest] to the handler of the targeted transaction.
    ///
    /// Returns [false] if the transaction is not active or the request does not apply
    /// to the handler role, for example a NAK prompt for a receiving transaction.
    pub fn operator_request(
        &mut self,
        user: &mut impl CfdpUser,
        request: OperatorRequest,
    ) -> Result<bool, DispatcherError> {
        let transaction_id = *request.transaction_id();
        let Some(handler) = self.transactions.get_mut(&transaction_id) else {
            return Ok(false);
        };
        let handled = match request {
            OperatorRequest::Report(_) => {
                match handler {
                    TransactionHandler::Source(handler) => handler.report_request(user),
                    TransactionHandler::Dest(handler) => handler.report_request(user),
                }
                true
            }
            OperatorRequest::Suspend(_) => match handler {
                TransactionHandler::Source(handler) => handler.suspend_request(user),
                TransactionHandler::Dest(handler) => handler.suspend_request(user),
            },
            OperatorRequest::Resume(_) => match handler {
                TransactionHandler::Source(handler) => handler.resume_request(user),
                TransactionHandler::Dest(handler) => handler.resume_request(user),
            },
            OperatorRequest::Cancel(_) => match handler {
                TransactionHandler::Source(handler) => {
                    handler.cancel_request(user, &transaction_id)?
                }
                TransactionHandler::Dest(handler) => {
                    handler.cancel_request(user, &transaction_id)?
                }
            },
            OperatorRequest::PromptNak(_) => match handler {
                TransactionHandler::Source(handler) => {
                    handler.send_prompt(PromptResponseRequired::Nak)? > 0
                }
                TransactionHandler::Dest(_) => false,
            },
            OperatorRequest::PromptKeepAlive(_) => match handler {
                TransactionHandler::Source(handler) => {
                    handler.send_prompt(PromptResponseRequired::KeepAlive)? > 0
                }
                TransactionHandler::Dest(_) => false,
            },
        };
        self.dispose_if_finished(user, transaction_id);
        Ok(handled)
    }

    /// Cancels all active transactions and removes them from the transaction table.
    ///
    /// The closing handshakes of acknowledged transactions are not awaited, the
    /// handlers are dropped right after the cancel was processed. A disposed
    /// indication is emitted for every removed transaction.
    pub fn dispose(&mut self, user: &mut impl CfdpUser) -> Result<(), DispatcherError> {
        let ids: Vec<TransactionId> = self.transactions.keys().copied().collect();
        for id in ids {
            if let Some(handler) = self.transactions.get_mut(&id) {
                match handler {
                    TransactionHandler::Source(handler) => {
                        handler.cancel_request(user, &id)?;
                    }
                    TransactionHandler::Dest(handler) => {
                        handler.cancel_request(user, &id)?;
                    }
                }
            }
            self.transactions.remove(&id);
            self.completed.insert(id);
            user.transaction_disposed_indication(&id);
        }
        Ok(())
    }

    fn local_cfg(&self) -> LocalEntityConfig<UserFaultHookInstance> {
        LocalEntityConfig::new(self.local_id, self.indication_cfg, self.fault_hook.clone())
    }

    fn next_seq_num(&mut self) -> UnsignedByteField {
        let mask = if self.seq_num_width >= 8 {
            u64::MAX
        } else {
            (1 << (self.seq_num_width * 8)) - 1
        };
        let seq_num = self.seq_num_counter & mask;
        self.seq_num_counter = (self.seq_num_counter + 1) & mask;
        UnsignedByteField::new(self.seq_num_width, seq_num)
    }

    fn dispose_if_finished(&mut self, user: &mut impl CfdpUser, id: TransactionId) {
        let finished = self
            .transactions
            .get(&id)
            .is_some_and(|handler| handler.state() == State::Idle);
        if finished {
            self.transactions.remove(&id);
            self.completed.insert(id);
            user.transaction_disposed_indication(&id);
        }
    }
}
