//! Per-remote replication session.
//!
//! A session owns the two reliable senders toward one secondary, one for
//! the replication stream, one for the copy stream, plus the ack
//! bookkeeping: the four LSNs a secondary reports, which never regress.

use std::sync::{Arc, Mutex, Weak};

use stratum_async::AsyncRuntime;
use stratum_types::{Epoch, IncarnationId, Lsn, Operation, ReplicaId, ReplicationEndpointId};
use stratum_wire::{AckBody, FromHeader, Message, MessageBody, StartCopyBody, Transport, WireOperation};

use crate::sender::{ReliableOperationSender, SendKind, SenderConfig};
use crate::ReplicatorConfig;

/// Whether the remote participates in configurations or is being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Idle,
    Active,
}

struct SessionState {
    role: SessionRole,
    must_catch_up: bool,
    soft_close: bool,
    /// The session's progress counts toward the completed LSN only once
    /// established (copy finished, or progress known at configuration
    /// time).
    progress_established: bool,
    repl_received: Lsn,
    repl_applied: Lsn,
    copy_received: Lsn,
    copy_applied: Lsn,
}

type AckListener = Box<dyn Fn() + Send + Sync + 'static>;

/// Tracks one remote across its copy and replication lifetime.
pub struct ReplicationSession {
    remote: ReplicationEndpointId,
    remote_address: String,
    local: FromHeader,
    transport: Arc<dyn Transport>,
    epoch: Mutex<Epoch>,
    max_message_size: u64,
    repl_sender: Arc<ReliableOperationSender>,
    copy_sender: Arc<ReliableOperationSender>,
    state: Mutex<SessionState>,
    ack_listener: Mutex<Option<AckListener>>,
    me: Weak<Self>,
}

impl ReplicationSession {
    pub fn new(
        config: &ReplicatorConfig,
        runtime: Arc<AsyncRuntime>,
        transport: Arc<dyn Transport>,
        local: FromHeader,
        remote: ReplicationEndpointId,
        remote_address: impl Into<String>,
        role: SessionRole,
        epoch: Epoch,
        initial_progress: Lsn,
    ) -> Arc<Self> {
        let repl_sender = ReliableOperationSender::new(
            format!("repl-{}", remote.replica_id),
            SenderConfig {
                retry_interval: config.retry_interval,
                initial_send_window: config.initial_replication_queue_size,
                max_send_window: config.max_replication_queue_size,
            },
            Arc::clone(&runtime),
        );
        let copy_sender = ReliableOperationSender::new(
            format!("copy-{}", remote.replica_id),
            SenderConfig {
                retry_interval: config.retry_interval,
                initial_send_window: config.initial_copy_queue_size,
                max_send_window: config.max_copy_queue_size,
            },
            Arc::clone(&runtime),
        );

        let established = !initial_progress.is_invalid();
        Arc::new_cyclic(|me| Self {
            remote,
            remote_address: remote_address.into(),
            local,
            transport,
            epoch: Mutex::new(epoch),
            max_message_size: config.max_replication_message_size,
            repl_sender,
            copy_sender,
            state: Mutex::new(SessionState {
                role,
                must_catch_up: false,
                soft_close: false,
                progress_established: established,
                repl_received: initial_progress,
                repl_applied: initial_progress,
                copy_received: Lsn::INVALID,
                copy_applied: Lsn::INVALID,
            }),
            ack_listener: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Wires both senders to the transport.
    pub fn open(&self) {
        let me = self.me.clone();
        self.repl_sender.open(Box::new(move |op, kind, completed| {
            let Some(session) = me.upgrade() else {
                return false;
            };
            session.send_replication(op, kind, completed)
        }));

        let me = self.me.clone();
        self.copy_sender.open(Box::new(move |op, kind, _completed| {
            let Some(session) = me.upgrade() else {
                return false;
            };
            session.send_copy(op, kind)
        }));
    }

    /// Closes both senders and drops their pending references.
    pub fn close(&self) {
        self.repl_sender.close();
        self.copy_sender.close();
    }

    pub fn remote(&self) -> &ReplicationEndpointId {
        &self.remote
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.remote.replica_id
    }

    pub fn incarnation_id(&self) -> IncarnationId {
        self.remote.incarnation_id
    }

    pub fn role(&self) -> SessionRole {
        self.state.lock().expect("lock poisoned").role
    }

    /// Promotes an idle session to active in place, preserving its
    /// senders and progress.
    pub fn promote_to_active(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.role == SessionRole::Idle {
            state.role = SessionRole::Active;
            tracing::debug!(replica = %self.remote.replica_id, "idle session promoted to active");
        }
    }

    pub fn set_must_catch_up(&self, value: bool) {
        self.state.lock().expect("lock poisoned").must_catch_up = value;
    }

    pub fn must_catch_up(&self) -> bool {
        self.state.lock().expect("lock poisoned").must_catch_up
    }

    /// Marks the session for close once the reconfiguration settles.
    pub fn mark_for_close(&self) {
        self.state.lock().expect("lock poisoned").soft_close = true;
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.state.lock().expect("lock poisoned").soft_close
    }

    pub fn progress_established(&self) -> bool {
        self.state.lock().expect("lock poisoned").progress_established
    }

    pub fn establish_progress(&self) {
        self.state.lock().expect("lock poisoned").progress_established = true;
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        *self.epoch.lock().expect("lock poisoned") = epoch;
    }

    /// `(replication received, replication applied)`.
    pub fn replication_progress(&self) -> (Lsn, Lsn) {
        let state = self.state.lock().expect("lock poisoned");
        (state.repl_received, state.repl_applied)
    }

    /// `(copy received, copy applied)`.
    pub fn copy_progress(&self) -> (Lsn, Lsn) {
        let state = self.state.lock().expect("lock poisoned");
        (state.copy_received, state.copy_applied)
    }

    pub fn replication_sender(&self) -> &Arc<ReliableOperationSender> {
        &self.repl_sender
    }

    pub fn copy_sender(&self) -> &Arc<ReliableOperationSender> {
        &self.copy_sender
    }

    /// Queues a replication operation toward the remote. Operations at or
    /// below the remote's acknowledged receive LSN are already there and
    /// are not re-offered.
    pub fn add_replication_operation(&self, op: Arc<Operation>) {
        let already_received = {
            let state = self.state.lock().expect("lock poisoned");
            op.lsn() <= state.repl_received
        };
        if already_received {
            return;
        }
        self.repl_sender.add(op);
    }

    /// Queues a copy operation toward the remote.
    pub fn add_copy_operation(&self, op: Arc<Operation>) {
        self.copy_sender.add(op);
    }

    /// Observes one acknowledgement from the remote.
    ///
    /// The four LSNs never regress; a regressed field in a reordered ack
    /// is clamped (and asserted in debug builds; a remote that regresses
    /// violates its contract).
    pub fn process_ack(&self, ack: &AckBody) {
        {
            let mut state = self.state.lock().expect("lock poisoned");
            debug_assert!(
                ack.repl_received >= state.repl_received || ack.repl_received.is_invalid(),
                "replication receive ack regressed"
            );
            state.repl_received = state.repl_received.max(ack.repl_received);
            state.repl_applied = state.repl_applied.max(ack.repl_quorum);
            state.copy_received = state.copy_received.max(ack.copy_received);
            state.copy_applied = state.copy_applied.max(ack.copy_quorum);
        }

        self.repl_sender
            .process_on_ack(ack.repl_received, ack.repl_quorum);
        self.copy_sender
            .process_on_ack(ack.copy_received, ack.copy_quorum);

        let listener = self.ack_listener.lock().expect("lock poisoned");
        if let Some(listener) = listener.as_ref() {
            listener();
        }
    }

    /// Registers the owner's reaction to ack progress (quorum
    /// recomputation on the primary).
    pub fn set_ack_listener(&self, listener: AckListener) {
        *self.ack_listener.lock().expect("lock poisoned") = Some(listener);
    }

    /// Sends the start-copy handshake for a build.
    pub fn send_start_copy(&self, first_replication_lsn: Lsn) -> bool {
        let body = MessageBody::StartCopy(StartCopyBody {
            primary_epoch: *self.epoch.lock().expect("lock poisoned"),
            target_replica_id: self.remote.replica_id,
            first_replication_lsn,
        });
        self.transport
            .send_to(&self.remote, Message::new(self.local.clone(), body))
    }

    // An oversized payload can never ride a frame; failing the send keeps
    // it pending so the condition stays visible instead of silently lost.
    fn exceeds_message_size(&self, op: &Operation) -> bool {
        if self.max_message_size > 0 && op.payload_size() > self.max_message_size {
            tracing::error!(
                lsn = %op.lsn(),
                size = op.payload_size(),
                limit = self.max_message_size,
                "operation exceeds the replication message size limit"
            );
            return true;
        }
        false
    }

    fn send_replication(
        &self,
        op: Option<&Arc<Operation>>,
        kind: SendKind,
        completed: Lsn,
    ) -> bool {
        let epoch = *self.epoch.lock().expect("lock poisoned");
        let mut delivered = true;
        if let Some(op) = op {
            if self.exceeds_message_size(op) {
                return false;
            }
            let body = MessageBody::ReplicationBatch {
                primary_epoch: epoch,
                operations: vec![WireOperation {
                    metadata: op.metadata,
                    buffers: op.buffers.clone(),
                }],
                completed_lsn: completed,
            };
            delivered = self
                .transport
                .send_to(&self.remote, Message::new(self.local.clone(), body));
        }
        if matches!(kind, SendKind::OperationWithRequestAck | SendKind::Probe) {
            let request = Message::new(self.local.clone(), MessageBody::RequestAck);
            delivered &= self.transport.send_to(&self.remote, request);
        }
        delivered
    }

    fn send_copy(&self, op: Option<&Arc<Operation>>, kind: SendKind) -> bool {
        let epoch = *self.epoch.lock().expect("lock poisoned");
        let mut delivered = true;
        if let Some(op) = op {
            if self.exceeds_message_size(op) {
                return false;
            }
            let body = MessageBody::CopyOperation {
                primary_epoch: epoch,
                target_replica_id: self.remote.replica_id,
                operation: WireOperation {
                    metadata: op.metadata,
                    buffers: op.buffers.clone(),
                },
                is_last: op.is_end_of_stream(),
            };
            delivered = self
                .transport
                .send_to(&self.remote, Message::new(self.local.clone(), body));
        }
        if matches!(kind, SendKind::OperationWithRequestAck | SendKind::Probe) {
            let request = Message::new(self.local.clone(), MessageBody::RequestAck);
            delivered &= self.transport.send_to(&self.remote, request);
        }
        delivered
    }
}
