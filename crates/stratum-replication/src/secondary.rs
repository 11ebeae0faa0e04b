//! Secondary replicator.
//!
//! Consumes the copy and replication streams from the primary, dispatches
//! committed operations to the service consumer in LSN order, and sends
//! batched four-LSN acknowledgements upstream.
//!
//! # Intake
//!
//! A build starts with `StartCopy`: the replication queue is based at the
//! primary's first replication LSN, the copy queue at 1. Copy and
//! replication operations arrive out of order; each queue commits its
//! contiguous prefix and the committed prefix is handed to the matching
//! [`OperationStream`]. A service without parallel-stream support sees
//! replication operations only after the copy stream has terminated.
//!
//! Stale messages (primary epoch older than the highest epoch observed)
//! are dropped and counted. An `update_epoch` seals the current epoch
//! into the progress vector, discards the uncommitted out-of-order tail
//! (a gap under the old epoch can never be filled), and passes the
//! previous epoch's last LSN to the state provider.

use std::sync::{Arc, Mutex, Weak};

use stratum_async::{AsyncRuntime, CompletionSource, TimerHandle};
use stratum_types::{
    Epoch, Lsn, Operation, ProgressVector, ReplicationEndpointId, Status,
};
use stratum_wire::{
    AckBody, CopyContextAckBody, FromHeader, Message, MessageBody, MessageProcessor, Transport,
    WireOperation,
};

use crate::config::ReplicatorConfig;
use crate::queue::{OperationQueue, OperationQueueOptions};
use crate::sender::{ReliableOperationSender, SendKind, SenderConfig};
use crate::state_provider::StateProvider;
use crate::stream::OperationStream;

struct SecondaryInner {
    started: bool,
    primary: Option<FromHeader>,
    primary_epoch: Epoch,
    current_epoch: Epoch,
    progress_vector: ProgressVector,
    repl_queue: OperationQueue,
    copy_queue: OperationQueue,
    repl_base: Lsn,
    copy_end_lsn: Option<Lsn>,
    copy_finished: bool,
    copy_dispatched: Lsn,
    repl_dispatched: Lsn,
    stale_message_count: u64,
    last_ack: Option<AckBody>,
    pending_ack_events: u64,
    ack_timer: Option<TimerHandle>,
    context_sender: Option<Arc<ReliableOperationSender>>,
    closing: bool,
    drain_waiter: Option<Arc<CompletionSource<()>>>,
    /// Applied frontiers observed by the last slow-API pass; no movement
    /// with dispatched work outstanding means the service is slow.
    last_applied_observed: (Lsn, Lsn),
}

/// The secondary role of the replication engine.
pub struct SecondaryReplicator {
    config: ReplicatorConfig,
    runtime: Arc<AsyncRuntime>,
    transport: Arc<dyn Transport>,
    endpoint: ReplicationEndpointId,
    from: FromHeader,
    provider: Arc<dyn StateProvider>,
    supports_parallel_streams: bool,
    copy_stream: Arc<OperationStream>,
    repl_stream: Arc<OperationStream>,
    inner: Mutex<SecondaryInner>,
    me: Weak<Self>,
}

impl SecondaryReplicator {
    pub fn new(
        config: ReplicatorConfig,
        runtime: Arc<AsyncRuntime>,
        transport: Arc<dyn Transport>,
        endpoint: ReplicationEndpointId,
        provider: Arc<dyn StateProvider>,
        supports_parallel_streams: bool,
    ) -> Arc<Self> {
        // Peers are told the publish address when one is configured.
        let from = FromHeader::new(config.advertised_address(), endpoint);
        let replicator = Arc::new_cyclic(|me| Self {
            copy_stream: OperationStream::new("copy"),
            repl_stream: OperationStream::new("replication"),
            inner: Mutex::new(SecondaryInner {
                started: false,
                primary: None,
                primary_epoch: Epoch::ZERO,
                current_epoch: Epoch::ZERO,
                progress_vector: initial_progress_vector(),
                repl_queue: secondary_queue(&config, Lsn::new(1)),
                copy_queue: copy_queue(&config),
                repl_base: Lsn::ZERO,
                copy_end_lsn: None,
                copy_finished: false,
                copy_dispatched: Lsn::ZERO,
                repl_dispatched: Lsn::ZERO,
                stale_message_count: 0,
                last_ack: None,
                pending_ack_events: 0,
                ack_timer: None,
                context_sender: None,
                closing: false,
                drain_waiter: None,
                last_applied_observed: (Lsn::INVALID, Lsn::INVALID),
            }),
            config,
            runtime,
            transport,
            endpoint,
            from,
            provider,
            supports_parallel_streams,
            me: me.clone(),
        });
        replicator.schedule_health_monitor();
        replicator.schedule_slow_api_monitor();
        replicator
    }

    // Flags a service whose acknowledgements have not advanced across one
    // monitoring interval while dispatched operations are outstanding.
    // Rearms itself for the replicator's lifetime.
    fn schedule_slow_api_monitor(&self) {
        let me = self.me.clone();
        self.runtime.schedule(
            self.config.slow_api_monitoring_interval,
            Box::new(move || {
                if let Some(secondary) = me.upgrade() {
                    secondary.check_slow_service_acks();
                    secondary.schedule_slow_api_monitor();
                }
            }),
        );
    }

    fn check_slow_service_acks(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let repl_applied = inner
            .repl_queue
            .next_to_be_completed_sequence_number()
            .prev();
        let copy_applied = inner
            .copy_queue
            .next_to_be_completed_sequence_number()
            .prev();
        let outstanding = inner.repl_dispatched > repl_applied
            || inner.copy_dispatched > copy_applied;
        if outstanding && (repl_applied, copy_applied) == inner.last_applied_observed {
            tracing::warn!(
                %repl_applied,
                %copy_applied,
                "service acknowledgement made no progress over a monitoring interval"
            );
        }
        inner.last_applied_observed = (repl_applied, copy_applied);
    }

    // Periodic utilization trace for both intake queues; rearms itself for
    // the replicator's lifetime.
    fn schedule_health_monitor(&self) {
        let me = self.me.clone();
        self.runtime.schedule(
            self.config.queue_health_monitoring_interval,
            Box::new(move || {
                if let Some(secondary) = me.upgrade() {
                    let (repl, copy) = {
                        let inner = secondary.inner.lock().expect("lock poisoned");
                        (
                            inner.repl_queue.utilization_percentage(),
                            inner.copy_queue.utilization_percentage(),
                        )
                    };
                    tracing::debug!(repl, copy, "secondary queue health");
                    secondary.schedule_health_monitor();
                }
            }),
        );
    }

    pub fn endpoint(&self) -> &ReplicationEndpointId {
        &self.endpoint
    }

    /// Stream of copy operations for the service consumer.
    pub fn copy_stream(&self) -> &Arc<OperationStream> {
        &self.copy_stream
    }

    /// Stream of replication operations for the service consumer.
    pub fn replication_stream(&self) -> &Arc<OperationStream> {
        &self.repl_stream
    }

    pub fn current_epoch(&self) -> Epoch {
        self.inner.lock().expect("lock poisoned").current_epoch
    }

    pub fn stale_message_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").stale_message_count
    }

    /// The last acknowledgement sent upstream.
    pub fn last_ack(&self) -> Option<AckBody> {
        self.inner.lock().expect("lock poisoned").last_ack
    }

    pub fn progress_vector_string(&self) -> String {
        self.inner
            .lock()
            .expect("lock poisoned")
            .progress_vector
            .to_compact_string()
    }

    // ------------------------------------------------------------------
    // Service-side acknowledgements
    // ------------------------------------------------------------------

    /// The service acknowledges a copy operation it finished processing.
    pub fn acknowledge_copy_operation(&self, lsn: Lsn) {
        let drained = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.copy_queue.complete(lsn);
            if !self.config.use_stream_faults_and_end_of_stream_operation_ack {
                complete_copy_end_marker(&mut inner);
            }
            inner.pending_ack_events += 1;
            take_drain_waiter_if_drained(&mut inner)
        };
        self.finish_drain(drained);
        self.maybe_send_ack(false);
    }

    /// The service acknowledges a replication operation.
    pub fn acknowledge_replication_operation(&self, lsn: Lsn) {
        let drained = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.repl_queue.complete(lsn);
            inner.pending_ack_events += 1;
            take_drain_waiter_if_drained(&mut inner)
        };
        self.finish_drain(drained);
        self.maybe_send_ack(false);
    }

    // ------------------------------------------------------------------
    // Epoch
    // ------------------------------------------------------------------

    /// Applies a new epoch: seals the progress vector, discards the
    /// uncommitted tail, and informs the state provider.
    pub fn update_epoch(&self, epoch: Epoch) -> crate::Result<()> {
        let previous_last = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !inner.started {
                return Err(Status::InvalidState);
            }
            if !epoch.dominates(inner.current_epoch) {
                return Err(Status::InvalidEpoch);
            }
            let previous_last = inner.repl_base.max(inner.repl_queue.last_committed_sequence_number());
            let discarded = inner.repl_queue.discard_uncommitted_tail();
            if discarded > 0 {
                tracing::info!(
                    count = discarded,
                    epoch = %epoch,
                    "discarded out-of-order operations at epoch change"
                );
            }
            inner.progress_vector.advance_epoch(epoch, previous_last);
            inner.current_epoch = epoch;
            previous_last
        };
        self.provider.update_epoch(epoch, previous_last)?;
        tracing::info!(epoch = %epoch, previous_last = %previous_last, "secondary epoch advanced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Closes the secondary.
    ///
    /// With `wait_for_drain`, the completion resolves once the service
    /// has acknowledged every committed operation; both streams then
    /// terminate with their sentinel. Without it, queued undispatched
    /// operations are discarded immediately and outstanding stream waits
    /// resolve with the sentinel right away.
    pub fn begin_close(&self, wait_for_drain: bool) -> Arc<CompletionSource<()>> {
        let completion = Arc::new(CompletionSource::new());
        let (resolve_now, timer) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.closing = true;
            let timer = inner.ack_timer.take();

            if !wait_for_drain {
                inner.copy_queue.discard_non_completed();
                inner.repl_queue.discard_non_completed();
                (true, timer)
            } else if is_drained(&inner) {
                (true, timer)
            } else {
                inner.drain_waiter = Some(Arc::clone(&completion));
                (false, timer)
            }
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        if resolve_now {
            if wait_for_drain {
                self.emit_end_of_stream_sentinels();
                self.copy_stream.finish();
                self.repl_stream.finish();
            } else {
                self.copy_stream.abort();
                self.repl_stream.abort();
            }
            self.maybe_send_ack(true);
            completion.set_result(());
        }
        completion
    }

    // With the end-of-stream-ack mode on, a drained close hands the
    // service explicit terminator operations instead of bare nulls.
    fn emit_end_of_stream_sentinels(&self) {
        if !self.config.use_stream_faults_and_end_of_stream_operation_ack {
            return;
        }
        let (copy_eos, repl_eos) = {
            let inner = self.inner.lock().expect("lock poisoned");
            (
                inner.copy_queue.last_committed_sequence_number().next(),
                inner.repl_queue.last_committed_sequence_number().next(),
            )
        };
        if !self.copy_stream.is_finished() {
            self.copy_stream.push(Operation::end_of_stream(copy_eos));
        }
        if !self.repl_stream.is_finished() {
            self.repl_stream.push(Operation::end_of_stream(repl_eos));
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    fn process_start_copy(&self, from: FromHeader, primary_epoch: Epoch, first_replication_lsn: Lsn) {
        let context_stream = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closing {
                return;
            }
            if inner.started {
                // Retried handshake; the ack below refreshes the primary.
                None
            } else {
                inner.started = true;
                inner.primary = Some(from);
                inner.primary_epoch = primary_epoch;
                inner.repl_queue = secondary_queue(&self.config, first_replication_lsn);
                inner.copy_queue = copy_queue(&self.config);
                inner.repl_base = first_replication_lsn.prev();
                inner.repl_dispatched = first_replication_lsn.prev();
                inner.copy_dispatched = Lsn::ZERO;
                self.provider.get_copy_context()
            }
        };

        if let Some(mut stream) = context_stream {
            self.start_copy_context_sender(&mut *stream);
        }
        self.maybe_send_ack(true);
    }

    // A persisted service pushes its copy context to the primary through
    // a dedicated reliable sender.
    fn start_copy_context_sender(&self, stream: &mut dyn crate::copy::OperationDataStream) {
        let sender = ReliableOperationSender::new(
            "copy-context",
            SenderConfig {
                retry_interval: self.config.retry_interval,
                initial_send_window: self.config.initial_copy_queue_size,
                max_send_window: self.config.max_copy_queue_size,
            },
            Arc::clone(&self.runtime),
        );

        let me = self.me.clone();
        sender.open(Box::new(move |op, _kind, _completed| {
            let Some(secondary) = me.upgrade() else {
                return false;
            };
            let Some(op) = op else {
                return true;
            };
            let primary = secondary
                .inner
                .lock()
                .expect("lock poisoned")
                .primary
                .clone();
            let Some(primary) = primary else {
                return false;
            };
            let body = MessageBody::CopyContextOperation {
                operation: WireOperation {
                    metadata: op.metadata,
                    buffers: op.buffers.clone(),
                },
            };
            secondary
                .transport
                .send_to(&primary.endpoint_id, Message::new(secondary.from.clone(), body))
        }));

        // Published before the first send: the primary's acks come back on
        // the sending thread.
        self.inner.lock().expect("lock poisoned").context_sender = Some(Arc::clone(&sender));

        let mut next = 1i64;
        loop {
            match stream.next() {
                Ok(Some(buffers)) => {
                    let op = Operation::new(
                        stratum_types::OperationMetadata {
                            kind: stratum_types::OperationKind::Normal,
                            lsn: Lsn::new(next),
                            epoch: None,
                        },
                        buffers,
                    );
                    sender.add(op);
                    next += 1;
                }
                Ok(None) => {
                    sender.add(Operation::end_of_stream(Lsn::new(next)));
                    break;
                }
                Err(status) => {
                    tracing::warn!(%status, "copy context enumeration failed");
                    break;
                }
            }
        }
    }

    fn process_copy_operation(&self, primary_epoch: Epoch, op: Arc<Operation>, is_last: bool) {
        let (dispatch, finished) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !inner.started || inner.closing {
                inner.stale_message_count += 1;
                return;
            }
            if primary_epoch < inner.primary_epoch {
                inner.stale_message_count += 1;
                tracing::debug!(epoch = %primary_epoch, "dropping stale copy operation");
                return;
            }
            if is_last {
                inner.copy_end_lsn = Some(op.lsn());
            }
            match inner.copy_queue.try_enqueue(op) {
                Ok(_) | Err(Status::StaleOperation) => {}
                Err(status) => {
                    tracing::warn!(%status, "copy enqueue rejected");
                    return;
                }
            }
            inner.copy_queue.commit_all();
            inner.pending_ack_events += 1;

            let explicit_eos_ack = self.config.use_stream_faults_and_end_of_stream_operation_ack;
            let dispatch = collect_copy_dispatch(&mut inner, explicit_eos_ack);
            let newly_finished = check_copy_finished(&mut inner, explicit_eos_ack);
            (dispatch, newly_finished)
        };

        for op in dispatch {
            self.copy_stream.push(op);
        }
        if finished {
            self.copy_stream.finish();
            self.dispatch_replication_backlog();
        }
        self.maybe_send_ack(false);
    }

    fn process_replication_batch(
        &self,
        from: FromHeader,
        primary_epoch: Epoch,
        operations: Vec<WireOperation>,
    ) {
        let dispatch = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !inner.started || inner.closing {
                inner.stale_message_count += 1;
                return;
            }
            let floor = inner.primary_epoch.max(inner.current_epoch);
            if primary_epoch < floor {
                inner.stale_message_count += 1;
                tracing::debug!(epoch = %primary_epoch, "dropping stale replication batch");
                return;
            }
            if primary_epoch > inner.primary_epoch {
                inner.primary_epoch = primary_epoch;
                inner.primary = Some(from);
            }

            for wire_op in operations {
                let op = Arc::new(Operation {
                    metadata: wire_op.metadata,
                    buffers: wire_op.buffers,
                });
                match inner.repl_queue.try_enqueue(op) {
                    Ok(_) | Err(Status::StaleOperation) => {}
                    Err(status) => {
                        tracing::warn!(%status, "replication enqueue rejected");
                        break;
                    }
                }
            }
            inner.repl_queue.commit_all();
            inner.pending_ack_events += 1;

            if self.supports_parallel_streams || inner.copy_finished {
                collect_replication_dispatch(&mut inner)
            } else {
                Vec::new()
            }
        };

        for op in dispatch {
            self.repl_stream.push(op);
        }
        self.maybe_send_ack(false);
    }

    fn dispatch_replication_backlog(&self) {
        let dispatch = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            collect_replication_dispatch(&mut inner)
        };
        for op in dispatch {
            self.repl_stream.push(op);
        }
    }

    fn process_copy_context_ack(&self, body: CopyContextAckBody) {
        let sender = self
            .inner
            .lock()
            .expect("lock poisoned")
            .context_sender
            .clone();
        if let Some(sender) = sender {
            sender.process_on_ack(body.lsn, body.lsn);
        }
    }

    // ------------------------------------------------------------------
    // Acks
    // ------------------------------------------------------------------

    fn maybe_send_ack(&self, force: bool) {
        enum Decision {
            SendNow(AckBody, Option<FromHeader>, Option<TimerHandle>),
            Arm,
            Nothing,
        }

        let decision = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !inner.started {
                Decision::Nothing
            } else if force
                || inner.pending_ack_events >= self.config.max_pending_acknowledgements
            {
                let body = compute_ack(&mut inner, self.config.require_service_ack);
                inner.pending_ack_events = 0;
                let timer = inner.ack_timer.take();
                Decision::SendNow(body, inner.primary.clone(), timer)
            } else if inner.pending_ack_events > 0
                && inner
                    .ack_timer
                    .as_ref()
                    .is_none_or(|t| !t.is_pending())
            {
                Decision::Arm
            } else {
                Decision::Nothing
            }
        };

        match decision {
            Decision::SendNow(body, primary, timer) => {
                if let Some(timer) = timer {
                    timer.cancel();
                }
                if let Some(primary) = primary {
                    let message = Message::new(
                        self.from.clone(),
                        MessageBody::ReplicationAck(body),
                    );
                    self.transport.send_to(&primary.endpoint_id, message);
                }
            }
            Decision::Arm => {
                let me = self.me.clone();
                let timer = self.runtime.schedule(
                    self.config.batch_acknowledgement_interval,
                    Box::new(move || {
                        if let Some(secondary) = me.upgrade() {
                            secondary.maybe_send_ack(true);
                        }
                    }),
                );
                self.inner.lock().expect("lock poisoned").ack_timer = Some(timer);
            }
            Decision::Nothing => {}
        }
    }

    fn finish_drain(&self, waiter: Option<Arc<CompletionSource<()>>>) {
        if let Some(waiter) = waiter {
            self.emit_end_of_stream_sentinels();
            self.copy_stream.finish();
            self.repl_stream.finish();
            self.maybe_send_ack(true);
            waiter.set_result(());
        }
    }
}

impl MessageProcessor for SecondaryReplicator {
    fn process_message(&self, message: Message) {
        if !message.is_from_expected_sender(&self.endpoint, None) {
            tracing::debug!(from = %message.from.endpoint_id, "dropping cross-partition message");
            return;
        }
        let from = message.from.clone();
        match message.body {
            MessageBody::StartCopy(body) => {
                self.process_start_copy(from, body.primary_epoch, body.first_replication_lsn);
            }
            MessageBody::CopyOperation {
                primary_epoch,
                operation,
                is_last,
                ..
            } => {
                let op = Arc::new(Operation {
                    metadata: operation.metadata,
                    buffers: operation.buffers,
                });
                self.process_copy_operation(primary_epoch, op, is_last);
            }
            MessageBody::ReplicationBatch {
                primary_epoch,
                operations,
                ..
            } => {
                self.process_replication_batch(from, primary_epoch, operations);
            }
            MessageBody::RequestAck => {
                self.maybe_send_ack(true);
            }
            MessageBody::CopyContextAck(body) => {
                self.process_copy_context_ack(body);
            }
            other => {
                tracing::debug!(action = %other.action(), "secondary ignoring message");
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn initial_progress_vector() -> ProgressVector {
    let mut vector = ProgressVector::new();
    vector.append(Epoch::ZERO, Lsn::INVALID);
    vector
}

fn secondary_queue(config: &ReplicatorConfig, start: Lsn) -> OperationQueue {
    OperationQueue::new(
        "secondary-replication",
        start,
        OperationQueueOptions {
            initial_size: config.initial_secondary_replication_queue_size,
            max_size: config.max_secondary_replication_queue_size,
            max_memory_size: config.max_secondary_replication_queue_memory_size,
            max_completed_size: 0,
            max_completed_memory_size: 0,
            clean_on_complete: config.secondary_clear_acknowledged_operations,
            ignore_commit: false,
        },
    )
}

fn copy_queue(config: &ReplicatorConfig) -> OperationQueue {
    OperationQueue::new(
        "secondary-copy",
        Lsn::new(1),
        OperationQueueOptions {
            initial_size: config.initial_copy_queue_size,
            max_size: config.max_copy_queue_size,
            max_memory_size: 0,
            max_completed_size: 0,
            max_completed_memory_size: 0,
            clean_on_complete: config.secondary_clear_acknowledged_operations,
            ignore_commit: false,
        },
    )
}

// Copy operations committed but not yet handed to the stream. The
// end-of-stream marker is withheld unless the service is expected to
// acknowledge it explicitly.
fn collect_copy_dispatch(
    inner: &mut SecondaryInner,
    deliver_end_of_stream: bool,
) -> Vec<Arc<Operation>> {
    let ops: Vec<Arc<Operation>> = inner
        .copy_queue
        .committed_after(inner.copy_dispatched)
        .into_iter()
        .filter(|op| {
            deliver_end_of_stream
                || (!op.is_end_of_stream() && Some(op.lsn()) != inner.copy_end_lsn)
        })
        .collect();
    inner.copy_dispatched = inner
        .copy_dispatched
        .max(inner.copy_queue.last_committed_sequence_number());
    ops
}

fn collect_replication_dispatch(inner: &mut SecondaryInner) -> Vec<Arc<Operation>> {
    let ops = inner.repl_queue.committed_after(inner.repl_dispatched);
    inner.repl_dispatched = inner
        .repl_dispatched
        .max(inner.repl_queue.last_committed_sequence_number());
    ops
}

// The copy ends when the end-of-stream marker joins the committed prefix.
fn check_copy_finished(inner: &mut SecondaryInner, explicit_end_of_stream_ack: bool) -> bool {
    if inner.copy_finished {
        return false;
    }
    let Some(end) = inner.copy_end_lsn else {
        return false;
    };
    if inner.copy_queue.last_committed_sequence_number() >= end {
        inner.copy_finished = true;
        if !explicit_end_of_stream_ack {
            complete_copy_end_marker(inner);
        }
        return true;
    }
    false
}

// The service never sees the end marker, so its completion is advanced
// automatically once everything before it has been acknowledged.
fn complete_copy_end_marker(inner: &mut SecondaryInner) {
    if let Some(end) = inner.copy_end_lsn
        && inner.copy_finished
        && inner.copy_queue.next_to_be_completed_sequence_number() == end
    {
        inner.copy_queue.complete(end);
    }
}

fn is_drained(inner: &SecondaryInner) -> bool {
    let repl_drained = inner.repl_queue.next_to_be_completed_sequence_number().prev()
        == inner.repl_queue.last_committed_sequence_number();
    let copy_drained = inner.copy_queue.next_to_be_completed_sequence_number().prev()
        == inner.copy_queue.last_committed_sequence_number();
    repl_drained && copy_drained
}

fn take_drain_waiter_if_drained(
    inner: &mut SecondaryInner,
) -> Option<Arc<CompletionSource<()>>> {
    if inner.drain_waiter.is_some() && is_drained(inner) {
        inner.drain_waiter.take()
    } else {
        None
    }
}

fn compute_ack(inner: &mut SecondaryInner, require_service_ack: bool) -> AckBody {
    let repl_committed = inner
        .repl_base
        .max(inner.repl_queue.last_committed_sequence_number());
    let repl_applied_frontier = if require_service_ack {
        inner
            .repl_base
            .max(inner.repl_queue.next_to_be_completed_sequence_number().prev())
    } else {
        // Optimistic mode still never acks past the committed frontier.
        repl_committed
    };

    let copy_committed = inner.copy_queue.last_committed_sequence_number();
    let copy_applied_frontier = if require_service_ack {
        inner.copy_queue.next_to_be_completed_sequence_number().prev()
    } else {
        copy_committed
    };

    let mut body = AckBody::new(
        repl_committed,
        repl_applied_frontier,
        copy_committed,
        copy_applied_frontier,
    );

    // The four fields never regress across successive acks, even when a
    // close truncated the queues underneath them.
    if let Some(last) = inner.last_ack {
        body.repl_received = body.repl_received.max(last.repl_received);
        body.repl_quorum = body.repl_quorum.max(last.repl_quorum);
        body.copy_received = body.copy_received.max(last.copy_received);
        body.copy_quorum = body.copy_quorum.max(last.copy_quorum);
    }
    inner.last_ack = Some(body);
    body
}
