//! Primary replicator.
//!
//! Owns LSN allocation, the primary operation queue, the replica manager,
//! and the build/catch-up/update-configuration state machine. A
//! `replicate` call completes when the current configuration's quorum
//! (and the previous configuration's, during a reconfiguration) has
//! acknowledged receipt.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use stratum_async::{AsyncRuntime, CompletionSource};
use stratum_types::{
    Epoch, IncarnationId, Lsn, Operation, OperationMetadata, ReplicaId, ReplicationEndpointId,
    Status,
};
use stratum_wire::{
    CopyContextAckBody, FromHeader, Message, MessageBody, MessageProcessor, Transport,
};

use crate::config::ReplicatorConfig;
use crate::copy::{CopyContextReceiver, CopyPump};
use crate::queue::{OperationQueue, OperationQueueOptions};
use crate::replica_manager::{ReplicaInformation, ReplicaManager};
use crate::session::{ReplicationSession, SessionRole};
use crate::state_provider::StateProvider;

/// Which replicas must be caught up before a catch-up wait completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpMode {
    /// Every tracked replica has applied everything.
    All,
    /// A write quorum has received everything.
    WriteQuorum,
}

struct BuildState {
    pump: Option<Arc<CopyPump>>,
    context: Option<Arc<CopyContextReceiver>>,
    upto: Lsn,
    result: Arc<CompletionSource<Lsn>>,
}

struct PrimaryInner {
    queue: OperationQueue,
    next_lsn: i64,
    pending_replicates: BTreeMap<i64, Arc<CompletionSource<Lsn>>>,
    catchup_waiters: Vec<(CatchUpMode, Arc<CompletionSource<()>>)>,
    builds: HashMap<(ReplicaId, IncarnationId), BuildState>,
    closing: bool,
}

/// The primary role of the replication engine.
pub struct PrimaryReplicator {
    config: ReplicatorConfig,
    runtime: Arc<AsyncRuntime>,
    transport: Arc<dyn Transport>,
    endpoint: ReplicationEndpointId,
    from: FromHeader,
    provider: Arc<dyn StateProvider>,
    epoch: Mutex<Epoch>,
    manager: ReplicaManager,
    inner: Mutex<PrimaryInner>,
    me: Weak<Self>,
}

impl PrimaryReplicator {
    pub fn new(
        config: ReplicatorConfig,
        runtime: Arc<AsyncRuntime>,
        transport: Arc<dyn Transport>,
        endpoint: ReplicationEndpointId,
        provider: Arc<dyn StateProvider>,
        epoch: Epoch,
    ) -> Arc<Self> {
        // Peers are told the publish address when one is configured.
        let from = FromHeader::new(config.advertised_address(), endpoint);
        let start_lsn = provider.get_last_committed_sequence_number().next();

        let replicator = Arc::new_cyclic(|me: &Weak<Self>| {
            let factory_me = me.clone();
            let factory_config = config.clone();
            let factory_runtime = Arc::clone(&runtime);
            let factory_transport = Arc::clone(&transport);
            let factory_from = from.clone();
            let session_factory = Box::new(
                move |info: &ReplicaInformation, role: SessionRole| -> Arc<ReplicationSession> {
                    let epoch = factory_me
                        .upgrade()
                        .map_or(Epoch::ZERO, |p| *p.epoch.lock().expect("lock poisoned"));
                    let remote = ReplicationEndpointId::new(
                        factory_from.endpoint_id.partition_id,
                        info.id,
                        info.incarnation_id,
                    );
                    let session = ReplicationSession::new(
                        &factory_config,
                        Arc::clone(&factory_runtime),
                        Arc::clone(&factory_transport),
                        factory_from.clone(),
                        remote,
                        info.address.clone(),
                        role,
                        epoch,
                        info.current_progress,
                    );
                    session.open();

                    let listener_me = factory_me.clone();
                    let (id, incarnation) = (info.id, info.incarnation_id);
                    session.set_ack_listener(Box::new(move || {
                        if let Some(primary) = listener_me.upgrade() {
                            primary.on_session_ack(id, incarnation);
                        }
                    }));
                    session
                },
            );

            let progress_me = me.clone();
            let local_progress = Box::new(move || {
                progress_me.upgrade().map_or(Lsn::INVALID, |p| {
                    p.inner
                        .lock()
                        .expect("lock poisoned")
                        .queue
                        .last_sequence_number()
                })
            });

            Self {
                manager: ReplicaManager::new(session_factory, local_progress),
                inner: Mutex::new(PrimaryInner {
                    queue: OperationQueue::new(
                        "primary-replication",
                        start_lsn,
                        OperationQueueOptions {
                            initial_size: config.initial_replication_queue_size,
                            max_size: config.max_replication_queue_size,
                            max_memory_size: config.max_replication_queue_memory_size,
                            max_completed_size: config.max_primary_replication_queue_size,
                            max_completed_memory_size: config
                                .max_primary_replication_queue_memory_size,
                            clean_on_complete: false,
                            ignore_commit: false,
                        },
                    ),
                    next_lsn: start_lsn.get(),
                    pending_replicates: BTreeMap::new(),
                    catchup_waiters: Vec::new(),
                    builds: HashMap::new(),
                    closing: false,
                }),
                config,
                runtime,
                transport,
                endpoint,
                from,
                provider,
                epoch: Mutex::new(epoch),
                me: me.clone(),
            }
        });
        replicator.schedule_health_monitor();
        replicator
    }

    // Periodic utilization trace for the replication queue; rearms itself
    // for the replicator's lifetime.
    fn schedule_health_monitor(&self) {
        let me = self.me.clone();
        self.runtime.schedule(
            self.config.queue_health_monitoring_interval,
            Box::new(move || {
                if let Some(primary) = me.upgrade() {
                    let utilization = primary
                        .inner
                        .lock()
                        .expect("lock poisoned")
                        .queue
                        .utilization_percentage();
                    tracing::debug!(utilization, "primary replication queue health");
                    primary.schedule_health_monitor();
                }
            }),
        );
    }

    pub fn endpoint(&self) -> &ReplicationEndpointId {
        &self.endpoint
    }

    pub fn current_epoch(&self) -> Epoch {
        *self.epoch.lock().expect("lock poisoned")
    }

    pub fn manager(&self) -> &ReplicaManager {
        &self.manager
    }

    // ------------------------------------------------------------------
    // Replicate
    // ------------------------------------------------------------------

    /// Assigns the next LSN, enqueues, and fans out to every replication
    /// target. The completion resolves with the LSN once quorum receipt
    /// is acknowledged.
    pub fn replicate(
        &self,
        buffers: Vec<Bytes>,
    ) -> crate::Result<(Lsn, Arc<CompletionSource<Lsn>>)> {
        let payload_size: u64 = buffers.iter().map(|b| b.len() as u64).sum();
        let limit = self.config.max_replication_message_size;
        if limit > 0 && payload_size > limit {
            tracing::warn!(
                size = payload_size,
                limit,
                "replicate rejected: payload exceeds the message size limit"
            );
            return Err(Status::InsufficientResources);
        }

        let epoch = self.current_epoch();
        let (lsn, op, completion) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closing {
                return Err(Status::ObjectClosed);
            }
            let lsn = Lsn::new(inner.next_lsn);
            let op = Operation::new(OperationMetadata::normal(lsn, epoch), buffers);
            inner.queue.try_enqueue(Arc::clone(&op))?;
            inner.next_lsn += 1;

            let completion = Arc::new(CompletionSource::new());
            inner
                .pending_replicates
                .insert(lsn.get(), Arc::clone(&completion));
            (lsn, op, completion)
        };

        tracing::debug!(lsn = %lsn, "replicate enqueued");
        for session in self.manager.replication_targets() {
            session.add_replication_operation(Arc::clone(&op));
        }
        self.on_progress();
        Ok((lsn, completion))
    }

    /// Quorum-committed LSN.
    pub fn get_current_progress(&self) -> crate::Result<Lsn> {
        self.manager
            .try_get_progress()
            .map(|snapshot| snapshot.committed)
            .ok_or(Status::InvalidState)
    }

    /// Lowest LSN still retained for catching up a lagging replica.
    pub fn get_catch_up_capability(&self) -> Lsn {
        self.inner
            .lock()
            .expect("lock poisoned")
            .queue
            .last_removed_sequence_number()
    }

    // ------------------------------------------------------------------
    // Configuration and catch-up
    // ------------------------------------------------------------------

    /// Applies a configuration change; sessions dropped by both sets are
    /// closed.
    pub fn update_configuration(
        &self,
        previous: &[ReplicaInformation],
        previous_quorum: u64,
        current: &[ReplicaInformation],
        current_quorum: u64,
    ) -> crate::Result<()> {
        let to_close =
            self.manager
                .update_configuration(previous, previous_quorum, current, current_quorum)?;
        for session in to_close {
            session.close();
        }
        self.feed_lagging_sessions();
        self.on_progress();
        Ok(())
    }

    // A session entering a configuration behind the queue's tail is fed
    // from the retained window. Only sessions with nothing in flight are
    // fed; anything already sending holds its own tail.
    fn feed_lagging_sessions(&self) {
        for session in self.manager.replication_targets() {
            if session.replication_sender().pending_count() > 0 {
                continue;
            }
            let (received, _) = session.replication_progress();
            let backlog = {
                let inner = self.inner.lock().expect("lock poisoned");
                // Nothing below the queue's base ever existed to send.
                let needed = received.next().max(inner.queue.start_sequence_number());
                if needed > inner.queue.last_sequence_number() {
                    continue;
                }
                if inner.queue.last_removed_sequence_number() >= needed {
                    tracing::warn!(
                        replica = %session.replica_id(),
                        %received,
                        "retained window no longer covers the replica; it must be rebuilt"
                    );
                    continue;
                }
                inner.queue.retained_from(needed)
            };
            for op in backlog {
                session.add_replication_operation(op);
            }
        }
    }

    /// Completes when the selected quorum has caught up to everything
    /// replicated so far.
    pub fn wait_for_catch_up_quorum(&self, mode: CatchUpMode) -> Arc<CompletionSource<()>> {
        let completion = Arc::new(CompletionSource::new());
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closing {
                completion.set_error(Status::ObjectClosed);
                return completion;
            }
            inner
                .catchup_waiters
                .push((mode, Arc::clone(&completion)));
        }
        self.on_progress();
        completion
    }

    /// Advances the primary's epoch; the provider records the previous
    /// generation's final LSN.
    pub fn update_epoch(&self, new_epoch: Epoch) -> crate::Result<()> {
        let previous_last = {
            let epoch = self.epoch.lock().expect("lock poisoned");
            if !new_epoch.dominates(*epoch) {
                return Err(Status::InvalidEpoch);
            }
            self.inner
                .lock()
                .expect("lock poisoned")
                .queue
                .last_sequence_number()
        };
        self.provider.update_epoch(new_epoch, previous_last)?;
        *self.epoch.lock().expect("lock poisoned") = new_epoch;
        for session in self.manager.all_sessions() {
            session.set_epoch(new_epoch);
        }
        tracing::info!(epoch = %new_epoch, "primary epoch advanced");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Build replica
    // ------------------------------------------------------------------

    /// Starts building `info` as an idle replica. With
    /// `expect_copy_context` the pump waits for the target's copy-context
    /// stream to finish before enumerating state. The completion resolves
    /// with the copy's end-of-stream LSN.
    pub fn build_replica(
        &self,
        info: &ReplicaInformation,
        expect_copy_context: bool,
    ) -> crate::Result<Arc<CompletionSource<Lsn>>> {
        let session = self.manager.add_idle(info)?;
        let first_replication_lsn = {
            let inner = self.inner.lock().expect("lock poisoned");
            if inner.closing {
                return Err(Status::ObjectClosed);
            }
            Lsn::new(inner.next_lsn)
        };
        let upto = first_replication_lsn.prev();
        let result = Arc::new(CompletionSource::new());

        session.send_start_copy(first_replication_lsn);

        let key = (info.id, info.incarnation_id);
        if expect_copy_context {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.builds.insert(
                key,
                BuildState {
                    pump: None,
                    context: Some(Arc::new(CopyContextReceiver::new())),
                    upto,
                    result: Arc::clone(&result),
                },
            );
        } else {
            let stream = self.provider.get_copy_state(upto, None);
            let pump = CopyPump::new(Arc::clone(&session), stream);
            relay_build_result(&pump, &result);
            {
                let mut inner = self.inner.lock().expect("lock poisoned");
                inner.builds.insert(
                    key,
                    BuildState {
                        pump: Some(Arc::clone(&pump)),
                        context: None,
                        upto,
                        result: Arc::clone(&result),
                    },
                );
            }
            pump.pump();
        }

        tracing::info!(replica = %info.id, %upto, "replica build started");
        Ok(result)
    }

    /// Cancels an in-flight build; its completion fires with
    /// [`Status::OperationCanceled`].
    pub fn cancel_build(&self, id: ReplicaId, incarnation: IncarnationId) {
        let build = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.builds.remove(&(id, incarnation))
        };
        if let Some(build) = build {
            if let Some(pump) = build.pump {
                pump.cancel();
            } else {
                build.result.set_error(Status::OperationCanceled);
            }
        }
        if let Some(session) = self.manager.remove_idle(id, incarnation) {
            session.close();
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Tears the primary down: pending replicates and catch-up waits fail
    /// with [`Status::ObjectClosed`], builds cancel, sessions close.
    pub fn close(&self) {
        let (replicates, waiters, builds) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.closing = true;
            let replicates: Vec<_> = std::mem::take(&mut inner.pending_replicates)
                .into_values()
                .collect();
            let waiters: Vec<_> = std::mem::take(&mut inner.catchup_waiters)
                .into_iter()
                .map(|(_, c)| c)
                .collect();
            let builds: Vec<_> = std::mem::take(&mut inner.builds).into_values().collect();
            (replicates, waiters, builds)
        };
        for completion in replicates {
            completion.set_error(Status::ObjectClosed);
        }
        for completion in waiters {
            completion.set_error(Status::ObjectClosed);
        }
        for build in builds {
            if let Some(pump) = build.pump {
                pump.cancel();
            } else {
                build.result.set_error(Status::OperationCanceled);
            }
        }
        for session in self.manager.close_all() {
            session.close();
        }
        tracing::info!("primary closed");
    }

    // ------------------------------------------------------------------
    // Progress propagation
    // ------------------------------------------------------------------

    fn on_session_ack(&self, id: ReplicaId, incarnation: IncarnationId) {
        let (pump, finished) = {
            let inner = self.inner.lock().expect("lock poisoned");
            match inner.builds.get(&(id, incarnation)) {
                Some(build) => (
                    build.pump.clone(),
                    build.result.is_completed(),
                ),
                None => (None, false),
            }
        };
        if let Some(pump) = pump {
            pump.on_copy_ack();
        }
        if finished {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.builds.remove(&(id, incarnation));
        }
        self.on_progress();
    }

    fn on_progress(&self) {
        let Some(snapshot) = self.manager.try_get_progress() else {
            return;
        };

        let (completed_replicates, finished_waiters, completed_head) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if !snapshot.committed.is_invalid() {
                inner.queue.commit(snapshot.committed);
            }
            if !snapshot.completed.is_invalid() {
                inner.queue.complete(snapshot.completed);
            }

            let committed = snapshot.committed;
            let mut done = Vec::new();
            let acked: Vec<i64> = inner
                .pending_replicates
                .range(..=committed.get())
                .map(|(lsn, _)| *lsn)
                .collect();
            for lsn in acked {
                if let Some(completion) = inner.pending_replicates.remove(&lsn) {
                    done.push((Lsn::new(lsn), completion));
                }
            }

            let last = inner.queue.last_sequence_number();
            let mut finished = Vec::new();
            inner.catchup_waiters.retain(|(mode, completion)| {
                let reached = match mode {
                    CatchUpMode::WriteQuorum => snapshot.committed >= last,
                    CatchUpMode::All => snapshot.completed >= last,
                };
                if reached {
                    finished.push(Arc::clone(completion));
                    false
                } else {
                    true
                }
            });
            (done, finished, inner.queue.last_removed_sequence_number())
        };

        for session in self.manager.all_sessions() {
            session.replication_sender().set_completed_head(completed_head);
        }
        for (lsn, completion) in completed_replicates {
            completion.set_result(lsn);
        }
        for completion in finished_waiters {
            completion.set_result(());
        }
    }

    fn process_copy_context(&self, from: &FromHeader, op: &Operation) {
        let key = (from.endpoint_id.replica_id, from.endpoint_id.incarnation_id);
        let (context, upto, start_pump) = {
            let inner = self.inner.lock().expect("lock poisoned");
            let Some(build) = inner.builds.get(&key) else {
                tracing::debug!(replica = %key.0, "copy context for unknown build");
                return;
            };
            let Some(context) = build.context.clone() else {
                return;
            };
            (context, build.upto, build.pump.is_none())
        };
        let session = self.manager.find(key.0, key.1);

        if let Some(acked) = context.accept(op) {
            let ack = Message::new(
                self.from.clone(),
                MessageBody::CopyContextAck(CopyContextAckBody {
                    lsn: acked,
                    error: None,
                }),
            );
            self.transport.send_to(&from.endpoint_id, ack);
        }

        if context.is_finished() && start_pump {
            let Some(session) = session else { return };
            let stream = self
                .provider
                .get_copy_state(upto, Some(context.into_stream()));
            let pump = CopyPump::new(session, stream);
            let result = {
                let mut inner = self.inner.lock().expect("lock poisoned");
                let Some(build) = inner.builds.get_mut(&key) else {
                    return;
                };
                build.pump = Some(Arc::clone(&pump));
                Arc::clone(&build.result)
            };
            relay_build_result(&pump, &result);
            pump.pump();
        }
    }
}

fn relay_build_result(pump: &Arc<CopyPump>, result: &Arc<CompletionSource<Lsn>>) {
    let result = Arc::clone(result);
    pump.completion().subscribe(move |outcome| {
        match outcome {
            Ok(lsn) => {
                result.set_result(*lsn);
            }
            Err(status) => {
                result.set_error(*status);
            }
        };
    });
}

impl MessageProcessor for PrimaryReplicator {
    fn process_message(&self, message: Message) {
        if !message.is_from_expected_sender(&self.endpoint, None) {
            tracing::debug!(from = %message.from.endpoint_id, "dropping cross-partition message");
            return;
        }
        let from = message.from.clone();
        match message.body {
            MessageBody::ReplicationAck(ack) => {
                let session = self
                    .manager
                    .find(from.endpoint_id.replica_id, from.endpoint_id.incarnation_id);
                if let Some(session) = session {
                    session.process_ack(&ack);
                } else {
                    tracing::debug!(replica = %from.endpoint_id.replica_id, "ack from unknown session");
                }
            }
            MessageBody::CopyContextOperation { operation } => {
                let op = Operation {
                    metadata: operation.metadata,
                    buffers: operation.buffers,
                };
                self.process_copy_context(&from, &op);
            }
            other => {
                tracing::debug!(action = %other.action(), "primary ignoring message");
            }
        }
    }
}
