//! Reliable operation sender.
//!
//! Delivers a monotonically advancing sequence of operations to one remote
//! with retry, batched acknowledgements and an adaptive send window:
//!
//! - `add` enqueues; operations within the send window are sent
//!   immediately, the rest are held.
//! - `process_on_ack` drops acknowledged operations. Progress (either ack
//!   LSN advancing) widens the window by one, up to the maximum.
//! - The retry pass re-sends items older than the retry interval. A pass
//!   that observed no ack motion halves the window (floor 1); the second
//!   consecutive motionless pass sends a request-ack probe to elicit an
//!   explicit acknowledgement.
//!
//! Delivery order matches LSN order but duplicates are possible; the
//! remote dedupes by sequence number.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use stratum_async::{AsyncRuntime, TimerHandle};
use stratum_types::{Lsn, Operation};

/// Window growth cap applied when the configured maximum is 0.
pub const DEFAULT_MAX_SWS_FACTOR_WHEN_0: u64 = 2;

/// What a send callback is asked to transmit.
#[derive(Clone, Copy)]
pub enum SendKind {
    /// A (re)send of one pending operation.
    Operation,
    /// A send that should also elicit an immediate acknowledgement.
    OperationWithRequestAck,
    /// A bare request-ack probe; nothing is pending but the remote owes
    /// quorum progress.
    Probe,
}

/// Callback transmitting toward the remote. `completed` is the sender
/// owner's completed frontier at call time. Returning `false` marks a
/// transport failure; the item stays pending for the next retry pass.
pub type SendFn =
    Box<dyn Fn(Option<&Arc<Operation>>, SendKind, Lsn) -> bool + Send + Sync + 'static>;

type SharedSendFn = Arc<dyn Fn(Option<&Arc<Operation>>, SendKind, Lsn) -> bool + Send + Sync>;

/// Sender tuning, usually derived from [`crate::ReplicatorConfig`].
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub retry_interval: Duration,
    pub initial_send_window: u64,
    /// 0 caps the window at `DEFAULT_MAX_SWS_FACTOR_WHEN_0 *
    /// initial_send_window`.
    pub max_send_window: u64,
}

impl SenderConfig {
    pub fn effective_max_send_window(&self) -> u64 {
        if self.max_send_window == 0 {
            DEFAULT_MAX_SWS_FACTOR_WHEN_0 * self.initial_send_window
        } else {
            self.max_send_window
        }
    }
}

struct PendingItem {
    op: Arc<Operation>,
    sent_at: Option<Instant>,
}

struct SenderInner {
    open: bool,
    closed: bool,
    send_fn: Option<SharedSendFn>,
    pending: VecDeque<PendingItem>,
    received: Lsn,
    quorum: Lsn,
    last_ack_at: Option<Instant>,
    sws: u64,
    progress_since_pass: bool,
    passes_without_progress: u32,
    timer: Option<TimerHandle>,
    request_ack_count: u64,
    completed_head: Lsn,
    latency: OperationLatencyList,
}

/// Sliding-window retried sender for one remote.
pub struct ReliableOperationSender {
    name: String,
    config: SenderConfig,
    runtime: Arc<AsyncRuntime>,
    inner: Mutex<SenderInner>,
    me: Weak<Self>,
}

impl ReliableOperationSender {
    pub fn new(
        name: impl Into<String>,
        config: SenderConfig,
        runtime: Arc<AsyncRuntime>,
    ) -> Arc<Self> {
        let sws = config.initial_send_window.max(1);
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            config,
            runtime,
            inner: Mutex::new(SenderInner {
                open: false,
                closed: false,
                send_fn: None,
                pending: VecDeque::new(),
                received: Lsn::INVALID,
                quorum: Lsn::INVALID,
                last_ack_at: None,
                sws,
                progress_since_pass: false,
                passes_without_progress: 0,
                timer: None,
                request_ack_count: 0,
                completed_head: Lsn::INVALID,
                latency: OperationLatencyList::new(),
            }),
            me: me.clone(),
        })
    }

    /// Arms the sender with its transmit callback.
    pub fn open(&self, send_fn: SendFn) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.open = true;
        inner.closed = false;
        inner.send_fn = Some(Arc::from(send_fn));
    }

    /// Stops the timer and releases every pending operation reference.
    pub fn close(&self) {
        let (timer, dropped) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.closed = true;
            inner.open = false;
            inner.send_fn = None;
            let dropped: Vec<PendingItem> = inner.pending.drain(..).collect();
            (inner.timer.take(), dropped)
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        drop(dropped);
        tracing::debug!(sender = %self.name, "sender closed");
    }

    /// Publishes the owner's completed frontier, passed through to the
    /// send callback on subsequent sends.
    pub fn set_completed_head(&self, completed: Lsn) {
        self.inner.lock().expect("lock poisoned").completed_head = completed;
    }

    /// Enqueues an operation; sends it immediately when it falls within
    /// the send window.
    pub fn add(&self, op: Arc<Operation>) {
        let lsn = op.lsn();
        let sends = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closed || !inner.open {
                return;
            }
            debug_assert!(
                inner.pending.back().is_none_or(|item| item.op.lsn() < lsn),
                "pending list must stay strictly increasing"
            );
            inner.latency.add(lsn);
            inner.pending.push_back(PendingItem { op, sent_at: None });
            self.ensure_timer(&mut inner);
            Self::collect_window_sends(&mut inner)
        };
        self.transmit(sends, SendKind::Operation);
    }

    /// Applies an acknowledgement; returns `true` when either LSN
    /// advanced.
    pub fn process_on_ack(&self, acked_received: Lsn, acked_quorum: Lsn) -> bool {
        let (progress, sends, disarm) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closed {
                return false;
            }
            while inner
                .pending
                .front()
                .is_some_and(|item| item.op.lsn() <= acked_received)
            {
                inner.pending.pop_front();
            }

            let progress = acked_received > inner.received || acked_quorum > inner.quorum;
            inner.received = inner.received.max(acked_received);
            inner.quorum = inner.quorum.max(acked_quorum);
            inner.latency.on_ack(acked_received, acked_quorum);

            if progress {
                inner.sws = (inner.sws + 1).min(self.config.effective_max_send_window());
                inner.passes_without_progress = 0;
                inner.progress_since_pass = true;
                inner.last_ack_at = Some(Instant::now());
            }

            let sends = Self::collect_window_sends(&mut inner);
            let disarm = inner.pending.is_empty() && inner.received <= inner.quorum;
            let timer = if disarm { inner.timer.take() } else { None };
            (progress, sends, timer)
        };

        if let Some(timer) = disarm {
            timer.cancel();
        }
        self.transmit(sends, SendKind::Operation);
        progress
    }

    /// One retry pass: re-send stale items, adapt the window, and probe a
    /// silent remote. Invoked by the retry timer; exposed so owners can
    /// force a pass during drains.
    pub fn run_retry_pass(&self) {
        let now = Instant::now();
        let (resends, probe, send_fn, completed) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.closed {
                return;
            }
            inner.timer = None;

            let had_motion = inner.progress_since_pass;
            inner.progress_since_pass = false;
            let mut probe = None;
            if had_motion {
                inner.passes_without_progress = 0;
            } else {
                inner.passes_without_progress += 1;
                let halved = (inner.sws / 2).max(1);
                if halved != inner.sws {
                    tracing::debug!(
                        sender = %self.name,
                        from = inner.sws,
                        to = halved,
                        "send window halved after motionless retry pass"
                    );
                    inner.sws = halved;
                }
                if inner.passes_without_progress >= 2 {
                    inner.request_ack_count += 1;
                    probe = Some(inner.pending.front().map(|item| Arc::clone(&item.op)));
                }
            }

            let mut resends = Vec::new();
            let window = inner.sws as usize;
            let retry_interval = self.config.retry_interval;
            for item in inner.pending.iter_mut().take(window) {
                match item.sent_at {
                    Some(sent) if now.duration_since(sent) < retry_interval => {}
                    _ => {
                        item.sent_at = Some(now);
                        resends.push(Arc::clone(&item.op));
                    }
                }
            }

            if !inner.pending.is_empty() || inner.received > inner.quorum {
                self.ensure_timer(&mut inner);
            }
            (resends, probe, inner.send_fn.clone(), inner.completed_head)
        };

        let Some(send_fn) = send_fn else { return };
        for op in &resends {
            send_fn(Some(op), SendKind::Operation, completed);
        }
        if let Some(head) = probe {
            match head {
                Some(op) => {
                    send_fn(Some(&op), SendKind::OperationWithRequestAck, completed);
                }
                None => {
                    send_fn(None, SendKind::Probe, completed);
                }
            }
        }
    }

    /// `(received, quorum, last ack time)`.
    pub fn progress(&self) -> (Lsn, Lsn, Option<Instant>) {
        let inner = self.inner.lock().expect("lock poisoned");
        (inner.received, inner.quorum, inner.last_ack_at)
    }

    pub fn send_window(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").sws
    }

    pub fn max_send_window(&self) -> u64 {
        self.config.effective_max_send_window()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").pending.len()
    }

    /// Pending sequence numbers with a sent flag, oldest first.
    pub fn pending_state(&self) -> Vec<(Lsn, bool)> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .pending
            .iter()
            .map(|item| (item.op.lsn(), item.sent_at.is_some()))
            .collect()
    }

    pub fn request_ack_count(&self) -> u64 {
        self.inner.lock().expect("lock poisoned").request_ack_count
    }

    pub fn has_retry_timer(&self) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .timer
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }

    /// Retires fully acknowledged latency entries into the running
    /// averages; returns `(avg receive ack duration, avg apply ack
    /// duration)`.
    pub fn compute_average_ack_duration(&self) -> (Duration, Duration) {
        self.inner
            .lock()
            .expect("lock poisoned")
            .latency
            .compute_average_ack_duration()
    }

    pub fn latency_entry_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").latency.count()
    }

    // Unsent items inside the window; marks them sent.
    fn collect_window_sends(inner: &mut SenderInner) -> Vec<Arc<Operation>> {
        let window = inner.sws as usize;
        let now = Instant::now();
        let mut sends = Vec::new();
        for item in inner.pending.iter_mut().take(window) {
            if item.sent_at.is_none() {
                item.sent_at = Some(now);
                sends.push(Arc::clone(&item.op));
            }
        }
        sends
    }

    fn ensure_timer(&self, inner: &mut SenderInner) {
        if inner
            .timer
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
        {
            return;
        }
        let Some(me) = self.me.upgrade() else { return };
        inner.timer = Some(self.runtime.schedule(
            self.config.retry_interval,
            Box::new(move || me.run_retry_pass()),
        ));
    }

    fn transmit(&self, sends: Vec<Arc<Operation>>, kind: SendKind) {
        if sends.is_empty() {
            return;
        }
        let (send_fn, completed) = {
            let inner = self.inner.lock().expect("lock poisoned");
            (inner.send_fn.clone(), inner.completed_head)
        };
        let Some(send_fn) = send_fn else { return };
        for op in &sends {
            send_fn(Some(op), kind, completed);
        }
    }
}

// ============================================================================
// Operation latency list
// ============================================================================

struct LatencyEntry {
    added_at: Instant,
    receive_done: Option<Instant>,
    apply_done: Option<Instant>,
}

/// Tracks per-operation receive/apply stopwatches and running averages.
///
/// Each `add` starts both stopwatches. `on_ack(received, quorum)` stops
/// the receive watch for LSNs at or below `received` and the apply watch
/// at or below `quorum`; duplicate acks are idempotent.
/// [`OperationLatencyList::compute_average_ack_duration`] retires entries
/// whose watches have both stopped, folding them into the averages with
/// `avg' = avg + (sample - avg) / (n + 1)`.
pub struct OperationLatencyList {
    items: BTreeMap<i64, LatencyEntry>,
    avg_receive: Duration,
    avg_apply: Duration,
    receive_samples: u64,
    apply_samples: u64,
}

impl Default for OperationLatencyList {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLatencyList {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            avg_receive: Duration::ZERO,
            avg_apply: Duration::ZERO,
            receive_samples: 0,
            apply_samples: 0,
        }
    }

    pub fn add(&mut self, lsn: Lsn) {
        self.items.entry(lsn.get()).or_insert(LatencyEntry {
            added_at: Instant::now(),
            receive_done: None,
            apply_done: None,
        });
    }

    pub fn on_ack(&mut self, received: Lsn, quorum: Lsn) {
        let now = Instant::now();
        for (lsn, entry) in &mut self.items {
            if *lsn <= received.get() && entry.receive_done.is_none() {
                entry.receive_done = Some(now);
            }
            if *lsn <= quorum.get() && entry.apply_done.is_none() {
                entry.apply_done = Some(now);
            }
            if *lsn > received.get().max(quorum.get()) {
                break;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// `(lsn, receive stopped, apply stopped)` triples, ascending.
    pub fn watch_states(&self) -> Vec<(Lsn, bool, bool)> {
        self.items
            .iter()
            .map(|(lsn, entry)| {
                (
                    Lsn::new(*lsn),
                    entry.receive_done.is_some(),
                    entry.apply_done.is_some(),
                )
            })
            .collect()
    }

    pub fn compute_average_ack_duration(&mut self) -> (Duration, Duration) {
        let retired: Vec<i64> = self
            .items
            .iter()
            .filter(|(_, entry)| entry.receive_done.is_some() && entry.apply_done.is_some())
            .map(|(lsn, _)| *lsn)
            .collect();
        for lsn in retired {
            let entry = self.items.remove(&lsn).expect("collected above");
            let receive = entry
                .receive_done
                .expect("filtered")
                .duration_since(entry.added_at);
            let apply = entry
                .apply_done
                .expect("filtered")
                .duration_since(entry.added_at);
            self.avg_receive = update_average(self.avg_receive, receive, self.receive_samples);
            self.receive_samples += 1;
            self.avg_apply = update_average(self.avg_apply, apply, self.apply_samples);
            self.apply_samples += 1;
        }
        (self.avg_receive, self.avg_apply)
    }
}

// avg' = avg + (sample - avg) / (n + 1), computed in nanoseconds to keep
// decreasing samples exact.
fn update_average(avg: Duration, sample: Duration, samples_so_far: u64) -> Duration {
    let avg_ns = avg.as_nanos() as i128;
    let sample_ns = sample.as_nanos() as i128;
    let next = avg_ns + (sample_ns - avg_ns) / (samples_so_far as i128 + 1);
    Duration::from_nanos(next.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};
    use stratum_types::{Epoch, OperationMetadata};

    fn op(lsn: i64) -> Arc<Operation> {
        Operation::new(
            OperationMetadata::normal(Lsn::new(lsn), Epoch::new(1, 100)),
            vec![Bytes::from_static(b"payload")],
        )
    }

    struct SendLog {
        sent: Mutex<Vec<(Option<i64>, bool)>>,
        request_acks: AtomicU64,
    }

    impl SendLog {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                request_acks: AtomicU64::new(0),
            })
        }

        fn sent_lsns(&self) -> Vec<i64> {
            self.sent
                .lock()
                .expect("lock poisoned")
                .iter()
                .filter_map(|(lsn, _)| *lsn)
                .collect()
        }
    }

    fn make_sender(
        initial_sws: u64,
        max_sws: u64,
        runtime: &Arc<AsyncRuntime>,
    ) -> (Arc<ReliableOperationSender>, Arc<SendLog>) {
        let sender = ReliableOperationSender::new(
            "test-sender",
            SenderConfig {
                retry_interval: Duration::from_secs(3600),
                initial_send_window: initial_sws,
                max_send_window: max_sws,
            },
            Arc::clone(runtime),
        );
        let log = SendLog::new();
        let log_clone = Arc::clone(&log);
        sender.open(Box::new(move |op, kind, _completed| {
            let request_ack = matches!(
                kind,
                SendKind::OperationWithRequestAck | SendKind::Probe
            );
            if request_ack {
                log_clone.request_acks.fetch_add(1, Ordering::SeqCst);
            }
            log_clone
                .sent
                .lock()
                .expect("lock poisoned")
                .push((op.map(|o| o.lsn().get()), request_ack));
            true
        }));
        (sender, log)
    }

    #[test]
    fn receive_ack_progress_drops_pending_and_widens_window() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, log) = make_sender(16, 32, &runtime);

        for lsn in 1..=3 {
            sender.add(op(lsn));
        }
        assert_eq!(log.sent_lsns(), vec![1, 2, 3]);
        assert_eq!(
            sender.pending_state(),
            vec![(Lsn::new(1), true), (Lsn::new(2), true), (Lsn::new(3), true)]
        );
        assert!(sender.has_retry_timer());

        assert!(sender.process_on_ack(Lsn::new(1), Lsn::new(0)));
        assert_eq!(sender.pending_count(), 2);
        assert_eq!(sender.send_window(), 17);

        assert!(sender.process_on_ack(Lsn::new(2), Lsn::new(0)));
        assert_eq!(sender.send_window(), 18);

        // Quorum-only motion is still progress.
        assert!(sender.process_on_ack(Lsn::new(2), Lsn::new(1)));
        assert_eq!(sender.send_window(), 19);

        // No motion on either axis.
        assert!(!sender.process_on_ack(Lsn::new(2), Lsn::new(1)));
        assert_eq!(sender.send_window(), 19);

        assert!(sender.process_on_ack(Lsn::new(3), Lsn::new(3)));
        assert_eq!(sender.pending_count(), 0);
        // Fully acknowledged: the retry timer is disarmed.
        assert!(!sender.has_retry_timer());
        runtime.shutdown();
    }

    #[test]
    fn window_caps_at_configured_maximum() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, _log) = make_sender(4, 5, &runtime);
        for lsn in 1..=4 {
            sender.add(op(lsn));
            sender.process_on_ack(Lsn::new(lsn), Lsn::new(lsn));
        }
        assert_eq!(sender.send_window(), 5);
        runtime.shutdown();
    }

    #[test]
    fn zero_max_window_uses_the_default_factor() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, _log) = make_sender(8, 0, &runtime);
        assert_eq!(
            sender.max_send_window(),
            DEFAULT_MAX_SWS_FACTOR_WHEN_0 * 8
        );
        for lsn in 1..=20 {
            sender.add(op(lsn));
            sender.process_on_ack(Lsn::new(lsn), Lsn::new(lsn));
        }
        assert_eq!(sender.send_window(), 16);
        runtime.shutdown();
    }

    #[test]
    fn items_beyond_the_window_wait_for_acks() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, log) = make_sender(4, 4, &runtime);

        for lsn in 1..=5 {
            sender.add(op(lsn));
        }
        // Only the first four go out; the fifth is held.
        assert_eq!(log.sent_lsns(), vec![1, 2, 3, 4]);
        assert_eq!(
            sender.pending_state().last().copied(),
            Some((Lsn::new(5), false))
        );

        // The ack makes room and releases the held item.
        sender.process_on_ack(Lsn::new(4), Lsn::new(4));
        assert_eq!(log.sent_lsns(), vec![1, 2, 3, 4, 5]);
        runtime.shutdown();
    }

    #[test]
    fn motionless_retry_pass_halves_window_then_probes() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, log) = make_sender(16, 16, &runtime);

        sender.add(op(1));
        sender.process_on_ack(Lsn::new(1), Lsn::new(1));
        sender.add(op(4));
        assert_eq!(sender.send_window(), 16, "window at max after progress");

        // The pass right after the ack consumes the motion flag.
        sender.run_retry_pass();
        assert_eq!(sender.send_window(), 16);

        // First motionless pass: halve toward 8, no probe yet.
        sender.run_retry_pass();
        assert_eq!(sender.send_window(), 8);
        assert_eq!(sender.request_ack_count(), 0);

        // Second motionless pass: halve again and probe the pending head.
        sender.run_retry_pass();
        assert_eq!(sender.send_window(), 4);
        assert_eq!(sender.request_ack_count(), 1);
        assert_eq!(log.request_acks.load(Ordering::SeqCst), 1);
        assert_eq!(
            sender.pending_state(),
            vec![(Lsn::new(4), true)],
            "only the unacked item remains pending"
        );

        // Progress resets the decay.
        assert!(sender.process_on_ack(Lsn::new(4), Lsn::new(2)));
        assert_eq!(sender.send_window(), 5);
        sender.run_retry_pass();
        assert_eq!(sender.send_window(), 5, "pass after motion does not halve");
        runtime.shutdown();
    }

    #[test]
    fn probe_without_pending_items_when_quorum_lags() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, log) = make_sender(8, 8, &runtime);

        sender.add(op(1));
        sender.add(op(2));
        // Received caught up, quorum lagging: pending drains but the
        // remote still owes apply progress.
        sender.process_on_ack(Lsn::new(2), Lsn::new(0));
        assert_eq!(sender.pending_count(), 0);
        assert!(sender.has_retry_timer(), "timer armed while quorum lags");

        sender.run_retry_pass();
        sender.run_retry_pass();
        sender.run_retry_pass();
        // The probe had no operation to piggyback on.
        assert!(log
            .sent
            .lock()
            .expect("lock poisoned")
            .iter()
            .any(|(lsn, request_ack)| lsn.is_none() && *request_ack));

        // Quorum catches up: the timer disarms.
        sender.process_on_ack(Lsn::new(2), Lsn::new(2));
        assert!(!sender.has_retry_timer());
        runtime.shutdown();
    }

    #[test]
    fn close_drops_pending() {
        let runtime = AsyncRuntime::for_tests();
        let (sender, _log) = make_sender(8, 8, &runtime);
        for lsn in 1..=3 {
            sender.add(op(lsn));
        }
        sender.close();
        assert_eq!(sender.pending_count(), 0);
        assert!(!sender.has_retry_timer());
        // Post-close operations are ignored.
        sender.add(op(9));
        assert_eq!(sender.pending_count(), 0);
        runtime.shutdown();
    }

    // ------------------------------------------------------------------
    // Latency list
    // ------------------------------------------------------------------

    fn latency_list(count: i64) -> OperationLatencyList {
        let mut list = OperationLatencyList::new();
        // Insertion order does not matter; the list orders by LSN.
        for lsn in (1..=count).rev() {
            list.add(Lsn::new(lsn));
        }
        list
    }

    fn assert_watches(list: &OperationLatencyList, receive_upto: i64, apply_upto: i64) {
        for (lsn, receive_done, apply_done) in list.watch_states() {
            assert_eq!(receive_done, lsn.get() <= receive_upto, "receive watch at {lsn}");
            assert_eq!(apply_done, lsn.get() <= apply_upto, "apply watch at {lsn}");
        }
    }

    #[test]
    fn latency_list_retires_fully_acked_entries() {
        let mut list = latency_list(100);

        list.on_ack(Lsn::new(2), Lsn::new(0));
        list.on_ack(Lsn::new(3), Lsn::new(0));
        list.on_ack(Lsn::new(4), Lsn::new(0));
        assert_watches(&list, 4, 0);

        list.on_ack(Lsn::new(4), Lsn::new(2));
        assert_watches(&list, 4, 2);
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 98);

        list.on_ack(Lsn::new(100), Lsn::new(99));
        assert_watches(&list, 100, 99);
        assert_eq!(list.count(), 98);
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 1);

        // Duplicate ack is idempotent.
        list.on_ack(Lsn::new(100), Lsn::new(99));
        assert_eq!(list.count(), 1);

        list.on_ack(Lsn::new(100), Lsn::new(100));
        assert_watches(&list, 100, 100);
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn latency_list_without_apply_progress_retires_nothing() {
        let mut list = latency_list(100);

        list.on_ack(Lsn::new(100), Lsn::new(0));
        assert_watches(&list, 100, 0);
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 100);

        list.on_ack(Lsn::new(100), Lsn::new(99));
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 1);
    }

    #[test]
    fn latency_list_full_ack_retires_everything() {
        let mut list = latency_list(100);
        list.on_ack(Lsn::new(100), Lsn::new(100));
        assert_watches(&list, 100, 100);
        list.compute_average_ack_duration();
        assert_eq!(list.count(), 0);
    }

    #[test]
    fn running_average_update_rule() {
        // Monotonically increasing samples: 1s, 3s, 5s, 7s, 9s.
        let mut avg = Duration::ZERO;
        for (n, secs) in [1u64, 3, 5, 7, 9].iter().enumerate() {
            avg = update_average(avg, Duration::from_secs(*secs), n as u64);
        }
        assert_eq!(avg, Duration::from_secs(5));

        // Decreasing samples: 5s, 3s, 1s, 1s, 1s.
        let mut avg = Duration::ZERO;
        for (n, secs) in [5u64, 3, 1, 1, 1].iter().enumerate() {
            avg = update_average(avg, Duration::from_secs(*secs), n as u64);
        }
        assert_eq!(avg, Duration::from_millis(2200));
    }
}
