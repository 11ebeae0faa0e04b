//! Transport contract and the in-memory mesh.
//!
//! The replication core only needs two capabilities from its transport:
//! send a tagged message toward an endpoint, and deliver incoming messages
//! to the processor registered for the target endpoint. Everything else
//! (framing, endpoint resolution, connection lifecycle) lives behind this
//! trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use stratum_types::ReplicationEndpointId;

use crate::message::Message;

/// Receives messages delivered for a registered endpoint.
pub trait MessageProcessor: Send + Sync {
    fn process_message(&self, message: Message);
}

/// Message egress/ingress abstraction.
pub trait Transport: Send + Sync {
    /// Attempts delivery toward `target`. `false` means the send failed and
    /// the caller's retry machinery owns recovery.
    fn send_to(&self, target: &ReplicationEndpointId, message: Message) -> bool;

    /// Routes future messages for `endpoint` to `processor`.
    fn register_processor(
        &self,
        endpoint: ReplicationEndpointId,
        processor: Arc<dyn MessageProcessor>,
    );

    /// Stops routing for `endpoint`; undeliverable messages are dropped.
    fn unregister_processor(&self, endpoint: &ReplicationEndpointId);
}

/// Loopback mesh delivering on the sender's thread.
///
/// Used by the test suites and demos; delivery is synchronous, so a test
/// that sends a message observes its full processing once `send_to`
/// returns.
#[derive(Default)]
pub struct InMemoryTransport {
    processors: Mutex<HashMap<ReplicationEndpointId, Arc<dyn MessageProcessor>>>,
    dropped: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Messages that had no registered processor.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for InMemoryTransport {
    fn send_to(&self, target: &ReplicationEndpointId, message: Message) -> bool {
        let processor = {
            let processors = self.processors.lock().expect("lock poisoned");
            processors.get(target).cloned()
        };
        match processor {
            Some(processor) => {
                processor.process_message(message);
                true
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %target, action = %message.action(), "dropping unroutable message");
                false
            }
        }
    }

    fn register_processor(
        &self,
        endpoint: ReplicationEndpointId,
        processor: Arc<dyn MessageProcessor>,
    ) {
        self.processors
            .lock()
            .expect("lock poisoned")
            .insert(endpoint, processor);
    }

    fn unregister_processor(&self, endpoint: &ReplicationEndpointId) {
        self.processors.lock().expect("lock poisoned").remove(endpoint);
    }
}
