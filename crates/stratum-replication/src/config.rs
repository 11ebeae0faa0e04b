//! Replicator configuration.
//!
//! Every knob the engine reads, with defaults matching long-run production
//! values. The struct is TOML-loadable; unknown fields are rejected, absent
//! fields take their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for one replicator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicatorConfig {
    // ------------------------------------------------------------------
    // Primary replication queue
    // ------------------------------------------------------------------
    /// Initial capacity of the primary replication queue (rounded up to a
    /// power of two).
    pub initial_replication_queue_size: u64,

    /// Maximum capacity of the primary replication queue; 0 means bounded
    /// only by memory.
    pub max_replication_queue_size: u64,

    /// Memory ceiling of the primary replication queue in bytes; 0 means
    /// unbounded.
    pub max_replication_queue_memory_size: u64,

    /// Completed-window size of the primary queue: how many acknowledged
    /// operations are retained for catching up slow replicas; 0 retains
    /// without a count bound.
    pub max_primary_replication_queue_size: u64,

    /// Memory bound of the primary completed window; 0 means unbounded.
    pub max_primary_replication_queue_memory_size: u64,

    // ------------------------------------------------------------------
    // Copy queue
    // ------------------------------------------------------------------
    pub initial_copy_queue_size: u64,
    pub max_copy_queue_size: u64,

    // ------------------------------------------------------------------
    // Secondary replication queue
    // ------------------------------------------------------------------
    pub initial_secondary_replication_queue_size: u64,
    pub max_secondary_replication_queue_size: u64,
    pub max_secondary_replication_queue_memory_size: u64,

    // ------------------------------------------------------------------
    // Sending and acknowledgement
    // ------------------------------------------------------------------
    /// Interval between retry scans of a session's pending operations.
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,

    /// Secondary-side delay for coalescing acknowledgements.
    #[serde(with = "duration_millis")]
    pub batch_acknowledgement_interval: Duration,

    /// Pending-acknowledgement count that forces an immediate ack.
    pub max_pending_acknowledgements: u64,

    /// Upper bound for a single wire frame.
    pub max_replication_message_size: u64,

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------
    #[serde(with = "duration_millis")]
    pub queue_health_monitoring_interval: Duration,

    #[serde(with = "duration_millis")]
    pub slow_api_monitoring_interval: Duration,

    // ------------------------------------------------------------------
    // Behavior switches
    // ------------------------------------------------------------------
    /// When true the secondary's ack waits for the service to acknowledge
    /// each operation; when false the secondary acks optimistically on
    /// commit.
    pub require_service_ack: bool,

    /// When true the secondary queue drops operations as soon as they are
    /// acknowledged (clean-on-complete).
    pub secondary_clear_acknowledged_operations: bool,

    /// Emit stream-fault sentinels and expect an explicit ack for the
    /// end-of-stream operation.
    pub use_stream_faults_and_end_of_stream_operation_ack: bool,

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------
    /// Address the replicator's transport listens on.
    pub replicator_listen_address: String,

    /// Address advertised to peers in outgoing from-headers; empty means
    /// advertise the listen address.
    pub replicator_publish_address: String,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            initial_replication_queue_size: 64,
            max_replication_queue_size: 1024,
            max_replication_queue_memory_size: 0,
            max_primary_replication_queue_size: 1024,
            max_primary_replication_queue_memory_size: 0,
            initial_copy_queue_size: 64,
            max_copy_queue_size: 1024,
            initial_secondary_replication_queue_size: 64,
            max_secondary_replication_queue_size: 2048,
            max_secondary_replication_queue_memory_size: 0,
            retry_interval: Duration::from_secs(5),
            batch_acknowledgement_interval: Duration::from_millis(15),
            max_pending_acknowledgements: 10,
            max_replication_message_size: 50 * 1024 * 1024,
            queue_health_monitoring_interval: Duration::from_secs(30),
            slow_api_monitoring_interval: Duration::from_secs(120),
            require_service_ack: false,
            secondary_clear_acknowledged_operations: false,
            use_stream_faults_and_end_of_stream_operation_ack: false,
            replicator_listen_address: "localhost:0".to_string(),
            replicator_publish_address: String::new(),
        }
    }
}

impl ReplicatorConfig {
    /// Parses a TOML fragment over the defaults.
    pub fn from_toml(input: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    /// The address peers should reach this replicator at: the publish
    /// address when configured, the listen address otherwise.
    pub fn advertised_address(&self) -> &str {
        if self.replicator_publish_address.is_empty() {
            &self.replicator_listen_address
        } else {
            &self.replicator_publish_address
        }
    }
}

mod duration_millis {
    //! Durations as integer milliseconds in config files.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
