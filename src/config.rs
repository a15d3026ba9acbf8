//! Client configuration (recognised options).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// KV engine options.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Minimum live connections per node pool.
    pub num_kv_connections: usize,
    /// Maximum live connections per node pool.
    pub max_kv_connections: usize,
    /// Socket connect plus handshake deadline.
    pub kv_connect_timeout_ms: u64,
    /// Capacity of the bounded per-pool send queue.
    pub send_queue_capacity: usize,
    /// Applied when a caller supplies no timeout.
    pub default_operation_timeout_ms: u64,
    /// Default per-operation durability deadline.
    pub durability_timeout_ms: u64,
    /// Largest frame the codec will emit or accept.
    pub max_packet_bytes: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            num_kv_connections: 2,
            max_kv_connections: 5,
            kv_connect_timeout_ms: 10_000,
            send_queue_capacity: 1024,
            default_operation_timeout_ms: 2_500,
            durability_timeout_ms: 1_500,
            // 20 MiB value ceiling plus header/extras slack.
            max_packet_bytes: 20 * 1024 * 1024 + 1024,
        }
    }
}

impl KvConfig {
    pub fn kv_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_connect_timeout_ms)
    }

    pub fn default_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.default_operation_timeout_ms)
    }

    pub fn durability_timeout(&self) -> Duration {
        Duration::from_millis(self.durability_timeout_ms)
    }
}
