// SPDX-License-Identifier: Apache-2.0
//! Server configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one [`crate::Server`] instance. Per-document policy flags
/// are inherited from here at document creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen port.
    pub port: u16,
    /// Default document tick period in milliseconds.
    pub cycle_ms: u64,
    /// Enable the persistence coordinator.
    pub allow_save: bool,
    /// Permit pull-based full-state reads (SyncRequest).
    pub allow_sync: bool,
    /// Advertise peer-to-peer transport negotiation in Welcome.
    pub allow_webrtc: bool,
    /// Offer the Fast binary patch encoding (else JSON only).
    pub allow_fast_patch: bool,
    /// Compress binary batches above the threshold.
    pub allow_compression: bool,
    /// Compression threshold in bytes.
    pub compress_min: usize,
    /// Artificial delay added to the send path, for testing.
    pub simulate_latency_ms: u64,
    /// Heartbeat ping interval in milliseconds.
    pub heartbeat_ms: u64,
    /// Minimum interval between two saves of the same document, ms.
    pub save_min_interval_ms: u64,
    /// Bound on each session's outgoing queue, in batches.
    pub send_queue_capacity: usize,
    /// Maximum number of live documents.
    pub max_inflight_documents: usize,
    /// Keep documents ticking with zero subscribers instead of evicting.
    pub keep_alive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8230,
            cycle_ms: 100,
            allow_save: false,
            allow_sync: false,
            allow_webrtc: false,
            allow_fast_patch: true,
            allow_compression: false,
            compress_min: drift_core::codec::DEFAULT_COMPRESS_MIN,
            simulate_latency_ms: 0,
            heartbeat_ms: 15_000,
            save_min_interval_ms: 5_000,
            send_queue_capacity: 256,
            max_inflight_documents: 1024,
            keep_alive: false,
        }
    }
}

impl ServerConfig {
    /// Tick period as a [`Duration`].
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Save debounce floor as a [`Duration`].
    pub fn save_min_interval(&self) -> Duration {
        Duration::from_millis(self.save_min_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.cycle_ms, 100);
        assert_eq!(config.heartbeat_ms, 15_000);
        assert_eq!(config.save_min_interval_ms, 5_000);
        assert_eq!(config.send_queue_capacity, 256);
        assert!(!config.allow_save);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"port": 9000, "allow_save": true}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.allow_save);
        assert_eq!(config.cycle_ms, 100);
    }
}
