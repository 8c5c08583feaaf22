// Mesh configuration — every timing, retry and sizing knob in one place

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::message::codec::SEND_BODY_PREFIX_LEN;
use crate::message::{HEADER_LEN, MAX_ENVELOPE_LEN};
use crate::transport::MAX_TRANSFER_SIZE;

/// XOR salt mixed into name hashes before the connection tie-break
pub const DEFAULT_TIE_BREAK_SALT: i32 = 0x5bf0_3635;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Transfer size {0} exceeds 517")]
    TransferSize(u16),
    #[error("Hop limit {0} is negative")]
    HopLimit(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Expiry of handshake steps and other tasks without their own value
    pub task_expiry_ms: u64,
    pub scan_expiry_ms: u64,
    /// Expiry of channel writes and indications
    pub write_expiry_ms: u64,
    pub advertise_expiry_ms: u64,
    /// Expiry of the disconnects issued while stopping
    pub stop_disconnect_expiry_ms: u64,
    /// Minimum spacing between scan starts
    pub scan_gap_ms: u64,
    /// Peers the first scan after start waits for
    pub initial_scan_peers: u32,
    /// Peers a regular scan waits for before stopping
    pub scan_peers: u32,
    pub max_connect_retries: u32,
    pub write_retries: u32,
    pub max_transfer_size: u16,
    pub initial_hop_limit: i32,
    pub dedup_capacity: usize,
    pub tie_break_salt: i32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            task_expiry_ms: 5_000,
            scan_expiry_ms: 3_000,
            write_expiry_ms: 2_000,
            advertise_expiry_ms: 10_000,
            stop_disconnect_expiry_ms: 1_500,
            scan_gap_ms: 6_500,
            initial_scan_peers: 1,
            scan_peers: 3,
            max_connect_retries: 7,
            write_retries: 3,
            max_transfer_size: MAX_TRANSFER_SIZE,
            initial_hop_limit: 4,
            dedup_capacity: 4_096,
            tie_break_salt: DEFAULT_TIE_BREAK_SALT,
        }
    }
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("task_expiry_ms", self.task_expiry_ms),
            ("scan_expiry_ms", self.scan_expiry_ms),
            ("write_expiry_ms", self.write_expiry_ms),
            ("advertise_expiry_ms", self.advertise_expiry_ms),
            ("stop_disconnect_expiry_ms", self.stop_disconnect_expiry_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.scan_peers == 0 {
            return Err(ConfigError::Zero("scan_peers"));
        }
        if self.initial_scan_peers == 0 {
            return Err(ConfigError::Zero("initial_scan_peers"));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Zero("dedup_capacity"));
        }
        if self.max_transfer_size == 0 || self.max_transfer_size > MAX_TRANSFER_SIZE {
            return Err(ConfigError::TransferSize(self.max_transfer_size));
        }
        if self.initial_hop_limit < 0 {
            return Err(ConfigError::HopLimit(self.initial_hop_limit));
        }
        Ok(())
    }

    pub fn task_expiry(&self) -> Duration {
        Duration::from_millis(self.task_expiry_ms)
    }

    pub fn scan_expiry(&self) -> Duration {
        Duration::from_millis(self.scan_expiry_ms)
    }

    pub fn write_expiry(&self) -> Duration {
        Duration::from_millis(self.write_expiry_ms)
    }

    pub fn advertise_expiry(&self) -> Duration {
        Duration::from_millis(self.advertise_expiry_ms)
    }

    pub fn stop_disconnect_expiry(&self) -> Duration {
        Duration::from_millis(self.stop_disconnect_expiry_ms)
    }

    /// Longest time any single task can hold the pending slot
    pub fn longest_expiry(&self) -> Duration {
        [
            self.task_expiry_ms,
            self.scan_expiry_ms,
            self.write_expiry_ms,
            self.advertise_expiry_ms,
            self.stop_disconnect_expiry_ms,
        ]
        .into_iter()
        .max()
        .map(Duration::from_millis)
        .unwrap_or_default()
    }

    pub fn scan_gap(&self) -> Duration {
        Duration::from_millis(self.scan_gap_ms)
    }

    /// Largest application payload a single envelope can carry
    pub fn max_payload_len(&self) -> usize {
        MAX_ENVELOPE_LEN - HEADER_LEN - SEND_BODY_PREFIX_LEN
    }
}
