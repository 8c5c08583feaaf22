//! Central and peripheral handshake ladders
//!
//! Both roles share one radio and one scheduler. Neither owns the other or
//! the shared state; every handler gets a [`RoleContext`] borrowed from the
//! node for the duration of one call.

pub mod central;
pub mod peripheral;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::config::MeshConfig;
use crate::identity::PeerIdentity;
use crate::neighbor::NeighborTable;
use crate::scheduler::{TaskId, TaskKind, TaskScheduler, TaskTimer};
use crate::transport::{LinkAddress, Radio};

pub use central::Central;
pub use peripheral::Peripheral;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Central,
    Peripheral,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Central => write!(f, "central"),
            Role::Peripheral => write!(f, "peripheral"),
        }
    }
}

/// A link that is up but has not finished identity exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectingPeer {
    pub address: LinkAddress,
    pub name: Option<String>,
    pub transfer_size: Option<u16>,
    pub identity: Option<PeerIdentity>,
}

impl ConnectingPeer {
    pub fn new(address: &str, name: Option<String>) -> Self {
        Self {
            address: address.to_string(),
            name,
            transfer_size: None,
            identity: None,
        }
    }
}

/// Failed connection attempts per address
#[derive(Debug, Default)]
pub struct RetryCounter {
    counts: HashMap<LinkAddress, u32>,
}

impl RetryCounter {
    pub fn count(&self, address: &str) -> u32 {
        self.counts.get(address).copied().unwrap_or(0)
    }

    pub fn bump(&mut self, address: &str) -> u32 {
        let count = self.counts.entry(address.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset(&mut self, address: &str) {
        self.counts.remove(address);
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// 32-bit polynomial string hash over UTF-16 code units (h = 31h + c,
/// wrapping), so peers on other stacks compute the same value.
pub fn name_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Whether the local node should leave the connection to the remote.
///
/// Exactly one of two nodes with different hashes defers: the one with the
/// larger salted hash.
pub fn defers_to_peer(local_name: &str, remote_name: &str, salt: i32) -> bool {
    (name_hash(local_name) ^ salt) > (name_hash(remote_name) ^ salt)
}

/// Shared node state a role handler may touch.
pub struct RoleContext<'a> {
    pub scheduler: &'a mut TaskScheduler,
    pub neighbors: &'a mut NeighborTable,
    pub radio: &'a dyn Radio,
    pub timer: &'a dyn TaskTimer,
    pub config: &'a MeshConfig,
    pub identity: PeerIdentity,
    /// Whether the peripheral role is accepting peers
    pub peripheral_on: bool,
}

impl RoleContext<'_> {
    /// Queue a task with its kind's default expiry
    pub fn enqueue(&mut self, kind: TaskKind) -> TaskId {
        let expiry = kind.default_expiry(self.config);
        self.scheduler.enqueue(kind, expiry)
    }

    pub fn enqueue_with_expiry(&mut self, kind: TaskKind, expiry: Duration) -> TaskId {
        self.scheduler.enqueue(kind, expiry)
    }

    /// Queue a regular scan
    pub fn enqueue_scan(&mut self) -> TaskId {
        let peers_needed = self.config.scan_peers;
        self.enqueue(TaskKind::Scan { peers_needed })
    }

    /// End the pending task; the node starts the next one
    pub fn complete(&mut self) {
        self.scheduler.complete();
    }

    pub fn pending(&self) -> Option<&TaskKind> {
        self.scheduler.pending_kind()
    }
}
