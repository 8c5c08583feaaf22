// Neighbor table — role-agnostic view of fully connected peers

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::identity::PeerIdentity;
use crate::roles::Role;
use crate::transport::LinkAddress;

/// A peer that finished identity exchange with us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub identity: PeerIdentity,
    pub name: String,
    pub address: LinkAddress,
    /// Which of our roles owns the link
    pub role: Role,
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A radio link came up; identity not yet known
    NeighborDiscovered {
        name: Option<String>,
        address: LinkAddress,
    },
    NeighborConnected(Neighbor),
    NeighborDisconnected(Neighbor),
    /// Application data addressed to us (or broadcast) arrived
    DataReceived {
        /// Node that originated the message
        sender: PeerIdentity,
        /// Neighbor the message arrived through
        via: PeerIdentity,
        data: Vec<u8>,
        broadcast: bool,
    },
}

/// identity → neighbor, at most one entry per identity.
///
/// Link data from neighbors is parked in an inbound buffer so the node can
/// route it after the role handler that received it returns.
pub struct NeighborTable {
    entries: HashMap<PeerIdentity, Neighbor>,
    inbound: VecDeque<(PeerIdentity, Vec<u8>)>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl NeighborTable {
    pub fn new(events: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            inbound: VecDeque::new(),
            events,
        }
    }

    pub fn notify_discovered(&self, name: Option<&str>, address: &str) {
        debug!("discovered {:?} at {}", name, address);
        self.emit(MeshEvent::NeighborDiscovered {
            name: name.map(str::to_string),
            address: address.to_string(),
        });
    }

    /// Record a completed identity exchange.
    ///
    /// Returns false, without raising anything, when the identity is already
    /// a neighbor.
    pub fn notify_connect(
        &mut self,
        identity: PeerIdentity,
        role: Role,
        address: &str,
        name: Option<&str>,
    ) -> bool {
        if self.entries.contains_key(&identity) {
            warn!("{} is already a neighbor, ignoring second connect", identity);
            return false;
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => fallback_name(role, &identity),
        };
        let neighbor = Neighbor {
            identity,
            name,
            address: address.to_string(),
            role,
        };
        info!(role = %role, "neighbor {} ({}) connected", neighbor.name, identity);
        self.entries.insert(identity, neighbor.clone());
        self.emit(MeshEvent::NeighborConnected(neighbor));
        true
    }

    /// Remove a neighbor, raising the disconnect event once.
    pub fn notify_disconnect(&mut self, identity: &PeerIdentity) -> Option<Neighbor> {
        let neighbor = self.entries.remove(identity)?;
        info!(role = %neighbor.role, "neighbor {} ({}) disconnected", neighbor.name, identity);
        self.emit(MeshEvent::NeighborDisconnected(neighbor.clone()));
        Some(neighbor)
    }

    /// Accept link data only from current neighbors.
    pub fn notify_data(&mut self, identity: &PeerIdentity, data: Vec<u8>) -> bool {
        if !self.entries.contains_key(identity) {
            warn!("dropping {} bytes from {}: not a neighbor", data.len(), identity);
            return false;
        }
        self.inbound.push_back((*identity, data));
        true
    }

    pub(crate) fn take_inbound(&mut self) -> Vec<(PeerIdentity, Vec<u8>)> {
        self.inbound.drain(..).collect()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            debug!("no listener for mesh events");
        }
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<&Neighbor> {
        self.entries.get(identity)
    }

    /// Whether any neighbor is reached through this link address
    pub fn has_address(&self, address: &str) -> bool {
        self.entries.values().any(|n| n.address == address)
    }

    pub fn contains(&self, identity: &PeerIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// Snapshot ordered by identity
    pub fn list(&self) -> Vec<Neighbor> {
        let mut all: Vec<_> = self.entries.values().cloned().collect();
        all.sort_by_key(|n| n.identity);
        all
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        let mut all: Vec<_> = self.entries.keys().copied().collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fallback_name(role: Role, identity: &PeerIdentity) -> String {
    // Our central role links to their peripheral and vice versa
    let remote = match role {
        Role::Central => "Peripheral",
        Role::Peripheral => "Central",
    };
    format!("Unknown-{}-{}", remote, identity.short())
}
