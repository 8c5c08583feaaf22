// Task — one radio operation waiting for, or holding, the single-flight slot

use std::fmt;
use std::time::Duration;

use crate::config::MeshConfig;
use crate::identity::PeerIdentity;
use crate::roles::Role;
use crate::transport::LinkAddress;

/// Identity of a task instance, used to tell stale expiry timers apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Every radio operation either role can ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    // Central ladder
    Scan {
        /// Discoveries to collect before the scan ends early
        peers_needed: u32,
    },
    ConnectToPeer {
        address: LinkAddress,
        name: Option<String>,
    },
    DiscoverCapabilities {
        address: LinkAddress,
    },
    NegotiateTransferSize {
        address: LinkAddress,
        size: u16,
    },
    EnableIndication {
        address: LinkAddress,
    },
    ReadIdentity {
        address: LinkAddress,
    },
    WriteIdentity {
        address: LinkAddress,
        peer: PeerIdentity,
        retries_left: u32,
    },
    WriteMessage {
        address: LinkAddress,
        peer: PeerIdentity,
        data: Vec<u8>,
        retries_left: u32,
    },
    Disconnect {
        address: LinkAddress,
        /// Drop the address's retry count once the link is down
        forget_retries: bool,
        /// Queue a fresh connection attempt once the link is down
        reconnect: bool,
    },

    // Peripheral ladder
    StartLocalService,
    Advertise,
    AcceptPeerConnection {
        address: LinkAddress,
    },
    SendIndication {
        address: LinkAddress,
        data: Vec<u8>,
        retries_left: u32,
    },
    DisconnectPeer {
        address: LinkAddress,
    },
    CloseLocalService,
}

impl TaskKind {
    pub fn role(&self) -> Role {
        match self {
            TaskKind::Scan { .. }
            | TaskKind::ConnectToPeer { .. }
            | TaskKind::DiscoverCapabilities { .. }
            | TaskKind::NegotiateTransferSize { .. }
            | TaskKind::EnableIndication { .. }
            | TaskKind::ReadIdentity { .. }
            | TaskKind::WriteIdentity { .. }
            | TaskKind::WriteMessage { .. }
            | TaskKind::Disconnect { .. } => Role::Central,
            TaskKind::StartLocalService
            | TaskKind::Advertise
            | TaskKind::AcceptPeerConnection { .. }
            | TaskKind::SendIndication { .. }
            | TaskKind::DisconnectPeer { .. }
            | TaskKind::CloseLocalService => Role::Peripheral,
        }
    }

    /// Remote address the task targets
    pub fn address(&self) -> Option<&str> {
        match self {
            TaskKind::ConnectToPeer { address, .. }
            | TaskKind::DiscoverCapabilities { address }
            | TaskKind::NegotiateTransferSize { address, .. }
            | TaskKind::EnableIndication { address }
            | TaskKind::ReadIdentity { address }
            | TaskKind::WriteIdentity { address, .. }
            | TaskKind::WriteMessage { address, .. }
            | TaskKind::Disconnect { address, .. }
            | TaskKind::AcceptPeerConnection { address }
            | TaskKind::SendIndication { address, .. }
            | TaskKind::DisconnectPeer { address } => Some(address),
            TaskKind::Scan { .. }
            | TaskKind::StartLocalService
            | TaskKind::Advertise
            | TaskKind::CloseLocalService => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Scan { .. } => "scan",
            TaskKind::ConnectToPeer { .. } => "connect",
            TaskKind::DiscoverCapabilities { .. } => "discover-capabilities",
            TaskKind::NegotiateTransferSize { .. } => "negotiate-transfer-size",
            TaskKind::EnableIndication { .. } => "enable-indication",
            TaskKind::ReadIdentity { .. } => "read-identity",
            TaskKind::WriteIdentity { .. } => "write-identity",
            TaskKind::WriteMessage { .. } => "write-message",
            TaskKind::Disconnect { .. } => "disconnect",
            TaskKind::StartLocalService => "start-service",
            TaskKind::Advertise => "advertise",
            TaskKind::AcceptPeerConnection { .. } => "accept",
            TaskKind::SendIndication { .. } => "indicate",
            TaskKind::DisconnectPeer { .. } => "disconnect-peer",
            TaskKind::CloseLocalService => "close-service",
        }
    }

    /// The same write with one retry fewer, or `None` once retries ran out
    /// (or the kind does not retry).
    pub fn retried(&self) -> Option<TaskKind> {
        match self {
            TaskKind::WriteIdentity {
                address,
                peer,
                retries_left,
            } if *retries_left > 0 => Some(TaskKind::WriteIdentity {
                address: address.clone(),
                peer: *peer,
                retries_left: retries_left - 1,
            }),
            TaskKind::WriteMessage {
                address,
                peer,
                data,
                retries_left,
            } if *retries_left > 0 => Some(TaskKind::WriteMessage {
                address: address.clone(),
                peer: *peer,
                data: data.clone(),
                retries_left: retries_left - 1,
            }),
            TaskKind::SendIndication {
                address,
                data,
                retries_left,
            } if *retries_left > 0 => Some(TaskKind::SendIndication {
                address: address.clone(),
                data: data.clone(),
                retries_left: retries_left - 1,
            }),
            _ => None,
        }
    }

    /// Expiry used when the enqueuer does not pick one
    pub fn default_expiry(&self, config: &MeshConfig) -> Duration {
        match self {
            TaskKind::Scan { .. } => config.scan_expiry(),
            TaskKind::WriteIdentity { .. }
            | TaskKind::WriteMessage { .. }
            | TaskKind::SendIndication { .. } => config.write_expiry(),
            TaskKind::Advertise => config.advertise_expiry(),
            _ => config.task_expiry(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{}({})", self.name(), address),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub expiry: Duration,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.kind)
    }
}
