// meshbase core — short-range radio mesh
//
// Every node runs both radio roles at once: a central that scans and
// connects out, and a peripheral that advertises and accepts. Links finish
// an identity exchange before they count as neighbors; data floods across
// neighbors with per-message dedup and a hop limit.

pub mod config;
pub mod identity;
pub mod message;
pub mod neighbor;
pub mod node;
pub mod roles;
pub mod routing;
pub mod runtime;
pub mod scheduler;
pub mod sim;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, MeshConfig};
pub use identity::PeerIdentity;
pub use message::{AckMessageBody, MeshEnvelope, MessageId, MessageType, SendMessageBody, WireError};
pub use neighbor::{MeshEvent, Neighbor, NeighborTable};
pub use node::MeshNode;
pub use roles::Role;
pub use routing::{RouteDecision, Router};
pub use runtime::MeshDriver;
pub use scheduler::{TaskKind, TaskScheduler, Wakeup};
pub use transport::{Radio, RadioError, RadioEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Node is not running")]
    NotRunning,
    #[error("Could not send to any neighbor")]
    NoNeighbors,
    #[error("Neighbor not connected: {0}")]
    NeighborNotConnected(PeerIdentity),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}
