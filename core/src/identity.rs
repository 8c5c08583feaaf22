// Peer identity — the 128-bit value a node announces during identity exchange

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::message::WireError;

/// A mesh node's identity.
///
/// Travels as 16 big-endian bytes, both in envelope headers and in the
/// identity channel of the link handshake. The nil value is reserved on the
/// wire to mean "no destination".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(Uuid);

impl PeerIdentity {
    /// Encoded length in bytes
    pub const LEN: usize = 16;

    /// Generate a fresh random identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse an identity from exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidIdentity(bytes.len()))?;
        Ok(Self::from_bytes(raw))
    }

    /// First five characters of the textual form, used in fallback names
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(5).collect()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for PeerIdentity {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
