//! Radio seam: the commands the mesh issues and the events it gets back.
//!
//! Every command is fire-and-forget. A returned `Ok(())` only means the
//! radio accepted the command; the outcome arrives later as a
//! [`RadioEvent`] fed into the node. Implementations must never call back
//! into the node from inside a command.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Mesh service UUID (0xB81D)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_B81D_0000_1000_8000_00805F9B34FB);

/// Message channel UUID (0xBEEF)
pub const MESSAGE_CHANNEL_UUID: Uuid = Uuid::from_u128(0x0000_BEEF_0000_1000_8000_00805F9B34FB);

/// Identity channel UUID
pub const IDENTITY_CHANNEL_UUID: Uuid = Uuid::from_u128(0xB000_000F_0000_1000_8000_00805F9B34FB);

/// Subscription (client characteristic configuration) descriptor UUID (0x2902)
pub const SUBSCRIPTION_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805F9B34FB);

/// Descriptor value that turns indications on
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// Descriptor value that turns notifications and indications off
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Largest transfer size a link negotiates
pub const MAX_TRANSFER_SIZE: u16 = 517;

/// Link-layer address of a remote radio
pub type LinkAddress = String;

/// Opaque handle tying a peripheral-side request to its response
pub type RequestId = u64;

/// Channels exposed by the mesh service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Carries encoded envelopes
    Message,
    /// Carries 16-byte identities during the handshake
    Identity,
    /// Anything else a remote side touched
    Other(Uuid),
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        match self {
            Channel::Message => MESSAGE_CHANNEL_UUID,
            Channel::Identity => IDENTITY_CHANNEL_UUID,
            Channel::Other(uuid) => *uuid,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        if uuid == MESSAGE_CHANNEL_UUID {
            Channel::Message
        } else if uuid == IDENTITY_CHANNEL_UUID {
            Channel::Identity
        } else {
            Channel::Other(uuid)
        }
    }
}

/// Link state reported by connection-change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Disconnected,
    /// A state code this stack does not model
    Other(i32),
}

/// What the peripheral puts on air while advertising
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisePayload {
    pub service: Uuid,
    pub name: String,
}

/// Errors a radio returns synchronously when it cannot accept a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio unavailable: {0}")]
    Unavailable(String),
    #[error("Not connected: {0}")]
    NotConnected(LinkAddress),
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Commands the mesh issues to the radio.
#[cfg_attr(test, mockall::automock)]
pub trait Radio: Send + Sync {
    /// Name this radio advertises; drives the connection tie-break
    fn local_name(&self) -> String;

    fn start_scan(&self, service: Uuid) -> Result<(), RadioError>;
    fn stop_scan(&self) -> Result<(), RadioError>;

    // Central side
    fn connect(&self, address: &str) -> Result<(), RadioError>;
    fn disconnect(&self, address: &str) -> Result<(), RadioError>;
    fn discover_capabilities(&self, address: &str) -> Result<(), RadioError>;
    fn negotiate_transfer_size(&self, address: &str, size: u16) -> Result<(), RadioError>;
    fn set_notification(&self, address: &str, channel: Channel, enabled: bool)
        -> Result<(), RadioError>;
    fn read_channel(&self, address: &str, channel: Channel) -> Result<(), RadioError>;
    fn write_channel(&self, address: &str, channel: Channel, data: &[u8])
        -> Result<(), RadioError>;

    // Peripheral side
    fn open_local_service(&self, service: Uuid) -> Result<(), RadioError>;
    fn close_local_service(&self) -> Result<(), RadioError>;
    fn advertise(&self, payload: &AdvertisePayload) -> Result<(), RadioError>;
    fn stop_advertising(&self) -> Result<(), RadioError>;
    fn accept_connection(&self, address: &str) -> Result<(), RadioError>;
    fn cancel_connection(&self, address: &str) -> Result<(), RadioError>;
    fn send_notification(&self, address: &str, data: &[u8]) -> Result<(), RadioError>;
    /// Answer a read, write or descriptor request. An empty `value` means no payload.
    fn respond(
        &self,
        address: &str,
        request: RequestId,
        ok: bool,
        value: Vec<u8>,
    ) -> Result<(), RadioError>;
}

/// Asynchronous results and requests delivered by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    // Central side
    Discovered {
        address: LinkAddress,
        name: Option<String>,
    },
    ScanFailed {
        code: i32,
    },
    ConnectionStateChanged {
        address: LinkAddress,
        name: Option<String>,
        state: LinkState,
    },
    CapabilitiesDiscovered {
        address: LinkAddress,
        ok: bool,
        /// Whether the remote exposes the mesh service
        has_mesh_service: bool,
    },
    TransferSizeChanged {
        address: LinkAddress,
        size: u16,
        ok: bool,
    },
    DescriptorWritten {
        address: LinkAddress,
        descriptor: Uuid,
        ok: bool,
    },
    ChannelRead {
        address: LinkAddress,
        channel: Channel,
        ok: bool,
        value: Vec<u8>,
    },
    ChannelWritten {
        address: LinkAddress,
        channel: Channel,
        ok: bool,
    },
    ChannelChanged {
        address: LinkAddress,
        channel: Channel,
        value: Vec<u8>,
    },

    // Peripheral side
    ServiceStarted {
        service: Uuid,
        ok: bool,
    },
    AdvertiseStarted {
        ok: bool,
    },
    PeerConnectionChanged {
        address: LinkAddress,
        name: Option<String>,
        state: LinkState,
    },
    ReadRequest {
        address: LinkAddress,
        request: RequestId,
        channel: Channel,
    },
    WriteRequest {
        address: LinkAddress,
        request: RequestId,
        channel: Channel,
        value: Vec<u8>,
        response_needed: bool,
    },
    SubscriptionRequest {
        address: LinkAddress,
        request: RequestId,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    DescriptorReadRequest {
        address: LinkAddress,
        request: RequestId,
        descriptor: Uuid,
    },
    NotificationSent {
        address: LinkAddress,
        ok: bool,
    },
}

impl RadioEvent {
    /// Address of the remote radio this event concerns, if any
    pub fn address(&self) -> Option<&str> {
        match self {
            RadioEvent::Discovered { address, .. }
            | RadioEvent::ConnectionStateChanged { address, .. }
            | RadioEvent::CapabilitiesDiscovered { address, .. }
            | RadioEvent::TransferSizeChanged { address, .. }
            | RadioEvent::DescriptorWritten { address, .. }
            | RadioEvent::ChannelRead { address, .. }
            | RadioEvent::ChannelWritten { address, .. }
            | RadioEvent::ChannelChanged { address, .. }
            | RadioEvent::PeerConnectionChanged { address, .. }
            | RadioEvent::ReadRequest { address, .. }
            | RadioEvent::WriteRequest { address, .. }
            | RadioEvent::SubscriptionRequest { address, .. }
            | RadioEvent::DescriptorReadRequest { address, .. }
            | RadioEvent::NotificationSent { address, .. } => Some(address),
            RadioEvent::ScanFailed { .. }
            | RadioEvent::ServiceStarted { .. }
            | RadioEvent::AdvertiseStarted { .. } => None,
        }
    }

    /// Whether the event belongs to the peripheral role
    pub fn is_peripheral(&self) -> bool {
        matches!(
            self,
            RadioEvent::ServiceStarted { .. }
                | RadioEvent::AdvertiseStarted { .. }
                | RadioEvent::PeerConnectionChanged { .. }
                | RadioEvent::ReadRequest { .. }
                | RadioEvent::WriteRequest { .. }
                | RadioEvent::SubscriptionRequest { .. }
                | RadioEvent::DescriptorReadRequest { .. }
                | RadioEvent::NotificationSent { .. }
        )
    }
}
