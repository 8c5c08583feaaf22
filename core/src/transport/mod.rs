// Transport module — the radio seam the mesh drives

pub mod radio;

pub use radio::{
    AdvertisePayload, Channel, LinkAddress, LinkState, Radio, RadioError, RadioEvent, RequestId,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, IDENTITY_CHANNEL_UUID, MAX_TRANSFER_SIZE, MESSAGE_CHANNEL_UUID,
    SERVICE_UUID, SUBSCRIPTION_DESCRIPTOR_UUID,
};

#[cfg(test)]
pub use radio::MockRadio;
