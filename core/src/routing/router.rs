// Flood router — wraps outgoing data, decides deliver / relay / drop for
// incoming envelopes.
//
// The router never touches the radio. It hands back encoded bytes and lets
// the node fan them out to every neighbor.

use rand::Rng;
use tracing::{debug, warn};

use super::dedup::DedupSet;
use crate::identity::PeerIdentity;
use crate::message::{MeshEnvelope, MessageId, MessageType, SendMessageBody, WireError};

/// Data this node should hand to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: PeerIdentity,
    pub message_id: MessageId,
    pub data: Vec<u8>,
    pub broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// `(message_id, sender)` was processed before
    Duplicate,
    /// No hops left to relay with
    HopLimitExhausted,
    Malformed(WireError),
    /// Only SendMessage envelopes are routed
    Unsupported(MessageType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Deliver(Delivery),
    /// Re-encoded envelope to flood to every neighbor
    Relay(Vec<u8>),
    /// Broadcast data: deliver locally and keep flooding
    DeliverAndRelay(Delivery, Vec<u8>),
    Drop(DropReason),
}

/// An envelope ready to flood
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub message_id: MessageId,
    pub bytes: Vec<u8>,
}

pub struct Router {
    identity: PeerIdentity,
    initial_hop_limit: i32,
    dedup: DedupSet,
}

impl Router {
    pub fn new(identity: PeerIdentity, initial_hop_limit: i32, dedup_capacity: usize) -> Self {
        Self {
            identity,
            initial_hop_limit,
            dedup: DedupSet::new(dedup_capacity),
        }
    }

    /// Wrap data for a single destination.
    pub fn prepare_send(
        &mut self,
        data: &[u8],
        destination: PeerIdentity,
    ) -> Result<Outgoing, WireError> {
        self.prepare(SendMessageBody::to(destination, data.to_vec()))
    }

    /// Wrap data every node should deliver.
    pub fn prepare_broadcast(&mut self, data: &[u8]) -> Result<Outgoing, WireError> {
        self.prepare(SendMessageBody::broadcast(data.to_vec()))
    }

    fn prepare(&mut self, body: SendMessageBody) -> Result<Outgoing, WireError> {
        let message_id: MessageId = rand::thread_rng().gen();
        let envelope =
            MeshEnvelope::send_message(self.initial_hop_limit, message_id, self.identity, &body);
        let bytes = envelope.encode()?;

        // Never relay our own message back out
        self.dedup.insert((message_id, self.identity));
        debug!(
            "prepared message {} for {:?} ({} bytes)",
            message_id,
            body.destination,
            bytes.len()
        );
        Ok(Outgoing { message_id, bytes })
    }

    /// Decide what to do with an envelope a neighbor handed us.
    ///
    /// Dedup runs before the destination check, so an envelope reaching us
    /// over several paths is delivered once.
    pub fn on_receive(&mut self, raw: &[u8], from: &PeerIdentity) -> RouteDecision {
        let envelope = match MeshEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("malformed envelope from {}: {}", from, e);
                return RouteDecision::Drop(DropReason::Malformed(e));
            }
        };

        if envelope.message_type != MessageType::SendMessage {
            debug!(
                "ignoring {:?} envelope {} from {}",
                envelope.message_type, envelope.message_id, from
            );
            return RouteDecision::Drop(DropReason::Unsupported(envelope.message_type));
        }

        let body = match envelope.send_body() {
            Ok(body) => body,
            Err(e) => {
                warn!("malformed body in {} from {}: {}", envelope.message_id, from, e);
                return RouteDecision::Drop(DropReason::Malformed(e));
            }
        };

        if !self.dedup.insert((envelope.message_id, envelope.sender)) {
            debug!(
                "already routed message {} from {}, skipping",
                envelope.message_id, envelope.sender
            );
            return RouteDecision::Drop(DropReason::Duplicate);
        }

        let delivery = Delivery {
            sender: envelope.sender,
            message_id: envelope.message_id,
            data: body.msg.clone(),
            broadcast: body.is_broadcast,
        };

        if body.is_for(&self.identity) {
            return RouteDecision::Deliver(delivery);
        }

        if envelope.hop_limit <= 0 {
            debug!(
                "no hops left for message {} from {}",
                envelope.message_id, envelope.sender
            );
            return if body.is_broadcast {
                RouteDecision::Deliver(delivery)
            } else {
                RouteDecision::Drop(DropReason::HopLimitExhausted)
            };
        }

        let relayed = envelope.relayed();
        let bytes = match relayed.encode() {
            Ok(bytes) => bytes,
            Err(e) => return RouteDecision::Drop(DropReason::Malformed(e)),
        };
        debug!(
            "relaying message {} from {} with {} hops left",
            relayed.message_id, relayed.sender, relayed.hop_limit
        );

        if body.is_broadcast {
            RouteDecision::DeliverAndRelay(delivery, bytes)
        } else {
            RouteDecision::Relay(bytes)
        }
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity
    }

    pub fn seen_count(&self) -> usize {
        self.dedup.len()
    }
}
