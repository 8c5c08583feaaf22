// Peripheral role — the accepting side of the handshake ladder
//
// open service → advertise → accept link → grant subscription →
// serve identity read → accept identity write → connected

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{ConnectingPeer, Role, RoleContext};
use crate::identity::PeerIdentity;
use crate::scheduler::{Task, TaskKind};
use crate::transport::{
    AdvertisePayload, Channel, LinkAddress, LinkState, RadioError, RadioEvent, RequestId,
    ENABLE_INDICATION_VALUE, SERVICE_UUID, SUBSCRIPTION_DESCRIPTOR_UUID,
};

#[derive(Debug, Default)]
pub struct Peripheral {
    on: bool,
    service_open: bool,
    advertising: bool,
    connecting: HashMap<LinkAddress, ConnectingPeer>,
    connected: HashMap<PeerIdentity, LinkAddress>,
    /// Descriptor value each central wrote to subscribe
    subscriptions: HashMap<LinkAddress, Vec<u8>>,
}

impl Peripheral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn is_service_open(&self) -> bool {
        self.service_open
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn identity_at(&self, address: &str) -> Option<PeerIdentity> {
        self.connected
            .iter()
            .find(|(_, a)| a.as_str() == address)
            .map(|(identity, _)| *identity)
    }

    pub fn address_of(&self, identity: &PeerIdentity) -> Option<&str> {
        self.connected.get(identity).map(String::as_str)
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    fn knows(&self, address: &str) -> bool {
        self.connecting.contains_key(address) || self.identity_at(address).is_some()
    }

    pub fn start(&mut self, ctx: &mut RoleContext<'_>) {
        if self.on {
            debug!(role = "peripheral", "already on");
            return;
        }
        self.on = true;
        ctx.enqueue(TaskKind::StartLocalService);
    }

    pub fn stop(&mut self, ctx: &mut RoleContext<'_>) {
        if !self.on {
            debug!(role = "peripheral", "already off");
            return;
        }
        self.on = false;
        self.stop_advertising(ctx);

        let mut addresses: Vec<LinkAddress> = self
            .connected
            .values()
            .chain(self.connecting.keys())
            .cloned()
            .collect();
        addresses.sort();
        addresses.dedup();
        info!(
            role = "peripheral",
            "stopping: disconnecting {} peer(s)",
            addresses.len()
        );

        let expiry = ctx.config.stop_disconnect_expiry();
        for address in addresses {
            ctx.enqueue_with_expiry(TaskKind::DisconnectPeer { address }, expiry);
        }
        ctx.enqueue(TaskKind::CloseLocalService);
    }

    fn stop_advertising(&mut self, ctx: &mut RoleContext<'_>) {
        if !self.advertising {
            return;
        }
        self.advertising = false;
        if let Err(e) = ctx.radio.stop_advertising() {
            warn!(role = "peripheral", "could not stop advertising: {}", e);
        }
    }

    pub fn start_task(&mut self, task: &Task, ctx: &mut RoleContext<'_>) -> Result<(), RadioError> {
        match &task.kind {
            TaskKind::StartLocalService => {
                if self.service_open || !self.on {
                    debug!(
                        role = "peripheral",
                        "skipping service start: open={} on={}",
                        self.service_open,
                        self.on
                    );
                    ctx.complete();
                    return Ok(());
                }
                ctx.radio.open_local_service(SERVICE_UUID)?;
                self.service_open = true;
            }
            TaskKind::Advertise => {
                if !self.service_open || !self.on || self.advertising {
                    debug!(
                        role = "peripheral",
                        "skipping advertise: open={} on={} advertising={}",
                        self.service_open,
                        self.on,
                        self.advertising
                    );
                    ctx.complete();
                    return Ok(());
                }
                let payload = AdvertisePayload {
                    service: SERVICE_UUID,
                    name: ctx.radio.local_name(),
                };
                if let Err(e) = ctx.radio.advertise(&payload) {
                    warn!(role = "peripheral", "could not advertise: {}", e);
                    if let Err(e) = ctx.radio.stop_advertising() {
                        debug!(role = "peripheral", "stop advertising failed too: {}", e);
                    }
                    ctx.enqueue(TaskKind::CloseLocalService);
                    ctx.complete();
                    return Ok(());
                }
                self.advertising = true;
            }
            TaskKind::AcceptPeerConnection { address } => {
                let result = ctx.radio.accept_connection(address);
                ctx.complete();
                result?;
            }
            TaskKind::SendIndication { address, data, .. } => {
                if !self.service_open || !self.knows(address) {
                    debug!(role = "peripheral", "no link to {}, dropping indication", address);
                    ctx.complete();
                    return Ok(());
                }
                ctx.radio.send_notification(address, data)?;
            }
            TaskKind::DisconnectPeer { address } => {
                if !self.service_open || !self.knows(address) {
                    debug!(role = "peripheral", "{} is not connected, skipping", address);
                    ctx.complete();
                    return Ok(());
                }
                ctx.radio.cancel_connection(address)?;
            }
            TaskKind::CloseLocalService => {
                if self.service_open {
                    self.stop_advertising(ctx);
                    let result = ctx.radio.close_local_service();
                    self.service_open = false;
                    if let Err(e) = result {
                        warn!(role = "peripheral", "could not close service: {}", e);
                    }
                }
                ctx.enqueue_scan();
                ctx.complete();
            }
            other => {
                warn!(role = "peripheral", "not a peripheral task: {}", other);
                ctx.complete();
            }
        }
        Ok(())
    }

    /// Recovery when a peripheral task ran out of time.
    pub fn expire_task(&mut self, task: &Task, ctx: &mut RoleContext<'_>) {
        match &task.kind {
            TaskKind::StartLocalService => {
                ctx.enqueue(TaskKind::CloseLocalService);
            }
            TaskKind::Advertise => {
                self.stop_advertising(ctx);
                ctx.enqueue(TaskKind::CloseLocalService);
            }
            TaskKind::SendIndication { address, .. } => match task.kind.retried() {
                Some(retry) => {
                    ctx.enqueue(retry);
                }
                None => {
                    ctx.enqueue(TaskKind::DisconnectPeer {
                        address: address.clone(),
                    });
                }
            },
            TaskKind::DisconnectPeer { address } => {
                self.drop_link(address, ctx);
            }
            _ => {}
        }
    }

    /// Forget a link locally and raise the disconnect once.
    fn drop_link(&mut self, address: &str, ctx: &mut RoleContext<'_>) -> bool {
        self.subscriptions.remove(address);
        let was_connecting = self.connecting.remove(address).is_some();
        let identity = self.identity_at(address);
        if let Some(identity) = identity {
            self.connected.remove(&identity);
            ctx.neighbors.notify_disconnect(&identity);
        }
        was_connecting || identity.is_some()
    }

    pub fn handle_event(&mut self, event: RadioEvent, ctx: &mut RoleContext<'_>) {
        match event {
            RadioEvent::ServiceStarted { service, ok } => {
                if !matches!(ctx.pending(), Some(TaskKind::StartLocalService)) {
                    debug!(role = "peripheral", "service start outside its task, ignoring");
                    return;
                }
                if self.on && ok && service == SERVICE_UUID {
                    debug!(role = "peripheral", "service {} open", service);
                    ctx.enqueue(TaskKind::Advertise);
                } else {
                    warn!(role = "peripheral", "service {} failed to open (ok={})", service, ok);
                    ctx.enqueue(TaskKind::CloseLocalService);
                }
                ctx.complete();
            }
            RadioEvent::AdvertiseStarted { ok } => {
                if !matches!(ctx.pending(), Some(TaskKind::Advertise)) {
                    debug!(role = "peripheral", "advertise result outside its task, ignoring");
                    return;
                }
                if ok {
                    debug!(role = "peripheral", "advertising");
                    ctx.enqueue_scan();
                } else {
                    warn!(role = "peripheral", "advertising failed to start");
                    self.advertising = false;
                    if let Err(e) = ctx.radio.stop_advertising() {
                        debug!(role = "peripheral", "stop advertising failed: {}", e);
                    }
                    ctx.enqueue(TaskKind::CloseLocalService);
                }
                ctx.complete();
            }
            RadioEvent::PeerConnectionChanged {
                address,
                name,
                state,
            } => self.on_connection_state(address, name, state, ctx),
            RadioEvent::DescriptorReadRequest {
                address,
                request,
                descriptor,
            } => {
                let value = if descriptor == SUBSCRIPTION_DESCRIPTOR_UUID {
                    self.subscriptions.get(&address).cloned()
                } else {
                    None
                };
                match value {
                    Some(value) => respond(ctx, &address, request, true, value),
                    None => self.reject(address, request, ctx),
                }
            }
            RadioEvent::SubscriptionRequest {
                address,
                request,
                descriptor,
                value,
            } => {
                if self.on
                    && descriptor == SUBSCRIPTION_DESCRIPTOR_UUID
                    && value == ENABLE_INDICATION_VALUE
                    && self.knows(&address)
                {
                    debug!(role = "peripheral", "{} subscribed", address);
                    self.subscriptions.insert(address.clone(), value);
                    respond(ctx, &address, request, true, Vec::new());
                } else {
                    warn!(role = "peripheral", "rejecting subscription {:?} from {}", value, address);
                    self.reject(address, request, ctx);
                }
            }
            RadioEvent::ReadRequest {
                address,
                request,
                channel,
            } => {
                if self.on && channel == Channel::Identity {
                    let own = ctx.identity.to_bytes().to_vec();
                    respond(ctx, &address, request, true, own);
                } else {
                    warn!(role = "peripheral", "rejecting read of {:?} from {}", channel, address);
                    self.reject(address, request, ctx);
                }
            }
            RadioEvent::WriteRequest {
                address,
                request,
                channel,
                value,
                response_needed,
            } => self.on_write(address, request, channel, value, response_needed, ctx),
            RadioEvent::NotificationSent { address, ok } => {
                let kind = match ctx.pending() {
                    Some(kind)
                        if matches!(kind, TaskKind::SendIndication { .. })
                            && kind.address() == Some(address.as_str()) =>
                    {
                        kind.clone()
                    }
                    _ => {
                        debug!(role = "peripheral", "indication result for {} not pending", address);
                        return;
                    }
                };
                if !ok {
                    match kind.retried() {
                        Some(retry) => {
                            debug!(role = "peripheral", "retrying {}", retry);
                            ctx.enqueue(retry);
                        }
                        None => {
                            warn!(role = "peripheral", "could not indicate {} after retries", address);
                            ctx.enqueue(TaskKind::DisconnectPeer { address });
                        }
                    }
                }
                ctx.complete();
            }
            other => debug!(role = "peripheral", "ignoring {:?}", other),
        }
    }

    fn reject(&mut self, address: LinkAddress, request: RequestId, ctx: &mut RoleContext<'_>) {
        respond(ctx, &address, request, false, Vec::new());
        ctx.enqueue(TaskKind::DisconnectPeer { address });
    }

    fn on_connection_state(
        &mut self,
        address: LinkAddress,
        name: Option<String>,
        state: LinkState,
        ctx: &mut RoleContext<'_>,
    ) {
        match state {
            LinkState::Connected => {
                if self.knows(&address) {
                    warn!(role = "peripheral", "{} connected twice, disconnecting", address);
                    ctx.enqueue(TaskKind::DisconnectPeer { address });
                    return;
                }
                self.connecting
                    .insert(address.clone(), ConnectingPeer::new(&address, name.clone()));
                if !self.on {
                    debug!(role = "peripheral", "off, refusing {}", address);
                    ctx.enqueue(TaskKind::DisconnectPeer { address });
                    return;
                }
                debug!(role = "peripheral", "connected (not fully) to {:?} {}", name, address);
                ctx.enqueue(TaskKind::AcceptPeerConnection {
                    address: address.clone(),
                });
                ctx.neighbors.notify_discovered(name.as_deref(), &address);
            }
            LinkState::Disconnected => {
                // Any pending peripheral task on this link can no longer finish
                let pending_here = ctx.pending().map_or(false, |k| {
                    k.role() == Role::Peripheral && k.address() == Some(address.as_str())
                });
                if self.drop_link(&address, ctx) {
                    warn!(role = "peripheral", "disconnected from {:?} {}", name, address);
                    ctx.enqueue_scan();
                }
                if pending_here {
                    ctx.complete();
                }
            }
            LinkState::Other(code) => {
                warn!(role = "peripheral", "unknown link state {} for {}", code, address);
            }
        }
    }

    fn on_write(
        &mut self,
        address: LinkAddress,
        request: RequestId,
        channel: Channel,
        value: Vec<u8>,
        response_needed: bool,
        ctx: &mut RoleContext<'_>,
    ) {
        let reply = |ctx: &mut RoleContext<'_>, ok: bool, value: Vec<u8>| {
            if response_needed {
                respond(ctx, &address, request, ok, value);
            }
        };

        match channel {
            Channel::Message => match self.identity_at(&address) {
                Some(identity) => {
                    debug!(role = "peripheral", "received {} bytes from {}", value.len(), address);
                    ctx.neighbors.notify_data(&identity, value);
                    reply(ctx, true, Vec::new());
                }
                None => {
                    warn!(role = "peripheral", "{} wrote data before connecting", address);
                    reply(ctx, false, Vec::new());
                    ctx.enqueue(TaskKind::DisconnectPeer {
                        address: address.clone(),
                    });
                }
            },
            Channel::Identity => {
                let peer = match PeerIdentity::from_slice(&value) {
                    Ok(peer) if self.connecting.contains_key(&address) => peer,
                    Ok(_) => {
                        warn!(role = "peripheral", "identity write from unknown {}", address);
                        reply(ctx, false, Vec::new());
                        ctx.enqueue(TaskKind::DisconnectPeer {
                            address: address.clone(),
                        });
                        return;
                    }
                    Err(e) => {
                        warn!(role = "peripheral", "bad identity from {}: {}", address, e);
                        reply(ctx, false, Vec::new());
                        ctx.enqueue(TaskKind::DisconnectPeer {
                            address: address.clone(),
                        });
                        return;
                    }
                };

                if peer == ctx.identity
                    || ctx.neighbors.contains(&peer)
                    || self.connected.contains_key(&peer)
                {
                    debug!(role = "peripheral", "{} is already connected as {}", address, peer);
                    reply(ctx, false, Vec::new());
                    ctx.enqueue(TaskKind::DisconnectPeer {
                        address: address.clone(),
                    });
                    return;
                }

                let name = self.connecting.remove(&address).and_then(|p| p.name);
                self.connected.insert(peer, address.clone());
                info!(role = "peripheral", "{} is now connected fully as {}", address, peer);
                ctx.neighbors
                    .notify_connect(peer, Role::Peripheral, &address, name.as_deref());
                ctx.enqueue(TaskKind::Advertise);
                ctx.enqueue_scan();
                let own = ctx.identity.to_bytes().to_vec();
                reply(ctx, true, own);
            }
            Channel::Other(uuid) => {
                warn!(role = "peripheral", "{} wrote unknown channel {}", address, uuid);
                reply(ctx, false, Vec::new());
                ctx.enqueue(TaskKind::DisconnectPeer {
                    address: address.clone(),
                });
            }
        }
    }
}

fn respond(ctx: &RoleContext<'_>, address: &str, request: RequestId, ok: bool, value: Vec<u8>) {
    if let Err(e) = ctx.radio.respond(address, request, ok, value) {
        warn!(role = "peripheral", "could not answer request {} from {}: {}", request, address, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::neighbor::{MeshEvent, NeighborTable};
    use crate::scheduler::{ManualTimer, TaskScheduler};
    use crate::transport::MockRadio;
    use mockall::predicate::*;
    use tokio::sync::mpsc;

    struct Harness {
        scheduler: TaskScheduler,
        neighbors: NeighborTable,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        radio: MockRadio,
        timer: ManualTimer,
        config: MeshConfig,
        identity: PeerIdentity,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, events) = mpsc::unbounded_channel();
            let mut radio = MockRadio::new();
            radio.expect_local_name().return_const("node-p".to_string());
            Self {
                scheduler: TaskScheduler::new(),
                neighbors: NeighborTable::new(tx),
                events,
                radio,
                timer: ManualTimer::new(),
                config: MeshConfig::default(),
                identity: PeerIdentity::random(),
            }
        }

        fn ctx(&mut self) -> RoleContext<'_> {
            RoleContext {
                scheduler: &mut self.scheduler,
                neighbors: &mut self.neighbors,
                radio: &self.radio,
                timer: &self.timer,
                config: &self.config,
                identity: self.identity,
                peripheral_on: true,
            }
        }

        fn queued_names(&self) -> Vec<&'static str> {
            self.scheduler.queued().map(|t| t.kind.name()).collect()
        }
    }

    fn connected_peer(h: &mut Harness, p: &mut Peripheral, address: &str) {
        p.handle_event(
            RadioEvent::PeerConnectionChanged {
                address: address.into(),
                name: Some("node-c".into()),
                state: LinkState::Connected,
            },
            &mut h.ctx(),
        );
    }

    #[test]
    fn test_service_ladder() {
        let mut h = Harness::new();
        h.radio
            .expect_open_local_service()
            .with(eq(SERVICE_UUID))
            .times(1)
            .returning(|_| Ok(()));
        h.radio.expect_advertise().times(1).returning(|_| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());

        let task = h.scheduler.begin_next().unwrap();
        p.start_task(&task, &mut h.ctx()).unwrap();
        assert!(p.is_service_open());
        p.handle_event(
            RadioEvent::ServiceStarted {
                service: SERVICE_UUID,
                ok: true,
            },
            &mut h.ctx(),
        );
        assert_eq!(h.queued_names(), vec!["advertise"]);

        let task = h.scheduler.begin_next().unwrap();
        p.start_task(&task, &mut h.ctx()).unwrap();
        p.handle_event(RadioEvent::AdvertiseStarted { ok: true }, &mut h.ctx());
        assert!(p.is_advertising());
        assert_eq!(h.queued_names(), vec!["scan"]);
    }

    #[test]
    fn test_failed_service_start_closes() {
        let mut h = Harness::new();
        h.radio.expect_open_local_service().returning(|_| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        let task = h.scheduler.begin_next().unwrap();
        p.start_task(&task, &mut h.ctx()).unwrap();

        p.handle_event(
            RadioEvent::ServiceStarted {
                service: SERVICE_UUID,
                ok: false,
            },
            &mut h.ctx(),
        );
        assert_eq!(h.queued_names(), vec!["close-service"]);
        assert!(h.scheduler.pending().is_none());
    }

    #[test]
    fn test_identity_write_completes_handshake() {
        let mut h = Harness::new();
        let own = h.identity.to_bytes().to_vec();
        h.radio
            .expect_respond()
            .with(eq("C1"), eq(7u64), eq(true), eq(own))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        connected_peer(&mut h, &mut p, "C1");
        assert_eq!(p.connecting_count(), 1);

        let peer = PeerIdentity::random();
        p.handle_event(
            RadioEvent::WriteRequest {
                address: "C1".into(),
                request: 7,
                channel: Channel::Identity,
                value: peer.to_bytes().to_vec(),
                response_needed: true,
            },
            &mut h.ctx(),
        );

        assert_eq!(p.connecting_count(), 0);
        assert_eq!(p.address_of(&peer), Some("C1"));
        let neighbor = h.neighbors.get(&peer).unwrap();
        assert_eq!(neighbor.role, Role::Peripheral);
        assert_eq!(neighbor.name, "node-c");

        assert!(matches!(h.events.try_recv(), Ok(MeshEvent::NeighborDiscovered { .. })));
        assert!(matches!(h.events.try_recv(), Ok(MeshEvent::NeighborConnected(_))));
    }

    #[test]
    fn test_identity_write_from_stranger_rejected() {
        let mut h = Harness::new();
        h.radio
            .expect_respond()
            .with(eq("C9"), eq(1u64), eq(false), eq(Vec::<u8>::new()))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());

        p.handle_event(
            RadioEvent::WriteRequest {
                address: "C9".into(),
                request: 1,
                channel: Channel::Identity,
                value: PeerIdentity::random().to_bytes().to_vec(),
                response_needed: true,
            },
            &mut h.ctx(),
        );
        assert!(h.neighbors.is_empty());
        assert_eq!(h.queued_names(), vec!["start-service", "disconnect-peer"]);
    }

    #[test]
    fn test_subscription_needs_indication_value() {
        let mut h = Harness::new();
        h.radio
            .expect_respond()
            .with(eq("C1"), eq(2u64), eq(false), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        h.radio
            .expect_respond()
            .with(eq("C1"), eq(3u64), eq(true), always())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        connected_peer(&mut h, &mut p, "C1");

        p.handle_event(
            RadioEvent::SubscriptionRequest {
                address: "C1".into(),
                request: 2,
                descriptor: SUBSCRIPTION_DESCRIPTOR_UUID,
                value: vec![0x01, 0x00],
            },
            &mut h.ctx(),
        );
        p.handle_event(
            RadioEvent::SubscriptionRequest {
                address: "C1".into(),
                request: 3,
                descriptor: SUBSCRIPTION_DESCRIPTOR_UUID,
                value: ENABLE_INDICATION_VALUE.to_vec(),
            },
            &mut h.ctx(),
        );
        assert_eq!(p.subscriptions.get("C1"), Some(&ENABLE_INDICATION_VALUE.to_vec()));
    }

    #[test]
    fn test_indication_retries_then_disconnects() {
        let mut h = Harness::new();
        let mut p = Peripheral::new();
        let task = Task {
            id: crate::scheduler::TaskId(1),
            kind: TaskKind::SendIndication {
                address: "C1".into(),
                data: vec![1],
                retries_left: 0,
            },
            expiry: h.config.write_expiry(),
        };
        p.expire_task(&task, &mut h.ctx());
        assert_eq!(h.queued_names(), vec!["disconnect-peer"]);
    }

    fn handshake(h: &mut Harness, p: &mut Peripheral, address: &str, peer: PeerIdentity) {
        connected_peer(h, p, address);
        p.handle_event(
            RadioEvent::WriteRequest {
                address: address.into(),
                request: 1,
                channel: Channel::Identity,
                value: peer.to_bytes().to_vec(),
                response_needed: false,
            },
            &mut h.ctx(),
        );
    }

    fn drain_queue(h: &mut Harness) {
        h.scheduler.complete();
        while h.scheduler.begin_next().is_some() {
            h.scheduler.complete();
        }
    }

    #[test]
    fn test_link_drop_clears_pending_indication() {
        let mut h = Harness::new();
        h.radio.expect_send_notification().times(1).returning(|_, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        p.service_open = true;
        let peer = PeerIdentity::random();
        handshake(&mut h, &mut p, "C1", peer);
        drain_queue(&mut h);

        let indicate = TaskKind::SendIndication {
            address: "C1".into(),
            data: vec![1, 2, 3],
            retries_left: 3,
        };
        h.ctx().enqueue(indicate.clone());
        let task = h.scheduler.begin_next().unwrap();
        p.start_task(&task, &mut h.ctx()).unwrap();
        assert_eq!(h.scheduler.pending_kind(), Some(&indicate));

        p.handle_event(
            RadioEvent::PeerConnectionChanged {
                address: "C1".into(),
                name: None,
                state: LinkState::Disconnected,
            },
            &mut h.ctx(),
        );
        assert!(h.scheduler.pending().is_none());
        assert!(h.neighbors.is_empty());

        // A retry queued before the drop is discarded without touching the radio
        let retry = indicate.retried().unwrap();
        h.ctx().enqueue(retry);
        while let Some(task) = h.scheduler.begin_next() {
            if matches!(task.kind, TaskKind::SendIndication { .. }) {
                p.start_task(&task, &mut h.ctx()).unwrap();
                assert!(h.scheduler.pending().is_none());
            } else {
                h.scheduler.complete();
            }
        }
    }

    #[test]
    fn test_second_identity_exchange_rejected() {
        let mut h = Harness::new();
        h.radio
            .expect_respond()
            .with(eq("C2"), eq(4u64), eq(false), eq(Vec::<u8>::new()))
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        let peer = PeerIdentity::random();
        handshake(&mut h, &mut p, "C1", peer);
        drain_queue(&mut h);

        connected_peer(&mut h, &mut p, "C2");
        p.handle_event(
            RadioEvent::WriteRequest {
                address: "C2".into(),
                request: 4,
                channel: Channel::Identity,
                value: peer.to_bytes().to_vec(),
                response_needed: true,
            },
            &mut h.ctx(),
        );

        assert_eq!(h.neighbors.len(), 1);
        assert_eq!(p.address_of(&peer), Some("C1"));
        assert_eq!(p.connected_count(), 1);
        let connects = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| matches!(e, MeshEvent::NeighborConnected(_)))
            .count();
        assert_eq!(connects, 1);
        assert!(h.scheduler.queued().any(|t| t.kind
            == TaskKind::DisconnectPeer {
                address: "C2".into()
            }));
    }

    #[test]
    fn test_disconnect_raises_once() {
        let mut h = Harness::new();
        h.radio.expect_respond().returning(|_, _, _, _| Ok(()));
        let mut p = Peripheral::new();
        p.start(&mut h.ctx());
        connected_peer(&mut h, &mut p, "C1");
        let peer = PeerIdentity::random();
        p.handle_event(
            RadioEvent::WriteRequest {
                address: "C1".into(),
                request: 1,
                channel: Channel::Identity,
                value: peer.to_bytes().to_vec(),
                response_needed: false,
            },
            &mut h.ctx(),
        );

        let down = RadioEvent::PeerConnectionChanged {
            address: "C1".into(),
            name: None,
            state: LinkState::Disconnected,
        };
        p.handle_event(down.clone(), &mut h.ctx());
        p.handle_event(down, &mut h.ctx());

        let disconnects = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter(|e| matches!(e, MeshEvent::NeighborDisconnected(_)))
            .count();
        assert_eq!(disconnects, 1);
        assert!(h.neighbors.is_empty());
    }
}
