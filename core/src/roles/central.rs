// Central role — the initiating side of the handshake ladder
//
// scan → connect → discover capabilities → negotiate transfer size →
// enable indications → read identity → write identity → connected

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{defers_to_peer, ConnectingPeer, RetryCounter, Role, RoleContext};
use crate::identity::PeerIdentity;
use crate::scheduler::{Task, TaskKind, Wakeup};
use crate::transport::{
    Channel, LinkAddress, LinkState, RadioError, RadioEvent, SERVICE_UUID,
    SUBSCRIPTION_DESCRIPTOR_UUID,
};

/// Name assumed for peers that advertise none
const UNKNOWN_NAME: &str = "unknown";

#[derive(Debug, Default)]
pub struct Central {
    on: bool,
    scanning: bool,
    last_scan_started: Option<Duration>,
    /// Addresses already reported by the running scan
    scan_results: HashSet<LinkAddress>,
    connecting: HashMap<LinkAddress, ConnectingPeer>,
    connected: HashMap<PeerIdentity, LinkAddress>,
    retries: RetryCounter,
}

impl Central {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
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

    pub fn retry_count(&self, address: &str) -> u32 {
        self.retries.count(address)
    }

    /// Let an address that hit the retry ceiling be tried again
    pub fn forget(&mut self, address: &str) {
        self.retries.reset(address);
    }

    pub fn start(&mut self, ctx: &mut RoleContext<'_>) {
        if self.on {
            debug!(role = "central", "already on");
            return;
        }
        self.on = true;
        if !self.scanning {
            // Small first scan so the first connection comes quickly
            let peers_needed = ctx.config.initial_scan_peers;
            ctx.enqueue(TaskKind::Scan { peers_needed });
        }
    }

    pub fn stop(&mut self, ctx: &mut RoleContext<'_>) {
        if !self.on {
            debug!(role = "central", "already off");
            return;
        }
        self.on = false;

        let mut addresses: Vec<LinkAddress> = self
            .connected
            .values()
            .chain(self.connecting.keys())
            .cloned()
            .collect();
        addresses.sort();
        addresses.dedup();
        info!(
            role = "central",
            "stopping: disconnecting {} connected and {} connecting peer(s)",
            self.connected.len(),
            self.connecting.len()
        );

        // The radio may be going away with us, so these time out faster
        let expiry = ctx.config.stop_disconnect_expiry();
        for address in addresses {
            ctx.enqueue_with_expiry(
                TaskKind::Disconnect {
                    address,
                    forget_retries: true,
                    reconnect: false,
                },
                expiry,
            );
        }
        self.retries.clear();

        if matches!(ctx.pending(), Some(TaskKind::Scan { .. })) {
            self.stop_scan(ctx);
            ctx.complete();
        }
    }

    /// Decide whether to leave a discovered peer alone.
    pub fn avoid_connecting(
        &self,
        address: &str,
        name: Option<&str>,
        ctx: &RoleContext<'_>,
    ) -> bool {
        let retries = self.retries.count(address);
        let too_many_retries = retries > ctx.config.max_connect_retries;
        let connecting = self.connecting.contains_key(address);
        let connected = self.identity_at(address).is_some() || ctx.neighbors.has_address(address);

        // Both sides run both roles; only one of them may initiate
        let local_name = ctx.radio.local_name();
        let defer = self.on
            && ctx.peripheral_on
            && defers_to_peer(
                &local_name,
                name.unwrap_or(UNKNOWN_NAME),
                ctx.config.tie_break_salt,
            );

        let avoid = !self.on || connecting || too_many_retries || connected || defer;
        if avoid && !connected {
            debug!(
                role = "central",
                "avoiding {}: off={} connecting={} retries_over_max={} defer={}",
                address,
                !self.on,
                connecting,
                too_many_retries,
                defer
            );
        }
        avoid
    }

    /// End a running scan early so queued sends go out now.
    ///
    /// A fresh scan with the same target is queued behind whatever is waiting.
    pub fn preempt_scan(&mut self, ctx: &mut RoleContext<'_>) -> bool {
        let peers_needed = match ctx.pending() {
            Some(TaskKind::Scan { peers_needed }) => *peers_needed,
            _ => return false,
        };
        debug!(role = "central", "ending scan to write quickly");
        self.stop_scan(ctx);
        ctx.enqueue(TaskKind::Scan { peers_needed });
        ctx.complete();
        true
    }

    fn stop_scan(&mut self, ctx: &mut RoleContext<'_>) {
        self.scanning = false;
        if let Err(e) = ctx.radio.stop_scan() {
            warn!(role = "central", "could not stop scan: {}", e);
        }
    }

    /// Disconnect after a failed ladder step and move on
    fn fail_step(&mut self, address: LinkAddress, reconnect: bool, ctx: &mut RoleContext<'_>) {
        ctx.enqueue(TaskKind::Disconnect {
            address,
            forget_retries: false,
            reconnect,
        });
        ctx.complete();
    }

    pub fn start_task(&mut self, task: &Task, ctx: &mut RoleContext<'_>) -> Result<(), RadioError> {
        let result = self.run_task(task, ctx);
        if result.is_err() {
            if let Some(address) = ladder_address(&task.kind) {
                ctx.enqueue(TaskKind::Disconnect {
                    address: address.to_string(),
                    forget_retries: false,
                    reconnect: false,
                });
            }
        }
        result
    }

    fn run_task(&mut self, task: &Task, ctx: &mut RoleContext<'_>) -> Result<(), RadioError> {
        match &task.kind {
            TaskKind::Scan { peers_needed } => self.start_scan(*peers_needed, ctx)?,
            TaskKind::ConnectToPeer { address, name } => {
                if self.avoid_connecting(address, name.as_deref(), ctx) {
                    debug!(role = "central", "dropping connection to {}", address);
                    ctx.complete();
                    return Ok(());
                }
                self.connecting
                    .insert(address.clone(), ConnectingPeer::new(address, name.clone()));
                if let Err(e) = ctx.radio.connect(address) {
                    self.connecting.remove(address);
                    self.retries.bump(address);
                    return Err(e);
                }
            }
            TaskKind::DiscoverCapabilities { address } => {
                ctx.radio.discover_capabilities(address)?
            }
            TaskKind::NegotiateTransferSize { address, size } => {
                ctx.radio.negotiate_transfer_size(address, *size)?
            }
            TaskKind::EnableIndication { address } => {
                ctx.radio.set_notification(address, Channel::Message, true)?
            }
            TaskKind::ReadIdentity { address } => {
                ctx.radio.read_channel(address, Channel::Identity)?
            }
            TaskKind::WriteIdentity { address, .. } => {
                let own = ctx.identity.to_bytes();
                ctx.radio.write_channel(address, Channel::Identity, &own)?
            }
            TaskKind::WriteMessage { address, data, .. } => {
                ctx.radio.write_channel(address, Channel::Message, data)?
            }
            TaskKind::Disconnect { address, .. } => {
                if !self.connecting.contains_key(address) && self.identity_at(address).is_none() {
                    debug!(role = "central", "{} is already disconnected, skipping", address);
                    ctx.complete();
                    return Ok(());
                }
                ctx.radio.disconnect(address)?
            }
            other => {
                warn!(role = "central", "not a central task: {}", other);
                ctx.complete();
            }
        }
        Ok(())
    }

    fn start_scan(&mut self, peers_needed: u32, ctx: &mut RoleContext<'_>) -> Result<(), RadioError> {
        let queued = ctx.scheduler.queue_len();
        if !self.on || self.scanning || queued > 0 {
            debug!(
                role = "central",
                "ignoring scan: off={} scanning={} queued={}",
                !self.on,
                self.scanning,
                queued
            );
            ctx.complete();
            return Ok(());
        }

        let now = ctx.timer.now();
        if let Some(last) = self.last_scan_started {
            let gap = ctx.config.scan_gap();
            let elapsed = now.saturating_sub(last);
            if elapsed < gap {
                let wait = gap - elapsed;
                debug!(
                    role = "central",
                    "scanning too early, re-queueing scan in {}ms",
                    wait.as_millis()
                );
                ctx.complete();
                ctx.timer.arm(wait, Wakeup::RetryScan { peers_needed });
                return Ok(());
            }
        }

        self.scan_results.clear();
        ctx.radio.start_scan(SERVICE_UUID)?;
        self.scanning = true;
        self.last_scan_started = Some(now);
        Ok(())
    }

    /// Recovery when a central task ran out of time.
    pub fn expire_task(&mut self, task: &Task, ctx: &mut RoleContext<'_>) {
        match &task.kind {
            TaskKind::Scan { .. } => self.stop_scan(ctx),
            TaskKind::ConnectToPeer { address, .. } => {
                let tries = self.retries.bump(address);
                self.connecting.remove(address);
                debug!(role = "central", "connect to {} timed out ({} tries)", address, tries);
            }
            TaskKind::DiscoverCapabilities { address }
            | TaskKind::NegotiateTransferSize { address, .. }
            | TaskKind::EnableIndication { address }
            | TaskKind::ReadIdentity { address } => {
                ctx.enqueue(TaskKind::Disconnect {
                    address: address.clone(),
                    forget_retries: false,
                    reconnect: true,
                });
            }
            TaskKind::WriteIdentity { address, .. } | TaskKind::WriteMessage { address, .. } => {
                match task.kind.retried() {
                    Some(retry) => {
                        ctx.enqueue(retry);
                    }
                    None => {
                        ctx.enqueue(TaskKind::Disconnect {
                            address: address.clone(),
                            forget_retries: false,
                            reconnect: true,
                        });
                    }
                }
            }
            TaskKind::Disconnect {
                address,
                forget_retries,
                ..
            } => {
                // No link-down event came; forget the link ourselves
                self.connecting.remove(address);
                if let Some(identity) = self.identity_at(address) {
                    self.connected.remove(&identity);
                    ctx.neighbors.notify_disconnect(&identity);
                }
                if *forget_retries {
                    self.retries.reset(address);
                }
            }
            _ => {}
        }
    }

    pub fn handle_event(&mut self, event: RadioEvent, ctx: &mut RoleContext<'_>) {
        match event {
            RadioEvent::Discovered { address, name } => self.on_discovered(address, name, ctx),
            RadioEvent::ScanFailed { code } => {
                let peers_needed = match ctx.pending() {
                    Some(TaskKind::Scan { peers_needed }) => *peers_needed,
                    _ => {
                        debug!(role = "central", "scan failure outside a scan, ignoring");
                        return;
                    }
                };
                warn!(role = "central", "scan failed with code {}, re-queueing", code);
                ctx.enqueue(TaskKind::Scan { peers_needed });
                self.stop_scan(ctx);
                ctx.complete();
            }
            RadioEvent::ConnectionStateChanged {
                address,
                name,
                state,
            } => self.on_connection_state(address, name, state, ctx),
            RadioEvent::CapabilitiesDiscovered {
                address,
                ok,
                has_mesh_service,
            } => {
                if !pending_is(ctx, |k| {
                    matches!(k, TaskKind::DiscoverCapabilities { address: a } if *a == address)
                }) {
                    return;
                }
                if !ok || !has_mesh_service || !self.on {
                    warn!(
                        role = "central",
                        "stopping ladder with {}: ok={} mesh_service={} on={}",
                        address,
                        ok,
                        has_mesh_service,
                        self.on
                    );
                    self.fail_step(address, true, ctx);
                    return;
                }
                let size = ctx.config.max_transfer_size;
                ctx.enqueue(TaskKind::NegotiateTransferSize { address, size });
                ctx.complete();
            }
            RadioEvent::TransferSizeChanged { address, size, ok } => {
                if !pending_is(ctx, |k| {
                    matches!(k, TaskKind::NegotiateTransferSize { address: a, .. } if *a == address)
                }) {
                    return;
                }
                if !ok || !self.on {
                    warn!(role = "central", "transfer size negotiation with {} failed", address);
                    self.fail_step(address, true, ctx);
                    return;
                }
                debug!(role = "central", "transfer size with {} is {}", address, size);
                if let Some(peer) = self.connecting.get_mut(&address) {
                    peer.transfer_size = Some(size);
                }
                ctx.enqueue(TaskKind::EnableIndication { address });
                ctx.complete();
            }
            RadioEvent::DescriptorWritten {
                address,
                descriptor,
                ok,
            } => {
                if !pending_is(ctx, |k| {
                    matches!(k, TaskKind::EnableIndication { address: a } if *a == address)
                }) {
                    return;
                }
                if !ok || descriptor != SUBSCRIPTION_DESCRIPTOR_UUID || !self.on {
                    warn!(
                        role = "central",
                        "could not enable indications on {}: ok={} descriptor={}",
                        address,
                        ok,
                        descriptor
                    );
                    self.fail_step(address, true, ctx);
                    return;
                }
                ctx.enqueue(TaskKind::ReadIdentity { address });
                ctx.enqueue_scan();
                ctx.complete();
            }
            RadioEvent::ChannelRead {
                address,
                channel,
                ok,
                value,
            } => {
                if channel != Channel::Identity
                    || !pending_is(ctx, |k| {
                        matches!(k, TaskKind::ReadIdentity { address: a } if *a == address)
                    })
                {
                    return;
                }
                self.on_identity_read(address, ok, &value, ctx);
            }
            RadioEvent::ChannelWritten {
                address,
                channel,
                ok,
            } => self.on_channel_written(address, channel, ok, ctx),
            RadioEvent::ChannelChanged {
                address,
                channel,
                value,
            } => {
                if channel != Channel::Message {
                    warn!(role = "central", "{} changed unexpected channel {:?}", address, channel);
                    ctx.enqueue(TaskKind::Disconnect {
                        address,
                        forget_retries: false,
                        reconnect: false,
                    });
                    return;
                }
                match self.identity_at(&address) {
                    Some(identity) => {
                        debug!(role = "central", "received {} bytes from {}", value.len(), address);
                        ctx.neighbors.notify_data(&identity, value);
                    }
                    None => {
                        warn!(role = "central", "{} sent data before connecting, disconnecting", address);
                        ctx.enqueue(TaskKind::Disconnect {
                            address,
                            forget_retries: false,
                            reconnect: false,
                        });
                    }
                }
            }
            other => debug!(role = "central", "ignoring {:?}", other),
        }
    }

    fn on_discovered(
        &mut self,
        address: LinkAddress,
        name: Option<String>,
        ctx: &mut RoleContext<'_>,
    ) {
        let peers_needed = match ctx.pending() {
            Some(TaskKind::Scan { peers_needed }) => *peers_needed,
            _ => {
                warn!(role = "central", "scan result outside a scan, stopping scan");
                self.stop_scan(ctx);
                ctx.enqueue_scan();
                return;
            }
        };

        if !self.scan_results.insert(address.clone()) {
            return;
        }
        if self.avoid_connecting(&address, name.as_deref(), ctx) {
            return;
        }

        ctx.enqueue(TaskKind::ConnectToPeer { address, name });
        let remaining = peers_needed.saturating_sub(1);
        if let Some(task) = ctx.scheduler.pending_mut() {
            if let TaskKind::Scan { peers_needed } = &mut task.kind {
                *peers_needed = remaining;
            }
        }
        if remaining == 0 {
            self.stop_scan(ctx);
            ctx.complete();
        }
    }

    fn on_connection_state(
        &mut self,
        address: LinkAddress,
        name: Option<String>,
        state: LinkState,
        ctx: &mut RoleContext<'_>,
    ) {
        let pending_here = pending_is(ctx, |k| {
            k.role() == Role::Central && k.address() == Some(address.as_str())
        });

        match state {
            LinkState::Connected => {
                let anticipated = pending_is(ctx, |k| {
                    matches!(k, TaskKind::ConnectToPeer { address: a, .. } if *a == address)
                });
                if !anticipated {
                    warn!(role = "central", "did not anticipate connecting to {}, disconnecting", address);
                    self.connecting
                        .entry(address.clone())
                        .or_insert_with(|| ConnectingPeer::new(&address, name));
                    ctx.enqueue(TaskKind::Disconnect {
                        address,
                        forget_retries: false,
                        reconnect: false,
                    });
                    return;
                }

                if let Some(peer) = self.connecting.get_mut(&address) {
                    if peer.name.is_none() {
                        peer.name = name.clone();
                    }
                }
                debug!(role = "central", "connected (not fully) to {:?} {}", name, address);
                ctx.neighbors.notify_discovered(name.as_deref(), &address);
                ctx.enqueue(TaskKind::DiscoverCapabilities { address });
                ctx.complete();
            }
            LinkState::Disconnected => {
                let identity = self.identity_at(&address);
                let peer = self.connecting.remove(&address);
                if peer.is_none() && identity.is_none() && !pending_here {
                    debug!(role = "central", "{} was not connected, ignoring disconnect", address);
                    return;
                }
                warn!(role = "central", "disconnected from {:?} {}", name, address);

                let mut name = name.or_else(|| peer.and_then(|p| p.name));
                if let Some(identity) = identity {
                    self.connected.remove(&identity);
                    if let Some(neighbor) = ctx.neighbors.notify_disconnect(&identity) {
                        name = name.or(Some(neighbor.name));
                    }
                }

                let flags = match ctx.pending() {
                    Some(TaskKind::Disconnect {
                        address: a,
                        forget_retries,
                        reconnect,
                    }) if *a == address => Some((*forget_retries, *reconnect)),
                    Some(TaskKind::ConnectToPeer { address: a, .. }) if *a == address => {
                        let tries = self.retries.bump(&address);
                        debug!(role = "central", "connecting to {} failed ({} tries)", address, tries);
                        None
                    }
                    _ => None,
                };
                if let Some((forget_retries, reconnect)) = flags {
                    if forget_retries {
                        debug!(role = "central", "forgetting retry count of {}", address);
                        self.retries.reset(&address);
                    }
                    if reconnect {
                        if self.avoid_connecting(&address, name.as_deref(), ctx) {
                            debug!(role = "central", "not reconnecting to {}", address);
                        } else {
                            let tries = self.retries.bump(&address);
                            debug!(role = "central", "reconnecting to {} ({} tries)", address, tries);
                            ctx.enqueue(TaskKind::ConnectToPeer {
                                address: address.clone(),
                                name,
                            });
                        }
                    }
                }

                ctx.enqueue_scan();
                if pending_here {
                    ctx.complete();
                }
            }
            LinkState::Other(code) => {
                warn!(role = "central", "unknown link state {} for {}, disconnecting", code, address);
                ctx.enqueue(TaskKind::Disconnect {
                    address,
                    forget_retries: false,
                    reconnect: false,
                });
            }
        }
    }

    fn on_identity_read(
        &mut self,
        address: LinkAddress,
        ok: bool,
        value: &[u8],
        ctx: &mut RoleContext<'_>,
    ) {
        if !ok || !self.on {
            warn!(role = "central", "identity read from {} failed (on={})", address, self.on);
            self.fail_step(address, true, ctx);
            return;
        }

        let peer = match PeerIdentity::from_slice(value) {
            Ok(peer) => peer,
            Err(e) => {
                warn!(role = "central", "bad identity from {}: {}", address, e);
                self.fail_step(address, false, ctx);
                return;
            }
        };

        if peer == ctx.identity {
            warn!(role = "central", "{} is ourselves, disconnecting", address);
            self.fail_step(address, false, ctx);
            return;
        }
        if ctx.neighbors.contains(&peer) || self.connected.contains_key(&peer) {
            debug!(role = "central", "{} is already connected as {}, disconnecting", address, peer);
            self.fail_step(address, false, ctx);
            return;
        }

        debug!(role = "central", "identity of {} is {}", address, peer);
        if let Some(connecting) = self.connecting.get_mut(&address) {
            connecting.identity = Some(peer);
        }
        let retries_left = ctx.config.write_retries;
        ctx.enqueue(TaskKind::WriteIdentity {
            address,
            peer,
            retries_left,
        });
        ctx.enqueue_scan();
        ctx.complete();
    }

    fn on_channel_written(
        &mut self,
        address: LinkAddress,
        channel: Channel,
        ok: bool,
        ctx: &mut RoleContext<'_>,
    ) {
        let kind = match ctx.pending() {
            Some(kind)
                if kind.address() == Some(address.as_str())
                    && matches!(
                        (kind, channel),
                        (TaskKind::WriteIdentity { .. }, Channel::Identity)
                            | (TaskKind::WriteMessage { .. }, Channel::Message)
                    ) =>
            {
                kind.clone()
            }
            _ => {
                debug!(role = "central", "write result for {} does not match pending task", address);
                return;
            }
        };

        if !ok {
            match kind.retried() {
                Some(retry) => {
                    debug!(role = "central", "retrying {}", retry);
                    ctx.enqueue(retry);
                }
                None => {
                    warn!(role = "central", "could not write to {} after retries", address);
                    ctx.enqueue(TaskKind::Disconnect {
                        address,
                        forget_retries: false,
                        reconnect: true,
                    });
                }
            }
            ctx.complete();
            return;
        }

        match kind {
            TaskKind::WriteIdentity { peer, .. } => {
                if ctx.neighbors.contains(&peer) {
                    debug!(role = "central", "{} is already connected, disconnecting", peer);
                    ctx.enqueue(TaskKind::Disconnect {
                        address,
                        forget_retries: true,
                        reconnect: false,
                    });
                    ctx.complete();
                    return;
                }

                let name = self.connecting.remove(&address).and_then(|p| p.name);
                self.connected.insert(peer, address.clone());
                self.retries.reset(&address);
                info!(role = "central", "{} is now connected fully as {}", address, peer);
                ctx.neighbors
                    .notify_connect(peer, Role::Central, &address, name.as_deref());
                ctx.complete();
            }
            _ => {
                debug!(role = "central", "wrote data to {}", address);
                ctx.complete();
            }
        }
    }
}

fn pending_is(ctx: &RoleContext<'_>, pred: impl Fn(&TaskKind) -> bool) -> bool {
    let matched = ctx.pending().map_or(false, &pred);
    if !matched {
        debug!(
            role = "central",
            "event does not match pending task {:?}, skipping",
            ctx.pending().map(TaskKind::name)
        );
    }
    matched
}

/// Address of a handshake step that leaves a half-open link when it fails
fn ladder_address(kind: &TaskKind) -> Option<&str> {
    match kind {
        TaskKind::DiscoverCapabilities { address }
        | TaskKind::NegotiateTransferSize { address, .. }
        | TaskKind::EnableIndication { address }
        | TaskKind::ReadIdentity { address }
        | TaskKind::WriteIdentity { address, .. } => Some(address),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::neighbor::NeighborTable;
    use crate::scheduler::{ManualTimer, TaskScheduler};
    use crate::transport::MockRadio;
    use tokio::sync::mpsc;

    struct Harness {
        scheduler: TaskScheduler,
        neighbors: NeighborTable,
        radio: MockRadio,
        timer: ManualTimer,
        config: MeshConfig,
        identity: PeerIdentity,
        peripheral_on: bool,
    }

    impl Harness {
        fn new(local_name: &str) -> Self {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut radio = MockRadio::new();
            radio.expect_local_name().return_const(local_name.to_string());
            Self {
                scheduler: TaskScheduler::new(),
                neighbors: NeighborTable::new(tx),
                radio,
                timer: ManualTimer::new(),
                config: MeshConfig::default(),
                identity: PeerIdentity::random(),
                peripheral_on: true,
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
                peripheral_on: self.peripheral_on,
            }
        }
    }

    #[test]
    fn test_avoid_when_off_or_deferring() {
        // "node-a" salts to a larger value than "node-b"
        let mut h = Harness::new("node-a");
        let mut central = Central::new();
        assert!(central.avoid_connecting("B", Some("node-b"), &h.ctx()));

        central.start(&mut h.ctx());
        assert!(central.avoid_connecting("B", Some("node-b"), &h.ctx()));

        // Without our peripheral running nobody would connect to us
        h.peripheral_on = false;
        assert!(!central.avoid_connecting("B", Some("node-b"), &h.ctx()));
    }

    #[test]
    fn test_avoid_after_retry_ceiling() {
        let mut h = Harness::new("node-b");
        let mut central = Central::new();
        central.start(&mut h.ctx());
        assert!(!central.avoid_connecting("A", Some("node-a"), &h.ctx()));

        for _ in 0..=h.config.max_connect_retries {
            central.retries.bump("A");
        }
        assert!(central.avoid_connecting("A", Some("node-a"), &h.ctx()));

        central.forget("A");
        assert!(!central.avoid_connecting("A", Some("node-a"), &h.ctx()));
    }

    #[test]
    fn test_scan_skipped_when_queue_not_empty() {
        let mut h = Harness::new("node-b");
        h.radio.expect_start_scan().times(0);
        let mut central = Central::new();
        central.start(&mut h.ctx());
        h.scheduler.enqueue(TaskKind::Advertise, Duration::from_secs(1));

        let task = h.scheduler.begin_next().unwrap();
        central.start_task(&task, &mut h.ctx()).unwrap();
        assert!(h.scheduler.pending().is_none());
        assert!(!central.is_scanning());
    }

    #[test]
    fn test_scan_throttled_within_gap() {
        let mut h = Harness::new("node-b");
        h.radio.expect_start_scan().times(1).returning(|_| Ok(()));
        h.radio.expect_stop_scan().returning(|| Ok(()));
        let mut central = Central::new();
        central.start(&mut h.ctx());

        let first = h.scheduler.begin_next().unwrap();
        central.start_task(&first, &mut h.ctx()).unwrap();
        assert!(central.is_scanning());
        central.expire_task(&first, &mut h.ctx());
        h.scheduler.expire(first.id);

        h.timer.advance(Duration::from_millis(3_000));
        h.scheduler
            .enqueue(TaskKind::Scan { peers_needed: 3 }, Duration::from_secs(3));
        let second = h.scheduler.begin_next().unwrap();
        central.start_task(&second, &mut h.ctx()).unwrap();

        assert!(h.scheduler.pending().is_none());
        assert_eq!(
            h.timer.armed(),
            vec![(
                Duration::from_millis(6_500),
                Wakeup::RetryScan { peers_needed: 3 }
            )]
        );
    }

    #[test]
    fn test_discovery_counts_down_and_ends_scan() {
        let mut h = Harness::new("node-b");
        h.radio.expect_start_scan().returning(|_| Ok(()));
        h.radio.expect_stop_scan().times(1).returning(|| Ok(()));
        let mut central = Central::new();
        central.start(&mut h.ctx());
        h.peripheral_on = false;
        let scan = h.scheduler.begin_next().unwrap();
        central.start_task(&scan, &mut h.ctx()).unwrap();
        if let Some(task) = h.scheduler.pending_mut() {
            task.kind = TaskKind::Scan { peers_needed: 2 };
        }

        let discovered = RadioEvent::Discovered {
            address: "A".into(),
            name: Some("node-a".into()),
        };
        central.handle_event(discovered.clone(), &mut h.ctx());
        // Same address twice in one scan counts once
        central.handle_event(discovered, &mut h.ctx());
        assert_eq!(
            h.scheduler.pending_kind(),
            Some(&TaskKind::Scan { peers_needed: 1 })
        );

        central.handle_event(
            RadioEvent::Discovered {
                address: "C".into(),
                name: None,
            },
            &mut h.ctx(),
        );
        assert!(h.scheduler.pending().is_none());
        let queued: Vec<_> = h.scheduler.queued().map(|t| t.kind.clone()).collect();
        assert_eq!(
            queued,
            vec![
                TaskKind::ConnectToPeer {
                    address: "A".into(),
                    name: Some("node-a".into())
                },
                TaskKind::ConnectToPeer {
                    address: "C".into(),
                    name: None
                },
            ]
        );
    }

    #[test]
    fn test_preempt_scan_requeues_same_target() {
        let mut h = Harness::new("node-b");
        h.radio.expect_start_scan().returning(|_| Ok(()));
        h.radio.expect_stop_scan().times(1).returning(|| Ok(()));
        let mut central = Central::new();
        central.start(&mut h.ctx());
        let scan = h.scheduler.begin_next().unwrap();
        central.start_task(&scan, &mut h.ctx()).unwrap();

        h.scheduler.enqueue(
            TaskKind::SendIndication {
                address: "A".into(),
                data: vec![1],
                retries_left: 3,
            },
            Duration::from_secs(2),
        );
        assert!(central.preempt_scan(&mut h.ctx()));
        assert!(!central.is_scanning());

        let order: Vec<_> = h.scheduler.queued().map(|t| t.kind.name()).collect();
        assert_eq!(order, vec!["indicate", "scan"]);
        assert!(!central.preempt_scan(&mut h.ctx()));
    }

    #[test]
    fn test_identity_read_of_existing_neighbor_disconnects() {
        let mut h = Harness::new("node-b");
        let peer = PeerIdentity::random();
        h.neighbors.notify_connect(peer, Role::Peripheral, "B1", Some("node-c"));
        let mut central = Central::new();
        central.start(&mut h.ctx());
        h.scheduler.begin_next();
        h.scheduler.complete();

        h.ctx().enqueue(TaskKind::ReadIdentity { address: "A".into() });
        h.scheduler.begin_next().unwrap();
        central.handle_event(
            RadioEvent::ChannelRead {
                address: "A".into(),
                channel: Channel::Identity,
                ok: true,
                value: peer.to_bytes().to_vec(),
            },
            &mut h.ctx(),
        );

        assert!(h.scheduler.pending().is_none());
        assert_eq!(h.neighbors.len(), 1);
        assert_eq!(h.neighbors.get(&peer).unwrap().address, "B1");
        let queued: Vec<&TaskKind> = h.scheduler.queued().map(|t| &t.kind).collect();
        assert_eq!(
            queued,
            vec![&TaskKind::Disconnect {
                address: "A".into(),
                forget_retries: false,
                reconnect: false,
            }]
        );
    }

    #[test]
    fn test_stale_ladder_event_ignored() {
        let mut h = Harness::new("node-b");
        let mut central = Central::new();
        central.start(&mut h.ctx());
        central.handle_event(
            RadioEvent::CapabilitiesDiscovered {
                address: "A".into(),
                ok: true,
                has_mesh_service: true,
            },
            &mut h.ctx(),
        );
        // Only the initial scan is queued; nothing advanced
        assert_eq!(h.scheduler.queue_len(), 1);
    }
}
