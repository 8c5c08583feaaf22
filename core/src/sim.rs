// Simulated air — an in-memory radio medium for running whole meshes
//
// All radios share one agenda of timed deliveries. Commands never call back
// into a node; they only schedule events, and `SimNetwork::step` hands the
// earliest one to its node after releasing the air lock. Lock order is
// always node then air.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::identity::PeerIdentity;
use crate::neighbor::MeshEvent;
use crate::node::MeshNode;
use crate::scheduler::{TaskTimer, Wakeup};
use crate::transport::{
    AdvertisePayload, Channel, LinkState, Radio, RadioError, RadioEvent, RequestId,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, MAX_TRANSFER_SIZE,
    SUBSCRIPTION_DESCRIPTOR_UUID,
};
use crate::MeshError;

/// Delay between a radio command and the event it causes
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

/// Link address of the radio at `index`
pub fn sim_address(index: usize) -> String {
    format!("SIM-{:02X}", index)
}

enum Scheduled {
    Deliver { node: usize, event: RadioEvent },
    Wake { node: usize, wakeup: Wakeup },
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Read(Channel),
    Write(Channel),
    Subscribe,
}

struct RadioState {
    name: String,
    address: String,
    scanning: bool,
    service_open: bool,
    advertising: bool,
}

struct Air {
    now: Duration,
    seq: u64,
    latency: Duration,
    agenda: BTreeMap<(Duration, u64), Scheduled>,
    radios: Vec<RadioState>,
    /// Unordered pairs stored low index first
    range: HashSet<(usize, usize)>,
    /// (central, peripheral)
    links: HashSet<(usize, usize)>,
    /// (peripheral, request) → (central, kind)
    requests: HashMap<(usize, RequestId), (usize, RequestKind)>,
    next_request: RequestId,
}

impl Air {
    fn schedule_at(&mut self, after: Duration, item: Scheduled) {
        self.seq += 1;
        let at = self.now + after;
        self.agenda.insert((at, self.seq), item);
    }

    fn deliver(&mut self, node: usize, event: RadioEvent) {
        trace!("air: {} ← {:?}", node, event);
        let latency = self.latency;
        self.schedule_at(latency, Scheduled::Deliver { node, event });
    }

    fn in_range(&self, a: usize, b: usize) -> bool {
        a != b && self.range.contains(&(a.min(b), a.max(b)))
    }

    fn index_of(&self, address: &str) -> Result<usize, RadioError> {
        self.radios
            .iter()
            .position(|r| r.address == address)
            .ok_or_else(|| RadioError::NotConnected(address.to_string()))
    }

    fn linked(&self, central: usize, peripheral: usize) -> Result<(), RadioError> {
        if self.links.contains(&(central, peripheral)) {
            Ok(())
        } else {
            Err(RadioError::NotConnected(self.radios[peripheral].address.clone()))
        }
    }

    fn next_request(&mut self) -> RequestId {
        self.next_request += 1;
        self.next_request
    }

    /// Remove a link and tell both ends
    fn drop_link(&mut self, central: usize, peripheral: usize) -> bool {
        if !self.links.remove(&(central, peripheral)) {
            return false;
        }
        self.requests.retain(|(p, _), (c, _)| !(*p == peripheral && *c == central));
        let (c_addr, c_name) = self.identify(central);
        let (p_addr, p_name) = self.identify(peripheral);
        self.deliver(
            central,
            RadioEvent::ConnectionStateChanged {
                address: p_addr,
                name: Some(p_name),
                state: LinkState::Disconnected,
            },
        );
        self.deliver(
            peripheral,
            RadioEvent::PeerConnectionChanged {
                address: c_addr,
                name: Some(c_name),
                state: LinkState::Disconnected,
            },
        );
        true
    }

    fn identify(&self, index: usize) -> (String, String) {
        let radio = &self.radios[index];
        (radio.address.clone(), radio.name.clone())
    }
}

/// One node's view of the shared air
pub struct SimRadio {
    index: usize,
    air: Arc<Mutex<Air>>,
}

impl Radio for SimRadio {
    fn local_name(&self) -> String {
        self.air.lock().radios[self.index].name.clone()
    }

    fn start_scan(&self, _service: Uuid) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        air.radios[me].scanning = true;
        let visible: Vec<usize> = (0..air.radios.len())
            .filter(|&j| air.in_range(me, j) && air.radios[j].advertising)
            .collect();
        for j in visible {
            let (address, name) = air.identify(j);
            air.deliver(
                me,
                RadioEvent::Discovered {
                    address,
                    name: Some(name),
                },
            );
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        self.air.lock().radios[self.index].scanning = false;
        Ok(())
    }

    fn connect(&self, address: &str) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        let peer = air.index_of(address)?;
        let (p_addr, p_name) = air.identify(peer);

        if !air.in_range(me, peer) || !air.radios[peer].service_open {
            debug!("air: {} cannot reach {}", me, address);
            air.deliver(
                me,
                RadioEvent::ConnectionStateChanged {
                    address: p_addr,
                    name: Some(p_name),
                    state: LinkState::Disconnected,
                },
            );
            return Ok(());
        }

        air.links.insert((me, peer));
        let (c_addr, c_name) = air.identify(me);
        air.deliver(
            me,
            RadioEvent::ConnectionStateChanged {
                address: p_addr,
                name: Some(p_name),
                state: LinkState::Connected,
            },
        );
        air.deliver(
            peer,
            RadioEvent::PeerConnectionChanged {
                address: c_addr,
                name: Some(c_name),
                state: LinkState::Connected,
            },
        );
        Ok(())
    }

    fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        if !air.drop_link(self.index, peer) {
            let (p_addr, p_name) = air.identify(peer);
            air.deliver(
                self.index,
                RadioEvent::ConnectionStateChanged {
                    address: p_addr,
                    name: Some(p_name),
                    state: LinkState::Disconnected,
                },
            );
        }
        Ok(())
    }

    fn discover_capabilities(&self, address: &str) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        air.linked(self.index, peer)?;
        let has_mesh_service = air.radios[peer].service_open;
        air.deliver(
            self.index,
            RadioEvent::CapabilitiesDiscovered {
                address: address.to_string(),
                ok: true,
                has_mesh_service,
            },
        );
        Ok(())
    }

    fn negotiate_transfer_size(&self, address: &str, size: u16) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        air.linked(self.index, peer)?;
        air.deliver(
            self.index,
            RadioEvent::TransferSizeChanged {
                address: address.to_string(),
                size: size.min(MAX_TRANSFER_SIZE),
                ok: true,
            },
        );
        Ok(())
    }

    fn set_notification(
        &self,
        address: &str,
        _channel: Channel,
        enabled: bool,
    ) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        air.linked(self.index, peer)?;
        let request = air.next_request();
        air.requests
            .insert((peer, request), (self.index, RequestKind::Subscribe));
        let value = if enabled {
            ENABLE_INDICATION_VALUE.to_vec()
        } else {
            DISABLE_NOTIFICATION_VALUE.to_vec()
        };
        let (c_addr, _) = air.identify(self.index);
        air.deliver(
            peer,
            RadioEvent::SubscriptionRequest {
                address: c_addr,
                request,
                descriptor: SUBSCRIPTION_DESCRIPTOR_UUID,
                value,
            },
        );
        Ok(())
    }

    fn read_channel(&self, address: &str, channel: Channel) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        air.linked(self.index, peer)?;
        let request = air.next_request();
        air.requests
            .insert((peer, request), (self.index, RequestKind::Read(channel)));
        let (c_addr, _) = air.identify(self.index);
        air.deliver(
            peer,
            RadioEvent::ReadRequest {
                address: c_addr,
                request,
                channel,
            },
        );
        Ok(())
    }

    fn write_channel(&self, address: &str, channel: Channel, data: &[u8]) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let peer = air.index_of(address)?;
        air.linked(self.index, peer)?;
        let request = air.next_request();
        air.requests
            .insert((peer, request), (self.index, RequestKind::Write(channel)));
        let (c_addr, _) = air.identify(self.index);
        air.deliver(
            peer,
            RadioEvent::WriteRequest {
                address: c_addr,
                request,
                channel,
                value: data.to_vec(),
                response_needed: true,
            },
        );
        Ok(())
    }

    fn open_local_service(&self, service: Uuid) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        air.radios[self.index].service_open = true;
        air.deliver(self.index, RadioEvent::ServiceStarted { service, ok: true });
        Ok(())
    }

    fn close_local_service(&self) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        air.radios[me].service_open = false;
        air.radios[me].advertising = false;
        let centrals: Vec<usize> = air
            .links
            .iter()
            .filter(|(_, p)| *p == me)
            .map(|(c, _)| *c)
            .collect();
        for central in centrals {
            air.drop_link(central, me);
        }
        Ok(())
    }

    fn advertise(&self, _payload: &AdvertisePayload) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        air.radios[me].advertising = true;
        air.deliver(me, RadioEvent::AdvertiseStarted { ok: true });

        let scanners: Vec<usize> = (0..air.radios.len())
            .filter(|&j| air.in_range(me, j) && air.radios[j].scanning)
            .collect();
        let (address, name) = air.identify(me);
        for j in scanners {
            air.deliver(
                j,
                RadioEvent::Discovered {
                    address: address.clone(),
                    name: Some(name.clone()),
                },
            );
        }
        Ok(())
    }

    fn stop_advertising(&self) -> Result<(), RadioError> {
        self.air.lock().radios[self.index].advertising = false;
        Ok(())
    }

    fn accept_connection(&self, address: &str) -> Result<(), RadioError> {
        let air = self.air.lock();
        let central = air.index_of(address)?;
        air.linked(central, self.index)
    }

    fn cancel_connection(&self, address: &str) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let central = air.index_of(address)?;
        if !air.drop_link(central, self.index) {
            let (c_addr, c_name) = air.identify(central);
            air.deliver(
                self.index,
                RadioEvent::PeerConnectionChanged {
                    address: c_addr,
                    name: Some(c_name),
                    state: LinkState::Disconnected,
                },
            );
        }
        Ok(())
    }

    fn send_notification(&self, address: &str, data: &[u8]) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        let central = air.index_of(address)?;
        let ok = air.linked(central, me).is_ok();
        if ok {
            let (p_addr, _) = air.identify(me);
            air.deliver(
                central,
                RadioEvent::ChannelChanged {
                    address: p_addr,
                    channel: Channel::Message,
                    value: data.to_vec(),
                },
            );
        }
        air.deliver(
            me,
            RadioEvent::NotificationSent {
                address: address.to_string(),
                ok,
            },
        );
        Ok(())
    }

    fn respond(
        &self,
        address: &str,
        request: RequestId,
        ok: bool,
        value: Vec<u8>,
    ) -> Result<(), RadioError> {
        let mut air = self.air.lock();
        let me = self.index;
        let (central, kind) = air
            .requests
            .remove(&(me, request))
            .ok_or_else(|| RadioError::Rejected(format!("no request {} from {}", request, address)))?;
        air.linked(central, me)?;

        let (p_addr, _) = air.identify(me);
        let event = match kind {
            RequestKind::Read(channel) => RadioEvent::ChannelRead {
                address: p_addr,
                channel,
                ok,
                value,
            },
            RequestKind::Write(channel) => RadioEvent::ChannelWritten {
                address: p_addr,
                channel,
                ok,
            },
            RequestKind::Subscribe => RadioEvent::DescriptorWritten {
                address: p_addr,
                descriptor: SUBSCRIPTION_DESCRIPTOR_UUID,
                ok,
            },
        };
        air.deliver(central, event);
        Ok(())
    }
}

/// Timer on the simulated clock
pub struct SimTimer {
    index: usize,
    air: Arc<Mutex<Air>>,
}

impl TaskTimer for SimTimer {
    fn now(&self) -> Duration {
        self.air.lock().now
    }

    fn arm(&self, after: Duration, wakeup: Wakeup) {
        let node = self.index;
        self.air
            .lock()
            .schedule_at(after, Scheduled::Wake { node, wakeup });
    }
}

pub struct SimNode {
    pub node: MeshNode,
    pub name: String,
    pub address: String,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    log: Vec<MeshEvent>,
}

/// A set of nodes sharing one simulated air.
pub struct SimNetwork {
    air: Arc<Mutex<Air>>,
    nodes: Vec<SimNode>,
}

impl SimNetwork {
    /// Every node in range of every other
    pub fn new(count: usize) -> Result<Self, MeshError> {
        let pairs = (0..count)
            .flat_map(|a| (a + 1..count).map(move |b| (a, b)))
            .collect();
        Self::with_config(count, pairs, MeshConfig::default())
    }

    /// Node i only reaches i - 1 and i + 1
    pub fn line(count: usize) -> Result<Self, MeshError> {
        let pairs = (1..count).map(|b| (b - 1, b)).collect();
        Self::with_config(count, pairs, MeshConfig::default())
    }

    pub fn with_config(
        count: usize,
        pairs: Vec<(usize, usize)>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        let radios = (0..count)
            .map(|i| RadioState {
                name: format!("node-{}", i),
                address: sim_address(i),
                scanning: false,
                service_open: false,
                advertising: false,
            })
            .collect();
        let air = Arc::new(Mutex::new(Air {
            now: Duration::ZERO,
            seq: 0,
            latency: DEFAULT_LATENCY,
            agenda: BTreeMap::new(),
            radios,
            range: pairs.into_iter().map(|(a, b)| (a.min(b), a.max(b))).collect(),
            links: HashSet::new(),
            requests: HashMap::new(),
            next_request: 0,
        }));

        let mut nodes = Vec::with_capacity(count);
        for index in 0..count {
            let radio = Arc::new(SimRadio {
                index,
                air: air.clone(),
            });
            let timer = Arc::new(SimTimer {
                index,
                air: air.clone(),
            });
            let (node, events) =
                MeshNode::new(config.clone(), PeerIdentity::random(), radio, timer)?;
            nodes.push(SimNode {
                node,
                name: format!("node-{}", index),
                address: sim_address(index),
                events,
                log: Vec::new(),
            });
        }
        Ok(Self { air, nodes })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &MeshNode {
        &self.nodes[index].node
    }

    pub fn sim_node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    pub fn now(&self) -> Duration {
        self.air.lock().now
    }

    pub fn set_in_range(&self, a: usize, b: usize, in_range: bool) {
        let pair = (a.min(b), a.max(b));
        let mut air = self.air.lock();
        if in_range {
            air.range.insert(pair);
        } else {
            air.range.remove(&pair);
        }
    }

    pub fn start_all(&mut self) {
        for sim in &self.nodes {
            sim.node.start();
        }
        self.collect_events();
    }

    /// Deliver the earliest scheduled item. Returns false when nothing is left.
    pub fn step(&mut self) -> bool {
        let item = {
            let mut air = self.air.lock();
            let Some(key) = air.agenda.keys().next().copied() else {
                return false;
            };
            air.now = key.0;
            let item = air.agenda.remove(&key);
            match item {
                // Scan results only reach a radio that is still scanning
                Some(Scheduled::Deliver {
                    node,
                    event: RadioEvent::Discovered { .. },
                }) if !air.radios[node].scanning => None,
                other => other,
            }
        };

        match item {
            Some(Scheduled::Deliver { node, event }) => self.nodes[node].node.handle_event(event),
            Some(Scheduled::Wake { node, wakeup }) => self.nodes[node].node.on_wakeup(wakeup),
            None => {}
        }
        self.collect_events();
        true
    }

    fn next_at(&self) -> Option<Duration> {
        self.air.lock().agenda.keys().next().map(|(at, _)| *at)
    }

    /// Advance the clock by `duration`, delivering everything due on the way.
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        while matches!(self.next_at(), Some(at) if at <= deadline) {
            self.step();
        }
        self.air.lock().now = deadline;
    }

    /// Step until `done` holds or `limit` of simulated time passes.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&SimNetwork) -> bool) -> bool {
        let deadline = self.now() + limit;
        loop {
            if done(self) {
                return true;
            }
            match self.next_at() {
                Some(at) if at <= deadline => {
                    self.step();
                }
                _ => {
                    self.air.lock().now = deadline;
                    return done(self);
                }
            }
        }
    }

    fn collect_events(&mut self) {
        for sim in &mut self.nodes {
            while let Ok(event) = sim.events.try_recv() {
                sim.log.push(event);
            }
        }
    }

    /// Events node `index` raised that were not drained yet
    pub fn events(&self, index: usize) -> &[MeshEvent] {
        &self.nodes[index].log
    }

    pub fn drain_events(&mut self, index: usize) -> Vec<MeshEvent> {
        std::mem::take(&mut self.nodes[index].log)
    }

    /// Whether every pair in range finished identity exchange
    pub fn fully_linked(&self) -> bool {
        let air = self.air.lock();
        let pairs: Vec<(usize, usize)> = air.range.iter().copied().collect();
        drop(air);
        pairs.into_iter().all(|(a, b)| {
            let b_id = self.nodes[b].node.identity();
            let a_id = self.nodes[a].node.identity();
            self.nodes[a].node.neighbors().iter().any(|n| n.identity == b_id)
                && self.nodes[b].node.neighbors().iter().any(|n| n.identity == a_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_addresses() {
        assert_eq!(sim_address(0), "SIM-00");
        assert_eq!(sim_address(171), "SIM-AB");
    }

    #[test]
    fn test_connect_out_of_range_fails() {
        let mut net = SimNetwork::with_config(2, vec![], MeshConfig::default()).unwrap();
        net.start_all();
        net.run_for(Duration::from_secs(10));
        assert!(net.node(0).neighbors().is_empty());
        assert!(net.node(1).neighbors().is_empty());
    }

    #[test]
    fn test_clock_only_moves_forward() {
        let mut net = SimNetwork::new(2).unwrap();
        net.start_all();
        let mut last = net.now();
        for _ in 0..50 {
            if !net.step() {
                break;
            }
            assert!(net.now() >= last);
            last = net.now();
        }
    }

    #[test]
    fn test_two_nodes_link_up() {
        let mut net = SimNetwork::new(2).unwrap();
        net.start_all();
        assert!(net.run_until(Duration::from_secs(10), |n| n.fully_linked()));
        // The scan waits out its expiry before connecting
        assert!(net.now() >= Duration::from_secs(3));
    }
}
