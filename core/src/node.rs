// Mesh node — the single mutation point for everything a node knows
//
// Radio events, timer wakeups and application calls all take the same lock,
// advance the role ladders, route whatever link data arrived and then start
// the next queued radio operation. Application events leave through a
// channel so nothing runs under the lock on the caller's behalf.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::identity::PeerIdentity;
use crate::message::MessageId;
use crate::neighbor::{MeshEvent, Neighbor, NeighborTable};
use crate::roles::{Central, Peripheral, Role, RoleContext};
use crate::routing::{Delivery, RouteDecision, Router};
use crate::scheduler::{TaskKind, TaskScheduler, TaskTimer, Wakeup};
use crate::transport::{Radio, RadioEvent};
use crate::MeshError;

/// Handle to a mesh node. Clones share the same node.
#[derive(Clone)]
pub struct MeshNode {
    state: Arc<Mutex<NodeState>>,
}

struct NodeState {
    config: MeshConfig,
    identity: PeerIdentity,
    radio: Arc<dyn Radio>,
    timer: Arc<dyn TaskTimer>,
    scheduler: TaskScheduler,
    neighbors: NeighborTable,
    router: Router,
    central: Central,
    peripheral: Peripheral,
    running: bool,
}

impl MeshNode {
    pub fn new(
        config: MeshConfig,
        identity: PeerIdentity,
        radio: Arc<dyn Radio>,
        timer: Arc<dyn TaskTimer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>), MeshError> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let router = Router::new(identity, config.initial_hop_limit, config.dedup_capacity);

        let state = NodeState {
            config,
            identity,
            radio,
            timer,
            scheduler: TaskScheduler::new(),
            neighbors: NeighborTable::new(event_tx),
            router,
            central: Central::new(),
            peripheral: Peripheral::new(),
            running: false,
        };
        let node = Self {
            state: Arc::new(Mutex::new(state)),
        };
        Ok((node, event_rx))
    }

    /// Turn both roles on and start the first radio operations.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.running {
            debug!("node {} already running", state.identity);
            return;
        }
        state.running = true;
        info!("starting mesh node {}", state.identity);

        let (mut ctx, central, peripheral) = state.split();
        peripheral.start(&mut ctx);
        central.start(&mut ctx);
        state.pump();
    }

    /// Turn both roles off and queue teardown of every link.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            debug!("node {} not running", state.identity);
            return;
        }
        state.running = false;
        info!("stopping mesh node {}", state.identity);

        let (mut ctx, central, peripheral) = state.split();
        central.stop(&mut ctx);
        peripheral.stop(&mut ctx);
        state.pump();
    }

    /// Flood data toward one destination. Returns the message id used.
    pub fn send(&self, data: &[u8], destination: PeerIdentity) -> Result<MessageId, MeshError> {
        let mut state = self.state.lock();
        state.ensure_can_send()?;
        let outgoing = state.router.prepare_send(data, destination)?;
        state.flood(&outgoing.bytes);
        state.pump();
        Ok(outgoing.message_id)
    }

    /// Flood data every reachable node delivers.
    pub fn send_to_all(&self, data: &[u8]) -> Result<MessageId, MeshError> {
        let mut state = self.state.lock();
        state.ensure_can_send()?;
        let outgoing = state.router.prepare_broadcast(data)?;
        state.flood(&outgoing.bytes);
        state.pump();
        Ok(outgoing.message_id)
    }

    /// Send data addressed to a neighbor over its link only.
    pub fn send_to_neighbor(
        &self,
        identity: PeerIdentity,
        data: &[u8],
    ) -> Result<MessageId, MeshError> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(MeshError::NotRunning);
        }
        let neighbor = state
            .neighbors
            .get(&identity)
            .cloned()
            .ok_or(MeshError::NeighborNotConnected(identity))?;
        let outgoing = state.router.prepare_send(data, identity)?;
        state.link_send(&neighbor, outgoing.bytes);
        state.pump();
        Ok(outgoing.message_id)
    }

    /// Tear down the link to a neighbor without reconnecting.
    pub fn disconnect_neighbor(&self, identity: PeerIdentity) -> Result<(), MeshError> {
        let mut state = self.state.lock();
        let neighbor = state
            .neighbors
            .get(&identity)
            .cloned()
            .ok_or(MeshError::NeighborNotConnected(identity))?;
        info!(role = %neighbor.role, "disconnecting neighbor {}", neighbor.name);

        let kind = match neighbor.role {
            Role::Central => TaskKind::Disconnect {
                address: neighbor.address,
                forget_retries: false,
                reconnect: false,
            },
            Role::Peripheral => TaskKind::DisconnectPeer {
                address: neighbor.address,
            },
        };
        let (mut ctx, _, _) = state.split();
        ctx.enqueue(kind);
        state.pump();
        Ok(())
    }

    /// Clear the retry count of an address so it may be connected again.
    pub fn forget(&self, address: &str) {
        let mut state = self.state.lock();
        state.central.forget(address);
    }

    /// Feed one radio result or request into the node.
    pub fn handle_event(&self, event: RadioEvent) {
        let mut state = self.state.lock();
        let (mut ctx, central, peripheral) = state.split();
        if event.is_peripheral() {
            peripheral.handle_event(event, &mut ctx);
        } else {
            central.handle_event(event, &mut ctx);
        }
        state.route_inbound();
        state.pump();
    }

    /// Feed a timer wakeup into the node.
    pub fn on_wakeup(&self, wakeup: Wakeup) {
        let mut state = self.state.lock();
        match wakeup {
            Wakeup::Expire(id) => {
                let Some(task) = state.scheduler.expire(id) else {
                    return;
                };
                let (mut ctx, central, peripheral) = state.split();
                match task.kind.role() {
                    Role::Central => central.expire_task(&task, &mut ctx),
                    Role::Peripheral => peripheral.expire_task(&task, &mut ctx),
                }
                ctx.enqueue_scan();
            }
            Wakeup::RetryScan { peers_needed } => {
                if !state.running {
                    return;
                }
                let (mut ctx, _, _) = state.split();
                ctx.enqueue(TaskKind::Scan { peers_needed });
            }
        }
        state.pump();
    }

    /// Snapshot of current neighbors ordered by identity
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.state.lock().neighbors.list()
    }

    pub fn identity(&self) -> PeerIdentity {
        self.state.lock().identity
    }

    pub fn pending_task(&self) -> Option<TaskKind> {
        self.state.lock().scheduler.pending_kind().cloned()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().scheduler.queue_len()
    }

    /// No task pending and none queued
    pub fn is_idle(&self) -> bool {
        self.state.lock().scheduler.is_idle()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn config(&self) -> MeshConfig {
        self.state.lock().config.clone()
    }
}

impl NodeState {
    /// Borrow the shared state for a role handler alongside both roles.
    fn split(&mut self) -> (RoleContext<'_>, &mut Central, &mut Peripheral) {
        let peripheral_on = self.peripheral.is_on();
        let ctx = RoleContext {
            scheduler: &mut self.scheduler,
            neighbors: &mut self.neighbors,
            radio: self.radio.as_ref(),
            timer: self.timer.as_ref(),
            config: &self.config,
            identity: self.identity,
            peripheral_on,
        };
        (ctx, &mut self.central, &mut self.peripheral)
    }

    /// Start queued tasks until one is left waiting on the radio.
    fn pump(&mut self) {
        while let Some(task) = self.scheduler.begin_next() {
            self.timer.arm(task.expiry, Wakeup::Expire(task.id));

            let (mut ctx, central, peripheral) = self.split();
            let result = match task.kind.role() {
                Role::Central => central.start_task(&task, &mut ctx),
                Role::Peripheral => peripheral.start_task(&task, &mut ctx),
            };

            if let Err(e) = result {
                warn!(role = %task.kind.role(), "{} failed to start: {}", task, e);
                if self.scheduler.pending_id() == Some(task.id) {
                    self.scheduler.complete();
                }
            }
        }
    }

    fn ensure_can_send(&self) -> Result<(), MeshError> {
        if !self.running {
            return Err(MeshError::NotRunning);
        }
        if self.neighbors.is_empty() {
            warn!("could not send to any neighbor");
            return Err(MeshError::NoNeighbors);
        }
        Ok(())
    }

    /// Queue the same envelope on every neighbor link.
    fn flood(&mut self, bytes: &[u8]) {
        for neighbor in self.neighbors.list() {
            self.link_send(&neighbor, bytes.to_vec());
        }
    }

    fn link_send(&mut self, neighbor: &Neighbor, data: Vec<u8>) {
        let retries_left = self.config.write_retries;
        let kind = match neighbor.role {
            // We are the central on this link: write to their message channel
            Role::Central => TaskKind::WriteMessage {
                address: neighbor.address.clone(),
                peer: neighbor.identity,
                data,
                retries_left,
            },
            Role::Peripheral => TaskKind::SendIndication {
                address: neighbor.address.clone(),
                data,
                retries_left,
            },
        };
        let (mut ctx, central, _) = self.split();
        ctx.enqueue(kind);
        central.preempt_scan(&mut ctx);
    }

    /// Route link data the role handlers accepted during this call.
    fn route_inbound(&mut self) {
        for (via, raw) in self.neighbors.take_inbound() {
            match self.router.on_receive(&raw, &via) {
                RouteDecision::Deliver(delivery) => self.deliver(delivery, via),
                RouteDecision::Relay(bytes) => self.flood(&bytes),
                RouteDecision::DeliverAndRelay(delivery, bytes) => {
                    self.deliver(delivery, via);
                    self.flood(&bytes);
                }
                RouteDecision::Drop(reason) => {
                    debug!("dropped envelope from {}: {:?}", via, reason);
                }
            }
        }
    }

    fn deliver(&self, delivery: Delivery, via: PeerIdentity) {
        info!(
            "delivering message {} from {} ({} bytes)",
            delivery.message_id,
            delivery.sender,
            delivery.data.len()
        );
        self.neighbors.emit(MeshEvent::DataReceived {
            sender: delivery.sender,
            via,
            data: delivery.data,
            broadcast: delivery.broadcast,
        });
    }
}
