// Tokio driver — feeds radio events and timer wakeups into a node
//
// The driver owns nothing but channels. Radio events come in on the
// receiver the caller hands over and timer wakeups come from the node's
// TokioTimer. A shutdown channel ends the loop once teardown has drained.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::identity::PeerIdentity;
use crate::neighbor::MeshEvent;
use crate::node::MeshNode;
use crate::scheduler::TokioTimer;
use crate::transport::{Radio, RadioEvent};
use crate::MeshError;

/// How often shutdown checks whether teardown has drained
const TEARDOWN_POLL: Duration = Duration::from_millis(10);

pub struct MeshDriver {
    node: MeshNode,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MeshDriver {
    /// Build a node on the tokio clock and spawn its event loop.
    ///
    /// The radio delivers its results on the sender paired with
    /// `radio_events`. Must be called from within a tokio runtime.
    pub fn spawn(
        config: MeshConfig,
        identity: PeerIdentity,
        radio: Arc<dyn Radio>,
        mut radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<MeshEvent>), MeshError> {
        let (timer, mut wakeups) = TokioTimer::new();
        let (node, events) = MeshNode::new(config, identity, radio, Arc::new(timer))?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let loop_node = node.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Results and requests from the radio
                    Some(event) = radio_events.recv() => {
                        loop_node.handle_event(event);
                    }

                    // Task expiries and delayed scans
                    Some(wakeup) = wakeups.recv() => {
                        loop_node.on_wakeup(wakeup);
                    }

                    _ = shutdown_rx.recv() => {
                        debug!("mesh driver shutting down");
                        break;
                    }

                    else => break,
                }
            }
            info!("mesh driver stopped");
        });

        Ok((
            Self {
                node,
                shutdown_tx,
                task,
            },
            events,
        ))
    }

    pub fn node(&self) -> &MeshNode {
        &self.node
    }

    /// Stop the node, keep the loop running until the disconnects and the
    /// service close queued by `stop` have finished, then end the loop.
    ///
    /// A radio that never answers holds each remaining task for at most its
    /// expiry, so teardown is bounded by the longest expiry per task.
    pub async fn shutdown(self) {
        self.node.stop();
        let tasks = self.node.queue_len() as u32 + 1;
        let budget = self.node.config().longest_expiry() * tasks;

        let node = &self.node;
        let drained = tokio::time::timeout(budget, async {
            while !node.is_idle() {
                tokio::time::sleep(TEARDOWN_POLL).await;
            }
        })
        .await;
        match drained {
            Ok(()) => debug!("teardown finished"),
            Err(_) => warn!(
                "teardown still busy after {}ms, abandoning {} task(s)",
                budget.as_millis(),
                node.queue_len()
            ),
        }

        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}
