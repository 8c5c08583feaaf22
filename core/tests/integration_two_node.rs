// Integration test: two nodes on the simulated air
//
// Covers the full handshake ladder, data in both directions, and a
// neighbor-initiated disconnect.

use meshbase_core::sim::SimNetwork;
use meshbase_core::{MeshError, MeshEvent, Role};
use std::time::Duration;

fn count(events: &[MeshEvent], pred: impl Fn(&MeshEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[test]
fn test_two_node_scenario() {
    tracing_subscriber::fmt()
        .with_env_filter("meshbase_core=debug")
        .try_init()
        .ok();

    let mut net = SimNetwork::new(2).unwrap();
    let a = net.node(0).identity();
    let b = net.node(1).identity();

    // Nothing to send to before a neighbor exists
    net.start_all();
    assert_eq!(net.node(0).send(b"early", b), Err(MeshError::NoNeighbors));

    assert!(net.run_until(Duration::from_secs(10), |n| n.fully_linked()));
    println!("✓ Linked after {:?} of simulated time", net.now());

    // node-1 defers to node-0, so node-0 is the central on the only link
    let a_view = net.node(0).neighbors();
    let b_view = net.node(1).neighbors();
    assert_eq!(a_view.len(), 1);
    assert_eq!(b_view.len(), 1);
    assert_eq!(a_view[0].identity, b);
    assert_eq!(a_view[0].role, Role::Central);
    assert_eq!(a_view[0].name, "node-1");
    assert_eq!(b_view[0].identity, a);
    assert_eq!(b_view[0].role, Role::Peripheral);

    for i in 0..2 {
        let events = net.drain_events(i);
        assert_eq!(
            count(&events, |e| matches!(e, MeshEvent::NeighborConnected(_))),
            1
        );
    }

    // A → B over a central write, B → A over an indication
    net.node(0).send(b"ping", b).unwrap();
    net.node(1).send(b"pong", a).unwrap();
    net.run_for(Duration::from_secs(2));

    let at_b = net.drain_events(1);
    let at_a = net.drain_events(0);
    assert_eq!(
        count(&at_b, |e| matches!(e, MeshEvent::DataReceived { sender, data, .. } if *sender == a && data == b"ping")),
        1
    );
    assert_eq!(
        count(&at_a, |e| matches!(e, MeshEvent::DataReceived { sender, data, .. } if *sender == b && data == b"pong")),
        1
    );
    println!("✓ Data delivered once in each direction");

    // Tear the link down from A
    net.node(0).disconnect_neighbor(b).unwrap();
    net.run_for(Duration::from_millis(200));

    assert!(net.node(0).neighbors().is_empty());
    assert!(net.node(1).neighbors().is_empty());
    for i in 0..2 {
        let events = net.drain_events(i);
        assert_eq!(
            count(&events, |e| matches!(e, MeshEvent::NeighborDisconnected(_))),
            1
        );
    }
    assert_eq!(
        net.node(0).disconnect_neighbor(b),
        Err(MeshError::NeighborNotConnected(b))
    );
    println!("✓ Disconnect raised once on each side");
}

#[test]
fn test_stop_tears_down_links() {
    let mut net = SimNetwork::new(2).unwrap();
    net.start_all();
    assert!(net.run_until(Duration::from_secs(10), |n| n.fully_linked()));

    net.node(0).stop();
    assert!(!net.node(0).is_running());
    net.run_for(Duration::from_secs(3));

    assert!(net.node(0).neighbors().is_empty());
    assert!(net.node(1).neighbors().is_empty());
    assert_eq!(
        net.node(0).send(b"late", net.node(1).identity()),
        Err(MeshError::NotRunning)
    );
    println!("✓ Stopping a node disconnects its neighbors");
}

#[test]
fn test_stopped_node_reconnects_after_restart() {
    let mut net = SimNetwork::new(2).unwrap();
    net.start_all();
    assert!(net.run_until(Duration::from_secs(10), |n| n.fully_linked()));

    net.node(1).stop();
    net.run_for(Duration::from_secs(3));
    assert!(net.node(0).neighbors().is_empty());

    net.node(1).start();
    assert!(net.run_until(Duration::from_secs(60), |n| n.fully_linked()));
    println!("✓ Nodes link up again after a restart");
}
