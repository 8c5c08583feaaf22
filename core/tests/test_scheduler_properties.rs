// Property tests for the task scheduler and the connection tie-break

use meshbase_core::roles::{defers_to_peer, name_hash};
use meshbase_core::scheduler::{TaskId, TaskKind, TaskScheduler};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Enqueue(u32),
    BeginNext,
    Complete,
    ExpirePending,
    ExpireStale(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..10).prop_map(Op::Enqueue),
        Just(Op::BeginNext),
        Just(Op::Complete),
        Just(Op::ExpirePending),
        (0u64..1_000).prop_map(Op::ExpireStale),
    ]
}

proptest! {
    #[test]
    fn prop_single_flight_fifo(ops in prop::collection::vec(op(), 1..200)) {
        let mut scheduler = TaskScheduler::new();
        let mut model: VecDeque<TaskId> = VecDeque::new();
        let mut pending: Option<TaskId> = None;

        for op in ops {
            match op {
                Op::Enqueue(peers) => {
                    let id = scheduler.enqueue(
                        TaskKind::Scan { peers_needed: peers },
                        Duration::from_secs(1),
                    );
                    model.push_back(id);
                }
                Op::BeginNext => {
                    let started = scheduler.begin_next().map(|t| t.id);
                    if pending.is_some() {
                        prop_assert_eq!(started, None);
                    } else {
                        prop_assert_eq!(started, model.pop_front());
                        pending = started;
                    }
                }
                Op::Complete => {
                    prop_assert_eq!(scheduler.complete().map(|t| t.id), pending.take());
                }
                Op::ExpirePending => {
                    if let Some(id) = pending.take() {
                        prop_assert_eq!(scheduler.expire(id).map(|t| t.id), Some(id));
                    }
                }
                Op::ExpireStale(raw) => {
                    let id = TaskId(raw + 10_000);
                    prop_assert!(scheduler.expire(id).is_none());
                }
            }

            prop_assert_eq!(scheduler.pending_id(), pending);
            prop_assert_eq!(scheduler.queue_len(), model.len());
            let queued: Vec<TaskId> = scheduler.queued().map(|t| t.id).collect();
            prop_assert_eq!(queued, model.iter().copied().collect::<Vec<_>>());
        }
    }

    #[test]
    fn prop_exactly_one_side_initiates(
        a in "[a-zA-Z0-9 _-]{0,24}",
        b in "[a-zA-Z0-9 _-]{0,24}",
        salt in any::<i32>(),
    ) {
        let a_defers = defers_to_peer(&a, &b, salt);
        let b_defers = defers_to_peer(&b, &a, salt);
        if (name_hash(&a) ^ salt) == (name_hash(&b) ^ salt) {
            prop_assert!(!a_defers && !b_defers);
        } else {
            prop_assert_ne!(a_defers, b_defers);
        }
    }
}

#[test]
fn test_sim_names_tie_break() {
    let salt = meshbase_core::config::DEFAULT_TIE_BREAK_SALT;
    // Neighbors in a simulated line: the higher index defers to node-0,
    // node-1 defers to node-2
    assert!(defers_to_peer("node-1", "node-0", salt));
    assert!(!defers_to_peer("node-0", "node-1", salt));
    assert!(defers_to_peer("node-1", "node-2", salt));
    assert!(!defers_to_peer("node-2", "node-1", salt));
    println!("✓ Tie-break picks one initiator per pair");
}
