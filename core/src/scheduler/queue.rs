// Task scheduler — strictly single-flight FIFO of radio operations
//
// The scheduler only tracks order and the pending slot. Starting tasks,
// arming expiry timers and running handlers belong to the node, which
// holds the one lock all of this lives under.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use super::task::{Task, TaskId, TaskKind};

#[derive(Debug, Default)]
pub struct TaskScheduler {
    queue: VecDeque<Task>,
    pending: Option<Task>,
    next_id: u64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the back of the queue.
    pub fn enqueue(&mut self, kind: TaskKind, expiry: Duration) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        let task = Task { id, kind, expiry };
        debug!(
            role = %task.kind.role(),
            "queued {} behind {} task(s)",
            task,
            self.queue.len()
        );
        self.queue.push_back(task);
        id
    }

    /// Move the head of the queue into the pending slot.
    ///
    /// Returns `None` while a task is pending or when the queue is empty.
    pub fn begin_next(&mut self) -> Option<Task> {
        if let Some(pending) = &self.pending {
            if let Some(next) = self.queue.front() {
                debug!(
                    role = %pending.kind.role(),
                    "{} waits for pending {}",
                    next,
                    pending
                );
            }
            return None;
        }

        let task = self.queue.pop_front()?;
        debug!(role = %task.kind.role(), "executing {}", task);
        self.pending = Some(task.clone());
        Some(task)
    }

    /// Clear the pending slot after its result arrived.
    pub fn complete(&mut self) -> Option<Task> {
        let task = self.pending.take();
        match &task {
            Some(task) => debug!(role = %task.kind.role(), "ended {}", task),
            None => warn!("complete() called with no pending task"),
        }
        task
    }

    /// Take the pending task if it is still the one with this id.
    ///
    /// A timer that outlived its task finds a different id (or nothing) and
    /// gets `None`.
    pub fn expire(&mut self, id: TaskId) -> Option<Task> {
        match &self.pending {
            Some(task) if task.id == id => {
                let task = self.pending.take();
                if let Some(task) = &task {
                    warn!(
                        role = %task.kind.role(),
                        "{} timed out after {}ms",
                        task,
                        task.expiry.as_millis()
                    );
                }
                task
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> Option<&Task> {
        self.pending.as_ref()
    }

    pub fn pending_kind(&self) -> Option<&TaskKind> {
        self.pending.as_ref().map(|task| &task.kind)
    }

    pub fn pending_mut(&mut self) -> Option<&mut Task> {
        self.pending.as_mut()
    }

    pub fn pending_id(&self) -> Option<TaskId> {
        self.pending.as_ref().map(|task| task.id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.queue.is_empty()
    }

    pub fn queued(&self) -> impl Iterator<Item = &Task> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> TaskKind {
        TaskKind::Scan { peers_needed: 1 }
    }

    #[test]
    fn test_single_flight() {
        let mut scheduler = TaskScheduler::new();
        let first = scheduler.enqueue(scan(), Duration::from_secs(1));
        scheduler.enqueue(TaskKind::Advertise, Duration::from_secs(1));

        let begun = scheduler.begin_next().unwrap();
        assert_eq!(begun.id, first);
        assert!(scheduler.begin_next().is_none());
        assert_eq!(scheduler.queue_len(), 1);

        scheduler.complete();
        assert_eq!(scheduler.begin_next().unwrap().kind, TaskKind::Advertise);
    }

    #[test]
    fn test_fifo_order() {
        let mut scheduler = TaskScheduler::new();
        let ids: Vec<_> = (0..5)
            .map(|_| scheduler.enqueue(scan(), Duration::from_secs(1)))
            .collect();

        let mut started = Vec::new();
        while let Some(task) = scheduler.begin_next() {
            started.push(task.id);
            scheduler.complete();
        }
        assert_eq!(started, ids);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_stale_expiry_is_ignored() {
        let mut scheduler = TaskScheduler::new();
        let first = scheduler.enqueue(scan(), Duration::from_secs(1));
        let second = scheduler.enqueue(scan(), Duration::from_secs(1));

        scheduler.begin_next();
        scheduler.complete();
        scheduler.begin_next();

        assert!(scheduler.expire(first).is_none());
        assert_eq!(scheduler.pending_id(), Some(second));

        assert_eq!(scheduler.expire(second).map(|t| t.id), Some(second));
        assert!(scheduler.expire(second).is_none());
        assert!(scheduler.pending().is_none());
    }

    #[test]
    fn test_pending_mut_edits_in_place() {
        let mut scheduler = TaskScheduler::new();
        scheduler.enqueue(TaskKind::Scan { peers_needed: 3 }, Duration::from_secs(3));
        scheduler.begin_next();

        if let Some(TaskKind::Scan { peers_needed }) =
            scheduler.pending_mut().map(|task| &mut task.kind)
        {
            *peers_needed -= 1;
        }
        assert_eq!(
            scheduler.pending_kind(),
            Some(&TaskKind::Scan { peers_needed: 2 })
        );
    }
}
