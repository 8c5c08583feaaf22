// Timers — expiry and delayed-scan wakeups fed back into the node

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::task::TaskId;

/// Something the node asked to be told about later
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The task with this id ran out of time
    Expire(TaskId),
    /// A throttled scan may be queued again
    RetryScan { peers_needed: u32 },
}

/// Clock and alarm source for the scheduler.
///
/// `arm` must not call back into the node; the wakeup is delivered later
/// through whatever loop drives the node.
pub trait TaskTimer: Send + Sync {
    /// Monotonic time since the timer was created
    fn now(&self) -> Duration;

    fn arm(&self, after: Duration, wakeup: Wakeup);
}

/// Timer backed by the tokio clock. Wakeups arrive on the paired receiver.
///
/// Sleeps run on the runtime the timer was created in, so a node driven by
/// this timer may be called from threads outside that runtime.
pub struct TokioTimer {
    origin: tokio::time::Instant,
    tx: mpsc::UnboundedSender<Wakeup>,
    handle: Handle,
}

impl TokioTimer {
    /// Must be called from within a tokio runtime.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Wakeup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = Self {
            origin: tokio::time::Instant::now(),
            tx,
            handle: Handle::current(),
        };
        (timer, rx)
    }
}

impl TaskTimer for TokioTimer {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn arm(&self, after: Duration, wakeup: Wakeup) {
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            // Receiver gone means the driver shut down
            let _ = tx.send(wakeup);
        });
    }
}

/// Hand-driven timer for tests: time only moves when told to.
#[derive(Default)]
pub struct ManualTimer {
    inner: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    armed: Vec<(Duration, Wakeup)>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and return every wakeup that came due, in
    /// deadline order.
    pub fn advance(&self, by: Duration) -> Vec<Wakeup> {
        let mut state = self.inner.lock();
        state.now += by;
        let now = state.now;

        let (mut due, pending): (Vec<_>, Vec<_>) =
            state.armed.drain(..).partition(|(at, _)| *at <= now);
        state.armed = pending;
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, wakeup)| wakeup).collect()
    }

    /// Wakeups armed but not yet due, with their deadlines
    pub fn armed(&self) -> Vec<(Duration, Wakeup)> {
        self.inner.lock().armed.clone()
    }
}

impl TaskTimer for ManualTimer {
    fn now(&self) -> Duration {
        self.inner.lock().now
    }

    fn arm(&self, after: Duration, wakeup: Wakeup) {
        let mut state = self.inner.lock();
        let at = state.now + after;
        state.armed.push((at, wakeup));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_timer_fires_at_deadline() {
        let timer = ManualTimer::new();
        timer.arm(Duration::from_millis(100), Wakeup::Expire(TaskId(1)));
        timer.arm(Duration::from_millis(50), Wakeup::Expire(TaskId(2)));

        assert!(timer.advance(Duration::from_millis(49)).is_empty());
        assert_eq!(
            timer.advance(Duration::from_millis(1)),
            vec![Wakeup::Expire(TaskId(2))]
        );
        assert!(timer.advance(Duration::from_millis(49)).is_empty());
        assert_eq!(
            timer.advance(Duration::from_millis(1)),
            vec![Wakeup::Expire(TaskId(1))]
        );
        assert_eq!(timer.now(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_delivers_after_delay() {
        let (timer, mut rx) = TokioTimer::new();
        timer.arm(Duration::from_millis(250), Wakeup::RetryScan { peers_needed: 3 });

        tokio::time::sleep(Duration::from_millis(249)).await;
        assert!(rx.try_recv().is_err());

        let wakeup = rx.recv().await.unwrap();
        assert_eq!(wakeup, Wakeup::RetryScan { peers_needed: 3 });
        assert!(timer.now() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_tokio_timer_armed_off_runtime() {
        let (timer, mut rx) = TokioTimer::new();
        let timer = std::sync::Arc::new(timer);

        let remote = timer.clone();
        std::thread::spawn(move || {
            remote.arm(Duration::from_millis(5), Wakeup::Expire(TaskId(9)));
        })
        .join()
        .unwrap();

        assert_eq!(rx.recv().await, Some(Wakeup::Expire(TaskId(9))));
    }
}
