//! Single-flight task scheduling
//!
//! Every radio operation of both roles goes through one FIFO queue with at
//! most one task pending. A task leaves the pending slot exactly once, either
//! when its result event arrives or when its expiry timer fires.

pub mod queue;
pub mod task;
pub mod timer;

pub use queue::TaskScheduler;
pub use task::{Task, TaskId, TaskKind};
pub use timer::{ManualTimer, TaskTimer, TokioTimer, Wakeup};
