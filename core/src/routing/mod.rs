//! Flood routing
//!
//! No routing tables: every envelope goes to every neighbor, a dedup set
//! stops loops and the hop limit bounds how far a message travels.

pub mod dedup;
pub mod router;

pub use dedup::{DedupKey, DedupSet, DEFAULT_DEDUP_CAPACITY};
pub use router::{Delivery, DropReason, Outgoing, RouteDecision, Router};
