//! Database queue hierarchy.
//!
//! One [`LeadQueue`] per configured database owns the persistent connection
//! and supervises it; [`ChildQueue`] workers execute submitted requests by
//! borrowing that connection. [`OnceSignal`] carries the two one-shot
//! lifecycle milestones (initial connection attempted, bootstrap completed).

pub mod child;
pub mod lead;
pub mod signal;

pub use child::ChildQueue;
pub use lead::{LeadQueue, QueueState, QueueStats};
pub use signal::OnceSignal;
