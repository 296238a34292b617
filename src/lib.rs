//! libttak - concurrent memory & sharing substrate
//!
//! A tiered lifecycle allocator, a buddy allocator, epoch-based
//! reclamation, owner-gated shared containers, a lock-free lattice
//! ingress board, an object pool, and a priority-scheduled thread pool
//! with TTL-gated IO guards.

pub mod clock;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod lattice;
pub mod memory;
pub mod pool;
pub mod sched;

pub use clock::{Clock, SystemClock, Tick, NEVER};
pub use config::TtakConfig;
pub use error::{Result, TtakError};
