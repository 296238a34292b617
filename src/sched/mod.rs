//! Scheduling subsystem: priority queues (C9), the worker thread pool,
//! and the TTL-gated IO guard (C10).

pub mod io_guard;
pub mod priority;
pub mod threadpool;

pub use io_guard::{IoGuard, ResourceTag};
pub use priority::{clamp_nice, DurationTracker, HeapPriorityQueue, LinkedPriorityQueue, PriorityTask, TaskHash, TaskId};
pub use threadpool::{ThreadPool, ThreadPoolStats};
