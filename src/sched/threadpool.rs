//! Thread pool (C10): worker threads blocking on a shared priority
//! queue, submitting closures that run in nice-value order rather than
//! FIFO.
//!
//! Grounded on `resource_manager/cpu_scheduler.rs`'s task-state
//! vocabulary (Ready/Running/Waiting) for worker bookkeeping, combined
//! with this crate's own [`HeapPriorityQueue`](super::priority::HeapPriorityQueue)
//! for ordering.

use super::priority::{DurationTracker, HeapPriorityQueue, PriorityTask, TaskHash, TaskId};
use crate::config::TtakConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<HeapPriorityQueue<Job>>,
    cv: Condvar,
    shutting_down: AtomicBool,
    next_task_id: AtomicU64,
    active_workers: AtomicU64,
    durations: Arc<DurationTracker>,
}

/// A pool of worker threads draining a shared priority queue.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

/// Point-in-time snapshot of a pool's bookkeeping (spec.md §6, `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolStats {
    pub worker_count: usize,
    pub active_workers: u64,
    pub pending: usize,
}

impl ThreadPool {
    /// Create a pool with `num_workers` threads (defaults to `num_cpus`
    /// if zero is passed).
    pub fn pool_create(num_workers: usize, _config: &TtakConfig) -> Self {
        let num_workers = if num_workers == 0 { num_cpus::get() } else { num_workers };
        let shared = Arc::new(Shared {
            queue: Mutex::new(HeapPriorityQueue::new()),
            cv: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            next_task_id: AtomicU64::new(1),
            active_workers: AtomicU64::new(0),
            durations: Arc::new(DurationTracker::new()),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let shared = shared.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("libttak-worker-{idx}"))
                    .spawn(move || Self::worker_loop(shared))
                    .expect("failed to spawn worker thread"),
            );
        }

        Self { shared, workers }
    }

    fn worker_loop(shared: Arc<Shared>) {
        shared.active_workers.fetch_add(1, Ordering::Relaxed);
        loop {
            let job = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.pop() {
                        break Some(task.payload);
                    }
                    if shared.shutting_down.load(Ordering::Acquire) {
                        break None;
                    }
                    queue = shared.cv.wait(queue).unwrap();
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        shared.active_workers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Submit a closure at the given nice value, tagged with a
    /// `task_hash` identifying its kind (spec.md §4.7, `submit`). The
    /// task's starting priority is nudged by the classified EMA of that
    /// hash's past execution durations, and its actual duration feeds
    /// back into the tracker once it runs. Returns the task id assigned
    /// for diagnostics.
    pub fn submit<F>(&self, nice: i8, task_hash: TaskHash, job: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let delta = self.shared.durations.delta_for(task_hash);

        let durations = self.shared.durations.clone();
        let wrapped: Job = Box::new(move || {
            let start = Instant::now();
            job();
            let elapsed_ns = start.elapsed().as_nanos() as f64;
            durations.record(task_hash, elapsed_ns);
        });

        let mut task = PriorityTask::new(id, nice, wrapped);
        task.adjust_by(delta);
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push(task);
        }
        self.shared.cv.notify_one();
        id
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    pub fn active_workers(&self) -> u64 {
        self.shared.active_workers.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            worker_count: self.workers.len(),
            active_workers: self.active_workers(),
            pending: self.pending(),
        }
    }

    /// Signal shutdown and join every worker (spec.md §4.7, `destroy`).
    pub fn destroy(mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn submitted_jobs_all_run() {
        let pool = ThreadPool::pool_create(4, &TtakConfig::default());
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.submit(0, i as u64, move || tx.send(i).unwrap());
        }
        drop(tx);
        let mut got: Vec<i32> = rx.iter().collect();
        got.sort();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
        pool.destroy();
    }

    #[test]
    fn destroy_joins_all_workers() {
        let pool = ThreadPool::pool_create(2, &TtakConfig::default());
        assert!(pool.active_workers() <= 2);
        pool.destroy();
    }

    #[test]
    fn stats_report_worker_count_and_pending_depth() {
        let pool = ThreadPool::pool_create(2, &TtakConfig::default());
        assert_eq!(pool.stats().worker_count, 2);
        pool.destroy();
    }
}
