//! Priority scheduling primitives (C9): nice-value clamping, a
//! task-hash-keyed duration tracker that classifies observed execution
//! time into a priority delta, and two queue shapes — a singly-linked
//! descending list and a binary-heap variant — sharing the same task
//! node.
//!
//! Grounded on `resource_manager/cpu_scheduler.rs`'s priority/task-state
//! vocabulary, narrowed to the ordering primitives the thread pool (C10)
//! needs.

use crate::config::TtakConfig;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Mutex;

/// Exponential-moving-average coefficients for the per-task-hash observed
/// duration (spec.md §9 open question: fixed at 0.7 old / 0.3 new,
/// matching the teacher's fair-share scheduler's smoothing of per-core
/// usage).
const EMA_OLD_WEIGHT: f64 = 0.7;
const EMA_NEW_WEIGHT: f64 = 0.3;

/// Duration classification thresholds, in nanoseconds.
const VERY_FAST_NS: f64 = 100_000.0;
const FAST_NS: f64 = 1_000_000.0;
const SLOW_NS: f64 = 50_000_000.0;
const VERY_SLOW_NS: f64 = 200_000_000.0;

const DELTA_VERY_FAST: f64 = 5.0;
const DELTA_FAST: f64 = 2.0;
const DELTA_NEUTRAL: f64 = 0.0;
const DELTA_SLOW: f64 = -2.0;
const DELTA_VERY_SLOW: f64 = -5.0;

pub type TaskId = u64;

/// Stable identity for a kind of task, used to key observed-duration
/// history (spec.md §4.7, EMA tracking).
pub type TaskHash = u64;

/// Classify an observed duration into one of five discrete priority
/// deltas (spec.md §4.7).
pub fn classify_duration(duration_ns: f64) -> f64 {
    if duration_ns < VERY_FAST_NS {
        DELTA_VERY_FAST
    } else if duration_ns < FAST_NS {
        DELTA_FAST
    } else if duration_ns < SLOW_NS {
        DELTA_NEUTRAL
    } else if duration_ns < VERY_SLOW_NS {
        DELTA_SLOW
    } else {
        DELTA_VERY_SLOW
    }
}

/// Tracks an EMA of observed execution durations per task hash, so
/// recurring tasks of the same kind get their priority nudged toward
/// their historical behavior (spec.md §4.7, `submit`).
pub struct DurationTracker {
    durations: Mutex<HashMap<TaskHash, f64>>,
}

impl DurationTracker {
    pub fn new() -> Self {
        Self { durations: Mutex::new(HashMap::new()) }
    }

    /// Blend `duration_ns` into the tracked average for `hash`, returning
    /// the priority delta classified from the updated average.
    pub fn record(&self, hash: TaskHash, duration_ns: f64) -> f64 {
        let mut map = self.durations.lock().unwrap();
        let updated = match map.get(&hash) {
            Some(prev) => prev * EMA_OLD_WEIGHT + duration_ns * EMA_NEW_WEIGHT,
            None => duration_ns,
        };
        map.insert(hash, updated);
        classify_duration(updated)
    }

    /// The priority delta a task of `hash` should be submitted with,
    /// based on its tracked history (0.0 if never observed).
    pub fn delta_for(&self, hash: TaskHash) -> f64 {
        self.durations
            .lock()
            .unwrap()
            .get(&hash)
            .copied()
            .map(classify_duration)
            .unwrap_or(DELTA_NEUTRAL)
    }
}

impl Default for DurationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PriorityTask<T> {
    pub id: TaskId,
    pub nice: i8,
    pub adjusted_priority: f64,
    pub payload: T,
}

impl<T> PriorityTask<T> {
    pub fn new(id: TaskId, nice: i8, payload: T) -> Self {
        let adjusted_priority = -(nice as f64);
        Self { id, nice, adjusted_priority, payload }
    }

    /// Nudge the adjusted priority by a classified duration delta
    /// (spec.md §4.7, `submit`).
    pub fn adjust_by(&mut self, delta: f64) {
        self.adjusted_priority += delta;
    }
}

impl<T> PartialEq for PriorityTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.adjusted_priority == other.adjusted_priority
    }
}
impl<T> Eq for PriorityTask<T> {}

impl<T> PartialOrd for PriorityTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for PriorityTask<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.adjusted_priority
            .partial_cmp(&other.adjusted_priority)
            .unwrap_or(CmpOrdering::Equal)
    }
}

/// Clamp a requested nice value into the configured range (spec.md §6).
pub fn clamp_nice(config: &TtakConfig, nice: i8) -> i8 {
    config.clamp_nice(nice)
}

/// Singly-linked descending-priority queue: simple, cache-friendly for
/// the small queue depths a single worker typically sees.
pub struct LinkedPriorityQueue<T> {
    nodes: Vec<PriorityTask<T>>,
}

impl<T> LinkedPriorityQueue<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Insert keeping the list sorted descending by adjusted priority.
    pub fn push(&mut self, task: PriorityTask<T>) {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.adjusted_priority < task.adjusted_priority)
            .unwrap_or(self.nodes.len());
        self.nodes.insert(pos, task);
    }

    pub fn pop(&mut self) -> Option<PriorityTask<T>> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<T> Default for LinkedPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary-heap-backed variant for workloads with deep queues, where
/// O(log n) insertion beats the linked list's O(n).
pub struct HeapPriorityQueue<T> {
    heap: BinaryHeap<PriorityTask<T>>,
}

impl<T> HeapPriorityQueue<T> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, task: PriorityTask<T>) {
        self.heap.push(task);
    }

    pub fn pop(&mut self) -> Option<PriorityTask<T>> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for HeapPriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_queue_pops_highest_priority_first() {
        let mut q = LinkedPriorityQueue::new();
        q.push(PriorityTask::new(1, 5, ()));
        q.push(PriorityTask::new(2, -5, ()));
        q.push(PriorityTask::new(3, 0, ()));
        assert_eq!(q.pop().unwrap().id, 2);
        assert_eq!(q.pop().unwrap().id, 3);
        assert_eq!(q.pop().unwrap().id, 1);
    }

    #[test]
    fn heap_queue_matches_linked_ordering() {
        let mut q = HeapPriorityQueue::new();
        q.push(PriorityTask::new(1, 5, ()));
        q.push(PriorityTask::new(2, -5, ()));
        q.push(PriorityTask::new(3, 0, ()));
        assert_eq!(q.pop().unwrap().id, 2);
        assert_eq!(q.pop().unwrap().id, 3);
        assert_eq!(q.pop().unwrap().id, 1);
    }

    #[test]
    fn nice_clamped_via_config() {
        let cfg = TtakConfig::default();
        assert_eq!(clamp_nice(&cfg, 50), cfg.nice_max);
    }

    #[test]
    fn adjust_by_shifts_priority_by_the_given_delta() {
        let mut t = PriorityTask::new(1, 0, ());
        let start = t.adjusted_priority;
        t.adjust_by(DELTA_VERY_FAST);
        assert_eq!(t.adjusted_priority, start + DELTA_VERY_FAST);
    }

    #[test]
    fn classify_duration_buckets_into_five_discrete_deltas() {
        assert_eq!(classify_duration(50_000.0), DELTA_VERY_FAST);
        assert_eq!(classify_duration(500_000.0), DELTA_FAST);
        assert_eq!(classify_duration(10_000_000.0), DELTA_NEUTRAL);
        assert_eq!(classify_duration(100_000_000.0), DELTA_SLOW);
        assert_eq!(classify_duration(500_000_000.0), DELTA_VERY_SLOW);
    }

    #[test]
    fn duration_tracker_blends_observations_and_classifies() {
        let tracker = DurationTracker::new();
        assert_eq!(tracker.delta_for(42), DELTA_NEUTRAL);
        let delta = tracker.record(42, 50_000.0);
        assert_eq!(delta, DELTA_VERY_FAST);
        assert_eq!(tracker.delta_for(42), DELTA_VERY_FAST);

        // a single very-slow observation blended 30% in pulls the
        // average up, but not all the way to very-slow.
        let delta = tracker.record(42, 500_000_000.0);
        assert_eq!(delta, DELTA_SLOW);
        assert_eq!(tracker.delta_for(42), DELTA_SLOW);
    }
}
