//! Lattice ingress board (C8): a chain of dim×dim grids of cache-aligned
//! slots, where concurrent writers are assigned disjoint diagonals via a
//! Latin-square rule, so no two threads ever contend for the same slot.
//!
//! Grounded on the teacher's `concurrent/mod.rs::CACHE_LINE_SIZE`/
//! `Backoff` (slot-state CAS retry) and `buffer/page_table.rs`'s chained
//! fixed-capacity partitions, generalized from a hash-routed partition
//! table to a Latin-square-routed slot grid.

use crate::concurrent::CACHE_LINE_SIZE;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const SLOT_STATE_FREE: u32 = 0;
const SLOT_STATE_WRITING: u32 = 1;
const SLOT_STATE_READY: u32 = 2;
const SLOT_STATE_READING: u32 = 3;

#[repr(align(64))]
struct LatticeSlot {
    state: AtomicU32,
    seq: AtomicU64,
    timestamp: AtomicU64,
    len: AtomicUsize,
    buffer: Mutex<Vec<u8>>,
}

impl LatticeSlot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(SLOT_STATE_FREE),
            seq: AtomicU64::new(0),
            timestamp: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            buffer: Mutex::new(Vec::new()),
        }
    }
}

/// A dim×dim grid of slots. Writers at thread index `tid` may only touch
/// slots on the diagonal `(r + c) mod dim == tid mod dim`, so `dim`
/// concurrent writers never collide within one node.
pub struct LatticeNode {
    dim: usize,
    slots: RwLock<Vec<LatticeSlot>>,
    ingress_count: AtomicUsize,
    used_count: AtomicUsize,
    full: std::sync::atomic::AtomicBool,
    stub: std::sync::atomic::AtomicBool,
    next: RwLock<Option<Arc<LatticeNode>>>,
    expand_gate: Mutex<()>,
}

fn fresh_slots(dim: usize) -> Vec<LatticeSlot> {
    let mut slots = Vec::with_capacity(dim * dim);
    for _ in 0..(dim * dim) {
        slots.push(LatticeSlot::new());
    }
    slots
}

impl LatticeNode {
    fn new(dim: usize) -> Self {
        Self {
            dim,
            slots: RwLock::new(fresh_slots(dim)),
            ingress_count: AtomicUsize::new(0),
            used_count: AtomicUsize::new(0),
            full: std::sync::atomic::AtomicBool::new(false),
            stub: std::sync::atomic::AtomicBool::new(false),
            next: RwLock::new(None),
            expand_gate: Mutex::new(()),
        }
    }

    fn slot_index(&self, row: usize, col: usize) -> usize {
        row * self.dim + col
    }

    /// Diagonal assigned to writer `tid` for row `row`: `(row + col) mod
    /// dim == tid mod dim` rearranged to solve for `col`.
    fn diagonal_col(&self, row: usize, tid: usize) -> usize {
        let target = tid % self.dim;
        (target + self.dim - (row % self.dim)) % self.dim
    }

    fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Write `data` into the first FREE slot on this writer's diagonal,
    /// scanning row-major (spec.md §4.5 step 1). Returns `None` if every
    /// row on the diagonal is occupied, or the node is stubbed, so the
    /// caller can hop to the next node in the chain.
    pub fn write(&self, tid: usize, data: &[u8]) -> Option<u64> {
        if self.is_stub() {
            return None;
        }
        let slots = self.slots.read().unwrap();
        for row in 0..self.dim {
            let col = self.diagonal_col(row, tid);
            let idx = self.slot_index(row, col);
            let slot = &slots[idx];
            if slot
                .state
                .compare_exchange(SLOT_STATE_FREE, SLOT_STATE_WRITING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            {
                let mut buf = slot.buffer.lock().unwrap();
                buf.clear();
                buf.extend_from_slice(data);
            }
            slot.len.store(data.len(), Ordering::Release);
            let seq = slot.seq.fetch_add(1, Ordering::AcqRel) + 1;
            slot.timestamp.store(crate::clock::now_ns(), Ordering::Release);
            slot.state.store(SLOT_STATE_READY, Ordering::Release);
            let used = self.used_count.fetch_add(1, Ordering::AcqRel) + 1;
            self.ingress_count.fetch_add(1, Ordering::Relaxed);
            if used >= self.dim * self.dim {
                self.full.store(true, Ordering::Release);
            }
            return Some(seq);
        }
        None
    }

    /// Read and free the first READY slot on this reader's diagonal,
    /// scanning row-major, following READY → READING → FREE. Returns
    /// `None` if the diagonal has nothing ready, or the node is stubbed.
    pub fn read(&self, tid: usize) -> Option<Vec<u8>> {
        if self.is_stub() {
            return None;
        }
        let slots = self.slots.read().unwrap();
        for row in 0..self.dim {
            let col = self.diagonal_col(row, tid);
            let idx = self.slot_index(row, col);
            let slot = &slots[idx];
            if slot
                .state
                .compare_exchange(SLOT_STATE_READY, SLOT_STATE_READING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let len = slot.len.load(Ordering::Acquire);
            let data = slot.buffer.lock().unwrap()[..len].to_vec();
            slot.state.store(SLOT_STATE_FREE, Ordering::Release);
            self.used_count.fetch_sub(1, Ordering::AcqRel);
            self.full.store(false, Ordering::Release);
            return Some(data);
        }
        None
    }

    /// Release this node's slot array and mark it a stub: no slot can be
    /// used until `rehydrate` restores it (spec.md §3, stub invariant).
    pub fn stub(&self) {
        let mut slots = self.slots.write().unwrap();
        slots.clear();
        slots.shrink_to_fit();
        self.stub.store(true, Ordering::Release);
    }

    /// Rebuild a stubbed node's slot array so it can serve `write`/`read`
    /// again.
    pub fn rehydrate(&self) {
        let mut slots = self.slots.write().unwrap();
        if slots.is_empty() {
            *slots = fresh_slots(self.dim);
        }
        self.stub.store(false, Ordering::Release);
    }

    pub fn is_stub(&self) -> bool {
        self.stub.load(Ordering::Acquire)
    }

    pub fn used_count(&self) -> usize {
        self.used_count.load(Ordering::Acquire)
    }

    pub fn ensure_next(self: &Arc<Self>) -> Arc<LatticeNode> {
        {
            let next = self.next.read().unwrap();
            if let Some(n) = next.as_ref() {
                return n.clone();
            }
        }
        let _gate = self.expand_gate.lock().unwrap();
        let mut next = self.next.write().unwrap();
        if let Some(n) = next.as_ref() {
            return n.clone();
        }
        let node = Arc::new(LatticeNode::new(self.dim));
        *next = Some(node.clone());
        node
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn ingress_count(&self) -> usize {
        self.ingress_count.load(Ordering::Relaxed)
    }
}

/// Point-in-time snapshot of a chain's bookkeeping (spec.md §6, `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeStats {
    pub node_count: usize,
    pub stub_count: usize,
    pub total_ingress: usize,
    pub live_slots: usize,
}

/// Owning handle to a chain of `LatticeNode`s.
pub struct LatticeBoard {
    head: Arc<LatticeNode>,
}

impl LatticeBoard {
    pub fn new(dim: usize) -> Self {
        assert!(dim.is_power_of_two(), "lattice dimension must be a power of two");
        Self {
            head: Arc::new(LatticeNode::new(dim)),
        }
    }

    pub fn head(&self) -> Arc<LatticeNode> {
        self.head.clone()
    }

    /// Write via the chain: try the head, and if its diagonal has no
    /// FREE slot for this writer, hop to (and grow, if needed) the next
    /// node.
    pub fn write(&self, tid: usize, data: &[u8]) -> u64 {
        let mut node = self.head.clone();
        loop {
            if let Some(seq) = node.write(tid, data) {
                return seq;
            }
            node = node.ensure_next();
        }
    }

    pub fn read(&self, tid: usize) -> Option<Vec<u8>> {
        let mut node = self.head.clone();
        loop {
            if let Some(data) = node.read(tid) {
                return Some(data);
            }
            let next = node.next.read().unwrap().clone();
            match next {
                Some(n) => node = n,
                None => return None,
            }
        }
    }

    fn chain(&self) -> Vec<Arc<LatticeNode>> {
        let mut nodes = Vec::new();
        let mut node = self.head.clone();
        loop {
            nodes.push(node.clone());
            let next = node.next.read().unwrap().clone();
            match next {
                Some(n) => node = n,
                None => break,
            }
        }
        nodes
    }

    /// Stub the trailing nodes of the chain, once the last two non-stub
    /// ("real") nodes have gone completely idle (spec.md §4.5, idle-tail
    /// compaction). Returns the number of nodes stubbed.
    pub fn compact_idle_tail(&self) -> usize {
        let nodes = self.chain();
        let real: Vec<&Arc<LatticeNode>> = nodes.iter().filter(|n| !n.is_stub()).collect();
        if real.len() < 2 {
            return 0;
        }
        let last_two = &real[real.len() - 2..];
        if last_two.iter().all(|n| n.used_count() == 0) {
            for n in last_two {
                n.stub();
            }
            2
        } else {
            0
        }
    }

    pub fn stats(&self) -> LatticeStats {
        let nodes = self.chain();
        LatticeStats {
            node_count: nodes.len(),
            stub_count: nodes.iter().filter(|n| n.is_stub()).count(),
            total_ingress: nodes.iter().map(|n| n.ingress_count()).sum(),
            live_slots: nodes.iter().map(|n| n.used_count()).sum(),
        }
    }
}

const _ALIGN_CHECK: usize = CACHE_LINE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn disjoint_diagonals_dont_collide() {
        let board = Arc::new(LatticeBoard::new(4));
        let mut handles = Vec::new();
        for tid in 0..4 {
            let board = board.clone();
            handles.push(thread::spawn(move || {
                for row in 0..4 {
                    board.write(tid, format!("tid{tid}-row{row}").as_bytes());
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(board.head().ingress_count(), 16);
    }

    #[test]
    fn write_read_round_trip() {
        let board = LatticeBoard::new(2);
        let seq = board.write(0, b"hello");
        assert_eq!(seq, 1);
        let data = board.read(0).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn growth_on_exhaustion() {
        let board = LatticeBoard::new(2);
        // tid 0's diagonal has 2 slots; fill both before a third write
        // forces a hop to the next node.
        board.write(0, b"x");
        board.write(0, b"x");
        board.write(0, b"y");
        assert!(board.head().next.read().unwrap().is_some());
    }

    #[test]
    fn stub_releases_slots_and_rehydrate_restores_them() {
        let node = LatticeNode::new(2);
        node.write(0, b"x").unwrap();
        node.read(0).unwrap();
        assert_eq!(node.used_count(), 0);

        node.stub();
        assert!(node.is_stub());
        assert!(node.write(0, b"x").is_none());
        assert!(node.read(0).is_none());

        node.rehydrate();
        assert!(!node.is_stub());
        assert!(node.write(0, b"x").is_some());
    }

    #[test]
    fn compact_idle_tail_stubs_trailing_empty_nodes() {
        let board = LatticeBoard::new(2);
        let head = board.head();
        let mid = head.ensure_next();
        let tail = mid.ensure_next();

        let compacted = board.compact_idle_tail();
        assert_eq!(compacted, 2);
        assert!(!head.is_stub());
        assert!(mid.is_stub());
        assert!(tail.is_stub());
    }

    #[test]
    fn compact_idle_tail_skips_nodes_still_in_use() {
        let board = LatticeBoard::new(2);
        let head = board.head();
        let mid = head.ensure_next();
        mid.write(0, b"x").unwrap();

        let compacted = board.compact_idle_tail();
        assert_eq!(compacted, 0);
        assert!(!head.is_stub());
        assert!(!mid.is_stub());
    }

    #[test]
    fn stats_report_chain_length_and_ingress() {
        let board = LatticeBoard::new(2);
        board.write(0, b"x");
        board.write(1, b"y");
        let stats = board.stats();
        assert_eq!(stats.node_count, 1);
        assert_eq!(stats.stub_count, 0);
        assert_eq!(stats.total_ingress, 2);
        assert_eq!(stats.live_slots, 2);
    }
}
