//! Buddy allocator (C2): power-of-two block allocator over one or more
//! segments, four-tier locking keyed by block order, auto-grow, and
//! deferred free via epoch retirement.
//!
//! Grounded on `memory/allocator/zones.rs::BuddyAllocator` in the teacher,
//! generalized from a single global free-list-per-order into the tiered
//! locking discipline and residue-bitmask order selection spec.md §4.2 and
//! §5 require.

use super::common::*;
use crate::concurrent::epoch::EpochManager;
use parking_lot::{Mutex, RwLock};
use std::hint;

/// Smallest order served by the hot (tier-1, spinlock) path.
const TIER1_MAX_ORDER_OFFSET: u32 = 6; // orders [MIN_ORDER, MIN_ORDER+6)
const TIER2_MAX_ORDER_OFFSET: u32 = 16; // orders [MIN_ORDER+6, MIN_ORDER+16)
// everything above TIER2 up to MAX_ORDER is tier 3 (rwlock).

const DEFAULT_GROW_MIN: usize = 1024 * 1024; // 1 MiB
const GROW_PRESSURE_RATIO: f64 = 0.80;

fn order_for(size: usize) -> u32 {
    let need = size.max(1).next_power_of_two();
    need.trailing_zeros().max(MIN_ORDER)
}

/// A tiny hand-rolled spinlock, grounded on `concurrent/mod.rs::Backoff`
/// (the teacher's CAS-retry backoff helper) rather than a library mutex,
/// matching spec.md §5's "tier 1 = spinlock" requirement.
struct Spinlock<T> {
    locked: AtomicBool,
    data: std::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: std::cell::UnsafeCell::new(data),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        let mut spins: u32 = 0;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            for _ in 0..(1u32 << spins.min(6)) {
                hint::spin_loop();
            }
            spins = spins.saturating_add(1);
        }
        SpinGuard { lock: self }
    }
}

impl<'a, T> std::ops::Deref for SpinGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> std::ops::DerefMut for SpinGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Per-order free list, gated by the lock appropriate to its tier.
enum OrderLock {
    Tier1(Spinlock<Vec<usize>>),
    Tier2(Mutex<Vec<usize>>),
    Tier3(RwLock<Vec<usize>>),
}

impl OrderLock {
    fn for_order(order: u32) -> Self {
        let offset = order.saturating_sub(MIN_ORDER);
        if offset < TIER1_MAX_ORDER_OFFSET {
            OrderLock::Tier1(Spinlock::new(Vec::new()))
        } else if offset < TIER2_MAX_ORDER_OFFSET {
            OrderLock::Tier2(Mutex::new(Vec::new()))
        } else {
            OrderLock::Tier3(RwLock::new(Vec::new()))
        }
    }

    fn push(&self, offset: usize) {
        match self {
            OrderLock::Tier1(s) => s.lock().push(offset),
            OrderLock::Tier2(m) => m.lock().push(offset),
            OrderLock::Tier3(r) => r.write().push(offset),
        }
    }

    fn pop(&self) -> Option<usize> {
        match self {
            OrderLock::Tier1(s) => s.lock().pop(),
            OrderLock::Tier2(m) => m.lock().pop(),
            OrderLock::Tier3(r) => r.write().pop(),
        }
    }

    fn remove_value(&self, offset: usize) -> bool {
        let remove = |v: &mut Vec<usize>| {
            if let Some(pos) = v.iter().position(|&o| o == offset) {
                v.swap_remove(pos);
                true
            } else {
                false
            }
        };
        match self {
            OrderLock::Tier1(s) => remove(&mut s.lock()),
            OrderLock::Tier2(m) => remove(&mut m.lock()),
            OrderLock::Tier3(r) => remove(&mut r.write()),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            OrderLock::Tier1(s) => s.lock().is_empty(),
            OrderLock::Tier2(m) => m.lock().is_empty(),
            OrderLock::Tier3(r) => r.read().is_empty(),
        }
    }
}

struct Segment {
    base: NonNull<u8>,
    size: usize,
    owns_buffer: bool,
    /// Free list per order, indexed by `order - MIN_ORDER`.
    free_lists: Vec<OrderLock>,
    in_use: Mutex<std::collections::HashSet<usize>>,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn new(size: usize) -> Result<Self> {
        let size = size.next_power_of_two().max(1 << MIN_ORDER);
        let layout = Layout::from_size_align(size, size)
            .map_err(|e| TtakError::SystemFailure(format!("invalid segment layout: {e}")))?;
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            return Err(TtakError::SystemFailure("segment allocation failed".into()));
        }
        let num_orders = (MAX_ORDER - MIN_ORDER + 1) as usize;
        let mut free_lists = Vec::with_capacity(num_orders);
        for o in 0..num_orders {
            free_lists.push(OrderLock::for_order(MIN_ORDER + o as u32));
        }
        let top_order = size.trailing_zeros();
        free_lists[(top_order - MIN_ORDER) as usize].push(0);
        Ok(Self {
            base: unsafe { NonNull::new_unchecked(base) },
            size,
            owns_buffer: true,
            free_lists,
            in_use: Mutex::new(std::collections::HashSet::new()),
        })
    }

    fn order_index(&self, order: u32) -> usize {
        (order - MIN_ORDER) as usize
    }

    fn buddy_of(offset: usize, order: u32) -> usize {
        offset ^ (1usize << order)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owns_buffer {
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.size, self.size);
                System.dealloc(self.base.as_ptr(), layout);
            }
        }
    }
}

/// Handle to a live buddy allocation: which segment it came from, its
/// offset, and its order — the typed-handle replacement for raw pointer
/// arithmetic called for in spec.md §9's design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyHandle {
    pub segment: usize,
    pub offset: usize,
    pub order: u32,
}

pub struct BuddyAllocatorStats {
    pub segments: usize,
    pub capacity: usize,
    pub bytes_in_use: usize,
}

/// The buddy zone: a growable collection of power-of-two segments.
pub struct BuddyZone {
    segments: RwLock<Vec<Segment>>,
    /// Tier-4 gate: background/compaction/growth operations acquire this
    /// *first*, before any per-order lock, per spec.md §5's locking
    /// discipline ("background operations additionally take the Tier-4
    /// gate first, so workers never spin on background work").
    grow_gate: Mutex<()>,
    residue_mask: AtomicU64,
    bytes_in_use: AtomicUsize,
    embedded: bool,
    priority: crate::config::BuddyPriority,
}

impl BuddyZone {
    pub fn new(initial_size: usize, priority: crate::config::BuddyPriority, embedded: bool) -> Result<Self> {
        let seg = Segment::new(initial_size)?;
        let mask = 1u64 << (seg.size.trailing_zeros() - MIN_ORDER);
        Ok(Self {
            segments: RwLock::new(vec![seg]),
            grow_gate: Mutex::new(()),
            residue_mask: AtomicU64::new(mask),
            bytes_in_use: AtomicUsize::new(0),
            embedded,
            priority,
        })
    }

    fn mark_order_free(&self, order: u32) {
        self.residue_mask
            .fetch_or(1u64 << (order - MIN_ORDER), Ordering::Release);
    }

    fn residue_snapshot(&self) -> u64 {
        self.residue_mask.load(Ordering::Acquire)
    }

    /// Find the smallest free order >= `order` using the residue mask,
    /// honoring the configured fit policy (spec.md §4.2, policy bit).
    fn select_order(&self, order: u32, top_order: u32) -> Option<u32> {
        let mask = self.residue_snapshot();
        let shifted = mask >> (order - MIN_ORDER);
        if shifted == 0 {
            return None;
        }
        match self.priority {
            crate::config::BuddyPriority::WorstFit => {
                // scan top-down: highest set bit
                let hi = 63 - shifted.leading_zeros();
                Some(order + hi)
            }
            _ => {
                // first-fit / best-fit: bottom-up, smallest viable order
                let lo = shifted.trailing_zeros();
                Some(order + lo)
            }
        }
        .filter(|&o| o <= top_order)
    }

    pub fn allocate(&self, size: usize) -> Result<BuddyHandle> {
        let order = order_for(size);
        if order > MAX_ORDER {
            return Err(TtakError::InvalidArgument("request exceeds max buddy order".into()));
        }

        loop {
            if let Some(handle) = self.try_allocate(order) {
                self.bytes_in_use
                    .fetch_add(1usize << order, Ordering::Relaxed);
                self.zero_block(handle);
                return Ok(handle);
            }

            if self.embedded {
                self.defragment();
                if let Some(handle) = self.try_allocate(order) {
                    self.bytes_in_use
                        .fetch_add(1usize << order, Ordering::Relaxed);
                    self.zero_block(handle);
                    return Ok(handle);
                }
                return Err(TtakError::Unavailable("embedded buddy zone exhausted".into()));
            }

            self.grow(1usize << order)?;
        }
    }

    /// Zero a freshly claimed block before handing it back: blocks are
    /// reused across splits and merges, so a block's previous occupant
    /// may have been a different size entirely (spec.md §4.1, `alloc`
    /// returns zeroed payload memory).
    fn zero_block(&self, handle: BuddyHandle) {
        if let Some(ptr) = self.resolve(handle) {
            unsafe {
                ptr::write_bytes(ptr.as_ptr(), 0, 1usize << handle.order);
            }
        }
    }

    fn try_allocate(&self, order: u32) -> Option<BuddyHandle> {
        let segments = self.segments.read();
        for (seg_idx, seg) in segments.iter().enumerate() {
            let top_order = seg.size.trailing_zeros();
            if order > top_order {
                continue;
            }
            let Some(found_order) = self.select_order(order, top_order) else {
                continue;
            };
            let idx = seg.order_index(found_order);
            if let Some(offset) = seg.free_lists[idx].pop() {
                if seg.free_lists[idx].is_empty() {
                    self.residue_mask
                        .fetch_and(!(1u64 << (found_order - MIN_ORDER)), Ordering::Release);
                }
                // split down to the requested order
                for split_order in (order..found_order).rev() {
                    let block_size = 1usize << split_order;
                    let buddy_offset = offset ^ block_size;
                    let split_idx = seg.order_index(split_order);
                    seg.free_lists[split_idx].push(buddy_offset);
                    self.mark_order_free(split_order);
                }
                seg.in_use.lock().insert(offset);
                return Some(BuddyHandle {
                    segment: seg_idx,
                    offset,
                    order,
                });
            }
        }
        None
    }

    /// Return a block to its tier; always routed through epoch retirement
    /// so concurrent lock-free readers elsewhere in the system can finish
    /// before the memory is reused (spec.md §4.2).
    pub fn free(&self, handle: BuddyHandle, epoch: &EpochManager) {
        let zone_ptr: *const BuddyZone = self;
        let handle_copy = handle;
        // SAFETY: the zone outlives the retired closure because callers
        // only retire from within a live allocator instance; the epoch
        // manager guarantees the closure runs after all readers have
        // exited, at which point no live borrow of `self` is in flight.
        epoch.retire(Box::new(move || unsafe {
            (*zone_ptr).free_now(handle_copy);
        }));
    }

    fn free_now(&self, handle: BuddyHandle) {
        let segments = self.segments.read();
        let Some(seg) = segments.get(handle.segment) else {
            return;
        };
        seg.in_use.lock().remove(&handle.offset);
        self.bytes_in_use
            .fetch_sub(1usize << handle.order, Ordering::Relaxed);

        let mut offset = handle.offset;
        let mut order = handle.order;
        let top_order = seg.size.trailing_zeros();

        while order < top_order {
            let buddy_offset = Segment::buddy_of(offset, order);
            let idx = seg.order_index(order);
            if seg.free_lists[idx].remove_value(buddy_offset) {
                offset = offset.min(buddy_offset);
                order += 1;
            } else {
                break;
            }
        }
        let idx = seg.order_index(order);
        seg.free_lists[idx].push(offset);
        self.mark_order_free(order);
    }

    /// Proactively expand when projected usage would exceed 80% of
    /// capacity (spec.md §4.2, Auto-growth trigger), or reactively when
    /// allocation has already failed.
    fn grow(&self, at_least: usize) -> Result<()> {
        let _gate = self.grow_gate.lock();
        let current_cap: usize = self.segments.read().iter().map(|s| s.size).sum();
        let new_size = (current_cap.max(DEFAULT_GROW_MIN) * 2).max(at_least).next_power_of_two();
        let seg = Segment::new(new_size)?;
        let top_order = seg.size.trailing_zeros();
        let mut segments = self.segments.write();
        segments.push(seg);
        drop(segments);
        self.mark_order_free(top_order);
        Ok(())
    }

    /// Should a hypothetical allocation of `size` trigger proactive growth?
    pub fn should_grow(&self, size: usize) -> bool {
        if self.embedded {
            return false;
        }
        let segments = self.segments.read();
        let capacity: usize = segments.iter().map(|s| s.size).sum();
        let used = self.bytes_in_use.load(Ordering::Relaxed);
        capacity > 0 && (used + size) as f64 > capacity as f64 * GROW_PRESSURE_RATIO
    }

    /// Defragmentation pass for embedded mode: nothing to merge beyond
    /// what `free_now` already merges eagerly, so this is a best-effort
    /// scan that re-attempts merges the free path may have raced.
    fn defragment(&self) {
        let segments = self.segments.read();
        for seg in segments.iter() {
            for order in MIN_ORDER..seg.size.trailing_zeros() {
                let idx = seg.order_index(order);
                let Some(offset) = seg.free_lists[idx].pop() else {
                    continue;
                };
                let buddy = Segment::buddy_of(offset, order);
                let next_idx = seg.order_index(order + 1);
                if seg.free_lists[idx].remove_value(buddy) {
                    seg.free_lists[next_idx].push(offset.min(buddy));
                    self.mark_order_free(order + 1);
                } else {
                    seg.free_lists[idx].push(offset);
                }
            }
        }
    }

    pub fn resolve(&self, handle: BuddyHandle) -> Option<NonNull<u8>> {
        let segments = self.segments.read();
        let seg = segments.get(handle.segment)?;
        unsafe { Some(NonNull::new_unchecked(seg.base.as_ptr().add(handle.offset))) }
    }

    pub fn stats(&self) -> BuddyAllocatorStats {
        let segments = self.segments.read();
        BuddyAllocatorStats {
            segments: segments.len(),
            capacity: segments.iter().map(|s| s.size).sum(),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::epoch::EpochManager;

    #[test]
    fn alloc_free_merges_buddies() {
        let zone = BuddyZone::new(1 << 16, crate::config::BuddyPriority::FirstFit, false).unwrap();
        let epoch = EpochManager::new();
        epoch.register();
        let h1 = zone.allocate(100).unwrap();
        let h2 = zone.allocate(100).unwrap();
        zone.free(h1, &epoch);
        zone.free(h2, &epoch);
        for _ in 0..8 {
            epoch.reclaim();
        }
        let stats = zone.stats();
        assert_eq!(stats.bytes_in_use, 0);
    }

    #[test]
    fn auto_grow_on_exhaustion() {
        let zone = BuddyZone::new(1 << 16, crate::config::BuddyPriority::FirstFit, false).unwrap();
        let mut handles = Vec::new();
        for _ in 0..20 {
            handles.push(zone.allocate(1 << 10).unwrap());
        }
        let stats = zone.stats();
        assert!(stats.capacity >= 1 << 17, "zone should have grown");
    }

    #[test]
    fn embedded_mode_rejects_growth() {
        let zone = BuddyZone::new(1 << 12, crate::config::BuddyPriority::FirstFit, true).unwrap();
        let mut count = 0;
        while zone.allocate(1 << 8).is_ok() {
            count += 1;
            if count > 1000 {
                break;
            }
        }
        assert!(zone.allocate(1 << 8).is_err());
    }

    #[test]
    fn zero_size_rejected_upstream() {
        // order_for(0) normalizes to MIN_ORDER, so the zone itself never
        // sees a literal zero; size=0 rejection lives at the lifecycle
        // allocator boundary (spec.md §8 boundary behaviors).
        assert_eq!(order_for(0), MIN_ORDER);
    }
}
