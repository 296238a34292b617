//! Per-thread pocket allocator and detachable cache (spec.md §4.1 tiered
//! routing, §9 design note on the detachable-cache open question).
//!
//! Grounded on `memory/allocator/pools.rs::MemoryPool`'s fixed-size
//! free-list-per-class design, split per-thread (so the hot path never
//! takes a lock) and generalized to a small set of size classes instead
//! of one object size per pool.

use super::common::*;
use std::cell::RefCell;

const NUM_SIZE_CLASSES: usize = 5; // 16, 32, 64, 128, 256 bytes
const MAGAZINE_CAPACITY: usize = 64;

fn size_class(size: usize) -> Option<usize> {
    let classes = [16usize, 32, 64, 128, 256];
    classes.iter().position(|&c| size <= c)
}

fn class_size(idx: usize) -> usize {
    [16usize, 32, 64, 128, 256][idx]
}

struct Magazine {
    free: [Vec<NonNull<u8>>; NUM_SIZE_CLASSES],
}

impl Magazine {
    fn new() -> Self {
        Self {
            free: std::array::from_fn(|_| Vec::new()),
        }
    }
}

thread_local! {
    static MAGAZINE: RefCell<Magazine> = RefCell::new(Magazine::new());
}

/// Per-thread small-object allocator: the fast "pocket" tier that never
/// touches the buddy allocator's shared locks for requests at or below
/// the configured small-allocation limit.
pub struct PocketAllocator {
    limit: usize,
}

impl PocketAllocator {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn handles(&self, size: usize) -> bool {
        size <= self.limit
    }

    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let Some(class) = size_class(size) else {
            return Err(TtakError::InvalidArgument("size exceeds pocket classes".into()));
        };
        let class_bytes = class_size(class);
        let ptr = MAGAZINE.with(|m| {
            let mut mag = m.borrow_mut();
            if let Some(ptr) = mag.free[class].pop() {
                return Ok(ptr);
            }
            drop(mag);
            self.system_alloc(class_bytes)
        })?;
        // A recycled block carries whatever its previous occupant left
        // behind; a freshly mapped one is zero already, but zero
        // unconditionally since we don't track which case we're in here
        // (spec.md §4.1, `alloc` returns zeroed payload memory).
        unsafe {
            ptr::write_bytes(ptr.as_ptr(), 0, class_bytes);
        }
        Ok(ptr)
    }

    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size, 16)
            .map_err(|e| TtakError::SystemFailure(format!("invalid pocket layout: {e}")))?;
        let ptr = unsafe { System.alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| TtakError::Unavailable("pocket allocation failed".into()))
    }

    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        let Some(class) = size_class(size) else {
            return;
        };
        MAGAZINE.with(|m| {
            let mut mag = m.borrow_mut();
            if mag.free[class].len() < MAGAZINE_CAPACITY {
                mag.free[class].push(ptr);
            } else {
                drop(mag);
                unsafe {
                    let layout = Layout::from_size_align_unchecked(class_size(class), 16);
                    System.dealloc(ptr.as_ptr(), layout);
                }
            }
        });
    }
}

/// A detachable cache entry: a small inline chunk plus the generation it
/// was retained under.
struct CacheEntry {
    bytes: [u8; 16],
    len: u8,
    generation: u64,
}

/// Per-context LRU of small (<=16 byte) chunks, biased toward the active
/// generation: entries from a stale generation are evicted before
/// entries from the current one regardless of recency (spec.md §9 open
/// question: "detachable cache" resolved as a generation-biased LRU).
pub struct DetachableCache {
    entries: RefCell<Vec<CacheEntry>>,
    generation: AtomicU64,
    capacity: usize,
}

impl DetachableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RefCell::new(Vec::with_capacity(capacity)),
            generation: AtomicU64::new(0),
            capacity,
        }
    }

    /// Called by the lifecycle allocator's autoclean sweep to advance
    /// the generation, biasing future evictions toward anything retained
    /// under an older one.
    pub fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn put(&self, data: &[u8]) {
        if data.len() > 16 {
            return;
        }
        let gen = self.current_generation();
        let mut entries = self.entries.borrow_mut();
        if entries.len() >= self.capacity {
            // evict the oldest-generation entry; ties broken by position
            // (closest to front = least recently retained).
            let evict_idx = entries
                .iter()
                .enumerate()
                .min_by_key(|(i, e)| (e.generation, *i))
                .map(|(i, _)| i);
            if let Some(idx) = evict_idx {
                entries.remove(idx);
            }
        }
        let mut bytes = [0u8; 16];
        bytes[..data.len()].copy_from_slice(data);
        entries.push(CacheEntry {
            bytes,
            len: data.len() as u8,
            generation: gen,
        });
    }

    pub fn take_matching(&self, predicate: impl Fn(&[u8]) -> bool) -> Option<Vec<u8>> {
        let mut entries = self.entries.borrow_mut();
        let idx = entries
            .iter()
            .position(|e| predicate(&e.bytes[..e.len as usize]))?;
        let e = entries.remove(idx);
        Some(e.bytes[..e.len as usize].to_vec())
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pocket_reuses_freed_block() {
        let pocket = PocketAllocator::new(256);
        let p = pocket.alloc(20).unwrap();
        pocket.free(p, 20);
        let p2 = pocket.alloc(20).unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn pocket_rejects_oversize() {
        let pocket = PocketAllocator::new(256);
        assert!(pocket.alloc(1024).is_err());
    }

    #[test]
    fn detachable_cache_evicts_oldest_generation_first() {
        let cache = DetachableCache::new(2);
        cache.put(b"aaaa");
        cache.advance_generation();
        cache.put(b"bbbb");
        cache.put(b"cccc"); // forces eviction; "aaaa" is gen 0, should go
        assert_eq!(cache.len(), 2);
        assert!(cache.take_matching(|b| b == b"aaaa").is_none());
        assert!(cache.take_matching(|b| b == b"bbbb").is_some());
    }
}
