//! Object pool (C7): a fixed-capacity slab with bitmap-tracked slots,
//! scanned via the same Latin-square diagonal traversal the lattice
//! board uses for its writer assignment, so concurrent allocators favor
//! disjoint 8×8 tiles instead of hammering the same bitmap words.
//!
//! Grounded on `memory/allocator/pools.rs::MemoryPool`'s fixed-size
//! free-list pool, replacing its `Mutex<Vec<NonNull<u8>>>` free list with
//! a bitmap + tiled scan so allocation is lock-free.

use crossbeam::utils::CachePadded;
use std::alloc::{Layout, System, GlobalAlloc};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const TILE: usize = 8;

pub struct ObjectPoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub last_recycled: Option<usize>,
}

/// Fixed-capacity pool of `object_size`-byte slots.
pub struct ObjectPool {
    base: NonNull<u8>,
    object_size: usize,
    capacity: usize,
    layout: Layout,
    /// One bit per slot; 1 = in use. Each word is cache-padded since
    /// concurrent allocators in different tiles frequently claim bits in
    /// adjacent words.
    bitmap: Vec<CachePadded<AtomicU64>>,
    used: AtomicUsize,
    /// Hint: the last slot index freed, checked first on the next
    /// allocation to favor hot reuse.
    last_recycled: AtomicUsize,
    has_hint: std::sync::atomic::AtomicBool,
}

unsafe impl Send for ObjectPool {}
unsafe impl Sync for ObjectPool {}

impl ObjectPool {
    pub fn new(object_size: usize, capacity: usize) -> crate::error::Result<Self> {
        let object_size = object_size.max(8);
        let layout = Layout::from_size_align(object_size * capacity, 16)
            .map_err(|e| crate::error::TtakError::SystemFailure(format!("invalid pool layout: {e}")))?;
        let ptr = unsafe { System.alloc(layout) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| crate::error::TtakError::Unavailable("pool allocation failed".into()))?;
        let words = (capacity + 63) / 64;
        Ok(Self {
            base,
            object_size,
            capacity,
            layout,
            bitmap: (0..words).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            used: AtomicUsize::new(0),
            last_recycled: AtomicUsize::new(0),
            has_hint: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn try_claim(&self, idx: usize) -> bool {
        let word = idx / 64;
        let bit = 1u64 << (idx % 64);
        self.bitmap[word].fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    fn release_bit(&self, idx: usize) {
        let word = idx / 64;
        let bit = 1u64 << (idx % 64);
        self.bitmap[word].fetch_and(!bit, Ordering::AcqRel);
    }

    /// Tile-major scan order: within each 8×8 tile of slot indices, visit
    /// slots along ascending diagonals `(r + c) mod TILE`, mirroring the
    /// lattice board's Latin-square traversal so allocation bias spreads
    /// across tiles instead of clustering at low indices.
    fn tiled_order(&self) -> impl Iterator<Item = usize> + '_ {
        let tiles = (self.capacity + TILE * TILE - 1) / (TILE * TILE);
        (0..tiles).flat_map(move |tile| {
            let base = tile * TILE * TILE;
            (0..TILE).flat_map(move |diag| {
                (0..TILE).filter_map(move |r| {
                    let c = (diag + TILE - r % TILE) % TILE;
                    let idx = base + r * TILE + c;
                    Some(idx)
                })
            })
        })
    }

    pub fn allocate(&self) -> Option<NonNull<u8>> {
        if self.has_hint.swap(false, Ordering::AcqRel) {
            let idx = self.last_recycled.load(Ordering::Acquire);
            if idx < self.capacity && self.try_claim(idx) {
                self.used.fetch_add(1, Ordering::Relaxed);
                return Some(self.slot_ptr(idx));
            }
        }
        for idx in self.tiled_order() {
            if idx >= self.capacity {
                continue;
            }
            if self.try_claim(idx) {
                self.used.fetch_add(1, Ordering::Relaxed);
                return Some(self.slot_ptr(idx));
            }
        }
        None
    }

    fn slot_ptr(&self, idx: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx * self.object_size)) }
    }

    fn index_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.base.as_ptr() as usize;
        let p = ptr.as_ptr() as usize;
        if p < base {
            return None;
        }
        let offset = p - base;
        if offset % self.object_size != 0 {
            return None;
        }
        let idx = offset / self.object_size;
        (idx < self.capacity).then_some(idx)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> crate::error::Result<()> {
        let idx = self
            .index_of(ptr)
            .ok_or_else(|| crate::error::TtakError::InvalidArgument("pointer not from this pool".into()))?;
        self.release_bit(idx);
        self.used.fetch_sub(1, Ordering::Relaxed);
        self.last_recycled.store(idx, Ordering::Release);
        self.has_hint.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            capacity: self.capacity,
            in_use: self.used.load(Ordering::Relaxed),
            last_recycled: self.has_hint.load(Ordering::Acquire).then(|| self.last_recycled.load(Ordering::Acquire)),
        }
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        unsafe {
            System.dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_up_to_capacity_then_exhausts() {
        let pool = ObjectPool::new(32, 64).unwrap();
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            ptrs.push(pool.allocate().expect("capacity available"));
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.stats().in_use, 64);
    }

    #[test]
    fn recycle_hint_reuses_last_freed_slot() {
        let pool = ObjectPool::new(32, 8).unwrap();
        let p = pool.allocate().unwrap();
        pool.deallocate(p).unwrap();
        let p2 = pool.allocate().unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn rejects_foreign_pointer() {
        let pool = ObjectPool::new(32, 8).unwrap();
        let mut stray = 0u8;
        let ptr = NonNull::new(&mut stray as *mut u8).unwrap();
        assert!(pool.deallocate(ptr).is_err());
    }
}
