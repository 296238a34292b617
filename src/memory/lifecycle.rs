//! Lifecycle allocator (C3): routes a request to the pocket, buddy, or
//! system tier by size, attaches an [`AllocHeader`], and drives expiry,
//! pinning, and the autoclean sweep.
//!
//! Grounded on the teacher's tiered routing in
//! `memory/allocator/mod.rs` (small → slab, medium → buddy, large →
//! mmap) and the mmap fallback in `large_object_allocator.rs`.

use super::buddy::{BuddyHandle, BuddyZone};
use super::common::*;
use super::header::{AllocHeader, HeaderFlags, Tier};
use super::pocket::PocketAllocator;
use super::pressure::PressureManager;
use crate::clock::Tick;
use crate::concurrent::epoch::EpochManager;
use crate::config::{AllocFlags, GcConfig, TtakConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const LARGE_OBJECT_THRESHOLD: usize = 256 * 1024;
const MMAP_ALIGN: usize = 64;

/// Opaque identity for a live lifecycle allocation; the only thing
/// callers hold onto, similar in spirit to `BuddyHandle` but covering
/// all three tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocId(u64);

enum Backing {
    Pocket { ptr: NonNull<u8>, size: usize },
    Buddy { handle: BuddyHandle },
    System { ptr: NonNull<u8>, size: usize, huge: bool },
}

struct Allocation {
    header: AllocHeader,
    backing: Backing,
}

unsafe impl Send for Allocation {}

/// Point-in-time snapshot of the allocator's bookkeeping (spec.md §6,
/// `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleStats {
    pub live_count: usize,
    pub sweep_interval_ns: u64,
    pub used_bytes: u64,
    pub pressure_level: super::common::PressureLevel,
}

/// The tiered allocator: owns a pocket tier, a buddy zone for medium
/// requests, and falls back to `mmap`/huge pages for large ones.
pub struct LifecycleAllocator {
    pocket: PocketAllocator,
    buddy: BuddyZone,
    epoch: Arc<EpochManager>,
    pressure: PressureManager,
    table: Mutex<HashMap<u64, Allocation>>,
    next_id: AtomicU64,
    config: TtakConfig,
}

impl LifecycleAllocator {
    pub fn new(config: TtakConfig, budget_bytes: u64, embedded: bool) -> Result<Self> {
        let buddy = BuddyZone::new(4 * 1024 * 1024, config.buddy_priority, embedded)?;
        Ok(Self {
            pocket: PocketAllocator::new(config.small_alloc_limit),
            buddy,
            epoch: EpochManager::new(),
            pressure: PressureManager::new(budget_bytes, config.gc),
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    fn allocate_backing(&self, size: usize, flags: AllocFlags) -> Result<(Backing, Tier)> {
        if self.pocket.handles(size) && !flags.contains(AllocFlags::HUGE_PAGES) {
            let ptr = self.pocket.alloc(size)?;
            return Ok((Backing::Pocket { ptr, size }, Tier::Pocket));
        }
        if size < LARGE_OBJECT_THRESHOLD {
            let handle = self.buddy.allocate(size)?;
            return Ok((Backing::Buddy { handle }, Tier::Buddy));
        }
        let (ptr, huge) = self.system_alloc(size, flags.contains(AllocFlags::HUGE_PAGES))?;
        Ok((Backing::System { ptr, size, huge }, Tier::System))
    }

    #[cfg(unix)]
    fn system_alloc(&self, size: usize, want_huge: bool) -> Result<(NonNull<u8>, bool)> {
        unsafe {
            let mut map_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            let mut huge = false;
            if want_huge && size >= 2 * 1024 * 1024 {
                map_flags |= libc::MAP_HUGETLB;
                huge = true;
            }
            let mut ptr = libc::mmap(std::ptr::null_mut(), size, libc::PROT_READ | libc::PROT_WRITE, map_flags, -1, 0);
            if ptr == libc::MAP_FAILED && huge {
                huge = false;
                ptr = libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
            }
            if ptr == libc::MAP_FAILED {
                return Err(TtakError::SystemFailure("mmap failed".into()));
            }
            libc::madvise(ptr, size, libc::MADV_RANDOM);
            Ok((NonNull::new_unchecked(ptr as *mut u8), huge))
        }
    }

    #[cfg(not(unix))]
    fn system_alloc(&self, size: usize, _want_huge: bool) -> Result<(NonNull<u8>, bool)> {
        let layout = Layout::from_size_align(size, MMAP_ALIGN)
            .map_err(|e| TtakError::SystemFailure(format!("invalid layout: {e}")))?;
        // spec.md §4.1 requires zeroed payload memory; the unix mmap path
        // gets this for free from fresh anonymous pages.
        let ptr = unsafe { System.alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|p| (p, false))
            .ok_or_else(|| TtakError::Unavailable("system allocation failed".into()))
    }

    /// Allocate `size` bytes with the given flags, routed to the
    /// appropriate tier (spec.md §4.1, `alloc`).
    pub fn alloc(&self, size: usize, ttl_ticks: Option<u64>, flags: AllocFlags, now: Tick) -> Result<AllocId> {
        if size == 0 {
            return Err(TtakError::InvalidArgument("size must be nonzero".into()));
        }
        let (backing, tier) = self.allocate_backing(size, flags)?;
        let mut header_flags = HeaderFlags::empty();
        if flags.contains(AllocFlags::STRICT_CHECK) {
            header_flags |= HeaderFlags::STRICT;
        }
        if flags.contains(AllocFlags::HUGE_PAGES) {
            header_flags |= HeaderFlags::HUGE;
        }
        let header = AllocHeader::new(size, now, ttl_ticks, header_flags, tier);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pressure.record_alloc(size as u64);
        self.table.lock().insert(id, Allocation { header, backing });
        tracing::trace!(alloc_id = id, size, tier = ?tier, "allocated");
        Ok(AllocId(id))
    }

    /// Validate and touch an allocation, returning its current size
    /// (spec.md §4.1, `access`).
    pub fn access(&self, id: AllocId, now: Tick) -> Result<usize> {
        let table = self.table.lock();
        let alloc = table.get(&id.0).ok_or(TtakError::Expired)?;
        alloc.header.verify()?;
        if alloc.header.is_expired(now) {
            return Err(TtakError::Expired);
        }
        alloc.header.touch(now);
        Ok(alloc.header.size)
    }

    /// Pointer resolution for the allocation's backing storage. Callers
    /// must hold a valid `access` result for `id` to use this safely.
    pub fn resolve(&self, id: AllocId) -> Result<NonNull<u8>> {
        let table = self.table.lock();
        let alloc = table.get(&id.0).ok_or(TtakError::Expired)?;
        match &alloc.backing {
            Backing::Pocket { ptr, .. } => Ok(*ptr),
            Backing::System { ptr, .. } => Ok(*ptr),
            Backing::Buddy { handle } => self
                .buddy
                .resolve(*handle)
                .ok_or_else(|| TtakError::Internal("dangling buddy handle".into())),
        }
    }

    /// Create a second handle sharing the same backing, bumping the pin
    /// count so the underlying storage can't be freed while duplicated
    /// (spec.md §4.1, `dup`).
    pub fn dup(&self, id: AllocId) -> Result<()> {
        let table = self.table.lock();
        let alloc = table.get(&id.0).ok_or(TtakError::Expired)?;
        alloc.header.pin();
        Ok(())
    }

    /// Free an allocation, routing the backing storage's release through
    /// the tier it came from (spec.md §4.1, `free`).
    pub fn free(&self, id: AllocId) -> Result<()> {
        let mut table = self.table.lock();
        let alloc = table.get(&id.0).ok_or(TtakError::Expired)?;
        if alloc.header.is_pinned() {
            return Err(TtakError::Denied(crate::error::DeniedCode::Invalid));
        }
        alloc.header.mark_freed()?;
        let alloc = table.remove(&id.0).unwrap();
        self.pressure.record_free(alloc.header.size as u64);
        match alloc.backing {
            Backing::Pocket { ptr, size } => self.pocket.free(ptr, size),
            Backing::Buddy { handle } => self.buddy.free(handle, &self.epoch),
            Backing::System { ptr, size, .. } => self.system_free(ptr, size),
        }
        tracing::trace!(alloc_id = id.0, "freed");
        Ok(())
    }

    #[cfg(unix)]
    fn system_free(&self, ptr: NonNull<u8>, size: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
        }
    }

    #[cfg(not(unix))]
    fn system_free(&self, ptr: NonNull<u8>, size: usize) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, MMAP_ALIGN);
            System.dealloc(ptr.as_ptr(), layout);
        }
    }

    /// Report whether an allocation's header still checksums cleanly and
    /// is within its TTL, without touching its access counter (spec.md
    /// §4.1, `inspect_dirty`).
    pub fn inspect_dirty(&self, id: AllocId, now: Tick) -> Result<bool> {
        let table = self.table.lock();
        let alloc = table.get(&id.0).ok_or(TtakError::Expired)?;
        alloc.header.verify()?;
        Ok(alloc.header.is_expired(now))
    }

    /// Sweep expired, unpinned allocations. Returns the number freed
    /// (spec.md §4.1, `autoclean`).
    pub fn autoclean(&self, now: Tick) -> usize {
        let expired: Vec<AllocId> = {
            let table = self.table.lock();
            table
                .iter()
                .filter(|(_, a)| a.header.is_expired(now) && !a.header.is_pinned())
                .map(|(id, _)| AllocId(*id))
                .collect()
        };
        let mut freed = 0;
        for id in expired {
            if self.free(id).is_ok() {
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::debug!(freed, "autoclean swept expired allocations");
        }
        freed
    }

    pub fn configure_gc(&self, config: GcConfig) {
        self.pressure.reconfigure(config);
    }

    pub fn sweep_interval_ns(&self) -> u64 {
        self.pressure.sweep_interval_ns()
    }

    pub fn live_count(&self) -> usize {
        self.table.lock().len()
    }

    pub fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            live_count: self.live_count(),
            sweep_interval_ns: self.pressure.sweep_interval_ns(),
            used_bytes: self.pressure.used_bytes(),
            pressure_level: self.pressure.level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> LifecycleAllocator {
        LifecycleAllocator::new(TtakConfig::default(), 16 * 1024 * 1024, false).unwrap()
    }

    #[test]
    fn alloc_access_free_round_trip() {
        let a = allocator();
        let id = a.alloc(128, Some(100), AllocFlags::STRICT_CHECK, 0).unwrap();
        assert_eq!(a.access(id, 50).unwrap(), 128);
        a.free(id).unwrap();
        assert!(a.access(id, 50).is_err());
    }

    #[test]
    fn expired_allocation_autocleans() {
        let a = allocator();
        let id = a.alloc(64, Some(100), AllocFlags::empty(), 0).unwrap();
        assert_eq!(a.autoclean(50), 0);
        let freed = a.autoclean(200);
        assert_eq!(freed, 1);
        assert!(a.access(id, 200).is_err());
    }

    #[test]
    fn pinned_allocation_survives_sweep() {
        let a = allocator();
        let id = a.alloc(64, Some(10), AllocFlags::empty(), 0).unwrap();
        a.dup(id).unwrap();
        assert_eq!(a.autoclean(100), 0);
        assert_eq!(a.live_count(), 1);
    }

    #[test]
    fn large_request_routes_to_system_tier() {
        let a = allocator();
        let id = a.alloc(LARGE_OBJECT_THRESHOLD + 1, None, AllocFlags::empty(), 0).unwrap();
        assert!(a.resolve(id).is_ok());
        a.free(id).unwrap();
    }

    #[test]
    fn zero_size_rejected() {
        let a = allocator();
        assert!(a.alloc(0, None, AllocFlags::empty(), 0).is_err());
    }

    #[test]
    fn stats_reflect_live_allocations() {
        let a = allocator();
        a.alloc(128, None, AllocFlags::empty(), 0).unwrap();
        let stats = a.stats();
        assert_eq!(stats.live_count, 1);
        assert_eq!(stats.used_bytes, 128);
    }
}
