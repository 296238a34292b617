//! Owner-gated shared container (C6): an atomic payload pointer whose
//! swaps retire the old payload through epoch reclamation, gated by a
//! per-container security level and a dynamic owner mask.
//!
//! Grounded on the teacher's `concurrent/hazard.rs` retire-on-swap
//! discipline (old value stays reachable to in-flight readers until
//! reclamation runs) combined with `concurrent/epoch.rs`'s
//! `Atomic<T>`/`Shared<T>` wrapper style, using this crate's own
//! [`EpochManager`](super::epoch::EpochManager) instead of a global
//! singleton.

use super::epoch::EpochManager;
use super::owner_mask::OwnerMask;
use crate::clock::now_ns;
use crate::config::SharedLevel;
use crate::error::{DeniedCode, Result, TtakError};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of a shared container (spec.md §3, Shared Container).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SharedStatus {
    Ready = 0,
    Dirty = 1,
    Expired = 2,
    Zombie = 3,
    Readonly = 4,
    Ebr = 5,
    Swapping = 6,
}

impl SharedStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Dirty,
            2 => Self::Expired,
            3 => Self::Zombie,
            4 => Self::Readonly,
            5 => Self::Ebr,
            _ => Self::Swapping,
        }
    }
}

const MAX_TRACKED_OWNERS: usize = 256;

/// Owner-gated container sharing a payload of type `T` across threads,
/// with an epoch manager responsible for safely reclaiming displaced
/// payloads.
pub struct SharedContainer<T> {
    payload: AtomicPtr<T>,
    payload_timestamp: AtomicU64,
    status: AtomicU8,
    level: SharedLevel,
    owners: OwnerMask,
    last_sync: Vec<AtomicU64>,
    epoch: Arc<EpochManager>,
}

/// Point-in-time snapshot of a container's bookkeeping (spec.md §6,
/// `stats`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedStats {
    pub status: SharedStatus,
    pub level: SharedLevel,
    pub owner_count: usize,
    pub payload_timestamp: u64,
}

unsafe impl<T: Send> Send for SharedContainer<T> {}
unsafe impl<T: Send + Sync> Sync for SharedContainer<T> {}

impl<T> SharedContainer<T> {
    /// Allocate a new container holding `initial`, at the given security
    /// level, reclaiming through `epoch`.
    pub fn allocate(initial: T, level: SharedLevel, epoch: Arc<EpochManager>) -> Self {
        let boxed = Box::into_raw(Box::new(initial));
        Self {
            payload: AtomicPtr::new(boxed),
            payload_timestamp: AtomicU64::new(now_ns()),
            status: AtomicU8::new(SharedStatus::Ready as u8),
            level,
            owners: OwnerMask::new(),
            last_sync: (0..MAX_TRACKED_OWNERS).map(|_| AtomicU64::new(0)).collect(),
            epoch,
        }
    }

    pub fn status(&self) -> SharedStatus {
        SharedStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SharedStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Register `owner` as permitted to access this container, subject to
    /// the container's security level (spec.md §4.3, `add_owner`).
    pub fn add_owner(&self, owner: u32, claimant_level: SharedLevel) -> Result<()> {
        if claimant_level < self.level {
            return Err(TtakError::Denied(DeniedCode::ShareDenied));
        }
        if self.owners.count() >= MAX_TRACKED_OWNERS {
            return Err(TtakError::Denied(DeniedCode::CapExhausted));
        }
        self.owners.set(owner);
        self.note_sync(owner, self.payload_timestamp.load(Ordering::Acquire));
        Ok(())
    }

    /// Revoke `owner`. Dropping the last owner of a gated container
    /// (spec.md §4.3) retires it: nothing can claim access to a
    /// level-bearing container once nobody is registered to hold it.
    pub fn revoke_owner(&self, owner: u32) {
        self.owners.clear(owner);
        if self.level > SharedLevel::NoLevel && self.owners.count() == 0 {
            self.set_status(SharedStatus::Zombie);
        }
    }

    pub fn is_owner(&self, owner: u32) -> bool {
        self.owners.test(owner)
    }

    /// Read-only access to the current payload, gated by ownership and
    /// container state (spec.md §4.3, `access`).
    pub fn access(&self, owner: u32) -> Result<&T> {
        self.guard_access(owner)?;
        let ptr = self.payload.load(Ordering::Acquire);
        // SAFETY: the pointer is only ever freed through `retire`, which
        // defers reclamation until the epoch manager guarantees no
        // concurrent reader holds a reference obtained here.
        Ok(unsafe { &*ptr })
    }

    /// Access under an explicit epoch pin, for callers that need the
    /// reference to remain valid across a longer critical section
    /// (spec.md §4.3, `access_ebr` / `release_ebr`).
    pub fn access_ebr(&self, owner: u32) -> Result<&T> {
        self.guard_access(owner)?;
        self.epoch.enter();
        let ptr = self.payload.load(Ordering::Acquire);
        Ok(unsafe { &*ptr })
    }

    pub fn release_ebr(&self) {
        self.epoch.exit();
    }

    fn guard_access(&self, owner: u32) -> Result<()> {
        match self.status() {
            SharedStatus::Zombie => return Err(TtakError::Expired),
            SharedStatus::Expired => return Err(TtakError::Expired),
            SharedStatus::Swapping => return Err(TtakError::NeedsRetry),
            _ => {}
        }
        if self.level > SharedLevel::NoLevel && !self.owners.test(owner) {
            return Err(TtakError::Denied(DeniedCode::Invalid));
        }
        if self.level >= SharedLevel::Level2 {
            let synced = self.last_sync(owner).unwrap_or(0);
            if synced < self.payload_timestamp.load(Ordering::Acquire) {
                return Err(TtakError::NeedsRetry);
            }
        }
        Ok(())
    }

    /// Atomically replace the payload, retiring the previous value
    /// through the epoch manager rather than freeing it immediately
    /// (spec.md §4.3, `swap_ebr`).
    pub fn swap_ebr(&self, owner: u32, new_value: T) -> Result<()> {
        self.guard_access(owner)?;
        if self.status() == SharedStatus::Readonly {
            return Err(TtakError::Denied(DeniedCode::Invalid));
        }
        self.set_status(SharedStatus::Swapping);
        let new_ptr = Box::into_raw(Box::new(new_value));
        let old_ptr = self.payload.swap(new_ptr, Ordering::AcqRel);
        self.payload_timestamp.store(now_ns(), Ordering::Release);
        self.epoch.retire(Box::new(move || unsafe {
            drop(Box::from_raw(old_ptr));
        }));
        // Stays Dirty until `sync_all` brings every owner's last-sync
        // timestamp forward; Level 2/3 access is denied in the meantime.
        self.set_status(SharedStatus::Dirty);
        Ok(())
    }

    /// Record that `owner` has observed the current payload as of `tick`.
    pub fn note_sync(&self, owner: u32, tick: u64) {
        if let Some(slot) = self.last_sync.get(owner as usize) {
            slot.store(tick, Ordering::Release);
        }
    }

    pub fn last_sync(&self, owner: u32) -> Option<u64> {
        self.last_sync.get(owner as usize).map(|s| s.load(Ordering::Acquire))
    }

    /// Bring every registered owner's last-sync timestamp up to the
    /// payload's current timestamp and transition Dirty back to Ready
    /// (spec.md §4.3, `sync_all`).
    pub fn sync_all(&self) {
        let stamp = self.payload_timestamp.load(Ordering::Acquire);
        for owner in self.owners.iter_owners() {
            self.note_sync(owner, stamp);
        }
        if self.status() == SharedStatus::Dirty {
            self.set_status(SharedStatus::Ready);
        }
    }

    /// Snapshot of this container's bookkeeping (spec.md §6, `stats`).
    pub fn stats(&self) -> SharedStats {
        SharedStats {
            status: self.status(),
            level: self.level,
            owner_count: self.owners.count(),
            payload_timestamp: self.payload_timestamp.load(Ordering::Acquire),
        }
    }

    pub fn mark_readonly(&self) {
        self.set_status(SharedStatus::Readonly);
    }

    pub fn expire(&self) {
        self.set_status(SharedStatus::Expired);
    }

    /// Retire the container itself: transitions to Zombie and defers
    /// the payload's final drop through the epoch manager (spec.md §4.3,
    /// `retire`).
    pub fn retire(self) {
        self.set_status(SharedStatus::Zombie);
        let ptr = self.payload.load(Ordering::Acquire);
        let epoch = self.epoch.clone();
        epoch.retire(Box::new(move || unsafe {
            drop(Box::from_raw(ptr));
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_gating_denies_unregistered_caller() {
        let epoch = EpochManager::new();
        let c = SharedContainer::allocate(42u32, SharedLevel::Level1, epoch);
        assert!(c.access(1).is_err());
        c.add_owner(1, SharedLevel::Level2).unwrap();
        assert_eq!(*c.access(1).unwrap(), 42);
    }

    #[test]
    fn add_owner_respects_level() {
        let epoch = EpochManager::new();
        let c = SharedContainer::allocate(1u32, SharedLevel::Level2, epoch);
        assert!(matches!(
            c.add_owner(1, SharedLevel::Level1),
            Err(TtakError::Denied(DeniedCode::ShareDenied))
        ));
    }

    #[test]
    fn swap_retires_old_payload_through_epoch() {
        let epoch = EpochManager::new();
        epoch.register();
        let c = SharedContainer::allocate(1u32, SharedLevel::NoLevel, epoch.clone());
        c.swap_ebr(0, 2).unwrap();
        assert_eq!(*c.access(0).unwrap(), 2);
        for _ in 0..8 {
            epoch.reclaim();
        }
    }

    #[test]
    fn expired_container_denies_access() {
        let epoch = EpochManager::new();
        let c = SharedContainer::allocate(1u32, SharedLevel::NoLevel, epoch);
        c.expire();
        assert!(matches!(c.access(0), Err(TtakError::Expired)));
    }

    #[test]
    fn level2_access_denied_until_sync_all() {
        let epoch = EpochManager::new();
        epoch.register();
        let c = SharedContainer::allocate(1u32, SharedLevel::Level2, epoch);
        c.add_owner(7, SharedLevel::Level2).unwrap();
        assert_eq!(*c.access(7).unwrap(), 1);

        c.swap_ebr(7, 2).unwrap();
        assert_eq!(c.status(), SharedStatus::Dirty);
        assert!(matches!(c.access(7), Err(TtakError::NeedsRetry)));

        c.sync_all();
        assert_eq!(c.status(), SharedStatus::Ready);
        assert_eq!(*c.access(7).unwrap(), 2);
    }

    #[test]
    fn revoking_last_owner_of_gated_container_zombifies_it() {
        let epoch = EpochManager::new();
        let c = SharedContainer::allocate(1u32, SharedLevel::Level1, epoch);
        c.add_owner(3, SharedLevel::Level1).unwrap();
        assert_eq!(*c.access(3).unwrap(), 1);

        c.revoke_owner(3);
        assert_eq!(c.status(), SharedStatus::Zombie);
        assert!(matches!(c.access(3), Err(TtakError::Expired)));
    }

    #[test]
    fn stats_report_owner_count_and_status() {
        let epoch = EpochManager::new();
        let c = SharedContainer::allocate(1u32, SharedLevel::Level1, epoch);
        c.add_owner(1, SharedLevel::Level1).unwrap();
        c.add_owner(2, SharedLevel::Level1).unwrap();
        let stats = c.stats();
        assert_eq!(stats.owner_count, 2);
        assert_eq!(stats.status, SharedStatus::Ready);
        assert_eq!(stats.level, SharedLevel::Level1);
    }
}
