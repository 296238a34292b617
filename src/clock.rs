//! Tick clock (C1): monotonic millisecond/nanosecond counter, the single
//! source of "now" for every operation that takes a timestamp.
//!
//! Grounded on the teacher's use of `std::time::Instant` as the basis for
//! all age/TTL computations throughout `memory/allocator` and `buffer`.

use once_cell::sync::OnceCell;
use std::time::Instant;

/// Unsigned monotonic tick. Never decreases during a process lifetime.
pub type Tick = u64;

/// Sentinel lifetime meaning "never expires".
pub const NEVER: Tick = u64::MAX;

fn epoch_instant() -> &'static Instant {
    static START: OnceCell<Instant> = OnceCell::new();
    START.get_or_init(Instant::now)
}

/// Monotonic millisecond clock, shared process-wide.
pub fn now_ms() -> Tick {
    epoch_instant().elapsed().as_millis() as Tick
}

/// Monotonic nanosecond clock, for operations needing finer resolution.
pub fn now_ns() -> Tick {
    epoch_instant().elapsed().as_nanos() as Tick
}

/// Collaborator contract: a source of "now". Lets callers substitute a fake
/// clock in tests without touching the real monotonic counter.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Tick;
    fn now_ns(&self) -> Tick;
}

/// The default, process-wide monotonic clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Tick {
        now_ms()
    }

    fn now_ns(&self) -> Tick {
        now_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_never_decrease() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn ns_resolution_finer_or_equal() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
