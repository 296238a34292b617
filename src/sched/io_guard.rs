//! IO guard (C10): a TTL-gated wrapper around a raw OS file descriptor,
//! with staged-buffer retry loops for read/write and an inline/async
//! `poll_wait`.
//!
//! Grounded on `io/file_manager.rs`'s `FileHandle`/`ReadOptions`/
//! `WriteOptions` vocabulary, generalized into a single guard object
//! that tracks its own expiry instead of routing every call through a
//! central file manager.

use crate::clock::Tick;
use crate::error::{Result, TtakError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(unix)]
use std::os::unix::io::RawFd;

const STAGE_BUFFER_SIZE: usize = 64 * 1024;
const MAX_RETRIES: u32 = 8;

/// Tag describing what kind of resource an `IoGuard` wraps, for
/// diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceTag {
    File,
    Socket,
    Pipe,
}

pub struct IoGuard {
    #[cfg(unix)]
    fd: RawFd,
    owner: u32,
    ttl_ticks: u64,
    created_tick: Tick,
    expires_tick: AtomicU64,
    last_used_tick: AtomicU64,
    closed: AtomicBool,
    tag: ResourceTag,
}

impl IoGuard {
    #[cfg(unix)]
    pub fn new(fd: RawFd, owner: u32, ttl_ticks: u64, now: Tick, tag: ResourceTag) -> Self {
        Self {
            fd,
            owner,
            ttl_ticks,
            created_tick: now,
            expires_tick: AtomicU64::new(now.saturating_add(ttl_ticks)),
            last_used_tick: AtomicU64::new(now),
            closed: AtomicBool::new(false),
            tag,
        }
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn tag(&self) -> ResourceTag {
        self.tag
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check the guard hasn't expired or been closed (spec.md §4.6,
    /// `valid`).
    pub fn valid(&self, now: Tick) -> bool {
        !self.is_closed() && now <= self.expires_tick.load(Ordering::Acquire)
    }

    /// Push the expiry out by the configured TTL from `now` (spec.md
    /// §4.6, `refresh`).
    pub fn refresh(&self, now: Tick) -> Result<()> {
        if self.is_closed() {
            return Err(TtakError::Expired);
        }
        self.expires_tick.store(now.saturating_add(self.ttl_ticks), Ordering::Release);
        self.last_used_tick.store(now, Ordering::Release);
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        #[cfg(unix)]
        unsafe {
            libc::close(self.fd);
        }
    }

    pub fn last_used(&self) -> Tick {
        self.last_used_tick.load(Ordering::Acquire)
    }

    /// Staged-buffer read loop: reads in `STAGE_BUFFER_SIZE` chunks,
    /// retrying short reads up to `MAX_RETRIES` times before giving up
    /// (spec.md §4.6, read retry discipline).
    #[cfg(unix)]
    pub fn read_staged(&self, now: Tick, total_len: usize) -> Result<Vec<u8>> {
        if !self.valid(now) {
            return Err(TtakError::Expired);
        }
        let mut out = Vec::with_capacity(total_len);
        let mut stage = vec![0u8; STAGE_BUFFER_SIZE.min(total_len.max(1))];
        let mut retries = 0u32;
        while out.len() < total_len {
            let want = stage.len().min(total_len - out.len());
            let n = unsafe { libc::read(self.fd, stage.as_mut_ptr() as *mut libc::c_void, want) };
            if n < 0 {
                return Err(TtakError::SystemFailure("read failed".into()));
            }
            if n == 0 {
                retries += 1;
                if retries >= MAX_RETRIES {
                    return Err(TtakError::NeedsRetry);
                }
                continue;
            }
            out.extend_from_slice(&stage[..n as usize]);
            retries = 0;
        }
        self.last_used_tick.store(now, Ordering::Release);
        Ok(out)
    }

    /// Staged-buffer write loop: writes in chunks, retrying partial
    /// writes (spec.md §4.6, write retry discipline).
    #[cfg(unix)]
    pub fn write_staged(&self, now: Tick, data: &[u8]) -> Result<usize> {
        if !self.valid(now) {
            return Err(TtakError::Expired);
        }
        let mut written = 0;
        let mut retries = 0u32;
        while written < data.len() {
            let chunk = &data[written..(written + STAGE_BUFFER_SIZE).min(data.len())];
            let n = unsafe { libc::write(self.fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };
            if n < 0 {
                return Err(TtakError::SystemFailure("write failed".into()));
            }
            if n == 0 {
                retries += 1;
                if retries >= MAX_RETRIES {
                    return Err(TtakError::NeedsRetry);
                }
                continue;
            }
            written += n as usize;
            retries = 0;
        }
        self.last_used_tick.store(now, Ordering::Release);
        Ok(written)
    }

    /// Inline poll: returns immediately with whether the descriptor is
    /// readable/writable within `timeout_ms` (spec.md §4.6, `poll_wait`).
    #[cfg(unix)]
    pub fn poll_wait(&self, timeout_ms: i32) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLOUT,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd as *mut libc::pollfd, 1, timeout_ms) };
        if rc < 0 {
            return Err(TtakError::SystemFailure("poll failed".into()));
        }
        Ok(rc > 0)
    }
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn pipe_fds() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        (fds[0], fds[1])
    }

    #[test]
    #[cfg(unix)]
    fn ttl_expiry_denies_access() {
        let (r, _w) = pipe_fds();
        let guard = IoGuard::new(r, 1, 10, 0, ResourceTag::Pipe);
        assert!(guard.valid(5));
        assert!(!guard.valid(20));
    }

    #[test]
    #[cfg(unix)]
    fn refresh_extends_ttl() {
        let (r, _w) = pipe_fds();
        let guard = IoGuard::new(r, 1, 10, 0, ResourceTag::Pipe);
        guard.refresh(5).unwrap();
        assert!(guard.valid(12));
    }

    #[test]
    #[cfg(unix)]
    fn closed_guard_is_invalid() {
        let (r, _w) = pipe_fds();
        let guard = IoGuard::new(r, 1, 100, 0, ResourceTag::Pipe);
        guard.close();
        assert!(!guard.valid(1));
    }
}
