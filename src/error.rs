//! Error types for the libttak core.
//!
//! Mirrors the teacher's flat, one-variant-per-failure-family `thiserror`
//! enum (see `rusty-db`'s `src/error.rs`), narrowed to the kinds spec.md §7
//! enumerates for this crate.

use thiserror::Error;

/// Denial reason for owner-gated access failures (spec.md §7, Denied family).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeniedCode {
    #[error("metadata checksum or canary corrupted")]
    Corrupted,
    #[error("claimant failed validation")]
    Invalid,
    #[error("security level denied this claimant")]
    ShareDenied,
    #[error("owner capacity exhausted")]
    CapExhausted,
}

#[derive(Error, Debug)]
pub enum TtakError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("expired")]
    Expired,

    #[error("access denied: {0}")]
    Denied(DeniedCode),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("system failure: {0}")]
    SystemFailure(String),

    #[error("needs retry")]
    NeedsRetry,

    #[error("allocator metadata corrupted: {0}")]
    Arithmetic(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TtakError>;
