//! Recoverable failure modes.
//!
//! The original reports failure through `int` return codes, reserving
//! `assert()` for conditions it considers unrecoverable (a short AIO
//! completion, a failed `sigaction`, a failed context switch). This crate
//! keeps that split: everything here is a `Result`; everything the original
//! would have asserted on instead panics at the call site (see the
//! scheduler and aio modules), which combined with an abort-on-panic
//! profile in the host binary reproduces "the process terminates".

use errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OocError {
    #[error("a VMA already covers [{start:#x}, {end:#x})")]
    DuplicateVma { start: usize, end: usize },

    #[error("no registered VMA contains address {addr:#x}")]
    VmaNotFound { addr: usize },

    #[error("node allocator could not obtain a new block from the OS: {0}")]
    BlockAllocFailed(Errno),

    #[error("scheduler already initialized on this thread")]
    AlreadyInitialized,

    #[error("scheduler not initialized on this thread")]
    NotInitialized,

    #[error("sigaction installation failed: {0}")]
    SignalSetupFailed(Errno),

    #[error("asynchronous I/O submission failed: {0}")]
    AioSubmitFailed(Errno),

    #[error("address {addr:#x} is not page-aligned")]
    Misaligned { addr: usize },

    #[error("mincore failed while checking page residency: {0}")]
    ResidencyCheckFailed(Errno),
}

pub type Result<T> = core::result::Result<T, OocError>;
