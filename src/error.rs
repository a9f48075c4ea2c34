//! Crate-wide error taxonomy.
//!
//! Error kinds mirror the severity classes a worker loop must distinguish:
//! setup failures abort bring-up, alignment violations are recovered locally,
//! transient I/O errors are logged and skipped, and protocol violations are
//! fatal for the whole plan. See `SPEC_FULL.md` §4.9.

use std::io;

/// Outcome of a single scheduled operation.
#[derive(Debug)]
pub enum OpOutcome {
    /// The operation completed and advanced `current_op`.
    Completed,
    /// A transient error occurred; `current_op` still advances but
    /// `last_committed_*` was not updated for this operation.
    SkippedTransientError,
    /// A fatal error occurred; the caller must latch `Plan::abort` and drain.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File open, buffer allocation, restart-file creation, mutex init.
    #[error("setup failed for target {target}: {source}")]
    Setup {
        target: u32,
        #[source]
        source: io::Error,
    },

    /// DIO alignment could not be satisfied and the reopen without DIO itself failed.
    #[error("target {target}: reopen without direct I/O failed: {source}")]
    AlignmentReopen {
        target: u32,
        #[source]
        source: io::Error,
    },

    /// A single read/write syscall returned a non-zero status. Not fatal.
    #[error("target {target} worker {worker} op {op}: transient I/O error: {source}")]
    TransientIo {
        target: u32,
        worker: u32,
        op: u64,
        #[source]
        source: io::Error,
    },

    /// E2E sequence mismatch, malformed target buffer, or closed connection
    /// mid-transfer. Fatal for the worker and latches `plan.abort`.
    #[error("target {target} worker {worker}: protocol violation: {reason}")]
    Protocol {
        target: u32,
        worker: u32,
        reason: String,
    },

    /// Restart file I/O failure. Logged, not fatal.
    #[error("restart checkpoint for target {target} failed: {source}")]
    Restart {
        target: u32,
        #[source]
        source: io::Error,
    },

    /// Cleanup-path failure (close, disconnect). Logged, best-effort.
    #[error("cleanup step '{step}' for target {target} failed: {source}")]
    Cleanup {
        target: u32,
        step: &'static str,
        #[source]
        source: io::Error,
    },

    /// The lockstep collaborator ordered early termination.
    #[error("target {target} worker {worker}: lockstep requested termination")]
    LockstepTerminate { target: u32, worker: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
