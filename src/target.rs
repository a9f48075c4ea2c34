//! Target Controller (C7, §3 "Target", §4.6): owns a target's file handle,
//! buffer pool, seek plans, optional E2E/restart state, and cleanup.

use crate::buffer::BufferPool;
use crate::clock::{OpKind, TimestampTable};
use crate::error::{Error, Result};
use crate::gates::Throttle;
use crate::net::{E2eState, Transport};
use crate::raw::RawSideband;
use crate::restart::RestartState;
use crate::seek::SeekPlan;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

bitflags::bitflags! {
    /// Notable target option bits (§3 "Target").
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TargetOptions: u32 {
        const DIO             = 1 << 0;
        const SGIO            = 1 << 1;
        const DELETEFILE       = 1 << 2;
        const ENDTOEND         = 1 << 3;
        const E2E_SOURCE       = 1 << 4;
        const E2E_DESTINATION  = 1 << 5;
        const WAITFORSTART     = 1 << 6;
        const RAW              = 1 << 7;
        const RAW_READER       = 1 << 8;
        const RESTART_ENABLE   = 1 << 9;
        const TS_ON            = 1 << 10;
    }
}

/// How a RAW (read-after-write) reader waits for writer-produced data
/// (§4.1 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMode {
    /// Poll the file's size via `fstat`.
    Stat,
    /// Receive sequenced `{location, length, sequence}` notices over a
    /// sideband channel.
    Sideband,
}

/// Immutable, fully materialized description of one target, built by
/// [`crate::plan::PlanBuilder`] or (behind the `config` feature) deserialized
/// configuration.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub target_number: u32,
    pub full_pathname: PathBuf,
    pub options: TargetOptions,
    pub block_size: u64,
    pub xfer_size: u64,
    pub operations_per_worker: u64,
    pub worker_count: u32,
    pub buffer_count: usize,
    pub op_kind: OpKind,
    pub throttle: Throttle,
    pub raw_mode: Option<RawMode>,
    pub timestamp_capacity: usize,
}

impl TargetSpec {
    /// Per-worker seek plan: blocks are interleaved round-robin across the
    /// target's worker pool (see `seek::SeekPlan::striped`).
    pub fn seek_plan_for_worker(&self, worker_number: u32) -> SeekPlan {
        SeekPlan::striped(
            self.operations_per_worker,
            self.worker_count as u64,
            worker_number as u64,
            self.op_kind,
        )
    }
}

fn open_target_file(spec: &TargetSpec) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    apply_direct_io(&mut options, spec.options.contains(TargetOptions::DIO));
    options.open(&spec.full_pathname).map_err(|source| Error::Setup {
        target: spec.target_number,
        source,
    })
}

#[cfg(unix)]
fn apply_direct_io(options: &mut OpenOptions, dio: bool) {
    use std::os::unix::fs::OpenOptionsExt;
    if dio {
        options.custom_flags(libc::O_DIRECT);
    }
}

#[cfg(windows)]
fn apply_direct_io(options: &mut OpenOptions, dio: bool) {
    use std::os::windows::fs::OpenOptionsExt;
    use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_NO_BUFFERING;
    if dio {
        options.custom_flags(FILE_FLAG_NO_BUFFERING);
    }
}

#[cfg(not(any(unix, windows)))]
fn apply_direct_io(_options: &mut OpenOptions, _dio: bool) {}

fn remove_target_file(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::remove_file(path)
}

/// State shared by a target's file handle, buffer pool, seek plans, and
/// (if applicable) its E2E/restart state; cloned into `Arc` for every
/// worker thread.
pub struct TargetShared<T: Transport> {
    pub spec: TargetSpec,
    pub buffer_pool: BufferPool,
    pub timestamps: TimestampTable,
    pub file: Mutex<File>,
    pub dio_active: AtomicBool,
    pub e2e: Option<E2eState<T>>,
    pub restart: Option<Arc<RestartState>>,
    pub start_barrier: Option<Arc<crate::barrier::Barrier>>,
    pub error_break: AtomicBool,
    /// Set on both sides of a RAW sideband pair: `Some` on the writer means
    /// "notify after every write"; `Some` with `raw_mode == Sideband` on the
    /// reader means "wait on this instead of polling file size".
    pub raw_sideband: Option<Arc<RawSideband>>,
}

impl<T: Transport> TargetShared<T> {
    pub fn open(
        spec: TargetSpec,
        e2e: Option<E2eState<T>>,
        restart: Option<Arc<RestartState>>,
        start_barrier: Option<Arc<crate::barrier::Barrier>>,
    ) -> Result<Self> {
        Self::open_with_raw_sideband(spec, e2e, restart, start_barrier, None)
    }

    pub fn open_with_raw_sideband(
        spec: TargetSpec,
        e2e: Option<E2eState<T>>,
        restart: Option<Arc<RestartState>>,
        start_barrier: Option<Arc<crate::barrier::Barrier>>,
        raw_sideband: Option<Arc<RawSideband>>,
    ) -> Result<Self> {
        let file = open_target_file(&spec)?;
        let buffer_pool = BufferPool::new(spec.buffer_count, spec.xfer_size as usize).map_err(|source| {
            Error::Setup {
                target: spec.target_number,
                source,
            }
        })?;
        let timestamps = TimestampTable::new(spec.timestamp_capacity);
        let dio_active = AtomicBool::new(spec.options.contains(TargetOptions::DIO));

        Ok(TargetShared {
            spec,
            buffer_pool,
            timestamps,
            file: Mutex::new(file),
            dio_active,
            e2e,
            restart,
            start_barrier,
            error_break: AtomicBool::new(false),
            raw_sideband,
        })
    }

    pub fn target_number(&self) -> u32 {
        self.spec.target_number
    }

    pub fn mark_error_break(&self) {
        self.error_break.store(true, Ordering::SeqCst);
    }

    pub fn has_error_break(&self) -> bool {
        self.error_break.load(Ordering::SeqCst)
    }

    /// Reopen the file with or without direct I/O, per §4.1 step 5. On
    /// failure, the caller is responsible for latching `plan.abort`.
    pub fn reopen_with_dio(&self, dio: bool) -> Result<()> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        apply_direct_io(&mut options, dio);
        let file = options.open(&self.spec.full_pathname).map_err(|source| Error::AlignmentReopen {
            target: self.spec.target_number,
            source,
        })?;
        *self.file.lock().expect("file lock poisoned") = file;
        self.dio_active.store(dio, Ordering::SeqCst);
        log::warn!(
            "target {}: reopened without direct I/O (alignment violation)",
            self.spec.target_number
        );
        Ok(())
    }

    /// Cleanup order (§4.6): delete file if requested, disconnect E2E,
    /// free buffers, close the handle (E2E handles are owned by the
    /// transport and not closed twice here).
    pub fn cleanup(&self) {
        if self.spec.options.contains(TargetOptions::DELETEFILE) {
            if let Err(e) = remove_target_file(&self.spec.full_pathname) {
                log::warn!(
                    "target {}: cleanup: delete file failed: {e}",
                    self.spec.target_number
                );
            }
        }
        if let Some(e2e) = &self.e2e {
            e2e.close_all();
        }
        // Buffers are reclaimed when `buffer_pool` drops with `self`.
        if self.e2e.is_none() {
            // The file is closed when `file`'s Mutex<File> drops with `self`;
            // nothing further to do for a plain (non-E2E) target here.
        }
    }
}
