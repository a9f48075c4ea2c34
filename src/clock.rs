//! Monotonic picosecond clock and the append-only per-worker timestamp table.
//!
//! xdrive times everything in picoseconds to match the resolution the
//! original engine used for its `pclk_t`/`nclk_t` counters; in practice the
//! underlying source is whatever monotonic clock the platform provides
//! (`Instant` here), scaled up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Picoseconds since an arbitrary, process-wide epoch. Only differences
/// between two `now()` calls are meaningful.
pub type PicoSeconds = u64;

const PICOS_PER_NANO: u64 = 1_000;

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

/// Returns the current time in picoseconds since the process-wide epoch.
pub fn now() -> PicoSeconds {
    let nanos = epoch().elapsed().as_nanos();
    (nanos as u64).saturating_mul(PICOS_PER_NANO)
}

/// The kind of operation a scheduled seek represents, duplicated here (rather
/// than re-exported from `seek`) because a timestamp entry may outlive the
/// seek plan's notion of "current" op during an E2E destination's EOF tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Noop,
    Eof,
}

/// One row of the timestamp table, §3 "Timestamp Table Entry".
#[derive(Debug, Clone, Copy)]
pub struct TimestampEntry {
    pub op_number: u64,
    pub op_kind: OpKind,
    pub pass: u32,
    pub byte_location: u64,
    pub disk_start: PicoSeconds,
    pub disk_end: PicoSeconds,
    pub net_start: PicoSeconds,
    pub net_end: PicoSeconds,
    pub net_processor_start: u32,
    pub net_processor_end: u32,
    pub net_xfer_size: u64,
    pub net_xfer_calls: u32,
}

impl TimestampEntry {
    fn blank(op_number: u64, op_kind: OpKind, pass: u32, byte_location: u64) -> Self {
        TimestampEntry {
            op_number,
            op_kind,
            pass,
            byte_location,
            disk_start: 0,
            disk_end: 0,
            net_start: 0,
            net_end: 0,
            net_processor_start: 0,
            net_processor_end: 0,
            net_xfer_size: 0,
            net_xfer_calls: 0,
        }
    }
}

/// Append-only timestamp log, bounded by `capacity`. Once full, further
/// entries are dropped and a single warning is logged (the original's fixed
/// `tte[]` array silently stopped recording; we make the truncation
/// observable instead).
pub struct TimestampTable {
    capacity: usize,
    entries: Mutex<Vec<TimestampEntry>>,
    overflow_warned: AtomicBool,
}

impl TimestampTable {
    pub fn new(capacity: usize) -> Self {
        TimestampTable {
            capacity,
            entries: Mutex::new(Vec::with_capacity(capacity.min(4096))),
            overflow_warned: AtomicBool::new(false),
        }
    }

    /// Begin a new entry, returning its index for a later `finish` call.
    pub fn begin(&self, op_number: u64, op_kind: OpKind, pass: u32, byte_location: u64) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            if !self.overflow_warned.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "timestamp table at capacity ({}); further entries are dropped",
                    self.capacity
                );
            }
            return None;
        }
        let mut entry = TimestampEntry::blank(op_number, op_kind, pass, byte_location);
        entry.disk_start = now();
        entries.push(entry);
        Some(entries.len() - 1)
    }

    pub fn finish_disk(&self, index: usize) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(index) {
            entry.disk_end = now();
        }
    }

    pub fn record_net(
        &self,
        index: usize,
        net_start: PicoSeconds,
        net_end: PicoSeconds,
        xfer_size: u64,
    ) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(index) {
            entry.net_start = net_start;
            entry.net_end = net_end;
            entry.net_xfer_size = xfer_size;
            entry.net_xfer_calls += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<TimestampEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn table_drops_past_capacity() {
        let table = TimestampTable::new(2);
        assert!(table.begin(0, OpKind::Read, 0, 0).is_some());
        assert!(table.begin(1, OpKind::Read, 0, 0).is_some());
        assert!(table.begin(2, OpKind::Read, 0, 0).is_none());
        assert_eq!(table.len(), 2);
    }
}
