//! Restart/checkpoint subsystem (C9, §4.3): a periodic monitor that durably
//! records the longest committed prefix on E2E destination targets.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek as IoSeek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RestartFlags: u32 {
        const SUCCESSFUL_COMPLETION = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CommittedPrefix {
    op: u64,
    location: u64,
    length: u64,
}

/// Per-destination-target restart checkpoint. Workers publish their
/// progress through [`RestartState::publish`]; the monitor thread reads it
/// back and durably writes the restart file.
pub struct RestartState {
    target_number: u32,
    path: PathBuf,
    file: Mutex<File>,
    committed: Mutex<CommittedPrefix>,
    flags: Mutex<RestartFlags>,
    first_write_done: AtomicBool,
}

impl RestartState {
    /// Create (or truncate) the restart file at `path`.
    pub fn create(target_number: u32, path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::Setup {
                target: target_number,
                source,
            })?;
        Ok(RestartState {
            target_number,
            path,
            file: Mutex::new(file),
            committed: Mutex::new(CommittedPrefix::default()),
            flags: Mutex::new(RestartFlags::empty()),
            first_write_done: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Called by the owning worker under the restart lock (the mutexes on
    /// `committed`/`flags` here *are* that lock) to publish its latest
    /// `last_committed_{op,location,length}`.
    pub fn publish(&self, op: u64, location: u64, length: u64) {
        let mut committed = self.committed.lock().expect("restart lock poisoned");
        if location >= committed.location {
            *committed = CommittedPrefix { op, location, length };
        }
    }

    pub fn mark_successful_completion(&self) {
        self.flags.lock().expect("restart lock poisoned").insert(RestartFlags::SUCCESSFUL_COMPLETION);
    }

    fn is_successful_completion(&self) -> bool {
        self.flags.lock().expect("restart lock poisoned").contains(RestartFlags::SUCCESSFUL_COMPLETION)
    }

    /// Rewind and overwrite the restart file with the current committed
    /// prefix, then force it durable. Skipped once [`Self::mark_successful_completion`]
    /// has been called (§4.3).
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_successful_completion() {
            return Ok(());
        }
        let committed = *self.committed.lock().expect("restart lock poisoned");
        let line = format!("-restart offset {}\n", committed.location);

        let mut file = self.file.lock().expect("restart file lock poisoned");
        file.seek(SeekFrom::Start(0)).map_err(|source| Error::Restart {
            target: self.target_number,
            source,
        })?;
        file.set_len(0).map_err(|source| Error::Restart {
            target: self.target_number,
            source,
        })?;
        file.write_all(line.as_bytes()).map_err(|source| Error::Restart {
            target: self.target_number,
            source,
        })?;
        file.sync_all().map_err(|source| Error::Restart {
            target: self.target_number,
            source,
        })?;
        self.first_write_done.store(true, Ordering::Relaxed);
        log::debug!(
            "restart: target {} checkpoint at offset {}",
            self.target_number,
            committed.location
        );
        Ok(())
    }

    pub fn last_committed_location(&self) -> u64 {
        self.committed.lock().expect("restart lock poisoned").location
    }
}

/// Default restart filename (§4.3, §6): `xdd.<src_host>.<src_base>.<dst_host>.
/// <dst_base>.YYYY-MM-DD-HHMM-GMT.rst`. The timestamp is formatted by
/// [`gmt_timestamp_now`]; callers needing a fixed name for reproducible
/// tests should pass their own `timestamp`.
pub fn default_filename(
    src_host: &str,
    src_base: &str,
    dst_host: &str,
    dst_base: &str,
    timestamp: &str,
) -> String {
    format!("xdd.{src_host}.{src_base}.{dst_host}.{dst_base}.{timestamp}-GMT.rst")
}

/// `YYYY-MM-DD-HHMM` for the current wall-clock time in GMT, computed
/// without a calendar dependency (days-from-civil, Howard Hinnant's
/// algorithm) since date/time probing is explicitly out of this crate's
/// scope beyond producing this one filename component.
pub fn gmt_timestamp_now() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    let hour = time_of_day / 3600;
    let minute = (time_of_day % 3600) / 60;
    format!("{year:04}-{month:02}-{day:02}-{hour:02}{minute:02}")
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn filename_matches_expected_format() {
        let name = default_filename("srchost", "src.dat", "dsthost", "dst.dat", "2026-07-28-1530");
        assert_eq!(name, "xdd.srchost.src.dat.dsthost.dst.dat.2026-07-28-1530-GMT.rst");
    }

    #[test]
    fn checkpoint_writes_offset_line() {
        let dir = tempfile_dir();
        let path = dir.join("test.rst");
        let state = RestartState::create(1, path.clone()).unwrap();
        state.publish(3, 12288, 4096);
        state.checkpoint().unwrap();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "-restart offset 12288\n");
    }

    #[test]
    fn publish_is_monotonic_non_decreasing() {
        let dir = tempfile_dir();
        let state = RestartState::create(1, dir.join("mono.rst")).unwrap();
        state.publish(1, 4096, 4096);
        state.publish(0, 0, 4096); // stale, out-of-order publish
        assert_eq!(state.last_committed_location(), 4096);
    }

    #[test]
    fn successful_completion_skips_further_checkpoints() {
        let dir = tempfile_dir();
        let path = dir.join("done.rst");
        let state = RestartState::create(1, path.clone()).unwrap();
        state.publish(1, 4096, 4096);
        state.checkpoint().unwrap();
        state.mark_successful_completion();
        state.publish(2, 8192, 4096);
        state.checkpoint().unwrap();

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "-restart offset 4096\n");
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("xdrive-restart-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn civil_from_days_matches_known_epoch() {
        // 1970-01-01 is day 0.
        assert_eq!(civil_from_days(0), (1970, 1, 1));
    }
}
