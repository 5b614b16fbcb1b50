//! Driver state directory arbitration.
//!
//! Before the driver creates anything it must decide who owns the directory:
//! a live driver (fatal), a dead one (salvage its error log, then reclaim),
//! or nobody (create). Detection reads the previous CnC file's ready word
//! and the consumer heartbeat that a live Conductor re-stamps every duty
//! cycle.

use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use petrel_primitives::errorlog::ErrorLogReader;
use petrel_primitives::ringbuffer::MpscRingBuffer;
use petrel_primitives::EpochClock;

use crate::cnc::CncFile;
use crate::error::DriverError;

/// Flags and timeouts consulted when an existing directory is found.
pub struct DirectoryOptions<'a> {
    pub warn_if_exists: bool,
    pub delete_on_start: bool,
    pub driver_timeout_ms: u64,
    pub epoch_clock: &'a dyn EpochClock,
}

/// Ensure `dir` exists and is exclusively ours.
///
/// - missing directory: created
/// - `delete_on_start`: recursively removed and recreated, no questions asked
/// - otherwise: a mappable CnC file is inspected; a fresh heartbeat means a
///   live peer (`ActiveDriver`), anything else is salvaged and reclaimed
pub fn ensure_directory_is_recreated(
    dir: &Path,
    options: &DirectoryOptions<'_>,
) -> Result<(), DriverError> {
    if !dir.is_dir() {
        std::fs::create_dir_all(dir)?;
        return Ok(());
    }

    if options.warn_if_exists {
        eprintln!("WARNING: {} already exists.", dir.display());
    }

    if !options.delete_on_start {
        inspect_existing(dir, options)?;
    }

    std::fs::remove_dir_all(dir)?;
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Inspect a pre-existing directory's CnC file; error on a live peer,
/// salvage recorded errors otherwise. A missing or malformed CnC file means
/// the previous owner never got far enough to matter.
fn inspect_existing(dir: &Path, options: &DirectoryOptions<'_>) -> Result<(), DriverError> {
    if !CncFile::path_in(dir).is_file() {
        return Ok(());
    }

    let cnc = match CncFile::map_existing(dir) {
        Ok(cnc) => cnc,
        Err(e) => {
            log_at!(debug, "ignoring unusable CnC file in {}: {e}", dir.display());
            let _ = e;
            return Ok(());
        }
    };

    let now_ms = options.epoch_clock.now_ms();
    if is_driver_active(&cnc, now_ms, options.driver_timeout_ms) {
        return Err(DriverError::ActiveDriver {
            dir: dir.to_path_buf(),
        });
    }

    if let Some(path) = save_existing_errors(dir, &cnc, now_ms)? {
        eprintln!("WARNING: existing errors saved to: {}", path.display());
    }

    Ok(())
}

/// A driver is live when its CnC file signals ready and the to-driver ring's
/// consumer heartbeat is newer than the driver timeout.
pub fn is_driver_active(cnc: &CncFile, now_ms: u64, driver_timeout_ms: u64) -> bool {
    if !cnc.is_ready() {
        return false;
    }

    let ring = match unsafe { MpscRingBuffer::attach(cnc.to_driver_region(), 0) } {
        Ok(ring) => ring,
        Err(_) => return false,
    };

    let heartbeat_ms = ring.consumer_heartbeat_ms();
    now_ms.saturating_sub(heartbeat_ms) <= driver_timeout_ms
}

/// Dump the previous driver's distinct error observations to a timestamped
/// file next to the directory. Returns the file path when anything was
/// written.
pub fn save_existing_errors(
    dir: &Path,
    cnc: &CncFile,
    now_ms: u64,
) -> Result<Option<PathBuf>, DriverError> {
    let mut formatted = String::new();

    let distinct = ErrorLogReader::read(
        cnc.error_log_region(),
        |count, first_ms, last_ms, description| {
            formatted.push_str(&format_observation(count, first_ms, last_ms, description));
        },
    );

    if distinct == 0 {
        return Ok(None);
    }

    formatted.push_str(&format!("{distinct} distinct errors observed.\n"));

    let path = error_log_path(dir, now_ms);
    std::fs::write(&path, formatted.as_bytes())?;

    Ok(Some(path))
}

/// `<dir>-<yyyy-MM-dd-HH-mm-ss-SSS+zzzz>-error.log`, a sibling of `dir`.
fn error_log_path(dir: &Path, now_ms: u64) -> PathBuf {
    let stamp = Utc
        .timestamp_millis_opt(now_ms as i64)
        .single()
        .map(|t| t.format("%Y-%m-%d-%H-%M-%S-%3f%z").to_string())
        .unwrap_or_else(|| now_ms.to_string());

    PathBuf::from(format!("{}-{stamp}-error.log", dir.display()))
}

fn format_observation(count: u32, first_ms: u64, last_ms: u64, description: &str) -> String {
    let fmt = |ms: u64| {
        Utc.timestamp_millis_opt(ms as i64)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| ms.to_string())
    };
    format!(
        "{count} observations from {} to {} for:\n {description}\n",
        fmt(first_ms),
        fmt(last_ms)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnc::{CncLengths, CncParams};
    use petrel_primitives::counters::VALUE_SLOT_SIZE;
    use petrel_primitives::errorlog::DistinctErrorLog;
    use petrel_primitives::ManualClock;

    fn params() -> CncParams {
        CncParams {
            lengths: CncLengths::from_capacities(
                64 * 1024,
                64 * 1024,
                64 * VALUE_SLOT_SIZE,
                4096,
            ),
            client_liveness_timeout_ns: 5_000_000_000,
            start_timestamp_ms: 0,
        }
    }

    fn make_cnc(dir: &Path, ready: bool, heartbeat_ms: u64) -> CncFile {
        let cnc = CncFile::create(dir, &params()).unwrap();
        let ring = unsafe { MpscRingBuffer::init(cnc.to_driver_region(), 0, 64 * 1024) };
        ring.set_consumer_heartbeat_ms(heartbeat_ms);
        if ready {
            cnc.signal_ready();
        }
        cnc
    }

    #[test]
    fn missing_directory_is_created() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        let clock = ManualClock::new(1_000, 0);

        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: false,
                delete_on_start: false,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        )
        .unwrap();

        assert!(dir.is_dir());
    }

    #[test]
    fn live_peer_is_fatal_and_untouched() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();

        let now_ms = 1_000_000;
        let cnc = make_cnc(&dir, true, now_ms);
        drop(cnc);

        let clock = ManualClock::new(now_ms + 5_000, 0);
        let result = ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: false,
                delete_on_start: false,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        );

        assert!(matches!(result, Err(DriverError::ActiveDriver { .. })));
        assert!(CncFile::path_in(&dir).is_file(), "no directory mutation");
    }

    #[test]
    fn stale_peer_is_reclaimed() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();

        let heartbeat_ms = 1_000_000;
        drop(make_cnc(&dir, true, heartbeat_ms));

        let clock = ManualClock::new(heartbeat_ms + 100_000, 0);
        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: false,
                delete_on_start: false,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        )
        .unwrap();

        assert!(dir.is_dir());
        assert!(!CncFile::path_in(&dir).exists(), "directory was recreated");
    }

    #[test]
    fn not_ready_peer_is_not_active() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();

        let now_ms = 1_000_000;
        let cnc = make_cnc(&dir, false, now_ms);
        assert!(!is_driver_active(&cnc, now_ms, 10_000));
    }

    #[test]
    fn delete_on_start_skips_inspection() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();

        // Even a live-looking peer is wiped when delete_on_start is set.
        let now_ms = 1_000_000;
        drop(make_cnc(&dir, true, now_ms));

        let clock = ManualClock::new(now_ms, 0);
        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: false,
                delete_on_start: true,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        )
        .unwrap();

        assert!(!CncFile::path_in(&dir).exists());
    }

    #[test]
    fn salvage_writes_distinct_errors_to_sibling_file() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();

        let cnc = make_cnc(&dir, true, 0);
        let log = unsafe { DistinctErrorLog::new(cnc.error_log_region()) };
        assert!(log.record("socket bind failed", 500));
        assert!(log.record("socket bind failed", 700));
        assert!(log.record("short send on channel", 600));
        drop(cnc);

        let clock = ManualClock::new(1_000_000, 0);
        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: true,
                delete_on_start: false,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        )
        .unwrap();

        let salvaged: Vec<PathBuf> = std::fs::read_dir(parent.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("petrel-") && n.ends_with("-error.log"))
            })
            .collect();
        assert_eq!(salvaged.len(), 1, "exactly one salvage file");

        let contents = std::fs::read_to_string(&salvaged[0]).unwrap();
        assert!(contents.contains("2 observations"));
        assert!(contents.contains("socket bind failed"));
        assert!(contents.contains("short send on channel"));
        assert!(contents.contains("2 distinct errors observed."));
    }

    #[test]
    fn salvage_is_skipped_when_log_is_empty() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("petrel");
        std::fs::create_dir_all(&dir).unwrap();
        drop(make_cnc(&dir, true, 0));

        let clock = ManualClock::new(1_000_000, 0);
        ensure_directory_is_recreated(
            &dir,
            &DirectoryOptions {
                warn_if_exists: false,
                delete_on_start: false,
                driver_timeout_ms: 10_000,
                epoch_clock: &clock,
            },
        )
        .unwrap();

        let salvaged = std::fs::read_dir(parent.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_str()
                    .is_some_and(|n| n.ends_with("-error.log"))
            })
            .count();
        assert_eq!(salvaged, 0);
    }
}
