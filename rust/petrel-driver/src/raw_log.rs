//! Per-publication log-buffer factory.
//!
//! An external collaborator consumed at its interface: the factory creates
//! the memory-mapped term-buffer files backing publications and images
//! under the driver directory. Each log is three term partitions plus a
//! meta-data page; the internal format belongs to the log-buffer layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use petrel_primitives::errorlog::DistinctErrorLog;
use petrel_primitives::{EpochClock, MmapRegion, Region};

use crate::config;
use crate::error::DriverError;

/// Term partitions per log.
pub const PARTITION_COUNT: usize = 3;

/// Length of the log meta-data section.
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// A mapped raw log: three term partitions and a meta-data section.
pub struct RawLog {
    mmap: MmapRegion,
    term_length: usize,
}

impl RawLog {
    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    /// One of the three term partitions.
    pub fn partition(&self, index: usize) -> Region {
        assert!(index < PARTITION_COUNT, "partition index out of range");
        self.mmap
            .region()
            .sub_region(index * self.term_length, self.term_length)
    }

    /// The meta-data section that trails the partitions.
    pub fn meta_data(&self) -> Region {
        self.mmap
            .region()
            .sub_region(PARTITION_COUNT * self.term_length, LOG_META_DATA_LENGTH)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    const fn length_for(term_length: usize) -> usize {
        PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH
    }
}

/// Creates raw logs under `publications/` and `images/` in the driver
/// directory.
pub struct RawLogFactory {
    publications_dir: PathBuf,
    images_dir: PathBuf,
    max_term_length: usize,
    use_sparse_files: bool,
    error_log: Arc<DistinctErrorLog>,
    epoch_clock: Arc<dyn EpochClock>,
}

impl RawLogFactory {
    pub fn new(
        dir: &Path,
        max_term_length: usize,
        use_sparse_files: bool,
        error_log: Arc<DistinctErrorLog>,
        epoch_clock: Arc<dyn EpochClock>,
    ) -> Result<Self, DriverError> {
        let publications_dir = dir.join("publications");
        let images_dir = dir.join("images");
        std::fs::create_dir_all(&publications_dir)?;
        std::fs::create_dir_all(&images_dir)?;

        Ok(Self {
            publications_dir,
            images_dir,
            max_term_length,
            use_sparse_files,
            error_log,
            epoch_clock,
        })
    }

    /// Map a fresh log for a network publication.
    pub fn new_publication(
        &self,
        correlation_id: u64,
        term_length: usize,
    ) -> Result<RawLog, DriverError> {
        self.new_log(&self.publications_dir, correlation_id, term_length)
    }

    /// Map a fresh log for a received image.
    pub fn new_image(&self, correlation_id: u64, term_length: usize) -> Result<RawLog, DriverError> {
        self.new_log(&self.images_dir, correlation_id, term_length)
    }

    fn new_log(
        &self,
        dir: &Path,
        correlation_id: u64,
        term_length: usize,
    ) -> Result<RawLog, DriverError> {
        config::check_term_length(term_length)?;
        if term_length > self.max_term_length {
            return Err(DriverError::Configuration(format!(
                "term length {term_length} exceeds max term length {}",
                self.max_term_length
            )));
        }

        let path = dir.join(format!("{correlation_id}.logbuffer"));
        let mmap = MmapRegion::create(&path, RawLog::length_for(term_length), self.use_sparse_files)
            .inspect_err(|e| {
                self.error_log.record(
                    &format!("failed to map raw log {}: {e}", path.display()),
                    self.epoch_clock.now_ms(),
                );
            })?;

        Ok(RawLog { mmap, term_length })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_primitives::{HeapRegion, SystemEpochClock};

    fn factory(dir: &Path, sparse: bool) -> (Arc<HeapRegion>, RawLogFactory) {
        let backing = Arc::new(HeapRegion::new_zeroed(16 * 1024));
        let error_log = Arc::new(unsafe { DistinctErrorLog::new(backing.region()) });
        let factory = RawLogFactory::new(
            dir,
            config::TERM_MAX_LENGTH,
            sparse,
            error_log,
            Arc::new(SystemEpochClock),
        )
        .unwrap();
        (backing, factory)
    }

    #[test]
    fn creates_publication_and_image_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (_backing, factory) = factory(dir.path(), true);

        let log = factory.new_publication(42, 64 * 1024).unwrap();
        assert_eq!(log.term_length(), 64 * 1024);
        assert!(
            dir.path()
                .join("publications")
                .join("42.logbuffer")
                .is_file()
        );
        assert_eq!(
            std::fs::metadata(log.path()).unwrap().len() as usize,
            3 * 64 * 1024 + LOG_META_DATA_LENGTH
        );

        let image = factory.new_image(43, 64 * 1024).unwrap();
        assert!(dir.path().join("images").join("43.logbuffer").is_file());
        drop(image);
    }

    #[test]
    fn partitions_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let (_backing, factory) = factory(dir.path(), true);
        let log = factory.new_publication(1, 64 * 1024).unwrap();

        unsafe {
            *log.partition(0).get_mut::<u64>(0) = 0xAAAA;
            *log.partition(1).get_mut::<u64>(0) = 0xBBBB;
            *log.partition(2).get_mut::<u64>(0) = 0xCCCC;
            *log.meta_data().get_mut::<u64>(0) = 0xDDDD;

            assert_eq!(*log.partition(0).get::<u64>(0), 0xAAAA);
            assert_eq!(*log.partition(1).get::<u64>(0), 0xBBBB);
            assert_eq!(*log.partition(2).get::<u64>(0), 0xCCCC);
            assert_eq!(*log.meta_data().get::<u64>(0), 0xDDDD);
        }
    }

    #[test]
    fn rejects_invalid_term_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let (_backing, factory) = factory(dir.path(), false);

        assert!(factory.new_publication(1, 1000).is_err());
        assert!(factory.new_publication(1, config::TERM_MIN_LENGTH / 2).is_err());
    }

    #[test]
    fn rejects_term_length_above_factory_max() {
        let dir = tempfile::tempdir().unwrap();
        let backing = Arc::new(HeapRegion::new_zeroed(16 * 1024));
        let error_log = Arc::new(unsafe { DistinctErrorLog::new(backing.region()) });
        let factory = RawLogFactory::new(
            dir.path(),
            64 * 1024,
            false,
            error_log,
            Arc::new(SystemEpochClock),
        )
        .unwrap();

        assert!(factory.new_publication(1, 128 * 1024).is_err());
        assert!(factory.new_publication(2, 64 * 1024).is_ok());
    }
}
