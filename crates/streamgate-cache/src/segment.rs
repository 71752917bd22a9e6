//! Segments: one contiguous slice of a partition's log.
//!
//! A segment owns four files named after its base offset:
//! `<base>.log`, `<base>.index` (offset index), `<base>.hash` (hash
//! index) and `<base>.delta`. Segments are shared between the ingest
//! writer and any number of cursors, and are reference counted:
//! `acquire` hands out a scoped [`SegmentRef`] whose `Drop` releases, and
//! a retired segment reclaims its files once the last reference goes.

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::file::CacheFile;
use crate::index::IndexFile;

pub struct Segment {
    base_offset: i64,
    log: CacheFile,
    offset_index: IndexFile,
    hash_index: IndexFile,
    delta: CacheFile,
    refs: AtomicI32,
    retired: AtomicBool,
    reclaimed: AtomicBool,
}

impl Segment {
    pub fn create(dir: &Path, base_offset: i64, config: &CacheConfig) -> Result<Arc<Segment>> {
        let name = |suffix: &str| dir.join(format!("{base_offset}.{suffix}"));
        Ok(Arc::new(Segment {
            base_offset,
            log: CacheFile::create(name("log"), config.segment_bytes)?,
            offset_index: IndexFile::offsets(CacheFile::create(
                name("index"),
                config.segment_index_bytes,
            )?),
            hash_index: IndexFile::hashes(CacheFile::create(
                name("hash"),
                config.segment_hash_bytes,
            )?),
            delta: CacheFile::create(name("delta"), config.segment_delta_bytes)?,
            refs: AtomicI32::new(0),
            retired: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
        }))
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn log_file(&self) -> &CacheFile {
        &self.log
    }

    pub fn offset_index(&self) -> &IndexFile {
        &self.offset_index
    }

    pub fn hash_index(&self) -> &IndexFile {
        &self.hash_index
    }

    pub fn delta_file(&self) -> &CacheFile {
        &self.delta
    }

    /// Reads the length-prefixed delta payload at `position`.
    pub fn read_delta(&self, position: i32) -> Option<Bytes> {
        if position < 0 {
            return None;
        }
        let at = position as u32;
        let len = u32::from_le_bytes(self.delta.read(at, 4)?.try_into().ok()?);
        Some(Bytes::copy_from_slice(self.delta.read(at + 4, len)?))
    }

    pub fn sealed(&self) -> bool {
        self.offset_index.sealed()
    }

    /// Freezes the segment: no further appends, hash rows sorted.
    pub fn seal(&self) {
        self.offset_index.seal();
        self.hash_index.seal();
    }

    /// Takes a reference, or `None` when the segment is being retired.
    pub fn acquire(self: &Arc<Self>) -> Option<SegmentRef> {
        self.refs.fetch_add(1, Ordering::AcqRel);
        if self.retired.load(Ordering::Acquire) {
            self.release();
            return None;
        }
        Some(SegmentRef {
            segment: Arc::clone(self),
        })
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 && self.retired.load(Ordering::Acquire) {
            self.reclaim();
        }
    }

    /// Forbids new references; files are reclaimed once the last holder
    /// releases.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        if self.refs.load(Ordering::Acquire) == 0 {
            self.reclaim();
        }
    }

    fn reclaim(&self) {
        if self.reclaimed.swap(true, Ordering::AcqRel) {
            return;
        }
        for path in [
            self.log.path(),
            self.offset_index.file().path(),
            self.hash_index.file().path(),
            self.delta.path(),
        ] {
            if let Err(error) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %error, "failed to remove segment file");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("sealed", &self.sealed())
            .finish()
    }
}

/// Scoped segment reference; dropping it releases the count.
pub struct SegmentRef {
    segment: Arc<Segment>,
}

impl SegmentRef {
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Deref for SegmentRef {
    type Target = Segment;

    fn deref(&self) -> &Segment {
        &self.segment
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        self.segment.release();
    }
}
