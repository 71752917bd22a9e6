//! Memory-mapped cache files.
//!
//! Every segment file (`.log`, `.index`, `.hash`, `.delta`) is created at
//! a fixed capacity as a sparse file and mapped once. A single ingest
//! writer appends past the published length and then publishes the new
//! length with a release store; readers acquire-load the published length
//! and never touch bytes beyond it. That store/load pair is the only
//! coordination between the writer and any number of readers.
//!
//! Index rows additionally need in-place rewrites (the seal-time sort),
//! so 8-byte rows are accessed through `AtomicU64` loads and stores; a
//! reader racing the sort sees a permutation of valid rows, never a torn
//! one.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

use crate::error::Result;

pub struct CacheFile {
    // Kept alive for the lifetime of `ptr`; never accessed directly.
    _mmap: MmapMut,
    ptr: *mut u8,
    capacity: u32,
    published: AtomicU32,
    path: PathBuf,
}

// A single writer appends beyond the published watermark while readers
// stay below it; row-granular accesses go through atomics.
unsafe impl Send for CacheFile {}
unsafe impl Sync for CacheFile {}

impl CacheFile {
    pub fn create(path: impl AsRef<Path>, capacity: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Self {
            _mmap: mmap,
            ptr,
            capacity,
            published: AtomicU32::new(0),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes visible to readers.
    pub fn published(&self) -> u32 {
        self.published.load(Ordering::Acquire)
    }

    /// Appends `bytes` and publishes them, returning the byte position of
    /// the appended data, or `None` when the file cannot hold it.
    ///
    /// Only the single ingest writer may call this.
    pub fn append(&self, bytes: &[u8]) -> Option<u32> {
        let at = self.published.load(Ordering::Relaxed);
        let len = bytes.len() as u32;
        if at.checked_add(len)? > self.capacity {
            return None;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at as usize), bytes.len());
        }
        self.published.store(at + len, Ordering::Release);
        Some(at)
    }

    /// Borrows published bytes, or `None` when the range extends past the
    /// published watermark.
    pub fn read(&self, at: u32, len: u32) -> Option<&[u8]> {
        let end = at.checked_add(len)?;
        if end > self.published() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.ptr.add(at as usize), len as usize) })
    }

    fn row_atomic(&self, at: u32) -> &AtomicU64 {
        debug_assert!(at % 8 == 0 && at + 8 <= self.capacity);
        unsafe { &*(self.ptr.add(at as usize) as *const AtomicU64) }
    }

    /// Atomically loads an 8-byte row below the published watermark.
    pub fn row_load(&self, at: u32) -> Option<u64> {
        if at % 8 != 0 || at + 8 > self.published() {
            return None;
        }
        Some(self.row_atomic(at).load(Ordering::Relaxed))
    }

    /// Atomically rewrites an already published 8-byte row (seal-time
    /// sort only).
    pub fn row_store(&self, at: u32, row: u64) {
        assert!(at % 8 == 0 && at + 8 <= self.published());
        self.row_atomic(at).store(row, Ordering::Relaxed);
    }
}
