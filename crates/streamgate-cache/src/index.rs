//! Segment index files.
//!
//! An index file is an array of 8-byte rows: a 32-bit key stored
//! big-endian followed by a 32-bit value (a log-file byte position)
//! stored little-endian. Two kinds exist per segment:
//!
//! - the **offset index**, keyed by `offset - base_offset`. Rows are
//!   appended in offset order so the file is sorted from birth and is
//!   binary-searched immediately.
//! - the **hash index**, keyed by the CRC32C of a key or header. Rows
//!   arrive in append (position) order; while the segment is active they
//!   are probed by forward scan, and when the segment seals the rows are
//!   sorted by `(key, value)` in place, after which probes binary-search.
//!
//! Probes that run past the published end of the file return
//! `RETRY_SEGMENT` while the file can still grow and `NEXT_SEGMENT` once
//! it is sealed.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::cursor_record::{cursor, cursor_index, cursor_value, NEXT_SEGMENT, RETRY_SEGMENT};
use crate::file::CacheFile;

pub(crate) fn pack_row(key: u32, value: u32) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&key.to_be_bytes());
    bytes[4..].copy_from_slice(&value.to_le_bytes());
    u64::from_ne_bytes(bytes)
}

pub(crate) fn unpack_row(row: u64) -> (u32, u32) {
    let bytes = row.to_ne_bytes();
    let key = u32::from_be_bytes(bytes[..4].try_into().unwrap());
    let value = u32::from_le_bytes(bytes[4..].try_into().unwrap());
    (key, value)
}

pub struct IndexFile {
    file: CacheFile,
    /// Rows are in `(key, value)` order and may be binary-searched.
    sorted: AtomicBool,
    /// No further rows will be appended.
    sealed: AtomicBool,
    /// Probes match the key exactly (hash index) rather than seeking the
    /// smallest key at or above the target (offset index).
    exact: bool,
}

impl IndexFile {
    /// An offset index: sorted by construction, at-least key semantics.
    pub fn offsets(file: CacheFile) -> Self {
        Self {
            file,
            sorted: AtomicBool::new(true),
            sealed: AtomicBool::new(false),
            exact: false,
        }
    }

    /// A hash index: unsorted until sealed, exact key semantics.
    pub fn hashes(file: CacheFile) -> Self {
        Self {
            file,
            sorted: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
            exact: true,
        }
    }

    pub(crate) fn file(&self) -> &CacheFile {
        &self.file
    }

    pub fn entries(&self) -> i32 {
        (self.file.published() / 8) as i32
    }

    pub fn append(&self, key: u32, value: u32) -> bool {
        debug_assert!(!self.sealed.load(Ordering::Relaxed));
        self.file.append(&pack_row(key, value).to_ne_bytes()).is_some()
    }

    fn row(&self, slot: i32) -> Option<(u32, u32)> {
        if slot < 0 {
            return None;
        }
        self.file.row_load(slot as u32 * 8).map(unpack_row)
    }

    /// Sorts (hash indexes) and freezes the file.
    pub fn seal(&self) {
        if !self.sorted.load(Ordering::Acquire) {
            let count = self.entries();
            let mut rows: Vec<(u32, u32)> = (0..count).filter_map(|slot| self.row(slot)).collect();
            rows.sort_unstable();
            for (slot, (key, value)) in rows.into_iter().enumerate() {
                self.file.row_store(slot as u32 * 8, pack_row(key, value));
            }
            self.sorted.store(true, Ordering::Release);
        }
        self.sealed.store(true, Ordering::Release);
    }

    pub fn sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn exhausted(&self) -> i64 {
        if self.sealed() {
            NEXT_SEGMENT
        } else {
            RETRY_SEGMENT
        }
    }

    fn lower_bound(&self, key: u32, value: u32) -> i32 {
        let count = self.entries();
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (k, v) = self.row(mid).expect("slot below published length");
            if (k, v) < (key, value) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Smallest slot whose key is at (or, for the offset index, above)
    /// `key`, packed with its value.
    pub fn first(&self, key: u32) -> i64 {
        self.ceiling(key, cursor(0, 0))
    }

    /// The smallest slot at index `>= cursor_index(prior)` whose key
    /// matches and whose value is `>= cursor_value(prior)`.
    ///
    /// Slots are comparable across every condition probing one segment's
    /// hash file (they share the file), which is what lets a conjunction
    /// merge-join by bumping the slot floor past a rejected candidate.
    /// A row equal to the prior cursor is returned again; callers
    /// advance past delivered rows explicitly.
    pub fn ceiling(&self, key: u32, prior: i64) -> i64 {
        let from_slot = cursor_index(prior).max(0);
        let floor = cursor_value(prior);

        if self.sorted.load(Ordering::Acquire) {
            // The sort regroups rows by key, so the prior slot only
            // excludes rows it has actually consumed: those at exactly
            // the floor position below the prior slot.
            let mut slot = self.lower_bound(key, floor);
            while let Some((k, value)) = self.row(slot) {
                if k == key && value == floor && slot < from_slot {
                    slot += 1;
                } else {
                    break;
                }
            }
            match self.row(slot) {
                Some((k, value)) if k == key || !self.exact => cursor(slot, value),
                _ => self.exhausted(),
            }
        } else {
            // Forward scan over unsorted rows; append order is position
            // order, so the first eligible row is the earliest one.
            let count = self.entries();
            for slot in from_slot..count {
                if let Some((k, value)) = self.row(slot) {
                    if k == key && value >= floor {
                        return cursor(slot, value);
                    }
                }
            }
            self.exhausted()
        }
    }

    /// Row at the cursor's slot, or `NEXT_SEGMENT` past the end.
    pub fn resolve(&self, cursor_record: i64) -> i64 {
        let slot = cursor_index(cursor_record).max(0);
        match self.row(slot) {
            Some((_, value)) => cursor(slot, value),
            None => NEXT_SEGMENT,
        }
    }
}
