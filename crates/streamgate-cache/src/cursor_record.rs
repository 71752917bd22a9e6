//! Packed cursor values for index probing.
//!
//! A cursor packs an index slot and a log-file byte position into one
//! `i64`: the high 32 bits hold the slot, the low 32 bits hold a retry
//! marker bit (bit 31) plus a 31-bit position. Two sentinels steer the
//! caller: `RETRY_SEGMENT` means the probe landed on bytes that are still
//! being appended and must be retried later; `NEXT_SEGMENT` means the
//! probe ran off a sealed file and the caller should move to the next
//! segment in the chain.

/// Position argument meaning "derive the position from the offset index".
pub const POSITION_UNSET: i32 = -1;

const VALUE_MASK: u32 = 0x7FFF_FFFF;
const RETRY_VALUE: u32 = 0xFFFF_FFFF;
const NEXT_VALUE: u32 = 0x7FFF_FFFE;

/// Probe hit the unpublished tail of an actively appended file.
pub const RETRY_SEGMENT: i64 = cursor(-1, RETRY_VALUE);

/// Probe exhausted a sealed file.
pub const NEXT_SEGMENT: i64 = cursor(-1, NEXT_VALUE);

pub const fn cursor(index: i32, value: u32) -> i64 {
    ((index as i64) << 32) | (value as u64 as i64 & 0xFFFF_FFFF)
}

pub const fn cursor_index(record: i64) -> i32 {
    (record >> 32) as i32
}

pub const fn cursor_value(record: i64) -> u32 {
    (record as u32) & VALUE_MASK
}

/// True when the cursor carries the retry marker (in its own slot or as
/// the `RETRY_SEGMENT` sentinel).
pub const fn cursor_retry_value(record: i64) -> bool {
    cursor_value(record) == RETRY_VALUE & VALUE_MASK
}

/// A retry marker that remembers the slot it stalled on.
pub const fn retry_at(index: i32) -> i64 {
    cursor(index, RETRY_VALUE)
}

pub const fn next_index(record: i64) -> i64 {
    cursor(cursor_index(record) + 1, cursor_value(record))
}

pub const fn previous_index(record: i64) -> i64 {
    cursor(cursor_index(record) - 1, cursor_value(record))
}

pub const fn next_value(record: i64) -> i64 {
    cursor(cursor_index(record), cursor_value(record) + 1)
}

/// Minimum by position; equal positions (several index rows can point at
/// one entry) resolve to the smaller slot so a conjunction's floor never
/// jumps past a sibling's row for the same entry.
pub const fn min_by_value(record1: i64, record2: i64) -> i64 {
    let value1 = cursor_value(record1);
    let value2 = cursor_value(record2);
    if value1 < value2 {
        record1
    } else if value2 < value1 {
        record2
    } else if cursor_index(record1) <= cursor_index(record2) {
        record1
    } else {
        record2
    }
}

pub const fn max_by_value(record1: i64, record2: i64) -> i64 {
    if cursor_value(record2) > cursor_value(record1) {
        record2
    } else {
        record1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let c = cursor(7, 1234);
        assert_eq!(cursor_index(c), 7);
        assert_eq!(cursor_value(c), 1234);
    }

    #[test]
    fn test_negative_index() {
        let c = cursor(-1, 99);
        assert_eq!(cursor_index(c), -1);
        assert_eq!(cursor_value(c), 99);
    }

    #[test]
    fn test_next_index_keeps_value() {
        let c = cursor(3, 500);
        let n = next_index(c);
        assert_eq!(cursor_index(n), 4);
        assert_eq!(cursor_value(n), 500);
    }

    #[test]
    fn test_previous_index_keeps_value() {
        let c = cursor(3, 500);
        let p = previous_index(c);
        assert_eq!(cursor_index(p), 2);
        assert_eq!(cursor_value(p), 500);
    }

    #[test]
    fn test_next_value_keeps_index() {
        let c = cursor(3, 500);
        let n = next_value(c);
        assert_eq!(cursor_index(n), 3);
        assert_eq!(cursor_value(n), 501);
    }

    #[test]
    fn test_min_max_by_value() {
        let a = cursor(1, 100);
        let b = cursor(9, 50);
        assert_eq!(min_by_value(a, b), b);
        assert_eq!(max_by_value(a, b), a);
    }

    #[test]
    fn test_min_tie_prefers_smaller_slot() {
        let a = cursor(1, 100);
        let b = cursor(2, 100);
        assert_eq!(min_by_value(a, b), a);
        assert_eq!(min_by_value(b, a), a);
        assert_eq!(max_by_value(a, b), a);
    }

    #[test]
    fn test_retry_detection() {
        assert!(cursor_retry_value(RETRY_SEGMENT));
        assert!(cursor_retry_value(retry_at(12)));
        assert_eq!(cursor_index(retry_at(12)), 12);
        assert!(!cursor_retry_value(NEXT_SEGMENT));
        assert!(!cursor_retry_value(cursor(0, 0)));
    }

    #[test]
    fn test_sentinels_compare_above_positions() {
        let real = cursor(0, 0x7FFF_0000);
        assert_eq!(min_by_value(NEXT_SEGMENT, real), real);
        assert_eq!(max_by_value(RETRY_SEGMENT, NEXT_SEGMENT), RETRY_SEGMENT);
        assert_eq!(max_by_value(real, NEXT_SEGMENT), NEXT_SEGMENT);
    }

    #[test]
    fn test_sentinels_distinct() {
        assert_ne!(NEXT_SEGMENT, RETRY_SEGMENT);
        assert_ne!(cursor_value(NEXT_SEGMENT), cursor_value(RETRY_SEGMENT));
    }
}
