//! Partition cursor.
//!
//! A cursor walks one partition's segment chain under a filter condition
//! and an optional delta mode. It owns at most one segment reference at
//! a time; hopping to the next segment releases the previous one first
//! so retired segments can reclaim their files.
//!
//! `next` returns `None` both for "nothing published yet, try again
//! later" (the condition returned a retry cursor) and for "the chain is
//! exhausted for now" (sentinel reached); either way the caller retries
//! on its next wake-up. After delivering an entry the caller reports
//! progress with `advance(offset + 1)`, which moves the cursor past the
//! delivered slot.

use std::collections::HashSet;
use std::sync::Arc;

use streamgate_core::types::KafkaDeltaType;
use tracing::trace;

use crate::condition::FilterCondition;
use crate::cursor_record::{
    cursor_retry_value, cursor_value, next_index, next_value, NEXT_SEGMENT, POSITION_UNSET,
};
use crate::entry::CacheEntry;
use crate::partition::Node;
use crate::segment::SegmentRef;

pub struct Cursor {
    condition: FilterCondition,
    delta_type: KafkaDeltaType,
    /// Offsets whose value is the latest the client has seen for its
    /// key during this traversal; ancestors found here may be delivered
    /// as deltas.
    delta_key_offsets: HashSet<i64>,
    node: Option<Node>,
    segment: Option<SegmentRef>,
    offset: i64,
    latest_offset: i64,
    cursor: i64,
}

impl Cursor {
    pub fn new(condition: FilterCondition, delta_type: KafkaDeltaType) -> Self {
        Self {
            condition,
            delta_type,
            delta_key_offsets: HashSet::new(),
            node: None,
            segment: None,
            offset: 0,
            latest_offset: 0,
            cursor: 0,
        }
    }

    /// Positions the cursor on `node`, skipping forward past segments
    /// that are already retiring.
    pub fn init(&mut self, node: Node, offset: i64, latest_offset: i64) {
        debug_assert!(self.node.is_none());
        debug_assert!(self.segment.is_none());

        self.offset = offset;
        self.latest_offset = latest_offset;

        let (node, segment) = acquire_from(node);
        self.node = Some(node);
        self.segment = segment;

        if let Some(segment) = &self.segment {
            let cursor = self
                .condition
                .reset(Some(segment.segment()), offset, latest_offset, POSITION_UNSET);
            self.cursor = normalize_cursor(cursor);
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Produces the next matching entry, or `None` when the partition
    /// has nothing deliverable right now.
    pub fn next(&mut self) -> Option<CacheEntry> {
        loop {
            self.segment.as_ref()?;

            let cursor_next = self.condition.next(self.cursor);

            if cursor_retry_value(cursor_next) {
                self.cursor = cursor_next;
                return None;
            }

            if cursor_next == NEXT_SEGMENT {
                let next_node = self.node.as_ref().expect("segment implies node").next();
                if next_node.sentinel() {
                    return None;
                }

                self.segment = None;
                let (node, segment) = acquire_from(next_node);
                trace!(node = ?node, "cursor moved to next segment");
                self.node = Some(node);
                self.segment = segment;

                if let Some(segment) = &self.segment {
                    let cursor = self.condition.reset(
                        Some(segment.segment()),
                        self.offset,
                        self.latest_offset,
                        POSITION_UNSET,
                    );
                    self.cursor = normalize_cursor(cursor);
                }
                continue;
            }

            let position = cursor_value(cursor_next);
            let entry = {
                let segment = self.segment.as_ref().expect("checked above");
                CacheEntry::read(segment.log_file(), position)
            };
            let Some(entry) = entry else {
                return None;
            };

            if entry.offset < self.offset || !self.condition.test(&entry) {
                self.offset = self.offset.max(entry.offset);
                self.cursor = next_index(next_value(cursor_next));
                continue;
            }

            let entry = if self.delta_type != KafkaDeltaType::None {
                self.mark_ancestor(entry)
            } else {
                entry
            };

            self.cursor = cursor_next;
            return Some(entry);
        }
    }

    // Delta materialization: rewrite the entry as a delta against its
    // ancestor when the client has seen that ancestor in this traversal,
    // otherwise clear the ancestor so the client takes the full value.
    fn mark_ancestor(&mut self, mut entry: CacheEntry) -> CacheEntry {
        if entry.is_tombstone() {
            self.delta_key_offsets.remove(&entry.ancestor);
            return entry;
        }

        if entry.ancestor != -1 {
            let delta = if entry.delta_position != -1
                && self.delta_key_offsets.remove(&entry.ancestor)
            {
                self.segment
                    .as_ref()
                    .and_then(|segment| segment.read_delta(entry.delta_position))
            } else {
                None
            };

            match delta {
                Some(delta) => entry.value = Some(delta),
                None => entry.ancestor = -1,
            }
        }

        self.delta_key_offsets.insert(entry.offset);
        entry
    }

    /// Monotonic fast-forward past a delivered or externally reported
    /// offset.
    pub fn advance(&mut self, offset: i64) {
        debug_assert!(
            offset > self.offset,
            "advance must move forward: {offset} <= {}",
            self.offset
        );
        self.offset = offset;
        self.cursor = next_index(next_value(self.cursor));

        let rolled = match (&self.node, &self.segment) {
            (Some(node), Some(held)) => match node.segment() {
                Some(current) => !Arc::ptr_eq(current, held.segment()),
                None => false,
            },
            _ => false,
        };

        if rolled {
            self.segment = None;
            let node = self.node.take().expect("checked above");
            let (node, segment) = acquire_from(node);
            self.node = Some(node);
            self.segment = segment;

            if let Some(segment) = &self.segment {
                let cursor = self.condition.reset(
                    Some(segment.segment()),
                    self.offset,
                    self.latest_offset,
                    POSITION_UNSET,
                );
                self.cursor = normalize_cursor(cursor);
            }
        }
    }

    /// Releases the held segment reference.
    pub fn close(&mut self) {
        self.segment = None;
        self.node = None;
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.close();
    }
}

fn normalize_cursor(cursor: i64) -> i64 {
    if cursor_retry_value(cursor) || cursor == NEXT_SEGMENT {
        0
    } else {
        cursor
    }
}

// Walks forward from `node` until a segment can be acquired; parks on
// the sentinel when the chain is exhausted.
fn acquire_from(mut node: Node) -> (Node, Option<SegmentRef>) {
    loop {
        if node.sentinel() {
            return (node, None);
        }
        match node.segment().expect("real node has a segment").acquire() {
            Some(segment) => return (node, Some(segment)),
            None => node = node.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::partition::Partition;
    use crate::writer::PartitionWriter;
    use bytes::Bytes;
    use streamgate_core::types::{KafkaCondition, KafkaFilter, KafkaKey};
    use tempfile::tempdir;

    fn cache() -> (tempfile::TempDir, Arc<Partition>, PartitionWriter) {
        let dir = tempdir().unwrap();
        let partition = Partition::new(dir.path().join("t-0"), CacheConfig::small()).unwrap();
        let writer = PartitionWriter::new(Arc::clone(&partition), CacheConfig::small(), 0);
        (dir, partition, writer)
    }

    fn unfiltered() -> FilterCondition {
        FilterCondition::from_filters(&[])
    }

    #[test]
    fn test_walks_entries_in_offset_order() {
        let (_dir, partition, mut writer) = cache();
        for i in 0..4 {
            writer
                .append(
                    KafkaKey::of(format!("k{i}")),
                    vec![],
                    Some(Bytes::from(format!("v{i}"))),
                    i,
                    None,
                )
                .unwrap();
        }

        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);

        for expected in 0..4 {
            let entry = cursor.next().unwrap();
            assert_eq!(entry.offset, expected);
            cursor.advance(entry.offset + 1);
        }
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_starts_at_requested_offset() {
        let (_dir, partition, mut writer) = cache();
        for i in 0..6 {
            writer
                .append(KafkaKey::of("k"), vec![], Some(Bytes::from("v")), i, None)
                .unwrap();
        }

        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(4), 4, -1);

        assert_eq!(cursor.next().unwrap().offset, 4);
    }

    #[test]
    fn test_sees_records_appended_after_drain() {
        let (_dir, partition, mut writer) = cache();
        writer
            .append(KafkaKey::of("k"), vec![], Some(Bytes::from("v0")), 0, None)
            .unwrap();

        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);
        let entry = cursor.next().unwrap();
        cursor.advance(entry.offset + 1);
        assert!(cursor.next().is_none());

        writer
            .append(KafkaKey::of("k"), vec![], Some(Bytes::from("v1")), 0, None)
            .unwrap();
        assert_eq!(cursor.next().unwrap().offset, 1);
    }

    #[test]
    fn test_crosses_segment_boundaries() {
        let (_dir, partition, mut writer) = cache();
        let value = Bytes::from(vec![b'x'; 200]);
        for i in 0..12 {
            writer
                .append(KafkaKey::of(format!("k{i}")), vec![], Some(value.clone()), 0, None)
                .unwrap();
        }

        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);

        let mut seen = Vec::new();
        while let Some(entry) = cursor.next() {
            seen.push(entry.offset);
            cursor.advance(entry.offset + 1);
        }
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_filtered_walk_skips_non_matches() {
        let (_dir, partition, mut writer) = cache();
        for i in 0..6 {
            let key = if i % 2 == 0 { "even" } else { "odd" };
            writer
                .append(KafkaKey::of(key), vec![], Some(Bytes::from("v")), 0, None)
                .unwrap();
        }
        writer.seal_active();

        let condition = FilterCondition::from_filters(&[KafkaFilter::new(vec![
            KafkaCondition::Key(KafkaKey::of("odd")),
        ])]);
        let mut cursor = Cursor::new(condition, KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);

        let mut seen = Vec::new();
        while let Some(entry) = cursor.next() {
            seen.push(entry.offset);
            cursor.advance(entry.offset + 1);
        }
        assert_eq!(seen, vec![1, 3, 5]);
    }

    #[test]
    fn test_close_releases_segment() {
        let (_dir, partition, mut writer) = cache();
        writer
            .append(KafkaKey::of("k"), vec![], Some(Bytes::from("v")), 0, None)
            .unwrap();

        let segment = partition.node_at(0).segment().unwrap().clone();
        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);
        assert_eq!(segment.ref_count(), 1);

        cursor.close();
        assert_eq!(segment.ref_count(), 0);
    }

    #[test]
    fn test_init_skips_retired_segment() {
        let (_dir, partition, mut writer) = cache();
        let value = Bytes::from(vec![b'x'; 200]);
        for i in 0..12 {
            writer
                .append(KafkaKey::of(format!("k{i}")), vec![], Some(value.clone()), 0, None)
                .unwrap();
        }
        let first = partition.node_at(0).segment().unwrap().clone();
        let first_base = first.base_offset();
        first.retire();

        let mut cursor = Cursor::new(unfiltered(), KafkaDeltaType::None);
        cursor.init(partition.node_at(0), 0, -1);

        let entry = cursor.next().unwrap();
        assert!(entry.offset > first_base);
    }
}
