//! Ingest path: appends entries to a partition.
//!
//! One writer owns a partition. Each append assigns the next offset,
//! links the entry to the prior version of the same key (the ancestor),
//! optionally stores a caller-supplied delta payload, and maintains the
//! offset and hash index rows. When any of the segment files would
//! overflow, the active segment is sealed and a fresh one is rolled at
//! the next offset.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use streamgate_core::types::{KafkaHeader, KafkaKey};
use tracing::debug;

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{Error, Result};
use crate::partition::Partition;
use crate::segment::Segment;

pub struct PartitionWriter {
    partition: Arc<Partition>,
    config: CacheConfig,
    next_offset: i64,
    active: Option<Arc<Segment>>,
    /// Encoded key -> offset of its latest live version.
    latest_by_key: HashMap<Bytes, i64>,
}

impl PartitionWriter {
    pub fn new(partition: Arc<Partition>, config: CacheConfig, base_offset: i64) -> Self {
        Self {
            partition,
            config,
            next_offset: base_offset,
            active: None,
            latest_by_key: HashMap::new(),
        }
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Appends one record and returns its offset.
    ///
    /// `delta` is an opaque diff against the key's previous version; it
    /// is stored only when that previous version exists.
    pub fn append(
        &mut self,
        key: KafkaKey,
        headers: Vec<KafkaHeader>,
        value: Option<Bytes>,
        timestamp: i64,
        delta: Option<Bytes>,
    ) -> Result<i64> {
        let offset = self.next_offset;
        let encoded_key = key.encoded();

        let ancestor = if key.value.is_some() {
            self.latest_by_key.get(&encoded_key).copied().unwrap_or(-1)
        } else {
            -1
        };
        let delta = delta.filter(|_| ancestor != -1 && value.is_some());

        let mut entry = CacheEntry {
            position: 0,
            offset,
            timestamp,
            ancestor,
            delta_position: -1,
            key,
            value,
            headers,
        };

        if self.active.is_none() || !self.fits(&entry, delta.as_ref()) {
            self.roll()?;
            if !self.fits(&entry, delta.as_ref()) {
                return Err(Error::SegmentFull(format!(
                    "entry at offset {offset} exceeds segment capacity"
                )));
            }
        }
        let segment = self.active.as_ref().expect("rolled above");

        if let Some(delta_bytes) = delta {
            let mut framed = Vec::with_capacity(4 + delta_bytes.len());
            framed.extend_from_slice(&(delta_bytes.len() as u32).to_le_bytes());
            framed.extend_from_slice(&delta_bytes);
            entry.delta_position = segment
                .delta_file()
                .append(&framed)
                .expect("checked capacity") as i32;
        }

        let position = segment
            .log_file()
            .append(&entry.encode())
            .expect("checked capacity");
        let offset_delta = (offset - segment.base_offset()) as u32;
        segment.offset_index().append(offset_delta, position);
        segment
            .hash_index()
            .append(crc32c::crc32c(&encoded_key), position);
        for header in &entry.headers {
            segment
                .hash_index()
                .append(crc32c::crc32c(&header.encoded()), position);
        }

        if entry.key.value.is_some() {
            if entry.is_tombstone() {
                self.latest_by_key.remove(&encoded_key);
            } else {
                self.latest_by_key.insert(encoded_key, offset);
            }
        }

        self.next_offset = offset + 1;
        Ok(offset)
    }

    fn fits(&self, entry: &CacheEntry, delta: Option<&Bytes>) -> bool {
        let Some(segment) = self.active.as_ref() else {
            return false;
        };
        let log = segment.log_file();
        let encoded_len = entry.encode().len() as u32;
        if log.published() + encoded_len > log.capacity() {
            return false;
        }
        let index = segment.offset_index().file();
        if index.published() + 8 > index.capacity() {
            return false;
        }
        let hash = segment.hash_index().file();
        let hash_rows = 1 + entry.headers.len() as u32;
        if hash.published() + hash_rows * 8 > hash.capacity() {
            return false;
        }
        if let Some(delta_bytes) = delta {
            let delta_file = segment.delta_file();
            if delta_file.published() + 4 + delta_bytes.len() as u32 > delta_file.capacity() {
                return false;
            }
        }
        true
    }

    /// Seals the active segment and starts a new one at the next offset.
    pub fn roll(&mut self) -> Result<()> {
        if let Some(active) = self.active.take() {
            active.seal();
            debug!(
                base_offset = active.base_offset(),
                next_offset = self.next_offset,
                "sealed segment"
            );
        }
        self.active = Some(self.partition.append_segment(self.next_offset)?);
        Ok(())
    }

    /// Seals the active segment without starting a new one; the next
    /// append rolls.
    pub fn seal_active(&mut self) {
        if let Some(active) = self.active.take() {
            active.seal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use tempfile::tempdir;

    fn writer(config: CacheConfig) -> (tempfile::TempDir, Arc<Partition>, PartitionWriter) {
        let dir = tempdir().unwrap();
        let partition = Partition::new(dir.path().join("t-0"), config.clone()).unwrap();
        let writer = PartitionWriter::new(Arc::clone(&partition), config, 0);
        (dir, partition, writer)
    }

    fn read_at(partition: &Partition, offset: i64) -> CacheEntry {
        let node = partition.node_at(offset);
        let segment = node.segment().unwrap();
        let cursor = segment
            .offset_index()
            .first((offset - segment.base_offset()) as u32);
        let position = crate::cursor_record::cursor_value(cursor);
        CacheEntry::read(segment.log_file(), position).unwrap()
    }

    #[test]
    fn test_append_assigns_sequential_offsets() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        for i in 0..5 {
            let offset = writer
                .append(
                    KafkaKey::of("k"),
                    vec![],
                    Some(Bytes::from(format!("v{i}"))),
                    i,
                    None,
                )
                .unwrap();
            assert_eq!(offset, i);
        }
        assert_eq!(writer.next_offset(), 5);
        assert_eq!(read_at(&partition, 3).value, Some(Bytes::from("v3")));
    }

    #[test]
    fn test_ancestor_links_same_key() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("1")), 0, None)
            .unwrap();
        writer
            .append(KafkaKey::of("b"), vec![], Some(Bytes::from("1")), 0, None)
            .unwrap();
        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("2")), 0, None)
            .unwrap();

        assert_eq!(read_at(&partition, 0).ancestor, -1);
        assert_eq!(read_at(&partition, 1).ancestor, -1);
        assert_eq!(read_at(&partition, 2).ancestor, 0);
    }

    #[test]
    fn test_tombstone_clears_ancestor_tracking() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("1")), 0, None)
            .unwrap();
        writer
            .append(KafkaKey::of("a"), vec![], None, 0, None)
            .unwrap();
        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("3")), 0, None)
            .unwrap();

        // The tombstone itself still names its ancestor.
        assert_eq!(read_at(&partition, 1).ancestor, 0);
        assert!(read_at(&partition, 1).is_tombstone());
        // A record written after the tombstone starts a fresh lineage.
        assert_eq!(read_at(&partition, 2).ancestor, -1);
    }

    #[test]
    fn test_null_keys_never_link() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        writer
            .append(KafkaKey::null(), vec![], Some(Bytes::from("1")), 0, None)
            .unwrap();
        writer
            .append(KafkaKey::null(), vec![], Some(Bytes::from("2")), 0, None)
            .unwrap();

        assert_eq!(read_at(&partition, 1).ancestor, -1);
    }

    #[test]
    fn test_delta_stored_only_with_ancestor() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        writer
            .append(
                KafkaKey::of("a"),
                vec![],
                Some(Bytes::from("1")),
                0,
                Some(Bytes::from("patch-without-ancestor")),
            )
            .unwrap();
        writer
            .append(
                KafkaKey::of("a"),
                vec![],
                Some(Bytes::from("2")),
                0,
                Some(Bytes::from("patch")),
            )
            .unwrap();

        assert_eq!(read_at(&partition, 0).delta_position, -1);
        let second = read_at(&partition, 1);
        assert_ne!(second.delta_position, -1);

        let segment = partition.node_at(1).segment().unwrap().clone();
        assert_eq!(
            segment.read_delta(second.delta_position).unwrap(),
            Bytes::from("patch")
        );
    }

    #[test]
    fn test_rolls_to_new_segment_when_full() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        let value = Bytes::from(vec![b'x'; 200]);
        for i in 0..12 {
            writer
                .append(KafkaKey::of(format!("k{i}")), vec![], Some(value.clone()), 0, None)
                .unwrap();
        }

        let first = partition.node_at(0).segment().unwrap().clone();
        assert_eq!(first.base_offset(), 0);
        assert!(first.sealed());

        let last = partition.node_at(11).segment().unwrap().clone();
        assert!(last.base_offset() > 0);
        assert_eq!(read_at(&partition, 11).offset, 11);
    }

    #[test]
    fn test_ancestor_survives_roll() {
        let (_dir, partition, mut writer) = writer(CacheConfig::small());

        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("1")), 0, None)
            .unwrap();
        writer.roll().unwrap();
        writer
            .append(KafkaKey::of("a"), vec![], Some(Bytes::from("2")), 0, None)
            .unwrap();

        assert_eq!(read_at(&partition, 1).ancestor, 0);
    }
}
