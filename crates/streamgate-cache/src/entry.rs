//! On-disk entry codec.
//!
//! Log files hold length-prefixed flat records, little-endian:
//!
//! ```text
//! [frame_len u32]
//! [offset i64][timestamp i64][ancestor i64][delta_position i32]
//! [key_len i32][key bytes]            key_len == -1 for a null key
//! [value_len i32][value bytes]        value_len == -1 for a tombstone
//! [header_count i32]
//! per header: [name_len i32][name][value_len i32][value]
//! ```
//!
//! `ancestor` is the offset of the prior version of the same key (−1 when
//! none); `delta_position` is a byte offset into the segment's delta file
//! (−1 when no delta was encoded).

use bytes::{BufMut, Bytes, BytesMut};
use streamgate_core::types::{KafkaHeader, KafkaKey};

use crate::file::CacheFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Byte position of this entry in its log file. Not stored in the
    /// entry itself; assigned when the entry is read back.
    pub position: u32,
    pub offset: i64,
    pub timestamp: i64,
    pub ancestor: i64,
    pub delta_position: i32,
    pub key: KafkaKey,
    pub value: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

impl CacheEntry {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Serializes the entry, including the frame length prefix.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_i64_le(self.offset);
        body.put_i64_le(self.timestamp);
        body.put_i64_le(self.ancestor);
        body.put_i32_le(self.delta_position);
        put_bytes(&mut body, self.key.value.as_ref());
        put_bytes(&mut body, self.value.as_ref());
        body.put_i32_le(self.headers.len() as i32);
        for header in &self.headers {
            body.put_i32_le(header.name.len() as i32);
            body.put_slice(&header.name);
            put_bytes(&mut body, header.value.as_ref());
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32_le(body.len() as u32);
        frame.put_slice(&body);
        frame.freeze()
    }

    /// Reads the entry at `position`, or `None` when the bytes are not
    /// yet published or do not parse.
    pub fn read(log: &CacheFile, position: u32) -> Option<CacheEntry> {
        let len_bytes = log.read(position, 4)?;
        let frame_len = u32::from_le_bytes(len_bytes.try_into().ok()?);
        let body = log.read(position + 4, frame_len)?;
        let mut entry = decode_body(body)?;
        entry.position = position;
        Some(entry)
    }
}

fn put_bytes(buf: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(v) => {
            buf.put_i32_le(v.len() as i32);
            buf.put_slice(v);
        }
        None => buf.put_i32_le(-1),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn i32(&mut self) -> Option<i32> {
        let bytes = self.buf.get(self.at..self.at + 4)?;
        self.at += 4;
        Some(i32::from_le_bytes(bytes.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        let bytes = self.buf.get(self.at..self.at + 8)?;
        self.at += 8;
        Some(i64::from_le_bytes(bytes.try_into().ok()?))
    }

    fn bytes(&mut self, len: usize) -> Option<Bytes> {
        let bytes = self.buf.get(self.at..self.at + len)?;
        self.at += len;
        Some(Bytes::copy_from_slice(bytes))
    }

    fn nullable(&mut self) -> Option<Option<Bytes>> {
        let len = self.i32()?;
        if len < 0 {
            Some(None)
        } else {
            Some(Some(self.bytes(len as usize)?))
        }
    }
}

fn decode_body(body: &[u8]) -> Option<CacheEntry> {
    let mut reader = Reader { buf: body, at: 0 };
    let offset = reader.i64()?;
    let timestamp = reader.i64()?;
    let ancestor = reader.i64()?;
    let delta_position = reader.i32()?;
    let key = KafkaKey {
        value: reader.nullable()?,
    };
    let value = reader.nullable()?;
    let header_count = reader.i32()?;
    if header_count < 0 {
        return None;
    }
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name_len = reader.i32()?;
        if name_len < 0 {
            return None;
        }
        let name = reader.bytes(name_len as usize)?;
        let value = reader.nullable()?;
        headers.push(KafkaHeader { name, value });
    }
    Some(CacheEntry {
        position: 0,
        offset,
        timestamp,
        ancestor,
        delta_position,
        key,
        value,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry() -> CacheEntry {
        CacheEntry {
            position: 0,
            offset: 42,
            timestamp: 1_700_000_000_000,
            ancestor: 40,
            delta_position: 16,
            key: KafkaKey::of("user-1"),
            value: Some(Bytes::from_static(b"{\"n\":1}")),
            headers: vec![
                KafkaHeader::new("x", "1"),
                KafkaHeader::null_value("flag"),
            ],
        }
    }

    #[test]
    fn test_roundtrip_through_log_file() {
        let dir = tempdir().unwrap();
        let log = CacheFile::create(dir.path().join("0.log"), 4096).unwrap();

        let entry = sample_entry();
        let position = log.append(&entry.encode()).unwrap();

        let read = CacheEntry::read(&log, position).unwrap();
        assert_eq!(read.position, position);
        assert_eq!(read.offset, entry.offset);
        assert_eq!(read.timestamp, entry.timestamp);
        assert_eq!(read.ancestor, entry.ancestor);
        assert_eq!(read.delta_position, entry.delta_position);
        assert_eq!(read.key, entry.key);
        assert_eq!(read.value, entry.value);
        assert_eq!(read.headers, entry.headers);
    }

    #[test]
    fn test_tombstone_and_null_key() {
        let dir = tempdir().unwrap();
        let log = CacheFile::create(dir.path().join("0.log"), 4096).unwrap();

        let entry = CacheEntry {
            position: 0,
            offset: 7,
            timestamp: 0,
            ancestor: -1,
            delta_position: -1,
            key: KafkaKey::null(),
            value: None,
            headers: vec![],
        };
        let position = log.append(&entry.encode()).unwrap();
        let read = CacheEntry::read(&log, position).unwrap();

        assert!(read.is_tombstone());
        assert_eq!(read.key, KafkaKey::null());
        assert!(read.headers.is_empty());
    }

    #[test]
    fn test_read_unpublished_position_is_none() {
        let dir = tempdir().unwrap();
        let log = CacheFile::create(dir.path().join("0.log"), 4096).unwrap();
        log.append(&sample_entry().encode()).unwrap();

        assert!(CacheEntry::read(&log, log.published()).is_none());
        assert!(CacheEntry::read(&log, log.published() + 100).is_none());
    }

    #[test]
    fn test_consecutive_entries() {
        let dir = tempdir().unwrap();
        let log = CacheFile::create(dir.path().join("0.log"), 4096).unwrap();

        let mut first = sample_entry();
        first.offset = 0;
        let mut second = sample_entry();
        second.offset = 1;

        let p0 = log.append(&first.encode()).unwrap();
        let p1 = log.append(&second.encode()).unwrap();

        assert_eq!(CacheEntry::read(&log, p0).unwrap().offset, 0);
        assert_eq!(CacheEntry::read(&log, p1).unwrap().offset, 1);
    }
}
