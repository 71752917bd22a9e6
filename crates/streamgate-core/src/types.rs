//! Subscription, filter and stream-extension types.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Reset error code recovered internally by reopening the partition fetch.
pub const ERROR_NOT_LEADER_FOR_PARTITION: i32 = 6;

/// Pseudo partition id carrying the default offset in a merged BEGIN.
pub const DEFAULT_PARTITION: i32 = -1;

/// Offset sentinel meaning "earliest retained record".
pub const OFFSET_EARLIEST: i64 = -2;

/// Topic config keys requested on every describe stream.
pub const DESCRIBE_CONFIG_NAMES: [&str; 11] = [
    "cleanup.policy",
    "max.message.bytes",
    "segment.bytes",
    "segment.index.bytes",
    "segment.ms",
    "retention.bytes",
    "retention.ms",
    "delete.retention.ms",
    "min.compaction.lag.ms",
    "max.compaction.lag.ms",
    "min.cleanable.dirty.ratio",
];

/// A (partition, offset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaOffset {
    pub partition_id: i32,
    pub partition_offset: i64,
}

impl KafkaOffset {
    pub fn new(partition_id: i32, partition_offset: i64) -> Self {
        Self {
            partition_id,
            partition_offset,
        }
    }
}

/// Record key; `None` is a null key, distinct from an empty key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaKey {
    pub value: Option<Bytes>,
}

impl KafkaKey {
    pub fn null() -> Self {
        Self { value: None }
    }

    pub fn of(value: impl Into<Bytes>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    pub fn length(&self) -> i32 {
        self.value.as_ref().map(|v| v.len() as i32).unwrap_or(-1)
    }

    /// Canonical length-prefixed encoding, shared by the on-disk entry
    /// codec and the hash index (a null key encodes as length −1).
    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.value.as_ref().map_or(0, |v| v.len()));
        match &self.value {
            Some(v) => {
                buf.put_i32_le(v.len() as i32);
                buf.put_slice(v);
            }
            None => buf.put_i32_le(-1),
        }
        buf.freeze()
    }
}

/// A single record header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaHeader {
    pub name: Bytes,
    pub value: Option<Bytes>,
}

impl KafkaHeader {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn null_value(name: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    /// Canonical encoding, shared with the hash index.
    pub fn encoded(&self) -> Bytes {
        let value_len = self.value.as_ref().map_or(0, |v| v.len());
        let mut buf = BytesMut::with_capacity(8 + self.name.len() + value_len);
        buf.put_i32_le(self.name.len() as i32);
        buf.put_slice(&self.name);
        match &self.value {
            Some(v) => {
                buf.put_i32_le(v.len() as i32);
                buf.put_slice(v);
            }
            None => buf.put_i32_le(-1),
        }
        buf.freeze()
    }
}

/// Record-level diff transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KafkaDeltaType {
    #[default]
    None,
    JsonPatch,
}

/// Delta descriptor attached to each fetched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaDelta {
    pub delta_type: KafkaDeltaType,
    pub ancestor_offset: i64,
}

impl Default for KafkaDelta {
    fn default() -> Self {
        Self {
            delta_type: KafkaDeltaType::None,
            ancestor_offset: -1,
        }
    }
}

/// One position of a header-sequence template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaValueMatch {
    Value(Bytes),
    Skip,
}

/// A single predicate inside a filter conjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaCondition {
    Key(KafkaKey),
    Header(KafkaHeader),
    Not(Box<KafkaCondition>),
    Headers {
        name: Bytes,
        matches: Vec<KafkaValueMatch>,
    },
}

impl KafkaCondition {
    /// Validates and canonicalizes the condition.
    ///
    /// `NOT(NOT(x))` collapses to `x` only when `x` is a key or header
    /// predicate; a doubly negated header sequence is rejected rather
    /// than guessed at.
    pub fn normalize(self) -> Result<KafkaCondition> {
        match self {
            KafkaCondition::Not(inner) => match *inner {
                KafkaCondition::Not(innermost) => match *innermost {
                    c @ (KafkaCondition::Key(_) | KafkaCondition::Header(_)) => Ok(c),
                    other => Err(Error::InvalidFilter(format!(
                        "double negation is only defined for key and header conditions, got {other:?}"
                    ))),
                },
                nested => Ok(KafkaCondition::Not(Box::new(nested.normalize()?))),
            },
            other => Ok(other),
        }
    }
}

/// A conjunction of conditions; a list of filters is a disjunction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaFilter {
    pub conditions: Vec<KafkaCondition>,
}

impl KafkaFilter {
    pub fn new(conditions: Vec<KafkaCondition>) -> Self {
        Self { conditions }
    }

    pub fn normalize(self) -> Result<KafkaFilter> {
        if self.conditions.is_empty() {
            return Err(Error::InvalidFilter(
                "a filter must contain at least one condition".to_string(),
            ));
        }
        let conditions = self
            .conditions
            .into_iter()
            .map(KafkaCondition::normalize)
            .collect::<Result<Vec<_>>>()?;
        Ok(KafkaFilter { conditions })
    }
}

/// Partition leadership row in a meta snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub partition_id: i32,
    pub leader_id: i32,
}

/// A topic config entry in a describe snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    pub name: String,
    pub value: String,
}

// --- stream extensions -------------------------------------------------

#[derive(Debug, Clone)]
pub enum BeginEx {
    Merged(MergedBeginEx),
    Describe(DescribeBeginEx),
    Meta(MetaBeginEx),
    Fetch(FetchBeginEx),
}

#[derive(Debug, Clone)]
pub struct MergedBeginEx {
    pub topic: String,
    pub partitions: Vec<KafkaOffset>,
    pub filters: Vec<KafkaFilter>,
    pub delta_type: KafkaDeltaType,
}

#[derive(Debug, Clone)]
pub struct DescribeBeginEx {
    pub topic: String,
    pub configs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MetaBeginEx {
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct FetchBeginEx {
    pub topic: String,
    pub partition: KafkaOffset,
    pub filters: Vec<KafkaFilter>,
    pub delta_type: KafkaDeltaType,
}

#[derive(Debug, Clone)]
pub enum DataEx {
    Merged(MergedDataEx),
    Describe(DescribeDataEx),
    Meta(MetaDataEx),
    Fetch(FetchDataEx),
}

/// Per-record extension on the merged (client-facing) reply.
#[derive(Debug, Clone)]
pub struct MergedDataEx {
    pub timestamp: i64,
    pub partition: KafkaOffset,
    /// Snapshot of the next offset per partition, for client resume.
    pub progress: Vec<KafkaOffset>,
    pub key: KafkaKey,
    pub delta: KafkaDelta,
    pub headers: Vec<KafkaHeader>,
}

#[derive(Debug, Clone)]
pub struct DescribeDataEx {
    pub configs: Vec<KafkaConfig>,
}

#[derive(Debug, Clone)]
pub struct MetaDataEx {
    pub partitions: Vec<PartitionLeader>,
}

/// Per-record extension on an unmerged partition fetch reply.
#[derive(Debug, Clone)]
pub struct FetchDataEx {
    pub timestamp: i64,
    pub partition: KafkaOffset,
    pub key: KafkaKey,
    pub delta: KafkaDelta,
    pub headers: Vec<KafkaHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetEx {
    pub error: i32,
}
