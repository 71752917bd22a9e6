//! Filter condition trees.
//!
//! A filter is a tree of nodes sharing one contract:
//!
//! - `reset(segment, offset, latest_offset, position)` positions the node
//!   on a segment and returns its first candidate cursor;
//! - `next(cursor)` returns the next candidate at or after `cursor`;
//! - `test(entry)` decides whether a materialized entry really matches
//!   (index probes are hash-based, so candidates must be re-verified by
//!   byte comparison).
//!
//! `None` walks the offset index and accepts everything. `Key` and
//! `Header` probe the hash index with the CRC32C of their canonical
//! encoding. `And` runs a merge-join across its children's hash probes;
//! `Or` follows the minimum candidate. `Not` pairs a full scan with the
//! nested condition as an exclusion anchor. `HeaderSequence` seeks
//! through an `And` over its required values and re-scans headers in
//! template order on test.

use std::sync::Arc;

use bytes::Bytes;
use streamgate_core::types::{
    KafkaCondition, KafkaFilter, KafkaHeader, KafkaKey, KafkaValueMatch,
};

use crate::cursor_record::{
    cursor, cursor_index, cursor_retry_value, cursor_value, max_by_value, min_by_value, next_index,
    next_value, previous_index, NEXT_SEGMENT, POSITION_UNSET,
};
use crate::entry::CacheEntry;
use crate::segment::Segment;

pub enum FilterCondition {
    None_(NoneCondition),
    Key(KeyCondition),
    Header(HeaderCondition),
    Not(Box<NotCondition>),
    And(AndCondition),
    Or(OrCondition),
    HeaderSequence(HeaderSequenceCondition),
}

impl FilterCondition {
    pub fn reset(
        &mut self,
        segment: Option<&Arc<Segment>>,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> i64 {
        match self {
            FilterCondition::None_(c) => c.reset(segment, offset, position),
            FilterCondition::Key(c) => c.equals.reset(segment, offset, position),
            FilterCondition::Header(c) => c.equals.reset(segment, offset, position),
            FilterCondition::Not(c) => c.reset(segment, offset, latest_offset, position),
            FilterCondition::And(c) => c.reset(segment, offset, latest_offset, position),
            FilterCondition::Or(c) => c.reset(segment, offset, latest_offset, position),
            FilterCondition::HeaderSequence(c) => {
                c.seek.reset(segment, offset, latest_offset, position)
            }
        }
    }

    pub fn next(&mut self, cursor: i64) -> i64 {
        match self {
            FilterCondition::None_(c) => c.next(cursor),
            FilterCondition::Key(c) => c.equals.next(cursor),
            FilterCondition::Header(c) => c.equals.next(cursor),
            FilterCondition::Not(c) => c.next(cursor),
            FilterCondition::And(c) => c.next(cursor),
            FilterCondition::Or(c) => c.next(cursor),
            FilterCondition::HeaderSequence(c) => c.seek.next(cursor),
        }
    }

    pub fn test(&self, entry: &CacheEntry) -> bool {
        match self {
            FilterCondition::None_(_) => true,
            FilterCondition::Key(c) => entry.key == c.key,
            FilterCondition::Header(c) => entry.headers.iter().any(|h| *h == c.header),
            FilterCondition::Not(c) => c.test(entry),
            FilterCondition::And(c) => c.conditions.iter().all(|child| child.test(entry)),
            FilterCondition::Or(c) => c.conditions.iter().any(|child| child.test(entry)),
            FilterCondition::HeaderSequence(c) => c.test(entry),
        }
    }

    /// Builds the condition tree for a merged/fetch BEGIN: the filter
    /// list is a disjunction, each filter's conditions a conjunction,
    /// and no filters at all means match everything.
    pub fn from_filters(filters: &[KafkaFilter]) -> FilterCondition {
        if filters.is_empty() {
            return FilterCondition::None_(NoneCondition::new());
        }
        let mut conditions: Vec<FilterCondition> =
            filters.iter().map(Self::from_filter).collect();
        if conditions.len() == 1 {
            conditions.pop().expect("one condition")
        } else {
            FilterCondition::Or(OrCondition { conditions })
        }
    }

    fn from_filter(filter: &KafkaFilter) -> FilterCondition {
        let mut conditions: Vec<FilterCondition> = filter
            .conditions
            .iter()
            .map(Self::from_condition)
            .collect();
        if conditions.len() == 1 {
            conditions.pop().expect("one condition")
        } else {
            FilterCondition::And(AndCondition { conditions })
        }
    }

    fn from_condition(condition: &KafkaCondition) -> FilterCondition {
        match condition {
            KafkaCondition::Key(key) => FilterCondition::Key(KeyCondition::new(key.clone())),
            KafkaCondition::Header(header) => {
                FilterCondition::Header(HeaderCondition::new(header.clone()))
            }
            KafkaCondition::Not(nested) => FilterCondition::Not(Box::new(NotCondition::new(
                Self::from_condition(nested),
            ))),
            KafkaCondition::Headers { name, matches } => FilterCondition::HeaderSequence(
                HeaderSequenceCondition::new(name.clone(), matches.clone()),
            ),
        }
    }
}

impl std::fmt::Debug for FilterCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterCondition::None_(_) => write!(f, "None[]"),
            FilterCondition::Key(c) => write!(f, "Key[{:08x}]", c.equals.hash),
            FilterCondition::Header(c) => write!(f, "Header[{:08x}]", c.equals.hash),
            FilterCondition::Not(c) => write!(f, "Not[{:?}]", c.nested),
            FilterCondition::And(c) => write!(f, "And{:?}", c.conditions),
            FilterCondition::Or(c) => write!(f, "Or{:?}", c.conditions),
            FilterCondition::HeaderSequence(_) => write!(f, "Headers[]"),
        }
    }
}

// --- none ---------------------------------------------------------------

pub struct NoneCondition {
    segment: Option<Arc<Segment>>,
}

impl NoneCondition {
    fn new() -> Self {
        Self { segment: None }
    }

    fn reset(&mut self, segment: Option<&Arc<Segment>>, offset: i64, position: i32) -> i64 {
        debug_assert_eq!(position, POSITION_UNSET);
        match segment {
            Some(segment) => {
                self.segment = Some(Arc::clone(segment));
                segment.offset_index().first(offset_delta(segment, offset))
            }
            None => {
                self.segment = None;
                NEXT_SEGMENT
            }
        }
    }

    fn next(&self, cursor: i64) -> i64 {
        match &self.segment {
            Some(segment) => segment.offset_index().resolve(cursor),
            None => NEXT_SEGMENT,
        }
    }
}

fn offset_delta(segment: &Segment, offset: i64) -> u32 {
    (offset - segment.base_offset()).max(0) as u32
}

// --- equals (key / header) ----------------------------------------------

struct Equals {
    hash: u32,
    segment: Option<Arc<Segment>>,
}

impl Equals {
    fn new(comparable: &Bytes) -> Self {
        Self {
            hash: crc32c::crc32c(comparable),
            segment: None,
        }
    }

    fn reset(&mut self, segment: Option<&Arc<Segment>>, offset: i64, position: i32) -> i64 {
        match segment {
            Some(segment) => {
                self.segment = Some(Arc::clone(segment));

                let position = if position == POSITION_UNSET {
                    cursor_value(
                        segment
                            .offset_index()
                            .first(offset_delta(segment, offset)),
                    )
                } else {
                    position as u32
                };

                let hash_file = segment.hash_index();
                let first = hash_file.first(self.hash);
                if cursor_retry_value(first) || first == NEXT_SEGMENT {
                    first
                } else {
                    hash_file.ceiling(self.hash, cursor(cursor_index(first), position))
                }
            }
            None => {
                self.segment = None;
                NEXT_SEGMENT
            }
        }
    }

    fn next(&self, cursor: i64) -> i64 {
        match &self.segment {
            Some(segment) => segment.hash_index().ceiling(self.hash, cursor),
            None => NEXT_SEGMENT,
        }
    }
}

pub struct KeyCondition {
    equals: Equals,
    key: KafkaKey,
}

impl KeyCondition {
    fn new(key: KafkaKey) -> Self {
        Self {
            equals: Equals::new(&key.encoded()),
            key,
        }
    }
}

pub struct HeaderCondition {
    equals: Equals,
    header: KafkaHeader,
}

impl HeaderCondition {
    fn new(header: KafkaHeader) -> Self {
        Self {
            equals: Equals::new(&header.encoded()),
            header,
        }
    }
}

// --- not ------------------------------------------------------------------

pub struct NotCondition {
    none: NoneCondition,
    nested: FilterCondition,
    anchor: i64,
}

impl NotCondition {
    fn new(nested: FilterCondition) -> Self {
        Self {
            none: NoneCondition::new(),
            nested,
            anchor: 0,
        }
    }

    fn reset(
        &mut self,
        segment: Option<&Arc<Segment>>,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> i64 {
        let cursor = self.none.reset(segment, offset, position);
        self.anchor = self.nested.reset(segment, offset, latest_offset, position);
        cursor
    }

    fn next(&mut self, cursor: i64) -> i64 {
        let cursor_next = self.none.next(cursor);

        if cursor_retry_value(self.anchor) {
            self.anchor = self.nested.next(self.anchor);
        }

        while !cursor_retry_value(cursor_next)
            && self.anchor != NEXT_SEGMENT
            && cursor_value(cursor_next) > cursor_value(self.anchor)
        {
            self.anchor = self.nested.next(next_index(next_value(self.anchor)));
        }

        cursor_next
    }

    fn test(&self, entry: &CacheEntry) -> bool {
        // Entries below the anchor's position cannot be the nested
        // condition's current match; the nested test covers collisions at
        // the anchor itself.
        entry.position < cursor_value(self.anchor) || !self.nested.test(entry)
    }
}

// --- and -------------------------------------------------------------------

pub struct AndCondition {
    conditions: Vec<FilterCondition>,
}

impl AndCondition {
    fn reset(
        &mut self,
        segment: Option<&Arc<Segment>>,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> i64 {
        debug_assert!(!self.conditions.is_empty());
        let Some(seg) = segment else {
            for condition in &mut self.conditions {
                condition.reset(None, offset, latest_offset, position);
            }
            return NEXT_SEGMENT;
        };

        let position = if position == POSITION_UNSET {
            cursor_value(seg.offset_index().first(offset_delta(seg, offset))) as i32
        } else {
            position
        };

        let mut next_cursor_min = NEXT_SEGMENT;
        let mut next_cursor_max = cursor(0, 0);

        for (i, condition) in self.conditions.iter_mut().enumerate() {
            let next_cursor = condition.reset(Some(seg), offset, latest_offset, position);

            if i == 0 || next_cursor_min != NEXT_SEGMENT {
                next_cursor_min = min_by_value(next_cursor, next_cursor_min);
                next_cursor_max = max_by_value(next_cursor, next_cursor_max);
            }
        }

        if next_cursor_min == NEXT_SEGMENT {
            next_cursor_max = next_cursor_min;
        }

        if cursor_retry_value(next_cursor_max) || next_cursor_max == NEXT_SEGMENT {
            next_cursor_min = next_cursor_max;
        }

        next_cursor_min
    }

    // A parallel merge-join over the children's hash probes: advance
    // every child to a common position, bumping the floor to the current
    // maximum until all children agree.
    fn next(&mut self, cursor: i64) -> i64 {
        let mut next_cursor_min = if cursor_retry_value(cursor) {
            crate::cursor_record::cursor(cursor_index(cursor) - 1, 0)
        } else {
            previous_index(cursor)
        };
        let mut next_cursor_max;

        loop {
            next_cursor_max = next_index(next_cursor_min);
            next_cursor_min = i64::MAX;

            let next_cursor_and = next_cursor_max;

            for condition in &mut self.conditions {
                let next_cursor = condition.next(next_cursor_and);

                next_cursor_min = min_by_value(next_cursor, next_cursor_min);
                next_cursor_max = max_by_value(next_cursor, next_cursor_max);

                if next_cursor_min == NEXT_SEGMENT {
                    next_cursor_max = next_cursor_min;
                    break;
                }
            }

            if cursor_retry_value(next_cursor_max) || next_cursor_max == NEXT_SEGMENT {
                next_cursor_min = next_cursor_max;
                break;
            }

            if cursor_value(next_cursor_min) == cursor_value(next_cursor_max) {
                break;
            }
        }

        next_cursor_min
    }
}

// --- or --------------------------------------------------------------------

pub struct OrCondition {
    conditions: Vec<FilterCondition>,
}

impl OrCondition {
    fn reset(
        &mut self,
        segment: Option<&Arc<Segment>>,
        offset: i64,
        latest_offset: i64,
        position: i32,
    ) -> i64 {
        let Some(seg) = segment else {
            for condition in &mut self.conditions {
                condition.reset(None, offset, latest_offset, position);
            }
            return NEXT_SEGMENT;
        };

        let position = if position == POSITION_UNSET {
            cursor_value(seg.offset_index().first(offset_delta(seg, offset))) as i32
        } else {
            position
        };

        let mut next_cursor_min = NEXT_SEGMENT;
        for condition in &mut self.conditions {
            let next_cursor = condition.reset(Some(seg), offset, latest_offset, position);
            next_cursor_min = min_by_value(next_cursor, next_cursor_min);
        }

        next_cursor_min
    }

    fn next(&mut self, cursor: i64) -> i64 {
        let mut next_cursor_min = NEXT_SEGMENT;
        for condition in &mut self.conditions {
            let next_cursor = condition.next(cursor);
            next_cursor_min = min_by_value(next_cursor, next_cursor_min);
        }
        next_cursor_min
    }
}

// --- header sequence ---------------------------------------------------------

pub struct HeaderSequenceCondition {
    name: Bytes,
    matches: Vec<KafkaValueMatch>,
    /// Index seeking degenerates to the conjunction of the required
    /// values; an all-skip template falls back to a full scan.
    seek: Box<FilterCondition>,
}

impl HeaderSequenceCondition {
    fn new(name: Bytes, matches: Vec<KafkaValueMatch>) -> Self {
        let values: Vec<FilterCondition> = matches
            .iter()
            .filter_map(|m| match m {
                KafkaValueMatch::Value(value) => {
                    Some(FilterCondition::Header(HeaderCondition::new(
                        KafkaHeader::new(name.clone(), value.clone()),
                    )))
                }
                KafkaValueMatch::Skip => None,
            })
            .collect();

        let seek = match values.len() {
            0 => FilterCondition::None_(NoneCondition::new()),
            1 => {
                let mut values = values;
                values.pop().expect("one condition")
            }
            _ => FilterCondition::And(AndCondition { conditions: values }),
        };

        Self {
            name,
            matches,
            seek: Box::new(seek),
        }
    }

    fn test(&self, entry: &CacheEntry) -> bool {
        let mut progress = 0;
        let mut candidate = false;

        for header in &entry.headers {
            if progress < self.matches.len() {
                match &self.matches[progress] {
                    KafkaValueMatch::Value(value) => {
                        if header.name == self.name && header.value.as_ref() == Some(value) {
                            progress += 1;
                        }
                    }
                    KafkaValueMatch::Skip => {
                        if header.name == self.name {
                            progress += 1;
                        }
                    }
                }
                if progress == self.matches.len() {
                    candidate = true;
                }
            } else if candidate && header.name == self.name {
                // A same-name header after the template completed means
                // the headers are not the matched sequence.
                candidate = false;
            }
        }

        candidate
    }
}
