//! Cache-facing describe/meta/fetch service.
//!
//! The merged coordinator's substreams resolve to a route served by
//! these streams: *describe* answers with topic config snapshots, *meta*
//! with partition leadership snapshots, and *fetch* reads one partition
//! through a [`Cursor`] and ships records as credit permits. Each stream
//! serves exactly one subscriber; the shared server-side fan-in of a
//! full gateway deployment is out of scope here.
//!
//! Snapshot re-delivery is poll-driven: a zero-credit `Window` to a
//! stream's reply id makes it re-check the registry (or the partition
//! tail) and emit anything new. The registry records live watcher reply
//! ids per topic so an ingest or control plane can nudge exactly the
//! streams that care.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use streamgate_cache::{CacheConfig, Cursor, FilterCondition, Partition, PartitionWriter};
use streamgate_core::frame::{reply_id, Frame, FrameKind, FLAGS_COMPLETE};
use streamgate_core::types::{
    BeginEx, DataEx, DescribeDataEx, FetchDataEx, KafkaConfig, KafkaDelta, KafkaDeltaType,
    KafkaFilter, KafkaHeader, KafkaKey, KafkaOffset, MetaDataEx, PartitionLeader, ResetEx,
    DESCRIBE_CONFIG_NAMES, ERROR_NOT_LEADER_FOR_PARTITION,
};
use streamgate_core::GatewayConfig;

use crate::engine::{EngineContext, HandlerRef, StreamFactory, StreamHandler};
use crate::state::StreamState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherKind {
    Describe,
    Meta,
    Fetch,
}

struct Watcher {
    kind: WatcherKind,
    topic: String,
    reply_id: i64,
}

struct Topic {
    configs: Vec<KafkaConfig>,
    leaders: BTreeMap<i32, i32>,
    partitions: HashMap<i32, Arc<Partition>>,
}

/// In-memory topic table backed by on-disk partitions.
pub struct TopicRegistry {
    dir: PathBuf,
    gateway: GatewayConfig,
    cache: CacheConfig,
    topics: RefCell<HashMap<String, Topic>>,
    writers: RefCell<HashMap<(String, i32), PartitionWriter>>,
    watchers: RefCell<Vec<Watcher>>,
}

impl TopicRegistry {
    pub fn new(dir: impl Into<PathBuf>, gateway: GatewayConfig, cache: CacheConfig) -> Rc<Self> {
        Rc::new(Self {
            dir: dir.into(),
            gateway,
            cache,
            topics: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),
            watchers: RefCell::new(Vec::new()),
        })
    }

    /// Creates a topic with the given `(partition, leader)` table.
    pub fn create_topic(&self, name: &str, leaders: &[(i32, i32)]) {
        let topic = Topic {
            configs: default_configs(&self.cache),
            leaders: leaders.iter().copied().collect(),
            partitions: HashMap::new(),
        };
        self.topics.borrow_mut().insert(name.to_string(), topic);
    }

    /// Config snapshot; bootstraps a single-partition topic when
    /// enabled.
    pub fn describe(&self, name: &str) -> Option<Vec<KafkaConfig>> {
        if !self.topics.borrow().contains_key(name) {
            if !self.gateway.topic_bootstrap_enabled {
                return None;
            }
            debug!(topic = name, "bootstrapping topic");
            self.create_topic(name, &[(0, 1)]);
        }
        self.topics.borrow().get(name).map(|t| t.configs.clone())
    }

    pub fn set_config(&self, name: &str, config_name: &str, value: &str) {
        if let Some(topic) = self.topics.borrow_mut().get_mut(name) {
            if let Some(entry) = topic.configs.iter_mut().find(|c| c.name == config_name) {
                entry.value = value.to_string();
            }
        }
    }

    pub fn leaders(&self, name: &str) -> Option<Vec<PartitionLeader>> {
        self.topics.borrow().get(name).map(|t| {
            t.leaders
                .iter()
                .map(|(&partition_id, &leader_id)| PartitionLeader {
                    partition_id,
                    leader_id,
                })
                .collect()
        })
    }

    pub fn leader(&self, name: &str, partition_id: i32) -> Option<i32> {
        self.topics
            .borrow()
            .get(name)
            .and_then(|t| t.leaders.get(&partition_id).copied())
    }

    pub fn set_leader(&self, name: &str, partition_id: i32, leader_id: i32) {
        if let Some(topic) = self.topics.borrow_mut().get_mut(name) {
            topic.leaders.insert(partition_id, leader_id);
        }
    }

    /// The on-disk partition, created on first use.
    pub fn partition(&self, name: &str, partition_id: i32) -> Option<Arc<Partition>> {
        let mut topics = self.topics.borrow_mut();
        let topic = topics.get_mut(name)?;
        if !topic.leaders.contains_key(&partition_id) {
            return None;
        }
        if let Some(partition) = topic.partitions.get(&partition_id) {
            return Some(Arc::clone(partition));
        }
        let dir = self.dir.join(name).join(partition_id.to_string());
        let partition = Partition::new(dir, self.cache.clone()).ok()?;
        topic
            .partitions
            .insert(partition_id, Arc::clone(&partition));
        Some(partition)
    }

    /// Appends through the partition's long-lived writer (ancestor
    /// tracking lives in the writer, so there is exactly one).
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        name: &str,
        partition_id: i32,
        key: KafkaKey,
        headers: Vec<KafkaHeader>,
        value: Option<Bytes>,
        timestamp: i64,
        delta: Option<Bytes>,
    ) -> Option<i64> {
        let partition = self.partition(name, partition_id)?;
        let mut writers = self.writers.borrow_mut();
        let writer = writers
            .entry((name.to_string(), partition_id))
            .or_insert_with(|| PartitionWriter::new(partition, self.cache.clone(), 0));
        writer.append(key, headers, value, timestamp, delta).ok()
    }

    fn add_watcher(&self, kind: WatcherKind, topic: &str, reply_id: i64) {
        self.watchers.borrow_mut().push(Watcher {
            kind,
            topic: topic.to_string(),
            reply_id,
        });
    }

    fn remove_watcher(&self, reply_id: i64) {
        self.watchers.borrow_mut().retain(|w| w.reply_id != reply_id);
    }

    /// Reply ids of live streams watching `topic`; a zero-credit window
    /// to each makes them re-poll.
    pub fn watcher_reply_ids(&self, kind: WatcherKind, topic: &str) -> Vec<i64> {
        self.watchers
            .borrow()
            .iter()
            .filter(|w| w.kind == kind && w.topic == topic)
            .map(|w| w.reply_id)
            .collect()
    }
}

fn default_configs(cache: &CacheConfig) -> Vec<KafkaConfig> {
    DESCRIBE_CONFIG_NAMES
        .iter()
        .map(|&name| {
            let value = match name {
                "cleanup.policy" => "delete".to_string(),
                "max.message.bytes" => "1048588".to_string(),
                "segment.bytes" => cache.segment_bytes.to_string(),
                "segment.index.bytes" => cache.segment_index_bytes.to_string(),
                "segment.ms" => "604800000".to_string(),
                "retention.bytes" => "-1".to_string(),
                "retention.ms" => "604800000".to_string(),
                "delete.retention.ms" => "86400000".to_string(),
                "min.compaction.lag.ms" => "0".to_string(),
                "max.compaction.lag.ms" => "9223372036854775807".to_string(),
                "min.cleanable.dirty.ratio" => "0.5".to_string(),
                _ => String::new(),
            };
            KafkaConfig {
                name: name.to_string(),
                value,
            }
        })
        .collect()
}

/// Serves describe/meta/fetch streams for one bound route.
pub struct CacheServerFactory {
    registry: Rc<TopicRegistry>,
}

impl CacheServerFactory {
    pub fn new(registry: Rc<TopicRegistry>) -> Self {
        Self { registry }
    }
}

impl StreamFactory for CacheServerFactory {
    fn new_stream(&self, _ctx: &mut EngineContext, begin: &Frame) -> Option<HandlerRef> {
        let FrameKind::Begin { extension, .. } = &begin.kind else {
            return None;
        };
        match extension {
            Some(BeginEx::Describe(_)) => Some(Rc::new(RefCell::new(DescribeServerStream::new(
                Rc::clone(&self.registry),
                begin,
            )))),
            Some(BeginEx::Meta(_)) => Some(Rc::new(RefCell::new(MetaServerStream::new(
                Rc::clone(&self.registry),
                begin,
            )))),
            Some(BeginEx::Fetch(_)) => Some(Rc::new(RefCell::new(FetchServerStream::new(
                Rc::clone(&self.registry),
                begin,
            )))),
            _ => None,
        }
    }
}

// --- describe ---------------------------------------------------------------

struct DescribeServerStream {
    registry: Rc<TopicRegistry>,
    route_id: i64,
    initial_id: i64,
    reply_id: i64,
    topic: String,
    state: StreamState,
    reply_budget: i32,
    pending: bool,
    last_sent: Option<Vec<KafkaConfig>>,
}

impl DescribeServerStream {
    fn new(registry: Rc<TopicRegistry>, begin: &Frame) -> Self {
        Self {
            registry,
            route_id: begin.route_id,
            initial_id: begin.stream_id,
            reply_id: reply_id(begin.stream_id),
            topic: String::new(),
            state: StreamState::default(),
            reply_budget: 0,
            pending: false,
            last_sent: None,
        }
    }

    fn flush(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if !self.state.reply_opening() || self.state.initial_closed() {
            return;
        }
        let Some(configs) = self.registry.describe(&self.topic) else {
            return;
        };
        let changed = self.last_sent.as_ref() != Some(&configs);
        if !(self.pending || changed) {
            return;
        }

        let reserved: i32 = configs
            .iter()
            .map(|c| (c.name.len() + c.value.len() + 8) as i32)
            .sum::<i32>()
            + 8;
        if reserved > self.reply_budget {
            return;
        }

        self.reply_budget -= reserved;
        ctx.do_data(
            self.route_id,
            self.reply_id,
            trace_id,
            0,
            reserved,
            FLAGS_COMPLETE,
            Bytes::new(),
            Some(DataEx::Describe(DescribeDataEx {
                configs: configs.clone(),
            })),
        );
        self.pending = false;
        self.last_sent = Some(configs);
    }

    fn teardown(&mut self, ctx: &mut EngineContext) {
        self.registry.remove_watcher(self.reply_id);
        ctx.deregister(self.initial_id);
        ctx.deregister(self.reply_id);
    }
}

impl StreamHandler for DescribeServerStream {
    fn on_frame(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { extension, .. } => {
                let Some(BeginEx::Describe(ex)) = extension else {
                    return;
                };
                self.topic = ex.topic.clone();

                if self.registry.describe(&self.topic).is_none() {
                    ctx.do_reset(self.route_id, self.initial_id, trace_id, None);
                    self.teardown(ctx);
                    return;
                }

                self.state = self.state.opened_initial().opening_reply();
                ctx.do_window(self.route_id, self.initial_id, trace_id, 0, 0, 0);
                ctx.do_begin(self.route_id, self.reply_id, trace_id, 0, None);
                self.registry
                    .add_watcher(WatcherKind::Describe, &self.topic, self.reply_id);
                self.pending = true;
            }
            FrameKind::Window { credit, .. } => {
                self.state = self.state.opened_reply();
                self.reply_budget += credit;
                self.flush(ctx, trace_id);
            }
            FrameKind::End | FrameKind::Abort => {
                self.state = self.state.closed_initial();
                ctx.do_end(self.route_id, self.reply_id, trace_id);
                self.teardown(ctx);
            }
            FrameKind::Reset { .. } => {
                self.state = self.state.closed_reply();
                self.teardown(ctx);
            }
            FrameKind::Data { .. } => {}
        }
    }
}

// --- meta -------------------------------------------------------------------

struct MetaServerStream {
    registry: Rc<TopicRegistry>,
    route_id: i64,
    initial_id: i64,
    reply_id: i64,
    topic: String,
    state: StreamState,
    reply_budget: i32,
    pending: bool,
    last_sent: Option<Vec<PartitionLeader>>,
}

impl MetaServerStream {
    fn new(registry: Rc<TopicRegistry>, begin: &Frame) -> Self {
        Self {
            registry,
            route_id: begin.route_id,
            initial_id: begin.stream_id,
            reply_id: reply_id(begin.stream_id),
            topic: String::new(),
            state: StreamState::default(),
            reply_budget: 0,
            pending: false,
            last_sent: None,
        }
    }

    fn flush(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if !self.state.reply_opening() || self.state.initial_closed() {
            return;
        }
        let Some(partitions) = self.registry.leaders(&self.topic) else {
            return;
        };
        let changed = self.last_sent.as_ref() != Some(&partitions);
        if !(self.pending || changed) {
            return;
        }

        let reserved = (partitions.len() * 8 + 8) as i32;
        if reserved > self.reply_budget {
            return;
        }

        self.reply_budget -= reserved;
        ctx.do_data(
            self.route_id,
            self.reply_id,
            trace_id,
            0,
            reserved,
            FLAGS_COMPLETE,
            Bytes::new(),
            Some(DataEx::Meta(MetaDataEx {
                partitions: partitions.clone(),
            })),
        );
        self.pending = false;
        self.last_sent = Some(partitions);
    }

    fn teardown(&mut self, ctx: &mut EngineContext) {
        self.registry.remove_watcher(self.reply_id);
        ctx.deregister(self.initial_id);
        ctx.deregister(self.reply_id);
    }
}

impl StreamHandler for MetaServerStream {
    fn on_frame(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { extension, .. } => {
                let Some(BeginEx::Meta(ex)) = extension else {
                    return;
                };
                self.topic = ex.topic.clone();

                if self.registry.leaders(&self.topic).is_none() {
                    ctx.do_reset(self.route_id, self.initial_id, trace_id, None);
                    self.teardown(ctx);
                    return;
                }

                self.state = self.state.opened_initial().opening_reply();
                ctx.do_window(self.route_id, self.initial_id, trace_id, 0, 0, 0);
                ctx.do_begin(self.route_id, self.reply_id, trace_id, 0, None);
                self.registry
                    .add_watcher(WatcherKind::Meta, &self.topic, self.reply_id);
                self.pending = true;
            }
            FrameKind::Window { credit, .. } => {
                self.state = self.state.opened_reply();
                self.reply_budget += credit;
                self.flush(ctx, trace_id);
            }
            FrameKind::End | FrameKind::Abort => {
                self.state = self.state.closed_initial();
                ctx.do_end(self.route_id, self.reply_id, trace_id);
                self.teardown(ctx);
            }
            FrameKind::Reset { .. } => {
                self.state = self.state.closed_reply();
                self.teardown(ctx);
            }
            FrameKind::Data { .. } => {}
        }
    }
}

// --- fetch ------------------------------------------------------------------

struct FetchServerStream {
    registry: Rc<TopicRegistry>,
    route_id: i64,
    initial_id: i64,
    reply_id: i64,
    topic: String,
    partition_id: i32,
    leader_id: i32,
    filters: Vec<KafkaFilter>,
    delta_type: KafkaDeltaType,
    state: StreamState,
    reply_budget: i32,
    reply_budget_id: i64,
    reply_padding: i32,
    requested_offset: i64,
    cursor: Option<Cursor>,
}

impl FetchServerStream {
    fn new(registry: Rc<TopicRegistry>, begin: &Frame) -> Self {
        Self {
            registry,
            route_id: begin.route_id,
            initial_id: begin.stream_id,
            reply_id: reply_id(begin.stream_id),
            topic: String::new(),
            partition_id: 0,
            leader_id: 0,
            filters: Vec::new(),
            delta_type: KafkaDeltaType::None,
            state: StreamState::default(),
            reply_budget: 0,
            reply_budget_id: 0,
            reply_padding: 0,
            requested_offset: 0,
            cursor: None,
        }
    }

    fn flush(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.state.initial_closed() || self.state.reply_closed() {
            return;
        }

        // A stale leader stops serving; the coordinator recovers through
        // the next meta snapshot.
        match self.registry.leader(&self.topic, self.partition_id) {
            Some(leader) if leader == self.leader_id => {}
            _ => {
                debug!(
                    topic = %self.topic,
                    partition = self.partition_id,
                    leader = self.leader_id,
                    "fetch serving stale leader"
                );
                self.state = self.state.closed_initial();
                ctx.do_reset(
                    self.route_id,
                    self.initial_id,
                    trace_id,
                    Some(ResetEx {
                        error: ERROR_NOT_LEADER_FOR_PARTITION,
                    }),
                );
                return;
            }
        }

        let Some(partition) = self.registry.partition(&self.topic, self.partition_id) else {
            return;
        };

        if self.cursor.is_none() {
            if partition.head().sentinel() {
                return; // nothing retained yet
            }
            let start = if self.requested_offset < 0 {
                partition.base_offset()
            } else {
                self.requested_offset
            };
            let mut cursor = Cursor::new(
                FilterCondition::from_filters(&self.filters),
                self.delta_type,
            );
            cursor.init(partition.node_at(start), start, -1);
            self.cursor = Some(cursor);
        }

        loop {
            let cursor = self.cursor.as_mut().expect("initialized above");
            let Some(entry) = cursor.next() else {
                break;
            };

            let payload = entry.value.clone().unwrap_or_default();
            let reserved = reserved_for(&entry.key, &entry.headers, &payload, self.reply_padding);
            if reserved > self.reply_budget {
                // Not enough credit; the cursor was not advanced, so the
                // entry is re-read once more credit arrives.
                break;
            }
            // The per-stream window is an upper bound; the actual send
            // must claim from the shared merged budget so sibling
            // partitions cannot collectively overdraw the client window.
            if self.reply_budget_id > 0
                && !ctx.creditor.try_claim(self.reply_budget_id, reserved as i64)
            {
                break;
            }

            self.reply_budget -= reserved;
            ctx.do_data(
                self.route_id,
                self.reply_id,
                trace_id,
                self.reply_budget_id,
                reserved,
                FLAGS_COMPLETE,
                payload,
                Some(DataEx::Fetch(FetchDataEx {
                    timestamp: entry.timestamp,
                    partition: KafkaOffset::new(self.partition_id, entry.offset),
                    key: entry.key.clone(),
                    delta: KafkaDelta {
                        delta_type: if entry.ancestor != -1 {
                            self.delta_type
                        } else {
                            KafkaDeltaType::None
                        },
                        ancestor_offset: entry.ancestor,
                    },
                    headers: entry.headers.clone(),
                })),
            );
            cursor.advance(entry.offset + 1);
        }
    }

    fn teardown(&mut self, ctx: &mut EngineContext) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
        self.registry.remove_watcher(self.reply_id);
        ctx.deregister(self.initial_id);
        ctx.deregister(self.reply_id);
    }
}

fn reserved_for(key: &KafkaKey, headers: &[KafkaHeader], payload: &Bytes, padding: i32) -> i32 {
    let key_len = key.value.as_ref().map_or(0, |k| k.len());
    let headers_len: usize = headers
        .iter()
        .map(|h| h.name.len() + h.value.as_ref().map_or(0, |v| v.len()) + 8)
        .sum();
    (payload.len() + key_len + headers_len + 64) as i32 + padding
}

impl StreamHandler for FetchServerStream {
    fn on_frame(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin {
                affinity,
                extension,
            } => {
                let Some(BeginEx::Fetch(ex)) = extension else {
                    return;
                };
                self.topic = ex.topic.clone();
                self.partition_id = ex.partition.partition_id;
                self.leader_id = *affinity as i32;
                self.filters = ex.filters.clone();
                self.delta_type = ex.delta_type;
                self.requested_offset = ex.partition.partition_offset;

                match self.registry.leader(&self.topic, self.partition_id) {
                    None => {
                        ctx.do_reset(self.route_id, self.initial_id, trace_id, None);
                        self.teardown(ctx);
                        return;
                    }
                    Some(leader) if leader != self.leader_id => {
                        ctx.do_reset(
                            self.route_id,
                            self.initial_id,
                            trace_id,
                            Some(ResetEx {
                                error: ERROR_NOT_LEADER_FOR_PARTITION,
                            }),
                        );
                        self.teardown(ctx);
                        return;
                    }
                    Some(_) => {}
                }

                self.state = self.state.opened_initial().opening_reply();
                ctx.do_window(self.route_id, self.initial_id, trace_id, 0, 0, 0);
                ctx.do_begin(self.route_id, self.reply_id, trace_id, 0, None);
                self.registry
                    .add_watcher(WatcherKind::Fetch, &self.topic, self.reply_id);
            }
            FrameKind::Window {
                budget_id,
                credit,
                padding,
            } => {
                self.state = self.state.opened_reply();
                self.reply_budget_id = *budget_id;
                self.reply_budget += credit;
                self.reply_padding = *padding;
                self.flush(ctx, trace_id);
            }
            FrameKind::End | FrameKind::Abort => {
                self.state = self.state.closed_initial();
                if !self.state.reply_closed() {
                    self.state = self.state.closed_reply();
                    ctx.do_end(self.route_id, self.reply_id, trace_id);
                }
                self.teardown(ctx);
            }
            FrameKind::Reset { .. } => {
                self.state = self.state.closed_reply();
                self.teardown(ctx);
            }
            FrameKind::Data { .. } => {}
        }
    }
}
