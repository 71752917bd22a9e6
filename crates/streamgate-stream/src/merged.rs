//! Merged fetch stream coordinator.
//!
//! One coordinator per client subscription. On the client's `Begin` it
//! opens a *describe* substream (topic configuration), on the first
//! config snapshot a *meta* substream (partition -> leader table), and
//! on each meta snapshot one *fetch* substream per partition, rooted at
//! the client-supplied offset or the default. Fetch records are
//! forwarded to the client with a rebuilt extension carrying the full
//! per-partition progress vector, so a client can resume exactly after a
//! disconnect.
//!
//! Leadership churn is reconciled against the meta snapshots: a fetch
//! substream whose partition moved leaders is closed and replaced at the
//! retained progress offset. A fetch substream reset with
//! `NOT_LEADER_FOR_PARTITION` is dropped and recovered the same way;
//! any other downstream failure cascades and closes the whole merged
//! stream.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use streamgate_core::frame::{reply_id, Frame, FrameKind};
use streamgate_core::types::{
    BeginEx, DataEx, DescribeBeginEx, FetchBeginEx, FetchDataEx, KafkaDeltaType, KafkaFilter,
    KafkaOffset, MergedDataEx, MetaBeginEx, PartitionLeader, ResetEx, DEFAULT_PARTITION,
    DESCRIBE_CONFIG_NAMES, ERROR_NOT_LEADER_FOR_PARTITION, OFFSET_EARLIEST,
};

use crate::budget::NO_CREDITOR_INDEX;
use crate::engine::{EngineContext, HandlerRef, StreamFactory, StreamHandler};
use crate::state::StreamState;

/// Creates a merged fetch coordinator per client `Begin`; substreams are
/// opened against `resolved_id`, the route of the topic cache.
pub struct MergedStreamFactory {
    resolved_id: i64,
}

impl MergedStreamFactory {
    pub fn new(resolved_id: i64) -> Self {
        Self { resolved_id }
    }
}

impl StreamFactory for MergedStreamFactory {
    fn new_stream(&self, _ctx: &mut EngineContext, begin: &Frame) -> Option<HandlerRef> {
        let FrameKind::Begin {
            affinity,
            extension: Some(BeginEx::Merged(merged)),
        } = &begin.kind
        else {
            return None;
        };

        let filters = merged
            .filters
            .iter()
            .cloned()
            .map(KafkaFilter::normalize)
            .collect::<Result<Vec<_>, _>>()
            .ok()?;

        let default_offset = merged
            .partitions
            .iter()
            .find(|p| p.partition_id == DEFAULT_PARTITION)
            .map(|p| p.partition_offset)
            .unwrap_or(OFFSET_EARLIEST);

        let mut next_offsets_by_id = BTreeMap::new();
        for partition in &merged.partitions {
            if partition.partition_id >= 0 {
                next_offsets_by_id.insert(partition.partition_id, partition.partition_offset);
            }
        }

        Some(Rc::new(RefCell::new(MergedFetchStream {
            route_id: begin.route_id,
            initial_id: begin.stream_id,
            reply_id: reply_id(begin.stream_id),
            affinity: *affinity,
            topic: merged.topic.clone(),
            resolved_id: self.resolved_id,
            describe: DescribeStream::default(),
            meta: MetaStream::default(),
            fetch_streams: Vec::new(),
            next_offsets_by_id,
            default_offset,
            filters,
            delta_type: merged.delta_type,
            state: StreamState::default(),
            reply_budget_id: 0,
            reply_budget: 0,
            reply_padding: 0,
            fetch_stream_index: 0,
            merged_reply_budget_id: NO_CREDITOR_INDEX,
        })))
    }
}

#[derive(Default)]
struct DescribeStream {
    initial_id: i64,
    reply_id: i64,
    state: StreamState,
    reply_budget: i32,
}

#[derive(Default)]
struct MetaStream {
    initial_id: i64,
    reply_id: i64,
    state: StreamState,
    reply_budget: i32,
}

struct FetchStream {
    partition_id: i32,
    leader_id: i32,
    initial_id: i64,
    reply_id: i64,
    state: StreamState,
    reply_budget: i32,
}

pub struct MergedFetchStream {
    route_id: i64,
    initial_id: i64,
    reply_id: i64,
    affinity: i64,
    topic: String,
    resolved_id: i64,
    describe: DescribeStream,
    meta: MetaStream,
    fetch_streams: Vec<FetchStream>,
    next_offsets_by_id: BTreeMap<i32, i64>,
    default_offset: i64,
    filters: Vec<KafkaFilter>,
    delta_type: KafkaDeltaType,
    state: StreamState,
    reply_budget_id: i64,
    reply_budget: i32,
    reply_padding: i32,
    fetch_stream_index: usize,
    merged_reply_budget_id: i64,
}

impl StreamHandler for MergedFetchStream {
    fn on_frame(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let id = frame.stream_id;
        if id == self.initial_id || id == self.reply_id {
            self.on_merged(ctx, frame);
        } else if id == self.describe.initial_id || id == self.describe.reply_id {
            self.on_describe(ctx, frame);
        } else if id == self.meta.initial_id || id == self.meta.reply_id {
            self.on_meta(ctx, frame);
        } else if let Some(index) = self
            .fetch_streams
            .iter()
            .position(|f| f.initial_id == id || f.reply_id == id)
        {
            self.on_fetch(ctx, index, frame);
        }
    }
}

// --- client-facing stream ------------------------------------------------

impl MergedFetchStream {
    fn on_merged(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { .. } => self.on_merged_initial_begin(ctx, trace_id),
            FrameKind::End => self.on_merged_initial_end(ctx, trace_id),
            FrameKind::Abort => self.on_merged_initial_abort(ctx, trace_id),
            FrameKind::Window {
                budget_id,
                credit,
                padding,
            } => self.on_merged_reply_window(ctx, trace_id, *budget_id, *credit, *padding),
            FrameKind::Reset { .. } => self.on_merged_reply_reset(ctx, trace_id),
            FrameKind::Data { .. } => {}
        }
    }

    fn on_merged_initial_begin(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert_eq!(self.state, StreamState::default());
        self.state = self.state.opening_initial();

        debug!(topic = %self.topic, "merged stream opening");
        self.do_describe_initial_begin(ctx, trace_id);
    }

    fn on_merged_initial_end(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert!(!self.state.initial_closed());
        self.state = self.state.closed_initial();

        self.do_describe_initial_end_if_necessary(ctx, trace_id);
        self.do_meta_initial_end_if_necessary(ctx, trace_id);
        for index in 0..self.fetch_streams.len() {
            self.do_fetch_initial_end_if_necessary(ctx, index, trace_id);
        }

        self.do_merged_reply_end_if_necessary(ctx, trace_id);
    }

    fn on_merged_initial_abort(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert!(!self.state.initial_closed());
        self.state = self.state.closed_initial();

        self.do_describe_initial_abort_if_necessary(ctx, trace_id);
        self.do_meta_initial_abort_if_necessary(ctx, trace_id);
        for index in 0..self.fetch_streams.len() {
            self.do_fetch_initial_abort_if_necessary(ctx, index, trace_id);
        }

        self.do_merged_reply_abort_if_necessary(ctx, trace_id);
    }

    fn on_merged_reply_window(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        budget_id: i64,
        credit: i32,
        padding: i32,
    ) {
        self.reply_budget_id = budget_id;
        self.reply_budget += credit;
        self.reply_padding = padding;

        self.state = self.state.opened_reply();

        if self.merged_reply_budget_id == NO_CREDITOR_INDEX {
            self.merged_reply_budget_id = ctx.creditor.acquire(self.reply_id, budget_id);
        }
        ctx.creditor
            .credit(trace_id, self.merged_reply_budget_id, credit as i64);

        // Round-robin from the saved index so tail partitions are not
        // starved under tight credit.
        let fetch_stream_count = self.fetch_streams.len();
        if self.fetch_stream_index >= fetch_stream_count {
            self.fetch_stream_index = 0;
        }
        for index in (self.fetch_stream_index..fetch_stream_count)
            .chain(0..self.fetch_stream_index)
        {
            self.do_fetch_reply_window_if_necessary(ctx, index, trace_id);
        }
        self.fetch_stream_index += 1;
    }

    fn on_merged_reply_reset(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        self.state = self.state.closed_reply();

        self.do_describe_reply_reset_if_necessary(ctx, trace_id);
        self.do_meta_reply_reset_if_necessary(ctx, trace_id);
        for index in 0..self.fetch_streams.len() {
            self.do_fetch_reply_reset_if_necessary(ctx, index, trace_id);
        }

        self.do_merged_initial_reset_if_necessary(ctx, trace_id);
        self.release_budget(ctx);
        self.finalize_if_closed(ctx);
    }

    fn do_merged_reply_begin_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if !self.state.reply_opening() {
            self.do_merged_reply_begin(ctx, trace_id);
        }
    }

    fn do_merged_reply_begin(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert!(!self.state.reply_opening());
        self.state = self.state.opening_reply();

        ctx.do_begin(
            self.route_id,
            self.reply_id,
            trace_id,
            self.affinity,
            None,
        );
    }

    fn do_merged_reply_data(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        flags: u8,
        reserved: i32,
        payload: bytes::Bytes,
        fetch_ex: Option<&FetchDataEx>,
    ) {
        self.reply_budget -= reserved;
        if self.reply_budget < 0 {
            self.do_merged_cleanup(ctx, trace_id);
            return;
        }

        let extension = if flags != 0 {
            let fetch_ex = fetch_ex.expect("framed record carries an extension");
            self.next_offsets_by_id.insert(
                fetch_ex.partition.partition_id,
                fetch_ex.partition.partition_offset + 1,
            );

            let progress = self
                .next_offsets_by_id
                .iter()
                .map(|(&partition_id, &partition_offset)| {
                    KafkaOffset::new(partition_id, partition_offset)
                })
                .collect();

            Some(DataEx::Merged(MergedDataEx {
                timestamp: fetch_ex.timestamp,
                partition: fetch_ex.partition,
                progress,
                key: fetch_ex.key.clone(),
                delta: fetch_ex.delta,
                headers: fetch_ex.headers.clone(),
            }))
        } else {
            None
        };

        ctx.do_data(
            self.route_id,
            self.reply_id,
            trace_id,
            self.reply_budget_id,
            reserved,
            flags,
            payload,
            extension,
        );
    }

    fn do_merged_reply_end_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.state.reply_opening() && !self.state.reply_closed() {
            self.state = self.state.closed_reply();
            ctx.do_end(self.route_id, self.reply_id, trace_id);
            self.release_budget(ctx);
            self.finalize_if_closed(ctx);
        }
    }

    fn do_merged_reply_abort_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.state.reply_opening() && !self.state.reply_closed() {
            self.state = self.state.closed_reply();
            ctx.do_abort(self.route_id, self.reply_id, trace_id);
            self.release_budget(ctx);
            self.finalize_if_closed(ctx);
        }
    }

    fn do_merged_initial_window_if_necessary(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        budget_id: i64,
        credit: i32,
        padding: i32,
    ) {
        if !self.state.initial_opened() || credit > 0 {
            self.state = self.state.opened_initial();
            ctx.do_window(
                self.route_id,
                self.initial_id,
                trace_id,
                budget_id,
                credit,
                padding,
            );
        }
    }

    fn do_merged_initial_reset_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.state.initial_opening() && !self.state.initial_closed() {
            self.state = self.state.closed_initial();
            ctx.do_reset(self.route_id, self.initial_id, trace_id, None);
        }
    }

    /// Cascade close: release the merged budget, close both client
    /// halves, and tear down every substream.
    fn do_merged_cleanup(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        self.release_budget(ctx);

        self.do_merged_initial_reset_if_necessary(ctx, trace_id);
        self.do_merged_reply_abort_if_necessary(ctx, trace_id);

        self.do_describe_cleanup(ctx, trace_id);
        self.do_meta_cleanup(ctx, trace_id);
        for index in 0..self.fetch_streams.len() {
            self.do_fetch_cleanup(ctx, index, trace_id);
        }
        self.finalize(ctx);
    }

    fn release_budget(&mut self, ctx: &mut EngineContext) {
        if self.merged_reply_budget_id != NO_CREDITOR_INDEX {
            ctx.creditor.release(self.merged_reply_budget_id);
            self.merged_reply_budget_id = NO_CREDITOR_INDEX;
        }
    }

    fn finalize_if_closed(&mut self, ctx: &mut EngineContext) {
        if self.state.closed() {
            self.finalize(ctx);
        }
    }

    fn finalize(&mut self, ctx: &mut EngineContext) {
        ctx.deregister(self.initial_id);
        ctx.deregister(self.reply_id);
        for id in [
            self.describe.initial_id,
            self.describe.reply_id,
            self.meta.initial_id,
            self.meta.reply_id,
        ] {
            if id != 0 {
                ctx.deregister(id);
            }
        }
        for fetch in &self.fetch_streams {
            ctx.deregister(fetch.initial_id);
            ctx.deregister(fetch.reply_id);
        }
    }

    fn on_topic_config_changed(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        self.do_meta_initial_begin_if_necessary(ctx, trace_id);
    }

    fn on_topic_meta_data_changed(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        partitions: &[PartitionLeader],
    ) {
        for partition in partitions {
            self.on_partition_meta_data_changed(ctx, trace_id, *partition);
        }
    }

    fn on_partition_meta_data_changed(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        partition: PartitionLeader,
    ) {
        if self.state.initial_closed() {
            return;
        }

        let existing = self
            .fetch_streams
            .iter()
            .position(|f| f.partition_id == partition.partition_id);

        match existing {
            Some(index) if self.fetch_streams[index].leader_id == partition.leader_id => {
                // Stale or unchanged leadership: no-op.
            }
            Some(index) => {
                debug!(
                    topic = %self.topic,
                    partition = partition.partition_id,
                    old_leader = self.fetch_streams[index].leader_id,
                    new_leader = partition.leader_id,
                    "partition leader changed"
                );
                self.do_fetch_initial_end_if_necessary(ctx, index, trace_id);
                self.do_fetch_reply_reset_if_necessary(ctx, index, trace_id);
                let old = self.fetch_streams.remove(index);
                ctx.deregister(old.initial_id);
                ctx.deregister(old.reply_id);

                self.do_fetch_initial_begin(ctx, trace_id, partition.partition_id, partition.leader_id);
            }
            None => {
                self.do_fetch_initial_begin(ctx, trace_id, partition.partition_id, partition.leader_id);
            }
        }
    }

    fn on_partition_ready(&mut self, ctx: &mut EngineContext, trace_id: i64, partition_id: i32) {
        self.next_offsets_by_id
            .entry(partition_id)
            .or_insert(self.default_offset);

        if self.next_offsets_by_id.len() == self.fetch_streams.len() {
            self.do_merged_reply_begin_if_necessary(ctx, trace_id);

            if self.state.initial_closed() {
                self.do_merged_reply_end_if_necessary(ctx, trace_id);
            }
        }
    }
}

// --- describe substream ---------------------------------------------------

impl MergedFetchStream {
    fn on_describe(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { .. } => {
                self.describe.state = self.describe.state.opened_reply();
                self.do_describe_reply_window(ctx, trace_id, 8192);
            }
            FrameKind::Data {
                reserved,
                extension,
                ..
            } => {
                self.describe.reply_budget -= reserved;
                if self.describe.reply_budget < 0 {
                    self.do_merged_cleanup(ctx, trace_id);
                } else {
                    if let Some(DataEx::Describe(_)) = extension {
                        self.on_topic_config_changed(ctx, trace_id);
                    }
                    self.do_describe_reply_window(ctx, trace_id, *reserved);
                }
            }
            FrameKind::End => {
                self.describe.state = self.describe.state.closed_reply();
                self.do_merged_reply_begin_if_necessary(ctx, trace_id);
                self.do_merged_reply_end_if_necessary(ctx, trace_id);
                self.do_describe_initial_end_if_necessary(ctx, trace_id);
            }
            FrameKind::Abort => {
                self.describe.state = self.describe.state.closed_reply();
                self.do_merged_reply_abort_if_necessary(ctx, trace_id);
                self.do_describe_initial_abort_if_necessary(ctx, trace_id);
            }
            FrameKind::Reset { .. } => {
                // Fatal: the topic cache refused the describe.
                self.describe.state = self.describe.state.closed_initial();
                self.do_merged_cleanup(ctx, trace_id);
            }
            FrameKind::Window { .. } => {
                if !self.describe.state.initial_opened() {
                    self.describe.state = self.describe.state.opened_initial();
                    self.do_merged_initial_window_if_necessary(ctx, trace_id, 0, 0, 0);
                }
            }
        }
    }

    fn do_describe_initial_begin(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert_eq!(self.describe.state, StreamState::default());
        self.describe.state = self.describe.state.opening_initial();

        self.describe.initial_id = ctx.supply_initial_id();
        self.describe.reply_id = reply_id(self.describe.initial_id);
        ctx.register_sender(self.describe.initial_id);
        ctx.register_receiver(self.describe.reply_id);

        ctx.do_begin(
            self.resolved_id,
            self.describe.initial_id,
            trace_id,
            0,
            Some(BeginEx::Describe(DescribeBeginEx {
                topic: self.topic.clone(),
                configs: DESCRIBE_CONFIG_NAMES
                    .iter()
                    .map(|name| name.to_string())
                    .collect(),
            })),
        );
    }

    fn do_describe_initial_end_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.describe.state.initial_opening() && !self.describe.state.initial_closed() {
            self.describe.state = self.describe.state.closed_initial();
            ctx.do_end(self.resolved_id, self.describe.initial_id, trace_id);
        }
    }

    fn do_describe_initial_abort_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.describe.state.initial_opening() && !self.describe.state.initial_closed() {
            self.describe.state = self.describe.state.closed_initial();
            ctx.do_abort(self.resolved_id, self.describe.initial_id, trace_id);
        }
    }

    fn do_describe_reply_window(&mut self, ctx: &mut EngineContext, trace_id: i64, credit: i32) {
        self.describe.state = self.describe.state.opened_reply();
        self.describe.reply_budget += credit;
        ctx.do_window(
            self.resolved_id,
            self.describe.reply_id,
            trace_id,
            0,
            credit,
            self.reply_padding,
        );
    }

    fn do_describe_reply_reset_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.describe.state.reply_opening() && !self.describe.state.reply_closed() {
            self.describe.state = self.describe.state.closed_reply();
            ctx.do_reset(self.resolved_id, self.describe.reply_id, trace_id, None);
        }
    }

    fn do_describe_cleanup(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        self.do_describe_initial_abort_if_necessary(ctx, trace_id);
        self.do_describe_reply_reset_if_necessary(ctx, trace_id);
    }

    fn do_meta_initial_end_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.meta.state.initial_opening() && !self.meta.state.initial_closed() {
            self.meta.state = self.meta.state.closed_initial();
            ctx.do_end(self.resolved_id, self.meta.initial_id, trace_id);
        }
    }

    fn do_meta_initial_abort_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.meta.state.initial_opening() && !self.meta.state.initial_closed() {
            self.meta.state = self.meta.state.closed_initial();
            ctx.do_abort(self.resolved_id, self.meta.initial_id, trace_id);
        }
    }
}

// --- meta substream --------------------------------------------------------

impl MergedFetchStream {
    fn on_meta(&mut self, ctx: &mut EngineContext, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { .. } => {
                self.meta.state = self.meta.state.opened_reply();
                self.do_meta_reply_window(ctx, trace_id, 8192);
            }
            FrameKind::Data {
                reserved,
                extension,
                ..
            } => {
                self.meta.reply_budget -= reserved;
                if self.meta.reply_budget < 0 {
                    self.do_merged_cleanup(ctx, trace_id);
                } else {
                    if let Some(DataEx::Meta(meta)) = extension {
                        let partitions = meta.partitions.clone();
                        self.on_topic_meta_data_changed(ctx, trace_id, &partitions);
                    }
                    self.do_meta_reply_window(ctx, trace_id, *reserved);
                }
            }
            FrameKind::End => {
                self.meta.state = self.meta.state.closed_reply();
                self.do_merged_reply_begin_if_necessary(ctx, trace_id);
                self.do_merged_reply_end_if_necessary(ctx, trace_id);
                self.do_meta_initial_end_if_necessary(ctx, trace_id);
            }
            FrameKind::Abort => {
                self.meta.state = self.meta.state.closed_reply();
                self.do_merged_reply_abort_if_necessary(ctx, trace_id);
                self.do_meta_initial_abort_if_necessary(ctx, trace_id);
            }
            FrameKind::Reset { .. } => {
                // Fatal: leadership can no longer be observed.
                self.meta.state = self.meta.state.closed_initial();
                self.do_merged_cleanup(ctx, trace_id);
            }
            FrameKind::Window { .. } => {
                if !self.meta.state.initial_opened() {
                    self.meta.state = self.meta.state.opened_initial();
                    self.do_merged_initial_window_if_necessary(ctx, trace_id, 0, 0, 0);
                }
            }
        }
    }

    fn do_meta_initial_begin_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if !self.meta.state.initial_opening() {
            self.do_meta_initial_begin(ctx, trace_id);
        }
    }

    fn do_meta_initial_begin(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        debug_assert_eq!(self.meta.state, StreamState::default());
        self.meta.state = self.meta.state.opening_initial();

        self.meta.initial_id = ctx.supply_initial_id();
        self.meta.reply_id = reply_id(self.meta.initial_id);
        ctx.register_sender(self.meta.initial_id);
        ctx.register_receiver(self.meta.reply_id);

        ctx.do_begin(
            self.resolved_id,
            self.meta.initial_id,
            trace_id,
            0,
            Some(BeginEx::Meta(MetaBeginEx {
                topic: self.topic.clone(),
            })),
        );
    }

    fn do_meta_reply_window(&mut self, ctx: &mut EngineContext, trace_id: i64, credit: i32) {
        self.meta.state = self.meta.state.opened_reply();
        self.meta.reply_budget += credit;
        ctx.do_window(
            self.resolved_id,
            self.meta.reply_id,
            trace_id,
            0,
            credit,
            self.reply_padding,
        );
    }

    fn do_meta_reply_reset_if_necessary(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        if self.meta.state.reply_opening() && !self.meta.state.reply_closed() {
            self.meta.state = self.meta.state.closed_reply();
            ctx.do_reset(self.resolved_id, self.meta.reply_id, trace_id, None);
        }
    }

    fn do_meta_cleanup(&mut self, ctx: &mut EngineContext, trace_id: i64) {
        self.do_meta_initial_abort_if_necessary(ctx, trace_id);
        self.do_meta_reply_reset_if_necessary(ctx, trace_id);
    }
}

// --- fetch substreams -------------------------------------------------------

impl MergedFetchStream {
    fn on_fetch(&mut self, ctx: &mut EngineContext, index: usize, frame: &Frame) {
        let trace_id = frame.trace_id;
        match &frame.kind {
            FrameKind::Begin { .. } => {
                self.fetch_streams[index].state =
                    self.fetch_streams[index].state.opening_reply();
                let partition_id = self.fetch_streams[index].partition_id;
                self.on_partition_ready(ctx, trace_id, partition_id);
                self.do_fetch_reply_window_if_necessary(ctx, index, trace_id);
            }
            FrameKind::Data {
                flags,
                budget_id,
                reserved,
                payload,
                extension,
            } => {
                debug_assert_eq!(*budget_id, self.merged_reply_budget_id);
                self.fetch_streams[index].reply_budget -= reserved;
                if self.fetch_streams[index].reply_budget < 0 {
                    self.do_merged_cleanup(ctx, trace_id);
                } else {
                    let fetch_ex = match extension {
                        Some(DataEx::Fetch(ex)) => Some(ex.clone()),
                        _ => None,
                    };
                    self.do_merged_reply_data(
                        ctx,
                        trace_id,
                        *flags,
                        *reserved,
                        payload.clone(),
                        fetch_ex.as_ref(),
                    );
                }
            }
            FrameKind::End => {
                self.fetch_streams[index].state = self.fetch_streams[index].state.closed_reply();
                self.do_merged_reply_end_if_necessary(ctx, trace_id);
                self.do_fetch_initial_end_if_necessary(ctx, index, trace_id);
            }
            FrameKind::Abort => {
                self.fetch_streams[index].state = self.fetch_streams[index].state.closed_reply();
                self.do_merged_reply_abort_if_necessary(ctx, trace_id);
                self.do_fetch_initial_abort_if_necessary(ctx, index, trace_id);
            }
            FrameKind::Reset { extension } => {
                self.on_fetch_initial_reset(ctx, index, trace_id, extension.as_ref());
            }
            FrameKind::Window { .. } => {
                if !self.fetch_streams[index].state.initial_opened() {
                    self.fetch_streams[index].state =
                        self.fetch_streams[index].state.opened_initial();
                    self.do_merged_initial_window_if_necessary(ctx, trace_id, 0, 0, 0);
                }
            }
        }
    }

    fn on_fetch_initial_reset(
        &mut self,
        ctx: &mut EngineContext,
        index: usize,
        trace_id: i64,
        reset_ex: Option<&ResetEx>,
    ) {
        self.fetch_streams[index].state = self.fetch_streams[index].state.closed_initial();
        let error = reset_ex.map(|ex| ex.error).unwrap_or(0);

        self.do_fetch_reply_reset_if_necessary(ctx, index, trace_id);

        if error == ERROR_NOT_LEADER_FOR_PARTITION {
            // Transient: drop this fetch; the next meta snapshot opens a
            // replacement at the retained progress offset.
            let old = self.fetch_streams.remove(index);
            debug!(
                topic = %self.topic,
                partition = old.partition_id,
                "fetch reset by stale leader, awaiting meta update"
            );
            ctx.deregister(old.initial_id);
            ctx.deregister(old.reply_id);
        } else {
            self.do_merged_cleanup(ctx, trace_id);
        }
    }

    fn do_fetch_initial_begin(
        &mut self,
        ctx: &mut EngineContext,
        trace_id: i64,
        partition_id: i32,
        leader_id: i32,
    ) {
        let partition_offset = self
            .next_offsets_by_id
            .get(&partition_id)
            .copied()
            .unwrap_or(self.default_offset);

        let initial_id = ctx.supply_initial_id();
        let fetch = FetchStream {
            partition_id,
            leader_id,
            initial_id,
            reply_id: reply_id(initial_id),
            state: StreamState::default().opening_initial(),
            reply_budget: 0,
        };
        ctx.register_sender(fetch.initial_id);
        ctx.register_receiver(fetch.reply_id);

        ctx.do_begin(
            self.resolved_id,
            fetch.initial_id,
            trace_id,
            leader_id as i64,
            Some(BeginEx::Fetch(FetchBeginEx {
                topic: self.topic.clone(),
                partition: KafkaOffset::new(partition_id, partition_offset),
                filters: self.filters.clone(),
                delta_type: self.delta_type,
            })),
        );

        self.fetch_streams.push(fetch);
    }

    fn do_fetch_initial_end_if_necessary(
        &mut self,
        ctx: &mut EngineContext,
        index: usize,
        trace_id: i64,
    ) {
        let fetch = &mut self.fetch_streams[index];
        if fetch.state.initial_opening() && !fetch.state.initial_closed() {
            fetch.state = fetch.state.closed_initial();
            ctx.do_end(self.resolved_id, fetch.initial_id, trace_id);
        }
    }

    fn do_fetch_initial_abort_if_necessary(
        &mut self,
        ctx: &mut EngineContext,
        index: usize,
        trace_id: i64,
    ) {
        let fetch = &mut self.fetch_streams[index];
        if fetch.state.initial_opening() && !fetch.state.initial_closed() {
            fetch.state = fetch.state.closed_initial();
            ctx.do_abort(self.resolved_id, fetch.initial_id, trace_id);
        }
    }

    fn do_fetch_reply_window_if_necessary(
        &mut self,
        ctx: &mut EngineContext,
        index: usize,
        trace_id: i64,
    ) {
        // One partition's in-flight bytes are capped so a single busy
        // partition cannot absorb the whole merged window.
        let partition_cap = ctx.config.fetch_partition_max_bytes.min(i32::MAX as usize) as i32;
        let merged_budget = self.reply_budget.min(partition_cap);
        let merged_budget_id = self.merged_reply_budget_id;
        let padding = self.reply_padding;
        let resolved_id = self.resolved_id;

        let fetch = &mut self.fetch_streams[index];
        if fetch.state.reply_opening() && !fetch.state.reply_closing() {
            fetch.state = fetch.state.opened_reply();

            // A zero-credit window is still sent: the per-stream window
            // is only an upper bound, actual sends claim the shared
            // merged budget, so stalled producers must be re-polled when
            // the client grants more credit.
            let credit = (merged_budget - fetch.reply_budget).max(0);
            fetch.reply_budget += credit;
            ctx.do_window(
                resolved_id,
                fetch.reply_id,
                trace_id,
                merged_budget_id,
                credit,
                padding,
            );
        }
    }

    fn do_fetch_reply_reset_if_necessary(
        &mut self,
        ctx: &mut EngineContext,
        index: usize,
        trace_id: i64,
    ) {
        let fetch = &mut self.fetch_streams[index];
        if !fetch.state.reply_closed() {
            fetch.state = fetch.state.closed_reply();
            ctx.do_reset(self.resolved_id, fetch.reply_id, trace_id, None);
        }
    }

    fn do_fetch_cleanup(&mut self, ctx: &mut EngineContext, index: usize, trace_id: i64) {
        self.do_fetch_initial_abort_if_necessary(ctx, index, trace_id);
        self.do_fetch_reply_reset_if_necessary(ctx, index, trace_id);
    }
}
