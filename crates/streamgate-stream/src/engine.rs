//! Single-threaded frame dispatch engine.
//!
//! One engine owns a disjoint set of streams and runs every event for
//! them to completion on its own thread; there is no intra-stream
//! locking anywhere. Handlers never call each other directly: emitting a
//! frame enqueues it, and the engine drains the queue after every
//! injection, so reentrancy cannot occur even though streams hold
//! references to one another's ids.
//!
//! Frames are dispatched by stream id and direction: data-path frames
//! (`Begin`/`Data`/`End`/`Abort`) go to the registered *receiver* of the
//! id, flow-control frames (`Window`/`Reset`) go back to the registered
//! *sender*. A `Begin` for an unbound id on a bound route asks that
//! route's [`StreamFactory`] for a new server stream; an unroutable
//! `Begin` is answered with `Reset`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, trace};

use streamgate_core::frame::{reply_id, Frame, FrameKind};
use streamgate_core::types::{BeginEx, DataEx, ResetEx};
use streamgate_core::GatewayConfig;

use crate::budget::MergedBudgetCreditor;

pub type HandlerRef = Rc<RefCell<dyn StreamHandler>>;

pub trait StreamHandler {
    fn on_frame(&mut self, ctx: &mut EngineContext, frame: &Frame);
}

pub trait StreamFactory {
    /// Creates the server stream for a `Begin`, or `None` to reject it.
    fn new_stream(&self, ctx: &mut EngineContext, begin: &Frame) -> Option<HandlerRef>;
}

/// Mutable engine state visible to handlers during dispatch. Stream
/// registration is buffered here and applied by the engine between
/// handler invocations.
pub struct EngineContext {
    queue: VecDeque<Frame>,
    next_initial_id: i64,
    next_trace_id: i64,
    pub creditor: MergedBudgetCreditor,
    pub config: GatewayConfig,
    current: Option<HandlerRef>,
    pending_receivers: Vec<(i64, HandlerRef)>,
    pending_senders: Vec<(i64, HandlerRef)>,
    pending_removals: Vec<i64>,
}

impl EngineContext {
    fn new(config: GatewayConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            next_initial_id: 0x11,
            next_trace_id: 0,
            creditor: MergedBudgetCreditor::new(),
            config,
            current: None,
            pending_receivers: Vec::new(),
            pending_senders: Vec::new(),
            pending_removals: Vec::new(),
        }
    }

    /// A fresh initiator stream id (odd; its reply id is `id ^ 1`).
    pub fn supply_initial_id(&mut self) -> i64 {
        let id = self.next_initial_id;
        self.next_initial_id += 2;
        id
    }

    pub fn supply_trace_id(&mut self) -> i64 {
        self.next_trace_id += 1;
        self.next_trace_id
    }

    /// Registers the currently dispatched handler as receiver of
    /// `stream_id`.
    pub fn register_receiver(&mut self, stream_id: i64) {
        let current = self.current.clone().expect("called during dispatch");
        self.pending_receivers.push((stream_id, current));
    }

    /// Registers the currently dispatched handler as sender (throttle
    /// target) of `stream_id`.
    pub fn register_sender(&mut self, stream_id: i64) {
        let current = self.current.clone().expect("called during dispatch");
        self.pending_senders.push((stream_id, current));
    }

    pub fn register_receiver_handler(&mut self, stream_id: i64, handler: HandlerRef) {
        self.pending_receivers.push((stream_id, handler));
    }

    pub fn register_sender_handler(&mut self, stream_id: i64, handler: HandlerRef) {
        self.pending_senders.push((stream_id, handler));
    }

    /// Drops both registrations of `stream_id`.
    pub fn deregister(&mut self, stream_id: i64) {
        self.pending_removals.push(stream_id);
    }

    pub fn emit(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }

    // --- frame emission helpers -----------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn do_begin(
        &mut self,
        route_id: i64,
        stream_id: i64,
        trace_id: i64,
        affinity: i64,
        extension: Option<BeginEx>,
    ) {
        self.emit(Frame::new(
            route_id,
            stream_id,
            trace_id,
            FrameKind::Begin {
                affinity,
                extension,
            },
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_data(
        &mut self,
        route_id: i64,
        stream_id: i64,
        trace_id: i64,
        budget_id: i64,
        reserved: i32,
        flags: u8,
        payload: Bytes,
        extension: Option<DataEx>,
    ) {
        self.emit(Frame::new(
            route_id,
            stream_id,
            trace_id,
            FrameKind::Data {
                flags,
                budget_id,
                reserved,
                payload,
                extension,
            },
        ));
    }

    pub fn do_end(&mut self, route_id: i64, stream_id: i64, trace_id: i64) {
        self.emit(Frame::new(route_id, stream_id, trace_id, FrameKind::End));
    }

    pub fn do_abort(&mut self, route_id: i64, stream_id: i64, trace_id: i64) {
        self.emit(Frame::new(route_id, stream_id, trace_id, FrameKind::Abort));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn do_window(
        &mut self,
        route_id: i64,
        stream_id: i64,
        trace_id: i64,
        budget_id: i64,
        credit: i32,
        padding: i32,
    ) {
        self.emit(Frame::new(
            route_id,
            stream_id,
            trace_id,
            FrameKind::Window {
                budget_id,
                credit,
                padding,
            },
        ));
    }

    pub fn do_reset(
        &mut self,
        route_id: i64,
        stream_id: i64,
        trace_id: i64,
        extension: Option<ResetEx>,
    ) {
        self.emit(Frame::new(
            route_id,
            stream_id,
            trace_id,
            FrameKind::Reset { extension },
        ));
    }
}

pub struct Engine {
    receivers: HashMap<i64, HandlerRef>,
    senders: HashMap<i64, HandlerRef>,
    routes: HashMap<i64, Rc<dyn StreamFactory>>,
    pub ctx: EngineContext,
}

impl Engine {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            receivers: HashMap::new(),
            senders: HashMap::new(),
            routes: HashMap::new(),
            ctx: EngineContext::new(config),
        }
    }

    /// Binds a server-side stream factory to a route.
    pub fn bind_route(&mut self, route_id: i64, factory: Rc<dyn StreamFactory>) {
        self.routes.insert(route_id, factory);
    }

    /// Opens a client-initiated stream on `route_id`: registers `client`
    /// on its side of the id pair and injects the `Begin`.
    pub fn open(&mut self, route_id: i64, client: HandlerRef, extension: BeginEx) -> i64 {
        let initial_id = self.ctx.supply_initial_id();
        self.senders.insert(initial_id, Rc::clone(&client));
        self.receivers.insert(reply_id(initial_id), client);

        let trace_id = self.ctx.supply_trace_id();
        self.inject(Frame::new(
            route_id,
            initial_id,
            trace_id,
            FrameKind::Begin {
                affinity: 0,
                extension: Some(extension),
            },
        ));
        initial_id
    }

    /// Queues a frame and runs the engine until the queue is drained.
    pub fn inject(&mut self, frame: Frame) {
        self.ctx.queue.push_back(frame);
        self.drain();
    }

    fn drain(&mut self) {
        while let Some(frame) = self.ctx.queue.pop_front() {
            self.dispatch(frame);
            self.apply_pending();
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        let throttle = matches!(
            frame.kind,
            FrameKind::Window { .. } | FrameKind::Reset { .. }
        );
        let handler = if throttle {
            self.senders.get(&frame.stream_id).cloned()
        } else {
            self.receivers.get(&frame.stream_id).cloned()
        };

        match handler {
            Some(handler) => self.deliver(handler, &frame),
            None if !throttle && matches!(frame.kind, FrameKind::Begin { .. }) => {
                self.accept(frame)
            }
            None => {
                trace!(
                    stream_id = frame.stream_id,
                    type_id = frame.kind.type_id(),
                    "dropping frame for unknown stream"
                );
            }
        }
    }

    fn deliver(&mut self, handler: HandlerRef, frame: &Frame) {
        self.ctx.current = Some(Rc::clone(&handler));
        handler.borrow_mut().on_frame(&mut self.ctx, frame);
        self.ctx.current = None;
    }

    // A Begin for an unbound initiator id: ask the route's factory for a
    // server stream, or reset the initiator.
    fn accept(&mut self, frame: Frame) {
        let factory = self.routes.get(&frame.route_id).cloned();
        let accepted = factory.and_then(|factory| {
            self.apply_pending();
            factory.new_stream(&mut self.ctx, &frame)
        });

        match accepted {
            Some(handler) => {
                self.receivers
                    .insert(frame.stream_id, Rc::clone(&handler));
                self.senders
                    .insert(reply_id(frame.stream_id), Rc::clone(&handler));
                self.apply_pending();
                self.deliver(handler, &frame);
            }
            None => {
                debug!(
                    route_id = frame.route_id,
                    stream_id = frame.stream_id,
                    "rejecting unroutable begin"
                );
                let trace_id = frame.trace_id;
                self.ctx
                    .do_reset(frame.route_id, frame.stream_id, trace_id, None);
            }
        }
    }

    fn apply_pending(&mut self) {
        for (id, handler) in self.ctx.pending_receivers.drain(..) {
            self.receivers.insert(id, handler);
        }
        for (id, handler) in self.ctx.pending_senders.drain(..) {
            self.senders.insert(id, handler);
        }
        for id in self.ctx.pending_removals.drain(..) {
            self.receivers.remove(&id);
            self.senders.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Vec<i32>,
    }

    impl StreamHandler for Recorder {
        fn on_frame(&mut self, _ctx: &mut EngineContext, frame: &Frame) {
            self.frames.push(frame.kind.type_id());
        }
    }

    struct EchoFactory;

    impl StreamFactory for EchoFactory {
        fn new_stream(&self, _ctx: &mut EngineContext, _begin: &Frame) -> Option<HandlerRef> {
            Some(Rc::new(RefCell::new(Recorder::default())))
        }
    }

    #[test]
    fn test_unroutable_begin_is_reset() {
        let mut engine = Engine::new(GatewayConfig::default());
        let client = Rc::new(RefCell::new(Recorder::default()));

        engine.open(
            99,
            client.clone(),
            BeginEx::Meta(streamgate_core::types::MetaBeginEx {
                topic: "t".to_string(),
            }),
        );

        let reset_id = FrameKind::Reset { extension: None }.type_id();
        assert_eq!(client.borrow().frames, vec![reset_id]);
    }

    #[test]
    fn test_routed_begin_creates_server_stream() {
        let mut engine = Engine::new(GatewayConfig::default());
        engine.bind_route(7, Rc::new(EchoFactory));
        let client = Rc::new(RefCell::new(Recorder::default()));

        engine.open(
            7,
            client.clone(),
            BeginEx::Meta(streamgate_core::types::MetaBeginEx {
                topic: "t".to_string(),
            }),
        );

        // Accepted: no reset back to the client.
        assert!(client.borrow().frames.is_empty());
    }

    #[test]
    fn test_initial_ids_are_odd_and_distinct() {
        let mut engine = Engine::new(GatewayConfig::default());
        let a = engine.ctx.supply_initial_id();
        let b = engine.ctx.supply_initial_id();
        assert_ne!(a, b);
        assert_eq!(a & 1, 1);
        assert_eq!(b & 1, 1);
        assert_eq!(reply_id(a) & 1, 0);
    }
}
