//! Frame Envelope
//!
//! Every message exchanged between streams is a `Frame`: a fixed envelope
//! (`route_id`, `stream_id`, `trace_id`, `authorization`) plus one of six
//! frame kinds. The low bit of `stream_id` encodes direction: initiator
//! streams carry an odd id, their reply half uses `initial_id ^ 1`.
//!
//! `Data` frames carry a `flags` byte marking record boundaries so that a
//! record larger than one frame can be split: the first fragment sets
//! `FLAGS_INIT`, the last sets `FLAGS_FIN`, and a whole record in a single
//! frame sets both. Extensions are typed (`BeginEx`/`DataEx`/`ResetEx`);
//! the low-level wire codec that would flatten them to octets lives
//! outside this workspace.

use bytes::Bytes;

use crate::types::{BeginEx, DataEx, ResetEx};

/// Final fragment of a record.
pub const FLAGS_FIN: u8 = 0x01;
/// First fragment of a record.
pub const FLAGS_INIT: u8 = 0x02;
/// A whole record in one frame.
pub const FLAGS_COMPLETE: u8 = FLAGS_INIT | FLAGS_FIN;
/// Interior fragment.
pub const FLAGS_NONE: u8 = 0x00;

/// True when the stream id belongs to an initiator (initial) stream.
pub fn initiator(stream_id: i64) -> bool {
    stream_id & 1 != 0
}

/// Reply stream id paired with an initial stream id.
pub fn reply_id(initial_id: i64) -> i64 {
    initial_id ^ 1
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub route_id: i64,
    pub stream_id: i64,
    pub trace_id: i64,
    pub authorization: i64,
    pub kind: FrameKind,
}

#[derive(Debug, Clone)]
pub enum FrameKind {
    Begin {
        affinity: i64,
        extension: Option<BeginEx>,
    },
    Data {
        flags: u8,
        budget_id: i64,
        reserved: i32,
        payload: Bytes,
        extension: Option<DataEx>,
    },
    End,
    Abort,
    Window {
        budget_id: i64,
        credit: i32,
        padding: i32,
    },
    Reset {
        extension: Option<ResetEx>,
    },
}

impl FrameKind {
    /// Wire discriminant for the envelope `typeId` field.
    pub fn type_id(&self) -> i32 {
        match self {
            FrameKind::Begin { .. } => 0x0000_0001,
            FrameKind::Data { .. } => 0x0000_0002,
            FrameKind::End => 0x0000_0003,
            FrameKind::Abort => 0x0000_0004,
            FrameKind::Reset { .. } => 0x4000_0001,
            FrameKind::Window { .. } => 0x4000_0002,
        }
    }
}

impl Frame {
    pub fn new(route_id: i64, stream_id: i64, trace_id: i64, kind: FrameKind) -> Self {
        Self {
            route_id,
            stream_id,
            trace_id,
            authorization: 0,
            kind,
        }
    }
}
