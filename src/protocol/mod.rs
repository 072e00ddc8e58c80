//! Framed message protocol: envelope codec, session reader/writer, dispatch
//! and the chunked transfer sub-protocol.

pub mod chunked;
pub mod codec;
pub mod dispatch;
pub mod message;
pub mod session;

pub use chunked::{read_chunks, ChunkEvent, ChunkSequence, ChunkStats, ChunkWriter};
pub use codec::{
    decode, decode_frame, encode, encode_frame, Envelope, FrameCodec, Header,
    DEFAULT_MAX_FRAME_SIZE, FRAME_TERMINATOR,
};
pub use dispatch::{DispatchBuilder, DispatchTable, Handler, RequestContext, TypedHandler};
pub use message::{
    ErrorCode, ErrorMessage, ExportChunk, ExportRequest, ExportResponse, ListPoolRequest,
    ListPoolResponse, ListSnapshotsRequest, ListSnapshotsResponse, MessageKind, Payload,
};
pub use session::{FrameReader, FrameWriter, Session};
