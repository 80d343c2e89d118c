//! Shardnet Protocol -- wire message types and frame codec.
//!
//! TCP between peers. Every frame is a 4-byte big-endian length prefix,
//! a 2-byte big-endian message code, and an opaque payload. Codes below
//! [`BASE_PROTO_CODE`] are transport control messages; the rest of the code
//! space is carved into per-sub-protocol windows by the peer layer.

pub mod codec;
pub mod message;

pub use codec::{FrameCodec, MAX_FRAME_BYTES};
pub use message::*;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
