//! toolguard-core: shared protocol library for the toolguard gateway.
//!
//! Provides the JSON-RPC message envelope, the error-code taxonomy,
//! `Content-Length` framing and the size guard that protects readers from
//! oversized bodies.

pub mod codec;
pub mod error;
pub mod message;
pub mod size_guard;

// Re-export commonly used items at crate root.
pub use codec::{encode_frame, write_frame, FrameReader};
pub use error::{CodecError, CoreResult};
pub use message::{ErrorCode, ErrorObject, Message, MessageId, JSONRPC_VERSION};
pub use size_guard::{SizeCheck, SizeGuard, DEFAULT_DRAIN_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
