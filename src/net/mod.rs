//! Wire framing, request/reply schema and outbound peer RPC.

pub mod frame;
pub mod message;
pub mod rpc;

pub use frame::{HEADER_LENGTH, MAX_FRAME_SIZE};
pub use message::{CacheLine, Reply, Request};
pub use rpc::call;

use crate::types::NetAddress;
use thiserror::Error;

/// Transport and wire-format failures. Handlers convert these into `ERROR`
/// replies; they never take the server down.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed length header: {0:?}")]
    BadHeader(String),

    #[error("frame of {0} bytes exceeds the size limit")]
    Oversized(usize),

    #[error("malformed request: {0}")]
    Decode(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("peer closed the connection mid-exchange")]
    ConnectionClosed,

    #[error("endpoint {0} is not dialable")]
    BadEndpoint(NetAddress),
}
