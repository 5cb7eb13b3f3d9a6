use modelsync_common::protocol::jsonrpc::RpcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    Disconnected,

    #[error("call `{method}` timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("websocket failure: {0}")]
    Socket(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no transport available in this context")]
    NoTransport,

    #[error("{model} record has no id")]
    MissingId { model: String },

    #[error("unexpected response to `{method}`: {reason}")]
    UnexpectedResponse { method: String, reason: String },
}
