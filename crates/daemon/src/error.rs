// Error types for the registry owner and its collaborators.

use modelsync_common::protocol::jsonrpc::{
    RpcError, INTERNAL_ERROR, LOCK_TIMEOUT, RECORD_NOT_FOUND, UPSTREAM_UNAVAILABLE,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("timed out after {timeout_ms}ms waiting for lock on `{key}`")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("registry backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("record {model} #{id} not found")]
    NotFound { model: String, id: String },

    #[error("record source failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("session `{0}` has no attached push channel")]
    SessionOffline(String),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("registry owner unreachable: {0}")]
    Unreachable(String),

    #[error("failed to encode proxy call: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl From<&RegistryError> for RpcError {
    fn from(error: &RegistryError) -> Self {
        match error {
            RegistryError::LockTimeout { key, timeout_ms } => {
                RpcError::new(LOCK_TIMEOUT, "Registry lock timeout")
                    .with_data(json!({ "key": key, "timeout_ms": timeout_ms }))
            }
            RegistryError::Backend(reason) => {
                RpcError::new(UPSTREAM_UNAVAILABLE, "Registry unavailable")
                    .with_data(json!({ "reason": reason }))
            }
        }
    }
}

impl From<&SourceError> for RpcError {
    fn from(error: &SourceError) -> Self {
        match error {
            SourceError::NotFound { model, id } => RpcError::new(RECORD_NOT_FOUND, "Record not found")
                .with_data(json!({ "model": model, "id": id })),
            SourceError::Backend(reason) => RpcError::new(INTERNAL_ERROR, "Internal error")
                .with_data(json!({ "reason": reason })),
        }
    }
}

impl From<&FanoutError> for RpcError {
    fn from(error: &FanoutError) -> Self {
        match error {
            FanoutError::Source(source) => source.into(),
            FanoutError::Registry(registry) => registry.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_maps_to_retryable_rpc_error() {
        let error = RegistryError::LockTimeout { key: "model.listen.user.1".into(), timeout_ms: 50 };
        let rpc: RpcError = (&error).into();
        assert_eq!(rpc.code, LOCK_TIMEOUT);
        assert!(rpc.is_retryable());
        assert_eq!(rpc.data.expect("data should be present")["key"], "model.listen.user.1");
    }

    #[test]
    fn missing_record_maps_to_not_found_code() {
        let error = FanoutError::Source(SourceError::NotFound { model: "user".into(), id: "9".into() });
        let rpc: RpcError = (&error).into();
        assert_eq!(rpc.code, RECORD_NOT_FOUND);
        assert!(!rpc.is_retryable());
    }
}
