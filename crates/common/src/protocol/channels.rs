// Push channel and registry key naming.
//
// Channel names are part of the wire contract: clients register handlers by
// exact string, so every producer and consumer goes through these helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport signal fired when a connection is (re)established.
pub const CONNECT_SIGNAL: &str = "connect";
/// Transport signal fired once the session handshake has completed.
pub const CONNECTED_SIGNAL: &str = "connected";

/// Registry storage key for a (type, id) pair: `model.listen.<type>.<id>`.
pub fn registry_key(model: &str, id: &str) -> String {
    format!("model.listen.{}.{id}", model.to_lowercase())
}

/// Per-record update channel: `model.update.<type>.<id>`.
pub fn update_channel(model: &str, id: &str) -> String {
    format!("model.update.{}.{id}", model.to_lowercase())
}

/// Live collection channel for records entering the result set.
pub fn collection_add_channel(subscription_id: &str) -> String {
    format!("collection.{subscription_id}.model.add")
}

/// Live collection channel for records leaving the result set.
pub fn collection_remove_channel(subscription_id: &str) -> String {
    format!("collection.{subscription_id}.model.remove")
}

/// One frame on a session's push stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushFrame {
    pub channel: String,
    pub payload: Value,
}

impl PushFrame {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self { channel: channel.into(), payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_key_and_update_channel_lowercase_the_type() {
        assert_eq!(registry_key("User", "42"), "model.listen.user.42");
        assert_eq!(update_channel("User", "42"), "model.update.user.42");
    }

    #[test]
    fn record_ids_keep_their_case() {
        assert_eq!(update_channel("user", "AbC"), "model.update.user.AbC");
    }

    #[test]
    fn collection_channels_are_scoped_by_subscription() {
        assert_eq!(collection_add_channel("sub-1"), "collection.sub-1.model.add");
        assert_eq!(collection_remove_channel("sub-1"), "collection.sub-1.model.remove");
    }
}
