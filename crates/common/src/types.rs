// Core domain types shared across all modelsync crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::channels;

/// A sanitized record: field name to JSON value.
pub type FieldMap = Map<String, Value>;

/// Bookkeeping fields that never trigger an update on their own.
pub const IMMUTABLE_FIELDS: &[&str] = &["created_at", "updated_at"];

/// Identifies one registry entry: (model type, record id).
///
/// The model type is normalized to lowercase on construction so `User` and
/// `user` address the same listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    model: String,
    id: String,
}

impl SubscriptionKey {
    pub fn new(model: &str, id: impl Into<String>) -> Self {
        Self { model: model.to_lowercase(), id: id.into() }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `model.listen.<type>.<id>`
    pub fn storage_key(&self) -> String {
        channels::registry_key(&self.model, &self.id)
    }

    /// `model.update.<type>.<id>`
    pub fn update_channel(&self) -> String {
        channels::update_channel(&self.model, &self.id)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.model, self.id)
    }
}

/// One subscriber in a key's listener list.
///
/// At most one entry exists per `(session_id, listener_id)` within a list.
/// Transport-supplied context rides along in `context` and is flattened on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerEntry {
    pub session_id: String,
    pub listener_id: String,
    #[serde(default)]
    pub atomic: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(flatten)]
    pub context: FieldMap,
}

impl ListenerEntry {
    pub fn new(
        session_id: impl Into<String>,
        listener_id: impl Into<String>,
        atomic: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            listener_id: listener_id.into(),
            atomic,
            last_seen: now,
            context: FieldMap::new(),
        }
    }

    pub fn is(&self, session_id: &str, listener_id: &str) -> bool {
        self.session_id == session_id && self.listener_id == listener_id
    }
}

/// Broadcast whenever a record is persisted with field-level change info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveEvent {
    pub model: String,
    pub id: String,
    #[serde(default)]
    pub updates: Vec<String>,
}

impl SaveEvent {
    pub fn new(model: impl Into<String>, id: impl Into<String>, updates: &[&str]) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
            updates: updates.iter().map(|field| (*field).to_string()).collect(),
        }
    }

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.model, self.id.clone())
    }

    /// Updated field names minus the immutable bookkeeping fields.
    pub fn effective_updates(&self) -> Vec<String> {
        self.updates
            .iter()
            .filter(|field| !IMMUTABLE_FIELDS.contains(&field.as_str()))
            .cloned()
            .collect()
    }
}

/// Params for `model.listen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenParams {
    pub session_id: String,
    pub model: String,
    pub id: String,
    pub listener_id: String,
    #[serde(default)]
    pub atomic: bool,
}

impl ListenParams {
    /// Positional order accepted on the wire.
    pub const POSITIONAL: &'static [&'static str] =
        &["session_id", "model", "id", "listener_id", "atomic"];

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.model, self.id.clone())
    }
}

/// Params for `model.deafen`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeafenParams {
    pub session_id: String,
    pub model: String,
    pub id: String,
    pub listener_id: String,
}

impl DeafenParams {
    pub const POSITIONAL: &'static [&'static str] = &["session_id", "model", "id", "listener_id"];

    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(&self.model, self.id.clone())
    }
}

/// Params a live record sends on its own connection for
/// `model.listen.<type>` / `model.deafen.<type>`; the session is implied by
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListenParams {
    #[serde(default)]
    pub id: Option<String>,
    pub listener_id: String,
    #[serde(default)]
    pub atomic: bool,
}

impl SessionListenParams {
    pub const POSITIONAL: &'static [&'static str] = &["id", "listener_id", "atomic"];
}

/// Params for `model.refresh.<type>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshParams {
    pub id: String,
}

impl RefreshParams {
    pub const POSITIONAL: &'static [&'static str] = &["id"];
}
