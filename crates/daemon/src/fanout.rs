// Save-triggered update fan-out.
//
// One save event produces at most one push per distinct session. Dispatch is
// sequential and the sent-session set lives on the stack of a single
// `on_save` call, so nothing carries over between events.

use std::collections::HashSet;
use std::sync::Arc;

use modelsync_common::protocol::channels::PushFrame;
use modelsync_common::types::{FieldMap, ListenerEntry, SaveEvent, SubscriptionKey};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FanoutError, SourceError};
use crate::hub::SessionPublisher;
use crate::registry::SubscriptionRegistry;
use crate::source::RecordSource;

/// Last-chance rewrite of a listener's payload before it is pushed.
pub trait PayloadHook: Send + Sync {
    fn shape(&self, key: &SubscriptionKey, listener: &ListenerEntry, payload: FieldMap) -> FieldMap;
}

/// What a single `on_save` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FanoutOutcome {
    /// Only bookkeeping fields changed.
    NoEffectiveUpdates,
    /// The record source vetoed the notification.
    NotRequired,
    /// No listen/deafen for this model type ever reached this process.
    NoInterest,
    NoListeners,
    Delivered { sessions: Vec<String>, dropped: Vec<String> },
}

#[derive(Clone)]
pub struct FanoutEngine {
    registry: SubscriptionRegistry,
    source: Arc<dyn RecordSource>,
    publisher: Arc<dyn SessionPublisher>,
    hook: Option<Arc<dyn PayloadHook>>,
}

impl FanoutEngine {
    pub fn new(
        registry: SubscriptionRegistry,
        source: Arc<dyn RecordSource>,
        publisher: Arc<dyn SessionPublisher>,
    ) -> Self {
        Self { registry, source, publisher, hook: None }
    }

    pub fn with_payload_hook(mut self, hook: Arc<dyn PayloadHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub async fn on_save(&self, event: &SaveEvent) -> Result<FanoutOutcome, FanoutError> {
        let key = event.key();
        let updates = event.effective_updates();
        if updates.is_empty() {
            return Ok(FanoutOutcome::NoEffectiveUpdates);
        }

        let record = self.source.find_by_id(key.model(), key.id()).await?.ok_or_else(|| {
            SourceError::NotFound { model: key.model().to_string(), id: key.id().to_string() }
        })?;
        if !self.source.requires_update(key.model(), key.id(), &updates).await? {
            return Ok(FanoutOutcome::NotRequired);
        }

        if !self.registry.has_interest(key.model()) {
            return Ok(FanoutOutcome::NoInterest);
        }

        let listeners = self.registry.listeners(&key).await?;
        if listeners.is_empty() {
            return Ok(FanoutOutcome::NoListeners);
        }

        let changed: FieldMap = record
            .iter()
            .filter(|(field, _)| updates.contains(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        let channel = key.update_channel();

        let mut sent: HashSet<&str> = HashSet::new();
        let mut sessions = Vec::new();
        let mut dropped = Vec::new();
        for listener in &listeners {
            if !sent.insert(listener.session_id.as_str()) {
                continue;
            }

            let payload = if listener.atomic { changed.clone() } else { record.clone() };
            let payload = match &self.hook {
                Some(hook) => hook.shape(&key, listener, payload),
                None => payload,
            };

            debug!(
                model = %key.model(),
                id = %key.id(),
                session = %listener.session_id,
                listener = %listener.listener_id,
                atomic = listener.atomic,
                "[update]"
            );
            let frame = PushFrame::new(channel.clone(), Value::Object(payload));
            match self.publisher.publish(&listener.session_id, frame) {
                Ok(()) => sessions.push(listener.session_id.clone()),
                Err(error) => {
                    warn!(
                        model = %key.model(),
                        id = %key.id(),
                        session = %listener.session_id,
                        error = %error,
                        "dropped update push"
                    );
                    dropped.push(listener.session_id.clone());
                }
            }
        }

        Ok(FanoutOutcome::Delivered { sessions, dropped })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use modelsync_common::types::ListenParams;
    use serde_json::json;

    use super::*;
    use crate::error::PublishError;
    use crate::registry::RegistrySettings;
    use crate::source::{MemoryRecordSource, SourceFuture};

    #[derive(Default)]
    struct RecordingPublisher {
        frames: Mutex<Vec<(String, PushFrame)>>,
        offline: HashSet<String>,
    }

    impl RecordingPublisher {
        fn frames(&self) -> Vec<(String, PushFrame)> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl SessionPublisher for RecordingPublisher {
        fn publish(&self, session_id: &str, frame: PushFrame) -> Result<(), PublishError> {
            if self.offline.contains(session_id) {
                return Err(PublishError::SessionOffline(session_id.to_string()));
            }
            self.frames.lock().unwrap().push((session_id.to_string(), frame));
            Ok(())
        }
    }

    struct Fixture {
        engine: FanoutEngine,
        registry: SubscriptionRegistry,
        source: MemoryRecordSource,
        publisher: Arc<RecordingPublisher>,
    }

    async fn fixture_with(publisher: RecordingPublisher) -> Fixture {
        let registry = SubscriptionRegistry::in_memory(RegistrySettings::default());
        let source = MemoryRecordSource::default();
        source
            .insert(
                "user",
                "1",
                json!({ "name": "Ada", "email": "ada@example.com", "age": 36 })
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await;
        let publisher = Arc::new(publisher);
        let engine =
            FanoutEngine::new(registry.clone(), Arc::new(source.clone()), publisher.clone());
        Fixture { engine, registry, source, publisher }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingPublisher::default()).await
    }

    async fn listen(registry: &SubscriptionRegistry, session: &str, listener: &str, atomic: bool) {
        registry
            .listen(&ListenParams {
                session_id: session.into(),
                model: "user".into(),
                id: "1".into(),
                listener_id: listener.into(),
                atomic,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_atomic_listener_gets_the_full_record() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "l1", false).await;

        let outcome = fx.engine.on_save(&SaveEvent::new("user", "1", &["name"])).await.unwrap();
        assert_eq!(
            outcome,
            FanoutOutcome::Delivered { sessions: vec!["s1".into()], dropped: vec![] }
        );

        let frames = fx.publisher.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.channel, "model.update.user.1");
        assert_eq!(
            frames[0].1.payload,
            json!({ "name": "Ada", "email": "ada@example.com", "age": 36 })
        );
    }

    #[tokio::test]
    async fn atomic_listener_gets_only_updated_fields() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "l1", true).await;

        fx.engine
            .on_save(&SaveEvent::new("user", "1", &["age", "updated_at"]))
            .await
            .unwrap();

        assert_eq!(fx.publisher.frames()[0].1.payload, json!({ "age": 36 }));
    }

    #[tokio::test]
    async fn each_session_is_pushed_once_and_first_entry_decides_shape() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "tab-a", true).await;
        listen(&fx.registry, "s1", "tab-b", false).await;
        listen(&fx.registry, "s2", "tab-c", false).await;

        fx.engine.on_save(&SaveEvent::new("user", "1", &["name"])).await.unwrap();

        let frames = fx.publisher.frames();
        let sessions: Vec<_> = frames.iter().map(|(session, _)| session.as_str()).collect();
        assert_eq!(sessions, vec!["s1", "s2"]);
        assert_eq!(frames[0].1.payload, json!({ "name": "Ada" }));
        assert_eq!(frames[1].1.payload["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn bookkeeping_only_save_is_a_silent_no_op() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "l1", false).await;

        let outcome = fx
            .engine
            .on_save(&SaveEvent::new("user", "1", &["created_at", "updated_at"]))
            .await
            .unwrap();
        assert_eq!(outcome, FanoutOutcome::NoEffectiveUpdates);
        assert!(fx.publisher.frames().is_empty());
    }

    #[tokio::test]
    async fn missing_record_aborts_without_any_push() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "l1", false).await;
        fx.source.remove("user", "1").await;

        let error = fx.engine.on_save(&SaveEvent::new("user", "1", &["name"])).await.unwrap_err();
        assert!(matches!(error, FanoutError::Source(SourceError::NotFound { .. })));
        assert!(fx.publisher.frames().is_empty());
    }

    #[tokio::test]
    async fn model_without_local_interest_short_circuits() {
        let fx = fixture().await;
        let outcome = fx.engine.on_save(&SaveEvent::new("user", "1", &["name"])).await.unwrap();
        assert_eq!(outcome, FanoutOutcome::NoInterest);
    }

    #[tokio::test]
    async fn interest_without_listeners_for_the_key_is_harmless() {
        let fx = fixture().await;
        listen(&fx.registry, "s1", "l1", false).await;
        fx.source
            .insert("user", "2", json!({ "name": "Grace" }).as_object().cloned().unwrap())
            .await;

        let outcome = fx.engine.on_save(&SaveEvent::new("User", "2", &["name"])).await.unwrap();
        assert_eq!(outcome, FanoutOutcome::NoListeners);
    }

    #[tokio::test]
    async fn offline_session_is_reported_as_dropped_and_others_still_receive() {
        let mut publisher = RecordingPublisher::default();
        publisher.offline.insert("gone".into());
        let fx = fixture_with(publisher).await;
        listen(&fx.registry, "gone", "l1", false).await;
        listen(&fx.registry, "s2", "l2", false).await;

        let outcome = fx.engine.on_save(&SaveEvent::new("user", "1", &["name"])).await.unwrap();
        assert_eq!(
            outcome,
            FanoutOutcome::Delivered { sessions: vec!["s2".into()], dropped: vec!["gone".into()] }
        );
    }

    struct Veto;

    impl RecordSource for Veto {
        fn find_by_id<'a>(&'a self, _model: &'a str, _id: &'a str) -> SourceFuture<'a, Option<FieldMap>> {
            Box::pin(async { Ok(Some(FieldMap::new())) })
        }

        fn requires_update<'a>(
            &'a self,
            _model: &'a str,
            _id: &'a str,
            updates: &'a [String],
        ) -> SourceFuture<'a, bool> {
            Box::pin(async move { Ok(!updates.iter().any(|field| field == "view_count")) })
        }
    }

    #[tokio::test]
    async fn source_hook_can_veto_the_notification() {
        let registry = SubscriptionRegistry::in_memory(RegistrySettings::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let engine = FanoutEngine::new(registry.clone(), Arc::new(Veto), publisher.clone());
        listen(&registry, "s1", "l1", false).await;

        let outcome = engine.on_save(&SaveEvent::new("user", "1", &["view_count"])).await.unwrap();
        assert_eq!(outcome, FanoutOutcome::NotRequired);
        assert!(publisher.frames().is_empty());
    }

    struct Redact;

    impl PayloadHook for Redact {
        fn shape(&self, _key: &SubscriptionKey, listener: &ListenerEntry, mut payload: FieldMap) -> FieldMap {
            payload.remove("email");
            payload.insert("for".into(), json!(listener.listener_id));
            payload
        }
    }

    #[tokio::test]
    async fn payload_hook_shapes_each_push() {
        let fx = fixture().await;
        let engine = fx.engine.clone().with_payload_hook(Arc::new(Redact));
        listen(&fx.registry, "s1", "l1", false).await;

        engine.on_save(&SaveEvent::new("user", "1", &["email"])).await.unwrap();

        let payload = &fx.publisher.frames()[0].1.payload;
        assert!(payload.get("email").is_none());
        assert_eq!(payload["for"], "l1");
    }

    #[test]
    fn outcome_serializes_with_a_tag() {
        let value = serde_json::to_value(FanoutOutcome::Delivered {
            sessions: vec!["s1".into()],
            dropped: vec![],
        })
        .unwrap();
        assert_eq!(value["outcome"], "delivered");
        assert_eq!(value["sessions"], json!(["s1"]));
    }
}
