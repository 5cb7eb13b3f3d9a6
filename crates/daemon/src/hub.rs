// Per-session push channels.
//
// A session may have several live connections (one per tab); a publish goes
// to each of them. Closed connections are pruned on the next publish.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use modelsync_common::protocol::channels::PushFrame;
use tokio::sync::mpsc;

use crate::error::PublishError;

/// Sink for pushes addressed to a viewing session.
pub trait SessionPublisher: Send + Sync {
    fn publish(&self, session_id: &str, frame: PushFrame) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, Default)]
pub struct SessionHub {
    sessions: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<PushFrame>>>>>,
}

impl SessionHub {
    /// Open a new push stream for `session_id`.
    pub fn attach(&self, session_id: &str) -> mpsc::UnboundedReceiver<PushFrame> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .push(sender);
        receiver
    }

    /// Drop every stream of `session_id`.
    pub fn detach(&self, session_id: &str) {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner).remove(session_id);
    }

    pub fn is_attached(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|senders| senders.iter().any(|sender| !sender.is_closed()))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl SessionPublisher for SessionHub {
    fn publish(&self, session_id: &str, frame: PushFrame) -> Result<(), PublishError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = sessions.get_mut(session_id) else {
            return Err(PublishError::SessionOffline(session_id.to_string()));
        };

        senders.retain(|sender| sender.send(frame.clone()).is_ok());
        if senders.is_empty() {
            sessions.remove(session_id);
            return Err(PublishError::SessionOffline(session_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frame() -> PushFrame {
        PushFrame::new("model.update.user.1", json!({ "name": "Ada" }))
    }

    #[tokio::test]
    async fn publish_reaches_every_connection_of_the_session() {
        let hub = SessionHub::default();
        let mut tab_a = hub.attach("s1");
        let mut tab_b = hub.attach("s1");

        hub.publish("s1", frame()).unwrap();

        assert_eq!(tab_a.recv().await, Some(frame()));
        assert_eq!(tab_b.recv().await, Some(frame()));
    }

    #[test]
    fn publish_to_unknown_session_is_offline() {
        let hub = SessionHub::default();
        assert_eq!(hub.publish("ghost", frame()), Err(PublishError::SessionOffline("ghost".into())));
    }

    #[test]
    fn closed_connections_are_pruned_on_publish() {
        let hub = SessionHub::default();
        let receiver = hub.attach("s1");
        drop(receiver);

        assert!(!hub.is_attached("s1"));
        assert!(hub.publish("s1", frame()).is_err());
        assert_eq!(hub.session_count(), 0);
    }

    #[tokio::test]
    async fn one_closed_tab_does_not_block_the_other() {
        let hub = SessionHub::default();
        drop(hub.attach("s1"));
        let mut live = hub.attach("s1");

        hub.publish("s1", frame()).unwrap();
        assert_eq!(live.recv().await, Some(frame()));
    }

    #[test]
    fn detach_removes_the_session() {
        let hub = SessionHub::default();
        let _receiver = hub.attach("s1");
        hub.detach("s1");
        assert!(!hub.is_attached("s1"));
    }
}
