// RPC method name constants.

// ── Daemon-internal ────────────────────────────────────────────────
pub const RPC_PING: &str = "rpc.ping";
pub const DAEMON_SHUTDOWN: &str = "daemon.shutdown";

// ── Registry owner (called by the subscription proxy) ──────────────
pub const MODEL_LISTEN: &str = "model.listen";
pub const MODEL_DEAFEN: &str = "model.deafen";

// ── Streaming (Unix socket only) ───────────────────────────────────
/// Turns the connection into a newline-delimited stream of the session's
/// push frames after the success response.
pub const SESSION_ATTACH: &str = "session.attach";

// ── Events ─────────────────────────────────────────────────────────
pub const MODEL_SAVE: &str = "model.save";

// ── Per-type endpoints (suffixed with the lowercase model type) ────
pub const MODEL_REFRESH_PREFIX: &str = "model.refresh.";
pub const MODEL_FIND_PREFIX: &str = "model.find.";
pub const MODEL_PERSIST_PREFIX: &str = "model.persist.";

/// `model.refresh.<type>`: returns the sanitized field map for an id.
pub fn refresh_method(model: &str) -> String {
    format!("{MODEL_REFRESH_PREFIX}{}", model.to_lowercase())
}

/// `model.listen.<type>`: session-scoped subscribe issued by a live record.
pub fn session_listen_method(model: &str) -> String {
    format!("{MODEL_LISTEN}.{}", model.to_lowercase())
}

/// `model.deafen.<type>`: session-scoped unsubscribe issued by a live record.
pub fn session_deafen_method(model: &str) -> String {
    format!("{MODEL_DEAFEN}.{}", model.to_lowercase())
}

/// `model.find.<type>`: remote query with an opaque predicate sequence.
pub fn find_method(model: &str) -> String {
    format!("{MODEL_FIND_PREFIX}{}", model.to_lowercase())
}

/// `model.persist.<type>`: persists a field delta from a local `set`.
pub fn persist_method(model: &str) -> String {
    format!("{MODEL_PERSIST_PREFIX}{}", model.to_lowercase())
}

/// Model type addressed by a `model.refresh.<type>` method, if any.
pub fn refresh_target(method: &str) -> Option<&str> {
    per_type_target(method, MODEL_REFRESH_PREFIX)
}

/// Model type addressed by a session-scoped `model.listen.<type>`.
pub fn session_listen_target(method: &str) -> Option<&str> {
    method.strip_prefix(MODEL_LISTEN).and_then(|rest| per_type_target(rest, "."))
}

/// Model type addressed by a session-scoped `model.deafen.<type>`.
pub fn session_deafen_target(method: &str) -> Option<&str> {
    method.strip_prefix(MODEL_DEAFEN).and_then(|rest| per_type_target(rest, "."))
}

fn per_type_target<'a>(method: &'a str, prefix: &str) -> Option<&'a str> {
    method.strip_prefix(prefix).filter(|model| !model.is_empty() && !model.contains('.'))
}

/// All fixed-name methods the daemon dispatches. `model.refresh.<type>` is
/// matched by prefix on top of these.
pub const IMPLEMENTED_METHODS: &[&str] =
    &[RPC_PING, DAEMON_SHUTDOWN, MODEL_LISTEN, MODEL_DEAFEN, MODEL_SAVE];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_type_methods_lowercase_the_model() {
        assert_eq!(refresh_method("User"), "model.refresh.user");
        assert_eq!(session_listen_method("User"), "model.listen.user");
        assert_eq!(session_deafen_method("User"), "model.deafen.user");
        assert_eq!(find_method("Order"), "model.find.order");
        assert_eq!(persist_method("Order"), "model.persist.order");
    }

    #[test]
    fn refresh_target_requires_a_model_suffix() {
        assert_eq!(refresh_target("model.refresh.user"), Some("user"));
        assert_eq!(refresh_target("model.refresh."), None);
        assert_eq!(refresh_target("model.listen"), None);
    }

    #[test]
    fn session_targets_need_exactly_one_type_segment() {
        assert_eq!(session_listen_target("model.listen.user"), Some("user"));
        assert_eq!(session_listen_target("model.listen"), None);
        assert_eq!(session_listen_target("model.listener.user"), None);
        assert_eq!(session_deafen_target("model.deafen.order"), Some("order"));
        assert_eq!(session_deafen_target("model.deafen.user.1"), None);
    }
}
