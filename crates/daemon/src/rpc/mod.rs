// JSON-RPC serving: registry-owner dispatch, Unix socket framing, and the
// session-scoped WebSocket gateway.

pub mod methods;
pub mod unix;
pub mod ws;
