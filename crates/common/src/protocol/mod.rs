// Wire protocol: JSON-RPC envelope, method names, push channel naming.

pub mod channels;
pub mod jsonrpc;
pub mod rpc_methods;
