// modelsync-daemon: subscription registry owner and update fan-out.

pub mod config;
pub mod error;
pub mod fanout;
pub mod http;
pub mod hub;
pub mod proxy;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod source;
