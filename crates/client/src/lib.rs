//! Client side of modelsync: live record mirrors kept in step with the
//! daemon's update pushes, shared per process through a [`RecordStore`].

pub mod collection;
pub mod config;
pub mod error;
pub mod observer;
pub mod path;
pub mod record;
pub mod scheduler;
pub mod scope;
pub mod store;
pub mod transport;

pub use collection::{CollectionQuery, LiveCollection, QueryOp};
pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use record::{ListenState, LiveRecord, RecordOptions};
pub use scope::ViewerScope;
pub use store::RecordStore;
pub use transport::{LoopbackTransport, Transport, WsTransport};
