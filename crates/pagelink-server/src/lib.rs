pub mod bridge;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod manager;
pub mod remote;
pub mod server;

pub use bridge::{Bridge, BridgeBuilder, CallHandle};
pub use config::{BroadcastPolicy, ConfigError, RetryPolicy, ServerConfig};
pub use connection::Connection;
pub use manager::{CloseHandler, ConnectionManager};
pub use remote::RemoteFunction;
pub use server::{build_router, start, ServerHandle};
