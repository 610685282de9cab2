pub mod args;
pub mod buffer;
pub mod correlator;
pub mod errors;
pub mod ids;
pub mod registry;
pub mod wire;

pub use buffer::PreConnectBuffer;
pub use correlator::CallCorrelator;
pub use errors::{DispatchError, InvokeError, RegistryError};
pub use ids::{CallId, CallIdGenerator, ConnectionId, PageKey};
pub use registry::{async_fn, sync_fn, ExposedFunction, FunctionRegistry};
pub use wire::{safe_json, safe_value, Call, CallResult, Frame, Invocation, PeerError, Resolution, Status};
