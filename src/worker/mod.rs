//! Streaming worker channel: wire protocol, connection registry and the
//! TCP listener.

pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{Register, ServerMessage, TaskRequest, TaskResult, WorkerMessage};
pub use registry::{PushError, WorkerRegistry};
pub use server::WorkerServer;
