//! Session lifecycle for the two MCP transports.

mod registry;

pub use registry::{
    Session, SessionConnection, SessionError, SessionRegistry, SessionState, ShutdownSignal,
    TransportKind,
};
