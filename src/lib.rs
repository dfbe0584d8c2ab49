//! Synapse: a connection-multiplexing TCP server engine.
//!
//! One reactor thread multiplexes every socket, decodes length-delimited frames tagged with
//! a request id, and hands them to a [`Handler`] running on the tokio runtime. Replies go
//! out through [`Connection::send`] or [`Engine::send`] from any thread.

pub mod network;
pub mod service;

pub use network::{ConnectionId, DisconnectReason, Frame, FrameCodec, Outbound, HEADER_SIZE};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BackpressurePolicy, Connection,
    Engine, EngineConfig, Handler, LogGuard, LogLevel,
};
