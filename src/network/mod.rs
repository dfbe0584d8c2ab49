//! Network Module Implementation
//!
//! Socket-facing half of the engine: everything that touches a file descriptor lives here
//! and is driven by a single reactor thread.
//!
//! # Architecture
//!
//! The module is built on mio's readiness API and consists of:
//! - A listener bound with an explicit accept backlog
//! - A reactor owning the poll set and every connection socket
//! - A connection table shared with the send path
//! - A frame codec for the length-delimited wire format
//!
//! # Components
//!
//! - `Reactor`: the event loop; accepts, reads, writes and closes
//! - `ConnectionRecord`: reactor-owned socket state of one connection
//! - `ConnectionShared`: lifecycle state and outbound queue, shared with senders
//! - `ConnectionTable`: concurrent id to connection lookup
//! - `FrameCodec`: splits a byte stream into `Frame`s and encodes replies
//! - `Outbound`: thread-safe send path waking the reactor on demand
//!
//! # Wire format
//!
//! ```text
//! +----------------+----------------+-----------------+
//! | request_id u64 | payload_len u64| payload         |
//! +----------------+----------------+-----------------+
//! ```
//!
//! Both header fields are big-endian.

pub use connection::{
    ConnectionId, ConnectionRecord, ConnectionShared, ConnectionState, DisconnectReason,
};
pub use frame::{Frame, FrameCodec, HEADER_SIZE};
pub use listener::Listener;
pub use outbound::{Outbound, ReactorCommand};
pub(crate) use reactor::new_poll;
pub use reactor::Reactor;
pub use table::ConnectionTable;

mod connection;
mod frame;
mod listener;
mod outbound;
mod reactor;
mod table;
