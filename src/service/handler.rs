use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;

use crate::network::{ConnectionId, DisconnectReason, Outbound};
use crate::AppResult;

/// Application callbacks invoked by the dispatcher.
///
/// Callbacks for one connection run strictly one after another, in wire order, starting
/// with `on_connect` and ending with `on_disconnect`. Callbacks for different connections
/// run concurrently, so a handler that stalls holds up only its own connection.
pub trait Handler: Send + Sync + 'static {
    fn on_connect(&self, _conn: Connection) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_message(
        &self,
        conn: Connection,
        request_id: u64,
        payload: Bytes,
    ) -> impl Future<Output = ()> + Send;

    fn on_disconnect(
        &self,
        _conn: Connection,
        _reason: DisconnectReason,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Handle to one connection, given to every callback.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: Outbound,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, peer_addr: SocketAddr, outbound: Outbound) -> Self {
        Connection {
            id,
            peer_addr,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queues a frame to this connection, typically a reply carrying the request's id.
    pub fn send(&self, request_id: u64, payload: &[u8]) -> AppResult<()> {
        self.outbound.send(self.id, request_id, payload)
    }

    pub fn close(&self) -> AppResult<()> {
        self.outbound.close(self.id)
    }
}
