use std::sync::Arc;

use mio::Waker;
use tracing::{trace, warn};

use super::connection::Enqueued;
use super::{ConnectionId, ConnectionTable, DisconnectReason, FrameCodec};
use crate::service::BackpressurePolicy;
use crate::{AppError, AppResult};

/// Requests other threads make of the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorCommand {
    /// a connection's outbound queue went from idle to non-empty
    Flush(ConnectionId),
    Close(ConnectionId, DisconnectReason),
}

/// Thread-safe send path into a running engine.
///
/// `send` only encodes and enqueues; the reactor performs the write. A successful return
/// means the frame was accepted for delivery, not that it reached the peer.
#[derive(Debug, Clone)]
pub struct Outbound {
    table: Arc<ConnectionTable>,
    codec: FrameCodec,
    max_outbound_bytes: usize,
    policy: BackpressurePolicy,
    commands: async_channel::Sender<ReactorCommand>,
    waker: Arc<Waker>,
}

impl Outbound {
    pub(crate) fn new(
        table: Arc<ConnectionTable>,
        codec: FrameCodec,
        max_outbound_bytes: usize,
        policy: BackpressurePolicy,
        commands: async_channel::Sender<ReactorCommand>,
        waker: Arc<Waker>,
    ) -> Self {
        Outbound {
            table,
            codec,
            max_outbound_bytes,
            policy,
            commands,
            waker,
        }
    }

    pub fn send(&self, id: ConnectionId, request_id: u64, payload: &[u8]) -> AppResult<()> {
        if payload.len() > self.codec.max_payload_size() {
            return Err(AppError::PayloadTooLarge {
                size: payload.len(),
                max: self.codec.max_payload_size(),
            });
        }
        let connection = self
            .table
            .get(id)
            .ok_or(AppError::UnknownConnection(id))?;
        let frame = self.codec.encode(request_id, payload)?;

        match connection.enqueue(frame, self.max_outbound_bytes) {
            Ok(Enqueued::ScheduleFlush) => self.submit(ReactorCommand::Flush(id)),
            Ok(Enqueued::Queued) => {
                trace!(id, request_id, "frame queued behind a pending flush");
                Ok(())
            }
            Err(AppError::Backpressure(id)) => {
                warn!(
                    id,
                    queued = connection.queued_bytes(),
                    policy = ?self.policy,
                    "outbound queue full"
                );
                if self.policy == BackpressurePolicy::Disconnect {
                    self.submit(ReactorCommand::Close(id, DisconnectReason::Backpressure))?;
                }
                Err(AppError::Backpressure(id))
            }
            Err(err) => Err(err),
        }
    }

    /// Asks the reactor to close a connection; `on_disconnect` reports `LocalClose`.
    pub fn close(&self, id: ConnectionId) -> AppResult<()> {
        if !self.table.contains(id) {
            return Err(AppError::UnknownConnection(id));
        }
        self.submit(ReactorCommand::Close(id, DisconnectReason::LocalClose))
    }

    fn submit(&self, command: ReactorCommand) -> AppResult<()> {
        // the command channel is unbounded, so this only fails once the reactor has exited
        self.commands
            .try_send(command)
            .map_err(|_| AppError::NotRunning)?;
        self.waker.wake()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionShared;
    use mio::{Poll, Token};

    struct Fixture {
        outbound: Outbound,
        commands: async_channel::Receiver<ReactorCommand>,
        table: Arc<ConnectionTable>,
        _poll: Poll,
    }

    fn fixture(max_outbound_bytes: usize, policy: BackpressurePolicy) -> Fixture {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, rx) = async_channel::unbounded();
        let table = Arc::new(ConnectionTable::new());
        Fixture {
            outbound: Outbound::new(
                table.clone(),
                FrameCodec::new(64),
                max_outbound_bytes,
                policy,
                tx,
                waker,
            ),
            commands: rx,
            table,
            _poll: poll,
        }
    }

    fn open_connection(table: &ConnectionTable) -> ConnectionId {
        let conn = Arc::new(ConnectionShared::new(
            table.next_id(),
            "127.0.0.1:1".parse().unwrap(),
        ));
        conn.open();
        let id = conn.id();
        table.insert(conn);
        id
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let f = fixture(1024, BackpressurePolicy::Reject);
        let err = f.outbound.send(404, 1, b"hi").unwrap_err();
        assert!(matches!(err, AppError::UnknownConnection(404)));
        assert!(f.commands.is_empty());
    }

    #[test]
    fn test_send_payload_too_large() {
        let f = fixture(1024, BackpressurePolicy::Reject);
        let id = open_connection(&f.table);
        let err = f.outbound.send(id, 1, &[0; 65]).unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { size: 65, max: 64 }));
    }

    #[test]
    fn test_first_send_schedules_one_flush() {
        let f = fixture(1024, BackpressurePolicy::Reject);
        let id = open_connection(&f.table);
        f.outbound.send(id, 1, b"one").unwrap();
        f.outbound.send(id, 2, b"two").unwrap();
        assert_eq!(f.commands.try_recv().unwrap(), ReactorCommand::Flush(id));
        assert!(f.commands.try_recv().is_err());
        assert_eq!(f.table.get(id).unwrap().queued_bytes(), 2 * (16 + 3));
    }

    #[test]
    fn test_backpressure_reject_keeps_connection() {
        let f = fixture(20, BackpressurePolicy::Reject);
        let id = open_connection(&f.table);
        f.outbound.send(id, 1, b"fill").unwrap();
        let err = f.outbound.send(id, 2, b"more").unwrap_err();
        assert!(matches!(err, AppError::Backpressure(_)));
        assert_eq!(f.commands.try_recv().unwrap(), ReactorCommand::Flush(id));
        assert!(f.commands.try_recv().is_err());
    }

    #[test]
    fn test_backpressure_disconnect_requests_close() {
        let f = fixture(20, BackpressurePolicy::Disconnect);
        let id = open_connection(&f.table);
        f.outbound.send(id, 1, b"fill").unwrap();
        assert!(f.outbound.send(id, 2, b"more").is_err());
        assert_eq!(f.commands.try_recv().unwrap(), ReactorCommand::Flush(id));
        assert_eq!(
            f.commands.try_recv().unwrap(),
            ReactorCommand::Close(id, DisconnectReason::Backpressure)
        );
    }

    #[test]
    fn test_send_after_reactor_exit() {
        let f = fixture(1024, BackpressurePolicy::Reject);
        let id = open_connection(&f.table);
        f.commands.close();
        let err = f.outbound.send(id, 1, b"late").unwrap_err();
        assert!(matches!(err, AppError::NotRunning));
    }
}
