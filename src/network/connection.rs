use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;
use tracing::trace;

use crate::network::{Frame, FrameCodec};
use crate::{AppError, AppResult};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection left the `Open` state; handed to `on_disconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// the peer closed its end of the stream
    PeerClosed,
    /// the peer sent an oversized or malformed frame
    ProtocolViolation,
    /// an unrecoverable socket error
    IoError,
    /// the outbound queue overflowed under the `disconnect` policy
    Backpressure,
    /// the application closed this connection
    LocalClose,
    /// the engine is stopping
    LocalStop,
}

/// Outcome of a successful enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// the queue was idle, the reactor must be told to flush it
    ScheduleFlush,
    /// a flush is already pending
    Queued,
}

#[derive(Debug)]
struct OutboundQueue {
    state: ConnectionState,
    chunks: VecDeque<Bytes>,
    queued_bytes: usize,
    flush_scheduled: bool,
    reason: Option<DisconnectReason>,
}

/// The part of a connection shared between the reactor and senders.
///
/// The lifecycle state lives under the same lock as the outbound queue, so a send can never
/// enqueue onto a connection that has begun closing.
#[derive(Debug)]
pub struct ConnectionShared {
    id: ConnectionId,
    peer_addr: SocketAddr,
    outbound: Mutex<OutboundQueue>,
}

impl ConnectionShared {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr) -> Self {
        ConnectionShared {
            id,
            peer_addr,
            outbound: Mutex::new(OutboundQueue {
                state: ConnectionState::Connecting,
                chunks: VecDeque::new(),
                queued_bytes: 0,
                flush_scheduled: false,
                reason: None,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.outbound.lock().state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.outbound.lock().reason
    }

    pub fn queued_bytes(&self) -> usize {
        self.outbound.lock().queued_bytes
    }

    /// Appends an encoded frame, refusing it once the connection is closing or when the
    /// queue already holds `max_bytes`. An empty queue always takes one frame.
    pub fn enqueue(&self, frame: Bytes, max_bytes: usize) -> AppResult<Enqueued> {
        let mut outbound = self.outbound.lock();
        match outbound.state {
            ConnectionState::Connecting | ConnectionState::Open => {}
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(AppError::UnknownConnection(self.id));
            }
        }
        if outbound.queued_bytes > 0 && outbound.queued_bytes + frame.len() > max_bytes {
            return Err(AppError::Backpressure(self.id));
        }
        outbound.queued_bytes += frame.len();
        outbound.chunks.push_back(frame);
        if outbound.flush_scheduled {
            Ok(Enqueued::Queued)
        } else {
            outbound.flush_scheduled = true;
            Ok(Enqueued::ScheduleFlush)
        }
    }

    /// Writes queued chunks in order until the queue drains or the socket would block.
    /// Returns whether bytes are still waiting for the next writable event.
    pub fn flush<W: Write>(&self, writer: &mut W) -> io::Result<bool> {
        let mut outbound = self.outbound.lock();
        while let Some(chunk) = outbound.chunks.front_mut() {
            match writer.write(&chunk[..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    // partial writes resume from the exact offset next time
                    chunk.advance(n);
                    if chunk.is_empty() {
                        outbound.chunks.pop_front();
                    }
                    outbound.queued_bytes -= n;
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        let pending = !outbound.chunks.is_empty();
        outbound.flush_scheduled = pending;
        Ok(pending)
    }

    fn transition(&self, to: ConnectionState) -> ConnectionState {
        let mut outbound = self.outbound.lock();
        let from = outbound.state;
        outbound.state = to;
        from
    }

    pub(crate) fn open(&self) {
        let from = self.transition(ConnectionState::Open);
        debug_assert_eq!(from, ConnectionState::Connecting);
    }

    pub(crate) fn begin_close(&self) {
        let from = self.transition(ConnectionState::Closing);
        debug_assert!(matches!(
            from,
            ConnectionState::Connecting | ConnectionState::Open
        ));
    }

    pub(crate) fn finish_close(&self, reason: DisconnectReason) {
        let mut outbound = self.outbound.lock();
        debug_assert_eq!(outbound.state, ConnectionState::Closing);
        outbound.state = ConnectionState::Closed;
        outbound.reason = Some(reason);
        outbound.chunks.clear();
        outbound.queued_bytes = 0;
        outbound.flush_scheduled = false;
    }
}

/// Result of one read attempt on a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data,
    WouldBlock,
    Eof,
}

/// Reactor-owned state of one connection: the socket, the inbound accumulator, and the
/// sending half of its dispatch queue.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub(crate) stream: TcpStream,
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) inbound: BytesMut,
    pub(crate) interest: Interest,
    pub(crate) events: async_channel::Sender<Frame>,
}

impl ConnectionRecord {
    pub fn new(
        stream: TcpStream,
        shared: Arc<ConnectionShared>,
        events: async_channel::Sender<Frame>,
        buffer_size: usize,
    ) -> Self {
        ConnectionRecord {
            stream,
            shared,
            inbound: BytesMut::with_capacity(buffer_size),
            interest: Interest::READABLE,
            events,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id()
    }

    /// One non-blocking read into `scratch`, appending whatever arrived to the inbound buffer.
    pub fn read_once(&mut self, scratch: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                    trace!(id = self.id(), bytes = n, "read from connection");
                    return Ok(ReadOutcome::Data);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Splits the next complete frame off the inbound buffer. Once this returns `None` the
    /// buffer holds at most one partial frame.
    pub fn next_frame(&mut self, codec: &FrameCodec) -> AppResult<Option<Frame>> {
        codec.parse(&mut self.inbound)
    }

    /// Hands a frame to this connection's dispatch session.
    pub fn dispatch(&self, frame: Frame) {
        if self.events.try_send(frame).is_err() {
            // the session only goes away with the runtime, nobody is left to deliver to
            trace!(id = self.id(), "dispatch session gone, frame dropped");
        }
    }

    /// Frames handed to the dispatcher but not yet picked up.
    pub fn undispatched(&self) -> usize {
        self.events.len()
    }

    pub fn flush(&mut self) -> io::Result<bool> {
        self.shared.flush(&mut self.stream)
    }
}
