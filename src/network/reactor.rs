use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::{Shutdown as NetShutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use super::connection::ReadOutcome;
use super::{
    ConnectionId, ConnectionRecord, ConnectionShared, ConnectionTable, DisconnectReason,
    FrameCodec, Listener, ReactorCommand,
};
use crate::service::{Dispatcher, EngineConfig, Handler};
use crate::AppResult;

pub(crate) const LISTENER_TOKEN: Token = Token(0);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const MAX_POLL_BACKOFF_MS: u64 = 64;

/// Creates the poll instance and the waker other threads use to interrupt it.
pub(crate) fn new_poll() -> AppResult<(Poll, Arc<Waker>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    Ok((poll, waker))
}

/// The single event loop owning every socket of the engine.
///
/// Nothing else reads or writes a connection's socket. Each iteration waits for readiness,
/// makes one non-blocking attempt per ready connection, applies commands from the send path,
/// and only then tears down connections that failed during the iteration, so an event for a
/// connection closed earlier in the same batch is never applied to freed state.
pub struct Reactor<H: Handler> {
    poll: Poll,
    listener: Listener,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    table: Arc<ConnectionTable>,
    commands: async_channel::Receiver<ReactorCommand>,
    dispatcher: Dispatcher<H>,
    codec: FrameCodec,
    config: Arc<EngineConfig>,
    running: Arc<AtomicBool>,
    scratch: Vec<u8>,
    /// the listener may hold peers that have not been accepted yet
    accept_pending: bool,
    /// connections whose last read returned data; read again until it would block
    read_pending: HashSet<ConnectionId>,
    /// connections not being read because their dispatch queue is full; the session wakes
    /// the reactor once it drains below capacity
    paused: HashSet<ConnectionId>,
    /// closes deferred to the end of the current iteration
    pending_close: HashMap<ConnectionId, DisconnectReason>,
}

impl<H: Handler> Reactor<H> {
    pub(crate) fn new(
        poll: Poll,
        mut listener: Listener,
        table: Arc<ConnectionTable>,
        commands: async_channel::Receiver<ReactorCommand>,
        dispatcher: Dispatcher<H>,
        config: Arc<EngineConfig>,
        running: Arc<AtomicBool>,
    ) -> AppResult<Self> {
        poll.registry()
            .register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Reactor {
            poll,
            listener,
            connections: HashMap::with_capacity(config.max_connections.min(1024)),
            table,
            commands,
            dispatcher,
            codec: FrameCodec::new(config.max_payload_size),
            scratch: vec![0u8; config.buffer_size],
            config,
            running,
            accept_pending: false,
            read_pending: HashSet::new(),
            paused: HashSet::new(),
            pending_close: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Runs until the running flag is cleared, then closes every connection.
    pub fn run(mut self) {
        info!(addr = %self.local_addr(), "reactor started");
        let mut events = Events::with_capacity(self.config.max_events);
        let mut backoff = 1;

        while self.running.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                if backoff > MAX_POLL_BACKOFF_MS {
                    error!(%err, "poll keeps failing, reactor gives up");
                    break;
                }
                warn!(%err, backoff_ms = backoff, "poll failed, retrying");
                thread::sleep(Duration::from_millis(backoff));
                backoff *= 2;
                continue;
            }
            backoff = 1;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    // commands, resumes and freed slots are all handled below
                    WAKER_TOKEN => {}
                    Token(token) => self.handle_event(token as ConnectionId, event),
                }
            }

            self.process_commands();
            self.process_pending_reads();
            self.process_pending_closes();
            if self.accept_pending {
                self.accept_connections();
            }
        }

        self.shutdown();
    }

    fn poll_timeout(&self) -> Duration {
        // paused connections are resumed by a wake from their dispatch session
        if !self.read_pending.is_empty() {
            Duration::ZERO
        } else {
            self.config.poll_timeout()
        }
    }

    fn accept_connections(&mut self) {
        loop {
            // a slot frees up only once on_disconnect has returned, and the session wakes us
            if self.dispatcher.live_sessions() >= self.config.max_connections {
                // peers wait in the kernel backlog meanwhile
                if !self.accept_pending {
                    debug!(
                        max_connections = self.config.max_connections,
                        "connection limit reached, pausing accept"
                    );
                }
                self.accept_pending = true;
                return;
            }
            match self.listener.accept() {
                Ok(Some((stream, peer_addr))) => self.register_connection(stream, peer_addr),
                Ok(None) => {
                    self.accept_pending = false;
                    return;
                }
                Err(err) => {
                    // retried on the next iteration
                    warn!(%err, "accept failed");
                    self.accept_pending = true;
                    return;
                }
            }
        }
    }

    fn register_connection(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.table.next_id();
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut stream, Token(id as usize), Interest::READABLE)
        {
            warn!(id, %peer_addr, %err, "failed to register connection, dropping it");
            return;
        }

        let shared = Arc::new(ConnectionShared::new(id, peer_addr));
        self.table.insert(shared.clone());
        shared.open();
        let events = self.dispatcher.spawn_connection(shared.clone());
        self.connections.insert(
            id,
            ConnectionRecord::new(stream, shared, events, self.config.buffer_size),
        );
        // bytes may have arrived before registration
        self.read_pending.insert(id);
        info!(id, %peer_addr, "connection opened");
    }

    fn handle_event(&mut self, id: ConnectionId, event: &Event) {
        if self.pending_close.contains_key(&id) || !self.connections.contains_key(&id) {
            trace!(id, "event for a closing connection ignored");
            return;
        }
        if event.is_writable() {
            self.handle_writable(id);
        }
        // errors and hang-ups surface through the read attempt
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.handle_readable(id);
        }
    }

    fn handle_readable(&mut self, id: ConnectionId) {
        if self.pending_close.contains_key(&id) {
            return;
        }
        let Some(record) = self.connections.get_mut(&id) else {
            return;
        };
        if record.undispatched() >= self.config.dispatch_queue_capacity {
            // leave the bytes in the kernel and let tcp flow control push back on the peer
            self.read_pending.remove(&id);
            if self.paused.insert(id) {
                debug!(id, "dispatch queue full, pausing reads");
            }
            return;
        }

        let close = match record.read_once(&mut self.scratch) {
            Ok(ReadOutcome::Data) => {
                self.read_pending.insert(id);
                Self::dispatch_frames(record, &self.codec)
            }
            Ok(ReadOutcome::WouldBlock) => {
                self.read_pending.remove(&id);
                None
            }
            Ok(ReadOutcome::Eof) => Some(DisconnectReason::PeerClosed),
            Err(err) => {
                debug!(id, %err, "read failed");
                Some(DisconnectReason::IoError)
            }
        };
        if let Some(reason) = close {
            self.schedule_close(id, reason);
        }
    }

    fn dispatch_frames(
        record: &mut ConnectionRecord,
        codec: &FrameCodec,
    ) -> Option<DisconnectReason> {
        loop {
            match record.next_frame(codec) {
                Ok(Some(frame)) => {
                    trace!(id = record.id(), request_id = frame.request_id, "frame decoded");
                    record.dispatch(frame);
                }
                Ok(None) => return None,
                Err(err) => {
                    warn!(id = record.id(), %err, "protocol violation, closing connection");
                    return Some(DisconnectReason::ProtocolViolation);
                }
            }
        }
    }

    fn handle_writable(&mut self, id: ConnectionId) {
        if self.pending_close.contains_key(&id) {
            return;
        }
        let Some(record) = self.connections.get_mut(&id) else {
            return;
        };
        let pending = match record.flush() {
            Ok(pending) => pending,
            Err(err) => {
                debug!(id, %err, "write failed");
                self.schedule_close(id, DisconnectReason::IoError);
                return;
            }
        };

        let interest = if pending {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != record.interest {
            if let Err(err) =
                self.poll
                    .registry()
                    .reregister(&mut record.stream, Token(id as usize), interest)
            {
                debug!(id, %err, "reregister failed");
                self.schedule_close(id, DisconnectReason::IoError);
                return;
            }
            record.interest = interest;
        }
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ReactorCommand::Flush(id) => self.handle_writable(id),
                ReactorCommand::Close(id, reason) => {
                    if self.connections.contains_key(&id) {
                        self.schedule_close(id, reason);
                    }
                }
            }
        }
    }

    fn process_pending_reads(&mut self) {
        let resumable: Vec<ConnectionId> = self
            .paused
            .iter()
            .copied()
            .filter(|id| {
                self.connections
                    .get(id)
                    .map_or(true, |record| {
                        record.undispatched() < self.config.dispatch_queue_capacity
                    })
            })
            .collect();
        for id in resumable {
            self.paused.remove(&id);
            debug!(id, "dispatch caught up, resuming reads");
            self.read_pending.insert(id);
        }

        let pending: Vec<ConnectionId> = self.read_pending.iter().copied().collect();
        for id in pending {
            self.handle_readable(id);
        }
    }

    fn process_pending_closes(&mut self) {
        let closes: Vec<(ConnectionId, DisconnectReason)> = self.pending_close.drain().collect();
        for (id, reason) in closes {
            self.close_connection(id, reason);
        }
    }

    /// The first reason recorded for a connection wins.
    fn schedule_close(&mut self, id: ConnectionId, reason: DisconnectReason) {
        self.pending_close.entry(id).or_insert(reason);
    }

    /// Drives a connection through `Closing` into `Closed`.
    fn close_connection(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(mut record) = self.connections.remove(&id) else {
            return;
        };
        self.read_pending.remove(&id);
        self.paused.remove(&id);

        // invisible to new sends from here on
        self.table.remove(id);
        record.shared.begin_close();

        if matches!(
            reason,
            DisconnectReason::LocalClose | DisconnectReason::LocalStop | DisconnectReason::Backpressure
        ) {
            // best effort: whatever the socket takes right now
            if let Err(err) = record.flush() {
                debug!(id, %err, "final flush failed");
            }
        }
        if let Err(err) = self.poll.registry().deregister(&mut record.stream) {
            debug!(id, %err, "deregister failed");
        }
        let _ = record.stream.shutdown(NetShutdown::Both);

        record.shared.finish_close(reason);
        // the session delivers what is already queued, then calls on_disconnect
        record.events.close();
        info!(id, peer_addr = %record.shared.peer_addr(), ?reason, "connection closed");

        // the slot frees when the session ends, which wakes the reactor
        self.accept_pending = true;
    }

    fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let count = ids.len();
        for id in ids {
            let reason = self
                .pending_close
                .remove(&id)
                .unwrap_or(DisconnectReason::LocalStop);
            self.close_connection(id, reason);
        }
        if let Err(err) = self.poll.registry().deregister(self.listener.source()) {
            debug!(%err, "deregister listener failed");
        }
        info!(closed = count, "reactor stopped");
    }
}
