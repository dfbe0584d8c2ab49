use std::any::type_name;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mio::Waker;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, trace, warn};

use crate::network::{ConnectionId, ConnectionShared, DisconnectReason, Frame, Outbound};

use super::{Connection, EngineConfig, Handler, Shutdown};

/// Runs handler callbacks off the reactor thread.
///
/// Every connection gets its own dispatch task fed by its own queue, which keeps callbacks
/// for one connection in wire order while letting connections proceed independently.
/// Each callback runs as a separate task so a panic is logged and contained.
///
/// A session counts against `max_connections` from `on_connect` until `on_disconnect`
/// returns, so the reactor admits by [`Dispatcher::live_sessions`] rather than by open
/// sockets.
#[derive(Debug)]
pub struct Dispatcher<H: Handler> {
    runtime: Handle,
    handler: Arc<H>,
    outbound: Outbound,
    config: Arc<EngineConfig>,
    live_sessions: Arc<AtomicUsize>,
    waker: Arc<Waker>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(
        runtime: Handle,
        handler: Arc<H>,
        outbound: Outbound,
        config: Arc<EngineConfig>,
        waker: Arc<Waker>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Dispatcher {
            runtime,
            handler,
            outbound,
            config,
            live_sessions: Arc::new(AtomicUsize::new(0)),
            waker,
            notify_shutdown,
            shutdown_complete_tx,
        }
    }

    /// Sessions whose `on_disconnect` has not returned yet.
    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::Acquire)
    }

    /// Starts the dispatch task of a newly opened connection and returns the queue the
    /// reactor feeds its frames into. Closing that queue ends the session with
    /// `on_disconnect`, after every frame already queued has been delivered.
    pub fn spawn_connection(&self, shared: Arc<ConnectionShared>) -> async_channel::Sender<Frame> {
        let (frames_tx, frames_rx) = async_channel::unbounded();
        let conn = Connection::new(shared.id(), shared.peer_addr(), self.outbound.clone());
        let handler = self.handler.clone();
        let config = self.config.clone();
        let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
        let shutdown_complete_tx = self.shutdown_complete_tx.clone();
        let slot = SessionSlot::acquire(self.live_sessions.clone(), self.waker.clone());

        self.runtime.spawn(async move {
            // dropped when the session ends, letting `stop` observe completion
            let _shutdown_complete_tx = shutdown_complete_tx;
            let id = conn.id();
            let capacity = config.dispatch_queue_capacity;
            let abandoned = tokio::select! {
                _ = deliver(&handler, &conn, &frames_rx, &slot, capacity) => false,
                _ = shutdown.recv() => {
                    warn!(id, "dispatch session abandoned, pending callbacks cancelled");
                    true
                }
            };

            // the reactor records the reason before it closes the queue
            let reason = shared
                .disconnect_reason()
                .unwrap_or(DisconnectReason::LocalStop);
            let on_disconnect = run_callback(id, "on_disconnect", async move {
                handler.on_disconnect(conn, reason).await
            });
            if abandoned {
                if tokio::time::timeout(config.shutdown_timeout(), on_disconnect)
                    .await
                    .is_err()
                {
                    warn!(id, "on_disconnect did not return in time, cancelled");
                }
            } else {
                on_disconnect.await;
            }
            debug!(id, "dispatch session finished");
            drop(slot);
        });
        frames_tx
    }
}

/// One admitted connection's claim on `max_connections`; released when the session ends.
struct SessionSlot {
    live_sessions: Arc<AtomicUsize>,
    waker: Arc<Waker>,
}

impl SessionSlot {
    fn acquire(live_sessions: Arc<AtomicUsize>, waker: Arc<Waker>) -> Self {
        live_sessions.fetch_add(1, Ordering::AcqRel);
        SessionSlot {
            live_sessions,
            waker,
        }
    }

    fn wake_reactor(&self) {
        if let Err(err) = self.waker.wake() {
            // only fails once the reactor is gone
            trace!(%err, "failed to wake reactor");
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.live_sessions.fetch_sub(1, Ordering::AcqRel);
        // a peer may be waiting in the backlog for this slot
        self.wake_reactor();
    }
}

async fn deliver<H: Handler>(
    handler: &Arc<H>,
    conn: &Connection,
    frames: &async_channel::Receiver<Frame>,
    slot: &SessionSlot,
    capacity: usize,
) {
    let id = conn.id();
    {
        let handler = handler.clone();
        let conn = conn.clone();
        run_callback(id, "on_connect", async move { handler.on_connect(conn).await }).await;
    }

    // a closed queue still yields the frames queued before it was closed
    while let Ok(frame) = frames.recv().await {
        if frames.len() + 1 == capacity {
            // dropped below the high-water mark; the reactor may have paused reads
            slot.wake_reactor();
        }
        trace!(id, request_id = frame.request_id, "dispatching frame");
        let handler = handler.clone();
        let conn = conn.clone();
        run_callback(id, "on_message", async move {
            handler
                .on_message(conn, frame.request_id, frame.payload)
                .await
        })
        .await;
    }
}

/// Aborts the callback task if the session is abandoned while it runs.
struct CallbackTask(JoinHandle<()>);

impl Drop for CallbackTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_callback<F>(id: ConnectionId, callback: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut task = CallbackTask(tokio::spawn(fut));
    if let Err(err) = (&mut task.0).await {
        if err.is_panic() {
            log_callback_panic(id, callback, err);
        } else {
            debug!(id, callback, "callback cancelled");
        }
    }
}

fn log_callback_panic(id: ConnectionId, callback: &'static str, err: JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!(id, "{callback} panicked with message: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!(id, "{callback} panicked with message: {message}");
    } else {
        error!(
            id,
            "{callback} panicked with an unknown type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}
