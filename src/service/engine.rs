use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::network::{new_poll, ConnectionId, ConnectionTable, FrameCodec, Listener, Outbound, Reactor};
use crate::{AppError, AppResult};

use super::{setup_local_tracing, Dispatcher, EngineConfig, Handler};

/// A connection-multiplexing server instance.
///
/// `create` validates the configuration, `start` binds and spawns the reactor thread,
/// `stop` tears every connection down and waits for the handler callbacks to finish, and
/// `destroy` releases the instance. `start` must be called from within a tokio runtime; the
/// handler callbacks run on that runtime.
pub struct Engine<H: Handler> {
    config: Arc<EngineConfig>,
    handler: Arc<H>,
    // outlives restarts so connection ids are never reused
    table: Arc<ConnectionTable>,
    state: EngineState,
}

enum EngineState {
    Created,
    Running(RunningEngine),
    Stopped,
}

struct RunningEngine {
    reactor: JoinHandle<()>,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    outbound: Outbound,
    local_addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<H: Handler> Engine<H> {
    pub fn create(config: EngineConfig, handler: H) -> AppResult<Self> {
        config.validate()?;
        setup_local_tracing(config.log_level);
        debug!(?config, "engine created");
        Ok(Engine {
            config: Arc::new(config),
            handler: Arc::new(handler),
            table: Arc::new(ConnectionTable::new()),
            state: EngineState::Created,
        })
    }

    /// Binds the listener and starts accepting connections.
    pub fn start(&mut self) -> AppResult<()> {
        if self.is_running() {
            return Err(AppError::AlreadyRunning);
        }
        let runtime = Handle::try_current().map_err(|_| {
            AppError::IllegalState("engine must be started within a tokio runtime".to_string())
        })?;

        let listen_address = self.config.listen_address()?;
        let listener = match Listener::bind(listen_address, self.config.backlog) {
            Ok(listener) => listener,
            Err(err) => {
                error!(%listen_address, %err, "failed to bind listener");
                return Err(err);
            }
        };
        let local_addr = listener.local_addr();

        let (poll, waker) = new_poll()?;
        let (commands_tx, commands_rx) = async_channel::unbounded();
        let outbound = Outbound::new(
            self.table.clone(),
            FrameCodec::new(self.config.max_payload_size),
            self.config.max_outbound_bytes,
            self.config.backpressure_policy,
            commands_tx,
            waker.clone(),
        );

        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        // the reactor owns the only sender outside the dispatch sessions
        let dispatcher = Dispatcher::new(
            runtime,
            self.handler.clone(),
            outbound.clone(),
            self.config.clone(),
            waker.clone(),
            notify_shutdown.clone(),
            shutdown_complete_tx,
        );

        let running = Arc::new(AtomicBool::new(true));
        let reactor = Reactor::new(
            poll,
            listener,
            self.table.clone(),
            commands_rx,
            dispatcher,
            self.config.clone(),
            running.clone(),
        )?;
        let reactor = thread::Builder::new()
            .name("synapse-reactor".to_string())
            .spawn(move || reactor.run())?;

        info!(%local_addr, "engine started");
        self.state = EngineState::Running(RunningEngine {
            reactor,
            running,
            waker,
            outbound,
            local_addr,
            notify_shutdown,
            shutdown_complete_rx,
        });
        Ok(())
    }

    /// Stops the reactor, closes every connection with `LocalStop` and waits until each
    /// connection's `on_disconnect` has returned.
    ///
    /// Calling it on an engine that is not running is a no-op. Sessions still busy after
    /// `shutdown_timeout_ms` have their pending callbacks cancelled, then run `on_disconnect`
    /// with the same bound.
    pub async fn stop(&mut self) -> AppResult<()> {
        let running = match std::mem::replace(&mut self.state, EngineState::Stopped) {
            EngineState::Running(running) => running,
            other => {
                debug!("stop called on an engine that is not running");
                self.state = other;
                return Ok(());
            }
        };
        info!(local_addr = %running.local_addr, "engine stopping");
        running.shutdown(&self.config).await;
        info!("engine stopped");
        Ok(())
    }

    /// Releases the engine. Fails while it is still running; call `stop` first.
    pub fn destroy(self) -> AppResult<()> {
        if self.is_running() {
            return Err(AppError::IllegalState(
                "engine destroyed while running".to_string(),
            ));
        }
        trace!("engine destroyed");
        Ok(())
    }

    /// Queues a frame to a connection. Never blocks on the network.
    pub fn send(&self, id: ConnectionId, request_id: u64, payload: &[u8]) -> AppResult<()> {
        self.outbound()?.send(id, request_id, payload)
    }

    pub fn close(&self, id: ConnectionId) -> AppResult<()> {
        self.outbound()?.close(id)
    }

    /// A cloneable send path for use from any thread while the engine runs.
    pub fn outbound(&self) -> AppResult<Outbound> {
        match &self.state {
            EngineState::Running(running) => Ok(running.outbound.clone()),
            _ => Err(AppError::NotRunning),
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        match &self.state {
            EngineState::Running(running) => Ok(running.local_addr),
            _ => Err(AppError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EngineState::Running(_))
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl RunningEngine {
    fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            // the reactor still sees the flag after one poll timeout
            warn!(%err, "failed to wake reactor");
        }
    }

    async fn shutdown(self, config: &EngineConfig) {
        self.signal_stop();

        let RunningEngine {
            reactor,
            notify_shutdown,
            mut shutdown_complete_rx,
            ..
        } = self;
        match tokio::task::spawn_blocking(move || reactor.join()).await {
            Ok(Ok(())) => trace!("reactor thread joined"),
            Ok(Err(_)) => error!("reactor thread panicked"),
            Err(err) => error!(%err, "failed to join reactor thread"),
        }

        // every dispatch session holds a completion sender until on_disconnect returns
        trace!("waiting for dispatch sessions to finish...");
        let timeout = config.shutdown_timeout();
        if tokio::time::timeout(timeout, shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            warn!(
                timeout_ms = config.shutdown_timeout_ms,
                "dispatch sessions did not finish in time, cancelling pending callbacks"
            );
            let _ = notify_shutdown.send(());
            shutdown_complete_rx.recv().await;
        }
    }
}

impl<H: Handler> Drop for Engine<H> {
    fn drop(&mut self) {
        if let EngineState::Running(running) = &self.state {
            // the reactor closes its connections on its own thread; nobody waits for it
            warn!("engine dropped while running, stopping reactor");
            running.signal_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Connection;
    use bytes::Bytes;

    struct Noop;

    impl Handler for Noop {
        async fn on_message(&self, _conn: Connection, _request_id: u64, _payload: Bytes) {}
    }

    fn local_config() -> EngineConfig {
        EngineConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_rejects_invalid_config() {
        let config = EngineConfig {
            max_connections: 0,
            ..local_config()
        };
        assert!(matches!(
            Engine::create(config, Noop),
            Err(AppError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_start_outside_runtime() {
        let mut engine = Engine::create(local_config(), Noop).unwrap();
        assert!(matches!(engine.start(), Err(AppError::IllegalState(_))));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_send_before_start() {
        let engine = Engine::create(local_config(), Noop).unwrap();
        assert!(matches!(engine.send(1, 1, b"x"), Err(AppError::NotRunning)));
        assert!(matches!(engine.close(1), Err(AppError::NotRunning)));
        assert!(matches!(engine.local_addr(), Err(AppError::NotRunning)));
        engine.destroy().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lifecycle() {
        let mut engine = Engine::create(local_config(), Noop).unwrap();
        engine.stop().await.unwrap();

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(AppError::AlreadyRunning)));
        assert_ne!(engine.local_addr().unwrap().port(), 0);
        assert!(matches!(
            engine.send(42, 1, b"x"),
            Err(AppError::UnknownConnection(42))
        ));

        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
        assert!(matches!(engine.send(42, 1, b"x"), Err(AppError::NotRunning)));

        // restart binds again
        engine.start().unwrap();
        engine.stop().await.unwrap();
        engine.destroy().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_destroy_while_running() {
        let mut engine = Engine::create(local_config(), Noop).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.destroy(), Err(AppError::IllegalState(_))));
    }
}
