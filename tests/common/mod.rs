#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use synapse::{Connection, ConnectionId, DisconnectReason, Engine, EngineConfig, Handler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(ConnectionId),
    Message(ConnectionId, u64, Bytes),
    Disconnect(ConnectionId, DisconnectReason),
}

/// Records every callback; optionally echoes and stalls on one request id.
#[derive(Default, Clone)]
pub struct RecordingHandler {
    pub events: Arc<Mutex<Vec<Event>>>,
    pub echo: bool,
    pub stall_on: Option<u64>,
}

impl RecordingHandler {
    pub fn echo() -> Self {
        RecordingHandler {
            echo: true,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn connects(&self) -> Vec<ConnectionId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Connect(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<(ConnectionId, DisconnectReason)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Disconnect(id, reason) => Some((*id, *reason)),
                _ => None,
            })
            .collect()
    }

    pub fn messages_of(&self, id: ConnectionId) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Message(conn, request_id, _) if *conn == id => Some(*request_id),
                _ => None,
            })
            .collect()
    }
}

impl Handler for RecordingHandler {
    async fn on_connect(&self, conn: Connection) {
        self.events.lock().push(Event::Connect(conn.id()));
    }

    async fn on_message(&self, conn: Connection, request_id: u64, payload: Bytes) {
        if self.stall_on == Some(request_id) {
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        self.events
            .lock()
            .push(Event::Message(conn.id(), request_id, payload.clone()));
        if self.echo {
            let _ = conn.send(request_id, &payload);
        }
    }

    async fn on_disconnect(&self, conn: Connection, reason: DisconnectReason) {
        self.events.lock().push(Event::Disconnect(conn.id(), reason));
    }
}

pub fn local_config() -> EngineConfig {
    EngineConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        poll_timeout_ms: 10,
        ..Default::default()
    }
}

pub fn start_engine(
    config: EngineConfig,
    handler: RecordingHandler,
) -> (Engine<RecordingHandler>, RecordingHandler, SocketAddr) {
    let mut engine = Engine::create(config, handler.clone()).unwrap();
    engine.start().unwrap();
    let addr = engine.local_addr().unwrap();
    (engine, handler, addr)
}

/// Polls `condition` until it holds or `WAIT` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn write_frame(stream: &mut TcpStream, request_id: u64, payload: &[u8]) {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

pub async fn read_frame(stream: &mut TcpStream) -> (u64, Vec<u8>) {
    let mut header = [0u8; 16];
    tokio::time::timeout(WAIT, stream.read_exact(&mut header))
        .await
        .expect("timed out reading frame header")
        .unwrap();
    let request_id = u64::from_be_bytes(header[..8].try_into().unwrap());
    let len = u64::from_be_bytes(header[8..].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    tokio::time::timeout(WAIT, stream.read_exact(&mut payload))
        .await
        .expect("timed out reading frame payload")
        .unwrap();
    (request_id, payload)
}

/// Waits for the server to close the stream.
pub async fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("timed out waiting for eof")
        {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
