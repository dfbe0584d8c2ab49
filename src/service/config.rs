extern crate config as _;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::network::HEADER_SIZE;

const MAX_BACKLOG: u32 = 65535;
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;
const MAX_EVENTS: usize = 65536;

/// Log verbosity, ordered from silent to most verbose.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    None,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// The `EnvFilter` directive for this level.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// What happens when a connection's outbound queue is over `max_outbound_bytes`.
///
/// In both cases the offending `send` fails with `AppError::Backpressure`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Drop the new frame and keep the connection open.
    #[default]
    Reject,
    /// Drop the new frame and close the connection.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub host: String,
    pub port: u16,
    /// Depth of the kernel's pending-accept queue.
    pub backlog: u32,
    /// Bytes read from a socket per readiness event.
    pub buffer_size: usize,
    /// Readiness events processed per reactor iteration.
    pub max_events: usize,
    /// Admission ceiling for simultaneously open connections.
    pub max_connections: usize,
    pub log_level: LogLevel,
    /// Largest payload accepted on the wire and by `send`.
    pub max_payload_size: usize,
    /// Per-connection bound on encoded bytes waiting to be written.
    pub max_outbound_bytes: usize,
    pub backpressure_policy: BackpressurePolicy,
    /// Undispatched frames a connection may hold before the reactor stops reading it.
    pub dispatch_queue_capacity: usize,
    pub poll_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            host: "0.0.0.0".to_string(),
            port: 7878,
            backlog: 128,
            buffer_size: 16 * 1024,
            max_events: 64,
            max_connections: 1000,
            log_level: LogLevel::Info,
            max_payload_size: 4 * 1024 * 1024,
            max_outbound_bytes: 8 * 1024 * 1024,
            backpressure_policy: BackpressurePolicy::Reject,
            dispatch_queue_capacity: 1024,
            poll_timeout_ms: 100,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    /// Loads the config from a file, with `SYNAPSE_*` environment variables layered on top.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<EngineConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidConfig(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("SYNAPSE"))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        Ok(engine_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.host.parse::<IpAddr>().is_err() {
            return Err(invalid(format!("host {} is not an ip address", self.host)));
        }
        if self.backlog == 0 || self.backlog > MAX_BACKLOG {
            return Err(invalid(format!(
                "backlog {} out of range 1..={}",
                self.backlog, MAX_BACKLOG
            )));
        }
        if self.buffer_size < HEADER_SIZE || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(invalid(format!(
                "buffer_size {} out of range {}..={}",
                self.buffer_size, HEADER_SIZE, MAX_BUFFER_SIZE
            )));
        }
        if self.max_events == 0 || self.max_events > MAX_EVENTS {
            return Err(invalid(format!(
                "max_events {} out of range 1..={}",
                self.max_events, MAX_EVENTS
            )));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1".to_string()));
        }
        if self.max_payload_size == 0 {
            return Err(invalid("max_payload_size must be at least 1".to_string()));
        }
        if self.max_outbound_bytes == 0 {
            return Err(invalid("max_outbound_bytes must be at least 1".to_string()));
        }
        if self.dispatch_queue_capacity == 0 {
            return Err(invalid(
                "dispatch_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(invalid("poll_timeout_ms must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> AppResult<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| invalid(format!("host {} is not an ip address", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn invalid(msg: String) -> AppError {
    AppError::InvalidConfig(msg)
}
