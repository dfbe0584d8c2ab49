pub use app_error::{AppError, AppResult};
pub use config::{BackpressurePolicy, EngineConfig, LogLevel};
pub use dispatcher::Dispatcher;
pub use engine::Engine;
pub use handler::{Connection, Handler};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
mod config;
mod dispatcher;
mod engine;
mod handler;
mod shutdown;
mod tracing_config;
