use std::path::PathBuf;

use bytes::Bytes;
use clap::Parser;
use dotenv::dotenv;
use synapse::{
    setup_tracing, AppResult, Connection, DisconnectReason, Engine, EngineConfig, Handler,
    LogLevel,
};
use tokio::{runtime, signal};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log file
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective config and exit
    PrintConfig,
}

/// Replies to every frame with the same request id and payload.
struct EchoHandler;

impl Handler for EchoHandler {
    async fn on_connect(&self, conn: Connection) {
        info!(id = conn.id(), peer_addr = %conn.peer_addr(), "peer connected");
    }

    async fn on_message(&self, conn: Connection, request_id: u64, payload: Bytes) {
        if let Err(err) = conn.send(request_id, &payload) {
            warn!(id = conn.id(), request_id, %err, "echo failed");
        }
    }

    async fn on_disconnect(&self, conn: Connection, reason: DisconnectReason) {
        info!(id = conn.id(), ?reason, "peer disconnected");
    }
}

fn main() -> AppResult<()> {
    // load .env
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config_found = config_path.exists();
    let mut config = if config_found {
        EngineConfig::set_up_config(&config_path)?
    } else {
        EngineConfig::default()
    };
    match commandline.verbose {
        0 => {}
        1 => config.log_level = LogLevel::Info,
        _ => config.log_level = LogLevel::Debug,
    }

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let _log_guard = setup_tracing(config.log_level, &commandline.log_dir);
    if !config_found {
        warn!(path = %config_path.display(), "config file not found, using defaults");
    }

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("synapse-worker")
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}

async fn run(config: EngineConfig) -> AppResult<()> {
    let mut engine = Engine::create(config, EchoHandler)?;
    engine.start()?;

    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to listen for the shutdown signal");
    }
    info!("get shutdown signal");

    engine.stop().await?;
    engine.destroy()
}
