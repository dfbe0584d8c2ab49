use std::io::Write;

use rstest::rstest;
use synapse::{AppError, BackpressurePolicy, EngineConfig, LogLevel};
use tempfile::Builder;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
        host = "127.0.0.1"
        port = 9100
        backlog = 64
        buffer_size = 4096
        max_events = 32
        max_connections = 10
        log_level = "debug"
        max_payload_size = 65536
        max_outbound_bytes = 131072
        backpressure_policy = "disconnect"
        dispatch_queue_capacity = 16
        poll_timeout_ms = 50
        shutdown_timeout_ms = 1000
        "#,
    );
    let config = EngineConfig::set_up_config(file.path()).unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 9100);
    assert_eq!(config.backlog, 64);
    assert_eq!(config.buffer_size, 4096);
    assert_eq!(config.max_events, 32);
    assert_eq!(config.max_connections, 10);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.max_payload_size, 65536);
    assert_eq!(config.max_outbound_bytes, 131072);
    assert_eq!(config.backpressure_policy, BackpressurePolicy::Disconnect);
    assert_eq!(config.dispatch_queue_capacity, 16);
    assert_eq!(config.poll_timeout_ms, 50);
    assert_eq!(config.shutdown_timeout_ms, 1000);
}

#[test]
fn test_partial_config_uses_defaults() {
    let file = write_config("max_connections = 3\n");
    let config = EngineConfig::set_up_config(file.path()).unwrap();
    assert_eq!(
        config,
        EngineConfig {
            max_connections: 3,
            ..Default::default()
        }
    );
}

#[rstest]
#[case::zero_backlog("backlog = 0")]
#[case::tiny_buffer("buffer_size = 4")]
#[case::no_events("max_events = 0")]
#[case::no_connections("max_connections = 0")]
#[case::hostname("host = \"example.com\"")]
fn test_out_of_range_values(#[case] contents: &str) {
    let file = write_config(contents);
    assert!(matches!(
        EngineConfig::set_up_config(file.path()),
        Err(AppError::InvalidConfig(_))
    ));
}

#[test]
fn test_unknown_log_level() {
    let file = write_config("log_level = \"chatty\"");
    assert!(matches!(
        EngineConfig::set_up_config(file.path()),
        Err(AppError::ConfigFileError(_))
    ));
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(matches!(
        EngineConfig::set_up_config(path),
        Err(AppError::ConfigFileError(_))
    ));
}
