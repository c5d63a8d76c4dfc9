//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use drudgenet::config::{NetworkConfig, TransportKind, MAX_NODES};
use drudgenet::NetError;
use std::time::Duration;

fn errors_with(mutator: impl FnOnce(&mut NetworkConfig)) -> Vec<String> {
    NetworkConfig::default_with_overrides(mutator).validate()
}

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_zero_protocol_id() {
    let errors = errors_with(|c| c.transport.protocol_id = 0);
    assert!(errors.iter().any(|e| e.contains("Protocol ID cannot be 0")));
}

#[test]
fn test_max_nodes_bounds() {
    let errors = errors_with(|c| c.transport.max_nodes = 0);
    assert!(errors.iter().any(|e| e.contains("Max nodes must be greater than 0")));

    let errors = errors_with(|c| c.transport.max_nodes = MAX_NODES + 1);
    assert!(errors.iter().any(|e| e.contains("Max nodes too large")));
}

#[test]
fn test_mesh_send_rate_against_timeout() {
    let errors = errors_with(|c| c.transport.mesh_send_rate = Duration::from_secs(20));
    assert!(errors
        .iter()
        .any(|e| e.contains("Mesh send rate must be shorter than the timeout")));
}

#[test]
fn test_short_timeout() {
    let errors = errors_with(|c| c.transport.timeout = Duration::from_millis(50));
    assert!(errors.iter().any(|e| e.contains("Timeout too short")));
}

#[test]
fn test_clashing_ports() {
    let errors = errors_with(|c| c.transport.client_port = c.transport.server_port);
    assert!(errors
        .iter()
        .any(|e| e.contains("The server and client ports must differ")));

    // the in-process transport never binds
    let errors = errors_with(|c| {
        c.transport.kind = TransportKind::Local;
        c.transport.client_port = c.transport.server_port;
    });
    assert!(errors.is_empty(), "{errors:?}");
}

#[test]
fn test_beacon_and_listener_ports() {
    let errors = errors_with(|c| c.transport.listener_port = c.transport.beacon_port);
    assert!(errors
        .iter()
        .any(|e| e.contains("Beacon and listener ports must differ")));
}

#[test]
fn test_master_server_address() {
    let errors = errors_with(|c| c.master_server.address = String::new());
    assert!(errors
        .iter()
        .any(|e| e.contains("Master server address cannot be empty")));

    let errors = errors_with(|c| c.master_server.address = "not-an-ip".to_string());
    assert!(errors.iter().any(|e| e.contains("Invalid master server address")));

    let errors = errors_with(|c| c.master_server.port = 0);
    assert!(errors.iter().any(|e| e.contains("Master server port cannot be 0")));
}

#[test]
fn test_messaging_limits() {
    let errors = errors_with(|c| c.messaging.mtu = 32);
    assert!(errors.iter().any(|e| e.contains("MTU too small (minimum: 64 bytes)")));

    let errors = errors_with(|c| c.messaging.buffer_capacity = 512);
    assert!(errors
        .iter()
        .any(|e| e.contains("Buffer capacity cannot be smaller than the MTU")));

    let errors = errors_with(|c| c.messaging.mtu = 1401);
    assert!(errors
        .iter()
        .any(|e| e.contains("MTU (1401) cannot exceed max packet size (1400)")));
}

#[test]
fn test_empty_app_name() {
    let errors = errors_with(|c| c.logging.app_name = String::new());
    assert!(errors.iter().any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    assert!(NetworkConfig::default().validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.protocol_id = 0;
        c.logging.app_name = String::new();
    });
    match config.validate_strict() {
        Err(NetError::ConfigError(message)) => {
            assert!(message.contains("Configuration validation failed"));
            assert!(message.contains("Protocol ID cannot be 0"));
            assert!(message.contains("Application name cannot be empty"));
        }
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn test_example_config_parses_back() {
    let text = NetworkConfig::example_config();
    assert!(text.contains("[transport]"));
    let parsed = NetworkConfig::from_toml(&text).expect("example config should parse");
    assert_eq!(parsed.transport.protocol_id, NetworkConfig::default().transport.protocol_id);
    assert_eq!(parsed.messaging.reliable_resend_time, Duration::from_millis(200));
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_missing_sections_take_defaults() {
    let parsed = NetworkConfig::from_toml("").expect("empty TOML is the default config");
    assert_eq!(parsed.transport.kind, TransportKind::Lan);
    assert_eq!(parsed.messaging.mtu, 1024);
}

#[test]
fn test_malformed_toml() {
    assert!(matches!(
        NetworkConfig::from_toml("[transport\nkind = "),
        Err(NetError::ConfigError(_))
    ));
}
