//! # Configuration Management
//!
//! Centralized configuration for the transport and its collaborators.
//!
//! This module provides structured configuration for the transport (ports,
//! protocol ID, timeouts, node capacity), the master server rendezvous, the
//! message layer (MTU, buffer capacity, resend timing) and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (`DRUDGENET_*`)
//! - Direct instantiation with defaults, or `default_with_overrides()`
//!
//! ## Units
//! Durations are written to TOML as whole milliseconds.

use crate::error::{constants, NetError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default protocol ID shared by every party of one session
pub const DEFAULT_PROTOCOL_ID: u32 = 0x4452_5547;

/// Largest datagram the transport will build or accept
pub const MAX_PACKET_SIZE: usize = 1400;

/// Upper bound on nodes in one mesh (node ids travel as single bytes)
pub const MAX_NODES: usize = 255;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Master server rendezvous configuration
    #[serde(default)]
    pub master_server: MasterServerConfig,

    /// Message layer configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| NetError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_OPEN)))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| NetError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_READ)))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| NetError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_PARSE)))
    }

    /// Load configuration from environment variables
    ///
    /// Unset variables keep their defaults; unparsable values are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(kind) = std::env::var("DRUDGENET_TRANSPORT") {
            config.transport.kind = match kind.to_ascii_lowercase().as_str() {
                "lan" => TransportKind::Lan,
                "ip" => TransportKind::Ip,
                "local" => TransportKind::Local,
                other => {
                    return Err(NetError::ConfigError(format!(
                        "Unknown transport kind in DRUDGENET_TRANSPORT: '{other}'"
                    )))
                }
            };
        }

        if let Some(id) = env_parse::<u32>("DRUDGENET_PROTOCOL_ID")? {
            config.transport.protocol_id = id;
        }
        if let Some(port) = env_parse::<u16>("DRUDGENET_MESH_PORT")? {
            config.transport.mesh_port = port;
        }
        if let Some(port) = env_parse::<u16>("DRUDGENET_SERVER_PORT")? {
            config.transport.server_port = port;
        }
        if let Some(port) = env_parse::<u16>("DRUDGENET_CLIENT_PORT")? {
            config.transport.client_port = port;
        }
        if let Some(ms) = env_parse::<u64>("DRUDGENET_TIMEOUT_MS")? {
            config.transport.timeout = Duration::from_millis(ms);
        }
        if let Some(nodes) = env_parse::<usize>("DRUDGENET_MAX_NODES")? {
            config.transport.max_nodes = nodes;
        }

        if let Ok(address) = std::env::var("DRUDGENET_MASTER_ADDRESS") {
            config.master_server.address = address;
        }
        if let Some(port) = env_parse::<u16>("DRUDGENET_MASTER_PORT")? {
            config.master_server.port = port;
        }

        if let Some(mtu) = env_parse::<usize>("DRUDGENET_MTU")? {
            config.messaging.mtu = mtu;
        }

        if let Ok(level) = std::env::var("DRUDGENET_LOG_LEVEL") {
            config.logging.log_level = level
                .parse::<Level>()
                .map_err(|_| NetError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NetError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_SERIALIZE)))?;

        std::fs::write(path, content)
            .map_err(|e| NetError::ConfigError(format!("{}: {e}", constants::ERR_CONFIG_WRITE)))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.transport.validate());
        errors.extend(self.master_server.validate());
        errors.extend(self.messaging.validate());
        errors.extend(self.logging.validate());

        if self.messaging.mtu > self.transport.max_packet_size {
            errors.push(format!(
                "MTU ({}) cannot exceed max packet size ({})",
                self.messaging.mtu, self.transport.max_packet_size
            ));
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| NetError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Which transport variant to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Broadcast discovery on the local network
    #[default]
    Lan,
    /// Rendezvous through a master server
    Ip,
    /// In-process switchboard
    Local,
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Transport variant
    pub kind: TransportKind,

    /// Protocol ID mixed into every checksum
    pub protocol_id: u32,

    /// Port the mesh listens on
    pub mesh_port: u16,

    /// Port a hosting node binds
    pub server_port: u16,

    /// Port a joining node binds
    pub client_port: u16,

    /// Port the LAN beacon sends from
    pub beacon_port: u16,

    /// Port the LAN listener binds (beacons are broadcast to it)
    pub listener_port: u16,

    /// Interval between mesh protocol packets (join requests, keep-alives, updates)
    #[serde(with = "duration_serde")]
    pub mesh_send_rate: Duration,

    /// Silence after which a link is considered dead
    #[serde(with = "duration_serde")]
    pub timeout: Duration,

    /// Capacity of the node table
    pub max_nodes: usize,

    /// Largest datagram built or accepted, in bytes
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            protocol_id: DEFAULT_PROTOCOL_ID,
            mesh_port: 30000,
            server_port: 30001,
            client_port: 30002,
            beacon_port: 40000,
            listener_port: 40001,
            mesh_send_rate: Duration::from_millis(250),
            timeout: Duration::from_secs(10),
            max_nodes: 4,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.protocol_id == 0 {
            errors.push("Protocol ID cannot be 0".to_string());
        }

        if self.max_nodes == 0 {
            errors.push("Max nodes must be greater than 0".to_string());
        } else if self.max_nodes > MAX_NODES {
            errors.push(format!(
                "Max nodes too large: {} (maximum: {MAX_NODES})",
                self.max_nodes
            ));
        }

        if self.mesh_send_rate.as_millis() < 10 {
            errors.push("Mesh send rate too short (minimum: 10ms)".to_string());
        } else if self.mesh_send_rate >= self.timeout {
            errors.push("Mesh send rate must be shorter than the timeout".to_string());
        }

        if self.timeout.as_millis() < 100 {
            errors.push("Timeout too short (minimum: 100ms)".to_string());
        } else if self.timeout.as_secs() > 300 {
            errors.push("Timeout too long (maximum: 300s)".to_string());
        }

        if self.max_packet_size < 64 {
            errors.push("Max packet size too small (minimum: 64 bytes)".to_string());
        } else if self.max_packet_size > 65_507 {
            errors.push(format!(
                "Max packet size too large: {} bytes (UDP maximum: 65507)",
                self.max_packet_size
            ));
        }

        if self.kind != TransportKind::Local {
            let ports = [
                ("mesh", self.mesh_port),
                ("server", self.server_port),
                ("client", self.client_port),
            ];
            for (i, (name_a, port_a)) in ports.iter().enumerate() {
                for (name_b, port_b) in &ports[i + 1..] {
                    if port_a == port_b && *port_a != 0 {
                        errors.push(format!(
                            "The {name_a} and {name_b} ports must differ (both {port_a})"
                        ));
                    }
                }
            }
        }

        if self.kind == TransportKind::Lan && self.beacon_port == self.listener_port {
            errors.push("Beacon and listener ports must differ".to_string());
        }

        errors
    }
}

/// Master server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterServerConfig {
    /// Master server IPv4 address
    pub address: String,

    /// Master server port
    pub port: u16,

    /// Interval between status updates, pings and list requests
    #[serde(with = "duration_serde")]
    pub update_rate: Duration,

    /// Silence after which a host, client, or the master itself is dropped
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for MasterServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1"),
            port: 30500,
            update_rate: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

impl MasterServerConfig {
    /// Validate master server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Master server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::Ipv4Addr>().is_err() {
            errors.push(format!(
                "Invalid master server address: '{}' (expected format: '10.0.0.1')",
                self.address
            ));
        }

        if self.port == 0 {
            errors.push("Master server port cannot be 0".to_string());
        }

        if self.update_rate.as_millis() < 10 {
            errors.push("Master update rate too short (minimum: 10ms)".to_string());
        }

        if self.timeout <= self.update_rate {
            errors.push("Master timeout must be longer than the update rate".to_string());
        }

        errors
    }
}

/// Message layer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessagingConfig {
    /// Largest packet body the message layer packs, in bytes
    pub mtu: usize,

    /// Largest single message accepted by `send_message`, in bytes
    pub buffer_capacity: usize,

    /// Time after which an unacknowledged reliable message is resent
    #[serde(with = "duration_serde")]
    pub reliable_resend_time: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            mtu: 1024,
            buffer_capacity: 64 * 1024,
            reliable_resend_time: Duration::from_millis(200),
        }
    }
}

impl MessagingConfig {
    /// Validate messaging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mtu < 64 {
            errors.push("MTU too small (minimum: 64 bytes)".to_string());
        }

        if self.buffer_capacity < self.mtu {
            errors.push("Buffer capacity cannot be smaller than the MTU".to_string());
        } else if self.buffer_capacity > self.mtu.saturating_sub(3) * 255 {
            errors.push(format!(
                "Buffer capacity too large: {} bytes (at most 255 fragments of the MTU)",
                self.buffer_capacity
            ));
        }

        if self.reliable_resend_time.as_millis() < 10 {
            errors.push("Reliable resend time too short (minimum: 10ms)".to_string());
        }

        errors
    }

    /// Validate, failing with every problem found
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(NetError::ConfigError(format!(
                "Messaging configuration invalid:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("drudgenet"),
            log_level: Level::INFO,
            log_to_console: true,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
