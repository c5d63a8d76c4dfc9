//! # Error Types
//!
//! Error handling for the transport layer.
//!
//! This module defines every error variant that can occur while serializing,
//! sending or receiving through the transport, from low-level socket failures to
//! stream desynchronization and queue contention.
//!
//! ## Error Categories
//! - **I/O Errors**: socket bind and send failures
//! - **Stream Errors**: overflow, out-of-range values, checkpoint mismatches
//! - **Capacity Errors**: messages too large for any buffer, too many fragments
//! - **Contention Errors**: a reliable batch already in flight, send rate exhausted
//! - **Configuration Errors**: invalid settings, unresolvable addresses
//!
//! Protocol mismatches (wrong protocol ID, failed CRC) are never surfaced as errors;
//! such datagrams are dropped where they are read.
//!
//! ## Example Usage
//! ```rust
//! use drudgenet::error::{NetError, Result};
//! use drudgenet::core::address::Address;
//!
//! fn parse(text: &str) -> Result<Address> {
//!     text.parse::<Address>()
//! }
//!
//! match parse("10.0.0.1:30000") {
//!     Ok(address) => assert_eq!(address.port(), 30000),
//!     Err(e) => panic!("unexpected error: {e}"),
//! }
//! assert!(matches!(parse("nonsense"), Err(NetError::AddressParse(_))));
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Configuration file errors
    pub const ERR_CONFIG_OPEN: &str = "Failed to open config file";
    pub const ERR_CONFIG_READ: &str = "Failed to read config file";
    pub const ERR_CONFIG_PARSE: &str = "Failed to parse TOML";
    pub const ERR_CONFIG_SERIALIZE: &str = "Failed to serialize config";
    pub const ERR_CONFIG_WRITE: &str = "Failed to write config file";

    /// Local transport errors
    pub const ERR_LOCAL_HOST_TAKEN: &str = "Local network already has a host";
    pub const ERR_LOCAL_NO_SLOTS: &str = "Local network has no slots";
}

/// NetError is the error type for every fallible transport operation
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Stream overflow: needed {needed} bits, {available} available")]
    StreamOverflow { needed: usize, available: usize },

    #[error("Stream underflow: needed {needed} bits, {available} remaining")]
    StreamUnderflow { needed: usize, available: usize },

    #[error("Value {value} outside serialized range [{min}, {max}]")]
    ValueOutOfRange { value: i64, min: i64, max: i64 },

    #[error("String too long for stream: {0} bytes (maximum 255)")]
    StringTooLong(usize),

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Stream checkpoint mismatch at bit {bit}: expected {expected:#x}, found {found:#x}")]
    CheckpointMismatch { expected: u32, found: u32, bit: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Message too large: {bits} bits exceeds buffer capacity of {capacity} bits")]
    MessageTooLarge { bits: usize, capacity: usize },

    #[error("Payload needs {0} fragments (maximum 255)")]
    TooManyFragments(usize),

    #[error("A fragmented transfer is already in flight")]
    FragmentBusy,

    #[error("A reliable message batch is already in flight to node {0}")]
    ReliableInFlight(usize),

    #[error("Node {0} is not connected")]
    NodeNotConnected(usize),

    #[error("Send rate exhausted for node {0}")]
    RateLimited(usize),

    #[error("Packet header is truncated or malformed")]
    InvalidHeader,

    #[error("Transport has not been started")]
    NotStarted,

    #[error("Invalid address: {0}")]
    AddressParse(String),

    #[error("No lobby entry or address matches '{0}'")]
    UnknownHost(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Type alias for Results using NetError
pub type Result<T> = std::result::Result<T, NetError>;
