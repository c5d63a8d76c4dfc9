//! # DrudgeNet
//!
//! Peer-mesh networking over reliable UDP.
//!
//! A host runs a mesh, a small rendezvous service that admits nodes and
//! broadcasts the node table, and every participant (the host included) runs
//! a node. Nodes then exchange packets directly, each carrying sequence and
//! acknowledgement fields that drive per-link reliability and flow control.
//! On top sits [`DrudgeNet`], which packs typed, bit-serialized messages into
//! packets, fragments payloads larger than one packet and resends reliable
//! messages until they are acknowledged.
//!
//! Hosts are found on a LAN through beacon broadcasts, or across the internet
//! through a master server. An in-process transport serves tests.
//!
//! Everything is single-threaded and tick-driven: call `update(dt)` once per
//! frame and drain events with `poll_event()`.
//!
//! ## Layers
//! - [`core`]: addresses, non-blocking sockets, bit streams
//! - [`protocol`]: messages, fragments, reliability, flow control
//! - [`transport`]: mesh, node and the LAN/IP/local transports
//! - [`service`]: master server and its client connection
//! - [`net`]: the [`DrudgeNet`] message layer
//!
//! ## Example
//! ```rust
//! use drudgenet::config::MessagingConfig;
//! use drudgenet::net::{DrudgeNet, NetEvent};
//! use drudgenet::protocol::MessageFactory;
//! use drudgenet::transport::LocalNetwork;
//!
//! let network = LocalNetwork::new(4);
//! let mut host = DrudgeNet::new(
//!     Box::new(network.transport()),
//!     MessageFactory::new(),
//!     MessagingConfig::default(),
//! )
//! .expect("valid config");
//! host.start_server("lobby").expect("host");
//! host.update(1.0 / 30.0).expect("tick");
//! assert!(matches!(host.poll_event(), Some(NetEvent::Connected)));
//! assert_eq!(host.local_node_id(), Some(0));
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod net;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{NetError, Result};
pub use net::{DrudgeNet, MessageId, NetEvent};
