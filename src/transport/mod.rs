//! # Transports
//!
//! Node-addressed packet delivery with reliability headers and flow control.
//!
//! Every transport variant puts the same 12-byte [`ReliabilityHeader`] in
//! front of each packet and gates sends through a per-node [`FlowControl`].
//! They differ only in how nodes find each other:
//!
//! - [`LanTransport`]: beacon broadcasts and a listener build the lobby, the
//!   host runs a mesh on its own machine.
//! - [`IpTransport`]: a master server brokers hosts and clients.
//! - [`LocalTransport`]: an in-process switchboard for tests and simulations.
//!
//! [`ReliabilityHeader`]: connection::ReliabilityHeader
//! [`FlowControl`]: crate::protocol::flow_control::FlowControl

pub mod connection;
pub mod ip;
pub mod lan;
pub mod links;
pub mod local;
pub mod mesh;
pub mod node;
mod session;

use crate::config::{NetworkConfig, TransportKind};
use crate::core::address::Address;
use crate::error::Result;
use crate::protocol::reliability::ReliabilitySystem;

pub use ip::IpTransport;
pub use lan::LanTransport;
pub use local::{LocalNetwork, LocalTransport};

/// Notifications queued by a transport and drained with [`Transport::poll_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// This side joined a mesh and has a node id
    Connected,
    /// Joining gave up
    ConnectFailed,
    /// The mesh went silent
    Disconnected,
    NodeConnected(usize),
    NodeDisconnected(usize),
    /// `sequence` sent to `node_id` was acknowledged
    PacketAcked { node_id: usize, sequence: u32 },
    /// Reachability of the master server changed
    MasterServerConnection(bool),
}

/// A discoverable host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyEntry {
    pub name: String,
    /// Address a client connects to
    pub address: Address,
    pub current_players: u8,
    pub total_capacity: u8,
}

impl LobbyEntry {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            current_players: 0,
            total_capacity: 0,
        }
    }
}

/// Node-addressed packet transport
pub trait Transport {
    /// Host a session named `name` and join it as node 0
    fn start_server(&mut self, name: &str) -> Result<()>;

    /// Join the host named by `target`, a literal address or a lobby name
    fn connect_client(&mut self, target: &str) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn connect_failed(&self) -> bool;

    fn is_node_connected(&self, node_id: usize) -> bool;

    fn local_node_id(&self) -> Option<usize>;

    /// Size of the node table, zero until connected
    fn max_nodes(&self) -> usize;

    /// Whether flow control has a free send slot for `node_id`
    fn can_send(&self, node_id: usize) -> bool;

    /// Send `data` to `node_id` and return the sequence it was sent with
    fn send_packet(&mut self, node_id: usize, data: &[u8]) -> Result<u32>;

    /// Oldest new payload and its sender
    fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)>;

    /// Start discovering hosts
    fn enter_lobby(&mut self) -> Result<()>;

    fn lobby_entry_count(&self) -> usize;

    fn lobby_entry(&self, index: usize) -> Option<LobbyEntry>;

    fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem>;

    /// Advance by `dt` seconds; call once per tick
    fn update(&mut self, dt: f32) -> Result<()>;

    fn poll_event(&mut self) -> Option<TransportEvent>;

    fn stop(&mut self);
}

/// Build the socket transport selected by `config`
///
/// A [`TransportKind::Local`] transport needs a shared [`LocalNetwork`] and is
/// created with [`LocalNetwork::transport`] instead; asking for one here gets a
/// transport on a private network of its own.
pub fn create(config: &NetworkConfig) -> Box<dyn Transport> {
    match config.transport.kind {
        TransportKind::Lan => Box::new(LanTransport::new(config.transport.clone())),
        TransportKind::Ip => Box::new(IpTransport::new(
            config.transport.clone(),
            config.master_server.clone(),
        )),
        TransportKind::Local => Box::new(LocalNetwork::new(config.transport.max_nodes).transport()),
    }
}
