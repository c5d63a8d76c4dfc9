//! # Node
//!
//! Client side of the mesh: joins a mesh, mirrors its node table and exchanges
//! data packets directly with the other nodes.
//!
//! ```text
//! Disconnected --join--> Joining --accepted--> Joined
//!                           |                     |
//!                        timeout               timeout
//!                           v                     v
//!                        JoinFail            Disconnected
//! ```
//!
//! Every timeout clears the mirrored table. Inbound data is only accepted from
//! addresses present in the table and is buffered in arrival order.

use std::collections::{BTreeMap, VecDeque};

use bytes::Buf;
use tracing::{debug, info, instrument};

use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE};
use crate::error::{NetError, Result};
use crate::transport::mesh::{
    decode_packet, encode_packet, MeshConfig, CONNECTION_ACCEPTED, DATA, JOIN_REQUEST, KEEP_ALIVE,
    UPDATE, UPDATE_ENTRY_SIZE,
};

/// Membership state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Disconnected,
    Joining,
    Joined,
    JoinFail,
}

/// Transitions reported by [`Node::poll_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Joined,
    JoinFailed,
    Disconnected,
    NodeConnected(usize),
    NodeDisconnected(usize),
}

/// One row of the mirrored table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeState {
    pub connected: bool,
    pub address: Address,
    pub node_id: Option<usize>,
}

/// Mesh member
#[derive(Debug)]
pub struct Node {
    config: MeshConfig,
    socket: Option<Socket>,
    status: NodeStatus,
    mesh_address: Address,
    local_node_id: Option<usize>,
    nodes: Vec<NodeState>,
    address_to_node: BTreeMap<Address, usize>,
    send_accumulator: f32,
    timeout_accumulator: f32,
    received: VecDeque<(usize, Vec<u8>)>,
    events: VecDeque<NodeEvent>,
}

impl Node {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            socket: None,
            status: NodeStatus::Disconnected,
            mesh_address: Address::default(),
            local_node_id: None,
            nodes: Vec::new(),
            address_to_node: BTreeMap::new(),
            send_accumulator: 0.0,
            timeout_accumulator: 0.0,
            received: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self, port: u16) -> Result<()> {
        let socket = Socket::open(port, SocketOptions::default())?;
        info!(port = socket.port(), "Node started");
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("Node stopped");
        }
        self.status = NodeStatus::Disconnected;
        self.clear_table();
        self.received.clear();
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(Socket::port)
    }

    /// Start joining the mesh at `mesh_address`
    pub fn join(&mut self, mesh_address: Address) -> Result<()> {
        if self.socket.is_none() {
            return Err(NetError::NotStarted);
        }
        info!(%mesh_address, "Node joining mesh");
        self.clear_table();
        self.mesh_address = mesh_address;
        self.status = NodeStatus::Joining;
        self.timeout_accumulator = 0.0;
        self.send_accumulator = self.config.send_rate;
        Ok(())
    }

    /// Leave the mesh without notifying anyone
    pub fn leave(&mut self) {
        self.status = NodeStatus::Disconnected;
        self.clear_table();
    }

    fn clear_table(&mut self) {
        self.local_node_id = None;
        self.nodes.clear();
        self.address_to_node.clear();
        self.timeout_accumulator = 0.0;
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn is_joining(&self) -> bool {
        self.status == NodeStatus::Joining
    }

    pub fn join_failed(&self) -> bool {
        self.status == NodeStatus::JoinFail
    }

    pub fn is_connected(&self) -> bool {
        self.status == NodeStatus::Joined
    }

    pub fn local_node_id(&self) -> Option<usize> {
        self.local_node_id
    }

    pub fn mesh_address(&self) -> Address {
        self.mesh_address
    }

    /// Table size announced by the mesh, zero until joined
    pub fn max_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_node_connected(&self, node_id: usize) -> bool {
        self.nodes.get(node_id).is_some_and(|n| n.connected)
    }

    pub fn node_address(&self, node_id: usize) -> Option<Address> {
        self.nodes
            .get(node_id)
            .filter(|n| n.connected)
            .map(|n| n.address)
    }

    /// The mirrored table
    pub fn nodes(&self) -> &[NodeState] {
        &self.nodes
    }

    /// Send `data` to `node_id`; `Ok(false)` when the socket buffer is full
    pub fn send_packet(&mut self, node_id: usize, data: &[u8]) -> Result<bool> {
        let socket = self.socket.as_ref().ok_or(NetError::NotStarted)?;
        if self.status != NodeStatus::Joined {
            return Err(NetError::NodeNotConnected(node_id));
        }
        let address = self
            .node_address(node_id)
            .ok_or(NetError::NodeNotConnected(node_id))?;
        let packet = encode_packet(self.config.protocol_id, DATA, data);
        socket.send(address, &packet)
    }

    /// Oldest buffered data packet
    pub fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        self.received.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    /// Receive, send and expire; call once per tick
    pub fn update(&mut self, dt: f32) -> Result<()> {
        if self.socket.is_none() {
            return Ok(());
        }
        self.receive_packets()?;
        self.send_packets(dt)?;
        self.check_timeout(dt);
        Ok(())
    }

    fn receive_packets(&mut self) -> Result<()> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = match &self.socket {
                Some(socket) => socket.receive(&mut buffer)?,
                None => None,
            };
            let Some((sender, size)) = received else {
                return Ok(());
            };
            let Some((packet_type, payload)) =
                decode_packet(self.config.protocol_id, &buffer[..size])
            else {
                debug!(%sender, size, "Node dropped datagram failing the checksum");
                continue;
            };
            if sender == self.mesh_address {
                match packet_type {
                    CONNECTION_ACCEPTED => self.process_connection_accepted(payload),
                    UPDATE => self.process_update(payload),
                    _ => debug!(packet_type, "Node ignored unexpected mesh packet"),
                }
            } else if packet_type == DATA {
                match self.address_to_node.get(&sender) {
                    Some(&node_id) if self.status == NodeStatus::Joined => {
                        self.received.push_back((node_id, payload.to_vec()));
                    }
                    _ => debug!(%sender, "Node dropped data from unknown address"),
                }
            }
        }
    }

    fn process_connection_accepted(&mut self, payload: &[u8]) {
        match self.status {
            NodeStatus::Joining => {}
            NodeStatus::Joined => {
                self.timeout_accumulator = 0.0;
                return;
            }
            _ => return,
        }
        let [node_id, node_count] = payload else {
            debug!(len = payload.len(), "Malformed connection accepted");
            return;
        };
        let (node_id, node_count) = (usize::from(*node_id), usize::from(*node_count));
        if node_id >= node_count {
            debug!(node_id, node_count, "Connection accepted with out of range node id");
            return;
        }
        info!(node_id, node_count, "Node joined mesh");
        self.status = NodeStatus::Joined;
        self.local_node_id = Some(node_id);
        self.nodes = vec![NodeState::default(); node_count];
        self.timeout_accumulator = 0.0;
        self.events.push_back(NodeEvent::Joined);
    }

    fn process_update(&mut self, payload: &[u8]) {
        if self.status != NodeStatus::Joined {
            return;
        }
        if payload.len() != self.nodes.len() * UPDATE_ENTRY_SIZE {
            debug!(len = payload.len(), nodes = self.nodes.len(), "Malformed mesh update");
            return;
        }
        self.timeout_accumulator = 0.0;

        let mut reader = payload;
        for index in 0..self.nodes.len() {
            let ip = reader.get_u32();
            let port = reader.get_u16();
            let node_id = reader.get_i32();

            let mut address = Address::from_raw(ip, port);
            // the hosting node registers with its mesh over loopback
            if index == 0 && address.is_loopback() && !self.mesh_address.is_loopback() {
                address = Address::from_raw(self.mesh_address.ip(), port);
            }
            let connected = !address.is_unset();
            let previous = self.nodes[index];

            if previous.connected {
                self.address_to_node.remove(&previous.address);
            }
            self.nodes[index] = NodeState {
                connected,
                address: if connected { address } else { Address::default() },
                node_id: usize::try_from(node_id).ok().filter(|_| connected),
            };
            if connected {
                self.address_to_node.insert(address, index);
            }

            match (previous.connected, connected) {
                (false, true) => {
                    debug!(node_id = index, %address, "Node connected");
                    self.events.push_back(NodeEvent::NodeConnected(index));
                }
                (true, false) => {
                    debug!(node_id = index, "Node disconnected");
                    self.events.push_back(NodeEvent::NodeDisconnected(index));
                }
                _ => {}
            }
        }
    }

    fn send_packets(&mut self, dt: f32) -> Result<()> {
        self.send_accumulator += dt;
        if self.send_accumulator < self.config.send_rate {
            return Ok(());
        }
        self.send_accumulator = 0.0;
        let packet_type = match self.status {
            NodeStatus::Joining => JOIN_REQUEST,
            NodeStatus::Joined => KEEP_ALIVE,
            _ => return Ok(()),
        };
        if let Some(socket) = &self.socket {
            let packet = encode_packet(self.config.protocol_id, packet_type, &[]);
            socket.send(self.mesh_address, &packet)?;
        }
        Ok(())
    }

    fn check_timeout(&mut self, dt: f32) {
        if !matches!(self.status, NodeStatus::Joining | NodeStatus::Joined) {
            return;
        }
        self.timeout_accumulator += dt;
        if self.timeout_accumulator <= self.config.timeout {
            return;
        }
        if self.status == NodeStatus::Joining {
            info!(mesh = %self.mesh_address, "Join timed out");
            self.status = NodeStatus::JoinFail;
            self.clear_table();
            self.events.push_back(NodeEvent::JoinFailed);
        } else {
            info!(mesh = %self.mesh_address, "Mesh timed out");
            for (node_id, node) in self.nodes.iter().enumerate() {
                if node.connected {
                    self.events.push_back(NodeEvent::NodeDisconnected(node_id));
                }
            }
            self.status = NodeStatus::Disconnected;
            self.clear_table();
            self.events.push_back(NodeEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MeshConfig {
        MeshConfig {
            protocol_id: 0x0C0C_0C0C,
            send_rate: 0.1,
            timeout: 1.0,
            max_nodes: 3,
        }
    }

    fn joined_node(mesh_address: Address) -> Node {
        let mut node = Node::new(config());
        node.mesh_address = mesh_address;
        node.status = NodeStatus::Joining;
        node.process_connection_accepted(&[1, 3]);
        node
    }

    fn entry(address: Address, node_id: i32) -> Vec<u8> {
        let mut bytes = address.ip().to_be_bytes().to_vec();
        bytes.extend_from_slice(&address.port().to_be_bytes());
        bytes.extend_from_slice(&node_id.to_be_bytes());
        bytes
    }

    #[test]
    fn test_update_diff_emits_transitions() {
        let mesh = Address::new(192, 168, 1, 5, 30000);
        let mut node = joined_node(mesh);
        assert_eq!(node.poll_event(), Some(NodeEvent::Joined));
        assert_eq!(node.local_node_id(), Some(1));

        let peer = Address::new(192, 168, 1, 9, 30002);
        let mut update = entry(Address::loopback(30001), 0);
        update.extend(entry(peer, 1));
        update.extend(entry(Address::default(), -1));
        node.process_update(&update);

        assert_eq!(node.poll_event(), Some(NodeEvent::NodeConnected(0)));
        assert_eq!(node.poll_event(), Some(NodeEvent::NodeConnected(1)));
        assert_eq!(node.poll_event(), None);
        // loopback entry rewritten to the mesh's IP
        assert_eq!(node.node_address(0), Some(Address::new(192, 168, 1, 5, 30001)));

        // repeated update is silent; a vacated slot disconnects
        node.process_update(&update);
        assert_eq!(node.poll_event(), None);
        let mut update = entry(Address::loopback(30001), 0);
        update.extend(entry(Address::default(), -1));
        update.extend(entry(Address::default(), -1));
        node.process_update(&update);
        assert_eq!(node.poll_event(), Some(NodeEvent::NodeDisconnected(1)));
        assert!(!node.is_node_connected(1));
    }

    #[test]
    fn test_loopback_rewrite_only_for_the_host_entry() {
        let mesh = Address::new(10, 0, 0, 7, 30000);
        let mut node = joined_node(mesh);
        let mut update = entry(Address::loopback(30001), 0);
        update.extend(entry(Address::default(), -1));
        update.extend(entry(Address::loopback(30003), 2));
        node.process_update(&update);
        assert_eq!(node.node_address(0), Some(Address::new(10, 0, 0, 7, 30001)));
        assert_eq!(node.node_address(2), Some(Address::loopback(30003)));

        // a mesh on loopback needs no rewrite
        let mut node = joined_node(Address::loopback(30000));
        let update = [
            entry(Address::loopback(30001), 0),
            entry(Address::default(), -1),
            entry(Address::default(), -1),
        ]
        .concat();
        node.process_update(&update);
        assert_eq!(node.node_address(0), Some(Address::loopback(30001)));
    }

    #[test]
    fn test_malformed_accept_and_update_ignored() {
        let mut node = Node::new(config());
        node.status = NodeStatus::Joining;
        node.process_connection_accepted(&[3, 3]);
        node.process_connection_accepted(&[0]);
        assert!(node.is_joining());

        let mut node = joined_node(Address::loopback(1));
        node.process_update(&[0; 9]);
        assert!(node.nodes().iter().all(|n| !n.connected));
    }

    #[test]
    fn test_join_timeout() {
        let mut node = Node::new(config());
        node.status = NodeStatus::Joining;
        node.check_timeout(0.6);
        assert!(node.is_joining());
        node.check_timeout(0.6);
        assert!(node.join_failed());
        assert_eq!(node.poll_event(), Some(NodeEvent::JoinFailed));
    }

    #[test]
    fn test_joined_timeout_disconnects_everyone() {
        let mut node = joined_node(Address::loopback(30000));
        let mut update = entry(Address::loopback(30001), 0);
        update.extend(entry(Address::loopback(30002), 1));
        update.extend(entry(Address::default(), -1));
        node.process_update(&update);
        while node.poll_event().is_some() {}

        node.check_timeout(1.5);
        assert_eq!(node.status(), NodeStatus::Disconnected);
        assert_eq!(node.poll_event(), Some(NodeEvent::NodeDisconnected(0)));
        assert_eq!(node.poll_event(), Some(NodeEvent::NodeDisconnected(1)));
        assert_eq!(node.poll_event(), Some(NodeEvent::Disconnected));
        assert_eq!(node.max_nodes(), 0);
    }

    #[test]
    fn test_join_requires_start() {
        let mut node = Node::new(config());
        assert!(matches!(node.join(Address::loopback(1)), Err(NetError::NotStarted)));
    }
}
