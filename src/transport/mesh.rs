//! # Mesh
//!
//! Rendezvous registry for a star of nodes.
//!
//! The mesh binds one UDP port and admits nodes that send join requests into
//! the first free slot of a fixed-size table. At every send interval it sends
//! `ConnectionAccepted` to admitted nodes that have not yet confirmed with a
//! keep-alive, and broadcasts the full table to every connected node so peers
//! learn each other's address without any direct handshake. Nodes silent for
//! longer than the timeout are evicted, except for reserved slots.
//!
//! ## Wire Format
//! ```text
//! [CRC32C(4)] [Type(1)] [Payload(N)]
//!
//! node -> mesh   0 JoinRequest         (empty)
//!                1 KeepAlive           (empty)
//! mesh -> node   0 ConnectionAccepted  [NodeId(1)] [NodeCount(1)]
//!                1 Update              NodeCount x [IPv4(4)] [Port(2)] [NodeId(4, -1 when empty)]
//! node -> node   2 Data                [Payload(N)]
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE};
use crate::error::{NetError, Result};
use crate::utils::checksum::{self, CHECKSUM_SIZE};

/// Checksum plus type byte
pub const MESH_HEADER_SIZE: usize = CHECKSUM_SIZE + 1;

/// Bytes per node entry of an `Update`
pub const UPDATE_ENTRY_SIZE: usize = 10;

pub(crate) const JOIN_REQUEST: u8 = 0;
pub(crate) const KEEP_ALIVE: u8 = 1;
pub(crate) const CONNECTION_ACCEPTED: u8 = 0;
pub(crate) const UPDATE: u8 = 1;
pub(crate) const DATA: u8 = 2;

/// Frame `payload` as a mesh-protocol datagram of `packet_type`
pub(crate) fn encode_packet(protocol_id: u32, packet_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(MESH_HEADER_SIZE + payload.len());
    packet.put_u32(0);
    packet.put_u8(packet_type);
    packet.put_slice(payload);
    checksum::stamp(&mut packet, protocol_id);
    packet.to_vec()
}

/// Type and payload of a datagram passing the checksum
pub(crate) fn decode_packet(protocol_id: u32, data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < MESH_HEADER_SIZE || !checksum::verify(data, protocol_id) {
        return None;
    }
    Some((data[CHECKSUM_SIZE], &data[MESH_HEADER_SIZE..]))
}

/// Timing and identity shared by [`Mesh`] and its nodes
#[derive(Debug, Clone, Copy)]
pub struct MeshConfig {
    pub protocol_id: u32,
    /// Seconds between mesh protocol packets
    pub send_rate: f32,
    /// Seconds of silence before a link is dropped
    pub timeout: f32,
    pub max_nodes: usize,
}

impl From<&TransportConfig> for MeshConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            protocol_id: config.protocol_id,
            send_rate: config.mesh_send_rate.as_secs_f32(),
            timeout: config.timeout.as_secs_f32(),
            max_nodes: config.max_nodes,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MeshNodeState {
    connected: bool,
    address: Address,
    timeout_accumulator: f32,
    reserved: bool,
    keep_alive_received: bool,
}

/// Server side node registry
#[derive(Debug)]
pub struct Mesh {
    config: MeshConfig,
    socket: Option<Socket>,
    nodes: Vec<MeshNodeState>,
    address_to_node: BTreeMap<Address, usize>,
    send_accumulator: f32,
}

impl Mesh {
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            socket: None,
            nodes: vec![MeshNodeState::default(); config.max_nodes],
            address_to_node: BTreeMap::new(),
            send_accumulator: 0.0,
        }
    }

    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self, port: u16) -> Result<()> {
        let socket = Socket::open(port, SocketOptions::default())?;
        info!(port = socket.port(), max_nodes = self.config.max_nodes, "Mesh started");
        self.socket = Some(socket);
        self.send_accumulator = self.config.send_rate;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("Mesh stopped");
        }
        self.nodes.iter_mut().for_each(|n| *n = MeshNodeState::default());
        self.address_to_node.clear();
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(Socket::port)
    }

    pub fn max_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Pre-admit `address` as `node_id`; reserved slots never time out
    pub fn reserve(&mut self, node_id: usize, address: Address) -> Result<()> {
        let slot = self
            .nodes
            .get_mut(node_id)
            .ok_or(NetError::NodeNotConnected(node_id))?;
        if slot.connected {
            self.address_to_node.remove(&slot.address);
        }
        *slot = MeshNodeState {
            connected: true,
            address,
            timeout_accumulator: 0.0,
            reserved: true,
            keep_alive_received: false,
        };
        self.address_to_node.insert(address, node_id);
        debug!(node_id, %address, "Mesh slot reserved");
        Ok(())
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

    pub fn connected_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.connected).count()
    }

    /// Receive, send and expire; call once per tick
    pub fn update(&mut self, dt: f32) -> Result<()> {
        if self.socket.is_none() {
            return Ok(());
        }
        self.receive_packets()?;
        self.send_packets(dt)?;
        self.check_timeouts(dt);
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
            match decode_packet(self.config.protocol_id, &buffer[..size]) {
                Some((JOIN_REQUEST, _)) => self.process_join(sender),
                Some((KEEP_ALIVE, _)) => self.process_keep_alive(sender),
                Some((packet_type, _)) => {
                    debug!(%sender, packet_type, "Mesh ignored unexpected packet type")
                }
                None => debug!(%sender, size, "Mesh dropped datagram failing the checksum"),
            }
        }
    }

    fn process_join(&mut self, sender: Address) {
        if let Some(&node_id) = self.address_to_node.get(&sender) {
            self.nodes[node_id].timeout_accumulator = 0.0;
            return;
        }
        let Some(node_id) = self.nodes.iter().position(|n| !n.connected) else {
            debug!(%sender, "Mesh full, join request ignored");
            return;
        };
        info!(node_id, %sender, "Mesh accepted node");
        self.nodes[node_id] = MeshNodeState {
            connected: true,
            address: sender,
            ..MeshNodeState::default()
        };
        self.address_to_node.insert(sender, node_id);
    }

    fn process_keep_alive(&mut self, sender: Address) {
        if let Some(&node_id) = self.address_to_node.get(&sender) {
            let node = &mut self.nodes[node_id];
            node.timeout_accumulator = 0.0;
            node.keep_alive_received = true;
        }
    }

    fn send_packets(&mut self, dt: f32) -> Result<()> {
        self.send_accumulator += dt;
        if self.send_accumulator < self.config.send_rate {
            return Ok(());
        }
        self.send_accumulator = 0.0;
        let Some(socket) = &self.socket else {
            return Ok(());
        };

        let node_count = self.nodes.len() as u8;
        let update = self.encode_update();
        for (node_id, node) in self.nodes.iter().enumerate() {
            if !node.connected {
                continue;
            }
            if !node.keep_alive_received {
                let accepted = encode_packet(
                    self.config.protocol_id,
                    CONNECTION_ACCEPTED,
                    &[node_id as u8, node_count],
                );
                if let Err(e) = socket.send(node.address, &accepted) {
                    warn!(node_id, error = %e, "Failed to send connection accepted");
                }
            }
            if let Err(e) = socket.send(node.address, &update) {
                warn!(node_id, error = %e, "Failed to send mesh update");
            }
        }
        Ok(())
    }

    fn encode_update(&self) -> Vec<u8> {
        let mut payload = BytesMut::with_capacity(self.nodes.len() * UPDATE_ENTRY_SIZE);
        for (node_id, node) in self.nodes.iter().enumerate() {
            if node.connected {
                payload.put_u32(node.address.ip());
                payload.put_u16(node.address.port());
                payload.put_i32(node_id as i32);
            } else {
                payload.put_u32(0);
                payload.put_u16(0);
                payload.put_i32(-1);
            }
        }
        encode_packet(self.config.protocol_id, UPDATE, &payload)
    }

    fn check_timeouts(&mut self, dt: f32) {
        for (node_id, node) in self.nodes.iter_mut().enumerate() {
            if !node.connected || node.reserved {
                continue;
            }
            node.timeout_accumulator += dt;
            if node.timeout_accumulator > self.config.timeout {
                info!(node_id, address = %node.address, "Mesh node timed out");
                self.address_to_node.remove(&node.address);
                *node = MeshNodeState::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MeshConfig {
        MeshConfig {
            protocol_id: 0x0B0B_0B0B,
            send_rate: 0.1,
            timeout: 1.0,
            max_nodes: 2,
        }
    }

    #[test]
    fn test_encode_decode_packet() {
        let packet = encode_packet(7, CONNECTION_ACCEPTED, &[1, 4]);
        assert_eq!(packet.len(), 7);
        assert_eq!(decode_packet(7, &packet), Some((CONNECTION_ACCEPTED, &[1u8, 4][..])));
        assert_eq!(decode_packet(8, &packet), None);
        assert_eq!(decode_packet(7, &packet[..4]), None);
    }

    #[test]
    fn test_admission_and_timeout() {
        let mut mesh = Mesh::new(config());
        let a = Address::new(10, 0, 0, 1, 5000);
        let b = Address::new(10, 0, 0, 2, 5000);
        let c = Address::new(10, 0, 0, 3, 5000);

        mesh.process_join(a);
        mesh.process_join(b);
        mesh.process_join(c);
        assert_eq!(mesh.node_address(0), Some(a));
        assert_eq!(mesh.node_address(1), Some(b));
        assert_eq!(mesh.connected_count(), 2);

        mesh.check_timeouts(0.6);
        mesh.process_keep_alive(b);
        mesh.check_timeouts(0.6);
        assert!(!mesh.is_node_connected(0));
        assert!(mesh.is_node_connected(1));

        mesh.process_join(c);
        assert_eq!(mesh.node_address(0), Some(c));
    }

    #[test]
    fn test_reserved_never_times_out() {
        let mut mesh = Mesh::new(config());
        mesh.reserve(0, Address::loopback(30001)).expect("reserve");
        mesh.check_timeouts(100.0);
        assert_eq!(mesh.node_address(0), Some(Address::loopback(30001)));
        assert!(mesh.reserve(5, Address::loopback(1)).is_err());
    }

    #[test]
    fn test_update_layout() {
        let mut mesh = Mesh::new(config());
        mesh.reserve(0, Address::new(127, 0, 0, 1, 0x1234)).expect("reserve");
        let packet = mesh.encode_update();
        let (packet_type, payload) = decode_packet(config().protocol_id, &packet).expect("valid");
        assert_eq!(packet_type, UPDATE);
        assert_eq!(
            payload,
            &[127, 0, 0, 1, 0x12, 0x34, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }
}
