//! Mesh membership plus per-node links, shared by the socket transports.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::core::address::Address;
use crate::error::{NetError, Result};
use crate::protocol::reliability::ReliabilitySystem;
use crate::transport::links::LinkTable;
use crate::transport::mesh::{Mesh, MeshConfig};
use crate::transport::node::{Node, NodeEvent};
use crate::transport::TransportEvent;

#[derive(Debug)]
pub(crate) struct MeshSession {
    config: MeshConfig,
    mesh: Option<Mesh>,
    node: Node,
    links: LinkTable,
    events: VecDeque<TransportEvent>,
}

impl MeshSession {
    pub(crate) fn new(config: &TransportConfig) -> Self {
        let config = MeshConfig::from(config);
        Self {
            config,
            mesh: None,
            node: Node::new(config),
            links: LinkTable::new(0),
            events: VecDeque::new(),
        }
    }

    /// Run a mesh on `mesh_port` and join it from `node_port` as node 0
    pub(crate) fn host(&mut self, mesh_port: u16, node_port: u16) -> Result<()> {
        self.stop();
        self.node.start(node_port)?;
        let node_port = self.node.port().ok_or(NetError::NotStarted)?;

        let mut mesh = Mesh::new(self.config);
        mesh.start(mesh_port)?;
        mesh.reserve(0, Address::loopback(node_port))?;
        let mesh_port = mesh.port().ok_or(NetError::NotStarted)?;
        self.mesh = Some(mesh);

        info!(mesh_port, node_port, "Hosting mesh");
        self.node.join(Address::loopback(mesh_port))
    }

    /// Open the node socket if needed and return its port
    pub(crate) fn start_node(&mut self, node_port: u16) -> Result<u16> {
        if !self.node.is_running() {
            self.node.start(node_port)?;
        }
        self.node.port().ok_or(NetError::NotStarted)
    }

    /// Join the mesh at `mesh_address` from `node_port`
    pub(crate) fn join(&mut self, node_port: u16, mesh_address: Address) -> Result<()> {
        self.start_node(node_port)?;
        self.links = LinkTable::new(0);
        self.node.join(mesh_address)
    }

    pub(crate) fn stop(&mut self) {
        if let Some(mut mesh) = self.mesh.take() {
            mesh.stop();
        }
        self.node.stop();
        self.links = LinkTable::new(0);
        self.events.clear();
    }

    pub(crate) fn mesh_port(&self) -> Option<u16> {
        self.mesh.as_ref().and_then(Mesh::port)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.node.is_connected()
    }

    pub(crate) fn connect_failed(&self) -> bool {
        self.node.join_failed()
    }

    pub(crate) fn is_node_connected(&self, node_id: usize) -> bool {
        self.node.is_node_connected(node_id)
    }

    pub(crate) fn local_node_id(&self) -> Option<usize> {
        self.node.local_node_id()
    }

    pub(crate) fn connected_count(&self) -> usize {
        self.node.nodes().iter().filter(|n| n.connected).count()
    }

    pub(crate) fn max_nodes(&self) -> usize {
        self.node.max_nodes()
    }

    pub(crate) fn can_send(&self, node_id: usize) -> bool {
        self.node.is_node_connected(node_id) && self.links.can_send(node_id)
    }

    pub(crate) fn send_packet(&mut self, node_id: usize, data: &[u8]) -> Result<u32> {
        if !self.node.is_node_connected(node_id) {
            return Err(NetError::NodeNotConnected(node_id));
        }
        let (sequence, packet) = self.links.wrap(node_id, data)?;
        if !self.node.send_packet(node_id, &packet)? {
            debug!(node_id, sequence, "Socket buffer full, packet counted as lost");
        }
        self.links.commit(node_id, packet.len());
        Ok(sequence)
    }

    pub(crate) fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        while let Some((node_id, packet)) = self.node.receive_packet() {
            let Some((payload, acks)) = self.links.unwrap(node_id, &packet) else {
                continue;
            };
            self.events.extend(
                acks.into_iter()
                    .map(|sequence| TransportEvent::PacketAcked { node_id, sequence }),
            );
            return Some((node_id, payload));
        }
        None
    }

    pub(crate) fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem> {
        self.links.reliability(node_id)
    }

    pub(crate) fn update(&mut self, dt: f32) -> Result<()> {
        if let Some(mesh) = &mut self.mesh {
            mesh.update(dt)?;
        }
        self.node.update(dt)?;
        while let Some(event) = self.node.poll_event() {
            self.on_node_event(event);
        }
        let node = &self.node;
        self.links.update(dt, |node_id| node.is_node_connected(node_id));
        Ok(())
    }

    fn on_node_event(&mut self, event: NodeEvent) {
        let event = match event {
            NodeEvent::Joined => {
                self.links = LinkTable::new(self.node.max_nodes());
                TransportEvent::Connected
            }
            NodeEvent::JoinFailed => TransportEvent::ConnectFailed,
            NodeEvent::Disconnected => {
                self.links.reset_all();
                TransportEvent::Disconnected
            }
            NodeEvent::NodeConnected(node_id) => {
                self.links.reset(node_id);
                TransportEvent::NodeConnected(node_id)
            }
            NodeEvent::NodeDisconnected(node_id) => {
                self.links.reset(node_id);
                TransportEvent::NodeDisconnected(node_id)
            }
        };
        self.events.push_back(event);
    }

    pub(crate) fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    pub(crate) fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}
