//! Per-node reliability and flow control shared by every transport variant.
//!
//! Node ids are dense small integers, so state lives in arrays sized to the
//! node capacity. A slot is reset whenever its node connects or disconnects.

use tracing::debug;

use crate::error::{NetError, Result};
use crate::protocol::flow_control::FlowControl;
use crate::protocol::reliability::ReliabilitySystem;
use crate::transport::connection::ReliabilityHeader;

/// Reliability and flow control for every node slot
#[derive(Debug)]
pub struct LinkTable {
    reliability: Vec<ReliabilitySystem>,
    flow_control: Vec<FlowControl>,
}

impl LinkTable {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            reliability: vec![ReliabilitySystem::default(); max_nodes],
            flow_control: vec![FlowControl::new(); max_nodes],
        }
    }

    pub fn len(&self) -> usize {
        self.reliability.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reliability.is_empty()
    }

    pub fn reset(&mut self, node_id: usize) {
        if let Some(reliability) = self.reliability.get_mut(node_id) {
            reliability.reset();
        }
        if let Some(flow) = self.flow_control.get_mut(node_id) {
            flow.reset();
        }
    }

    pub fn reset_all(&mut self) {
        self.reliability.iter_mut().for_each(ReliabilitySystem::reset);
        self.flow_control.iter_mut().for_each(FlowControl::reset);
    }

    pub fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem> {
        self.reliability.get(node_id)
    }

    pub fn flow_control(&self, node_id: usize) -> Option<&FlowControl> {
        self.flow_control.get(node_id)
    }

    pub fn can_send(&self, node_id: usize) -> bool {
        self.flow_control
            .get(node_id)
            .is_some_and(FlowControl::can_send)
    }

    /// Prefix `data` with the next header for `node_id`
    ///
    /// Refused with `RateLimited` when the node has no free send slot. The
    /// returned sequence must be committed with [`LinkTable::commit`] once the
    /// packet actually left.
    pub fn wrap(&self, node_id: usize, data: &[u8]) -> Result<(u32, Vec<u8>)> {
        let reliability = self
            .reliability
            .get(node_id)
            .ok_or(NetError::NodeNotConnected(node_id))?;
        if !self.can_send(node_id) {
            return Err(NetError::RateLimited(node_id));
        }
        let header = ReliabilityHeader::next(reliability);
        Ok((header.sequence, header.encode(data)?))
    }

    /// Account for a packet of `size` bytes sent to `node_id`
    pub fn commit(&mut self, node_id: usize, size: usize) {
        if let Some(reliability) = self.reliability.get_mut(node_id) {
            reliability.packet_sent(size);
        }
        if let Some(flow) = self.flow_control.get_mut(node_id) {
            flow.on_packet_sent();
        }
    }

    /// Strip the header of a packet from `node_id`
    ///
    /// Returns the payload and the sequences this packet acknowledged, or
    /// `None` for duplicates and malformed packets.
    pub fn unwrap(&mut self, node_id: usize, packet: &[u8]) -> Option<(Vec<u8>, Vec<u32>)> {
        let reliability = self.reliability.get_mut(node_id)?;
        let (header, payload) = match ReliabilityHeader::decode(packet) {
            Ok(parts) => parts,
            Err(_) => {
                debug!(node_id, size = packet.len(), "Dropped packet with truncated header");
                return None;
            }
        };
        if !reliability.packet_received(header.sequence, packet.len()) {
            debug!(node_id, sequence = header.sequence, "Dropped duplicate packet");
            return None;
        }
        reliability.process_ack(header.ack, header.ack_bits);
        Some((payload.to_vec(), reliability.take_acks()))
    }

    /// Advance every connected slot by `dt` seconds
    pub fn update<F>(&mut self, dt: f32, is_connected: F)
    where
        F: Fn(usize) -> bool,
    {
        for (node_id, (reliability, flow)) in self
            .reliability
            .iter_mut()
            .zip(self.flow_control.iter_mut())
            .enumerate()
        {
            if is_connected(node_id) {
                reliability.update(dt);
                flow.update(dt, reliability.rtt() * 1000.0);
            }
        }
    }
}
