//! # Local Transport
//!
//! An in-process network for tests and simulations.
//!
//! A [`LocalNetwork`] is a switchboard of per-node inboxes shared by every
//! [`LocalTransport`] created from it. One transport hosts a session as node 0
//! and others join it by name. Packets carry the same reliability header and
//! pass the same flow control as on the socket transports, and the network can
//! drop a seeded fraction of them to exercise loss handling deterministically.
//!
//! The switchboard lives behind `Rc<RefCell<_>>` and never leaves its thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::core::address::Address;
use crate::error::{constants, NetError, Result};
use crate::protocol::reliability::ReliabilitySystem;
use crate::transport::links::LinkTable;
use crate::transport::{LobbyEntry, Transport, TransportEvent};

type Inbox = VecDeque<(usize, Vec<u8>)>;

#[derive(Debug)]
struct Switchboard {
    host_name: Option<String>,
    inboxes: Vec<Option<Inbox>>,
    packet_loss: f32,
    rng: StdRng,
}

impl Switchboard {
    fn is_attached(&self, node_id: usize) -> bool {
        self.inboxes.get(node_id).is_some_and(Option::is_some)
    }

    fn attached_count(&self) -> usize {
        self.inboxes.iter().filter(|inbox| inbox.is_some()).count()
    }

    fn detach(&mut self, node_id: usize) {
        if let Some(slot) = self.inboxes.get_mut(node_id) {
            *slot = None;
        }
        if node_id == 0 {
            self.host_name = None;
        }
    }
}

/// Shared in-memory network
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    switchboard: Rc<RefCell<Switchboard>>,
}

impl LocalNetwork {
    /// Lossless network with room for `max_nodes` transports
    pub fn new(max_nodes: usize) -> Self {
        Self {
            switchboard: Rc::new(RefCell::new(Switchboard {
                host_name: None,
                inboxes: vec![None; max_nodes],
                packet_loss: 0.0,
                rng: StdRng::seed_from_u64(0),
            })),
        }
    }

    /// Drop `packet_loss` (0 to 1) of all packets, reproducibly for `seed`
    pub fn with_packet_loss(self, packet_loss: f32, seed: u64) -> Self {
        {
            let mut switchboard = self.switchboard.borrow_mut();
            switchboard.packet_loss = packet_loss.clamp(0.0, 1.0);
            switchboard.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    /// Change the loss rate, keeping the random sequence
    pub fn set_packet_loss(&self, packet_loss: f32) {
        self.switchboard.borrow_mut().packet_loss = packet_loss.clamp(0.0, 1.0);
    }

    /// A new endpoint on this network
    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            switchboard: Rc::clone(&self.switchboard),
            node_id: None,
            connect_failed: false,
            links: LinkTable::new(0),
            mirror: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.switchboard.borrow().inboxes.len()
    }

    /// Transports currently in the session
    pub fn attached_count(&self) -> usize {
        self.switchboard.borrow().attached_count()
    }
}

/// Endpoint on a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalTransport {
    switchboard: Rc<RefCell<Switchboard>>,
    node_id: Option<usize>,
    connect_failed: bool,
    links: LinkTable,
    mirror: Vec<bool>,
    events: VecDeque<TransportEvent>,
}

impl LocalTransport {
    fn attach(&mut self, node_id: usize) {
        let max_nodes = {
            let mut switchboard = self.switchboard.borrow_mut();
            switchboard.inboxes[node_id] = Some(VecDeque::new());
            switchboard.inboxes.len()
        };
        info!(node_id, "Local transport attached");
        self.node_id = Some(node_id);
        self.connect_failed = false;
        self.links = LinkTable::new(max_nodes);
        self.mirror = vec![false; max_nodes];
        self.events.push_back(TransportEvent::Connected);
    }

    fn detach(&mut self) {
        if let Some(node_id) = self.node_id.take() {
            self.switchboard.borrow_mut().detach(node_id);
            debug!(node_id, "Local transport detached");
        }
        self.links = LinkTable::new(0);
        self.mirror.clear();
    }

    fn sync_membership(&mut self) {
        let Some(local) = self.node_id else {
            return;
        };
        let attached: Vec<bool> = {
            let switchboard = self.switchboard.borrow();
            (0..self.mirror.len()).map(|id| switchboard.is_attached(id)).collect()
        };
        if local != 0 && !attached[0] {
            info!("Local host went away");
            for (node_id, was) in self.mirror.iter().enumerate() {
                if *was {
                    self.events.push_back(TransportEvent::NodeDisconnected(node_id));
                }
            }
            self.detach();
            self.events.push_back(TransportEvent::Disconnected);
            return;
        }
        for (node_id, (was, now)) in self.mirror.iter_mut().zip(attached).enumerate() {
            if *was == now {
                continue;
            }
            *was = now;
            self.links.reset(node_id);
            self.events.push_back(if now {
                TransportEvent::NodeConnected(node_id)
            } else {
                TransportEvent::NodeDisconnected(node_id)
            });
        }
    }
}

impl Transport for LocalTransport {
    fn start_server(&mut self, name: &str) -> Result<()> {
        self.stop();
        {
            let mut switchboard = self.switchboard.borrow_mut();
            if switchboard.inboxes.is_empty() {
                return Err(NetError::ConfigError(constants::ERR_LOCAL_NO_SLOTS.to_string()));
            }
            if switchboard.is_attached(0) {
                return Err(NetError::ConfigError(constants::ERR_LOCAL_HOST_TAKEN.to_string()));
            }
            switchboard.host_name = Some(name.to_string());
        }
        self.attach(0);
        Ok(())
    }

    fn connect_client(&mut self, target: &str) -> Result<()> {
        self.stop();
        let free_slot = {
            let switchboard = self.switchboard.borrow();
            if switchboard.host_name.as_deref() != Some(target) {
                return Err(NetError::UnknownHost(target.to_string()));
            }
            (1..switchboard.inboxes.len()).find(|&id| !switchboard.is_attached(id))
        };
        match free_slot {
            Some(node_id) => self.attach(node_id),
            None => {
                info!(target, "Local session full");
                self.connect_failed = true;
                self.events.push_back(TransportEvent::ConnectFailed);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.node_id.is_some()
    }

    fn connect_failed(&self) -> bool {
        self.connect_failed
    }

    fn is_node_connected(&self, node_id: usize) -> bool {
        self.mirror.get(node_id).copied().unwrap_or(false)
    }

    fn local_node_id(&self) -> Option<usize> {
        self.node_id
    }

    fn max_nodes(&self) -> usize {
        self.mirror.len()
    }

    fn can_send(&self, node_id: usize) -> bool {
        self.is_node_connected(node_id) && self.links.can_send(node_id)
    }

    fn send_packet(&mut self, node_id: usize, data: &[u8]) -> Result<u32> {
        let from = self.node_id.ok_or(NetError::NodeNotConnected(node_id))?;
        if !self.is_node_connected(node_id) {
            return Err(NetError::NodeNotConnected(node_id));
        }
        let (sequence, packet) = self.links.wrap(node_id, data)?;
        self.links.commit(node_id, packet.len());

        let mut switchboard = self.switchboard.borrow_mut();
        let loss = switchboard.packet_loss;
        if loss > 0.0 && switchboard.rng.random_range(0.0..1.0) < loss {
            debug!(from, to = node_id, sequence, "Local network dropped packet");
            return Ok(sequence);
        }
        if let Some(Some(inbox)) = switchboard.inboxes.get_mut(node_id) {
            inbox.push_back((from, packet));
        }
        Ok(sequence)
    }

    fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        let local = self.node_id?;
        loop {
            let (from, packet) = self
                .switchboard
                .borrow_mut()
                .inboxes
                .get_mut(local)?
                .as_mut()?
                .pop_front()?;
            if !self.is_node_connected(from) {
                continue;
            }
            let Some((payload, acks)) = self.links.unwrap(from, &packet) else {
                continue;
            };
            self.events.extend(acks.into_iter().map(|sequence| TransportEvent::PacketAcked {
                node_id: from,
                sequence,
            }));
            return Some((from, payload));
        }
    }

    fn enter_lobby(&mut self) -> Result<()> {
        Ok(())
    }

    fn lobby_entry_count(&self) -> usize {
        usize::from(self.switchboard.borrow().host_name.is_some())
    }

    fn lobby_entry(&self, index: usize) -> Option<LobbyEntry> {
        if index != 0 {
            return None;
        }
        let switchboard = self.switchboard.borrow();
        let name = switchboard.host_name.clone()?;
        Some(LobbyEntry {
            name,
            address: Address::default(),
            current_players: u8::try_from(switchboard.attached_count()).unwrap_or(u8::MAX),
            total_capacity: u8::try_from(switchboard.inboxes.len()).unwrap_or(u8::MAX),
        })
    }

    fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem> {
        self.links.reliability(node_id)
    }

    fn update(&mut self, dt: f32) -> Result<()> {
        self.sync_membership();
        let mirror = &self.mirror;
        self.links
            .update(dt, |node_id| mirror.get(node_id).copied().unwrap_or(false));
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    fn stop(&mut self) {
        self.detach();
        self.connect_failed = false;
        self.events.clear();
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.detach();
    }
}
