//! # DrudgeNet
//!
//! Message-level networking on top of a [`Transport`].
//!
//! Applications queue typed messages per node, drain [`NetEvent`]s, and call
//! [`DrudgeNet::update`] once per tick. Each tick every connected node with a
//! free send slot gets at most one packet holding as many queued messages as
//! fit the MTU. Reliable messages are resent until a packet carrying them is
//! acknowledged; a message too large for one packet travels as a fragmented
//! transfer.
//!
//! ## Packet Body
//! ```text
//! messages:  [0(1)] [pad(7)] [count(8)] count x ([reliable(1)] [id(32) if reliable] [type(8)] [body])  pad to byte
//! fragment:  [1(1)] [transfer(7)] [fragment id(8)] [fragment count(8)] [payload]
//! ```
//!
//! A reassembled fragment payload is itself a messages body. Each sender's
//! transfer is assembled in a buffer of its own, so transfers from different
//! nodes never compete.
//!
//! ## Ordering
//! All reliable messages in flight to a node travel in one packet and are
//! resent together, so reliable delivery to a node is in [`MessageId`] order
//! and anything not newer than the last delivered id is a duplicate. A new
//! reliable message is refused while a batch is in flight.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, instrument, warn};

use crate::config::{MessagingConfig, NetworkConfig};
use crate::core::stream::{ReadStream, Stream, WriteStream};
use crate::error::{NetError, Result};
use crate::net::queue::{MessageId, MessageQueue};
use crate::protocol::fragment::{FragmentBuffer, FragmentSource};
use crate::protocol::message::{measure, Message, MessageFactory};
use crate::transport::{self, LobbyEntry, Transport, TransportEvent};
use crate::utils::metrics::{Metrics, Timer};

const PACKET_MESSAGES: u32 = 0;
const PACKET_FRAGMENT: u32 = 1;

/// Type bit, padding and message count
const MESSAGES_HEADER_BITS: usize = 16;

/// Reliable flag and message type
const UNRELIABLE_OVERHEAD_BITS: usize = 1 + 8;

/// Reliable flag, message id and message type
const RELIABLE_OVERHEAD_BITS: usize = 1 + 32 + 8;

/// Tag and transfer byte, fragment id, fragment count
const FRAGMENT_HEADER_SIZE: usize = 3;

const MAX_MESSAGES_PER_PACKET: usize = 255;

/// Transfer numbers travel in 7 bits
const TRANSFER_NUMBER_MODULUS: u8 = 128;

/// Sent packets remembered for acknowledgement
const MAX_TRACKED_PACKETS: usize = 1024;

/// Notifications drained with [`DrudgeNet::poll_event`]
#[derive(Debug)]
pub enum NetEvent {
    Connected,
    ConnectFailed,
    Disconnected,
    NodeConnected(usize),
    NodeDisconnected(usize),
    MessageReceived {
        node_id: usize,
        message: Box<dyn Message>,
    },
    ReliableMessageAcked {
        node_id: usize,
        message_id: MessageId,
    },
    MasterServerConnection(bool),
}

/// Outbound and inbound state for one remote node
#[derive(Debug, Default)]
struct Peer {
    queue: MessageQueue,
    /// Reliable message ids carried by each sent packet
    sent_packets: BTreeMap<u32, Vec<MessageId>>,
    outgoing: FragmentBuffer,
    transfer_number: u8,
    /// Reliable message travelling in the outgoing transfer
    transfer_message: Option<MessageId>,
    /// Next free slot goes to a regular packet
    regular_turn: bool,
    last_reliable_received: MessageId,
    /// Transfer from this node being assembled
    incoming: FragmentBuffer,
    completed_transfer: Option<u8>,
    /// Received content not yet acknowledged by any packet of ours
    ack_owed: bool,
}

/// Messages chosen for one regular packet
struct PacketPlan {
    reliable: Vec<MessageId>,
    unreliable: Vec<MessageId>,
}

impl PacketPlan {
    fn is_empty(&self) -> bool {
        self.reliable.is_empty() && self.unreliable.is_empty()
    }

    fn len(&self) -> usize {
        self.reliable.len() + self.unreliable.len()
    }
}

/// Message-level facade over a transport
pub struct DrudgeNet {
    transport: Box<dyn Transport>,
    factory: MessageFactory,
    config: MessagingConfig,
    peers: Vec<Peer>,
    events: VecDeque<NetEvent>,
    metrics: Metrics,
    time: f32,
}

impl std::fmt::Debug for DrudgeNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrudgeNet")
            .field("factory", &self.factory)
            .field("config", &self.config)
            .field("peers", &self.peers.len())
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

impl DrudgeNet {
    /// Fails with `ConfigError` when `config` does not validate
    pub fn new(transport: Box<dyn Transport>, factory: MessageFactory, config: MessagingConfig) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self {
            transport,
            factory,
            config,
            peers: Vec::new(),
            events: VecDeque::new(),
            metrics: Metrics::new(),
            time: 0.0,
        })
    }

    /// Build the transport selected by `config`
    pub fn from_config(config: &NetworkConfig, factory: MessageFactory) -> Result<Self> {
        Self::new(transport::create(config), factory, config.messaging.clone())
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn factory_mut(&mut self) -> &mut MessageFactory {
        &mut self.factory
    }

    #[instrument(level = "info", skip(self))]
    pub fn start_server(&mut self, name: &str) -> Result<()> {
        self.reset();
        self.transport.start_server(name)
    }

    #[instrument(level = "info", skip(self))]
    pub fn connect_client(&mut self, target: &str) -> Result<()> {
        self.reset();
        self.transport.connect_client(target)
    }

    pub fn enter_lobby(&mut self) -> Result<()> {
        self.transport.enter_lobby()
    }

    pub fn lobby_entries(&self) -> Vec<LobbyEntry> {
        (0..self.transport.lobby_entry_count())
            .filter_map(|index| self.transport.lobby_entry(index))
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn local_node_id(&self) -> Option<usize> {
        self.transport.local_node_id()
    }

    /// Connected to `node_id`, which is not this node
    pub fn is_node_connected(&self, node_id: usize) -> bool {
        self.transport.local_node_id() != Some(node_id)
            && node_id < self.peers.len()
            && self.transport.is_node_connected(node_id)
    }

    pub fn stop(&mut self) {
        self.metrics.log_metrics();
        self.transport.stop();
        self.reset();
    }

    fn reset(&mut self) {
        self.peers.clear();
    }

    /// Queue `message` for `node_id`, returning its id
    pub fn send_message<M: Message>(&mut self, node_id: usize, message: M, reliable: bool) -> Result<MessageId> {
        self.send_boxed(node_id, Box::new(message), reliable)
    }

    pub fn send_boxed(
        &mut self,
        node_id: usize,
        mut message: Box<dyn Message>,
        reliable: bool,
    ) -> Result<MessageId> {
        if !self.is_node_connected(node_id) {
            return Err(NetError::NodeNotConnected(node_id));
        }
        let bits_required = measure(message.as_mut())?;
        let total = MESSAGES_HEADER_BITS + RELIABLE_OVERHEAD_BITS + bits_required;
        let capacity = self.config.buffer_capacity * 8;
        if total > capacity {
            return Err(NetError::MessageTooLarge {
                bits: total,
                capacity,
            });
        }
        let peer = &mut self.peers[node_id];
        if reliable && peer.queue.reliable_in_flight() {
            return Err(NetError::ReliableInFlight(node_id));
        }
        Ok(peer.queue.push(message, bits_required, reliable))
    }

    /// Receive, send, then advance the transport by `dt` seconds
    pub fn update(&mut self, dt: f32) -> Result<()> {
        let _timer = Timer::start("drudgenet_update");
        self.receive_messages();
        self.process_transport_events();
        self.send_messages()?;
        self.transport.update(dt)?;
        self.process_transport_events();
        self.time += dt;
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<NetEvent> {
        self.events.pop_front()
    }

    /// Drain the transport, delivering every message it carried
    pub fn receive_messages(&mut self) {
        while let Some((node_id, payload)) = self.transport.receive_packet() {
            self.metrics.packet_received(payload.len() as u64);
            if let Err(e) = self.process_packet(node_id, &payload) {
                debug!(node_id, size = payload.len(), error = %e, "Dropped malformed packet");
                self.metrics.packet_dropped();
            }
        }
    }

    /// At most one packet to every connected node with a free send slot
    ///
    /// A node that sent us content gets an empty packet when nothing else is
    /// queued for it, so its packets are acknowledged.
    pub fn send_messages(&mut self) -> Result<()> {
        let local = self.transport.local_node_id();
        for node_id in 0..self.peers.len() {
            if Some(node_id) == local
                || !self.transport.is_node_connected(node_id)
                || !self.transport.can_send(node_id)
            {
                continue;
            }
            self.start_transfer(node_id)?;
            let plan = self.plan_packet(node_id);
            let peer = &self.peers[node_id];
            let fragment_turn = peer.outgoing.is_sending() && (!peer.regular_turn || plan.is_empty());
            let ack_owed = peer.ack_owed;
            if fragment_turn {
                self.send_fragment(node_id)?;
            } else if !plan.is_empty() || ack_owed {
                self.send_plan(node_id, plan)?;
            }
        }
        Ok(())
    }

    fn oversized(&self, bits_required: usize, reliable: bool) -> bool {
        let overhead = if reliable {
            RELIABLE_OVERHEAD_BITS
        } else {
            UNRELIABLE_OVERHEAD_BITS
        };
        MESSAGES_HEADER_BITS + overhead + bits_required > self.config.mtu * 8
    }

    /// Move a message too large for one packet into the outgoing transfer
    fn start_transfer(&mut self, node_id: usize) -> Result<()> {
        let peer = &self.peers[node_id];
        if !peer.outgoing.is_empty() {
            return Ok(());
        }
        // only the head of the reliable queue, and only with nothing in flight
        let reliable = peer
            .queue
            .reliable()
            .next()
            .filter(|(_, m)| m.time_last_sent.is_none() && self.oversized(m.bits_required, true))
            .map(|(id, _)| id);
        let unreliable = peer
            .queue
            .unreliable()
            .find(|(_, m)| self.oversized(m.bits_required, false))
            .map(|(id, _)| id);

        let (id, is_reliable) = match (reliable, unreliable) {
            (Some(id), _) => (id, true),
            (None, Some(id)) => (id, false),
            (None, None) => return Ok(()),
        };

        let fragment_size = self.config.mtu - FRAGMENT_HEADER_SIZE;
        let mut stream = WriteStream::new(self.config.buffer_capacity);
        let peer = &mut self.peers[node_id];
        if is_reliable {
            let Some(queued) = peer.queue.reliable_mut(id) else {
                return Ok(());
            };
            write_messages_header(&mut stream, 1)?;
            write_entry(&mut stream, Some(id), queued.message.as_mut())?;
            queued.time_last_sent = Some(self.time);
            queued.fragmented = true;
            peer.transfer_message = Some(id);
        } else {
            let Some(mut queued) = peer.queue.remove_unreliable(id) else {
                return Ok(());
            };
            write_messages_header(&mut stream, 1)?;
            write_entry(&mut stream, None, queued.message.as_mut())?;
            peer.transfer_message = None;
            self.metrics.messages_packed(1);
        }
        stream.pad_to_nearest_byte()?;

        peer.transfer_number = (peer.transfer_number + 1) % TRANSFER_NUMBER_MODULUS;
        let count = peer.outgoing.setup_send(stream.into_bytes(), fragment_size)?;
        peer.regular_turn = false;
        debug!(node_id, message_id = id, fragments = count, "Started fragmented transfer");
        Ok(())
    }

    fn send_fragment(&mut self, node_id: usize) -> Result<()> {
        let peer = &mut self.peers[node_id];
        let Some(index) = peer.outgoing.next_fragment_to_send() else {
            return Ok(());
        };
        let Some(fragment) = peer.outgoing.fragment(index) else {
            return Ok(());
        };
        let mut stream = WriteStream::new(FRAGMENT_HEADER_SIZE + fragment.len());
        let mut tag = PACKET_FRAGMENT;
        let mut transfer = u32::from(peer.transfer_number);
        let mut id = index;
        let mut count = peer.outgoing.fragment_count() as u8;
        stream.serialize_bits(&mut tag, 1)?;
        stream.serialize_bits(&mut transfer, 7)?;
        stream.serialize_byte(&mut id)?;
        stream.serialize_byte(&mut count)?;
        stream.serialize_bytes(&mut fragment.to_vec())?;
        let packet = stream.into_bytes();

        let sequence = self.transport.send_packet(node_id, &packet)?;
        let peer = &mut self.peers[node_id];
        peer.outgoing.on_fragment_sent(sequence, index);
        peer.regular_turn = true;
        peer.ack_owed = false;
        self.metrics.packet_sent(packet.len() as u64);
        self.metrics.fragment_sent();
        Ok(())
    }

    /// Pick the messages for the next regular packet to `node_id`
    fn plan_packet(&self, node_id: usize) -> PacketPlan {
        let peer = &self.peers[node_id];
        let capacity = self.config.mtu * 8;
        let resend_time = self.config.reliable_resend_time.as_secs_f32();
        let in_flight = peer.queue.reliable_in_flight();
        let mut used = MESSAGES_HEADER_BITS;
        let mut plan = PacketPlan {
            reliable: Vec::new(),
            unreliable: Vec::new(),
        };

        for (id, queued) in peer.queue.reliable() {
            if queued.fragmented {
                break;
            }
            if in_flight {
                // only the batch in flight, once it is due
                let due = queued
                    .time_last_sent
                    .is_some_and(|sent| self.time - sent >= resend_time);
                if !due {
                    break;
                }
            }
            let cost = RELIABLE_OVERHEAD_BITS + queued.bits_required;
            if used + cost > capacity || plan.len() == MAX_MESSAGES_PER_PACKET {
                break;
            }
            used += cost;
            plan.reliable.push(id);
        }

        for (id, queued) in peer.queue.unreliable() {
            let cost = UNRELIABLE_OVERHEAD_BITS + queued.bits_required;
            if plan.len() == MAX_MESSAGES_PER_PACKET {
                break;
            }
            if used + cost <= capacity {
                used += cost;
                plan.unreliable.push(id);
            }
        }
        plan
    }

    fn send_plan(&mut self, node_id: usize, plan: PacketPlan) -> Result<()> {
        let mut stream = WriteStream::new(self.config.mtu);
        write_messages_header(&mut stream, plan.len() as u8)?;
        let peer = &mut self.peers[node_id];
        for &id in &plan.reliable {
            if let Some(queued) = peer.queue.reliable_mut(id) {
                write_entry(&mut stream, Some(id), queued.message.as_mut())?;
            }
        }
        for &id in &plan.unreliable {
            if let Some(queued) = peer.queue.unreliable_mut(id) {
                write_entry(&mut stream, None, queued.message.as_mut())?;
            }
        }
        stream.pad_to_nearest_byte()?;
        let packet = stream.into_bytes();

        let sequence = self.transport.send_packet(node_id, &packet)?;
        self.metrics.packet_sent(packet.len() as u64);
        self.metrics.messages_packed(plan.len() as u64);

        let peer = &mut self.peers[node_id];
        peer.regular_turn = false;
        peer.ack_owed = false;
        for id in &plan.unreliable {
            peer.queue.remove_unreliable(*id);
        }
        if !plan.reliable.is_empty() {
            peer.queue.mark_sent(&plan.reliable, self.time);
            peer.sent_packets.insert(sequence, plan.reliable);
            while peer.sent_packets.len() > MAX_TRACKED_PACKETS {
                peer.sent_packets.pop_first();
            }
        }
        Ok(())
    }

    fn process_packet(&mut self, node_id: usize, payload: &[u8]) -> Result<()> {
        if node_id >= self.peers.len() {
            return Err(NetError::NodeNotConnected(node_id));
        }
        let mut stream = ReadStream::new(payload);
        let mut kind = 0;
        stream.serialize_bits(&mut kind, 1)?;
        // empty message packets only carry acks and are not acked back
        if kind == PACKET_FRAGMENT || payload.get(1).is_some_and(|&count| count > 0) {
            self.peers[node_id].ack_owed = true;
        }
        if kind == PACKET_MESSAGES {
            self.read_messages(node_id, &mut stream)
        } else {
            self.read_fragment(node_id, &mut stream)
        }
    }

    /// Read a messages body whose type bit was already consumed
    fn read_messages(&mut self, node_id: usize, stream: &mut ReadStream<'_>) -> Result<()> {
        let mut padding = 0;
        let mut count = 0u8;
        stream.serialize_bits(&mut padding, 7)?;
        stream.serialize_byte(&mut count)?;

        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let mut reliable = false;
            stream.serialize_bool(&mut reliable)?;
            let mut id = 0;
            if reliable {
                stream.serialize_u32(&mut id)?;
            }
            let message = self.factory.read_message(stream)?;
            entries.push((reliable.then_some(id), message));
        }

        let peer = &mut self.peers[node_id];
        for (id, message) in entries {
            if let Some(id) = id {
                if id <= peer.last_reliable_received {
                    debug!(node_id, message_id = id, "Dropped duplicate reliable message");
                    continue;
                }
                peer.last_reliable_received = id;
            }
            self.metrics.message_delivered();
            self.events.push_back(NetEvent::MessageReceived { node_id, message });
        }
        Ok(())
    }

    fn read_fragment(&mut self, node_id: usize, stream: &mut ReadStream<'_>) -> Result<()> {
        let mut transfer = 0;
        let mut index = 0u8;
        let mut count = 0u8;
        stream.serialize_bits(&mut transfer, 7)?;
        stream.serialize_byte(&mut index)?;
        stream.serialize_byte(&mut count)?;
        let transfer = transfer as u8;
        let bytes = stream.remaining_bytes();
        self.metrics.fragment_received();

        let fragment_size = self.config.mtu - FRAGMENT_HEADER_SIZE;
        let peer = &mut self.peers[node_id];
        if peer.completed_transfer == Some(transfer) {
            return Ok(());
        }
        let source = FragmentSource { node_id, transfer };
        match peer.incoming.source() {
            Some(current) if current == source => {
                if peer.incoming.fragment_count() != usize::from(count) {
                    return Err(NetError::InvalidHeader);
                }
            }
            current => {
                // a sender only moves on once its previous transfer was acked
                if let Some(current) = current {
                    warn!(
                        node_id,
                        abandoned = current.transfer,
                        transfer,
                        "Sender started a new fragmented transfer, dropping the old one"
                    );
                    self.metrics.transfer_dropped();
                }
                peer.incoming
                    .setup_receive(source, usize::from(count), fragment_size)?;
            }
        }

        // a malformed fragment leaves the acknowledged ones in place
        peer.incoming.on_fragment_received(index, bytes)?;
        let Some(body) = peer.incoming.take_payload() else {
            return Ok(());
        };
        peer.completed_transfer = Some(transfer);
        debug!(node_id, transfer, size = body.len(), "Fragmented transfer complete");

        let mut stream = ReadStream::new(&body);
        let mut kind = 0;
        stream.serialize_bits(&mut kind, 1)?;
        if kind != PACKET_MESSAGES {
            return Err(NetError::InvalidHeader);
        }
        self.read_messages(node_id, &mut stream)
    }

    fn process_transport_events(&mut self) {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::Connected => {
                    info!(node_id = ?self.transport.local_node_id(), "Connected");
                    self.peers = (0..self.transport.max_nodes()).map(|_| Peer::default()).collect();
                    self.events.push_back(NetEvent::Connected);
                }
                TransportEvent::ConnectFailed => {
                    self.reset();
                    self.events.push_back(NetEvent::ConnectFailed);
                }
                TransportEvent::Disconnected => {
                    info!("Disconnected");
                    self.reset();
                    self.events.push_back(NetEvent::Disconnected);
                }
                TransportEvent::NodeConnected(node_id) => {
                    self.reset_peer(node_id);
                    self.metrics.node_connected();
                    self.events.push_back(NetEvent::NodeConnected(node_id));
                }
                TransportEvent::NodeDisconnected(node_id) => {
                    self.reset_peer(node_id);
                    self.metrics.node_disconnected();
                    self.events.push_back(NetEvent::NodeDisconnected(node_id));
                }
                TransportEvent::PacketAcked { node_id, sequence } => {
                    self.on_packet_acked(node_id, sequence);
                }
                TransportEvent::MasterServerConnection(reachable) => {
                    self.events
                        .push_back(NetEvent::MasterServerConnection(reachable));
                }
            }
        }
    }

    fn reset_peer(&mut self, node_id: usize) {
        if let Some(peer) = self.peers.get_mut(node_id) {
            *peer = Peer::default();
        }
    }

    fn on_packet_acked(&mut self, node_id: usize, sequence: u32) {
        let Some(peer) = self.peers.get_mut(node_id) else {
            return;
        };
        let mut acked = peer.sent_packets.remove(&sequence).unwrap_or_default();
        if peer.outgoing.on_packet_acked(sequence) {
            debug!(node_id, "Fragmented transfer acknowledged");
            acked.extend(peer.transfer_message.take());
        }
        for message_id in acked {
            if peer.queue.remove_reliable(message_id).is_some() {
                self.metrics.reliable_message_acked();
                self.events
                    .push_back(NetEvent::ReliableMessageAcked { node_id, message_id });
            }
        }
    }
}

fn write_messages_header(stream: &mut WriteStream, count: u8) -> Result<()> {
    let mut kind = PACKET_MESSAGES;
    let mut padding = 0;
    let mut count = count;
    stream.serialize_bits(&mut kind, 1)?;
    stream.serialize_bits(&mut padding, 7)?;
    stream.serialize_byte(&mut count)
}

fn write_entry(stream: &mut WriteStream, id: Option<MessageId>, message: &mut dyn Message) -> Result<()> {
    let mut reliable = id.is_some();
    stream.serialize_bool(&mut reliable)?;
    if let Some(mut id) = id {
        stream.serialize_u32(&mut id)?;
    }
    MessageFactory::write_message(stream, message)
}
