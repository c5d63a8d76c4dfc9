//! # Connections
//!
//! Point-to-point links over one UDP socket.
//!
//! [`Connection`] frames every datagram with the protocol-ID checksum and runs
//! a small client/server state machine driven by a timeout: a server listens
//! and adopts the first valid sender as its peer; a client connects to a known
//! address and succeeds once the peer answers. [`ReliableConnection`] adds the
//! 12-byte reliability header and a [`ReliabilitySystem`].
//!
//! ```text
//! [CRC32C(4)] [sequence(4)] [ack(4)] [ack_bits(4)] [payload(N)]
//! ```
//!
//! The reliability header is also what the mesh transports put in front of
//! every node-to-node packet.

use tracing::{debug, info, instrument};

use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE};
use crate::core::stream::{ReadStream, Stream, WriteStream};
use crate::error::{NetError, Result};
use crate::protocol::reliability::ReliabilitySystem;
use crate::utils::checksum::{self, CHECKSUM_SIZE};

/// Sequence, ack and ack bits, big-endian on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReliabilityHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl ReliabilityHeader {
    pub const SIZE: usize = 12;

    pub fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
        stream.serialize_u32(&mut self.sequence)?;
        stream.serialize_u32(&mut self.ack)?;
        stream.serialize_u32(&mut self.ack_bits)
    }

    /// Header for the next packet sent through `reliability`
    pub fn next(reliability: &ReliabilitySystem) -> Self {
        Self {
            sequence: reliability.local_sequence(),
            ack: reliability.remote_sequence(),
            ack_bits: reliability.generate_ack_bits(),
        }
    }

    /// Header followed by `payload`
    pub fn encode(mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = WriteStream::new(Self::SIZE + payload.len());
        self.serialize(&mut stream)?;
        let mut body = payload.to_vec();
        stream.serialize_bytes(&mut body)?;
        Ok(stream.into_bytes())
    }

    /// Split a packet into its header and payload
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8])> {
        if packet.len() < Self::SIZE {
            return Err(NetError::InvalidHeader);
        }
        let mut header = Self::default();
        let mut stream = ReadStream::new(packet);
        header.serialize(&mut stream)?;
        Ok((header, &packet[Self::SIZE..]))
    }
}

/// Role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    None,
    Client,
    Server,
}

/// Link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    ConnectFail,
    Connected,
}

/// Checksummed point-to-point link
#[derive(Debug)]
pub struct Connection {
    protocol_id: u32,
    timeout: f32,
    socket: Option<Socket>,
    mode: ConnectionMode,
    state: ConnectionState,
    address: Address,
    timeout_accumulator: f32,
}

impl Connection {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            protocol_id,
            timeout,
            socket: None,
            mode: ConnectionMode::None,
            state: ConnectionState::Disconnected,
            address: Address::default(),
            timeout_accumulator: 0.0,
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub fn start(&mut self, port: u16) -> Result<()> {
        self.socket = Some(Socket::open(port, SocketOptions::default())?);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            debug!("Connection stopped");
        }
        self.clear();
        self.mode = ConnectionMode::None;
    }

    /// Port bound by `start`
    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(Socket::port)
    }

    /// Wait for a client to send the first valid packet
    pub fn listen(&mut self) {
        info!("Connection listening");
        self.clear();
        self.mode = ConnectionMode::Server;
        self.state = ConnectionState::Listening;
    }

    /// Send to `address` and wait for it to answer
    pub fn connect(&mut self, address: Address) {
        info!(%address, "Connection connecting");
        self.clear();
        self.mode = ConnectionMode::Client;
        self.state = ConnectionState::Connecting;
        self.address = address;
    }

    fn clear(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.timeout_accumulator = 0.0;
        self.address = Address::default();
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn connect_failed(&self) -> bool {
        self.state == ConnectionState::ConnectFail
    }

    pub fn is_listening(&self) -> bool {
        self.state == ConnectionState::Listening
    }

    /// Peer address, unset while listening
    pub fn address(&self) -> Address {
        self.address
    }

    /// Advance the timeout; silence past it fails or drops the link
    pub fn update(&mut self, dt: f32) {
        self.timeout_accumulator += dt;
        if self.timeout_accumulator <= self.timeout {
            return;
        }
        match self.state {
            ConnectionState::Connecting => {
                info!(address = %self.address, "Connect timed out");
                self.clear();
                self.state = ConnectionState::ConnectFail;
            }
            ConnectionState::Connected => {
                info!(address = %self.address, "Connection timed out");
                let was_server = self.mode == ConnectionMode::Server;
                self.clear();
                if was_server {
                    self.state = ConnectionState::Listening;
                }
            }
            _ => {}
        }
    }

    /// Frame and send `data` to the peer; `Ok(false)` when there is no peer yet
    pub fn send_packet(&mut self, data: &[u8]) -> Result<bool> {
        let socket = self.socket.as_ref().ok_or(NetError::NotStarted)?;
        if self.address.is_unset() {
            return Ok(false);
        }
        let mut packet = vec![0u8; CHECKSUM_SIZE + data.len()];
        packet[CHECKSUM_SIZE..].copy_from_slice(data);
        checksum::stamp(&mut packet, self.protocol_id);
        socket.send(self.address, &packet)
    }

    /// Next payload from the peer, or `None` when nothing valid is pending
    pub fn receive_packet(&mut self) -> Result<Option<Vec<u8>>> {
        let socket = self.socket.as_ref().ok_or(NetError::NotStarted)?;
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let Some((sender, size)) = socket.receive(&mut buffer)? else {
                return Ok(None);
            };
            let packet = &buffer[..size];
            if size <= CHECKSUM_SIZE || !checksum::verify(packet, self.protocol_id) {
                debug!(%sender, size, "Dropped datagram failing the checksum");
                continue;
            }
            if self.mode == ConnectionMode::Server && self.state == ConnectionState::Listening {
                info!(%sender, "Client connected");
                self.state = ConnectionState::Connected;
                self.address = sender;
            }
            if sender != self.address {
                continue;
            }
            if self.mode == ConnectionMode::Client && self.state == ConnectionState::Connecting {
                info!(%sender, "Connected to server");
                self.state = ConnectionState::Connected;
            }
            self.timeout_accumulator = 0.0;
            return Ok(Some(packet[CHECKSUM_SIZE..].to_vec()));
        }
    }
}

/// Connection with sequence numbers and acknowledgements
#[derive(Debug)]
pub struct ReliableConnection {
    connection: Connection,
    reliability: ReliabilitySystem,
    was_connected: bool,
}

impl ReliableConnection {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            connection: Connection::new(protocol_id, timeout),
            reliability: ReliabilitySystem::default(),
            was_connected: false,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn reliability(&self) -> &ReliabilitySystem {
        &self.reliability
    }

    pub fn start(&mut self, port: u16) -> Result<()> {
        self.connection.start(port)
    }

    pub fn stop(&mut self) {
        self.connection.stop();
        self.reliability.reset();
        self.was_connected = false;
    }

    pub fn listen(&mut self) {
        self.reliability.reset();
        self.connection.listen();
    }

    pub fn connect(&mut self, address: Address) {
        self.reliability.reset();
        self.connection.connect(address);
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Send `data` behind a reliability header, returning the sequence used
    pub fn send_packet(&mut self, data: &[u8]) -> Result<Option<u32>> {
        let header = ReliabilityHeader::next(&self.reliability);
        let packet = header.encode(data)?;
        if !self.connection.send_packet(&packet)? {
            return Ok(None);
        }
        self.reliability.packet_sent(packet.len());
        Ok(Some(header.sequence))
    }

    /// Next new payload; duplicates and malformed headers are skipped
    pub fn receive_packet(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(packet) = self.connection.receive_packet()? {
            let Ok((header, payload)) = ReliabilityHeader::decode(&packet) else {
                debug!(size = packet.len(), "Dropped packet with truncated header");
                continue;
            };
            self.check_transition();
            if !self.reliability.packet_received(header.sequence, packet.len()) {
                debug!(sequence = header.sequence, "Dropped duplicate packet");
                continue;
            }
            self.reliability.process_ack(header.ack, header.ack_bits);
            return Ok(Some(payload.to_vec()));
        }
        Ok(None)
    }

    /// Sequences acknowledged since the last call
    pub fn take_acks(&mut self) -> Vec<u32> {
        self.reliability.take_acks()
    }

    pub fn update(&mut self, dt: f32) {
        self.connection.update(dt);
        self.check_transition();
        self.reliability.update(dt);
    }

    fn check_transition(&mut self) {
        let connected = self.connection.is_connected();
        if self.was_connected && !connected {
            self.reliability.reset();
        }
        self.was_connected = connected;
    }
}
