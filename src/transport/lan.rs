//! # LAN Transport
//!
//! Local network discovery and hosting.
//!
//! A host broadcasts a [`Beacon`] once per second while clients browsing the
//! lobby run a [`Listener`] that collects beacons into lobby entries. The host
//! runs the mesh on its own machine and joins it as node 0.
//!
//! ## Beacon Format
//! ```text
//! [Zero(4)] [ProtocolId(4)] [MeshPort(2)] [Reserved(2)] [NameLen(1)] [Name(N)]
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE};
use crate::error::{NetError, Result};
use crate::protocol::reliability::ReliabilitySystem;
use crate::transport::session::MeshSession;
use crate::transport::{LobbyEntry, Transport, TransportEvent};

/// Seconds between beacon broadcasts
pub const BEACON_INTERVAL: f32 = 1.0;

/// Fixed part of a beacon packet
pub const BEACON_HEADER_SIZE: usize = 13;

/// Longest host name carried by a beacon
pub const MAX_NAME_LENGTH: usize = 63;

/// Encode a beacon announcing `name` on `mesh_port`
pub fn encode_beacon(protocol_id: u32, mesh_port: u16, name: &str) -> Vec<u8> {
    let mut end = name.len().min(MAX_NAME_LENGTH);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let name = &name.as_bytes()[..end];

    let mut packet = BytesMut::with_capacity(BEACON_HEADER_SIZE + name.len());
    packet.put_u32(0);
    packet.put_u32(protocol_id);
    packet.put_u16(mesh_port);
    packet.put_u16(0);
    packet.put_u8(name.len() as u8);
    packet.put_slice(name);
    packet.to_vec()
}

/// Mesh port and host name of a beacon for `protocol_id`
pub fn decode_beacon(protocol_id: u32, data: &[u8]) -> Option<(u16, String)> {
    if data.len() < BEACON_HEADER_SIZE {
        return None;
    }
    let mut reader = data;
    if reader.get_u32() != 0 || reader.get_u32() != protocol_id {
        return None;
    }
    let mesh_port = reader.get_u16();
    reader.advance(2);
    let name_length = usize::from(reader.get_u8());
    if reader.len() != name_length || name_length > MAX_NAME_LENGTH {
        return None;
    }
    let name = std::str::from_utf8(reader).ok()?;
    Some((mesh_port, name.to_string()))
}

/// Periodic host announcement
#[derive(Debug)]
pub struct Beacon {
    socket: Socket,
    packet: Vec<u8>,
    destination: Address,
    accumulator: f32,
}

impl Beacon {
    /// Broadcast from `port` to every listener on `listener_port`
    #[instrument(level = "info", skip(protocol_id))]
    pub fn start(
        port: u16,
        listener_port: u16,
        protocol_id: u32,
        mesh_port: u16,
        name: &str,
    ) -> Result<Self> {
        let socket = Socket::open(port, SocketOptions { broadcast: true })?;
        info!(port = socket.port(), "Beacon started");
        Ok(Self {
            socket,
            packet: encode_beacon(protocol_id, mesh_port, name),
            destination: Address::broadcast(listener_port),
            accumulator: BEACON_INTERVAL,
        })
    }

    /// Send to a single address instead of broadcasting
    pub fn set_destination(&mut self, destination: Address) {
        self.destination = destination;
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn update(&mut self, dt: f32) {
        self.accumulator += dt;
        if self.accumulator < BEACON_INTERVAL {
            return;
        }
        self.accumulator = 0.0;
        // a network without a broadcast route is not fatal to hosting
        if let Err(e) = self.socket.send(self.destination, &self.packet) {
            warn!(error = %e, destination = %self.destination, "Beacon send failed");
        }
    }
}

#[derive(Debug)]
struct ListenerEntry {
    entry: LobbyEntry,
    time_since_heard: f32,
}

/// Collects beacons into lobby entries
#[derive(Debug)]
pub struct Listener {
    socket: Socket,
    protocol_id: u32,
    timeout: f32,
    entries: Vec<ListenerEntry>,
}

impl Listener {
    #[instrument(level = "info", skip(protocol_id))]
    pub fn start(port: u16, protocol_id: u32, timeout: f32) -> Result<Self> {
        let socket = Socket::open(port, SocketOptions::default())?;
        info!(port = socket.port(), "Listener started");
        Ok(Self {
            socket,
            protocol_id,
            timeout,
            entries: Vec::new(),
        })
    }

    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    pub fn update(&mut self, dt: f32) -> Result<()> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        while let Some((sender, size)) = self.socket.receive(&mut buffer)? {
            let Some((mesh_port, name)) = decode_beacon(self.protocol_id, &buffer[..size]) else {
                debug!(%sender, size, "Listener ignored foreign datagram");
                continue;
            };
            let address = Address::from_raw(sender.ip(), mesh_port);
            match self.entries.iter_mut().find(|e| e.entry.address == address) {
                Some(existing) => {
                    existing.entry.name = name;
                    existing.time_since_heard = 0.0;
                }
                None => {
                    debug!(%address, %name, "Lobby entry discovered");
                    self.entries.push(ListenerEntry {
                        entry: LobbyEntry::new(name, address),
                        time_since_heard: 0.0,
                    });
                }
            }
        }

        let timeout = self.timeout;
        self.entries.retain_mut(|e| {
            e.time_since_heard += dt;
            e.time_since_heard <= timeout
        });
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<&LobbyEntry> {
        self.entries.get(index).map(|e| &e.entry)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&LobbyEntry> {
        self.entries.iter().map(|e| &e.entry).find(|e| e.name == name)
    }
}

/// Transport for hosts and clients on one broadcast domain
#[derive(Debug)]
pub struct LanTransport {
    config: TransportConfig,
    session: MeshSession,
    beacon: Option<Beacon>,
    listener: Option<Listener>,
}

impl LanTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            session: MeshSession::new(&config),
            config,
            beacon: None,
            listener: None,
        }
    }

    pub fn beacon_mut(&mut self) -> Option<&mut Beacon> {
        self.beacon.as_mut()
    }

    pub fn listener(&self) -> Option<&Listener> {
        self.listener.as_ref()
    }

    /// Port of the hosted mesh
    pub fn mesh_port(&self) -> Option<u16> {
        self.session.mesh_port()
    }

    fn resolve(&self, target: &str) -> Result<Address> {
        if let Ok(address) = target.parse::<Address>() {
            return Ok(address);
        }
        self.listener
            .as_ref()
            .and_then(|listener| listener.find_by_name(target))
            .map(|entry| entry.address)
            .ok_or_else(|| NetError::UnknownHost(target.to_string()))
    }
}

impl Transport for LanTransport {
    #[instrument(level = "info", skip(self))]
    fn start_server(&mut self, name: &str) -> Result<()> {
        self.stop();
        self.session
            .host(self.config.mesh_port, self.config.server_port)?;
        let mesh_port = self.session.mesh_port().ok_or(NetError::NotStarted)?;
        self.beacon = Some(Beacon::start(
            self.config.beacon_port,
            self.config.listener_port,
            self.config.protocol_id,
            mesh_port,
            name,
        )?);
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    fn connect_client(&mut self, target: &str) -> Result<()> {
        let address = self.resolve(target)?;
        info!(%address, "Connecting to LAN host");
        self.session.join(self.config.client_port, address)
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn connect_failed(&self) -> bool {
        self.session.connect_failed()
    }

    fn is_node_connected(&self, node_id: usize) -> bool {
        self.session.is_node_connected(node_id)
    }

    fn local_node_id(&self) -> Option<usize> {
        self.session.local_node_id()
    }

    fn max_nodes(&self) -> usize {
        self.session.max_nodes()
    }

    fn can_send(&self, node_id: usize) -> bool {
        self.session.can_send(node_id)
    }

    fn send_packet(&mut self, node_id: usize, data: &[u8]) -> Result<u32> {
        self.session.send_packet(node_id, data)
    }

    fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        self.session.receive_packet()
    }

    fn enter_lobby(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.listener = Some(Listener::start(
                self.config.listener_port,
                self.config.protocol_id,
                self.config.timeout.as_secs_f32(),
            )?);
        }
        Ok(())
    }

    fn lobby_entry_count(&self) -> usize {
        self.listener.as_ref().map_or(0, Listener::entry_count)
    }

    fn lobby_entry(&self, index: usize) -> Option<LobbyEntry> {
        self.listener.as_ref()?.entry(index).cloned()
    }

    fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem> {
        self.session.reliability(node_id)
    }

    fn update(&mut self, dt: f32) -> Result<()> {
        if let Some(beacon) = &mut self.beacon {
            beacon.update(dt);
        }
        if let Some(listener) = &mut self.listener {
            listener.update(dt)?;
        }
        self.session.update(dt)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.session.poll_event()
    }

    fn stop(&mut self) {
        self.beacon = None;
        self.listener = None;
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTOCOL_ID: u32 = 0x1A2B_3C4D;

    #[test]
    fn test_beacon_layout() {
        let packet = encode_beacon(PROTOCOL_ID, 30000, "den");
        assert_eq!(
            packet,
            vec![0, 0, 0, 0, 0x1A, 0x2B, 0x3C, 0x4D, 0x75, 0x30, 0, 0, 3, b'd', b'e', b'n']
        );
        assert_eq!(
            decode_beacon(PROTOCOL_ID, &packet),
            Some((30000, "den".to_string()))
        );
    }

    #[test]
    fn test_foreign_beacons_rejected() {
        let packet = encode_beacon(PROTOCOL_ID, 30000, "den");
        assert!(decode_beacon(PROTOCOL_ID + 1, &packet).is_none());
        assert!(decode_beacon(PROTOCOL_ID, &packet[..packet.len() - 1]).is_none());
        let mut nonzero = packet.clone();
        nonzero[0] = 1;
        assert!(decode_beacon(PROTOCOL_ID, &nonzero).is_none());
    }

    #[test]
    fn test_long_names_truncated() {
        let name = "é".repeat(40);
        let packet = encode_beacon(PROTOCOL_ID, 1, &name);
        let (_, decoded) = decode_beacon(PROTOCOL_ID, &packet).expect("valid beacon");
        assert_eq!(decoded.len(), 62);
        assert!(name.starts_with(&decoded));
    }

    #[test]
    fn test_beacon_discovered_and_expired() {
        let mut listener = Listener::start(0, PROTOCOL_ID, 1.0).expect("listener");
        let mut beacon = Beacon::start(0, listener.port(), PROTOCOL_ID, 31000, "den").expect("beacon");
        beacon.set_destination(Address::loopback(listener.port()));
        beacon.update(0.0);

        let mut found = false;
        for _ in 0..200 {
            listener.update(0.0).expect("listener update");
            if listener.entry_count() > 0 {
                found = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(found, "beacon never arrived");
        let entry = listener.find_by_name("den").expect("entry by name");
        assert_eq!(entry.address, Address::loopback(31000));

        listener.update(1.5).expect("listener update");
        assert_eq!(listener.entry_count(), 0);
    }

    #[test]
    fn test_connect_to_unknown_name_fails() {
        let mut transport = LanTransport::new(TransportConfig::default());
        assert!(matches!(
            transport.connect_client("nowhere"),
            Err(NetError::UnknownHost(_))
        ));
    }
}
