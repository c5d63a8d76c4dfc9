//! # Master Server
//!
//! Out-of-band matchmaking. Hosts report their status, clients browse the
//! list of hosts and ask to be linked to one. A link request is answered on
//! both sides: the host learns the client's address and the client learns
//! where the host's mesh listens.
//!
//! Only clients that registered with a `Ping` or a `GameListRequest` may ask
//! for a link. Hosts and clients that go silent for longer than the timeout
//! are forgotten.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};

use crate::config::MasterServerConfig;
use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE as RECEIVE_BUFFER_SIZE};
use crate::core::stream::{MeasureStream, Stream};
use crate::error::Result;
use crate::service::master_messages::{
    decode_datagram, encode_datagram, GameListEntry, HostStatus, MasterMessage, DATA_HEADER_SIZE,
    MAX_DATAGRAM_SIZE, MAX_GAME_LIST_ENTRIES,
};

/// Everything the server knows about one host
#[derive(Debug, Clone, PartialEq)]
pub struct GameHostMasterData {
    pub address: Address,
    pub status: HostStatus,
    pub time_since_update_received: f32,
    pub time_since_update_sent: f32,
}

impl GameHostMasterData {
    fn list_entry(&self) -> GameListEntry {
        GameListEntry {
            address: self.address,
            name: self.status.name.clone(),
            state: self.status.state,
            total_capacity: self.status.total_capacity,
            current_player_count: self.status.current_player_count,
            allows_joining: self.status.allows_joining,
        }
    }
}

/// A client that may request links
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameClientMasterData {
    pub address: Address,
    pub time_since_update_received: f32,
}

/// Matchmaking registry
#[derive(Debug)]
pub struct MasterServer {
    protocol_id: u32,
    timeout: f32,
    socket: Option<Socket>,
    hosts: BTreeMap<Address, GameHostMasterData>,
    clients: BTreeMap<Address, GameClientMasterData>,
}

impl MasterServer {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            protocol_id,
            timeout,
            socket: None,
            hosts: BTreeMap::new(),
            clients: BTreeMap::new(),
        }
    }

    pub fn from_config(protocol_id: u32, config: &MasterServerConfig) -> Self {
        Self::new(protocol_id, config.timeout.as_secs_f32())
    }

    #[instrument(level = "info", skip(self))]
    pub fn start(&mut self, port: u16) -> Result<()> {
        let socket = Socket::open(port, SocketOptions::default())?;
        info!(port = socket.port(), "Master server started");
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("Master server stopped");
        }
        self.hosts.clear();
        self.clients.clear();
    }

    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(Socket::port)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn host(&self, address: Address) -> Option<&GameHostMasterData> {
        self.hosts.get(&address)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_client_registered(&self, address: Address) -> bool {
        self.clients.contains_key(&address)
    }

    /// Serve pending datagrams, then age and prune the registry
    pub fn update(&mut self, dt: f32) -> Result<()> {
        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let received = match &self.socket {
                Some(socket) => socket.receive(&mut buffer)?,
                None => None,
            };
            let Some((sender, size)) = received else {
                break;
            };
            for (destination, mut reply) in self.process_datagram(sender, &buffer[..size]) {
                self.send(destination, &mut reply)?;
            }
        }
        self.prune(dt);
        Ok(())
    }

    /// Handle one datagram from `sender` and return the replies it calls for
    pub fn process_datagram(&mut self, sender: Address, data: &[u8]) -> Vec<(Address, MasterMessage)> {
        let message = match decode_datagram(self.protocol_id, data) {
            Ok(message) => message,
            Err(e) => {
                debug!(%sender, size = data.len(), error = %e, "Master server dropped datagram");
                return Vec::new();
            }
        };
        if let Some(client) = self.clients.get_mut(&sender) {
            client.time_since_update_received = 0.0;
        }

        match message {
            MasterMessage::Ping => {
                self.register_client(sender);
                vec![(sender, MasterMessage::Pong)]
            }
            MasterMessage::GameHostStatusUpdate(status) => {
                let host = self.hosts.entry(sender).or_insert_with(|| {
                    info!(%sender, name = %status.name, "Host registered");
                    GameHostMasterData {
                        address: sender,
                        status: HostStatus::default(),
                        time_since_update_received: 0.0,
                        time_since_update_sent: 0.0,
                    }
                });
                host.status = status;
                host.time_since_update_received = 0.0;
                host.time_since_update_sent = 0.0;
                vec![(sender, MasterMessage::Pong)]
            }
            MasterMessage::GameListRequest => {
                self.register_client(sender);
                vec![(sender, MasterMessage::GameListResponse(self.game_list()))]
            }
            MasterMessage::GameClientConnectionRequest {
                host_address,
                client_port,
            } => self.link(sender, host_address, client_port),
            other => {
                debug!(%sender, message_type = other.message_type(), "Master server ignored message");
                Vec::new()
            }
        }
    }

    fn register_client(&mut self, address: Address) {
        self.clients.entry(address).or_insert_with(|| {
            debug!(%address, "Client registered");
            GameClientMasterData {
                address,
                time_since_update_received: 0.0,
            }
        });
    }

    fn link(
        &mut self,
        sender: Address,
        host_address: Address,
        client_port: u16,
    ) -> Vec<(Address, MasterMessage)> {
        if !self.clients.contains_key(&sender) {
            debug!(%sender, "Connection request from unregistered client ignored");
            return Vec::new();
        }
        let Some(host) = self.hosts.get_mut(&host_address) else {
            info!(%sender, %host_address, "Connection request for unknown host");
            return vec![(
                sender,
                MasterMessage::GameClientConnectionResponse {
                    host_address,
                    success: false,
                },
            )];
        };
        host.time_since_update_sent = 0.0;
        let client_address = Address::from_raw(sender.ip(), client_port);
        let mesh_address = Address::from_raw(host_address.ip(), host.status.game_client_port);
        info!(%client_address, %mesh_address, "Linking client to host");
        vec![
            (
                host_address,
                MasterMessage::GameHostConnectionResponse {
                    client_address,
                    success: true,
                },
            ),
            (
                sender,
                MasterMessage::GameClientConnectionResponse {
                    host_address: mesh_address,
                    success: true,
                },
            ),
        ]
    }

    /// As many hosts as fit one datagram
    fn game_list(&self) -> Vec<GameListEntry> {
        let capacity = (MAX_DATAGRAM_SIZE - DATA_HEADER_SIZE) * 8;
        let mut measure = MeasureStream::new();
        let mut entries = Vec::new();
        let mut count = 0;
        if measure
            .serialize_integer(&mut count, 0, MAX_GAME_LIST_ENTRIES as i32)
            .is_err()
        {
            return entries;
        }
        for host in self.hosts.values() {
            if entries.len() == MAX_GAME_LIST_ENTRIES {
                break;
            }
            let mut entry = host.list_entry();
            if entry.serialize(&mut measure).is_err() || measure.bits_processed() > capacity {
                break;
            }
            entries.push(entry);
        }
        entries
    }

    fn send(&mut self, destination: Address, message: &mut MasterMessage) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let packet = encode_datagram(self.protocol_id, message)?;
        if !socket.send(destination, &packet)? {
            warn!(%destination, "Master server reply dropped, socket buffer full");
        }
        Ok(())
    }

    fn prune(&mut self, dt: f32) {
        let timeout = self.timeout;
        self.hosts.retain(|address, host| {
            host.time_since_update_received += dt;
            host.time_since_update_sent += dt;
            let alive = host.time_since_update_received <= timeout;
            if !alive {
                info!(%address, "Host timed out");
            }
            alive
        });
        self.clients.retain(|_, client| {
            client.time_since_update_received += dt;
            client.time_since_update_received <= timeout
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::master_messages::encode_datagram;

    const PROTOCOL_ID: u32 = 0x3141_5926;

    fn datagram(mut message: MasterMessage) -> Vec<u8> {
        encode_datagram(PROTOCOL_ID, &mut message).expect("encode")
    }

    fn status(name: &str) -> MasterMessage {
        MasterMessage::GameHostStatusUpdate(HostStatus {
            name: name.into(),
            game_client_port: 30000,
            total_capacity: 4,
            current_player_count: 1,
            allows_joining: true,
            ..HostStatus::default()
        })
    }

    #[test]
    fn test_status_update_registers_host() {
        let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
        let host = Address::new(10, 0, 0, 1, 5000);
        let replies = server.process_datagram(host, &datagram(status("den")));
        assert_eq!(replies, vec![(host, MasterMessage::Pong)]);
        assert_eq!(server.host(host).map(|h| h.status.name.as_str()), Some("den"));
        server.prune(10.5);
        assert_eq!(server.host_count(), 0);
    }

    #[test]
    fn test_game_list_fills_one_datagram() {
        let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
        for i in 0..100u16 {
            let host = Address::new(10, 0, 0, 1, 5000 + i);
            server.process_datagram(host, &datagram(status(&"h".repeat(40))));
        }
        let list = server.game_list();
        assert!(!list.is_empty() && list.len() < 100);
        let packet = datagram(MasterMessage::GameListResponse(list.clone()));
        assert!(packet.len() <= MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn test_foreign_protocol_ignored() {
        let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
        let mut message = MasterMessage::Ping;
        let packet = encode_datagram(PROTOCOL_ID + 1, &mut message).expect("encode");
        assert!(server
            .process_datagram(Address::new(10, 0, 0, 2, 1), &packet)
            .is_empty());
        assert_eq!(server.client_count(), 0);
    }
}
