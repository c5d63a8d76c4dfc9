//! # IP Transport
//!
//! Internet play brokered by a master server.
//!
//! A host runs its mesh and reports its status to the master server. A
//! client browses the game list, then asks the master server to be linked to
//! a host; the answer carries the host's mesh address, which the client then
//! joins directly.

use tracing::{debug, info, instrument, warn};

use crate::config::{MasterServerConfig, TransportConfig};
use crate::core::address::Address;
use crate::error::{NetError, Result};
use crate::protocol::reliability::ReliabilitySystem;
use crate::service::master_connection::{MasterEvent, MasterServerConnection};
use crate::service::master_messages::HostStatus;
use crate::transport::session::MeshSession;
use crate::transport::{LobbyEntry, Transport, TransportEvent};

/// Transport rendezvousing through a master server
#[derive(Debug)]
pub struct IpTransport {
    config: TransportConfig,
    master_config: MasterServerConfig,
    session: MeshSession,
    master: Option<MasterServerConnection>,
    lobby: Vec<LobbyEntry>,
    pending_connect: Option<f32>,
    connect_failed: bool,
}

impl IpTransport {
    pub fn new(config: TransportConfig, master_config: MasterServerConfig) -> Self {
        Self {
            session: MeshSession::new(&config),
            config,
            master_config,
            master: None,
            lobby: Vec::new(),
            pending_connect: None,
            connect_failed: false,
        }
    }

    pub fn master(&self) -> Option<&MasterServerConnection> {
        self.master.as_ref()
    }

    /// Port of the hosted mesh
    pub fn mesh_port(&self) -> Option<u16> {
        self.session.mesh_port()
    }

    fn master_mut(&mut self) -> Result<&mut MasterServerConnection> {
        if self.master.is_none() {
            let mut master =
                MasterServerConnection::from_config(self.config.protocol_id, &self.master_config)?;
            master.start(0)?;
            self.master = Some(master);
        }
        self.master.as_mut().ok_or(NetError::NotStarted)
    }

    fn resolve(&self, target: &str) -> Result<Address> {
        if let Some(entry) = self.lobby.iter().find(|e| e.name == target) {
            return Ok(entry.address);
        }
        target
            .parse::<Address>()
            .map_err(|_| NetError::UnknownHost(target.to_string()))
    }

    fn on_master_event(&mut self, event: MasterEvent) -> Result<()> {
        match event {
            MasterEvent::ConnectionChanged(reachable) => {
                self.session
                    .push_event(TransportEvent::MasterServerConnection(reachable));
            }
            MasterEvent::GameList(entries) => {
                self.lobby = entries
                    .into_iter()
                    .map(|entry| LobbyEntry {
                        name: entry.name,
                        address: entry.address,
                        current_players: entry.current_player_count,
                        total_capacity: entry.total_capacity,
                    })
                    .collect();
            }
            MasterEvent::ClientConnectionResponse {
                host_address,
                success,
            } => {
                if self.pending_connect.take().is_none() {
                    debug!(%host_address, "Unsolicited connection response ignored");
                } else if success {
                    info!(%host_address, "Master server linked us to host");
                    self.session.join(self.config.client_port, host_address)?;
                } else {
                    info!(%host_address, "Master server refused the connection");
                    self.fail_connect();
                }
            }
            MasterEvent::HostConnectionResponse { client_address, .. } => {
                debug!(%client_address, "Expecting client");
            }
        }
        Ok(())
    }

    fn fail_connect(&mut self) {
        self.connect_failed = true;
        self.session.push_event(TransportEvent::ConnectFailed);
    }
}

impl Transport for IpTransport {
    #[instrument(level = "info", skip(self))]
    fn start_server(&mut self, name: &str) -> Result<()> {
        self.stop();
        self.session
            .host(self.config.mesh_port, self.config.server_port)?;
        let mesh_port = self.session.mesh_port().ok_or(NetError::NotStarted)?;
        let total_capacity = u8::try_from(self.config.max_nodes).unwrap_or(u8::MAX);
        self.master_mut()?.start_hosting(HostStatus {
            name: name.to_string(),
            game_client_port: mesh_port,
            total_capacity,
            current_player_count: 1,
            allows_joining: true,
            ..HostStatus::default()
        });
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    fn connect_client(&mut self, target: &str) -> Result<()> {
        let host_address = self.resolve(target)?;
        let client_port = self.session.start_node(self.config.client_port)?;
        self.connect_failed = false;
        self.master_mut()?
            .request_client_connection(host_address, client_port)?;
        self.pending_connect = Some(0.0);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    fn connect_failed(&self) -> bool {
        self.connect_failed || self.session.connect_failed()
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
        self.master_mut()?.enter_lobby();
        Ok(())
    }

    fn lobby_entry_count(&self) -> usize {
        self.lobby.len()
    }

    fn lobby_entry(&self, index: usize) -> Option<LobbyEntry> {
        self.lobby.get(index).cloned()
    }

    fn reliability(&self, node_id: usize) -> Option<&ReliabilitySystem> {
        self.session.reliability(node_id)
    }

    fn update(&mut self, dt: f32) -> Result<()> {
        let players = u8::try_from(self.session.connected_count()).unwrap_or(u8::MAX);
        if let Some(master) = &mut self.master {
            master.update_status(|status| status.current_player_count = players);
            master.update(dt)?;
        }
        while let Some(event) = self.master.as_mut().and_then(MasterServerConnection::poll_event) {
            self.on_master_event(event)?;
        }

        if let Some(waited) = &mut self.pending_connect {
            *waited += dt;
            if *waited > self.config.timeout.as_secs_f32() {
                warn!("Master server never answered the connection request");
                self.pending_connect = None;
                if let Some(master) = &mut self.master {
                    master.cancel_client_connection();
                }
                self.fail_connect();
            }
        }
        self.session.update(dt)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.session.poll_event()
    }

    fn stop(&mut self) {
        if let Some(mut master) = self.master.take() {
            master.stop();
        }
        self.lobby.clear();
        self.pending_connect = None;
        self.connect_failed = false;
        self.session.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobby_names_resolve_before_addresses() {
        let mut transport = IpTransport::new(TransportConfig::default(), MasterServerConfig::default());
        transport.lobby.push(LobbyEntry::new("den", Address::new(10, 0, 0, 1, 5000)));
        assert_eq!(transport.resolve("den").expect("by name"), Address::new(10, 0, 0, 1, 5000));
        assert_eq!(
            transport.resolve("10.0.0.2:6000").expect("literal"),
            Address::new(10, 0, 0, 2, 6000)
        );
        assert!(matches!(transport.resolve("elsewhere"), Err(NetError::UnknownHost(_))));
    }

    #[test]
    fn test_refused_connection_fails() {
        let mut transport = IpTransport::new(TransportConfig::default(), MasterServerConfig::default());
        transport.pending_connect = Some(0.0);
        transport
            .on_master_event(MasterEvent::ClientConnectionResponse {
                host_address: Address::new(10, 0, 0, 1, 5000),
                success: false,
            })
            .expect("handled");
        assert!(transport.connect_failed());
        assert_eq!(transport.poll_event(), Some(TransportEvent::ConnectFailed));
    }
}
