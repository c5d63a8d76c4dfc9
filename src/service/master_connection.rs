//! # Master Server Connection
//!
//! Client side of the matchmaking protocol, used by hosts and by browsing
//! clients alike. Once per update interval a host sends its status and a
//! client sends a ping; while in the lobby a game list is requested as well.
//! The server is considered reachable while its answers keep arriving.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};

use tracing::{debug, info, instrument, warn};

use crate::config::MasterServerConfig;
use crate::core::address::Address;
use crate::core::socket::{Socket, SocketOptions, MAX_DATAGRAM_SIZE};
use crate::error::{NetError, Result};
use crate::service::master_messages::{
    decode_datagram, encode_datagram, GameListEntry, HostStatus, MasterMessage,
};

/// Notifications from [`MasterServerConnection::poll_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    /// The server became reachable or unreachable
    ConnectionChanged(bool),
    GameList(Vec<GameListEntry>),
    /// Answer to [`MasterServerConnection::request_client_connection`]
    ClientConnectionResponse { host_address: Address, success: bool },
    /// A client was linked to this host
    HostConnectionResponse { client_address: Address, success: bool },
}

/// Link to one master server
#[derive(Debug)]
pub struct MasterServerConnection {
    protocol_id: u32,
    server_address: Address,
    update_rate: f32,
    timeout: f32,
    socket: Option<Socket>,
    host_status: Option<HostStatus>,
    in_lobby: bool,
    reachable: bool,
    send_accumulator: f32,
    time_since_heard: f32,
    /// Link request resent with every heartbeat until answered
    pending_request: Option<(Address, u16)>,
    game_list: Vec<GameListEntry>,
    events: VecDeque<MasterEvent>,
}

impl MasterServerConnection {
    pub fn new(protocol_id: u32, server_address: Address, update_rate: f32, timeout: f32) -> Self {
        Self {
            protocol_id,
            server_address,
            update_rate,
            timeout,
            socket: None,
            host_status: None,
            in_lobby: false,
            reachable: false,
            send_accumulator: 0.0,
            time_since_heard: 0.0,
            pending_request: None,
            game_list: Vec::new(),
            events: VecDeque::new(),
        }
    }

    /// Resolve the configured server address, which may be a host name
    pub fn from_config(protocol_id: u32, config: &MasterServerConfig) -> Result<Self> {
        let server_address = resolve(&config.address, config.port)?;
        Ok(Self::new(
            protocol_id,
            server_address,
            config.update_rate.as_secs_f32(),
            config.timeout.as_secs_f32(),
        ))
    }

    #[instrument(level = "info", skip(self), fields(server = %self.server_address))]
    pub fn start(&mut self, port: u16) -> Result<()> {
        let socket = Socket::open(port, SocketOptions::default())?;
        info!(port = socket.port(), "Master server connection started");
        self.socket = Some(socket);
        self.send_accumulator = self.update_rate;
        self.time_since_heard = 0.0;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("Master server connection stopped");
        }
        self.host_status = None;
        self.in_lobby = false;
        self.reachable = false;
        self.pending_request = None;
        self.game_list.clear();
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn server_address(&self) -> Address {
        self.server_address
    }

    /// Whether the server answered within the timeout
    pub fn is_connected(&self) -> bool {
        self.reachable
    }

    /// Report `status` from now on instead of pinging
    pub fn start_hosting(&mut self, status: HostStatus) {
        self.host_status = Some(status);
        self.send_accumulator = self.update_rate;
    }

    /// Change the reported status; ignored unless hosting
    pub fn update_status<F>(&mut self, mutator: F)
    where
        F: FnOnce(&mut HostStatus),
    {
        if let Some(status) = &mut self.host_status {
            mutator(status);
        }
    }

    pub fn stop_hosting(&mut self) {
        self.host_status = None;
    }

    pub fn is_hosting(&self) -> bool {
        self.host_status.is_some()
    }

    pub fn enter_lobby(&mut self) {
        self.in_lobby = true;
        self.send_accumulator = self.update_rate;
    }

    pub fn leave_lobby(&mut self) {
        self.in_lobby = false;
    }

    /// Latest game list
    pub fn game_list(&self) -> &[GameListEntry] {
        &self.game_list
    }

    /// Ask the server to link this client to the host at `host_address`
    ///
    /// `client_port` is the port the host should expect the client's mesh
    /// traffic from. A heartbeat goes out first so the server knows this
    /// client, and the request is repeated every `update_rate` until a
    /// response arrives or [`MasterServerConnection::cancel_client_connection`]
    /// is called.
    pub fn request_client_connection(&mut self, host_address: Address, client_port: u16) -> Result<()> {
        info!(%host_address, client_port, "Requesting connection to host");
        self.send(self.heartbeat())?;
        self.pending_request = Some((host_address, client_port));
        self.send(MasterMessage::GameClientConnectionRequest {
            host_address,
            client_port,
        })?;
        self.send_accumulator = 0.0;
        Ok(())
    }

    pub fn cancel_client_connection(&mut self) {
        self.pending_request = None;
    }

    pub fn is_requesting_connection(&self) -> bool {
        self.pending_request.is_some()
    }

    pub fn poll_event(&mut self) -> Option<MasterEvent> {
        self.events.pop_front()
    }

    pub fn update(&mut self, dt: f32) -> Result<()> {
        if self.socket.is_none() {
            return Ok(());
        }
        self.receive()?;

        self.send_accumulator += dt;
        if self.send_accumulator >= self.update_rate {
            self.send_accumulator = 0.0;
            self.send(self.heartbeat())?;
            if self.in_lobby {
                self.send(MasterMessage::GameListRequest)?;
            }
            if let Some((host_address, client_port)) = self.pending_request {
                self.send(MasterMessage::GameClientConnectionRequest {
                    host_address,
                    client_port,
                })?;
            }
        }

        self.time_since_heard += dt;
        if self.reachable && self.time_since_heard > self.timeout {
            warn!(server = %self.server_address, "Master server unreachable");
            self.set_reachable(false);
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<()> {
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let received = match &self.socket {
                Some(socket) => socket.receive(&mut buffer)?,
                None => None,
            };
            let Some((sender, size)) = received else {
                return Ok(());
            };
            if sender != self.server_address {
                debug!(%sender, "Ignored datagram from outside the master server");
                continue;
            }
            match decode_datagram(self.protocol_id, &buffer[..size]) {
                Ok(message) => self.process(message),
                Err(e) => debug!(size, error = %e, "Dropped master server datagram"),
            }
        }
    }

    fn process(&mut self, message: MasterMessage) {
        self.time_since_heard = 0.0;
        if !self.reachable {
            info!(server = %self.server_address, "Master server reachable");
            self.set_reachable(true);
        }
        match message {
            MasterMessage::Pong => {}
            MasterMessage::GameListResponse(entries) => {
                self.game_list = entries.clone();
                self.events.push_back(MasterEvent::GameList(entries));
            }
            MasterMessage::GameClientConnectionResponse {
                host_address,
                success,
            } => {
                self.pending_request = None;
                self.events.push_back(MasterEvent::ClientConnectionResponse {
                    host_address,
                    success,
                });
            }
            MasterMessage::GameHostConnectionResponse {
                client_address,
                success,
            } => {
                info!(%client_address, success, "Client linked by master server");
                self.events.push_back(MasterEvent::HostConnectionResponse {
                    client_address,
                    success,
                });
            }
            other => debug!(message_type = other.message_type(), "Unexpected master server message"),
        }
    }

    fn heartbeat(&self) -> MasterMessage {
        match &self.host_status {
            Some(status) => MasterMessage::GameHostStatusUpdate(status.clone()),
            None => MasterMessage::Ping,
        }
    }

    fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
        self.events.push_back(MasterEvent::ConnectionChanged(reachable));
    }

    fn send(&mut self, mut message: MasterMessage) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(NetError::NotStarted)?;
        let packet = encode_datagram(self.protocol_id, &mut message)?;
        if !socket.send(self.server_address, &packet)? {
            debug!(message_type = message.message_type(), "Master server datagram dropped, socket buffer full");
        }
        Ok(())
    }
}

/// Resolve `host` to an IPv4 address, by literal first and then by lookup
pub fn resolve(host: &str, port: u16) -> Result<Address> {
    if let Ok(address) = format!("{host}:{port}").parse::<Address>() {
        return Ok(address);
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|_| NetError::UnknownHost(host.to_string()))?
        .find_map(|address| match address {
            SocketAddr::V4(v4) => Some(Address::from(v4)),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| NetError::UnknownHost(host.to_string()))
}
