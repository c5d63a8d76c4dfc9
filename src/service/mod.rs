//! # Matchmaking Service
//!
//! The master server and the connection hosts and clients keep to it.

pub mod master_connection;
pub mod master_messages;
pub mod master_server;

pub use master_connection::{MasterEvent, MasterServerConnection};
pub use master_messages::{GameListEntry, HostStatus, MasterMessage};
pub use master_server::MasterServer;
