//! # Master Server Messages
//!
//! The matchmaking catalogue and its datagram framing.
//!
//! ## Datagram Format
//! ```text
//! [CRC32C(4)] [ProtocolId(4)] [Type(1)] [Bit-packed payload(N)]
//! ```
//!
//! The CRC covers everything after the CRC field and is computed with the
//! protocol ID standing in for the CRC itself, so a datagram from a program
//! speaking another protocol never validates.

use bytes::{Buf, BufMut, BytesMut};

use crate::core::address::Address;
use crate::core::stream::{ReadStream, Stream, WriteStream};
use crate::error::{NetError, Result};
use crate::utils::checksum::{self, CHECKSUM_SIZE};

/// CRC, protocol ID and type byte
pub const DATA_HEADER_SIZE: usize = CHECKSUM_SIZE + 4 + 1;

/// Largest master-server datagram
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Most hosts one game list can name
pub const MAX_GAME_LIST_ENTRIES: usize = 255;

pub const PING: u8 = 0;
pub const PONG: u8 = 1;
pub const GAME_HOST_STATUS_UPDATE: u8 = 2;
pub const GAME_LIST_REQUEST: u8 = 3;
pub const GAME_LIST_RESPONSE: u8 = 4;
pub const GAME_CLIENT_CONNECTION_REQUEST: u8 = 5;
pub const GAME_CLIENT_CONNECTION_RESPONSE: u8 = 6;
pub const GAME_HOST_CONNECTION_RESPONSE: u8 = 7;

/// What a host reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStatus {
    pub name: String,
    /// Application-defined session state
    pub state: u8,
    /// Port clients join, the host's mesh
    pub game_client_port: u16,
    pub total_capacity: u8,
    pub current_player_count: u8,
    pub allows_joining: bool,
}

impl HostStatus {
    fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
        stream.serialize_string(&mut self.name)?;
        stream.serialize_byte(&mut self.state)?;
        stream.serialize_short(&mut self.game_client_port)?;
        stream.serialize_byte(&mut self.total_capacity)?;
        stream.serialize_byte(&mut self.current_player_count)?;
        stream.serialize_bool(&mut self.allows_joining)
    }
}

/// One host in a game list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameListEntry {
    /// The host's address as seen by the master server
    pub address: Address,
    pub name: String,
    pub state: u8,
    pub total_capacity: u8,
    pub current_player_count: u8,
    pub allows_joining: bool,
}

impl GameListEntry {
    pub(crate) fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
        serialize_address(stream, &mut self.address)?;
        stream.serialize_string(&mut self.name)?;
        stream.serialize_byte(&mut self.state)?;
        stream.serialize_byte(&mut self.total_capacity)?;
        stream.serialize_byte(&mut self.current_player_count)?;
        stream.serialize_bool(&mut self.allows_joining)
    }
}

fn serialize_address(stream: &mut dyn Stream, address: &mut Address) -> Result<()> {
    let mut ip = address.ip();
    let mut port = address.port();
    stream.serialize_u32(&mut ip)?;
    stream.serialize_short(&mut port)?;
    *address = Address::from_raw(ip, port);
    Ok(())
}

/// Every message exchanged with the master server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterMessage {
    Ping,
    Pong,
    GameHostStatusUpdate(HostStatus),
    GameListRequest,
    GameListResponse(Vec<GameListEntry>),
    GameClientConnectionRequest {
        host_address: Address,
        client_port: u16,
    },
    /// Sent to the client: where to join, on success
    GameClientConnectionResponse {
        host_address: Address,
        success: bool,
    },
    /// Sent to the host: who is about to join
    GameHostConnectionResponse {
        client_address: Address,
        success: bool,
    },
}

impl MasterMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Ping => PING,
            Self::Pong => PONG,
            Self::GameHostStatusUpdate(_) => GAME_HOST_STATUS_UPDATE,
            Self::GameListRequest => GAME_LIST_REQUEST,
            Self::GameListResponse(_) => GAME_LIST_RESPONSE,
            Self::GameClientConnectionRequest { .. } => GAME_CLIENT_CONNECTION_REQUEST,
            Self::GameClientConnectionResponse { .. } => GAME_CLIENT_CONNECTION_RESPONSE,
            Self::GameHostConnectionResponse { .. } => GAME_HOST_CONNECTION_RESPONSE,
        }
    }

    /// Default-valued message of `message_type`, ready to be read into
    pub fn empty(message_type: u8) -> Result<Self> {
        Ok(match message_type {
            PING => Self::Ping,
            PONG => Self::Pong,
            GAME_HOST_STATUS_UPDATE => Self::GameHostStatusUpdate(HostStatus::default()),
            GAME_LIST_REQUEST => Self::GameListRequest,
            GAME_LIST_RESPONSE => Self::GameListResponse(Vec::new()),
            GAME_CLIENT_CONNECTION_REQUEST => Self::GameClientConnectionRequest {
                host_address: Address::default(),
                client_port: 0,
            },
            GAME_CLIENT_CONNECTION_RESPONSE => Self::GameClientConnectionResponse {
                host_address: Address::default(),
                success: false,
            },
            GAME_HOST_CONNECTION_RESPONSE => Self::GameHostConnectionResponse {
                client_address: Address::default(),
                success: false,
            },
            other => return Err(NetError::UnknownMessageType(other)),
        })
    }

    pub fn serialize(&mut self, stream: &mut dyn Stream) -> Result<()> {
        match self {
            Self::Ping | Self::Pong | Self::GameListRequest => Ok(()),
            Self::GameHostStatusUpdate(status) => status.serialize(stream),
            Self::GameListResponse(entries) => {
                let mut count = i32::try_from(entries.len()).unwrap_or(i32::MAX);
                stream.serialize_integer(&mut count, 0, MAX_GAME_LIST_ENTRIES as i32)?;
                if stream.is_reading() {
                    entries.clear();
                    entries.resize_with(count as usize, GameListEntry::default);
                }
                for entry in entries.iter_mut() {
                    entry.serialize(stream)?;
                }
                Ok(())
            }
            Self::GameClientConnectionRequest {
                host_address,
                client_port,
            } => {
                serialize_address(stream, host_address)?;
                stream.serialize_short(client_port)
            }
            Self::GameClientConnectionResponse {
                host_address: address,
                success,
            }
            | Self::GameHostConnectionResponse {
                client_address: address,
                success,
            } => {
                serialize_address(stream, address)?;
                stream.serialize_bool(success)
            }
        }
    }
}

/// Whether `data` is long enough, carries `protocol_id` and passes the CRC
pub fn validate_data_header(protocol_id: u32, data: &[u8]) -> bool {
    if data.len() < DATA_HEADER_SIZE {
        return false;
    }
    let mut header = &data[CHECKSUM_SIZE..];
    header.get_u32() == protocol_id && checksum::verify(data, protocol_id)
}

/// Frame `message` as a datagram
pub fn encode_datagram(protocol_id: u32, message: &mut MasterMessage) -> Result<Vec<u8>> {
    let mut stream = WriteStream::new(MAX_DATAGRAM_SIZE - DATA_HEADER_SIZE);
    message.serialize(&mut stream)?;

    let mut packet = BytesMut::with_capacity(DATA_HEADER_SIZE + stream.bytes_written());
    packet.put_u32(0);
    packet.put_u32(protocol_id);
    packet.put_u8(message.message_type());
    packet.put_slice(stream.as_bytes());
    checksum::stamp(&mut packet, protocol_id);
    Ok(packet.to_vec())
}

/// Parse a datagram that passed [`validate_data_header`]
pub fn decode_datagram(protocol_id: u32, data: &[u8]) -> Result<MasterMessage> {
    if !validate_data_header(protocol_id, data) {
        return Err(NetError::InvalidHeader);
    }
    let mut message = MasterMessage::empty(data[DATA_HEADER_SIZE - 1])?;
    let mut stream = ReadStream::new(&data[DATA_HEADER_SIZE..]);
    message.serialize(&mut stream)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::MeasureStream;

    const PROTOCOL_ID: u32 = 0x00AB_CDEF;

    #[test]
    fn test_header_layout() {
        let packet = encode_datagram(PROTOCOL_ID, &mut MasterMessage::Ping).expect("encode");
        assert_eq!(packet.len(), DATA_HEADER_SIZE);
        assert_eq!(&packet[4..], &[0x00, 0xAB, 0xCD, 0xEF, PING]);
        assert!(validate_data_header(PROTOCOL_ID, &packet));
        assert!(!validate_data_header(PROTOCOL_ID + 1, &packet));
        assert!(!validate_data_header(PROTOCOL_ID, &packet[..8]));
    }

    #[test]
    fn test_status_update_decodes() {
        let mut message = MasterMessage::GameHostStatusUpdate(HostStatus {
            name: "den".into(),
            state: 2,
            game_client_port: 30000,
            total_capacity: 4,
            current_player_count: 1,
            allows_joining: true,
        });
        let packet = encode_datagram(PROTOCOL_ID, &mut message.clone()).expect("encode");
        assert_eq!(decode_datagram(PROTOCOL_ID, &packet).expect("decode"), message);

        let mut measure = MeasureStream::new();
        message.serialize(&mut measure).expect("measure");
        assert_eq!(packet.len(), DATA_HEADER_SIZE + measure.bytes_required());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut packet = encode_datagram(PROTOCOL_ID, &mut MasterMessage::Pong).expect("encode");
        packet[8] = 42;
        checksum::stamp(&mut packet, PROTOCOL_ID);
        assert!(matches!(
            decode_datagram(PROTOCOL_ID, &packet),
            Err(NetError::UnknownMessageType(42))
        ));
    }
}
