//! Integration tests for matchmaking through the master server

#![allow(clippy::expect_used, clippy::unwrap_used)]

use drudgenet::core::address::Address;
use drudgenet::service::master_connection::{MasterEvent, MasterServerConnection};
use drudgenet::service::master_messages::{
    decode_datagram, encode_datagram, validate_data_header, HostStatus, MasterMessage,
};
use drudgenet::service::master_server::MasterServer;
use std::time::Duration;

const PROTOCOL_ID: u32 = 0x4D53_5652;

fn datagram(mut message: MasterMessage) -> Vec<u8> {
    encode_datagram(PROTOCOL_ID, &mut message).expect("encode")
}

fn host_status(port: u16) -> HostStatus {
    HostStatus {
        name: "arena".into(),
        state: 1,
        game_client_port: port,
        total_capacity: 4,
        current_player_count: 1,
        allows_joining: true,
    }
}

#[test]
fn test_unregistered_client_is_ignored() {
    let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
    let host = Address::new(10, 0, 0, 1, 7000);
    let client = Address::new(10, 0, 0, 2, 7001);
    server.process_datagram(host, &datagram(MasterMessage::GameHostStatusUpdate(host_status(9000))));

    let replies = server.process_datagram(
        client,
        &datagram(MasterMessage::GameClientConnectionRequest {
            host_address: host,
            client_port: 9100,
        }),
    );
    assert!(replies.is_empty());
    assert!(!server.is_client_registered(client));
}

#[test]
fn test_link_answers_host_then_client() {
    let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
    let host = Address::new(10, 0, 0, 1, 7000);
    let client = Address::new(10, 0, 0, 2, 7001);

    let replies =
        server.process_datagram(host, &datagram(MasterMessage::GameHostStatusUpdate(host_status(9000))));
    assert_eq!(replies, vec![(host, MasterMessage::Pong)]);
    assert_eq!(server.host(host).expect("host").status.name, "arena");

    let replies = server.process_datagram(client, &datagram(MasterMessage::Ping));
    assert_eq!(replies, vec![(client, MasterMessage::Pong)]);
    assert!(server.is_client_registered(client));

    let replies = server.process_datagram(
        client,
        &datagram(MasterMessage::GameClientConnectionRequest {
            host_address: host,
            client_port: 9100,
        }),
    );
    assert_eq!(
        replies,
        vec![
            (
                host,
                MasterMessage::GameHostConnectionResponse {
                    client_address: Address::new(10, 0, 0, 2, 9100),
                    success: true,
                },
            ),
            (
                client,
                MasterMessage::GameClientConnectionResponse {
                    host_address: Address::new(10, 0, 0, 1, 9000),
                    success: true,
                },
            ),
        ]
    );
}

#[test]
fn test_unknown_host_is_refused() {
    let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
    let client = Address::new(10, 0, 0, 2, 7001);
    let missing = Address::new(10, 0, 0, 9, 7000);
    server.process_datagram(client, &datagram(MasterMessage::GameListRequest));

    let replies = server.process_datagram(
        client,
        &datagram(MasterMessage::GameClientConnectionRequest {
            host_address: missing,
            client_port: 9100,
        }),
    );
    assert_eq!(
        replies,
        vec![(
            client,
            MasterMessage::GameClientConnectionResponse {
                host_address: missing,
                success: false,
            },
        )]
    );
}

#[test]
fn test_game_list_names_every_host() {
    let mut server = MasterServer::new(PROTOCOL_ID, 10.0);
    for last in 1..=3 {
        let host = Address::new(10, 0, 0, last, 7000);
        server.process_datagram(host, &datagram(MasterMessage::GameHostStatusUpdate(host_status(9000))));
    }
    let client = Address::new(10, 0, 1, 1, 7001);
    let replies = server.process_datagram(client, &datagram(MasterMessage::GameListRequest));
    let [(to, MasterMessage::GameListResponse(entries))] = replies.as_slice() else {
        panic!("expected one game list, got {replies:?}");
    };
    assert_eq!(*to, client);
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.name == "arena" && e.allows_joining));
}

#[test]
fn test_silent_hosts_are_forgotten() {
    let mut server = MasterServer::new(PROTOCOL_ID, 1.0);
    let host = Address::new(10, 0, 0, 1, 7000);
    server.process_datagram(host, &datagram(MasterMessage::GameHostStatusUpdate(host_status(9000))));
    assert_eq!(server.host_count(), 1);
    for _ in 0..12 {
        server.update(0.1).expect("update");
    }
    assert_eq!(server.host_count(), 0);
}

#[test]
fn test_any_flipped_bit_fails_validation() {
    let packet = datagram(MasterMessage::GameHostStatusUpdate(host_status(9000)));
    assert!(validate_data_header(PROTOCOL_ID, &packet));
    assert!(!validate_data_header(PROTOCOL_ID + 1, &packet));

    for byte in 4..packet.len() {
        for bit in 0..8 {
            let mut corrupted = packet.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                !validate_data_header(PROTOCOL_ID, &corrupted),
                "flip at byte {byte} bit {bit} accepted"
            );
            assert!(decode_datagram(PROTOCOL_ID, &corrupted).is_err());
        }
    }
}

#[test]
fn test_host_and_client_linked_over_udp() {
    let mut server = MasterServer::new(PROTOCOL_ID, 5.0);
    server.start(0).expect("server bind");
    let server_address = Address::loopback(server.port().expect("port"));

    let mut host = MasterServerConnection::new(PROTOCOL_ID, server_address, 0.05, 2.0);
    let mut client = MasterServerConnection::new(PROTOCOL_ID, server_address, 0.05, 2.0);
    host.start(0).expect("host bind");
    client.start(0).expect("client bind");
    host.start_hosting(host_status(9000));
    client.enter_lobby();

    let mut host_events = Vec::new();
    let mut client_events = Vec::new();
    let mut requested = false;
    for _ in 0..300 {
        host.update(0.05).expect("host update");
        client.update(0.05).expect("client update");
        server.update(0.05).expect("server update");
        host_events.extend(std::iter::from_fn(|| host.poll_event()));
        client_events.extend(std::iter::from_fn(|| client.poll_event()));

        if !requested {
            if let Some(entry) = client.game_list().first() {
                client
                    .request_client_connection(entry.address, 9100)
                    .expect("request");
                requested = true;
            }
        }
        let linked = client_events
            .iter()
            .any(|e| matches!(e, MasterEvent::ClientConnectionResponse { .. }))
            && host_events
                .iter()
                .any(|e| matches!(e, MasterEvent::HostConnectionResponse { .. }));
        if linked {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(host.is_connected());
    assert!(client.is_connected());
    assert_eq!(host_events.first(), Some(&MasterEvent::ConnectionChanged(true)));
    assert!(client_events.contains(&MasterEvent::ClientConnectionResponse {
        host_address: Address::loopback(9000),
        success: true,
    }));
    assert!(host_events.contains(&MasterEvent::HostConnectionResponse {
        client_address: Address::loopback(9100),
        success: true,
    }));
}
