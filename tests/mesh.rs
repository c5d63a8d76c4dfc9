//! Integration tests for mesh membership over real UDP sockets

#![allow(clippy::expect_used, clippy::unwrap_used)]

use drudgenet::core::address::Address;
use drudgenet::transport::mesh::{Mesh, MeshConfig};
use drudgenet::transport::node::{Node, NodeEvent, NodeStatus};
use std::time::Duration;

const PROTOCOL_ID: u32 = 0x4D45_5348;

fn config() -> MeshConfig {
    MeshConfig {
        protocol_id: PROTOCOL_ID,
        send_rate: 0.05,
        timeout: 2.0,
        max_nodes: 3,
    }
}

fn tick(mesh: &mut Mesh, nodes: &mut [Node]) {
    mesh.update(0.05).expect("mesh update");
    for node in nodes.iter_mut() {
        node.update(0.05).expect("node update");
    }
    std::thread::sleep(Duration::from_millis(5));
}

fn drain(node: &mut Node) -> Vec<NodeEvent> {
    std::iter::from_fn(|| node.poll_event()).collect()
}

#[test]
fn test_nodes_join_and_mirror_the_table() {
    let mut mesh = Mesh::new(config());
    mesh.start(0).expect("mesh bind");
    let mesh_address = Address::loopback(mesh.port().expect("mesh port"));

    let mut nodes = vec![Node::new(config()), Node::new(config())];
    for node in &mut nodes {
        node.start(0).expect("node bind");
        node.join(mesh_address).expect("join");
        assert_eq!(node.status(), NodeStatus::Joining);
    }

    let mut events = vec![Vec::new(), Vec::new()];
    for _ in 0..200 {
        tick(&mut mesh, &mut nodes);
        for (node, seen) in nodes.iter_mut().zip(events.iter_mut()) {
            seen.extend(drain(node));
        }
        let mirrored = nodes
            .iter()
            .all(|n| n.is_connected() && n.is_node_connected(0) && n.is_node_connected(1));
        if mirrored {
            break;
        }
    }

    assert_eq!(mesh.connected_count(), 2);
    let mut ids: Vec<usize> = nodes.iter().map(|n| n.local_node_id().expect("id")).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1]);

    for (node, seen) in nodes.iter().zip(&events) {
        assert_eq!(node.max_nodes(), 3);
        assert_eq!(seen.first(), Some(&NodeEvent::Joined));
        for id in 0..2 {
            // mesh on loopback, so addresses come through unchanged
            assert_eq!(node.node_address(id), mesh.node_address(id));
            let fired = seen
                .iter()
                .filter(|e| **e == NodeEvent::NodeConnected(id))
                .count();
            assert_eq!(fired, 1, "NodeConnected({id}) once");
        }
        assert!(!node.is_node_connected(2));
    }
}

#[test]
fn test_data_flows_between_joined_nodes() {
    let mut mesh = Mesh::new(config());
    mesh.start(0).expect("mesh bind");
    let mesh_address = Address::loopback(mesh.port().expect("mesh port"));

    let mut nodes = vec![Node::new(config()), Node::new(config())];
    for node in &mut nodes {
        node.start(0).expect("node bind");
        node.join(mesh_address).expect("join");
    }
    for _ in 0..200 {
        tick(&mut mesh, &mut nodes);
        if nodes.iter().all(|n| n.is_node_connected(0) && n.is_node_connected(1)) {
            break;
        }
    }

    let sender = nodes[0].local_node_id().expect("id");
    let target = nodes[1].local_node_id().expect("id");
    assert!(nodes[0].send_packet(target, b"hello").expect("send"));

    let mut received = None;
    for _ in 0..100 {
        tick(&mut mesh, &mut nodes);
        if let Some(packet) = nodes[1].receive_packet() {
            received = Some(packet);
            break;
        }
    }
    assert_eq!(received, Some((sender, b"hello".to_vec())));
}

#[test]
fn test_join_fails_without_a_mesh() {
    // bind then drop to get a port nobody answers on
    let silent_port = {
        let mut mesh = Mesh::new(config());
        mesh.start(0).expect("bind");
        mesh.port().expect("port")
    };

    let mut node = Node::new(MeshConfig {
        timeout: 0.2,
        ..config()
    });
    node.start(0).expect("node bind");
    node.join(Address::loopback(silent_port)).expect("join");

    for _ in 0..10 {
        node.update(0.05).ok();
    }
    assert_eq!(node.status(), NodeStatus::JoinFail);
    assert!(drain(&mut node).contains(&NodeEvent::JoinFailed));
    assert_eq!(node.local_node_id(), None);
}

#[test]
fn test_join_before_start_is_refused() {
    let mut node = Node::new(config());
    assert!(node.join(Address::loopback(40000)).is_err());
}
