//! The relay role: answering CREATE, servicing EXTEND by splicing a
//! next-hop link in, and the exit side of BEGIN with its asynchronous
//! resolve + connect pipeline.

mod common;

use common::*;
use onion_core::config::Config;
use onion_core::netdir::RelayId;
use onion_core::node::{Action, Node};
use onion_core::policy::ExitPolicy;
use onion_core::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use onion_core::protocol::crypto::{CellDirection, HopCrypt};
use onion_core::protocol::handshake::{
    HopKeyMaterial, TapClientHandshake, CREATED_FAST_LEN, CREATED_PAYLOAD_LEN,
};
use rand::rngs::mock::StepRng;
use std::net::Ipv4Addr;

const NOW: u64 = 1_700_000_000;

/// A node acting as a relay, with an accepted, fully-handshaked link from
/// a client peer.
fn relay_node_with_link(onion_secret: u8) -> (Node, u64) {
    let mut node = Node::with_rng(
        Config::default(),
        Box::new(MockProvider::new(onion_secret)),
        Box::new(StepRng::new(0, 1)),
    );
    node.set_identity(RelayId::from([0x22; 20]));
    let link = node.accept_link(Ipv4Addr::new(10, 0, 0, 1), 40000, NOW);
    node.link_transport_ready(link, RelayId::from([0x11; 20]), NOW)
        .unwrap();
    node.take_outbound(link); // our VERSIONS
    complete_link_handshake(&mut node, link, NOW);
    node.take_outbound(link); // our NETINFO
    (node, link)
}

/// Send a relay cell the way an origin one hop away would.
fn send_from_client(
    node: &mut Node,
    link: u64,
    crypt: &mut HopCrypt,
    wire_id: u16,
    rc: &RelayCell,
) {
    let mut payload = rc.to_payload();
    crypt.stamp(CellDirection::Outbound, &mut payload).unwrap();
    crypt.apply_cipher(CellDirection::Outbound, &mut payload);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::RelayEarly, payload).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
}

/// Read back one relay cell the node sent toward the origin.
fn recv_at_client(node: &mut Node, link: u64, crypt: &mut HopCrypt) -> RelayCell {
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1, "expected exactly one cell, got {:?}", cells);
    assert_eq!(cells[0].command, CellCommand::Relay);
    let mut payload = cells[0].payload.clone();
    crypt.apply_cipher(CellDirection::Inbound, &mut payload);
    assert!(crypt.recognize(CellDirection::Inbound, &mut payload));
    RelayCell::from_payload(&payload).unwrap()
}

#[test]
fn create_is_answered_and_extend_splices_circuits() {
    let (mut node, link) = relay_node_with_link(0xE0);

    // Client's full handshake, sealed for our onion key.
    let mut client_provider = MockProvider::new(0x01);
    let (client_hs, sealed) =
        TapClientHandshake::start(&mut client_provider, &[0xE0]).unwrap();
    node.deliver_inbound(
        link,
        &Cell::new(5, CellCommand::Create, sealed).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();

    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::Created);
    let km = client_hs
        .finish(&client_provider, &cells[0].payload[..CREATED_PAYLOAD_LEN])
        .unwrap();
    let mut client_crypt = HopCrypt::new(&km);

    // EXTEND toward a new peer carries a CREATE sealed for that peer.
    let (client_hs2, sealed2) =
        TapClientHandshake::start(&mut client_provider, &[0xF0]).unwrap();
    let request = onion_core::protocol::handshake::ExtendRequest {
        addr: Ipv4Addr::new(10, 0, 0, 0x99),
        port: 9001,
        create_payload: sealed2,
        identity: RelayId::from([0x99; 20]),
    };
    let extend = RelayCell::new(RelayCommand::Extend, 0, request.to_bytes().unwrap()).unwrap();
    send_from_client(&mut node, link, &mut client_crypt, 5, &extend);

    // The relay dials the named peer...
    let actions = node.take_actions();
    let (link2, addr, port) = expect_open_transport(&actions);
    assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 0x99));
    assert_eq!(port, 9001);

    node.link_transport_ready(link2, RelayId::from([0x99; 20]), NOW)
        .unwrap();
    node.take_outbound(link2);
    complete_link_handshake(&mut node, link2, NOW);

    // ...and forwards the CREATE verbatim once the link opens.
    let cells = substantive_cells(&node.take_outbound(link2));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::Create);
    assert_eq!(cells[0].payload[0], 0xF0, "the sealed handshake is untouched");
    let next_wire = cells[0].circ_id;

    // The next relay answers; ours forwards it back as EXTENDED.
    let mut next_provider = MockProvider::new(0xF0);
    let (created2, _km) = onion_core::protocol::handshake::tap_server(
        &mut next_provider,
        &cells[0].payload[..onion_core::protocol::handshake::CREATE_PAYLOAD_LEN],
    )
    .unwrap();
    node.deliver_inbound(
        link2,
        &Cell::new(next_wire, CellCommand::Created, created2).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();

    let extended = recv_at_client(&mut node, link, &mut client_crypt);
    assert_eq!(extended.command, RelayCommand::Extended);
    client_hs2
        .finish(&client_provider, &extended.data[..CREATED_PAYLOAD_LEN])
        .expect("the spliced handshake must verify end to end");
}

#[test]
fn exit_begin_resolve_connect_pipeline() {
    let (mut node, link) = relay_node_with_link(0xE0);
    node.set_exit_policy(
        ExitPolicy::parse("reject 9.0.0.0/8:*, accept *:80, reject *:*").unwrap(),
    );

    // Fast handshake to keep the test small.
    let x = [5u8; 20];
    node.deliver_inbound(
        link,
        &Cell::new(7, CellCommand::CreateFast, x.to_vec()).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells[0].command, CellCommand::CreatedFast);
    let mut y = [0u8; 20];
    y.copy_from_slice(&cells[0].payload[..20]);
    let km = HopKeyMaterial::from_nonces(&x, &y);
    km.verify_kh(&cells[0].payload[20..CREATED_FAST_LEN]).unwrap();
    let mut client_crypt = HopCrypt::new(&km);

    // BEGIN on an allowed port starts a resolve.
    let begin =
        RelayCell::new(RelayCommand::Begin, 3, b"example.com:80\0".to_vec()).unwrap();
    send_from_client(&mut node, link, &mut client_crypt, 7, &begin);
    let tag = node
        .take_actions()
        .into_iter()
        .find_map(|a| match a {
            Action::ResolveHost { tag, host } => {
                assert_eq!(host, "example.com");
                Some(tag)
            }
            _ => None,
        })
        .expect("resolve requested");

    // Resolution feeds the TCP connect.
    node.resolve_completed(tag, Ok(Ipv4Addr::new(93, 184, 216, 34)), NOW);
    let tag2 = node
        .take_actions()
        .into_iter()
        .find_map(|a| match a {
            Action::ConnectTcp { tag, addr, port } => {
                assert_eq!(addr, Ipv4Addr::new(93, 184, 216, 34));
                assert_eq!(port, 80);
                Some(tag)
            }
            _ => None,
        })
        .expect("connect requested");

    // Success answers CONNECTED with the resolved address.
    node.exit_connect_completed(tag2, true, NOW);
    let connected = recv_at_client(&mut node, link, &mut client_crypt);
    assert_eq!(connected.command, RelayCommand::Connected);
    assert_eq!(connected.stream_id, 3);
    assert_eq!(connected.data, vec![93, 184, 216, 34]);

    // Client bytes are handed to the TCP side.
    let data = RelayCell::new(RelayCommand::Data, 3, b"GET".to_vec()).unwrap();
    send_from_client(&mut node, link, &mut client_crypt, 7, &data);
    let (circuit, stream) = node
        .take_actions()
        .into_iter()
        .find_map(|a| match a {
            Action::DeliverData { circuit, stream, data } => {
                assert_eq!(data, b"GET");
                Some((circuit, stream))
            }
            _ => None,
        })
        .expect("exit delivers toward TCP");

    // TCP bytes flow back as DATA toward the origin.
    node.stream_send_data(circuit, stream, b"response", NOW).unwrap();
    let reply = recv_at_client(&mut node, link, &mut client_crypt);
    assert_eq!(reply.command, RelayCommand::Data);
    assert_eq!(reply.data, b"response");
}

#[test]
fn exit_policy_refusals_send_end() {
    let (mut node, link) = relay_node_with_link(0xE0);
    node.set_exit_policy(
        ExitPolicy::parse("reject 9.0.0.0/8:*, accept *:80, reject *:*").unwrap(),
    );

    let x = [5u8; 20];
    node.deliver_inbound(
        link,
        &Cell::new(7, CellCommand::CreateFast, x.to_vec()).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let cells = substantive_cells(&node.take_outbound(link));
    let mut y = [0u8; 20];
    y.copy_from_slice(&cells[0].payload[..20]);
    let km = HopKeyMaterial::from_nonces(&x, &y);
    let mut client_crypt = HopCrypt::new(&km);

    // A port the policy flatly rejects: END EXITPOLICY, no resolve.
    let begin = RelayCell::new(RelayCommand::Begin, 4, b"example.com:25\0".to_vec()).unwrap();
    send_from_client(&mut node, link, &mut client_crypt, 7, &begin);
    assert!(node.take_actions().is_empty(), "no resolve for a rejected port");
    let end = recv_at_client(&mut node, link, &mut client_crypt);
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.data, vec![4], "EXITPOLICY reason byte");

    // A host that resolves into a rejected prefix: END EXITPOLICY carrying
    // the resolved address so the client can retry wisely.
    let begin = RelayCell::new(RelayCommand::Begin, 5, b"internal.example:80\0".to_vec()).unwrap();
    send_from_client(&mut node, link, &mut client_crypt, 7, &begin);
    let tag = node
        .take_actions()
        .into_iter()
        .find_map(|a| match a {
            Action::ResolveHost { tag, .. } => Some(tag),
            _ => None,
        })
        .expect("resolve requested");
    node.resolve_completed(tag, Ok(Ipv4Addr::new(9, 9, 9, 9)), NOW);
    let end = recv_at_client(&mut node, link, &mut client_crypt);
    assert_eq!(end.command, RelayCommand::End);
    assert_eq!(end.data, vec![4, 9, 9, 9, 9]);
}

#[test]
fn rotated_onion_key_still_unseals_old_creates() {
    let (mut node, link) = relay_node_with_link(0xE0);

    // Seal under the current key, then rotate before the CREATE arrives.
    let mut client_provider = MockProvider::new(0x01);
    let (client_hs, sealed) =
        TapClientHandshake::start(&mut client_provider, &[0xE0]).unwrap();
    node.rotate_onion_keys(NOW).unwrap();
    assert!(node
        .take_actions()
        .iter()
        .any(|a| matches!(a, Action::RespawnWorkers)));

    node.deliver_inbound(
        link,
        &Cell::new(5, CellCommand::Create, sealed).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::Created);
    client_hs
        .finish(&client_provider, &cells[0].payload[..CREATED_PAYLOAD_LEN])
        .expect("previous-generation key must still unseal");
}

#[test]
fn destroy_tears_down_relay_circuit() {
    let (mut node, link) = relay_node_with_link(0xE0);
    let x = [5u8; 20];
    node.deliver_inbound(
        link,
        &Cell::new(7, CellCommand::CreateFast, x.to_vec()).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    node.take_outbound(link);

    node.deliver_inbound(
        link,
        &Cell::new(7, CellCommand::Destroy, vec![3]).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();

    // The circuit is gone: further relay cells on its id are ignored and
    // nothing is echoed back.
    node.deliver_inbound(
        link,
        &Cell::new(7, CellCommand::Relay, vec![1; 509]).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    assert!(substantive_cells(&node.take_outbound(link)).is_empty());
}
