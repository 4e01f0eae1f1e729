//! Stream attachment, the BEGIN/CONNECTED/DATA exchange end to end over
//! scripted relays, and circuit-level SENDME cadence.

mod common;

use common::*;
use onion_core::config::Config;
use onion_core::events::{Event, StreamStatus};
use onion_core::node::Action;
use onion_core::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};

const NOW: u64 = 1_700_000_000;

#[test]
fn exit_policy_gates_stream_attachment() {
    let (mut node, mut relays, link, wire_id, circuit) =
        build_three_hop_circuit(Config::default(), "reject *:25, accept *:*", NOW);
    node.take_events();
    node.take_actions();

    // Port 25: the only exit rejects it. No BEGIN may go out; the request
    // fails fast with EXITPOLICY.
    node.open_stream("example.com", 25, NOW);
    assert!(
        substantive_cells(&node.take_outbound(link)).is_empty(),
        "no BEGIN for a rejected port"
    );
    let failed = node.take_events().into_iter().any(|e| {
        matches!(e, Event::Stream { status: StreamStatus::Failed, ref reason, .. }
            if reason.as_deref() == Some("EXITPOLICY"))
    });
    assert!(failed, "expected STREAM FAILED EXITPOLICY");

    // Port 80: attaches to the open circuit and sends BEGIN.
    node.open_stream("example.com", 80, NOW);
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::Relay);

    let mut payload = cells[0].payload.clone();
    assert!(!relays[0].peel(&mut payload));
    assert!(!relays[1].peel(&mut payload));
    assert!(relays[2].peel(&mut payload), "BEGIN is for the exit");
    let rc = RelayCell::from_payload(&payload).unwrap();
    assert_eq!(rc.command, RelayCommand::Begin);
    assert_ne!(rc.stream_id, 0);
    assert_eq!(rc.data, b"example.com:80\0");

    let statuses: Vec<StreamStatus> = node
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Stream { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![StreamStatus::New, StreamStatus::SentConnect]);

    // CONNECTED comes back through all three layers.
    let stream_id = rc.stream_id;
    let connected =
        RelayCell::new(RelayCommand::Connected, stream_id, vec![93, 184, 216, 34]).unwrap();
    let mut wrapped = relays[2].wrap_reply(&connected);
    relays[1].add_layer(&mut wrapped);
    relays[0].add_layer(&mut wrapped);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let connected_seen = node.take_events().into_iter().any(|e| {
        matches!(e, Event::Stream { status: StreamStatus::Connected, stream, .. }
            if stream == stream_id)
    });
    assert!(connected_seen);

    // Application bytes go out as a DATA cell addressed to the exit.
    node.stream_send_data(circuit, stream_id, b"GET / HTTP/1.0\r\n\r\n", NOW)
        .unwrap();
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    let mut payload = cells[0].payload.clone();
    assert!(!relays[0].peel(&mut payload));
    assert!(!relays[1].peel(&mut payload));
    assert!(relays[2].peel(&mut payload));
    let rc = RelayCell::from_payload(&payload).unwrap();
    assert_eq!(rc.command, RelayCommand::Data);
    assert_eq!(rc.data, b"GET / HTTP/1.0\r\n\r\n");

    // Response bytes come back and are handed to the application.
    let response = RelayCell::new(RelayCommand::Data, stream_id, b"hello".to_vec()).unwrap();
    let mut wrapped = relays[2].wrap_reply(&response);
    relays[1].add_layer(&mut wrapped);
    relays[0].add_layer(&mut wrapped);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let delivered = node.take_actions().into_iter().any(|a| {
        matches!(a, Action::DeliverData { circuit: c, stream, ref data }
            if c == circuit && stream == stream_id && data == b"hello")
    });
    assert!(delivered, "DATA must reach the local endpoint");
}

#[test]
fn end_cell_is_sent_once() {
    let (mut node, mut relays, link, _wire, circuit) =
        build_three_hop_circuit(Config::default(), "accept *:*", NOW);
    node.open_stream("example.com", 80, NOW);
    let cells = substantive_cells(&node.take_outbound(link));
    let mut payload = cells[0].payload.clone();
    relays[0].peel(&mut payload);
    relays[1].peel(&mut payload);
    relays[2].peel(&mut payload);
    let stream_id = RelayCell::from_payload(&payload).unwrap().stream_id;

    // Close twice; exactly one END goes out.
    node.stream_close(circuit, stream_id, NOW).unwrap();
    node.stream_close(circuit, stream_id, NOW).unwrap();
    let ends: Vec<RelayCell> = substantive_cells(&node.take_outbound(link))
        .into_iter()
        .filter_map(|cell| {
            let mut payload = cell.payload;
            if relays[0].peel(&mut payload) || relays[1].peel(&mut payload) || relays[2].peel(&mut payload)
            {
                RelayCell::from_payload(&payload).ok()
            } else {
                None
            }
        })
        .filter(|rc| rc.command == RelayCommand::End)
        .collect();
    assert_eq!(ends.len(), 1, "END is single-shot per stream");
}

#[test]
fn circuit_sendme_after_increment_cells() {
    let mut cfg = Config::default();
    cfg.circuit_window_increment = 10;
    let (mut node, mut relay, link, wire_id, _circuit) = build_one_hop_circuit(cfg, NOW);
    node.take_outbound(link);

    let mut sendmes = 0;
    for i in 1..=11u32 {
        let data = RelayCell::new(RelayCommand::Data, 9, vec![0xDD; 100]).unwrap();
        let payload = relay.wrap_reply(&data);
        node.deliver_inbound(
            link,
            &Cell::new(wire_id, CellCommand::Relay, payload).unwrap().to_bytes(),
            NOW,
        )
        .unwrap();

        for cell in substantive_cells(&node.take_outbound(link)) {
            let mut payload = cell.payload;
            assert!(relay.peel(&mut payload), "reply must be stamped for us");
            let rc = RelayCell::from_payload(&payload).unwrap();
            assert_eq!(rc.command, RelayCommand::Sendme);
            assert_eq!(rc.stream_id, 0, "circuit-level SENDME");
            sendmes += 1;
        }
        match i {
            0..=9 => assert_eq!(sendmes, 0, "no SENDME before the increment"),
            _ => assert_eq!(sendmes, 1, "exactly one SENDME after the 10th cell"),
        }
    }
}

#[test]
fn data_stops_when_package_window_is_empty() {
    // A tiny circuit window: after 10 DATA cells the sender must stall
    // until a SENDME arrives.
    let mut cfg = Config::default();
    cfg.circuit_window_start = 10;
    cfg.circuit_window_increment = 10;
    let (mut node, mut relays, link, wire_id, circuit) =
        build_three_hop_circuit(cfg, "accept *:*", NOW);

    node.open_stream("example.com", 80, NOW);
    let cells = substantive_cells(&node.take_outbound(link));
    let mut payload = cells[0].payload.clone();
    relays[0].peel(&mut payload);
    relays[1].peel(&mut payload);
    relays[2].peel(&mut payload);
    let stream_id = RelayCell::from_payload(&payload).unwrap().stream_id;

    let connected = RelayCell::new(RelayCommand::Connected, stream_id, vec![0; 4]).unwrap();
    let mut wrapped = relays[2].wrap_reply(&connected);
    relays[1].add_layer(&mut wrapped);
    relays[0].add_layer(&mut wrapped);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();

    // 12 cells of payload: only 10 may leave.
    let big = vec![0xAB; 498 * 12];
    node.stream_send_data(circuit, stream_id, &big, NOW).unwrap();
    let sent = substantive_cells(&node.take_outbound(link)).len();
    assert_eq!(sent, 10, "package window caps the burst");

    // A circuit-level SENDME releases the rest.
    let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new()).unwrap();
    let mut wrapped = relays[2].wrap_reply(&sendme);
    relays[1].add_layer(&mut wrapped);
    relays[0].add_layer(&mut wrapped);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    let sent_after = substantive_cells(&node.take_outbound(link)).len();
    assert_eq!(sent_after, 2, "remaining cells flow after the SENDME");
}

#[test]
fn unrecognized_inbound_cell_closes_circuit() {
    let (mut node, _relays, link, wire_id, circuit) =
        build_three_hop_circuit(Config::default(), "accept *:*", NOW);

    // Garbage that no hop can recognize.
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, vec![0x5A; 509]).unwrap().to_bytes(),
        NOW,
    )
    .unwrap();
    assert_eq!(node.circuit_state(circuit), None);
}
