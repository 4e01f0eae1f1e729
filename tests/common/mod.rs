//! Shared test harness: a deterministic handshake provider, scripted
//! relays that answer handshakes and peel/wrap onion layers, and helpers
//! for driving a client node's link through its handshake.
#![allow(dead_code)]

use onion_core::circuit::CircuitId;
use onion_core::config::Config;
use onion_core::error::{Error, Result};
use onion_core::link::LinkId;
use onion_core::netdir::{NetDir, Relay, RelayFlags, RelayId};
use onion_core::node::{Action, Node};
use onion_core::policy::ExitPolicy;
use onion_core::protocol::cell::{
    decode_cell, Cell, CellCommand, Decoded, RelayCell, VarCell,
};
use onion_core::protocol::crypto::{CellDirection, HopCrypt};
use onion_core::protocol::handshake::{
    fast_server, tap_server, DhKeypair, HandshakeProvider, KeyGeneration, CREATE_PAYLOAD_LEN,
    DH_LEN,
};
use rand::rngs::mock::StepRng;
use std::net::Ipv4Addr;
use zeroize::Zeroizing;

/// A handshake provider with transparent "crypto": DH private/public
/// values are a single repeated byte, shared secrets add the two bytes,
/// and onion sealing tags the payload with the key byte. Enough to test
/// every state machine without real asymmetric primitives.
pub struct MockProvider {
    next_private: u8,
    primary_secret: u8,
    previous_secret: Option<u8>,
}

impl MockProvider {
    pub fn new(primary_secret: u8) -> Self {
        Self {
            next_private: 1,
            primary_secret,
            previous_secret: None,
        }
    }

    pub fn primary_secret(&self) -> u8 {
        self.primary_secret
    }
}

impl HandshakeProvider for MockProvider {
    fn dh_keypair(&mut self) -> Result<DhKeypair> {
        let p = self.next_private;
        self.next_private = self.next_private.wrapping_add(1);
        Ok(DhKeypair {
            private: Zeroizing::new(vec![p]),
            public: [p; DH_LEN],
        })
    }

    fn dh_shared(
        &self,
        keypair: &DhKeypair,
        peer_public: &[u8; DH_LEN],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mine = keypair.private[0];
        Ok(Zeroizing::new(vec![mine.wrapping_add(peer_public[0]); 32]))
    }

    fn onion_seal(&mut self, onion_key: &[u8], client_public: &[u8; DH_LEN]) -> Result<Vec<u8>> {
        let key_byte = *onion_key
            .first()
            .ok_or_else(|| Error::Internal("empty onion key".into()))?;
        let mut sealed = vec![0u8; CREATE_PAYLOAD_LEN];
        sealed[0] = key_byte;
        sealed[1..1 + DH_LEN].copy_from_slice(client_public);
        Ok(sealed)
    }

    fn onion_unseal(&self, generation: KeyGeneration, sealed: &[u8]) -> Result<[u8; DH_LEN]> {
        let expected = match generation {
            KeyGeneration::Primary => self.primary_secret,
            KeyGeneration::Previous => self
                .previous_secret
                .ok_or_else(|| Error::Internal("no previous onion key".into()))?,
        };
        if sealed.first() != Some(&expected) {
            return Err(Error::Protocol("sealed under a different onion key".into()));
        }
        let mut public = [0u8; DH_LEN];
        public.copy_from_slice(&sealed[1..1 + DH_LEN]);
        Ok(public)
    }

    fn has_previous_onion_key(&self) -> bool {
        self.previous_secret.is_some()
    }

    fn rotate_onion_keys(&mut self) -> Result<()> {
        self.previous_secret = Some(self.primary_secret);
        self.primary_secret = self.primary_secret.wrapping_add(1);
        Ok(())
    }
}

/// One scripted relay standing in for a real hop: it answers handshakes
/// and afterwards owns the same symmetric state a real relay would.
pub struct TestRelay {
    pub identity: RelayId,
    pub provider: MockProvider,
    pub crypt: Option<HopCrypt>,
    rng: StepRng,
}

impl TestRelay {
    pub fn new(id_byte: u8, onion_secret: u8) -> Self {
        Self {
            identity: RelayId::from([id_byte; 20]),
            provider: MockProvider::new(onion_secret),
            crypt: None,
            rng: StepRng::new(0x0101_0101_0101_0101, 1),
        }
    }

    /// Answer a CREATE_FAST payload, installing our half of the keys.
    pub fn answer_create_fast(&mut self, payload: &[u8]) -> Vec<u8> {
        let (reply, km) = fast_server(&mut self.rng, payload).expect("fast handshake");
        self.crypt = Some(HopCrypt::new(&km));
        reply
    }

    /// Answer a CREATE payload, installing our half of the keys.
    pub fn answer_create(&mut self, payload: &[u8]) -> Vec<u8> {
        let (reply, km) = tap_server(&mut self.provider, payload).expect("tap handshake");
        self.crypt = Some(HopCrypt::new(&km));
        reply
    }

    /// Peel our outbound layer; true when the cell is addressed to us.
    pub fn peel(&mut self, payload: &mut [u8]) -> bool {
        let crypt = self.crypt.as_mut().expect("keys installed");
        crypt.apply_cipher(CellDirection::Outbound, payload);
        crypt.recognize(CellDirection::Outbound, payload)
    }

    /// Build the payload of a relay cell we originate toward the client.
    pub fn wrap_reply(&mut self, rc: &RelayCell) -> Vec<u8> {
        let crypt = self.crypt.as_mut().expect("keys installed");
        let mut payload = rc.to_payload();
        crypt.stamp(CellDirection::Inbound, &mut payload).expect("stamp");
        crypt.apply_cipher(CellDirection::Inbound, &mut payload);
        payload
    }

    /// Add our inbound layer to a payload passing through us toward the
    /// client.
    pub fn add_layer(&mut self, payload: &mut [u8]) {
        let crypt = self.crypt.as_mut().expect("keys installed");
        crypt.apply_cipher(CellDirection::Inbound, payload);
    }
}

/// Build a directory entry.
pub fn relay_entry(
    id_byte: u8,
    nickname: &str,
    flags: &str,
    bandwidth: u64,
    onion_key: Vec<u8>,
    policy: &str,
) -> Relay {
    Relay {
        nickname: nickname.to_string(),
        identity: RelayId::from([id_byte; 20]),
        address: Ipv4Addr::new(10, 0, 0, id_byte),
        or_port: 9001,
        flags: RelayFlags::from_string(flags),
        bandwidth,
        onion_key,
        exit_policy: ExitPolicy::parse(policy).expect("policy"),
        family: vec![],
        version: None,
    }
}

/// A client node with deterministic randomness and the given directory.
pub fn client_node(cfg: Config, relays: Vec<Relay>, now: u64) -> Node {
    let mut node = Node::with_rng(
        cfg,
        Box::new(MockProvider::new(0x01)),
        Box::new(StepRng::new(0, 0)),
    );
    node.set_identity(RelayId::from([0x11; 20]));
    node.set_netdir(NetDir::new(relays), now);
    node
}

/// Feed the peer half of the link handshake (VERSIONS then NETINFO) so
/// the link opens.
pub fn complete_link_handshake(node: &mut Node, link: LinkId, now: u64) {
    let versions = VarCell {
        circ_id: 0,
        command: CellCommand::Versions as u8,
        payload: vec![0, 2, 0, 3],
    };
    let netinfo = Cell::new(0, CellCommand::Netinfo, vec![0; 15]).expect("netinfo");
    let mut bytes = versions.to_bytes();
    bytes.extend_from_slice(&netinfo.to_bytes());
    node.deliver_inbound(link, &bytes, now).expect("link handshake");
}

/// Decode every complete cell in an outbound byte buffer.
pub fn parse_outbound(bytes: &[u8]) -> Vec<Decoded> {
    let mut cells = Vec::new();
    let mut rest = bytes;
    while let Some((decoded, used)) = decode_cell(rest).expect("well-formed outbound") {
        cells.push(decoded);
        rest = &rest[used..];
    }
    assert!(rest.is_empty(), "trailing outbound bytes");
    cells
}

/// Only the fixed cells of substance: VERSIONS/NETINFO/PADDING dropped.
pub fn substantive_cells(bytes: &[u8]) -> Vec<Cell> {
    parse_outbound(bytes)
        .into_iter()
        .filter_map(|d| match d {
            Decoded::Fixed(c)
                if c.command != CellCommand::Netinfo && c.command != CellCommand::Padding =>
            {
                Some(c)
            }
            _ => None,
        })
        .collect()
}

/// Expect the next Action of a given shape.
pub fn expect_open_transport(actions: &[Action]) -> (LinkId, Ipv4Addr, u16) {
    for a in actions {
        if let Action::OpenTransport { link, addr, port } = a {
            return (*link, *addr, *port);
        }
    }
    panic!("no OpenTransport action in {:?}", actions);
}

/// Drive a one-hop build to a single fast-handshake relay.
///
/// Returns the node, the relay with installed keys, the link id and the
/// circuit's wire id on that link.
pub fn build_one_hop_circuit(
    cfg: Config,
    now: u64,
) -> (Node, TestRelay, LinkId, u16, CircuitId) {
    let relays = vec![
        relay_entry(0x22, "solo", "Fast Guard Running Stable Valid", 5_000_000, vec![], "reject *:*"),
        relay_entry(0x33, "filler", "Fast Running Stable Valid", 1_000_000, vec![0x30], "reject *:*"),
    ];
    let mut node = client_node(cfg, relays, now);
    let mut relay = TestRelay::new(0x22, 0x20);

    let circuit = node
        .launch_circuit(
            onion_core::circuit::CircuitPurpose::OneHop,
            Some(RelayId::from([0x22; 20])),
            now,
        )
        .expect("launch");

    let actions = node.take_actions();
    let (link, _, _) = expect_open_transport(&actions);
    node.link_transport_ready(link, RelayId::from([0x22; 20]), now)
        .expect("transport");
    node.take_outbound(link);
    complete_link_handshake(&mut node, link, now);

    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::CreateFast);
    let wire_id = cells[0].circ_id;
    let reply = relay.answer_create_fast(&cells[0].payload[..20]);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::CreatedFast, reply).unwrap().to_bytes(),
        now,
    )
    .expect("created_fast");

    (node, relay, link, wire_id, circuit)
}

/// Drive a full three-hop build over scripted relays A (entry, fast
/// handshake), B (middle) and C (exit with `exit_policy`).
///
/// Returns the node, the three relays with installed keys, the entry link
/// id and the circuit's wire id on that link.
pub fn build_three_hop_circuit(
    cfg: Config,
    exit_policy: &str,
    now: u64,
) -> (Node, [TestRelay; 3], LinkId, u16, CircuitId) {
    let relays = vec![
        relay_entry(0xAA, "alpha", "Fast Guard Running Stable Valid", 5_000_000, vec![], "reject *:*"),
        relay_entry(0xBB, "beta", "Fast Running Stable Valid", 4_000_000, vec![0xB0], "reject *:*"),
        relay_entry(0xCC, "gamma", "Exit Fast Running Stable Valid", 3_000_000, vec![0xC0], exit_policy),
    ];
    let mut node = client_node(cfg, relays, now);
    let mut relay_a = TestRelay::new(0xAA, 0xA0);
    let mut relay_b = TestRelay::new(0xBB, 0xB0);
    let mut relay_c = TestRelay::new(0xCC, 0xC0);

    let circuit = node
        .launch_circuit(onion_core::circuit::CircuitPurpose::General, None, now)
        .expect("launch");

    let actions = node.take_actions();
    let (link, addr, _) = expect_open_transport(&actions);
    assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 0xAA), "entry should be alpha");

    node.link_transport_ready(link, RelayId::from([0xAA; 20]), now)
        .expect("transport");
    node.take_outbound(link); // our VERSIONS
    complete_link_handshake(&mut node, link, now);

    // CREATE_FAST goes out once the link opens.
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::CreateFast);
    let wire_id = cells[0].circ_id;
    let reply = relay_a.answer_create_fast(&cells[0].payload[..20]);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::CreatedFast, reply).unwrap().to_bytes(),
        now,
    )
    .expect("created_fast");

    // EXTEND to beta rides RELAY_EARLY through alpha.
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::RelayEarly);
    let mut payload = cells[0].payload.clone();
    assert!(relay_a.peel(&mut payload), "alpha consumes the EXTEND");
    let rc = RelayCell::from_payload(&payload).unwrap();
    let req = onion_core::protocol::handshake::ExtendRequest::from_bytes(&rc.data).unwrap();
    assert_eq!(req.identity, relay_b.identity);
    let created = relay_b.answer_create(&req.create_payload);
    let extended = RelayCell::new(
        onion_core::protocol::cell::RelayCommand::Extended,
        0,
        created,
    )
    .unwrap();
    let wrapped = relay_a.wrap_reply(&extended);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        now,
    )
    .expect("extended(beta)");

    // EXTEND to gamma passes through alpha, consumed by beta.
    let cells = substantive_cells(&node.take_outbound(link));
    assert_eq!(cells.len(), 1);
    let mut payload = cells[0].payload.clone();
    assert!(!relay_a.peel(&mut payload), "alpha forwards this one");
    assert!(relay_b.peel(&mut payload), "beta consumes the EXTEND");
    let rc = RelayCell::from_payload(&payload).unwrap();
    let req = onion_core::protocol::handshake::ExtendRequest::from_bytes(&rc.data).unwrap();
    assert_eq!(req.identity, relay_c.identity);
    let created = relay_c.answer_create(&req.create_payload);
    let extended = RelayCell::new(
        onion_core::protocol::cell::RelayCommand::Extended,
        0,
        created,
    )
    .unwrap();
    let mut wrapped = relay_b.wrap_reply(&extended);
    relay_a.add_layer(&mut wrapped);
    node.deliver_inbound(
        link,
        &Cell::new(wire_id, CellCommand::Relay, wrapped).unwrap().to_bytes(),
        now,
    )
    .expect("extended(gamma)");

    (node, [relay_a, relay_b, relay_c], link, wire_id, circuit)
}
