//! Link connections
//!
//! One link is one authenticated session to one peer, carrying many
//! circuits. The transport itself (TLS, its certificates, its record
//! layer) lives outside the core; a link starts life when the transport
//! reports the peer's identity digest and then runs the link handshake:
//!
//! ```text
//! transport ready ──▶ send VERSIONS ──▶ recv VERSIONS ──▶ send NETINFO
//!                                   ──▶ recv NETINFO  ──▶ OPEN
//! ```
//!
//! Variable-length cells other than VERSIONS are rejected until a protocol
//! version ≥ 2 has been negotiated.
//!
//! Each link also owns the circuit-id half assignment: comparing our
//! identity digest with the peer's decides whether we allocate ids with
//! the high bit clear (LOWER) or set (HIGHER).

use crate::circuit::CircuitId;
use crate::error::{Error, Result};
use crate::netdir::RelayId;
use crate::protocol::cell::{
    decode_cell, Cell, CellCommand, Decoded, VarCell, PAYLOAD_LEN,
};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Link identifier, local to this node.
pub type LinkId = u64;

/// Link protocol versions we can speak, preferred last.
pub const SUPPORTED_LINK_VERSIONS: &[u16] = &[2, 3];

/// Which half of the 16-bit circuit-id space this side allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircIdType {
    /// Our identity digest is smaller: high bit clear.
    Lower,
    /// Our identity digest is larger: high bit set.
    Higher,
    /// We have no identity; we may not allocate ids on this link.
    Neither,
}

impl CircIdType {
    /// Decide the half from the two identity digests.
    pub fn decide(ours: Option<&RelayId>, peer: &RelayId) -> Self {
        match ours {
            None => CircIdType::Neither,
            Some(us) if us < peer => CircIdType::Lower,
            Some(us) if us > peer => CircIdType::Higher,
            Some(_) => CircIdType::Neither,
        }
    }
}

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport is being dialed.
    Connecting,
    /// Transport is up; waiting for the peer's VERSIONS.
    VersionsWait,
    /// Versions agreed; waiting for the peer's NETINFO.
    NetinfoWait,
    /// Handshake complete; cells flow.
    Open,
    /// Torn down. Terminal.
    Closed,
}

/// One link connection.
pub struct Link {
    pub id: LinkId,

    pub state: LinkState,

    /// Whether we dialed this link (as opposed to accepting it).
    pub initiated: bool,

    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,

    /// Identity we insisted on when dialing, if any.
    pub expected_identity: Option<RelayId>,

    /// Identity the transport authenticated, once known.
    pub peer_identity: Option<RelayId>,

    pub circ_id_type: CircIdType,
    next_circ_id: u16,

    /// Negotiated link protocol version.
    pub protocol_version: Option<u16>,
    sent_versions: bool,
    sent_netinfo: bool,
    got_versions: bool,
    got_netinfo: bool,

    inbuf: Vec<u8>,
    outbuf: Vec<u8>,

    /// Circuits multiplexed on this link, by wire id.
    pub circuits: HashMap<u16, CircuitId>,

    pub last_activity: u64,

    /// Set when the last circuit left; the link is lazily closed after the
    /// idle timeout.
    pub idle_since: Option<u64>,
}

impl Link {
    pub fn new(
        id: LinkId,
        peer_addr: Ipv4Addr,
        peer_port: u16,
        expected_identity: Option<RelayId>,
        initiated: bool,
        now: u64,
    ) -> Self {
        Self {
            id,
            state: LinkState::Connecting,
            initiated,
            peer_addr,
            peer_port,
            expected_identity,
            peer_identity: None,
            circ_id_type: CircIdType::Neither,
            next_circ_id: 1,
            protocol_version: None,
            sent_versions: false,
            sent_netinfo: false,
            got_versions: false,
            got_netinfo: false,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            circuits: HashMap::new(),
            last_activity: now,
            idle_since: Some(now),
        }
    }

    // ===== Handshake =====

    /// The transport came up and authenticated `peer`. Checks the pinned
    /// identity, fixes the circuit-id half, and opens with VERSIONS.
    pub fn transport_ready(
        &mut self,
        our_identity: Option<&RelayId>,
        peer: RelayId,
        now: u64,
    ) -> Result<()> {
        if let Some(expected) = &self.expected_identity {
            if *expected != peer {
                return Err(Error::ConnectFailed(format!(
                    "peer identity {} does not match pinned {}",
                    peer, expected
                )));
            }
        }
        self.peer_identity = Some(peer);
        self.circ_id_type = CircIdType::decide(our_identity, &peer);
        self.state = LinkState::VersionsWait;
        self.last_activity = now;
        self.send_versions();
        Ok(())
    }

    fn send_versions(&mut self) {
        let mut payload = Vec::with_capacity(SUPPORTED_LINK_VERSIONS.len() * 2);
        for v in SUPPORTED_LINK_VERSIONS {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        self.enqueue_var_cell(&VarCell {
            circ_id: 0,
            command: CellCommand::Versions as u8,
            payload,
        });
        self.sent_versions = true;
    }

    fn handle_versions(&mut self, vc: &VarCell) -> Result<()> {
        if self.got_versions {
            return Err(Error::Protocol("second VERSIONS cell".into()));
        }
        if vc.payload.len() % 2 != 0 {
            return Err(Error::Protocol("odd-length VERSIONS payload".into()));
        }
        let theirs: Vec<u16> = vc
            .payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        let best = SUPPORTED_LINK_VERSIONS
            .iter()
            .rev()
            .find(|v| theirs.contains(v))
            .copied()
            .ok_or_else(|| Error::Protocol("no common link protocol version".into()))?;
        log::debug!("link {}: negotiated protocol version {}", self.id, best);
        self.protocol_version = Some(best);
        self.got_versions = true;

        self.send_netinfo();
        self.state = if self.got_netinfo {
            LinkState::Open
        } else {
            LinkState::NetinfoWait
        };
        Ok(())
    }

    fn send_netinfo(&mut self) {
        // timestamp(4) ∥ peer addr (type 04, len 4, addr) ∥ count(1) ∥
        // our addr (type 04, len 4, addr — zero when unknown).
        let mut payload = Vec::with_capacity(15);
        payload.extend_from_slice(&(self.last_activity as u32).to_be_bytes());
        payload.push(4);
        payload.push(4);
        payload.extend_from_slice(&self.peer_addr.octets());
        payload.push(1);
        payload.push(4);
        payload.push(4);
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let cell = Cell {
            circ_id: 0,
            command: CellCommand::Netinfo,
            payload,
        };
        self.enqueue_cell(&cell);
        self.sent_netinfo = true;
    }

    fn handle_netinfo(&mut self) -> Result<()> {
        if !self.got_versions {
            return Err(Error::Protocol("NETINFO before VERSIONS".into()));
        }
        if self.got_netinfo {
            return Err(Error::Protocol("second NETINFO cell".into()));
        }
        self.got_netinfo = true;
        self.state = LinkState::Open;
        log::info!(
            "🔗 link {} to {}:{} is open",
            self.id,
            self.peer_addr,
            self.peer_port
        );
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    // ===== Inbound =====

    /// Append transport bytes to the inbound buffer.
    pub fn push_inbound(&mut self, bytes: &[u8], now: u64) {
        self.inbuf.extend_from_slice(bytes);
        self.last_activity = now;
    }

    /// Decode and pre-process one cell from the inbound buffer.
    ///
    /// Link-handshake cells (VERSIONS, NETINFO) and PADDING are consumed
    /// here; anything else is returned for the circuit layer, after
    /// enforcing that the link is open and that variable-length framing was
    /// negotiated.
    pub fn next_cell(&mut self) -> Result<Option<Decoded>> {
        loop {
            let (decoded, used) = match decode_cell(&self.inbuf)? {
                Some(x) => x,
                None => return Ok(None),
            };
            self.inbuf.drain(..used);

            let vars_forbidden = self.protocol_version.map_or(true, |v| v < 2);
            match decoded {
                Decoded::Variable(vc) => {
                    if vc.command == CellCommand::Versions as u8 {
                        self.handle_versions(&vc)?;
                    } else if vars_forbidden {
                        return Err(Error::Protocol(
                            "variable-length cell before version negotiation".into(),
                        ));
                    } else {
                        log::warn!(
                            "⚠️ link {}: discarding unexpected variable cell {}",
                            self.id,
                            vc.command
                        );
                    }
                }
                Decoded::Unknown { circ_id, command } => {
                    if crate::protocol::cell::command_is_variable(command) && vars_forbidden {
                        return Err(Error::Protocol(
                            "variable-length cell before version negotiation".into(),
                        ));
                    }
                    log::warn!(
                        "⚠️ link {}: discarding cell with unknown command {} (circ {})",
                        self.id,
                        command,
                        circ_id
                    );
                }
                Decoded::Fixed(cell) => match cell.command {
                    CellCommand::Netinfo => self.handle_netinfo()?,
                    CellCommand::Padding => {}
                    _ => {
                        if !self.is_open() {
                            return Err(Error::Protocol(format!(
                                "{:?} cell before link handshake finished",
                                cell.command
                            )));
                        }
                        return Ok(Some(Decoded::Fixed(cell)));
                    }
                },
            }
        }
    }

    // ===== Outbound =====

    /// Pack a fixed cell onto the outbound buffer.
    pub fn enqueue_cell(&mut self, cell: &Cell) {
        debug_assert!(cell.payload.len() <= PAYLOAD_LEN);
        self.outbuf.extend_from_slice(&cell.to_bytes());
    }

    /// Pack a variable-length cell onto the outbound buffer.
    pub fn enqueue_var_cell(&mut self, cell: &VarCell) {
        self.outbuf.extend_from_slice(&cell.to_bytes());
    }

    /// Drain the bytes the transport should write next.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbuf)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbuf.is_empty()
    }

    // ===== Circuit bookkeeping =====

    /// Allocate an unused, nonzero circuit id from our half of the space.
    pub fn allocate_circ_id(&mut self) -> Result<u16> {
        let high_bit: u16 = match self.circ_id_type {
            CircIdType::Higher => 1 << 15,
            CircIdType::Lower => 0,
            CircIdType::Neither => {
                return Err(Error::Internal(
                    "cannot allocate circuit ids without an identity comparison".into(),
                ))
            }
        };
        for _ in 0..(1u32 << 15) {
            let mut candidate = self.next_circ_id;
            if candidate == 0 || candidate >= (1 << 15) {
                candidate = 1;
                self.next_circ_id = 1;
            }
            self.next_circ_id = self.next_circ_id.wrapping_add(1);
            let candidate = candidate | high_bit;
            if !self.circuits.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Resource("no free circuit ids on this link".into()))
    }

    /// Bind a circuit to a wire id. At most one circuit per id.
    pub fn attach_circuit(&mut self, circ_id: u16, circuit: CircuitId) -> Result<()> {
        if self.circuits.insert(circ_id, circuit).is_some() {
            return Err(Error::Internal(format!(
                "circuit id {} double-mapped on link {}",
                circ_id, self.id
            )));
        }
        self.idle_since = None;
        Ok(())
    }

    /// Remove a circuit binding; starts the idle clock when it was the
    /// last one.
    pub fn detach_circuit(&mut self, circ_id: u16, now: u64) {
        self.circuits.remove(&circ_id);
        if self.circuits.is_empty() {
            self.idle_since = Some(now);
        }
    }
}
