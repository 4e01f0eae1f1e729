//! Circuits
//!
//! A circuit is a bidirectional construct spanning up to two links: the
//! neighbor it came from (`prev`, absent at the origin) and the neighbor it
//! extends to (`next`, absent at the current last hop). An origin circuit
//! additionally owns its `cpath`: one [`Hop`] per relay with that hop's
//! negotiated symmetric state and flow-control windows.

pub mod builder;
pub mod router;

use crate::error::{Error, Result};
use crate::link::LinkId;
use crate::netdir::{Relay, RelayId};
use crate::protocol::crypto::HopCrypt;
use crate::protocol::flow_control::CircuitWindows;
use crate::protocol::handshake::{ExtendRequest, PendingHandshake};
use crate::stream::Stream;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Node-local circuit identifier (not the wire id).
pub type CircuitId = u64;

/// How many EXTEND cells an origin circuit may still send as RELAY_EARLY.
pub const RELAY_EARLY_BUDGET: u8 = 8;

/// Where this node stands on the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitRole {
    /// We built it and hold the cpath.
    Origin,
    /// We are a middle or last hop.
    Relay,
}

/// Circuit lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Origin side: handshakes still in flight.
    Building,
    /// Waiting for a link to the next hop to come up.
    AwaitingLink,
    /// Usable.
    Open,
    /// Terminal.
    Closed,
}

/// What the circuit is for. Affects path-length decisions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    General,
    Directory,
    Testing,
    OneHop,
    HsIntro,
}

/// A (link, wire-id) binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub link: LinkId,
    pub circ_id: u16,
}

/// Progress of one hop on an origin circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopState {
    /// Not yet reached.
    Closed,
    /// CREATE/EXTEND sent, reply outstanding.
    AwaitingKeys,
    /// Keys installed.
    Open,
}

/// The chosen relay for one hop position.
#[derive(Debug, Clone)]
pub struct HopSpec {
    pub identity: RelayId,
    pub nickname: String,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub onion_key: Vec<u8>,
    /// The relay's exit policy; rules are interned, so the clone is cheap.
    pub exit_policy: crate::policy::ExitPolicy,
}

impl From<&Relay> for HopSpec {
    fn from(relay: &Relay) -> Self {
        Self {
            identity: relay.identity,
            nickname: relay.nickname.clone(),
            addr: relay.address,
            port: relay.or_port,
            onion_key: relay.onion_key.clone(),
            exit_policy: relay.exit_policy.clone(),
        }
    }
}

/// One hop of an origin circuit.
pub struct Hop {
    pub spec: HopSpec,
    pub state: HopState,
    /// Symmetric state, installed when the handshake completes.
    pub crypt: Option<HopCrypt>,
    /// Per-hop package/deliver windows.
    pub windows: CircuitWindows,
    /// Client handshake state while AwaitingKeys.
    pub handshake: Option<PendingHandshake>,
}

impl Hop {
    pub fn planned(spec: HopSpec, windows: CircuitWindows) -> Self {
        Self {
            spec,
            state: HopState::Closed,
            crypt: None,
            windows,
            handshake: None,
        }
    }
}

/// One circuit, origin- or relay-side.
pub struct Circuit {
    pub id: CircuitId,
    pub role: CircuitRole,
    pub state: CircuitState,
    pub purpose: CircuitPurpose,

    /// The neighbor this circuit came from (relay side).
    pub prev: Option<Attachment>,
    /// The neighbor this circuit extends to.
    pub next: Option<Attachment>,

    /// Hops, origin side only.
    pub cpath: Vec<Hop>,

    /// Our single layer of symmetric state, relay side only.
    pub relay_crypt: Option<HopCrypt>,

    /// Circuit-wide windows (authoritative on the relay side; the origin
    /// side regulates per hop through `cpath`).
    pub windows: CircuitWindows,

    /// Streams multiplexed on this circuit, by stream id.
    pub streams: HashMap<u16, Stream>,
    next_stream_id: u16,

    pub created_at: u64,
    /// When the first stream was attached; circuits past the reuse window
    /// take no new streams.
    pub dirty_since: Option<u64>,

    /// Deadline for the outstanding CREATE/EXTEND round trip.
    pub build_deadline: Option<u64>,

    /// Relay side: an EXTEND whose next-hop link is still being dialed.
    pub pending_extend: Option<ExtendRequest>,

    /// RELAY_EARLY cells this origin may still send.
    pub relay_early_remaining: u8,
}

impl Circuit {
    pub fn new_origin(
        id: CircuitId,
        purpose: CircuitPurpose,
        path: Vec<HopSpec>,
        window_start: u16,
        window_increment: u16,
        now: u64,
    ) -> Self {
        let cpath = path
            .into_iter()
            .map(|spec| Hop::planned(spec, CircuitWindows::new(window_start, window_increment)))
            .collect();
        Self {
            id,
            role: CircuitRole::Origin,
            state: CircuitState::Building,
            purpose,
            prev: None,
            next: None,
            cpath,
            relay_crypt: None,
            windows: CircuitWindows::new(window_start, window_increment),
            streams: HashMap::new(),
            next_stream_id: 1,
            created_at: now,
            dirty_since: None,
            build_deadline: None,
            pending_extend: None,
            relay_early_remaining: RELAY_EARLY_BUDGET,
        }
    }

    pub fn new_relay(
        id: CircuitId,
        prev: Attachment,
        window_start: u16,
        window_increment: u16,
        now: u64,
    ) -> Self {
        Self {
            id,
            role: CircuitRole::Relay,
            state: CircuitState::Open,
            purpose: CircuitPurpose::General,
            prev: Some(prev),
            next: None,
            cpath: Vec::new(),
            relay_crypt: None,
            windows: CircuitWindows::new(window_start, window_increment),
            streams: HashMap::new(),
            next_stream_id: 1,
            created_at: now,
            dirty_since: None,
            build_deadline: None,
            pending_extend: None,
            relay_early_remaining: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == CircuitState::Closed
    }

    /// Index of the hop whose handshake reply is outstanding.
    pub fn awaiting_hop(&self) -> Option<usize> {
        self.cpath.iter().position(|h| h.state == HopState::AwaitingKeys)
    }

    /// Index of the farthest hop with installed keys.
    pub fn last_open_hop(&self) -> Option<usize> {
        self.cpath.iter().rposition(|h| h.state == HopState::Open)
    }

    /// Whether every planned hop is open.
    pub fn all_hops_open(&self) -> bool {
        !self.cpath.is_empty() && self.cpath.iter().all(|h| h.state == HopState::Open)
    }

    /// First stream attachment makes the circuit dirty; the reuse clock
    /// starts here.
    pub fn mark_dirty(&mut self, now: u64) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    /// Whether the circuit may take new streams at `now`.
    pub fn accepts_new_streams(&self, reuse_window: u64, now: u64) -> bool {
        self.state == CircuitState::Open
            && match self.dirty_since {
                None => true,
                Some(t) => now.saturating_sub(t) < reuse_window,
            }
    }

    /// Allocate an unused, nonzero stream id.
    pub fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_stream_id;
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id == 0 {
                self.next_stream_id = 1;
            }
            if candidate != 0 && !self.streams.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Resource("no free stream ids on this circuit".into()))
    }
}
