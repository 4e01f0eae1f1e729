//! The node
//!
//! One [`Node`] value owns every piece of protocol state: links, circuits,
//! streams, guards, the directory snapshot and the onion-key provider. It
//! is sans-I/O: the embedding event loop feeds it transport bytes and
//! completion notices, drains per-link outbound bytes, and executes the
//! [`Action`]s it requests (dial a transport, resolve a name, connect a
//! TCP socket, persist guard state).
//!
//! ## No borrows across work
//!
//! Circuits are briefly *checked out* of the table while a cell is
//! processed, then put back — or dropped, if processing closed them. This
//! keeps every mutation single-threaded and lock-free, and no handler ever
//! holds two table borrows at once.
//!
//! Time is explicit everywhere: callers pass `now` in Unix seconds, and
//! [`Node::tick`] drives every deadline.

use crate::circuit::{Circuit, CircuitId, CircuitState};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CircStatus, Event, EventSink, OrConnStatus, StreamStatus};
use crate::guards::GuardManager;
use crate::link::{Link, LinkId, LinkState};
use crate::netdir::{NetDir, RelayId};
use crate::policy::ExitPolicy;
use crate::protocol::cell::{Cell, CellCommand, Decoded, DestroyReason};
use crate::protocol::handshake::HandshakeProvider;
use crate::stream::PendingStream;
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

/// Work the embedding runtime must perform for the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Dial an authenticated transport to `addr:port` for `link`.
    OpenTransport {
        link: LinkId,
        addr: Ipv4Addr,
        port: u16,
    },
    /// Tear down the transport of `link`.
    CloseTransport { link: LinkId },
    /// Resolve `host`; report through [`Node::resolve_completed`].
    ResolveHost { tag: u64, host: String },
    /// Connect a TCP socket; report through
    /// [`Node::exit_connect_completed`].
    ConnectTcp {
        tag: u64,
        addr: Ipv4Addr,
        port: u16,
    },
    /// Hand stream payload to its local endpoint (application socket on
    /// the origin side, TCP socket on the exit side).
    DeliverData {
        circuit: CircuitId,
        stream: u16,
        data: Vec<u8>,
    },
    /// Write the guard state file.
    PersistGuardState { contents: String },
    /// The onion keys rotated; helper processes should be respawned.
    RespawnWorkers,
}

/// The circuit core.
pub struct Node {
    pub(crate) cfg: Config,
    pub(crate) identity: Option<RelayId>,
    pub(crate) exit_policy: Option<ExitPolicy>,
    pub(crate) provider: Box<dyn HandshakeProvider>,
    pub(crate) rng: Box<dyn RngCore>,

    pub(crate) links: HashMap<LinkId, Link>,
    next_link_id: LinkId,

    pub(crate) circuits: HashMap<CircuitId, Circuit>,
    next_circuit_id: CircuitId,

    pub(crate) netdir: Option<NetDir>,
    pub(crate) guards: GuardManager,

    /// Streams waiting for a suitable circuit.
    pub(crate) pending_streams: VecDeque<PendingStream>,
    pub(crate) next_request_id: u64,

    /// Outstanding exit-side resolves/connects, by tag. A completion whose
    /// tag is gone is silently discarded.
    pub(crate) tags: HashMap<u64, (CircuitId, u16)>,
    pub(crate) next_tag: u64,

    /// Circuits waiting for a link to finish its handshake.
    pub(crate) link_waiters: HashMap<LinkId, Vec<CircuitId>>,

    pub(crate) actions: VecDeque<Action>,
    pub(crate) events: EventSink,
}

impl Node {
    pub fn new(cfg: Config, provider: Box<dyn HandshakeProvider>) -> Self {
        Self::with_rng(cfg, provider, Box::new(rand::rngs::OsRng))
    }

    /// Like [`Node::new`] but with an injected RNG, for deterministic
    /// tests.
    pub fn with_rng(
        cfg: Config,
        provider: Box<dyn HandshakeProvider>,
        rng: Box<dyn RngCore>,
    ) -> Self {
        Self {
            cfg,
            identity: None,
            exit_policy: None,
            provider,
            rng,
            links: HashMap::new(),
            next_link_id: 1,
            circuits: HashMap::new(),
            next_circuit_id: 1,
            netdir: None,
            guards: GuardManager::new(),
            pending_streams: VecDeque::new(),
            next_request_id: 1,
            tags: HashMap::new(),
            next_tag: 1,
            link_waiters: HashMap::new(),
            actions: VecDeque::new(),
            events: EventSink::new(),
        }
    }

    // ===== Setup =====

    /// Install our own identity digest (enables circuit-id allocation and
    /// the relay role).
    pub fn set_identity(&mut self, identity: RelayId) {
        self.identity = Some(identity);
    }

    /// Act as an exit with this policy.
    pub fn set_exit_policy(&mut self, policy: ExitPolicy) {
        self.exit_policy = Some(policy);
    }

    /// Install a fresh directory snapshot and refresh guard status.
    pub fn set_netdir(&mut self, dir: NetDir, now: u64) {
        log::info!("📡 directory snapshot: {} relays", dir.len());
        self.guards
            .update_status_from_directory(&dir, now, &mut self.events);
        self.netdir = Some(dir);
        self.attach_pending_streams(now);
    }

    /// Load the persisted guard list.
    pub fn load_guard_state(&mut self, text: &str) -> Result<()> {
        self.guards.load_state(text)
    }

    pub fn guards(&self) -> &GuardManager {
        &self.guards
    }

    // ===== Output queues =====

    /// Drain the runtime work queue.
    pub fn take_actions(&mut self) -> Vec<Action> {
        self.actions.drain(..).collect()
    }

    /// Drain the controller events.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain()
    }

    /// Drain the bytes the transport of `link` should write.
    pub fn take_outbound(&mut self, link: LinkId) -> Vec<u8> {
        self.links
            .get_mut(&link)
            .map(|l| l.take_outbound())
            .unwrap_or_default()
    }

    // ===== Link lifecycle =====

    /// Dial a new link. The runtime performs the transport work and calls
    /// back [`Node::link_transport_ready`] or
    /// [`Node::link_transport_failed`].
    pub fn open_link(
        &mut self,
        addr: Ipv4Addr,
        port: u16,
        expected_identity: Option<RelayId>,
        now: u64,
    ) -> LinkId {
        let id = self.next_link_id;
        self.next_link_id += 1;
        let link = Link::new(id, addr, port, expected_identity, true, now);
        self.links.insert(id, link);
        self.actions.push_back(Action::OpenTransport { link: id, addr, port });
        self.events.or_conn(id, OrConnStatus::Launched, None);
        id
    }

    /// Register an inbound transport a listener accepted. The transport is
    /// already up; `link_transport_ready` should follow at once with the
    /// peer identity (or `link_transport_failed` if authentication came up
    /// empty).
    pub fn accept_link(&mut self, addr: Ipv4Addr, port: u16, now: u64) -> LinkId {
        let id = self.next_link_id;
        self.next_link_id += 1;
        let link = Link::new(id, addr, port, None, false, now);
        self.links.insert(id, link);
        id
    }

    /// The transport for `link` is up and authenticated `peer`.
    pub fn link_transport_ready(&mut self, link_id: LinkId, peer: RelayId, now: u64) -> Result<()> {
        let our_identity = self.identity;
        let result = match self.links.get_mut(&link_id) {
            Some(link) => link.transport_ready(our_identity.as_ref(), peer, now),
            None => return Err(Error::Internal(format!("no such link {}", link_id))),
        };

        match result {
            Ok(()) => {
                self.events.or_conn(link_id, OrConnStatus::Connected, None);
                // Guard bookkeeping happens on transport success, before the
                // link handshake: reachability is a transport property.
                if self.guards.get(&peer).is_some() {
                    let drop_now =
                        self.guards
                            .register_connect_status(&peer, true, now, &mut self.events);
                    if drop_now {
                        self.close_link(link_id, "yielding to preferred guard", now);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.events
                    .or_conn(link_id, OrConnStatus::Failed, Some("OR_IDENTITY".into()));
                self.fail_link_waiters(link_id, now);
                self.remove_link(link_id, now);
                Err(e)
            }
        }
    }

    /// The transport for `link` could not be established.
    pub fn link_transport_failed(&mut self, link_id: LinkId, reason: &str, now: u64) {
        log::warn!("⚠️ link {} failed: {}", link_id, reason);
        if let Some(link) = self.links.get(&link_id) {
            if let Some(peer) = link.expected_identity {
                if self.guards.get(&peer).is_some() {
                    self.guards
                        .register_connect_status(&peer, false, now, &mut self.events);
                }
            }
        }
        self.events
            .or_conn(link_id, OrConnStatus::Failed, Some(reason.to_string()));
        self.fail_link_waiters(link_id, now);
        self.remove_link(link_id, now);
    }

    /// Feed transport bytes into a link and dispatch every complete cell.
    ///
    /// A cell-decode or link-handshake protocol error closes the whole
    /// link; every circuit on it is destroyed.
    pub fn deliver_inbound(&mut self, link_id: LinkId, bytes: &[u8], now: u64) -> Result<()> {
        match self.links.get_mut(&link_id) {
            Some(link) => link.push_inbound(bytes, now),
            None => return Err(Error::Internal(format!("no such link {}", link_id))),
        }

        let was_open = self
            .links
            .get(&link_id)
            .map(|l| l.is_open())
            .unwrap_or(false);
        loop {
            let link = match self.links.get_mut(&link_id) {
                Some(l) => l,
                None => return Ok(()), // closed while dispatching
            };
            match link.next_cell() {
                Ok(Some(Decoded::Fixed(cell))) => {
                    self.dispatch_cell(link_id, cell, now);
                }
                Ok(Some(_)) => {
                    return Err(Error::Internal(
                        "link surfaced a non-fixed cell".into(),
                    ));
                }
                Ok(None) => {
                    // The link handshake may just have finished.
                    let is_open = self
                        .links
                        .get(&link_id)
                        .map(|l| l.is_open())
                        .unwrap_or(false);
                    if !was_open && is_open {
                        self.link_opened(link_id, now);
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("⚠️ link {}: {}", link_id, e);
                    self.close_link(link_id, "protocol error", now);
                    return Err(e);
                }
            }
        }
    }

    /// The link handshake finished; circuits queued on it may proceed.
    fn link_opened(&mut self, link_id: LinkId, now: u64) {
        let waiters = self.link_waiters.remove(&link_id).unwrap_or_default();
        for circuit in waiters {
            self.continue_with_link(circuit, link_id, now);
        }
    }

    /// Close a link and destroy everything on it.
    pub fn close_link(&mut self, link_id: LinkId, reason: &str, now: u64) {
        log::info!("🔒 closing link {}: {}", link_id, reason);
        self.fail_link_waiters(link_id, now);

        let circuit_ids: Vec<CircuitId> = self
            .links
            .get(&link_id)
            .map(|l| l.circuits.values().copied().collect())
            .unwrap_or_default();
        for id in circuit_ids {
            if let Some(mut circ) = self.circuits.remove(&id) {
                self.close_circuit_checked_out(
                    &mut circ,
                    DestroyReason::ChannelClosed,
                    Some(link_id),
                    now,
                );
            }
        }

        self.events
            .or_conn(link_id, OrConnStatus::Closed, Some(reason.to_string()));
        self.remove_link(link_id, now);
    }

    fn remove_link(&mut self, link_id: LinkId, _now: u64) {
        if let Some(mut link) = self.links.remove(&link_id) {
            link.state = LinkState::Closed;
            self.actions.push_back(Action::CloseTransport { link: link_id });
        }
    }

    /// Fail every circuit that was waiting for this link to come up.
    fn fail_link_waiters(&mut self, link_id: LinkId, now: u64) {
        let waiters = self.link_waiters.remove(&link_id).unwrap_or_default();
        for id in waiters {
            if let Some(mut circ) = self.circuits.remove(&id) {
                self.close_circuit_checked_out(
                    &mut circ,
                    DestroyReason::ConnectFailed,
                    Some(link_id),
                    now,
                );
            }
        }
    }

    /// Find an open, non-obsolete link to `identity`.
    pub(crate) fn find_open_link_to(&self, identity: &RelayId) -> Option<LinkId> {
        self.links
            .values()
            .find(|l| {
                l.is_open()
                    && l.peer_identity.as_ref() == Some(identity)
                    && !self.link_is_obsolete(l)
            })
            .map(|l| l.id)
    }

    fn link_is_obsolete(&self, link: &Link) -> bool {
        match (self.cfg.link_obsolete, link.protocol_version) {
            (Some(pred), Some(version)) => pred(version),
            _ => false,
        }
    }

    // ===== Cell dispatch =====

    fn dispatch_cell(&mut self, link_id: LinkId, cell: Cell, now: u64) {
        match cell.command {
            CellCommand::Create | CellCommand::CreateFast => {
                self.handle_create_cell(link_id, cell, now);
            }
            CellCommand::Created | CellCommand::CreatedFast => {
                self.handle_created_cell(link_id, cell, now);
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                self.handle_relay_cell(link_id, cell, now);
            }
            CellCommand::Destroy => {
                let reason = DestroyReason::from_u8(cell.payload.first().copied().unwrap_or(0));
                self.handle_destroy(link_id, cell.circ_id, reason, now);
            }
            // Consumed by the link layer before reaching here.
            CellCommand::Padding | CellCommand::Versions | CellCommand::Netinfo => {}
        }
    }

    fn handle_destroy(&mut self, link_id: LinkId, circ_id: u16, reason: DestroyReason, now: u64) {
        let circuit = self
            .links
            .get(&link_id)
            .and_then(|l| l.circuits.get(&circ_id))
            .copied();
        let circuit = match circuit {
            Some(c) => c,
            None => {
                log::debug!("DESTROY for unknown circuit {} on link {}", circ_id, link_id);
                return;
            }
        };
        log::info!(
            "💥 circuit {} destroyed by peer (reason {})",
            circuit,
            reason.name()
        );
        if let Some(mut circ) = self.circuits.remove(&circuit) {
            self.close_circuit_checked_out(&mut circ, reason, Some(link_id), now);
        }
    }

    // ===== Circuit table =====

    pub(crate) fn alloc_circuit_id(&mut self) -> CircuitId {
        let id = self.next_circuit_id;
        self.next_circuit_id += 1;
        id
    }

    pub(crate) fn lookup_circuit(&self, link_id: LinkId, circ_id: u16) -> Option<CircuitId> {
        self.links
            .get(&link_id)
            .and_then(|l| l.circuits.get(&circ_id))
            .copied()
    }

    pub fn circuit_state(&self, id: CircuitId) -> Option<CircuitState> {
        self.circuits.get(&id).map(|c| c.state)
    }

    /// Number of hops with installed keys on an origin circuit.
    pub fn circuit_hop_count(&self, id: CircuitId) -> Option<usize> {
        self.circuits.get(&id).map(|c| c.cpath.len())
    }

    /// Close a circuit, propagating DESTROY to both neighbors.
    pub fn close_circuit(&mut self, id: CircuitId, reason: DestroyReason, now: u64) {
        if let Some(mut circ) = self.circuits.remove(&id) {
            self.close_circuit_checked_out(&mut circ, reason, None, now);
        }
    }

    /// Close a checked-out circuit: propagate DESTROY (except toward the
    /// side that initiated, if any), detach from links, end streams, tell
    /// the controller. The circuit must not be reinserted afterwards.
    pub(crate) fn close_circuit_checked_out(
        &mut self,
        circ: &mut Circuit,
        reason: DestroyReason,
        initiated_by: Option<LinkId>,
        now: u64,
    ) {
        if circ.is_closed() {
            return;
        }
        let was_open = circ.state == CircuitState::Open;
        circ.state = CircuitState::Closed;

        for attachment in [circ.prev, circ.next].into_iter().flatten() {
            if let Some(link) = self.links.get_mut(&attachment.link) {
                if Some(attachment.link) != initiated_by && link.is_open() {
                    let cell = Cell {
                        circ_id: attachment.circ_id,
                        command: CellCommand::Destroy,
                        payload: vec![reason as u8],
                    };
                    link.enqueue_cell(&cell);
                }
                link.detach_circuit(attachment.circ_id, now);
            }
        }

        // Streams die with their circuit; outstanding exit work is
        // cancelled by tag.
        let circuit_id = circ.id;
        self.tags.retain(|_, (c, _)| *c != circuit_id);
        for (stream_id, stream) in circ.streams.drain() {
            self.events.stream(
                circuit_id,
                stream_id,
                StreamStatus::Closed,
                Some("DESTROY".into()),
            );
            // Give the origin-side application another shot if the stream
            // never got connected.
            if let Some(pending) = stream.into_pending(now) {
                self.pending_streams.push_back(pending);
            }
        }

        let status = if was_open {
            CircStatus::Closed
        } else {
            CircStatus::Failed
        };
        self.events
            .circ(circuit_id, status, Some(reason.name().to_string()));
    }

    // ===== Timers =====

    /// Drive every deadline: handshake timeouts, circuit retirement, idle
    /// links, guard persistence, pending-stream attachment.
    pub fn tick(&mut self, now: u64) {
        // Handshake timeouts.
        let expired: Vec<CircuitId> = self
            .circuits
            .values()
            .filter(|c| matches!(c.build_deadline, Some(d) if d <= now))
            .map(|c| c.id)
            .collect();
        for id in expired {
            log::warn!("⚠️ circuit {} build timed out", id);
            self.close_circuit(id, DestroyReason::Timeout, now);
        }

        // Retire old dirty circuits with no remaining streams.
        let retire: Vec<CircuitId> = self
            .circuits
            .values()
            .filter(|c| {
                c.state == CircuitState::Open
                    && c.streams.is_empty()
                    && matches!(c.dirty_since, Some(t)
                        if now.saturating_sub(t) >= self.cfg.max_circuit_dirtiness_secs)
            })
            .map(|c| c.id)
            .collect();
        for id in retire {
            log::debug!("retiring worn-out circuit {}", id);
            self.close_circuit(id, DestroyReason::Finished, now);
        }

        // Lazily close idle links.
        let idle: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| {
                l.is_open()
                    && matches!(l.idle_since, Some(t)
                        if now.saturating_sub(t) >= self.cfg.link_idle_timeout_secs)
            })
            .map(|l| l.id)
            .collect();
        for id in idle {
            self.close_link(id, "idle", now);
        }

        // Guard-state persistence.
        if self.guards.needs_persist(&self.cfg, now) {
            self.actions.push_back(Action::PersistGuardState {
                contents: self.guards.encode_state(),
            });
            self.guards.note_persisted(now);
            log::debug!("💾 guard state scheduled for persistence");
        }

        self.attach_pending_streams(now);
    }

    // ===== Onion-key lifecycle =====

    /// Rotate the onion key pair. CREATE payloads sealed under the old
    /// primary stay answerable until the next rotation.
    pub fn rotate_onion_keys(&mut self, _now: u64) -> Result<()> {
        self.provider.rotate_onion_keys()?;
        log::info!("🔑 onion keys rotated");
        self.actions.push_back(Action::RespawnWorkers);
        Ok(())
    }
}
