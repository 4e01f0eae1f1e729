//! Circuit building
//!
//! The origin side plans a path and drives the handshake state machine,
//! one incoming cell per transition:
//!
//! ```text
//! planning ─▶ link-waiting ─▶ h[i] awaiting keys ─▶ … ─▶ OPEN
//!                      CREATED / CREATED_FAST / EXTENDED install keys
//! ```
//!
//! The relay side answers CREATE/CREATE_FAST, and services EXTEND by
//! dialing the named next hop, buffering the carried handshake until the
//! link is up, and splicing the two sides into one circuit.

use crate::circuit::{
    Attachment, Circuit, CircuitId, CircuitPurpose, CircuitState, HopSpec, HopState,
};
use crate::error::{Error, Result};
use crate::events::CircStatus;
use crate::link::LinkId;
use crate::netdir::RelayId;
use crate::node::Node;
use crate::path::{choose_relay, family_exclusions, PathConstraints, PathSlot};
use crate::protocol::cell::{Cell, CellCommand, DestroyReason, RelayCell, RelayCommand};
use crate::protocol::crypto::HopCrypt;
use crate::protocol::handshake::{
    fast_server, tap_server, ExtendRequest, FastClientHandshake, PendingHandshake,
    TapClientHandshake, CREATED_FAST_LEN, CREATED_PAYLOAD_LEN, CREATE_FAST_LEN,
    CREATE_PAYLOAD_LEN,
};
use std::collections::HashSet;
use std::net::Ipv4Addr;

impl Node {
    // ===== Launching =====

    /// Plan and start building a circuit. Returns its id; progress is
    /// reported through CIRC events.
    pub fn launch_circuit(
        &mut self,
        purpose: CircuitPurpose,
        exit_hint: Option<RelayId>,
        now: u64,
    ) -> Result<CircuitId> {
        self.launch_circuit_inner(purpose, exit_hint, None, now)
    }

    /// Launch a general circuit whose exit must allow `addr_hint:port`.
    pub(crate) fn launch_circuit_for_target(
        &mut self,
        addr_hint: Option<Ipv4Addr>,
        port: u16,
        now: u64,
    ) -> Result<CircuitId> {
        self.launch_circuit_inner(CircuitPurpose::General, None, Some((addr_hint, Some(port))), now)
    }

    fn launch_circuit_inner(
        &mut self,
        purpose: CircuitPurpose,
        exit_hint: Option<RelayId>,
        target: Option<(Option<Ipv4Addr>, Option<u16>)>,
        now: u64,
    ) -> Result<CircuitId> {
        let path = self.plan_path(purpose, exit_hint, target, now)?;
        let id = self.alloc_circuit_id();
        let mut circ = Circuit::new_origin(
            id,
            purpose,
            path,
            self.cfg.circuit_window_start,
            self.cfg.circuit_window_increment,
            now,
        );
        log::info!(
            "🚀 launching circuit {} ({} hops, exit {})",
            id,
            circ.cpath.len(),
            circ.cpath.last().map(|h| h.spec.nickname.as_str()).unwrap_or("?")
        );
        self.events.circ(id, CircStatus::Launched, None);

        if let Err(e) = self.begin_building(&mut circ, now) {
            self.events
                .circ(id, CircStatus::Failed, Some(e.destroy_reason().name().into()));
            return Err(e);
        }
        self.circuits.insert(id, circ);
        Ok(id)
    }

    /// Choose the hops, back to front: exit first, then middles avoiding
    /// everything already chosen and its families, then the entry via the
    /// guard manager.
    fn plan_path(
        &mut self,
        purpose: CircuitPurpose,
        exit_hint: Option<RelayId>,
        target: Option<(Option<Ipv4Addr>, Option<u16>)>,
        now: u64,
    ) -> Result<Vec<HopSpec>> {
        let dir = self
            .netdir
            .as_ref()
            .ok_or_else(|| Error::Internal("no directory snapshot installed".into()))?;
        if dir.running_count() < 2 {
            return Err(Error::Resource("fewer than 2 usable relays known".into()));
        }

        let length = match purpose {
            CircuitPurpose::OneHop => 1,
            CircuitPurpose::Testing | CircuitPurpose::HsIntro => self.cfg.path_len,
            _ if exit_hint.is_some() => self.cfg.path_len + 1,
            _ => self.cfg.path_len,
        };

        // Exit first.
        let mut exclude: HashSet<RelayId> = HashSet::new();
        let exit = match exit_hint {
            Some(id) => dir
                .by_id(&id)
                .ok_or_else(|| Error::Resource(format!("requested exit {} not known", id)))?
                .clone(),
            None => {
                let mut constraints = PathConstraints::for_slot(PathSlot::Exit, &exclude);
                constraints.target = target;
                choose_relay(dir, &constraints, &mut *self.rng)
                    .ok_or_else(|| match target {
                        Some(_) => Error::PolicyRejected("no exit allows this target".into()),
                        None => Error::Resource("no usable exit relay".into()),
                    })?
                    .clone()
            }
        };
        family_exclusions(dir, &exit, &mut exclude);

        if length == 1 {
            return Ok(vec![HopSpec::from(&exit)]);
        }

        // Middles, avoiding everything chosen so far.
        let mut middles = Vec::new();
        for _ in 0..length.saturating_sub(2) {
            let constraints = PathConstraints::for_slot(PathSlot::Middle, &exclude);
            let middle = choose_relay(dir, &constraints, &mut *self.rng)
                .ok_or_else(|| Error::Resource("no usable middle relay".into()))?
                .clone();
            family_exclusions(dir, &middle, &mut exclude);
            middles.push(middle);
        }

        // Entry last, through the guard manager.
        let entry = self
            .guards
            .choose_entry(dir, &self.cfg, &exclude, &mut *self.rng, now, &mut self.events)
            .ok_or_else(|| Error::Resource("no usable entry relay".into()))?;

        let mut path = Vec::with_capacity(length);
        path.push(HopSpec::from(&entry));
        for middle in &middles {
            path.push(HopSpec::from(middle));
        }
        path.push(HopSpec::from(&exit));
        Ok(path)
    }

    /// Dial or reuse the first-hop link.
    fn begin_building(&mut self, circ: &mut Circuit, now: u64) -> Result<()> {
        let entry = &circ.cpath[0].spec;
        if let Some(link_id) = self.find_open_link_to(&entry.identity) {
            log::debug!("circuit {}: reusing open link {}", circ.id, link_id);
            return self.send_first_handshake(circ, link_id, now);
        }
        let (addr, port, identity) = (entry.addr, entry.port, entry.identity);
        let link_id = self.open_link(addr, port, Some(identity), now);
        self.link_waiters.entry(link_id).or_default().push(circ.id);
        Ok(())
    }

    /// A link some circuit was queued on finished its handshake.
    pub(crate) fn continue_with_link(&mut self, circuit_id: CircuitId, link_id: LinkId, now: u64) {
        let mut circ = match self.circuits.remove(&circuit_id) {
            Some(c) => c,
            None => return,
        };
        let result = match circ.pending_extend.take() {
            // Relay side: forward the buffered CREATE to the new neighbor.
            Some(req) => self.send_create_on_next(&mut circ, link_id, req.create_payload),
            // Origin side: open the first hop.
            None => self.send_first_handshake(&mut circ, link_id, now),
        };
        if let Err(e) = result {
            log::warn!("⚠️ circuit {}: {}", circuit_id, e);
            self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
        }
        if !circ.is_closed() {
            self.circuits.insert(circuit_id, circ);
        }
    }

    /// Send CREATE or CREATE_FAST for hop 0.
    ///
    /// The fast variant is chosen when permitted and the hop's onion key is
    /// unknown; the transport already authenticated the peer, which is what
    /// the fast handshake leans on.
    fn send_first_handshake(&mut self, circ: &mut Circuit, link_id: LinkId, now: u64) -> Result<()> {
        let circ_id = {
            let link = self
                .links
                .get_mut(&link_id)
                .ok_or_else(|| Error::Internal("first-hop link is gone".into()))?;
            if !link.is_open() {
                return Err(Error::Internal("first-hop link is not open".into()));
            }
            let circ_id = link.allocate_circ_id()?;
            link.attach_circuit(circ_id, circ.id)?;
            circ_id
        };
        circ.next = Some(Attachment {
            link: link_id,
            circ_id,
        });

        let use_fast = self.cfg.allow_create_fast && circ.cpath[0].spec.onion_key.is_empty();
        let (handshake, command, payload) = if use_fast {
            let (hs, payload) = FastClientHandshake::start(&mut *self.rng);
            (PendingHandshake::Fast(hs), CellCommand::CreateFast, payload)
        } else {
            if circ.cpath[0].spec.onion_key.is_empty() {
                return Err(Error::Internal(
                    "first hop has no onion key and the fast handshake is disabled".into(),
                ));
            }
            let (hs, payload) =
                TapClientHandshake::start(&mut *self.provider, &circ.cpath[0].spec.onion_key)?;
            (PendingHandshake::Tap(hs), CellCommand::Create, payload)
        };

        log::debug!(
            "circuit {}: sending {:?} to {}",
            circ.id,
            command,
            circ.cpath[0].spec.nickname
        );
        circ.cpath[0].handshake = Some(handshake);
        circ.cpath[0].state = HopState::AwaitingKeys;
        circ.build_deadline = Some(now + self.cfg.hop_timeout_secs);

        let cell = Cell::new(circ_id, command, payload)?;
        if let Some(link) = self.links.get_mut(&link_id) {
            link.enqueue_cell(&cell);
        }
        Ok(())
    }

    // ===== Handshake replies =====

    /// CREATED or CREATED_FAST arrived on a link.
    pub(crate) fn handle_created_cell(&mut self, link_id: LinkId, cell: Cell, now: u64) {
        let circuit_id = match self.lookup_circuit(link_id, cell.circ_id) {
            Some(id) => id,
            None => {
                log::warn!("⚠️ {:?} for unknown circuit {}", cell.command, cell.circ_id);
                return;
            }
        };
        let mut circ = match self.circuits.remove(&circuit_id) {
            Some(c) => c,
            None => return,
        };
        let was_open = circ.state == CircuitState::Open;

        if let Err(e) = self.created_cell_inner(&mut circ, link_id, cell, now) {
            log::warn!("⚠️ circuit {}: {}", circuit_id, e);
            self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
        }
        let became_open = !was_open && circ.state == CircuitState::Open;
        if !circ.is_closed() {
            self.circuits.insert(circuit_id, circ);
        }
        if became_open {
            self.attach_pending_streams(now);
        }
    }

    fn created_cell_inner(
        &mut self,
        circ: &mut Circuit,
        link_id: LinkId,
        cell: Cell,
        now: u64,
    ) -> Result<()> {
        let from_next = circ
            .next
            .map_or(false, |a| a.link == link_id && a.circ_id == cell.circ_id);
        if !from_next {
            return Err(Error::Protocol(format!(
                "{:?} arrived from the wrong side",
                cell.command
            )));
        }

        match circ.role {
            crate::circuit::CircuitRole::Origin => {
                let awaiting = circ
                    .awaiting_hop()
                    .ok_or_else(|| Error::Protocol("no handshake outstanding".into()))?;
                if awaiting != 0 {
                    return Err(Error::Protocol(format!(
                        "{:?} while extending to hop {}",
                        cell.command, awaiting
                    )));
                }
                let is_fast_reply = cell.command == CellCommand::CreatedFast;
                let pending_is_fast = circ.cpath[0]
                    .handshake
                    .as_ref()
                    .map(|h| h.is_fast())
                    .unwrap_or(false);
                if is_fast_reply != pending_is_fast {
                    return Err(Error::Protocol("handshake variant mismatch".into()));
                }
                let reply_len = if is_fast_reply {
                    CREATED_FAST_LEN
                } else {
                    CREATED_PAYLOAD_LEN
                };
                self.install_hop_keys(circ, &cell.payload[..reply_len], now)
            }
            crate::circuit::CircuitRole::Relay => {
                // The CREATE we forwarded for an EXTEND got its answer;
                // relay it back as EXTENDED.
                if cell.command == CellCommand::CreatedFast {
                    return Err(Error::Protocol("CREATED_FAST for an extended hop".into()));
                }
                let rc = RelayCell::new(
                    RelayCommand::Extended,
                    0,
                    cell.payload[..CREATED_PAYLOAD_LEN].to_vec(),
                )?;
                self.send_relay_cell_toward_origin(circ, &rc)?;
                circ.state = CircuitState::Open;
                Ok(())
            }
        }
    }

    /// EXTENDED consumed at the origin: same as CREATED, one hop further.
    pub(crate) fn handle_extended(
        &mut self,
        circ: &mut Circuit,
        hop: usize,
        rc: RelayCell,
        now: u64,
    ) -> Result<()> {
        let awaiting = circ
            .awaiting_hop()
            .ok_or_else(|| Error::Protocol("EXTENDED with no handshake outstanding".into()))?;
        if awaiting == 0 || hop != awaiting - 1 {
            return Err(Error::Protocol("EXTENDED from the wrong hop".into()));
        }
        if rc.data.len() < CREATED_PAYLOAD_LEN {
            return Err(Error::Protocol("short EXTENDED body".into()));
        }
        self.install_hop_keys(circ, &rc.data[..CREATED_PAYLOAD_LEN], now)
    }

    /// Finish the outstanding handshake, verify it, install the hop's
    /// symmetric state, and take the next build step.
    fn install_hop_keys(&mut self, circ: &mut Circuit, reply: &[u8], now: u64) -> Result<()> {
        let index = circ
            .awaiting_hop()
            .ok_or_else(|| Error::Internal("no hop awaiting keys".into()))?;
        let handshake = circ.cpath[index]
            .handshake
            .take()
            .ok_or_else(|| Error::Internal("awaiting hop has no handshake state".into()))?;
        let km = handshake.finish(&*self.provider, reply)?;
        circ.cpath[index].crypt = Some(HopCrypt::new(&km));
        circ.cpath[index].state = HopState::Open;
        log::info!(
            "🔑 circuit {}: keys installed for hop {} ({})",
            circ.id,
            index,
            circ.cpath[index].spec.nickname
        );
        self.proceed_build(circ, now)
    }

    /// Extend to the next planned hop, or declare the circuit open.
    fn proceed_build(&mut self, circ: &mut Circuit, now: u64) -> Result<()> {
        if circ.all_hops_open() {
            circ.state = CircuitState::Open;
            circ.build_deadline = None;
            log::info!("✅ circuit {} is open ({} hops)", circ.id, circ.cpath.len());
            self.events.circ(circ.id, CircStatus::Built, None);
            return Ok(());
        }
        self.events.circ(circ.id, CircStatus::Extended, None);
        let next_index = circ
            .cpath
            .iter()
            .position(|h| h.state == HopState::Closed)
            .ok_or_else(|| Error::Internal("no closed hop left to extend to".into()))?;
        self.send_extend(circ, next_index, now)
    }

    fn send_extend(&mut self, circ: &mut Circuit, target: usize, now: u64) -> Result<()> {
        let spec = circ.cpath[target].spec.clone();
        if spec.onion_key.is_empty() {
            return Err(Error::Internal(format!(
                "cannot extend to {} without its onion key",
                spec.nickname
            )));
        }
        let (handshake, create_payload) =
            TapClientHandshake::start(&mut *self.provider, &spec.onion_key)?;
        let request = ExtendRequest {
            addr: spec.addr,
            port: spec.port,
            create_payload,
            identity: spec.identity,
        };
        let rc = RelayCell::new(RelayCommand::Extend, 0, request.to_bytes()?)?;

        // Extensions ride RELAY_EARLY while the budget lasts.
        let early = circ.relay_early_remaining > 0;
        if early {
            circ.relay_early_remaining -= 1;
        }
        let stamp_at = target - 1;
        log::debug!(
            "circuit {}: extending to {} via hop {}",
            circ.id,
            spec.nickname,
            stamp_at
        );
        self.send_relay_cell_from_origin(circ, stamp_at, &rc, early)?;

        circ.cpath[target].handshake = Some(PendingHandshake::Tap(handshake));
        circ.cpath[target].state = HopState::AwaitingKeys;
        circ.build_deadline = Some(now + self.cfg.hop_timeout_secs);
        Ok(())
    }

    // ===== Truncation =====

    /// Ask hop `keep` of an origin circuit to drop everything beyond it.
    /// The local cpath is trimmed when the TRUNCATED confirmation arrives.
    pub fn truncate_circuit(&mut self, circuit: CircuitId, keep: usize, _now: u64) -> Result<()> {
        let mut circ = self
            .circuits
            .remove(&circuit)
            .ok_or_else(|| Error::Internal(format!("no such circuit {}", circuit)))?;
        let result = if circ.role != crate::circuit::CircuitRole::Origin {
            Err(Error::Internal("only an origin can truncate".into()))
        } else if keep + 1 >= circ.cpath.len() {
            Err(Error::Internal("nothing beyond that hop to drop".into()))
        } else {
            RelayCell::new(RelayCommand::Truncate, 0, Vec::new())
                .and_then(|rc| self.send_relay_cell_from_origin(&mut circ, keep, &rc, false))
        };
        if let Err(ref e) = result {
            log::warn!("⚠️ circuit {}: {}", circuit, e);
        }
        if !circ.is_closed() {
            self.circuits.insert(circuit, circ);
        }
        result
    }

    /// TRUNCATED consumed at the origin: hops beyond the sender are gone.
    pub(crate) fn handle_truncated(
        &mut self,
        circ: &mut Circuit,
        hop: usize,
        rc: RelayCell,
        now: u64,
    ) -> Result<()> {
        let reason = DestroyReason::from_u8(rc.data.first().copied().unwrap_or(0));
        log::info!(
            "✂️ circuit {} truncated at hop {} (reason {})",
            circ.id,
            hop,
            reason.name()
        );
        // Streams attached to the dropped hops die with them.
        let circuit_id = circ.id;
        let doomed: Vec<u16> = circ
            .streams
            .iter()
            .filter(|(_, s)| s.hop > hop)
            .map(|(id, _)| *id)
            .collect();
        for stream_id in doomed {
            if let Some(stream) = circ.streams.remove(&stream_id) {
                self.events.stream(
                    circuit_id,
                    stream_id,
                    crate::events::StreamStatus::Closed,
                    Some("DESTROY".into()),
                );
                if let Some(pending) = stream.into_pending(now) {
                    self.pending_streams.push_back(pending);
                }
            }
        }
        circ.cpath.truncate(hop + 1);
        Ok(())
    }

    /// TRUNCATE consumed at a relay: destroy our next side, confirm back.
    pub(crate) fn handle_truncate(&mut self, circ: &mut Circuit, now: u64) -> Result<()> {
        if let Some(next) = circ.next.take() {
            if let Some(link) = self.links.get_mut(&next.link) {
                if link.is_open() {
                    let cell = Cell::new(
                        next.circ_id,
                        CellCommand::Destroy,
                        vec![DestroyReason::Requested as u8],
                    )?;
                    link.enqueue_cell(&cell);
                }
                link.detach_circuit(next.circ_id, now);
            }
        }
        let rc = RelayCell::new(
            RelayCommand::Truncated,
            0,
            vec![DestroyReason::Requested as u8],
        )?;
        self.send_relay_cell_toward_origin(circ, &rc)
    }

    // ===== Relay side =====

    /// CREATE or CREATE_FAST arrived: answer it and set up a relay-side
    /// circuit.
    pub(crate) fn handle_create_cell(&mut self, link_id: LinkId, cell: Cell, now: u64) {
        if let Some(existing) = self.lookup_circuit(link_id, cell.circ_id) {
            log::warn!(
                "⚠️ {:?} on an in-use circuit id {}; destroying both",
                cell.command,
                cell.circ_id
            );
            self.close_circuit(existing, DestroyReason::Protocol, now);
            self.send_destroy(link_id, cell.circ_id, DestroyReason::Protocol);
            return;
        }

        let fast = cell.command == CellCommand::CreateFast;
        let served = if fast {
            if cell.payload.len() < CREATE_FAST_LEN {
                Err(Error::Protocol("short CREATE_FAST payload".into()))
            } else {
                fast_server(&mut *self.rng, &cell.payload[..CREATE_FAST_LEN])
            }
        } else if cell.payload.len() < CREATE_PAYLOAD_LEN {
            Err(Error::Protocol("short CREATE payload".into()))
        } else {
            tap_server(&mut *self.provider, &cell.payload[..CREATE_PAYLOAD_LEN])
        };

        let (reply, km) = match served {
            Ok(x) => x,
            Err(e) => {
                log::warn!("⚠️ failed to answer {:?}: {}", cell.command, e);
                self.send_destroy(link_id, cell.circ_id, e.destroy_reason());
                return;
            }
        };

        let id = self.alloc_circuit_id();
        let mut circ = Circuit::new_relay(
            id,
            Attachment {
                link: link_id,
                circ_id: cell.circ_id,
            },
            self.cfg.circuit_window_start,
            self.cfg.circuit_window_increment,
            now,
        );
        circ.relay_crypt = Some(HopCrypt::new(&km));

        if let Some(link) = self.links.get_mut(&link_id) {
            if let Err(e) = link.attach_circuit(cell.circ_id, id) {
                log::warn!("⚠️ {}", e);
                return;
            }
            let command = if fast {
                CellCommand::CreatedFast
            } else {
                CellCommand::Created
            };
            match Cell::new(cell.circ_id, command, reply) {
                Ok(answer) => link.enqueue_cell(&answer),
                Err(e) => log::warn!("⚠️ {}", e),
            }
        }
        log::info!(
            "🔗 serving new circuit {} from link {} (id {})",
            id,
            link_id,
            cell.circ_id
        );
        self.circuits.insert(id, circ);
    }

    fn send_destroy(&mut self, link_id: LinkId, circ_id: u16, reason: DestroyReason) {
        if let Some(link) = self.links.get_mut(&link_id) {
            if link.is_open() {
                if let Ok(cell) = Cell::new(circ_id, CellCommand::Destroy, vec![reason as u8]) {
                    link.enqueue_cell(&cell);
                }
            }
        }
    }

    /// EXTEND consumed on one of our relay circuits: dial (or reuse) the
    /// next-hop link and forward the carried CREATE.
    pub(crate) fn handle_extend_request(
        &mut self,
        circ: &mut Circuit,
        rc: RelayCell,
        now: u64,
    ) -> Result<()> {
        let request = ExtendRequest::from_bytes(&rc.data)?;
        log::info!(
            "📡 circuit {}: extend request toward {:?}",
            circ.id,
            request.identity
        );

        if let Some(link_id) = self.find_open_link_to(&request.identity) {
            return self.send_create_on_next(circ, link_id, request.create_payload);
        }

        let link_id = self.open_link(request.addr, request.port, Some(request.identity), now);
        circ.pending_extend = Some(request);
        circ.state = CircuitState::AwaitingLink;
        self.link_waiters.entry(link_id).or_default().push(circ.id);
        Ok(())
    }

    /// Wire our circuit to the next link and hand over the CREATE payload.
    fn send_create_on_next(
        &mut self,
        circ: &mut Circuit,
        link_id: LinkId,
        create_payload: Vec<u8>,
    ) -> Result<()> {
        let link = self
            .links
            .get_mut(&link_id)
            .ok_or_else(|| Error::Internal("next-hop link is gone".into()))?;
        let circ_id = link.allocate_circ_id()?;
        link.attach_circuit(circ_id, circ.id)?;
        circ.next = Some(Attachment {
            link: link_id,
            circ_id,
        });
        let cell = Cell::new(circ_id, CellCommand::Create, create_payload)?;
        link.enqueue_cell(&cell);
        // The previous side keeps flowing while the next hop answers.
        circ.state = CircuitState::Open;
        Ok(())
    }
}
