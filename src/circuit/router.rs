//! Relay-cell routing
//!
//! Every inbound RELAY/RELAY_EARLY cell takes one pass through here:
//! identify the travel direction from the arrival link, apply the cipher
//! pass(es), check recognition, and either consume the cell locally or
//! forward it on the opposite link. Consumed cells are dispatched by relay
//! command; DATA cells run the two-level flow-control accounting.
//!
//! The sending half lives here too: stamping a relay cell at its target
//! hop and wrapping it in the layers below (origin side), or stamping with
//! our single layer toward the origin (relay side).

use crate::circuit::{Circuit, CircuitRole};
use crate::error::{Error, Result};
use crate::events::StreamStatus;
use crate::link::LinkId;
use crate::node::{Action, Node};
use crate::protocol::cell::{
    Cell, CellCommand, EndReason, RelayCell, RelayCommand, PAYLOAD_LEN,
};
use crate::protocol::crypto::CellDirection;
use std::net::Ipv4Addr;

impl Node {
    /// Entry point for an inbound RELAY or RELAY_EARLY cell.
    pub(crate) fn handle_relay_cell(&mut self, link_id: LinkId, cell: Cell, now: u64) {
        let circuit_id = match self.lookup_circuit(link_id, cell.circ_id) {
            Some(id) => id,
            None => {
                log::warn!(
                    "⚠️ relay cell for unknown circuit {} on link {}",
                    cell.circ_id,
                    link_id
                );
                return;
            }
        };
        let mut circ = match self.circuits.remove(&circuit_id) {
            Some(c) => c,
            None => return,
        };
        let was_open = circ.state == crate::circuit::CircuitState::Open;

        if let Err(e) = self.route_relay_payload(&mut circ, link_id, cell, now) {
            log::warn!("⚠️ circuit {}: {}", circuit_id, e);
            self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
        }
        let became_open = !was_open && circ.state == crate::circuit::CircuitState::Open;
        if !circ.is_closed() {
            self.circuits.insert(circuit_id, circ);
        }
        if became_open {
            // An EXTENDED may just have finished the build; waiting
            // streams can attach now.
            self.attach_pending_streams(now);
        }
    }

    fn route_relay_payload(
        &mut self,
        circ: &mut Circuit,
        link_id: LinkId,
        cell: Cell,
        now: u64,
    ) -> Result<()> {
        let mut payload = cell.payload;
        if payload.len() != PAYLOAD_LEN {
            return Err(Error::Protocol("relay cell with short payload".into()));
        }
        let from_next = circ
            .next
            .map_or(false, |a| a.link == link_id && a.circ_id == cell.circ_id);
        let from_prev = circ
            .prev
            .map_or(false, |a| a.link == link_id && a.circ_id == cell.circ_id);

        match circ.role {
            CircuitRole::Origin => {
                if !from_next {
                    return Err(Error::Internal(
                        "relay cell arrived on a link this circuit does not use".into(),
                    ));
                }
                // Peel one layer per hop, in order, until some hop
                // recognizes the cell.
                let mut consumed_at = None;
                for i in 0..circ.cpath.len() {
                    let crypt = match circ.cpath[i].crypt.as_mut() {
                        Some(c) => c,
                        None => break,
                    };
                    crypt.apply_cipher(CellDirection::Inbound, &mut payload);
                    if crypt.recognize(CellDirection::Inbound, &mut payload) {
                        consumed_at = Some(i);
                        break;
                    }
                }
                let hop = consumed_at
                    .ok_or_else(|| Error::Protocol("relay cell recognized by no hop".into()))?;
                self.dispatch_at_origin(circ, hop, &payload, now)
            }

            CircuitRole::Relay => {
                let crypt = circ
                    .relay_crypt
                    .as_mut()
                    .ok_or_else(|| Error::Internal("relay circuit without keys".into()))?;
                if from_prev {
                    // Outbound: peel our layer, consume if addressed here,
                    // else pass along.
                    crypt.apply_cipher(CellDirection::Outbound, &mut payload);
                    if crypt.recognize(CellDirection::Outbound, &mut payload) {
                        return self.dispatch_at_relay(circ, &payload, now);
                    }
                    match circ.next {
                        Some(next) => {
                            self.forward_cell(next.link, next.circ_id, cell.command, payload);
                            Ok(())
                        }
                        None => Err(Error::Protocol(
                            "unrecognized relay cell at the last hop".into(),
                        )),
                    }
                } else if from_next {
                    // Inbound: add our layer and pass toward the origin.
                    // Only the origin recognizes inbound cells.
                    crypt.apply_cipher(CellDirection::Inbound, &mut payload);
                    match circ.prev {
                        Some(prev) => {
                            self.forward_cell(prev.link, prev.circ_id, cell.command, payload);
                            Ok(())
                        }
                        None => Err(Error::Internal(
                            "relay circuit with no previous side".into(),
                        )),
                    }
                } else {
                    Err(Error::Internal(
                        "relay cell arrived on a link this circuit does not use".into(),
                    ))
                }
            }
        }
    }

    fn forward_cell(&mut self, link_id: LinkId, circ_id: u16, command: CellCommand, payload: Vec<u8>) {
        if let Some(link) = self.links.get_mut(&link_id) {
            // RELAY_EARLY keeps its command across hops.
            match Cell::new(circ_id, command, payload) {
                Ok(cell) => link.enqueue_cell(&cell),
                Err(e) => log::warn!("⚠️ dropping unforwardable cell: {}", e),
            }
        }
    }

    // ===== Consumed-cell dispatch =====

    fn dispatch_at_origin(
        &mut self,
        circ: &mut Circuit,
        hop: usize,
        payload: &[u8],
        now: u64,
    ) -> Result<()> {
        // An unknown relay command is dropped, not fatal.
        if RelayCommand::from_u8(payload[0]).is_none() {
            log::warn!("⚠️ ignoring relay cell with unknown command {}", payload[0]);
            return Ok(());
        }
        let rc = RelayCell::from_payload(payload)?;
        log::debug!(
            "circuit {}: {:?} from hop {} (stream {})",
            circ.id,
            rc.command,
            hop,
            rc.stream_id
        );

        match rc.command {
            RelayCommand::Data => self.origin_data(circ, hop, rc, now),
            RelayCommand::Connected => self.origin_connected(circ, rc),
            RelayCommand::End => self.origin_end(circ, rc, now),
            RelayCommand::Sendme => self.handle_sendme(circ, Some(hop), rc),
            RelayCommand::Extended => self.handle_extended(circ, hop, rc, now),
            RelayCommand::Truncated => self.handle_truncated(circ, hop, rc, now),
            RelayCommand::Drop => Ok(()),
            RelayCommand::Resolved => {
                log::warn!("ignoring unsolicited RESOLVED on circuit {}", circ.id);
                Ok(())
            }
            RelayCommand::Begin
            | RelayCommand::Extend
            | RelayCommand::Truncate
            | RelayCommand::Resolve => Err(Error::Protocol(format!(
                "{:?} is not valid toward an origin",
                rc.command
            ))),
        }
    }

    fn dispatch_at_relay(&mut self, circ: &mut Circuit, payload: &[u8], now: u64) -> Result<()> {
        if RelayCommand::from_u8(payload[0]).is_none() {
            log::warn!("⚠️ ignoring relay cell with unknown command {}", payload[0]);
            return Ok(());
        }
        let rc = RelayCell::from_payload(payload)?;
        log::debug!(
            "circuit {}: {:?} for us as relay (stream {})",
            circ.id,
            rc.command,
            rc.stream_id
        );

        match rc.command {
            RelayCommand::Extend => {
                if rc.stream_id != 0 {
                    return Err(Error::Protocol("EXTEND with nonzero stream id".into()));
                }
                if circ.next.is_some() {
                    return Err(Error::Protocol("EXTEND on an already-extended circuit".into()));
                }
                self.handle_extend_request(circ, rc, now)
            }
            RelayCommand::Begin => self.handle_begin(circ, rc, now),
            RelayCommand::Data => self.exit_data(circ, rc, now),
            RelayCommand::End => self.exit_end(circ, rc),
            RelayCommand::Sendme => self.handle_sendme(circ, None, rc),
            RelayCommand::Truncate => self.handle_truncate(circ, now),
            RelayCommand::Drop => Ok(()),
            RelayCommand::Resolve | RelayCommand::Resolved => {
                log::warn!("ignoring {:?} on circuit {}", rc.command, circ.id);
                Ok(())
            }
            RelayCommand::Connected | RelayCommand::Extended | RelayCommand::Truncated => {
                Err(Error::Protocol(format!(
                    "{:?} is not valid toward a relay",
                    rc.command
                )))
            }
        }
    }

    // ===== DATA and flow control =====

    fn origin_data(&mut self, circ: &mut Circuit, hop: usize, rc: RelayCell, now: u64) -> Result<()> {
        // Circuit-level window for the hop the data came from. A violation
        // here is circuit-fatal.
        if circ.cpath[hop].windows.deliver.note_delivered()? {
            let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new())?;
            self.send_relay_cell_from_origin(circ, hop, &sendme, false)?;
        }

        let stream_id = rc.stream_id;
        let delivery = circ
            .streams
            .get_mut(&stream_id)
            .map(|s| s.windows.deliver.note_delivered());
        match delivery {
            None => {
                log::warn!("DATA for unknown stream {} on circuit {}", stream_id, circ.id);
            }
            Some(Err(_)) => {
                // The peer overran one stream's window: that stream dies,
                // the circuit survives.
                self.send_end(circ, stream_id, EndReason::TorProtocol, None, now)?;
            }
            Some(Ok(owed)) => {
                self.actions.push_back(Action::DeliverData {
                    circuit: circ.id,
                    stream: stream_id,
                    data: rc.data,
                });
                if owed {
                    let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new())?;
                    self.send_relay_cell_from_origin(circ, hop, &sendme, false)?;
                }
            }
        }
        Ok(())
    }

    fn exit_data(&mut self, circ: &mut Circuit, rc: RelayCell, now: u64) -> Result<()> {
        if circ.windows.deliver.note_delivered()? {
            let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new())?;
            self.send_relay_cell_toward_origin(circ, &sendme)?;
        }

        let stream_id = rc.stream_id;
        let delivery = circ
            .streams
            .get_mut(&stream_id)
            .map(|s| s.windows.deliver.note_delivered());
        match delivery {
            None => {
                log::warn!("DATA for unknown stream {} on circuit {}", stream_id, circ.id);
            }
            Some(Err(_)) => {
                self.send_end(circ, stream_id, EndReason::TorProtocol, None, now)?;
            }
            Some(Ok(owed)) => {
                self.actions.push_back(Action::DeliverData {
                    circuit: circ.id,
                    stream: stream_id,
                    data: rc.data,
                });
                if owed {
                    let sendme = RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new())?;
                    self.send_relay_cell_toward_origin(circ, &sendme)?;
                }
            }
        }
        Ok(())
    }

    /// SENDME: replenish a package window and resume whatever it was
    /// holding back.
    fn handle_sendme(&mut self, circ: &mut Circuit, origin_hop: Option<usize>, rc: RelayCell) -> Result<()> {
        if rc.stream_id == 0 {
            let window = match (circ.role, origin_hop) {
                (CircuitRole::Origin, Some(hop)) => &mut circ.cpath[hop].windows,
                (CircuitRole::Relay, _) => &mut circ.windows,
                (CircuitRole::Origin, None) => {
                    return Err(Error::Internal("circuit SENDME with no hop".into()))
                }
            };
            window.package.note_sendme()?;
            let ids: Vec<u16> = circ.streams.keys().copied().collect();
            for id in ids {
                self.flush_stream(circ, id)?;
            }
        } else {
            match circ.streams.get_mut(&rc.stream_id) {
                Some(stream) => {
                    stream.windows.package.note_sendme()?;
                }
                None => {
                    log::warn!("SENDME for unknown stream {}", rc.stream_id);
                    return Ok(());
                }
            }
            self.flush_stream(circ, rc.stream_id)?;
        }
        Ok(())
    }

    // ===== Origin-side stream cells =====

    fn origin_connected(&mut self, circ: &mut Circuit, rc: RelayCell) -> Result<()> {
        let stream = match circ.streams.get_mut(&rc.stream_id) {
            Some(s) => s,
            None => {
                log::warn!("CONNECTED for unknown stream {}", rc.stream_id);
                return Ok(());
            }
        };
        let addr = if rc.data.len() >= 4 {
            Some(Ipv4Addr::new(rc.data[0], rc.data[1], rc.data[2], rc.data[3]))
        } else {
            None
        };
        stream.note_connected(addr);
        log::info!(
            "✅ stream {} on circuit {} connected{}",
            rc.stream_id,
            circ.id,
            addr.map(|a| format!(" ({})", a)).unwrap_or_default()
        );
        self.events
            .stream(circ.id, rc.stream_id, StreamStatus::Connected, None);
        Ok(())
    }

    fn origin_end(&mut self, circ: &mut Circuit, rc: RelayCell, now: u64) -> Result<()> {
        let stream = match circ.streams.remove(&rc.stream_id) {
            Some(s) => s,
            None => {
                log::warn!("END for unknown stream {}", rc.stream_id);
                return Ok(());
            }
        };
        let reason = EndReason::from_u8(rc.data.first().copied().unwrap_or(0));
        let resolved = if reason == EndReason::ExitPolicy && rc.data.len() >= 5 {
            Some(Ipv4Addr::new(rc.data[1], rc.data[2], rc.data[3], rc.data[4]))
        } else {
            None
        };
        log::info!(
            "🔒 stream {} ended by remote (reason {})",
            rc.stream_id,
            reason.name()
        );
        self.events.stream(
            circ.id,
            rc.stream_id,
            StreamStatus::Closed,
            Some(reason.name().to_string()),
        );

        // An exit-policy refusal earns the stream another attachment on a
        // different circuit, armed with the resolved address.
        if reason == EndReason::ExitPolicy {
            if let Some(mut pending) = stream.into_pending(now) {
                if pending.resolved_hint.is_none() {
                    pending.resolved_hint = resolved;
                }
                self.pending_streams.push_back(pending);
                self.attach_pending_streams(now);
            }
        }
        Ok(())
    }

    fn exit_end(&mut self, circ: &mut Circuit, rc: RelayCell) -> Result<()> {
        let circuit_id = circ.id;
        if circ.streams.remove(&rc.stream_id).is_some() {
            // Cancel any resolve/connect still in flight for it.
            self.tags
                .retain(|_, (c, s)| !(*c == circuit_id && *s == rc.stream_id));
            self.events.stream(
                circuit_id,
                rc.stream_id,
                StreamStatus::Closed,
                Some("remote END".into()),
            );
        }
        Ok(())
    }

    // ===== Sending =====

    /// Stamp a relay cell at `hop` and wrap it in every layer at or below
    /// that hop, then ship it on the circuit's outbound link.
    pub(crate) fn send_relay_cell_from_origin(
        &mut self,
        circ: &mut Circuit,
        hop: usize,
        rc: &RelayCell,
        early: bool,
    ) -> Result<()> {
        let next = circ
            .next
            .ok_or_else(|| Error::Internal("origin circuit with no outbound link".into()))?;
        let mut payload = rc.to_payload();

        {
            let crypt = circ.cpath[hop]
                .crypt
                .as_mut()
                .ok_or_else(|| Error::Internal("sending through a keyless hop".into()))?;
            crypt.stamp(CellDirection::Outbound, &mut payload)?;
        }
        for i in (0..=hop).rev() {
            let crypt = circ.cpath[i]
                .crypt
                .as_mut()
                .ok_or_else(|| Error::Internal("sending through a keyless hop".into()))?;
            crypt.apply_cipher(CellDirection::Outbound, &mut payload);
        }

        let command = if early {
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        let cell = Cell::new(next.circ_id, command, payload)?;
        match self.links.get_mut(&next.link) {
            Some(link) => {
                link.enqueue_cell(&cell);
                Ok(())
            }
            None => Err(Error::Internal("outbound link is gone".into())),
        }
    }

    /// Stamp a relay cell with our single layer and ship it toward the
    /// origin.
    pub(crate) fn send_relay_cell_toward_origin(
        &mut self,
        circ: &mut Circuit,
        rc: &RelayCell,
    ) -> Result<()> {
        let prev = circ
            .prev
            .ok_or_else(|| Error::Internal("relay circuit with no previous side".into()))?;
        let mut payload = rc.to_payload();
        let crypt = circ
            .relay_crypt
            .as_mut()
            .ok_or_else(|| Error::Internal("relay circuit without keys".into()))?;
        crypt.stamp(CellDirection::Inbound, &mut payload)?;
        crypt.apply_cipher(CellDirection::Inbound, &mut payload);

        let cell = Cell::new(prev.circ_id, CellCommand::Relay, payload)?;
        match self.links.get_mut(&prev.link) {
            Some(link) => {
                link.enqueue_cell(&cell);
                Ok(())
            }
            None => Err(Error::Internal("previous link is gone".into())),
        }
    }
}
