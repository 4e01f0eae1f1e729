//! Stream multiplexing
//!
//! Streams are application-level byte flows inside a circuit, one stream
//! id per flow. The origin side originates BEGIN cells and waits for
//! CONNECTED; the exit side parses BEGIN, resolves the host, connects, and
//! answers. Streams that cannot attach yet wait in a pending queue that is
//! consulted whenever a circuit opens.
//!
//! Packaging is strictly window-gated: bytes pile up in the stream's local
//! buffer and drain only while both the stream-level and the circuit-level
//! package windows are positive.

use crate::circuit::{Circuit, CircuitId, CircuitPurpose, CircuitRole, CircuitState};
use crate::error::{Error, Result};
use crate::events::StreamStatus;
use crate::node::{Action, Node};
use crate::protocol::cell::{EndReason, RelayCell, RelayCommand, RELAY_DATA_LEN};
use crate::protocol::flow_control::StreamWindows;
use std::net::Ipv4Addr;

/// Stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The frontend has not yet named a target (its business, not ours).
    SocksWait,
    /// Waiting for a suitable circuit.
    CircuitWait,
    /// BEGIN sent (origin) or TCP connect in flight (exit).
    Connecting,
    /// Bytes flow.
    Open,
    /// Exit side: hostname lookup in flight.
    Resolving,
    /// Terminal.
    Closed,
}

/// One stream endpoint bound to a circuit.
pub struct Stream {
    pub id: u16,
    pub state: StreamState,
    /// Index of the cpath hop this stream exits at (origin side).
    pub hop: usize,
    pub windows: StreamWindows,
    /// Bytes accepted from the local endpoint, not yet packaged.
    pub pending_out: Vec<u8>,
    /// Set once an END has been emitted for this stream.
    pub end_sent: bool,
    pub target_host: String,
    pub target_port: u16,
    /// Origin side: the application request this stream serves.
    pub request: Option<u64>,
    /// How many circuits this request has already tried.
    pub retries: u32,
    /// Exit side: the address the host resolved to.
    pub resolved_addr: Option<Ipv4Addr>,
    /// True on the exit side of the circuit.
    pub exit_side: bool,
}

impl Stream {
    pub fn new_origin(
        id: u16,
        hop: usize,
        host: &str,
        port: u16,
        windows: StreamWindows,
        request: u64,
        retries: u32,
    ) -> Self {
        Self {
            id,
            state: StreamState::Connecting,
            hop,
            windows,
            pending_out: Vec::new(),
            end_sent: false,
            target_host: host.to_string(),
            target_port: port,
            request: Some(request),
            retries,
            resolved_addr: None,
            exit_side: false,
        }
    }

    pub fn new_exit(id: u16, host: &str, port: u16, windows: StreamWindows) -> Self {
        Self {
            id,
            state: StreamState::Resolving,
            hop: 0,
            windows,
            pending_out: Vec::new(),
            end_sent: false,
            target_host: host.to_string(),
            target_port: port,
            request: None,
            retries: 0,
            resolved_addr: None,
            exit_side: true,
        }
    }

    /// CONNECTED arrived (origin side).
    pub fn note_connected(&mut self, addr: Option<Ipv4Addr>) {
        self.state = StreamState::Open;
        if addr.is_some() {
            self.resolved_addr = addr;
        }
    }

    /// Turn a not-yet-connected origin stream back into a pending request
    /// so it can try another circuit.
    pub(crate) fn into_pending(self, now: u64) -> Option<PendingStream> {
        if self.exit_side || self.state == StreamState::Open {
            return None;
        }
        let request = self.request?;
        Some(PendingStream {
            request,
            host: self.target_host,
            port: self.target_port,
            retries: self.retries + 1,
            resolved_hint: self.resolved_addr,
            created_at: now,
        })
    }
}

/// An application request waiting for a circuit.
#[derive(Debug, Clone)]
pub struct PendingStream {
    pub request: u64,
    pub host: String,
    pub port: u16,
    pub retries: u32,
    /// Address learned from an earlier EXITPOLICY refusal, used to pick a
    /// better exit next time.
    pub resolved_hint: Option<Ipv4Addr>,
    pub created_at: u64,
}

impl Node {
    // ===== Origin side =====

    /// The application wants a TCP-like connection to `host:port`.
    /// Returns a request id; progress arrives as STREAM events.
    pub fn open_stream(&mut self, host: &str, port: u16, now: u64) -> u64 {
        let request = self.next_request_id;
        self.next_request_id += 1;
        log::info!("📡 new stream request {} for {}:{}", request, host, port);
        self.pending_streams.push_back(PendingStream {
            request,
            host: host.to_string(),
            port,
            retries: 0,
            resolved_hint: None,
            created_at: now,
        });
        self.attach_pending_streams(now);
        request
    }

    /// Try to place every pending request on an open circuit; launch new
    /// circuits for the ports nothing usable serves yet.
    pub(crate) fn attach_pending_streams(&mut self, now: u64) {
        let pending: Vec<PendingStream> = self.pending_streams.drain(..).collect();
        for p in pending {
            if p.retries > self.cfg.max_stream_retries {
                log::warn!(
                    "⚠️ giving up on stream request {} after {} attempts",
                    p.request,
                    p.retries
                );
                self.events.stream(
                    0,
                    0,
                    StreamStatus::Failed,
                    Some(EndReason::Misc.name().to_string()),
                );
                continue;
            }
            if let Some(back) = self.attach_one(p, now) {
                self.pending_streams.push_back(back);
            }
        }
    }

    /// Attach one request. Returns the request when it must keep waiting.
    fn attach_one(&mut self, p: PendingStream, now: u64) -> Option<PendingStream> {
        let target = (p.resolved_hint, Some(p.port));
        let candidate = self
            .circuits
            .values()
            .find(|c| {
                c.role == CircuitRole::Origin
                    && c.purpose == CircuitPurpose::General
                    && c.all_hops_open()
                    && c.accepts_new_streams(self.cfg.max_circuit_dirtiness_secs, now)
                    && c.cpath
                        .last()
                        .map_or(false, |h| h.spec.exit_policy.evaluate(target.0, target.1).allows())
            })
            .map(|c| c.id);

        match candidate {
            Some(id) => {
                let mut circ = match self.circuits.remove(&id) {
                    Some(c) => c,
                    None => return Some(p),
                };
                if let Err(e) = self.bind_stream(&mut circ, &p, now) {
                    log::warn!("⚠️ failed to attach stream to circuit {}: {}", id, e);
                    self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
                }
                if !circ.is_closed() {
                    self.circuits.insert(id, circ);
                }
                None
            }
            None => {
                // One build per wanted port; don't stack duplicates.
                let building = self.circuits.values().any(|c| {
                    c.role == CircuitRole::Origin
                        && c.purpose == CircuitPurpose::General
                        && matches!(c.state, CircuitState::Building | CircuitState::AwaitingLink)
                        && c.cpath
                            .last()
                            .map_or(false, |h| h.spec.exit_policy.evaluate(target.0, target.1).allows())
                });
                if !building {
                    if let Err(e) = self.launch_circuit_for_target(p.resolved_hint, p.port, now) {
                        log::warn!(
                            "⚠️ no circuit possible for {}:{}: {}",
                            p.host,
                            p.port,
                            e
                        );
                        self.events.stream(
                            0,
                            0,
                            StreamStatus::Failed,
                            Some(e.end_reason().name().to_string()),
                        );
                        return None;
                    }
                }
                Some(p)
            }
        }
    }

    /// Allocate an id, send BEGIN, and park the stream in CONNECTING.
    fn bind_stream(&mut self, circ: &mut Circuit, p: &PendingStream, now: u64) -> Result<()> {
        let stream_id = circ.allocate_stream_id()?;
        let hop = circ
            .cpath
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::Internal("attaching to a hopless circuit".into()))?;
        let stream = Stream::new_origin(
            stream_id,
            hop,
            &p.host,
            p.port,
            StreamWindows::new(self.cfg.stream_window_start, self.cfg.stream_window_increment),
            p.request,
            p.retries,
        );
        circ.streams.insert(stream_id, stream);
        circ.mark_dirty(now);
        self.events.stream(
            circ.id,
            stream_id,
            StreamStatus::New,
            Some(format!("{}:{}", p.host, p.port)),
        );

        let begin = RelayCell::new(
            RelayCommand::Begin,
            stream_id,
            format!("{}:{}\0", p.host, p.port).into_bytes(),
        )?;
        self.send_relay_cell_from_origin(circ, hop, &begin, false)?;
        log::info!(
            "📤 BEGIN sent for stream {} on circuit {} ({}:{})",
            stream_id,
            circ.id,
            p.host,
            p.port
        );
        self.events
            .stream(circ.id, stream_id, StreamStatus::SentConnect, None);
        Ok(())
    }

    // ===== Data path =====

    /// Accept bytes from the local endpoint of a stream (application
    /// socket at the origin, TCP socket at the exit) and package as much
    /// as the windows allow.
    pub fn stream_send_data(
        &mut self,
        circuit: CircuitId,
        stream_id: u16,
        data: &[u8],
        _now: u64,
    ) -> Result<()> {
        let mut circ = self
            .circuits
            .remove(&circuit)
            .ok_or_else(|| Error::Internal(format!("no such circuit {}", circuit)))?;

        let result = match circ.streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.pending_out.extend_from_slice(data);
                self.flush_stream(&mut circ, stream_id)
            }
            None => Err(Error::Internal(format!("no such stream {}", stream_id))),
        };
        if !circ.is_closed() {
            self.circuits.insert(circuit, circ);
        }
        result
    }

    /// Package buffered bytes while both package windows are positive.
    pub(crate) fn flush_stream(&mut self, circ: &mut Circuit, stream_id: u16) -> Result<()> {
        loop {
            let origin = circ.role == CircuitRole::Origin;
            let hop;
            let chunk: Vec<u8> = {
                let stream = match circ.streams.get_mut(&stream_id) {
                    Some(s) => s,
                    None => return Ok(()),
                };
                if stream.pending_out.is_empty() || stream.state != StreamState::Open {
                    return Ok(());
                }
                hop = stream.hop;
                let circuit_ok = if origin {
                    circ.cpath
                        .get(hop)
                        .map_or(false, |h| h.windows.package.can_package())
                } else {
                    circ.windows.package.can_package()
                };
                if !circuit_ok || !stream.windows.package.can_package() {
                    return Ok(());
                }
                let n = stream.pending_out.len().min(RELAY_DATA_LEN);
                stream.pending_out.drain(..n).collect()
            };

            let rc = RelayCell::new(RelayCommand::Data, stream_id, chunk)?;
            if origin {
                self.send_relay_cell_from_origin(circ, hop, &rc, false)?;
                circ.cpath[hop].windows.package.note_packaged()?;
            } else {
                self.send_relay_cell_toward_origin(circ, &rc)?;
                circ.windows.package.note_packaged()?;
            }
            if let Some(stream) = circ.streams.get_mut(&stream_id) {
                stream.windows.package.note_packaged()?;
            }
        }
    }

    /// Close a stream from the local side. Idempotent.
    pub fn stream_close(&mut self, circuit: CircuitId, stream_id: u16, now: u64) -> Result<()> {
        let mut circ = match self.circuits.remove(&circuit) {
            Some(c) => c,
            None => return Ok(()),
        };
        let result = self.send_end(&mut circ, stream_id, EndReason::Done, None, now);
        if !circ.is_closed() {
            self.circuits.insert(circuit, circ);
        }
        result
    }

    /// End a live stream: one END cell, one CLOSED event, gone from the
    /// table. A stream that is already gone is a no-op, which is what
    /// keeps END single-shot.
    pub(crate) fn send_end(
        &mut self,
        circ: &mut Circuit,
        stream_id: u16,
        reason: EndReason,
        addr: Option<Ipv4Addr>,
        _now: u64,
    ) -> Result<()> {
        let hop = match circ.streams.get(&stream_id) {
            Some(s) if s.end_sent => return Ok(()),
            Some(s) => s.hop,
            None => return Ok(()),
        };
        self.send_end_raw(circ, stream_id, hop, reason, addr)?;
        if let Some(mut stream) = circ.streams.remove(&stream_id) {
            stream.end_sent = true;
            stream.state = StreamState::Closed;
        }
        let circuit_id = circ.id;
        self.tags
            .retain(|_, (c, s)| !(*c == circuit_id && *s == stream_id));
        self.events.stream(
            circuit_id,
            stream_id,
            StreamStatus::Closed,
            Some(reason.name().to_string()),
        );
        Ok(())
    }

    /// Emit an END cell without touching the stream table (used when a
    /// BEGIN is refused before any stream exists).
    fn send_end_raw(
        &mut self,
        circ: &mut Circuit,
        stream_id: u16,
        hop: usize,
        reason: EndReason,
        addr: Option<Ipv4Addr>,
    ) -> Result<()> {
        let mut payload = vec![reason as u8];
        if reason == EndReason::ExitPolicy {
            if let Some(a) = addr {
                payload.extend_from_slice(&a.octets());
            }
        }
        let rc = RelayCell::new(RelayCommand::End, stream_id, payload)?;
        match circ.role {
            CircuitRole::Relay => self.send_relay_cell_toward_origin(circ, &rc),
            CircuitRole::Origin => self.send_relay_cell_from_origin(circ, hop, &rc, false),
        }
    }

    // ===== Exit side =====

    /// BEGIN consumed on one of our relay circuits: check policy, then
    /// resolve asynchronously.
    pub(crate) fn handle_begin(&mut self, circ: &mut Circuit, rc: RelayCell, now: u64) -> Result<()> {
        if rc.stream_id == 0 {
            return Err(Error::Protocol("BEGIN with stream id zero".into()));
        }
        if circ.streams.contains_key(&rc.stream_id) {
            return Err(Error::Protocol("BEGIN reusing a live stream id".into()));
        }

        let nul = rc.data.iter().position(|&b| b == 0).unwrap_or(rc.data.len());
        let target = std::str::from_utf8(&rc.data[..nul])
            .map_err(|_| Error::Protocol("BEGIN target is not UTF-8".into()))?;
        let (host, port_s) = target
            .rsplit_once(':')
            .ok_or_else(|| Error::Protocol("BEGIN target has no port".into()))?;
        let port: u16 = port_s
            .parse()
            .map_err(|_| Error::Protocol("BEGIN target port is not a number".into()))?;
        log::info!(
            "📥 BEGIN for {}:{} (stream {}) on circuit {}",
            host,
            port,
            rc.stream_id,
            circ.id
        );

        let allowed = self
            .exit_policy
            .as_ref()
            .map_or(false, |p| p.evaluate(None, Some(port)).allows());
        if !allowed {
            log::info!("🚫 refusing {}:{} by exit policy", host, port);
            return self.send_end_raw(circ, rc.stream_id, 0, EndReason::ExitPolicy, None);
        }

        let stream = Stream::new_exit(
            rc.stream_id,
            host,
            port,
            StreamWindows::new(self.cfg.stream_window_start, self.cfg.stream_window_increment),
        );
        circ.streams.insert(rc.stream_id, stream);
        circ.mark_dirty(now);

        let tag = self.alloc_tag();
        self.tags.insert(tag, (circ.id, rc.stream_id));
        self.actions.push_back(Action::ResolveHost {
            tag,
            host: host.to_string(),
        });
        Ok(())
    }

    /// The runtime finished (or failed) a hostname lookup we asked for.
    pub fn resolve_completed(
        &mut self,
        tag: u64,
        outcome: std::result::Result<Ipv4Addr, String>,
        now: u64,
    ) {
        let (circuit, stream_id) = match self.tags.remove(&tag) {
            Some(x) => x,
            None => {
                log::debug!("discarding resolve result for cancelled tag {}", tag);
                return;
            }
        };
        let mut circ = match self.circuits.remove(&circuit) {
            Some(c) => c,
            None => return,
        };
        if let Err(e) = self.resolve_completed_inner(&mut circ, stream_id, outcome, now) {
            log::warn!("⚠️ circuit {}: {}", circuit, e);
            self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
        }
        if !circ.is_closed() {
            self.circuits.insert(circuit, circ);
        }
    }

    fn resolve_completed_inner(
        &mut self,
        circ: &mut Circuit,
        stream_id: u16,
        outcome: std::result::Result<Ipv4Addr, String>,
        now: u64,
    ) -> Result<()> {
        let addr = match outcome {
            Err(e) => {
                log::info!("🚫 resolve failed for stream {}: {}", stream_id, e);
                return self.send_end(circ, stream_id, EndReason::ResolveFailed, None, now);
            }
            Ok(addr) => addr,
        };
        let port = match circ.streams.get(&stream_id) {
            Some(s) => s.target_port,
            None => return Ok(()),
        };

        // Re-check with the concrete address; a probable accept on the
        // hostname can still be a definite reject on the address.
        let allowed = self
            .exit_policy
            .as_ref()
            .map_or(false, |p| p.evaluate(Some(addr), Some(port)).allows());
        if !allowed {
            log::info!("🚫 refusing resolved {}:{} by exit policy", addr, port);
            return self.send_end(circ, stream_id, EndReason::ExitPolicy, Some(addr), now);
        }

        if let Some(stream) = circ.streams.get_mut(&stream_id) {
            stream.resolved_addr = Some(addr);
            stream.state = StreamState::Connecting;
        }
        let tag = self.alloc_tag();
        self.tags.insert(tag, (circ.id, stream_id));
        self.actions.push_back(Action::ConnectTcp { tag, addr, port });
        Ok(())
    }

    /// The runtime finished (or failed) the TCP connect for an exit
    /// stream.
    pub fn exit_connect_completed(&mut self, tag: u64, success: bool, now: u64) {
        let (circuit, stream_id) = match self.tags.remove(&tag) {
            Some(x) => x,
            None => {
                log::debug!("discarding connect result for cancelled tag {}", tag);
                return;
            }
        };
        let mut circ = match self.circuits.remove(&circuit) {
            Some(c) => c,
            None => return,
        };
        if let Err(e) = self.exit_connect_inner(&mut circ, stream_id, success, now) {
            log::warn!("⚠️ circuit {}: {}", circuit, e);
            self.close_circuit_checked_out(&mut circ, e.destroy_reason(), None, now);
        }
        if !circ.is_closed() {
            self.circuits.insert(circuit, circ);
        }
    }

    fn exit_connect_inner(
        &mut self,
        circ: &mut Circuit,
        stream_id: u16,
        success: bool,
        now: u64,
    ) -> Result<()> {
        if !success {
            return self.send_end(circ, stream_id, EndReason::ConnectFailed, None, now);
        }
        let addr = match circ.streams.get_mut(&stream_id) {
            Some(stream) => {
                stream.state = StreamState::Open;
                stream.resolved_addr.unwrap_or(Ipv4Addr::UNSPECIFIED)
            }
            None => return Ok(()),
        };
        let rc = RelayCell::new(RelayCommand::Connected, stream_id, addr.octets().to_vec())?;
        self.send_relay_cell_toward_origin(circ, &rc)?;
        log::info!(
            "✅ exit stream {} on circuit {} connected to {}",
            stream_id,
            circ.id,
            addr
        );
        self.events
            .stream(circ.id, stream_id, StreamStatus::Connected, None);
        Ok(())
    }

    pub(crate) fn alloc_tag(&mut self) -> u64 {
        let tag = self.next_tag;
        self.next_tag += 1;
        tag
    }
}
