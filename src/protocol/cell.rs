//! Cell codec
//!
//! Implements the cell format used on inter-node links. Cells are the basic
//! unit of the link protocol: fixed-length cells are exactly 512 bytes on
//! the wire, variable-length cells (negotiation only) carry an explicit
//! payload length. Relay cells nest a further header inside the payload of
//! a RELAY or RELAY_EARLY cell.
//!
//! All multi-byte fields are big-endian.

use crate::error::{Error, Result};

/// Total size of a fixed-length cell on the wire:
/// 2 (circ_id) + 1 (command) + 509 (payload).
pub const CELL_LEN: usize = 512;

/// Payload size of a fixed-length cell.
pub const PAYLOAD_LEN: usize = 509;

/// Header size of a variable-length cell: circ_id(2) + command(1) + len(2).
pub const VAR_HEADER_LEN: usize = 5;

/// Size of the relay header nested in a RELAY cell payload.
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum body bytes a relay cell can carry.
pub const RELAY_DATA_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link keepalive, discarded on receipt
    Padding = 0,
    /// CREATE - open a circuit with a full onion handshake
    Create = 1,
    /// CREATED - circuit open, server handshake half
    Created = 2,
    /// RELAY - onion-layered relay cell
    Relay = 3,
    /// DESTROY - tear down a circuit
    Destroy = 4,
    /// CREATE_FAST - open a first-hop circuit without the onion key
    CreateFast = 5,
    /// CREATED_FAST - reply to CREATE_FAST
    CreatedFast = 6,
    /// VERSIONS - negotiate the link protocol (variable-length)
    Versions = 7,
    /// NETINFO - address/timestamp exchange finishing the link handshake
    Netinfo = 8,
    /// RELAY_EARLY - relay cell counted against the early budget
    RelayEarly = 9,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            _ => None,
        }
    }

    /// Whether this command uses the variable-length framing.
    pub fn is_variable_length(self) -> bool {
        command_is_variable(self as u8)
    }
}

/// Static fixed-vs-variable classification by command byte. The table is
/// stable across link protocol versions: VERSIONS and every command ≥ 128
/// are variable-length, everything else is a 512-byte cell.
pub fn command_is_variable(cmd: u8) -> bool {
    cmd == CellCommand::Versions as u8 || cmd >= 128
}

/// A fixed-length cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (0 for link-level cells)
    pub circ_id: u16,

    /// Command
    pub command: CellCommand,

    /// Payload; zero-padded to [`PAYLOAD_LEN`] on the wire
    pub payload: Vec<u8>,
}

impl Cell {
    /// Create a new cell. Fails if the payload exceeds one cell.
    pub fn new(circ_id: u16, command: CellCommand, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "cell payload too long: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            circ_id,
            command,
            payload,
        })
    }

    /// Serialize to exactly [`CELL_LEN`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CELL_LEN);
        buf.extend_from_slice(&self.circ_id.to_be_bytes());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf.resize(CELL_LEN, 0);
        buf
    }

    /// Parse a fixed-length cell from exactly one cell worth of bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CELL_LEN {
            return Err(Error::Protocol("cell too short".into()));
        }
        let circ_id = u16::from_be_bytes([data[0], data[1]]);
        let command = CellCommand::from_u8(data[2])
            .ok_or_else(|| Error::Protocol(format!("unknown cell command {}", data[2])))?;
        Ok(Self {
            circ_id,
            command,
            payload: data[3..CELL_LEN].to_vec(),
        })
    }
}

/// A variable-length cell (negotiation only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCell {
    /// Circuit ID (always 0 in practice)
    pub circ_id: u16,

    /// Command; must classify as variable-length
    pub command: u8,

    /// Payload, sent with an explicit 16-bit length and no padding
    pub payload: Vec<u8>,
}

impl VarCell {
    /// Serialize: circ_id(2) ∥ command(1) ∥ len(2) ∥ payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VAR_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.circ_id.to_be_bytes());
        buf.push(self.command);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// One cell decoded off a link's inbound buffer.
#[derive(Debug, Clone)]
pub enum Decoded {
    /// A fixed-length cell with a known command
    Fixed(Cell),
    /// A variable-length cell
    Variable(VarCell),
    /// A cell with a command byte this implementation does not know.
    /// The framing was still consumed; the link stays open.
    Unknown { circ_id: u16, command: u8 },
}

/// Try to decode one cell from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete cell
/// ("need more"), otherwise the decoded cell and the number of bytes
/// consumed. Never reads past one cell.
pub fn decode_cell(buf: &[u8]) -> Result<Option<(Decoded, usize)>> {
    if buf.len() < 3 {
        return Ok(None);
    }
    let circ_id = u16::from_be_bytes([buf[0], buf[1]]);
    let command = buf[2];

    if command_is_variable(command) {
        if buf.len() < VAR_HEADER_LEN {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        let total = VAR_HEADER_LEN + len;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = buf[VAR_HEADER_LEN..total].to_vec();
        let decoded = if CellCommand::from_u8(command).is_some() {
            Decoded::Variable(VarCell {
                circ_id,
                command,
                payload,
            })
        } else {
            Decoded::Unknown { circ_id, command }
        };
        return Ok(Some((decoded, total)));
    }

    if buf.len() < CELL_LEN {
        return Ok(None);
    }
    let decoded = match CellCommand::from_u8(command) {
        Some(_) => Decoded::Fixed(Cell::from_bytes(&buf[..CELL_LEN])?),
        None => Decoded::Unknown { circ_id, command },
    };
    Ok(Some((decoded, CELL_LEN)))
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open a stream
    Begin = 1,
    /// DATA - stream payload
    Data = 2,
    /// END - close a stream
    End = 3,
    /// CONNECTED - stream is connected
    Connected = 4,
    /// SENDME - flow control credit
    Sendme = 5,
    /// EXTEND - extend the circuit by one hop
    Extend = 6,
    /// EXTENDED - circuit extended
    Extended = 7,
    /// TRUNCATE - drop hops beyond this one
    Truncate = 8,
    /// TRUNCATED - hops were dropped
    Truncated = 9,
    /// DROP - long-range padding, ignored
    Drop = 10,
    /// RESOLVE - hostname lookup request
    Resolve = 11,
    /// RESOLVED - hostname lookup answer
    Resolved = 12,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            _ => None,
        }
    }
}

/// Relay cell: the header + body nested inside a RELAY cell payload.
///
/// On the wire: command(1) ∥ recognized(2) ∥ stream_id(2) ∥ digest(4) ∥
/// length(2) ∥ body, zero-padded to [`PAYLOAD_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Must be zero on cells addressed to us
    pub recognized: u16,

    /// Stream ID; 0 for circuit-control cells
    pub stream_id: u16,

    /// First 4 bytes of the running digest for this hop+direction
    pub digest: [u8; 4],

    /// Body (up to [`RELAY_DATA_LEN`] bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Create a new relay cell with a zeroed digest field.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > RELAY_DATA_LEN {
            return Err(Error::Protocol(format!(
                "relay body too long: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        })
    }

    /// Serialize into a full cell payload ([`PAYLOAD_LEN`] bytes).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAYLOAD_LEN);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(PAYLOAD_LEN, 0);
        buf
    }

    /// Parse a relay cell out of a cell payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(Error::Protocol("relay cell too short".into()));
        }
        let command = RelayCommand::from_u8(payload[0])
            .ok_or_else(|| Error::Protocol(format!("unknown relay command {}", payload[0])))?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;
        if length > RELAY_DATA_LEN {
            return Err(Error::Protocol(format!(
                "relay length field too large: {}",
                length
            )));
        }
        if RELAY_HEADER_LEN + length > payload.len() {
            return Err(Error::Protocol("relay body truncated".into()));
        }
        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }
}

/// Reason byte carried by a DESTROY cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    None = 0,
    Protocol = 1,
    Internal = 2,
    Requested = 3,
    Hibernating = 4,
    ResourceLimit = 5,
    ConnectFailed = 6,
    OrIdentity = 7,
    ChannelClosed = 8,
    Finished = 9,
    Timeout = 10,
    Destroyed = 11,
    NoSuchService = 12,
}

impl DestroyReason {
    pub fn from_u8(b: u8) -> Self {
        match b {
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::ChannelClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            _ => DestroyReason::None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DestroyReason::None => "NONE",
            DestroyReason::Protocol => "PROTOCOL",
            DestroyReason::Internal => "INTERNAL",
            DestroyReason::Requested => "REQUESTED",
            DestroyReason::Hibernating => "HIBERNATING",
            DestroyReason::ResourceLimit => "RESOURCELIMIT",
            DestroyReason::ConnectFailed => "CONNECTFAILED",
            DestroyReason::OrIdentity => "OR_IDENTITY",
            DestroyReason::ChannelClosed => "CHANNEL_CLOSED",
            DestroyReason::Finished => "FINISHED",
            DestroyReason::Timeout => "TIMEOUT",
            DestroyReason::Destroyed => "DESTROYED",
            DestroyReason::NoSuchService => "NOSUCHSERVICE",
        }
    }
}

/// Reason byte carried by an END relay cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndReason {
    Misc = 1,
    ResolveFailed = 2,
    ConnectFailed = 3,
    ExitPolicy = 4,
    Destroy = 5,
    Done = 6,
    Timeout = 7,
    NoRoute = 8,
    Hibernating = 9,
    Internal = 10,
    ResourceLimit = 11,
    ConnReset = 12,
    TorProtocol = 13,
    NotDirectory = 14,
}

impl EndReason {
    pub fn from_u8(b: u8) -> Self {
        match b {
            2 => EndReason::ResolveFailed,
            3 => EndReason::ConnectFailed,
            4 => EndReason::ExitPolicy,
            5 => EndReason::Destroy,
            6 => EndReason::Done,
            7 => EndReason::Timeout,
            8 => EndReason::NoRoute,
            9 => EndReason::Hibernating,
            10 => EndReason::Internal,
            11 => EndReason::ResourceLimit,
            12 => EndReason::ConnReset,
            13 => EndReason::TorProtocol,
            14 => EndReason::NotDirectory,
            _ => EndReason::Misc,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EndReason::Misc => "MISC",
            EndReason::ResolveFailed => "RESOLVEFAILED",
            EndReason::ConnectFailed => "CONNECTFAILED",
            EndReason::ExitPolicy => "EXITPOLICY",
            EndReason::Destroy => "DESTROY",
            EndReason::Done => "DONE",
            EndReason::Timeout => "TIMEOUT",
            EndReason::NoRoute => "NOROUTE",
            EndReason::Hibernating => "HIBERNATING",
            EndReason::Internal => "INTERNAL",
            EndReason::ResourceLimit => "RESOURCELIMIT",
            EndReason::ConnReset => "CONNRESET",
            EndReason::TorProtocol => "TORPROTOCOL",
            EndReason::NotDirectory => "NOTDIRECTORY",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_round_trip() {
        let cell = Cell::new(0x0102, CellCommand::Create, vec![1, 2, 3, 4]).unwrap();
        let bytes = cell.to_bytes();
        assert_eq!(bytes.len(), CELL_LEN);
        assert_eq!(&bytes[..3], &[0x01, 0x02, 1]);

        let parsed = Cell::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.circ_id, 0x0102);
        assert_eq!(parsed.command, CellCommand::Create);
        // Padding survives the round trip as part of the payload.
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
        assert!(parsed.payload[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn relay_header_round_trip() {
        let mut relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]).unwrap();
        relay.digest = [9, 9, 9, 9];
        let payload = relay.to_payload();
        assert_eq!(payload.len(), PAYLOAD_LEN);

        let parsed = RelayCell::from_payload(&payload).unwrap();
        assert_eq!(parsed, relay);
    }

    #[test]
    fn relay_length_bound() {
        assert!(RelayCell::new(RelayCommand::Data, 1, vec![0; RELAY_DATA_LEN]).is_ok());
        assert!(RelayCell::new(RelayCommand::Data, 1, vec![0; RELAY_DATA_LEN + 1]).is_err());

        // A forged length field beyond 498 is a protocol error.
        let mut payload = RelayCell::new(RelayCommand::Data, 1, vec![0; 10])
            .unwrap()
            .to_payload();
        payload[9..11].copy_from_slice(&499u16.to_be_bytes());
        assert!(RelayCell::from_payload(&payload).is_err());
    }

    #[test]
    fn decode_needs_more() {
        let cell = Cell::new(7, CellCommand::Relay, vec![0xAA; 509]).unwrap();
        let bytes = cell.to_bytes();
        assert!(decode_cell(&bytes[..511]).unwrap().is_none());
        let (decoded, used) = decode_cell(&bytes).unwrap().unwrap();
        assert_eq!(used, CELL_LEN);
        match decoded {
            Decoded::Fixed(c) => assert_eq!(c, cell),
            other => panic!("expected fixed cell, got {:?}", other),
        }
    }

    #[test]
    fn decode_variable_cell() {
        let vc = VarCell {
            circ_id: 0,
            command: CellCommand::Versions as u8,
            payload: vec![0, 2, 0, 3],
        };
        let bytes = vc.to_bytes();
        assert!(decode_cell(&bytes[..4]).unwrap().is_none());
        let (decoded, used) = decode_cell(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        match decoded {
            Decoded::Variable(v) => assert_eq!(v, vc),
            other => panic!("expected var cell, got {:?}", other),
        }
    }

    #[test]
    fn decode_unknown_command_consumes_framing() {
        // Unknown fixed command: 512 bytes consumed, link stays usable.
        let mut buf = vec![0u8; CELL_LEN];
        buf[2] = 42;
        let (decoded, used) = decode_cell(&buf).unwrap().unwrap();
        assert_eq!(used, CELL_LEN);
        assert!(matches!(decoded, Decoded::Unknown { command: 42, .. }));

        // Unknown high command: variable framing.
        let mut buf = vec![0u8, 0, 200, 0, 2, 0xde, 0xad];
        buf[2] = 200;
        let (decoded, used) = decode_cell(&buf).unwrap().unwrap();
        assert_eq!(used, 7);
        assert!(matches!(decoded, Decoded::Unknown { command: 200, .. }));
    }

    #[test]
    fn classification_is_stable() {
        assert!(command_is_variable(CellCommand::Versions as u8));
        assert!(!command_is_variable(CellCommand::Create as u8));
        assert!(!command_is_variable(CellCommand::Netinfo as u8));
        assert!(command_is_variable(128));
        assert!(command_is_variable(255));
    }
}
