//! Relay snapshot types
//!
//! A directory snapshot is handed to the core as a set of known relays:
//! identity digest, address, onion key, advertised bandwidth, exit policy
//! and status flags. How the snapshot is fetched and authenticated is the
//! directory layer's business; this module only represents it.

use crate::error::{Error, Result};
use crate::policy::ExitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// A relay identity digest (20 bytes, printed as uppercase hex).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RelayId([u8; 20]);

impl RelayId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::Protocol(format!("bad identity hex {:?}", s)))?;
        if bytes.len() != 20 {
            return Err(Error::Protocol(format!(
                "identity digest has {} bytes, wanted 20",
                bytes.len()
            )));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl From<[u8; 20]> for RelayId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars identify a relay well enough in logs.
        write!(f, "${}…", &self.to_hex()[..8])
    }
}

impl From<RelayId> for String {
    fn from(id: RelayId) -> String {
        id.to_hex()
    }
}

impl TryFrom<String> for RelayId {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

/// Status flags assigned to a relay by the directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Exit - allows exit traffic
    pub exit: bool,

    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Fast - enough bandwidth for general traffic
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// Running - reachable when last checked
    pub running: bool,

    /// Stable - long uptime
    pub stable: bool,

    /// Valid - not known to be broken or hostile
    pub valid: bool,
}

impl RelayFlags {
    /// Parse a whitespace-separated flag list as it appears in a status
    /// document. Unknown flags are ignored.
    pub fn from_string(flags: &str) -> Self {
        let mut out = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Exit" => out.exit = true,
                "BadExit" => out.bad_exit = true,
                "Fast" => out.fast = true,
                "Guard" => out.guard = true,
                "Running" => out.running = true,
                "Stable" => out.stable = true,
                "Valid" => out.valid = true,
                _ => {}
            }
        }
        out
    }
}

/// A relay from the directory snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Identity digest
    pub identity: RelayId,

    /// IPv4 address of the OR port
    pub address: Ipv4Addr,

    /// OR (onion routing) port
    pub or_port: u16,

    /// Directory flags
    pub flags: RelayFlags,

    /// Advertised bandwidth (bytes/sec)
    pub bandwidth: u64,

    /// Onion public key, opaque to the core; empty when unknown
    #[serde(default)]
    pub onion_key: Vec<u8>,

    /// Exit policy
    pub exit_policy: ExitPolicy,

    /// Declared family members
    #[serde(default)]
    pub family: Vec<RelayId>,

    /// Advertised software version, if any
    #[serde(default)]
    pub version: Option<String>,
}

impl Relay {
    /// Usable as an entry guard.
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast
    }

    /// Usable as an exit.
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit
    }

    /// Reachable when the snapshot was taken.
    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    /// Whether this relay and `other` declare each other family (either
    /// direction counts).
    pub fn same_family(&self, other: &Relay) -> bool {
        self.family.contains(&other.identity) || other.family.contains(&self.identity)
    }
}

/// A snapshot of the known relays, indexed by identity.
#[derive(Debug, Clone, Default)]
pub struct NetDir {
    relays: Vec<Relay>,
    by_id: HashMap<RelayId, usize>,
}

impl NetDir {
    pub fn new(relays: Vec<Relay>) -> Self {
        let by_id = relays
            .iter()
            .enumerate()
            .map(|(i, r)| (r.identity, i))
            .collect();
        Self { relays, by_id }
    }

    pub fn relays(&self) -> &[Relay] {
        &self.relays
    }

    pub fn by_id(&self, id: &RelayId) -> Option<&Relay> {
        self.by_id.get(id).map(|&i| &self.relays[i])
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.relays.iter().filter(|r| r.is_running()).count()
    }
}
