//! Configuration knobs
//!
//! One plain struct with serde derives. Every field has a production
//! default; tests shrink windows and timeouts to keep scenarios small.

use crate::netdir::RelayId;
use serde::{Deserialize, Serialize};

/// Configuration for the circuit core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hops in a general-purpose circuit.
    pub path_len: usize,

    /// Deadline for each CREATE/EXTEND round trip, in seconds.
    pub hop_timeout_secs: u64,

    /// Initial circuit-level flow-control window.
    pub circuit_window_start: u16,

    /// Circuit-level credit per SENDME.
    pub circuit_window_increment: u16,

    /// Initial stream-level flow-control window.
    pub stream_window_start: u16,

    /// Stream-level credit per SENDME.
    pub stream_window_increment: u16,

    /// How many entry guards to keep.
    pub num_entry_guards: usize,

    /// Never fall back past the configured/chosen guards.
    pub strict_entry_nodes: bool,

    /// Operator-pinned entry nodes, prepended to the guard list.
    pub entry_nodes: Vec<RelayId>,

    /// How long after its first stream a circuit keeps accepting new ones,
    /// in seconds.
    pub max_circuit_dirtiness_secs: u64,

    /// Idle link teardown delay after its last circuit closes, in seconds.
    pub link_idle_timeout_secs: u64,

    /// Minimum interval between guard-state rewrites, in seconds.
    pub guard_persist_interval_secs: u64,

    /// Stretch the guard-state rewrite interval to one hour.
    pub avoid_disk_writes: bool,

    /// How many times a stream may be re-attached after an exit-policy
    /// refusal.
    pub max_stream_retries: u32,

    /// Allow CREATE_FAST for the first hop.
    pub allow_create_fast: bool,

    /// Predicate deciding whether an open link with the given negotiated
    /// protocol version is too old to reuse, in which case a parallel link
    /// is dialed. `None` means links never go obsolete.
    #[serde(skip)]
    pub link_obsolete: Option<fn(u16) -> bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_len: 3,
            hop_timeout_secs: 60,
            circuit_window_start: 1000,
            circuit_window_increment: 100,
            stream_window_start: 500,
            stream_window_increment: 50,
            num_entry_guards: 3,
            strict_entry_nodes: false,
            entry_nodes: Vec::new(),
            max_circuit_dirtiness_secs: 600,
            link_idle_timeout_secs: 300,
            guard_persist_interval_secs: 600,
            avoid_disk_writes: false,
            max_stream_retries: 3,
            allow_create_fast: true,
            link_obsolete: None,
        }
    }
}

impl Config {
    /// The effective guard-state rewrite interval.
    pub fn guard_persist_interval(&self) -> u64 {
        if self.avoid_disk_writes {
            self.guard_persist_interval_secs.max(3600)
        } else {
            self.guard_persist_interval_secs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.path_len, 3);
        assert_eq!(cfg.circuit_window_start, 1000);
        assert_eq!(cfg.stream_window_increment, 50);
        assert_eq!(cfg.num_entry_guards, 3);
    }

    #[test]
    fn disk_write_avoidance_stretches_persist_interval() {
        let mut cfg = Config::default();
        assert_eq!(cfg.guard_persist_interval(), 600);
        cfg.avoid_disk_writes = true;
        assert_eq!(cfg.guard_persist_interval(), 3600);
    }
}
