//! Path selection
//!
//! Chooses one relay for one position of a circuit, honoring the caller's
//! predicates (uptime, capacity, validity, exclusions, family) and the
//! exit policy of exit candidates.
//!
//! Selection is a weighted sample proportional to the advertised bandwidth,
//! capped so a single relay cannot claim an outsized share. Scarce roles
//! are compensated by position multipliers: guard-flagged relays count
//! extra in the entry position, exit-flagged relays count less outside the
//! exit position. Candidates are ordered by identity digest before
//! sampling, so a fixed RNG yields a fixed choice.

use crate::netdir::{NetDir, Relay, RelayId};
use crate::policy::PolicyVerdict;
use rand::Rng;
use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Cap on the advertised bandwidth a single relay may be credited with.
pub const BANDWIDTH_CAP: u64 = 10_000_000;

/// Which position of the path is being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSlot {
    Entry,
    Middle,
    Exit,
}

/// Constraints for one selection.
#[derive(Debug, Clone)]
pub struct PathConstraints<'a> {
    /// Position being filled.
    pub slot: PathSlot,

    /// Require the Stable flag.
    pub need_uptime: bool,

    /// Require the Fast flag.
    pub need_capacity: bool,

    /// Accept relays without the Valid flag.
    pub allow_invalid: bool,

    /// Require the Guard flag (used when growing the guard list).
    pub need_guard: bool,

    /// Identities that must not be chosen (already-chosen hops and their
    /// families, operator exclusions).
    pub exclude: &'a HashSet<RelayId>,

    /// For the exit slot: the target the exit must allow. Unknown parts are
    /// permitted to produce PROBABLY verdicts.
    pub target: Option<(Option<Ipv4Addr>, Option<u16>)>,
}

impl<'a> PathConstraints<'a> {
    /// Plain constraints for a slot with only the exclusion set.
    pub fn for_slot(slot: PathSlot, exclude: &'a HashSet<RelayId>) -> Self {
        Self {
            slot,
            need_uptime: false,
            need_capacity: true,
            allow_invalid: false,
            need_guard: false,
            exclude,
            target: None,
        }
    }

    fn admits(&self, relay: &Relay) -> bool {
        if !relay.is_running() {
            return false;
        }
        if !self.allow_invalid && !relay.flags.valid {
            return false;
        }
        if self.need_uptime && !relay.flags.stable {
            return false;
        }
        if self.need_capacity && !relay.flags.fast {
            return false;
        }
        if self.need_guard && !relay.is_guard() {
            return false;
        }
        if self.exclude.contains(&relay.identity) {
            return false;
        }
        match self.slot {
            PathSlot::Exit => {
                if !relay.is_exit() {
                    return false;
                }
                if let Some((addr, port)) = self.target {
                    if !relay.exit_policy.evaluate(addr, port).allows() {
                        return false;
                    }
                }
                // An exit must be reachable with a full handshake.
                !relay.onion_key.is_empty()
            }
            PathSlot::Middle => !relay.onion_key.is_empty(),
            // The first hop may be reached with the fast handshake, so a
            // missing onion key does not disqualify it.
            PathSlot::Entry => true,
        }
    }

    fn weight(&self, relay: &Relay) -> u64 {
        let base = relay.bandwidth.min(BANDWIDTH_CAP).max(1);
        match self.slot {
            PathSlot::Entry => {
                let mut w = base;
                if relay.flags.guard {
                    w *= 3;
                }
                if relay.is_exit() {
                    w = (w / 3).max(1);
                }
                w
            }
            PathSlot::Middle => {
                if relay.is_exit() {
                    (base / 3).max(1)
                } else {
                    base
                }
            }
            PathSlot::Exit => base,
        }
    }
}

/// Pick one relay satisfying `constraints`, or `None` when no relay does.
pub fn choose_relay<'a, R: Rng + ?Sized>(
    dir: &'a NetDir,
    constraints: &PathConstraints<'_>,
    rng: &mut R,
) -> Option<&'a Relay> {
    let mut candidates: Vec<&Relay> = dir
        .relays()
        .iter()
        .filter(|r| constraints.admits(r))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|r| r.identity);

    let total: u64 = candidates.iter().map(|r| constraints.weight(r)).sum();
    let mut point = rng.gen_range(0..total);
    for relay in &candidates {
        let w = constraints.weight(relay);
        if point < w {
            return Some(relay);
        }
        point -= w;
    }
    // Unreachable given the sum above; fall back to the heaviest tail.
    candidates.last().copied()
}

/// Collect the identities excluded by choosing `relay`: itself plus its
/// declared family, in both directions.
pub fn family_exclusions(dir: &NetDir, relay: &Relay, exclude: &mut HashSet<RelayId>) {
    exclude.insert(relay.identity);
    for id in &relay.family {
        exclude.insert(*id);
    }
    for other in dir.relays() {
        if other.family.contains(&relay.identity) {
            exclude.insert(other.identity);
        }
    }
}
