//! Exit policies
//!
//! An exit policy is an ordered list of accept/reject rules over an
//! address prefix and a port range. Evaluation answers "may this relay
//! connect to addr:port?" — with PROBABLY verdicts when the question is
//! asked before the address (or port) is known.
//!
//! Identical rules are interned and shared by reference count: relay
//! snapshots carry thousands of policies drawn from a small rule alphabet.
//!
//! The evaluator walks IPv4 rules only; an address of unknown family is
//! treated as an unknown address and can at most maybe-match a rule.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::str::FromStr;

/// What a rule says about the traffic it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleAction {
    Accept,
    Reject,
}

/// An inclusive port range. `1-65535` prints as `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange { lo: 1, hi: 65535 };

    pub fn new(lo: u16, hi: u16) -> Result<Self> {
        if lo == 0 || lo > hi {
            return Err(Error::Internal(format!("bad port range {}-{}", lo, hi)));
        }
        Ok(Self { lo, hi })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    pub fn covers(&self, other: &PortRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "*")
        } else if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

/// One accept/reject rule: an IPv4 prefix and a port range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub action: RuleAction,
    pub addr: Ipv4Addr,
    pub mask_bits: u8,
    pub ports: PortRange,
}

impl PolicyRule {
    pub fn new(action: RuleAction, addr: Ipv4Addr, mask_bits: u8, ports: PortRange) -> Result<Self> {
        if mask_bits > 32 {
            return Err(Error::Internal(format!("bad mask /{}", mask_bits)));
        }
        // Normalize: host bits below the mask are meaningless.
        let masked = Ipv4Addr::from(u32::from(addr) & Self::mask(mask_bits));
        Ok(Self {
            action,
            addr: masked,
            mask_bits,
            ports,
        })
    }

    fn mask(bits: u8) -> u32 {
        if bits == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(bits))
        }
    }

    pub fn addr_matches(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.mask_bits);
        (u32::from(addr) & mask) == (u32::from(self.addr) & mask)
    }

    /// Whether this rule matches every address and every port.
    pub fn is_catch_all(&self) -> bool {
        self.mask_bits == 0 && self.ports.is_all()
    }

    /// Whether every (addr, port) this rule matches is also matched by
    /// `earlier`. Used to drop unreachable rules.
    fn shadowed_by(&self, earlier: &PolicyRule) -> bool {
        earlier.mask_bits <= self.mask_bits
            && earlier.addr_matches(self.addr)
            && earlier.ports.covers(&self.ports)
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.action {
            RuleAction::Accept => "accept",
            RuleAction::Reject => "reject",
        };
        if self.mask_bits == 0 {
            write!(f, "{} *:{}", verb, self.ports)
        } else if self.mask_bits == 32 {
            write!(f, "{} {}:{}", verb, self.addr, self.ports)
        } else {
            write!(f, "{} {}/{}:{}", verb, self.addr, self.mask_bits, self.ports)
        }
    }
}

/// The answer to "does this policy allow addr:port?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Accepted,
    ProbablyAccepted,
    Rejected,
    ProbablyRejected,
}

impl PolicyVerdict {
    /// Whether a stream attachment may proceed on this verdict.
    pub fn allows(self) -> bool {
        matches!(self, PolicyVerdict::Accepted | PolicyVerdict::ProbablyAccepted)
    }

    /// Whether the verdict is certain rather than probable.
    pub fn is_definite(self) -> bool {
        matches!(self, PolicyVerdict::Accepted | PolicyVerdict::Rejected)
    }
}

thread_local! {
    /// Intern table: identical rules across policies share one allocation.
    static RULE_CACHE: RefCell<HashMap<PolicyRule, Rc<PolicyRule>>> =
        RefCell::new(HashMap::new());
}

fn intern(rule: PolicyRule) -> Rc<PolicyRule> {
    RULE_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .entry(rule.clone())
            .or_insert_with(|| Rc::new(rule))
            .clone()
    })
}

/// An ordered list of interned rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ExitPolicy {
    rules: Vec<Rc<PolicyRule>>,
}

impl ExitPolicy {
    /// A policy that accepts everything.
    pub fn accept_all() -> Self {
        Self {
            rules: vec![intern(PolicyRule {
                action: RuleAction::Accept,
                addr: Ipv4Addr::UNSPECIFIED,
                mask_bits: 0,
                ports: PortRange::ALL,
            })],
        }
    }

    /// A policy that rejects everything.
    pub fn reject_all() -> Self {
        Self {
            rules: vec![intern(PolicyRule {
                action: RuleAction::Reject,
                addr: Ipv4Addr::UNSPECIFIED,
                mask_bits: 0,
                ports: PortRange::ALL,
            })],
        }
    }

    pub fn rules(&self) -> &[Rc<PolicyRule>] {
        &self.rules
    }

    /// Parse a comma-separated rule list, e.g.
    /// `reject private:*, accept *:80, reject *:*`.
    ///
    /// The `private` address token expands to the loopback, link-local and
    /// RFC1918 prefixes.
    pub fn parse(s: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for entry in s.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            for rule in parse_entry(entry)? {
                rules.push(intern(rule));
            }
        }
        Ok(Self { rules })
    }

    /// Canonicalize: truncate everything after the first catch-all rule and
    /// drop rules shadowed by an earlier rule (unreachable under
    /// first-match evaluation). Idempotent, and evaluation-preserving.
    pub fn canonicalize(&self) -> ExitPolicy {
        let mut out: Vec<Rc<PolicyRule>> = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            if out.iter().any(|earlier| rule.shadowed_by(earlier)) {
                continue;
            }
            let is_catch_all = rule.is_catch_all();
            out.push(rule.clone());
            if is_catch_all {
                break;
            }
        }
        ExitPolicy { rules: out }
    }

    /// Evaluate against a possibly-unknown address and port.
    ///
    /// A rule matches *definitely* when both parts are known and in range.
    /// A rule whose unknown part is irrelevant — it covers that part's
    /// entire space — still decides the walk, but only at PROBABLY
    /// strength. A rule with a constrained unknown part is a *maybe*
    /// match: it is recorded and the walk continues. The first deciding
    /// match wins; a definite verdict is demoted to PROBABLY when an
    /// earlier maybe-match of the opposite action was seen. The
    /// fall-through default is accept.
    pub fn evaluate(&self, addr: Option<Ipv4Addr>, port: Option<u16>) -> PolicyVerdict {
        let mut maybe_accept = false;
        let mut maybe_reject = false;

        for rule in &self.rules {
            let addr_ok = addr.map(|a| rule.addr_matches(a));
            let port_ok = port.map(|p| rule.ports.contains(p));
            if addr_ok == Some(false) || port_ok == Some(false) {
                continue;
            }
            let addr_decided = addr_ok == Some(true) || rule.mask_bits == 0;
            let port_decided = port_ok == Some(true) || rule.ports.is_all();
            if addr_decided && port_decided {
                let definite = addr_ok == Some(true) && port_ok == Some(true);
                return match rule.action {
                    RuleAction::Accept if definite && !maybe_reject => PolicyVerdict::Accepted,
                    RuleAction::Accept => PolicyVerdict::ProbablyAccepted,
                    RuleAction::Reject if definite && !maybe_accept => PolicyVerdict::Rejected,
                    RuleAction::Reject => PolicyVerdict::ProbablyRejected,
                };
            }
            match rule.action {
                RuleAction::Accept => maybe_accept = true,
                RuleAction::Reject => maybe_reject = true,
            }
        }

        if maybe_reject {
            PolicyVerdict::ProbablyAccepted
        } else {
            PolicyVerdict::Accepted
        }
    }
}

impl fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for rule in &self.rules {
            write!(f, "{}{}", sep, rule)?;
            sep = ", ";
        }
        Ok(())
    }
}

impl FromStr for ExitPolicy {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<ExitPolicy> for String {
    fn from(p: ExitPolicy) -> String {
        p.to_string()
    }
}

impl TryFrom<String> for ExitPolicy {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

/// The prefixes `private` expands to.
const PRIVATE_PREFIXES: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

fn parse_entry(entry: &str) -> Result<Vec<PolicyRule>> {
    let (verb, rest) = entry
        .split_once(char::is_whitespace)
        .ok_or_else(|| Error::Protocol(format!("policy entry has no address part: {:?}", entry)))?;
    let action = match verb {
        "accept" => RuleAction::Accept,
        "reject" => RuleAction::Reject,
        _ => return Err(Error::Protocol(format!("unknown policy verb {:?}", verb))),
    };
    let rest = rest.trim();
    let (addr_part, port_part) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::Protocol(format!("policy entry has no port part: {:?}", entry)))?;

    let ports = parse_ports(port_part)?;

    if addr_part == "private" {
        return PRIVATE_PREFIXES
            .iter()
            .map(|&(addr, bits)| PolicyRule::new(action, addr, bits, ports))
            .collect();
    }

    let (addr, mask_bits) = parse_addr(addr_part)?;
    Ok(vec![PolicyRule::new(action, addr, mask_bits, ports)?])
}

fn parse_addr(s: &str) -> Result<(Ipv4Addr, u8)> {
    if s == "*" {
        return Ok((Ipv4Addr::UNSPECIFIED, 0));
    }
    let (addr_s, bits) = match s.split_once('/') {
        Some((a, m)) => (
            a,
            m.parse::<u8>()
                .map_err(|_| Error::Protocol(format!("bad mask in {:?}", s)))?,
        ),
        None => (s, 32),
    };
    if bits > 32 {
        return Err(Error::Protocol(format!("mask /{} out of range", bits)));
    }
    let addr = addr_s
        .parse::<Ipv4Addr>()
        .map_err(|_| Error::Protocol(format!("bad address {:?}", addr_s)))?;
    Ok((addr, bits))
}

fn parse_ports(s: &str) -> Result<PortRange> {
    if s == "*" {
        return Ok(PortRange::ALL);
    }
    let (lo, hi) = match s.split_once('-') {
        Some((a, b)) => (
            a.parse::<u16>()
                .map_err(|_| Error::Protocol(format!("bad port {:?}", a)))?,
            b.parse::<u16>()
                .map_err(|_| Error::Protocol(format!("bad port {:?}", b)))?,
        ),
        None => {
            let p = s
                .parse::<u16>()
                .map_err(|_| Error::Protocol(format!("bad port {:?}", s)))?;
            (p, p)
        }
    };
    PortRange::new(lo, hi).map_err(|_| Error::Protocol(format!("bad port range {:?}", s)))
}
