//! Entry guards
//!
//! A small, stable set of first hops chosen once and kept for a long time.
//!
//! ## Security Rationale
//!
//! Keeping the same entry points bounds how much of our traffic any single
//! adversary-operated relay can observe. Rotating entries often would walk
//! our circuits past every hostile relay eventually.
//!
//! The manager keeps an ordered preference list. Each guard remembers when
//! it was chosen, whether we ever reached it, and since when it has been
//! unreachable or unlisted. Unreachable guards are retried on a back-off
//! schedule; guards unlisted for 30 days are dropped. The list is persisted
//! as a line-oriented text file and reloaded at startup.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventSink, GuardStatus};
use crate::netdir::{NetDir, Relay, RelayId};
use crate::path::{choose_relay, PathConstraints, PathSlot};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Drop a guard once it has been unlisted/bad this long (30 days).
pub const GUARD_EXPIRE_SECS: u64 = 30 * 24 * 60 * 60;

/// Retry schedule for unreachable guards: (downtime-below, retry-after).
const RETRY_SCHEDULE: &[(u64, u64)] = &[
    (6 * 3600, 3600),            // down < 6h  : retry after 1h
    (3 * 24 * 3600, 4 * 3600),   // down < 3d  : retry after 4h
    (7 * 24 * 3600, 18 * 3600),  // down < 7d  : retry after 18h
];

/// Retry interval once a guard has been down a week or more.
const RETRY_MAX_SECS: u64 = 36 * 3600;

/// One persistently-remembered entry guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryGuard {
    /// Nickname, for the state file and logs
    pub nickname: String,

    /// Identity digest
    pub identity: RelayId,

    /// When this guard was added (Unix seconds)
    pub chosen_on_date: u64,

    /// Software version that added it
    pub chosen_by_version: String,

    /// Whether we ever completed a connection to it
    pub made_contact: bool,

    /// Set when a later guard made first contact, inviting this earlier
    /// one to be tried again ahead of schedule
    pub can_retry: bool,

    /// Since when the directory stopped recommending it
    pub bad_since: Option<u64>,

    /// Since when connection attempts have failed
    pub unreachable_since: Option<u64>,

    /// Last connection attempt, successful or not
    pub last_attempted: Option<u64>,
}

impl EntryGuard {
    pub fn new(relay: &Relay, version: &str, now: u64) -> Self {
        Self {
            nickname: relay.nickname.clone(),
            identity: relay.identity,
            chosen_on_date: now,
            chosen_by_version: version.to_string(),
            made_contact: false,
            can_retry: false,
            bad_since: None,
            unreachable_since: None,
            last_attempted: None,
        }
    }

    /// How long to wait between attempts for a guard down `downtime`
    /// seconds.
    pub fn retry_interval(downtime: u64) -> u64 {
        for &(below, interval) in RETRY_SCHEDULE {
            if downtime < below {
                return interval;
            }
        }
        RETRY_MAX_SECS
    }

    /// Whether a connection attempt is permitted now.
    pub fn may_attempt(&self, now: u64) -> bool {
        if self.can_retry {
            return true;
        }
        let since = match self.unreachable_since {
            None => return true,
            Some(t) => t,
        };
        let interval = Self::retry_interval(now.saturating_sub(since));
        match self.last_attempted {
            None => true,
            Some(last) => now.saturating_sub(last) >= interval,
        }
    }
}

/// Ordered list of entry guards with persistence bookkeeping.
#[derive(Debug, Default)]
pub struct GuardManager {
    guards: Vec<EntryGuard>,
    dirty: bool,
    last_persisted: u64,
}

impl GuardManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guards(&self) -> &[EntryGuard] {
        &self.guards
    }

    pub fn get(&self, id: &RelayId) -> Option<&EntryGuard> {
        self.guards.iter().find(|g| g.identity == *id)
    }

    /// Whether `guard` can serve as an entry right now: listed, not bad,
    /// not excluded, and past its retry back-off.
    fn is_live(&self, guard: &EntryGuard, dir: &NetDir, exclude: &HashSet<RelayId>, now: u64) -> bool {
        if guard.bad_since.is_some() || exclude.contains(&guard.identity) {
            return false;
        }
        match dir.by_id(&guard.identity) {
            Some(relay) => relay.is_running() && guard.may_attempt(now),
            None => false,
        }
    }

    /// Choose the entry hop for a new circuit.
    ///
    /// Configured entry nodes are folded in first; the list is grown when
    /// fewer than the configured number of guards are usable; the first
    /// live guard wins. Without strict mode, an empty result falls through
    /// to a one-off weighted pick that is not remembered.
    pub fn choose_entry<R: Rng + ?Sized>(
        &mut self,
        dir: &NetDir,
        cfg: &Config,
        exclude: &HashSet<RelayId>,
        rng: &mut R,
        now: u64,
        events: &mut EventSink,
    ) -> Option<Relay> {
        // Operator-pinned entries go to the front of the list, once.
        for id in cfg.entry_nodes.iter().rev() {
            if self.get(id).is_none() {
                if let Some(relay) = dir.by_id(id) {
                    log::info!("🛡️ adding configured entry node {}", relay.nickname);
                    self.guards
                        .insert(0, EntryGuard::new(relay, env!("CARGO_PKG_VERSION"), now));
                    events.guard(*id, GuardStatus::New);
                    self.dirty = true;
                }
            }
        }

        // Grow the list while too few guards are usable.
        let mut growth_attempts = 0;
        while self.live_count(dir, exclude, now) < cfg.num_entry_guards
            && growth_attempts < cfg.num_entry_guards * 2
        {
            growth_attempts += 1;
            let mut avoid: HashSet<RelayId> = exclude.clone();
            for g in &self.guards {
                avoid.insert(g.identity);
            }
            let mut constraints = PathConstraints::for_slot(PathSlot::Entry, &avoid);
            constraints.need_uptime = true;
            constraints.need_guard = true;
            let candidate = match choose_relay(dir, &constraints, rng) {
                Some(r) => r,
                None => break,
            };
            log::info!(
                "🛡️ new entry guard {} ({} kB/s)",
                candidate.nickname,
                candidate.bandwidth / 1000
            );
            let guard = EntryGuard::new(candidate, env!("CARGO_PKG_VERSION"), now);
            events.guard(guard.identity, GuardStatus::New);
            self.guards.push(guard);
            self.dirty = true;
        }

        // First live guard in preference order wins.
        for guard in &self.guards {
            if self.is_live(guard, dir, exclude, now) {
                return dir.by_id(&guard.identity).cloned();
            }
        }

        if cfg.strict_entry_nodes {
            log::warn!("⚠️ no live entry guard and strict entries configured");
            return None;
        }

        // One-off fallback pick, not added to the list.
        let constraints = PathConstraints::for_slot(PathSlot::Entry, exclude);
        choose_relay(dir, &constraints, rng).cloned()
    }

    fn live_count(&self, dir: &NetDir, exclude: &HashSet<RelayId>, now: u64) -> usize {
        self.guards
            .iter()
            .filter(|g| self.is_live(g, dir, exclude, now))
            .count()
    }

    /// Record the outcome of a connection attempt to `id`.
    ///
    /// Returns `true` when the caller should drop the just-established
    /// connection: first-ever contact with a lower-preference guard wakes
    /// the guards ahead of it so they get another chance first.
    pub fn register_connect_status(
        &mut self,
        id: &RelayId,
        succeeded: bool,
        now: u64,
        events: &mut EventSink,
    ) -> bool {
        let position = match self.guards.iter().position(|g| g.identity == *id) {
            Some(p) => p,
            None => return false,
        };

        self.dirty = true;
        let mut drop_connection = false;

        if succeeded {
            let first_contact = !self.guards[position].made_contact;
            let was_down = self.guards[position].unreachable_since.is_some();
            {
                let guard = &mut self.guards[position];
                guard.made_contact = true;
                guard.can_retry = false;
                guard.unreachable_since = None;
                guard.last_attempted = Some(now);
            }
            if was_down {
                events.guard(*id, GuardStatus::Up);
            }
            if first_contact {
                for earlier in &mut self.guards[..position] {
                    if earlier.made_contact && earlier.unreachable_since.is_some() {
                        earlier.can_retry = true;
                        drop_connection = true;
                    }
                }
                if drop_connection {
                    log::info!(
                        "🔄 first contact with {}; retrying preferred guards first",
                        self.guards[position].nickname
                    );
                }
            }
        } else {
            let guard = &mut self.guards[position];
            guard.last_attempted = Some(now);
            guard.can_retry = false;
            if guard.unreachable_since.is_none() {
                guard.unreachable_since = Some(now);
                log::warn!("⚠️ entry guard {} is unreachable", guard.nickname);
                events.guard(*id, GuardStatus::Down);
            }
        }

        drop_connection
    }

    /// Refresh guard status from a new directory snapshot: mark guards that
    /// are unlisted, down or no longer guard-worthy as bad, revive the ones
    /// that recovered, and drop guards bad for 30 days.
    pub fn update_status_from_directory(&mut self, dir: &NetDir, now: u64, events: &mut EventSink) {
        let mut changed = false;

        for guard in &mut self.guards {
            let listed_ok = match dir.by_id(&guard.identity) {
                Some(relay) => relay.is_running() && relay.flags.guard,
                None => false,
            };
            match (listed_ok, guard.bad_since) {
                (false, None) => {
                    guard.bad_since = Some(now);
                    events.guard(guard.identity, GuardStatus::Bad);
                    log::info!("🚫 entry guard {} is no longer usable", guard.nickname);
                    changed = true;
                }
                (true, Some(_)) => {
                    guard.bad_since = None;
                    events.guard(guard.identity, GuardStatus::Good);
                    log::info!("✅ entry guard {} is usable again", guard.nickname);
                    changed = true;
                }
                _ => {}
            }
        }

        let before = self.guards.len();
        let expired: Vec<RelayId> = self
            .guards
            .iter()
            .filter(|g| matches!(g.bad_since, Some(t) if now.saturating_sub(t) >= GUARD_EXPIRE_SECS))
            .map(|g| g.identity)
            .collect();
        for id in &expired {
            events.guard(*id, GuardStatus::Dropped);
            log::info!("🗑️ dropping long-dead entry guard {:?}", id);
        }
        self.guards
            .retain(|g| !matches!(g.bad_since, Some(t) if now.saturating_sub(t) >= GUARD_EXPIRE_SECS));

        if changed || self.guards.len() != before {
            self.dirty = true;
        }
    }

    // ===== Persistence =====

    /// Whether the state file should be rewritten now.
    pub fn needs_persist(&self, cfg: &Config, now: u64) -> bool {
        self.dirty && now.saturating_sub(self.last_persisted) >= cfg.guard_persist_interval()
    }

    pub fn note_persisted(&mut self, now: u64) {
        self.dirty = false;
        self.last_persisted = now;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Encode the guard list in the state-file format, one directive per
    /// line, each guard's detail lines following its EntryGuard line.
    pub fn encode_state(&self) -> String {
        let mut out = String::new();
        for g in &self.guards {
            out.push_str(&format!("EntryGuard {} {}\n", g.nickname, g.identity));
            if let Some(down) = g.unreachable_since {
                out.push_str(&format!("EntryGuardDownSince {}", format_time(down)));
                if let Some(last) = g.last_attempted {
                    out.push_str(&format!(" {}", format_time(last)));
                }
                out.push('\n');
            }
            if let Some(bad) = g.bad_since {
                out.push_str(&format!("EntryGuardUnlistedSince {}\n", format_time(bad)));
            }
            out.push_str(&format!(
                "EntryGuardAddedBy {} {} {}\n",
                g.identity,
                g.chosen_by_version,
                format_time(g.chosen_on_date)
            ));
        }
        out
    }

    /// Load the guard list from state-file text. Unknown directives are
    /// warned about and skipped; an unparseable value aborts the whole
    /// load, leaving the current list untouched.
    pub fn load_state(&mut self, text: &str) -> Result<()> {
        let guards = parse_state(text)?;
        log::info!("📂 loaded {} entry guards from state", guards.len());
        self.guards = guards;
        self.dirty = false;
        Ok(())
    }
}

fn parse_state(text: &str) -> Result<Vec<EntryGuard>> {
    let mut guards: Vec<EntryGuard> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let key = tokens.next().unwrap_or("");
        let rest: Vec<&str> = tokens.collect();

        match key.to_ascii_lowercase().as_str() {
            "entryguard" => {
                if rest.len() != 2 {
                    return Err(Error::Protocol(format!("malformed EntryGuard line: {:?}", line)));
                }
                let identity = RelayId::from_hex(rest[1])?;
                guards.push(EntryGuard {
                    nickname: rest[0].to_string(),
                    identity,
                    chosen_on_date: 0,
                    chosen_by_version: String::new(),
                    made_contact: true,
                    can_retry: false,
                    bad_since: None,
                    unreachable_since: None,
                    last_attempted: None,
                });
            }
            "entryguarddownsince" => {
                let guard = guards.last_mut().ok_or_else(|| {
                    Error::Protocol("EntryGuardDownSince before any EntryGuard".into())
                })?;
                if rest.len() != 2 && rest.len() != 4 {
                    return Err(Error::Protocol(format!(
                        "malformed EntryGuardDownSince line: {:?}",
                        line
                    )));
                }
                guard.unreachable_since = Some(parse_time(rest[0], rest[1])?);
                if rest.len() == 4 {
                    guard.last_attempted = Some(parse_time(rest[2], rest[3])?);
                }
            }
            "entryguardunlistedsince" => {
                let guard = guards.last_mut().ok_or_else(|| {
                    Error::Protocol("EntryGuardUnlistedSince before any EntryGuard".into())
                })?;
                if rest.len() != 2 {
                    return Err(Error::Protocol(format!(
                        "malformed EntryGuardUnlistedSince line: {:?}",
                        line
                    )));
                }
                guard.bad_since = Some(parse_time(rest[0], rest[1])?);
            }
            "entryguardaddedby" => {
                let guard = guards.last_mut().ok_or_else(|| {
                    Error::Protocol("EntryGuardAddedBy before any EntryGuard".into())
                })?;
                if rest.len() != 4 {
                    return Err(Error::Protocol(format!(
                        "malformed EntryGuardAddedBy line: {:?}",
                        line
                    )));
                }
                let identity = RelayId::from_hex(rest[0])?;
                if identity != guard.identity {
                    return Err(Error::Protocol(
                        "EntryGuardAddedBy identity does not match its guard".into(),
                    ));
                }
                guard.chosen_by_version = rest[1].to_string();
                guard.chosen_on_date = parse_time(rest[2], rest[3])?;
            }
            _ => {
                log::warn!("⚠️ skipping unknown guard-state directive {:?}", key);
            }
        }
    }

    Ok(guards)
}

// ===== Time formatting =====
//
// The state file stores civil UTC times as "YYYY-MM-DD HH:MM:SS".

/// Format Unix seconds as a civil UTC timestamp.
pub fn format_time(t: u64) -> String {
    let days = t / 86_400;
    let secs = t % 86_400;
    let (y, m, d) = civil_from_days(days as i64);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        y,
        m,
        d,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Parse a civil UTC timestamp split into its date and time tokens.
pub fn parse_time(date: &str, time: &str) -> Result<u64> {
    let bad = || Error::Protocol(format!("unparseable time {:?} {:?}", date, time));

    let mut dparts = date.split('-');
    let y: i64 = dparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let m: u64 = dparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let d: u64 = dparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    if dparts.next().is_some() || !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return Err(bad());
    }

    let mut tparts = time.split(':');
    let hh: u64 = tparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let mm: u64 = tparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let ss: u64 = tparts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    if tparts.next().is_some() || hh > 23 || mm > 59 || ss > 60 {
        return Err(bad());
    }

    let days = days_from_civil(y, m as i64, d as i64);
    if days < 0 {
        return Err(bad());
    }
    Ok(days as u64 * 86_400 + hh * 3600 + mm * 60 + ss)
}

/// Days since 1970-01-01 for a civil date (proleptic Gregorian).
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Inverse of [`days_from_civil`].
fn civil_from_days(z: i64) -> (i64, u64, u64) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u64, d as u64)
}
