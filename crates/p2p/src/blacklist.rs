//! Peer blacklist with attempt escalation and capacity flood protection.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{peer::PeerId, wire::DisconnectReason};

/// Blacklist policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct BlacklistConfig {
    /// Expiry for ordinary temporary entries.
    pub default_expiry: Duration,
    /// Window for transient reconnect offences.
    pub purge_window: Duration,
    /// Reconnect attempts within the window before an entry turns
    /// permanent.
    pub escalation_attempts: u32,
    /// Beyond this many entries, new connections are flood-dropped.
    pub capacity: usize,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            default_expiry: Duration::from_secs(24 * 60 * 60),
            purge_window: Duration::from_secs(30),
            escalation_attempts: 3,
            capacity: 250,
        }
    }
}

/// Entries are keyed by peer id or by remote address; permanent offences
/// insert both.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum BlacklistKey {
    Peer(PeerId),
    Address(String),
}

#[derive(Clone, Debug)]
struct BlacklistEntry {
    reason: DisconnectReason,
    /// When the entry was first created. Repeat offences do not reset it.
    timestamp: Instant,
    permanent: bool,
    expires_at: Option<Instant>,
    attempts: u32,
    violations: Vec<DisconnectReason>,
}

/// Owned by the peer manager's loop; no interior locking needed.
#[derive(Debug)]
pub struct Blacklist {
    entries: HashMap<BlacklistKey, BlacklistEntry>,
    config: BlacklistConfig,
}

impl Blacklist {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            entries: HashMap::new(),
            config,
        }
    }

    /// Records an offence. Repeat offences within the purge window bump
    /// the attempt counter; reconnect spam escalates to permanent after
    /// the configured attempts.
    pub fn report(&mut self, key: BlacklistKey, reason: DisconnectReason) {
        self.report_at(key, reason, Instant::now());
    }

    fn report_at(&mut self, key: BlacklistKey, reason: DisconnectReason, now: Instant) {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.attempts += 1;
                entry.violations.push(reason);
                if reason.is_permanent() {
                    entry.permanent = true;
                    entry.expires_at = None;
                    entry.reason = reason;
                } else if entry.attempts >= self.config.escalation_attempts
                    && now.duration_since(entry.timestamp) <= self.config.purge_window
                {
                    warn!(?key, attempts = entry.attempts, "escalating to permanent");
                    entry.permanent = true;
                    entry.expires_at = None;
                }
            }
            None => {
                let permanent = reason.is_permanent();
                let expires_at = if permanent {
                    None
                } else if reason == DisconnectReason::Reconnecting {
                    Some(now + self.config.purge_window)
                } else {
                    Some(now + self.config.default_expiry)
                };
                debug!(?key, ?reason, permanent, "blacklisting");
                self.entries.insert(
                    key,
                    BlacklistEntry {
                        reason,
                        timestamp: now,
                        permanent,
                        expires_at,
                        attempts: 1,
                        violations: vec![reason],
                    },
                );
            }
        }
    }

    pub fn is_blacklisted(&self, key: &BlacklistKey) -> bool {
        self.is_blacklisted_at(key, Instant::now())
    }

    fn is_blacklisted_at(&self, key: &BlacklistKey, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(entry) => entry.permanent || entry.expires_at.is_some_and(|at| at > now),
            None => false,
        }
    }

    /// Removes expired temporary entries. Run once per minute.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&mut self, now: Instant) {
        self.entries
            .retain(|_, e| e.permanent || e.expires_at.is_some_and(|at| at > now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity circuit-breaker: when tripped, newly connecting peers are
    /// dropped without session setup.
    pub fn over_capacity(&self) -> bool {
        self.entries.len() > self.config.capacity
    }

    #[cfg(test)]
    fn entry(&self, key: &BlacklistKey) -> Option<&BlacklistEntry> {
        self.entries.get(key)
    }
}
