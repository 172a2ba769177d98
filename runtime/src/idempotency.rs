//! Duplicate detection for redelivered envelopes.
//!
//! Delivery is at-least-once, so a participant sees the same envelope again
//! after a crash before commit, a rebalance, or a publisher retry that appended
//! twice. The ledger remembers which envelopes were fully handled so the
//! reaction is not run a second time.
//!
//! Identity depends on the topic's [`IdempotencyScope`]:
//!
//! - `Entity`: `(topic, key, entity id)`. A payment for ticket 1 is confirmed once.
//! - `Content`: the same slot, versioned by a fingerprint of the raw value. The
//!   ledger keeps only the latest version per slot, so a repeat of the current
//!   status is a duplicate while DELAYED, ON_TIME, DELAYED is three updates.

use smart_ticketing_core::envelope::{Envelope, entity_id};
use smart_ticketing_core::topic::IdempotencyScope;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

/// Identity of a handled envelope.
///
/// `slot` names what the envelope is about. `version` is set for
/// content-scoped topics and distinguishes successive facts in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    slot: String,
    version: Option<u64>,
}

impl IdempotencyKey {
    /// Derive the identity of `envelope`.
    ///
    /// Envelopes that do not decode still get an identity (topic, key and
    /// value fingerprint) so a redelivered poison message is recognised too.
    #[must_use]
    pub fn for_envelope(envelope: &Envelope) -> Self {
        let key = envelope.key.as_deref().unwrap_or("");
        let raw = || Self {
            slot: format!("{}|{key}|#{:016x}", envelope.topic, fingerprint(&envelope.value)),
            version: None,
        };

        let Ok(topic) = envelope.registered_topic() else {
            return raw();
        };

        let entity = envelope
            .payload()
            .ok()
            .zip(topic.entity_field())
            .and_then(|(payload, field)| entity_id(topic, &payload, field).ok());
        let Some(id) = entity else {
            return raw();
        };

        let slot = format!("{topic}|{key}|{id}");
        match topic.idempotency_scope() {
            IdempotencyScope::Entity => Self { slot, version: None },
            IdempotencyScope::Content => Self {
                slot,
                version: Some(fingerprint(&envelope.value)),
            },
        }
    }

    /// What the envelope is about; versions of one slot replace each other.
    #[must_use]
    pub fn slot(&self) -> &str {
        &self.slot
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(version) => write!(f, "{}@{version:016x}", self.slot),
            None => f.write_str(&self.slot),
        }
    }
}

fn fingerprint(value: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Memory of fully handled envelopes.
pub trait IdempotencyLedger: Send + Sync {
    /// Whether `key` is the latest handled identity of its slot.
    fn contains(&self, key: &IdempotencyKey) -> bool;

    /// Mark `key` as handled, replacing any earlier version of its slot.
    fn record(&self, key: IdempotencyKey);
}

/// Bounded in-memory ledger.
///
/// Forgets the oldest slots first once `capacity` is reached. A restart
/// forgets everything; redeliveries after a restart are caught by the
/// downstream consumers' own ledgers.
#[derive(Debug)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    latest: HashMap<String, Option<u64>>,
    order: VecDeque<String>,
}

impl InMemoryLedger {
    /// Create a ledger remembering at most `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of remembered slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).order.len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl IdempotencyLedger for InMemoryLedger {
    fn contains(&self, key: &IdempotencyKey) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .get(&key.slot)
            == Some(&key.version)
    }

    fn record(&self, key: IdempotencyKey) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.latest.insert(key.slot.clone(), key.version).is_some() {
            return;
        }
        state.order.push_back(key.slot);

        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.latest.remove(&oldest);
            }
        }
    }
}
