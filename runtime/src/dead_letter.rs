//! Poison messages that were committed past.
//!
//! A subscriber never leaves a malformed envelope in front of its cursor: it
//! records the envelope here with the rejection reason and then commits. The
//! record is the only trace of the message in this consumer group.

use crate::metrics::ChoreographyMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smart_ticketing_core::envelope::{Envelope, Position};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A rejected envelope with the reason it was rejected.
///
/// Serializes to JSON with the value rendered as lossy UTF-8 so it can be
/// shipped to a log pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    /// Consumer group that rejected it
    pub group: String,
    /// Where the envelope lives in the log
    pub position: Position,
    /// Partition key, if any
    pub key: Option<String>,
    /// Why the handler refused it
    pub reason: String,
    /// Raw value bytes as delivered
    #[serde(serialize_with = "lossy_utf8")]
    pub value: Vec<u8>,
    /// When it was rejected
    pub rejected_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Build a dead letter for `envelope`.
    #[must_use]
    pub fn new(group: impl Into<String>, envelope: &Envelope, reason: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            position: envelope.position(),
            key: envelope.key.clone(),
            reason: reason.into(),
            value: envelope.value.clone(),
            rejected_at: Utc::now(),
        }
    }
}

fn lossy_utf8<S: serde::Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(value))
}

/// Destination for rejected envelopes.
pub trait DeadLetterSink: Send + Sync {
    /// Record a rejected envelope. Must not fail.
    fn record(&self, letter: DeadLetter);
}

/// Bounded in-process dead letter queue.
///
/// Oldest entries are dropped when full. Every entry is also logged at
/// `error` level, so the log stream stays the durable record.
#[derive(Debug)]
pub struct DeadLetterQueue {
    queue: Arc<Mutex<VecDeque<DeadLetter>>>,
    max_size: usize,
}

impl DeadLetterQueue {
    /// Create a queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Oldest entry, if any.
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Maximum number of retained entries.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn record(&self, letter: DeadLetter) {
        tracing::error!(
            group = %letter.group,
            position = %letter.position,
            key = letter.key.as_deref().unwrap_or("<none>"),
            reason = %letter.reason,
            "Envelope rejected and committed past"
        );
        ChoreographyMetrics::record_dead_letter(&letter.position.topic);

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= self.max_size {
            queue.pop_front();
            tracing::warn!(max_size = self.max_size, "Dead letter queue full, dropping oldest entry");
        }
        queue.push_back(letter);
    }
}

impl Clone for DeadLetterQueue {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(1000)
    }
}
