//! Priority tags and outbound batch records.
//!
//! A [`ProcessingRecord`] is one batch of serialized events sharing a single
//! [`Priority`]. Once built, only its retry counter can change.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source of record identifiers, unique for the life of the process.
static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Transmission class of an event.
///
/// Ordered so that `Error > Performance > UserBehavior`. On the wire the
/// priority is the integer code `1`, `2` or `3` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Faults and exceptions. Never starved by other traffic.
    Error,
    /// Performance marks and timings.
    Performance,
    /// Clicks and other user interactions.
    UserBehavior,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 3] = [Self::Error, Self::Performance, Self::UserBehavior];

    /// Wire code of this priority.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Error => 1,
            Self::Performance => 2,
            Self::UserBehavior => 3,
        }
    }

    /// Position in [`Priority::ALL`]; usable as an array index.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.code() - 1)
    }

    /// Parse a wire code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] for codes outside `1..=3`.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Error),
            2 => Ok(Self::Performance),
            3 => Ok(Self::UserBehavior),
            other => Err(Error::invalid_event(format!("unknown priority {other}"))),
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower wire code means more urgent.
        other.code().cmp(&self.code())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_code(code)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.code()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Performance => write!(f, "performance"),
            Self::UserBehavior => write!(f, "user_behavior"),
        }
    }
}

/// One outbound batch of serialized events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingRecord {
    id: u64,
    priority: Priority,
    events: Vec<String>,
    retries: u32,
    created_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// Build a record from already-serialized events.
    #[must_use]
    pub fn new(priority: Priority, events: Vec<String>) -> Self {
        Self {
            id: NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed),
            priority,
            events,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    /// Process-unique identifier, used in logs and the dead-letter store.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Priority shared by every event in the batch.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Serialized events, in the order they were recorded.
    #[must_use]
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Failed send attempts so far.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// When the batch was built.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Count one failed send attempt and return the new total.
    pub fn record_failure(&mut self) -> u32 {
        self.retries = self.retries.saturating_add(1);
        self.retries
    }

    /// Whether the record has used up its retry budget.
    #[must_use]
    pub fn exceeds(&self, max_retries: u32) -> bool {
        self.retries > max_retries
    }

    /// Plaintext body handed to the cipher: a JSON array of the event strings.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.events)?)
    }
}
