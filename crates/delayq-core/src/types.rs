//! Common value types shared across the engine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic 64-bit identifier assigned to a message on first persistence.
pub type MessageId = u64;

/// The categories of delayed messages.
///
/// Only [`DelayedType::Channel`] requires a non-empty channel string; the
/// category is the leading component of every index key, so its numeric
/// values are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DelayedType {
    /// Per-channel delayed redelivery.
    Channel = 1,
    /// Scheduled publication.
    Pub = 2,
    /// Transactional delayed commit.
    Transaction = 3,
}

impl DelayedType {
    /// Smallest valid category value.
    pub const MIN: u16 = 1;
    /// One past the largest valid category value.
    pub const MAX: u16 = 4;

    /// Returns the wire value of this category.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parses a wire value back into a category.
    #[must_use]
    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Channel),
            2 => Some(Self::Pub),
            3 => Some(Self::Transaction),
            _ => None,
        }
    }
}

/// Source of message ids.
///
/// The owning topic normally injects a cluster-wide generator; engines
/// without one fall back to [`SeqIdGenerator`].
pub trait IdGenerator: Send + Sync {
    /// Returns the next id. Ids must be strictly increasing per partition.
    fn next_id(&self) -> MessageId;
}

/// Process-local sequential id source backed by an atomic counter.
#[derive(Debug, Default)]
pub struct SeqIdGenerator {
    seq: AtomicU64,
}

impl SeqIdGenerator {
    /// Creates a generator starting from zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SeqIdGenerator {
    fn next_id(&self) -> MessageId {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}
