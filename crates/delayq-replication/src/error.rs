//! Error types for replication operations.

use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while driving a follower.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Reading the leader's log failed.
    #[error("leader log read failed: {0}")]
    LeaderRead(#[source] delayq_core::Error),

    /// The follower rejected a write.
    #[error("replica write at offset {offset} failed: {source}")]
    ReplicaWrite {
        /// Virtual offset of the attempted write.
        offset: u64,
        /// The engine error the follower reported.
        #[source]
        source: delayq_core::Error,
    },

    /// The follower's log end lies before the leader's retained log; only a
    /// snapshot plus queue-start reset can recover it.
    #[error("replica at offset {replica_end} is behind the leader's retained log start {leader_start}")]
    Diverged {
        /// Earliest virtual offset the leader still has on disk.
        leader_start: u64,
        /// The follower's current write end.
        replica_end: u64,
    },

    /// Transferring or applying the store snapshot failed.
    #[error("snapshot transfer failed: {0}")]
    Snapshot(#[source] delayq_core::Error),
}
