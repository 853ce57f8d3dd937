//! The follower surface a coordinator drives.

use std::io::Read;

use delayq_core::Result;
use delayq_storage::{DelayQueue, DelayedMessage, LogEnd};

/// Operations a follower engine exposes to replication.
///
/// Every write names the exact virtual offset it expects; the engine rejects
/// anything else with an offset-mismatch error so the coordinator can
/// reconcile before retrying.
pub trait ReplicaSink {
    /// Current log write end.
    fn write_end(&self) -> LogEnd;

    /// Earliest log position still on disk.
    fn read_start(&self) -> LogEnd;

    /// Appends raw leader bytes at `offset`.
    fn put_raw(&self, raw: &[u8], offset: u64, check_size: u64, msg_num: u64) -> Result<LogEnd>;

    /// Applies a decoded leader message at `offset`.
    fn put_message(&self, msg: DelayedMessage, offset: u64, check_size: u64) -> Result<LogEnd>;

    /// Resets the log write end for reconciliation.
    fn reset_end(&self, offset: u64, total_count: u64) -> Result<()>;

    /// Rolls the log back by an exact byte range.
    fn rollback(&self, offset: u64, diff_count: u64) -> Result<()>;

    /// Reinitializes the log at a leader-supplied queue start.
    fn reset_with_queue_start(&self, offset: u64, total_count: u64) -> Result<()>;

    /// Replaces the index store with a snapshot stream.
    fn restore_store(&self, r: &mut dyn Read) -> Result<()>;
}

impl ReplicaSink for DelayQueue {
    fn write_end(&self) -> LogEnd {
        DelayQueue::write_end(self)
    }

    fn read_start(&self) -> LogEnd {
        DelayQueue::read_start(self)
    }

    fn put_raw(&self, raw: &[u8], offset: u64, check_size: u64, msg_num: u64) -> Result<LogEnd> {
        self.put_raw_on_replica(raw, offset, check_size, msg_num)
    }

    fn put_message(&self, msg: DelayedMessage, offset: u64, check_size: u64) -> Result<LogEnd> {
        self.put_message_on_replica(msg, offset, check_size)
    }

    fn reset_end(&self, offset: u64, total_count: u64) -> Result<()> {
        self.reset_end_no_lock(offset, total_count)
    }

    fn rollback(&self, offset: u64, diff_count: u64) -> Result<()> {
        self.rollback_no_lock(offset, diff_count)
    }

    fn reset_with_queue_start(&self, offset: u64, total_count: u64) -> Result<()> {
        self.reset_with_queue_start_no_lock(offset, total_count)
    }

    fn restore_store(&self, r: &mut dyn Read) -> Result<()> {
        self.restore_store_from(r)
    }
}
