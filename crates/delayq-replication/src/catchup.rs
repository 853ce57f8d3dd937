//! Catch-up driver: replays leader log bytes into a follower.

use delayq_storage::DelayQueue;
use tracing::{debug, info};

use crate::error::{ReplicationError, Result};
use crate::replica::ReplicaSink;

/// What a catch-up run moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchupStats {
    /// Records replayed onto the follower.
    pub records: u64,
    /// Log bytes replayed, including frames.
    pub bytes: u64,
}

/// Replays the leader's log from the follower's write end forward, one raw
/// record per put, each at its exact virtual offset.
///
/// # Errors
///
/// Fails with [`ReplicationError::Diverged`] when the follower's write end
/// lies before the leader's retained log; recover with
/// [`bootstrap_follower`] in that case.
pub fn replay_log(leader: &DelayQueue, follower: &impl ReplicaSink) -> Result<CatchupStats> {
    let start = follower.write_end();
    let leader_start = leader.read_start();
    if start.virtual_offset < leader_start.virtual_offset {
        return Err(ReplicationError::Diverged {
            leader_start: leader_start.virtual_offset,
            replica_end: start.virtual_offset,
        });
    }

    let mut scanner = leader.log_scanner();
    scanner.seek_virtual(start.virtual_offset).map_err(ReplicationError::LeaderRead)?;

    let mut stats = CatchupStats::default();
    loop {
        let pos = scanner.position();
        let body = match scanner.read_one().map_err(ReplicationError::LeaderRead)? {
            Some(b) => b,
            None => break,
        };
        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);

        follower
            .put_raw(&framed, pos.virtual_offset, framed.len() as u64, 1)
            .map_err(|e| ReplicationError::ReplicaWrite { offset: pos.virtual_offset, source: e })?;
        stats.records += 1;
        stats.bytes += framed.len() as u64;
    }
    debug!(records = stats.records, bytes = stats.bytes, "log replay finished");
    Ok(stats)
}

/// Brings a follower in line with the leader from scratch: ships a store
/// snapshot, resets the follower's log to the leader's retained start when
/// it is behind it, then replays the remaining log.
pub fn bootstrap_follower(leader: &DelayQueue, follower: &impl ReplicaSink) -> Result<CatchupStats> {
    let mut snapshot = Vec::new();
    leader.backup_store_to(&mut snapshot).map_err(ReplicationError::Snapshot)?;
    follower.restore_store(&mut snapshot.as_slice()).map_err(ReplicationError::Snapshot)?;

    let leader_start = leader.read_start();
    if follower.write_end().virtual_offset < leader_start.virtual_offset {
        follower
            .reset_with_queue_start(leader_start.virtual_offset, leader_start.total_msg_count)
            .map_err(ReplicationError::Snapshot)?;
    }

    let stats = replay_log(leader, follower)?;
    info!(
        records = stats.records,
        bytes = stats.bytes,
        end = follower.write_end().virtual_offset,
        "follower bootstrapped"
    );
    Ok(stats)
}
