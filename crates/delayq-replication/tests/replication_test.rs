//! Leader/follower tests: snapshot transfer, log replay and offset checks.

use std::path::Path;

use bytes::Bytes;
use delayq_core::{DelayedType, Error, QueueConfig};
use delayq_replication::{bootstrap_follower, replay_log, ReplicaSink, ReplicationError};
use delayq_storage::{DelayQueue, DelayedMessage};
use tempfile::TempDir;

fn channel_msg(orig_id: u64, channel: &str, deliver_at: i64, payload: &[u8]) -> DelayedMessage {
    DelayedMessage {
        id: 0,
        orig_id,
        trace_id: 0,
        delayed_type: DelayedType::Channel,
        channel: channel.to_owned(),
        deliver_at,
        timestamp: 1,
        payload: Bytes::copy_from_slice(payload),
        ext: Bytes::new(),
    }
}

fn open_queue(dir: &Path, config: QueueConfig) -> DelayQueue {
    DelayQueue::open("t", 0, dir, config, None, false).unwrap()
}

#[test]
fn test_fresh_follower_catches_up() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = open_queue(leader_dir.path(), QueueConfig::default());
    let follower = open_queue(follower_dir.path(), QueueConfig::default());

    for i in 1..=5u64 {
        leader.put_delayed(channel_msg(i, "c", 100 * i as i64, b"payload")).unwrap();
    }
    leader.force_flush();

    let stats = bootstrap_follower(&leader, &follower).unwrap();
    assert_eq!(stats.records, 5);

    assert_eq!(follower.write_end(), leader.write_end());
    assert_eq!(follower.synced_offset().unwrap(), leader.synced_offset().unwrap());

    let leader_peek = leader.peek_all(16).unwrap();
    let follower_peek = follower.peek_all(16).unwrap();
    assert_eq!(leader_peek, follower_peek);

    // the replayed records are byte-identical to the leader's encoding
    let mut leader_bytes = Vec::new();
    let mut follower_bytes = Vec::new();
    for (l, f) in leader_peek.iter().zip(&follower_peek) {
        l.encode_to(&mut leader_bytes, false);
        f.encode_to(&mut follower_bytes, false);
    }
    assert_eq!(leader_bytes, follower_bytes);
}

#[test]
fn test_offset_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let follower = open_queue(dir.path(), QueueConfig::default());

    let mut seed = channel_msg(1, "c", 100, b"x");
    seed.id = 1;
    let end = follower.put_message_on_replica(seed, 0, 0).unwrap();
    let synced_before = follower.synced_offset().unwrap();

    let mut framed = Vec::new();
    let mut record = channel_msg(2, "c", 200, b"y");
    record.id = 2;
    record.encode_framed_to(&mut framed, false);

    let err = follower
        .put_raw_on_replica(&framed, end.virtual_offset + 50, framed.len() as u64, 1)
        .unwrap_err();
    assert!(matches!(err, Error::WriteOffsetMismatch { .. }));

    assert_eq!(follower.write_end(), end);
    assert_eq!(follower.synced_offset().unwrap(), synced_before);
}

#[test]
fn test_replay_resumes_from_follower_end() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let leader = open_queue(leader_dir.path(), QueueConfig::default());
    let follower = open_queue(follower_dir.path(), QueueConfig::default());

    for i in 1..=3u64 {
        leader.put_delayed(channel_msg(i, "c", 100 * i as i64, b"early")).unwrap();
    }
    leader.force_flush();
    bootstrap_follower(&leader, &follower).unwrap();

    for i in 4..=6u64 {
        leader.put_delayed(channel_msg(i, "c", 100 * i as i64, b"late")).unwrap();
    }
    leader.force_flush();

    let stats = replay_log(&leader, &follower).unwrap();
    assert_eq!(stats.records, 3);
    assert_eq!(follower.write_end(), leader.write_end());
    assert_eq!(follower.peek_all(16).unwrap(), leader.peek_all(16).unwrap());
}

#[test]
fn test_bootstrap_resets_follower_behind_retained_log() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let config = QueueConfig { max_bytes_per_file: 64, ..Default::default() };
    let leader = open_queue(leader_dir.path(), config.clone());
    let follower = open_queue(follower_dir.path(), config);

    for i in 1..=10u64 {
        leader.put_delayed(channel_msg(i, "c", 1000 + i as i64, &[b'x'; 20])).unwrap();
    }
    leader.force_flush();
    let end = leader.write_end();
    leader.try_clean_old_data(40, false, end.virtual_offset).unwrap().unwrap();
    assert!(leader.read_start().virtual_offset > 0);

    // the fresh follower's empty log is behind the leader's retained start
    let stats = bootstrap_follower(&leader, &follower).unwrap();
    assert!(stats.records > 0);
    assert_eq!(follower.write_end().virtual_offset, leader.write_end().virtual_offset);
    assert_eq!(follower.read_start().virtual_offset, leader.read_start().virtual_offset);
    // the snapshot carried every live row, including those whose log bytes
    // were already cleaned on the leader
    assert_eq!(follower.peek_all(16).unwrap(), leader.peek_all(16).unwrap());
}

#[test]
fn test_diverged_follower_is_reported() {
    let leader_dir = TempDir::new().unwrap();
    let follower_dir = TempDir::new().unwrap();
    let config = QueueConfig { max_bytes_per_file: 64, ..Default::default() };
    let leader = open_queue(leader_dir.path(), config.clone());
    let follower = open_queue(follower_dir.path(), config);

    for i in 1..=10u64 {
        leader.put_delayed(channel_msg(i, "c", 1000 + i as i64, &[b'x'; 20])).unwrap();
    }
    leader.force_flush();
    let end = leader.write_end();
    leader.try_clean_old_data(40, false, end.virtual_offset).unwrap().unwrap();

    let err = replay_log(&leader, &follower).unwrap_err();
    assert!(matches!(err, ReplicationError::Diverged { .. }));
}

#[test]
fn test_rollback_through_replica_surface() {
    let dir = TempDir::new().unwrap();
    let follower = open_queue(dir.path(), QueueConfig::default());

    let mut m1 = channel_msg(1, "c", 100, b"first");
    m1.id = 1;
    let end1 = follower.put_message_on_replica(m1, 0, 0).unwrap();
    let mut m2 = channel_msg(2, "c", 200, b"second");
    m2.id = 2;
    let end2 = follower.put_message_on_replica(m2, end1.virtual_offset, 0).unwrap();

    ReplicaSink::rollback(&follower, end1.virtual_offset, 1).unwrap();
    assert_eq!(follower.write_end().virtual_offset, end1.virtual_offset);
    assert!(follower.write_end().virtual_offset < end2.virtual_offset);

    // the next replica write must land at the rolled-back offset again
    let mut m2b = channel_msg(3, "c", 300, b"replacement");
    m2b.id = 3;
    follower.put_message_on_replica(m2b, end1.virtual_offset, 0).unwrap();
}
