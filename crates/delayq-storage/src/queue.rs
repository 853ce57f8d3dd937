//! The delayed-queue engine for one topic partition.
//!
//! A put appends the encoded message to the segmented log, then commits the
//! index rows and the reached log offset in one store transaction. The two
//! stores have no cross-store transaction; the log is the replication source
//! of truth and a store commit failure leaves the log one record ahead,
//! which the next replication sync reconciles by re-applying or resetting.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use delayq_core::{DelayedType, Error, IdGenerator, MessageId, QueueConfig, Result, SeqIdGenerator};
use redb::{ReadableTable, Table};
use tracing::{debug, error, info, warn};

use crate::index::{self as keys, IndexStore, DELAYED_MESSAGE, DELAYED_MESSAGE_INDEX, META};
use crate::log::{CleanBoundary, LogEnd, LogScanner, SegmentedLog};
use crate::message::{DelayedMessage, MIN_MSG_LENGTH, MSG_OVERHEAD};

/// Raw primary keys of the oldest live entries, one per scanned prefix.
pub type RecentKeyList = Vec<Vec<u8>>;

/// Convert any displayable store error into our error type.
fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Store(e.to_string())
}

/// Result of a successful put.
#[derive(Debug, Clone, Copy)]
pub struct PutOutcome {
    /// Id the message was persisted under.
    pub id: MessageId,
    /// Virtual offset of the appended record.
    pub offset: u64,
    /// Bytes appended, including the length frame.
    pub write_bytes: u32,
    /// Log write end after the append.
    pub end: LogEnd,
}

/// Filter for peek scans.
#[derive(Debug, Clone, Copy)]
pub struct PeekFilter<'a> {
    /// Restrict the scan to one category; `None` scans everything.
    pub delayed_type: Option<DelayedType>,
    /// Restrict to one channel; ignored when empty.
    pub channel: &'a str,
}

impl<'a> PeekFilter<'a> {
    /// Channel-delayed messages of `channel`.
    #[must_use]
    pub fn channel(channel: &'a str) -> Self {
        Self { delayed_type: Some(DelayedType::Channel), channel }
    }

    /// Scheduled publications.
    #[must_use]
    pub fn pub_delayed() -> Self {
        Self { delayed_type: Some(DelayedType::Pub), channel: "" }
    }

    /// Everything.
    #[must_use]
    pub fn all() -> Self {
        Self { delayed_type: None, channel: "" }
    }
}

enum PutSource<'a> {
    Message(DelayedMessage),
    Raw(&'a [u8]),
}

/// Durable delayed-message queue for one (topic, partition) pair.
pub struct DelayQueue {
    topic: String,
    partition: u32,
    backend_name: String,
    data_dir: PathBuf,
    db_path: PathBuf,
    config: QueueConfig,

    log: SegmentedLog,
    store: IndexStore,

    id_gen: Option<Arc<dyn IdGenerator>>,
    default_id_gen: SeqIdGenerator,

    /// Excludes store compaction from every writer.
    compact_lock: Mutex<()>,
    /// Best-effort per-channel lower bound on the earliest undelivered
    /// timestamp; an entry only ever promises "nothing earlier than this".
    oldest: Mutex<HashMap<String, i64>>,

    exiting: AtomicBool,
    need_flush: AtomicBool,
    last_sync_count: AtomicU64,
    need_fix: AtomicBool,
    is_ext: bool,
}

impl DelayQueue {
    /// Opens the engine under `<data_path>/delayed_queue/`, recovering both
    /// stores. A failed queue-start reconstruction flags the engine (see
    /// [`Self::is_data_need_fix`]) instead of failing the open.
    pub fn open(
        topic: &str,
        partition: u32,
        data_path: &Path,
        config: QueueConfig,
        id_gen: Option<Arc<dyn IdGenerator>>,
        is_ext: bool,
    ) -> Result<Self> {
        let data_dir = data_path.join("delayed_queue");
        fs::create_dir_all(&data_dir)?;

        let backend_name = format!("{topic}-{partition}-delayed");
        let log = SegmentedLog::open(
            backend_name.clone(),
            &data_dir,
            config.max_bytes_per_file,
            MIN_MSG_LENGTH,
            config.max_msg_size + MSG_OVERHEAD,
        )?;
        let needs_fix = log.needs_fix();
        if needs_fix {
            warn!(topic, partition, "queue start needs fix, waiting for restore from leader");
        }

        let db_path = data_dir.join(format!("{backend_name}.db"));
        let store = IndexStore::open(&db_path)?;

        info!(topic, partition, dir = %data_dir.display(), "opened delayed queue");
        Ok(Self {
            topic: topic.to_owned(),
            partition,
            backend_name,
            data_dir,
            db_path,
            config,
            log,
            store,
            id_gen,
            default_id_gen: SeqIdGenerator::new(),
            compact_lock: Mutex::new(()),
            oldest: Mutex::new(HashMap::new()),
            exiting: AtomicBool::new(false),
            need_flush: AtomicBool::new(false),
            last_sync_count: AtomicU64::new(0),
            need_fix: AtomicBool::new(needs_fix),
            is_ext,
        })
    }

    /// `topic-partition`, used in log statements.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }

    /// Whether the queue runs with the extended-header encoding.
    #[must_use]
    pub fn is_ext(&self) -> bool {
        self.is_ext
    }

    /// True if queue-start reconstruction failed on open and the engine is
    /// waiting for a restore from the leader.
    pub fn is_data_need_fix(&self) -> bool {
        self.need_fix.load(Ordering::SeqCst)
    }

    /// Sets or clears the needs-fix flag after a coordinator intervention.
    pub fn set_data_fix_state(&self, needs_fix: bool) {
        self.need_fix.store(needs_fix, Ordering::SeqCst);
    }

    /// Total messages ever appended to the log.
    pub fn total_message_count(&self) -> u64 {
        self.log.write_end().total_msg_count
    }

    /// Total bytes ever appended to the log.
    pub fn total_data_size(&self) -> u64 {
        self.log.write_end().virtual_offset
    }

    /// Current log write end.
    pub fn write_end(&self) -> LogEnd {
        self.log.write_end()
    }

    /// Earliest log position still on disk.
    pub fn read_start(&self) -> LogEnd {
        self.log.queue_start()
    }

    /// Size of the index store file in bytes.
    pub fn store_file_size(&self) -> Result<u64> {
        self.store.file_size()
    }

    /// Snapshot reader over the on-disk log, from the queue start to the
    /// flushed end.
    #[must_use]
    pub fn log_scanner(&self) -> LogScanner {
        LogScanner::new(
            self.backend_name.clone(),
            self.data_dir.clone(),
            self.log.queue_start(),
            self.log.read_end(),
        )
    }

    fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> MessageId {
        match self.id_gen {
            Some(ref g) => g.next_id(),
            None => self.default_id_gen.next_id(),
        }
    }

    // ---- producer side -----------------------------------------------------

    /// Persists a new delayed message, assigning its id.
    ///
    /// # Errors
    ///
    /// Rejects messages that already carry an id, fail their category's
    /// validity rules, or arrive after shutdown began.
    pub fn put_delayed(&self, msg: DelayedMessage) -> Result<PutOutcome> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        if msg.id > 0 {
            return Err(Error::invalid_arg("message id must be unassigned"));
        }
        if !msg.is_valid() {
            return Err(Error::invalid_arg("invalid delayed message"));
        }
        self.put_inner(PutSource::Message(msg), 0)
    }

    /// Mirrors a leader put at an exact offset. The message keeps the id the
    /// leader assigned.
    pub fn put_message_on_replica(
        &self,
        msg: DelayedMessage,
        offset: u64,
        check_size: u64,
    ) -> Result<LogEnd> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let wend = self.log.write_end();
        if wend.virtual_offset != offset {
            error!(topic = %self.full_name(), expected = wend.virtual_offset, got = offset,
                "replica write offset mismatch");
            return Err(Error::WriteOffsetMismatch { expected: wend.virtual_offset, got: offset });
        }
        if !msg.is_valid() {
            return Err(Error::invalid_arg("invalid delayed message"));
        }
        match self.put_inner(PutSource::Message(msg), check_size) {
            Ok(out) => Ok(out.end),
            Err(e) => {
                let _ = self.reset_end_no_lock(wend.virtual_offset, wend.total_msg_count);
                Err(e)
            }
        }
    }

    /// Mirrors raw leader log bytes at an exact offset, preserving them
    /// verbatim so replica hashes match the leader's.
    pub fn put_raw_on_replica(
        &self,
        raw: &[u8],
        offset: u64,
        check_size: u64,
        msg_num: u64,
    ) -> Result<LogEnd> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let wend = self.log.write_end();
        if wend.virtual_offset != offset {
            error!(topic = %self.full_name(), expected = wend.virtual_offset, got = offset,
                "replica write offset mismatch");
            return Err(Error::WriteOffsetMismatch { expected: wend.virtual_offset, got: offset });
        }
        if msg_num != 1 {
            return Err(Error::invalid_arg("raw delayed records must hold exactly one message"));
        }
        match self.put_inner(PutSource::Raw(raw), check_size) {
            Ok(out) => Ok(out.end),
            Err(e) => {
                let _ = self.reset_end_no_lock(wend.virtual_offset, wend.total_msg_count);
                Err(e)
            }
        }
    }

    fn put_inner(&self, src: PutSource<'_>, check_size: u64) -> Result<PutOutcome> {
        let (mut msg, raw) = match src {
            PutSource::Message(m) => (m, None),
            PutSource::Raw(raw) => {
                if raw.len() < 4 {
                    return Err(Error::invalid_arg("raw record shorter than its frame"));
                }
                (DelayedMessage::decode(&raw[4..], self.is_ext)?, Some(raw))
            }
        };
        if msg.id == 0 {
            msg.id = self.next_id();
        }
        let mut body = Vec::with_capacity(msg.encoded_len(self.is_ext));
        msg.encode_to(&mut body, self.is_ext);

        let compact_guard = self.compact_lock.lock().expect("compact lock poisoned");
        let (offset, write_bytes, end) = match raw {
            Some(raw) => {
                let r = self.log.put_raw(raw, 1)?;
                if check_size > 0 && check_size != u64::from(r.1) {
                    return Err(Error::invalid_arg(format!(
                        "raw write size mismatch: expected {check_size}, wrote {}",
                        r.1
                    )));
                }
                r
            }
            None => {
                if check_size > 0 && check_size != body.len() as u64 + 4 {
                    return Err(Error::invalid_arg(format!(
                        "write size mismatch: expected {check_size}, encoded {}",
                        body.len() + 4
                    )));
                }
                self.log.put(&body)?
            }
        };
        self.need_flush.store(true, Ordering::SeqCst);

        let msg_key =
            keys::message_key(msg.delayed_type.as_u16(), &msg.channel, msg.deliver_at, msg.id);
        let is_ext = self.is_ext;
        let res = self.store.update(|txn| {
            let mut primary = txn.open_table(DELAYED_MESSAGE).map_err(db_err)?;
            let mut secondary = txn.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
            let mut meta = txn.open_table(META).map_err(db_err)?;

            let existing =
                primary.get(msg_key.as_slice()).map_err(db_err)?.map(|g| g.value().to_vec());
            let exists = existing.is_some();
            if existing.as_deref() != Some(body.as_slice()) {
                primary.insert(msg_key.as_slice(), body.as_slice()).map_err(db_err)?;
                if let Some(ref old) = existing {
                    // a different value was overwritten, drop its secondary row
                    remove_secondary_for(&mut secondary, old, is_ext)?;
                }
                let idx_key =
                    keys::index_key(msg.delayed_type.as_u16(), &msg.channel, msg.orig_id);
                let idx_value = keys::index_value(msg.deliver_at, msg.orig_id);
                secondary.insert(idx_key.as_slice(), &idx_value[..]).map_err(db_err)?;
            }
            if !exists {
                add_counter(&mut meta, msg.delayed_type.as_u16(), &msg.channel, 1)?;
            }
            meta.insert(keys::SYNCED_OFFSET_KEY, end.virtual_offset.to_string().as_bytes())
                .map_err(db_err)?;
            Ok(())
        });
        drop(compact_guard);
        if let Err(e) = res {
            // the log stays ahead of the index here: replication re-applies
            // the record from the synced offset, converging both stores
            error!(topic = %self.full_name(), id = msg.id, error = %e,
                "failed to write delayed message to index store");
            return Err(e);
        }

        if msg.delayed_type == DelayedType::Channel {
            let mut oldest = self.oldest.lock().expect("oldest lock poisoned");
            match oldest.get(&msg.channel) {
                Some(&ts) if ts != 0 && msg.deliver_at >= ts => {}
                _ => {
                    oldest.insert(msg.channel.clone(), msg.deliver_at);
                }
            }
        }

        let sync_every = self.config.sync_every;
        if sync_every == 1
            || (sync_every > 0
                && end.total_msg_count.saturating_sub(self.last_sync_count.load(Ordering::SeqCst))
                    >= sync_every)
        {
            if let Err(e) = self.flush() {
                warn!(topic = %self.full_name(), error = %e, "flush after put failed");
            }
        }

        Ok(PutOutcome { id: msg.id, offset, write_bytes, end })
    }

    // ---- consumer side -----------------------------------------------------

    /// Returns up to `limit` messages due by `deadline`, in
    /// (type, channel, deliver-at, id) order.
    ///
    /// For channel scans the per-channel oldest hint short-circuits scans
    /// that cannot produce results, and is re-seeded from the first key each
    /// completed scan observes.
    pub fn peek_recent(
        &self,
        deadline: i64,
        filter: PeekFilter<'_>,
        limit: usize,
    ) -> Result<Vec<DelayedMessage>> {
        let channel_scan =
            filter.delayed_type == Some(DelayedType::Channel) && !filter.channel.is_empty();
        if channel_scan {
            let oldest = self.oldest.lock().expect("oldest lock poisoned");
            if let Some(&ts) = oldest.get(filter.channel) {
                if ts > deadline {
                    return Ok(Vec::new());
                }
            }
        }

        let prefix = match filter.delayed_type {
            Some(dt) => keys::prefix_key(dt.as_u16(), filter.channel),
            None => Vec::new(),
        };
        let is_ext = self.is_ext;
        let mut first_ts = 0i64;
        let out = self.store.read(|rtx| {
            let table = rtx.open_table(DELAYED_MESSAGE).map_err(db_err)?;
            let mut out = Vec::new();
            for item in table.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                let (k, v) = item.map_err(db_err)?;
                let kb = k.value();
                if !kb.starts_with(&prefix) {
                    break;
                }
                let (_, ts, _, kch) = match keys::decode_message_key(kb) {
                    Ok(d) => d,
                    Err(e) => {
                        info!(error = %e, "skipping undecodable primary key");
                        continue;
                    }
                };
                if first_ts == 0 && channel_scan {
                    first_ts = ts;
                }
                if ts > deadline || out.len() >= limit {
                    break;
                }
                // the prefix can over-include keys of other channels
                if !filter.channel.is_empty() && kch != filter.channel.as_bytes() {
                    continue;
                }
                let msg = match DelayedMessage::decode(v.value(), is_ext) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(topic = %self.full_name(), error = %e,
                            "failed to decode delayed message");
                        continue;
                    }
                };
                if let Some(dt) = filter.delayed_type {
                    if msg.delayed_type != dt {
                        continue;
                    }
                }
                out.push(msg);
            }
            Ok(out)
        })?;

        if first_ts > 0 {
            self.oldest
                .lock()
                .expect("oldest lock poisoned")
                .insert(filter.channel.to_owned(), first_ts);
        }
        Ok(out)
    }

    /// Channel-delayed messages of `channel` due by `now`.
    pub fn peek_recent_channel(
        &self,
        now: i64,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<DelayedMessage>> {
        self.peek_recent(now, PeekFilter::channel(channel), limit)
    }

    /// Scheduled publications due by `now`.
    pub fn peek_recent_pub(&self, now: i64, limit: usize) -> Result<Vec<DelayedMessage>> {
        self.peek_recent(now, PeekFilter::pub_delayed(), limit)
    }

    /// Every live message, in key order.
    pub fn peek_all(&self, limit: usize) -> Result<Vec<DelayedMessage>> {
        self.peek_recent(i64::MAX, PeekFilter::all(), limit)
    }

    /// Removes a delivered message. The caller passes the message with the
    /// delayed id swapped into `orig_id`, which is how the in-flight
    /// tracking above this engine hands messages back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if the row is already gone; callers
    /// treat that as a completed confirmation.
    pub fn confirm(&self, msg: &DelayedMessage) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let _compact = self.compact_lock.lock().expect("compact lock poisoned");
        let is_ext = self.is_ext;
        let res = self.store.update(|txn| {
            let mut primary = txn.open_table(DELAYED_MESSAGE).map_err(db_err)?;
            let mut secondary = txn.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
            let mut meta = txn.open_table(META).map_err(db_err)?;
            delete_entry(
                &mut primary,
                &mut secondary,
                &mut meta,
                msg.delayed_type.as_u16(),
                &msg.channel,
                msg.deliver_at,
                msg.orig_id,
                is_ext,
            )
        });
        if let Err(ref e) = res {
            info!(topic = %self.full_name(), orig_id = msg.orig_id, error = %e,
                "failed to delete confirmed delayed message");
        }
        res
    }

    /// True if an original channel message currently has a delayed copy.
    pub fn is_channel_message_delayed(&self, orig_id: MessageId, channel: &str) -> bool {
        let key = keys::index_key(DelayedType::Channel.as_u16(), channel, orig_id);
        self.store
            .read(|rtx| {
                let table = rtx.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
                Ok(table.get(key.as_slice()).map_err(db_err)?.is_some())
            })
            .unwrap_or(false)
    }

    // ---- admin -------------------------------------------------------------

    /// Live count for one (type, channel) prefix.
    pub fn delayed_count(&self, delayed_type: DelayedType, channel: &str) -> Result<u64> {
        let ckey = keys::counter_key(delayed_type.as_u16(), channel);
        self.store.read(|rtx| {
            let table = rtx.open_table(META).map_err(db_err)?;
            Ok(table
                .get(ckey.as_slice())
                .map_err(db_err)?
                .map(|g| {
                    let v = g.value();
                    if v.len() == 8 {
                        u64::from_be_bytes(v.try_into().expect("length checked"))
                    } else {
                        0
                    }
                })
                .unwrap_or(0))
        })
    }

    /// Log offset reached by the last committed index transaction.
    pub fn synced_offset(&self) -> Result<u64> {
        self.store.read(|rtx| {
            let table = rtx.open_table(META).map_err(db_err)?;
            match table.get(keys::SYNCED_OFFSET_KEY).map_err(db_err)? {
                Some(g) => {
                    let v = g.value().to_vec();
                    let s = std::str::from_utf8(&v)
                        .map_err(|e| Error::Corrupt(format!("synced offset not ascii: {e}")))?;
                    s.parse()
                        .map_err(|e| Error::Corrupt(format!("synced offset not a number: {e}")))
                }
                None => Ok(0),
            }
        })
    }

    /// Deletes every entry of a prefix older than `(deliver_at, id)`, in
    /// bounded transaction batches.
    fn empty_delayed_until(
        &self,
        delayed_type: u16,
        deliver_at: i64,
        id: MessageId,
        channel: &str,
    ) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let prefix = keys::prefix_key(delayed_type, channel);
        let tx_max_batch = self.config.tx_max_batch;
        let is_ext = self.is_ext;
        let _compact = self.compact_lock.lock().expect("compact lock poisoned");
        loop {
            let batched = self.store.update(|txn| {
                let mut primary = txn.open_table(DELAYED_MESSAGE).map_err(db_err)?;
                let mut secondary = txn.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
                let mut meta = txn.open_table(META).map_err(db_err)?;

                let mut doomed: Vec<(i64, MessageId)> = Vec::new();
                {
                    for item in primary.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                        let (k, _) = item.map_err(db_err)?;
                        let kb = k.value();
                        if !kb.starts_with(&prefix) || doomed.len() >= tx_max_batch {
                            break;
                        }
                        let (_, ts, kid, kch) = match keys::decode_message_key(kb) {
                            Ok(d) => d,
                            Err(e) => {
                                info!(error = %e, "skipping undecodable primary key");
                                continue;
                            }
                        };
                        if ts > deliver_at || (ts == deliver_at && kid >= id) {
                            break;
                        }
                        if kch != channel.as_bytes() {
                            continue;
                        }
                        doomed.push((ts, kid));
                    }
                }
                for &(ts, kid) in &doomed {
                    match delete_entry(
                        &mut primary,
                        &mut secondary,
                        &mut meta,
                        delayed_type,
                        channel,
                        ts,
                        kid,
                        is_ext,
                    ) {
                        Ok(()) | Err(Error::KeyNotFound) => {}
                        Err(e) => {
                            warn!(topic = %self.full_name(), error = %e,
                                "failed to delete delayed entry");
                            return Err(e);
                        }
                    }
                }
                Ok(doomed.len())
            })?;
            if batched == 0 {
                break;
            }
        }
        if delayed_type == DelayedType::Channel.as_u16() && !channel.is_empty() {
            self.oldest
                .lock()
                .expect("oldest lock poisoned")
                .insert(channel.to_owned(), deliver_at);
        }
        Ok(())
    }

    fn empty_all(&self, delayed_type: u16, channel: &str) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let prefix = keys::prefix_key(delayed_type, channel);
        let tx_max_batch = self.config.tx_max_batch;
        let is_ext = self.is_ext;
        let _compact = self.compact_lock.lock().expect("compact lock poisoned");
        loop {
            let batched = self.store.update(|txn| {
                let mut primary = txn.open_table(DELAYED_MESSAGE).map_err(db_err)?;
                let mut secondary = txn.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
                let mut meta = txn.open_table(META).map_err(db_err)?;

                let mut doomed: Vec<(i64, MessageId, Vec<u8>)> = Vec::new();
                {
                    for item in primary.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                        let (k, _) = item.map_err(db_err)?;
                        let kb = k.value();
                        if !kb.starts_with(&prefix) || doomed.len() >= tx_max_batch {
                            break;
                        }
                        let (kdt, ts, kid, kch) = match keys::decode_message_key(kb) {
                            Ok(d) => d,
                            Err(e) => {
                                info!(error = %e, "skipping undecodable primary key");
                                continue;
                            }
                        };
                        if kdt != delayed_type {
                            continue;
                        }
                        if !channel.is_empty() && kch != channel.as_bytes() {
                            continue;
                        }
                        doomed.push((ts, kid, kch.to_vec()));
                    }
                }
                for (ts, kid, kch) in &doomed {
                    let kch = match std::str::from_utf8(kch) {
                        Ok(s) => s,
                        Err(_) => continue,
                    };
                    match delete_entry(
                        &mut primary,
                        &mut secondary,
                        &mut meta,
                        delayed_type,
                        kch,
                        *ts,
                        *kid,
                        is_ext,
                    ) {
                        Ok(()) | Err(Error::KeyNotFound) => {}
                        Err(e) => {
                            warn!(topic = %self.full_name(), error = %e,
                                "failed to delete delayed entry");
                            return Err(e);
                        }
                    }
                }
                Ok(doomed.len())
            })?;
            debug!(topic = %self.full_name(), channel, batched, "emptied delayed batch");
            if batched == 0 {
                break;
            }
        }
        if delayed_type == DelayedType::Channel.as_u16() && !channel.is_empty() {
            // nothing left, park the hint an hour out until new puts arrive
            self.oldest
                .lock()
                .expect("oldest lock poisoned")
                .insert(channel.to_owned(), now_nanos() + 3600 * 1_000_000_000);
        }
        Ok(())
    }

    /// Deletes every entry of one category.
    pub fn empty_delayed_type(&self, delayed_type: DelayedType) -> Result<()> {
        self.empty_all(delayed_type.as_u16(), "")
    }

    /// Deletes every channel-delayed entry of `channel`.
    ///
    /// # Errors
    ///
    /// An empty channel name is rejected so one bad call cannot wipe every
    /// channel.
    pub fn empty_delayed_channel(&self, channel: &str) -> Result<()> {
        if channel.is_empty() {
            return Err(Error::invalid_arg("empty delayed channel name should be given"));
        }
        self.empty_all(DelayedType::Channel.as_u16(), channel)
    }

    /// Snapshot of the oldest live key per prefix plus the live counters,
    /// taken on the leader and shipped to followers so they can line up
    /// their consumed state.
    pub fn oldest_consumed_state(
        &self,
        channels: &[String],
        include_others: bool,
    ) -> Result<(RecentKeyList, HashMap<u16, u64>, HashMap<String, u64>)> {
        let mut prefix_list: Vec<(Vec<u8>, String)> = Vec::new();
        let mut type_counts = HashMap::new();
        let mut channel_counts = HashMap::new();
        if include_others {
            for dt in [DelayedType::Pub, DelayedType::Transaction] {
                prefix_list.push((keys::prefix_key(dt.as_u16(), ""), String::new()));
                type_counts.insert(dt.as_u16(), self.delayed_count(dt, "")?);
            }
        }
        for ch in channels {
            prefix_list.push((keys::prefix_key(DelayedType::Channel.as_u16(), ch), ch.clone()));
            channel_counts.insert(ch.clone(), self.delayed_count(DelayedType::Channel, ch)?);
        }

        let mut key_list = RecentKeyList::with_capacity(prefix_list.len());
        for (prefix, orig_ch) in &prefix_list {
            let found = self.store.read(|rtx| {
                let table = rtx.open_table(DELAYED_MESSAGE).map_err(db_err)?;
                for item in table.range::<&[u8]>(prefix.as_slice()..).map_err(db_err)? {
                    let (k, _) = item.map_err(db_err)?;
                    let kb = k.value();
                    if !kb.starts_with(prefix) {
                        break;
                    }
                    match keys::decode_message_key(kb) {
                        Ok((_, _, _, kch)) => {
                            if kch != orig_ch.as_bytes() {
                                continue;
                            }
                            return Ok(Some(kb.to_vec()));
                        }
                        Err(e) => {
                            info!(error = %e, "skipping undecodable primary key");
                            continue;
                        }
                    }
                }
                Ok(None)
            })?;
            if let Some(k) = found {
                key_list.push(k);
            }
        }
        Ok((key_list, type_counts, channel_counts))
    }

    /// Applies a leader's consumed-state snapshot: empties everything below
    /// each oldest key and wipes prefixes the leader reports as drained.
    pub fn update_consumed_state(
        &self,
        key_list: &[Vec<u8>],
        type_counts: &HashMap<u16, u64>,
        channel_counts: &HashMap<String, u64>,
    ) -> Result<()> {
        for key in key_list {
            match keys::decode_message_key(key) {
                Ok((dt, ts, id, kch)) => {
                    let channel = String::from_utf8_lossy(kch).into_owned();
                    self.empty_delayed_until(dt, ts, id, &channel)?;
                }
                Err(e) => {
                    info!(error = %e, "skipping undecodable consumed-state key");
                }
            }
        }
        for (&dt, &cnt) in type_counts {
            if cnt == 0 && dt != DelayedType::Channel.as_u16() {
                if let Some(t) = DelayedType::from_u16(dt) {
                    self.empty_delayed_type(t)?;
                }
            }
        }
        for (ch, &cnt) in channel_counts {
            if cnt == 0 {
                self.empty_delayed_channel(ch)?;
            }
        }
        Ok(())
    }

    // ---- retention and compaction ------------------------------------------

    /// Picks a clean boundary by scanning the log forward from the queue
    /// start, compacts the store if its thresholds allow, then advances the
    /// queue start past whole files below the boundary.
    ///
    /// With `retention_bytes > 0` the boundary keeps that many bytes below
    /// `max_clean_offset`; otherwise records older than the retention-days
    /// horizon are cleaned. Returns the new queue start, or `None` when
    /// nothing could be cleaned.
    pub fn try_clean_old_data(
        &self,
        retention_bytes: u64,
        dry_run: bool,
        max_clean_offset: u64,
    ) -> Result<Option<LogEnd>> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let oldest_pos = self.log.read_end();
        let clean_start = self.log.queue_start();
        if clean_start.virtual_offset + retention_bytes >= oldest_pos.virtual_offset {
            return Ok(None);
        }
        debug!(topic = %self.full_name(), start = ?clean_start, end = ?oldest_pos,
            max_clean_offset, "scanning for retention boundary");

        let mut max_clean = max_clean_offset;
        if oldest_pos.virtual_offset < max_clean || max_clean == 0 {
            max_clean = oldest_pos.virtual_offset;
        }

        let mut scanner = self.log_scanner();
        let retention_window =
            i64::from(self.config.retention_days) * 24 * 3600 * 1_000_000_000;
        let clean_before = now_nanos() - retention_window;
        let mut clean_end: Option<LogEnd> = None;
        loop {
            let read_info = scanner.position();
            let data = match scanner.read_one() {
                Ok(Some(d)) => d,
                Ok(None) => break,
                Err(e) => {
                    warn!(topic = %self.full_name(), error = %e, "retention scan read failed");
                    break;
                }
            };
            if retention_bytes > 0 {
                match max_clean.checked_sub(retention_bytes) {
                    Some(limit) if read_info.virtual_offset <= limit => {
                        clean_end = Some(read_info);
                    }
                    _ => break,
                }
            } else {
                match DelayedMessage::decode(&data, self.is_ext) {
                    Ok(m) => {
                        if m.timestamp >= clean_before
                            || read_info.virtual_offset >= max_clean
                        {
                            break;
                        }
                        clean_end = Some(read_info);
                    }
                    Err(e) => {
                        error!(topic = %self.full_name(), error = %e,
                            "failed to decode message during retention scan");
                    }
                }
            }
        }

        let Some(boundary) = clean_end else {
            return Ok(None);
        };
        if boundary.virtual_offset + retention_bytes >= max_clean {
            warn!(topic = %self.full_name(), boundary = boundary.virtual_offset, max_clean,
                "clean boundary cannot pass the oldest confirmed position");
            return Ok(None);
        }
        info!(topic = %self.full_name(), boundary = ?boundary, retention_bytes,
            "cleaning delayed queue");

        if !dry_run {
            self.compact_store(false)?;
        }
        self.log.clean_old_data_by_retention(
            CleanBoundary::Position { seg: boundary.seg, virtual_offset: boundary.virtual_offset },
            dry_run,
            max_clean,
        )
    }

    /// Rewrites the store into a fresh file, reclaiming dead space.
    ///
    /// Unless `force` is set the rewrite only runs once the file outgrew its
    /// threshold while holding few live entries, the signature of a store
    /// full of dead keys.
    pub fn compact_store(&self, force: bool) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        if !force {
            let size = self.store.file_size()?;
            if size < self.config.compact_threshold_bytes {
                return Ok(());
            }
            let live = self.store.live_count()?;
            if live > self.config.compact_count_threshold {
                return Ok(());
            }
        }

        info!(topic = %self.full_name(), "store compaction started");
        let mut tmp = self.db_path.as_os_str().to_owned();
        tmp.push("-tmp.compact");
        let tmp = PathBuf::from(tmp);
        let _ = fs::remove_file(&tmp);

        let _compact = self.compact_lock.lock().expect("compact lock poisoned");
        self.store.copy_to(
            &tmp,
            self.config.tx_max_size,
            Duration::from_millis(self.config.compact_deadline_ms),
        )?;
        self.store.swap_from(&tmp)?;
        self.oldest.lock().expect("oldest lock poisoned").clear();
        info!(topic = %self.full_name(), "store compaction finished");
        Ok(())
    }

    /// Runs the store integrity check, tolerating only the benign
    /// repaired-on-check class.
    pub fn check_consistency(&self) -> Result<()> {
        self.store.check_integrity().map_err(|e| {
            error!(topic = %self.full_name(), error = %e, "store consistency check failed");
            e
        })
    }

    // ---- replication surface -----------------------------------------------

    /// Streams a consistent store snapshot to `w` as
    /// `u64 size ‖ store bytes`, returning the bytes written.
    pub fn backup_store_to(&self, w: &mut dyn Write) -> Result<u64> {
        self.store.backup_to(w, self.config.tx_max_size)
    }

    /// Replaces the store with a snapshot read from `r`. The swap happens
    /// under the compaction lock and the store lock, then the oldest hints
    /// are dropped so the next peeks re-seed them.
    pub fn restore_store_from(&self, r: &mut dyn Read) -> Result<()> {
        if self.is_exiting() {
            return Err(Error::Exiting);
        }
        let tmp = self.store.stage_restore(r)?;
        let _compact = self.compact_lock.lock().expect("compact lock poisoned");
        self.store.swap_from(&tmp)?;
        self.oldest.lock().expect("oldest lock poisoned").clear();
        info!(topic = %self.full_name(), "restored index store from snapshot");
        Ok(())
    }

    /// Rolls the log back by an exact byte range, for replication
    /// reconciliation.
    pub fn rollback_no_lock(&self, offset: u64, diff_count: u64) -> Result<()> {
        let old = self.log.write_end();
        info!(topic = %self.full_name(), from = ?old, to = offset, diff_count, "rolling back log");
        let r = self.log.rollback_write(offset, diff_count).map(|_| ());
        self.need_flush.store(true, Ordering::SeqCst);
        r
    }

    /// Resets the log write end to an exact position, for replication
    /// reconciliation. A no-op when the log is already there.
    pub fn reset_end_no_lock(&self, offset: u64, total_count: u64) -> Result<()> {
        let old = self.log.write_end();
        if old.virtual_offset == offset && old.total_msg_count == total_count {
            return Ok(());
        }
        info!(topic = %self.full_name(), from = ?old, to = offset, total_count, "resetting log end");
        let r = self.log.reset_write_end(offset, total_count).map(|_| ());
        if let Err(ref e) = r {
            error!(topic = %self.full_name(), offset, error = %e, "failed to reset log end");
        }
        self.need_flush.store(true, Ordering::SeqCst);
        r
    }

    /// Reinitializes the log at a leader-supplied queue start, for followers
    /// whose local log is entirely behind a received snapshot.
    pub fn reset_with_queue_start_no_lock(&self, offset: u64, total_count: u64) -> Result<()> {
        warn!(topic = %self.full_name(), offset, total_count, "resetting log with new queue start");
        self.log.reset_with_queue_start(offset, total_count)?;
        self.need_flush.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Flushes both stores if anything is dirty.
    pub fn force_flush(&self) {
        if let Err(e) = self.flush() {
            error!(topic = %self.full_name(), error = %e, "flush failed");
        }
    }

    fn flush(&self) -> Result<()> {
        if !self.need_flush.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.last_sync_count.store(self.log.write_end().total_msg_count, Ordering::SeqCst);
        self.log.flush()?;
        self.store.sync()?;
        Ok(())
    }

    /// Flushes and shuts the engine down. Further mutations fail.
    pub fn close(&self) -> Result<()> {
        self.exit(false)
    }

    /// Shuts down and removes every file of this queue.
    pub fn delete(&self) -> Result<()> {
        self.exit(true)
    }

    fn exit(&self, deleted: bool) -> Result<()> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Err(Error::Exiting);
        }
        if deleted {
            info!(topic = %self.full_name(), "deleting delayed queue");
            self.store.close();
            let _ = fs::remove_file(&self.db_path);
            return self.log.delete();
        }
        info!(topic = %self.full_name(), "closing delayed queue");
        if let Err(e) = self.flush() {
            warn!(topic = %self.full_name(), error = %e, "flush on close failed");
        }
        self.store.close();
        self.log.close()
    }
}

/// Removes one primary row plus its secondary row and counter credit.
#[allow(clippy::too_many_arguments)]
fn delete_entry(
    primary: &mut Table<'_, &'static [u8], &'static [u8]>,
    secondary: &mut Table<'_, &'static [u8], &'static [u8]>,
    meta: &mut Table<'_, &'static [u8], &'static [u8]>,
    delayed_type: u16,
    channel: &str,
    deliver_at: i64,
    id: MessageId,
    is_ext: bool,
) -> Result<()> {
    let msg_key = keys::message_key(delayed_type, channel, deliver_at, id);
    let old = primary.remove(msg_key.as_slice()).map_err(db_err)?.map(|g| g.value().to_vec());
    let Some(old) = old else {
        return Err(Error::KeyNotFound);
    };
    remove_secondary_for(secondary, &old, is_ext)?;
    add_counter(meta, delayed_type, channel, -1)
}

/// Drops the secondary row belonging to a primary value.
fn remove_secondary_for(
    secondary: &mut Table<'_, &'static [u8], &'static [u8]>,
    primary_value: &[u8],
    is_ext: bool,
) -> Result<()> {
    let msg = match DelayedMessage::decode(primary_value, is_ext) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to decode stored delayed message");
            return Err(e);
        }
    };
    let idx_key = keys::index_key(msg.delayed_type.as_u16(), &msg.channel, msg.orig_id);
    secondary.remove(idx_key.as_slice()).map_err(db_err)?;
    Ok(())
}

/// Adjusts the live counter of one (type, channel) prefix.
fn add_counter(
    meta: &mut Table<'_, &'static [u8], &'static [u8]>,
    delayed_type: u16,
    channel: &str,
    delta: i64,
) -> Result<()> {
    let ckey = keys::counter_key(delayed_type, channel);
    let current = meta
        .get(ckey.as_slice())
        .map_err(db_err)?
        .map(|g| {
            let v = g.value();
            if v.len() == 8 {
                u64::from_be_bytes(v.try_into().expect("length checked"))
            } else {
                0
            }
        })
        .unwrap_or(0);
    let next = if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    };
    meta.insert(ckey.as_slice(), &next.to_be_bytes()[..]).map_err(db_err)?;
    Ok(())
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
