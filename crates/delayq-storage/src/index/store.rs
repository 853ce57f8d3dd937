//! redb-backed index store.
//!
//! The store owns the database handle behind a lock so it can be closed and
//! reopened during restore and compaction without racing readers. Commits
//! run with batched durability; [`IndexStore::sync`] makes everything
//! committed so far durable, the same split the log writer uses between
//! appends and flushes.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use delayq_core::{Error, Result};
use redb::{
    Database, Durability, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition,
    WriteTransaction,
};
use tracing::{debug, info, warn};

use super::keys::COUNTER_PREFIX;

/// Primary table: sort key → wire-encoded message.
pub const DELAYED_MESSAGE: TableDefinition<'_, &[u8], &[u8]> =
    TableDefinition::new("delayed_message");

/// Secondary table: (type, channel, original id) → (deliver-at, original id).
pub const DELAYED_MESSAGE_INDEX: TableDefinition<'_, &[u8], &[u8]> =
    TableDefinition::new("delayed_message_index");

/// Counters and the synced log offset.
pub const META: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("meta");

/// Convert any displayable store error into our error type.
fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Store(e.to_string())
}

/// Transactional ordered key/value store over the three index tables.
pub struct IndexStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
    durability: Durability,
}

impl IndexStore {
    /// Opens or creates the database and makes sure all tables exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        debug!(path = %path.display(), "opening index store");
        let db = open_database(&path)?;
        Ok(Self { path, db: RwLock::new(Some(db)), durability: Durability::None })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` under a snapshot read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T>) -> Result<T> {
        let guard = self.db.read().expect("store lock poisoned");
        let db = guard.as_ref().ok_or_else(|| db_err("store is closed"))?;
        let txn = db.begin_read().map_err(db_err)?;
        f(&txn)
    }

    /// Runs `f` inside a write transaction and commits it. The transaction
    /// aborts if `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let guard = self.db.read().expect("store lock poisoned");
        let db = guard.as_ref().ok_or_else(|| db_err("store is closed"))?;
        let mut txn = db.begin_write().map_err(db_err)?;
        txn.set_durability(self.durability).map_err(db_err)?;
        let out = f(&txn)?;
        txn.commit().map_err(db_err)?;
        Ok(out)
    }

    /// Makes all previously committed transactions durable.
    ///
    /// Batched-durability commits persist once a durable commit lands, so an
    /// empty durable transaction acts as the store's fsync.
    pub fn sync(&self) -> Result<()> {
        let guard = self.db.read().expect("store lock poisoned");
        let db = guard.as_ref().ok_or_else(|| db_err("store is closed"))?;
        let mut txn = db.begin_write().map_err(db_err)?;
        txn.set_durability(Durability::Immediate).map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    /// Size of the database file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Sum of all live per-prefix counters.
    pub fn live_count(&self) -> Result<u64> {
        self.read(|rtx| {
            let table = rtx.open_table(META).map_err(db_err)?;
            let mut total = 0u64;
            for item in table.range::<&[u8]>(COUNTER_PREFIX..).map_err(db_err)? {
                let (k, v) = item.map_err(db_err)?;
                if !k.value().starts_with(COUNTER_PREFIX) {
                    break;
                }
                let v = v.value();
                if v.len() == 8 {
                    total += u64::from_be_bytes(v.try_into().expect("length checked"));
                }
            }
            Ok(total)
        })
    }

    /// Streams a backup to `w` as `u64 size ‖ store bytes`, returning the
    /// bytes written. The copy runs under one read transaction so the
    /// backup is a consistent snapshot.
    pub fn backup_to(&self, w: &mut dyn Write, tx_max_size: usize) -> Result<u64> {
        let tmp = self.tmp_path("backup");
        let _ = fs::remove_file(&tmp);
        self.copy_to(&tmp, tx_max_size, Duration::from_secs(60))?;

        let size = fs::metadata(&tmp)?.len();
        w.write_all(&size.to_be_bytes())?;
        let mut f = File::open(&tmp)?;
        let copied = io::copy(&mut f, w)?;
        drop(f);
        let _ = fs::remove_file(&tmp);
        if copied != size {
            return Err(db_err("backup stream truncated"));
        }
        Ok(8 + size)
    }

    /// Reads a backup frame from `r` into a temp file next to the store and
    /// returns its path. The caller swaps it in with [`Self::swap_from`]
    /// once it holds the locks that exclude writers.
    pub fn stage_restore(&self, r: &mut dyn Read) -> Result<PathBuf> {
        let mut len_buf = [0u8; 8];
        r.read_exact(&mut len_buf)?;
        let body_len = u64::from_be_bytes(len_buf);

        let tmp = self.tmp_path("restore");
        let _ = fs::remove_file(&tmp);
        let mut f = File::create(&tmp)?;
        let copied = io::copy(&mut r.take(body_len), &mut f)?;
        if copied != body_len {
            drop(f);
            let _ = fs::remove_file(&tmp);
            return Err(Error::invalid_arg(format!(
                "snapshot body truncated: expected {body_len} bytes, got {copied}"
            )));
        }
        f.sync_all()?;
        Ok(tmp)
    }

    /// Closes the live database, renames `tmp` into place and reopens.
    pub fn swap_from(&self, tmp: &Path) -> Result<()> {
        let mut slot = self.db.write().expect("store lock poisoned");
        slot.take();
        if let Err(e) = fs::rename(tmp, &self.path) {
            // put the previous store back in service before reporting
            *slot = open_database(&self.path).ok();
            return Err(e.into());
        }
        *slot = Some(open_database(&self.path)?);
        info!(path = %self.path.display(), "index store swapped");
        Ok(())
    }

    /// Copies all live pairs into a fresh database at `dst_path`, keeping
    /// each inner transaction within `tx_max_size` bytes of key/value data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CompactTimeout`] if the copy cannot finish within
    /// `deadline`.
    pub fn copy_to(&self, dst_path: &Path, tx_max_size: usize, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        self.read(|rtx| {
            let dst = open_database(dst_path)?;
            for def in [DELAYED_MESSAGE, DELAYED_MESSAGE_INDEX, META] {
                let src = rtx.open_table(def).map_err(db_err)?;
                let mut batch: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
                let mut batch_bytes = 0usize;
                for item in src.iter().map_err(db_err)? {
                    let (k, v) = item.map_err(db_err)?;
                    let (k, v) = (k.value().to_vec(), v.value().to_vec());
                    if !batch.is_empty() && batch_bytes + k.len() + v.len() > tx_max_size {
                        copy_batch(&dst, def, &batch)?;
                        batch.clear();
                        batch_bytes = 0;
                        if started.elapsed() >= deadline {
                            return Err(Error::CompactTimeout {
                                deadline_ms: deadline.as_millis() as u64,
                            });
                        }
                    }
                    batch_bytes += k.len() + v.len();
                    batch.push((k, v));
                }
                if !batch.is_empty() {
                    copy_batch(&dst, def, &batch)?;
                }
            }
            // one durable commit to settle the copy on disk
            let mut txn = dst.begin_write().map_err(db_err)?;
            txn.set_durability(Durability::Immediate).map_err(db_err)?;
            txn.commit().map_err(db_err)?;
            Ok(())
        })
    }

    /// Runs the store's own integrity check.
    ///
    /// A check that only performed repairs is treated as benign and logged;
    /// anything else maps to a corruption error.
    pub fn check_integrity(&self) -> Result<()> {
        let mut slot = self.db.write().expect("store lock poisoned");
        let db = slot.as_mut().ok_or_else(|| db_err("store is closed"))?;
        match db.check_integrity() {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(path = %self.path.display(), "integrity check performed repairs");
                Ok(())
            }
            Err(e) => Err(Error::Corrupt(e.to_string())),
        }
    }

    /// Closes the store; subsequent operations fail until a swap reopens it.
    pub fn close(&self) {
        let mut slot = self.db.write().expect("store lock poisoned");
        slot.take();
    }

    fn tmp_path(&self, kind: &str) -> PathBuf {
        let mut s = self.path.as_os_str().to_owned();
        s.push(format!("-tmp.{kind}"));
        PathBuf::from(s)
    }
}

fn open_database(path: &Path) -> Result<Database> {
    let db = Database::create(path).map_err(db_err)?;
    // make sure the tables exist before any read transaction touches them
    let txn = db.begin_write().map_err(db_err)?;
    let _ = txn.open_table(DELAYED_MESSAGE).map_err(db_err)?;
    let _ = txn.open_table(DELAYED_MESSAGE_INDEX).map_err(db_err)?;
    let _ = txn.open_table(META).map_err(db_err)?;
    txn.commit().map_err(db_err)?;
    Ok(db)
}

fn copy_batch(
    dst: &Database,
    def: TableDefinition<'_, &[u8], &[u8]>,
    batch: &[(Vec<u8>, Vec<u8>)],
) -> Result<()> {
    let mut txn = dst.begin_write().map_err(db_err)?;
    txn.set_durability(Durability::None).map_err(db_err)?;
    {
        let mut table = txn.open_table(def).map_err(db_err)?;
        for (k, v) in batch {
            table.insert(k.as_slice(), v.as_slice()).map_err(db_err)?;
        }
    }
    txn.commit().map_err(db_err)?;
    Ok(())
}
