//! Append-only segmented log writer.
//!
//! The writer appends length-framed records to numbered segment files with
//! optional syncing, rolling to a new file when the current one reaches its
//! size cap. Every append returns the virtual offset it was written at;
//! replication uses those offsets as its cursor, so they are never reused
//! even after rollback or retention cleanup.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use delayq_core::{Error, Result};
use tracing::{debug, error, info, warn};

use super::meta::{
    extra_meta_file_name, queue_file_name, read_extra_meta, read_file_offset_meta,
    read_writer_meta, write_extra_meta, write_file_offset_meta, write_writer_meta,
    writer_meta_file_name, FileOffsetMeta, LogEnd, SegmentPos,
};

/// How many sidecars are kept for files preceding the queue start, so
/// retention accounting can still consult the pre-cleanup boundary.
pub const MAX_QUEUE_OFFSET_META_DATA_KEEP: u64 = 100;

const WRITE_BUF_SIZE: usize = 128 * 1024;

/// Boundary for retention cleanup, produced by scanning the log forward.
#[derive(Debug, Clone, Copy)]
pub enum CleanBoundary {
    /// An exact record position: cleanup keeps the file holding it.
    Position {
        /// Physical position of the boundary record.
        seg: SegmentPos,
        /// Virtual offset of the boundary record.
        virtual_offset: u64,
    },
    /// A bare virtual offset; cleanup walks sidecars to find the last file
    /// that ends at or before it.
    Offset(u64),
}

/// Thread-safe segmented log writer.
///
/// Writes take the internal lock exclusively; position accessors take it
/// shared.
pub struct SegmentedLog {
    inner: RwLock<LogWriter>,
}

struct LogWriter {
    name: String,
    dir: PathBuf,
    max_bytes_per_file: u64,
    min_msg_size: u32,
    max_msg_size: u32,

    write_end: LogEnd,
    read_end: LogEnd,
    queue_start: LogEnd,

    writer: Option<BufWriter<File>>,
    need_sync: bool,
    exiting: bool,
    needs_fix: bool,
}

impl SegmentedLog {
    /// Opens the log, recovering positions from the metadata files.
    ///
    /// When the queue start cannot be reconstructed the log opens anyway
    /// with [`Self::needs_fix`] set; the coordinator is expected to restore
    /// from the leader.
    pub fn open(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        max_bytes_per_file: u64,
        min_msg_size: u32,
        max_msg_size: u32,
    ) -> Result<Self> {
        let mut w = LogWriter {
            name: name.into(),
            dir: dir.into(),
            max_bytes_per_file,
            min_msg_size,
            max_msg_size,
            write_end: LogEnd::default(),
            read_end: LogEnd::default(),
            queue_start: LogEnd::default(),
            writer: None,
            need_sync: false,
            exiting: false,
            needs_fix: false,
        };

        match read_writer_meta(&writer_meta_file_name(&w.dir, &w.name)) {
            Ok(end) => {
                w.write_end = end;
                w.read_end = end;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(name = %w.name, error = %e, "failed to retrieve log metadata");
            }
        }

        match w.init_queue_start() {
            Ok(()) => {
                w.save_extra_meta();
            }
            Err(Error::NeedsFix) => {
                w.needs_fix = true;
            }
            Err(e) => return Err(e),
        }

        Ok(Self { inner: RwLock::new(w) })
    }

    /// True if queue-start reconstruction failed on open.
    pub fn needs_fix(&self) -> bool {
        self.inner.read().expect("log lock poisoned").needs_fix
    }

    /// Current write end.
    pub fn write_end(&self) -> LogEnd {
        self.inner.read().expect("log lock poisoned").write_end
    }

    /// Position up to which data has reached the OS (flushed).
    pub fn read_end(&self) -> LogEnd {
        self.inner.read().expect("log lock poisoned").read_end
    }

    /// Earliest position still represented by on-disk data.
    pub fn queue_start(&self) -> LogEnd {
        self.inner.read().expect("log lock poisoned").queue_start
    }

    /// Appends one record framed with a 4-byte big-endian length prefix.
    ///
    /// Returns the virtual offset the record was written at, the bytes
    /// written including the frame, and the resulting write end.
    pub fn put(&self, data: &[u8]) -> Result<(u64, u32, LogEnd)> {
        let mut w = self.inner.write().expect("log lock poisoned");
        if w.exiting {
            return Err(Error::Exiting);
        }
        let r = w.write_one(data, false, 0)?;
        w.need_sync = true;
        Ok(r)
    }

    /// Appends already-framed bytes verbatim; the caller asserts how many
    /// logical messages they contain. Used by the replica ingestion path to
    /// keep follower bytes identical to the leader's.
    pub fn put_raw(&self, data: &[u8], msg_count: u64) -> Result<(u64, u32, LogEnd)> {
        let mut w = self.inner.write().expect("log lock poisoned");
        if w.exiting {
            return Err(Error::Exiting);
        }
        let r = w.write_one(data, true, msg_count)?;
        w.need_sync = true;
        Ok(r)
    }

    /// Truncates the write end back to `offset`, dropping `diff_count`
    /// messages. The target must lie within the current write file; this
    /// entrypoint does not cross file boundaries backwards.
    pub fn rollback_write(&self, offset: u64, diff_count: u64) -> Result<LogEnd> {
        let mut w = self.inner.write().expect("log lock poisoned");
        w.rollback_write(offset, diff_count)
    }

    /// Resets the write end to `offset`, crossing file boundaries backwards
    /// if needed. Stranded later files are renamed with a `.rolldata`
    /// suffix rather than deleted so operators can recover from a bad
    /// replication reset.
    pub fn reset_write_end(&self, offset: u64, total_count: u64) -> Result<LogEnd> {
        let mut w = self.inner.write().expect("log lock poisoned");
        w.reset_write_end(offset, total_count)
    }

    /// Destructively reinitializes the log at a new queue start. Used when
    /// a follower receives a snapshot whose log is entirely ahead of local
    /// state: all data files are removed and the write end restarts one
    /// file past the current tip at the supplied offset and count.
    pub fn reset_with_queue_start(&self, virtual_offset: u64, total_count: u64) -> Result<()> {
        let mut w = self.inner.write().expect("log lock poisoned");
        warn!(
            name = %w.name,
            start = ?w.queue_start,
            end = ?w.write_end,
            new_offset = virtual_offset,
            new_count = total_count,
            "resetting log with new queue start"
        );
        w.clean_old_data();
        w.queue_start = w.write_end;
        w.queue_start.virtual_offset = virtual_offset;
        w.queue_start.total_msg_count = total_count;
        w.write_end = w.queue_start;
        w.read_end = w.write_end;
        w.save_extra_meta();
        Ok(())
    }

    /// Advances the queue start to the boundary identified by `clean_end`,
    /// clipped to `max_clean_offset` when positive, and removes whole files
    /// strictly below the new start. Sidecars of the preceding
    /// [`MAX_QUEUE_OFFSET_META_DATA_KEEP`] files are retained.
    ///
    /// Returns the new queue start, or `None` if nothing was cleaned.
    pub fn clean_old_data_by_retention(
        &self,
        clean_end: CleanBoundary,
        dry_run: bool,
        max_clean_offset: u64,
    ) -> Result<Option<LogEnd>> {
        let mut w = self.inner.write().expect("log lock poisoned");
        w.clean_old_data_by_retention(clean_end, dry_run, max_clean_offset)
    }

    /// Fsyncs the current write file and atomically rewrites the primary
    /// metadata.
    pub fn flush(&self) -> Result<()> {
        let mut w = self.inner.write().expect("log lock poisoned");
        if w.exiting {
            return Err(Error::Exiting);
        }
        if w.need_sync {
            w.sync()?;
        }
        Ok(())
    }

    /// Flushes the buffered writer without fsync, advancing the read end.
    /// Returns true if any buffered data was written out.
    pub fn flush_buffer(&self) -> bool {
        let mut w = self.inner.write().expect("log lock poisoned");
        match w.writer {
            Some(ref mut buf) if buf.buffer().is_empty() => false,
            Some(ref mut buf) => {
                if let Err(e) = buf.flush() {
                    warn!(name = %w.name, error = %e, "failed to flush log buffer");
                }
                if w.read_end.seg.greater_than(&w.write_end.seg) {
                    warn!(name = %w.name, read = ?w.read_end, write = ?w.write_end,
                        "read end ahead of write end");
                }
                w.read_end = w.write_end;
                true
            }
            None => false,
        }
    }

    /// Persists metadata and closes the log. Further mutations fail.
    pub fn close(&self) -> Result<()> {
        let mut w = self.inner.write().expect("log lock poisoned");
        info!(name = %w.name, "closing log");
        w.exiting = true;
        w.sync()
    }

    /// Closes the log and removes all of its files.
    pub fn delete(&self) -> Result<()> {
        let mut w = self.inner.write().expect("log lock poisoned");
        info!(name = %w.name, "deleting log");
        w.exiting = true;
        let _ = w.sync();
        w.delete_all_files()
    }
}

impl LogWriter {
    fn file_name(&self, file_num: u64) -> PathBuf {
        queue_file_name(&self.dir, &self.name, file_num)
    }

    fn init_queue_start(&mut self) -> Result<()> {
        match read_extra_meta(&extra_meta_file_name(&self.dir, &self.name)) {
            Ok(start) => {
                info!(name = %self.name, start = ?start, "loaded queue start from extra meta");
                self.queue_start = start;
                return Ok(());
            }
            Err(e) => {
                info!(name = %self.name, error = %e, "no usable extra meta, walking files");
            }
        }

        let mut read_start = LogEnd::default();
        let mut need_fix = false;
        loop {
            let cur = self.file_name(read_start.seg.file_num);
            match fs::metadata(&cur) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    need_fix = true;
                    if self.write_end.seg == SegmentPos::default() {
                        // empty queue
                        return Ok(());
                    }
                    read_start.seg.file_num += 1;
                    read_start.seg.pos = 0;
                    if read_start.seg.file_num > self.write_end.seg.file_num {
                        error!(name = %self.name, end = ?self.write_end,
                            "no data file found up to write end, resetting queue start");
                        self.queue_start = self.write_end;
                        return Err(Error::NeedsFix);
                    }
                }
                Err(e) => return Err(e.into()),
                Ok(_) if need_fix => {
                    let prev = self.file_name(read_start.seg.file_num - 1);
                    match read_file_offset_meta(&prev) {
                        Ok(_) => break,
                        Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                            read_start.seg.file_num += 1;
                            read_start.seg.pos = 0;
                            if read_start.seg.file_num > self.write_end.seg.file_num {
                                error!(name = %self.name, end = ?self.write_end,
                                    "no sidecar found up to write end, resetting queue start");
                                self.queue_start = self.write_end;
                                return Err(Error::NeedsFix);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) => break,
            }
        }

        if need_fix {
            let prev = self.file_name(read_start.seg.file_num - 1);
            let m = read_file_offset_meta(&prev)?;
            read_start.virtual_offset = m.end_offset;
            read_start.total_msg_count = m.msg_count;
            info!(name = %self.name, start = ?read_start, "reconstructed queue start");
        }
        self.queue_start = read_start;
        Ok(())
    }

    fn write_one(&mut self, data: &[u8], is_raw: bool, msg_count: u64) -> Result<(u64, u32, LogEnd)> {
        if self.writer.is_none() {
            let path = self.file_name(self.write_end.seg.file_num);
            let mut file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
            debug!(name = %self.name, path = %path.display(), "opened segment for append");
            if self.write_end.seg.pos > 0 {
                file.seek(SeekFrom::Start(self.write_end.seg.pos))?;
            }
            self.writer = Some(BufWriter::with_capacity(WRITE_BUF_SIZE, file));
        }

        let data_len = u32::try_from(data.len())
            .map_err(|_| Error::invalid_arg("message larger than 4GiB"))?;
        if !is_raw && (data_len < self.min_msg_size || data_len > self.max_msg_size) {
            return Err(Error::invalid_arg(format!(
                "invalid message write size {data_len}, allowed [{}..{}]",
                self.min_msg_size, self.max_msg_size
            )));
        }

        let res = {
            let buf = self.writer.as_mut().expect("writer just opened");
            let frame = if is_raw { Ok(()) } else { buf.write_all(&data_len.to_be_bytes()) };
            frame.and_then(|()| buf.write_all(data))
        };
        if let Err(e) = res {
            warn!(name = %self.name, error = %e, "segment write failed, dropping file handle");
            if let Err(se) = self.sync() {
                warn!(name = %self.name, error = %se, "sync after failed write also failed");
            }
            self.writer = None;
            return Err(e.into());
        }

        let write_offset = self.write_end.virtual_offset;
        let total_bytes = u64::from(data_len) + if is_raw { 0 } else { 4 };
        self.write_end.seg.pos += total_bytes;
        self.write_end.virtual_offset += total_bytes;
        self.write_end.total_msg_count += if is_raw { msg_count } else { 1 };

        if self.write_end.seg.pos >= self.max_bytes_per_file {
            // sync every time a new file starts
            if let Err(e) = self.sync() {
                error!(name = %self.name, error = %e, "failed to sync at rollover");
            }
            self.writer = None;
            self.save_file_offset_meta();
            debug!(name = %self.name, end = ?self.write_end, "rolling to next segment");

            self.write_end.seg.file_num += 1;
            self.write_end.seg.pos = 0;
            self.read_end = self.write_end;
        }

        Ok((write_offset, total_bytes as u32, self.write_end))
    }

    fn rollback_write(&mut self, offset: u64, diff_count: u64) -> Result<LogEnd> {
        if offset < self.queue_start.virtual_offset
            || self
                .write_end
                .total_msg_count
                .checked_sub(diff_count)
                .map_or(true, |c| c < self.queue_start.total_msg_count)
        {
            warn!(name = %self.name, offset, diff_count, start = ?self.queue_start,
                "rollback target below queue start");
            return Err(Error::invalid_offset(offset, "below queue start"));
        }
        if self.need_sync {
            if let Err(e) = self.sync() {
                warn!(name = %self.name, error = %e, "sync before rollback failed");
            }
        }
        if offset > self.write_end.virtual_offset {
            return Err(Error::invalid_offset(offset, "beyond write end"));
        }
        if offset < self.write_end.virtual_offset - self.write_end.seg.pos {
            warn!(name = %self.name, offset, end = ?self.write_end,
                "rollback cannot cross a file boundary");
            return Err(Error::invalid_offset(offset, "crosses file boundary"));
        }

        info!(name = %self.name, from = ?self.write_end, to = offset, diff_count, "rolling back write end");
        self.write_end.seg.pos -= self.write_end.virtual_offset - offset;
        self.write_end.virtual_offset = offset;
        self.write_end.total_msg_count -= diff_count;

        if self.read_end.seg.greater_than(&self.write_end.seg)
            || self.read_end.virtual_offset > self.write_end.virtual_offset
        {
            self.read_end = self.write_end;
        }
        self.truncate_to_write_end();
        Ok(self.write_end)
    }

    fn reset_write_end(&mut self, offset: u64, total_count: u64) -> Result<LogEnd> {
        if offset < self.queue_start.virtual_offset
            || total_count < self.queue_start.total_msg_count
        {
            warn!(name = %self.name, offset, total_count, start = ?self.queue_start,
                "reset target below queue start");
            return Err(Error::invalid_offset(offset, "below queue start"));
        }
        if offset > self.write_end.virtual_offset {
            return Err(Error::invalid_offset(offset, "beyond write end"));
        }
        if self.need_sync {
            if let Err(e) = self.sync() {
                warn!(name = %self.name, error = %e, "sync before reset failed");
            }
        }
        info!(name = %self.name, from = self.write_end.virtual_offset, to = offset, total_count,
            "resetting write end");

        if offset == 0 {
            self.close_current_file();
            self.write_end = self.queue_start;
            self.read_end = self.write_end;
            self.truncate_to_write_end();
            return Ok(self.write_end);
        }

        let mut new_end = self.write_end.virtual_offset;
        let mut file_num = self.write_end.seg.file_num;
        let mut pos = self.write_end.seg.pos;
        while offset < new_end - pos {
            debug!(name = %self.name, offset, new_end, pos, file_num, "reset crossing file backwards");
            new_end -= pos;
            if file_num == 0 {
                warn!(name = %self.name, offset, "reset crossed the first file");
                return Err(Error::invalid_offset(offset, "before first file"));
            }
            file_num -= 1;
            pos = fs::metadata(self.file_name(file_num))?.len();
        }
        self.write_end.seg.file_num = file_num;
        self.write_end.seg.pos = pos - (new_end - offset);
        self.write_end.virtual_offset = offset;
        self.write_end.total_msg_count = total_count;
        self.read_end = self.write_end;
        self.close_current_file();
        debug!(name = %self.name, end = ?self.write_end, "reset write end done");
        self.truncate_to_write_end();
        Ok(self.write_end)
    }

    fn clean_old_data_by_retention(
        &mut self,
        clean_end: CleanBoundary,
        dry_run: bool,
        max_clean_offset: u64,
    ) -> Result<Option<LogEnd>> {
        let mut new_start = self.queue_start;
        let mut clean_file_num;
        match clean_end {
            CleanBoundary::Position { seg, virtual_offset } => {
                let mut end_file_num = seg.file_num;
                if end_file_num + 1 >= self.read_end.seg.file_num {
                    end_file_num = self.read_end.seg.file_num.saturating_sub(1);
                }
                // a follower truncated from the leader may start past file 0,
                // never clean below the queue-start file
                if end_file_num <= self.queue_start.seg.file_num {
                    return Ok(None);
                }
                if max_clean_offset > 0 && virtual_offset > max_clean_offset {
                    warn!(name = %self.name, virtual_offset, max_clean_offset,
                        "clean position exceeds the allowed clean end");
                    return Ok(None);
                }
                let m = read_file_offset_meta(&self.file_name(end_file_num - 1))?;
                if max_clean_offset > 0 && m.end_offset > max_clean_offset {
                    warn!(name = %self.name, end = m.end_offset, max_clean_offset,
                        "sidecar boundary exceeds the allowed clean end");
                    return Err(Error::invalid_offset(m.end_offset, "exceeds max clean offset"));
                }
                new_start.seg = SegmentPos { file_num: end_file_num, pos: 0 };
                new_start.virtual_offset = m.end_offset;
                new_start.total_msg_count = m.msg_count;
                clean_file_num = end_file_num;
            }
            CleanBoundary::Offset(raw_offset) => {
                let mut clean_offset = raw_offset;
                let read_file_start =
                    self.read_end.virtual_offset - self.read_end.seg.pos;
                if clean_offset >= read_file_start {
                    clean_offset = read_file_start;
                }
                if max_clean_offset > 0 && clean_offset > max_clean_offset {
                    clean_offset = max_clean_offset;
                }
                clean_file_num = 0;
                loop {
                    let m = read_file_offset_meta(&self.file_name(new_start.seg.file_num))?;
                    if m.end_offset >= clean_offset {
                        break;
                    }
                    if clean_file_num + 1 >= self.read_end.seg.file_num {
                        break;
                    }
                    new_start.seg.file_num += 1;
                    new_start.seg.pos = 0;
                    new_start.virtual_offset = m.end_offset;
                    new_start.total_msg_count = m.msg_count;
                    clean_file_num = new_start.seg.file_num;
                }
            }
        }

        if dry_run {
            return Ok(Some(new_start));
        }
        if clean_file_num <= self.queue_start.seg.file_num {
            return Ok(None);
        }

        info!(name = %self.name, from = ?self.queue_start, to = ?new_start, "cleaning log head");
        let clean_start_file_num =
            self.queue_start.seg.file_num.saturating_sub(MAX_QUEUE_OFFSET_META_DATA_KEEP + 1);
        self.queue_start = new_start;
        self.save_extra_meta();

        for i in clean_start_file_num..clean_file_num {
            let path = self.file_name(i);
            match fs::remove_file(&path) {
                Ok(()) => debug!(name = %self.name, path = %path.display(), "removed segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    error!(name = %self.name, path = %path.display(), error = %e,
                        "failed to remove segment");
                    continue;
                }
            }
            if i + MAX_QUEUE_OFFSET_META_DATA_KEEP <= clean_file_num {
                let _ = fs::remove_file(super::meta::offset_meta_file_name(&path));
            }
        }
        Ok(Some(new_start))
    }

    fn close_current_file(&mut self) {
        if let Some(ref mut buf) = self.writer {
            if let Err(e) = buf.flush() {
                warn!(name = %self.name, error = %e, "flush on close failed");
            }
        }
        if self.read_end.seg.greater_than(&self.write_end.seg) {
            warn!(name = %self.name, read = ?self.read_end, write = ?self.write_end,
                "read end ahead of write end");
        }
        self.read_end = self.write_end;
        self.writer = None;
    }

    /// Truncates the current write file to the write position and strands
    /// any later files as `.rolldata` for forensic recovery.
    fn truncate_to_write_end(&mut self) {
        if let Some(mut buf) = self.writer.take() {
            let _ = buf.flush();
            if let Err(e) = buf.get_ref().set_len(self.write_end.seg.pos) {
                error!(name = %self.name, error = %e, "failed to truncate write file");
            }
        } else {
            let path = self.file_name(self.write_end.seg.file_num);
            match OpenOptions::new().read(true).write(true).create(true).open(&path) {
                Ok(f) => {
                    if let Err(e) = f.set_len(self.write_end.seg.pos) {
                        error!(name = %self.name, error = %e, "failed to truncate write file");
                    }
                }
                Err(e) => error!(name = %self.name, error = %e, "failed to open write file"),
            }
        }
        let mut n = self.write_end.seg.file_num + 1;
        loop {
            let path = self.file_name(n);
            let mut rolled = path.as_os_str().to_owned();
            rolled.push(".rolldata");
            match fs::rename(&path, PathBuf::from(rolled)) {
                Ok(()) => {
                    warn!(name = %self.name, path = %path.display(), "stranded segment as rolldata");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    error!(name = %self.name, path = %path.display(), error = %e,
                        "failed to strand segment");
                }
            }
            n += 1;
        }
    }

    /// Removes every data file and restarts the write end one file past the
    /// current tip. Sidecars survive so offsets remain reconstructible.
    fn clean_old_data(&mut self) {
        self.close_current_file();
        self.save_file_offset_meta();

        let clean_start =
            self.queue_start.seg.file_num.saturating_sub(MAX_QUEUE_OFFSET_META_DATA_KEEP + 1);
        for i in clean_start..=self.write_end.seg.file_num {
            let path = self.file_name(i);
            match fs::remove_file(&path) {
                Ok(()) => debug!(name = %self.name, path = %path.display(), "removed segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => error!(name = %self.name, path = %path.display(), error = %e,
                    "failed to remove segment"),
            }
        }

        self.write_end.seg.file_num += 1;
        self.write_end.seg.pos = 0;
        self.read_end = self.write_end;
        self.queue_start = self.write_end;
        self.save_extra_meta();
    }

    fn delete_all_files(&mut self) -> Result<()> {
        self.clean_old_data();

        let _ = fs::remove_file(writer_meta_file_name(&self.dir, &self.name));
        let _ = fs::remove_file(extra_meta_file_name(&self.dir, &self.name));
        let clean_start =
            self.queue_start.seg.file_num.saturating_sub(MAX_QUEUE_OFFSET_META_DATA_KEEP + 1);
        for i in clean_start..=self.write_end.seg.file_num {
            let side = super::meta::offset_meta_file_name(&self.file_name(i));
            let _ = fs::remove_file(&side);
        }
        Ok(())
    }

    fn save_file_offset_meta(&self) {
        let meta = FileOffsetMeta {
            msg_count: self.write_end.total_msg_count,
            start_offset: self.write_end.virtual_offset - self.write_end.seg.pos,
            end_offset: self.write_end.virtual_offset,
        };
        let path = self.file_name(self.write_end.seg.file_num);
        if let Err(e) = write_file_offset_meta(&path, &meta) {
            error!(name = %self.name, path = %path.display(), error = %e,
                "failed to save segment offset meta");
        }
    }

    fn save_extra_meta(&self) {
        let path = extra_meta_file_name(&self.dir, &self.name);
        if let Err(e) = write_extra_meta(&path, &self.queue_start) {
            error!(name = %self.name, error = %e, "failed to save queue start meta");
        }
    }

    /// Fsyncs the write file and persists the primary metadata.
    fn sync(&mut self) -> Result<()> {
        if let Some(ref mut buf) = self.writer {
            if let Err(e) = buf.flush() {
                self.writer = None;
                return Err(e.into());
            }
            if let Err(e) = buf.get_ref().sync_all() {
                self.writer = None;
                return Err(e.into());
            }
        }

        if self.read_end.seg.greater_than(&self.write_end.seg) {
            warn!(name = %self.name, read = ?self.read_end, write = ?self.write_end,
                "read end ahead of write end");
        }
        self.read_end = self.write_end;

        write_writer_meta(&writer_meta_file_name(&self.dir, &self.name), &self.write_end)?;
        self.need_sync = false;
        Ok(())
    }
}
