//! Forward scanner over the on-disk log.
//!
//! The scanner reads framed records between two positions captured from the
//! writer, tracking the physical and virtual coordinates of every record it
//! returns. Retention uses it to pick a clean boundary; replication uses it
//! to replay leader bytes to a follower.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::Bytes;
use delayq_core::{Error, Result};

use super::meta::{queue_file_name, LogEnd};

/// Sequential reader over `[start, end)` of the log file set.
///
/// The scanner holds no locks; it sees the log as it was when the positions
/// were captured, like a snapshot reader.
pub struct LogScanner {
    name: String,
    dir: PathBuf,
    pos: LogEnd,
    end: LogEnd,
    file: Option<File>,
}

impl LogScanner {
    /// Creates a scanner over `[start, end)`.
    #[must_use]
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, start: LogEnd, end: LogEnd) -> Self {
        Self { name: name.into(), dir: dir.into(), pos: start, end, file: None }
    }

    /// Position of the next record to be read.
    #[must_use]
    pub fn position(&self) -> LogEnd {
        self.pos
    }

    /// Advances to `virtual_offset`, which must be frame-aligned and within
    /// the scanned range.
    pub fn seek_virtual(&mut self, virtual_offset: u64) -> Result<()> {
        while self.pos.virtual_offset < virtual_offset {
            if self.read_one()?.is_none() {
                return Err(Error::invalid_offset(virtual_offset, "beyond scan end"));
            }
        }
        if self.pos.virtual_offset != virtual_offset {
            return Err(Error::invalid_offset(virtual_offset, "not frame aligned"));
        }
        Ok(())
    }

    /// Reads the next record body, or `None` once the end is reached.
    pub fn read_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.pos.virtual_offset >= self.end.virtual_offset {
                return Ok(None);
            }
            if self.file.is_none() {
                let path = queue_file_name(&self.dir, &self.name, self.pos.seg.file_num);
                let mut f = File::open(&path)?;
                if self.pos.seg.pos > 0 {
                    f.seek(SeekFrom::Start(self.pos.seg.pos))?;
                }
                self.file = Some(f);
            }

            let file = self.file.as_mut().expect("file just opened");
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // end of this segment, continue in the next one
                    self.file = None;
                    self.pos.seg.file_num += 1;
                    self.pos.seg.pos = 0;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            let body_len = u32::from_be_bytes(len_buf) as usize;
            if body_len == 0 {
                return Err(Error::Corrupt(format!(
                    "zero-length record at offset {} in {}",
                    self.pos.virtual_offset, self.name
                )));
            }
            let mut body = vec![0u8; body_len];
            file.read_exact(&mut body)?;

            let total = 4 + body_len as u64;
            self.pos.seg.pos += total;
            self.pos.virtual_offset += total;
            self.pos.total_msg_count += 1;
            return Ok(Some(Bytes::from(body)));
        }
    }
}
