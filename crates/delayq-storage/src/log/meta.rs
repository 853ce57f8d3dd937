//! Log position types and metadata file records.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use delayq_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Physical position inside the file set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPos {
    /// Segment file sequence number.
    pub file_num: u64,
    /// Byte position inside that file.
    pub pos: u64,
}

impl SegmentPos {
    /// Returns true if this position is strictly after `other`.
    #[must_use]
    pub fn greater_than(&self, other: &Self) -> bool {
        self.file_num > other.file_num || (self.file_num == other.file_num && self.pos > other.pos)
    }
}

/// A complete log position: physical coordinates plus the virtual offset and
/// running message count at that point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEnd {
    /// Physical position.
    pub seg: SegmentPos,
    /// Logical byte index, stable across rollover and never reused.
    pub virtual_offset: u64,
    /// Total messages written up to this point.
    pub total_msg_count: u64,
}

/// Sidecar record for one rolled-over segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOffsetMeta {
    /// Total message count at the end of the file.
    pub msg_count: u64,
    /// Virtual offset of the file's first byte.
    pub start_offset: u64,
    /// Virtual offset one past the file's last byte.
    pub end_offset: u64,
}

pub(crate) fn queue_file_name(dir: &Path, name: &str, file_num: u64) -> PathBuf {
    dir.join(format!("{name}.diskqueue.{file_num:06}.dat"))
}

pub(crate) fn writer_meta_file_name(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.diskqueue.meta.writer.dat"))
}

pub(crate) fn extra_meta_file_name(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.diskqueue.meta.extra.dat"))
}

pub(crate) fn offset_meta_file_name(data_file: &Path) -> PathBuf {
    let mut s = data_file.as_os_str().to_owned();
    s.push(".offsetmeta.dat");
    PathBuf::from(s)
}

/// Reads a per-file sidecar: `cnt\nstartOffset,endOffset\n`.
pub(crate) fn read_file_offset_meta(data_file: &Path) -> Result<FileOffsetMeta> {
    let path = offset_meta_file_name(data_file);
    let content = fs::read_to_string(&path)?;
    parse_file_offset_meta(&content)
        .ok_or_else(|| Error::Corrupt(format!("malformed offset meta {}", path.display())))
}

fn parse_file_offset_meta(content: &str) -> Option<FileOffsetMeta> {
    let mut lines = content.lines();
    let msg_count = lines.next()?.trim().parse().ok()?;
    let mut offsets = lines.next()?.trim().split(',');
    let start_offset = offsets.next()?.parse().ok()?;
    let end_offset = offsets.next()?.parse().ok()?;
    Some(FileOffsetMeta { msg_count, start_offset, end_offset })
}

pub(crate) fn write_file_offset_meta(data_file: &Path, meta: &FileOffsetMeta) -> Result<()> {
    let path = offset_meta_file_name(data_file);
    let mut f = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;
    write!(f, "{}\n{},{}\n", meta.msg_count, meta.start_offset, meta.end_offset)?;
    f.sync_all()?;
    Ok(())
}

/// Reads the primary writer metadata: `totalMsgCnt\nfileNum,pos,virtualOffset\n`.
pub(crate) fn read_writer_meta(path: &Path) -> Result<LogEnd> {
    let content = fs::read_to_string(path)?;
    parse_writer_meta(&content)
        .ok_or_else(|| Error::Corrupt(format!("malformed writer meta {}", path.display())))
}

fn parse_writer_meta(content: &str) -> Option<LogEnd> {
    let mut lines = content.lines();
    let total_msg_count = lines.next()?.trim().parse().ok()?;
    let mut fields = lines.next()?.trim().split(',');
    let file_num = fields.next()?.parse().ok()?;
    let pos = fields.next()?.parse().ok()?;
    let virtual_offset = fields.next()?.parse().ok()?;
    Some(LogEnd { seg: SegmentPos { file_num, pos }, virtual_offset, total_msg_count })
}

/// Atomically persists the primary writer metadata.
pub(crate) fn write_writer_meta(path: &Path, end: &LogEnd) -> Result<()> {
    let content = format!(
        "{}\n{},{},{}\n",
        end.total_msg_count, end.seg.file_num, end.seg.pos, end.virtual_offset
    );
    write_atomic(path, content.as_bytes())
}

/// The queue-start record, persisted as JSON so the engine can boot without
/// replaying removed files.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExtraMeta {
    pub seg_offset: SegmentPos,
    pub virtual_offset: u64,
    pub total_msg_count: u64,
}

pub(crate) fn read_extra_meta(path: &Path) -> Result<LogEnd> {
    let data = fs::read(path)?;
    let meta: ExtraMeta = serde_json::from_slice(&data)
        .map_err(|e| Error::Corrupt(format!("malformed extra meta {}: {e}", path.display())))?;
    Ok(LogEnd {
        seg: meta.seg_offset,
        virtual_offset: meta.virtual_offset,
        total_msg_count: meta.total_msg_count,
    })
}

pub(crate) fn write_extra_meta(path: &Path, start: &LogEnd) -> Result<()> {
    let meta = ExtraMeta {
        seg_offset: start.seg,
        virtual_offset: start.virtual_offset,
        total_msg_count: start.total_msg_count,
    };
    let data = serde_json::to_vec(&meta).map_err(|e| Error::Codec(e.to_string()))?;
    write_atomic(path, &data)
}

/// Writes `data` to a temp file, syncs it and renames it into place.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_meta_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = writer_meta_file_name(dir.path(), "t-0-delayed");
        let end = LogEnd {
            seg: SegmentPos { file_num: 3, pos: 120 },
            virtual_offset: 3192,
            total_msg_count: 57,
        };
        write_writer_meta(&path, &end).unwrap();
        assert_eq!(read_writer_meta(&path).unwrap(), end);
    }

    #[test]
    fn test_extra_meta_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = extra_meta_file_name(dir.path(), "t-0-delayed");
        let start = LogEnd {
            seg: SegmentPos { file_num: 2, pos: 0 },
            virtual_offset: 2048,
            total_msg_count: 31,
        };
        write_extra_meta(&path, &start).unwrap();
        assert_eq!(read_extra_meta(&path).unwrap(), start);
    }

    #[test]
    fn test_offset_meta_round_trip() {
        let dir = TempDir::new().unwrap();
        let data_file = queue_file_name(dir.path(), "t-0-delayed", 0);
        let meta = FileOffsetMeta { msg_count: 12, start_offset: 0, end_offset: 1024 };
        write_file_offset_meta(&data_file, &meta).unwrap();
        assert_eq!(read_file_offset_meta(&data_file).unwrap(), meta);
    }

    #[test]
    fn test_malformed_sidecar_rejected() {
        let dir = TempDir::new().unwrap();
        let data_file = queue_file_name(dir.path(), "t-0-delayed", 0);
        fs::write(offset_meta_file_name(&data_file), "not numbers\n").unwrap();
        assert!(read_file_offset_meta(&data_file).is_err());
    }

    #[test]
    fn test_segment_pos_ordering() {
        let a = SegmentPos { file_num: 1, pos: 10 };
        let b = SegmentPos { file_num: 1, pos: 20 };
        let c = SegmentPos { file_num: 2, pos: 0 };
        assert!(b.greater_than(&a));
        assert!(c.greater_than(&b));
        assert!(!a.greater_than(&b));
    }
}
