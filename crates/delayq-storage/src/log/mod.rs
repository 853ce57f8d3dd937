// Copyright 2026 The Delayq Authors
// SPDX-License-Identifier: Apache-2.0

//! Append-only segmented log with byte-exact virtual offsets.
//!
//! The log is a numbered file set plus three kinds of metadata:
//!
//! - a primary record of the write end (atomic rename on every flush),
//! - a queue-start record so the engine can boot without replaying files
//!   removed by retention,
//! - a per-file sidecar of (count, start offset, end offset), written when a
//!   file rolls over; retention accounting consults sidecars after the data
//!   files themselves are gone.
//!
//! Virtual offsets are logical byte indexes that survive rollover and are
//! never reused across truncations; they serve as the replication cursor.

mod meta;
mod scanner;
mod writer;

pub use meta::{FileOffsetMeta, LogEnd, SegmentPos};
pub use scanner::LogScanner;
pub use writer::{CleanBoundary, SegmentedLog, MAX_QUEUE_OFFSET_META_DATA_KEEP};
