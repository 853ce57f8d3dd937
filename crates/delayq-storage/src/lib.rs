// Copyright 2026 The Delayq Authors
// SPDX-License-Identifier: Apache-2.0

//! Durable delayed-queue engine for one topic partition.
//!
//! This crate pairs two storage primitives and keeps them consistent:
//!
//! 1. **Segmented log** ([`log`]): an append-only file set with byte-exact
//!    virtual offsets. The log is the source of truth for replication;
//!    followers mirror it byte for byte.
//! 2. **Ordered index** ([`index`]): a redb database sorted by
//!    `(type, channel, deliver-at, id)` so consumers can scan for messages
//!    due by a deadline, plus a secondary index by original id and running
//!    per-prefix counters.
//!
//! The [`queue::DelayQueue`] engine orchestrates the two: every put appends
//! to the log and commits the index in one transaction that also records the
//! reached log offset, so a follower replaying from that offset converges on
//! the same state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod index;
pub mod log;
pub mod message;
pub mod queue;

pub use log::{CleanBoundary, LogEnd, LogScanner, SegmentPos, SegmentedLog};
pub use message::DelayedMessage;
pub use queue::{DelayQueue, PeekFilter, PutOutcome};
