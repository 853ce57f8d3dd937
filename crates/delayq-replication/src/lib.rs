// Copyright 2026 The Delayq Authors
// SPDX-License-Identifier: Apache-2.0

//! Replica-facing surface of the delayed-queue engine.
//!
//! A coordinator mirrors a leader's log byte for byte: it streams a store
//! snapshot when a follower is too far behind, then replays raw log records
//! at exact virtual offsets. This crate exposes the narrow follower surface
//! as a trait plus a catch-up driver over it:
//!
//! ```text
//! Leader engine                       Follower engine
//!      │  backup_store_to ──────────►  restore_store
//!      │  log_scanner                  reset_with_queue_start (if behind)
//!      └─ raw records ───────────────► put_raw at exact offsets
//! ```
//!
//! The follower rejects any record that does not land exactly on its write
//! end, so a retried or reordered stream cannot diverge silently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod catchup;
mod error;
mod replica;

pub use catchup::{bootstrap_follower, replay_log, CatchupStats};
pub use error::{ReplicationError, Result};
pub use replica::ReplicaSink;
