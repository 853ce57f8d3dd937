// Copyright 2026 The Delayq Authors
// SPDX-License-Identifier: Apache-2.0

//! Ordered index over the delayed messages.
//!
//! Three redb tables back the index:
//!
//! - `delayed_message`: primary rows keyed by
//!   `(type, channel, deliver-at, id)`; big-endian encodings keep byte order
//!   equal to logical order so a forward cursor yields messages in due
//!   order.
//! - `delayed_message_index`: secondary rows keyed by
//!   `(type, channel, original id)` for membership probes.
//! - `meta`: per-prefix live counters and the log offset reached by the
//!   last committed transaction.

mod keys;
mod store;

pub use keys::{
    counter_key, decode_index_key, decode_message_key, index_key, index_value, message_key,
    prefix_key, COUNTER_PREFIX, SYNCED_OFFSET_KEY,
};
pub use store::{IndexStore, DELAYED_MESSAGE, DELAYED_MESSAGE_INDEX, META};
