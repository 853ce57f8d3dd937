//! Composite key codecs for the index tables.
//!
//! All integers are big-endian so that lexicographic key order matches the
//! logical sort order `(type, channel, deliver-at, id)`.

use delayq_core::{Error, MessageId, Result};

/// Meta key of the synced log offset, stored as decimal ASCII.
pub const SYNCED_OFFSET_KEY: &[u8] = b"synced_offset";

/// Prefix of the per-(type, channel) live counters in the meta table.
pub const COUNTER_PREFIX: &[u8] = b"counter_";

const KEY_FIXED: usize = 2 + 1 + 2; // type, '-', channel length

/// Builds the scan prefix `type ‖ '-' ‖ chLen ‖ channel`.
#[must_use]
pub fn prefix_key(delayed_type: u16, channel: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_FIXED + channel.len());
    key.extend_from_slice(&delayed_type.to_be_bytes());
    key.push(b'-');
    key.extend_from_slice(&(channel.len() as u16).to_be_bytes());
    key.extend_from_slice(channel.as_bytes());
    key
}

/// Builds a primary key `prefix ‖ deliverAt ‖ id`.
#[must_use]
pub fn message_key(delayed_type: u16, channel: &str, deliver_at: i64, id: MessageId) -> Vec<u8> {
    let mut key = prefix_key(delayed_type, channel);
    key.reserve(16);
    key.extend_from_slice(&(deliver_at as u64).to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Decodes a primary key into `(type, deliverAt, id, channel)`.
pub fn decode_message_key(key: &[u8]) -> Result<(u16, i64, MessageId, &[u8])> {
    if key.len() < KEY_FIXED + 16 {
        return Err(Error::Codec("primary key too short".to_owned()));
    }
    let delayed_type = u16::from_be_bytes([key[0], key[1]]);
    let channel_len = u16::from_be_bytes([key[3], key[4]]) as usize;
    if key.len() < KEY_FIXED + channel_len + 16 {
        return Err(Error::Codec("primary key channel truncated".to_owned()));
    }
    let channel = &key[KEY_FIXED..KEY_FIXED + channel_len];
    let mut pos = KEY_FIXED + channel_len;
    let deliver_at = u64::from_be_bytes(key[pos..pos + 8].try_into().expect("length checked")) as i64;
    pos += 8;
    let id = u64::from_be_bytes(key[pos..pos + 8].try_into().expect("length checked"));
    Ok((delayed_type, deliver_at, id, channel))
}

/// Builds a secondary key `prefix ‖ origId`.
#[must_use]
pub fn index_key(delayed_type: u16, channel: &str, orig_id: MessageId) -> Vec<u8> {
    let mut key = prefix_key(delayed_type, channel);
    key.reserve(8);
    key.extend_from_slice(&orig_id.to_be_bytes());
    key
}

/// Decodes a secondary key into `(type, origId, channel)`.
pub fn decode_index_key(key: &[u8]) -> Result<(u16, MessageId, &[u8])> {
    if key.len() < KEY_FIXED + 8 {
        return Err(Error::Codec("secondary key too short".to_owned()));
    }
    let delayed_type = u16::from_be_bytes([key[0], key[1]]);
    let channel_len = u16::from_be_bytes([key[3], key[4]]) as usize;
    if key.len() < KEY_FIXED + channel_len + 8 {
        return Err(Error::Codec("secondary key channel truncated".to_owned()));
    }
    let channel = &key[KEY_FIXED..KEY_FIXED + channel_len];
    let pos = KEY_FIXED + channel_len;
    let orig_id = u64::from_be_bytes(key[pos..pos + 8].try_into().expect("length checked"));
    Ok((delayed_type, orig_id, channel))
}

/// Builds a secondary value `0x01 ‖ deliverAt ‖ origId`.
#[must_use]
pub fn index_value(deliver_at: i64, orig_id: MessageId) -> [u8; 17] {
    let mut v = [0u8; 17];
    v[0] = 1;
    v[1..9].copy_from_slice(&(deliver_at as u64).to_be_bytes());
    v[9..17].copy_from_slice(&orig_id.to_be_bytes());
    v
}

/// Builds the counter key `"counter_" ‖ prefix`.
#[must_use]
pub fn counter_key(delayed_type: u16, channel: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(COUNTER_PREFIX.len() + KEY_FIXED + channel.len());
    key.extend_from_slice(COUNTER_PREFIX);
    key.extend_from_slice(&prefix_key(delayed_type, channel));
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_key_round_trip() {
        let key = message_key(1, "orders", 12345, 99);
        let (dt, ts, id, ch) = decode_message_key(&key).unwrap();
        assert_eq!(dt, 1);
        assert_eq!(ts, 12345);
        assert_eq!(id, 99);
        assert_eq!(ch, b"orders");
    }

    #[test]
    fn test_index_key_round_trip() {
        let key = index_key(1, "orders", 7);
        let (dt, orig_id, ch) = decode_index_key(&key).unwrap();
        assert_eq!(dt, 1);
        assert_eq!(orig_id, 7);
        assert_eq!(ch, b"orders");
    }

    #[test]
    fn test_key_order_matches_logical_order() {
        // same type and channel: deliver-at dominates, then id
        let a = message_key(1, "c", 100, 2);
        let b = message_key(1, "c", 200, 0);
        let c = message_key(1, "c", 200, 1);
        assert!(a < b);
        assert!(b < c);

        // types group before anything else
        let pub_key = message_key(2, "", 1, 1);
        assert!(c < pub_key);
    }

    #[test]
    fn test_prefix_covers_message_and_index_keys() {
        let prefix = prefix_key(1, "orders");
        assert!(message_key(1, "orders", 5, 5).starts_with(&prefix));
        assert!(index_key(1, "orders", 5).starts_with(&prefix));
        assert!(!message_key(1, "other", 5, 5).starts_with(&prefix));
    }

    #[test]
    fn test_counter_key_prefix() {
        let key = counter_key(1, "c");
        assert!(key.starts_with(COUNTER_PREFIX));
        assert!(key.ends_with(&prefix_key(1, "c")));
    }

    #[test]
    fn test_short_keys_rejected() {
        assert!(decode_message_key(b"xx").is_err());
        assert!(decode_index_key(b"xx").is_err());
    }
}
