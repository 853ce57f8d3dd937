//! Delayed-message type and its canonical wire codec.
//!
//! The encoding is a fixed-order big-endian layout with no padding so that
//! re-encoding a decoded message reproduces the input bytes exactly. Replica
//! log hashes are compared against the leader's, which rules out any codec
//! with nondeterministic output.

use bytes::Bytes;
use delayq_core::{DelayedType, Error, MessageId, Result};

/// Size of the fixed header fields: id, orig id, trace id, type,
/// deliver-at, creation timestamp and the channel length.
pub const MIN_MSG_LENGTH: u32 = 8 + 8 + 8 + 2 + 8 + 8 + 2;

/// Extra room the log writer grants beyond the payload cap: the fixed
/// header, the largest channel name and the extended-header length field.
pub const MSG_OVERHEAD: u32 = MIN_MSG_LENGTH + 8 + 255;

/// A message scheduled for future delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedMessage {
    /// Monotonic id assigned on first persistence; 0 while unassigned.
    pub id: MessageId,
    /// Original message id; equals `id` for non-channel categories.
    pub orig_id: MessageId,
    /// Opaque tracing token.
    pub trace_id: u64,
    /// Delayed-message category.
    pub delayed_type: DelayedType,
    /// Target channel; required non-empty for the channel category.
    pub channel: String,
    /// Absolute nanosecond timestamp of scheduled delivery.
    pub deliver_at: i64,
    /// Nanosecond creation time, used for retention age.
    pub timestamp: i64,
    /// Opaque message body.
    pub payload: Bytes,
    /// Extended header blob, only encoded when the queue runs in extended
    /// mode.
    pub ext: Bytes,
}

impl DelayedMessage {
    /// Returns true if the message satisfies its category's invariants.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self.delayed_type {
            DelayedType::Channel => {
                self.orig_id > 0 && !self.channel.is_empty() && self.deliver_at > 0
            }
            DelayedType::Pub => self.deliver_at > 0,
            DelayedType::Transaction => true,
        }
    }

    /// Encoded size in bytes, excluding the length frame.
    #[must_use]
    pub fn encoded_len(&self, is_ext: bool) -> usize {
        let mut n = MIN_MSG_LENGTH as usize + self.channel.len() + self.payload.len();
        if is_ext {
            n += 2 + self.ext.len();
        }
        n
    }

    /// Appends the wire encoding to `buf`, returning the number of bytes
    /// written.
    pub fn encode_to(&self, buf: &mut Vec<u8>, is_ext: bool) -> usize {
        let start = buf.len();
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.orig_id.to_be_bytes());
        buf.extend_from_slice(&self.trace_id.to_be_bytes());
        buf.extend_from_slice(&self.delayed_type.as_u16().to_be_bytes());
        buf.extend_from_slice(&(self.deliver_at as u64).to_be_bytes());
        buf.extend_from_slice(&(self.timestamp as u64).to_be_bytes());
        buf.extend_from_slice(&(self.channel.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.channel.as_bytes());
        if is_ext {
            buf.extend_from_slice(&(self.ext.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.ext);
        }
        buf.extend_from_slice(&self.payload);
        buf.len() - start
    }

    /// Appends the 4-byte big-endian length frame followed by the wire
    /// encoding, returning the number of bytes written.
    pub fn encode_framed_to(&self, buf: &mut Vec<u8>, is_ext: bool) -> usize {
        let body_len = self.encoded_len(is_ext) as u32;
        buf.extend_from_slice(&body_len.to_be_bytes());
        4 + self.encode_to(buf, is_ext)
    }

    /// Decodes a wire encoding produced by [`Self::encode_to`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] on truncated input or an unknown category.
    pub fn decode(data: &[u8], is_ext: bool) -> Result<Self> {
        let mut r = Reader::new(data);
        let id = r.u64()?;
        let orig_id = r.u64()?;
        let trace_id = r.u64()?;
        let raw_type = r.u16()?;
        let delayed_type = DelayedType::from_u16(raw_type)
            .ok_or_else(|| Error::Codec(format!("unknown delayed type {raw_type}")))?;
        let deliver_at = r.u64()? as i64;
        let timestamp = r.u64()? as i64;
        let channel_len = r.u16()? as usize;
        let channel = std::str::from_utf8(r.bytes(channel_len)?)
            .map_err(|e| Error::Codec(format!("channel is not utf-8: {e}")))?
            .to_owned();
        let ext = if is_ext {
            let ext_len = r.u16()? as usize;
            Bytes::copy_from_slice(r.bytes(ext_len)?)
        } else {
            Bytes::new()
        };
        let payload = Bytes::copy_from_slice(r.rest());
        Ok(Self {
            id,
            orig_id,
            trace_id,
            delayed_type,
            channel,
            deliver_at,
            timestamp,
            payload,
            ext,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Codec(format!(
                "truncated message: need {n} bytes at {}, have {}",
                self.pos,
                self.data.len()
            )));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_be_bytes(a))
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DelayedMessage {
        DelayedMessage {
            id: 42,
            orig_id: 7,
            trace_id: 0xdead_beef,
            delayed_type: DelayedType::Channel,
            channel: "orders".to_owned(),
            deliver_at: 1_700_000_000_000_000_000,
            timestamp: 1_600_000_000_000_000_000,
            payload: Bytes::from_static(b"hello"),
            ext: Bytes::new(),
        }
    }

    #[test]
    fn test_round_trip_plain() {
        let msg = sample();
        let mut buf = Vec::new();
        let n = msg.encode_to(&mut buf, false);
        assert_eq!(n, msg.encoded_len(false));

        let decoded = DelayedMessage::decode(&buf, false).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_round_trip_ext() {
        let mut msg = sample();
        msg.ext = Bytes::from_static(b"\x01tagged");
        let mut buf = Vec::new();
        msg.encode_to(&mut buf, true);

        let decoded = DelayedMessage::decode(&buf, true).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_encoding_is_canonical() {
        let msg = sample();
        let mut a = Vec::new();
        let mut b = Vec::new();
        msg.encode_to(&mut a, false);
        DelayedMessage::decode(&a, false).unwrap().encode_to(&mut b, false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_framed_prefix() {
        let msg = sample();
        let mut buf = Vec::new();
        let n = msg.encode_framed_to(&mut buf, false);
        assert_eq!(n, buf.len());
        let body_len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, buf.len() - 4);
    }

    #[test]
    fn test_truncated_rejected() {
        let msg = sample();
        let mut buf = Vec::new();
        msg.encode_to(&mut buf, false);
        let err = DelayedMessage::decode(&buf[..20], false).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_validity_rules() {
        let mut msg = sample();
        assert!(msg.is_valid());

        msg.channel.clear();
        assert!(!msg.is_valid());

        msg.delayed_type = DelayedType::Pub;
        assert!(msg.is_valid());
        msg.deliver_at = 0;
        assert!(!msg.is_valid());

        msg.delayed_type = DelayedType::Transaction;
        assert!(msg.is_valid());
    }
}
