//! Wire record exchanged over the channel.
//!
//! # Wire Format
//!
//! Every socket message carries exactly one fixed-size record:
//!
//! ```text
//! ┌───────────────┬───────────────────────────────────┐
//! │ Event tag (4) │ Send timestamp, monotonic ms (8)  │
//! └───────────────┴───────────────────────────────────┘
//! ```
//!
//! Both fields are little-endian. There is no length prefix, checksum or
//! version byte: the socket is `SOCK_SEQPACKET`, so message boundaries are
//! preserved by the kernel and a short or long record is simply malformed.
//!
//! Timestamps come from `CLOCK_MONOTONIC`, which is shared by every process on
//! the machine, so the receiver can compute the age of a record.

use std::time::Duration;

use rustix::time::{ClockId, clock_gettime};
use thiserror::Error;

use crate::event::{Event, UnknownTag};

/// Size of an encoded [`WireMessage`] in bytes.
pub const RECORD_SIZE: usize = 12;

/// Default age after which a received record is discarded.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_millis(5000);

/// Milliseconds on the system-wide monotonic clock.
#[must_use]
pub fn monotonic_ms() -> u64 {
    let ts = clock_gettime(ClockId::Monotonic);
    (ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000
}

/// One event in flight between the two processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage {
    /// The event being delivered.
    pub event: Event,
    /// Sender's [`monotonic_ms`] at the time of sending.
    pub send_timestamp_ms: u64,
}

/// Errors while decoding a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// The message is not exactly [`RECORD_SIZE`] bytes.
    #[error("record has {actual} bytes, expected {RECORD_SIZE}")]
    WrongSize { actual: usize },
    /// The tag does not name a known event.
    #[error(transparent)]
    UnknownTag(#[from] UnknownTag),
}

impl WireMessage {
    /// Stamps `event` with the current monotonic time.
    #[must_use]
    pub fn now(event: Event) -> Self {
        Self {
            event,
            send_timestamp_ms: monotonic_ms(),
        }
    }

    /// Encodes the record.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..4].copy_from_slice(&self.event.tag().to_le_bytes());
        buf[4..].copy_from_slice(&self.send_timestamp_ms.to_le_bytes());
        buf
    }

    /// Decodes a record received as a single socket message.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::WrongSize`] if `bytes` is not exactly one record,
    /// or [`WireError::UnknownTag`] if the tag is not a known event.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != RECORD_SIZE {
            return Err(WireError::WrongSize {
                actual: bytes.len(),
            });
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&bytes[..4]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[4..]);

        Ok(Self {
            event: Event::try_from(u32::from_le_bytes(tag))?,
            send_timestamp_ms: u64::from_le_bytes(ts),
        })
    }

    /// Age of the record at `now_ms`. A timestamp ahead of `now_ms` has age zero.
    #[inline]
    #[must_use]
    pub const fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.send_timestamp_ms)
    }

    /// Whether the record is too old to deliver at `now_ms`.
    #[inline]
    #[must_use]
    pub fn is_stale(&self, now_ms: u64, threshold: Duration) -> bool {
        u128::from(self.age_ms(now_ms)) >= threshold.as_millis()
    }
}
