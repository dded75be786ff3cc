//! Resource ID Generator
//!
//! Generates unique, time-ordered 64-bit identifiers for sync batches,
//! lock jobs and key-chunk sessions. Identifiers from different servers do
//! not collide, so a coordinator can route by id without translation.
//!
//! ID Structure (64 bits):
//! - 1 bit: unused (sign bit)
//! - 41 bits: timestamp (milliseconds since epoch, ~69 years)
//! - 10 bits: server bits (crc32 of the server id)
//! - 12 bits: sequence (0-4095 per millisecond)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01 00:00:00 UTC
const SYNCPOINT_EPOCH: u64 = 1704067200000;

/// Bit allocation
const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;

/// Masks
const MAX_NODE: u64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Shifts
const NODE_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = NODE_BITS + SEQUENCE_BITS;

/// Opaque resource identifier.
///
/// Rendered as a decimal string on the wire; numbers are accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Extract timestamp from ID (milliseconds since the unix epoch)
    pub fn timestamp(&self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + SYNCPOINT_EPOCH
    }

    /// Extract the issuing server's bits
    pub fn node_bits(&self) -> u16 {
        ((self.0 >> NODE_SHIFT) & MAX_NODE) as u16
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u64> for ResourceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Self(n)),
            Repr::Text(s) => s
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid identifier '{}'", s))),
        }
    }
}

/// Issues resource ids for one server.
///
/// `state` packs the last timestamp used (upper bits) with the sequence
/// handed out within it (lower 12 bits).
pub struct IdGenerator {
    node_bits: u64,
    state: AtomicU64,
}

impl IdGenerator {
    /// Generator with explicit server bits (masked to 10 bits)
    pub fn new(node_bits: u16) -> Self {
        Self {
            node_bits: node_bits as u64 & MAX_NODE,
            state: AtomicU64::new(0),
        }
    }

    /// Generator whose server bits derive from the server id
    pub fn for_server(server_id: &str) -> Self {
        Self::new((crc32fast::hash(server_id.as_bytes()) as u64 & MAX_NODE) as u16)
    }

    pub fn generate(&self) -> ResourceId {
        let packed = loop {
            let now = Self::millis_since_epoch();
            let advanced = self
                .state
                .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |state| {
                    let (last, seq) = (state >> SEQUENCE_BITS, state & MAX_SEQUENCE);
                    if now > last {
                        Some(now << SEQUENCE_BITS)
                    } else if seq < MAX_SEQUENCE {
                        // Clock stalled or stepped back: stay on the last timestamp
                        Some(state + 1)
                    } else {
                        None
                    }
                });
            match advanced {
                Ok(previous) => {
                    let (last, seq) = (previous >> SEQUENCE_BITS, previous & MAX_SEQUENCE);
                    break if now > last {
                        now << SEQUENCE_BITS
                    } else {
                        (last << SEQUENCE_BITS) | (seq + 1)
                    };
                }
                // 4096 ids issued this millisecond
                Err(_) => std::thread::yield_now(),
            }
        };

        let timestamp = packed >> SEQUENCE_BITS;
        let sequence = packed & MAX_SEQUENCE;
        ResourceId((timestamp << TIMESTAMP_SHIFT) | (self.node_bits << NODE_SHIFT) | sequence)
    }

    fn millis_since_epoch() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .saturating_sub(SYNCPOINT_EPOCH)
    }
}
