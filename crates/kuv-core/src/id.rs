//! Connection identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const ENCODE_32_CHARS: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Length of the textual form
pub const CONNECTION_ID_LEN: usize = 13;

/// Unique identifier for a connection
///
/// A 64-bit value rendered as 13 base32 characters. Values come from a
/// process-wide counter seeded from the wall clock, so ids stay unique
/// across restarts in practice and sort by creation order within one
/// process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(u64);

fn last_id() -> &'static AtomicU64 {
    static LAST_ID: OnceLock<AtomicU64> = OnceLock::new();
    LAST_ID.get_or_init(|| {
        // 100ns ticks since the epoch
        let ticks = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as u64)
            .unwrap_or(0);
        AtomicU64::new(ticks)
    })
}

impl ConnectionId {
    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        ConnectionId(last_id().fetch_add(1, Ordering::Relaxed).wrapping_add(1))
    }

    /// Create a ConnectionId from a raw value
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        ConnectionId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Encode as 13 base32 characters, most significant first
    pub fn encode(self) -> [u8; CONNECTION_ID_LEN] {
        let mut out = [0u8; CONNECTION_ID_LEN];
        // first char carries the top 4 bits, the rest 5 bits each
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 5 * (CONNECTION_ID_LEN - 1 - i);
            *slot = ENCODE_32_CHARS[((self.0 >> shift) & 31) as usize];
        }
        out
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        // alphabet is ASCII
        f.write_str(core::str::from_utf8(&encoded).map_err(|_| fmt::Error)?)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}
