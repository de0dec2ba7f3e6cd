//! LSN (log sequence number) codec.
//!
//! On the wire an LSN is two 32-bit integers `(hi, lo)`; internally it is a
//! single monotonic `u64`. Comparison is unsigned, so deriving `Ord` on the
//! wrapped `u64` is already correct.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn from_hi_lo(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | lo as u64)
    }

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }

    /// The LSN advertised upstream for this commit: one past the last byte
    /// durably received.
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(value: Lsn) -> Self {
        value.0
    }
}

/// Postgres' own `%X/%X` textual form, e.g. `0/1A0`.
impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.hi(), self.lo())
    }
}
