// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Log sequence numbers.

use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Error returned when parsing an [`Lsn`] from its textual form.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid LSN '{0}': expected two hex halves separated by '/'")]
pub struct LsnParseError(pub String);

/// A 64-bit position in the write-ahead log.
///
/// Canonically rendered as two upper-case hex halves separated by a slash
/// (for example `9/E40000C8`). Ordering and arithmetic are over the
/// underlying byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero position (`0/0`), used by the control file to mean "no
    /// constraint".
    pub const ZERO: Lsn = Lsn(0);

    /// Creates an LSN from its two 32-bit halves.
    pub fn from_halves(high: u32, low: u32) -> Self {
        Lsn((u64::from(high) << 32) | u64::from(low))
    }

    /// The high 32 bits (the "logical xlog id").
    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The low 32 bits (the offset within the logical xlog).
    pub fn low(self) -> u32 {
        self.0 as u32
    }

    /// Byte offset addition, saturating at the end of the address space.
    pub fn saturating_add(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Returns true iff this LSN is at or past `other`.
    pub fn reaches(self, other: Lsn) -> bool {
        self >= other
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.high(), self.low())
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (high, low) = s.split_once('/').ok_or_else(|| LsnParseError(s.into()))?;
        if high.is_empty() || low.is_empty() || high.len() > 8 || low.len() > 8 {
            return Err(LsnParseError(s.into()));
        }
        let high = u32::from_str_radix(high, 16).map_err(|_| LsnParseError(s.into()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| LsnParseError(s.into()))?;
        Ok(Lsn::from_halves(high, low))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
