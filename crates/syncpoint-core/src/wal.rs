// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! WAL archive file naming.
//!
//! The publisher proves that the archive holds the WAL file covering each
//! instance's restore LSN, and the consumer re-derives the same name when
//! auditing receipts. Both sides must agree on this computation exactly, so
//! it lives here as a pure function.

use std::fmt;

use crate::{Lsn, TimelineId};

const MIN_SEGMENT_BYTES: u64 = 1 << 20; // 1 MiB
const MAX_SEGMENT_BYTES: u64 = 1 << 30; // 1 GiB

/// Error returned for segment sizes the archival format does not allow.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid WAL segment size {0} bytes: must be a power of two between 1 MiB and 1 GiB")]
pub struct InvalidSegmentSize(pub u64);

/// A validated WAL segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalSegmentSize(u64);

impl WalSegmentSize {
    /// Validates a size in bytes.
    pub fn from_bytes(bytes: u64) -> Result<Self, InvalidSegmentSize> {
        if bytes.is_power_of_two() && (MIN_SEGMENT_BYTES..=MAX_SEGMENT_BYTES).contains(&bytes) {
            Ok(WalSegmentSize(bytes))
        } else {
            Err(InvalidSegmentSize(bytes))
        }
    }

    /// Validates a size in mebibytes, the unit used by the configuration.
    pub fn from_mebibytes(mebibytes: u64) -> Result<Self, InvalidSegmentSize> {
        WalSegmentSize::from_bytes(mebibytes.saturating_mul(1 << 20))
    }

    /// The size in bytes.
    pub fn as_bytes(self) -> u64 {
        self.0
    }

    /// The number of segments per logical xlog id (per 4 GiB of WAL).
    fn segments_per_xlog_id(self) -> u64 {
        0x1_0000_0000 / self.0
    }
}

impl fmt::Display for WalSegmentSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MB", self.0 >> 20)
    }
}

/// Computes the archive filename of the WAL segment containing `lsn`.
///
/// The name is the standard 24-hex-character triplet of
/// `(timeline, logical segment high, logical segment low)`. An LSN exactly at
/// a segment boundary names the segment *starting* at that LSN.
pub fn wal_filename(timeline_id: TimelineId, lsn: Lsn, segment_size: WalSegmentSize) -> String {
    let segno = lsn.0 / segment_size.as_bytes();
    let per_id = segment_size.segments_per_xlog_id();
    format!(
        "{:08X}{:08X}{:08X}",
        timeline_id,
        segno / per_id,
        segno % per_id
    )
}
