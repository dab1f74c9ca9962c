// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Core types for syncpoint: restore points, LSNs, WAL archive naming, and
//! the manifest/receipt schemas shared by the publisher and the consumer.

use serde::{Deserialize, Serialize};

pub mod lsn;
pub mod manifest;
pub mod receipt;
pub mod restore_point;
pub mod wal;

pub use lsn::Lsn;
pub use manifest::{LatestPointer, Manifest, ManifestInstance};
pub use receipt::{EvidenceVerdict, InstanceOutcome, Receipt, ReceiptStatus};
pub use restore_point::RestorePointName;
pub use wal::{wal_filename, WalSegmentSize};

/// Identifier of one database instance within the cluster.
///
/// Content segments are numbered from zero; [`COORDINATOR_SEGMENT_ID`] denotes
/// the coordinator.
pub type SegmentId = i32;

/// The segment id of the cluster coordinator.
pub const COORDINATOR_SEGMENT_ID: SegmentId = -1;

/// The WAL timeline identifier, as recorded in the control file.
pub type TimelineId = u32;

/// Location of one database instance: where it listens and where its data
/// directory lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// The segment id; `-1` for the coordinator.
    pub segment_id: SegmentId,
    /// Host the instance runs on.
    pub host: String,
    /// Port the instance listens on.
    pub port: u16,
    /// Absolute path of the instance's data directory.
    pub data_dir: String,
    /// Whether the instance is local to this process (no ssh hop needed).
    #[serde(default)]
    pub is_local: bool,
}

impl InstanceDescriptor {
    /// Returns true iff this descriptor refers to the coordinator.
    pub fn is_coordinator(&self) -> bool {
        self.segment_id == COORDINATOR_SEGMENT_ID
    }
}
