// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Restore-point manifests and the LATEST pointer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Lsn, RestorePointName, SegmentId, TimelineId};

/// Per-instance WAL evidence within a [`Manifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInstance {
    /// The segment id; `-1` for the coordinator.
    pub segment_id: SegmentId,
    /// Host of the primary instance the WAL originates from.
    pub host: String,
    /// Port of the primary instance.
    pub port: u16,
    /// Data directory of the primary instance.
    pub data_dir: String,
    /// The LSN recorded for this instance by the restore-point call.
    pub restore_lsn: Lsn,
    /// Archive filename of the WAL segment containing `restore_lsn`.
    pub wal_filename: String,
    /// Host on which the archive verifier must look for the file.
    pub archive_source_host: String,
    /// Full path of the WAL file within the archive.
    pub archive_source_path: String,
    /// Whether the archive verifier has seen the file.
    pub present: bool,
}

/// Snapshot of the cluster archiver statistics taken while publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverStats {
    /// True iff no instance reported a recent archival failure.
    pub no_recent_failures: bool,
    /// Raw per-instance archiver rows, kept for post-mortem inspection.
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
}

/// Result of the WAL-switch call on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchWalRow {
    /// The segment id.
    pub segment_id: SegmentId,
    /// The LSN at which the switch happened.
    pub switch_lsn: Lsn,
    /// The WAL file completed by the switch.
    pub switch_wal_file: String,
}

/// Summary of the publisher's archive-availability wait.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveWait {
    /// Configured cap on the wait.
    pub max_wait_secs: u64,
    /// Configured interval between probing passes.
    pub poll_interval_secs: u64,
    /// Seconds actually waited before the manifest became ready (or the cap
    /// expired).
    pub waited_secs: u64,
    /// When every file was seen, if the manifest became ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at_utc: Option<DateTime<Utc>>,
}

/// Publisher-side evidence attached to a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEvidence {
    /// Cluster archiver statistics at publish time.
    pub archiver: ArchiverStats,
    /// Per-instance WAL-switch results (empty when the switch was skipped).
    #[serde(default)]
    pub switch_wal: Vec<SwitchWalRow>,
    /// The archive-availability wait summary.
    pub archive_wait: ArchiveWait,
}

/// A restore-point manifest.
///
/// Immutable once `ready` is true: the publisher republishes updated versions
/// while probing the archive, but after the ready transition the document is
/// never touched again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// The restore point this manifest describes.
    pub restore_point: RestorePointName,
    /// When the restore point was created.
    pub created_at_utc: DateTime<Utc>,
    /// WAL timeline of the cluster at creation time.
    pub timeline_id: TimelineId,
    /// True iff every instance's WAL file was proven present in one pass.
    pub ready: bool,
    /// Per-instance targets and evidence.
    pub instances: Vec<ManifestInstance>,
    /// Publisher-side evidence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<ArchiveEvidence>,
}

impl Manifest {
    /// True iff every instance currently reports its WAL file present.
    pub fn all_present(&self) -> bool {
        !self.instances.is_empty() && self.instances.iter().all(|i| i.present)
    }

    /// The target LSN for each segment.
    pub fn lsn_by_segment(&self) -> BTreeMap<SegmentId, Lsn> {
        self.instances
            .iter()
            .map(|i| (i.segment_id, i.restore_lsn))
            .collect()
    }

    /// Looks up the instance entry for a segment.
    pub fn instance(&self, segment_id: SegmentId) -> Option<&ManifestInstance> {
        self.instances.iter().find(|i| i.segment_id == segment_id)
    }
}

/// Pointer to the most recently READY manifest.
///
/// Replaced atomically after the manifest itself is durable; readers must
/// tolerate an older version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    /// Name of the newest READY restore point.
    pub restore_point: RestorePointName,
    /// Storage path of its manifest.
    pub path: String,
    /// When the pointer was last replaced.
    pub updated_at_utc: DateTime<Utc>,
}
