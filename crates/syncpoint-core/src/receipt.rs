// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Consumer-run receipts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Lsn, RestorePointName, SegmentId};

/// Outcome class of a consumer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Every instance stopped at the target with positive evidence.
    Success,
    /// Every instance is down and at/past the target by LSN, but at least one
    /// lacked a stop signature in its logs.
    ReachedThenShutdownBestEffort,
    /// An explicitly requested target lies below a recovery floor.
    FloorAboveTarget,
    /// A required WAL file was missing from the archive.
    WalMissing,
    /// Evidence shows an instance stopped at a different restore point.
    StoppedWrongPoint,
    /// The reach wait expired before every instance stopped.
    Timeout,
    /// The run failed before a verdict could be reached.
    Aborted,
}

impl ReceiptStatus {
    /// Whether this status class permits advancing the durable consumer
    /// state.
    pub fn advances_state(self) -> bool {
        matches!(
            self,
            ReceiptStatus::Success | ReceiptStatus::ReachedThenShutdownBestEffort
        )
    }
}

/// Verdict of the evidence validator for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceVerdict {
    /// The server log names the target restore point.
    OkByName,
    /// The server log records a stop LSN at/past the target.
    OkByLsn,
    /// The server log names a different restore point.
    WrongPoint,
    /// The instance is down but no stop signature was found.
    NoEvidence,
}

impl EvidenceVerdict {
    /// Whether this verdict counts as a pass.
    pub fn is_ok(self) -> bool {
        matches!(self, EvidenceVerdict::OkByName | EvidenceVerdict::OkByLsn)
    }
}

/// What the orchestrator observed for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    /// Last replay position observed while the instance was up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_lsn: Option<Lsn>,
    /// Whether the instance was down at the end of the run.
    pub down: bool,
    /// The evidence verdict, when validation ran for this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_evidence: Option<EvidenceVerdict>,
}

/// Durable audit record of one consumer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The restore point the consumer was at when the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_restore_point: Option<RestorePointName>,
    /// The restore point the run drove towards.
    pub target_restore_point: RestorePointName,
    /// When the verdict was reached.
    pub checked_at_utc: DateTime<Utc>,
    /// Recovery mode; always `shutdown` for this system.
    pub mode: String,
    /// Outcome class.
    pub status: ReceiptStatus,
    /// Seconds spent waiting for instances to reach the target.
    pub waited_secs: u64,
    /// Target LSN per segment id.
    pub target_lsns: BTreeMap<SegmentId, Lsn>,
    /// Per-instance observations.
    #[serde(default)]
    pub per_instance: BTreeMap<SegmentId, InstanceOutcome>,
    /// Failure detail, when the run aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    /// The filename of the first receipt for this target.
    pub fn file_name(target: &RestorePointName) -> String {
        format!("{target}.receipt.json")
    }

    /// The filename of a repeat attempt for this target.
    pub fn attempt_file_name(target: &RestorePointName, attempt: u32) -> String {
        format!("{target}.{attempt}.receipt.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tags_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&ReceiptStatus::StoppedWrongPoint).unwrap(),
            "\"stopped_wrong_point\""
        );
        assert_eq!(
            serde_json::to_string(&ReceiptStatus::ReachedThenShutdownBestEffort).unwrap(),
            "\"reached_then_shutdown_best_effort\""
        );
        assert_eq!(
            serde_json::to_string(&EvidenceVerdict::OkByName).unwrap(),
            "\"ok_by_name\""
        );
    }

    #[test]
    fn only_success_classes_advance_state() {
        assert!(ReceiptStatus::Success.advances_state());
        assert!(ReceiptStatus::ReachedThenShutdownBestEffort.advances_state());
        for status in [
            ReceiptStatus::FloorAboveTarget,
            ReceiptStatus::WalMissing,
            ReceiptStatus::StoppedWrongPoint,
            ReceiptStatus::Timeout,
            ReceiptStatus::Aborted,
        ] {
            assert!(!status.advances_state(), "{status:?}");
        }
    }

    #[test]
    fn receipt_round_trips() {
        let target: RestorePointName = "sync_point_20260201_181406".parse().unwrap();
        let receipt = Receipt {
            current_restore_point: Some("sync_point_20260201_180000".parse().unwrap()),
            target_restore_point: target.clone(),
            checked_at_utc: Utc::now(),
            mode: "shutdown".into(),
            status: ReceiptStatus::Success,
            waited_secs: 12,
            target_lsns: [(-1, "9/E40000C8".parse().unwrap())].into(),
            per_instance: [(
                -1,
                InstanceOutcome {
                    replay_lsn: Some("9/E40000C8".parse().unwrap()),
                    down: true,
                    log_evidence: Some(EvidenceVerdict::OkByName),
                },
            )]
            .into(),
            error: None,
        };
        let json = serde_json::to_string_pretty(&receipt).unwrap();
        assert_eq!(serde_json::from_str::<Receipt>(&json).unwrap(), receipt);
    }

    #[test]
    fn receipt_filenames() {
        let target: RestorePointName = "sync_point_20260201_181406".parse().unwrap();
        assert_eq!(
            Receipt::file_name(&target),
            "sync_point_20260201_181406.receipt.json"
        );
        assert_eq!(
            Receipt::attempt_file_name(&target, 2),
            "sync_point_20260201_181406.2.receipt.json"
        );
    }
}
