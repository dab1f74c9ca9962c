// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Stop-evidence validation.
//!
//! After recovery ends with `recovery_target_action = 'shutdown'`, the
//! server log is the only durable record of *where* recovery stopped. The
//! validator reads a bounded window from the newest log files and extracts
//! the stop signatures. The restore-point name is authoritative; the LSN is
//! a sanity check.

use regex::Regex;
use syncpoint_core::{EvidenceVerdict, InstanceDescriptor, Lsn, RestorePointName};

use crate::{command::sh_quote, shell::InstanceShell};

/// Bounds on the log scan.
#[derive(Debug, Clone, Copy)]
pub struct EvidenceScan {
    /// Newest log files to inspect per instance.
    pub files: usize,
    /// Bytes read from the tail of each file.
    pub bytes: u64,
}

/// What the log window revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopEvidence {
    /// LSN from `recovery stopping after WAL location`.
    pub stop_lsn: Option<Lsn>,
    /// Name from `recovery stopping at restore point`.
    pub restore_point: Option<String>,
    /// Whether a clean-shutdown line was seen.
    pub shutdown_seen: bool,
    /// Whether the log hints at a WAL gap (missing archive file).
    pub wal_gap_hint: bool,
}

impl StopEvidence {
    fn has_signature(&self) -> bool {
        self.stop_lsn.is_some() || self.restore_point.is_some()
    }
}

fn stop_lsn_regex() -> Regex {
    Regex::new(r#"recovery stopping after WAL location \(LSN\)\s+"{1,2}([0-9A-Fa-f]+/[0-9A-Fa-f]+)"{1,2}"#)
        .expect("valid regex")
}

fn restore_point_regex() -> Regex {
    Regex::new(r#"recovery stopping at restore point "{1,2}([A-Za-z0-9_]+)"{1,2}"#)
        .expect("valid regex")
}

fn wal_gap_regex() -> Regex {
    Regex::new(r"requested WAL segment .* has already been removed|could not open file .*pg_wal")
        .expect("valid regex")
}

/// Extracts stop evidence from one log window. The *last* occurrence wins:
/// within a file, later lines are more recent.
pub fn parse_window(window: &str) -> StopEvidence {
    let stop_lsn = stop_lsn_regex()
        .captures_iter(window)
        .last()
        .and_then(|captures| captures[1].parse().ok());
    let restore_point = restore_point_regex()
        .captures_iter(window)
        .last()
        .map(|captures| captures[1].to_owned());
    StopEvidence {
        stop_lsn,
        restore_point,
        shutdown_seen: window.contains("database system is shut down"),
        wal_gap_hint: wal_gap_regex().is_match(window),
    }
}

/// Reads the tail of the newest server log files for an instance and
/// extracts stop evidence from the most recent file that carries any.
///
/// Shell failures are tolerated (no evidence beats a poisoned run); the
/// newest file can be a fresh, empty one, which is why several are scanned.
pub async fn collect_stop_evidence(
    shell: &dyn InstanceShell,
    instance: &InstanceDescriptor,
    scan: EvidenceScan,
) -> Option<StopEvidence> {
    let log_dir = format!("{}/log", instance.data_dir);
    let script = format!(
        "ld={ld}; files=$(ls -1t \"$ld\"/*.csv \"$ld\"/*.log 2>/dev/null | head -n {files}); \
         if [ -z \"$files\" ]; then exit 0; fi; \
         for f in $files; do echo \"===FILE=== $f\"; tail -c {bytes} \"$f\"; echo; done",
        ld = sh_quote(&log_dir),
        files = scan.files,
        bytes = scan.bytes,
    );

    let output = match shell.run(&script).await {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => {
            tracing::warn!(
                segment_id = instance.segment_id,
                code = ?output.code,
                stderr = %output.stderr,
                "log scan returned non-zero"
            );
            return None;
        }
        Err(error) => {
            tracing::warn!(segment_id = instance.segment_id, %error, "log scan failed");
            return None;
        }
    };

    // Files arrive newest first; take the first one with a signature.
    let mut fallback: Option<StopEvidence> = None;
    for window in output.split("===FILE===").skip(1) {
        let evidence = parse_window(window);
        if evidence.has_signature() {
            return Some(evidence);
        }
        if fallback.is_none() && (evidence.shutdown_seen || evidence.wal_gap_hint) {
            fallback = Some(evidence);
        }
    }
    fallback
}

/// Applies the verdict rules: name match is authoritative, the stop LSN is
/// accepted at or past the target, a foreign name is a wrong point.
pub fn verdict(
    evidence: Option<&StopEvidence>,
    target_name: &RestorePointName,
    target_lsn: Lsn,
) -> EvidenceVerdict {
    let Some(evidence) = evidence else {
        return EvidenceVerdict::NoEvidence;
    };
    match &evidence.restore_point {
        Some(name) if name == target_name.as_str() => return EvidenceVerdict::OkByName,
        Some(_) => return EvidenceVerdict::WrongPoint,
        None => {}
    }
    match evidence.stop_lsn {
        Some(stop) if stop.reaches(target_lsn) => EvidenceVerdict::OkByLsn,
        _ => EvidenceVerdict::NoEvidence,
    }
}

#[cfg(test)]
mod tests {
    use syncpoint_test_utils::param_test;

    use crate::test_utils::{lsn, rp, test_instance, FakeShell};

    use super::*;

    const SCAN: EvidenceScan = EvidenceScan {
        files: 6,
        bytes: 1 << 20,
    };

    #[test]
    fn parses_csv_quoted_signatures() {
        let window = r#"2026-02-01 18:14:20 UTC,,,1234,,67a0,3,,"recovery stopping after WAL location (LSN) ""9/EC0000C8""",,,,,"#;
        let evidence = parse_window(window);
        assert_eq!(evidence.stop_lsn, Some(lsn("9/EC0000C8")));
    }

    #[test]
    fn last_signature_in_a_window_wins() {
        let window = "LOG:  recovery stopping after WAL location (LSN) \"9/E0000000\"\n\
                      LOG:  recovery stopping after WAL location (LSN) \"9/EC0000C8\"\n";
        assert_eq!(parse_window(window).stop_lsn, Some(lsn("9/EC0000C8")));
    }

    #[test]
    fn detects_restore_point_names_and_gaps() {
        let window = "LOG:  recovery stopping at restore point \"sync_point_20260201_181406\"\n\
                      FATAL:  requested WAL segment 000000010000000900000039 has already been removed\n\
                      LOG:  database system is shut down\n";
        let evidence = parse_window(window);
        assert_eq!(
            evidence.restore_point.as_deref(),
            Some("sync_point_20260201_181406")
        );
        assert!(evidence.shutdown_seen);
        assert!(evidence.wal_gap_hint);
    }

    param_test! {
        verdict_rules: [
            name_match: (Some(("sync_point_20260201_181406", None)), EvidenceVerdict::OkByName),
            name_beats_low_lsn: (Some(("sync_point_20260201_181406", Some("9/E0000000"))), EvidenceVerdict::OkByName),
            wrong_name: (Some(("sync_point_20260101_000000", None)), EvidenceVerdict::WrongPoint),
            wrong_name_beats_good_lsn: (Some(("sync_point_20260101_000000", Some("9/EC0000C8"))), EvidenceVerdict::WrongPoint),
            no_evidence: (None, EvidenceVerdict::NoEvidence),
        ]
    }
    fn verdict_rules(
        evidence: Option<(&str, Option<&str>)>,
        expected: EvidenceVerdict,
    ) {
        let evidence = evidence.map(|(name, stop)| StopEvidence {
            restore_point: Some(name.to_owned()),
            stop_lsn: stop.map(lsn),
            ..Default::default()
        });
        assert_eq!(
            verdict(
                evidence.as_ref(),
                &rp("sync_point_20260201_181406"),
                lsn("9/EC0000C8")
            ),
            expected
        );
    }

    param_test! {
        lsn_only_verdicts: [
            at_target: ("9/EC0000C8", EvidenceVerdict::OkByLsn),
            past_target: ("9/EC0001FF", EvidenceVerdict::OkByLsn),
            below_target: ("9/EB000000", EvidenceVerdict::NoEvidence),
        ]
    }
    fn lsn_only_verdicts(stop: &str, expected: EvidenceVerdict) {
        let evidence = StopEvidence {
            stop_lsn: Some(lsn(stop)),
            ..Default::default()
        };
        assert_eq!(
            verdict(
                Some(&evidence),
                &rp("sync_point_20260201_181406"),
                lsn("9/EC0000C8")
            ),
            expected
        );
    }

    #[tokio::test]
    async fn newest_file_with_a_signature_wins() {
        let output = "===FILE=== /data/log/new.csv\nnothing here yet\n\
                      ===FILE=== /data/log/older.csv\n\
                      LOG:  recovery stopping after WAL location (LSN) \"9/EC0000C8\"\n";
        let shell = FakeShell::new("dr-host").on("ls -1t", output);
        let evidence = collect_stop_evidence(&shell, &test_instance(0), SCAN)
            .await
            .unwrap();
        assert_eq!(evidence.stop_lsn, Some(lsn("9/EC0000C8")));
    }

    #[tokio::test]
    async fn empty_log_dir_yields_no_evidence() {
        let shell = FakeShell::new("dr-host").on("ls -1t", "");
        assert_eq!(
            collect_stop_evidence(&shell, &test_instance(0), SCAN).await,
            None
        );
    }
}
