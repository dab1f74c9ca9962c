// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! The DR-side consumer: pick a target manifest, drive every instance to it,
//! validate the stop, record a receipt, and only then advance durable state.

use std::{path::Path, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use syncpoint_core::{Receipt, ReceiptStatus, RestorePointName};

use crate::{
    cluster::InstanceConnector,
    config::SyncConfig,
    error::{ConsumeError, ConsumeResult},
    floors::compute_floors,
    manifest_store::{manifest_source, ManifestSource},
    orchestrator::Orchestrator,
    receipts::ReceiptWriter,
    selector::{select_target, Selection},
};

/// Result of one consumer run.
#[derive(Debug)]
pub enum ConsumerOutcome {
    /// No READY manifest satisfies the floors; nothing was attempted and no
    /// receipt was written.
    NoCandidate {
        /// Why each candidate was rejected.
        reasons: Vec<String>,
    },
    /// The durable state already names the target; a repeat run is a no-op
    /// and writes no receipt.
    AlreadyAtTarget(RestorePointName),
    /// A run happened and a receipt was written.
    Completed {
        /// The receipt, as written.
        receipt: Receipt,
        /// Whether `current_restore_point.txt` advanced.
        advanced: bool,
    },
}

/// Reads the durable consumer state.
pub fn read_current_restore_point(state_file: &Path) -> Option<RestorePointName> {
    let text = std::fs::read_to_string(state_file).ok()?;
    text.trim().parse().ok()
}

fn write_current_restore_point(
    state_file: &Path,
    name: &RestorePointName,
) -> ConsumeResult<()> {
    crate::utils::atomic_write_text(state_file, &format!("{name}\n")).map_err(|source| {
        ConsumeError::State {
            path: state_file.display().to_string(),
            source,
        }
    })
}

/// Drives consumer runs against the configured DR topology.
pub struct Consumer<'a> {
    config: &'a SyncConfig,
    connector: &'a dyn InstanceConnector,
    source: Box<dyn ManifestSource>,
}

impl<'a> Consumer<'a> {
    /// Creates a consumer reading manifests per the storage configuration.
    pub fn new(config: &'a SyncConfig, connector: &'a dyn InstanceConnector) -> Self {
        Consumer {
            config,
            connector,
            source: manifest_source(&config.storage),
        }
    }

    /// Runs one consume cycle.
    ///
    /// Hard selection errors (explicit target missing or below floor,
    /// topology mismatch) propagate; everything the orchestrator observes is
    /// folded into a receipt instead.
    pub async fn run_once(
        &self,
        explicit_target: Option<&RestorePointName>,
        cancel: &CancellationToken,
    ) -> ConsumeResult<ConsumerOutcome> {
        let floors = compute_floors(
            &self.config.dr.instances,
            self.connector,
            &self.config.dr.gp_home,
        )
        .await;

        let selection = select_target(
            self.source.as_ref(),
            &self.config.dr.instances,
            &floors,
            explicit_target,
        )
        .await?;
        let target = match selection {
            Selection::Chosen(target) => target,
            Selection::NoneAvailable { reasons } => {
                for reason in &reasons {
                    tracing::info!("{reason}");
                }
                return Ok(ConsumerOutcome::NoCandidate { reasons });
            }
        };
        let manifest = target.manifest;
        tracing::info!(target = %manifest.restore_point, reason = %target.reason, "target selected");

        let state_file = self.config.state_file();
        let current = read_current_restore_point(&state_file);
        if current.as_ref() == Some(&manifest.restore_point) {
            tracing::info!(target = %manifest.restore_point, "already at target");
            return Ok(ConsumerOutcome::AlreadyAtTarget(manifest.restore_point));
        }
        // State only moves forward in restore-point time; undoing an
        // advancement is an operator decision (delete the state file).
        if let Some(current) = &current {
            if current > &manifest.restore_point {
                let reason = format!(
                    "target '{}' is older than current state '{current}'",
                    manifest.restore_point
                );
                tracing::info!("{reason}");
                return Ok(ConsumerOutcome::NoCandidate {
                    reasons: vec![reason],
                });
            }
        }

        let outcome = Orchestrator::new(self.config, self.connector)
            .run(&manifest, cancel)
            .await;

        let receipt = Receipt {
            current_restore_point: current,
            target_restore_point: manifest.restore_point.clone(),
            checked_at_utc: Utc::now(),
            mode: "shutdown".into(),
            status: outcome.status,
            waited_secs: outcome.waited_secs,
            target_lsns: manifest.lsn_by_segment(),
            per_instance: outcome.per_instance,
            error: outcome.error,
        };
        ReceiptWriter::new(&self.config.dr.receipts_dir)
            .write(&receipt)
            .map_err(|error| ConsumeError::Receipt(error.to_string()))?;

        let advanced = receipt.status.advances_state() && outcome.advance;
        if advanced {
            // The receipt is durable; only now may the state move.
            write_current_restore_point(&state_file, &manifest.restore_point)?;
            tracing::info!(target = %manifest.restore_point, "state advanced");
        } else {
            tracing::warn!(
                target = %manifest.restore_point,
                status = ?receipt.status,
                "run did not advance state"
            );
        }

        Ok(ConsumerOutcome::Completed { receipt, advanced })
    }
}

/// Runs the consumer as a daemon: one run, sleep, repeat. Hard errors are
/// logged and the loop continues; cancellation stops between runs and
/// aborts a run in flight at its next poll.
pub async fn run_consumer_daemon(
    config: &SyncConfig,
    connector: &dyn InstanceConnector,
    cancel: CancellationToken,
) {
    let consumer = Consumer::new(config, connector);
    let sleep = Duration::from_secs(config.behavior.consumer_sleep_secs.max(1));
    loop {
        match consumer.run_once(None, &cancel).await {
            Ok(ConsumerOutcome::Completed { receipt, advanced }) => {
                tracing::info!(status = ?receipt.status, advanced, "consumer run finished");
            }
            Ok(_) => {}
            Err(error) => tracing::error!(%error, "consumer run failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("consumer stopping");
                return;
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        manifest_store::LocalManifestStore,
        test_utils::{
            rp, test_manifest, test_manifest_instance, FakeConnector, FakeShell, FakeSql,
            SqlReply,
        },
    };

    use super::*;

    const CONF: &str = "listen_addresses = '*'\n";

    fn config(dir: &Path) -> SyncConfig {
        serde_json::from_value(serde_json::json!({
            "primary": { "host": "prim", "port": 5432, "db": "postgres", "user": "gpadmin" },
            "storage": {
                "manifest_dir": dir.join("manifests"),
                "latest_path": dir.join("LATEST.json"),
            },
            "archive": { "archive_dir": dir },
            "dr": {
                "state_dir": dir.join("state"),
                "receipts_dir": dir.join("receipts"),
                "gp_home": "/usr/local/greenplum-db",
                "instances": [
                    { "segment_id": -1, "host": "dr-c", "port": 6001, "data_dir": "/data/dr/c" },
                    { "segment_id": 0, "host": "dr-0", "port": 6000, "data_dir": "/data/dr/0" }
                ]
            },
            "behavior": { "consumer_reach_poll_secs": 1, "consumer_wait_reach_secs": 10 }
        }))
        .unwrap()
    }

    fn publish_ready(dir: &Path, name: &str, lsns: (&str, &str)) {
        let store = LocalManifestStore::new(dir.join("manifests"), dir.join("LATEST.json"));
        let manifest = test_manifest(
            name,
            vec![
                test_manifest_instance(-1, lsns.0, true),
                test_manifest_instance(0, lsns.1, true),
            ],
        );
        let path = store.put(&manifest).unwrap();
        store.update_latest(&manifest, &path).unwrap();
    }

    fn happy_instance(name: &str, floor: &str, replay: &'static str) -> (FakeShell, FakeSql) {
        let log = format!(
            "===FILE=== /l/latest.csv\nLOG:  recovery stopping at restore point \"{name}\"\n"
        );
        (
            FakeShell::new("dr")
                .on("postgresql.conf'; then cat", CONF)
                .on("ls -1t", &log),
            FakeSql::new()
                .respond("pg_control_recovery", floor)
                .script(
                    "pg_is_in_recovery",
                    [SqlReply::rows("t"), SqlReply::ConnectError],
                )
                .respond("pg_last_wal_replay_lsn", replay),
        )
    }

    fn seed_state(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir.join("state")).unwrap();
        std::fs::write(
            dir.join("state/current_restore_point.txt"),
            format!("{name}\n"),
        )
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn successful_run_advances_state_and_writes_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        publish_ready(
            dir.path(),
            "sync_point_20260201_181406",
            ("9/E40000C8", "9/EC0000C8"),
        );
        seed_state(dir.path(), "sync_point_20260201_180000");

        let target = "sync_point_20260201_181406";
        let (shell_c, sql_c) = happy_instance(target, "9/E4000000", "9/E40000C8");
        let (shell_0, sql_0) = happy_instance(target, "9/E4000000", "9/EC0000C8");
        let connector = FakeConnector::new()
            .with_instance(-1, shell_c, sql_c)
            .with_instance(0, shell_0, sql_0);

        let outcome = Consumer::new(&config, &connector)
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();

        let ConsumerOutcome::Completed { receipt, advanced } = outcome else {
            panic!("expected a completed run");
        };
        assert!(advanced);
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(
            receipt.current_restore_point,
            Some(rp("sync_point_20260201_180000"))
        );

        assert_eq!(
            read_current_restore_point(&config.state_file()),
            Some(rp(target))
        );
        assert!(dir
            .path()
            .join("receipts/sync_point_20260201_181406.receipt.json")
            .exists());
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_run_at_target_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        publish_ready(
            dir.path(),
            "sync_point_20260201_181406",
            ("9/E40000C8", "9/EC0000C8"),
        );
        seed_state(dir.path(), "sync_point_20260201_181406");

        let (shell_c, sql_c) = happy_instance("x", "0/0", "9/E40000C8");
        let (shell_0, sql_0) = happy_instance("x", "0/0", "9/EC0000C8");
        let connector = FakeConnector::new()
            .with_instance(-1, shell_c, sql_c)
            .with_instance(0, shell_0, sql_0);

        let outcome = Consumer::new(&config, &connector)
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ConsumerOutcome::AlreadyAtTarget(_)));
        assert!(std::fs::read_dir(dir.path().join("receipts")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_point_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        publish_ready(
            dir.path(),
            "sync_point_20260201_181406",
            ("9/E40000C8", "9/EC0000C8"),
        );
        seed_state(dir.path(), "sync_point_20260201_180000");

        let (shell_c, sql_c) =
            happy_instance("sync_point_20260201_181406", "9/E4000000", "9/E40000C8");
        // Segment 0 stopped at some other restore point.
        let (shell_0, sql_0) =
            happy_instance("sync_point_20260101_000000", "9/E4000000", "9/EB000000");
        let connector = FakeConnector::new()
            .with_instance(-1, shell_c, sql_c)
            .with_instance(0, shell_0, sql_0);

        let outcome = Consumer::new(&config, &connector)
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();

        let ConsumerOutcome::Completed { receipt, advanced } = outcome else {
            panic!("expected a completed run");
        };
        assert!(!advanced);
        assert_eq!(receipt.status, ReceiptStatus::StoppedWrongPoint);
        assert_eq!(
            read_current_restore_point(&config.state_file()),
            Some(rp("sync_point_20260201_180000"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_ready_manifest_writes_no_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        seed_state(dir.path(), "sync_point_20260201_180000");

        let (shell_c, sql_c) = happy_instance("x", "9/E4000000", "9/E40000C8");
        let (shell_0, sql_0) = happy_instance("x", "9/E4000000", "9/EC0000C8");
        let connector = FakeConnector::new()
            .with_instance(-1, shell_c, sql_c)
            .with_instance(0, shell_0, sql_0);

        let outcome = Consumer::new(&config, &connector)
            .run_once(None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, ConsumerOutcome::NoCandidate { .. }));
        assert!(std::fs::read_dir(dir.path().join("receipts")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_target_below_floor_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        publish_ready(
            dir.path(),
            "sync_point_20260201_180000",
            ("9/A0000000", "9/B0000000"),
        );
        seed_state(dir.path(), "sync_point_20260131_000000");

        // Coordinator floor is above the explicit target.
        let (shell_c, _) = happy_instance("x", "0/0", "9/A0000000");
        let sql_c = FakeSql::new().respond("pg_control_recovery", "A/00000000");
        let (shell_0, sql_0) = happy_instance("x", "0/0", "9/B0000000");
        let connector = FakeConnector::new()
            .with_instance(-1, shell_c, sql_c)
            .with_instance(0, shell_0, sql_0);

        let result = Consumer::new(&config, &connector)
            .run_once(
                Some(&rp("sync_point_20260201_180000")),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(ConsumeError::Select(
                crate::error::SelectError::TargetBelowFloor { .. }
            ))
        ));
        assert!(std::fs::read_dir(dir.path().join("receipts")).is_err());
    }
}
