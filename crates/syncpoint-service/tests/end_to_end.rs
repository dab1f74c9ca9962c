// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end flows: a publisher cycle against a fake Primary feeding a
//! consumer run against fake DR instances, through real manifest, state,
//! and receipt files.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use syncpoint_core::{Receipt, ReceiptStatus};
use syncpoint_service::{
    config::SyncConfig,
    consumer::{read_current_restore_point, Consumer, ConsumerOutcome},
    manifest_store::{LocalManifestStore, ManifestSource},
    publisher::Publisher,
    test_utils::{rp, test_manifest, test_manifest_instance, FakeConnector, FakeShell, FakeSql, SqlReply},
};

const CONF: &str = "listen_addresses = '*'\nport = 6000\n";

fn config(dir: &Path) -> SyncConfig {
    serde_json::from_value(serde_json::json!({
        "primary": { "host": "prim", "port": 5432, "db": "postgres", "user": "gpadmin" },
        "storage": {
            "manifest_dir": dir.join("manifests"),
            "latest_path": dir.join("LATEST.json"),
        },
        "archive": { "archive_dir": dir.join("archive") },
        "dr": {
            "state_dir": dir.join("state"),
            "receipts_dir": dir.join("receipts"),
            "gp_home": "/usr/local/greenplum-db",
            "instances": [
                { "segment_id": -1, "host": "dr-cdw", "port": 6001, "data_dir": "/data/dr/c" },
                { "segment_id": 0, "host": "dr-sdw1", "port": 6000, "data_dir": "/data/dr/0" }
            ]
        },
        "behavior": {
            "archive_wait_max_secs": 2,
            "archive_poll_interval_secs": 1,
            "consumer_reach_poll_secs": 1,
            "consumer_wait_reach_secs": 10
        }
    }))
    .unwrap()
}

/// Fake Primary for a two-instance cluster (coordinator plus one segment).
fn primary_sql() -> FakeSql {
    FakeSql::new()
        .respond(
            "SELECT content, hostname",
            "-1|cdw|5432|/data/coordinator\n0|sdw1|6000|/data/primary0",
        )
        .respond(
            "gp_create_restore_point",
            "-1|9/E40000C8|cdw|5432|/data/coordinator\n0|9/EC0000C8|sdw1|6000|/data/primary0",
        )
        .respond("pg_control_checkpoint", "1")
        .respond(
            "gp_switch_wal",
            "-1|9/E4000100|000000010000000900000039\n0|9/EC000100|00000001000000090000003B",
        )
        .respond("pg_stat_archiver", "[]")
}

fn seed_state(dir: &Path, name: &str) {
    std::fs::create_dir_all(dir.join("state")).unwrap();
    std::fs::write(
        dir.join("state/current_restore_point.txt"),
        format!("{name}\n"),
    )
    .unwrap();
}

fn dr_instance(stop_log_name: &str, floor: &str, replay: &'static str) -> (FakeShell, FakeSql) {
    let log = format!(
        "===FILE=== /data/log/latest.csv\n\
         LOG:  recovery stopping at restore point \"{stop_log_name}\"\n\
         LOG:  database system is shut down\n"
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

/// Both WAL files archived, floors satisfied; the manifest
/// goes READY, LATEST advances, and the consumer drives both instances to
/// the point and advances its state with a `success` receipt.
#[tokio::test(start_paused = true)]
async fn published_point_is_consumed_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let archive = dir.path().join("archive");
    std::fs::create_dir_all(&archive).unwrap();
    std::fs::write(archive.join("000000010000000900000039"), b"").unwrap();
    std::fs::write(archive.join("00000001000000090000003B"), b"").unwrap();

    let sql = primary_sql();
    let manifest = Publisher::new(&config, &sql)
        .publish_once(false)
        .await
        .unwrap();
    assert!(manifest.ready);
    let target = manifest.restore_point.clone();

    seed_state(dir.path(), "sync_point_20200101_000000");
    let (shell_c, sql_c) = dr_instance(target.as_str(), "9/E4000000", "9/E40000C8");
    let (shell_0, sql_0) = dr_instance(target.as_str(), "9/E4000000", "9/EC0000C8");
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
    assert_eq!(receipt.target_restore_point, target);
    assert_eq!(receipt.target_lsns[&-1], "9/E40000C8".parse().unwrap());
    assert_eq!(receipt.target_lsns[&0], "9/EC0000C8".parse().unwrap());

    // Durable state and receipt on disk.
    assert_eq!(
        read_current_restore_point(&config.state_file()).as_ref(),
        Some(&target)
    );
    let receipt_path = dir
        .path()
        .join("receipts")
        .join(format!("{target}.receipt.json"));
    let on_disk: Receipt =
        serde_json::from_str(&std::fs::read_to_string(receipt_path).unwrap()).unwrap();
    assert_eq!(on_disk.status, ReceiptStatus::Success);
    assert!(on_disk.per_instance[&-1].down);

    // The instances were configured, started, and validated.
    let scripts = connector.shell_for(0).ran();
    assert!(scripts.iter().any(|s| s.contains("standby.signal")));
    assert!(scripts.iter().any(|s| s.contains("stop -m fast")));
    assert!(scripts.iter().any(|s| s.contains("gp_role=utility")));
}

/// One WAL file missing: the manifest stays NOT READY,
/// LATEST stays unset, and the consumer finds nothing to do.
#[tokio::test(start_paused = true)]
async fn archive_gap_blocks_publication_and_consumption() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let archive = dir.path().join("archive");
    std::fs::create_dir_all(&archive).unwrap();
    std::fs::write(archive.join("000000010000000900000039"), b"").unwrap();
    // Segment 0's WAL file never appears.

    let sql = primary_sql();
    let manifest = Publisher::new(&config, &sql)
        .publish_once(false)
        .await
        .unwrap();
    assert!(!manifest.ready);

    let store = LocalManifestStore::new(
        dir.path().join("manifests"),
        dir.path().join("LATEST.json"),
    );
    assert!(store.latest().await.unwrap().is_none());

    seed_state(dir.path(), "sync_point_20200101_000000");
    let (shell_c, sql_c) = dr_instance("unused", "0/0", "9/E40000C8");
    let (shell_0, sql_0) = dr_instance("unused", "0/0", "9/EC0000C8");
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

/// The coordinator floor sits above LATEST's target, so
/// the selector falls back to an older READY manifest that satisfies every
/// floor, and the receipt records the older name.
#[tokio::test(start_paused = true)]
async fn floor_above_latest_falls_back_to_older_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let store = LocalManifestStore::new(
        dir.path().join("manifests"),
        dir.path().join("LATEST.json"),
    );
    let older = test_manifest(
        "sync_point_20260201_180000",
        vec![
            test_manifest_instance(-1, "A/10000000", true),
            test_manifest_instance(0, "9/F0000000", true),
        ],
    );
    store.put(&older).unwrap();
    let latest = test_manifest(
        "sync_point_20260201_181406",
        vec![
            test_manifest_instance(-1, "9/E40000C8", true),
            test_manifest_instance(0, "9/EC0000C8", true),
        ],
    );
    let latest_path = store.put(&latest).unwrap();
    store.update_latest(&latest, &latest_path).unwrap();

    seed_state(dir.path(), "sync_point_20200101_000000");
    let (shell_c, sql_c) =
        dr_instance("sync_point_20260201_180000", "A/00000000", "A/10000000");
    let (shell_0, sql_0) =
        dr_instance("sync_point_20260201_180000", "9/00000000", "9/F0000000");
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
    assert_eq!(
        receipt.target_restore_point,
        rp("sync_point_20260201_180000")
    );
    assert_eq!(
        read_current_restore_point(&config.state_file()),
        Some(rp("sync_point_20260201_180000"))
    );
}

/// A second publisher cycle with a fresh restore point moves LATEST while
/// the first manifest stays immutable on disk.
#[tokio::test(start_paused = true)]
async fn repeated_cycles_keep_older_manifests_intact() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let archive = dir.path().join("archive");
    std::fs::create_dir_all(&archive).unwrap();
    std::fs::write(archive.join("000000010000000900000039"), b"").unwrap();
    std::fs::write(archive.join("00000001000000090000003B"), b"").unwrap();

    let sql = primary_sql();
    let publisher = Publisher::new(&config, &sql);
    let first = publisher.publish_once(false).await.unwrap();

    // Names have second granularity; wait out the wall clock (paused tokio
    // time does not move it).
    let first_name = first.restore_point.clone();
    while syncpoint_core::RestorePointName::generate(chrono::Utc::now()) == first_name {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    let second = publisher.publish_once(false).await.unwrap();
    assert!(second.ready);
    assert_ne!(first.restore_point, second.restore_point);

    let store = LocalManifestStore::new(
        dir.path().join("manifests"),
        dir.path().join("LATEST.json"),
    );
    let names = store.list().await.unwrap();
    assert_eq!(names.len(), 2);
    let pointer = store.latest().await.unwrap().unwrap();
    assert_eq!(pointer.restore_point, second.restore_point);
    let kept = store.get(&first.restore_point).await.unwrap().unwrap();
    assert_eq!(kept, first);
}
