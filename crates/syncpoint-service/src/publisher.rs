// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! The Primary-side publisher: create a restore point, prove its WAL files
//! are archived, publish a READY manifest, move LATEST forward.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use syncpoint_core::{
    manifest::{ArchiveEvidence, ArchiveWait},
    wal_filename, Manifest, ManifestInstance, RestorePointName,
};

use crate::{
    archive::prove_instances,
    config::SyncConfig,
    error::{PublishError, PublishResult},
    manifest_store::LocalManifestStore,
    restore::{archiver_stats, create_restore_point, switch_wal, CreatedRestorePoint},
    sql::SqlRunner,
    topology::resolve_topology,
    utils::{with_retries, TRANSIENT_ATTEMPTS, TRANSIENT_RETRY_DELAY},
};

/// Publishes restore-point manifests from the Primary side.
pub struct Publisher<'a> {
    config: &'a SyncConfig,
    sql: &'a dyn SqlRunner,
    store: LocalManifestStore,
}

impl<'a> Publisher<'a> {
    /// Creates a publisher writing to the configured manifest store.
    pub fn new(config: &'a SyncConfig, sql: &'a dyn SqlRunner) -> Self {
        Publisher {
            config,
            sql,
            store: LocalManifestStore::new(
                &config.storage.manifest_dir,
                &config.storage.latest_path,
            ),
        }
    }

    /// Runs one publish cycle and returns the final manifest (READY or not).
    ///
    /// Ordering is fixed: restore point, WAL switch, manifest (NOT READY),
    /// archive probing, and only for a READY manifest the LATEST pointer.
    /// A cycle that fails early leaves nothing behind but a NOT READY
    /// manifest.
    pub async fn publish_once(&self, skip_switch_wal: bool) -> PublishResult<Manifest> {
        // Re-read the topology every cycle; the cluster may have expanded.
        let topology = with_retries(
            TRANSIENT_ATTEMPTS,
            TRANSIENT_RETRY_DELAY,
            |error: &PublishError| matches!(error, PublishError::Sql(sql) if sql.is_connect()),
            || resolve_topology(self.sql),
        )
        .await?;
        tracing::debug!(instances = topology.len(), "topology resolved");

        let name = RestorePointName::generate(Utc::now());
        let created = match create_restore_point(self.sql, &name).await {
            // Second-granularity clock collision with an earlier cycle:
            // retry once with the successor name.
            Err(PublishError::DuplicateRestorePoint(name)) => {
                let retry = name.successor();
                tracing::warn!(collided = %name, retry = %retry, "restore point name collision");
                create_restore_point(self.sql, &retry).await?
            }
            other => other?,
        };
        tracing::info!(restore_point = %created.name, timeline_id = created.timeline_id,
            instances = created.rows.len(), "restore point created");

        // Every instance the restore-point call touched must be in the
        // topology we just read; drift here means the enumeration raced a
        // cluster change and the manifest would mis-route a WAL probe.
        for row in &created.rows {
            if !topology
                .iter()
                .any(|instance| instance.segment_id == row.segment_id)
            {
                return Err(PublishError::InconsistentTopology(row.segment_id));
            }
        }

        let switch_rows = if skip_switch_wal {
            Vec::new()
        } else {
            switch_wal(self.sql).await?
        };
        let archiver = archiver_stats(self.sql).await?;
        if !archiver.no_recent_failures {
            tracing::warn!("archiver reports recent failures; WAL files may be slow to appear");
        }

        let mut manifest = self.build_manifest(&created);
        manifest.evidence = Some(ArchiveEvidence {
            archiver,
            switch_wal: switch_rows,
            archive_wait: ArchiveWait {
                max_wait_secs: self.config.behavior.archive_wait_max_secs,
                poll_interval_secs: self.config.behavior.archive_poll_interval_secs,
                waited_secs: 0,
                ready_at_utc: None,
            },
        });

        let path = self.store.put(&manifest)?;
        tracing::info!(path = %path.display(), "manifest published (ready=false)");

        // Probe until every WAL file is present in one pass, or the wait
        // cap expires and the manifest stays NOT READY for a later cycle.
        let poll = Duration::from_secs(self.config.behavior.archive_poll_interval_secs.max(1));
        let cap = self.config.behavior.archive_wait_max_secs;
        let mut waited: u64 = 0;
        loop {
            let proved = prove_instances(self.config, manifest.instances.clone()).await;
            manifest.instances = proved;

            if manifest.all_present() {
                manifest.ready = true;
                if let Some(evidence) = manifest.evidence.as_mut() {
                    evidence.archive_wait.waited_secs = waited;
                    evidence.archive_wait.ready_at_utc = Some(Utc::now());
                }
                let path = self.store.put(&manifest)?;
                self.store.update_latest(&manifest, &path)?;
                tracing::info!(restore_point = %manifest.restore_point, waited,
                    "manifest READY; LATEST advanced");
                return Ok(manifest);
            }

            if waited >= cap {
                break;
            }
            tokio::time::sleep(poll).await;
            waited += poll.as_secs();
        }

        if let Some(evidence) = manifest.evidence.as_mut() {
            evidence.archive_wait.waited_secs = waited;
        }
        self.store.put(&manifest)?;
        let missing: Vec<_> = manifest
            .instances
            .iter()
            .filter(|instance| !instance.present)
            .map(|instance| instance.segment_id)
            .collect();
        tracing::warn!(restore_point = %manifest.restore_point, ?missing, waited,
            "archive gap: WAL files still missing; manifest stays NOT READY");
        Ok(manifest)
    }

    fn build_manifest(&self, created: &CreatedRestorePoint) -> Manifest {
        let segment_size = self.config.wal_segment_size();
        let archive_dir = self.config.archive.archive_dir.display().to_string();
        let instances = created
            .rows
            .iter()
            .map(|row| {
                let wal = wal_filename(created.timeline_id, row.restore_lsn, segment_size);
                ManifestInstance {
                    segment_id: row.segment_id,
                    host: row.source_host.clone(),
                    port: row.source_port,
                    data_dir: row.source_data_dir.clone(),
                    restore_lsn: row.restore_lsn,
                    archive_source_host: row.source_host.clone(),
                    archive_source_path: format!("{archive_dir}/{wal}"),
                    wal_filename: wal,
                    present: false,
                }
            })
            .collect();

        Manifest {
            restore_point: created.name.clone(),
            created_at_utc: Utc::now(),
            timeline_id: created.timeline_id,
            ready: false,
            instances,
            evidence: None,
        }
    }
}

/// Runs the publisher as a daemon: one cycle, sleep, repeat. Per-cycle
/// errors are logged and the loop continues; cancellation stops between
/// cycles.
pub async fn run_publisher_daemon(
    config: &SyncConfig,
    sql: &dyn SqlRunner,
    skip_switch_wal: bool,
    cancel: CancellationToken,
) {
    let publisher = Publisher::new(config, sql);
    let sleep = Duration::from_secs(config.behavior.publisher_sleep_secs.max(1));
    loop {
        if let Err(error) = publisher.publish_once(skip_switch_wal).await {
            tracing::error!(%error, "publish cycle failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("publisher stopping");
                return;
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
