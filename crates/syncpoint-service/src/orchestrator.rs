// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! The consumer orchestrator: drives every DR instance through the barriered
//! configure / start / reach / await-down / validate phases.
//!
//! Each phase is a capped parallel map over the instances; a phase's join is
//! the barrier, so no instance enters phase K+1 while another is still in
//! phase K. Every worker owns exactly one instance's resources.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use syncpoint_core::{
    EvidenceVerdict, InstanceDescriptor, InstanceOutcome, Lsn, Manifest, ReceiptStatus,
    RestorePointName, SegmentId,
};

use crate::{
    apply::apply_recovery_target,
    cluster::InstanceConnector,
    command::sh_quote,
    config::{defaults::WORKER_CAP, SyncConfig},
    error::ApplyError,
    evidence::{collect_stop_evidence, verdict, EvidenceScan, StopEvidence},
    floors::control_data_min_recovery_lsn,
    shell::InstanceShell,
    sql::SqlRunner,
    utils::{parallel_map, parallel_try_map},
};

/// Final result of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Outcome class for the receipt.
    pub status: ReceiptStatus,
    /// Whether the durable consumer state may advance.
    pub advance: bool,
    /// Seconds spent in the reach/await-down wait.
    pub waited_secs: u64,
    /// Per-instance observations for the receipt.
    pub per_instance: BTreeMap<SegmentId, InstanceOutcome>,
    /// Failure detail when the run aborted.
    pub error: Option<String>,
}

/// One instance's bundle of resources; cheap to clone into worker tasks.
#[derive(Clone)]
struct Worker {
    instance: InstanceDescriptor,
    target: Lsn,
    shell: Arc<dyn InstanceShell>,
    sql: Arc<dyn SqlRunner>,
}

/// What one poll observed for one instance.
#[derive(Debug, Clone, Copy)]
struct Observation {
    down: bool,
    replay: Option<Lsn>,
}

#[derive(Debug, Clone)]
struct Verdict {
    verdict: EvidenceVerdict,
    control_data_lsn: Option<Lsn>,
    wal_gap_hint: bool,
}

/// Drives DR instances to one manifest's restore point.
pub struct Orchestrator<'a> {
    config: &'a SyncConfig,
    connector: &'a dyn InstanceConnector,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator over the configured DR topology.
    pub fn new(config: &'a SyncConfig, connector: &'a dyn InstanceConnector) -> Self {
        Orchestrator { config, connector }
    }

    /// Runs all five phases against `manifest` and reports the aggregate
    /// outcome. Infrastructure failures surface as an `aborted` outcome
    /// rather than an error: the receipt must record them either way.
    pub async fn run(&self, manifest: &Manifest, cancel: &CancellationToken) -> RunOutcome {
        let targets = manifest.lsn_by_segment();
        let mut workers = Vec::with_capacity(self.config.dr.instances.len());
        for instance in &self.config.dr.instances {
            let Some(&target) = targets.get(&instance.segment_id) else {
                // The selector already enforced topology; this is a late
                // re-check so a racing manifest swap cannot slip through.
                return aborted(format!(
                    "manifest '{}' has no target for segment {}",
                    manifest.restore_point, instance.segment_id
                ));
            };
            workers.push(Worker {
                instance: instance.clone(),
                target,
                shell: self.connector.shell(instance),
                sql: self.connector.sql(instance),
            });
        }

        // P1: stop if up, apply recovery configuration.
        tracing::info!(target = %manifest.restore_point, "phase 1: configure");
        let gp_home = self.config.dr.gp_home.clone();
        let configure = parallel_try_map(workers.clone(), WORKER_CAP, move |worker| {
            let gp_home = gp_home.clone();
            async move { configure_instance(&worker, &gp_home).await }
        })
        .await;
        if let Err(error) = configure {
            return aborted(error.to_string());
        }

        // P2: start every instance in standby recovery. `pg_ctl` failures
        // are tolerated here; a dead instance is observed in P3 and judged
        // in P5.
        tracing::info!("phase 2: start");
        let gp_home = self.config.dr.gp_home.clone();
        let start = parallel_try_map(workers.clone(), WORKER_CAP, move |worker| {
            let gp_home = gp_home.clone();
            async move { start_instance(&worker, &gp_home).await }
        })
        .await;
        if let Err(error) = start {
            return aborted(error.to_string());
        }

        // P3 + P4: poll until every instance reached the target or went
        // down, then until every instance is down. One deadline spans both.
        tracing::info!("phase 3: wait for targets");
        let poll = Duration::from_secs(self.config.behavior.consumer_reach_poll_secs.max(1));
        let cap = self.config.behavior.consumer_wait_reach_secs;
        let mut waited: u64 = 0;
        let mut awaiting_down = false;
        let mut state: BTreeMap<SegmentId, Observation> = workers
            .iter()
            .map(|worker| {
                (
                    worker.instance.segment_id,
                    Observation {
                        down: false,
                        replay: None,
                    },
                )
            })
            .collect();

        loop {
            if cancel.is_cancelled() {
                let mut outcome = aborted("shutdown requested".into());
                outcome.waited_secs = waited;
                outcome.per_instance = outcomes_without_verdicts(&state);
                return outcome;
            }

            let observations =
                parallel_map(workers.clone(), WORKER_CAP, |worker| async move {
                    (worker.instance.segment_id, observe_instance(&worker).await)
                })
                .await;
            for (segment_id, observation) in observations {
                let entry = state
                    .get_mut(&segment_id)
                    .expect("observations cover exactly the configured instances");
                entry.down = observation.down;
                if observation.replay.is_some() {
                    entry.replay = observation.replay;
                }
            }

            for worker in &workers {
                let observation = state[&worker.instance.segment_id];
                tracing::debug!(
                    segment_id = worker.instance.segment_id,
                    down = observation.down,
                    replay = ?observation.replay,
                    target = %worker.target,
                    "poll"
                );
            }

            let all_reached_or_down = workers.iter().all(|worker| {
                let observation = &state[&worker.instance.segment_id];
                observation.down
                    || observation
                        .replay
                        .is_some_and(|replay| replay.reaches(worker.target))
            });
            if all_reached_or_down && !awaiting_down {
                awaiting_down = true;
                tracing::info!("phase 4: await shutdown");
            }

            let all_down = workers
                .iter()
                .all(|worker| state[&worker.instance.segment_id].down);
            if all_down {
                break;
            }

            if waited >= cap {
                tracing::warn!(waited, cap, "reach wait expired");
                return RunOutcome {
                    status: ReceiptStatus::Timeout,
                    advance: false,
                    waited_secs: waited,
                    per_instance: outcomes_without_verdicts(&state),
                    error: None,
                };
            }
            tokio::time::sleep(poll).await;
            waited += poll.as_secs();
        }

        // P5: every instance is down; judge each one from its logs.
        tracing::info!("phase 5: validate stop evidence");
        let scan = EvidenceScan {
            files: self.config.behavior.evidence_scan_files,
            bytes: self.config.behavior.evidence_scan_bytes,
        };
        let target_name = manifest.restore_point.clone();
        let gp_home = self.config.dr.gp_home.clone();
        let verdicts = parallel_map(workers.clone(), WORKER_CAP, move |worker| {
            let target_name = target_name.clone();
            let gp_home = gp_home.clone();
            async move {
                (
                    worker.instance.segment_id,
                    validate_instance(&worker, &target_name, &gp_home, scan).await,
                )
            }
        })
        .await;
        let verdicts: BTreeMap<SegmentId, Verdict> = verdicts.into_iter().collect();

        self.aggregate(&workers, &state, &verdicts, waited)
    }

    /// Folds the per-instance verdicts into the run outcome.
    fn aggregate(
        &self,
        workers: &[Worker],
        state: &BTreeMap<SegmentId, Observation>,
        verdicts: &BTreeMap<SegmentId, Verdict>,
        waited_secs: u64,
    ) -> RunOutcome {
        let mut per_instance = BTreeMap::new();
        let mut all_ok = true;
        let mut wrong_point = false;
        let mut wal_missing = false;
        let mut all_proven = true;

        for worker in workers {
            let segment_id = worker.instance.segment_id;
            let observation = &state[&segment_id];
            let verdict = &verdicts[&segment_id];

            // An instance is "proven" at the target when the log says so or
            // when an observed LSN (replay or control data) is at/past it.
            let lsn_proven = observation
                .replay
                .is_some_and(|replay| replay.reaches(worker.target))
                || verdict
                    .control_data_lsn
                    .is_some_and(|lsn| lsn.reaches(worker.target));
            let proven = verdict.verdict.is_ok() || lsn_proven;

            all_ok &= verdict.verdict.is_ok();
            all_proven &= proven;
            match verdict.verdict {
                EvidenceVerdict::WrongPoint => wrong_point = true,
                EvidenceVerdict::NoEvidence if verdict.wal_gap_hint && !proven => {
                    wal_missing = true
                }
                _ => {}
            }

            per_instance.insert(
                segment_id,
                InstanceOutcome {
                    replay_lsn: observation.replay.or(verdict.control_data_lsn),
                    down: observation.down,
                    log_evidence: Some(verdict.verdict),
                },
            );
        }

        let (status, advance) = if wrong_point {
            (ReceiptStatus::StoppedWrongPoint, false)
        } else if all_ok {
            (ReceiptStatus::Success, true)
        } else if wal_missing {
            (ReceiptStatus::WalMissing, false)
        } else {
            // Some instance is down without a stop signature. The strict
            // rule advances only when every instance is proven at/past the
            // target by LSN; the config flag relaxes that.
            let advance = all_proven || self.config.behavior.allow_best_effort_advance;
            (ReceiptStatus::ReachedThenShutdownBestEffort, advance)
        };

        RunOutcome {
            status,
            advance,
            waited_secs,
            per_instance,
            error: None,
        }
    }
}

fn aborted(error: String) -> RunOutcome {
    RunOutcome {
        status: ReceiptStatus::Aborted,
        advance: false,
        waited_secs: 0,
        per_instance: BTreeMap::new(),
        error: Some(error),
    }
}

fn outcomes_without_verdicts(
    state: &BTreeMap<SegmentId, Observation>,
) -> BTreeMap<SegmentId, InstanceOutcome> {
    state
        .iter()
        .map(|(&segment_id, observation)| {
            (
                segment_id,
                InstanceOutcome {
                    replay_lsn: observation.replay,
                    down: observation.down,
                    log_evidence: None,
                },
            )
        })
        .collect()
}

fn stop_script(gp_home: &std::path::Path, instance: &InstanceDescriptor) -> String {
    let gp = sh_quote(&gp_home.join("greenplum_path.sh").display().to_string());
    let data_dir = sh_quote(&instance.data_dir);
    if instance.is_coordinator() {
        format!(
            "source {gp} && export COORDINATOR_DATA_DIRECTORY={data_dir} && \
             pg_ctl -D {data_dir} stop -m fast"
        )
    } else {
        format!("source {gp} && pg_ctl -D {data_dir} stop -m fast")
    }
}

fn start_script(gp_home: &std::path::Path, instance: &InstanceDescriptor) -> String {
    let gp = sh_quote(&gp_home.join("greenplum_path.sh").display().to_string());
    let data_dir = sh_quote(&instance.data_dir);
    if instance.is_coordinator() {
        format!(
            "source {gp} && export COORDINATOR_DATA_DIRECTORY={data_dir} && \
             pg_ctl -D {data_dir} -o \"-c gp_role=utility\" start"
        )
    } else {
        format!(
            "source {gp} && pg_ctl -D {data_dir} \
             -o \"-c gp_role=utility -c port={port}\" start -l start.log",
            port = instance.port
        )
    }
}

async fn configure_instance(worker: &Worker, gp_home: &std::path::Path) -> Result<(), ApplyError> {
    // Stop is best-effort: the instance is usually already down.
    match worker.shell.run(&stop_script(gp_home, &worker.instance)).await {
        Ok(output) if !output.success() => tracing::debug!(
            segment_id = worker.instance.segment_id,
            stderr = %output.stderr,
            "pg_ctl stop returned non-zero (instance likely already down)"
        ),
        Ok(_) => {}
        Err(error) => return Err(error.into()),
    }
    apply_recovery_target(worker.shell.as_ref(), &worker.instance, worker.target).await
}

async fn start_instance(worker: &Worker, gp_home: &std::path::Path) -> Result<(), ApplyError> {
    match worker.shell.run(&start_script(gp_home, &worker.instance)).await {
        Ok(output) if !output.success() => {
            tracing::warn!(
                segment_id = worker.instance.segment_id,
                stderr = %output.stderr,
                "pg_ctl start returned non-zero; the instance will be judged from its logs"
            );
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(error) => Err(error.into()),
    }
}

async fn observe_instance(worker: &Worker) -> Observation {
    match worker.sql.query("SELECT pg_is_in_recovery();").await {
        Ok(_) => {
            let replay = match worker
                .sql
                .query("SELECT pg_last_wal_replay_lsn();")
                .await
            {
                Ok(output) => output.trim().parse().ok(),
                Err(_) => None,
            };
            Observation {
                down: false,
                replay,
            }
        }
        Err(error) if error.is_connect() => Observation {
            down: true,
            replay: None,
        },
        Err(error) => {
            tracing::debug!(
                segment_id = worker.instance.segment_id,
                %error,
                "liveness query failed; treating instance as up"
            );
            Observation {
                down: false,
                replay: None,
            }
        }
    }
}

async fn validate_instance(
    worker: &Worker,
    target_name: &RestorePointName,
    gp_home: &std::path::Path,
    scan: EvidenceScan,
) -> Verdict {
    let evidence: Option<StopEvidence> =
        collect_stop_evidence(worker.shell.as_ref(), &worker.instance, scan).await;
    let verdict = verdict(evidence.as_ref(), target_name, worker.target);

    // When the logs prove nothing, the control file still knows how far
    // recovery got before the shutdown.
    let control_data_lsn = if verdict == EvidenceVerdict::NoEvidence {
        control_data_min_recovery_lsn(worker.shell.as_ref(), gp_home, &worker.instance.data_dir)
            .await
    } else {
        None
    };

    Verdict {
        verdict,
        control_data_lsn,
        wal_gap_hint: evidence.map(|e| e.wal_gap_hint).unwrap_or(false),
    }
}
