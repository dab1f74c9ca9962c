// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Recovery floors: the minimum LSN at which each DR instance may safely
//! stop.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use regex::Regex;
use syncpoint_core::{InstanceDescriptor, Lsn, SegmentId};

use crate::{
    cluster::InstanceConnector,
    command::sh_quote,
    config::defaults::WORKER_CAP,
    shell::InstanceShell,
    sql::SqlRunner,
    utils::parallel_map,
};

/// Floor per segment; `None` means the floor could not be determined, which
/// disqualifies every target for that instance.
pub type FloorMap = BTreeMap<SegmentId, Option<Lsn>>;

const FLOOR_SQL: &str = "SELECT min_recovery_end_lsn FROM pg_control_recovery();";

fn control_data_regex() -> Regex {
    Regex::new(r"Minimum recovery ending location:\s+([0-9A-Fa-f]+/[0-9A-Fa-f]+)")
        .expect("valid regex")
}

async fn floor_via_sql(sql: &dyn SqlRunner) -> Option<Lsn> {
    match sql.query(FLOOR_SQL).await {
        Ok(output) => output.trim().parse().ok(),
        Err(error) => {
            tracing::debug!(%error, "floor query failed; falling back to control data");
            None
        }
    }
}

/// Reads `Minimum recovery ending location` from `pg_controldata`, the
/// offline source of truth for how far recovery progressed on a down
/// instance.
pub async fn control_data_min_recovery_lsn(
    shell: &dyn InstanceShell,
    gp_home: &Path,
    data_dir: &str,
) -> Option<Lsn> {
    let script = format!(
        "{} {}",
        sh_quote(&gp_home.join("bin/pg_controldata").display().to_string()),
        sh_quote(data_dir)
    );
    let output = match shell.run(&script).await {
        Ok(output) if output.success() => output.stdout,
        Ok(output) => {
            tracing::debug!(
                code = ?output.code,
                stderr = %output.stderr,
                "pg_controldata returned non-zero"
            );
            return None;
        }
        Err(error) => {
            tracing::warn!(%error, "pg_controldata could not be run");
            return None;
        }
    };
    control_data_regex()
        .captures(&output)
        .and_then(|captures| captures[1].parse().ok())
}

/// Computes the floor for one instance: live SQL when the instance accepts
/// connections, the offline control-data inspector otherwise.
pub async fn instance_floor(
    instance: &InstanceDescriptor,
    sql: &dyn SqlRunner,
    shell: &dyn InstanceShell,
    gp_home: &Path,
) -> Option<Lsn> {
    if let Some(floor) = floor_via_sql(sql).await {
        return Some(floor);
    }
    control_data_min_recovery_lsn(shell, gp_home, &instance.data_dir).await
}

/// Computes the floors for every DR instance, in parallel.
pub async fn compute_floors(
    instances: &[InstanceDescriptor],
    connector: &dyn InstanceConnector,
    gp_home: &Path,
) -> FloorMap {
    let gp_home = gp_home.to_path_buf();
    let work: Vec<(InstanceDescriptor, Arc<dyn SqlRunner>, Arc<dyn InstanceShell>)> = instances
        .iter()
        .map(|instance| {
            (
                instance.clone(),
                connector.sql(instance),
                connector.shell(instance),
            )
        })
        .collect();

    let floors = parallel_map(work, WORKER_CAP, move |(instance, sql, shell)| {
        let gp_home = gp_home.clone();
        async move {
            let floor = instance_floor(&instance, sql.as_ref(), shell.as_ref(), &gp_home).await;
            match floor {
                Some(floor) => {
                    tracing::info!(segment_id = instance.segment_id, %floor, "recovery floor")
                }
                None => tracing::warn!(
                    segment_id = instance.segment_id,
                    "recovery floor unknown; instance disqualifies all targets"
                ),
            }
            (instance.segment_id, floor)
        }
    })
    .await;

    floors.into_iter().collect()
}
