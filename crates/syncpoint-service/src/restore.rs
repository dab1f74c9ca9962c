// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Restore-point creation on the Primary coordinator.

use syncpoint_core::{
    manifest::{ArchiverStats, SwitchWalRow},
    Lsn, RestorePointName, SegmentId, TimelineId,
};

use crate::{
    error::{PublishError, PublishResult, SqlError},
    sql::{parse_rows_exact, SqlRunner},
};

/// One instance's share of a freshly created restore point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePointRow {
    /// The segment id.
    pub segment_id: SegmentId,
    /// The LSN at which the restore point was recorded on this instance.
    pub restore_lsn: Lsn,
    /// Host of the primary instance that wrote the WAL.
    pub source_host: String,
    /// Port of that instance.
    pub source_port: u16,
    /// Data directory of that instance.
    pub source_data_dir: String,
}

/// Result of the cluster-wide restore-point call.
#[derive(Debug, Clone)]
pub struct CreatedRestorePoint {
    /// The name that was recorded.
    pub name: RestorePointName,
    /// The cluster timeline at creation time.
    pub timeline_id: TimelineId,
    /// Per-instance LSNs and archive source locations.
    pub rows: Vec<RestorePointRow>,
}

fn create_sql(name: &RestorePointName) -> String {
    format!(
        "SELECT rp.gp_segment_id, rp.restore_lsn, sc.hostname, sc.port, sc.datadir \
           FROM gp_create_restore_point('{name}') rp \
           JOIN gp_segment_configuration sc \
             ON rp.gp_segment_id = sc.content \
          WHERE sc.role = 'p' \
          ORDER BY rp.gp_segment_id;"
    )
}

const SWITCH_WAL_SQL: &str = "\
    SELECT gp_segment_id, pg_switch_wal, pg_walfile_name \
      FROM gp_switch_wal() \
     ORDER BY gp_segment_id;";

const TIMELINE_SQL: &str = "SELECT timeline_id FROM pg_control_checkpoint();";

fn is_duplicate_name(error: &SqlError) -> bool {
    matches!(error, SqlError::Query { message, .. } if message.contains("already exists"))
}

/// Creates a named cluster-wide restore point and returns one LSN per
/// instance, joined with each instance's archive source location.
///
/// A name collision surfaces as [`PublishError::DuplicateRestorePoint`]; the
/// caller regenerates the name.
pub async fn create_restore_point(
    sql: &dyn SqlRunner,
    name: &RestorePointName,
) -> PublishResult<CreatedRestorePoint> {
    let output = match sql.query(&create_sql(name)).await {
        Ok(output) => output,
        Err(error) if is_duplicate_name(&error) => {
            return Err(PublishError::DuplicateRestorePoint(name.clone()));
        }
        Err(error) => return Err(error.into()),
    };

    let mut rows = Vec::new();
    for row in parse_rows_exact(&output, 5)? {
        rows.push(RestorePointRow {
            segment_id: parse_field(&row[0], "gp_segment_id")?,
            restore_lsn: row[1]
                .parse()
                .map_err(|_| shape("restore_lsn", &row[1]))?,
            source_host: row[2].clone(),
            source_port: parse_field(&row[3], "port")?,
            source_data_dir: row[4].clone(),
        });
    }
    if rows.is_empty() {
        return Err(PublishError::EmptyRestorePoint);
    }

    let timeline_output = sql.query(TIMELINE_SQL).await?;
    let timeline_id = timeline_output
        .trim()
        .parse()
        .map_err(|_| shape("timeline_id", &timeline_output))?;

    Ok(CreatedRestorePoint {
        name: name.clone(),
        timeline_id,
        rows,
    })
}

/// Forces a WAL switch on every instance, so the segment holding the restore
/// point becomes eligible for archival immediately.
pub async fn switch_wal(sql: &dyn SqlRunner) -> PublishResult<Vec<SwitchWalRow>> {
    let output = sql.query(SWITCH_WAL_SQL).await?;
    let mut rows = Vec::new();
    for row in parse_rows_exact(&output, 3)? {
        rows.push(SwitchWalRow {
            segment_id: parse_field(&row[0], "gp_segment_id")?,
            switch_lsn: row[1].parse().map_err(|_| shape("switch_lsn", &row[1]))?,
            switch_wal_file: row[2].clone(),
        });
    }
    Ok(rows)
}

const ARCHIVER_STATS_SQL: &str = r#"
    SELECT COALESCE(json_agg(json_build_object(
             'role', role,
             'segment_id', content,
             'archived_count', archived_count,
             'last_archived_wal', last_archived_wal,
             'last_archived_time', last_archived_time,
             'failed_count', failed_count,
             'last_failed_wal', last_failed_wal,
             'last_failed_time', last_failed_time
           ) ORDER BY content)::text, '[]')
      FROM (
        SELECT 'coordinator' AS role, -1 AS content, a.*
          FROM pg_stat_archiver AS a
        UNION ALL
        SELECT 'segment' AS role, s.gp_segment_id AS content, sa.*
          FROM gp_dist_random('pg_stat_archiver') AS sa
          JOIN gp_dist_random('gp_id') AS s ON true
      ) stats;"#;

/// Snapshots the cluster archiver statistics for the manifest evidence
/// block.
pub async fn archiver_stats(sql: &dyn SqlRunner) -> PublishResult<ArchiverStats> {
    let raw = sql.query(ARCHIVER_STATS_SQL).await?;
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(raw.trim()).map_err(|error| shape("archiver rows", &error.to_string()))?;
    let no_recent_failures = rows.iter().all(|row| {
        row.get("last_failed_time")
            .map(|v| v.is_null() || v.as_str() == Some(""))
            .unwrap_or(true)
    });
    Ok(ArchiverStats {
        no_recent_failures,
        rows,
    })
}

fn parse_field<T: std::str::FromStr>(value: &str, field: &str) -> Result<T, PublishError> {
    value.parse().map_err(|_| shape(field, value).into())
}

fn shape(field: &str, value: &str) -> SqlError {
    SqlError::Shape(format!("unparsable {field}: '{value}'"))
}
