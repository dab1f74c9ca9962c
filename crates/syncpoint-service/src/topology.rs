// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Topology resolution against the Primary coordinator.

use std::collections::BTreeSet;

use syncpoint_core::InstanceDescriptor;

use crate::{
    error::{PublishError, PublishResult},
    sql::{parse_rows_exact, SqlRunner},
};

const TOPOLOGY_SQL: &str = "\
    SELECT content, hostname, port, datadir \
      FROM gp_segment_configuration \
     WHERE role = 'p' \
     ORDER BY content;";

/// Enumerates the coordinator and live content segments of the Primary.
///
/// Re-queried on every publisher cycle; the cluster may expand between
/// cycles.
pub async fn resolve_topology(sql: &dyn SqlRunner) -> PublishResult<Vec<InstanceDescriptor>> {
    let output = sql.query(TOPOLOGY_SQL).await?;
    let rows = parse_rows_exact(&output, 4).map_err(PublishError::Sql)?;

    let mut seen = BTreeSet::new();
    let mut instances = Vec::with_capacity(rows.len());
    for row in rows {
        let segment_id = row[0]
            .parse()
            .map_err(|_| PublishError::Sql(bad_field("content", &row[0])))?;
        if !seen.insert(segment_id) {
            return Err(PublishError::InconsistentTopology(segment_id));
        }
        instances.push(InstanceDescriptor {
            segment_id,
            host: row[1].clone(),
            port: row[2]
                .parse()
                .map_err(|_| PublishError::Sql(bad_field("port", &row[2])))?,
            data_dir: row[3].clone(),
            is_local: false,
        });
    }
    Ok(instances)
}

fn bad_field(field: &str, value: &str) -> crate::error::SqlError {
    crate::error::SqlError::Shape(format!("unparsable {field}: '{value}'"))
}
