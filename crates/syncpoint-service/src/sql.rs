// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! SQL access to the cluster, through `psql`.
//!
//! The publisher talks to the Primary coordinator; the consumer talks to
//! each DR instance in utility mode. Results come back as `psql -qtA`
//! pipe-separated rows.

use async_trait::async_trait;

use crate::{
    command::run_command,
    error::{SqlError, SqlResult},
};

/// Executes SQL against one database instance.
#[async_trait]
pub trait SqlRunner: Send + Sync {
    /// Runs a statement and returns raw `-qtA` output (one row per line,
    /// fields separated by `|`).
    async fn query(&self, sql: &str) -> SqlResult<String>;

    /// The host:port this runner targets, for diagnostics.
    fn target(&self) -> String;
}

/// A [`SqlRunner`] backed by the `psql` client binary.
#[derive(Debug, Clone)]
pub struct PsqlRunner {
    host: String,
    port: u16,
    user: String,
    db: String,
    utility_mode: bool,
}

impl PsqlRunner {
    /// Runner for the Primary coordinator (normal session role).
    pub fn coordinator(host: &str, port: u16, user: &str, db: &str) -> Self {
        PsqlRunner {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            db: db.to_owned(),
            utility_mode: false,
        }
    }

    /// Runner for a single instance in utility session role, used for
    /// segment-local queries.
    pub fn utility(host: &str, port: u16, user: &str, db: &str) -> Self {
        PsqlRunner {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            db: db.to_owned(),
            utility_mode: true,
        }
    }
}

fn looks_like_connect_failure(stderr: &str) -> bool {
    stderr.contains("could not connect to server")
        || stderr.contains("Connection refused")
        || stderr.contains("the database system is starting up")
        || stderr.contains("the database system is shutting down")
        || stderr.contains("timeout expired")
}

#[async_trait]
impl SqlRunner for PsqlRunner {
    async fn query(&self, sql: &str) -> SqlResult<String> {
        let port = self.port.to_string();
        let args = [
            "-qtA",
            "-h",
            self.host.as_str(),
            "-p",
            port.as_str(),
            "-U",
            self.user.as_str(),
            "-d",
            self.db.as_str(),
            "-c",
            sql,
        ];
        let envs: &[(&str, &str)] = if self.utility_mode {
            &[("PGOPTIONS", "-c gp_session_role=utility")]
        } else {
            &[]
        };

        let output =
            run_command("psql", &args, envs)
                .await
                .map_err(|error| SqlError::Connect {
                    host: self.host.clone(),
                    port: self.port,
                    message: error.to_string(),
                })?;

        if output.success() {
            return Ok(output.stdout);
        }
        if looks_like_connect_failure(&output.stderr) {
            Err(SqlError::Connect {
                host: self.host.clone(),
                port: self.port,
                message: output.stderr,
            })
        } else {
            Err(SqlError::Query {
                host: self.host.clone(),
                port: self.port,
                message: output.stderr,
            })
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Splits `-qtA` output into rows of fields.
pub fn parse_rows(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('|').map(|field| field.trim().to_owned()).collect())
        .collect()
}

/// Like [`parse_rows`], but checks that every row has exactly `width` fields.
pub fn parse_rows_exact(output: &str, width: usize) -> SqlResult<Vec<Vec<String>>> {
    let rows = parse_rows(output);
    for row in &rows {
        if row.len() != width {
            return Err(SqlError::Shape(format!(
                "expected {width} fields per row, got {}: {row:?}",
                row.len()
            )));
        }
    }
    Ok(rows)
}
