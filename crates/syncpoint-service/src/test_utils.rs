// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Fakes for the subprocess seams, used by unit and integration tests.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use syncpoint_core::{
    InstanceDescriptor, Lsn, Manifest, ManifestInstance, RestorePointName, SegmentId,
};

use crate::{
    cluster::InstanceConnector,
    command::CommandOutput,
    error::{ShellResult, SqlError, SqlResult},
    shell::InstanceShell,
    sql::SqlRunner,
};

/// One scripted reply from [`FakeSql`].
#[derive(Debug, Clone)]
pub enum SqlReply {
    /// Successful output, `-qtA` formatted.
    Rows(String),
    /// Query failure with the given message.
    QueryError(String),
    /// Connection failure (instance down / unreachable).
    ConnectError,
}

impl SqlReply {
    /// Successful output from anything stringy.
    pub fn rows(rows: impl Into<String>) -> Self {
        SqlReply::Rows(rows.into())
    }
}

type SqlRule = (String, VecDeque<SqlReply>);

/// A [`SqlRunner`] answering from scripted rules.
///
/// Rules are matched by substring against the statement, in insertion order.
/// Each rule holds a queue of replies; the last reply repeats once the queue
/// drains. Unmatched statements fail loudly.
#[derive(Debug, Default)]
pub struct FakeSql {
    rules: Mutex<Vec<SqlRule>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeSql {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule with a single repeating reply.
    pub fn respond(self, pattern: &str, rows: impl Into<String>) -> Self {
        self.script(pattern, [SqlReply::Rows(rows.into())])
    }

    /// Adds a rule failing with a query error.
    pub fn fail_query(self, pattern: &str, message: impl Into<String>) -> Self {
        self.script(pattern, [SqlReply::QueryError(message.into())])
    }

    /// Adds a rule failing as unreachable.
    pub fn down(self, pattern: &str) -> Self {
        self.script(pattern, [SqlReply::ConnectError])
    }

    /// Adds a rule with a sequence of replies; the last repeats.
    pub fn script(self, pattern: &str, replies: impl IntoIterator<Item = SqlReply>) -> Self {
        self.rules
            .lock()
            .expect("fake lock never poisoned")
            .push((pattern.to_owned(), replies.into_iter().collect()));
        self
    }
}

#[async_trait]
impl SqlRunner for FakeSql {
    async fn query(&self, sql: &str) -> SqlResult<String> {
        self.queries
            .lock()
            .expect("fake lock never poisoned")
            .push(sql.to_owned());

        let mut rules = self.rules.lock().expect("fake lock never poisoned");
        for (pattern, replies) in rules.iter_mut() {
            if !sql.contains(pattern.as_str()) {
                continue;
            }
            let reply = if replies.len() > 1 {
                replies.pop_front().expect("non-empty queue")
            } else {
                replies.front().cloned().unwrap_or(SqlReply::ConnectError)
            };
            return match reply {
                SqlReply::Rows(rows) => Ok(rows),
                SqlReply::QueryError(message) => Err(SqlError::Query {
                    host: "fake".into(),
                    port: 5432,
                    message,
                }),
                SqlReply::ConnectError => Err(SqlError::Connect {
                    host: "fake".into(),
                    port: 5432,
                    message: "Connection refused".into(),
                }),
            };
        }
        Err(SqlError::Query {
            host: "fake".into(),
            port: 5432,
            message: format!("no fake response for: {sql}"),
        })
    }

    fn target(&self) -> String {
        "fake:5432".into()
    }
}

type ShellRule = (String, VecDeque<CommandOutput>);

/// An [`InstanceShell`] answering from scripted rules, matched by substring
/// against the script. Unmatched scripts succeed with empty output, which
/// matches how `touch`/`mv` style scripts behave.
#[derive(Debug, Default)]
pub struct FakeShell {
    host: String,
    rules: Mutex<Vec<ShellRule>>,
    pub scripts: Mutex<Vec<String>>,
}

impl FakeShell {
    pub fn new(host: impl Into<String>) -> Self {
        FakeShell {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Scripts successful output for scripts containing `pattern`.
    pub fn on(self, pattern: &str, stdout: &str) -> Self {
        self.push(pattern, ok_output(stdout));
        self
    }

    /// Scripts a failure for scripts containing `pattern`.
    pub fn fail_on(self, pattern: &str, code: i32, stderr: &str) -> Self {
        self.push(
            pattern,
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_owned(),
            },
        );
        self
    }

    /// Scripts a sequence of outputs; the last repeats.
    pub fn on_seq(self, pattern: &str, outputs: impl IntoIterator<Item = CommandOutput>) -> Self {
        self.rules
            .lock()
            .expect("fake lock never poisoned")
            .push((pattern.to_owned(), outputs.into_iter().collect()));
        self
    }

    fn push(&self, pattern: &str, output: CommandOutput) {
        self.rules
            .lock()
            .expect("fake lock never poisoned")
            .push((pattern.to_owned(), [output].into()));
    }

    /// All scripts that ran, for assertions.
    pub fn ran(&self) -> Vec<String> {
        self.scripts.lock().expect("fake lock never poisoned").clone()
    }
}

/// A successful [`CommandOutput`] with the given stdout.
pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

/// A failed [`CommandOutput`] with the given code and stderr.
pub fn failed_output(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

#[async_trait]
impl InstanceShell for FakeShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> ShellResult<CommandOutput> {
        self.scripts
            .lock()
            .expect("fake lock never poisoned")
            .push(script.to_owned());

        let mut rules = self.rules.lock().expect("fake lock never poisoned");
        for (pattern, outputs) in rules.iter_mut() {
            if !script.contains(pattern.as_str()) {
                continue;
            }
            let output = if outputs.len() > 1 {
                outputs.pop_front().expect("non-empty queue")
            } else if let Some(last) = outputs.front() {
                last.clone()
            } else {
                ok_output("")
            };
            return Ok(output);
        }
        Ok(ok_output(""))
    }
}

/// An [`InstanceConnector`] serving pre-registered fakes by segment id.
#[derive(Default)]
pub struct FakeConnector {
    shells: BTreeMap<SegmentId, Arc<FakeShell>>,
    sqls: BTreeMap<SegmentId, Arc<FakeSql>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the fakes for one segment.
    pub fn with_instance(mut self, segment_id: SegmentId, shell: FakeShell, sql: FakeSql) -> Self {
        self.shells.insert(segment_id, Arc::new(shell));
        self.sqls.insert(segment_id, Arc::new(sql));
        self
    }

    /// The registered shell for a segment, for assertions.
    pub fn shell_for(&self, segment_id: SegmentId) -> Arc<FakeShell> {
        self.shells[&segment_id].clone()
    }
}

impl InstanceConnector for FakeConnector {
    fn shell(&self, instance: &InstanceDescriptor) -> Arc<dyn InstanceShell> {
        self.shells[&instance.segment_id].clone()
    }

    fn sql(&self, instance: &InstanceDescriptor) -> Arc<dyn SqlRunner> {
        self.sqls[&instance.segment_id].clone()
    }
}

/// A DR instance descriptor for tests.
pub fn test_instance(segment_id: SegmentId) -> InstanceDescriptor {
    InstanceDescriptor {
        segment_id,
        host: format!("dr-host-{segment_id}"),
        port: 6000 + segment_id.unsigned_abs() as u16,
        data_dir: format!("/data/dr/seg{segment_id}"),
        is_local: false,
    }
}

/// A manifest instance entry for tests.
pub fn test_manifest_instance(segment_id: SegmentId, lsn: &str, present: bool) -> ManifestInstance {
    ManifestInstance {
        segment_id,
        host: format!("prim-host-{segment_id}"),
        port: 5000 + segment_id.unsigned_abs() as u16,
        data_dir: format!("/data/prim/seg{segment_id}"),
        restore_lsn: lsn.parse().expect("valid LSN"),
        wal_filename: "000000010000000900000039".into(),
        archive_source_host: format!("prim-host-{segment_id}"),
        archive_source_path: "/archive/000000010000000900000039".into(),
        present,
    }
}

/// A manifest for tests; ready iff every instance is present.
pub fn test_manifest(name: &str, instances: Vec<ManifestInstance>) -> Manifest {
    let ready = !instances.is_empty() && instances.iter().all(|i| i.present);
    Manifest {
        restore_point: name.parse().expect("valid restore point name"),
        created_at_utc: Utc::now(),
        timeline_id: 1,
        ready,
        instances,
        evidence: None,
    }
}

/// Shorthand for parsing an [`Lsn`] in tests.
pub fn lsn(s: &str) -> Lsn {
    s.parse().expect("valid LSN")
}

/// Shorthand for parsing a [`RestorePointName`] in tests.
pub fn rp(s: &str) -> RestorePointName {
    s.parse().expect("valid restore point name")
}
