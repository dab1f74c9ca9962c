// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the syncpoint services.

use syncpoint_core::{RestorePointName, SegmentId};

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file '{path}': {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration in '{path}': {message}")]
    Invalid { path: String, message: String },
}

/// Result alias for shell command execution.
pub type ShellResult<T> = Result<T, ShellError>;

#[derive(thiserror::Error, Debug)]
pub enum ShellError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("command on {host} exited with code {code}: {stderr}")]
    NonZeroExit {
        host: String,
        code: i32,
        stderr: String,
    },

    #[error("command on {host} was terminated by a signal")]
    Signalled { host: String },
}

/// Result alias for SQL execution.
pub type SqlResult<T> = Result<T, SqlError>;

#[derive(thiserror::Error, Debug)]
pub enum SqlError {
    #[error("database at {host}:{port} is unreachable: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    #[error("query against {host}:{port} failed: {message}")]
    Query {
        host: String,
        port: u16,
        message: String,
    },

    #[error("unexpected result shape: {0}")]
    Shape(String),
}

impl SqlError {
    /// True iff the failure means the server was not reachable at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, SqlError::Connect { .. })
    }
}

/// Result alias for manifest storage.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("failed to access '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed manifest '{name}': {message}")]
    Malformed { name: String, message: String },

    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Result alias for the publisher.
pub type PublishResult<T> = Result<T, PublishError>;

#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("restore point '{0}' already exists on the cluster")]
    DuplicateRestorePoint(RestorePointName),

    #[error("coordinator returned segment {0} more than once")]
    InconsistentTopology(SegmentId),

    #[error("restore-point call returned no rows")]
    EmptyRestorePoint,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for target selection.
pub type SelectResult<T> = Result<T, SelectError>;

#[derive(thiserror::Error, Debug)]
pub enum SelectError {
    #[error("target manifest '{0}' does not exist or is not ready")]
    TargetUnavailable(RestorePointName),

    #[error("target '{target}' violates recovery floors: {reasons:?}")]
    TargetBelowFloor {
        target: RestorePointName,
        reasons: Vec<String>,
    },

    #[error("DR instance for segment {segment_id} is missing from manifest '{target}'")]
    TopologyMismatch {
        segment_id: SegmentId,
        target: RestorePointName,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for the recovery applier.
pub type ApplyResult<T> = Result<T, ApplyError>;

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error("recovery configuration for segment {segment_id} could not be rewritten: {message}")]
    Conf {
        segment_id: SegmentId,
        message: String,
    },
}

/// Result alias for a consumer run.
pub type ConsumeResult<T> = Result<T, ConsumeError>;

#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error(transparent)]
    Select(#[from] SelectError),

    #[error("failed to access state file '{path}': {source}")]
    State {
        path: String,
        source: std::io::Error,
    },

    #[error("receipt write failed: {0}")]
    Receipt(String),
}

/// Result alias for pidfile management.
pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("{role} daemon already running (pid={pid})")]
    AlreadyRunning { role: String, pid: i32 },

    #[error("failed to access pidfile '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {errno}")]
    Signal { pid: i32, errno: nix::errno::Errno },
}
