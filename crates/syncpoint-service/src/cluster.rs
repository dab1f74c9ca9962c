// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Access to individual DR instances.
//!
//! The consumer needs two channels to every instance: a shell on the host
//! that owns the data directory, and utility-mode SQL while the instance is
//! up. Both are behind [`InstanceConnector`] so the orchestrator can be
//! driven against fakes.

use std::sync::Arc;

use syncpoint_core::InstanceDescriptor;

use crate::{
    shell::{InstanceShell, LocalShell, SshShell},
    sql::{PsqlRunner, SqlRunner},
};

/// Produces the shell and SQL channels for a DR instance.
pub trait InstanceConnector: Send + Sync {
    /// A shell on the host owning the instance's data directory.
    fn shell(&self, instance: &InstanceDescriptor) -> Arc<dyn InstanceShell>;

    /// Utility-mode SQL against the instance.
    fn sql(&self, instance: &InstanceDescriptor) -> Arc<dyn SqlRunner>;
}

/// The production connector: local bash or ssh for the shell, `psql` in
/// utility mode for SQL.
#[derive(Debug, Clone)]
pub struct ClusterConnector {
    user: String,
    db: String,
}

impl ClusterConnector {
    /// Creates a connector authenticating SQL as `user` against `db`.
    pub fn new(user: impl Into<String>, db: impl Into<String>) -> Self {
        ClusterConnector {
            user: user.into(),
            db: db.into(),
        }
    }
}

impl InstanceConnector for ClusterConnector {
    fn shell(&self, instance: &InstanceDescriptor) -> Arc<dyn InstanceShell> {
        if instance.is_local {
            Arc::new(LocalShell)
        } else {
            Arc::new(SshShell::new(instance.host.clone()))
        }
    }

    fn sql(&self, instance: &InstanceDescriptor) -> Arc<dyn SqlRunner> {
        Arc::new(PsqlRunner::utility(
            &instance.host,
            instance.port,
            &self.user,
            &self.db,
        ))
    }
}
