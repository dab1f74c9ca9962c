// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Execution of scripts on the host owning an instance's data directory.
//!
//! Every mutation of an instance (config rewrite, marker files, process
//! control, log scans) goes through [`InstanceShell`], so the same code
//! drives local and ssh-reachable instances.

use async_trait::async_trait;

use crate::{
    command::{run_bash, run_command, sh_quote, CommandOutput},
    error::ShellResult,
};

/// Runs shell scripts on the host that owns an instance.
#[async_trait]
pub trait InstanceShell: Send + Sync {
    /// The host this shell executes on, for diagnostics.
    fn host(&self) -> &str;

    /// Runs a script and captures its output.
    async fn run(&self, script: &str) -> ShellResult<CommandOutput>;
}

/// Shell for instances co-located with the consumer daemon.
#[derive(Debug, Default)]
pub struct LocalShell;

#[async_trait]
impl InstanceShell for LocalShell {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn run(&self, script: &str) -> ShellResult<CommandOutput> {
        run_bash(script).await
    }
}

/// Shell for instances reached over ssh.
#[derive(Debug)]
pub struct SshShell {
    host: String,
}

impl SshShell {
    /// Creates a shell for the given host.
    pub fn new(host: impl Into<String>) -> Self {
        SshShell { host: host.into() }
    }
}

#[async_trait]
impl InstanceShell for SshShell {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> ShellResult<CommandOutput> {
        let remote = format!("bash --noprofile --norc -c {}", sh_quote(script));
        run_command("ssh", &[self.host.as_str(), remote.as_str()], &[]).await
    }
}

/// Reads a file, returning `None` when it does not exist.
pub async fn read_file(shell: &dyn InstanceShell, path: &str) -> ShellResult<Option<String>> {
    let script = format!(
        "if [ -f {p} ]; then cat {p}; else echo __ABSENT__; fi",
        p = sh_quote(path)
    );
    let output = shell.run(&script).await?.into_checked(shell.host())?;
    if output == "__ABSENT__" {
        Ok(None)
    } else {
        Ok(Some(output))
    }
}

/// Writes a file atomically: content to a sibling temp file, then rename.
pub async fn write_file_atomic(
    shell: &dyn InstanceShell,
    path: &str,
    content: &str,
) -> ShellResult<()> {
    let script = format!(
        "set -eu; tmp={tmp}; printf '%s' {content} > \"$tmp\"; mv -f \"$tmp\" {path}",
        tmp = sh_quote(&format!("{path}.tmp")),
        content = sh_quote(content),
        path = sh_quote(path),
    );
    shell.run(&script).await?.into_checked(shell.host())?;
    Ok(())
}

/// Creates an empty marker file if it does not already exist.
pub async fn ensure_file(shell: &dyn InstanceShell, path: &str) -> ShellResult<()> {
    let script = format!("test -f {p} || touch {p}", p = sh_quote(path));
    shell.run(&script).await?.into_checked(shell.host())?;
    Ok(())
}

/// Checks whether a file exists.
pub async fn file_exists(shell: &dyn InstanceShell, path: &str) -> ShellResult<bool> {
    let script = format!("test -f {} && echo yes || echo no", sh_quote(path));
    let output = shell.run(&script).await?.into_checked(shell.host())?;
    Ok(output == "yes")
}
