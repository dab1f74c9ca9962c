// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Pidfile management for the two daemons.
//!
//! Pidfiles exist only for "is a daemon alive" checks and a clean stop.
//! Stale files are tolerated: liveness is probed with a null signal before
//! anything is sent.

use std::path::{Path, PathBuf};

use nix::{errno::Errno, sys::signal, unistd::Pid};

use crate::error::{ServiceError, ServiceResult};

/// Observed state of a daemon according to its pidfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidStatus {
    /// The pidfile names a live process.
    Running(i32),
    /// The pidfile exists but its process is gone.
    Stale(i32),
    /// No pidfile.
    Stopped,
}

fn pid_is_alive(pid: i32) -> bool {
    matches!(
        signal::kill(Pid::from_raw(pid), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

/// Reads a pidfile; `None` when missing or unparsable.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// The observed status for a role's pidfile.
pub fn pid_status(path: &Path) -> PidStatus {
    match read_pid(path) {
        Some(pid) if pid_is_alive(pid) => PidStatus::Running(pid),
        Some(pid) => PidStatus::Stale(pid),
        None => PidStatus::Stopped,
    }
}

/// Writes this process's pid, refusing to clobber a live daemon. A stale
/// pidfile is silently replaced.
pub fn write_pid(path: &Path, role: &str) -> ServiceResult<PidFileGuard> {
    if let Some(existing) = read_pid(path) {
        if pid_is_alive(existing) {
            return Err(ServiceError::AlreadyRunning {
                role: role.to_owned(),
                pid: existing,
            });
        }
        tracing::info!(pid = existing, "replacing stale pidfile");
    }
    let pid = std::process::id() as i32;
    crate::utils::atomic_write_text(path, &format!("{pid}\n")).map_err(|source| {
        ServiceError::Io {
            path: path.display().to_string(),
            source,
        }
    })?;
    Ok(PidFileGuard {
        path: path.to_path_buf(),
        pid,
    })
}

/// Removes the pidfile on drop, but only if it still belongs to us.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
    pid: i32,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if read_pid(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Sends SIGTERM to the daemon named by the pidfile. Cleans up a stale file
/// instead of signalling.
pub fn stop_daemon(path: &Path, role: &str) -> ServiceResult<PidStatus> {
    match pid_status(path) {
        PidStatus::Running(pid) => {
            signal::kill(Pid::from_raw(pid), signal::Signal::SIGTERM)
                .map_err(|errno| ServiceError::Signal { pid, errno })?;
            tracing::info!(role, pid, "sent SIGTERM");
            Ok(PidStatus::Running(pid))
        }
        PidStatus::Stale(pid) => {
            let _ = std::fs::remove_file(path);
            tracing::info!(role, pid, "removed stale pidfile");
            Ok(PidStatus::Stale(pid))
        }
        PidStatus::Stopped => Ok(PidStatus::Stopped),
    }
}
