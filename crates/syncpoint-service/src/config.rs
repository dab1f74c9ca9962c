// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the publisher and consumer services.
//!
//! A single JSON document configures both sides of a deployment; each daemon
//! reads the sections it needs.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use syncpoint_core::{InstanceDescriptor, SegmentId, WalSegmentSize};

use crate::error::{ConfigError, ConfigResult};

/// Connection parameters for the Primary coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryConfig {
    /// Coordinator host.
    pub host: String,
    /// Coordinator port.
    pub port: u16,
    /// Database to connect to.
    pub db: String,
    /// Role to connect as.
    pub user: String,
}

/// Where manifests and the LATEST pointer live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `sync_point_*.json` manifests.
    pub manifest_dir: PathBuf,
    /// Path of the LATEST pointer file.
    pub latest_path: PathBuf,
    /// Template used to fetch one manifest from remote storage.
    ///
    /// Placeholders: `{manifest_path}`, `{manifest_dir}`, `{manifest_file}`.
    /// When unset, manifests are read from the local filesystem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_fetch_command: Option<String>,
    /// Template used to list manifest files in remote storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_list_command: Option<String>,
}

/// Where the WAL archive lives, from the publisher's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Default WAL archive directory on each archive source host.
    pub archive_dir: PathBuf,
}

/// DR-side topology and filesystem locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrConfig {
    /// Directory for durable consumer state (current restore point,
    /// pidfiles).
    pub state_dir: PathBuf,
    /// Directory receipts are written to.
    pub receipts_dir: PathBuf,
    /// Database installation root, used to locate `pg_ctl` and
    /// `pg_controldata`.
    pub gp_home: PathBuf,
    /// The DR instances to drive.
    pub instances: Vec<InstanceDescriptor>,
}

/// Tunable behavior; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Seconds between publisher cycles in daemon mode.
    pub publisher_sleep_secs: u64,
    /// Cap on the publisher's wait for WAL files to appear in the archive.
    pub archive_wait_max_secs: u64,
    /// Interval between archive probing passes.
    pub archive_poll_interval_secs: u64,
    /// Seconds between consumer runs in daemon mode.
    pub consumer_sleep_secs: u64,
    /// Poll interval while waiting for instances to reach the target.
    pub consumer_reach_poll_secs: u64,
    /// Overall cap on the reach wait.
    pub consumer_wait_reach_secs: u64,
    /// WAL segment size in MiB; must be a power of two.
    pub wal_segment_size_mb: u64,
    /// Global archive-verifier template. Placeholders: `{archive_dir}`,
    /// `{wal_filename}`, `{wal_path}`, `{host}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_check_command: Option<String>,
    /// Per-segment archive-verifier overrides.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub wal_check_commands: BTreeMap<SegmentId, String>,
    /// Bounded window scanned at the end of each server log file.
    pub evidence_scan_bytes: u64,
    /// How many of the newest server log files to scan.
    pub evidence_scan_files: usize,
    /// Whether a run may advance state when an instance is down at/past the
    /// target by LSN but without a stop signature in its logs.
    pub allow_best_effort_advance: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        BehaviorConfig {
            publisher_sleep_secs: defaults::PUBLISHER_SLEEP_SECS,
            archive_wait_max_secs: defaults::ARCHIVE_WAIT_MAX_SECS,
            archive_poll_interval_secs: defaults::ARCHIVE_POLL_INTERVAL_SECS,
            consumer_sleep_secs: defaults::CONSUMER_SLEEP_SECS,
            consumer_reach_poll_secs: defaults::CONSUMER_REACH_POLL_SECS,
            consumer_wait_reach_secs: defaults::CONSUMER_WAIT_REACH_SECS,
            wal_segment_size_mb: defaults::WAL_SEGMENT_SIZE_MB,
            wal_check_command: None,
            wal_check_commands: BTreeMap::new(),
            evidence_scan_bytes: defaults::EVIDENCE_SCAN_BYTES,
            evidence_scan_files: defaults::EVIDENCE_SCAN_FILES,
            allow_best_effort_advance: false,
        }
    }
}

/// Configuration defaults.
pub mod defaults {
    /// Seconds between publisher cycles.
    pub const PUBLISHER_SLEEP_SECS: u64 = 10;
    /// Cap on the publisher's archive wait.
    pub const ARCHIVE_WAIT_MAX_SECS: u64 = 30;
    /// Interval between archive probing passes.
    pub const ARCHIVE_POLL_INTERVAL_SECS: u64 = 2;
    /// Seconds between consumer runs.
    pub const CONSUMER_SLEEP_SECS: u64 = 30;
    /// Poll interval inside the reach wait.
    pub const CONSUMER_REACH_POLL_SECS: u64 = 5;
    /// Overall cap on the reach wait.
    pub const CONSUMER_WAIT_REACH_SECS: u64 = 300;
    /// WAL segment size in MiB.
    pub const WAL_SEGMENT_SIZE_MB: u64 = 64;
    /// Bytes scanned at the end of each server log file.
    pub const EVIDENCE_SCAN_BYTES: u64 = 1 << 20;
    /// Newest server log files scanned per instance.
    pub const EVIDENCE_SCAN_FILES: usize = 6;
    /// Parallelism cap for per-instance work.
    pub const WORKER_CAP: usize = 32;
}

/// The full configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Primary coordinator connection.
    pub primary: PrimaryConfig,
    /// Manifest storage.
    pub storage: StorageConfig,
    /// WAL archive location.
    pub archive: ArchiveConfig,
    /// DR topology and state locations.
    pub dr: DrConfig,
    /// Tunables.
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

impl SyncConfig {
    /// Loads and validates a configuration document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let config: SyncConfig =
            serde_json::from_str(&text).map_err(|error| ConfigError::Invalid {
                path: path.display().to_string(),
                message: error.to_string(),
            })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> ConfigResult<()> {
        let invalid = |message: String| ConfigError::Invalid {
            path: path.display().to_string(),
            message,
        };

        WalSegmentSize::from_mebibytes(self.behavior.wal_segment_size_mb)
            .map_err(|error| invalid(error.to_string()))?;

        if self.dr.instances.is_empty() {
            return Err(invalid("dr.instances must not be empty".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for instance in &self.dr.instances {
            if !seen.insert(instance.segment_id) {
                return Err(invalid(format!(
                    "dr.instances contains segment {} twice",
                    instance.segment_id
                )));
            }
        }
        Ok(())
    }

    /// The validated WAL segment size.
    pub fn wal_segment_size(&self) -> WalSegmentSize {
        WalSegmentSize::from_mebibytes(self.behavior.wal_segment_size_mb)
            .expect("validated at load time")
    }

    /// Path of the durable consumer state file.
    pub fn state_file(&self) -> PathBuf {
        self.dr.state_dir.join("current_restore_point.txt")
    }

    /// Path of the pidfile for a daemon role (`primary` or `dr`).
    pub fn pid_file(&self, role: &str) -> PathBuf {
        self.dr.state_dir.join(format!("{role}.pid"))
    }

    /// The archive-verifier template for a segment, if any is configured.
    ///
    /// Per-segment overrides win over the global template.
    pub fn wal_check_template(&self, segment_id: SegmentId) -> Option<&str> {
        self.behavior
            .wal_check_commands
            .get(&segment_id)
            .or(self.behavior.wal_check_command.as_ref())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "primary": { "host": "prim", "port": 5432, "db": "postgres", "user": "gpadmin" },
            "storage": {
                "manifest_dir": "/var/lib/syncpoint/manifests",
                "latest_path": "/var/lib/syncpoint/LATEST.json"
            },
            "archive": { "archive_dir": "/archive" },
            "dr": {
                "state_dir": "/var/lib/syncpoint/state",
                "receipts_dir": "/var/lib/syncpoint/receipts",
                "gp_home": "/usr/local/greenplum-db",
                "instances": [
                    { "segment_id": -1, "host": "dr-cdw", "port": 5432,
                      "data_dir": "/data/coordinator", "is_local": true },
                    { "segment_id": 0, "host": "dr-sdw1", "port": 6000,
                      "data_dir": "/data/primary0" }
                ]
            }
        })
    }

    fn write_config(value: &serde_json::Value) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_vec_pretty(value).unwrap()).unwrap();
        file
    }

    #[test]
    fn loads_with_defaults() {
        let file = write_config(&minimal_json());
        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.behavior.publisher_sleep_secs, 10);
        assert_eq!(config.behavior.consumer_wait_reach_secs, 300);
        assert_eq!(config.wal_segment_size().as_bytes(), 64 << 20);
        assert!(!config.behavior.allow_best_effort_advance);
        assert_eq!(
            config.state_file(),
            PathBuf::from("/var/lib/syncpoint/state/current_restore_point.txt")
        );
    }

    #[test]
    fn rejects_non_power_of_two_segment_size() {
        let mut value = minimal_json();
        value["behavior"] = serde_json::json!({ "wal_segment_size_mb": 48 });
        let file = write_config(&value);
        assert!(matches!(
            SyncConfig::load(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_segment_ids() {
        let mut value = minimal_json();
        value["dr"]["instances"][1]["segment_id"] = serde_json::json!(-1);
        let file = write_config(&value);
        assert!(matches!(
            SyncConfig::load(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn per_segment_verifier_overrides_global() {
        let mut value = minimal_json();
        value["behavior"] = serde_json::json!({
            "wal_check_command": "ssh {host} test -f {wal_path} && echo ok",
            "wal_check_commands": { "0": "mc stat archive/{wal_filename}" }
        });
        let file = write_config(&value);
        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(
            config.wal_check_template(0),
            Some("mc stat archive/{wal_filename}")
        );
        assert_eq!(
            config.wal_check_template(-1),
            Some("ssh {host} test -f {wal_path} && echo ok")
        );
    }
}
