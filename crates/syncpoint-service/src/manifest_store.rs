// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Manifest storage: local filesystem by default, templated subprocess
//! commands for remote stores.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use syncpoint_core::{LatestPointer, Manifest, RestorePointName};

use crate::{
    command::{run_bash, CommandTemplate},
    config::StorageConfig,
    error::{StoreError, StoreResult},
    utils::atomic_write_json,
};

/// Read access to published manifests.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Lists known restore points, newest first.
    async fn list(&self) -> StoreResult<Vec<RestorePointName>>;

    /// Fetches one manifest; `None` when it does not exist.
    async fn get(&self, name: &RestorePointName) -> StoreResult<Option<Manifest>>;

    /// Reads the LATEST pointer; `None` when nothing was published yet.
    async fn latest(&self) -> StoreResult<Option<LatestPointer>>;
}

/// Picks the manifest source matching the configuration: templated
/// subprocess when fetch/list commands are configured, local filesystem
/// otherwise.
pub fn manifest_source(storage: &StorageConfig) -> Box<dyn ManifestSource> {
    match (&storage.manifest_fetch_command, &storage.manifest_list_command) {
        (Some(fetch), Some(list)) => Box::new(TemplateManifestSource::new(
            fetch,
            list,
            &storage.manifest_dir,
            &storage.latest_path,
        )),
        _ => Box::new(LocalManifestStore::new(
            &storage.manifest_dir,
            &storage.latest_path,
        )),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Manifest store on the local filesystem.
///
/// This is also the publisher's write side: writes are atomic (temp file,
/// then rename), and the LATEST pointer is only replaced after the manifest
/// it names is durable.
#[derive(Debug, Clone)]
pub struct LocalManifestStore {
    manifest_dir: PathBuf,
    latest_path: PathBuf,
}

impl LocalManifestStore {
    /// Creates a store rooted at the given locations.
    pub fn new(manifest_dir: impl Into<PathBuf>, latest_path: impl Into<PathBuf>) -> Self {
        LocalManifestStore {
            manifest_dir: manifest_dir.into(),
            latest_path: latest_path.into(),
        }
    }

    /// The storage path of a manifest.
    pub fn manifest_path(&self, name: &RestorePointName) -> PathBuf {
        self.manifest_dir.join(name.manifest_file_name())
    }

    /// Atomically writes (or replaces) a manifest.
    pub fn put(&self, manifest: &Manifest) -> StoreResult<PathBuf> {
        let path = self.manifest_path(&manifest.restore_point);
        atomic_write_json(&path, manifest).map_err(|source| io_error(&path, source))?;
        Ok(path)
    }

    /// Atomically replaces the LATEST pointer. Callers must only do this
    /// after the named manifest is durable.
    pub fn update_latest(&self, manifest: &Manifest, path: &Path) -> StoreResult<()> {
        let pointer = LatestPointer {
            restore_point: manifest.restore_point.clone(),
            path: path.display().to_string(),
            updated_at_utc: Utc::now(),
        };
        atomic_write_json(&self.latest_path, &pointer)
            .map_err(|source| io_error(&self.latest_path, source))
    }
}

#[async_trait]
impl ManifestSource for LocalManifestStore {
    async fn list(&self) -> StoreResult<Vec<RestorePointName>> {
        let entries = match std::fs::read_dir(&self.manifest_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(io_error(&self.manifest_dir, error)),
        };

        let mut names: Vec<RestorePointName> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|file| file.strip_suffix(".json"))
                    .and_then(|stem| stem.parse().ok())
            })
            .collect();
        names.sort();
        names.reverse();
        Ok(names)
    }

    async fn get(&self, name: &RestorePointName) -> StoreResult<Option<Manifest>> {
        let path = self.manifest_path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(&path, error)),
        };
        let manifest = serde_json::from_str(&text).map_err(|error| StoreError::Malformed {
            name: name.to_string(),
            message: error.to_string(),
        })?;
        Ok(Some(manifest))
    }

    async fn latest(&self) -> StoreResult<Option<LatestPointer>> {
        let text = match std::fs::read_to_string(&self.latest_path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(io_error(&self.latest_path, error)),
        };
        let pointer = serde_json::from_str(&text).map_err(|error| StoreError::Malformed {
            name: "LATEST".into(),
            message: error.to_string(),
        })?;
        Ok(Some(pointer))
    }
}

/// Manifest source backed by fetch/list command templates, for archives that
/// live behind an object-store CLI or a remote shell.
///
/// Placeholders: `{manifest_dir}`, `{manifest_path}`, `{manifest_file}`.
#[derive(Debug, Clone)]
pub struct TemplateManifestSource {
    fetch: CommandTemplate,
    list: CommandTemplate,
    manifest_dir: String,
    latest_path: String,
}

impl TemplateManifestSource {
    /// Creates a source from the configured templates.
    pub fn new(
        fetch: &str,
        list: &str,
        manifest_dir: &Path,
        latest_path: &Path,
    ) -> Self {
        TemplateManifestSource {
            fetch: CommandTemplate::new(fetch),
            list: CommandTemplate::new(list),
            manifest_dir: manifest_dir.display().to_string(),
            latest_path: latest_path.display().to_string(),
        }
    }

    async fn fetch_text(&self, path: &str, file: &str) -> StoreResult<Option<String>> {
        let command = self.fetch.render(&[
            ("manifest_path", path),
            ("manifest_dir", &self.manifest_dir),
            ("manifest_file", file),
        ]);
        let output = run_bash(&command).await?;
        if !output.success() {
            tracing::debug!(command, stderr = %output.stderr, "manifest fetch returned non-zero");
            return Ok(None);
        }
        if output.stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }
}

#[async_trait]
impl ManifestSource for TemplateManifestSource {
    async fn list(&self) -> StoreResult<Vec<RestorePointName>> {
        let command = self
            .list
            .render(&[("manifest_dir", self.manifest_dir.as_str())]);
        let output = run_bash(&command).await?.into_checked("manifest store")?;

        let mut names: Vec<RestorePointName> = output
            .lines()
            .filter_map(|line| {
                let file = line.trim().rsplit('/').next()?;
                file.strip_suffix(".json")?.parse().ok()
            })
            .collect();
        names.sort();
        names.reverse();
        Ok(names)
    }

    async fn get(&self, name: &RestorePointName) -> StoreResult<Option<Manifest>> {
        let file = name.manifest_file_name();
        let path = format!("{}/{}", self.manifest_dir, file);
        let Some(text) = self.fetch_text(&path, &file).await? else {
            return Ok(None);
        };
        let manifest = serde_json::from_str(&text).map_err(|error| StoreError::Malformed {
            name: name.to_string(),
            message: error.to_string(),
        })?;
        Ok(Some(manifest))
    }

    async fn latest(&self) -> StoreResult<Option<LatestPointer>> {
        let Some(text) = self.fetch_text(&self.latest_path, "LATEST.json").await? else {
            return Ok(None);
        };
        let pointer = serde_json::from_str(&text).map_err(|error| StoreError::Malformed {
            name: "LATEST".into(),
            message: error.to_string(),
        })?;
        Ok(Some(pointer))
    }
}
