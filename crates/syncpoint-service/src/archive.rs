// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Archive proving: is each instance's WAL file durable in the archive?

use async_trait::async_trait;
use syncpoint_core::ManifestInstance;

use crate::{
    command::{run_bash, CommandTemplate},
    config::{defaults::WORKER_CAP, SyncConfig},
    utils::parallel_map,
};

/// Checks whether one instance's WAL file is present in the archive.
///
/// Probes never fail: a verifier process that errors out is logged and
/// reported as absent, so one broken probe cannot poison the others.
#[async_trait]
pub trait ArchiveVerifier: Send + Sync {
    /// Returns true iff the WAL file is present.
    async fn probe(&self, instance: &ManifestInstance) -> bool;
}

/// Built-in verifier for archives on the local filesystem.
#[derive(Debug, Default)]
pub struct LocalFsVerifier;

#[async_trait]
impl ArchiveVerifier for LocalFsVerifier {
    async fn probe(&self, instance: &ManifestInstance) -> bool {
        tokio::fs::try_exists(&instance.archive_source_path)
            .await
            .unwrap_or(false)
    }
}

/// Verifier driven by a configured command template.
///
/// Exit code 0 with non-empty stdout means present; anything else means
/// absent.
#[derive(Debug)]
pub struct TemplateVerifier {
    template: CommandTemplate,
    archive_dir: String,
}

impl TemplateVerifier {
    /// Creates a verifier from a template string.
    pub fn new(template: &str, archive_dir: &str) -> Self {
        TemplateVerifier {
            template: CommandTemplate::new(template),
            archive_dir: archive_dir.to_owned(),
        }
    }
}

#[async_trait]
impl ArchiveVerifier for TemplateVerifier {
    async fn probe(&self, instance: &ManifestInstance) -> bool {
        let command = self.template.render(&[
            ("archive_dir", self.archive_dir.as_str()),
            ("wal_filename", instance.wal_filename.as_str()),
            ("wal_path", instance.archive_source_path.as_str()),
            ("host", instance.archive_source_host.as_str()),
        ]);
        match run_bash(&command).await {
            Ok(output) if output.success() && !output.stdout.is_empty() => true,
            Ok(output) => {
                tracing::debug!(
                    segment_id = instance.segment_id,
                    code = ?output.code,
                    stderr = %output.stderr,
                    "archive verifier reported absent"
                );
                false
            }
            Err(error) => {
                tracing::warn!(
                    segment_id = instance.segment_id,
                    %error,
                    "archive verifier failed to run; treating file as absent"
                );
                false
            }
        }
    }
}

fn verifier_for(config: &SyncConfig, instance: &ManifestInstance) -> Box<dyn ArchiveVerifier> {
    match config.wal_check_template(instance.segment_id) {
        Some(template) => Box::new(TemplateVerifier::new(
            template,
            &config.archive.archive_dir.display().to_string(),
        )),
        None => Box::new(LocalFsVerifier),
    }
}

/// Runs one probing pass over every instance, in parallel (capped at 32
/// workers), and returns the instances with refreshed `present` flags.
pub async fn prove_instances(
    config: &SyncConfig,
    instances: Vec<ManifestInstance>,
) -> Vec<ManifestInstance> {
    let work: Vec<(Box<dyn ArchiveVerifier>, ManifestInstance)> = instances
        .into_iter()
        .map(|instance| (verifier_for(config, &instance), instance))
        .collect();

    parallel_map(work, WORKER_CAP, |(verifier, mut instance)| async move {
        instance.present = verifier.probe(&instance).await;
        tracing::debug!(
            segment_id = instance.segment_id,
            wal = %instance.wal_filename,
            present = instance.present,
            "archive probe"
        );
        instance
    })
    .await
}
