// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Durable receipts: one audit record per consumer attempt.

use std::path::{Path, PathBuf};

use syncpoint_core::{Receipt, RestorePointName};

use crate::utils::atomic_write_json;

/// Writes receipts into the receipts directory, never overwriting one.
#[derive(Debug, Clone)]
pub struct ReceiptWriter {
    receipts_dir: PathBuf,
}

impl ReceiptWriter {
    /// Creates a writer rooted at `receipts_dir`.
    pub fn new(receipts_dir: impl Into<PathBuf>) -> Self {
        ReceiptWriter {
            receipts_dir: receipts_dir.into(),
        }
    }

    /// Atomically writes a receipt. The first attempt for a target gets
    /// `<target>.receipt.json`; repeats get `<target>.<attempt>.receipt.json`.
    pub fn write(&self, receipt: &Receipt) -> std::io::Result<PathBuf> {
        let path = self.free_path(&receipt.target_restore_point)?;
        atomic_write_json(&path, receipt)?;
        tracing::info!(path = %path.display(), status = ?receipt.status, "receipt written");
        Ok(path)
    }

    fn free_path(&self, target: &RestorePointName) -> std::io::Result<PathBuf> {
        let first = self.receipts_dir.join(Receipt::file_name(target));
        if !first.exists() {
            return Ok(first);
        }
        for attempt in 1..u32::MAX {
            let candidate = self
                .receipts_dir
                .join(Receipt::attempt_file_name(target, attempt));
            if !candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(std::io::Error::other("receipt attempt space exhausted"))
    }
}

/// Lists receipt files, newest first by modification time.
pub fn list_receipts(receipts_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(receipts_dir) else {
        return Vec::new();
    };
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(".receipt.json"))
        })
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));
    files.into_iter().map(|(_, path)| path).collect()
}

/// Reads one receipt, tolerating malformed files.
pub fn read_receipt(path: &Path) -> Option<Receipt> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}
