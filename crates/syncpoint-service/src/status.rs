// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator-facing status: where is LATEST, where is the DR side, and how
//! did the last runs go. Rendered as a table, JSON, or Prometheus text.

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use serde_json::json;
use syncpoint_core::{Receipt, ReceiptStatus, RestorePointName};

use crate::{
    config::SyncConfig,
    consumer::read_current_restore_point,
    manifest_store::manifest_source,
    receipts::{list_receipts, read_receipt},
};

/// Which daemon's view to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// Publisher view.
    Primary,
    /// Consumer view.
    Dr,
}

impl StatusMode {
    fn as_str(self) -> &'static str {
        match self {
            StatusMode::Primary => "primary",
            StatusMode::Dr => "dr",
        }
    }
}

/// Output format for the status subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusFormat {
    /// Aligned two-column table.
    Table,
    /// JSON document.
    Json,
    /// Prometheus text exposition.
    Prometheus,
}

/// A point-in-time view of the deployment.
#[derive(Debug)]
pub struct Snapshot {
    mode: StatusMode,
    latest_restore_point: Option<RestorePointName>,
    latest_ready: Option<bool>,
    current_restore_point: Option<RestorePointName>,
    target_restore_point: Option<RestorePointName>,
    last_receipt_file: Option<String>,
    last_receipt: Option<Receipt>,
    notes: Vec<String>,
}

/// Collects a snapshot plus the newest `history_n` receipts.
pub async fn collect(
    config: &SyncConfig,
    mode: StatusMode,
    history_n: usize,
) -> (Snapshot, Vec<(String, Receipt)>) {
    let mut notes = Vec::new();

    let source = manifest_source(&config.storage);
    let (latest_restore_point, latest_ready) = match source.latest().await {
        Ok(Some(pointer)) => {
            let ready = match source.get(&pointer.restore_point).await {
                Ok(Some(manifest)) => Some(manifest.ready),
                _ => {
                    notes.push("LATEST names a manifest that cannot be read".into());
                    None
                }
            };
            (Some(pointer.restore_point), ready)
        }
        Ok(None) => {
            notes.push("no LATEST pointer published yet".into());
            (None, None)
        }
        Err(error) => {
            notes.push(format!("LATEST not readable: {error}"));
            (None, None)
        }
    };

    let current_restore_point = match mode {
        StatusMode::Dr => {
            let current = read_current_restore_point(&config.state_file());
            if current.is_none() {
                notes.push("current_restore_point.txt missing or empty".into());
            }
            current
        }
        StatusMode::Primary => None,
    };

    // The consumer converges towards LATEST unless an operator intervenes.
    let target_restore_point = latest_restore_point.clone();

    let mut history = Vec::new();
    for path in list_receipts(&config.dr.receipts_dir).into_iter().take(history_n.max(1)) {
        if let Some(receipt) = read_receipt(&path) {
            let file = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_owned();
            history.push((file, receipt));
        }
    }
    if history.is_empty() && mode == StatusMode::Dr {
        notes.push("no receipts found".into());
    }

    // Prefer the receipt for the current target, else the newest.
    let preferred = target_restore_point
        .as_ref()
        .and_then(|target| {
            history
                .iter()
                .find(|(_, receipt)| &receipt.target_restore_point == target)
        })
        .or_else(|| history.first());
    let (last_receipt_file, last_receipt) = match preferred {
        Some((file, receipt)) => (Some(file.clone()), Some(receipt.clone())),
        None => (None, None),
    };

    (
        Snapshot {
            mode,
            latest_restore_point,
            latest_ready,
            current_restore_point,
            target_restore_point,
            last_receipt_file,
            last_receipt,
            notes,
        },
        history,
    )
}

fn status_code(status: Option<ReceiptStatus>) -> i64 {
    match status {
        Some(status) if status.advances_state() => 1,
        Some(_) => -1,
        None => 0,
    }
}

fn display_or_dash<T: std::fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".into())
}

/// Renders the snapshot in the requested format.
pub fn render(
    snapshot: &Snapshot,
    history: &[(String, Receipt)],
    format: StatusFormat,
    include_history: bool,
) -> String {
    match format {
        StatusFormat::Table => render_table(snapshot, history, include_history),
        StatusFormat::Json => render_json(snapshot, history, include_history),
        StatusFormat::Prometheus => render_prometheus(snapshot, history),
    }
}

fn render_table(
    snapshot: &Snapshot,
    history: &[(String, Receipt)],
    include_history: bool,
) -> String {
    let rows = [
        ("mode", snapshot.mode.as_str().to_owned()),
        (
            "latest.restore_point",
            display_or_dash(&snapshot.latest_restore_point),
        ),
        ("latest.ready", display_or_dash(&snapshot.latest_ready)),
        (
            "current.restore_point",
            display_or_dash(&snapshot.current_restore_point),
        ),
        (
            "target.restore_point",
            display_or_dash(&snapshot.target_restore_point),
        ),
        (
            "last.receipt.file",
            display_or_dash(&snapshot.last_receipt_file),
        ),
        (
            "last.receipt.status",
            snapshot
                .last_receipt
                .as_ref()
                .map(|receipt| format!("{:?}", receipt.status))
                .unwrap_or_else(|| "-".into()),
        ),
        (
            "last.receipt.checked_at_utc",
            snapshot
                .last_receipt
                .as_ref()
                .map(|receipt| receipt.checked_at_utc.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        ),
        (
            "last.receipt.waited_secs",
            snapshot
                .last_receipt
                .as_ref()
                .map(|receipt| receipt.waited_secs.to_string())
                .unwrap_or_else(|| "-".into()),
        ),
    ];

    let width = rows.iter().map(|(field, _)| field.len()).max().unwrap_or(0);
    let mut out = String::new();
    out.push_str(&format!("{:width$}  value\n", "field"));
    out.push_str(&format!("{}  {}\n", "-".repeat(width), "-".repeat(5)));
    for (field, value) in rows {
        out.push_str(&format!("{field:width$}  {value}\n"));
    }

    if !snapshot.notes.is_empty() {
        out.push_str("\nNOTES:\n");
        for note in &snapshot.notes {
            out.push_str(&format!("- {note}\n"));
        }
    }

    if include_history {
        out.push_str("\nRECENT RECEIPTS:\n");
        if history.is_empty() {
            out.push_str("(none)\n");
        }
        for (file, receipt) in history {
            out.push_str(&format!(
                "{}  {:?}  {} -> {}  {}\n",
                receipt.checked_at_utc.to_rfc3339(),
                receipt.status,
                display_or_dash(&receipt.current_restore_point),
                receipt.target_restore_point,
                file,
            ));
        }
    }
    out
}

fn render_json(
    snapshot: &Snapshot,
    history: &[(String, Receipt)],
    include_history: bool,
) -> String {
    let mut doc = json!({
        "mode": snapshot.mode.as_str(),
        "latest": {
            "restore_point": snapshot.latest_restore_point,
            "ready": snapshot.latest_ready,
        },
        "state": {
            "current_restore_point": snapshot.current_restore_point,
            "target_restore_point": snapshot.target_restore_point,
        },
        "last_receipt": {
            "file": snapshot.last_receipt_file,
            "status": snapshot.last_receipt.as_ref().map(|r| r.status),
            "checked_at_utc": snapshot.last_receipt.as_ref().map(|r| r.checked_at_utc),
            "waited_secs": snapshot.last_receipt.as_ref().map(|r| r.waited_secs),
        },
        "notes": snapshot.notes,
    });
    if include_history {
        doc["recent_receipts"] = json!(history
            .iter()
            .map(|(file, receipt)| json!({ "file": file, "receipt": receipt }))
            .collect::<Vec<_>>());
    }
    serde_json::to_string_pretty(&doc).unwrap_or_default() + "\n"
}

fn render_prometheus(snapshot: &Snapshot, history: &[(String, Receipt)]) -> String {
    let registry = Registry::new();
    let mode = snapshot.mode.as_str();

    let status = IntGaugeVec::new(
        Opts::new("syncpoint_status_code", "1=ok, 0=unknown, -1=bad"),
        &["mode", "status"],
    )
    .expect("valid metric");
    let latest_ready = IntGaugeVec::new(
        Opts::new(
            "syncpoint_latest_ready",
            "LATEST manifest readiness (1=true, 0=false, -1=unknown)",
        ),
        &["mode"],
    )
    .expect("valid metric");
    let drift = IntGaugeVec::new(
        Opts::new(
            "syncpoint_drift",
            "whether the current restore point differs from the target (dr only)",
        ),
        &["mode"],
    )
    .expect("valid metric");
    let waited = IntGaugeVec::new(
        Opts::new(
            "syncpoint_last_waited_seconds",
            "waited_secs from the most recent receipt",
        ),
        &["mode"],
    )
    .expect("valid metric");
    let recent = IntGaugeVec::new(
        Opts::new(
            "syncpoint_receipts_recent_count",
            "recent receipts by outcome kind",
        ),
        &["mode", "kind"],
    )
    .expect("valid metric");
    for metric in [&status, &latest_ready, &drift, &waited, &recent] {
        registry
            .register(Box::new(metric.clone()))
            .expect("metrics register once");
    }

    let last_status = snapshot.last_receipt.as_ref().map(|r| r.status);
    let status_label = last_status
        .map(|s| serde_json::to_string(&s).unwrap_or_default().replace('"', ""))
        .unwrap_or_else(|| "none".into());
    status
        .with_label_values(&[mode, &status_label])
        .set(status_code(last_status));

    latest_ready.with_label_values(&[mode]).set(match snapshot.latest_ready {
        Some(true) => 1,
        Some(false) => 0,
        None => -1,
    });

    let drifting = matches!(
        (&snapshot.current_restore_point, &snapshot.target_restore_point),
        (Some(current), Some(target)) if current != target
    );
    drift.with_label_values(&[mode]).set(drifting as i64);

    if let Some(receipt) = &snapshot.last_receipt {
        waited
            .with_label_values(&[mode])
            .set(receipt.waited_secs as i64);
    }

    let (mut ok, mut timeout, mut other) = (0, 0, 0);
    for (_, receipt) in history {
        match receipt.status {
            status if status.advances_state() => ok += 1,
            ReceiptStatus::Timeout => timeout += 1,
            _ => other += 1,
        }
    }
    recent.with_label_values(&[mode, "ok"]).set(ok);
    recent.with_label_values(&[mode, "timeout"]).set(timeout);
    recent.with_label_values(&[mode, "other"]).set(other);

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .expect("text encoding succeeds");
    String::from_utf8(buffer).expect("prometheus text is utf-8")
}
