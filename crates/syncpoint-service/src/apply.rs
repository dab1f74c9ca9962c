// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Recovery configuration for one DR instance.
//!
//! The rewrite is line-oriented and key-scoped: unrelated lines, comments,
//! and quoting survive byte-for-byte. The whole file is installed with a
//! sibling temp file and a rename.

use syncpoint_core::{InstanceDescriptor, Lsn};

use crate::{
    error::{ApplyError, ApplyResult},
    shell::{ensure_file, read_file, write_file_atomic, InstanceShell},
};

/// Keys owned by this system. Existing occurrences are removed and the
/// `recovery_target_*` trio is re-appended; name/time/xid targets are
/// cleared so only the LSN target can fire.
const MANAGED_KEYS: [&str; 6] = [
    "recovery_target_lsn",
    "recovery_target_action",
    "recovery_target_inclusive",
    "recovery_target_name",
    "recovery_target_time",
    "recovery_target_xid",
];

/// The configuration key a (non-comment) line assigns, if any.
fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let end = trimmed
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(trimmed.len());
    if end == 0 {
        return None;
    }
    let rest = trimmed[end..].trim_start();
    if rest.starts_with('=') {
        Some(&trimmed[..end])
    } else {
        None
    }
}

/// Rewrites a `postgresql.conf` document to target `lsn` with
/// shutdown-on-reach semantics. Pure so it can be tested byte-for-byte.
pub fn rewrite_recovery_conf(original: &str, lsn: Lsn) -> String {
    let mut lines: Vec<&str> = original
        .lines()
        .filter(|line| {
            line_key(line)
                .map(|key| !MANAGED_KEYS.contains(&key))
                .unwrap_or(true)
        })
        .collect();

    let appended = [
        format!("recovery_target_lsn = '{lsn}'"),
        "recovery_target_action = 'shutdown'".to_owned(),
        "recovery_target_inclusive = 'true'".to_owned(),
    ];
    let mut rewritten = String::with_capacity(original.len() + 96);
    for line in lines.drain(..) {
        rewritten.push_str(line);
        rewritten.push('\n');
    }
    for line in appended {
        rewritten.push_str(&line);
        rewritten.push('\n');
    }
    rewritten
}

/// Applies the recovery target to one instance: standby marker, then the
/// atomic conf rewrite. The instance is left stopped; starting it is the
/// orchestrator's job.
pub async fn apply_recovery_target(
    shell: &dyn InstanceShell,
    instance: &InstanceDescriptor,
    lsn: Lsn,
) -> ApplyResult<()> {
    let signal_path = format!("{}/standby.signal", instance.data_dir);
    ensure_file(shell, &signal_path).await?;

    let conf_path = format!("{}/postgresql.conf", instance.data_dir);
    let original = read_file(shell, &conf_path)
        .await?
        .ok_or_else(|| ApplyError::Conf {
            segment_id: instance.segment_id,
            message: format!("{conf_path} does not exist"),
        })?;

    let rewritten = rewrite_recovery_conf(&original, lsn);
    write_file_atomic(shell, &conf_path, &rewritten).await?;
    tracing::info!(
        segment_id = instance.segment_id,
        %lsn,
        "recovery target applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use syncpoint_test_utils::param_test;

    use crate::{shell::LocalShell, test_utils::lsn};

    use super::*;

    const BASE_CONF: &str = "\
# -----------------------------
# PostgreSQL configuration file
# -----------------------------
listen_addresses = '*'    # what IP address(es) to listen on
port = 6000
shared_buffers = '128MB'
#recovery_target_lsn = 'commented out, stays'
archive_mode = on
";

    #[test]
    fn unrelated_lines_survive_byte_for_byte() {
        let rewritten = rewrite_recovery_conf(BASE_CONF, lsn("9/EC0000C8"));
        for line in BASE_CONF.lines() {
            assert!(rewritten.contains(line), "lost line: {line}");
        }
        assert!(rewritten.contains("recovery_target_lsn = '9/EC0000C8'"));
        assert!(rewritten.contains("recovery_target_action = 'shutdown'"));
        assert!(rewritten.contains("recovery_target_inclusive = 'true'"));
    }

    #[test]
    fn stale_recovery_keys_are_replaced_or_cleared() {
        let conf = format!(
            "{BASE_CONF}recovery_target_lsn = '1/0'\nrecovery_target_name = 'old_point'\n\
             recovery_target_time = '2025-01-01'\nrecovery_target_xid = '123'\n"
        );
        let rewritten = rewrite_recovery_conf(&conf, lsn("9/EC0000C8"));
        assert!(!rewritten.contains("'1/0'"));
        assert!(!rewritten.contains("recovery_target_name"));
        assert!(!rewritten.contains("recovery_target_time"));
        assert!(!rewritten.contains("recovery_target_xid"));
        assert_eq!(
            rewritten.matches("recovery_target_lsn").count(),
            2, // the commented-out line plus ours
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let once = rewrite_recovery_conf(BASE_CONF, lsn("9/EC0000C8"));
        let twice = rewrite_recovery_conf(&once, lsn("9/EC0000C8"));
        assert_eq!(once, twice);
    }

    #[test]
    fn only_recovery_keys_differ_after_rewrite() {
        let rewritten = rewrite_recovery_conf(BASE_CONF, lsn("9/EC0000C8"));
        let changed: Vec<&str> = rewritten
            .lines()
            .filter(|line| !BASE_CONF.lines().any(|original| original == *line))
            .collect();
        assert!(changed
            .iter()
            .all(|line| line.starts_with("recovery_target_")));
    }

    param_test! {
        key_detection: [
            plain: ("recovery_target_lsn = '1/0'", Some("recovery_target_lsn")),
            indented: ("  recovery_target_action='shutdown'", Some("recovery_target_action")),
            comment: ("#recovery_target_lsn = '1/0'", None),
            no_assignment: ("recovery_target_lsn", None),
            other_key: ("port = 6000", Some("port")),
            blank: ("", None),
        ]
    }
    fn key_detection(line: &str, expected: Option<&str>) {
        assert_eq!(line_key(line), expected);
    }

    #[tokio::test]
    async fn apply_writes_marker_and_conf_atomically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postgresql.conf"), BASE_CONF).unwrap();
        let instance = InstanceDescriptor {
            segment_id: 0,
            host: "localhost".into(),
            port: 6000,
            data_dir: dir.path().display().to_string(),
            is_local: true,
        };

        apply_recovery_target(&LocalShell, &instance, lsn("9/EC0000C8"))
            .await
            .unwrap();

        assert!(dir.path().join("standby.signal").exists());
        assert!(!dir.path().join("postgresql.conf.tmp").exists());
        let conf = std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap();
        assert!(conf.contains("recovery_target_lsn = '9/EC0000C8'"));
        assert!(conf.contains("listen_addresses = '*'"));
    }

    #[tokio::test]
    async fn missing_conf_is_an_apply_error() {
        let dir = tempfile::tempdir().unwrap();
        let instance = InstanceDescriptor {
            segment_id: 0,
            host: "localhost".into(),
            port: 6000,
            data_dir: dir.path().display().to_string(),
            is_local: true,
        };
        assert!(matches!(
            apply_recovery_target(&LocalShell, &instance, lsn("9/EC0000C8")).await,
            Err(ApplyError::Conf { segment_id: 0, .. })
        ));
    }
}
