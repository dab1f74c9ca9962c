// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Target selection: the newest READY manifest that satisfies every recovery
//! floor, never going past LATEST.

use syncpoint_core::{InstanceDescriptor, Manifest, RestorePointName};

use crate::{
    error::{SelectError, SelectResult},
    floors::FloorMap,
    manifest_store::ManifestSource,
};

/// A manifest chosen as the run's target.
#[derive(Debug, Clone)]
pub struct SelectedTarget {
    /// The chosen manifest.
    pub manifest: Manifest,
    /// Why this manifest was chosen.
    pub reason: String,
}

/// Outcome of target selection.
#[derive(Debug, Clone)]
pub enum Selection {
    /// A target satisfying all constraints was found.
    Chosen(SelectedTarget),
    /// No READY manifest satisfies the floors right now; the consumer logs
    /// the reasons and waits.
    NoneAvailable {
        /// Human-readable reasons, for the log.
        reasons: Vec<String>,
    },
}

/// Checks that every DR instance has a target in the manifest.
fn check_topology(
    manifest: &Manifest,
    dr_instances: &[InstanceDescriptor],
) -> SelectResult<()> {
    for instance in dr_instances {
        if manifest.instance(instance.segment_id).is_none() {
            return Err(SelectError::TopologyMismatch {
                segment_id: instance.segment_id,
                target: manifest.restore_point.clone(),
            });
        }
    }
    Ok(())
}

/// Returns the reasons a manifest violates the floors; empty means it
/// satisfies them. An unknown floor is a violation for every manifest.
fn floor_violations(manifest: &Manifest, floors: &FloorMap) -> Vec<String> {
    let targets = manifest.lsn_by_segment();
    let mut reasons = Vec::new();
    for (&segment_id, floor) in floors {
        match (floor, targets.get(&segment_id)) {
            (None, _) => reasons.push(format!("[seg={segment_id}] recovery floor unknown")),
            (Some(_), None) => {
                reasons.push(format!("[seg={segment_id}] manifest has no restore_lsn"))
            }
            (Some(floor), Some(target)) if !target.reaches(*floor) => reasons.push(format!(
                "[seg={segment_id}] target_lsn={target} < floor_lsn={floor}"
            )),
            _ => {}
        }
    }
    reasons
}

/// Selects the manifest a consumer run should drive towards.
///
/// With an explicit target, only that manifest is considered and any
/// violation is a hard error. Otherwise LATEST wins when it satisfies every
/// floor; else the newest older READY manifest that does ("safest-forward").
pub async fn select_target(
    source: &dyn ManifestSource,
    dr_instances: &[InstanceDescriptor],
    floors: &FloorMap,
    explicit: Option<&RestorePointName>,
) -> SelectResult<Selection> {
    if let Some(name) = explicit {
        return select_explicit(source, dr_instances, floors, name).await;
    }

    let mut reasons = Vec::new();

    let ceiling = match source.latest().await? {
        Some(pointer) => {
            match source.get(&pointer.restore_point).await? {
                Some(manifest) if manifest.ready => {
                    check_topology(&manifest, dr_instances)?;
                    let violations = floor_violations(&manifest, floors);
                    if violations.is_empty() {
                        return Ok(Selection::Chosen(SelectedTarget {
                            manifest,
                            reason: "LATEST satisfies recovery floors".into(),
                        }));
                    }
                    tracing::info!(
                        target = %pointer.restore_point,
                        ?violations,
                        "LATEST is behind a recovery floor; scanning older manifests"
                    );
                    reasons.extend(violations);
                    Some(pointer.restore_point)
                }
                _ => {
                    reasons.push(format!(
                        "LATEST points at '{}' which is missing or not ready",
                        pointer.restore_point
                    ));
                    Some(pointer.restore_point)
                }
            }
        }
        None => {
            reasons.push("no LATEST pointer published yet".into());
            None
        }
    };

    // Never go past LATEST: a manifest may become READY before the pointer
    // is replaced, and picking it would outrun the publisher's ordering.
    for name in source.list().await? {
        if ceiling.as_ref().is_some_and(|latest| &name >= latest) {
            continue;
        }
        let Some(manifest) = source.get(&name).await? else {
            continue;
        };
        if !manifest.ready {
            continue;
        }
        check_topology(&manifest, dr_instances)?;
        let violations = floor_violations(&manifest, floors);
        if violations.is_empty() {
            return Ok(Selection::Chosen(SelectedTarget {
                manifest,
                reason: format!("newest READY manifest at/after floors ({name})"),
            }));
        }
    }

    reasons.push("no READY manifest satisfies every recovery floor".into());
    Ok(Selection::NoneAvailable { reasons })
}

async fn select_explicit(
    source: &dyn ManifestSource,
    dr_instances: &[InstanceDescriptor],
    floors: &FloorMap,
    name: &RestorePointName,
) -> SelectResult<Selection> {
    let manifest = source
        .get(name)
        .await?
        .filter(|manifest| manifest.ready)
        .ok_or_else(|| SelectError::TargetUnavailable(name.clone()))?;
    check_topology(&manifest, dr_instances)?;

    let violations = floor_violations(&manifest, floors);
    if !violations.is_empty() {
        return Err(SelectError::TargetBelowFloor {
            target: name.clone(),
            reasons: violations,
        });
    }
    Ok(Selection::Chosen(SelectedTarget {
        manifest,
        reason: "operator-supplied target".into(),
    }))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::{
        manifest_store::LocalManifestStore,
        test_utils::{lsn, rp, test_instance, test_manifest, test_manifest_instance},
    };

    use super::*;

    fn store(dir: &Path) -> LocalManifestStore {
        LocalManifestStore::new(dir.join("manifests"), dir.join("LATEST.json"))
    }

    fn dr_instances() -> Vec<InstanceDescriptor> {
        vec![test_instance(-1), test_instance(0)]
    }

    fn floors(coordinator: &str, segment: &str) -> FloorMap {
        [(-1, Some(lsn(coordinator))), (0, Some(lsn(segment)))].into()
    }

    fn publish(store: &LocalManifestStore, name: &str, lsns: (&str, &str), latest: bool) {
        let manifest = test_manifest(
            name,
            vec![
                test_manifest_instance(-1, lsns.0, true),
                test_manifest_instance(0, lsns.1, true),
            ],
        );
        let path = store.put(&manifest).unwrap();
        if latest {
            store.update_latest(&manifest, &path).unwrap();
        }
    }

    #[tokio::test]
    async fn latest_wins_when_floors_allow() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        publish(&store, "sync_point_20260201_180000", ("9/A0000000", "9/B0000000"), false);
        publish(&store, "sync_point_20260201_181406", ("9/E40000C8", "9/EC0000C8"), true);

        let selection = select_target(
            &store,
            &dr_instances(),
            &floors("9/E40000C8", "9/EC0000C8"),
            None,
        )
        .await
        .unwrap();
        let Selection::Chosen(chosen) = selection else {
            panic!("expected a target");
        };
        assert_eq!(chosen.manifest.restore_point, rp("sync_point_20260201_181406"));
    }

    #[tokio::test]
    async fn floor_one_byte_above_target_rejects_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        publish(&store, "sync_point_20260201_181406", ("9/E40000C8", "9/EC0000C8"), true);

        // Floor one byte past the coordinator target.
        let selection = select_target(
            &store,
            &dr_instances(),
            &floors("9/E40000C9", "9/EC0000C8"),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(selection, Selection::NoneAvailable { .. }));
    }

    #[tokio::test]
    async fn scans_backwards_to_newest_satisfying_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        // Older manifest with higher LSNs than LATEST on the coordinator:
        // the floor forces a fall-back to it.
        publish(&store, "sync_point_20260131_090000", ("9/00000000", "9/00000000"), false);
        publish(&store, "sync_point_20260201_180000", ("A/10000000", "9/E0000000"), false);
        publish(&store, "sync_point_20260201_181406", ("9/E40000C8", "9/EC0000C8"), true);

        let selection = select_target(
            &store,
            &dr_instances(),
            &floors("A/00000000", "9/00000000"),
            None,
        )
        .await
        .unwrap();
        let Selection::Chosen(chosen) = selection else {
            panic!("expected a target");
        };
        assert_eq!(chosen.manifest.restore_point, rp("sync_point_20260201_180000"));
        assert!(chosen.reason.contains("sync_point_20260201_180000"));
    }

    #[tokio::test]
    async fn unknown_floor_disqualifies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        publish(&store, "sync_point_20260201_181406", ("9/E40000C8", "9/EC0000C8"), true);

        let floors: FloorMap = [(-1, Some(lsn("0/0"))), (0, None)].into();
        let selection = select_target(&store, &dr_instances(), &floors, None)
            .await
            .unwrap();
        let Selection::NoneAvailable { reasons } = selection else {
            panic!("expected no candidate");
        };
        assert!(reasons.iter().any(|r| r.contains("floor unknown")));
    }

    #[tokio::test]
    async fn missing_segment_in_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let manifest = test_manifest(
            "sync_point_20260201_181406",
            vec![test_manifest_instance(-1, "9/E40000C8", true)],
        );
        let path = store.put(&manifest).unwrap();
        store.update_latest(&manifest, &path).unwrap();

        let result = select_target(
            &store,
            &dr_instances(),
            &floors("0/0", "0/0"),
            None,
        )
        .await;
        assert!(matches!(
            result,
            Err(SelectError::TopologyMismatch { segment_id: 0, .. })
        ));
    }

    #[tokio::test]
    async fn explicit_target_below_floor_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        publish(&store, "sync_point_20260201_180000", ("9/A0000000", "9/B0000000"), true);

        let result = select_target(
            &store,
            &dr_instances(),
            &floors("A/00000000", "0/0"),
            Some(&rp("sync_point_20260201_180000")),
        )
        .await;
        assert!(matches!(result, Err(SelectError::TargetBelowFloor { .. })));
    }

    #[tokio::test]
    async fn explicit_target_missing_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let result = select_target(
            &store,
            &dr_instances(),
            &floors("0/0", "0/0"),
            Some(&rp("sync_point_20260201_181406")),
        )
        .await;
        assert!(matches!(result, Err(SelectError::TargetUnavailable(_))));
    }

    #[tokio::test]
    async fn floor_exactly_at_target_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        publish(&store, "sync_point_20260201_181406", ("9/E40000C8", "9/EC0000C8"), true);

        let selection = select_target(
            &store,
            &dr_instances(),
            &floors("9/E40000C8", "9/EC0000C8"),
            None,
        )
        .await
        .unwrap();
        assert!(matches!(selection, Selection::Chosen(_)));
    }
}
