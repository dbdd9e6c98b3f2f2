//! Reclaim reconciler
//!
//! Decides, from the joint state of a `PVCReclaim`, its claim and its volume,
//! whether to mirror, garbage-collect, reject a restore request or run the
//! restore sequence.
//!
//! The restore sequence is a chain of individually idempotent writes. A crash
//! part-way through is picked up by the next reconcile: claim creation
//! tolerates `AlreadyExists`, patches overwrite, and a volume that was already
//! rebound to the recreated claim skips straight to completion.

use crate::crds::{PVCReclaim, RecoverStatus};
use crate::tasks::mirror::{bound_volume_name, ensure_mirror, MirrorOutcome};
use crate::tasks::store::versioned_patch;
use crate::tasks::types::{
    Context, Error, NamespacedName, Result, CLAIM_PHASE_BOUND, PROVISIONER_ANNOTATION_PREFIX,
    RECLAIM_VOLUME_LABEL, VOLUME_PHASE_RELEASED,
};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

/// What a reclaim pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// Neither record nor claim exists
    Absent,
    /// No record, claim exists but is not Bound
    ClaimNotBound,
    /// No record, so one was created or synced from the live claim
    Mirrored(MirrorOutcome),
    /// Referenced volume is gone and the record was deleted
    GarbageCollected,
    /// Record exists and no restore is requested
    Idle,
    /// Restore requested while the volume is not Released
    RestoreRejected,
    /// Claim could not be recreated
    RestoreFailed,
    /// Claim recreated, volume rebound and record deleted
    Restored,
}

#[instrument(skip(ctx), fields(pvc_reclaim = %key))]
pub async fn reconcile_reclaim(key: &NamespacedName, ctx: &Context) -> Result<ReclaimOutcome> {
    let reclaim = ctx.store.get_reclaim(key).await?;
    let claim = ctx.store.get_claim(key).await?;

    let Some(reclaim) = reclaim else {
        let Some(claim) = claim else {
            debug!("Neither PVCReclaim nor PVC exists, nothing to be done");
            return Ok(ReclaimOutcome::Absent);
        };
        let Some(volume_name) = bound_volume_name(&claim) else {
            info!("PVC is not Bound, nothing to be done");
            return Ok(ReclaimOutcome::ClaimNotBound);
        };
        let outcome = ensure_mirror(&claim, volume_name, ctx).await?;
        return Ok(ReclaimOutcome::Mirrored(outcome));
    };

    let volume_name = reclaim
        .volume_name()
        .map(str::to_string)
        .ok_or_else(|| Error::MissingField {
            kind: PVCReclaim::kind(&()).to_string(),
            name: key.to_string(),
            field: "spec.persistentVolumeRef.name",
        })?;

    let Some(volume) = ctx.store.get_volume(&volume_name).await? else {
        info!(pv = %volume_name, "PV is not found, deleting PVCReclaim");
        ctx.store.delete_reclaim(key).await?;
        return Ok(ReclaimOutcome::GarbageCollected);
    };

    if !reclaim.is_restore_requested() {
        return Ok(ReclaimOutcome::Idle);
    }

    if let Some(claim) = &claim {
        if restore_already_applied(&reclaim, &volume, claim) {
            info!(pv = %volume_name, "PV already rebound to recreated PVC, completing restore");
            return complete_restore(key, reclaim, &volume_name, ctx).await;
        }
    }

    let phase = volume_phase(&volume);
    if phase != Some(VOLUME_PHASE_RELEASED) {
        return reject_restore(key, &reclaim, &volume_name, phase, ctx).await;
    }

    restore(key, reclaim, volume, ctx).await
}

fn volume_phase(volume: &PersistentVolume) -> Option<&str> {
    volume.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// A previous pass got as far as rebinding the volume to the live claim
fn restore_already_applied(
    reclaim: &PVCReclaim,
    volume: &PersistentVolume,
    claim: &PersistentVolumeClaim,
) -> bool {
    if reclaim.recover_status() != Some(RecoverStatus::RecoveryInProgress) {
        return false;
    }
    let Some(claim_ref) = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref()) else {
        return false;
    };
    claim.metadata.uid.is_some()
        && claim_ref.uid == claim.metadata.uid
        && claim_ref.name == claim.metadata.name
        && claim_ref.namespace == claim.metadata.namespace
}

/// Restore requested against a volume that is still in use: clear the flag and record why
async fn reject_restore(
    key: &NamespacedName,
    reclaim: &PVCReclaim,
    volume_name: &str,
    phase: Option<&str>,
    ctx: &Context,
) -> Result<ReclaimOutcome> {
    let phase = phase.unwrap_or("Unknown");
    warn!(pv = %volume_name, phase = %phase, "PV is not in Released phase, rejecting restore");

    let reclaim = clear_restore(key, reclaim, ctx).await?;

    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({
            "status": {
                "recoverStatus": RecoverStatus::RecoveryFailed,
                "reason": format!("PV {volume_name} is not in Released phase (current phase: {phase})"),
                "message": format!("Restore of PVC {key} was not attempted; request it again once PV {volume_name} is Released"),
            }
        }),
    );
    ctx.store.patch_reclaim_status(key, &patch).await?;
    Ok(ReclaimOutcome::RestoreRejected)
}

async fn clear_restore(
    key: &NamespacedName,
    reclaim: &PVCReclaim,
    ctx: &Context,
) -> Result<PVCReclaim> {
    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({"spec": {"restore": false}}),
    );
    ctx.store.patch_reclaim(key, &patch).await
}

async fn restore(
    key: &NamespacedName,
    reclaim: PVCReclaim,
    volume: PersistentVolume,
    ctx: &Context,
) -> Result<ReclaimOutcome> {
    let volume_name = volume.name_any();
    info!(pv = %volume_name, "Restoring PVC from PVCReclaim");

    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({
            "status": {
                "recoverStatus": RecoverStatus::RecoveryInProgress,
                "reason": "",
                "message": format!("Recovering PVC {key} and having it bound to PV {volume_name}"),
            }
        }),
    );
    let reclaim = ctx.store.patch_reclaim_status(key, &patch).await?;

    let created = match ctx.store.create_claim(&build_claim(key, &reclaim)).await {
        Ok(created) => created,
        Err(e) if e.is_already_exists() => {
            debug!("PVC already exists, continuing restore with existing PVC");
            ctx.store
                .get_claim(key)
                .await?
                .ok_or_else(|| Error::NotFound {
                    kind: PersistentVolumeClaim::kind(&()).to_string(),
                    name: key.to_string(),
                })?
        }
        Err(e) => return fail_restore(key, &reclaim, &e, ctx).await,
    };

    let patch = versioned_patch(
        created.meta().resource_version.as_deref(),
        json!({"status": {"phase": CLAIM_PHASE_BOUND}}),
    );
    ctx.store.patch_claim_status(key, &patch).await?;

    let claim = ctx
        .store
        .get_claim(key)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: PersistentVolumeClaim::kind(&()).to_string(),
            name: key.to_string(),
        })?;
    ctx.store
        .patch_volume(&volume_name, &rebind_patch(&volume, &claim, key)?)
        .await?;
    info!(pv = %volume_name, "PV rebound to recreated PVC");

    complete_restore(key, reclaim, &volume_name, ctx).await
}

/// Claim recreation failed for a reason other than `AlreadyExists`. Terminal:
/// the restore flag is cleared and the failure recorded for an operator.
async fn fail_restore(
    key: &NamespacedName,
    reclaim: &PVCReclaim,
    err: &Error,
    ctx: &Context,
) -> Result<ReclaimOutcome> {
    error!(error = %err, "Failed to re-create PVC");

    let reclaim = clear_restore(key, reclaim, ctx).await?;
    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({
            "status": {
                "recoverStatus": RecoverStatus::RecoveryFailed,
                "reason": format!("Failed to re-create PVC {key}, error: {err}"),
            }
        }),
    );
    ctx.store.patch_reclaim_status(key, &patch).await?;
    Ok(ReclaimOutcome::RestoreFailed)
}

/// Mark success and delete the record so it never coexists with the restored claim
async fn complete_restore(
    key: &NamespacedName,
    reclaim: PVCReclaim,
    volume_name: &str,
    ctx: &Context,
) -> Result<ReclaimOutcome> {
    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({
            "status": {
                "recoverStatus": RecoverStatus::RecoverySuccess,
                "reason": "",
                "message": format!("Successfully restored PVC {key} and bound it to PV {volume_name}"),
            }
        }),
    );
    ctx.store.patch_reclaim_status(key, &patch).await?;

    info!("Deleting PVCReclaim after successfully recovering PVC");
    ctx.store.delete_reclaim(key).await?;
    Ok(ReclaimOutcome::Restored)
}

/// Claim to recreate: the frozen spec plus the record's labels (minus the volume index) and annotations
pub(crate) fn build_claim(key: &NamespacedName, reclaim: &PVCReclaim) -> PersistentVolumeClaim {
    let mut labels = reclaim.labels().clone();
    labels.remove(RECLAIM_VOLUME_LABEL);
    let annotations = reclaim.annotations().clone();

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: (!labels.is_empty()).then_some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..ObjectMeta::default()
        },
        spec: Some(reclaim.spec.persistent_volume_claim_spec.clone()),
        status: None,
    }
}

/// Merge patch that strips non-provisioner annotations from the volume and
/// points its claim reference at the recreated claim
pub(crate) fn rebind_patch(
    volume: &PersistentVolume,
    claim: &PersistentVolumeClaim,
    key: &NamespacedName,
) -> Result<Value> {
    let uid = claim.metadata.uid.clone().ok_or_else(|| Error::MissingField {
        kind: PersistentVolumeClaim::kind(&()).to_string(),
        name: key.to_string(),
        field: "metadata.uid",
    })?;

    let mut body = Map::new();

    let stale: Map<String, Value> = volume
        .annotations()
        .keys()
        .filter(|annotation| !annotation.contains(PROVISIONER_ANNOTATION_PREFIX))
        .map(|annotation| (annotation.clone(), Value::Null))
        .collect();
    if !stale.is_empty() {
        body.insert("metadata".to_string(), json!({"annotations": stale}));
    }

    let has_claim_ref = volume
        .spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .is_some();
    let claim_ref = if has_claim_ref {
        json!({"uid": uid})
    } else {
        json!({
            "kind": PersistentVolumeClaim::kind(&()),
            "apiVersion": PersistentVolumeClaim::api_version(&()),
            "namespace": key.namespace,
            "name": key.name,
            "uid": uid,
        })
    };
    body.insert("spec".to_string(), json!({"claimRef": claim_ref}));

    Ok(versioned_patch(
        volume.meta().resource_version.as_deref(),
        Value::Object(body),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::PVCReclaimSpec;
    use k8s_openapi::api::core::v1::{
        ObjectReference, PersistentVolumeClaimSpec, PersistentVolumeSpec, PersistentVolumeStatus,
    };
    use std::collections::BTreeMap;

    fn key() -> NamespacedName {
        NamespacedName::new("ns", "data-1")
    }

    fn record() -> PVCReclaim {
        let mut reclaim = PVCReclaim::new(
            "data-1",
            PVCReclaimSpec {
                persistent_volume_ref: ObjectReference {
                    name: Some("pv-1".to_string()),
                    ..ObjectReference::default()
                },
                persistent_volume_claim_spec: PersistentVolumeClaimSpec {
                    volume_name: Some("pv-1".to_string()),
                    ..PersistentVolumeClaimSpec::default()
                },
                restore: true,
            },
        );
        reclaim.metadata.namespace = Some("ns".to_string());
        reclaim.metadata.labels = Some(BTreeMap::from([
            ("app".to_string(), "db".to_string()),
            (RECLAIM_VOLUME_LABEL.to_string(), "pv-1".to_string()),
        ]));
        reclaim
    }

    fn volume(annotations: &[(&str, &str)], claim_ref: Option<ObjectReference>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".to_string()),
                resource_version: Some("11".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref,
                ..PersistentVolumeSpec::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some(VOLUME_PHASE_RELEASED.to_string()),
                ..PersistentVolumeStatus::default()
            }),
        }
    }

    fn claim_with_uid(uid: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-1".to_string()),
                namespace: Some("ns".to_string()),
                uid: Some(uid.to_string()),
                ..ObjectMeta::default()
            },
            ..PersistentVolumeClaim::default()
        }
    }

    #[test]
    fn build_claim_drops_volume_label() {
        let claim = build_claim(&key(), &record());

        assert_eq!(claim.metadata.name.as_deref(), Some("data-1"));
        assert_eq!(claim.metadata.namespace.as_deref(), Some("ns"));
        let labels = claim.metadata.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("db"));
        assert!(!labels.contains_key(RECLAIM_VOLUME_LABEL));
        assert_eq!(
            claim.spec.and_then(|s| s.volume_name).as_deref(),
            Some("pv-1")
        );
    }

    #[test]
    fn rebind_patch_strips_foreign_annotations() {
        let volume = volume(
            &[
                ("pv.kubernetes.io/provisioned-by", "ebs.csi.aws.com"),
                ("pv.kubernetes.io/bound-by-controller", "yes"),
                ("backup.velero.io/snapshot", "abc"),
            ],
            Some(ObjectReference {
                namespace: Some("ns".to_string()),
                name: Some("data-1".to_string()),
                uid: Some("old-uid".to_string()),
                ..ObjectReference::default()
            }),
        );

        let patch = rebind_patch(&volume, &claim_with_uid("new-uid"), &key()).unwrap();
        assert_eq!(
            patch,
            json!({
                "metadata": {
                    "annotations": {"backup.velero.io/snapshot": null},
                    "resourceVersion": "11"
                },
                "spec": {"claimRef": {"uid": "new-uid"}}
            })
        );
    }

    #[test]
    fn rebind_patch_creates_missing_claim_ref() {
        let patch = rebind_patch(&volume(&[], None), &claim_with_uid("new-uid"), &key()).unwrap();
        assert_eq!(
            patch["spec"]["claimRef"],
            json!({
                "kind": "PersistentVolumeClaim",
                "apiVersion": "v1",
                "namespace": "ns",
                "name": "data-1",
                "uid": "new-uid"
            })
        );
        assert!(patch["metadata"].get("annotations").is_none());
    }

    #[test]
    fn rebind_patch_requires_claim_uid() {
        let mut claim = claim_with_uid("x");
        claim.metadata.uid = None;
        let err = rebind_patch(&volume(&[], None), &claim, &key()).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "metadata.uid", .. }));
    }

    #[test]
    fn already_applied_only_when_in_progress_and_uid_matches() {
        let claim_ref = ObjectReference {
            namespace: Some("ns".to_string()),
            name: Some("data-1".to_string()),
            uid: Some("new-uid".to_string()),
            ..ObjectReference::default()
        };
        let volume = volume(&[], Some(claim_ref));
        let mut reclaim = record();

        assert!(!restore_already_applied(&reclaim, &volume, &claim_with_uid("new-uid")));

        reclaim.status = Some(crate::crds::PVCReclaimStatus {
            recover_status: Some(RecoverStatus::RecoveryInProgress),
            ..Default::default()
        });
        assert!(restore_already_applied(&reclaim, &volume, &claim_with_uid("new-uid")));
        assert!(!restore_already_applied(&reclaim, &volume, &claim_with_uid("other-uid")));
    }
}
