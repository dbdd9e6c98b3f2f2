//! Claim mirror
//!
//! Keeps a `PVCReclaim` in step with every Bound `PersistentVolumeClaim`, so
//! the claim spec and its volume binding survive the claim being deleted.

use crate::crds::{PVCReclaim, PVCReclaimSpec, RecoverStatus};
use crate::tasks::store::versioned_patch;
use crate::tasks::types::{
    Context, Error, NamespacedName, Result, CLAIM_PHASE_BOUND, RECLAIM_VOLUME_LABEL,
};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// What a mirror pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Claim absent or not Bound yet
    Skipped,
    /// A new record was created
    Created,
    /// An existing record was brought up to date
    Synced,
}

/// Volume name of a claim that is Bound, `None` otherwise
#[must_use]
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    let volume = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|v| !v.is_empty());

    match (phase, volume) {
        (Some(CLAIM_PHASE_BOUND), Some(volume)) => Some(volume),
        _ => None,
    }
}

/// Reconcile the record for a claim identity
#[instrument(skip(ctx), fields(pvc = %key))]
pub async fn reconcile_claim(key: &NamespacedName, ctx: &Context) -> Result<MirrorOutcome> {
    let Some(claim) = ctx.store.get_claim(key).await? else {
        debug!("PVC not found, nothing to be done");
        return Ok(MirrorOutcome::Skipped);
    };

    let Some(volume_name) = bound_volume_name(&claim) else {
        info!("PVC is not Bound, nothing to be done");
        return Ok(MirrorOutcome::Skipped);
    };

    ensure_mirror(&claim, volume_name, ctx).await
}

/// Find or create the record for a Bound claim, sync it and reset its status.
///
/// Shared by the claim controller and the reclaim reconciler so either one can
/// create the record, whichever notification arrives first.
pub(crate) async fn ensure_mirror(
    claim: &PersistentVolumeClaim,
    volume_name: &str,
    ctx: &Context,
) -> Result<MirrorOutcome> {
    let key = NamespacedName::from_resource(claim)?;

    let volume = ctx
        .store
        .get_volume(volume_name)
        .await?
        .ok_or_else(|| Error::VolumeNotFound {
            volume: volume_name.to_string(),
            claim: key.to_string(),
        })?;

    let (reclaim, outcome) = match ctx.store.get_reclaim(&key).await? {
        Some(existing) => (sync_record(existing, claim, ctx).await?, MirrorOutcome::Synced),
        None => create_record(&key, claim, &volume, ctx).await?,
    };

    let patch = versioned_patch(
        reclaim.meta().resource_version.as_deref(),
        json!({
            "status": {
                "recoverStatus": RecoverStatus::NotRecovered,
                "reason": "",
                "message": format!("PVC {key} Bound, PVCReclaim {key} created for recovery"),
            }
        }),
    );
    ctx.store.patch_reclaim_status(&key, &patch).await?;

    info!(pv = %volume_name, outcome = ?outcome, "PVCReclaim in sync with PVC");
    Ok(outcome)
}

async fn create_record(
    key: &NamespacedName,
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
    ctx: &Context,
) -> Result<(PVCReclaim, MirrorOutcome)> {
    let record = build_record(key, claim, volume);

    match ctx.store.create_reclaim(&record).await {
        Ok(created) => {
            info!(pv = %volume.name_any(), "Created PVCReclaim for PVC");
            Ok((created, MirrorOutcome::Created))
        }
        Err(e) if e.is_already_exists() => {
            // Lost a race with the other creation path; sync what is there instead
            debug!("PVCReclaim created concurrently, syncing existing record");
            let existing = ctx
                .store
                .get_reclaim(key)
                .await?
                .ok_or_else(|| Error::NotFound {
                    kind: PVCReclaim::kind(&()).to_string(),
                    name: key.to_string(),
                })?;
            Ok((sync_record(existing, claim, ctx).await?, MirrorOutcome::Synced))
        }
        Err(e) => Err(e),
    }
}

/// New record pointing at `volume` with a verbatim copy of the claim spec
pub(crate) fn build_record(
    key: &NamespacedName,
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
) -> PVCReclaim {
    let volume_name = volume.name_any();

    let mut labels = claim.metadata.labels.clone().unwrap_or_default();
    labels.insert(RECLAIM_VOLUME_LABEL.to_string(), volume_name.clone());

    let mut record = PVCReclaim::new(
        &key.name,
        PVCReclaimSpec {
            persistent_volume_ref: ObjectReference {
                kind: Some(PersistentVolume::kind(&()).to_string()),
                api_version: Some(PersistentVolume::api_version(&()).to_string()),
                name: Some(volume_name),
                ..ObjectReference::default()
            },
            persistent_volume_claim_spec: claim.spec.clone().unwrap_or_default(),
            restore: false,
        },
    );
    record.metadata.namespace = Some(key.namespace.clone());
    record.metadata.labels = Some(labels);
    record.metadata.annotations = claim.metadata.annotations.clone();
    record
}

/// Overwrite annotations, merge labels and clear any outstanding restore request
async fn sync_record(
    mut record: PVCReclaim,
    claim: &PersistentVolumeClaim,
    ctx: &Context,
) -> Result<PVCReclaim> {
    record.metadata.annotations = claim.metadata.annotations.clone();

    let volume_label = record.volume_name().map(str::to_string);
    let labels = record.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(claim.labels().clone());
    if let Some(volume_name) = volume_label {
        labels.insert(RECLAIM_VOLUME_LABEL.to_string(), volume_name);
    }

    record.spec.restore = false;

    ctx.store.replace_reclaim(&record).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::config::ControllerConfig;
    use crate::tasks::store::MockResourceStore;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, PersistentVolumeSpec,
    };
    use kube::api::ObjectMeta;
    use std::sync::Arc;

    fn bound_claim(labels: &[(&str, &str)]) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-1".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                annotations: Some(BTreeMap::from([(
                    "team".to_string(),
                    "storage".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some("pv-1".to_string()),
                storage_class_name: Some("fast".to_string()),
                ..PersistentVolumeClaimSpec::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(CLAIM_PHASE_BOUND.to_string()),
                ..PersistentVolumeClaimStatus::default()
            }),
        }
    }

    fn volume() -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some("pv-1".to_string()),
                resource_version: Some("3".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeSpec::default()),
            status: None,
        }
    }

    #[test]
    fn bound_volume_name_requires_phase_and_volume() {
        let claim = bound_claim(&[]);
        assert_eq!(bound_volume_name(&claim), Some("pv-1"));

        let mut pending = bound_claim(&[]);
        pending.status.as_mut().unwrap().phase = Some("Pending".to_string());
        assert_eq!(bound_volume_name(&pending), None);

        let mut unnamed = bound_claim(&[]);
        unnamed.spec.as_mut().unwrap().volume_name = Some(String::new());
        assert_eq!(bound_volume_name(&unnamed), None);
    }

    #[test]
    fn build_record_copies_claim_and_indexes_volume() {
        let claim = bound_claim(&[("app", "db")]);
        let record = build_record(&NamespacedName::new("ns", "data-1"), &claim, &volume());

        assert_eq!(record.name_any(), "data-1");
        assert_eq!(record.namespace().as_deref(), Some("ns"));
        assert_eq!(record.volume_name(), Some("pv-1"));
        assert_eq!(
            record.spec.persistent_volume_ref.kind.as_deref(),
            Some("PersistentVolume")
        );
        assert_eq!(record.spec.persistent_volume_ref.api_version.as_deref(), Some("v1"));
        assert_eq!(record.spec.persistent_volume_claim_spec, *claim.spec.as_ref().unwrap());
        assert!(!record.spec.restore);
        assert_eq!(record.labels().get("app").map(String::as_str), Some("db"));
        assert_eq!(
            record.labels().get(RECLAIM_VOLUME_LABEL).map(String::as_str),
            Some("pv-1")
        );
        assert_eq!(record.annotations().get("team").map(String::as_str), Some("storage"));
    }

    #[tokio::test]
    async fn status_conflict_propagates() {
        let claim = bound_claim(&[]);
        let existing = build_record(&NamespacedName::new("ns", "data-1"), &claim, &volume());

        let mut store = MockResourceStore::new();
        store
            .expect_get_volume()
            .returning(|_| Ok(Some(volume())));
        let found = existing.clone();
        store
            .expect_get_reclaim()
            .returning(move |_| Ok(Some(found.clone())));
        store
            .expect_replace_reclaim()
            .returning(|reclaim| Ok(reclaim.clone()));
        store.expect_patch_reclaim_status().returning(|key, _| {
            Err(Error::Conflict {
                kind: "PVCReclaim".to_string(),
                name: key.to_string(),
                message: "the object has been modified".to_string(),
            })
        });

        let ctx = Context::new(Arc::new(store), Arc::new(ControllerConfig::default()));
        let err = ensure_mirror(&claim, "pv-1", &ctx).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn missing_volume_fails_the_reconcile() {
        let mut store = MockResourceStore::new();
        store.expect_get_volume().returning(|_| Ok(None));

        let ctx = Context::new(Arc::new(store), Arc::new(ControllerConfig::default()));
        let err = ensure_mirror(&bound_claim(&[]), "pv-1", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VolumeNotFound { .. }));
    }
}
