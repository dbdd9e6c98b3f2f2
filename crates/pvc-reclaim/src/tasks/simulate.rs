//! End-to-end walk through of the reclaim lifecycle against [`InMemoryStore`].
//!
//! Backs the `simulate` command, a smoke test that needs no cluster: a claim
//! is mirrored, deleted, its volume released, and the claim restored.

use crate::tasks::config::ControllerConfig;
use crate::tasks::mirror::reconcile_claim;
use crate::tasks::reclaim::reconcile_reclaim;
use crate::tasks::router::{route_volume_event, VolumeEvent};
use crate::tasks::store::{InMemoryStore, ResourceStore};
use crate::tasks::types::{
    Context, Error, NamespacedName, Result, CLAIM_PHASE_BOUND, VOLUME_PHASE_BOUND,
    VOLUME_PHASE_RELEASED,
};
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus,
};
use kube::api::ObjectMeta;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStep {
    pub action: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<ScenarioStep>,
    pub claim_phase: Option<String>,
    pub claim_uid: Option<String>,
    pub volume_claim_uid: Option<String>,
    pub volume_annotations: BTreeMap<String, String>,
    pub remaining_reclaims: Vec<ReclaimSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimSummary {
    pub name: String,
    pub restore: bool,
    pub recover_status: Option<String>,
    pub reason: String,
}

struct Scenario {
    store: Arc<InMemoryStore>,
    ctx: Context,
    key: NamespacedName,
    volume_name: String,
    steps: Vec<ScenarioStep>,
}

impl Scenario {
    async fn setup(namespace: &str, name: &str, volume_name: &str) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        let ctx = Context::new(store.clone(), Arc::new(ControllerConfig::default()));
        let key = NamespacedName::new(namespace, name);

        let claim = store
            .put_claim(PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                    ..ObjectMeta::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    volume_name: Some(volume_name.to_string()),
                    storage_class_name: Some("standard".to_string()),
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    ..PersistentVolumeClaimSpec::default()
                }),
                status: Some(PersistentVolumeClaimStatus {
                    phase: Some(CLAIM_PHASE_BOUND.to_string()),
                    ..PersistentVolumeClaimStatus::default()
                }),
            })
            .await?;

        store
            .put_volume(PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(volume_name.to_string()),
                    annotations: Some(BTreeMap::from([
                        (
                            "pv.kubernetes.io/provisioned-by".to_string(),
                            "hostpath.csi.k8s.io".to_string(),
                        ),
                        ("example.com/last-backup".to_string(), "nightly".to_string()),
                    ])),
                    ..ObjectMeta::default()
                },
                spec: Some(PersistentVolumeSpec {
                    claim_ref: Some(ObjectReference {
                        kind: Some("PersistentVolumeClaim".to_string()),
                        namespace: Some(namespace.to_string()),
                        name: Some(name.to_string()),
                        uid: claim.metadata.uid.clone(),
                        ..ObjectReference::default()
                    }),
                    ..PersistentVolumeSpec::default()
                }),
                status: Some(PersistentVolumeStatus {
                    phase: Some(VOLUME_PHASE_BOUND.to_string()),
                    ..PersistentVolumeStatus::default()
                }),
            })
            .await?;

        Ok(Self {
            store,
            ctx,
            key,
            volume_name: volume_name.to_string(),
            steps: Vec::new(),
        })
    }

    fn record(&mut self, action: impl Into<String>, outcome: impl std::fmt::Debug) {
        let step = ScenarioStep {
            action: action.into(),
            outcome: format!("{outcome:?}"),
        };
        info!(action = %step.action, outcome = %step.outcome, "Scenario step");
        self.steps.push(step);
    }

    async fn mirror(&mut self) -> Result<()> {
        let outcome = reconcile_claim(&self.key, &self.ctx).await?;
        self.record(format!("reconcile PVC {}", self.key), outcome);
        Ok(())
    }

    async fn delete_claim_and_release_volume(&mut self) -> Result<()> {
        self.store.remove_claim(&self.key).await;
        self.set_volume_phase(VOLUME_PHASE_RELEASED).await?;
        self.record(
            format!("delete PVC {}, PV {} Released", self.key, self.volume_name),
            "ok",
        );
        Ok(())
    }

    async fn set_volume_phase(&self, phase: &str) -> Result<()> {
        let mut volume = self
            .store
            .get_volume(&self.volume_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "PersistentVolume".to_string(),
                name: self.volume_name.clone(),
            })?;
        volume.status = Some(PersistentVolumeStatus {
            phase: Some(phase.to_string()),
            ..PersistentVolumeStatus::default()
        });
        self.store.put_volume(volume).await?;
        Ok(())
    }

    /// Route a volume update and reconcile every record it maps to
    async fn volume_updated(&mut self) -> Result<()> {
        let volume = self
            .store
            .get_volume(&self.volume_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "PersistentVolume".to_string(),
                name: self.volume_name.clone(),
            })?;
        let keys = route_volume_event(self.store.as_ref(), &VolumeEvent::Updated(volume)).await;
        self.record(format!("route PV {} update", self.volume_name), &keys);

        for key in keys {
            let outcome = reconcile_reclaim(&key, &self.ctx).await?;
            self.record(format!("reconcile PVCReclaim {key}"), outcome);
        }
        Ok(())
    }

    async fn request_restore(&mut self) -> Result<()> {
        self.store
            .patch_reclaim(&self.key, &json!({"spec": {"restore": true}}))
            .await?;
        let outcome = reconcile_reclaim(&self.key, &self.ctx).await?;
        self.record(format!("set restore=true on PVCReclaim {}", self.key), outcome);
        Ok(())
    }

    async fn report(self, name: &str) -> Result<ScenarioReport> {
        let claim = self.store.get_claim(&self.key).await?;
        let volume = self.store.get_volume(&self.volume_name).await?;

        let remaining_reclaims = self
            .store
            .reclaims()
            .await
            .into_iter()
            .map(|reclaim| ReclaimSummary {
                name: reclaim.metadata.name.clone().unwrap_or_default(),
                restore: reclaim.spec.restore,
                recover_status: reclaim.recover_status().map(|s| s.to_string()),
                reason: reclaim
                    .status
                    .as_ref()
                    .map(|s| s.reason.clone())
                    .unwrap_or_default(),
            })
            .collect();

        Ok(ScenarioReport {
            name: name.to_string(),
            steps: self.steps,
            claim_phase: claim
                .as_ref()
                .and_then(|c| c.status.as_ref())
                .and_then(|s| s.phase.clone()),
            claim_uid: claim.as_ref().and_then(|c| c.metadata.uid.clone()),
            volume_claim_uid: volume
                .as_ref()
                .and_then(|v| v.spec.as_ref())
                .and_then(|s| s.claim_ref.as_ref())
                .and_then(|r| r.uid.clone()),
            volume_annotations: volume
                .and_then(|v| v.metadata.annotations)
                .unwrap_or_default(),
            remaining_reclaims,
        })
    }
}

/// Claim mirrored, deleted, volume released, restore requested: the claim comes back bound
pub async fn run_restore_scenario() -> Result<ScenarioReport> {
    let mut scenario = Scenario::setup("ns", "data-1", "pv-1").await?;
    scenario.mirror().await?;
    scenario.delete_claim_and_release_volume().await?;
    scenario.volume_updated().await?;
    scenario.request_restore().await?;
    scenario.report("restore").await
}

/// Restore requested while the volume is still Bound: rejected, record kept
pub async fn run_rejected_restore_scenario() -> Result<ScenarioReport> {
    let mut scenario = Scenario::setup("ns", "data-1", "pv-1").await?;
    scenario.mirror().await?;
    scenario.store.remove_claim(&scenario.key).await;
    scenario.record("delete PVC ns/data-1, PV pv-1 still Bound", "ok");
    scenario.request_restore().await?;
    scenario.report("rejected-restore").await
}
