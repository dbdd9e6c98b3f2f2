//! In-process [`ResourceStore`]
//!
//! Behaves like the API server for the operations the controller relies on:
//! uids and resource versions are assigned on write, stale resource versions
//! are rejected, status is only written through the status subresource and a
//! freshly created claim starts out `Pending`. Used by the test-suite and by
//! the `simulate` command.

use super::ResourceStore;
use crate::crds::PVCReclaim;
use crate::tasks::types::{
    Error, NamespacedName, Result, CLAIM_PHASE_PENDING, RECLAIM_VOLUME_LABEL,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimStatus,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    claims: BTreeMap<NamespacedName, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    reclaims: BTreeMap<NamespacedName, PVCReclaim>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Subresource {
    Main,
    Status,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a claim as-is, status included
    pub async fn put_claim(&self, mut claim: PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = NamespacedName::from_resource(&claim)?;
        let mut state = self.state.lock().await;
        let version = state.next_version();
        stamp(&mut claim.metadata, version);
        state.claims.insert(key, claim.clone());
        Ok(claim)
    }

    pub async fn remove_claim(&self, key: &NamespacedName) -> Option<PersistentVolumeClaim> {
        self.state.lock().await.claims.remove(key)
    }

    /// Insert or overwrite a volume as-is, status included
    pub async fn put_volume(&self, mut volume: PersistentVolume) -> Result<PersistentVolume> {
        let name = volume.metadata.name.clone().ok_or_else(|| Error::MissingField {
            kind: PersistentVolume::kind(&()).to_string(),
            name: "<unnamed>".to_string(),
            field: "metadata.name",
        })?;
        let mut state = self.state.lock().await;
        let version = state.next_version();
        stamp(&mut volume.metadata, version);
        state.volumes.insert(name, volume.clone());
        Ok(volume)
    }

    pub async fn remove_volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().await.volumes.remove(name)
    }

    /// Insert or overwrite a record as-is, status included
    pub async fn put_reclaim(&self, mut reclaim: PVCReclaim) -> Result<PVCReclaim> {
        let key = NamespacedName::from_resource(&reclaim)?;
        let mut state = self.state.lock().await;
        let version = state.next_version();
        stamp(&mut reclaim.metadata, version);
        state.reclaims.insert(key, reclaim.clone());
        Ok(reclaim)
    }

    pub async fn reclaims(&self) -> Vec<PVCReclaim> {
        self.state.lock().await.reclaims.values().cloned().collect()
    }

    pub async fn claims(&self) -> Vec<PersistentVolumeClaim> {
        self.state.lock().await.claims.values().cloned().collect()
    }
}

/// Give an object a uid on first write and a fresh resource version on every write
fn stamp(meta: &mut ObjectMeta, version: String) {
    if meta.uid.is_none() {
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
    }
    meta.resource_version = Some(version);
}

fn not_found<K: Resource<DynamicType = ()>>(name: &str) -> Error {
    Error::NotFound {
        kind: K::kind(&()).to_string(),
        name: name.to_string(),
    }
}

/// Reject a write whose `resourceVersion` precondition does not match the stored object
fn check_precondition<K: Resource<DynamicType = ()>>(
    name: &str,
    current: &ObjectMeta,
    expected: Option<&str>,
) -> Result<()> {
    match expected {
        Some(expected) if current.resource_version.as_deref() != Some(expected) => {
            Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                name: name.to_string(),
                message: format!(
                    "the object has been modified; expected resourceVersion {expected}, found {}",
                    current.resource_version.as_deref().unwrap_or("<none>")
                ),
            })
        }
        _ => Ok(()),
    }
}

fn patch_version(patch: &Value) -> Option<&str> {
    patch
        .get("metadata")
        .and_then(|m| m.get("resourceVersion"))
        .and_then(Value::as_str)
}

/// Merge `patch` into `current`; the main resource ignores `status`, the status
/// subresource ignores everything except `status`.
fn apply_patch<K>(current: &K, patch: &Value, subresource: Subresource) -> Result<K>
where
    K: Serialize + DeserializeOwned,
{
    let mut effective = patch.clone();
    if let Value::Object(body) = &mut effective {
        match subresource {
            Subresource::Main => {
                body.remove("status");
            }
            Subresource::Status => body.retain(|key, _| key == "status"),
        }
    }
    let mut value = serde_json::to_value(current)?;
    json_patch::merge(&mut value, &effective);
    Ok(serde_json::from_value(value)?)
}

/// Patch an object held in `objects` under `key`, enforcing the version precondition
fn patch_entry<Key, K>(
    objects: &mut BTreeMap<Key, K>,
    key: &Key,
    display_name: &str,
    patch: &Value,
    subresource: Subresource,
    version: String,
) -> Result<K>
where
    Key: Ord + Clone,
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone,
{
    let current = objects
        .get(key)
        .ok_or_else(|| not_found::<K>(display_name))?;
    check_precondition::<K>(display_name, current.meta(), patch_version(patch))?;

    let uid = current.meta().uid.clone();
    let mut updated = apply_patch(current, patch, subresource)?;
    updated.meta_mut().uid = uid;
    updated.meta_mut().resource_version = Some(version);
    objects.insert(key.clone(), updated.clone());
    Ok(updated)
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_claim(&self, key: &NamespacedName) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.lock().await.claims.get(key).cloned())
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = NamespacedName::from_resource(claim)?;
        let mut state = self.state.lock().await;
        if state.claims.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: PersistentVolumeClaim::kind(&()).to_string(),
                name: key.to_string(),
            });
        }

        let mut created = claim.clone();
        created.metadata.uid = None;
        created.status = Some(PersistentVolumeClaimStatus {
            phase: Some(CLAIM_PHASE_PENDING.to_string()),
            ..PersistentVolumeClaimStatus::default()
        });
        let version = state.next_version();
        stamp(&mut created.metadata, version);
        state.claims.insert(key, created.clone());
        Ok(created)
    }

    async fn patch_claim_status(
        &self,
        key: &NamespacedName,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        patch_entry(
            &mut state.claims,
            key,
            &key.to_string(),
            patch,
            Subresource::Status,
            version,
        )
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.lock().await.volumes.get(name).cloned())
    }

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        patch_entry(
            &mut state.volumes,
            &name.to_string(),
            name,
            patch,
            Subresource::Main,
            version,
        )
    }

    async fn get_reclaim(&self, key: &NamespacedName) -> Result<Option<PVCReclaim>> {
        Ok(self.state.lock().await.reclaims.get(key).cloned())
    }

    async fn list_reclaims_for_volume(&self, volume_name: &str) -> Result<Vec<PVCReclaim>> {
        let state = self.state.lock().await;
        Ok(state
            .reclaims
            .values()
            .filter(|reclaim| {
                reclaim.labels().get(RECLAIM_VOLUME_LABEL).map(String::as_str) == Some(volume_name)
            })
            .cloned()
            .collect())
    }

    async fn create_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim> {
        let key = NamespacedName::from_resource(reclaim)?;
        let mut state = self.state.lock().await;
        if state.reclaims.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: PVCReclaim::kind(&()).to_string(),
                name: key.to_string(),
            });
        }

        let mut created = reclaim.clone();
        created.metadata.uid = None;
        created.status = None;
        let version = state.next_version();
        stamp(&mut created.metadata, version);
        state.reclaims.insert(key, created.clone());
        Ok(created)
    }

    async fn replace_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim> {
        let key = NamespacedName::from_resource(reclaim)?;
        let mut state = self.state.lock().await;
        let current = state
            .reclaims
            .get(&key)
            .ok_or_else(|| not_found::<PVCReclaim>(&key.to_string()))?;
        check_precondition::<PVCReclaim>(
            &key.to_string(),
            &current.metadata,
            reclaim.metadata.resource_version.as_deref(),
        )?;

        let mut replaced = reclaim.clone();
        replaced.metadata.uid = current.metadata.uid.clone();
        replaced.status = current.status.clone();
        let version = state.next_version();
        replaced.metadata.resource_version = Some(version);
        state.reclaims.insert(key, replaced.clone());
        Ok(replaced)
    }

    async fn patch_reclaim(&self, key: &NamespacedName, patch: &Value) -> Result<PVCReclaim> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        patch_entry(
            &mut state.reclaims,
            key,
            &key.to_string(),
            patch,
            Subresource::Main,
            version,
        )
    }

    async fn patch_reclaim_status(
        &self,
        key: &NamespacedName,
        patch: &Value,
    ) -> Result<PVCReclaim> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        patch_entry(
            &mut state.reclaims,
            key,
            &key.to_string(),
            patch,
            Subresource::Status,
            version,
        )
    }

    async fn delete_reclaim(&self, key: &NamespacedName) -> Result<()> {
        self.state.lock().await.reclaims.remove(key);
        Ok(())
    }
}
