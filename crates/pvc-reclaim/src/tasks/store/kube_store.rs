//! [`ResourceStore`] backed by the Kubernetes API server

use super::ResourceStore;
use crate::crds::PVCReclaim;
use crate::tasks::types::{Error, NamespacedName, Result, RECLAIM_VOLUME_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
}

impl KubeStore {
    /// `namespace` limits label lookups to one namespace; `None` searches the whole cluster
    #[must_use]
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn reclaims(&self, namespace: &str) -> Api<PVCReclaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String {
    K::kind(&()).to_string()
}

/// 409 on create means the name is taken
fn map_create_error<K: Resource<DynamicType = ()>>(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::AlreadyExists {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

/// 409 on update or patch means the resourceVersion precondition failed
fn map_write_error<K: Resource<DynamicType = ()>>(name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
            message: ae.message,
        },
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

fn missing_field<K: Resource<DynamicType = ()>>(field: &'static str) -> Error {
    Error::MissingField {
        kind: kind_of::<K>(),
        name: "<unnamed>".to_string(),
        field,
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_claim(&self, key: &NamespacedName) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim
            .namespace()
            .ok_or_else(|| missing_field::<PersistentVolumeClaim>("metadata.namespace"))?;
        let name = claim.name_any();
        self.claims(&namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| map_create_error::<PersistentVolumeClaim>(&name, e))
    }

    async fn patch_claim_status(
        &self,
        key: &NamespacedName,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim> {
        self.claims(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error::<PersistentVolumeClaim>(&key.to_string(), e))
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes().get_opt(name).await?)
    }

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume> {
        self.volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error::<PersistentVolume>(name, e))
    }

    async fn get_reclaim(&self, key: &NamespacedName) -> Result<Option<PVCReclaim>> {
        Ok(self.reclaims(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list_reclaims_for_volume(&self, volume_name: &str) -> Result<Vec<PVCReclaim>> {
        let api: Api<PVCReclaim> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().labels(&format!("{RECLAIM_VOLUME_LABEL}={volume_name}"));
        let list = api.list(&params).await?;
        debug!(pv = %volume_name, count = list.items.len(), "Listed PVCReclaims for PV");
        Ok(list.items)
    }

    async fn create_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim> {
        let namespace = reclaim
            .namespace()
            .ok_or_else(|| missing_field::<PVCReclaim>("metadata.namespace"))?;
        let name = reclaim.name_any();
        self.reclaims(&namespace)
            .create(&PostParams::default(), reclaim)
            .await
            .map_err(|e| map_create_error::<PVCReclaim>(&name, e))
    }

    async fn replace_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim> {
        let key = NamespacedName::from_resource(reclaim)?;
        self.reclaims(&key.namespace)
            .replace(&key.name, &PostParams::default(), reclaim)
            .await
            .map_err(|e| map_write_error::<PVCReclaim>(&key.to_string(), e))
    }

    async fn patch_reclaim(&self, key: &NamespacedName, patch: &Value) -> Result<PVCReclaim> {
        self.reclaims(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error::<PVCReclaim>(&key.to_string(), e))
    }

    async fn patch_reclaim_status(
        &self,
        key: &NamespacedName,
        patch: &Value,
    ) -> Result<PVCReclaim> {
        self.reclaims(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error::<PVCReclaim>(&key.to_string(), e))
    }

    async fn delete_reclaim(&self, key: &NamespacedName) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::foreground()
        };
        match self.reclaims(&key.namespace).delete(&key.name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pvc_reclaim = %key, "PVCReclaim already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from api server"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn create_conflict_maps_to_already_exists() {
        let err = map_create_error::<PersistentVolumeClaim>("data-1", api_error(409, "AlreadyExists"));
        assert!(err.is_already_exists());
    }

    #[test]
    fn write_conflict_maps_to_conflict() {
        let err = map_write_error::<PVCReclaim>("ns/data-1", api_error(409, "Conflict"));
        assert!(err.is_conflict());
        assert!(err.to_string().contains("PVCReclaim ns/data-1"));
    }

    #[test]
    fn write_not_found_maps_to_not_found() {
        let err = map_write_error::<PersistentVolume>("pv-1", api_error(404, "NotFound"));
        assert!(err.is_not_found());
    }

    #[test]
    fn server_errors_pass_through() {
        let err = map_write_error::<PersistentVolume>("pv-1", api_error(500, "InternalError"));
        assert!(matches!(err, Error::KubeError(_)));
    }
}
