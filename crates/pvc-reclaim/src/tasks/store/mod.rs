//! Resource store boundary
//!
//! Every read and write the reconcilers perform goes through [`ResourceStore`].
//! Writes are JSON merge patches that carry the `resourceVersion` of the object
//! they were derived from, so a stale write surfaces as [`Error::Conflict`]
//! instead of silently overwriting someone else's change.
//!
//! [`Error::Conflict`]: crate::tasks::types::Error::Conflict

use crate::crds::PVCReclaim;
use crate::tasks::types::{NamespacedName, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use serde_json::{Map, Value};

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::InMemoryStore;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_claim(&self, key: &NamespacedName) -> Result<Option<PersistentVolumeClaim>>;

    /// Create a claim; `Error::AlreadyExists` when the identity is taken
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Merge-patch the claim's status subresource
    async fn patch_claim_status(
        &self,
        key: &NamespacedName,
        patch: &Value,
    ) -> Result<PersistentVolumeClaim>;

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume>;

    async fn get_reclaim(&self, key: &NamespacedName) -> Result<Option<PVCReclaim>>;

    /// Records whose volume index label equals `volume_name`
    async fn list_reclaims_for_volume(&self, volume_name: &str) -> Result<Vec<PVCReclaim>>;

    async fn create_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim>;

    /// Replace metadata and spec, conditional on the object's `resourceVersion`
    async fn replace_reclaim(&self, reclaim: &PVCReclaim) -> Result<PVCReclaim>;

    async fn patch_reclaim(&self, key: &NamespacedName, patch: &Value) -> Result<PVCReclaim>;

    async fn patch_reclaim_status(&self, key: &NamespacedName, patch: &Value)
        -> Result<PVCReclaim>;

    /// Foreground delete with a zero grace period; deleting a missing record succeeds
    async fn delete_reclaim(&self, key: &NamespacedName) -> Result<()>;
}

/// Attach `metadata.resourceVersion` to a merge patch so the write is rejected
/// if the object changed since it was read.
#[must_use]
pub fn versioned_patch(resource_version: Option<&str>, mut patch: Value) -> Value {
    let Some(version) = resource_version else {
        return patch;
    };
    if let Value::Object(body) = &mut patch {
        let metadata = body
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(metadata) = metadata {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn versioned_patch_adds_resource_version() {
        let patch = versioned_patch(Some("42"), json!({"spec": {"restore": false}}));
        assert_eq!(
            patch,
            json!({"metadata": {"resourceVersion": "42"}, "spec": {"restore": false}})
        );
    }

    #[test]
    fn versioned_patch_keeps_existing_metadata() {
        let patch = versioned_patch(
            Some("7"),
            json!({"metadata": {"annotations": {"a": null}}}),
        );
        assert_eq!(
            patch,
            json!({"metadata": {"annotations": {"a": null}, "resourceVersion": "7"}})
        );
    }

    #[test]
    fn versioned_patch_without_version_is_unchanged() {
        let body = json!({"status": {"phase": "Bound"}});
        assert_eq!(versioned_patch(None, body.clone()), body);
    }
}
