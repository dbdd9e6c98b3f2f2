//! `PVCReclaim` Custom Resource Definition
//!
//! A `PVCReclaim` shadows one `PersistentVolumeClaim` (same namespace and name)
//! and keeps enough of it around to recreate the claim once it has
//! been deleted and its `PersistentVolume` has moved to `Released`.

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeClaimSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "yibozhuang.me",
    version = "v1alpha1",
    kind = "PVCReclaim",
    plural = "pvcreclaims"
)]
#[kube(namespaced)]
#[kube(status = "PVCReclaimStatus")]
#[kube(
    printcolumn = r#"{"name":"Volume","type":"string","jsonPath":".spec.persistentVolumeRef.name"}"#
)]
#[kube(printcolumn = r#"{"name":"Restore","type":"boolean","jsonPath":".spec.restore"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.recoverStatus"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PVCReclaimSpec {
    /// Reference to the `PersistentVolume` bound by the mirrored claim. Never changes after creation.
    pub persistent_volume_ref: ObjectReference,

    /// Frozen copy of the claim spec, used verbatim when the claim is recreated
    pub persistent_volume_claim_spec: PersistentVolumeClaimSpec,

    /// Request a restore of the deleted claim onto the referenced volume
    #[serde(default)]
    pub restore: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PVCReclaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recover_status: Option<RecoverStatus>,

    /// Why the last recovery attempt failed, empty otherwise
    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,
}

/// Recovery state of a `PVCReclaim`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RecoverStatus {
    /// Claim is mirrored, no restore has been attempted
    #[default]
    NotRecovered,
    /// Claim recreation and volume rebind are underway
    RecoveryInProgress,
    /// Last restore request could not be carried out, see `reason`
    RecoveryFailed,
    /// Claim was recreated and bound, the record is about to be deleted
    RecoverySuccess,
}

impl RecoverStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRecovered => "NotRecovered",
            Self::RecoveryInProgress => "RecoveryInProgress",
            Self::RecoveryFailed => "RecoveryFailed",
            Self::RecoverySuccess => "RecoverySuccess",
        }
    }
}

impl fmt::Display for RecoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PVCReclaim {
    /// Name of the referenced `PersistentVolume`, if set
    #[must_use]
    pub fn volume_name(&self) -> Option<&str> {
        self.spec
            .persistent_volume_ref
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    #[must_use]
    pub fn recover_status(&self) -> Option<RecoverStatus> {
        self.status.as_ref().and_then(|s| s.recover_status)
    }

    #[must_use]
    pub fn is_restore_requested(&self) -> bool {
        self.spec.restore
    }
}
