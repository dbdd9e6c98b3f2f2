use crate::tasks::config::ControllerConfig;
use crate::tasks::store::ResourceStore;
use dashmap::DashMap;
use kube::runtime::reflector::ObjectRef;
use kube::Resource;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Label on a `PVCReclaim` naming its `PersistentVolume`; used to route volume events back to records
pub const RECLAIM_VOLUME_LABEL: &str = "pvc-reclaim.yibozhuang.me/pv-name";

/// Volume annotations containing this prefix survive a rebind, everything else is stripped
pub const PROVISIONER_ANNOTATION_PREFIX: &str = "pv.kubernetes.io";

pub const CLAIM_PHASE_BOUND: &str = "Bound";
pub const CLAIM_PHASE_PENDING: &str = "Pending";
pub const VOLUME_PHASE_BOUND: &str = "Bound";
pub const VOLUME_PHASE_RELEASED: &str = "Released";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("PV {volume} bound to PVC {claim} not found")]
    VolumeNotFound { volume: String, claim: String },

    #[error("{kind} {name} is missing required field {field}")]
    MissingField {
        kind: String,
        name: String,
        field: &'static str,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    StoreError(String),
}

impl Error {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Namespace/name identity shared by a claim and its `PVCReclaim`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a namespaced object; errors when either part is missing
    pub fn from_resource<K>(obj: &K) -> Result<Self>
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = obj.meta();
        let kind = K::kind(&()).to_string();
        let name = meta.name.clone().ok_or_else(|| Error::MissingField {
            kind: kind.clone(),
            name: "<unnamed>".to_string(),
            field: "metadata.name",
        })?;
        let namespace = meta.namespace.clone().ok_or_else(|| Error::MissingField {
            kind,
            name: name.clone(),
            field: "metadata.namespace",
        })?;
        Ok(Self { namespace, name })
    }

    #[must_use]
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Consecutive failures of one object and when the last one happened
#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last: Instant,
}

/// Shared state handed to every reconcile
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub config: Arc<ControllerConfig>,
    failures: DashMap<String, FailureRecord>,
}

impl Context {
    pub fn new(store: Arc<dyn ResourceStore>, config: Arc<ControllerConfig>) -> Self {
        Self {
            store,
            config,
            failures: DashMap::new(),
        }
    }

    /// Count one more consecutive failure for `key` and return the new total
    pub fn record_failure(&self, key: &str) -> u32 {
        let now = Instant::now();
        let mut entry = self
            .failures
            .entry(key.to_string())
            .or_insert(FailureRecord { count: 0, last: now });
        let record = entry.value_mut();
        record.count = record.count.saturating_add(1);
        record.last = now;
        record.count
    }

    pub fn clear_failures(&self, key: &str) {
        self.failures.remove(key);
    }

    #[must_use]
    pub fn failure_count(&self, key: &str) -> u32 {
        self.failures.get(key).map_or(0, |record| record.count)
    }

    /// Drop counters whose last failure is at least `idle` old. A failing object
    /// is retried well within the backoff cap, so such entries belong to objects
    /// that were deleted or have not been retried since.
    pub fn prune_failures(&self, idle: Duration) -> usize {
        let before = self.failures.len();
        self.failures.retain(|_, record| record.last.elapsed() < idle);
        before - self.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::InMemoryStore;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use kube::api::ObjectMeta;

    #[test]
    fn identity_from_claim() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-1".to_string()),
                namespace: Some("ns".to_string()),
                ..ObjectMeta::default()
            },
            ..PersistentVolumeClaim::default()
        };

        let key = NamespacedName::from_resource(&claim).unwrap();
        assert_eq!(key, NamespacedName::new("ns", "data-1"));
        assert_eq!(key.to_string(), "ns/data-1");
    }

    #[test]
    fn identity_requires_namespace() {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-1".to_string()),
                ..ObjectMeta::default()
            },
            ..PersistentVolumeClaim::default()
        };

        let err = NamespacedName::from_resource(&claim).unwrap_err();
        assert!(matches!(
            err,
            Error::MissingField {
                field: "metadata.namespace",
                ..
            }
        ));
    }

    #[test]
    fn failure_counter_resets() {
        let ctx = Context::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ControllerConfig::default()),
        );

        assert_eq!(ctx.record_failure("reclaim:ns/data-1"), 1);
        assert_eq!(ctx.record_failure("reclaim:ns/data-1"), 2);
        assert_eq!(ctx.failure_count("claim:ns/data-1"), 0);

        ctx.clear_failures("reclaim:ns/data-1");
        assert_eq!(ctx.failure_count("reclaim:ns/data-1"), 0);
    }

    #[test]
    fn idle_failure_counters_are_pruned() {
        let ctx = Context::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ControllerConfig::default()),
        );
        ctx.record_failure("reclaim:ns/deleted");
        ctx.record_failure("claim:ns/deleted");

        assert_eq!(ctx.prune_failures(Duration::from_secs(3600)), 0);
        assert_eq!(ctx.failure_count("reclaim:ns/deleted"), 1);

        assert_eq!(ctx.prune_failures(Duration::ZERO), 2);
        assert_eq!(ctx.failure_count("reclaim:ns/deleted"), 0);
        assert_eq!(ctx.failure_count("claim:ns/deleted"), 0);
    }
}
