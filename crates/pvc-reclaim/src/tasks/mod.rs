use crate::crds::PVCReclaim;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod mirror;
pub mod reclaim;
pub mod router;
pub mod simulate;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use mirror::{reconcile_claim, MirrorOutcome};
pub use reclaim::{reconcile_reclaim, ReclaimOutcome};
pub use router::{route_volume_event, VolumeEvent, VolumeEventFilter};
pub use types::{Context, Error, NamespacedName, Result};

use store::{KubeStore, ResourceStore};

/// Main entry point: runs the claim mirror and reclaim controllers until shutdown
#[instrument(skip(client, config), fields(namespace = ?config.namespace))]
pub async fn run_reclaim_controllers(client: Client, config: Arc<ControllerConfig>) -> Result<()> {
    info!("Starting PVC reclaim controllers");

    let store: Arc<dyn ResourceStore> =
        Arc::new(KubeStore::new(client.clone(), config.namespace.clone()));
    let context = Arc::new(Context::new(store, config));

    let claim_controller_handle = tokio::spawn({
        let client = client.clone();
        let context = context.clone();
        async move { run_claim_controller(client, context).await }
    });

    let reclaim_controller_handle = tokio::spawn({
        let context = context.clone();
        async move { run_reclaim_controller(client, context).await }
    });

    match tokio::try_join!(claim_controller_handle, reclaim_controller_handle) {
        Ok((claim_result, reclaim_result)) => {
            if let Err(e) = claim_result {
                error!("PVC controller failed: {:?}", e);
            }
            if let Err(e) = reclaim_result {
                error!("PVCReclaim controller failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("Controller task join error: {:?}", e);
        }
    }

    info!("PVC reclaim controllers shutting down");
    Ok(())
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

/// Run the PersistentVolumeClaim mirror controller, triggered by claims and their records
async fn run_claim_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting PVC controller");

    let namespace = context.config.namespace.clone();
    let claims_api: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace.as_deref());
    let reclaims_api: Api<PVCReclaim> = scoped_api(client, namespace.as_deref());
    let watcher_config = Config::default().any_semantic();

    // A record deleted out-of-band is rebuilt from its claim
    Controller::new(claims_api, watcher_config.clone())
        .watches(reclaims_api, watcher_config, claim_for_reclaim)
        .shutdown_on_signal()
        .run(reconcile_claim_object, error_policy_claim, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("pvc_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((object_ref, _action)) => {
                        debug!(resource = %object_ref, "PVC reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = ?reconciliation_err, "PVC reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("PVC controller shutting down");
    Ok(())
}

/// Run the PVCReclaim controller, triggered by records and their volumes
async fn run_reclaim_controller(client: Client, context: Arc<Context>) -> Result<()> {
    info!("Starting PVCReclaim controller");

    let reclaims_api: Api<PVCReclaim> =
        scoped_api(client.clone(), context.config.namespace.as_deref());
    let volumes_api: Api<PersistentVolume> = Api::all(client);

    Controller::new(reclaims_api, Config::default().any_semantic())
        .reconcile_on(volume_triggers(volumes_api, context.store.clone()))
        .shutdown_on_signal()
        .run(reconcile_reclaim_object, error_policy_reclaim, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("pvc_reclaim_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((object_ref, _action)) => {
                        debug!(resource = %object_ref, "PVCReclaim reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = ?reconciliation_err, "PVCReclaim reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("PVCReclaim controller shutting down");
    Ok(())
}

/// The claim a record mirrors: same namespace and name
fn claim_for_reclaim(reclaim: PVCReclaim) -> Option<ObjectRef<PersistentVolumeClaim>> {
    let namespace = reclaim.namespace()?;
    Some(ObjectRef::new(&reclaim.name_any()).within(&namespace))
}

/// Record references to reconcile whenever a referenced volume is updated or deleted
fn volume_triggers(
    volumes_api: Api<PersistentVolume>,
    store: Arc<dyn ResourceStore>,
) -> impl Stream<Item = ObjectRef<PVCReclaim>> + Send + 'static {
    let mut filter = VolumeEventFilter::new();

    watcher::watcher(volumes_api, Config::default())
        .default_backoff()
        .flat_map(move |event| {
            let classified = match event {
                Ok(event) => filter.classify(event),
                Err(e) => {
                    warn!(error = %e, "PV watch error");
                    Vec::new()
                }
            };
            futures::stream::iter(classified)
        })
        .then(move |event| {
            let store = store.clone();
            async move { route_volume_event(store.as_ref(), &event).await }
        })
        .flat_map(|keys| {
            futures::stream::iter(keys.into_iter().map(|key| key.object_ref::<PVCReclaim>()))
        })
}

fn claim_failure_key(key: &NamespacedName) -> String {
    format!("pvc:{key}")
}

fn reclaim_failure_key(key: &NamespacedName) -> String {
    format!("pvcreclaim:{key}")
}

async fn reconcile_claim_object(
    claim: Arc<PersistentVolumeClaim>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let key = NamespacedName::from_resource(claim.as_ref())?;
    let outcome = reconcile_claim(&key, &ctx).await?;
    debug!(pvc = %key, outcome = ?outcome, "PVC reconciled");
    ctx.clear_failures(&claim_failure_key(&key));
    Ok(Action::await_change())
}

async fn reconcile_reclaim_object(reclaim: Arc<PVCReclaim>, ctx: Arc<Context>) -> Result<Action> {
    let key = NamespacedName::from_resource(reclaim.as_ref())?;
    let outcome = reconcile_reclaim(&key, &ctx).await?;
    debug!(pvc_reclaim = %key, outcome = ?outcome, "PVCReclaim reconciled");
    ctx.clear_failures(&reclaim_failure_key(&key));
    Ok(Action::await_change())
}

/// Requeue with exponential backoff keyed on the failing object
fn backoff_action(ctx: &Context, failure_key: &str, err: &Error) -> Action {
    let pruned = ctx.prune_failures(stale_failure_age(&ctx.config));
    if pruned > 0 {
        debug!(pruned, "Dropped failure counters of objects no longer retried");
    }
    let failures = ctx.record_failure(failure_key);
    let delay = ctx.config.backoff.delay_for(failures);
    warn!(
        error = %err,
        object = %failure_key,
        failures,
        requeue_after_secs = delay.as_secs(),
        "Reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}

/// Objects still failing are retried at most `maxSeconds` apart, so a counter
/// idle for twice that long belongs to an object that is gone
fn stale_failure_age(config: &ControllerConfig) -> Duration {
    Duration::from_secs(config.backoff.max_seconds.saturating_mul(2).max(1))
}

fn error_policy_claim(claim: Arc<PersistentVolumeClaim>, err: &Error, ctx: Arc<Context>) -> Action {
    match NamespacedName::from_resource(claim.as_ref()) {
        Ok(key) => backoff_action(&ctx, &claim_failure_key(&key), err),
        Err(_) => Action::await_change(),
    }
}

fn error_policy_reclaim(reclaim: Arc<PVCReclaim>, err: &Error, ctx: Arc<Context>) -> Action {
    match NamespacedName::from_resource(reclaim.as_ref()) {
        Ok(key) => backoff_action(&ctx, &reclaim_failure_key(&key), err),
        Err(_) => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::InMemoryStore;

    #[test]
    fn backoff_grows_per_object_and_resets() {
        let ctx = Context::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ControllerConfig::default()),
        );
        let key = NamespacedName::new("ns", "data-1");
        let err = Error::StoreError("boom".to_string());

        assert_eq!(
            backoff_action(&ctx, &reclaim_failure_key(&key), &err),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            backoff_action(&ctx, &reclaim_failure_key(&key), &err),
            Action::requeue(Duration::from_secs(10))
        );
        // Claim and record failures are tracked independently
        assert_eq!(
            backoff_action(&ctx, &claim_failure_key(&key), &err),
            Action::requeue(Duration::from_secs(5))
        );

        ctx.clear_failures(&reclaim_failure_key(&key));
        assert_eq!(
            backoff_action(&ctx, &reclaim_failure_key(&key), &err),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn record_events_map_to_their_claim() {
        let mut reclaim = PVCReclaim::new("data-1", crate::crds::PVCReclaimSpec::default());
        reclaim.metadata.namespace = Some("ns".to_string());

        let claim_ref = claim_for_reclaim(reclaim.clone()).unwrap();
        assert_eq!(
            claim_ref,
            ObjectRef::<PersistentVolumeClaim>::new("data-1").within("ns")
        );

        reclaim.metadata.namespace = None;
        assert!(claim_for_reclaim(reclaim).is_none());
    }

    #[test]
    fn stale_age_tracks_backoff_cap() {
        let config = ControllerConfig::default();
        assert_eq!(stale_failure_age(&config), Duration::from_secs(600));
    }
}
