//! Volume event router
//!
//! Turns `PersistentVolume` watch events into reconcile requests for the
//! `PVCReclaim` records that reference the volume, found through the volume
//! index label.

use crate::tasks::store::ResourceStore;
use crate::tasks::types::NamespacedName;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::watcher;
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub enum VolumeEvent {
    Created(PersistentVolume),
    Updated(PersistentVolume),
    Deleted(PersistentVolume),
}

impl VolumeEvent {
    #[must_use]
    pub fn volume(&self) -> &PersistentVolume {
        match self {
            Self::Created(pv) | Self::Updated(pv) | Self::Deleted(pv) => pv,
        }
    }

    /// Creation events are dropped: nothing can reference a volume that did not exist yet
    #[must_use]
    pub fn should_route(&self) -> bool {
        !matches!(self, Self::Created(_))
    }
}

/// Classifies raw watcher events into create, update and delete.
///
/// The first sighting of a volume name counts as creation, including the
/// initial listing, so replayed objects do not fan out on startup. A relist
/// after the watch desyncs reports, as deleted, every known volume it no
/// longer contains, since the delete itself was missed during the gap.
#[derive(Debug, Default)]
pub struct VolumeEventFilter {
    seen: HashMap<String, PersistentVolume>,
    relisted: Option<HashSet<String>>,
}

impl VolumeEventFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, event: watcher::Event<PersistentVolume>) -> Vec<VolumeEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(pv) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(pv.name_any());
                }
                vec![self.observe(pv)]
            }
            watcher::Event::Apply(pv) => vec![self.observe(pv)],
            watcher::Event::Delete(pv) => {
                self.seen.remove(&pv.name_any());
                vec![VolumeEvent::Deleted(pv)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let missed: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|name| !relisted.contains(*name))
                    .cloned()
                    .collect();
                missed
                    .into_iter()
                    .filter_map(|name| self.seen.remove(&name))
                    .map(|pv| {
                        debug!(pv = %pv.name_any(), "PV missing from relist, treating as deleted");
                        VolumeEvent::Deleted(pv)
                    })
                    .collect()
            }
        }
    }

    fn observe(&mut self, pv: PersistentVolume) -> VolumeEvent {
        match self.seen.insert(pv.name_any(), pv.clone()) {
            None => VolumeEvent::Created(pv),
            Some(_) => VolumeEvent::Updated(pv),
        }
    }
}

/// Identities of the records that reference `volume_name`. Lookup failures
/// yield nothing; the next event for the volume tries again.
#[instrument(skip(store))]
pub async fn reclaims_for_volume(
    store: &dyn ResourceStore,
    volume_name: &str,
) -> Vec<NamespacedName> {
    match store.list_reclaims_for_volume(volume_name).await {
        Ok(reclaims) => reclaims
            .iter()
            .filter_map(|reclaim| NamespacedName::from_resource(reclaim).ok())
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list PVCReclaims for PV");
            Vec::new()
        }
    }
}

pub async fn route_volume_event(
    store: &dyn ResourceStore,
    event: &VolumeEvent,
) -> Vec<NamespacedName> {
    if !event.should_route() {
        debug!(pv = %event.volume().name_any(), "Ignoring PV creation event");
        return Vec::new();
    }
    reclaims_for_volume(store, &event.volume().name_any()).await
}
