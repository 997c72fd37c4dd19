//! Read-through indexes over watched resources.
//!
//! Each index wraps a [`reflector::Store`] kept current by a background
//! watcher, and exposes pure lookups. Reconcilers and webhooks only read
//! from them.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::crd::{ImageReplication, PodSetting, ReplicationStatus, Space, labels};

/// Start a reflector for `api` and return its store.
///
/// The backing watcher runs on a detached task with the default backoff.
pub fn spawn_store<K>(api: Api<K>, config: WatcherConfig) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, config))
        .default_backoff()
        .touched_objects();
    tokio::spawn(async move {
        stream
            .for_each(|res| async move {
                if let Err(e) = res {
                    debug!(error = %e, "Index watcher error");
                }
            })
            .await;
    });
    reader
}

/// Namespaces by name, with team/user relationships derived from labels.
#[derive(Clone)]
pub struct NamespaceIndex {
    store: Store<Namespace>,
}

impl NamespaceIndex {
    pub fn new(store: Store<Namespace>) -> Self {
        Self { store }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.store.get(&ObjectRef::new(name))
    }

    /// Team label of the named namespace.
    pub fn team_of(&self, name: &str) -> Option<String> {
        self.get(name)
            .and_then(|ns| ns.labels().get(labels::TEAM).cloned())
    }

    /// Names of every user namespace belonging to `team`, sorted.
    pub fn user_namespaces(&self, team: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .state()
            .iter()
            .filter(|ns| {
                Space::from_labels(ns.labels()) == Some(Space::User)
                    && ns.labels().get(labels::TEAM).map(String::as_str) == Some(team)
            })
            .map(|ns| ns.name_any())
            .collect();
        names.sort();
        names
    }

    pub async fn wait_until_ready(&self) {
        if self.store.wait_until_ready().await.is_err() {
            info!("Namespace index writer dropped before initial sync");
        }
    }
}

/// Team PodSettings keyed by their `orbit/team` label.
#[derive(Clone)]
pub struct PodSettingIndex {
    store: Store<PodSetting>,
}

impl PodSettingIndex {
    pub fn new(store: Store<PodSetting>) -> Self {
        Self { store }
    }

    /// PodSettings of `team`, sorted by name so application order is stable.
    pub fn for_team(&self, team: &str) -> Vec<Arc<PodSetting>> {
        let mut settings: Vec<Arc<PodSetting>> = self
            .store
            .state()
            .into_iter()
            .filter(|ps| {
                Space::from_labels(ps.labels()) == Some(Space::Team) && ps.team() == Some(team)
            })
            .collect();
        settings.sort_by_key(|ps| ps.name_any());
        settings
    }

    pub async fn wait_until_ready(&self) {
        if self.store.wait_until_ready().await.is_err() {
            info!("PodSetting index writer dropped before initial sync");
        }
    }
}

/// ImageReplications keyed by destination image.
#[derive(Clone)]
pub struct ReplicationIndex {
    store: Store<ImageReplication>,
}

impl ReplicationIndex {
    pub fn new(store: Store<ImageReplication>) -> Self {
        Self { store }
    }

    fn for_destination(&self, destination: &str) -> Vec<Arc<ImageReplication>> {
        self.store
            .state()
            .into_iter()
            .filter(|ir| ir.spec.destination == destination)
            .collect()
    }

    /// The replication `name`, in any status, exists for `destination`.
    pub fn contains(&self, destination: &str, name: &str) -> bool {
        self.for_destination(destination)
            .iter()
            .any(|ir| ir.metadata.name.as_deref() == Some(name))
    }

    /// A non-failed replication exists for `destination`.
    pub fn is_live(&self, destination: &str) -> bool {
        self.for_destination(destination)
            .iter()
            .any(|ir| ir.replication_status().is_live())
    }

    /// A replication for `destination` exhausted its attempts.
    pub fn is_exhausted(&self, destination: &str) -> bool {
        self.for_destination(destination)
            .iter()
            .any(|ir| ir.replication_status() == ReplicationStatus::MaxAttemptsExceeded)
    }

    pub async fn wait_until_ready(&self) {
        if self.store.wait_until_ready().await.is_err() {
            info!("ImageReplication index writer dropped before initial sync");
        }
    }
}
