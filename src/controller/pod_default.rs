//! PodDefault propagation.
//!
//! Team-level PodDefaults are mirrored into every user namespace of their
//! team. Fan-out is best effort: a failure in one namespace is logged and the
//! remaining namespaces are still processed.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::crd::{PodDefault, Space, labels};
use crate::index::NamespaceIndex;
use crate::watch::Reconciler;

/// PodDefault writes needed by the reconcilers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodDefaultClient: Send + Sync {
    /// Create `pod_default` in `namespace`, or patch it if it already exists.
    async fn apply(&self, namespace: &str, pod_default: &PodDefault) -> Result<()>;

    /// Delete a PodDefault. Deleting a missing object succeeds.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`PodDefaultClient`] backed by the Kubernetes API.
pub struct KubePodDefaults {
    client: Client,
}

impl KubePodDefaults {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDefaultClient for KubePodDefaults {
    async fn apply(&self, namespace: &str, pod_default: &PodDefault) -> Result<()> {
        let api: Api<PodDefault> = Api::namespaced(self.client.clone(), namespace);
        let name = pod_default.name_any();
        let mut obj = pod_default.clone();
        obj.metadata.namespace = Some(namespace.to_string());
        obj.metadata.resource_version = None;
        obj.metadata.uid = None;

        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                info!(namespace = %namespace, name = %name, "Created PodDefault");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                let patch = json!({
                    "metadata": { "labels": obj.metadata.labels },
                    "spec": obj.spec,
                });
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(namespace = %namespace, name = %name, "Patched existing PodDefault");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PodDefault> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %namespace, name = %name, "Deleted PodDefault");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Apply `pod_default` to every namespace in `namespaces`. Returns the
/// number of namespaces that failed.
pub async fn apply_to_namespaces(
    client: &dyn PodDefaultClient,
    namespaces: &[String],
    pod_default: &PodDefault,
) -> usize {
    let mut failed = 0;
    for ns in namespaces {
        if let Err(e) = client.apply(ns, pod_default).await {
            warn!(namespace = %ns, name = %pod_default.name_any(), error = %e, "Failed to apply PodDefault");
            failed += 1;
        }
    }
    failed
}

/// Delete the PodDefault `name` from every namespace in `namespaces`.
/// Returns the number of namespaces that failed.
pub async fn delete_from_namespaces(
    client: &dyn PodDefaultClient,
    namespaces: &[String],
    name: &str,
) -> usize {
    let mut failed = 0;
    for ns in namespaces {
        if let Err(e) = client.delete(ns, name).await {
            warn!(namespace = %ns, name = %name, error = %e, "Failed to delete PodDefault");
            failed += 1;
        }
    }
    failed
}

/// Mirrors team-level PodDefaults into user namespaces.
pub struct PodDefaultReconciler {
    namespaces: NamespaceIndex,
    client: Arc<dyn PodDefaultClient>,
}

impl PodDefaultReconciler {
    pub fn new(namespaces: NamespaceIndex, client: Arc<dyn PodDefaultClient>) -> Self {
        Self { namespaces, client }
    }

    fn team_of(pd: &PodDefault) -> Result<Option<String>> {
        if pd.space() != Some(Space::Team) {
            debug!(name = %pd.name_any(), "Ignoring PodDefault outside team space");
            return Ok(None);
        }
        match pd.labels().get(labels::TEAM) {
            Some(team) => Ok(Some(team.clone())),
            None => Err(Error::MissingField(format!(
                "PodDefault {}/{} label {}",
                pd.namespace().unwrap_or_default(),
                pd.name_any(),
                labels::TEAM
            ))),
        }
    }

    async fn propagate(&self, pd: &PodDefault) -> Result<()> {
        let Some(team) = Self::team_of(pd)? else {
            return Ok(());
        };
        let targets = self.namespaces.user_namespaces(&team);
        let failed = apply_to_namespaces(self.client.as_ref(), &targets, &pd.mirror()).await;
        info!(
            name = %pd.name_any(),
            team = %team,
            namespaces = targets.len(),
            failed,
            "Propagated PodDefault to user namespaces"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconciler<PodDefault> for PodDefaultReconciler {
    async fn on_added(&self, obj: &PodDefault) -> Result<()> {
        self.propagate(obj).await
    }

    async fn on_modified(&self, obj: &PodDefault) -> Result<()> {
        self.propagate(obj).await
    }

    async fn on_deleted(&self, obj: &PodDefault) -> Result<()> {
        let Some(team) = Self::team_of(obj)? else {
            return Ok(());
        };
        let targets = self.namespaces.user_namespaces(&team);
        let failed = delete_from_namespaces(self.client.as_ref(), &targets, &obj.name_any()).await;
        info!(
            name = %obj.name_any(),
            team = %team,
            namespaces = targets.len(),
            failed,
            "Removed PodDefault from user namespaces"
        );
        Ok(())
    }
}
