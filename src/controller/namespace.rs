//! Namespace reconciler.
//!
//! User namespaces get one Helm release per chart in their team's user-space
//! repository, installed into the team namespace as `<namespace>-<chart>`.
//! Deleting a user namespace uninstalls those releases; deleting a team
//! namespace tears down the team's profiles and every namespace labeled with
//! the team.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams};
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::pod_default::PodDefaultClient;
use crate::controller::error::{Error, Result};
use crate::crd::{PodDefault, Space, labels};
use crate::external::{HelmClient, InstallRequest};
use crate::index::PodSettingIndex;
use crate::watch::Reconciler;

/// ConfigMap in each team namespace describing the team.
pub const TEAM_CONTEXT_CONFIGMAP: &str = "orbit-team-context";
/// Key in [`TEAM_CONTEXT_CONFIGMAP`] holding the JSON team context.
pub const TEAM_CONTEXT_KEY: &str = "team";

/// The parts of the team context this reconciler reads.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TeamContext {
    #[serde(rename = "UserHelmRepository")]
    pub user_helm_repository: String,
}

/// Helm repository alias for a team's user-space charts.
pub fn user_space_repo(team: &str) -> String {
    format!("{team}--userspace")
}

/// Release name of `chart` for a user namespace.
pub fn release_name(namespace: &str, chart: &str) -> String {
    format!("{namespace}-{chart}")
}

/// Cluster reads and deletes needed by the namespace reconciler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Team context for `team`, or `None` if the ConfigMap is missing.
    async fn team_context(&self, team: &str) -> Result<Option<TeamContext>>;

    /// Delete the kubeflow Profiles labeled with `team`. Returns how many.
    async fn delete_profiles(&self, team: &str) -> Result<usize>;

    /// Delete every namespace labeled with `team`. Returns how many.
    async fn delete_team_namespaces(&self, team: &str) -> Result<usize>;
}

/// [`NamespaceClient`] backed by the Kubernetes API.
pub struct KubeNamespaces {
    client: Client,
}

impl KubeNamespaces {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn profiles(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("kubeflow.org", "v1", "Profile");
        Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk))
    }
}

fn team_selector(team: &str) -> ListParams {
    ListParams::default().labels(&format!("{}={team}", labels::TEAM))
}

#[async_trait]
impl NamespaceClient for KubeNamespaces {
    async fn team_context(&self, team: &str) -> Result<Option<TeamContext>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), team);
        let Some(cm) = api.get_opt(TEAM_CONTEXT_CONFIGMAP).await? else {
            return Ok(None);
        };
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(TEAM_CONTEXT_KEY))
            .ok_or_else(|| {
                Error::MissingField(format!(
                    "{team}/{TEAM_CONTEXT_CONFIGMAP} key {TEAM_CONTEXT_KEY}"
                ))
            })?;
        Ok(Some(serde_json::from_str(raw)?))
    }

    async fn delete_profiles(&self, team: &str) -> Result<usize> {
        let api = self.profiles();
        let profiles = api.list(&team_selector(team)).await?;
        let mut deleted = 0;
        for profile in profiles {
            match api.delete(&profile.name_any(), &DeleteParams::default()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    async fn delete_team_namespaces(&self, team: &str) -> Result<usize> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = api.list(&team_selector(team)).await?;
        let mut deleted = 0;
        for ns in namespaces {
            let name = ns.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(namespace = %name, team = %team, "Deleting team namespace");
                    deleted += 1;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}

/// Identity of a user namespace, read from its labels and annotations.
#[derive(Clone, Debug, PartialEq, Eq)]
struct UserSpace {
    name: String,
    team: String,
    user: String,
    email: String,
    efs_access_point: String,
}

impl UserSpace {
    fn from_namespace(ns: &Namespace) -> Result<Self> {
        let name = ns.name_any();
        let l = ns.labels();
        let required = |key: &str| {
            l.get(key)
                .cloned()
                .ok_or_else(|| Error::MissingField(format!("namespace {name} label {key}")))
        };
        required(labels::ENV)?;
        let team = required(labels::TEAM)?;
        let user = required(labels::USER)?;
        let email = ns
            .annotations()
            .get(labels::OWNER_ANNOTATION)
            .cloned()
            .ok_or_else(|| {
                Error::MissingField(format!(
                    "namespace {name} annotation {}",
                    labels::OWNER_ANNOTATION
                ))
            })?;
        Ok(Self {
            efs_access_point: l.get(labels::EFS_ACCESS_POINT_ID).cloned().unwrap_or_default(),
            name,
            team,
            user,
            email,
        })
    }

    fn chart_values(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("user".to_string(), self.user.clone()),
            ("user_email".to_string(), self.email.clone()),
            ("namespace".to_string(), self.name.clone()),
            ("user_efsapid".to_string(), self.efs_access_point.clone()),
        ])
    }
}

pub struct NamespaceReconciler {
    client: Arc<dyn NamespaceClient>,
    helm: Arc<dyn HelmClient>,
    pod_settings: PodSettingIndex,
    pod_defaults: Arc<dyn PodDefaultClient>,
    /// Wait between deleting a team's profiles and its namespaces.
    teardown_delay: Duration,
}

impl NamespaceReconciler {
    pub fn new(
        client: Arc<dyn NamespaceClient>,
        helm: Arc<dyn HelmClient>,
        pod_settings: PodSettingIndex,
        pod_defaults: Arc<dyn PodDefaultClient>,
        teardown_delay: Duration,
    ) -> Self {
        Self {
            client,
            helm,
            pod_settings,
            pod_defaults,
            teardown_delay,
        }
    }

    /// Add the team's user-space repository and return its alias.
    async fn prepare_repo(&self, team: &str) -> Result<String> {
        let context = self.client.team_context(team).await?.ok_or_else(|| {
            Error::MissingField(format!("{team}/{TEAM_CONTEXT_CONFIGMAP}"))
        })?;
        let repo = user_space_repo(team);
        self.helm
            .repo_add(&repo, &context.user_helm_repository)
            .await?;
        Ok(repo)
    }

    async fn installed_releases(&self, team: &str) -> Result<HashSet<String>> {
        Ok(self
            .helm
            .list_releases(team)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    async fn install_user_space(&self, space: &UserSpace) -> Result<()> {
        let repo = self.prepare_repo(&space.team).await?;
        let charts = self.helm.search_repo(&repo).await?;
        let installed = self.installed_releases(&space.team).await?;
        debug!(namespace = %space.name, releases = ?installed, "Current team releases");

        for chart in &charts {
            let release = release_name(&space.name, chart.chart_name());
            if installed.contains(&release) {
                debug!(release = %release, "Release already installed");
                continue;
            }
            let request = InstallRequest {
                release: release.clone(),
                chart: chart.name.clone(),
                namespace: space.team.clone(),
                values: space.chart_values(),
            };
            if let Err(e) = self.helm.upgrade_install(&request).await {
                warn!(namespace = %space.name, release = %release, error = %e, "Failed to install chart");
            }
        }
        Ok(())
    }

    /// Mirror the team's PodDefaults into a new user namespace.
    async fn bootstrap_pod_defaults(&self, space: &UserSpace) {
        for ps in self.pod_settings.for_team(&space.team) {
            if !ps.is_propagated() {
                continue;
            }
            let mirror = PodDefault::for_pod_setting(&ps).mirror();
            if let Err(e) = self.pod_defaults.apply(&space.name, &mirror).await {
                warn!(
                    namespace = %space.name,
                    name = %ps.name_any(),
                    error = %e,
                    "Failed to copy PodDefault into user namespace"
                );
            }
        }
    }

    async fn uninstall_user_space(&self, space: &UserSpace) -> Result<()> {
        let repo = self.prepare_repo(&space.team).await?;
        let charts = self.helm.search_repo(&repo).await?;
        let installed = self.installed_releases(&space.team).await?;

        for chart in &charts {
            let release = release_name(&space.name, chart.chart_name());
            if !installed.contains(&release) {
                continue;
            }
            if let Err(e) = self.helm.uninstall(&release, &space.team).await {
                warn!(namespace = %space.name, release = %release, error = %e, "Failed to uninstall chart");
            }
        }
        Ok(())
    }

    async fn teardown_team(&self, team: &str) -> Result<()> {
        info!(team = %team, "Deleting all namespaces that belong to the team");
        let profiles = self.client.delete_profiles(team).await?;
        debug!(team = %team, profiles, "Deleted team profiles");
        tokio::time::sleep(self.teardown_delay).await;
        let namespaces = self.client.delete_team_namespaces(team).await?;
        info!(team = %team, namespaces, "Team namespaces deleted");
        Ok(())
    }
}

#[async_trait]
impl Reconciler<Namespace> for NamespaceReconciler {
    async fn on_added(&self, obj: &Namespace) -> Result<()> {
        if Space::from_labels(obj.labels()) != Some(Space::User) {
            debug!(namespace = %obj.name_any(), "Skipping non user namespace");
            return Ok(());
        }
        let space = UserSpace::from_namespace(obj)?;
        info!(namespace = %space.name, team = %space.team, user = %space.user, "Setting up user namespace");
        self.install_user_space(&space).await?;
        self.bootstrap_pod_defaults(&space).await;
        Ok(())
    }

    async fn on_modified(&self, _obj: &Namespace) -> Result<()> {
        Ok(())
    }

    async fn on_deleted(&self, obj: &Namespace) -> Result<()> {
        match Space::from_labels(obj.labels()) {
            Some(Space::Team) => self.teardown_team(&obj.name_any()).await,
            Some(Space::User) => {
                let space = UserSpace::from_namespace(obj)?;
                info!(namespace = %space.name, team = %space.team, "Removing user namespace releases");
                self.uninstall_user_space(&space).await
            }
            None => Ok(()),
        }
    }
}
