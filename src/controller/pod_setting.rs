//! PodSetting reconciler.
//!
//! Each team PodSetting owns a team-level PodDefault of the same name in its
//! namespace. A mirror of that PodDefault is kept in every user namespace of
//! the team so pods there can opt in through the `orbit/<name>` label.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info};

use super::pod_default::{PodDefaultClient, apply_to_namespaces, delete_from_namespaces};
use crate::controller::error::{Error, Result, ignore_not_found};
use crate::crd::{PodDefault, PodSetting};
use crate::index::NamespaceIndex;
use crate::watch::Reconciler;

pub struct PodSettingReconciler {
    namespaces: NamespaceIndex,
    pod_defaults: Arc<dyn PodDefaultClient>,
}

impl PodSettingReconciler {
    pub fn new(namespaces: NamespaceIndex, pod_defaults: Arc<dyn PodDefaultClient>) -> Self {
        Self {
            namespaces,
            pod_defaults,
        }
    }

    /// Team of a PodSetting that takes part in propagation.
    fn propagated_team(ps: &PodSetting) -> Result<Option<String>> {
        if !ps.is_propagated() {
            debug!(
                namespace = %ps.namespace().unwrap_or_default(),
                name = %ps.name_any(),
                "Skipping PodSetting excluded from propagation"
            );
            return Ok(None);
        }
        match ps.team() {
            Some(team) => Ok(Some(team.to_string())),
            None => Err(Error::MissingField(format!(
                "PodSetting {} has no team label",
                ps.name_any()
            ))),
        }
    }

    async fn upsert(&self, ps: &PodSetting) -> Result<()> {
        let Some(team) = Self::propagated_team(ps)? else {
            return Ok(());
        };
        let namespace = ps
            .namespace()
            .ok_or_else(|| Error::MissingField("PodSetting namespace".into()))?;

        let team_default = PodDefault::for_pod_setting(ps);
        self.pod_defaults.apply(&namespace, &team_default).await?;

        let targets = self.namespaces.user_namespaces(&team);
        let failed =
            apply_to_namespaces(self.pod_defaults.as_ref(), &targets, &team_default.mirror()).await;
        info!(
            name = %ps.name_any(),
            team = %team,
            namespaces = targets.len(),
            failed,
            "Reconciled PodDefault for PodSetting"
        );
        Ok(())
    }
}

#[async_trait]
impl Reconciler<PodSetting> for PodSettingReconciler {
    async fn on_added(&self, obj: &PodSetting) -> Result<()> {
        self.upsert(obj).await
    }

    async fn on_modified(&self, obj: &PodSetting) -> Result<()> {
        self.upsert(obj).await
    }

    async fn on_deleted(&self, obj: &PodSetting) -> Result<()> {
        let Some(team) = Self::propagated_team(obj)? else {
            return Ok(());
        };
        let name = obj.name_any();
        let targets = self.namespaces.user_namespaces(&team);
        let failed = delete_from_namespaces(self.pod_defaults.as_ref(), &targets, &name).await;

        if let Some(namespace) = obj.namespace() {
            ignore_not_found(self.pod_defaults.delete(&namespace, &name).await)?;
        }
        info!(
            name = %name,
            team = %team,
            namespaces = targets.len(),
            failed,
            "Deleted PodDefaults for PodSetting"
        );
        Ok(())
    }
}
