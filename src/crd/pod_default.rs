//! PodDefault Custom Resource Definition (kubeflow.org/v1alpha1).
//!
//! Only the fields this controller writes are modeled. The selector is always
//! `{"orbit/<name>": ""}` so a pod opts in by carrying that label.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{PodSetting, Space, labels};

/// Kubeflow PodDefault, mirrored per namespace.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubeflow.org",
    version = "v1alpha1",
    kind = "PodDefault",
    plural = "poddefaults",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodDefaultSpec {
    pub selector: LabelSelector,
    #[serde(default)]
    pub desc: String,
}

impl PodDefault {
    /// Build a PodDefault with the deterministic `orbit/<name>` selector.
    pub fn construct(
        name: &str,
        desc: &str,
        space: Space,
        team: &str,
        owner: Option<OwnerReference>,
    ) -> Self {
        let labels = BTreeMap::from([
            (labels::SPACE.to_string(), space.to_string()),
            (labels::TEAM.to_string(), team.to_string()),
        ]);
        PodDefault {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            spec: PodDefaultSpec {
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(selector_label(name), String::new())])),
                    match_expressions: None,
                },
                desc: desc.to_string(),
            },
        }
    }

    /// Team-level PodDefault derived from a PodSetting, owned by it.
    pub fn for_pod_setting(ps: &PodSetting) -> Self {
        let name = ps.name_any();
        let team = ps
            .team()
            .map(str::to_string)
            .or_else(|| ps.namespace())
            .unwrap_or_default();
        let owner = OwnerReference {
            api_version: PodSetting::api_version(&()).into_owned(),
            kind: PodSetting::kind(&()).into_owned(),
            name: name.clone(),
            uid: ps.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        Self::construct(
            &name,
            ps.spec.desc.as_deref().unwrap_or_default(),
            Space::Team,
            &team,
            Some(owner),
        )
    }

    /// User-space mirror of a team-level PodDefault. Owner references are not
    /// carried across namespaces.
    pub fn mirror(&self) -> Self {
        let team = self
            .labels()
            .get(labels::TEAM)
            .cloned()
            .unwrap_or_default();
        Self::construct(&self.name_any(), &self.spec.desc, Space::User, &team, None)
    }

    pub fn space(&self) -> Option<Space> {
        Space::from_labels(self.labels())
    }
}

/// Pod label a PodDefault named `name` selects on.
pub fn selector_label(name: &str) -> String {
    format!("orbit/{name}")
}
