//! PodSetting Custom Resource Definition.
//!
//! A PodSetting describes policy a team wants injected into matching pods:
//! images, env, volumes, security context and scheduling hints. The admission
//! webhook applies it; the PodSetting reconciler derives a PodDefault from it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, Lifecycle, PodSecurityContext, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::labels;

/// PodSetting is a team-scoped pod policy.
///
/// Example:
/// ```yaml
/// apiVersion: orbit.aws/v1
/// kind: PodSetting
/// metadata:
///   name: gpu-workloads
///   namespace: lake-creator
///   labels:
///     orbit/space: team
///     orbit/team: lake-creator
/// spec:
///   desc: Schedule onto the GPU node group
///   podSelector:
///     matchExpressions:
///       - key: tier
///         operator: In
///         values: ["gpu"]
///   containerSelector:
///     regex: "*"
///   nodeSelector:
///     k8s.amazonaws.com/accelerator: nvidia-tesla-v100
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "orbit.aws",
    version = "v1",
    kind = "PodSetting",
    plural = "podsettings",
    shortname = "ps",
    namespaced,
    printcolumn = r#"{"name":"Team", "type":"string", "jsonPath":".metadata.labels.orbit/team"}"#,
    printcolumn = r#"{"name":"Description", "type":"string", "jsonPath":".spec.desc"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodSettingSpec {
    /// Pods whose labels satisfy this selector receive the setting.
    #[serde(default)]
    pub pod_selector: LabelSelector,

    /// Containers (and init containers) the container-level fields apply to.
    #[serde(default)]
    pub container_selector: ContainerSelector,

    /// Human readable description, copied onto the derived PodDefault.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    // === Container scalars (replace) ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    // === Container lists (dedupe by name) ===
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    // === Container maps (shallow merge) ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,

    // === Pod level ===
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    // === Injected context ===
    /// Notebook application path segment, exported as `NB_PREFIX`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_app: Option<String>,
    /// Export `USERNAME` and `USEREMAIL` from the namespace.
    #[serde(default)]
    pub inject_user_context: bool,
}

/// Selects containers by name. `regex` wins when both are set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSelector {
    /// Regular expression matched at the start of the container name.
    /// `*` selects every container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// JSONPath evaluated against the pod; containers whose name is among
    /// the matched values are selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonpath: Option<String>,
}

impl PodSetting {
    /// Team owning this PodSetting (`orbit/team` label).
    pub fn team(&self) -> Option<&str> {
        self.labels().get(labels::TEAM).map(String::as_str)
    }

    /// Whether the PodSetting opted out of PodDefault propagation.
    pub fn watcher_disabled(&self) -> bool {
        self.labels().contains_key(labels::DISABLE_WATCHER)
    }

    /// Team-scoped and not opted out.
    pub fn is_propagated(&self) -> bool {
        self.labels().get(labels::SPACE).map(String::as_str) == Some(labels::SPACE_TEAM)
            && !self.watcher_disabled()
    }
}
