//! Custom Resource Definitions (CRDs) for orbit-controller.
//!
//! - `PodSetting`: team-scoped pod policy applied by the admission webhook
//! - `PodDefault`: kubeflow PodDefault derived from each PodSetting
//! - `ImageReplication`: request to copy an external image into the internal registry

mod image_replication;
mod pod_default;
mod pod_setting;

pub use image_replication::*;
pub use pod_default::*;
pub use pod_setting::*;

/// Label and annotation keys shared by namespaces and custom resources.
pub mod labels {
    /// `team` or `user`.
    pub const SPACE: &str = "orbit/space";
    pub const TEAM: &str = "orbit/team";
    pub const USER: &str = "orbit/user";
    pub const ENV: &str = "orbit/env";
    pub const EFS_ACCESS_POINT_ID: &str = "orbit/efs-access-point-id";
    /// Presence excludes a PodSetting from PodDefault propagation.
    pub const DISABLE_WATCHER: &str = "orbit/disable-watcher";

    /// Namespace annotation holding the owner's email.
    pub const OWNER_ANNOTATION: &str = "owner";
    /// Pod annotation listing the PodSettings applied at admission.
    pub const APPLIED_PODSETTINGS: &str = "orbit/applied-podsettings";
    /// Pod annotation prefix recording the pre-rewrite image per container.
    pub const ORIGINAL_IMAGE_PREFIX: &str = "original-container-image/";

    pub const SPACE_TEAM: &str = "team";
    pub const SPACE_USER: &str = "user";
}

/// Value of the `orbit/space` label on a namespace or resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Team,
    User,
}

impl Space {
    /// Read the space from a label map.
    pub fn from_labels(labels: &std::collections::BTreeMap<String, String>) -> Option<Self> {
        match labels.get(labels::SPACE).map(String::as_str) {
            Some(labels::SPACE_TEAM) => Some(Space::Team),
            Some(labels::SPACE_USER) => Some(Space::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Space::Team => labels::SPACE_TEAM,
            Space::User => labels::SPACE_USER,
        }
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
