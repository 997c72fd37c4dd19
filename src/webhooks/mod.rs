//! Mutating admission webhooks for pods.
//!
//! - `/mutate-pod-settings`: applies matching team PodSettings
//! - `/mutate-image-replication`: rewrites images to the internal registry
//!   and requests their replication
//!
//! Both handlers always allow the pod; failures degrade to an unpatched
//! response, optionally with warnings.

pub mod image_replication;
pub mod pod_settings;
pub mod selector;
mod server;

pub use image_replication::{
    ImageReplicationWebhook, ImageRewriteConfig, ImageRewriter, KubeReplicationRequester,
    ReplicationRequester,
};
pub use pod_settings::{ApplyError, Application, apply_pod_setting, apply_pod_settings};
pub use selector::{ContainerMatcher, SelectorError, expression_matches, selector_matches};
pub use server::{
    IMAGE_REPLICATION_PATH, POD_SETTINGS_PATH, WebhookError, WebhookState, create_webhook_router,
    run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
