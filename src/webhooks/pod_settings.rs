//! Pod-settings mutating webhook.
//!
//! Applies every team PodSetting whose pod selector matches an incoming pod,
//! in name order, and answers with a JSON Patch from the original pod to the
//! mutated one. Failures never reject the pod: a PodSetting that cannot be
//! applied is skipped and reported as an admission warning.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, Namespace, Pod, ResourceRequirements, Volume, VolumeMount,
};
use kube::ResourceExt;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::selector::{ContainerMatcher, SelectorError, selector_matches};
use crate::crd::{PodSetting, PodSettingSpec, labels};
use crate::index::{NamespaceIndex, PodSettingIndex};

pub const ENV_USER_SPACE: &str = "AWS_ORBIT_USER_SPACE";
pub const ENV_IMAGE: &str = "AWS_ORBIT_IMAGE";
pub const ENV_NB_PREFIX: &str = "NB_PREFIX";
pub const ENV_USERNAME: &str = "USERNAME";
pub const ENV_USEREMAIL: &str = "USEREMAIL";
/// Pod label naming the notebook, used in `NB_PREFIX`.
pub const NOTEBOOK_NAME_LABEL: &str = "notebook-name";

pub const NO_CHANGES_WARNING: &str = "PodSetting Selectors matched the Pod but no changes were applied";

/// Why a single PodSetting could not be applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid container selector: {0}")]
    ContainerSelector(#[from] SelectorError),

    #[error("cannot merge {field}: {source}")]
    Merge {
        field: &'static str,
        source: serde_json::Error,
    },
}

/// Entries of a list that are de-duplicated by name.
trait Named {
    fn key(&self) -> Option<&str>;
}

impl Named for EnvVar {
    fn key(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for VolumeMount {
    fn key(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for Volume {
    fn key(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl Named for EnvFromSource {
    fn key(&self) -> Option<&str> {
        self.config_map_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .or_else(|| self.secret_ref.as_ref().map(|r| r.name.as_str()))
    }
}

/// Drop existing entries whose name collides with `incoming`, then append
/// `incoming`.
fn merge_named<T: Named + Clone>(existing: &mut Option<Vec<T>>, incoming: &[T]) {
    if incoming.is_empty() {
        return;
    }
    let names: HashSet<&str> = incoming.iter().filter_map(Named::key).collect();
    let mut merged: Vec<T> = existing
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.key().is_none_or(|k| !names.contains(k)))
        .collect();
    merged.extend(incoming.iter().cloned());
    *existing = Some(merged);
}

fn merge_map<V: Clone>(existing: &mut Option<BTreeMap<String, V>>, incoming: &BTreeMap<String, V>) {
    if incoming.is_empty() {
        return;
    }
    existing
        .get_or_insert_with(BTreeMap::new)
        .extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Reduce keys to the segment after the last `/`.
fn strip_key_prefixes<V>(map: BTreeMap<String, V>) -> BTreeMap<String, V> {
    map.into_iter()
        .map(|(k, v)| match k.rsplit_once('/') {
            Some((_, name)) => (name.to_string(), v),
            None => (k, v),
        })
        .collect()
}

/// Top-level field merge of two objects, `overlay` winning.
fn shallow_merge<T: Serialize + DeserializeOwned>(
    field: &'static str,
    base: Option<&T>,
    overlay: &T,
) -> Result<T, ApplyError> {
    let err = |source| ApplyError::Merge { field, source };
    let mut merged = match base {
        Some(b) => serde_json::to_value(b).map_err(err)?,
        None => Value::Object(Default::default()),
    };
    if let (Value::Object(target), Value::Object(fields)) =
        (&mut merged, serde_json::to_value(overlay).map_err(err)?)
    {
        target.extend(fields);
    }
    serde_json::from_value(merged).map_err(err)
}

fn env(name: &str, value: Option<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value,
        value_from: None,
    }
}

/// Namespace facts injected into containers.
struct InjectionContext<'a> {
    namespace: &'a str,
    namespace_labels: &'a BTreeMap<String, String>,
    namespace_annotations: &'a BTreeMap<String, String>,
    notebook_name: String,
}

/// Env vars a PodSetting contributes to `container`.
fn container_env(spec: &PodSettingSpec, container: &Container, ctx: &InjectionContext<'_>) -> Vec<EnvVar> {
    let mut injected = vec![
        env(ENV_USER_SPACE, Some(ctx.namespace.to_string())),
        env(ENV_IMAGE, Some(container.image.clone().unwrap_or_default())),
    ];
    if let Some(ref app) = spec.notebook_app {
        injected.push(env(
            ENV_NB_PREFIX,
            Some(format!("/notebook/{}/{}/{app}", ctx.namespace, ctx.notebook_name)),
        ));
    }
    if spec.inject_user_context {
        let username = ctx
            .namespace_labels
            .get(labels::USER)
            .or_else(|| ctx.namespace_labels.get(labels::TEAM))
            .cloned();
        injected.push(env(ENV_USERNAME, username));
        injected.push(env(
            ENV_USEREMAIL,
            Some(
                ctx.namespace_annotations
                    .get(labels::OWNER_ANNOTATION)
                    .cloned()
                    .unwrap_or_default(),
            ),
        ));
    }

    let reserved: HashSet<&str> = injected.iter().map(|e| e.name.as_str()).collect();
    let mut vars: Vec<EnvVar> = spec
        .env
        .iter()
        .filter(|e| !reserved.contains(e.name.as_str()))
        .cloned()
        .collect();
    vars.extend(injected);
    vars
}

fn merge_resources(existing: &mut Option<ResourceRequirements>, incoming: &ResourceRequirements) {
    let target = existing.get_or_insert_with(ResourceRequirements::default);
    if let Some(ref limits) = incoming.limits {
        merge_map(&mut target.limits, limits);
    }
    if let Some(ref requests) = incoming.requests {
        merge_map(&mut target.requests, requests);
    }
}

fn apply_to_container(
    container: &mut Container,
    spec: &PodSettingSpec,
    ctx: &InjectionContext<'_>,
) -> Result<(), ApplyError> {
    let vars = container_env(spec, container, ctx);

    if let Some(ref image) = spec.image {
        container.image = Some(image.clone());
    }
    if let Some(ref policy) = spec.image_pull_policy {
        container.image_pull_policy = Some(policy.clone());
    }
    if let Some(ref lifecycle) = spec.lifecycle {
        container.lifecycle = Some(shallow_merge(
            "lifecycle",
            container.lifecycle.as_ref(),
            lifecycle,
        )?);
    }
    if let Some(ref command) = spec.command {
        container.command = Some(command.clone());
    }
    if let Some(ref args) = spec.args {
        container.args = Some(args.clone());
    }
    merge_named(&mut container.env, &vars);
    merge_named(&mut container.env_from, &spec.env_from);
    merge_named(&mut container.volume_mounts, &spec.volume_mounts);
    if let Some(ref resources) = spec.resources {
        merge_resources(&mut container.resources, resources);
    }
    Ok(())
}

/// Apply one PodSetting to `pod` in place.
pub fn apply_pod_setting(pod: &mut Pod, namespace: &Namespace, ps: &PodSetting) -> Result<(), ApplyError> {
    let spec = &ps.spec;
    let matcher = ContainerMatcher::new(&spec.container_selector, pod)?;

    merge_map(&mut pod.metadata.labels, &spec.labels);
    merge_map(&mut pod.metadata.annotations, &spec.annotations);

    let namespace_name = namespace.name_any();
    let ctx = InjectionContext {
        namespace: &namespace_name,
        namespace_labels: namespace.labels(),
        namespace_annotations: namespace.annotations(),
        notebook_name: pod
            .labels()
            .get(NOTEBOOK_NAME_LABEL)
            .cloned()
            .unwrap_or_default(),
    };

    let pod_spec = pod.spec.get_or_insert_with(Default::default);
    if let Some(ref sa) = spec.service_account_name {
        pod_spec.service_account_name = Some(sa.clone());
    }
    if !spec.node_selector.is_empty() {
        merge_map(&mut pod_spec.node_selector, &spec.node_selector);
        pod_spec.node_selector = pod_spec.node_selector.take().map(strip_key_prefixes);
    }
    if let Some(ref sc) = spec.security_context {
        pod_spec.security_context = Some(shallow_merge(
            "securityContext",
            pod_spec.security_context.as_ref(),
            sc,
        )?);
    }
    merge_named(&mut pod_spec.volumes, &spec.volumes);

    for container in pod_spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(pod_spec.containers.iter_mut())
    {
        if matcher.matches(&container.name) {
            apply_to_container(container, spec, &ctx)?;
            debug!(podsetting = %ps.name_any(), container = %container.name, "Applied PodSetting to container");
        }
    }
    Ok(())
}

/// Result of applying a team's PodSettings to a pod.
#[derive(Debug)]
pub struct Application {
    pub pod: Pod,
    /// Names of PodSettings whose selectors matched.
    pub matched: Vec<String>,
    /// Names of PodSettings applied without error.
    pub applied: Vec<String>,
    pub warnings: Vec<String>,
}

/// Apply every PodSetting in `settings` whose selector matches `pod`.
pub fn apply_pod_settings(pod: &Pod, namespace: &Namespace, settings: &[Arc<PodSetting>]) -> Application {
    let mut result = Application {
        pod: pod.clone(),
        matched: Vec::new(),
        applied: Vec::new(),
        warnings: Vec::new(),
    };
    for ps in settings {
        let name = ps.name_any();
        if !selector_matches(&ps.spec.pod_selector, pod.labels()) {
            debug!(podsetting = %name, "PodSetting selector does not match pod");
            continue;
        }
        result.matched.push(name.clone());

        let mut candidate = result.pod.clone();
        match apply_pod_setting(&mut candidate, namespace, ps) {
            Ok(()) => {
                result.pod = candidate;
                result.applied.push(name);
            }
            Err(e) => {
                warn!(podsetting = %name, error = %e, "Error applying PodSetting");
                result
                    .warnings
                    .push(format!("Error applying PodSetting {name}: {e}"));
            }
        }
    }
    result
}

/// Serialize `value`, turning a failure into an admission warning.
fn to_json<T: Serialize>(value: &T, what: &str) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| {
        warn!(error = %e, "Failed to serialize {what}");
        format!("Failed to serialize {what}: {e}")
    })
}

fn with_warnings(mut response: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        response.warnings = Some(warnings);
    }
    response
}

/// Handle one pod admission request.
pub fn mutate(
    request: &AdmissionRequest<Pod>,
    namespaces: &NamespaceIndex,
    pod_settings: &PodSettingIndex,
) -> AdmissionResponse {
    let allow = AdmissionResponse::from(request);
    if request.dry_run {
        debug!(uid = %request.uid, "Dry run, skipping pod mutation");
        return allow;
    }
    let Some(ref pod) = request.object else {
        return allow;
    };
    let namespace_name = request
        .namespace
        .clone()
        .or_else(|| pod.namespace())
        .unwrap_or_default();

    let Some(namespace) = namespaces.get(&namespace_name) else {
        info!(namespace = %namespace_name, "Pod namespace not indexed");
        return allow;
    };
    let Some(team) = namespace.labels().get(labels::TEAM) else {
        info!(namespace = %namespace_name, "No team label on pod namespace");
        return allow;
    };
    let settings = pod_settings.for_team(team);
    if settings.is_empty() {
        info!(team = %team, "No PodSettings for team");
        return allow;
    }

    let mut application = apply_pod_settings(pod, &namespace, &settings);
    if application.matched.is_empty() {
        info!(namespace = %namespace_name, "No PodSetting selectors matched the pod");
        return allow;
    }

    let original = match to_json(pod, "pod") {
        Ok(v) => v,
        Err(warning) => return with_warnings(allow, vec![warning]),
    };
    let mutated = match to_json(&application.pod, "mutated pod") {
        Ok(v) => v,
        Err(warning) => {
            application.warnings.push(warning);
            return with_warnings(allow, application.warnings);
        }
    };
    if original == mutated {
        warn!(namespace = %namespace_name, "{NO_CHANGES_WARNING}");
        application.warnings.push(NO_CHANGES_WARNING.to_string());
        return with_warnings(allow, application.warnings);
    }

    application
        .pod
        .annotations_mut()
        .insert(labels::APPLIED_PODSETTINGS.to_string(), application.applied.join(","));
    let mutated = match to_json(&application.pod, "mutated pod") {
        Ok(v) => v,
        Err(warning) => {
            application.warnings.push(warning);
            return with_warnings(allow, application.warnings);
        }
    };

    let patch = json_patch::diff(&original, &mutated);
    info!(
        namespace = %namespace_name,
        podsettings = %application.applied.join(","),
        operations = patch.0.len(),
        "Applying PodSettings to pod"
    );
    match allow.clone().with_patch(patch) {
        Ok(response) => with_warnings(response, application.warnings),
        Err(e) => {
            warn!(error = %e, "Failed to serialize patch");
            application.warnings.push(format!("Failed to serialize patch: {e}"));
            with_warnings(allow, application.warnings)
        }
    }
}
