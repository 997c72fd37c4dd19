//! Image-replication mutating webhook.
//!
//! Rewrites container images to their internal-registry location, records
//! the original image per container in a pod annotation, and requests one
//! `ImageReplication` per destination that is not already live.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ObjectMeta, PostParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::{Api, Client, ResourceExt};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::crd::{ImageReplication, ImageReplicationSpec, labels};
use crate::index::ReplicationIndex;

const EXTERNAL_ECR: &str = r"^[0-9]{12}\.dkr\.ecr\..+\.amazonaws.com/";
const PUBLIC_ECR: &str = r"^public.ecr.aws/.+/";
/// `generateName` of created ImageReplications.
pub const GENERATE_NAME: &str = "image-replication-";

#[derive(Clone, Debug, Default)]
pub struct ImageRewriteConfig {
    /// Internal registry host.
    pub repo_host: String,
    /// Path prefix for replicated images.
    pub repo_prefix: String,
    /// Also rewrite images from other accounts' private ECR registries.
    pub replicate_external_repos: bool,
}

/// Maps a container image to its internal-registry location.
#[derive(Clone, Debug)]
pub struct ImageRewriter {
    config: ImageRewriteConfig,
    external_ecr: Regex,
    public_ecr: Regex,
}

impl ImageRewriter {
    pub fn new(config: ImageRewriteConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            config,
            external_ecr: Regex::new(EXTERNAL_ECR)?,
            public_ecr: Regex::new(PUBLIC_ECR)?,
        })
    }

    fn internal_prefix(&self) -> String {
        format!("{}/{}/", self.config.repo_host, self.config.repo_prefix)
    }

    /// Internal image for `image`. Equal to `image` when no rewrite applies.
    pub fn desired_image(&self, image: &str) -> String {
        if image.starts_with(&self.config.repo_host) {
            return image.to_string();
        }
        let undigested = image.replace("@sha256", "");
        if self.external_ecr.is_match(image) {
            if self.config.replicate_external_repos {
                self.external_ecr
                    .replacen(&undigested, 1, self.internal_prefix())
                    .into_owned()
            } else {
                image.to_string()
            }
        } else if self.public_ecr.is_match(image) {
            self.public_ecr
                .replacen(&undigested, 1, self.internal_prefix())
                .into_owned()
        } else {
            format!("{}{undigested}", self.internal_prefix())
        }
    }
}

/// Creates ImageReplication objects.
#[async_trait]
pub trait ReplicationRequester: Send + Sync {
    /// Create a replication of `source` to `destination`; returns its name.
    async fn request(&self, source: &str, destination: &str) -> Result<String, kube::Error>;
}

/// [`ReplicationRequester`] backed by the Kubernetes API.
pub struct KubeReplicationRequester {
    client: Client,
    namespace: String,
}

impl KubeReplicationRequester {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ReplicationRequester for KubeReplicationRequester {
    async fn request(&self, source: &str, destination: &str) -> Result<String, kube::Error> {
        let api: Api<ImageReplication> = Api::namespaced(self.client.clone(), &self.namespace);
        let ir = ImageReplication {
            metadata: ObjectMeta {
                generate_name: Some(GENERATE_NAME.to_string()),
                ..Default::default()
            },
            spec: ImageReplicationSpec {
                source: source.to_string(),
                destination: destination.to_string(),
            },
            status: None,
        };
        let created = api.create(&PostParams::default(), &ir).await?;
        Ok(created.name_any())
    }
}

/// Image-replication webhook state.
pub struct ImageReplicationWebhook {
    rewriter: ImageRewriter,
    index: ReplicationIndex,
    requester: Arc<dyn ReplicationRequester>,
    /// Destinations requested but not yet seen by the index, with the name of
    /// the created object once known.
    in_flight: Mutex<HashMap<String, Option<String>>>,
}

impl ImageReplicationWebhook {
    pub fn new(
        rewriter: ImageRewriter,
        index: ReplicationIndex,
        requester: Arc<dyn ReplicationRequester>,
    ) -> Self {
        Self {
            rewriter,
            index,
            requester,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve `destination` unless a replication already covers it.
    fn reserve(&self, destination: &str) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|d, name| match name {
            Some(name) => !self.index.contains(d, name),
            None => true,
        });
        if self.index.is_live(destination)
            || self.index.is_exhausted(destination)
            || in_flight.contains_key(destination)
        {
            return false;
        }
        in_flight.insert(destination.to_string(), None);
        true
    }

    fn confirm(&self, destination: &str, name: &str) {
        if let Some(entry) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(destination)
        {
            *entry = Some(name.to_string());
        }
    }

    fn unreserve(&self, destination: &str) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(destination);
    }

    /// Rewrite images in `pod`, returning `source -> destination` pairs.
    pub fn rewrite(&self, pod: &mut Pod) -> BTreeMap<String, String> {
        let mut replications = BTreeMap::new();
        let mut originals = BTreeMap::new();
        if let Some(ref mut spec) = pod.spec {
            for container in spec
                .init_containers
                .iter_mut()
                .flatten()
                .chain(spec.containers.iter_mut())
            {
                let image = container.image.clone().unwrap_or_default();
                let desired = self.rewriter.desired_image(&image);
                if desired != image {
                    originals.insert(
                        format!("{}{}", labels::ORIGINAL_IMAGE_PREFIX, container.name),
                        image.clone(),
                    );
                    container.image = Some(desired.clone());
                    replications.insert(image, desired);
                }
            }
        }
        if !originals.is_empty() {
            pod.annotations_mut().extend(originals);
        }
        replications
    }

    /// Request replications for destinations not already covered.
    /// Returns the destinations requested.
    pub async fn request_replications(&self, replications: &BTreeMap<String, String>) -> Vec<String> {
        let mut requested = Vec::new();
        for (source, destination) in replications {
            if !self.reserve(destination) {
                debug!(destination = %destination, "Skipping ImageReplication creation");
                continue;
            }
            match self.requester.request(source, destination).await {
                Ok(name) => {
                    info!(name = %name, source = %source, destination = %destination, "Created ImageReplication");
                    self.confirm(destination, &name);
                    requested.push(destination.clone());
                }
                Err(e) => {
                    warn!(source = %source, destination = %destination, error = %e, "Failed to create ImageReplication");
                    self.unreserve(destination);
                }
            }
        }
        requested
    }

    /// Request replications for the images listed in `inventory`, one per
    /// line. Blank lines and `#` comments are ignored.
    pub async fn request_inventory(&self, inventory: &str) -> Vec<String> {
        let replications: BTreeMap<String, String> = inventory
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|source| {
                let desired = self.rewriter.desired_image(source);
                (desired != source).then(|| (source.to_string(), desired))
            })
            .collect();
        self.request_replications(&replications).await
    }

    /// Request replications for the inventory file at `path`. A missing
    /// file requests nothing.
    pub async fn prime_from_inventory(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let inventory = match tokio::fs::read_to_string(path).await {
            Ok(inventory) => inventory,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No image inventory");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let requested = self.request_inventory(&inventory).await;
        info!(path = %path.display(), requested = requested.len(), "Primed replications from image inventory");
        Ok(requested)
    }

    /// Handle one pod admission request.
    pub async fn mutate(&self, request: &AdmissionRequest<Pod>) -> AdmissionResponse {
        let allow = AdmissionResponse::from(request);
        if request.dry_run {
            debug!(uid = %request.uid, "Dry run, skipping pod mutation");
            return allow;
        }
        let Some(ref pod) = request.object else {
            return allow;
        };

        let mut mutated = pod.clone();
        let replications = self.rewrite(&mut mutated);
        if replications.is_empty() {
            return allow;
        }
        self.request_replications(&replications).await;

        let (original, updated) = match (serde_json::to_value(pod), serde_json::to_value(&mutated)) {
            (Ok(o), Ok(u)) => (o, u),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to serialize pod");
                return allow;
            }
        };
        let patch = json_patch::diff(&original, &updated);
        debug!(uid = %request.uid, operations = patch.0.len(), "Rewriting pod images");
        match allow.clone().with_patch(patch) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to serialize patch");
                allow
            }
        }
    }
}
