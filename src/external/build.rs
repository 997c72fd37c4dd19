//! Build service integration for image replication.
//!
//! Replication runs as a privileged CodeBuild job with an inline buildspec
//! that starts a docker daemon, logs in to the internal registry, ensures the
//! destination repository exists, then pulls, tags and pushes the image.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::command::{CommandRunner, ProcessRunner};
use crate::controller::error::{Error, Result};

/// Static settings for replication builds.
#[derive(Clone, Debug, Default)]
pub struct BuildSettings {
    /// Internal registry host, e.g. `123456789012.dkr.ecr.us-west-2.amazonaws.com`.
    pub repo_host: String,
    /// Repository prefix for replicated images (also the `Env` tag value).
    pub repo_prefix: String,
    pub project: String,
    /// Build timeout in minutes.
    pub timeout_minutes: u32,
    /// Build environment image.
    pub image: String,
}

/// Coarse state of a build job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    InProgress,
    Succeeded,
    /// Any other terminal status reported by the service.
    Failed(String),
}

impl BuildState {
    fn from_status(status: &str) -> Self {
        match status {
            "SUCCEEDED" => Self::Succeeded,
            "IN_PROGRESS" => Self::InProgress,
            other => Self::Failed(other.to_string()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Whether `image` is already present in the internal registry.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Start a replication build and return its id.
    async fn start_build(&self, source: &str, destination: &str) -> Result<String>;

    async fn build_status(&self, build_id: &str) -> Result<BuildState>;
}

#[derive(Serialize)]
struct Buildspec {
    version: f64,
    phases: Phases,
}

#[derive(Serialize)]
struct Phases {
    install: InstallPhase,
    pre_build: CommandPhase,
    build: CommandPhase,
}

#[derive(Serialize)]
struct InstallPhase {
    #[serde(rename = "runtime-versions")]
    runtime_versions: BTreeMap<String, f64>,
    commands: Vec<String>,
}

#[derive(Serialize)]
struct CommandPhase {
    commands: Vec<String>,
}

/// Repository name of `destination` inside the internal registry.
pub fn destination_repository<'a>(repo_host: &str, destination: &'a str) -> &'a str {
    let path = destination
        .strip_prefix(repo_host)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(destination);
    path.split(':').next().unwrap_or(path)
}

/// Render the inline buildspec that copies `source` to `destination`.
pub fn render_buildspec(settings: &BuildSettings, source: &str, destination: &str) -> Result<String> {
    let repo = destination_repository(&settings.repo_host, destination);
    let spec = Buildspec {
        version: 0.2,
        phases: Phases {
            install: InstallPhase {
                runtime_versions: BTreeMap::from([
                    ("docker".to_string(), 19.0),
                    ("python".to_string(), 3.7),
                ]),
                commands: vec![
                    "nohup /usr/sbin/dockerd --host=unix:///var/run/docker.sock \
                     --host=tcp://0.0.0.0:2375 --storage-driver=overlay&"
                        .to_string(),
                    r#"timeout 15 sh -c "until docker info; do echo .; sleep 1; done""#.to_string(),
                ],
            },
            pre_build: CommandPhase {
                commands: vec![
                    "/var/scripts/retrieve_docker_creds.py && echo 'Docker logins successful' \
                     || echo 'Docker logins failed'"
                        .to_string(),
                    format!(
                        "aws ecr get-login-password | docker login --username AWS --password-stdin {}",
                        settings.repo_host
                    ),
                    format!(
                        "aws ecr create-repository --repository-name {repo} \
                         --tags Key=Env,Value={} || echo 'Already exists'",
                        settings.repo_prefix
                    ),
                ],
            },
            build: CommandPhase {
                commands: vec![
                    format!("docker pull {source}"),
                    format!("docker tag {source} {destination}"),
                    format!("docker push {destination}"),
                ],
            },
        },
    };
    Ok(serde_yaml::to_string(&spec)?)
}

#[derive(Deserialize)]
struct StartBuildOutput {
    build: BuildRef,
}

#[derive(Deserialize)]
struct BuildRef {
    id: String,
}

#[derive(Deserialize)]
struct BatchGetBuildsOutput {
    #[serde(default)]
    builds: Vec<BuildInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    build_status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListImagesOutput {
    #[serde(default)]
    image_ids: Vec<ImageId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageId {
    image_tag: Option<String>,
}

/// [`BuildService`] backed by the `aws` CLI.
pub struct CodeBuildCli<R: CommandRunner = ProcessRunner> {
    runner: R,
    binary: String,
    settings: BuildSettings,
}

impl<R: CommandRunner> CodeBuildCli<R> {
    pub fn new(runner: R, binary: impl Into<String>, settings: BuildSettings) -> Self {
        Self {
            runner,
            binary: binary.into(),
            settings,
        }
    }

    async fn aws(&self, args: Vec<String>) -> Result<String> {
        let output = self.runner.run(&self.binary, &args).await?;
        Ok(output.stdout)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl<R: CommandRunner> BuildService for CodeBuildCli<R> {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let (repo, tag) = match image.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (image, "latest"),
        };
        let repo = repo.split_once('/').map(|(_, path)| path).unwrap_or(repo);

        let out = match self
            .aws(args(&[
                "ecr",
                "list-images",
                "--repository-name",
                repo,
                "--output",
                "json",
            ]))
            .await
        {
            Ok(out) => out,
            Err(Error::Command { message, .. }) if message.contains("RepositoryNotFoundException") => {
                debug!(repository = %repo, "Repository does not exist yet");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let listed: ListImagesOutput = serde_json::from_str(&out)?;
        let found = listed
            .image_ids
            .iter()
            .any(|id| id.image_tag.as_deref() == Some(tag));
        if found {
            info!(image = %image, "Registry already contains image");
        }
        Ok(found)
    }

    async fn start_build(&self, source: &str, destination: &str) -> Result<String> {
        let buildspec = render_buildspec(&self.settings, source, destination)?;
        let timeout = self.settings.timeout_minutes.to_string();
        let out = self
            .aws(args(&[
                "codebuild",
                "start-build",
                "--project-name",
                &self.settings.project,
                "--source-type-override",
                "NO_SOURCE",
                "--buildspec-override",
                &buildspec,
                "--timeout-in-minutes-override",
                &timeout,
                "--privileged-mode-override",
                "--image-override",
                &self.settings.image,
                "--output",
                "json",
            ]))
            .await
            .map_err(|e| Error::Build(e.to_string()))?;
        let started: StartBuildOutput = serde_json::from_str(&out)?;
        info!(build_id = %started.build.id, source = %source, destination = %destination, "Started replication build");
        Ok(started.build.id)
    }

    async fn build_status(&self, build_id: &str) -> Result<BuildState> {
        let out = self
            .aws(args(&[
                "codebuild",
                "batch-get-builds",
                "--ids",
                build_id,
                "--output",
                "json",
            ]))
            .await
            .map_err(|e| Error::Build(e.to_string()))?;
        let batch: BatchGetBuildsOutput = serde_json::from_str(&out)?;
        match batch.builds.first() {
            Some(build) => Ok(BuildState::from_status(&build.build_status)),
            None => {
                warn!(build_id = %build_id, "Build not found");
                Err(Error::Build(format!("build {build_id} not found")))
            }
        }
    }
}
