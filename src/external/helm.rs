//! Helm CLI client for per-team user-space charts.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::command::{CommandRunner, ProcessRunner};
use crate::controller::error::{Error, Result};

/// A chart returned by `helm search repo`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ChartEntry {
    /// `<repo>/<chart>`
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ChartEntry {
    /// Chart name without the repository prefix.
    pub fn chart_name(&self) -> &str {
        self.name
            .split_once('/')
            .map(|(_, chart)| chart)
            .unwrap_or(&self.name)
    }
}

/// A release returned by `helm list`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Release {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Parameters for `helm upgrade --install`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallRequest {
    pub release: String,
    /// `<repo>/<chart>`
    pub chart: String,
    pub namespace: String,
    pub values: BTreeMap<String, String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    async fn repo_add(&self, name: &str, url: &str) -> Result<()>;

    /// Charts published in `repo`, including development versions.
    async fn search_repo(&self, repo: &str) -> Result<Vec<ChartEntry>>;

    async fn list_releases(&self, namespace: &str) -> Result<Vec<Release>>;

    async fn upgrade_install(&self, request: &InstallRequest) -> Result<()>;

    /// Uninstall `release`. A release that does not exist is not an error.
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;
}

/// [`HelmClient`] backed by the `helm` binary.
pub struct HelmCli<R: CommandRunner = ProcessRunner> {
    runner: R,
    binary: String,
}

impl<R: CommandRunner> HelmCli<R> {
    pub fn new(runner: R, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    async fn helm(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self
            .runner
            .run(&self.binary, &args)
            .await
            .map_err(into_helm_error)?;
        Ok(output.stdout)
    }
}

fn into_helm_error(e: Error) -> Error {
    match e {
        Error::Command { command, message } => Error::Helm(format!("{command}: {message}")),
        other => other,
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<Vec<T>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl<R: CommandRunner> HelmClient for HelmCli<R> {
    async fn repo_add(&self, name: &str, url: &str) -> Result<()> {
        self.helm(&["repo", "add", "--force-update", name, url]).await?;
        debug!(repo = %name, url = %url, "Added helm repository");
        Ok(())
    }

    async fn search_repo(&self, repo: &str) -> Result<Vec<ChartEntry>> {
        let out = self
            .helm(&["search", "repo", "--devel", repo, "-o", "json"])
            .await?;
        let prefix = format!("{repo}/");
        Ok(parse_json::<ChartEntry>(&out)?
            .into_iter()
            .filter(|c| c.name.starts_with(&prefix))
            .collect())
    }

    async fn list_releases(&self, namespace: &str) -> Result<Vec<Release>> {
        let out = self
            .helm(&["list", "--namespace", namespace, "-o", "json"])
            .await?;
        parse_json(&out)
    }

    async fn upgrade_install(&self, request: &InstallRequest) -> Result<()> {
        let mut args: Vec<String> = [
            "upgrade",
            "--install",
            "--devel",
            "--namespace",
            request.namespace.as_str(),
            request.release.as_str(),
            request.chart.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for (key, value) in &request.values {
            args.push("--set".to_string());
            args.push(format!("{key}={value}"));
        }
        self.runner
            .run(&self.binary, &args)
            .await
            .map_err(into_helm_error)?;
        info!(
            release = %request.release,
            chart = %request.chart,
            namespace = %request.namespace,
            "Installed helm release"
        );
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        match self
            .helm(&["uninstall", "--namespace", namespace, release])
            .await
        {
            Ok(_) => {
                info!(release = %release, namespace = %namespace, "Uninstalled helm release");
                Ok(())
            }
            Err(Error::Helm(msg)) if msg.contains("not found") => {
                debug!(release = %release, "Helm release already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
