//! Charter release manager.
//!
//! [`ReleaseOps`] is the operation set every executor offers. [`DirectOps`] implements it
//! against a reachable cluster by driving a [`PackageEngine`] plus the namespace and
//! readiness collaborators; the bridge crate implements it again by relaying.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use charter_kubehub::Namespaces;
use charter_persist::{ArchiveFetcher, RepoCache};
use charter_readiness::{Inspector, Readiness};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::{info, warn};

pub mod chart;
pub mod values;

pub use chart::{ChartRef, ChartSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseState {
    Deployed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Uninstalling,
    Uninstalled,
    Superseded,
    Failed,
    Unknown,
}

impl ReleaseState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "deployed" => Self::Deployed,
            "pending-install" => Self::PendingInstall,
            "pending-upgrade" => Self::PendingUpgrade,
            "pending-rollback" => Self::PendingRollback,
            "uninstalling" => Self::Uninstalling,
            "uninstalled" => Self::Uninstalled,
            "superseded" => Self::Superseded,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Uninstalling => "uninstalling",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Release as reported by the cluster, refetched on every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseStatus {
    pub status: ReleaseState,
    pub namespace: String,
    pub chart_name: String,
    pub chart_version: String,
    pub chart: String,
    #[serde(default)]
    pub manifest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseSummary {
    pub release_name: String,
    pub namespace: String,
    pub chart_name: String,
    pub chart_version: String,
    pub chart: String,
}

/// Release name and namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseTarget {
    pub name: String,
    pub namespace: String,
}

/// Everything an executor needs to install or upgrade a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseInputs {
    pub config: ReleaseTarget,
    #[serde(rename = "ChartDetails")]
    pub chart: ChartRef,
    #[serde(rename = "ValueOpts", default)]
    pub values: Map<String, Json>,
}

/// Identity plus rendered manifest of a deployed release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseData {
    pub name: String,
    #[serde(default)]
    pub chart: String,
    pub namespace: String,
    #[serde(default)]
    pub manifest: String,
}

impl ReleaseData {
    pub fn from_status(name: &str, s: &ReleaseStatus) -> Self {
        Self { name: name.to_string(), chart: s.chart.clone(), namespace: s.namespace.clone(), manifest: s.manifest.clone() }
    }
}

/// Operation set shared by the direct and bridged executors.
#[async_trait::async_trait]
pub trait ReleaseOps: Send + Sync {
    async fn install(&self, inputs: &ReleaseInputs) -> Result<()>;
    async fn upgrade(&self, inputs: &ReleaseInputs) -> Result<()>;
    /// A release that does not exist is not an error.
    async fn uninstall(&self, target: &ReleaseTarget) -> Result<()>;
    async fn status(&self, target: &ReleaseTarget) -> Result<ReleaseStatus>;
    async fn list(&self, inputs: &ReleaseInputs) -> Result<Vec<ReleaseSummary>>;
    async fn pending(&self, release: &ReleaseData) -> Result<Readiness>;
    async fn resources(&self, release: &ReleaseData) -> Result<Map<String, Json>>;
}

/// Release as the package engine reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeRelease {
    pub name: String,
    pub namespace: String,
    pub status: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub manifest: String,
}

impl NativeRelease {
    pub fn normalize(&self) -> ReleaseStatus {
        ReleaseStatus {
            status: ReleaseState::parse(&self.status),
            namespace: self.namespace.clone(),
            chart_name: self.chart_name.clone(),
            chart_version: self.chart_version.clone(),
            chart: format!("{}-{}", self.chart_name, self.chart_version),
            manifest: self.manifest.clone(),
        }
    }

    pub fn summary(&self) -> ReleaseSummary {
        ReleaseSummary {
            release_name: self.name.clone(),
            namespace: self.namespace.clone(),
            chart_name: self.chart_name.clone(),
            chart_version: self.chart_version.clone(),
            chart: format!("{}-{}", self.chart_name, self.chart_version),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub release: String,
    pub namespace: String,
    pub chart_path: PathBuf,
    pub values: Map<String, Json>,
}

/// The package engine, addressed through a single cluster.
#[async_trait::async_trait]
pub trait PackageEngine: Send + Sync {
    /// Local path of a repository chart; the repository is already registered.
    async fn locate_chart(&self, chart: &ChartRef, dest: &Path) -> Result<PathBuf>;
    async fn missing_dependencies(&self, chart_path: &Path) -> Result<Vec<String>>;
    async fn update_dependencies(&self, chart_path: &Path) -> Result<()>;
    async fn install(&self, req: &EngineRequest) -> Result<()>;
    async fn upgrade(&self, req: &EngineRequest) -> Result<()>;
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;
    async fn status(&self, release: &str, namespace: &str) -> Result<NativeRelease>;
    async fn list(&self) -> Result<Vec<NativeRelease>>;
}

/// True when an error chain reports a missing release.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    format!("{:#}", err).contains("not found")
}

/// Executor for clusters reachable from this process.
#[derive(Clone)]
pub struct DirectOps {
    engine: Arc<dyn PackageEngine>,
    namespaces: Arc<dyn Namespaces>,
    inspector: Inspector,
    repos: RepoCache,
    archives: Arc<dyn ArchiveFetcher>,
    work_dir: PathBuf,
    dependency_update: bool,
}

impl DirectOps {
    pub fn new(
        engine: Arc<dyn PackageEngine>,
        namespaces: Arc<dyn Namespaces>,
        inspector: Inspector,
        repos: RepoCache,
        archives: Arc<dyn ArchiveFetcher>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { engine, namespaces, inspector, repos, archives, work_dir: work_dir.into(), dependency_update: false }
    }

    pub fn with_dependency_update(mut self, on: bool) -> Self {
        self.dependency_update = on;
        self
    }

    async fn prepare_chart(&self, chart: &ChartRef) -> Result<PathBuf> {
        let dest = self.work_dir.join("charts");
        tokio::fs::create_dir_all(&dest).await.with_context(|| format!("creating {}", dest.display()))?;
        match &chart.source {
            ChartSource::Archive { url } => {
                let file = url.rsplit('/').next().filter(|f| !f.is_empty()).unwrap_or("chart.tgz");
                let path = dest.join(file);
                self.archives.fetch(url, &path).await.with_context(|| format!("downloading chart {}", url))?;
                Ok(path)
            }
            ChartSource::Repository { repo, url } => {
                self.repos.add_and_refresh(repo, url).await.context("adding chart repository")?;
                self.engine.locate_chart(chart, &dest).await.with_context(|| format!("locating chart {}", chart.locator()))
            }
        }
    }

    async fn check_dependencies(&self, chart_path: &Path, allow_update: bool) -> Result<()> {
        let missing = self.engine.missing_dependencies(chart_path).await.context("checking chart dependencies")?;
        if missing.is_empty() {
            return Ok(());
        }
        if allow_update {
            info!(chart = %chart_path.display(), missing = %missing.join(","), "updating chart dependencies");
            return self.engine.update_dependencies(chart_path).await.context("updating chart dependencies");
        }
        Err(anyhow!("found in Chart.yaml, but missing in charts/ directory: {}", missing.join(", ")))
    }

    fn request(inputs: &ReleaseInputs, chart_path: PathBuf) -> EngineRequest {
        EngineRequest {
            release: inputs.config.name.clone(),
            namespace: inputs.config.namespace.clone(),
            chart_path,
            values: inputs.values.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ReleaseOps for DirectOps {
    async fn install(&self, inputs: &ReleaseInputs) -> Result<()> {
        let t0 = std::time::Instant::now();
        let path = self.prepare_chart(&inputs.chart).await?;
        self.check_dependencies(&path, self.dependency_update).await?;
        self.namespaces.ensure(&inputs.config.namespace).await?;
        self.engine.install(&Self::request(inputs, path)).await.context("install")?;
        counter!("charter_release_installs_total", 1u64);
        histogram!("charter_release_install_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(release = %inputs.config.name, namespace = %inputs.config.namespace, chart = %inputs.chart.locator(), "release installed");
        Ok(())
    }

    async fn upgrade(&self, inputs: &ReleaseInputs) -> Result<()> {
        let t0 = std::time::Instant::now();
        let path = self.prepare_chart(&inputs.chart).await?;
        self.check_dependencies(&path, false).await?;
        self.engine.upgrade(&Self::request(inputs, path)).await.context("upgrade")?;
        counter!("charter_release_upgrades_total", 1u64);
        histogram!("charter_release_upgrade_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(release = %inputs.config.name, namespace = %inputs.config.namespace, "release upgraded");
        Ok(())
    }

    async fn uninstall(&self, target: &ReleaseTarget) -> Result<()> {
        match self.engine.uninstall(&target.name, &target.namespace).await {
            Ok(()) => {
                info!(release = %target.name, "release uninstalled");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                warn!(release = %target.name, error = %format!("{:#}", e), "release not found; nothing to uninstall");
                Ok(())
            }
            Err(e) => Err(e.context("uninstall")),
        }
    }

    async fn status(&self, target: &ReleaseTarget) -> Result<ReleaseStatus> {
        let native = self.engine.status(&target.name, &target.namespace).await?;
        let s = native.normalize();
        info!(release = %target.name, status = %s.status, "release status");
        Ok(s)
    }

    async fn list(&self, inputs: &ReleaseInputs) -> Result<Vec<ReleaseSummary>> {
        let all = self.engine.list().await.context("listing releases")?;
        let version = inputs.chart.version.as_deref();
        Ok(all
            .iter()
            .filter(|r| r.namespace == inputs.config.namespace && r.chart_name == inputs.chart.name)
            .filter(|r| version.map(|v| v == r.chart_version).unwrap_or(true))
            .map(NativeRelease::summary)
            .collect())
    }

    async fn pending(&self, release: &ReleaseData) -> Result<Readiness> {
        self.inspector.check(&release.namespace, &release.manifest).await
    }

    async fn resources(&self, release: &ReleaseData) -> Result<Map<String, Json>> {
        self.inspector.resources(&release.namespace, &release.manifest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parsing_is_lenient() {
        assert_eq!(ReleaseState::parse("deployed"), ReleaseState::Deployed);
        assert_eq!(ReleaseState::parse("PENDING-INSTALL"), ReleaseState::PendingInstall);
        assert_eq!(ReleaseState::parse("weird"), ReleaseState::Unknown);
        assert_eq!(serde_json::to_value(ReleaseState::PendingUpgrade).unwrap(), "pending-upgrade");
    }

    #[test]
    fn native_release_normalizes_chart_label() {
        let n = NativeRelease {
            name: "web".into(),
            namespace: "apps".into(),
            status: "deployed".into(),
            chart_name: "nginx".into(),
            chart_version: "1.2.3".into(),
            manifest: "kind: Service".into(),
        };
        let s = n.normalize();
        assert_eq!(s.chart, "nginx-1.2.3");
        assert_eq!(s.status, ReleaseState::Deployed);
        assert_eq!(n.summary().release_name, "web");
    }

    #[test]
    fn not_found_matches_anywhere_in_chain() {
        let e = anyhow!("release: not found").context("uninstall web");
        assert!(is_not_found(&e));
        assert!(!is_not_found(&anyhow!("connection refused")));
    }

    #[test]
    fn inputs_use_envelope_keys() {
        let inputs = ReleaseInputs {
            config: ReleaseTarget { name: "web".into(), namespace: "apps".into() },
            chart: chart::resolve(Some("stable/nginx"), None, None, "https://charts.helm.sh/stable").unwrap(),
            values: Map::new(),
        };
        let v = serde_json::to_value(&inputs).unwrap();
        assert_eq!(v["Config"]["Name"], "web");
        assert_eq!(v["ChartDetails"]["Name"], "nginx");
        assert!(v["ValueOpts"].is_object());
    }
}
