//! Package engine backed by the `helm` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use charter_ops::{ChartRef, ChartSource, EngineRequest, NativeRelease, PackageEngine};
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::runner::{Cmd, Runner};

pub struct HelmEngine {
    runner: Arc<dyn Runner>,
    kubeconfig: PathBuf,
    repository_config: PathBuf,
    repository_cache: PathBuf,
    work_dir: PathBuf,
}

impl HelmEngine {
    pub fn new(runner: Arc<dyn Runner>, kubeconfig: PathBuf, repository_config: PathBuf, repository_cache: PathBuf, work_dir: PathBuf) -> Self {
        Self { runner, kubeconfig, repository_config, repository_cache, work_dir }
    }

    fn helm(&self) -> Cmd {
        Cmd::new("helm")
            .arg("--kubeconfig")
            .arg(self.kubeconfig.display().to_string())
            .arg("--repository-config")
            .arg(self.repository_config.display().to_string())
            .arg("--repository-cache")
            .arg(self.repository_cache.display().to_string())
    }

    async fn values_file(&self, req: &EngineRequest) -> Result<PathBuf> {
        let path = self.work_dir.join(format!("values-{}.yaml", req.release));
        let text = serde_yaml::to_string(&req.values).context("serializing values")?;
        tokio::fs::write(&path, text).await.with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    async fn deploy(&self, verb: &str, req: &EngineRequest) -> Result<()> {
        let values = self.values_file(req).await?;
        let cmd = self
            .helm()
            .args([verb, req.release.as_str()])
            .arg(req.chart_path.display().to_string())
            .args(["--namespace", req.namespace.as_str(), "--values"])
            .arg(values.display().to_string());
        self.runner.run(&cmd).await?;
        info!(verb, release = %req.release, namespace = %req.namespace, "helm: done");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StatusDoc {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    info: StatusInfo,
    #[serde(default)]
    chart: Option<ChartDoc>,
    #[serde(default)]
    manifest: String,
}

#[derive(Debug, Default, Deserialize)]
struct StatusInfo {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ChartDoc {
    metadata: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ListRow {
    name: String,
    namespace: String,
    status: String,
    chart: String,
}

/// `nginx-ingress-1.2.3` into `("nginx-ingress", "1.2.3")`.
pub fn split_chart_label(label: &str) -> (String, String) {
    let re = Regex::new(r"^(.+?)-(v?\d+\.\d+.*)$").ok();
    match re.as_ref().and_then(|re| re.captures(label)) {
        Some(c) => (c[1].to_string(), c[2].to_string()),
        None => (label.to_string(), String::new()),
    }
}

/// Names of dependencies `helm dependency list` reports as missing.
pub fn missing_from_listing(text: &str) -> Vec<String> {
    text.lines()
        .skip_while(|l| !l.starts_with("NAME"))
        .skip(1)
        .filter_map(|l| {
            let cols: Vec<&str> = l.split('\t').map(str::trim).filter(|c| !c.is_empty()).collect();
            (cols.len() >= 4 && cols[3] == "missing").then(|| cols[0].to_string())
        })
        .collect()
}

#[async_trait::async_trait]
impl PackageEngine for HelmEngine {
    async fn locate_chart(&self, chart: &ChartRef, dest: &Path) -> Result<PathBuf> {
        let repo = match &chart.source {
            ChartSource::Repository { repo, .. } => repo,
            ChartSource::Archive { url } => return Err(anyhow!("archive chart {} is not located through a repository", url)),
        };
        let out = dest.join(&chart.name);
        if tokio::fs::metadata(&out).await.is_ok() {
            tokio::fs::remove_dir_all(&out).await.with_context(|| format!("clearing {}", out.display()))?;
        }
        let mut cmd = self.helm().arg("pull").arg(format!("{}/{}", repo, chart.name)).arg("--untar").arg("--untardir").arg(dest.display().to_string());
        if let Some(v) = &chart.version {
            cmd = cmd.args(["--version", v.as_str()]);
        }
        self.runner.run(&cmd).await?;
        Ok(out)
    }

    async fn missing_dependencies(&self, chart_path: &Path) -> Result<Vec<String>> {
        let out = self.runner.run(&self.helm().args(["dependency", "list"]).arg(chart_path.display().to_string())).await?;
        Ok(missing_from_listing(&String::from_utf8_lossy(&out)))
    }

    async fn update_dependencies(&self, chart_path: &Path) -> Result<()> {
        self.runner.run(&self.helm().args(["dependency", "update"]).arg(chart_path.display().to_string())).await?;
        Ok(())
    }

    async fn install(&self, req: &EngineRequest) -> Result<()> {
        self.deploy("install", req).await
    }

    async fn upgrade(&self, req: &EngineRequest) -> Result<()> {
        self.deploy("upgrade", req).await
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        self.runner.run(&self.helm().args(["uninstall", release, "--namespace", namespace])).await?;
        Ok(())
    }

    async fn status(&self, release: &str, namespace: &str) -> Result<NativeRelease> {
        let out = self.runner.run(&self.helm().args(["status", release, "--namespace", namespace, "--output", "json"])).await?;
        let doc: StatusDoc = serde_json::from_slice(&out).context("decoding helm status")?;
        let manifest = if doc.manifest.is_empty() {
            let m = self.runner.run(&self.helm().args(["get", "manifest", release, "--namespace", namespace])).await?;
            String::from_utf8_lossy(&m).into_owned()
        } else {
            doc.manifest
        };
        let (chart_name, chart_version) = doc.chart.map(|c| (c.metadata.name, c.metadata.version)).unwrap_or_default();
        Ok(NativeRelease { name: doc.name, namespace: doc.namespace, status: doc.info.status, chart_name, chart_version, manifest })
    }

    async fn list(&self) -> Result<Vec<NativeRelease>> {
        let out = self.runner.run(&self.helm().args(["list", "--all-namespaces", "--all", "--output", "json"])).await?;
        let rows: Vec<ListRow> = serde_json::from_slice(&out).context("decoding helm list")?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let (chart_name, chart_version) = split_chart_label(&r.chart);
                NativeRelease { name: r.name, namespace: r.namespace, status: r.status, chart_name, chart_version, manifest: String::new() }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;
    use serde_json::Value as Json;

    fn engine(runner: Arc<MockRunner>, dir: &Path) -> HelmEngine {
        HelmEngine::new(runner, dir.join("kubeconfig"), dir.join("repositories.yaml"), dir.join("cache"), dir.to_path_buf())
    }

    #[test]
    fn chart_labels_split_at_the_version() {
        assert_eq!(split_chart_label("nginx-ingress-1.41.3"), ("nginx-ingress".into(), "1.41.3".into()));
        assert_eq!(split_chart_label("redis-v2.0.0-rc1"), ("redis".into(), "v2.0.0-rc1".into()));
        assert_eq!(split_chart_label("weird"), ("weird".into(), String::new()));
    }

    #[test]
    fn missing_dependencies_are_read_from_the_listing() {
        let listing = "NAME    \tVERSION\tREPOSITORY                        \tSTATUS \nmariadb \t7.x.x  \thttps://charts.bitnami.com/bitnami\tmissing\nredis\t10.x.x\thttps://charts.bitnami.com/bitnami\tok\n\n";
        assert_eq!(missing_from_listing(listing), vec!["mariadb".to_string()]);
        assert!(missing_from_listing("WARNING: no dependencies at charts/\n").is_empty());
    }

    #[tokio::test]
    async fn status_falls_back_to_get_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let status = r#"{"name":"web","namespace":"apps","info":{"status":"deployed"},"chart":{"metadata":{"name":"nginx","version":"1.2.3"}}}"#;
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(status), Ok("kind: Service\n")]));
        let r = engine(runner.clone(), dir.path()).status("web", "apps").await.unwrap();
        assert_eq!(r.status, "deployed");
        assert_eq!((r.chart_name.as_str(), r.chart_version.as_str()), ("nginx", "1.2.3"));
        assert_eq!(r.manifest, "kind: Service\n");
        assert!(runner.lines()[1].contains("get manifest web --namespace apps"));
    }

    #[tokio::test]
    async fn install_writes_values_and_passes_them() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::default());
        let mut values = serde_json::Map::new();
        values.insert("replicaCount".into(), Json::from(2));
        let req = EngineRequest { release: "web".into(), namespace: "apps".into(), chart_path: dir.path().join("charts/nginx"), values };
        engine(runner.clone(), dir.path()).install(&req).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("values-web.yaml")).unwrap();
        assert!(written.contains("replicaCount: 2"));
        let line = &runner.lines()[0];
        assert!(line.contains(" install web "), "line={}", line);
        assert!(line.contains("--namespace apps --values"));
    }

    #[tokio::test]
    async fn uninstall_errors_keep_helm_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Err("Error: uninstall: Release not loaded: web: release: not found")]));
        let err = engine(runner, dir.path()).uninstall("web", "apps").await.unwrap_err();
        assert!(charter_ops::is_not_found(&err));
    }
}
