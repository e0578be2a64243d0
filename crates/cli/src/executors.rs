//! Wiring of in-process executors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use charter_api::ExecutorFactory;
use charter_core::Settings;
use charter_kubehub::KubeCluster;
use charter_ops::{DirectOps, ReleaseOps};
use charter_persist::{ArchiveFetcher, HttpFetcher, RepoCache};
use charter_readiness::Inspector;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::helm::HelmEngine;
use crate::runner::Runner;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct LocalExecutors {
    settings: Settings,
    runner: Arc<dyn Runner>,
    archives: Arc<dyn ArchiveFetcher>,
}

/// Write kubeconfig bytes readable by the owner only.
pub async fn write_kubeconfig(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut f = opts.open(path).await.with_context(|| format!("opening {}", path.display()))?;
    f.write_all(bytes).await.with_context(|| format!("writing {}", path.display()))?;
    f.flush().await?;
    Ok(())
}

impl LocalExecutors {
    pub fn new(settings: Settings, runner: Arc<dyn Runner>, archives: Arc<dyn ArchiveFetcher>) -> Self {
        Self { settings, runner, archives }
    }

    fn kubeconfig_path(&self) -> PathBuf {
        self.settings.work_dir.join("kubeconfig")
    }
}

#[async_trait::async_trait]
impl ExecutorFactory for LocalExecutors {
    async fn direct(&self, kubeconfig: &[u8], namespace: &str) -> Result<Arc<dyn ReleaseOps>> {
        let path = self.kubeconfig_path();
        write_kubeconfig(&path, kubeconfig).await?;
        let cluster = Arc::new(KubeCluster::connect(kubeconfig).await?);
        let inspector = Inspector::new(cluster.clone(), (&self.settings).into());
        let repos = RepoCache::new(&self.settings.repository_config, &self.settings.repository_cache, Arc::new(HttpFetcher::new(HTTP_TIMEOUT)?));
        let engine = HelmEngine::new(
            self.runner.clone(),
            path,
            self.settings.repository_config.clone(),
            self.settings.repository_cache.clone(),
            self.settings.work_dir.clone(),
        );
        debug!(namespace = %namespace, "executor: direct");
        let ops = DirectOps::new(Arc::new(engine), cluster, inspector, repos, self.archives.clone(), &self.settings.work_dir)
            .with_dependency_update(self.settings.dependency_update);
        Ok(Arc::new(ops))
    }
}
