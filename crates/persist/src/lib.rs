//! Charter persistence: the shared chart repository file, its per-repository index
//! cache and remote downloads.
//!
//! Several processes may share one work directory, so every mutation of the
//! repository file happens under an exclusive advisory lock.

#![forbid(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

mod fetch;

pub use fetch::{ArchiveFetcher, HttpFetcher, IndexFetcher};

/// One configured chart repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
}

/// Repository file in the layout the package engine reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoFile {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub generated: String,
    #[serde(default)]
    pub repositories: Vec<RepoEntry>,
}

impl RepoFile {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(s) if s.trim().is_empty() => Ok(Self::default()),
            Ok(s) => serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if self.api_version.is_empty() {
            self.api_version = "v1".into();
        }
        self.generated = chrono::Utc::now().to_rfc3339();
        let text = serde_yaml::to_string(self).context("serializing repository file")?;
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))
    }

    /// Insert or replace by name.
    pub fn update(&mut self, entry: RepoEntry) {
        match self.repositories.iter_mut().find(|r| r.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.repositories.push(entry),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RepoEntry> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// Exclusive advisory lock held for as long as the value lives.
#[derive(Debug)]
pub struct RepoLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RepoLock {
    /// Try the lock every `retry` until `deadline` has elapsed.
    pub async fn acquire(path: &Path, deadline: Duration, retry: Duration) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock {}", path.display()))?;
        let t0 = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    histogram!("charter_repo_lock_wait_ms", t0.elapsed().as_secs_f64() * 1000.0);
                    debug!(lock = %path.display(), "repo lock acquired");
                    return Ok(Self { file, path: path.to_path_buf() });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => return Err(anyhow!("acquiring lock {}: {}", path.display(), e)),
            }
            if t0.elapsed() + retry > deadline {
                return Err(anyhow!("timed out after {:?} waiting for lock {}", deadline, path.display()));
            }
            tokio::time::sleep(retry).await;
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %e, "repo lock release failed");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

fn validate_index(bytes: &[u8]) -> Result<()> {
    let v: serde_yaml::Value = serde_yaml::from_slice(bytes).context("parsing repository index")?;
    if v.get("entries").is_none() {
        return Err(anyhow!("repository index has no entries"));
    }
    Ok(())
}

async fn download_index(fetcher: &dyn IndexFetcher, url: &str, dest: &Path) -> Result<()> {
    let bytes = fetcher.index(url).await?;
    validate_index(&bytes)?;
    tokio::fs::write(dest, &bytes).await.with_context(|| format!("writing {}", dest.display()))
}

/// Repository file plus index cache rooted at two configurable paths.
#[derive(Clone)]
pub struct RepoCache {
    config: PathBuf,
    cache: PathBuf,
    fetcher: Arc<dyn IndexFetcher>,
    lock_deadline: Duration,
    lock_retry: Duration,
}

impl RepoCache {
    pub fn new(config: impl Into<PathBuf>, cache: impl Into<PathBuf>, fetcher: Arc<dyn IndexFetcher>) -> Self {
        Self {
            config: config.into(),
            cache: cache.into(),
            fetcher,
            lock_deadline: Duration::from_secs(30),
            lock_retry: Duration::from_secs(1),
        }
    }

    pub fn with_lock_timing(mut self, deadline: Duration, retry: Duration) -> Self {
        self.lock_deadline = deadline;
        self.lock_retry = retry;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.with_extension("lock")
    }

    pub fn index_path(&self, name: &str) -> PathBuf {
        self.cache.join(format!("{}-index.yaml", name))
    }

    pub fn load(&self) -> Result<RepoFile> {
        RepoFile::load(&self.config)
    }

    /// Register `name -> url` and refresh every configured repository.
    ///
    /// The new repository must serve a valid index; failures refreshing the others
    /// are logged and reported, never returned.
    pub async fn add_and_refresh(&self, name: &str, url: &str) -> Result<RefreshReport> {
        let t0 = Instant::now();
        std::fs::create_dir_all(&self.cache).with_context(|| format!("creating {}", self.cache.display()))?;
        let _lock = RepoLock::acquire(&self.lock_path(), self.lock_deadline, self.lock_retry).await?;

        let mut file = self.load()?;
        download_index(self.fetcher.as_ref(), url, &self.index_path(name))
            .await
            .with_context(|| format!("looks like {:?} is not a valid chart repository or cannot be reached", url))?;
        file.update(RepoEntry { name: name.to_string(), url: url.to_string(), ..Default::default() });
        file.save(&self.config)?;
        info!(repo = %name, url = %url, "repository added");

        let handles: Vec<_> = file
            .repositories
            .iter()
            .map(|r| {
                let fetcher = self.fetcher.clone();
                let (rname, rurl, dest) = (r.name.clone(), r.url.clone(), self.index_path(&r.name));
                tokio::spawn(async move {
                    let res = download_index(fetcher.as_ref(), &rurl, &dest).await;
                    (rname, rurl, res)
                })
            })
            .collect();
        let mut report = RefreshReport::default();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((rname, _, Ok(()))) => {
                    debug!(repo = %rname, "repository refreshed");
                    report.refreshed.push(rname);
                }
                Ok((rname, rurl, Err(e))) => {
                    counter!("charter_repo_refresh_errors_total", 1u64);
                    warn!(repo = %rname, url = %rurl, error = %format!("{:#}", e), "repository refresh failed");
                    report.failed.push((rname, format!("{:#}", e)));
                }
                Err(e) => {
                    counter!("charter_repo_refresh_errors_total", 1u64);
                    warn!(error = %e, "repository refresh task failed");
                    report.failed.push((String::new(), e.to_string()));
                }
            }
        }
        histogram!("charter_repo_refresh_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(refreshed = report.refreshed.len(), failed = report.failed.len(), "repository update complete");
        Ok(report)
    }
}
