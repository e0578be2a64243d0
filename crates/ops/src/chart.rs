//! Chart locator resolution.

use regex::Regex;
use serde::{Deserialize, Serialize};

use charter_core::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", rename_all = "PascalCase")]
pub enum ChartSource {
    /// Named chart in a chart repository.
    Repository {
        #[serde(rename = "Repo")]
        repo: String,
        #[serde(rename = "URL")]
        url: String,
    },
    /// Packaged chart fetched from a URL (`https://` or `s3://`).
    Archive {
        #[serde(rename = "URL")]
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChartRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source: ChartSource,
}

impl ChartRef {
    /// `repo/name` for repository charts, the archive URL otherwise.
    pub fn locator(&self) -> String {
        match &self.source {
            ChartSource::Repository { repo, .. } => format!("{}/{}", repo, self.name),
            ChartSource::Archive { url } => url.clone(),
        }
    }
}

/// `(scheme, host, path)` when `s` is a URL with a non-empty host.
fn split_url(s: &str) -> Option<(&str, &str, &str)> {
    let (scheme, rest) = s.split_once("://")?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    (!scheme.is_empty() && !host.is_empty()).then_some((scheme, host, path))
}

fn archive_chart_name(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or("");
    let file = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let re = Regex::new(r"[A-Za-z]+").ok()?;
    re.find(file).map(|m| m.as_str().to_string())
}

/// Resolve a chart string plus optional repository URL and version.
pub fn resolve(chart: Option<&str>, repository: Option<&str>, version: Option<&str>, stable_url: &str) -> Result<ChartRef, Error> {
    let chart = chart.map(str::trim).filter(|c| !c.is_empty()).ok_or_else(|| Error::Validation("chart is required".into()))?;
    let version = version.filter(|v| !v.is_empty()).map(str::to_string);
    if let Some((_, _, path)) = split_url(chart) {
        let name = archive_chart_name(path).ok_or_else(|| Error::Validation(format!("cannot derive chart name from {}", chart)))?;
        return Ok(ChartRef { name, version, source: ChartSource::Archive { url: chart.to_string() } });
    }
    let (repo, name) = match chart.split_once('/') {
        Some((r, n)) if !r.is_empty() && !n.is_empty() => (r.to_string(), n.to_string()),
        Some(_) => return Err(Error::Validation(format!("invalid chart {:?}", chart))),
        None => ("stable".to_string(), chart.to_string()),
    };
    let url = repository.filter(|u| !u.is_empty()).unwrap_or(stable_url).to_string();
    Ok(ChartRef { name, version, source: ChartSource::Repository { repo, url } })
}
