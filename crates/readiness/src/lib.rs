//! Charter readiness: decides from a rendered manifest whether a release has converged.
//!
//! Manifests are parsed into JSON documents, resolved to their live versions through an
//! [`ObjectLister`], then judged per kind. The same documents feed the flattened
//! projection returned on the read path.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use charter_core::{Error, Settings};
use charter_kubehub::ObjectLister;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

mod project;

pub use project::flatten;

/// Input guards applied before any document is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self { max_bytes: 4 * 1024 * 1024, max_nodes: 100_000 }
    }
}

impl From<&Settings> for ManifestLimits {
    fn from(s: &Settings) -> Self {
        Self { max_bytes: s.max_manifest_bytes, max_nodes: s.max_manifest_nodes }
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Split a multi-document manifest into JSON objects, skipping empty documents.
pub fn parse_manifest(text: &str, limits: ManifestLimits) -> Result<Vec<Json>> {
    if text.trim().is_empty() {
        return Err(Error::Validation("manifest not provided".into()).into());
    }
    if text.len() > limits.max_bytes {
        return Err(Error::Validation(format!("manifest too large (>{} bytes)", limits.max_bytes)).into());
    }
    let mut docs = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing manifest document {}", i))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("converting manifest document {}", i))?;
        if json_node_budget_exceeded(&json, limits.max_nodes) {
            return Err(Error::Validation(format!("manifest document {} too complex (>{} nodes)", i, limits.max_nodes)).into());
        }
        if json.is_object() {
            docs.push(json);
        }
    }
    if docs.is_empty() {
        return Err(Error::Validation("manifest contains no objects".into()).into());
    }
    Ok(docs)
}

fn str_at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, k| cur.get(k)).and_then(|x| x.as_str())
}

fn int_at(v: &Json, path: &[&str]) -> Option<i64> {
    path.iter().try_fold(v, |cur, k| cur.get(k)).and_then(|x| x.as_i64())
}

fn lb_ingress_empty(v: &Json) -> bool {
    ["status", "loadBalancer", "ingress"]
        .iter()
        .try_fold(v, |cur, k| cur.get(k))
        .and_then(|x| x.as_array())
        .map(|a| a.is_empty())
        .unwrap_or(true)
}

pub(crate) fn kind_of(v: &Json) -> &str {
    v.get("kind").and_then(|k| k.as_str()).unwrap_or("")
}

pub(crate) fn name_of(v: &Json) -> &str {
    str_at(v, &["metadata", "name"]).unwrap_or("")
}

/// Why an object is not yet converged, or `None` when it is (or its kind is never judged).
pub fn pending_reason(v: &Json) -> Option<String> {
    let (kind, name) = (kind_of(v), name_of(v));
    match kind {
        "Service" => {
            let lb = str_at(v, &["spec", "type"]) == Some("LoadBalancer");
            (lb && lb_ingress_empty(v)).then(|| format!("Service/{}: load balancer ingress not assigned", name))
        }
        "Deployment" | "StatefulSet" => {
            let want = int_at(v, &["spec", "replicas"]).unwrap_or(1);
            let ready = int_at(v, &["status", "readyReplicas"]).unwrap_or(0);
            (ready < want).then(|| format!("{}/{}: {}/{} replicas ready", kind, name, ready, want))
        }
        "DaemonSet" => {
            let unavailable = int_at(v, &["status", "numberUnavailable"]).unwrap_or(0);
            (unavailable > 0).then(|| format!("DaemonSet/{}: {} pods unavailable", name, unavailable))
        }
        "Ingress" => lb_ingress_empty(v).then(|| format!("Ingress/{}: load balancer ingress not assigned", name)),
        _ => None,
    }
}

/// Pending reasons over a set of objects; empty means converged.
pub fn pending_reasons(objects: &[Json]) -> Vec<String> {
    objects.iter().filter_map(pending_reason).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub pending: bool,
    pub reasons: Vec<String>,
}

/// Readiness checks and projection against live cluster state.
#[derive(Clone)]
pub struct Inspector {
    lister: Arc<dyn ObjectLister>,
    limits: ManifestLimits,
}

impl Inspector {
    pub fn new(lister: Arc<dyn ObjectLister>, limits: ManifestLimits) -> Self {
        Self { lister, limits }
    }

    async fn live(&self, namespace: &str, manifest: &str) -> Result<Vec<Json>> {
        let docs = parse_manifest(manifest, self.limits)?;
        self.lister.live(namespace, &docs).await.context("fetching live objects")
    }

    pub async fn check(&self, namespace: &str, manifest: &str) -> Result<Readiness> {
        let t0 = std::time::Instant::now();
        let objects = self.live(namespace, manifest).await?;
        let reasons = pending_reasons(&objects);
        histogram!("charter_readiness_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if reasons.is_empty() {
            counter!("charter_readiness_ready_total", 1u64);
            info!(namespace = %namespace, objects = objects.len(), "readiness: converged");
        } else {
            counter!("charter_readiness_pending_total", 1u64);
            debug!(namespace = %namespace, pending = reasons.len(), first = %reasons[0], "readiness: pending");
        }
        Ok(Readiness { pending: !reasons.is_empty(), reasons })
    }

    pub async fn resources(&self, namespace: &str, manifest: &str) -> Result<serde_json::Map<String, Json>> {
        let objects = self.live(namespace, manifest).await?;
        Ok(flatten(&objects))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(want: Option<i64>, ready: Option<i64>) -> Json {
        let mut d = json!({"apiVersion": "apps/v1", "kind": "Deployment", "metadata": {"name": "web"}, "spec": {}, "status": {}});
        if let Some(w) = want { d["spec"]["replicas"] = json!(w); }
        if let Some(r) = ready { d["status"]["readyReplicas"] = json!(r); }
        d
    }

    #[test]
    fn deployment_replica_predicate() {
        assert!(pending_reason(&deployment(Some(2), Some(2))).is_none());
        let r = pending_reason(&deployment(Some(2), Some(1))).unwrap();
        assert_eq!(r, "Deployment/web: 1/2 replicas ready");
        assert!(pending_reason(&deployment(None, None)).is_some());
        assert!(pending_reason(&deployment(Some(0), None)).is_none());
    }

    #[test]
    fn load_balancer_without_ingress_is_pending() {
        let lb = json!({"kind": "Service", "metadata": {"name": "edge"}, "spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {}}});
        let cip = json!({"kind": "Service", "metadata": {"name": "int"}, "spec": {"type": "ClusterIP"}});
        let ready = deployment(Some(1), Some(1));
        let reasons = pending_reasons(&[cip.clone(), ready, lb]);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("Service/edge"));
        assert!(pending_reason(&cip).is_none());
    }

    #[test]
    fn daemonset_and_ingress_predicates() {
        let ds = json!({"kind": "DaemonSet", "metadata": {"name": "agent"}, "status": {"numberUnavailable": 2}});
        assert!(pending_reason(&ds).is_some());
        let ds_ok = json!({"kind": "DaemonSet", "metadata": {"name": "agent"}, "status": {"numberUnavailable": 0}});
        assert!(pending_reason(&ds_ok).is_none());
        let ing = json!({"kind": "Ingress", "metadata": {"name": "site"}, "status": {"loadBalancer": {"ingress": [{"hostname": "a.elb"}]}}});
        assert!(pending_reason(&ing).is_none());
        let cm = json!({"kind": "ConfigMap", "metadata": {"name": "cfg"}});
        assert!(pending_reason(&cm).is_none());
    }

    #[test]
    fn manifest_parsing_skips_empty_documents() {
        let m = "---\n# Source: chart/templates/svc.yaml\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: a\n---\n\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        let docs = parse_manifest(m, ManifestLimits::default()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(kind_of(&docs[1]), "ConfigMap");
    }

    #[test]
    fn manifest_guards() {
        let empty = parse_manifest("   ", ManifestLimits::default()).unwrap_err();
        assert!(empty.downcast_ref::<Error>().unwrap().is_validation());
        let only_comments = parse_manifest("# nothing\n---\n", ManifestLimits::default()).unwrap_err();
        assert!(only_comments.to_string().contains("no objects"), "e={}", only_comments);
        let big = parse_manifest("kind: ConfigMap\n", ManifestLimits { max_bytes: 4, max_nodes: 10 }).unwrap_err();
        assert!(big.to_string().contains("too large"));
        let deep = "kind: ConfigMap\ndata:\n  a: 1\n  b: 2\n  c: 3\n";
        assert!(parse_manifest(deep, ManifestLimits { max_bytes: 1024, max_nodes: 3 }).is_err());
    }
}
