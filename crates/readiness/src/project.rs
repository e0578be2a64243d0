//! Flattened `Kind -> name -> fields` projection of release objects.

use serde_json::{Map, Value as Json};

use charter_core::DEFAULT_NAMESPACE;

use crate::{kind_of, name_of};

fn scalar(v: Option<&Json>) -> String {
    match v {
        Some(Json::String(s)) => s.clone(),
        Some(Json::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn at<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, k| cur.get(k))
}

fn count(v: &Json, path: &[&str]) -> String {
    at(v, path).and_then(|x| x.as_i64()).unwrap_or(0).to_string()
}

fn first_lb_hostname(v: &Json) -> Option<String> {
    at(v, &["status", "loadBalancer", "ingress"])
        .and_then(|x| x.as_array())
        .and_then(|a| a.first())
        .map(|i| scalar(i.get("hostname")))
}

/// Insert `value` under `root[kind][name]` following a dotted field path.
fn put(root: &mut Map<String, Json>, kind: &str, name: &str, field: &str, value: String) {
    let mut cur = root
        .entry(kind.to_string())
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
        .map(|m| m.entry(name.to_string()).or_insert_with(|| Json::Object(Map::new())));
    let parts: Vec<&str> = field.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let Some(Json::Object(m)) = cur else { return };
        if i + 1 == parts.len() {
            m.insert((*part).to_string(), Json::String(value));
            return;
        }
        let next = m.entry((*part).to_string()).or_insert_with(|| Json::Object(Map::new()));
        cur = Some(next);
    }
}

/// Project objects into the nested resource map reported to the caller.
pub fn flatten(objects: &[Json]) -> Map<String, Json> {
    let mut out = Map::new();
    for v in objects {
        let (kind, name) = (kind_of(v), name_of(v));
        if kind.is_empty() || name.is_empty() {
            continue;
        }
        let ns = at(v, &["metadata", "namespace"])
            .and_then(|x| x.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
            .to_string();
        let key = if kind == "Ingress" { "Ingresses" } else { kind };
        put(&mut out, key, name, "ObjectMeta.Namespace", ns);
        match kind {
            "Service" => {
                let ty = scalar(at(v, &["spec", "type"]));
                let ty = if ty.is_empty() { "ClusterIP".to_string() } else { ty };
                put(&mut out, key, name, "Spec.Type", ty.clone());
                match ty.as_str() {
                    "LoadBalancer" => {
                        if let Some(h) = first_lb_hostname(v) {
                            put(&mut out, key, name, "Status.LoadBalancer.Ingress.Hostname", h);
                        }
                        put(&mut out, key, name, "Spec.ClusterIP", scalar(at(v, &["spec", "clusterIP"])));
                    }
                    "ClusterIP" => put(&mut out, key, name, "Spec.ClusterIP", scalar(at(v, &["spec", "clusterIP"]))),
                    "ExternalName" => put(&mut out, key, name, "Spec.ExternalName", scalar(at(v, &["spec", "externalName"]))),
                    _ => {}
                }
            }
            "Deployment" => {
                put(&mut out, key, name, "Status.Replicas", count(v, &["status", "replicas"]));
                put(&mut out, key, name, "Status.ReadyReplicas", count(v, &["status", "readyReplicas"]));
                put(&mut out, key, name, "Status.AvailableReplicas", count(v, &["status", "availableReplicas"]));
            }
            "DaemonSet" => {
                put(&mut out, key, name, "Status.NumberReady", count(v, &["status", "numberReady"]));
                put(&mut out, key, name, "Status.NumberAvailable", count(v, &["status", "numberAvailable"]));
                put(&mut out, key, name, "Status.NumberUnavailable", count(v, &["status", "numberUnavailable"]));
            }
            "StatefulSet" => {
                put(&mut out, key, name, "Status.Replicas", count(v, &["status", "replicas"]));
                put(&mut out, key, name, "Status.ReadyReplicas", count(v, &["status", "readyReplicas"]));
                put(&mut out, key, name, "Status.UpdatedReplicas", count(v, &["status", "updatedReplicas"]));
            }
            "Ingress" => {
                if let Some(h) = first_lb_hostname(v) {
                    put(&mut out, key, name, "Status.LoadBalancer.Ingress.Hostname", h);
                }
            }
            _ => {}
        }
    }
    out
}
