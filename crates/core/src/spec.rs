//! Desired spec as handed over by the caller, plus the locator it resolves to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::DEFAULT_NAMESPACE;

/// Security groups and subnets a bridge function is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkIsolation {
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

impl NetworkIsolation {
    pub fn is_empty(&self) -> bool {
        self.security_group_ids.is_empty() && self.subnet_ids.is_empty()
    }
}

/// User-supplied description of one managed release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseSpec {
    #[serde(rename = "ClusterID", default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_yaml: Option<String>,
    #[serde(rename = "ValueOverrideURL", default, skip_serializing_if = "Option::is_none")]
    pub value_override_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "VPCConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkIsolation>,
    #[serde(rename = "TimeOut", default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Where the cluster credentials come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// Named cluster, described through the cloud provider.
    Cluster(String),
    /// Reference to a stored kubeconfig document.
    Config(String),
}

impl Locator {
    pub fn value(&self) -> &str {
        match self {
            Locator::Cluster(v) | Locator::Config(v) => v,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Locator::Cluster(_) => "cluster",
            Locator::Config(_) => "kubeconfig",
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

impl ReleaseSpec {
    /// Resolve the exactly-one-of locator pair.
    pub fn locator(&self) -> Result<Locator, Error> {
        match (non_empty(&self.cluster_id), non_empty(&self.kube_config)) {
            (Some(_), Some(_)) => Err(Error::Validation("both ClusterID and KubeConfig can not be specified".into())),
            (Some(c), None) => Ok(Locator::Cluster(c.to_string())),
            (None, Some(k)) => Ok(Locator::Config(k.to_string())),
            (None, None) => Err(Error::Validation("either ClusterID or KubeConfig must be specified".into())),
        }
    }

    pub fn namespace_or_default(&self) -> String {
        non_empty(&self.namespace).unwrap_or(DEFAULT_NAMESPACE).to_string()
    }

    /// Explicit, non-empty isolation settings, if any.
    pub fn explicit_network(&self) -> Option<&NetworkIsolation> {
        self.network.as_ref().filter(|n| !n.is_empty())
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_requires_exactly_one() {
        let mut s = ReleaseSpec::default();
        assert!(matches!(s.locator(), Err(Error::Validation(_))));
        s.cluster_id = Some("eks".into());
        assert_eq!(s.locator().unwrap(), Locator::Cluster("eks".into()));
        s.kube_config = Some("arn:secret".into());
        let err = s.locator().unwrap_err().to_string();
        assert!(err.contains("both"), "err={}", err);
        s.cluster_id = None;
        assert_eq!(s.locator().unwrap(), Locator::Config("arn:secret".into()));
    }

    #[test]
    fn spec_uses_resource_model_keys() {
        let s: ReleaseSpec = serde_json::from_value(serde_json::json!({
            "ClusterID": "eks",
            "Chart": "stable/nginx",
            "Namespace": "web",
            "VPCConfiguration": { "SecurityGroupIds": ["sg-1"], "SubnetIds": ["subnet-1"] },
            "TimeOut": 5,
            "Values": { "replicaCount": "2" }
        }))
        .unwrap();
        assert_eq!(s.cluster_id.as_deref(), Some("eks"));
        assert_eq!(s.timeout_minutes, Some(5));
        assert_eq!(s.network.as_ref().unwrap().subnet_ids, vec!["subnet-1"]);
        let back = serde_json::to_value(&s).unwrap();
        assert_eq!(back["VPCConfiguration"]["SecurityGroupIds"][0], "sg-1");
        assert!(back.get("ID").is_none());
    }

    #[test]
    fn empty_namespace_falls_back_to_default() {
        let s = ReleaseSpec { namespace: Some(String::new()), ..Default::default() };
        assert_eq!(s.namespace_or_default(), "default");
        let e = ReleaseSpec { network: Some(NetworkIsolation::default()), ..Default::default() };
        assert!(e.explicit_network().is_none());
    }
}
