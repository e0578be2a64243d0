//! Charter kubehub: cluster credentials, kube client wiring and live object lookup.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use charter_core::{Error, Locator};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, PostParams},
    core::{DynamicObject, GroupVersionKind, ObjectMeta},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Network settings reported for a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub vpc_id: Option<String>,
    pub endpoint_public_access: bool,
    pub public_access_cidrs: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub name: String,
    pub endpoint: String,
    /// Base64 certificate authority bundle as reported by the provider.
    pub ca_data: String,
    pub status: String,
    pub network: ClusterNetwork,
}

#[async_trait::async_trait]
pub trait ClusterDirectory: Send + Sync {
    async fn describe(&self, cluster: &str, role: Option<&str>) -> Result<ClusterDescriptor>;
}

#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, cluster: &str, role: Option<&str>) -> Result<String>;
}

#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn fetch(&self, secret_ref: &str, role: Option<&str>) -> Result<Vec<u8>>;
}

/// Live versions of manifest documents. Documents with no live counterpart come back unchanged.
#[async_trait::async_trait]
pub trait ObjectLister: Send + Sync {
    async fn live(&self, namespace: &str, docs: &[Json]) -> Result<Vec<Json>>;
}

#[async_trait::async_trait]
pub trait Namespaces: Send + Sync {
    /// Create the namespace; an existing namespace is success.
    async fn ensure(&self, namespace: &str) -> Result<()>;
}

/// Describe a cluster and insist it is serving.
pub async fn active_cluster(dir: &dyn ClusterDirectory, cluster: &str, role: Option<&str>) -> Result<ClusterDescriptor> {
    let d = dir.describe(cluster, role).await.with_context(|| format!("describe cluster {}", cluster))?;
    if d.status != "ACTIVE" {
        return Err(anyhow!("cluster {} in unexpected state {}", cluster, d.status));
    }
    Ok(d)
}

/// Kubeconfig document for a described cluster authenticated by a bearer token.
pub fn kubeconfig_for_cluster(cluster: &str, d: &ClusterDescriptor, token: &str) -> Result<String> {
    let ca = STANDARD.decode(d.ca_data.trim()).context("decoding cluster CA")?;
    let doc = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": cluster, "cluster": { "server": d.endpoint, "certificate-authority-data": STANDARD.encode(ca) } }],
        "users": [{ "name": "aws", "user": { "token": token } }],
        "contexts": [{ "name": "aws", "context": { "cluster": cluster, "user": "aws" } }],
        "current-context": "aws",
    });
    serde_yaml::to_string(&doc).context("serializing kubeconfig")
}

/// Turns a locator into kubeconfig bytes using the credential collaborators.
#[derive(Clone)]
pub struct KubeconfigResolver {
    pub directory: Arc<dyn ClusterDirectory>,
    pub tokens: Arc<dyn TokenSource>,
    pub secrets: Arc<dyn SecretSource>,
}

impl KubeconfigResolver {
    pub async fn resolve(&self, locator: &Locator, role: Option<&str>) -> Result<Vec<u8>> {
        match locator {
            Locator::Cluster(c) => {
                let d = active_cluster(self.directory.as_ref(), c, role).await?;
                let token = self.tokens.token(c, role).await.context("generating cluster token")?;
                info!(cluster = %c, endpoint = %d.endpoint, "kubeconfig: synthesized");
                Ok(kubeconfig_for_cluster(c, &d, &token)?.into_bytes())
            }
            Locator::Config(r) => {
                let bytes = self.secrets.fetch(r, role).await.context("reading kubeconfig secret")?;
                if bytes.is_empty() {
                    return Err(Error::Validation(format!("kubeconfig secret {} is empty", r)).into());
                }
                info!(secret = %r, bytes = bytes.len(), "kubeconfig: fetched");
                Ok(bytes)
            }
        }
    }
}

/// Build a client from kubeconfig bytes (current context).
pub async fn client_from_kubeconfig(bytes: &[u8]) -> Result<Client> {
    let text = std::str::from_utf8(bytes).context("kubeconfig is not utf-8")?;
    let kc = kube::config::Kubeconfig::from_yaml(text).context("parsing kubeconfig")?;
    let cfg = kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
        .await
        .context("loading kubeconfig")?;
    Client::try_from(cfg).context("building kube client")
}

/// Cluster handle backed by a live kube client; discovery is run at most once.
pub struct KubeCluster {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    pub async fn connect(kubeconfig: &[u8]) -> Result<Self> {
        Ok(Self::new(client_from_kubeconfig(kubeconfig).await?))
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async { Discovery::new(self.client.clone()).run().await.context("running discovery") })
            .await
    }
}

/// Group/version/kind plus name and namespace of a manifest document.
pub fn doc_target(doc: &Json) -> Result<(GroupVersionKind, String, Option<String>)> {
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing apiVersion"))?;
    let kind = doc.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing kind"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let meta = doc.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).ok_or_else(|| anyhow!("document missing metadata.name"))?;
    let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok((GroupVersionKind { group, version, kind: kind.to_string() }, name.to_string(), ns))
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Option<(kube::core::ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Some((ar.clone(), namespaced));
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl ObjectLister for KubeCluster {
    async fn live(&self, namespace: &str, docs: &[Json]) -> Result<Vec<Json>> {
        let discovery = self.discovery().await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            let (gvk, name, ns) = doc_target(doc)?;
            let Some((ar, namespaced)) = find_api_resource(discovery, &gvk) else {
                warn!(kind = %gvk.kind, name = %name, "live: kind not served; using manifest");
                out.push(doc.clone());
                continue;
            };
            let api: Api<DynamicObject> = if namespaced {
                Api::namespaced_with(self.client.clone(), ns.as_deref().unwrap_or(namespace), &ar)
            } else {
                Api::all_with(self.client.clone(), &ar)
            };
            match api.get_opt(&name).await.with_context(|| format!("get {}/{}", gvk.kind, name))? {
                Some(obj) => out.push(serde_json::to_value(&obj).context("serializing live object")?),
                None => {
                    debug!(kind = %gvk.kind, name = %name, "live: not found; using manifest");
                    out.push(doc.clone());
                }
            }
        }
        counter!("charter_live_lookups_total", out.len() as u64);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Namespaces for KubeCluster {
    async fn ensure(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace { metadata: ObjectMeta { name: Some(namespace.to_string()), ..Default::default() }, ..Default::default() };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => {
                info!(namespace = %namespace, "namespace: created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!(namespace = %namespace, "namespace: already exists");
                Ok(())
            }
            Err(e) => Err(anyhow!("create namespace {}: {}", namespace, e)),
        }
    }
}
