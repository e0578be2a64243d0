//! Charter bridge: a relay function deployed inside a private network that runs release
//! operations on behalf of callers who cannot reach the cluster endpoint.
//!
//! The bridge is named deterministically from the cluster locator and its network
//! settings, created lazily, updated when its code or configuration drifts, and torn
//! down when the release is deleted.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use charter_core::settings::BridgeSettings;
use charter_core::{Error, Locator, NetworkIsolation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

mod bridged;
pub mod envelope;
mod isolation;

pub use bridged::BridgedOps;
pub use envelope::{serve_envelope, Action, Envelope, EnvelopeResponse};
pub use isolation::{detect_isolation, publicly_reachable, SubnetRoutes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeState {
    NotFound,
    Pending,
    Active,
    Inactive,
    Failed,
}

impl BridgeState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Active" => Self::Active,
            "Inactive" => Self::Inactive,
            "NotFound" => Self::NotFound,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Desired shape of the relay function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub role: String,
    pub handler: String,
    pub runtime: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    pub network: NetworkIsolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removed {
    Deleted,
    Absent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvokeResult {
    /// Set when the function itself failed; the payload then carries the error document.
    pub function_error: Option<String>,
    pub payload: Vec<u8>,
}

/// Serverless function host the bridge is deployed to.
#[async_trait::async_trait]
pub trait FunctionHost: Send + Sync {
    async fn state(&self, name: &str) -> Result<BridgeState>;
    /// Fingerprint of the deployed code, in the [`fingerprint`] format.
    async fn code_fingerprint(&self, name: &str) -> Result<String>;
    async fn create(&self, spec: &FunctionSpec, package: &[u8]) -> Result<Provisioned>;
    async fn update_code(&self, name: &str, package: &[u8]) -> Result<()>;
    async fn update_config(&self, spec: &FunctionSpec) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<Removed>;
    async fn invoke(&self, name: &str, payload: &[u8]) -> Result<InvokeResult>;
    /// Role of the calling identity, used when no execution role is configured.
    async fn caller_role(&self) -> Result<String>;
}

/// Deterministic bridge name for a locator and isolation settings.
///
/// Id lists are sorted first, so their order never changes the name.
pub fn bridge_name(prefix: &str, locator: &Locator, network: &NetworkIsolation) -> String {
    let mut sgs = network.security_group_ids.clone();
    let mut subnets = network.subnet_ids.clone();
    sgs.sort();
    subnets.sort();
    let key = format!("{}-{}-{}", locator.value(), sgs.join("-"), subnets.join("-"));
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}{}", prefix, &digest[..32])
}

/// base64(sha256(bytes)), the format function hosts report deployed code in.
pub fn fingerprint(package: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(package))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Active,
    /// Still converging after the bounded wait; report progress and retry later.
    NotReady(BridgeState),
}

#[derive(Debug, Clone)]
enum PackageSource {
    Path(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

/// Lifecycle and invocation of bridge functions.
#[derive(Clone)]
pub struct BridgeManager {
    host: Arc<dyn FunctionHost>,
    settings: BridgeSettings,
    package: PackageSource,
}

impl BridgeManager {
    /// Deployment package read from `settings.package_path` when first needed.
    pub fn new(host: Arc<dyn FunctionHost>, settings: BridgeSettings) -> Self {
        let package = PackageSource::Path(settings.package_path.clone());
        Self { host, settings, package }
    }

    pub fn with_package(host: Arc<dyn FunctionHost>, settings: BridgeSettings, package: Vec<u8>) -> Self {
        Self { host, settings, package: PackageSource::Bytes(Arc::new(package)) }
    }

    pub fn name_for(&self, locator: &Locator, network: &NetworkIsolation) -> String {
        bridge_name(&self.settings.prefix, locator, network)
    }

    async fn package(&self) -> Result<Arc<Vec<u8>>> {
        match &self.package {
            PackageSource::Bytes(b) => Ok(b.clone()),
            PackageSource::Path(p) => {
                let bytes = tokio::fs::read(p).await.with_context(|| format!("reading bridge package {}", p.display()))?;
                Ok(Arc::new(bytes))
            }
        }
    }

    async fn function_spec(&self, name: &str, network: &NetworkIsolation) -> Result<FunctionSpec> {
        let role = match &self.settings.role_arn {
            Some(r) => r.clone(),
            None => self.host.caller_role().await.context("resolving bridge execution role")?,
        };
        Ok(FunctionSpec {
            name: name.to_string(),
            role,
            handler: self.settings.handler.clone(),
            runtime: self.settings.runtime.clone(),
            memory_mb: self.settings.memory_mb,
            timeout_secs: self.settings.timeout_secs,
            network: network.clone(),
        })
    }

    async fn poll_active(&self, name: &str, interval: Duration) -> Result<BridgeStatus> {
        let mut last = BridgeState::NotFound;
        for attempt in 0..self.settings.tries {
            last = self.host.state(name).await?;
            if last == BridgeState::Active {
                return Ok(BridgeStatus::Active);
            }
            debug!(bridge = %name, attempt, state = %last, "bridge: waiting");
            if attempt + 1 < self.settings.tries {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(BridgeStatus::NotReady(last))
    }

    /// Bring the bridge to `Active`, creating or updating it as needed.
    ///
    /// Waits at most `tries * interval`; a bridge still converging yields `NotReady`.
    pub async fn ensure_active(&self, name: &str, network: &NetworkIsolation) -> Result<BridgeStatus> {
        let state = self.host.state(name).await.with_context(|| format!("reading state of bridge {}", name))?;
        info!(bridge = %name, state = %state, "bridge: state");
        match state {
            BridgeState::NotFound => {
                let spec = self.function_spec(name, network).await?;
                let package = self.package().await?;
                match self.host.create(&spec, &package).await.with_context(|| format!("creating bridge {}", name))? {
                    Provisioned::Created => info!(bridge = %name, "bridge: created"),
                    Provisioned::AlreadyExists => info!(bridge = %name, "bridge: already exists"),
                }
                counter!("charter_bridge_creates_total", 1u64);
                self.poll_active(name, Duration::from_secs(self.settings.create_interval_secs)).await
            }
            BridgeState::Active => {
                let spec = self.function_spec(name, network).await?;
                let package = self.package().await?;
                let deployed = self.host.code_fingerprint(name).await.context("reading bridge code fingerprint")?;
                if deployed != fingerprint(&package) {
                    info!(bridge = %name, "bridge: code drift; updating");
                    self.host.update_code(name, &package).await.context("updating bridge code")?;
                    counter!("charter_bridge_code_updates_total", 1u64);
                }
                self.host.update_config(&spec).await.context("updating bridge configuration")?;
                Ok(BridgeStatus::Active)
            }
            BridgeState::Pending => self.poll_active(name, Duration::from_secs(self.settings.pending_interval_secs)).await,
            other => Err(Error::Validation(format!("{} not in desired state: {}", name, other)).into()),
        }
    }

    /// Send an envelope; function-level failures come back as `[type] message` errors.
    pub async fn invoke(&self, name: &str, envelope: &Envelope) -> Result<EnvelopeResponse> {
        let payload = serde_json::to_vec(envelope).context("encoding envelope")?;
        counter!("charter_bridge_invocations_total", 1u64);
        info!(bridge = %name, action = %envelope.action, "bridge: invoke");
        let r = self.host.invoke(name, &payload).await?;
        if let Some(kind) = r.function_error.as_deref() {
            counter!("charter_bridge_remote_errors_total", 1u64);
            let msg = envelope::remote_error_message(kind, &r.payload);
            warn!(bridge = %name, action = %envelope.action, error = %msg, "bridge: remote error");
            return Err(anyhow!(msg));
        }
        envelope::decode_response(&r.payload)
    }

    /// Delete the bridge; an absent bridge is success.
    pub async fn teardown(&self, name: &str) -> Result<()> {
        match self.host.delete(name).await.with_context(|| format!("deleting bridge {}", name))? {
            Removed::Deleted => info!(bridge = %name, "bridge: deleted"),
            Removed::Absent => info!(bridge = %name, "bridge: already gone"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(sgs: &[&str], subnets: &[&str]) -> NetworkIsolation {
        NetworkIsolation {
            security_group_ids: sgs.iter().map(|s| s.to_string()).collect(),
            subnet_ids: subnets.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn names_are_deterministic_and_order_insensitive() {
        let loc = Locator::Cluster("eks".into());
        let a = bridge_name("helm-provider-vpc-connector-", &loc, &net(&["sg-1", "sg-2"], &["subnet-a", "subnet-b"]));
        let b = bridge_name("helm-provider-vpc-connector-", &loc, &net(&["sg-2", "sg-1"], &["subnet-b", "subnet-a"]));
        assert_eq!(a, b);
        assert_eq!(a.len(), "helm-provider-vpc-connector-".len() + 32);
        assert!(a.starts_with("helm-provider-vpc-connector-"));
    }

    #[test]
    fn names_differ_per_locator_and_network() {
        let n = net(&["sg-1"], &["subnet-a"]);
        let a = bridge_name("p-", &Locator::Cluster("eks".into()), &n);
        let b = bridge_name("p-", &Locator::Cluster("eks2".into()), &n);
        let c = bridge_name("p-", &Locator::Cluster("eks".into()), &net(&["sg-1"], &["subnet-b"]));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_is_base64_sha256() {
        assert_eq!(fingerprint(b""), "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=");
    }

    #[test]
    fn unknown_states_are_failures() {
        assert_eq!(BridgeState::parse("Active"), BridgeState::Active);
        assert_eq!(BridgeState::parse("Weird"), BridgeState::Failed);
    }
}
