//! Network isolation detection.

use anyhow::{Context, Result};
use charter_core::{Error, Locator, NetworkIsolation, ReleaseSpec};
use charter_kubehub::{ClusterDirectory, ClusterNetwork};
use tracing::{debug, info};

/// Route table lookups for subnets.
#[async_trait::async_trait]
pub trait SubnetRoutes: Send + Sync {
    /// True when the subnet's route table (explicit association, else the VPC main table)
    /// has a NAT gateway route.
    async fn has_nat_route(&self, subnet: &str, role: Option<&str>) -> Result<bool>;
}

/// Public endpoint whose first allowed CIDR is the whole internet. An empty list is private.
pub fn publicly_reachable(network: &ClusterNetwork) -> bool {
    network.endpoint_public_access && network.public_access_cidrs.first().map(|c| c == "0.0.0.0/0").unwrap_or(false)
}

/// Isolation settings for a spec, or `None` when the cluster is reachable directly.
pub async fn detect_isolation(spec: &ReleaseSpec, directory: &dyn ClusterDirectory, routes: &dyn SubnetRoutes) -> Result<Option<NetworkIsolation>> {
    if let Some(n) = spec.explicit_network() {
        return Ok(Some(n.clone()));
    }
    let cluster = match spec.locator()? {
        Locator::Cluster(c) => c,
        Locator::Config(_) => return Ok(None),
    };
    let role = spec.role_arn.as_deref();
    let d = directory.describe(&cluster, role).await.with_context(|| format!("describing cluster {}", cluster))?;
    if publicly_reachable(&d.network) {
        debug!(cluster = %cluster, "isolation: public endpoint");
        return Ok(None);
    }
    let mut subnets = Vec::new();
    for s in &d.network.subnet_ids {
        if routes.has_nat_route(s, role).await.with_context(|| format!("reading routes of {}", s))? {
            subnets.push(s.clone());
        }
    }
    if subnets.is_empty() {
        return Err(Error::Validation(format!(
            "no subnets with NAT Gateway found for the cluster {}, use VPCConfiguration to specify VPC settings",
            cluster
        ))
        .into());
    }
    info!(cluster = %cluster, subnets = %subnets.join(","), security_groups = %d.network.security_group_ids.join(","), "isolation: private cluster");
    Ok(Some(NetworkIsolation { security_group_ids: d.network.security_group_ids.clone(), subnet_ids: subnets }))
}
