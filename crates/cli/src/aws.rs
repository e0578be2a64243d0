//! Cloud provider adapters backed by the `aws` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use charter_bridge::SubnetRoutes;
use charter_kubehub::{ClusterDescriptor, ClusterDirectory, ClusterNetwork, SecretSource, TokenSource};
use charter_persist::{ArchiveFetcher, HttpFetcher};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::runner::{Cmd, Runner};

#[derive(Clone)]
pub struct AwsCli {
    runner: Arc<dyn Runner>,
    region: Option<String>,
    pub(crate) work_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AssumedRole {
    credentials: Credentials,
}

/// Error text reported by the provider for a given exception name.
pub(crate) fn is_exception(err: &anyhow::Error, name: &str) -> bool {
    format!("{:#}", err).contains(name)
}

/// Role ARN behind an assumed-role session ARN; other ARNs pass through.
pub fn role_arn_from_caller(arn: &str) -> String {
    let parts: Vec<&str> = arn.split(':').collect();
    if parts.len() < 6 || parts[2] != "sts" || !parts[5].starts_with("assumed-role") {
        return arn.to_string();
    }
    let mut segs = arn.split('/');
    let head = segs.next().unwrap_or_default().replacen("assumed-role", "role", 1).replacen(":sts:", ":iam:", 1);
    match segs.next() {
        Some(role) => format!("{}/{}", head, role),
        None => arn.to_string(),
    }
}

impl AwsCli {
    pub fn new(runner: Arc<dyn Runner>, region: Option<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self { runner, region, work_dir: work_dir.into() }
    }

    fn base(&self) -> Cmd {
        let cmd = Cmd::new("aws").args(["--output", "json"]);
        match &self.region {
            Some(r) => cmd.args(["--region", r.as_str()]),
            None => cmd,
        }
    }

    async fn session(&self, role: Option<&str>) -> Result<Vec<(String, String)>> {
        let Some(role) = role.filter(|r| !r.is_empty()) else {
            return Ok(Vec::new());
        };
        let cmd = self.base().args(["sts", "assume-role", "--role-arn", role, "--role-session-name", "charter"]);
        let out = self.runner.run(&cmd).await.with_context(|| format!("assuming role {}", role))?;
        let assumed: AssumedRole = serde_json::from_slice(&out).context("decoding assume-role response")?;
        debug!(role = %role, "aws: role assumed");
        Ok(vec![
            ("AWS_ACCESS_KEY_ID".to_string(), assumed.credentials.access_key_id),
            ("AWS_SECRET_ACCESS_KEY".to_string(), assumed.credentials.secret_access_key),
            ("AWS_SESSION_TOKEN".to_string(), assumed.credentials.session_token),
        ])
    }

    pub(crate) async fn call<T: DeserializeOwned>(&self, args: &[&str], role: Option<&str>) -> Result<T> {
        let env = self.session(role).await?;
        let out = self.runner.run(&self.base().args(args.iter().copied()).envs(&env)).await?;
        serde_json::from_slice(&out).with_context(|| format!("decoding output of aws {}", args.iter().take(2).copied().collect::<Vec<_>>().join(" ")))
    }

    pub(crate) async fn call_raw(&self, args: &[&str], role: Option<&str>) -> Result<Vec<u8>> {
        let env = self.session(role).await?;
        self.runner.run(&self.base().args(args.iter().copied()).envs(&env)).await
    }

    async fn route_tables(&self, filters: &[String], role: Option<&str>) -> Result<Vec<Json>> {
        let mut args = vec!["ec2", "describe-route-tables", "--filters"];
        args.extend(filters.iter().map(String::as_str));
        let v: Json = self.call(&args, role).await?;
        Ok(v.get("RouteTables").and_then(Json::as_array).cloned().unwrap_or_default())
    }
}

fn strings(v: Option<&Json>) -> Vec<String> {
    v.and_then(Json::as_array).map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()).unwrap_or_default()
}

fn text(v: &Json, path: &[&str]) -> String {
    path.iter().try_fold(v, |cur, k| cur.get(*k)).and_then(Json::as_str).unwrap_or_default().to_string()
}

#[async_trait::async_trait]
impl ClusterDirectory for AwsCli {
    async fn describe(&self, cluster: &str, role: Option<&str>) -> Result<ClusterDescriptor> {
        let v: Json = self.call(&["eks", "describe-cluster", "--name", cluster], role).await?;
        let c = v.get("cluster").ok_or_else(|| anyhow!("describe-cluster returned no cluster"))?;
        let vpc = c.get("resourcesVpcConfig").cloned().unwrap_or(Json::Null);
        Ok(ClusterDescriptor {
            name: text(c, &["name"]),
            endpoint: text(c, &["endpoint"]),
            ca_data: text(c, &["certificateAuthority", "data"]),
            status: text(c, &["status"]),
            network: ClusterNetwork {
                vpc_id: vpc.get("vpcId").and_then(Json::as_str).map(str::to_string),
                endpoint_public_access: vpc.get("endpointPublicAccess").and_then(Json::as_bool).unwrap_or(false),
                public_access_cidrs: strings(vpc.get("publicAccessCidrs")),
                security_group_ids: strings(vpc.get("securityGroupIds")),
                subnet_ids: strings(vpc.get("subnetIds")),
            },
        })
    }
}

#[async_trait::async_trait]
impl TokenSource for AwsCli {
    async fn token(&self, cluster: &str, role: Option<&str>) -> Result<String> {
        let v: Json = self.call(&["eks", "get-token", "--cluster-name", cluster], role).await?;
        let token = text(&v, &["status", "token"]);
        if token.is_empty() {
            return Err(anyhow!("get-token returned no token for {}", cluster));
        }
        Ok(token)
    }
}

#[async_trait::async_trait]
impl SecretSource for AwsCli {
    async fn fetch(&self, secret_ref: &str, role: Option<&str>) -> Result<Vec<u8>> {
        let v: Json = self.call(&["secretsmanager", "get-secret-value", "--secret-id", secret_ref], role).await?;
        if let Some(s) = v.get("SecretString").and_then(Json::as_str) {
            return Ok(s.as_bytes().to_vec());
        }
        let b = text(&v, &["SecretBinary"]);
        STANDARD.decode(b.as_bytes()).context("decoding SecretBinary")
    }
}

fn has_nat(tables: &[Json]) -> bool {
    tables.first().and_then(|t| t.get("Routes")).and_then(Json::as_array).map(|routes| routes.iter().any(|r| r.get("NatGatewayId").is_some())).unwrap_or(false)
}

#[async_trait::async_trait]
impl SubnetRoutes for AwsCli {
    async fn has_nat_route(&self, subnet: &str, role: Option<&str>) -> Result<bool> {
        let tables = self.route_tables(&[format!("Name=association.subnet-id,Values={}", subnet)], role).await?;
        if !tables.is_empty() {
            return Ok(has_nat(&tables));
        }
        let v: Json = self.call(&["ec2", "describe-subnets", "--subnet-ids", subnet], role).await?;
        let vpc = v.get("Subnets").and_then(|s| s.get(0)).map(|s| text(s, &["VpcId"])).unwrap_or_default();
        if vpc.is_empty() {
            return Err(anyhow!("subnet {} not found", subnet));
        }
        let main = self.route_tables(&[format!("Name=vpc-id,Values={}", vpc), "Name=association.main,Values=true".to_string()], role).await?;
        Ok(has_nat(&main))
    }
}

/// Downloads `s3://` URLs through the provider CLI and everything else over HTTP.
pub struct SchemeFetcher {
    aws: AwsCli,
    http: HttpFetcher,
}

impl SchemeFetcher {
    pub fn new(aws: AwsCli, http: HttpFetcher) -> Self {
        Self { aws, http }
    }
}

#[async_trait::async_trait]
impl ArchiveFetcher for SchemeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        if !url.starts_with("s3://") {
            return self.http.fetch(url, dest).await;
        }
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
        }
        let d = dest.display().to_string();
        self.aws.call_raw(&["s3", "cp", url, d.as_str()], None).await?;
        info!(url = %url, dest = %d, "downloaded");
        Ok(())
    }
}
