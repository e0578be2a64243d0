//! Bridge function host backed by `aws lambda`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use charter_bridge::{BridgeState, FunctionHost, FunctionSpec, InvokeResult, Provisioned, Removed};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::aws::{is_exception, role_arn_from_caller, AwsCli};

const NOT_FOUND: &str = "ResourceNotFoundException";
const CONFLICT: &str = "ResourceConflictException";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionConfig {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_sha256: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InvokeOutput {
    #[serde(default)]
    function_error: Option<String>,
}

pub struct LambdaHost {
    aws: AwsCli,
}

fn vpc_arg(spec: &FunctionSpec) -> String {
    format!("SubnetIds={},SecurityGroupIds={}", spec.network.subnet_ids.join(","), spec.network.security_group_ids.join(","))
}

impl LambdaHost {
    pub fn new(aws: AwsCli) -> Self {
        Self { aws }
    }

    fn scratch(&self, file: String) -> PathBuf {
        self.aws.work_dir.join("bridge").join(file)
    }

    async fn write_scratch(&self, file: String, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.scratch(file);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.with_context(|| format!("creating {}", dir.display()))?;
        }
        tokio::fs::write(&path, bytes).await.with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    async fn config(&self, name: &str) -> Result<FunctionConfig> {
        self.aws.call(&["lambda", "get-function-configuration", "--function-name", name], None).await
    }
}

#[async_trait::async_trait]
impl FunctionHost for LambdaHost {
    async fn state(&self, name: &str) -> Result<BridgeState> {
        match self.config(name).await {
            Ok(c) => Ok(c.state.as_deref().map(BridgeState::parse).unwrap_or(BridgeState::Active)),
            Err(e) if is_exception(&e, NOT_FOUND) => Ok(BridgeState::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn code_fingerprint(&self, name: &str) -> Result<String> {
        Ok(self.config(name).await?.code_sha256)
    }

    async fn create(&self, spec: &FunctionSpec, package: &[u8]) -> Result<Provisioned> {
        let zip = self.write_scratch(format!("{}.zip", spec.name), package).await?;
        let zip_arg = format!("fileb://{}", zip.display());
        let (memory, timeout, vpc) = (spec.memory_mb.to_string(), spec.timeout_secs.to_string(), vpc_arg(spec));
        let args = [
            "lambda", "create-function", "--function-name", spec.name.as_str(), "--runtime", spec.runtime.as_str(), "--role", spec.role.as_str(),
            "--handler", spec.handler.as_str(), "--memory-size", memory.as_str(), "--timeout", timeout.as_str(), "--zip-file", zip_arg.as_str(),
            "--vpc-config", vpc.as_str(),
        ];
        match self.aws.call_raw(&args, None).await {
            Ok(_) => Ok(Provisioned::Created),
            Err(e) if is_exception(&e, CONFLICT) => Ok(Provisioned::AlreadyExists),
            Err(e) => Err(e),
        }
    }

    async fn update_code(&self, name: &str, package: &[u8]) -> Result<()> {
        let zip = self.write_scratch(format!("{}.zip", name), package).await?;
        let zip_arg = format!("fileb://{}", zip.display());
        self.aws.call_raw(&["lambda", "update-function-code", "--function-name", name, "--zip-file", zip_arg.as_str()], None).await?;
        Ok(())
    }

    async fn update_config(&self, spec: &FunctionSpec) -> Result<()> {
        let (memory, timeout, vpc) = (spec.memory_mb.to_string(), spec.timeout_secs.to_string(), vpc_arg(spec));
        let args = [
            "lambda", "update-function-configuration", "--function-name", spec.name.as_str(), "--runtime", spec.runtime.as_str(), "--role",
            spec.role.as_str(), "--handler", spec.handler.as_str(), "--memory-size", memory.as_str(), "--timeout", timeout.as_str(),
            "--vpc-config", vpc.as_str(),
        ];
        self.aws.call_raw(&args, None).await?;
        debug!(bridge = %spec.name, "lambda: configuration applied");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<Removed> {
        match self.aws.call_raw(&["lambda", "delete-function", "--function-name", name], None).await {
            Ok(_) => Ok(Removed::Deleted),
            Err(e) if is_exception(&e, NOT_FOUND) => Ok(Removed::Absent),
            Err(e) => Err(e),
        }
    }

    async fn invoke(&self, name: &str, payload: &[u8]) -> Result<InvokeResult> {
        let request = self.write_scratch(format!("{}-request.json", name), payload).await?;
        let response = self.scratch(format!("{}-response.json", name));
        let (req_arg, resp_arg) = (format!("fileb://{}", request.display()), response.display().to_string());
        let args = [
            "lambda", "invoke", "--function-name", name, "--cli-binary-format", "raw-in-base64-out", "--payload", req_arg.as_str(), resp_arg.as_str(),
        ];
        let out: InvokeOutput = self.aws.call(&args, None).await?;
        let body = tokio::fs::read(&response).await.with_context(|| format!("reading {}", response.display()))?;
        info!(bridge = %name, bytes = body.len(), failed = out.function_error.is_some(), "lambda: invoked");
        Ok(InvokeResult { function_error: out.function_error, payload: body })
    }

    async fn caller_role(&self) -> Result<String> {
        let v: Json = self.aws.call(&["sts", "get-caller-identity"], None).await?;
        let arn = v.get("Arn").and_then(Json::as_str).unwrap_or_default();
        Ok(role_arn_from_caller(arn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::MockRunner;
    use charter_core::NetworkIsolation;
    use std::sync::Arc;

    fn host(runner: Arc<MockRunner>, dir: &std::path::Path) -> LambdaHost {
        LambdaHost::new(AwsCli::new(runner, None, dir))
    }

    fn spec() -> FunctionSpec {
        FunctionSpec {
            name: "helm-provider-vpc-connector-abc".into(),
            role: "arn:aws:iam::1:role/r".into(),
            handler: "bootstrap".into(),
            runtime: "provided.al2023".into(),
            memory_mb: 256,
            timeout_secs: 900,
            network: NetworkIsolation { security_group_ids: vec!["sg-1".into()], subnet_ids: vec!["subnet-a".into(), "subnet-b".into()] },
        }
    }

    #[tokio::test]
    async fn missing_functions_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![
            Err("An error occurred (ResourceNotFoundException) when calling the GetFunctionConfiguration operation"),
            Ok(r#"{"State":"Pending","CodeSha256":"x"}"#),
        ]));
        let h = host(runner, dir.path());
        assert_eq!(h.state("b").await.unwrap(), BridgeState::NotFound);
        assert_eq!(h.state("b").await.unwrap(), BridgeState::Pending);
    }

    #[tokio::test]
    async fn create_treats_conflicts_as_existing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Ok("{}"), Err("An error occurred (ResourceConflictException): Function already exist")]));
        let h = host(runner.clone(), dir.path());
        assert_eq!(h.create(&spec(), b"zip").await.unwrap(), Provisioned::Created);
        assert_eq!(h.create(&spec(), b"zip").await.unwrap(), Provisioned::AlreadyExists);
        assert!(runner.lines()[0].contains("--vpc-config SubnetIds=subnet-a,subnet-b,SecurityGroupIds=sg-1"));
        assert!(dir.path().join("bridge/helm-provider-vpc-connector-abc.zip").exists());
    }

    #[tokio::test]
    async fn delete_of_absent_function_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Err("(ResourceNotFoundException) Function not found")]));
        assert_eq!(host(runner, dir.path()).delete("b").await.unwrap(), Removed::Absent);
    }

    #[tokio::test]
    async fn invoke_reads_the_response_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bridge")).unwrap();
        std::fs::write(dir.path().join("bridge/b-response.json"), r#"{"errorType":"Validation","errorMessage":"bad"}"#).unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(r#"{"StatusCode":200,"FunctionError":"Unhandled"}"#)]));
        let r = host(runner, dir.path()).invoke("b", b"{}").await.unwrap();
        assert_eq!(r.function_error.as_deref(), Some("Unhandled"));
        assert!(String::from_utf8_lossy(&r.payload).contains("errorMessage"));
    }

    #[tokio::test]
    async fn caller_role_strips_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(r#"{"Arn":"arn:aws:sts::1:assumed-role/Deployer/s"}"#)]));
        assert_eq!(host(runner, dir.path()).caller_role().await.unwrap(), "arn:aws:iam::1:role/Deployer");
    }
}
