use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use charter_api::{Clock, Collaborators, Driver, ExecutorFactory, Outcome, StepResult};
use charter_bridge::{serve_envelope, BridgeManager, BridgeState, Envelope, FunctionHost, FunctionSpec, InvokeResult, Provisioned, Removed, SubnetRoutes};
use charter_core::settings::BridgeSettings;
use charter_core::{PhysicalId, ReleaseSpec, ResumeToken, Settings, Stage};
use charter_kubehub::{ClusterDescriptor, ClusterDirectory, ClusterNetwork, KubeconfigResolver, SecretSource, TokenSource};
use charter_ops::{ReleaseData, ReleaseInputs, ReleaseOps, ReleaseState, ReleaseStatus, ReleaseSummary, ReleaseTarget};
use charter_persist::ArchiveFetcher;
use charter_readiness::Readiness;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Map, Value as Json};

struct Directory {
    public: bool,
}

#[async_trait::async_trait]
impl ClusterDirectory for Directory {
    async fn describe(&self, cluster: &str, _role: Option<&str>) -> Result<ClusterDescriptor> {
        Ok(ClusterDescriptor {
            name: cluster.into(),
            endpoint: "https://eks.example.com".into(),
            ca_data: "Y2E=".into(),
            status: "ACTIVE".into(),
            network: ClusterNetwork {
                vpc_id: Some("vpc-01".into()),
                endpoint_public_access: self.public,
                public_access_cidrs: vec!["0.0.0.0/0".into()],
                security_group_ids: vec!["sg-01".into()],
                subnet_ids: vec!["subnet-01".into(), "subnet-02".into()],
            },
        })
    }
}

struct Tokens;

#[async_trait::async_trait]
impl TokenSource for Tokens {
    async fn token(&self, _cluster: &str, _role: Option<&str>) -> Result<String> {
        Ok("k8s-aws-v1.token".into())
    }
}

struct Secrets;

#[async_trait::async_trait]
impl SecretSource for Secrets {
    async fn fetch(&self, _secret_ref: &str, _role: Option<&str>) -> Result<Vec<u8>> {
        Ok(b"apiVersion: v1\nkind: Config\n".to_vec())
    }
}

struct Routes(HashSet<&'static str>);

#[async_trait::async_trait]
impl SubnetRoutes for Routes {
    async fn has_nat_route(&self, subnet: &str, _role: Option<&str>) -> Result<bool> {
        Ok(self.0.contains(subnet))
    }
}

struct NoArchives;

#[async_trait::async_trait]
impl ArchiveFetcher for NoArchives {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<()> {
        Err(anyhow!("unexpected download of {}", url))
    }
}

/// Release executor with scripted answers; the last scripted status repeats.
#[derive(Default)]
struct FakeOps {
    calls: Mutex<Vec<String>>,
    statuses: Mutex<VecDeque<ReleaseState>>,
    pending: Mutex<VecDeque<bool>>,
    uninstall_error: Option<String>,
}

impl FakeOps {
    fn with_statuses(statuses: &[ReleaseState], pending: &[bool]) -> Self {
        Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            pending: Mutex::new(pending.iter().copied().collect()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ReleaseOps for FakeOps {
    async fn install(&self, inputs: &ReleaseInputs) -> Result<()> {
        self.calls.lock().unwrap().push(format!("install {}/{} {}", inputs.config.namespace, inputs.config.name, inputs.chart.locator()));
        Ok(())
    }
    async fn upgrade(&self, inputs: &ReleaseInputs) -> Result<()> {
        self.calls.lock().unwrap().push(format!("upgrade {}/{}", inputs.config.namespace, inputs.config.name));
        Ok(())
    }
    async fn uninstall(&self, target: &ReleaseTarget) -> Result<()> {
        self.calls.lock().unwrap().push(format!("uninstall {}/{}", target.namespace, target.name));
        match &self.uninstall_error {
            Some(e) => Err(anyhow!(e.clone())),
            None => Ok(()),
        }
    }
    async fn status(&self, target: &ReleaseTarget) -> Result<ReleaseStatus> {
        let mut q = self.statuses.lock().unwrap();
        let s = if q.len() > 1 { q.pop_front() } else { q.front().copied() };
        Ok(ReleaseStatus {
            status: s.unwrap_or(ReleaseState::Unknown),
            namespace: target.namespace.clone(),
            chart_name: "nginx".into(),
            chart_version: "1.2.3".into(),
            chart: "nginx-1.2.3".into(),
            manifest: "kind: Service\n".into(),
        })
    }
    async fn list(&self, _inputs: &ReleaseInputs) -> Result<Vec<ReleaseSummary>> {
        Ok(vec![])
    }
    async fn pending(&self, release: &ReleaseData) -> Result<Readiness> {
        let pending = self.pending.lock().unwrap().pop_front().unwrap_or(false);
        let reasons = if pending { vec![format!("Service/{}: load balancer ingress not assigned", release.name)] } else { vec![] };
        Ok(Readiness { pending, reasons })
    }
    async fn resources(&self, _release: &ReleaseData) -> Result<Map<String, Json>> {
        let v = json!({"Service": {"web": {"Spec.Type": "ClusterIP", "ObjectMeta.Namespace": "apps"}}});
        Ok(v.as_object().cloned().unwrap_or_default())
    }
}

struct Factory(Arc<FakeOps>);

#[async_trait::async_trait]
impl ExecutorFactory for Factory {
    async fn direct(&self, kubeconfig: &[u8], _namespace: &str) -> Result<Arc<dyn ReleaseOps>> {
        assert!(!kubeconfig.is_empty());
        Ok(self.0.clone())
    }
}

/// Function host whose relay runs envelopes against the same fake executor.
struct Host {
    states: Mutex<VecDeque<BridgeState>>,
    relay: Arc<FakeOps>,
    deletes: Mutex<usize>,
    invocations: Mutex<usize>,
}

#[async_trait::async_trait]
impl FunctionHost for Host {
    async fn state(&self, _name: &str) -> Result<BridgeState> {
        let mut q = self.states.lock().unwrap();
        let s = if q.len() > 1 { q.pop_front() } else { q.front().copied() };
        Ok(s.unwrap_or(BridgeState::NotFound))
    }
    async fn code_fingerprint(&self, _name: &str) -> Result<String> {
        Ok("stale".into())
    }
    async fn create(&self, _spec: &FunctionSpec, _package: &[u8]) -> Result<Provisioned> {
        Ok(Provisioned::Created)
    }
    async fn update_code(&self, _name: &str, _package: &[u8]) -> Result<()> {
        Ok(())
    }
    async fn update_config(&self, _spec: &FunctionSpec) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _name: &str) -> Result<Removed> {
        *self.deletes.lock().unwrap() += 1;
        Ok(Removed::Deleted)
    }
    async fn invoke(&self, _name: &str, payload: &[u8]) -> Result<InvokeResult> {
        *self.invocations.lock().unwrap() += 1;
        let envelope: Envelope = serde_json::from_slice(payload)?;
        assert!(envelope.kubeconfig.as_ref().map(|k| !k.is_empty()).unwrap_or(false));
        match serve_envelope(&envelope, self.relay.as_ref()).await {
            Ok(r) => Ok(InvokeResult { function_error: None, payload: serde_json::to_vec(&r)? }),
            Err(e) => {
                let doc = json!({"errorType": "errorString", "errorMessage": format!("{:#}", e)});
                Ok(InvokeResult { function_error: Some("Unhandled".into()), payload: serde_json::to_vec(&doc)? })
            }
        }
    }
    async fn caller_role(&self) -> Result<String> {
        Ok("arn:aws:iam::123456789012:role/caller".into())
    }
}

struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    fn advance(&self, d: Duration) {
        let mut t = self.0.lock().unwrap();
        *t = *t + d;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

struct Rig {
    driver: Driver,
    ops: Arc<FakeOps>,
    host: Arc<Host>,
    clock: Arc<FixedClock>,
    _work: tempfile::TempDir,
}

fn rig(public: bool, ops: FakeOps, bridge_states: &[BridgeState]) -> Rig {
    let work = tempfile::tempdir().unwrap();
    let ops = Arc::new(ops);
    let directory: Arc<dyn ClusterDirectory> = Arc::new(Directory { public });
    let host = Arc::new(Host {
        states: Mutex::new(bridge_states.iter().copied().collect()),
        relay: ops.clone(),
        deletes: Mutex::new(0),
        invocations: Mutex::new(0),
    });
    let bridge = BridgeSettings { tries: 2, create_interval_secs: 0, pending_interval_secs: 0, ..Default::default() };
    let clock = Arc::new(FixedClock(Mutex::new(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())));
    let settings = Settings { region: Some("eu-west-1".into()), work_dir: work.path().to_path_buf(), bridge: bridge.clone(), ..Default::default() };
    let collaborators = Collaborators {
        kubeconfigs: KubeconfigResolver { directory: directory.clone(), tokens: Arc::new(Tokens), secrets: Arc::new(Secrets) },
        directory,
        routes: Arc::new(Routes(["subnet-02"].into_iter().collect())),
        bridges: BridgeManager::with_package(host.clone(), bridge, b"relay".to_vec()),
        archives: Arc::new(NoArchives),
        executors: Arc::new(Factory(ops.clone())),
        clock: clock.clone(),
    };
    Rig { driver: Driver::new(settings, collaborators), ops, host, clock, _work: work }
}

fn spec() -> ReleaseSpec {
    ReleaseSpec {
        cluster_id: Some("eks".into()),
        chart: Some("stable/nginx".into()),
        name: Some("web".into()),
        namespace: Some("apps".into()),
        ..Default::default()
    }
}

fn token_of(r: &StepResult) -> Json {
    match &r.outcome {
        Outcome::InProgress { token, .. } => token.to_value().unwrap(),
        other => panic!("expected InProgress, got {:?}", other),
    }
}

fn stage_of(r: &StepResult) -> Stage {
    match &r.outcome {
        Outcome::InProgress { stage, .. } => *stage,
        other => panic!("expected InProgress, got {:?}", other),
    }
}

#[tokio::test]
async fn install_against_reachable_cluster_completes_in_three_calls() {
    let r = rig(true, FakeOps::with_statuses(&[ReleaseState::Deployed], &[false]), &[]);
    let first = r.driver.install(spec(), None).await;
    assert_eq!(stage_of(&first), Stage::Init);
    let id = PhysicalId::decode(first.spec.id.as_deref().unwrap()).unwrap();
    assert_eq!((id.name.as_str(), id.namespace.as_str(), id.region.as_str()), ("web", "apps", "eu-west-1"));
    assert!(r.ops.calls().is_empty());

    let second = r.driver.install(first.spec.clone(), Some(&token_of(&first))).await;
    assert_eq!(stage_of(&second), Stage::ReleaseStabilize);
    assert_eq!(r.ops.calls(), vec!["install apps/web stable/nginx".to_string()]);

    let third = r.driver.install(second.spec.clone(), Some(&token_of(&second))).await;
    assert_eq!(third.outcome, Outcome::Complete);
    assert_eq!(*r.host.invocations.lock().unwrap(), 0);
    assert!(third.spec.network.is_none());
}

#[tokio::test]
async fn missing_name_is_generated_from_chart_and_clock() {
    let r = rig(true, FakeOps::default(), &[]);
    let first = r.driver.install(ReleaseSpec { name: None, ..spec() }, None).await;
    let name = first.spec.name.clone().unwrap();
    assert_eq!(name, format!("nginx-{}", Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap().timestamp()));
}

#[tokio::test]
async fn pending_resources_keep_the_step_in_stabilize_and_feed_diagnostics() {
    let r = rig(true, FakeOps::with_statuses(&[ReleaseState::PendingInstall, ReleaseState::Deployed], &[true, false]), &[]);
    let first = r.driver.install(spec(), None).await;
    let second = r.driver.install(first.spec.clone(), Some(&token_of(&first))).await;
    let third = r.driver.install(second.spec.clone(), Some(&token_of(&second))).await;
    assert_eq!(stage_of(&third), Stage::ReleaseStabilize);
    let fourth = r.driver.install(third.spec.clone(), Some(&token_of(&third))).await;
    assert_eq!(stage_of(&fourth), Stage::ReleaseStabilize);
    let t = ResumeToken::from_value(&token_of(&fourth)).unwrap();
    assert_eq!(t.diagnostics, vec!["release web is pending-install".to_string(), "Service/web: load balancer ingress not assigned".to_string()]);
    let fifth = r.driver.install(fourth.spec.clone(), Some(&token_of(&fourth))).await;
    assert_eq!(fifth.outcome, Outcome::Complete);
}

#[tokio::test]
async fn failed_release_is_terminal() {
    let r = rig(true, FakeOps::with_statuses(&[ReleaseState::Failed], &[]), &[]);
    let first = r.driver.update(spec(), None).await;
    let second = r.driver.update(first.spec.clone(), Some(&token_of(&first))).await;
    assert_eq!(r.ops.calls(), vec!["upgrade apps/web".to_string()]);
    let third = r.driver.update(second.spec.clone(), Some(&token_of(&second))).await;
    assert_eq!(third.outcome, Outcome::Failed { message: "release failed".into() });
}

#[tokio::test]
async fn isolated_cluster_goes_through_the_bridge() {
    let states = [BridgeState::NotFound, BridgeState::Pending, BridgeState::Pending, BridgeState::Active];
    let r = rig(false, FakeOps::with_statuses(&[ReleaseState::Deployed], &[false]), &states);
    let first = r.driver.install(spec(), None).await;
    assert_eq!(stage_of(&first), Stage::Init);

    let second = r.driver.install(first.spec.clone(), Some(&token_of(&first))).await;
    assert_eq!(stage_of(&second), Stage::BridgeStabilize);
    assert!(r.ops.calls().is_empty());

    let third = r.driver.install(second.spec.clone(), Some(&token_of(&second))).await;
    assert_eq!(stage_of(&third), Stage::ReleaseStabilize);
    assert_eq!(r.ops.calls(), vec!["install apps/web stable/nginx".to_string()]);

    let fourth = r.driver.install(third.spec.clone(), Some(&token_of(&third))).await;
    assert_eq!(fourth.outcome, Outcome::Complete);
    assert!(*r.host.invocations.lock().unwrap() >= 3);
    assert!(fourth.spec.network.is_none(), "derived isolation must not leak into the spec");
}

#[tokio::test]
async fn uninstall_after_out_of_band_removal_tears_down_and_completes() {
    let ops = FakeOps { uninstall_error: Some("uninstall: release: not found".into()), ..Default::default() };
    let r = rig(false, ops, &[BridgeState::Active]);
    let installed = r.driver.install(spec(), None).await;
    let first = r.driver.uninstall(installed.spec.clone(), None).await;
    assert_eq!(stage_of(&first), Stage::Init);
    let second = r.driver.uninstall(first.spec.clone(), Some(&token_of(&first))).await;
    assert_eq!(second.outcome, Outcome::Complete);
    assert_eq!(r.ops.calls(), vec!["uninstall apps/web".to_string()]);
    assert_eq!(*r.host.deletes.lock().unwrap(), 1);
}

#[tokio::test]
async fn uninstall_errors_other_than_not_found_fail() {
    let ops = FakeOps { uninstall_error: Some("connection refused".into()), ..Default::default() };
    let r = rig(true, ops, &[]);
    let installed = r.driver.install(spec(), None).await;
    let first = r.driver.uninstall(installed.spec.clone(), None).await;
    let second = r.driver.uninstall(first.spec.clone(), Some(&token_of(&first))).await;
    match second.outcome {
        Outcome::Failed { message } => assert!(message.contains("connection refused"), "message={}", message),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn uninstall_requires_an_id() {
    let r = rig(true, FakeOps::default(), &[]);
    let out = r.driver.uninstall(spec(), None).await;
    assert!(matches!(out.outcome, Outcome::Failed { ref message } if message.contains("ID is required")));
}

#[tokio::test]
async fn exhausted_budget_fails_with_diagnostics() {
    let r = rig(true, FakeOps::with_statuses(&[ReleaseState::PendingInstall], &[]), &[]);
    let first = r.driver.install(ReleaseSpec { timeout_minutes: Some(5), ..spec() }, None).await;
    let second = r.driver.install(first.spec.clone(), Some(&token_of(&first))).await;
    let third = r.driver.install(second.spec.clone(), Some(&token_of(&second))).await;
    assert_eq!(stage_of(&third), Stage::ReleaseStabilize);
    r.clock.advance(Duration::minutes(6));
    let fourth = r.driver.install(third.spec.clone(), Some(&token_of(&third))).await;
    match fourth.outcome {
        Outcome::Failed { message } => {
            assert!(message.starts_with("resource creation timed out"), "message={}", message);
            assert!(message.contains("release web is pending-install"));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn unmapped_stages_fail() {
    let r = rig(true, FakeOps::default(), &[]);
    let first = r.driver.install(spec(), None).await;
    let done = ResumeToken::start("web", r.clock.now()).advance(Stage::Complete, &Default::default());
    let out = r.driver.install(first.spec.clone(), Some(&done.to_value().unwrap())).await;
    assert_eq!(out.outcome, Outcome::Failed { message: "unhandled stage Complete".into() });
    let bad = json!({"Stage": "LambdaInit", "StartTime": "2024-05-01T10:00:00Z", "Name": "web"});
    let out = r.driver.install(first.spec.clone(), Some(&bad)).await;
    assert!(matches!(out.outcome, Outcome::Failed { .. }));
}

#[tokio::test]
async fn read_fills_the_spec_from_the_live_release() {
    let r = rig(true, FakeOps::with_statuses(&[ReleaseState::Deployed], &[]), &[]);
    let installed = r.driver.install(spec(), None).await;
    let bare = ReleaseSpec { id: installed.spec.id.clone(), ..Default::default() };
    let out = r.driver.read(bare).await;
    assert_eq!(out.outcome, Outcome::Complete);
    assert_eq!(out.spec.name.as_deref(), Some("web"));
    assert_eq!(out.spec.namespace.as_deref(), Some("apps"));
    assert_eq!(out.spec.chart.as_deref(), Some("nginx"));
    assert_eq!(out.spec.version.as_deref(), Some("1.2.3"));
    assert_eq!(out.spec.resources.as_ref().unwrap()["Service"]["web"]["Spec.Type"], "ClusterIP");
    assert!(out.spec.network.is_none());
}

#[tokio::test]
async fn read_fails_when_the_bridge_stays_pending() {
    let r = rig(false, FakeOps::default(), &[BridgeState::Pending]);
    let installed = r.driver.install(spec(), None).await;
    let out = r.driver.read(installed.spec.clone()).await;
    match out.outcome {
        Outcome::Failed { message } => assert!(message.contains("did not stabilize in time"), "message={}", message),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn list_is_not_implemented() {
    let r = rig(true, FakeOps::default(), &[]);
    let out = r.driver.list(spec()).await;
    assert_eq!(out.outcome, Outcome::Failed { message: "not implemented: list".into() });
}
