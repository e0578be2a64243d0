//! Charter reconciliation driver.
//!
//! One call to [`Driver::step`] performs one bounded unit of work for one operation and
//! returns completion, a request to be called again with a resume token, or a terminal
//! failure. Nothing survives between calls except what the token carries.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use charter_bridge::{detect_isolation, BridgeManager, BridgeStatus, BridgedOps, SubnetRoutes};
use charter_core::{Component, Diagnostics, Error, Locator, PhysicalId, ReleaseSpec, ResumeToken, Settings, Stage};
use charter_kubehub::{ClusterDirectory, KubeconfigResolver};
use charter_ops::{chart, is_not_found, values, ReleaseData, ReleaseInputs, ReleaseOps, ReleaseState, ReleaseTarget};
use charter_persist::ArchiveFetcher;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Read,
    Update,
    Uninstall,
    List,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Read => "read",
            Self::Update => "update",
            Self::Uninstall => "uninstall",
            Self::List => "list",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete,
    /// Call again after `delay_secs` with `token`.
    InProgress { stage: Stage, token: ResumeToken, delay_secs: u64 },
    Failed { message: String },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Complete => "Complete",
            Self::InProgress { .. } => "InProgress",
            Self::Failed { .. } => "Failed",
        }
    }
}

/// Outcome plus the spec as it should be recorded by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub outcome: Outcome,
    pub spec: ReleaseSpec,
}

#[async_trait::async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Executor for the cluster the kubeconfig points at, reached from this process.
    async fn direct(&self, kubeconfig: &[u8], namespace: &str) -> Result<Arc<dyn ReleaseOps>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Everything the driver talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub kubeconfigs: KubeconfigResolver,
    pub directory: Arc<dyn ClusterDirectory>,
    pub routes: Arc<dyn SubnetRoutes>,
    pub bridges: BridgeManager,
    pub archives: Arc<dyn ArchiveFetcher>,
    pub executors: Arc<dyn ExecutorFactory>,
    pub clock: Arc<dyn Clock>,
}

struct Failure {
    component: Component,
    err: anyhow::Error,
}

impl Failure {
    fn into_outcome(self) -> Outcome {
        let e = Error::from_anyhow(self.component, &self.err);
        warn!(component = %self.component, error = %format!("{:#}", self.err), "driver: step failed");
        Outcome::Failed { message: e.to_string() }
    }
}

trait Tag<T> {
    fn tag(self, component: Component) -> Result<T, Failure>;
}

impl<T, E: Into<anyhow::Error>> Tag<T> for Result<T, E> {
    fn tag(self, component: Component) -> Result<T, Failure> {
        self.map_err(|e| Failure { component, err: e.into() })
    }
}

enum Executor {
    Direct(Arc<dyn ReleaseOps>),
    Bridged(BridgedOps),
}

impl Executor {
    fn ops(&self) -> &dyn ReleaseOps {
        match self {
            Executor::Direct(ops) => ops.as_ref(),
            Executor::Bridged(ops) => ops,
        }
    }

    fn bridge(&self) -> Option<&str> {
        match self {
            Executor::Direct(_) => None,
            Executor::Bridged(ops) => Some(ops.bridge()),
        }
    }
}

enum Selected {
    Ready(Executor),
    /// Bridge still converging; carries its name.
    BridgePending(String),
}

fn physical_id(spec: &ReleaseSpec) -> Result<PhysicalId, Failure> {
    let raw = spec.id.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| Error::Validation("ID is required".into())).tag(Component::Driver)?;
    PhysicalId::decode(raw).tag(Component::Driver)
}

fn target(id: &PhysicalId) -> ReleaseTarget {
    ReleaseTarget { name: id.name.clone(), namespace: id.namespace.clone() }
}

/// Spec pinned to the locator recorded in the id.
fn scoped(spec: &ReleaseSpec, locator: &Locator) -> ReleaseSpec {
    let mut s = spec.clone();
    match locator {
        Locator::Cluster(c) => {
            s.cluster_id = Some(c.clone());
            s.kube_config = None;
        }
        Locator::Config(k) => {
            s.kube_config = Some(k.clone());
            s.cluster_id = None;
        }
    }
    s
}

pub struct Driver {
    settings: Settings,
    c: Collaborators,
}

impl Driver {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        Self { settings, c: collaborators }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn install(&self, spec: ReleaseSpec, token: Option<&Json>) -> StepResult {
        self.step(Operation::Install, spec, token).await
    }

    pub async fn read(&self, spec: ReleaseSpec) -> StepResult {
        self.step(Operation::Read, spec, None).await
    }

    pub async fn update(&self, spec: ReleaseSpec, token: Option<&Json>) -> StepResult {
        self.step(Operation::Update, spec, token).await
    }

    pub async fn uninstall(&self, spec: ReleaseSpec, token: Option<&Json>) -> StepResult {
        self.step(Operation::Uninstall, spec, token).await
    }

    pub async fn list(&self, spec: ReleaseSpec) -> StepResult {
        self.step(Operation::List, spec, None).await
    }

    /// Run one step. Never fails: errors become `Outcome::Failed`.
    pub async fn step(&self, op: Operation, spec: ReleaseSpec, token: Option<&Json>) -> StepResult {
        let t0 = Instant::now();
        let span = info_span!("step", invocation = %Uuid::new_v4(), operation = %op, stage = field::Empty);
        let result = self.dispatch(op, spec, token).instrument(span).await;
        counter!("charter_steps_total", 1u64, "operation" => op.as_str(), "outcome" => result.outcome.kind());
        histogram!("charter_step_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "operation" => op.as_str());
        result
    }

    async fn dispatch(&self, op: Operation, mut spec: ReleaseSpec, token: Option<&Json>) -> StepResult {
        info!("driver: step start");
        let outcome = match (op, token) {
            (Operation::List, _) => Ok(Outcome::Failed { message: "not implemented: list".into() }),
            (Operation::Read, _) => self.read_release(&mut spec).await,
            (_, None) => self.begin(op, &mut spec),
            (_, Some(raw)) => self.resume(op, &mut spec, raw).await,
        }
        .unwrap_or_else(Failure::into_outcome);
        info!(outcome = outcome.kind(), "driver: step done");
        StepResult { outcome, spec }
    }

    fn progress(&self, token: &ResumeToken, stage: Stage, diags: &Diagnostics) -> Outcome {
        Outcome::InProgress { stage, token: token.advance(stage, diags), delay_secs: self.settings.callback_delay_secs }
    }

    /// First call: record the physical id before any side effect.
    fn begin(&self, op: Operation, spec: &mut ReleaseSpec) -> Result<Outcome, Failure> {
        let now = self.c.clock.now();
        if op != Operation::Uninstall && spec.id.as_deref().map_or(true, str::is_empty) {
            let locator = spec.locator().tag(Component::Driver)?;
            let chart = chart::resolve(spec.chart.as_deref(), spec.repository.as_deref(), spec.version.as_deref(), &self.settings.stable_repo_url)
                .tag(Component::Release)?;
            let name = match spec.name.as_deref().filter(|n| !n.is_empty()) {
                Some(n) => n.to_string(),
                None => format!("{}-{}", chart.name, now.timestamp()),
            };
            let region = self.settings.region.as_deref().unwrap_or("");
            let id = PhysicalId::generate(&locator, &name, &spec.namespace_or_default(), region).tag(Component::Driver)?;
            spec.id = Some(id.encode().tag(Component::Driver)?);
            spec.name = Some(name);
            info!(release = %id.name, namespace = %id.namespace, locator = %locator, "driver: id generated");
        }
        let id = physical_id(spec)?;
        Span::current().record("stage", Stage::Init.as_str());
        let token = ResumeToken::start(id.name, now);
        Ok(self.progress(&token, Stage::Init, &Diagnostics::with_cap(self.settings.diagnostics_cap)))
    }

    async fn resume(&self, op: Operation, spec: &mut ReleaseSpec, raw: &Json) -> Result<Outcome, Failure> {
        let token = ResumeToken::from_value(raw).tag(Component::Driver)?;
        Span::current().record("stage", token.stage.as_str());
        let mut diags = token.diagnostics(self.settings.diagnostics_cap);
        let budget = spec.timeout_minutes.unwrap_or(self.settings.default_timeout_minutes);
        if token.stage != Stage::Complete && token.elapsed(self.c.clock.now()) >= chrono::Duration::minutes(i64::from(budget)) {
            counter!("charter_step_timeouts_total", 1u64, "operation" => op.as_str());
            warn!(component = %Component::Driver, budget_minutes = budget, "driver: budget exhausted");
            return Ok(Outcome::Failed { message: Error::Timeout { diagnostics: diags.joined() }.to_string() });
        }
        match (op, token.stage) {
            (Operation::Install | Operation::Update, Stage::Init | Stage::BridgeStabilize) => self.apply(op, spec, &token, &mut diags).await,
            (Operation::Install | Operation::Update, Stage::ReleaseStabilize) => self.stabilize(spec, &token, &mut diags).await,
            (Operation::Uninstall, Stage::Init | Stage::BridgeStabilize | Stage::UninstallRelease | Stage::ReleaseStabilize) => {
                self.remove(spec, &token, &mut diags).await
            }
            (_, stage) => Ok(Outcome::Failed { message: format!("unhandled stage {}", stage) }),
        }
    }

    /// Pick the executor for this invocation, bringing up the bridge when the cluster is isolated.
    async fn executor(&self, spec: &ReleaseSpec, id: &PhysicalId) -> Result<Selected, Failure> {
        let locator = id.locator().tag(Component::Driver)?;
        let spec = scoped(spec, &locator);
        let role = spec.role_arn.as_deref();
        let isolation = detect_isolation(&spec, self.c.directory.as_ref(), self.c.routes.as_ref()).await.tag(Component::Bridge)?;
        let kubeconfig = self.c.kubeconfigs.resolve(&locator, role).await.tag(Component::Kubehub)?;
        let Some(network) = isolation else {
            let ops = self.c.executors.direct(&kubeconfig, &id.namespace).await.tag(Component::Kubehub)?;
            return Ok(Selected::Ready(Executor::Direct(ops)));
        };
        let name = self.c.bridges.name_for(&locator, &network);
        match self.c.bridges.ensure_active(&name, &network).await.tag(Component::Bridge)? {
            BridgeStatus::Active => Ok(Selected::Ready(Executor::Bridged(BridgedOps::new(self.c.bridges.clone(), name, kubeconfig, &spec)))),
            BridgeStatus::NotReady(state) => {
                info!(bridge = %name, state = %state, "driver: bridge not active yet");
                Ok(Selected::BridgePending(name))
            }
        }
    }

    async fn apply(&self, op: Operation, spec: &mut ReleaseSpec, token: &ResumeToken, diags: &mut Diagnostics) -> Result<Outcome, Failure> {
        let id = physical_id(spec)?;
        let chart = chart::resolve(spec.chart.as_deref(), spec.repository.as_deref(), spec.version.as_deref(), &self.settings.stable_repo_url)
            .tag(Component::Release)?;
        let exec = match self.executor(spec, &id).await? {
            Selected::Ready(e) => e,
            Selected::BridgePending(name) => {
                diags.push(format!("bridge {} is not active yet", name));
                return Ok(self.progress(token, Stage::BridgeStabilize, diags));
            }
        };
        let values = values::resolve_values(spec, self.c.archives.as_ref(), &self.settings.work_dir).await.tag(Component::Release)?;
        let inputs = ReleaseInputs { config: target(&id), chart, values };
        match op {
            Operation::Install => exec.ops().install(&inputs).await,
            _ => exec.ops().upgrade(&inputs).await,
        }
        .tag(Component::Release)?;
        spec.name = Some(id.name.clone());
        info!(release = %id.name, namespace = %id.namespace, chart = %inputs.chart.locator(), bridged = exec.bridge().is_some(), "driver: release submitted");
        Ok(self.progress(token, Stage::ReleaseStabilize, diags))
    }

    async fn stabilize(&self, spec: &mut ReleaseSpec, token: &ResumeToken, diags: &mut Diagnostics) -> Result<Outcome, Failure> {
        let id = physical_id(spec)?;
        let exec = match self.executor(spec, &id).await? {
            Selected::Ready(e) => e,
            Selected::BridgePending(name) => {
                diags.push(format!("bridge {} is not active yet", name));
                return Ok(self.progress(token, Stage::BridgeStabilize, diags));
            }
        };
        let status = exec.ops().status(&target(&id)).await.tag(Component::Release)?;
        match status.status {
            ReleaseState::Deployed => {
                let data = ReleaseData::from_status(&id.name, &status);
                let r = exec.ops().pending(&data).await.tag(Component::Readiness)?;
                if !r.pending {
                    info!(release = %id.name, "driver: release has no pending resources");
                    return Ok(Outcome::Complete);
                }
                info!(release = %id.name, pending = r.reasons.len(), "driver: release has pending resources");
                if r.reasons.is_empty() {
                    diags.push(format!("release {} has pending resources", id.name));
                }
                for reason in r.reasons {
                    diags.push(reason);
                }
                Ok(self.progress(token, Stage::ReleaseStabilize, diags))
            }
            ReleaseState::PendingInstall | ReleaseState::PendingUpgrade => {
                diags.push(format!("release {} is {}", id.name, status.status));
                Ok(self.progress(token, Stage::ReleaseStabilize, diags))
            }
            other => {
                warn!(component = %Component::Release, release = %id.name, status = %other, "driver: release failed");
                Ok(Outcome::Failed { message: "release failed".into() })
            }
        }
    }

    async fn remove(&self, spec: &mut ReleaseSpec, token: &ResumeToken, diags: &mut Diagnostics) -> Result<Outcome, Failure> {
        let id = physical_id(spec)?;
        let exec = match self.executor(spec, &id).await? {
            Selected::Ready(e) => e,
            Selected::BridgePending(name) => {
                diags.push(format!("bridge {} is not active yet", name));
                return Ok(self.progress(token, Stage::BridgeStabilize, diags));
            }
        };
        match exec.ops().uninstall(&target(&id)).await {
            Ok(()) => info!(release = %id.name, "driver: release uninstalled"),
            Err(e) if is_not_found(&e) => {
                warn!(component = %Component::Release, release = %id.name, error = %format!("{:#}", e), "driver: release not found; continuing");
                diags.push(format!("{:#}", e));
            }
            Err(e) => return Err(Failure { component: Component::Release, err: e }),
        }
        if let Some(name) = exec.bridge() {
            self.c.bridges.teardown(name).await.tag(Component::Bridge)?;
        }
        Ok(Outcome::Complete)
    }

    async fn read_release(&self, spec: &mut ReleaseSpec) -> Result<Outcome, Failure> {
        let id = physical_id(spec)?;
        let exec = match self.executor(spec, &id).await? {
            Selected::Ready(e) => e,
            Selected::BridgePending(name) => return Ok(Outcome::Failed { message: format!("bridge {} did not stabilize in time", name) }),
        };
        let s = exec.ops().status(&target(&id)).await.tag(Component::Release)?;
        spec.name = Some(id.name.clone());
        spec.namespace = Some(id.namespace.clone());
        spec.chart = Some(s.chart_name.clone());
        spec.version = Some(s.chart_version.clone());
        let data = ReleaseData { name: id.name.clone(), chart: s.chart.clone(), namespace: s.namespace.clone(), manifest: s.manifest.clone() };
        spec.resources = Some(exec.ops().resources(&data).await.tag(Component::Readiness)?);
        Ok(Outcome::Complete)
    }
}
