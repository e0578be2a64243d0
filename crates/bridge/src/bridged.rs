use anyhow::{anyhow, Result};
use charter_core::ReleaseSpec;
use charter_ops::{ReleaseData, ReleaseInputs, ReleaseOps, ReleaseStatus, ReleaseSummary, ReleaseTarget};
use charter_readiness::Readiness;
use serde_json::{Map, Value as Json};

use crate::envelope::{Action, Envelope};
use crate::BridgeManager;

/// Executor that relays every operation through a bridge.
#[derive(Clone)]
pub struct BridgedOps {
    manager: BridgeManager,
    name: String,
    kubeconfig: Vec<u8>,
    spec: ReleaseSpec,
}

impl BridgedOps {
    pub fn new(manager: BridgeManager, name: impl Into<String>, kubeconfig: Vec<u8>, spec: &ReleaseSpec) -> Self {
        Self { manager, name: name.into(), kubeconfig, spec: spec.clone() }
    }

    pub fn bridge(&self) -> &str {
        &self.name
    }

    fn envelope(&self, action: Action) -> Envelope {
        Envelope::new(action, &self.kubeconfig, &self.spec)
    }

    fn targeted(&self, action: Action, target: &ReleaseTarget) -> Envelope {
        let mut e = self.envelope(action);
        e.spec.id = None;
        e.spec.name = Some(target.name.clone());
        e.spec.namespace = Some(target.namespace.clone());
        e
    }
}

#[async_trait::async_trait]
impl ReleaseOps for BridgedOps {
    async fn install(&self, inputs: &ReleaseInputs) -> Result<()> {
        self.manager.invoke(&self.name, &self.envelope(Action::InstallRelease).with_inputs(inputs)).await?;
        Ok(())
    }

    async fn upgrade(&self, inputs: &ReleaseInputs) -> Result<()> {
        self.manager.invoke(&self.name, &self.envelope(Action::UpdateRelease).with_inputs(inputs)).await?;
        Ok(())
    }

    async fn uninstall(&self, target: &ReleaseTarget) -> Result<()> {
        self.manager.invoke(&self.name, &self.targeted(Action::UninstallRelease, target)).await?;
        Ok(())
    }

    async fn status(&self, target: &ReleaseTarget) -> Result<ReleaseStatus> {
        let r = self.manager.invoke(&self.name, &self.targeted(Action::CheckRelease, target)).await?;
        r.status_data.ok_or_else(|| anyhow!("bridge {} returned no status data", self.name))
    }

    async fn list(&self, inputs: &ReleaseInputs) -> Result<Vec<ReleaseSummary>> {
        let r = self.manager.invoke(&self.name, &self.envelope(Action::ListRelease).with_inputs(inputs)).await?;
        Ok(r.list_data.unwrap_or_default())
    }

    async fn pending(&self, release: &ReleaseData) -> Result<Readiness> {
        let r = self.manager.invoke(&self.name, &self.envelope(Action::GetPending).with_release(release)).await?;
        let pending = r.pending_resources.ok_or_else(|| anyhow!("bridge {} returned no pending flag", self.name))?;
        Ok(Readiness { pending, reasons: r.diagnostics.unwrap_or_default() })
    }

    async fn resources(&self, release: &ReleaseData) -> Result<Map<String, Json>> {
        let r = self.manager.invoke(&self.name, &self.envelope(Action::GetResources).with_release(release)).await?;
        Ok(r.resources.unwrap_or_default())
    }
}
