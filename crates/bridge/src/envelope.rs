//! Relay wire format and the relay-side dispatcher.

use anyhow::{anyhow, Context, Result};
use charter_core::{PhysicalId, ReleaseSpec};
use charter_ops::{ReleaseData, ReleaseInputs, ReleaseOps, ReleaseStatus, ReleaseSummary, ReleaseTarget};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    InstallRelease,
    UpdateRelease,
    CheckRelease,
    GetPending,
    GetResources,
    UninstallRelease,
    ListRelease,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(s) => STANDARD.decode(s.as_bytes()).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Request sent to a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub action: Action,
    #[serde(default, with = "b64", skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<Vec<u8>>,
    #[serde(default)]
    pub spec: ReleaseSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<ReleaseInputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_data: Option<ReleaseData>,
}

impl Envelope {
    pub fn new(action: Action, kubeconfig: &[u8], spec: &ReleaseSpec) -> Self {
        Self { action, kubeconfig: Some(kubeconfig.to_vec()), spec: spec.clone(), inputs: None, release_data: None }
    }

    pub fn with_inputs(mut self, inputs: &ReleaseInputs) -> Self {
        self.inputs = Some(inputs.clone());
        self
    }

    pub fn with_release(mut self, release: &ReleaseData) -> Self {
        self.release_data = Some(release.clone());
        self
    }

    /// Release addressed by the envelope: the spec's physical id, then its name, then the inputs.
    pub fn target(&self) -> Result<ReleaseTarget> {
        if let Some(id) = self.spec.id.as_deref().filter(|s| !s.is_empty()) {
            let id = PhysicalId::decode(id)?;
            return Ok(ReleaseTarget { name: id.name, namespace: id.namespace });
        }
        if let Some(name) = self.spec.name.as_deref().filter(|s| !s.is_empty()) {
            return Ok(ReleaseTarget { name: name.to_string(), namespace: self.spec.namespace_or_default() });
        }
        self.inputs.as_ref().map(|i| i.config.clone()).ok_or_else(|| anyhow!("{} envelope carries neither ID nor inputs", self.action))
    }

    fn inputs(&self) -> Result<&ReleaseInputs> {
        self.inputs.as_ref().ok_or_else(|| anyhow!("{} envelope is missing Inputs", self.action))
    }

    fn release(&self) -> Result<&ReleaseData> {
        self.release_data.as_ref().ok_or_else(|| anyhow!("{} envelope is missing ReleaseData", self.action))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EnvelopeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_data: Option<ReleaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_data: Option<Vec<ReleaseSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Map<String, Json>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Vec<String>>,
}

/// Execute one envelope against an executor.
pub async fn serve_envelope(envelope: &Envelope, ops: &dyn ReleaseOps) -> Result<EnvelopeResponse> {
    info!(action = %envelope.action, "relay: serving");
    let mut out = EnvelopeResponse::default();
    match envelope.action {
        Action::InstallRelease => ops.install(envelope.inputs()?).await?,
        Action::UpdateRelease => ops.upgrade(envelope.inputs()?).await?,
        Action::CheckRelease => out.status_data = Some(ops.status(&envelope.target()?).await?),
        Action::GetPending => {
            let r = ops.pending(envelope.release()?).await?;
            out.pending_resources = Some(r.pending);
            out.diagnostics = (!r.reasons.is_empty()).then_some(r.reasons);
        }
        Action::GetResources => out.resources = Some(ops.resources(envelope.release()?).await?),
        Action::UninstallRelease => ops.uninstall(&envelope.target()?).await?,
        Action::ListRelease => out.list_data = Some(ops.list(envelope.inputs()?).await?),
    }
    Ok(out)
}

/// `[errorType] errorMessage` from a function error document, or the raw payload.
pub(crate) fn remote_error_message(kind: &str, payload: &[u8]) -> String {
    match serde_json::from_slice::<Map<String, Json>>(payload) {
        Ok(doc) => {
            let field = |k: &str| doc.get(k).and_then(Json::as_str).unwrap_or_default().to_string();
            format!("[{}] {}", field("errorType"), field("errorMessage"))
        }
        Err(_) => format!("[{}] {}", kind, String::from_utf8_lossy(payload)),
    }
}

pub(crate) fn decode_response(payload: &[u8]) -> Result<EnvelopeResponse> {
    serde_json::from_slice(payload).context("decoding bridge response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_are_unwrapped() {
        let doc = br#"{"errorType":"SomeType","errorMessage":"SomeMessage"}"#;
        assert_eq!(remote_error_message("Unhandled", doc), "[SomeType] SomeMessage");
        assert_eq!(remote_error_message("Unhandled", b"boom"), "[Unhandled] boom");
    }

    #[test]
    fn kubeconfig_travels_as_base64() {
        let e = Envelope::new(Action::CheckRelease, b"apiVersion: v1", &ReleaseSpec::default());
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["Action"], "CheckRelease");
        assert_eq!(v["Kubeconfig"], "YXBpVmVyc2lvbjogdjE=");
        assert!(v.get("Inputs").is_none());
        let back: Envelope = serde_json::from_value(v).unwrap();
        assert_eq!(back.kubeconfig.as_deref(), Some(&b"apiVersion: v1"[..]));
    }

    #[test]
    fn target_prefers_the_physical_id() {
        let spec = ReleaseSpec {
            id: Some("eyJDbHVzdGVySUQiOiJla3MiLCJSZWdpb24iOiJldS13ZXN0LTEiLCJOYW1lIjoiVGVzdCIsIk5hbWVzcGFjZSI6IlRlc3QifQ".into()),
            ..Default::default()
        };
        let t = Envelope::new(Action::UninstallRelease, b"", &spec).target().unwrap();
        assert_eq!(t, ReleaseTarget { name: "Test".into(), namespace: "Test".into() });
        assert!(Envelope::new(Action::UninstallRelease, b"", &ReleaseSpec::default()).target().is_err());
    }
}
