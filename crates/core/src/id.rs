//! Physical id codec.
//!
//! The id is the URL-safe, unpadded base64 of a compact JSON object whose keys
//! appear in a fixed order with empty values omitted. Ids already handed out to
//! callers must keep decoding, so the wire shape is frozen.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::spec::Locator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalId {
    #[serde(rename = "ClusterID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(rename = "KubeConfig", default, skip_serializing_if = "String::is_empty")]
    pub kube_config: String,
    #[serde(rename = "Region", default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "Namespace", default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl PhysicalId {
    /// Build an id from already-resolved coordinates.
    pub fn generate(locator: &Locator, name: &str, namespace: &str, region: &str) -> Result<Self, Error> {
        if name.is_empty() || namespace.is_empty() || region.is_empty() {
            return Err(Error::Validation("incorrect values for variable name, namespace, region".into()));
        }
        let mut id = PhysicalId {
            region: region.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        };
        match locator {
            Locator::Cluster(c) => id.cluster_id = c.clone(),
            Locator::Config(k) => id.kube_config = k.clone(),
        }
        Ok(id)
    }

    pub fn encode(&self) -> Result<String, Error> {
        let raw = serde_json::to_vec(self).map_err(|e| Error::Decode(format!("encode id: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    pub fn decode(s: &str) -> Result<Self, Error> {
        let raw = URL_SAFE_NO_PAD.decode(s.trim()).map_err(|e| Error::Decode(format!("id base64: {}", e)))?;
        serde_json::from_slice(&raw).map_err(|e| Error::Decode(format!("id json: {}", e)))
    }

    /// Locator recorded in the id; ids carry exactly one.
    pub fn locator(&self) -> Result<Locator, Error> {
        match (self.cluster_id.is_empty(), self.kube_config.is_empty()) {
            (false, true) => Ok(Locator::Cluster(self.cluster_id.clone())),
            (true, false) => Ok(Locator::Config(self.kube_config.clone())),
            (false, false) => Err(Error::Decode("id carries both ClusterID and KubeConfig".into())),
            (true, true) => Err(Error::Decode("id carries no cluster locator".into())),
        }
    }
}
