//! Error taxonomy surfaced at the driver boundary.

use serde::{Deserialize, Serialize};

/// Component that raised an error; used as the `component` field in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Driver,
    Bridge,
    Release,
    Readiness,
    Kubehub,
    Persist,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Driver => "driver",
            Component::Bridge => "bridge",
            Component::Release => "release",
            Component::Readiness => "readiness",
            Component::Kubehub => "kubehub",
            Component::Persist => "persist",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Bad input; never retried.
    #[error("validation: {0}")]
    Validation(String),
    /// Wrapped collaborator failure; the step failed but the resource can be retried.
    #[error("{component}: {message}")]
    Remote { component: Component, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    /// Synthesized by the driver once the budget is spent.
    #[error("resource creation timed out, last known errors: {diagnostics}")]
    Timeout { diagnostics: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl Error {
    pub fn remote(component: Component, err: impl std::fmt::Display) -> Self {
        Error::Remote { component, message: err.to_string() }
    }

    /// Classify an `anyhow` chain coming out of a collaborator.
    ///
    /// Typed errors are recovered by downcast; anything else becomes `Remote`.
    pub fn from_anyhow(component: Component, err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>() {
            Some(e) => e.clone(),
            None => Error::Remote { component, message: format!("{:#}", err) },
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
