//! Charter core types shared by every crate in the workspace.
//!
//! Nothing in here talks to the network: the desired spec, the physical id codec,
//! the resume token and its stages, the diagnostics trail, the error taxonomy and
//! the environment-driven settings.

#![forbid(unsafe_code)]

pub mod diagnostics;
pub mod error;
pub mod id;
pub mod settings;
pub mod spec;
pub mod token;

pub use diagnostics::Diagnostics;
pub use error::{Component, Error};
pub use id::PhysicalId;
pub use settings::Settings;
pub use spec::{Locator, NetworkIsolation, ReleaseSpec};
pub use token::{ResumeToken, Stage};

pub mod prelude {
    pub use super::{
        Component, Diagnostics, Error, Locator, NetworkIsolation, PhysicalId, ReleaseSpec, ResumeToken, Settings,
        Stage,
    };
}

/// Namespace used when the spec leaves it out.
pub const DEFAULT_NAMESPACE: &str = "default";
