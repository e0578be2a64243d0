//! Environment-driven settings.
//!
//! Every knob is a `CHARTER_*` variable with a default; `from_env` is the only place
//! the process environment is read for configuration.

use std::path::PathBuf;

pub const DEFAULT_TIMEOUT_MINUTES: u32 = 60;
pub const DEFAULT_CALLBACK_DELAY_SECS: u64 = 30;
pub const DEFAULT_STABLE_REPO_URL: &str = "https://charts.helm.sh/stable";
pub const DEFAULT_BRIDGE_PREFIX: &str = "helm-provider-vpc-connector-";

/// Bridge function shape and stabilisation bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub tries: u32,
    pub create_interval_secs: u64,
    pub pending_interval_secs: u64,
    pub prefix: String,
    pub package_path: PathBuf,
    pub handler: String,
    pub runtime: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    /// Execution role for created functions; falls back to the caller's role when unset.
    pub role_arn: Option<String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            tries: 3,
            create_interval_secs: 5,
            pending_interval_secs: 8,
            prefix: DEFAULT_BRIDGE_PREFIX.to_string(),
            package_path: PathBuf::from("charter-relay.zip"),
            handler: "bootstrap".to_string(),
            runtime: "provided.al2023".to_string(),
            memory_mb: 256,
            timeout_secs: 900,
            role_arn: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub region: Option<String>,
    pub default_timeout_minutes: u32,
    pub callback_delay_secs: u64,
    pub bridge: BridgeSettings,
    pub work_dir: PathBuf,
    pub repository_config: PathBuf,
    pub repository_cache: PathBuf,
    pub stable_repo_url: String,
    pub dependency_update: bool,
    pub diagnostics_cap: usize,
    pub max_manifest_bytes: usize,
    pub max_manifest_nodes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let work_dir = PathBuf::from("/tmp/charter");
        Self {
            region: None,
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            callback_delay_secs: DEFAULT_CALLBACK_DELAY_SECS,
            bridge: BridgeSettings::default(),
            repository_config: work_dir.join("config/repositories.yaml"),
            repository_cache: work_dir.join("cache/repository"),
            work_dir,
            stable_repo_url: DEFAULT_STABLE_REPO_URL.to_string(),
            dependency_update: false,
            diagnostics_cap: crate::diagnostics::DEFAULT_CAP,
            max_manifest_bytes: 4 * 1024 * 1024,
            max_manifest_nodes: 100_000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env` over an arbitrary lookup; unparsable values keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Settings::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        let flag = |k: &str| get(k).map(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let work_dir = get("CHARTER_WORK_DIR").map(PathBuf::from).unwrap_or(d.work_dir.clone());
        let b = BridgeSettings::default();
        Settings {
            region: get("CHARTER_REGION").or_else(|| get("AWS_REGION")).filter(|s| !s.is_empty()),
            default_timeout_minutes: num("CHARTER_TIMEOUT_MINUTES").map(|v| v as u32).unwrap_or(d.default_timeout_minutes),
            callback_delay_secs: num("CHARTER_CALLBACK_DELAY_SECS").unwrap_or(d.callback_delay_secs),
            bridge: BridgeSettings {
                tries: num("CHARTER_BRIDGE_TRIES").map(|v| v.max(1) as u32).unwrap_or(b.tries),
                create_interval_secs: num("CHARTER_BRIDGE_CREATE_INTERVAL_SECS").unwrap_or(b.create_interval_secs),
                pending_interval_secs: num("CHARTER_BRIDGE_PENDING_INTERVAL_SECS").unwrap_or(b.pending_interval_secs),
                prefix: get("CHARTER_BRIDGE_PREFIX").unwrap_or(b.prefix),
                package_path: get("CHARTER_BRIDGE_PACKAGE").map(PathBuf::from).unwrap_or(b.package_path),
                handler: get("CHARTER_BRIDGE_HANDLER").unwrap_or(b.handler),
                runtime: get("CHARTER_BRIDGE_RUNTIME").unwrap_or(b.runtime),
                memory_mb: num("CHARTER_BRIDGE_MEMORY_MB").map(|v| v as u32).unwrap_or(b.memory_mb),
                timeout_secs: num("CHARTER_BRIDGE_TIMEOUT_SECS").map(|v| v as u32).unwrap_or(b.timeout_secs),
                role_arn: get("CHARTER_BRIDGE_ROLE_ARN").filter(|s| !s.is_empty()),
            },
            repository_config: get("CHARTER_REPOSITORY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join("config/repositories.yaml")),
            repository_cache: get("CHARTER_REPOSITORY_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join("cache/repository")),
            work_dir,
            stable_repo_url: get("CHARTER_STABLE_REPO_URL").unwrap_or(d.stable_repo_url),
            dependency_update: flag("CHARTER_DEPENDENCY_UPDATE").unwrap_or(d.dependency_update),
            diagnostics_cap: num("CHARTER_DIAGNOSTICS_CAP").map(|v| v.max(1) as usize).unwrap_or(d.diagnostics_cap),
            max_manifest_bytes: num("CHARTER_MAX_MANIFEST_BYTES").map(|v| v as usize).unwrap_or(d.max_manifest_bytes),
            max_manifest_nodes: num("CHARTER_MAX_MANIFEST_NODES").map(|v| v as usize).unwrap_or(d.max_manifest_nodes),
        }
    }

    /// Worst-case time one step may spend waiting on bridge stabilisation.
    pub fn bridge_worst_case_secs(&self) -> u64 {
        u64::from(self.bridge.tries) * self.bridge.create_interval_secs.max(self.bridge.pending_interval_secs)
    }
}
