//! Resume token handed back to the caller between polls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Init,
    BridgeStabilize,
    ReleaseStabilize,
    UninstallRelease,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "Init",
            Stage::BridgeStabilize => "BridgeStabilize",
            Stage::ReleaseStabilize => "ReleaseStabilize",
            Stage::UninstallRelease => "UninstallRelease",
            Stage::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Init" => Ok(Stage::Init),
            "BridgeStabilize" => Ok(Stage::BridgeStabilize),
            "ReleaseStabilize" => Ok(Stage::ReleaseStabilize),
            "UninstallRelease" => Ok(Stage::UninstallRelease),
            "Complete" => Ok(Stage::Complete),
            other => Err(Error::Decode(format!("unknown stage {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResumeToken {
    pub stage: Stage,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl ResumeToken {
    pub fn start(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self { stage: Stage::Init, start_time: now, name: name.into(), diagnostics: Vec::new() }
    }

    /// Next token: same start time and name, new stage, current diagnostics.
    pub fn advance(&self, stage: Stage, diagnostics: &Diagnostics) -> Self {
        Self {
            stage,
            start_time: self.start_time,
            name: self.name.clone(),
            diagnostics: diagnostics.iter().map(str::to_string).collect(),
        }
    }

    pub fn diagnostics(&self, cap: usize) -> Diagnostics {
        Diagnostics::from_entries(self.diagnostics.iter().cloned(), cap)
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.start_time)
    }

    pub fn from_value(v: &serde_json::Value) -> Result<Self, Error> {
        serde_json::from_value(v.clone()).map_err(|e| Error::Decode(format!("resume token: {}", e)))
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn token_uses_rfc3339_and_pascal_keys() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tok = ResumeToken::start("nginx-1709294400", t0);
        let v = tok.to_value().unwrap();
        assert_eq!(v["Stage"], "Init");
        assert_eq!(v["StartTime"], "2024-03-01T12:00:00Z");
        assert!(v.get("Diagnostics").is_none());
        assert_eq!(ResumeToken::from_value(&v).unwrap(), tok);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let v = serde_json::json!({"Stage": "LambdaInit", "StartTime": "2024-03-01T12:00:00Z", "Name": "x"});
        assert!(matches!(ResumeToken::from_value(&v), Err(Error::Decode(_))));
        assert!("Nope".parse::<Stage>().is_err());
        assert_eq!("ReleaseStabilize".parse::<Stage>().unwrap(), Stage::ReleaseStabilize);
    }

    #[test]
    fn advance_keeps_start_time_and_carries_diagnostics() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let tok = ResumeToken::start("web", t0);
        let mut d = tok.diagnostics(5);
        d.push("release pending");
        let next = tok.advance(Stage::ReleaseStabilize, &d);
        assert_eq!(next.start_time, t0);
        assert_eq!(next.diagnostics, vec!["release pending".to_string()]);
        assert_eq!(next.elapsed(t0 + chrono::Duration::minutes(3)).num_minutes(), 3);
    }
}
