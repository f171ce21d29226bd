use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::caps::CapsConfig;
use crate::error::ConfigError;
use crate::scopes::UnknownScopePolicy;

/// Approval defaults applied by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Lifetime of approval tokens and the artifacts they produce.
    pub expiry_seconds: i64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: 900,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Delay before a financial write reaches the connector. Revocation during
    /// the pause aborts the attempt.
    pub forced_pause_ms: u64,
    /// Action domains treated as financial.
    pub financial_domains: Vec<String>,
    /// Upper bound for each connector call when the request sets none.
    pub default_deadline_ms: u64,
    pub approval: ApprovalConfig,
    pub caps: CapsConfig,
    pub unknown_scope_policy: UnknownScopePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            forced_pause_ms: 5_000,
            financial_domains: vec!["payment".to_string()],
            default_deadline_ms: 30_000,
            approval: ApprovalConfig::default(),
            caps: CapsConfig::default(),
            unknown_scope_policy: UnknownScopePolicy::Reject,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_deadline_ms must be greater than zero".to_string(),
            ));
        }
        if self.approval.expiry_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "approval.expiry_seconds must be greater than zero".to_string(),
            ));
        }
        let pause_seconds = self.forced_pause_ms.div_ceil(1_000);
        if pause_seconds >= self.approval.expiry_seconds as u64 {
            return Err(ConfigError::Invalid(format!(
                "approval expiry ({}s) must outlast the forced pause ({}ms)",
                self.approval.expiry_seconds, self.forced_pause_ms
            )));
        }
        if self.financial_domains.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "financial_domains may not contain empty names".to_string(),
            ));
        }
        for (key, limits) in &self.caps.overrides {
            let known_kind = ["circle:", "intersection:", "payee:"]
                .iter()
                .any(|prefix| key.starts_with(prefix));
            if !known_kind {
                return Err(ConfigError::Invalid(format!(
                    "caps override '{key}' must start with circle:, intersection: or payee:"
                )));
            }
            if limits.max_attempts_per_day == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "caps override '{key}' allows zero attempts"
                )));
            }
        }
        Ok(())
    }

    pub fn forced_pause(&self) -> Duration {
        Duration::from_millis(self.forced_pause_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn is_financial(&self, domain: &str) -> bool {
        self.financial_domains.iter().any(|d| d == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.is_financial("payment"));
        assert!(!config.is_financial("calendar"));
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "forced_pause_ms": 250,
                "caps": {
                    "payee": { "daily_spend_minor": { "GBP": 10000 } },
                    "overrides": { "circle:alice": { "max_attempts_per_day": 3 } }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.forced_pause(), Duration::from_millis(250));
        assert_eq!(config.default_deadline_ms, 30_000);
        assert_eq!(config.caps.payee.daily_spend_minor.get("GBP"), Some(&10_000));
        assert_eq!(config.unknown_scope_policy, UnknownScopePolicy::Reject);
    }

    #[test]
    fn rejects_pause_longer_than_approval_expiry() {
        let err = PipelineConfig::from_json_str(
            r#"{ "forced_pause_ms": 120000, "approval": { "expiry_seconds": 60 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_unknown_override_kind() {
        let err = PipelineConfig::from_json_str(r#"{ "caps": { "overrides": { "team:x": {} } } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("team:x"));
    }
}
