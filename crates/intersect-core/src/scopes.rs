//! Mapping from contract scopes to provider-specific OAuth scopes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::TokenError;
use crate::types::Scope;

/// What to do with a scope that has no mapping for the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownScopePolicy {
    #[default]
    Reject,
    /// Drop the scope from the minted token and continue.
    Ignore,
}

#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    providers: HashMap<String, BTreeMap<Scope, Vec<String>>>,
    policy: UnknownScopePolicy,
}

impl ScopeRegistry {
    pub fn new(policy: UnknownScopePolicy) -> Self {
        Self {
            providers: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> UnknownScopePolicy {
        self.policy
    }

    pub fn with_mapping(
        mut self,
        provider: impl Into<String>,
        scope: Scope,
        provider_scopes: &[&str],
    ) -> Self {
        self.register(provider, scope, provider_scopes);
        self
    }

    pub fn register(&mut self, provider: impl Into<String>, scope: Scope, provider_scopes: &[&str]) {
        self.providers
            .entry(provider.into())
            .or_default()
            .insert(
                scope,
                provider_scopes.iter().map(|s| s.to_string()).collect(),
            );
    }

    pub fn knows_provider(&self, provider: &str) -> bool {
        self.providers.contains_key(provider)
    }

    /// Resolve scopes to the provider's vocabulary, sorted and deduplicated.
    pub fn map_scopes(&self, provider: &str, scopes: &[Scope]) -> Result<Vec<String>, TokenError> {
        let mapping = self
            .providers
            .get(provider)
            .ok_or_else(|| TokenError::UnknownProvider(provider.to_string()))?;

        let mut mapped = Vec::new();
        for scope in scopes {
            match mapping.get(scope) {
                Some(provider_scopes) => mapped.extend(provider_scopes.iter().cloned()),
                None if self.policy == UnknownScopePolicy::Ignore => {
                    tracing::debug!(provider, scope = %scope, "ignoring unmapped scope");
                }
                None => {
                    return Err(TokenError::UnknownScope {
                        provider: provider.to_string(),
                        scope: scope.to_string(),
                    })
                }
            }
        }
        mapped.sort();
        mapped.dedup();
        Ok(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(policy: UnknownScopePolicy) -> ScopeRegistry {
        ScopeRegistry::new(policy)
            .with_mapping("google", Scope::read("calendar"), &["calendar.readonly"])
            .with_mapping("google", Scope::write("calendar"), &["calendar.events"])
    }

    #[test]
    fn unknown_scope_rejected_by_default() {
        let err = registry(UnknownScopePolicy::default())
            .map_scopes("google", &[Scope::write("calendar"), Scope::write("drive")])
            .unwrap_err();
        assert_eq!(
            err,
            TokenError::UnknownScope {
                provider: "google".to_string(),
                scope: "drive:write".to_string()
            }
        );
    }

    #[test]
    fn ignore_policy_drops_unknown_scopes() {
        let mapped = registry(UnknownScopePolicy::Ignore)
            .map_scopes("google", &[Scope::write("calendar"), Scope::write("drive")])
            .unwrap();
        assert_eq!(mapped, vec!["calendar.events".to_string()]);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        assert!(matches!(
            registry(UnknownScopePolicy::Ignore).map_scopes("outlook", &[Scope::read("calendar")]),
            Err(TokenError::UnknownProvider(_))
        ));
    }
}
