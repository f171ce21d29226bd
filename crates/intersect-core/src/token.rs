use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authority::AuthorizationProof;
use crate::envelope::ExecutionEnvelope;
use crate::error::TokenError;
use crate::types::Scope;

/// Short-lived provider credential scoped to one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token_id: String,
    pub provider: String,
    pub envelope_id: String,
    pub provider_scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Mints provider access tokens. OAuth acquisition and refresh live behind it.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn mint_access_token(
        &self,
        envelope: &ExecutionEnvelope,
        proof: &AuthorizationProof,
        provider: &str,
        scopes: &[Scope],
    ) -> Result<AccessToken, TokenError>;
}

/// Checks every provider must apply before minting.
pub fn check_mint_request(
    envelope: &ExecutionEnvelope,
    proof: &AuthorizationProof,
    scopes: &[Scope],
) -> Result<(), TokenError> {
    if !proof.authorized {
        return Err(TokenError::ProofNotAuthorized);
    }
    if proof.proof_id != envelope.authorization_proof_id()
        || &proof.intersection_id != envelope.intersection_id()
        || proof.contract_version != envelope.contract_version()
        || &proof.actor_circle_id != envelope.actor_circle_id()
    {
        return Err(TokenError::ProofMismatch);
    }
    if let Some(scope) = scopes.iter().find(|scope| !proof.covers(scope)) {
        return Err(TokenError::ScopeNotInProof(scope.to_string()));
    }
    Ok(())
}
