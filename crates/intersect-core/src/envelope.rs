//! Sealed, hashable description of one action attempt.
//!
//! An envelope is immutable after sealing. Attaching an approval reference goes
//! through [`ExecutionEnvelope::with_approval`], which seals a new envelope; the
//! action hash only covers the logical content of the attempt, so a re-sealed
//! envelope for the same action keeps the same hash and envelope id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{digest_json, digest_parts};
use crate::error::ValidationError;
use crate::types::{Action, CircleId, IntersectionId, Mode, Scope};

/// Evidence that the write was approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalReference {
    /// Explicit confirmation by a single contract party.
    Human {
        approver: CircleId,
        approved_at: DateTime<Utc>,
    },
    /// Multi-party approval bundle collected by the approval engine.
    Bundle { bundle_hash: String },
}

/// Everything besides the action that goes into sealing.
#[derive(Debug, Clone)]
pub struct SealParams {
    pub trace_id: String,
    pub actor_circle_id: CircleId,
    pub contract_version: u64,
    pub mode: Mode,
    pub scopes: Vec<Scope>,
    pub authorization_proof_id: String,
    pub approval: Option<ApprovalReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEnvelope {
    envelope_id: String,
    trace_id: String,
    mode: Mode,
    actor_circle_id: CircleId,
    intersection_id: IntersectionId,
    contract_version: u64,
    scopes_used: Vec<Scope>,
    authorization_proof_id: String,
    approval: Option<ApprovalReference>,
    issued_at: DateTime<Utc>,
    action: Action,
    action_hash: String,
}

/// Seal an action into an envelope, rejecting structurally incomplete input.
pub fn seal(
    action: Action,
    params: SealParams,
    issued_at: DateTime<Utc>,
) -> Result<ExecutionEnvelope, ValidationError> {
    if params.trace_id.trim().is_empty() {
        return Err(ValidationError::MissingField("trace_id"));
    }
    if action.intersection_id().as_str().trim().is_empty() {
        return Err(ValidationError::MissingField("intersection_id"));
    }
    if params.actor_circle_id.as_str().trim().is_empty() {
        return Err(ValidationError::MissingField("actor_circle_id"));
    }
    if action.action_type().trim().is_empty() {
        return Err(ValidationError::MissingField("action_type"));
    }
    if params.authorization_proof_id.trim().is_empty() {
        return Err(ValidationError::MissingField("authorization_proof_id"));
    }
    if params.scopes.is_empty() {
        return Err(ValidationError::EmptyScopes);
    }

    let mut scopes = params.scopes;
    scopes.sort();
    scopes.dedup();

    let action_hash = compute_action_hash(
        &action,
        params.contract_version,
        &params.actor_circle_id,
        params.mode,
        &scopes,
    )?;
    let envelope_id = format!("env-{}", &digest_parts(&[&params.trace_id, &action_hash])[..32]);

    Ok(ExecutionEnvelope {
        envelope_id,
        trace_id: params.trace_id,
        mode: params.mode,
        actor_circle_id: params.actor_circle_id,
        intersection_id: action.intersection_id().clone(),
        contract_version: params.contract_version,
        scopes_used: scopes,
        authorization_proof_id: params.authorization_proof_id,
        approval: params.approval,
        issued_at,
        action,
        action_hash,
    })
}

fn compute_action_hash(
    action: &Action,
    contract_version: u64,
    actor: &CircleId,
    mode: Mode,
    scopes: &[Scope],
) -> Result<String, ValidationError> {
    let scopes: Vec<String> = scopes.iter().map(ToString::to_string).collect();
    let material = serde_json::json!({
        "intersection_id": action.intersection_id(),
        "contract_version": contract_version,
        "actor": actor,
        "mode": mode,
        "scopes": scopes,
        "action_id": action.action_id(),
        "action_type": action.action_type(),
        "parameters": action.parameters(),
    });

    digest_json(&material).map_err(|e| ValidationError::InvalidParameter {
        name: "action".to_string(),
        reason: e.to_string(),
    })
}

impl ExecutionEnvelope {
    pub fn envelope_id(&self) -> &str {
        &self.envelope_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn actor_circle_id(&self) -> &CircleId {
        &self.actor_circle_id
    }

    pub fn intersection_id(&self) -> &IntersectionId {
        &self.intersection_id
    }

    pub fn contract_version(&self) -> u64 {
        self.contract_version
    }

    pub fn scopes_used(&self) -> &[Scope] {
        &self.scopes_used
    }

    pub fn authorization_proof_id(&self) -> &str {
        &self.authorization_proof_id
    }

    pub fn approval(&self) -> Option<&ApprovalReference> {
        self.approval.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn action_hash(&self) -> &str {
        &self.action_hash
    }

    /// Seal a new envelope carrying `approval`; hash and id are unchanged.
    pub fn with_approval(
        &self,
        approval: ApprovalReference,
        issued_at: DateTime<Utc>,
    ) -> Result<ExecutionEnvelope, ValidationError> {
        seal(
            self.action.clone(),
            SealParams {
                trace_id: self.trace_id.clone(),
                actor_circle_id: self.actor_circle_id.clone(),
                contract_version: self.contract_version,
                mode: self.mode,
                scopes: self.scopes_used.clone(),
                authorization_proof_id: self.authorization_proof_id.clone(),
                approval: Some(approval),
            },
            issued_at,
        )
    }

    /// Recompute the action hash; fails for envelopes altered after sealing.
    pub fn verify_hash(&self) -> Result<(), ValidationError> {
        let expected = compute_action_hash(
            &self.action,
            self.contract_version,
            &self.actor_circle_id,
            self.mode,
            &self.scopes_used,
        )?;
        if expected != self.action_hash || &self.intersection_id != self.action.intersection_id() {
            return Err(ValidationError::HashMismatch);
        }
        Ok(())
    }

    pub fn has_write_scope(&self) -> bool {
        self.scopes_used.iter().any(Scope::is_write)
    }

    /// Read paths: `suggest_only` or `simulate`, and no write scopes.
    pub fn validate_for_read(&self) -> Result<(), ValidationError> {
        self.validate_common()?;
        if self.mode == Mode::Execute {
            return Err(ValidationError::ModeNotPermitted(self.mode.name()));
        }
        if let Some(scope) = self.scopes_used.iter().find(|scope| scope.is_write()) {
            return Err(ValidationError::WriteScopeOnRead(scope.to_string()));
        }
        Ok(())
    }

    /// Write path: `execute` mode, an approval reference and a write scope.
    pub fn validate_for_write(&self) -> Result<(), ValidationError> {
        self.validate_common()?;
        if self.mode != Mode::Execute {
            return Err(ValidationError::ModeNotPermitted(self.mode.name()));
        }
        if self.approval.is_none() {
            return Err(ValidationError::MissingApproval);
        }
        if !self.has_write_scope() {
            return Err(ValidationError::NoWriteScope);
        }
        Ok(())
    }

    fn validate_common(&self) -> Result<(), ValidationError> {
        if self.trace_id.trim().is_empty() {
            return Err(ValidationError::MissingField("trace_id"));
        }
        if self.intersection_id.as_str().trim().is_empty() {
            return Err(ValidationError::MissingField("intersection_id"));
        }
        if self.actor_circle_id.as_str().trim().is_empty() {
            return Err(ValidationError::MissingField("actor_circle_id"));
        }
        if self.scopes_used.is_empty() {
            return Err(ValidationError::EmptyScopes);
        }
        if self.authorization_proof_id.trim().is_empty() {
            return Err(ValidationError::MissingField("authorization_proof_id"));
        }
        Ok(())
    }
}
