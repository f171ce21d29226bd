//! Orchestration of one action attempt.
//!
//! `execute` runs, in order: replay lookup, proof and contract re-verification,
//! envelope validation, approval gate, revocation check, caps admission,
//! attempt reservation, forced pause (financial actions), a second revocation
//! and threshold check, a connector dry run followed by the write under one
//! shared deadline, settlement persistence with rollback on failure, and
//! finalization. Every stage is appended to the audit sink; terminal outcomes
//! are recorded before they are returned.
//!
//! An audit sink failure after reservation is treated like a crash: the attempt
//! stays reserved and the caps hold stays in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalBundle, ApprovalEngine, ApprovalRequest};
use crate::audit::{AuditEvent, AuditSink};
use crate::authority::{AuthorityEngine, AuthorizationProof};
use crate::caps::{CapAdmission, CapScope, CapsLedger};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::connector::{Connector, ConnectorPayload, ConnectorRegistry, Receipt};
use crate::envelope::{seal, ApprovalReference, ExecutionEnvelope, SealParams};
use crate::error::{
    ApprovalError, CapError, ConfigError, ConnectorError, PipelineError, ReserveError, StorageError, TokenError,
    ValidationError,
};
use crate::flow::EnvelopeStageMachine;
use crate::idempotency::{attempt_key, IdempotencyLedger, Reservation};
use crate::outcome::{BlockReason, ExecuteResult, SettlementState};
use crate::token::TokenProvider;
use crate::types::{Action, ApprovalPolicy, CircleId, Contract, Mode, Scope};

/// Persists settled receipts. A failure here triggers a connector rollback.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn record_settlement(
        &self,
        envelope: &ExecutionEnvelope,
        attempt_key: &str,
        receipt: &Receipt,
    ) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub envelope_id: String,
    pub trace_id: String,
    pub attempt_key: String,
    pub receipt: Receipt,
}

#[derive(Debug, Default)]
pub struct MemorySettlementStore {
    records: Mutex<Vec<SettlementRecord>>,
}

impl MemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Result<Vec<SettlementRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| StorageError::LockPoisoned("settlement store"))?
            .clone())
    }
}

#[async_trait]
impl SettlementStore for MemorySettlementStore {
    async fn record_settlement(
        &self,
        envelope: &ExecutionEnvelope,
        attempt_key: &str,
        receipt: &Receipt,
    ) -> Result<(), StorageError> {
        self.records
            .lock()
            .map_err(|_| StorageError::LockPoisoned("settlement store"))?
            .push(SettlementRecord {
                envelope_id: envelope.envelope_id().to_string(),
                trace_id: envelope.trace_id().to_string(),
                attempt_key: attempt_key.to_string(),
                receipt: receipt.clone(),
            });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub action: Action,
    pub actor: CircleId,
    pub scopes: Vec<Scope>,
    pub mode: Mode,
    pub trace_id: String,
}

impl PrepareRequest {
    pub fn new(action: Action, actor: impl Into<CircleId>, scopes: Vec<Scope>, mode: Mode) -> Self {
        Self {
            action,
            actor: actor.into(),
            scopes,
            mode,
            trace_id: format!("trace-{}", Uuid::new_v4()),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

/// Authorization decision plus the envelope sealed against it.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub proof: AuthorizationProof,
    pub envelope: ExecutionEnvelope,
}

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub envelope: ExecutionEnvelope,
    /// Distinguishes deliberate retries of the same envelope. Replays reuse it.
    pub attempt_ordinal: u32,
    pub deadline: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(envelope: ExecutionEnvelope) -> Self {
        Self {
            envelope,
            attempt_ordinal: 1,
            deadline: None,
        }
    }

    pub fn with_ordinal(mut self, attempt_ordinal: u32) -> Self {
        self.attempt_ordinal = attempt_ordinal;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    pub envelope_id: String,
    pub revoked_by: CircleId,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// Counts returned by [`Pipeline::prune_before`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pruned {
    pub proofs: usize,
    pub revocations: usize,
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    authority: Arc<AuthorityEngine>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    connectors: ConnectorRegistry,
    approvals: Option<Arc<ApprovalEngine>>,
    idempotency: Option<Arc<IdempotencyLedger>>,
    caps: Option<Arc<CapsLedger>>,
    tokens: Option<Arc<dyn TokenProvider>>,
    settlements: Option<Arc<dyn SettlementStore>>,
}

impl PipelineBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.register(connector);
        self
    }

    pub fn approvals(mut self, approvals: Arc<ApprovalEngine>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn idempotency(mut self, ledger: Arc<IdempotencyLedger>) -> Self {
        self.idempotency = Some(ledger);
        self
    }

    pub fn caps(mut self, ledger: Arc<CapsLedger>) -> Self {
        self.caps = Some(ledger);
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn settlement_store(mut self, store: Arc<dyn SettlementStore>) -> Self {
        self.settlements = Some(store);
        self
    }

    pub fn build(self) -> Result<Pipeline, ConfigError> {
        self.config.validate()?;
        let clock = self.clock;
        Ok(Pipeline {
            approvals: self
                .approvals
                .unwrap_or_else(|| Arc::new(ApprovalEngine::new(Arc::clone(&clock)))),
            idempotency: self
                .idempotency
                .unwrap_or_else(|| Arc::new(IdempotencyLedger::new(Arc::clone(&clock)))),
            caps: self.caps.unwrap_or_else(|| {
                Arc::new(CapsLedger::new(self.config.caps.clone(), Arc::clone(&clock)))
            }),
            settlements: self
                .settlements
                .unwrap_or_else(|| Arc::new(MemorySettlementStore::new())),
            config: self.config,
            authority: self.authority,
            audit: self.audit,
            connectors: self.connectors,
            tokens: self.tokens,
            clock,
            revocations: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
        })
    }
}

/// Outcome of the reserved phase, before finalization.
struct Settled {
    result: ExecuteResult,
    consume_bundle: Option<String>,
}

pub struct Pipeline {
    config: PipelineConfig,
    authority: Arc<AuthorityEngine>,
    approvals: Arc<ApprovalEngine>,
    idempotency: Arc<IdempotencyLedger>,
    caps: Arc<CapsLedger>,
    connectors: ConnectorRegistry,
    tokens: Option<Arc<dyn TokenProvider>>,
    settlements: Arc<dyn SettlementStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    revocations: Mutex<HashMap<String, Revocation>>,
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Pipeline {
    pub fn builder(
        config: PipelineConfig,
        authority: Arc<AuthorityEngine>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            config,
            authority,
            audit,
            clock,
            connectors: ConnectorRegistry::new(),
            approvals: None,
            idempotency: None,
            caps: None,
            tokens: None,
            settlements: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<AuthorityEngine> {
        &self.authority
    }

    pub fn approvals(&self) -> &Arc<ApprovalEngine> {
        &self.approvals
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyLedger> {
        &self.idempotency
    }

    pub fn caps(&self) -> &Arc<CapsLedger> {
        &self.caps
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Authorize the action and seal an envelope bound to the resulting proof.
    ///
    /// A denial still yields a sealed envelope; executing it settles as blocked.
    pub async fn prepare(&self, request: PrepareRequest) -> Result<Prepared, PipelineError> {
        let proof = self
            .authority
            .authorize_action(
                &request.action,
                &request.actor,
                &request.scopes,
                request.mode,
                &request.trace_id,
            )
            .map_err(PipelineError::Ledger)?;

        let envelope = seal(
            request.action,
            SealParams {
                trace_id: request.trace_id,
                actor_circle_id: request.actor,
                contract_version: proof.contract_version,
                mode: request.mode,
                scopes: request.scopes,
                authorization_proof_id: proof.proof_id.clone(),
                approval: None,
            },
            self.clock.now(),
        )?;

        let (event_type, outcome, detail) = if proof.authorized {
            (
                "sealed",
                "authorized".to_string(),
                format!("contract_version={}", proof.contract_version),
            )
        } else {
            (
                "denied",
                proof
                    .denial_reason
                    .map(|r| r.code().to_string())
                    .unwrap_or_default(),
                proof.denial_detail.clone().unwrap_or_default(),
            )
        };
        self.record(&envelope, event_type, Some(&outcome), detail).await?;

        Ok(Prepared { proof, envelope })
    }

    /// Open an approval request for `envelope` using the contract's threshold.
    pub async fn request_approval(
        &self,
        envelope: &ExecutionEnvelope,
        approvers: &[CircleId],
    ) -> Result<ApprovalRequest, PipelineError> {
        let contract = self
            .authority
            .contracts()
            .version(envelope.intersection_id(), envelope.contract_version())
            .map_err(PipelineError::Ledger)?;
        let outsider = approvers
            .iter()
            .find(|approver| !contract.as_ref().is_some_and(|c| c.is_party(approver)));
        if let Some(outsider) = outsider {
            warn!(
                trace_id = envelope.trace_id(),
                envelope_id = envelope.envelope_id(),
                approver = %outsider,
                "approver is not a party to the pinned contract"
            );
            return Err(ApprovalError::ApproverNotAuthorized(outsider.to_string()).into());
        }
        let threshold = contract
            .map(|contract| contract.approval_policy.threshold())
            .unwrap_or(1);
        let bundle = ApprovalBundle::from_envelope(envelope, self.clock.now())?;
        let request = self.approvals.request_approval(
            bundle,
            approvers,
            threshold,
            self.config.approval.expiry_seconds,
        )?;

        self.record(
            envelope,
            "approval_requested",
            None,
            format!(
                "bundle={} threshold={} approvers={}",
                request.bundle.bundle_hash,
                threshold,
                request.tokens.len()
            ),
        )
        .await?;
        Ok(request)
    }

    /// Revoke an envelope. Wins over any attempt that has not reached the connector.
    pub async fn revoke(
        &self,
        envelope: &ExecutionEnvelope,
        revoked_by: &CircleId,
        reason: &str,
    ) -> Result<Revocation, PipelineError> {
        let revocation = Revocation {
            envelope_id: envelope.envelope_id().to_string(),
            revoked_by: revoked_by.clone(),
            reason: reason.to_string(),
            revoked_at: self.clock.now(),
        };
        self.revocations
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocations"))?
            .insert(revocation.envelope_id.clone(), revocation.clone());
        let waiting = self
            .signals
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocation signals"))?
            .get(envelope.envelope_id())
            .cloned();
        if let Some(signal) = waiting {
            signal.notify_waiters();
        }

        if let Some(ApprovalReference::Bundle { bundle_hash }) = envelope.approval() {
            if let Err(err) = self.approvals.revoke_bundle(bundle_hash) {
                debug!(bundle_hash = %bundle_hash, error = %err, "bundle revocation skipped");
            }
        }

        info!(
            trace_id = envelope.trace_id(),
            envelope_id = envelope.envelope_id(),
            revoked_by = %revoked_by,
            "envelope revoked"
        );
        let event = AuditEvent::new(envelope.trace_id(), "revoked", revocation.revoked_at)
            .actor(revoked_by)
            .envelope(envelope.envelope_id())
            .proof(envelope.authorization_proof_id())
            .detail(reason);
        self.audit.append(event).await.map_err(PipelineError::Audit)?;
        Ok(revocation)
    }

    /// Forget authorization proofs issued before `cutoff` and revocations made
    /// before it. Envelopes whose proof is gone are blocked on re-verification,
    /// so an old revocation adds nothing once its proof has been dropped.
    /// `cutoff` should trail the clock by more than the forced pause and the
    /// connector deadline.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<Pruned, PipelineError> {
        let proofs = self.authority.prune_proofs(cutoff).map_err(PipelineError::Ledger)?;
        let pausing = self
            .signals
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocation signals"))?
            .keys()
            .cloned()
            .collect::<HashSet<_>>();
        let mut revocations = self
            .revocations
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocations"))?;
        let before = revocations.len();
        revocations.retain(|envelope_id, revocation| {
            revocation.revoked_at >= cutoff || pausing.contains(envelope_id)
        });
        let pruned = Pruned {
            proofs,
            revocations: before - revocations.len(),
        };
        info!(
            proofs = pruned.proofs,
            revocations = pruned.revocations,
            cutoff = %cutoff,
            "pruned pipeline state"
        );
        Ok(pruned)
    }

    /// Envelopes currently waiting out a forced pause.
    pub fn pausing(&self) -> Result<usize, PipelineError> {
        Ok(self
            .signals
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocation signals"))?
            .len())
    }

    pub fn is_revoked(&self, envelope_id: &str) -> Result<bool, PipelineError> {
        Ok(self
            .revocations
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocations"))?
            .contains_key(envelope_id))
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResult, PipelineError> {
        let ExecuteRequest {
            envelope,
            attempt_ordinal,
            deadline,
        } = request;
        let deadline = deadline.unwrap_or_else(|| self.config.default_deadline());
        let key = attempt_key(envelope.envelope_id(), envelope.action_hash(), attempt_ordinal);

        if let Some(record) = self.idempotency.lookup(&key)? {
            return match record.result {
                Some(result) => {
                    info!(
                        trace_id = envelope.trace_id(),
                        envelope_id = envelope.envelope_id(),
                        attempt_key = %key,
                        "replayed terminal result"
                    );
                    self.record(&envelope, "replayed", Some(result.state.name()), key).await?;
                    Ok(result)
                }
                None => Err(PipelineError::InFlight {
                    envelope_id: envelope.envelope_id().to_string(),
                }),
            };
        }

        let mut flow = EnvelopeStageMachine::new(envelope.envelope_id());
        self.record(
            &envelope,
            "execute_requested",
            None,
            format!("mode={} ordinal={}", envelope.mode(), attempt_ordinal),
        )
        .await?;

        let (proof, contract) = match self.reverify(&envelope)? {
            Ok(verified) => verified,
            Err((reason, message)) => {
                return self
                    .conclude(&envelope, &mut flow, SettlementState::SettledBlocked, Some(reason), message)
                    .await
            }
        };
        flow.mark_authorized()?;
        self.record(&envelope, "authorized", None, format!("proof={}", proof.proof_id)).await?;

        match envelope.mode() {
            Mode::SuggestOnly => self.run_suggestion(&envelope, &mut flow).await,
            Mode::Simulate => {
                self.run_simulation(&envelope, &mut flow, key, attempt_ordinal, deadline)
                    .await
            }
            Mode::Execute => {
                self.run_write(&envelope, &mut flow, &proof, &contract, key, attempt_ordinal, deadline)
                    .await
            }
        }
    }

    async fn run_suggestion(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
    ) -> Result<ExecuteResult, PipelineError> {
        if let Err(err) = envelope.validate_for_read() {
            return self
                .conclude(envelope, flow, SettlementState::SettledBlocked, Some(BlockReason::ValidationFailed), err.to_string())
                .await;
        }
        flow.mark_suggested()?;
        let result = self.result(
            envelope,
            None,
            SettlementState::SettledSuccess,
            None,
            "suggestion recorded; no external effect".to_string(),
        );
        self.record_terminal(envelope, &result).await?;
        Ok(result)
    }

    async fn run_simulation(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        key: String,
        attempt_ordinal: u32,
        deadline: Duration,
    ) -> Result<ExecuteResult, PipelineError> {
        if let Err(err) = envelope.validate_for_read() {
            return self
                .conclude(envelope, flow, SettlementState::SettledBlocked, Some(BlockReason::ValidationFailed), err.to_string())
                .await;
        }

        let admission = match self.admit_caps(envelope, flow).await? {
            Ok(admission) => admission,
            Err(result) => return Ok(result),
        };
        let (reservation, admission) =
            match self.reserve(envelope, flow, admission, attempt_ordinal).await? {
                Ok(reserved) => reserved,
                Err(prior) => return Ok(prior),
            };

        flow.mark_executing()?;
        let outcome = match self.connectors.get(envelope.action().domain()) {
            None => self.result(
                envelope,
                Some(key.clone()),
                SettlementState::SettledFailed,
                Some(BlockReason::ConnectorUnavailable),
                format!("no connector for domain '{}'", envelope.action().domain()),
            ),
            Some(connector) => {
                match tokio::time::timeout(deadline, connector.prepare(envelope)).await {
                    Ok(Ok(receipt)) => {
                        let mut result = self.result(
                            envelope,
                            Some(key.clone()),
                            SettlementState::SettledSuccess,
                            None,
                            format!("simulated with {}", connector.provider()),
                        );
                        result.receipt = Some(receipt);
                        result
                    }
                    Ok(Err(err)) => self.connector_failure(envelope, &key, &err),
                    Err(_) => self.connector_failure(envelope, &key, &ConnectorError::Timeout),
                }
            }
        };

        self.finalize(
            envelope,
            flow,
            reservation,
            admission,
            Settled {
                result: outcome,
                consume_bundle: None,
            },
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_write(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        proof: &AuthorizationProof,
        contract: &Contract,
        key: String,
        attempt_ordinal: u32,
        deadline: Duration,
    ) -> Result<ExecuteResult, PipelineError> {
        if let Err(err) = envelope.validate_for_write() {
            let reason = match err {
                ValidationError::MissingApproval => BlockReason::ApprovalMissing,
                _ => BlockReason::ValidationFailed,
            };
            return self
                .conclude(envelope, flow, SettlementState::SettledBlocked, Some(reason), err.to_string())
                .await;
        }

        let bundle_hash = match self.check_approval(envelope, contract, flow).await? {
            Ok(bundle_hash) => bundle_hash,
            Err((reason, message)) => {
                return self
                    .conclude(envelope, flow, SettlementState::SettledBlocked, Some(reason), message)
                    .await
            }
        };

        if self.is_revoked(envelope.envelope_id())? {
            return self
                .conclude(envelope, flow, SettlementState::SettledBlocked, Some(BlockReason::Revoked), "envelope revoked".to_string())
                .await;
        }

        let admission = match self.admit_caps(envelope, flow).await? {
            Ok(admission) => admission,
            Err(result) => return Ok(result),
        };
        let (reservation, admission) =
            match self.reserve(envelope, flow, admission, attempt_ordinal).await? {
                Ok(reserved) => reserved,
                Err(prior) => return Ok(prior),
            };

        let settled = self
            .run_reserved(envelope, flow, proof, bundle_hash, &key, attempt_ordinal, deadline)
            .await?;
        self.finalize(envelope, flow, reservation, admission, settled).await
    }

    /// Everything between reservation and finalization.
    #[allow(clippy::too_many_arguments)]
    async fn run_reserved(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        proof: &AuthorizationProof,
        bundle_hash: Option<String>,
        key: &str,
        attempt_ordinal: u32,
        deadline: Duration,
    ) -> Result<Settled, PipelineError> {
        let blocked = |reason: BlockReason, message: &str| Settled {
            result: self.result(
                envelope,
                Some(key.to_string()),
                SettlementState::SettledBlocked,
                Some(reason),
                message.to_string(),
            ),
            consume_bundle: None,
        };

        if self.config.is_financial(envelope.action().domain()) {
            self.forced_pause(envelope).await?;
        }

        if self.is_revoked(envelope.envelope_id())? {
            return Ok(blocked(BlockReason::Revoked, "envelope revoked before execution"));
        }
        if let Some(bundle_hash) = &bundle_hash {
            let status = self.approvals.verify_threshold(bundle_hash)?;
            if status.revoked {
                return Ok(blocked(BlockReason::Revoked, "approval revoked before execution"));
            }
            if !status.satisfied {
                return Ok(blocked(
                    BlockReason::ApprovalThresholdUnmet,
                    &format!(
                        "approval threshold no longer met ({}/{})",
                        status.collected, status.required
                    ),
                ));
            }
        }

        let Some(connector) = self.connectors.get(envelope.action().domain()) else {
            return Ok(Settled {
                result: self.result(
                    envelope,
                    Some(key.to_string()),
                    SettlementState::SettledFailed,
                    Some(BlockReason::ConnectorUnavailable),
                    format!("no connector for domain '{}'", envelope.action().domain()),
                ),
                consume_bundle: None,
            });
        };

        let started = tokio::time::Instant::now();
        let preview = match tokio::time::timeout(deadline, connector.prepare(envelope)).await {
            Ok(Ok(preview)) => preview,
            Ok(Err(err)) => {
                self.record(envelope, "prepare_failed", Some(err.category()), "connector refused the dry run")
                    .await?;
                return Ok(Settled {
                    result: self.connector_failure(envelope, key, &err),
                    consume_bundle: None,
                });
            }
            Err(_) => {
                self.record(envelope, "prepare_failed", Some("timeout"), "dry run exceeded deadline")
                    .await?;
                return Ok(Settled {
                    result: self.connector_failure(envelope, key, &ConnectorError::Timeout),
                    consume_bundle: None,
                });
            }
        };
        self.record(
            envelope,
            "prepared",
            None,
            format!("provider={} preview={}", preview.provider, preview.redacted().external_id),
        )
        .await?;

        let write_scopes: Vec<Scope> = envelope
            .scopes_used()
            .iter()
            .filter(|scope| scope.is_write())
            .cloned()
            .collect();
        let access_token = match &self.tokens {
            None => None,
            Some(tokens) => match tokens
                .mint_access_token(envelope, proof, connector.provider(), &write_scopes)
                .await
            {
                Ok(token) => Some(token),
                Err(err) => {
                    let reason = match err {
                        TokenError::ScopeNotInProof(_) | TokenError::UnknownScope { .. } => {
                            BlockReason::ScopeNotGranted
                        }
                        TokenError::UnknownProvider(_) => BlockReason::ConnectorUnavailable,
                        TokenError::ProofNotAuthorized | TokenError::ProofMismatch => {
                            BlockReason::ProofInvalid
                        }
                    };
                    return Ok(blocked(reason, &err.to_string()));
                }
            },
        };

        // Last point at which a revocation can still stop the write.
        if self.is_revoked(envelope.envelope_id())? {
            return Ok(blocked(BlockReason::Revoked, "envelope revoked before execution"));
        }

        flow.mark_executing()?;
        self.record(
            envelope,
            "executing",
            None,
            format!("provider={} ordinal={}", connector.provider(), attempt_ordinal),
        )
        .await?;
        info!(
            trace_id = envelope.trace_id(),
            envelope_id = envelope.envelope_id(),
            provider = connector.provider(),
            stage = "executing",
            "calling connector"
        );

        let payload = ConnectorPayload {
            idempotency_key: key.to_string(),
            authorization_proof_id: proof.proof_id.clone(),
            access_token,
            parameters: envelope.action().parameters().clone(),
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let receipt = match tokio::time::timeout(remaining, connector.execute(envelope, &payload)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                self.record(envelope, "execution_failed", Some(err.category()), "connector reported failure")
                    .await?;
                return Ok(Settled {
                    result: self.connector_failure(envelope, key, &err),
                    consume_bundle: None,
                });
            }
            Err(_) => {
                warn!(
                    trace_id = envelope.trace_id(),
                    envelope_id = envelope.envelope_id(),
                    deadline_ms = deadline.as_millis() as u64,
                    "connector call exceeded deadline"
                );
                self.record(envelope, "execution_failed", Some("timeout"), "connector call exceeded deadline")
                    .await?;
                let mut result = self.connector_failure(envelope, key, &ConnectorError::Timeout);
                result.rollback_failure = Some("rollback unavailable: no receipt".to_string());
                self.record(envelope, "rollback_unavailable", Some("no_receipt"), "timeout left no receipt to reverse")
                    .await?;
                return Ok(Settled {
                    result,
                    consume_bundle: None,
                });
            }
        };

        self.record(
            envelope,
            "executed",
            Some(if receipt.money_moved { "money_moved" } else { "no_money_moved" }),
            format!("provider={} receipt={}", receipt.provider, receipt.redacted().external_id),
        )
        .await?;

        if let Err(err) = self.settlements.record_settlement(envelope, key, &receipt).await {
            warn!(
                trace_id = envelope.trace_id(),
                envelope_id = envelope.envelope_id(),
                error = %err,
                "settlement persistence failed, rolling back"
            );
            self.record(envelope, "settlement_failed", None, "settlement could not be persisted")
                .await?;
            return Ok(Settled {
                result: self.roll_back(envelope, connector.as_ref(), receipt, key, deadline).await?,
                consume_bundle: None,
            });
        }

        let mut result = self.result(
            envelope,
            Some(key.to_string()),
            SettlementState::SettledSuccess,
            None,
            format!("executed with {}", connector.provider()),
        );
        result.money_moved = receipt.money_moved;
        result.receipt = Some(receipt);
        Ok(Settled {
            result,
            consume_bundle: bundle_hash,
        })
    }

    async fn roll_back(
        &self,
        envelope: &ExecutionEnvelope,
        connector: &dyn Connector,
        receipt: Receipt,
        key: &str,
        deadline: Duration,
    ) -> Result<ExecuteResult, PipelineError> {
        let mut result = self.result(
            envelope,
            Some(key.to_string()),
            SettlementState::SettledFailed,
            Some(BlockReason::SettlementFailed),
            "settlement could not be persisted".to_string(),
        );

        match tokio::time::timeout(deadline, connector.rollback(&receipt)).await {
            Ok(Ok(_reversal)) => {
                result.rolled_back = true;
                result.money_moved = false;
                result.message = "settlement could not be persisted; external effect rolled back".to_string();
                self.record(envelope, "rollback_succeeded", Some("rolled_back"), receipt.provider.clone())
                    .await?;
            }
            Ok(Err(err)) => {
                result.money_moved = receipt.money_moved;
                result.rollback_failure = Some(err.category().to_string());
                self.record(envelope, "rollback_failed", Some(err.category()), receipt.provider.clone())
                    .await?;
            }
            Err(_) => {
                result.money_moved = receipt.money_moved;
                result.rollback_failure = Some(ConnectorError::Timeout.category().to_string());
                self.record(envelope, "rollback_failed", Some("timeout"), receipt.provider.clone())
                    .await?;
            }
        }
        result.receipt = Some(receipt);
        Ok(result)
    }

    async fn forced_pause(&self, envelope: &ExecutionEnvelope) -> Result<(), PipelineError> {
        let pause = self.config.forced_pause();
        if pause.is_zero() {
            return Ok(());
        }

        let signal = self.signal(envelope.envelope_id())?;
        let paused = self.pause_until_revoked(envelope, &signal, pause).await;
        self.signals
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocation signals"))?
            .remove(envelope.envelope_id());
        paused
    }

    async fn pause_until_revoked(
        &self,
        envelope: &ExecutionEnvelope,
        signal: &Notify,
        pause: Duration,
    ) -> Result<(), PipelineError> {
        let revoked = signal.notified();
        tokio::pin!(revoked);

        self.record(
            envelope,
            "forced_pause_started",
            None,
            format!("pause_ms={}", pause.as_millis()),
        )
        .await?;
        if self.is_revoked(envelope.envelope_id())? {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(pause) => {
                debug!(envelope_id = envelope.envelope_id(), "forced pause elapsed");
            }
            _ = &mut revoked => {
                info!(envelope_id = envelope.envelope_id(), "forced pause interrupted by revocation");
            }
        }
        self.record(envelope, "forced_pause_ended", None, String::new()).await
    }

    /// Proof must exist, be authorized, match the envelope, and the contract
    /// version it pins must still be the one in force.
    #[allow(clippy::type_complexity)]
    fn reverify(
        &self,
        envelope: &ExecutionEnvelope,
    ) -> Result<Result<(AuthorizationProof, Contract), (BlockReason, String)>, PipelineError> {
        if let Err(err) = envelope.verify_hash() {
            return Ok(Err((BlockReason::ValidationFailed, err.to_string())));
        }

        let Some(proof) = self
            .authority
            .proof(envelope.authorization_proof_id())
            .map_err(PipelineError::Ledger)?
        else {
            return Ok(Err((BlockReason::ProofInvalid, "unknown authorization proof".to_string())));
        };

        if !proof.authorized {
            let reason = proof
                .denial_reason
                .map(|r| r.block_reason())
                .unwrap_or(BlockReason::ProofInvalid);
            let detail = proof.denial_detail.clone().unwrap_or_else(|| reason.to_string());
            return Ok(Err((reason, detail)));
        }

        let bound = &proof.intersection_id == envelope.intersection_id()
            && proof.contract_version == envelope.contract_version()
            && &proof.actor_circle_id == envelope.actor_circle_id()
            && proof.action_id == envelope.action().action_id()
            && proof.action_type == envelope.action().action_type()
            && proof.mode == envelope.mode()
            && envelope.scopes_used().iter().all(|scope| proof.covers(scope));
        if !bound {
            return Ok(Err((
                BlockReason::ProofInvalid,
                "authorization proof does not match the envelope".to_string(),
            )));
        }

        let Some(contract) = self
            .authority
            .contracts()
            .current(envelope.intersection_id())
            .map_err(PipelineError::Ledger)?
        else {
            return Ok(Err((BlockReason::ContractNotFound, "contract no longer registered".to_string())));
        };
        if contract.version != envelope.contract_version() {
            return Ok(Err((
                BlockReason::ContractVersionMismatch,
                format!(
                    "envelope pinned contract version {}, current is {}",
                    envelope.contract_version(),
                    contract.version
                ),
            )));
        }

        Ok(Ok((proof, contract)))
    }

    /// Returns the bundle hash to re-check and consume, if the approval is a bundle.
    async fn check_approval(
        &self,
        envelope: &ExecutionEnvelope,
        contract: &Contract,
        flow: &mut EnvelopeStageMachine,
    ) -> Result<Result<Option<String>, (BlockReason, String)>, PipelineError> {
        let approval = envelope.approval();
        match (&contract.approval_policy, approval) {
            (ApprovalPolicy::Single, Some(ApprovalReference::Human { approver, approved_at })) => {
                if !contract.is_party(approver) {
                    return Ok(Err((
                        BlockReason::ApprovalMissing,
                        format!("approver '{}' is not a party to the contract", approver),
                    )));
                }
                if *approved_at > self.clock.now() {
                    return Ok(Err((BlockReason::ApprovalMissing, "approval is dated in the future".to_string())));
                }
                Ok(Ok(None))
            }
            (policy, Some(ApprovalReference::Bundle { bundle_hash })) => {
                flow.mark_approval_pending()?;
                let bundle = match self.approvals.bundle(bundle_hash) {
                    Ok(bundle) => bundle,
                    Err(err) => return Ok(Err((BlockReason::ApprovalMissing, err.to_string()))),
                };
                if bundle.action_hash != envelope.action_hash()
                    || bundle.envelope_id != envelope.envelope_id()
                {
                    return Ok(Err((
                        BlockReason::ApprovalMissing,
                        "approval bundle is bound to a different action".to_string(),
                    )));
                }
                let approvers = self.approvals.approvers(bundle_hash)?;
                if let Some(outsider) = approvers.iter().find(|a| !contract.is_party(a)) {
                    return Ok(Err((
                        BlockReason::ApprovalMissing,
                        format!("approver '{}' is not a party to the contract", outsider),
                    )));
                }
                let status = self.approvals.verify_threshold(bundle_hash)?;
                self.record(
                    envelope,
                    "approval_checked",
                    Some(if status.satisfied { "satisfied" } else { "unmet" }),
                    format!("collected={} required={}", status.collected, status.required),
                )
                .await?;
                if status.revoked {
                    return Ok(Err((BlockReason::Revoked, "approval bundle revoked".to_string())));
                }
                if !status.satisfied || status.required < policy.threshold() {
                    return Ok(Err((
                        BlockReason::ApprovalThresholdUnmet,
                        format!(
                            "approvals collected {}/{}",
                            status.collected,
                            policy.threshold().max(status.required)
                        ),
                    )));
                }
                Ok(Ok(Some(bundle_hash.clone())))
            }
            (ApprovalPolicy::Multi { threshold }, _) => Ok(Err((
                BlockReason::ApprovalMissing,
                format!("contract requires a {}-party approval bundle", threshold),
            ))),
            (ApprovalPolicy::Single, None) => Ok(Err((
                BlockReason::ApprovalMissing,
                "write requires an approval reference".to_string(),
            ))),
        }
    }

    /// Caps admission; a block is concluded here and returned as the error value.
    async fn admit_caps(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
    ) -> Result<Result<CapAdmission, ExecuteResult>, PipelineError> {
        let action = envelope.action();
        let mut scopes = vec![
            CapScope::Circle(envelope.actor_circle_id().clone()),
            CapScope::Intersection(envelope.intersection_id().clone()),
        ];
        if let Some(payee) = action.payee() {
            scopes.push(CapScope::Payee(payee.to_string()));
        }
        let money = action.money();

        match self.caps.check_and_reserve(&scopes, money.as_ref(), self.clock.today()) {
            Ok(admission) => {
                flow.mark_caps_checked()?;
                self.record(envelope, "caps_checked", Some("admitted"), admission.keys().join(","))
                    .await?;
                Ok(Ok(admission))
            }
            Err(CapError::Storage(err)) => Err(PipelineError::Ledger(err)),
            Err(err) => {
                let reason = match err {
                    CapError::RateLimited { .. } => BlockReason::RateLimited,
                    _ => BlockReason::CapExceeded,
                };
                let result = self
                    .conclude(envelope, flow, SettlementState::SettledBlocked, Some(reason), err.to_string())
                    .await?;
                Ok(Err(result))
            }
        }
    }

    /// Reserve the attempt. A terminal replay comes back as the error value;
    /// either way the caps hold is released when no reservation is made.
    async fn reserve(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        admission: CapAdmission,
        attempt_ordinal: u32,
    ) -> Result<Result<(Reservation, CapAdmission), ExecuteResult>, PipelineError> {
        let reserved = self.idempotency.reserve_attempt(
            envelope.envelope_id(),
            envelope.action_hash(),
            attempt_ordinal,
        );
        let reservation = match reserved {
            Ok(reservation) => reservation,
            Err(err) => {
                self.caps.settle(admission, false).map_err(cap_storage)?;
                return match err {
                    ReserveError::AlreadyTerminal(prior) => {
                        self.record(envelope, "replayed", Some(prior.state.name()), "terminal attempt")
                            .await?;
                        Ok(Err(*prior))
                    }
                    ReserveError::InFlight { envelope_id } => {
                        debug!(envelope_id = %envelope_id, ordinal = attempt_ordinal, "reservation refused");
                        self.record(envelope, "in_flight_rejected", None, format!("ordinal={attempt_ordinal}"))
                            .await?;
                        Err(PipelineError::InFlight { envelope_id })
                    }
                    ReserveError::Storage(err) => Err(PipelineError::Ledger(err)),
                };
            }
        };

        flow.mark_reserved()?;
        self.record(envelope, "reserved", None, reservation.key().to_string()).await?;
        Ok(Ok((reservation, admission)))
    }

    async fn finalize(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        reservation: Reservation,
        admission: CapAdmission,
        settled: Settled,
    ) -> Result<ExecuteResult, PipelineError> {
        let Settled {
            result,
            consume_bundle,
        } = settled;

        self.caps.settle(admission, result.money_moved).map_err(cap_storage)?;
        self.idempotency.finalize(reservation, &result)?;
        if let Some(bundle_hash) = consume_bundle {
            self.approvals.consume_bundle(&bundle_hash)?;
        }

        flow.settle(result.state)?;
        self.record_terminal(envelope, &result).await?;
        Ok(result)
    }

    /// Settle a block or failure that happened before any reservation.
    async fn conclude(
        &self,
        envelope: &ExecutionEnvelope,
        flow: &mut EnvelopeStageMachine,
        state: SettlementState,
        reason: Option<BlockReason>,
        message: String,
    ) -> Result<ExecuteResult, PipelineError> {
        let result = self.result(envelope, None, state, reason, message);
        flow.settle(state)?;
        self.record_terminal(envelope, &result).await?;
        Ok(result)
    }

    async fn record_terminal(
        &self,
        envelope: &ExecutionEnvelope,
        result: &ExecuteResult,
    ) -> Result<(), PipelineError> {
        let outcome = result
            .block_reason
            .map(|r| r.code())
            .unwrap_or(if result.money_moved { "money_moved" } else { "no_money_moved" });
        info!(
            trace_id = envelope.trace_id(),
            envelope_id = envelope.envelope_id(),
            stage = result.state.name(),
            outcome,
            rolled_back = result.rolled_back,
            "attempt settled"
        );
        self.record(envelope, result.state.name(), Some(outcome), result.message.clone()).await
    }

    async fn record(
        &self,
        envelope: &ExecutionEnvelope,
        event_type: &str,
        outcome: Option<&str>,
        detail: impl Into<String>,
    ) -> Result<(), PipelineError> {
        let mut event = AuditEvent::new(envelope.trace_id(), event_type, self.clock.now())
            .actor(envelope.actor_circle_id())
            .envelope(envelope.envelope_id())
            .proof(envelope.authorization_proof_id())
            .detail(detail);
        if let Some(outcome) = outcome {
            event = event.outcome(outcome);
        }
        debug!(
            trace_id = envelope.trace_id(),
            envelope_id = envelope.envelope_id(),
            stage = event_type,
            "audit"
        );
        self.audit
            .append(event)
            .await
            .map(|_| ())
            .map_err(PipelineError::Audit)
    }

    fn connector_failure(
        &self,
        envelope: &ExecutionEnvelope,
        key: &str,
        err: &ConnectorError,
    ) -> ExecuteResult {
        let reason = match err {
            ConnectorError::Timeout => BlockReason::ConnectorTimeout,
            ConnectorError::Unavailable | ConnectorError::NotFound(_) => {
                BlockReason::ConnectorUnavailable
            }
            _ => BlockReason::ConnectorFailed,
        };
        self.result(
            envelope,
            Some(key.to_string()),
            SettlementState::SettledFailed,
            Some(reason),
            format!("connector failure ({})", err.category()),
        )
    }

    fn result(
        &self,
        envelope: &ExecutionEnvelope,
        attempt_key: Option<String>,
        state: SettlementState,
        block_reason: Option<BlockReason>,
        message: String,
    ) -> ExecuteResult {
        ExecuteResult {
            envelope_id: envelope.envelope_id().to_string(),
            trace_id: envelope.trace_id().to_string(),
            attempt_key,
            mode: envelope.mode(),
            state,
            block_reason,
            message,
            receipt: None,
            money_moved: false,
            rolled_back: false,
            rollback_failure: None,
        }
    }

    fn signal(&self, envelope_id: &str) -> Result<Arc<Notify>, PipelineError> {
        let mut signals = self
            .signals
            .lock()
            .map_err(|_| StorageError::LockPoisoned("revocation signals"))?;
        Ok(Arc::clone(
            signals
                .entry(envelope_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        ))
    }
}

fn cap_storage(err: CapError) -> PipelineError {
    match err {
        CapError::Storage(err) => PipelineError::Ledger(err),
        other => PipelineError::Ledger(StorageError::Integrity(other.to_string())),
    }
}
