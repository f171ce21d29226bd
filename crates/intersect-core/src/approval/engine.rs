use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bundle::{check_neutral_text, ApprovalBundle};
use super::wire::TokenClaims;
use crate::clock::Clock;
use crate::error::{ApprovalError, StorageError};
use crate::storage::ReplayLog;
use crate::types::{CircleId, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Requested,
    Presented,
    Approved,
    Consumed,
    Expired,
    Revoked,
}

impl TokenState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Presented => "presented",
            Self::Approved => "approved",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }
}

/// Approval token handed to one approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token_id: String,
    pub bundle_hash: String,
    pub approver: CircleId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// `apv1.` wire encoding of the token claims.
    pub wire: String,
}

/// Evidence that one approver approved one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalArtifact {
    pub token_id: String,
    pub bundle_hash: String,
    pub approver: CircleId,
    pub scopes_approved: Vec<Scope>,
    pub approved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub bundle: ApprovalBundle,
    pub threshold: u32,
    pub tokens: Vec<ApprovalToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdStatus {
    pub satisfied: bool,
    pub collected: u32,
    pub required: u32,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ApprovalEvent {
    Requested {
        bundle: ApprovalBundle,
        threshold: u32,
        tokens: Vec<ApprovalToken>,
    },
    Presented {
        token_id: String,
        at: DateTime<Utc>,
    },
    Approved {
        artifact: ApprovalArtifact,
    },
    Expired {
        token_id: String,
        at: DateTime<Utc>,
    },
    TokenRevoked {
        token_id: String,
        at: DateTime<Utc>,
    },
    BundleRevoked {
        bundle_hash: String,
        at: DateTime<Utc>,
    },
    Consumed {
        bundle_hash: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
struct TokenSlot {
    token: ApprovalToken,
    state: TokenState,
}

#[derive(Debug)]
struct BundleState {
    bundle: ApprovalBundle,
    threshold: u32,
    tokens: BTreeMap<String, TokenSlot>,
    artifacts: Vec<ApprovalArtifact>,
    revoked: bool,
    consumed: bool,
}

impl BundleState {
    fn apply(&mut self, event: &ApprovalEvent) {
        match event {
            ApprovalEvent::Requested { .. } => {}
            ApprovalEvent::Presented { token_id, .. } => {
                if let Some(slot) = self.tokens.get_mut(token_id) {
                    slot.state = TokenState::Presented;
                }
            }
            ApprovalEvent::Approved { artifact } => {
                if let Some(slot) = self.tokens.get_mut(&artifact.token_id) {
                    slot.state = TokenState::Approved;
                }
                self.artifacts.push(artifact.clone());
            }
            ApprovalEvent::Expired { token_id, .. } => {
                if let Some(slot) = self.tokens.get_mut(token_id) {
                    slot.state = TokenState::Expired;
                }
            }
            ApprovalEvent::TokenRevoked { token_id, .. } => {
                if let Some(slot) = self.tokens.get_mut(token_id) {
                    slot.state = TokenState::Revoked;
                }
            }
            ApprovalEvent::BundleRevoked { .. } => {
                self.revoked = true;
                for slot in self.tokens.values_mut() {
                    if slot.state != TokenState::Consumed {
                        slot.state = TokenState::Revoked;
                    }
                }
            }
            ApprovalEvent::Consumed { .. } => {
                self.consumed = true;
                for slot in self.tokens.values_mut() {
                    if slot.state == TokenState::Approved {
                        slot.state = TokenState::Consumed;
                    }
                }
            }
        }
    }

    fn threshold_status(&self, now: DateTime<Utc>) -> ThresholdStatus {
        let live: BTreeSet<&CircleId> = self
            .artifacts
            .iter()
            .filter(|artifact| artifact.expires_at > now)
            .filter(|artifact| {
                self.tokens
                    .get(&artifact.token_id)
                    .map(|slot| slot.state == TokenState::Approved)
                    .unwrap_or(false)
            })
            .map(|artifact| &artifact.approver)
            .collect();
        let collected = live.len() as u32;
        let usable = !self.revoked && !self.consumed;
        ThresholdStatus {
            satisfied: usable && collected >= self.threshold,
            collected,
            required: self.threshold,
            revoked: self.revoked,
        }
    }
}

/// Multi-party approval state machine.
///
/// Each bundle has its own lock; the outer maps are only held long enough to
/// find it. Every transition is written to the replay log before it is applied.
pub struct ApprovalEngine {
    bundles: Mutex<HashMap<String, Arc<Mutex<BundleState>>>>,
    token_index: Mutex<HashMap<String, String>>,
    log: ReplayLog<ApprovalEvent>,
    clock: Arc<dyn Clock>,
}

impl ApprovalEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_log(ReplayLog::memory(), clock)
    }

    pub fn with_log(log: ReplayLog<ApprovalEvent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bundles: Mutex::new(HashMap::new()),
            token_index: Mutex::new(HashMap::new()),
            log,
            clock,
        }
    }

    /// Rebuild every bundle and token state from a replay log.
    pub fn restore(log: ReplayLog<ApprovalEvent>, clock: Arc<dyn Clock>) -> Result<Self, ApprovalError> {
        let events = log.events()?;
        let engine = Self::with_log(log, clock);
        for event in events {
            match &event {
                ApprovalEvent::Requested {
                    bundle,
                    threshold,
                    tokens,
                } => engine.insert_bundle(bundle.clone(), *threshold, tokens.clone())?,
                other => {
                    let bundle_hash = match other {
                        ApprovalEvent::BundleRevoked { bundle_hash, .. }
                        | ApprovalEvent::Consumed { bundle_hash, .. } => bundle_hash.clone(),
                        ApprovalEvent::Approved { artifact } => artifact.bundle_hash.clone(),
                        ApprovalEvent::Presented { token_id, .. }
                        | ApprovalEvent::Expired { token_id, .. }
                        | ApprovalEvent::TokenRevoked { token_id, .. } => {
                            engine.bundle_hash_for(token_id)?
                        }
                        ApprovalEvent::Requested { .. } => continue,
                    };
                    let state = engine.bundle_state(&bundle_hash)?;
                    lock_bundle(&state)?.apply(other);
                }
            }
        }
        Ok(engine)
    }

    /// Issue one token per approver, all bound to the same bundle.
    pub fn request_approval(
        &self,
        bundle: ApprovalBundle,
        approvers: &[CircleId],
        threshold: u32,
        expiry_seconds: i64,
    ) -> Result<ApprovalRequest, ApprovalError> {
        check_neutral_text(bundle.wording())?;

        let approvers: BTreeSet<CircleId> = approvers.iter().cloned().collect();
        if threshold == 0 || threshold as usize > approvers.len() {
            return Err(ApprovalError::InvalidThreshold {
                threshold,
                approvers: approvers.len(),
            });
        }

        let issued_at = self.clock.now();
        let expires_at = issued_at + Duration::seconds(expiry_seconds.max(1));
        let mut tokens = Vec::with_capacity(approvers.len());
        for approver in approvers {
            let token_id = format!("tok-{}", Uuid::new_v4());
            let wire = TokenClaims {
                token_id: token_id.clone(),
                action_hash: bundle.action_hash.clone(),
                intersection_id: bundle.intersection_id.clone(),
                action_summary: bundle.summary.clone(),
                expires_at,
            }
            .encode()?;
            tokens.push(ApprovalToken {
                token_id,
                bundle_hash: bundle.bundle_hash.clone(),
                approver,
                issued_at,
                expires_at,
                wire,
            });
        }

        // Claimed before logging; a repeated request never reaches the log.
        if let Err(err) = self.insert_bundle(bundle.clone(), threshold, tokens.clone()) {
            warn!(bundle_hash = %bundle.bundle_hash, error = %err, "approval request refused");
            return Err(err);
        }
        let requested = ApprovalEvent::Requested {
            bundle: bundle.clone(),
            threshold,
            tokens: tokens.clone(),
        };
        if let Err(err) = self.log.append(&requested) {
            self.remove_bundle(&bundle.bundle_hash, &tokens)?;
            return Err(err.into());
        }

        info!(
            bundle_hash = %bundle.bundle_hash,
            envelope_id = %bundle.envelope_id,
            threshold,
            approvers = tokens.len(),
            "approval requested"
        );
        Ok(ApprovalRequest {
            bundle,
            threshold,
            tokens,
        })
    }

    /// Record that the bundle was shown to the token's approver.
    pub fn present(&self, token_id: &str) -> Result<ApprovalBundle, ApprovalError> {
        let state = self.bundle_state(&self.bundle_hash_for(token_id)?)?;
        let mut state = lock_bundle(&state)?;
        let now = self.clock.now();
        let slot = state
            .tokens
            .get(token_id)
            .cloned()
            .ok_or_else(|| ApprovalError::UnknownToken(token_id.to_string()))?;

        match slot.state {
            TokenState::Revoked => return Err(ApprovalError::Revoked),
            TokenState::Expired => return Err(ApprovalError::Expired),
            TokenState::Approved | TokenState::Consumed => return Err(ApprovalError::AlreadyUsed),
            TokenState::Presented => return Ok(state.bundle.clone()),
            TokenState::Requested => {}
        }
        if now >= slot.token.expires_at {
            self.transition(&mut state, ApprovalEvent::Expired { token_id: token_id.to_string(), at: now })?;
            return Err(ApprovalError::Expired);
        }

        self.transition(&mut state, ApprovalEvent::Presented { token_id: token_id.to_string(), at: now })?;
        debug!(token_id, approver = %slot.token.approver, "approval presented");
        Ok(state.bundle.clone())
    }

    pub fn submit_approval(
        &self,
        token_id: &str,
        approver: &CircleId,
    ) -> Result<ApprovalArtifact, ApprovalError> {
        let state = self.bundle_state(&self.bundle_hash_for(token_id)?)?;
        let mut state = lock_bundle(&state)?;
        let now = self.clock.now();
        let slot = state
            .tokens
            .get(token_id)
            .cloned()
            .ok_or_else(|| ApprovalError::UnknownToken(token_id.to_string()))?;

        if state.revoked || slot.state == TokenState::Revoked {
            return Err(ApprovalError::Revoked);
        }
        match slot.state {
            TokenState::Expired => return Err(ApprovalError::Expired),
            TokenState::Approved | TokenState::Consumed => return Err(ApprovalError::AlreadyUsed),
            _ => {}
        }
        if now >= slot.token.expires_at {
            self.transition(&mut state, ApprovalEvent::Expired { token_id: token_id.to_string(), at: now })?;
            return Err(ApprovalError::Expired);
        }
        if &slot.token.approver != approver {
            warn!(token_id, approver = %approver, "approval submitted by a circle the token was not issued to");
            return Err(ApprovalError::ApproverNotAuthorized(approver.to_string()));
        }
        if slot.state != TokenState::Presented {
            return Err(ApprovalError::NotPresented);
        }

        let artifact = ApprovalArtifact {
            token_id: token_id.to_string(),
            bundle_hash: state.bundle.bundle_hash.clone(),
            approver: approver.clone(),
            scopes_approved: state.bundle.scopes.clone(),
            approved_at: now,
            expires_at: slot.token.expires_at,
        };
        self.transition(&mut state, ApprovalEvent::Approved { artifact: artifact.clone() })?;

        info!(
            token_id,
            approver = %approver,
            bundle_hash = %artifact.bundle_hash,
            "approval recorded"
        );
        Ok(artifact)
    }

    /// Distinct approvers with live, unexpired, unrevoked artifacts.
    pub fn verify_threshold(&self, bundle_hash: &str) -> Result<ThresholdStatus, ApprovalError> {
        let state = self.bundle_state(bundle_hash)?;
        let state = lock_bundle(&state)?;
        Ok(state.threshold_status(self.clock.now()))
    }

    pub fn revoke_token(&self, token_id: &str) -> Result<(), ApprovalError> {
        let state = self.bundle_state(&self.bundle_hash_for(token_id)?)?;
        let mut state = lock_bundle(&state)?;
        let now = self.clock.now();
        if let Some(slot) = state.tokens.get(token_id) {
            if slot.state == TokenState::Consumed {
                return Err(ApprovalError::AlreadyUsed);
            }
        }
        self.transition(&mut state, ApprovalEvent::TokenRevoked { token_id: token_id.to_string(), at: now })?;
        info!(token_id, "approval token revoked");
        Ok(())
    }

    pub fn revoke_bundle(&self, bundle_hash: &str) -> Result<(), ApprovalError> {
        let state = self.bundle_state(bundle_hash)?;
        let mut state = lock_bundle(&state)?;
        if state.revoked {
            return Ok(());
        }
        let now = self.clock.now();
        self.transition(&mut state, ApprovalEvent::BundleRevoked { bundle_hash: bundle_hash.to_string(), at: now })?;
        info!(bundle_hash, "approval bundle revoked");
        Ok(())
    }

    /// Mark approvals as used once the action executed. Single use per bundle.
    pub fn consume_bundle(&self, bundle_hash: &str) -> Result<(), ApprovalError> {
        let state = self.bundle_state(bundle_hash)?;
        let mut state = lock_bundle(&state)?;
        if state.consumed {
            return Err(ApprovalError::AlreadyUsed);
        }
        let now = self.clock.now();
        self.transition(&mut state, ApprovalEvent::Consumed { bundle_hash: bundle_hash.to_string(), at: now })?;
        debug!(bundle_hash, "approval bundle consumed");
        Ok(())
    }

    pub fn bundle(&self, bundle_hash: &str) -> Result<ApprovalBundle, ApprovalError> {
        let state = self.bundle_state(bundle_hash)?;
        let state = lock_bundle(&state)?;
        Ok(state.bundle.clone())
    }

    /// Circles a token was issued to for this bundle.
    pub fn approvers(&self, bundle_hash: &str) -> Result<BTreeSet<CircleId>, ApprovalError> {
        let state = self.bundle_state(bundle_hash)?;
        let state = lock_bundle(&state)?;
        Ok(state
            .tokens
            .values()
            .map(|slot| slot.token.approver.clone())
            .collect())
    }

    pub fn token_state(&self, token_id: &str) -> Result<TokenState, ApprovalError> {
        let state = self.bundle_state(&self.bundle_hash_for(token_id)?)?;
        let state = lock_bundle(&state)?;
        state
            .tokens
            .get(token_id)
            .map(|slot| slot.state)
            .ok_or_else(|| ApprovalError::UnknownToken(token_id.to_string()))
    }

    pub fn events(&self) -> Result<Vec<ApprovalEvent>, ApprovalError> {
        Ok(self.log.events()?)
    }

    fn transition(
        &self,
        state: &mut MutexGuard<'_, BundleState>,
        event: ApprovalEvent,
    ) -> Result<(), ApprovalError> {
        self.log.append(&event)?;
        state.apply(&event);
        Ok(())
    }

    fn insert_bundle(
        &self,
        bundle: ApprovalBundle,
        threshold: u32,
        tokens: Vec<ApprovalToken>,
    ) -> Result<(), ApprovalError> {
        let bundle_hash = bundle.bundle_hash.clone();
        let mut bundles = self
            .bundles
            .lock()
            .map_err(|_| StorageError::LockPoisoned("approval bundles"))?;
        let Entry::Vacant(slot) = bundles.entry(bundle_hash.clone()) else {
            return Err(ApprovalError::DuplicateBundle(bundle_hash));
        };
        {
            let mut index = self
                .token_index
                .lock()
                .map_err(|_| StorageError::LockPoisoned("approval token index"))?;
            for token in &tokens {
                index.insert(token.token_id.clone(), bundle_hash.clone());
            }
        }
        let slots = tokens
            .into_iter()
            .map(|token| {
                (
                    token.token_id.clone(),
                    TokenSlot {
                        token,
                        state: TokenState::Requested,
                    },
                )
            })
            .collect();
        slot.insert(Arc::new(Mutex::new(BundleState {
            bundle,
            threshold,
            tokens: slots,
            artifacts: Vec::new(),
            revoked: false,
            consumed: false,
        })));
        Ok(())
    }

    fn remove_bundle(&self, bundle_hash: &str, tokens: &[ApprovalToken]) -> Result<(), ApprovalError> {
        self.bundles
            .lock()
            .map_err(|_| StorageError::LockPoisoned("approval bundles"))?
            .remove(bundle_hash);
        let mut index = self
            .token_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("approval token index"))?;
        for token in tokens {
            index.remove(&token.token_id);
        }
        Ok(())
    }

    fn bundle_hash_for(&self, token_id: &str) -> Result<String, ApprovalError> {
        self.token_index
            .lock()
            .map_err(|_| StorageError::LockPoisoned("approval token index"))?
            .get(token_id)
            .cloned()
            .ok_or_else(|| ApprovalError::UnknownToken(token_id.to_string()))
    }

    fn bundle_state(&self, bundle_hash: &str) -> Result<Arc<Mutex<BundleState>>, ApprovalError> {
        self.bundles
            .lock()
            .map_err(|_| StorageError::LockPoisoned("approval bundles"))?
            .get(bundle_hash)
            .cloned()
            .ok_or_else(|| ApprovalError::UnknownBundle(bundle_hash.to_string()))
    }
}

fn lock_bundle(state: &Arc<Mutex<BundleState>>) -> Result<MutexGuard<'_, BundleState>, ApprovalError> {
    Ok(state
        .lock()
        .map_err(|_| StorageError::LockPoisoned("approval bundle"))?)
}
