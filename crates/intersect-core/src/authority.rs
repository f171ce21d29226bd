//! Contract registry and the authority engine that turns a contract plus
//! requested scopes into an [`AuthorizationProof`].
//!
//! Denial is a value: `authorize_action` only fails on infrastructure errors
//! (a poisoned lock), never because the action is not permitted.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ContractError, StorageError};
use crate::outcome::BlockReason;
use crate::types::{
    Action, Ceiling, CircleId, Contract, IntersectionId, Mode, Scope, DOMAIN_CALENDAR, DOMAIN_PAYMENT,
};

/// Versioned contracts per intersection. Versions must strictly increase.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<IntersectionId, BTreeMap<u64, Contract>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, contract: Contract) -> Result<(), ContractError> {
        if contract.parties.is_empty() {
            return Err(ContractError::NoParties(
                contract.intersection_id.to_string(),
            ));
        }

        let mut contracts = self
            .contracts
            .write()
            .map_err(|_| StorageError::LockPoisoned("contract registry"))?;
        let versions = contracts
            .entry(contract.intersection_id.clone())
            .or_default();

        if let Some((&current, _)) = versions.last_key_value() {
            if contract.version <= current {
                return Err(ContractError::StaleVersion {
                    intersection_id: contract.intersection_id.to_string(),
                    current,
                    offered: contract.version,
                });
            }
        }

        info!(
            intersection_id = %contract.intersection_id,
            version = contract.version,
            "contract registered"
        );
        versions.insert(contract.version, contract);
        Ok(())
    }

    /// Version currently in force.
    pub fn current(&self, intersection_id: &IntersectionId) -> Result<Option<Contract>, StorageError> {
        let contracts = self
            .contracts
            .read()
            .map_err(|_| StorageError::LockPoisoned("contract registry"))?;
        Ok(contracts
            .get(intersection_id)
            .and_then(|versions| versions.last_key_value())
            .map(|(_, contract)| contract.clone()))
    }

    pub fn version(
        &self,
        intersection_id: &IntersectionId,
        version: u64,
    ) -> Result<Option<Contract>, StorageError> {
        let contracts = self
            .contracts
            .read()
            .map_err(|_| StorageError::LockPoisoned("contract registry"))?;
        Ok(contracts
            .get(intersection_id)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ScopeNotGranted,
    CeilingExceeded,
    ContractNotFound,
    ActorNotParty,
}

impl DenialReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::ScopeNotGranted => "scope_not_granted",
            Self::CeilingExceeded => "ceiling_exceeded",
            Self::ContractNotFound => "contract_not_found",
            Self::ActorNotParty => "actor_not_party",
        }
    }

    pub fn block_reason(self) -> BlockReason {
        match self {
            Self::ScopeNotGranted => BlockReason::ScopeNotGranted,
            Self::CeilingExceeded => BlockReason::CeilingExceeded,
            Self::ContractNotFound => BlockReason::ContractNotFound,
            Self::ActorNotParty => BlockReason::ActorNotParty,
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of an authorization decision, bound to the contract version in force.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationProof {
    pub proof_id: String,
    pub authorized: bool,
    pub intersection_id: IntersectionId,
    /// Zero when no contract was found.
    pub contract_version: u64,
    pub actor_circle_id: CircleId,
    pub action_id: String,
    pub action_type: String,
    pub mode: Mode,
    pub trace_id: String,
    pub scopes_requested: Vec<Scope>,
    pub scopes_granted: Vec<Scope>,
    pub denial_reason: Option<DenialReason>,
    pub denial_detail: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl AuthorizationProof {
    pub fn covers(&self, scope: &Scope) -> bool {
        self.authorized && self.scopes_granted.contains(scope)
    }
}

/// Issues authorization proofs and keeps them retrievable by id.
pub struct AuthorityEngine {
    contracts: Arc<ContractRegistry>,
    proofs: RwLock<HashMap<String, AuthorizationProof>>,
    required_scopes: HashMap<String, Vec<Scope>>,
    clock: Arc<dyn Clock>,
}

impl AuthorityEngine {
    pub fn new(contracts: Arc<ContractRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            contracts,
            proofs: RwLock::new(HashMap::new()),
            required_scopes: HashMap::new(),
            clock,
        }
    }

    /// Restrict `action_type` to the listed scopes. Requests for anything else are denied.
    pub fn with_action_scopes(mut self, action_type: impl Into<String>, scopes: Vec<Scope>) -> Self {
        self.required_scopes.insert(action_type.into(), scopes);
        self
    }

    pub fn contracts(&self) -> &Arc<ContractRegistry> {
        &self.contracts
    }

    pub fn authorize_action(
        &self,
        action: &Action,
        actor: &CircleId,
        scopes_requested: &[Scope],
        mode: Mode,
        trace_id: &str,
    ) -> Result<AuthorizationProof, StorageError> {
        let mut scopes_requested = scopes_requested.to_vec();
        scopes_requested.sort();
        scopes_requested.dedup();

        let contract = self.contracts.current(action.intersection_id())?;
        let decision = match &contract {
            None => Err((
                DenialReason::ContractNotFound,
                format!("no contract for intersection '{}'", action.intersection_id()),
            )),
            Some(contract) => self.evaluate(contract, action, actor, &scopes_requested),
        };

        let (authorized, scopes_granted, denial_reason, denial_detail) = match decision {
            Ok(()) => (true, scopes_requested.clone(), None, None),
            Err((reason, detail)) => (false, Vec::new(), Some(reason), Some(detail)),
        };

        let proof = AuthorizationProof {
            proof_id: format!("proof-{}", Uuid::new_v4()),
            authorized,
            intersection_id: action.intersection_id().clone(),
            contract_version: contract.as_ref().map(|c| c.version).unwrap_or(0),
            actor_circle_id: actor.clone(),
            action_id: action.action_id().to_string(),
            action_type: action.action_type().to_string(),
            mode,
            trace_id: trace_id.to_string(),
            scopes_requested,
            scopes_granted,
            denial_reason,
            denial_detail,
            issued_at: self.clock.now(),
        };

        if proof.authorized {
            info!(
                trace_id,
                proof_id = %proof.proof_id,
                intersection_id = %proof.intersection_id,
                contract_version = proof.contract_version,
                "action authorized"
            );
        } else {
            info!(
                trace_id,
                proof_id = %proof.proof_id,
                intersection_id = %proof.intersection_id,
                reason = ?proof.denial_reason,
                "action denied"
            );
        }

        self.proofs
            .write()
            .map_err(|_| StorageError::LockPoisoned("proof store"))?
            .insert(proof.proof_id.clone(), proof.clone());

        Ok(proof)
    }

    pub fn proof(&self, proof_id: &str) -> Result<Option<AuthorizationProof>, StorageError> {
        Ok(self
            .proofs
            .read()
            .map_err(|_| StorageError::LockPoisoned("proof store"))?
            .get(proof_id)
            .cloned())
    }

    /// Drop proofs issued before `cutoff`. Envelopes bound to a dropped proof
    /// fail re-verification from then on. Returns how many were dropped.
    pub fn prune_proofs(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut proofs = self
            .proofs
            .write()
            .map_err(|_| StorageError::LockPoisoned("proof store"))?;
        let before = proofs.len();
        proofs.retain(|_, proof| proof.issued_at >= cutoff);
        let dropped = before - proofs.len();
        if dropped > 0 {
            debug!(dropped, cutoff = %cutoff, "pruned authorization proofs");
        }
        Ok(dropped)
    }

    fn evaluate(
        &self,
        contract: &Contract,
        action: &Action,
        actor: &CircleId,
        scopes: &[Scope],
    ) -> Result<(), (DenialReason, String)> {
        if !contract.is_party(actor) {
            return Err((
                DenialReason::ActorNotParty,
                format!("circle '{}' is not a party to the contract", actor),
            ));
        }

        if scopes.is_empty() {
            return Err((
                DenialReason::ScopeNotGranted,
                "no scopes requested".to_string(),
            ));
        }

        if let Some(scope) = scopes.iter().find(|scope| !contract.grants(scope)) {
            return Err((
                DenialReason::ScopeNotGranted,
                format!("scope '{}' is not granted", scope),
            ));
        }

        if let Some(allowed) = self.required_scopes.get(action.action_type()) {
            if let Some(scope) = scopes.iter().find(|scope| !allowed.contains(scope)) {
                return Err((
                    DenialReason::ScopeNotGranted,
                    format!(
                        "scope '{}' is not applicable to '{}'",
                        scope,
                        action.action_type()
                    ),
                ));
            }
        }

        if let Err(detail) = check_action_shape(action) {
            debug!(action_id = action.action_id(), detail = %detail, "action shape rejected");
            return Err((DenialReason::CeilingExceeded, detail));
        }

        for ceiling in &contract.ceilings {
            if let Err(detail) = check_ceiling(ceiling, action) {
                debug!(action_id = action.action_id(), ceiling = ?ceiling, "ceiling check failed");
                return Err((DenialReason::CeilingExceeded, detail));
            }
        }

        Ok(())
    }
}

/// Payments need an amount, a currency and a payee; calendar actions need a
/// well-formed window. Ceilings cannot judge an action missing these.
pub fn check_action_shape(action: &Action) -> Result<(), String> {
    match action.domain() {
        DOMAIN_PAYMENT => {
            match action.money() {
                Some(money) if money.amount_minor > 0 && !money.currency.trim().is_empty() => {}
                _ => return Err("payment needs a positive amount_minor and a currency".to_string()),
            }
            match action.payee() {
                Some(payee) if !payee.trim().is_empty() => Ok(()),
                _ => Err("payment needs a payee".to_string()),
            }
        }
        DOMAIN_CALENDAR => match action.event_window() {
            Some((start, end)) if end > start => Ok(()),
            Some(_) => Err("event ends before it starts".to_string()),
            None => Err("event needs a valid start and end".to_string()),
        },
        _ => Ok(()),
    }
}

/// Check one ceiling. A ceiling only passes an action of its own domain when
/// the fields it constrains are present.
pub fn check_ceiling(ceiling: &Ceiling, action: &Action) -> Result<(), String> {
    match ceiling {
        Ceiling::TimeWindow {
            start_hour,
            end_hour,
        } => {
            if action.domain() != DOMAIN_CALENDAR {
                return Ok(());
            }
            let (start, end) = action
                .event_window()
                .ok_or_else(|| "event window missing or unparseable".to_string())?;
            let end_minutes = end.hour() * 60 + end.minute();
            let fits = start.date_naive() == end.date_naive()
                && start.hour() >= *start_hour
                && end_minutes <= end_hour * 60
                && (end.second() == 0 || end_minutes < end_hour * 60);
            if fits {
                Ok(())
            } else {
                Err(format!(
                    "event must fall within {:02}:00-{:02}:00 UTC",
                    start_hour, end_hour
                ))
            }
        }
        Ceiling::MaxEventMinutes { minutes } => {
            if action.domain() != DOMAIN_CALENDAR {
                return Ok(());
            }
            let (start, end) = action
                .event_window()
                .ok_or_else(|| "event window missing or unparseable".to_string())?;
            let duration = (end - start).num_minutes();
            if end <= start {
                Err("event ends before it starts".to_string())
            } else if duration > *minutes {
                Err(format!(
                    "event lasts {} minutes, limit is {}",
                    duration, minutes
                ))
            } else {
                Ok(())
            }
        }
        Ceiling::MaxAmount {
            currency,
            amount_minor,
        } => {
            if action.domain() != DOMAIN_PAYMENT {
                return Ok(());
            }
            let money = action
                .money()
                .ok_or_else(|| "amount missing or unparseable".to_string())?;
            if &money.currency == currency && money.amount_minor > *amount_minor {
                Err(format!(
                    "amount {} exceeds single-action ceiling of {} minor units",
                    money, amount_minor
                ))
            } else {
                Ok(())
            }
        }
        Ceiling::PayeeAllowlist { payees } => {
            if action.domain() != DOMAIN_PAYMENT {
                return Ok(());
            }
            match action.payee() {
                Some(payee) if payees.iter().any(|allowed| allowed == payee) => Ok(()),
                Some(payee) => Err(format!("payee '{}' is not on the allowlist", payee)),
                None => Err("payee missing; allowlist cannot be checked".to_string()),
            }
        }
    }
}
