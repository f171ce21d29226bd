use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connector::Receipt;
use crate::types::Mode;

/// Terminal state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementState {
    SettledSuccess,
    SettledBlocked,
    SettledFailed,
}

impl SettlementState {
    pub fn name(self) -> &'static str {
        match self {
            Self::SettledSuccess => "settled_success",
            Self::SettledBlocked => "settled_blocked",
            Self::SettledFailed => "settled_failed",
        }
    }
}

/// Why an attempt did not settle successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ValidationFailed,
    ContractNotFound,
    ScopeNotGranted,
    CeilingExceeded,
    ActorNotParty,
    ContractVersionMismatch,
    ProofInvalid,
    ApprovalMissing,
    ApprovalThresholdUnmet,
    Revoked,
    CapExceeded,
    RateLimited,
    ConnectorUnavailable,
    ConnectorFailed,
    ConnectorTimeout,
    SettlementFailed,
}

impl BlockReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::ValidationFailed => "validation_failed",
            Self::ContractNotFound => "contract_not_found",
            Self::ScopeNotGranted => "scope_not_granted",
            Self::CeilingExceeded => "ceiling_exceeded",
            Self::ActorNotParty => "actor_not_party",
            Self::ContractVersionMismatch => "contract_version_mismatch",
            Self::ProofInvalid => "proof_invalid",
            Self::ApprovalMissing => "approval_missing",
            Self::ApprovalThresholdUnmet => "approval_threshold_unmet",
            Self::Revoked => "revoked",
            Self::CapExceeded => "cap_exceeded",
            Self::RateLimited => "rate_limited",
            Self::ConnectorUnavailable => "connector_unavailable",
            Self::ConnectorFailed => "connector_failed",
            Self::ConnectorTimeout => "connector_timeout",
            Self::SettlementFailed => "settlement_failed",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of `Pipeline::execute`, also stored per attempt key for replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub envelope_id: String,
    pub trace_id: String,
    pub attempt_key: Option<String>,
    pub mode: Mode,
    pub state: SettlementState,
    pub block_reason: Option<BlockReason>,
    /// Human-readable reason. Never contains provider error text.
    pub message: String,
    pub receipt: Option<Receipt>,
    pub money_moved: bool,
    pub rolled_back: bool,
    pub rollback_failure: Option<String>,
}

impl ExecuteResult {
    pub fn is_success(&self) -> bool {
        self.state == SettlementState::SettledSuccess
    }
}
