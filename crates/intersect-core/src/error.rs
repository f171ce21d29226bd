use thiserror::Error;

use crate::outcome::ExecuteResult;

/// Malformed envelope or request. Always local; nothing downstream runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("envelope carries no scopes")]
    EmptyScopes,

    #[error("mode '{0}' is not permitted on this path")]
    ModeNotPermitted(&'static str),

    #[error("write scope '{0}' is not permitted on a read path")]
    WriteScopeOnRead(String),

    #[error("write path requires at least one write scope")]
    NoWriteScope,

    #[error("write path requires an approval reference")]
    MissingApproval,

    #[error("invalid scope '{0}'")]
    InvalidScope(String),

    #[error("action hash does not match envelope contents")]
    HashMismatch,

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
}

/// Approval failures. Terminal for the token involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    #[error("unknown approval token '{0}'")]
    UnknownToken(String),

    #[error("unknown approval bundle '{0}'")]
    UnknownBundle(String),

    #[error("approval bundle '{0}' was already requested")]
    DuplicateBundle(String),

    #[error("approval token expired")]
    Expired,

    #[error("approval token already used")]
    AlreadyUsed,

    #[error("approval token was never presented to the approver")]
    NotPresented,

    #[error("circle '{0}' is not authorized to approve this bundle")]
    ApproverNotAuthorized(String),

    #[error("approval was revoked")]
    Revoked,

    #[error("bundle text contains non-neutral language: {0:?}")]
    NonNeutralLanguage(Vec<String>),

    #[error("threshold {threshold} cannot be met by {approvers} approvers")]
    InvalidThreshold { threshold: u32, approvers: usize },

    #[error("malformed approval token: {0}")]
    WireFormat(String),

    #[error("approval storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ApprovalError {
    /// Stable machine-readable code surfaced next to the human-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownToken(_) => "unknown_token",
            Self::UnknownBundle(_) => "unknown_bundle",
            Self::DuplicateBundle(_) => "duplicate_bundle",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already_used",
            Self::NotPresented => "not_presented",
            Self::ApproverNotAuthorized(_) => "approver_not_authorized",
            Self::Revoked => "revoked",
            Self::NonNeutralLanguage(_) => "non_neutral_language",
            Self::InvalidThreshold { .. } => "invalid_threshold",
            Self::WireFormat(_) => "wire_format",
            Self::Storage(_) => "storage",
        }
    }
}

/// Contract registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("contract version {offered} for '{intersection_id}' is not newer than {current}")]
    StaleVersion {
        intersection_id: String,
        current: u64,
        offered: u64,
    },

    #[error("contract for '{0}' has no parties")]
    NoParties(String),

    #[error("contract registry storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Cap and rate failures. Hard blocks: the amount is never adjusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapError {
    #[error("daily cap exceeded for {scope_key}: {attempted_minor} {currency} over limit {limit_minor}")]
    CapExceeded {
        scope_key: String,
        currency: String,
        limit_minor: u64,
        attempted_minor: u64,
    },

    #[error("attempt rate limit reached for {scope_key}: {max_attempts} per day")]
    RateLimited { scope_key: String, max_attempts: u32 },

    #[error("caps storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Idempotency conflicts. Not business failures.
#[derive(Debug, Clone, Error)]
pub enum ReserveError {
    #[error("an attempt is already in flight for envelope '{envelope_id}'")]
    InFlight { envelope_id: String },

    #[error("attempt already reached a terminal state")]
    AlreadyTerminal(Box<ExecuteResult>),

    #[error("idempotency storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Connector failures. Variants carry categories, never raw provider text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("no connector registered for domain '{0}'")]
    NotFound(String),

    #[error("provider unavailable")]
    Unavailable,

    #[error("provider rejected the request ({code})")]
    Rejected { code: String },

    #[error("provider call exceeded its deadline")]
    Timeout,

    #[error("operation not supported by connector")]
    Unsupported,

    #[error("access token could not be minted: {0}")]
    Token(#[from] TokenError),
}

impl ConnectorError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unavailable => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::Timeout => "timeout",
            Self::Unsupported => "unsupported",
            Self::Token(_) => "token",
        }
    }
}

/// Access token minting failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("authorization proof does not authorize this action")]
    ProofNotAuthorized,

    #[error("authorization proof does not belong to this envelope")]
    ProofMismatch,

    #[error("scope '{0}' is not present in the authorization proof")]
    ScopeNotInProof(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("scope '{scope}' has no mapping for provider '{provider}'")]
    UnknownScope { provider: String, scope: String },
}

/// Persistence failures for audit and replay logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Pipeline errors that are not business outcomes.
///
/// Denials, blocks and connector failures are returned as `ExecuteResult` values;
/// this enum only covers idempotency conflicts and infrastructure failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("an attempt is already in flight for envelope '{envelope_id}'")]
    InFlight { envelope_id: String },

    #[error("envelope stage violation: expected '{expected}', got '{actual}'")]
    StageViolation {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("audit sink failure: {0}")]
    Audit(StorageError),

    #[error("ledger failure: {0}")]
    Ledger(#[from] StorageError),

    #[error("approval failure: {0}")]
    Approval(#[from] ApprovalError),

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
}

impl PipelineError {
    pub fn stage_violation(expected: &'static str, actual: &'static str) -> Self {
        Self::StageViolation { expected, actual }
    }
}
