//! Action execution core for circles acting across intersections.
//!
//! Every external write passes through sealed envelopes, contract-bound
//! authorization proofs, multi-party approvals, caps, an idempotency ledger and
//! a hash-chained audit log before a connector is allowed to touch the world.

#![deny(unsafe_code)]

pub mod approval;
pub mod audit;
pub mod authority;
pub mod caps;
pub mod clock;
pub mod config;
pub mod connector;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod idempotency;
pub mod outcome;
pub mod pipeline;
pub mod scopes;
pub mod storage;
pub mod token;
pub mod types;

pub use approval::{
    ApprovalArtifact, ApprovalBundle, ApprovalEngine, ApprovalEvent, ApprovalRequest,
    ApprovalToken, ThresholdStatus, TokenClaims, TokenState,
};
pub use audit::{AuditChain, AuditEntry, AuditEvent, AuditSink, MemoryAuditSink};
pub use authority::{AuthorityEngine, AuthorizationProof, ContractRegistry, DenialReason};
pub use caps::{CapAdmission, CapLimits, CapRecord, CapScope, CapsConfig, CapsEvent, CapsLedger};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApprovalConfig, PipelineConfig};
pub use connector::{
    Connector, ConnectorPayload, ConnectorRegistry, ReadQuery, Reader, Receipt, ReceiptStatus,
};
pub use envelope::{seal, ApprovalReference, ExecutionEnvelope, SealParams};
pub use error::{
    ApprovalError, CapError, ConfigError, ConnectorError, ContractError, PipelineError,
    ReserveError, StorageError, TokenError, ValidationError,
};
pub use flow::{EnvelopeStage, EnvelopeStageMachine};
pub use idempotency::{
    attempt_key, AttemptRecord, AttemptState, IdempotencyEvent, IdempotencyLedger, Reservation,
};
pub use outcome::{BlockReason, ExecuteResult, SettlementState};
pub use pipeline::{
    ExecuteRequest, MemorySettlementStore, Pipeline, PipelineBuilder, PrepareRequest, Prepared,
    Revocation, SettlementRecord, SettlementStore,
};
pub use scopes::{ScopeRegistry, UnknownScopePolicy};
pub use storage::{AuditStorageConfig, PersistentAuditSink, ReplayLog};
pub use token::{check_mint_request, AccessToken, TokenProvider};
pub use types::{
    Action, ApprovalPolicy, Ceiling, CircleId, Contract, IntersectionId, Mode, Money, Scope,
    ScopeDirection,
};
