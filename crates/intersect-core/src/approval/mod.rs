//! Multi-party approvals: neutral bundles, single-use time-boxed tokens and
//! threshold verification.

pub mod bundle;
pub mod engine;
pub mod wire;

pub use bundle::{check_neutral_text, coercive_terms, ApprovalBundle};
pub use engine::{
    ApprovalArtifact, ApprovalEngine, ApprovalEvent, ApprovalRequest, ApprovalToken,
    ThresholdStatus, TokenState,
};
pub use wire::{TokenClaims, TOKEN_PREFIX};
