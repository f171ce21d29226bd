use crate::error::PipelineError;
use crate::outcome::SettlementState;

/// Lifecycle stages of one envelope attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeStage {
    Sealed,
    Authorized,
    ApprovalPending,
    CapsChecked,
    Reserved,
    Executing,
    SettledSuccess,
    SettledBlocked,
    SettledFailed,
}

impl EnvelopeStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sealed => "sealed",
            Self::Authorized => "authorized",
            Self::ApprovalPending => "approval_pending",
            Self::CapsChecked => "caps_checked",
            Self::Reserved => "reserved",
            Self::Executing => "executing",
            Self::SettledSuccess => "settled_success",
            Self::SettledBlocked => "settled_blocked",
            Self::SettledFailed => "settled_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::SettledSuccess | Self::SettledBlocked | Self::SettledFailed
        )
    }
}

/// Enforces sealed -> authorized -> [approval_pending] -> caps_checked ->
/// reserved -> executing -> settled ordering.
///
/// Blocked and failed settlements may happen from any open stage; success only
/// after execution.
#[derive(Debug, Clone)]
pub struct EnvelopeStageMachine {
    envelope_id: String,
    stage: EnvelopeStage,
}

impl EnvelopeStageMachine {
    pub fn new(envelope_id: impl Into<String>) -> Self {
        Self {
            envelope_id: envelope_id.into(),
            stage: EnvelopeStage::Sealed,
        }
    }

    pub fn envelope_id(&self) -> &str {
        &self.envelope_id
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn mark_authorized(&mut self) -> Result<(), PipelineError> {
        self.advance(&[EnvelopeStage::Sealed], EnvelopeStage::Authorized)
    }

    pub fn mark_approval_pending(&mut self) -> Result<(), PipelineError> {
        self.advance(&[EnvelopeStage::Authorized], EnvelopeStage::ApprovalPending)
    }

    pub fn mark_caps_checked(&mut self) -> Result<(), PipelineError> {
        self.advance(
            &[EnvelopeStage::Authorized, EnvelopeStage::ApprovalPending],
            EnvelopeStage::CapsChecked,
        )
    }

    pub fn mark_reserved(&mut self) -> Result<(), PipelineError> {
        self.advance(&[EnvelopeStage::CapsChecked], EnvelopeStage::Reserved)
    }

    pub fn mark_executing(&mut self) -> Result<(), PipelineError> {
        self.advance(&[EnvelopeStage::Reserved], EnvelopeStage::Executing)
    }

    /// `suggest_only` settles straight from authorization; nothing is reserved.
    pub fn mark_suggested(&mut self) -> Result<(), PipelineError> {
        self.advance(&[EnvelopeStage::Authorized], EnvelopeStage::SettledSuccess)
    }

    pub fn settle(&mut self, state: SettlementState) -> Result<EnvelopeStage, PipelineError> {
        let next = match state {
            SettlementState::SettledSuccess => EnvelopeStage::SettledSuccess,
            SettlementState::SettledBlocked => EnvelopeStage::SettledBlocked,
            SettlementState::SettledFailed => EnvelopeStage::SettledFailed,
        };
        if self.stage.is_terminal() {
            return Err(PipelineError::stage_violation("open stage", self.stage.name()));
        }
        if next == EnvelopeStage::SettledSuccess && self.stage != EnvelopeStage::Executing {
            return Err(PipelineError::stage_violation(
                EnvelopeStage::Executing.name(),
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(next)
    }

    fn advance(
        &mut self,
        allowed: &[EnvelopeStage],
        next: EnvelopeStage,
    ) -> Result<(), PipelineError> {
        if !allowed.contains(&self.stage) {
            return Err(PipelineError::stage_violation(
                allowed[0].name(),
                self.stage.name(),
            ));
        }
        self.stage = next;
        Ok(())
    }
}
