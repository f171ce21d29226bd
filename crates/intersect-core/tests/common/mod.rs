#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use intersect_core::approval::ApprovalRequest;
use intersect_core::audit::{AuditSink, MemoryAuditSink};
use intersect_core::authority::{AuthorityEngine, ContractRegistry};
use intersect_core::clock::{Clock, ManualClock};
use intersect_core::config::PipelineConfig;
use intersect_core::connector::{Connector, ConnectorPayload, Receipt, ReceiptStatus};
use intersect_core::envelope::{ApprovalReference, ExecutionEnvelope};
use intersect_core::error::{ConnectorError, StorageError};
use intersect_core::pipeline::{Pipeline, PipelineBuilder, PrepareRequest, SettlementStore};
use intersect_core::types::{Action, ApprovalPolicy, CircleId, Contract, Mode, Scope};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scriptable connector that counts calls.
pub struct ScriptedConnector {
    domain: &'static str,
    money_moved: bool,
    delay: Option<Duration>,
    failure: Option<ConnectorError>,
    prepare_failure: Option<ConnectorError>,
    rollback_failure: Option<ConnectorError>,
    prepares: AtomicU32,
    executions: AtomicU32,
    rollbacks: AtomicU32,
}

impl ScriptedConnector {
    pub fn payments() -> Self {
        Self::new("payment", true)
    }

    pub fn calendar() -> Self {
        Self::new("calendar", false)
    }

    fn new(domain: &'static str, money_moved: bool) -> Self {
        Self {
            domain,
            money_moved,
            delay: None,
            failure: None,
            prepare_failure: None,
            rollback_failure: None,
            prepares: AtomicU32::new(0),
            executions: AtomicU32::new(0),
            rollbacks: AtomicU32::new(0),
        }
    }

    pub fn sandboxed(mut self) -> Self {
        self.money_moved = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, error: ConnectorError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn failing_prepare(mut self, error: ConnectorError) -> Self {
        self.prepare_failure = Some(error);
        self
    }

    pub fn failing_rollback(mut self, error: ConnectorError) -> Self {
        self.rollback_failure = Some(error);
        self
    }

    pub fn prepares(&self) -> u32 {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u32 {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn receipt(&self, external_id: String, status: ReceiptStatus, money_moved: bool) -> Receipt {
        Receipt {
            provider: format!("{}-scripted", self.domain),
            external_id,
            status,
            occurred_at: Utc::now(),
            money_moved,
            metadata: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn provider(&self) -> &str {
        match self.domain {
            "payment" => "payment-scripted",
            _ => "calendar-scripted",
        }
    }

    fn domain(&self) -> &str {
        self.domain
    }

    async fn prepare(&self, envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError> {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.prepare_failure {
            return Err(error.clone());
        }
        Ok(self.receipt(
            format!("dry-{}", envelope.envelope_id()),
            ReceiptStatus::Prepared,
            false,
        ))
    }

    async fn execute(
        &self,
        _envelope: &ExecutionEnvelope,
        payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self.receipt(
            format!("ext-{}", payload.idempotency_key),
            ReceiptStatus::Completed,
            self.money_moved,
        ))
    }

    async fn rollback(&self, receipt: &Receipt) -> Result<Receipt, ConnectorError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.rollback_failure {
            return Err(error.clone());
        }
        Ok(self.receipt(receipt.external_id.clone(), ReceiptStatus::Reversed, false))
    }
}

/// Settlement store whose writes always fail.
pub struct BrokenSettlementStore;

#[async_trait]
impl SettlementStore for BrokenSettlementStore {
    async fn record_settlement(
        &self,
        _envelope: &ExecutionEnvelope,
        _attempt_key: &str,
        _receipt: &Receipt,
    ) -> Result<(), StorageError> {
        Err(StorageError::Database("settlement table unavailable".to_string()))
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub contracts: Arc<ContractRegistry>,
    pub authority: Arc<AuthorityEngine>,
    pub audit: Arc<MemoryAuditSink>,
}

/// Log output for failing tests, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    pub fn new(contract: Contract) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let contracts = Arc::new(ContractRegistry::new());
        contracts.register(contract).unwrap();
        let authority = Arc::new(AuthorityEngine::new(
            Arc::clone(&contracts),
            clock.clone() as Arc<dyn Clock>,
        ));
        Self {
            clock,
            contracts,
            authority,
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }

    pub fn builder(&self, config: PipelineConfig) -> PipelineBuilder {
        Pipeline::builder(
            config,
            Arc::clone(&self.authority),
            self.audit.clone() as Arc<dyn AuditSink>,
            self.clock.clone() as Arc<dyn Clock>,
        )
    }

    pub fn pipeline(&self, connector: Arc<ScriptedConnector>) -> Pipeline {
        self.builder(fast_config())
            .connector(connector)
            .build()
            .unwrap()
    }

    pub fn approved_by(&self, envelope: &ExecutionEnvelope, approver: &str) -> ExecutionEnvelope {
        envelope
            .with_approval(
                ApprovalReference::Human {
                    approver: CircleId::new(approver),
                    approved_at: self.clock.now(),
                },
                self.clock.now(),
            )
            .unwrap()
    }

    pub async fn event_types(&self, trace_id: &str) -> Vec<String> {
        self.audit
            .query(trace_id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.event.event_type)
            .collect()
    }
}

/// Defaults with a pause short enough for tests.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        forced_pause_ms: 20,
        default_deadline_ms: 2_000,
        ..PipelineConfig::default()
    }
}

pub fn alice() -> CircleId {
    CircleId::new("alice")
}

pub fn bob() -> CircleId {
    CircleId::new("bob")
}

pub fn carol() -> CircleId {
    CircleId::new("carol")
}

pub fn payment_contract() -> Contract {
    Contract::new("ix-1", 1, vec![alice(), bob()])
        .with_scope(Scope::read("finance"))
        .with_scope(Scope::write("finance"))
}

pub fn shared_payment_contract(threshold: u32) -> Contract {
    payment_contract().with_approval_policy(ApprovalPolicy::Multi { threshold })
}

pub fn calendar_contract() -> Contract {
    Contract::new("ix-cal", 1, vec![alice(), bob()])
        .with_scope(Scope::read("calendar"))
        .with_scope(Scope::write("calendar"))
}

pub fn transfer(amount_minor: u64) -> Action {
    Action::transfer("ix-1", amount_minor, "GBP", "P1")
}

pub fn write_request(action: Action, actor: CircleId) -> PrepareRequest {
    PrepareRequest::new(action, actor, vec![Scope::write("finance")], Mode::Execute)
}

/// Present and approve every token of `request` as its own approver.
pub fn approve_all(
    pipeline: &Pipeline,
    request: &ApprovalRequest,
    envelope: &ExecutionEnvelope,
    now: chrono::DateTime<Utc>,
) -> ExecutionEnvelope {
    for token in &request.tokens {
        pipeline.approvals().present(&token.token_id).unwrap();
        pipeline
            .approvals()
            .submit_approval(&token.token_id, &token.approver)
            .unwrap();
    }
    envelope
        .with_approval(
            ApprovalReference::Bundle {
                bundle_hash: request.bundle.bundle_hash.clone(),
            },
            now,
        )
        .unwrap()
}
