use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use intersect_adapters::{
    CalendarStore, FixtureBankConnector, FixtureCalendarConnector, ScopedTokenBroker,
};
use intersect_core::audit::{AuditSink, MemoryAuditSink};
use intersect_core::authority::{AuthorityEngine, ContractRegistry};
use intersect_core::clock::{Clock, ManualClock};
use intersect_core::config::PipelineConfig;
use intersect_core::connector::ReadQuery;
use intersect_core::envelope::ApprovalReference;
use intersect_core::outcome::{BlockReason, SettlementState};
use intersect_core::pipeline::{ExecuteRequest, Pipeline, PrepareRequest};
use intersect_core::scopes::{ScopeRegistry, UnknownScopePolicy};
use intersect_core::types::{Action, ApprovalPolicy, CircleId, Contract, Mode, Scope};
use std::sync::Arc;

struct World {
    clock: Arc<ManualClock>,
    audit: Arc<MemoryAuditSink>,
    authority: Arc<AuthorityEngine>,
}

impl World {
    fn new(contracts: Vec<Contract>) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let registry = Arc::new(ContractRegistry::new());
        for contract in contracts {
            registry.register(contract).unwrap();
        }
        Self {
            authority: Arc::new(AuthorityEngine::new(registry, clock.clone() as Arc<dyn Clock>)),
            audit: Arc::new(MemoryAuditSink::new()),
            clock,
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            forced_pause_ms: 25,
            ..PipelineConfig::default()
        }
    }

    fn broker(&self, registry: ScopeRegistry) -> Arc<ScopedTokenBroker> {
        Arc::new(ScopedTokenBroker::new(
            registry,
            ChronoDuration::minutes(5),
            self.clock.clone() as Arc<dyn Clock>,
        ))
    }

    fn pipeline(&self) -> intersect_core::pipeline::PipelineBuilder {
        Pipeline::builder(
            Self::config(),
            Arc::clone(&self.authority),
            self.audit.clone() as Arc<dyn AuditSink>,
            self.clock.clone() as Arc<dyn Clock>,
        )
    }
}

fn shared_budget() -> Contract {
    Contract::new("ix-household", 1, vec![CircleId::new("alice"), CircleId::new("bob")])
        .with_scope(Scope::write("finance"))
        .with_scope(Scope::read("finance"))
        .with_approval_policy(ApprovalPolicy::Multi { threshold: 2 })
}

#[tokio::test]
async fn two_of_two_sandbox_payment_settles_without_moving_money() {
    let world = World::new(vec![shared_budget()]);
    let bank = Arc::new(FixtureBankConnector::sandbox("bank-sandbox"));
    let scopes = ScopeRegistry::new(UnknownScopePolicy::Reject).with_mapping(
        "bank-sandbox",
        Scope::write("finance"),
        &["payments:initiate"],
    );
    let pipeline = world
        .pipeline()
        .connector(bank.clone())
        .token_provider(world.broker(scopes))
        .build()
        .unwrap();

    let prepared = pipeline
        .prepare(PrepareRequest::new(
            Action::transfer("ix-household", 100, "GBP", "P1"),
            "alice",
            vec![Scope::write("finance")],
            Mode::Execute,
        ))
        .await
        .unwrap();
    assert!(prepared.proof.authorized);

    let request = pipeline
        .request_approval(
            &prepared.envelope,
            &[CircleId::new("alice"), CircleId::new("bob")],
        )
        .await
        .unwrap();
    assert_eq!(request.threshold, 2);
    assert!(request.tokens.iter().all(|token| token.wire.starts_with("apv1.")));

    for token in &request.tokens {
        let bundle = pipeline.approvals().present(&token.token_id).unwrap();
        assert!(bundle.summary.contains("1.00 GBP"));
        assert!(bundle.summary.contains("P1"));
        pipeline
            .approvals()
            .submit_approval(&token.token_id, &token.approver)
            .unwrap();
    }

    let envelope = prepared
        .envelope
        .with_approval(
            ApprovalReference::Bundle {
                bundle_hash: request.bundle.bundle_hash.clone(),
            },
            world.clock.now(),
        )
        .unwrap();
    let result = pipeline.execute(ExecuteRequest::new(envelope)).await.unwrap();

    assert_eq!(result.state, SettlementState::SettledSuccess);
    assert!(!result.money_moved);
    let receipt = result.receipt.as_ref().expect("receipt recorded");
    assert_eq!(receipt.provider, "bank-sandbox");
    assert_eq!(bank.transfers().len(), 1);
    assert_eq!(bank.transfers()[0].money.amount_minor, 100);

    let events: Vec<String> = world
        .audit
        .query(&result.trace_id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.event.event_type)
        .collect();
    for stage in [
        "sealed",
        "approval_requested",
        "approval_checked",
        "reserved",
        "forced_pause_started",
        "prepared",
        "executing",
        "settled_success",
    ] {
        assert!(events.iter().any(|e| e == stage), "missing {stage}");
    }
    assert!(world.audit.verify_chain().unwrap());
}

#[tokio::test]
async fn unmapped_scope_blocks_before_the_provider_is_called() {
    let world = World::new(vec![shared_budget()
        .with_approval_policy(ApprovalPolicy::Single)]);
    let bank = Arc::new(FixtureBankConnector::live("bank-live"));
    let pipeline = world
        .pipeline()
        .connector(bank.clone())
        .token_provider(world.broker(ScopeRegistry::new(UnknownScopePolicy::Reject)
            .with_mapping("bank-live", Scope::read("finance"), &["accounts:read"])))
        .build()
        .unwrap();

    let prepared = pipeline
        .prepare(PrepareRequest::new(
            Action::transfer("ix-household", 100, "GBP", "P1"),
            "alice",
            vec![Scope::write("finance")],
            Mode::Execute,
        ))
        .await
        .unwrap();
    let envelope = prepared
        .envelope
        .with_approval(
            ApprovalReference::Human {
                approver: CircleId::new("bob"),
                approved_at: world.clock.now(),
            },
            world.clock.now(),
        )
        .unwrap();

    let result = pipeline.execute(ExecuteRequest::new(envelope)).await.unwrap();
    assert_eq!(result.state, SettlementState::SettledBlocked);
    assert_eq!(result.block_reason, Some(BlockReason::ScopeNotGranted));
    assert_eq!(bank.execute_calls(), 0);
}

#[tokio::test]
async fn calendar_event_created_through_pipeline_is_readable() {
    let contract = Contract::new("ix-team", 1, vec![CircleId::new("alice"), CircleId::new("bob")])
        .with_scope(Scope::write("calendar"))
        .with_scope(Scope::read("calendar"));
    let world = World::new(vec![contract]);
    let calendar = Arc::new(FixtureCalendarConnector::new("calendar-fixture", CalendarStore::new()));
    let pipeline = world.pipeline().connector(calendar.clone()).build().unwrap();

    let start = Utc.with_ymd_and_hms(2026, 3, 3, 14, 0, 0).unwrap();
    let prepared = pipeline
        .prepare(PrepareRequest::new(
            Action::create_event("ix-team", "Retro", start, start + ChronoDuration::minutes(45)),
            "bob",
            vec![Scope::write("calendar")],
            Mode::Execute,
        ))
        .await
        .unwrap();
    let envelope = prepared
        .envelope
        .with_approval(
            ApprovalReference::Human {
                approver: CircleId::new("alice"),
                approved_at: world.clock.now(),
            },
            world.clock.now(),
        )
        .unwrap();

    let result = pipeline.execute(ExecuteRequest::new(envelope.clone())).await.unwrap();
    assert!(result.is_success());

    let reader = intersect_core::connector::Connector::reader(calendar.as_ref()).unwrap();
    let events = reader.read(&envelope, &ReadQuery::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["title"], "Retro");
}
