use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use intersect_adapters::{
    AlwaysFailConnector, CalendarEvent, CalendarStore, FixtureBankConnector,
    FixtureCalendarConnector, ScopedTokenBroker, SlowConnector,
};
use intersect_core::authority::{AuthorityEngine, ContractRegistry};
use intersect_core::clock::{Clock, ManualClock};
use intersect_core::connector::{Connector, ConnectorPayload, ReadQuery, ReceiptStatus};
use intersect_core::envelope::{seal, ExecutionEnvelope, SealParams};
use intersect_core::error::{ConnectorError, TokenError};
use intersect_core::scopes::{ScopeRegistry, UnknownScopePolicy};
use intersect_core::token::TokenProvider;
use intersect_core::types::{Action, CircleId, Contract, Mode, Scope};
use std::sync::Arc;
use std::time::Duration;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
    ))
}

fn envelope(action: Action, scopes: Vec<Scope>, mode: Mode) -> ExecutionEnvelope {
    seal(
        action,
        SealParams {
            trace_id: "trace-adapters".to_string(),
            actor_circle_id: CircleId::new("alice"),
            contract_version: 1,
            mode,
            scopes,
            authorization_proof_id: "proof-fixture".to_string(),
            approval: None,
        },
        Utc::now(),
    )
    .unwrap()
}

fn payload(key: &str) -> ConnectorPayload {
    ConnectorPayload {
        idempotency_key: key.to_string(),
        authorization_proof_id: "proof-fixture".to_string(),
        access_token: None,
        parameters: Default::default(),
    }
}

fn meeting() -> Action {
    let start = Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap();
    Action::create_event("ix-1", "Planning", start, start + ChronoDuration::minutes(30))
}

#[tokio::test]
async fn calendar_writer_composes_reader_over_same_store() {
    let store = CalendarStore::new().with_event(CalendarEvent {
        event_id: "evt-existing".to_string(),
        title: "Standup".to_string(),
        start: Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2026, 3, 3, 9, 15, 0).unwrap(),
    });
    let connector = FixtureCalendarConnector::new("calendar-fixture", store);
    let env = envelope(meeting(), vec![Scope::write("calendar")], Mode::Execute);

    let receipt = connector.execute(&env, &payload("att-1")).await.unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert!(!receipt.money_moved);

    let reader = connector.reader().expect("calendar exposes a reader");
    let events = reader.read(&env, &ReadQuery::default()).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["title"], "Standup");
    assert_eq!(events[1]["title"], "Planning");

    let limited = reader
        .read(
            &env,
            &ReadQuery {
                from: Some(Utc.with_ymd_and_hms(2026, 3, 3, 9, 30, 0).unwrap()),
                to: None,
                limit: Some(5),
            },
        )
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn calendar_execute_is_idempotent_per_attempt_key_and_rolls_back() {
    let connector = FixtureCalendarConnector::new("calendar-fixture", CalendarStore::new());
    let env = envelope(meeting(), vec![Scope::write("calendar")], Mode::Execute);

    let first = connector.execute(&env, &payload("att-1")).await.unwrap();
    let second = connector.execute(&env, &payload("att-1")).await.unwrap();
    assert_eq!(first.external_id, second.external_id);
    assert_eq!(connector.store().events().len(), 1);

    let reversal = connector.rollback(&first).await.unwrap();
    assert_eq!(reversal.status, ReceiptStatus::Reversed);
    assert!(connector.store().events().is_empty());
    assert!(matches!(
        connector.rollback(&first).await,
        Err(ConnectorError::NotFound(_))
    ));
}

#[tokio::test]
async fn bank_sandbox_never_reports_money_moved() -> anyhow::Result<()> {
    let live = FixtureBankConnector::live("bank-live");
    let sandbox = FixtureBankConnector::sandbox("bank-sandbox");
    let env = envelope(
        Action::transfer("ix-1", 100, "GBP", "P1"),
        vec![Scope::write("finance")],
        Mode::Execute,
    );

    assert!(live.execute(&env, &payload("att-1")).await?.money_moved);
    let receipt = sandbox.execute(&env, &payload("att-1")).await?;
    assert!(!receipt.money_moved);
    assert_eq!(sandbox.transfers()[0].money.amount_minor, 100);
    assert_eq!(sandbox.execute_calls(), 1);

    let dry_run = sandbox.prepare(&env).await?;
    assert_eq!(dry_run.status, ReceiptStatus::Prepared);
    assert_eq!(dry_run.metadata["amount"], "1.00 GBP");
    Ok(())
}

#[tokio::test]
async fn bank_rejects_missing_amount_and_unsupported_rollback() {
    let bank = FixtureBankConnector::live("bank-live").without_rollback();
    let bad = envelope(
        Action::new("ix-1", "payment.transfer").with_param("payee", "P1"),
        vec![Scope::write("finance")],
        Mode::Execute,
    );
    assert_eq!(
        bank.execute(&bad, &payload("att-x")).await.unwrap_err(),
        ConnectorError::Rejected {
            code: "invalid_amount".to_string()
        }
    );

    let good = envelope(
        Action::transfer("ix-1", 250, "GBP", "P1"),
        vec![Scope::write("finance")],
        Mode::Execute,
    );
    let receipt = bank.execute(&good, &payload("att-y")).await.unwrap();
    assert_eq!(
        bank.rollback(&receipt).await.unwrap_err(),
        ConnectorError::Unsupported
    );
}

#[tokio::test]
async fn failure_wrappers_behave_deterministically() {
    let failing = AlwaysFailConnector::new("payment", ConnectorError::Unavailable);
    let env = envelope(
        Action::transfer("ix-1", 100, "GBP", "P1"),
        vec![Scope::write("finance")],
        Mode::Execute,
    );
    assert_eq!(failing.domain(), "payment");
    assert_eq!(
        failing.execute(&env, &payload("att-1")).await.unwrap_err(),
        ConnectorError::Unavailable
    );

    let slow = SlowConnector::new(
        Arc::new(FixtureBankConnector::sandbox("bank-sandbox")),
        Duration::from_millis(200),
    );
    let timed = tokio::time::timeout(
        Duration::from_millis(20),
        slow.execute(&env, &payload("att-2")),
    )
    .await;
    assert!(timed.is_err());
}

#[tokio::test]
async fn token_broker_maps_only_proven_scopes() {
    let clock = clock();
    let contracts = Arc::new(ContractRegistry::new());
    contracts
        .register(
            Contract::new("ix-1", 1, vec![CircleId::new("alice")])
                .with_scope(Scope::write("calendar"))
                .with_scope(Scope::read("calendar")),
        )
        .unwrap();
    let authority = AuthorityEngine::new(contracts, clock.clone() as Arc<dyn Clock>);

    let action = meeting();
    let proof = authority
        .authorize_action(
            &action,
            &CircleId::new("alice"),
            &[Scope::write("calendar")],
            Mode::Execute,
            "trace-broker",
        )
        .unwrap();
    let env = seal(
        action,
        SealParams {
            trace_id: "trace-broker".to_string(),
            actor_circle_id: CircleId::new("alice"),
            contract_version: 1,
            mode: Mode::Execute,
            scopes: vec![Scope::write("calendar")],
            authorization_proof_id: proof.proof_id.clone(),
            approval: None,
        },
        clock.now(),
    )
    .unwrap();

    let registry = ScopeRegistry::new(UnknownScopePolicy::Reject)
        .with_mapping("google", Scope::write("calendar"), &["calendar.events"])
        .with_mapping("google", Scope::read("calendar"), &["calendar.readonly"]);
    let broker = ScopedTokenBroker::new(
        registry,
        ChronoDuration::minutes(5),
        clock.clone() as Arc<dyn Clock>,
    );

    let token = broker
        .mint_access_token(&env, &proof, "google", &[Scope::write("calendar")])
        .await
        .unwrap();
    assert_eq!(token.provider_scopes, vec!["calendar.events".to_string()]);
    assert_eq!(token.envelope_id, env.envelope_id());
    assert_eq!(token.expires_at - token.issued_at, ChronoDuration::minutes(5));

    let widened = broker
        .mint_access_token(&env, &proof, "google", &[Scope::read("calendar")])
        .await
        .unwrap_err();
    assert_eq!(widened, TokenError::ScopeNotInProof("calendar:read".to_string()));

    let unknown = broker
        .mint_access_token(&env, &proof, "outlook", &[Scope::write("calendar")])
        .await
        .unwrap_err();
    assert_eq!(unknown, TokenError::UnknownProvider("outlook".to_string()));
}

#[tokio::test]
async fn token_for_another_envelope_is_rejected_by_connector() {
    let bank = FixtureBankConnector::live("bank-live");
    let env = envelope(
        Action::transfer("ix-1", 100, "GBP", "P1"),
        vec![Scope::write("finance")],
        Mode::Execute,
    );
    let mut request = payload("att-1");
    request.access_token = Some(intersect_core::token::AccessToken {
        token_id: "at-1".to_string(),
        provider: "bank-live".to_string(),
        envelope_id: "env-other".to_string(),
        provider_scopes: vec![],
        issued_at: Utc::now(),
        expires_at: Utc::now() + ChronoDuration::minutes(1),
    });

    assert_eq!(
        bank.execute(&env, &request).await.unwrap_err(),
        ConnectorError::Rejected {
            code: "token_envelope_mismatch".to_string()
        }
    );
    assert!(bank.transfers().is_empty());
}
