//! Connector adapters for the Intersect execution core.
//!
//! Deterministic calendar and bank fixtures plus failure-injection wrappers and a
//! scope-mapped token broker. Real provider clients plug in behind the same traits.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use intersect_core::authority::AuthorizationProof;
use intersect_core::clock::Clock;
use intersect_core::connector::{
    Connector, ConnectorPayload, ReadQuery, Reader, Receipt, ReceiptStatus,
};
use intersect_core::envelope::ExecutionEnvelope;
use intersect_core::error::{ConnectorError, TokenError};
use intersect_core::scopes::ScopeRegistry;
use intersect_core::token::{check_mint_request, AccessToken, TokenProvider};
use intersect_core::types::{Money, Scope, PARAM_TITLE};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Provider-side id derived from the attempt key, so retries map to one effect.
fn external_id(prefix: &str, idempotency_key: &str) -> String {
    let digest = blake3::hash(idempotency_key.as_bytes()).to_hex();
    format!("{prefix}-{}", &digest[..12])
}

fn check_token(
    provider: &str,
    envelope: &ExecutionEnvelope,
    payload: &ConnectorPayload,
) -> Result<(), ConnectorError> {
    match &payload.access_token {
        None => Ok(()),
        Some(token) if token.provider != provider => Err(ConnectorError::Rejected {
            code: "token_provider_mismatch".to_string(),
        }),
        Some(token) if token.envelope_id != envelope.envelope_id() => {
            Err(ConnectorError::Rejected {
                code: "token_envelope_mismatch".to_string(),
            })
        }
        Some(_) => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub event_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarEvent {
    fn to_value(&self) -> Value {
        json!({
            "event_id": self.event_id,
            "title": self.title,
            "start": self.start.to_rfc3339(),
            "end": self.end.to_rfc3339(),
        })
    }
}

/// In-memory calendar shared by the reader and writer halves.
#[derive(Debug, Clone, Default)]
pub struct CalendarStore {
    events: Arc<Mutex<BTreeMap<String, CalendarEvent>>>,
}

impl CalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(self, event: CalendarEvent) -> Self {
        if let Ok(mut events) = self.events.lock() {
            events.insert(event.event_id.clone(), event);
        }
        self
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.events
            .lock()
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }
}

/// Read half of the calendar fixture.
#[derive(Debug, Clone)]
pub struct FixtureCalendarReader {
    provider: String,
    store: CalendarStore,
}

impl FixtureCalendarReader {
    pub fn new(provider: impl Into<String>, store: CalendarStore) -> Self {
        Self {
            provider: provider.into(),
            store,
        }
    }
}

#[async_trait]
impl Reader for FixtureCalendarReader {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn read(
        &self,
        _envelope: &ExecutionEnvelope,
        query: &ReadQuery,
    ) -> Result<Vec<Value>, ConnectorError> {
        let events = self
            .store
            .events
            .lock()
            .map_err(|_| ConnectorError::Unavailable)?;
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut selected: Vec<&CalendarEvent> = events
            .values()
            .filter(|event| query.from.map_or(true, |from| event.end > from))
            .filter(|event| query.to.map_or(true, |to| event.start < to))
            .collect();
        selected.sort_by_key(|event| event.start);
        Ok(selected
            .into_iter()
            .take(limit)
            .map(CalendarEvent::to_value)
            .collect())
    }
}

/// Calendar writer. Composes a [`FixtureCalendarReader`] over the same store.
#[derive(Debug, Clone)]
pub struct FixtureCalendarConnector {
    provider: String,
    store: CalendarStore,
    reader: Arc<FixtureCalendarReader>,
}

impl FixtureCalendarConnector {
    pub fn new(provider: impl Into<String>, store: CalendarStore) -> Self {
        let provider = provider.into();
        Self {
            reader: Arc::new(FixtureCalendarReader::new(provider.clone(), store.clone())),
            provider,
            store,
        }
    }

    pub fn store(&self) -> &CalendarStore {
        &self.store
    }

    fn parse_event(
        &self,
        envelope: &ExecutionEnvelope,
    ) -> Result<(String, DateTime<Utc>, DateTime<Utc>), ConnectorError> {
        let action = envelope.action();
        let title = action
            .param_str(PARAM_TITLE)
            .ok_or_else(|| ConnectorError::Rejected {
                code: "missing_title".to_string(),
            })?;
        let (start, end) = action.event_window().ok_or_else(|| ConnectorError::Rejected {
            code: "invalid_window".to_string(),
        })?;
        if end <= start {
            return Err(ConnectorError::Rejected {
                code: "empty_window".to_string(),
            });
        }
        Ok((title.to_string(), start, end))
    }

    fn receipt(&self, external_id: String, status: ReceiptStatus) -> Receipt {
        Receipt {
            provider: self.provider.clone(),
            external_id,
            status,
            occurred_at: Utc::now(),
            money_moved: false,
            metadata: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Connector for FixtureCalendarConnector {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn domain(&self) -> &str {
        "calendar"
    }

    fn reader(&self) -> Option<Arc<dyn Reader>> {
        Some(self.reader.clone())
    }

    async fn prepare(&self, envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError> {
        self.parse_event(envelope)?;
        Ok(self.receipt(
            format!("dry-{}", envelope.envelope_id()),
            ReceiptStatus::Prepared,
        ))
    }

    async fn execute(
        &self,
        envelope: &ExecutionEnvelope,
        payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError> {
        check_token(&self.provider, envelope, payload)?;
        let (title, start, end) = self.parse_event(envelope)?;
        let event_id = external_id("evt", &payload.idempotency_key);

        let mut events = self
            .store
            .events
            .lock()
            .map_err(|_| ConnectorError::Unavailable)?;
        events.entry(event_id.clone()).or_insert_with(|| CalendarEvent {
            event_id: event_id.clone(),
            title,
            start,
            end,
        });
        info!(provider = %self.provider, event_id = %event_id, "calendar event created");

        let mut receipt = self.receipt(event_id, ReceiptStatus::Completed);
        receipt
            .metadata
            .insert("trace_id".to_string(), envelope.trace_id().to_string());
        Ok(receipt)
    }

    async fn rollback(&self, receipt: &Receipt) -> Result<Receipt, ConnectorError> {
        let mut events = self
            .store
            .events
            .lock()
            .map_err(|_| ConnectorError::Unavailable)?;
        events
            .remove(&receipt.external_id)
            .ok_or_else(|| ConnectorError::NotFound(receipt.external_id.clone()))?;
        Ok(self.receipt(receipt.external_id.clone(), ReceiptStatus::Reversed))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub transfer_id: String,
    pub money: Money,
    pub payee: String,
    pub reversed: bool,
}

/// Payment connector. The sandbox variant reports `money_moved = false`.
#[derive(Debug, Clone)]
pub struct FixtureBankConnector {
    provider: String,
    sandbox: bool,
    rollback_supported: bool,
    transfers: Arc<Mutex<BTreeMap<String, Transfer>>>,
    calls: Arc<Mutex<u32>>,
}

impl FixtureBankConnector {
    pub fn live(provider: impl Into<String>) -> Self {
        Self::build(provider.into(), false)
    }

    pub fn sandbox(provider: impl Into<String>) -> Self {
        Self::build(provider.into(), true)
    }

    fn build(provider: String, sandbox: bool) -> Self {
        Self {
            provider,
            sandbox,
            rollback_supported: true,
            transfers: Arc::new(Mutex::new(BTreeMap::new())),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Reject every rollback, as a rail without reversals would.
    pub fn without_rollback(mut self) -> Self {
        self.rollback_supported = false;
        self
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers
            .lock()
            .map(|transfers| transfers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of `execute` calls that reached the provider.
    pub fn execute_calls(&self) -> u32 {
        self.calls.lock().map(|calls| *calls).unwrap_or_default()
    }

    fn parse_transfer(envelope: &ExecutionEnvelope) -> Result<(Money, String), ConnectorError> {
        let action = envelope.action();
        let money = action.money().ok_or_else(|| ConnectorError::Rejected {
            code: "invalid_amount".to_string(),
        })?;
        if money.amount_minor == 0 {
            return Err(ConnectorError::Rejected {
                code: "invalid_amount".to_string(),
            });
        }
        let payee = action.payee().ok_or_else(|| ConnectorError::Rejected {
            code: "missing_payee".to_string(),
        })?;
        Ok((money, payee.to_string()))
    }
}

#[async_trait]
impl Connector for FixtureBankConnector {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn domain(&self) -> &str {
        "payment"
    }

    async fn prepare(&self, envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError> {
        let (money, payee) = Self::parse_transfer(envelope)?;
        Ok(Receipt {
            provider: self.provider.clone(),
            external_id: format!("quote-{}", envelope.envelope_id()),
            status: ReceiptStatus::Prepared,
            occurred_at: Utc::now(),
            money_moved: false,
            metadata: BTreeMap::from([
                ("amount".to_string(), money.to_string()),
                ("payee".to_string(), payee),
            ]),
        })
    }

    async fn execute(
        &self,
        envelope: &ExecutionEnvelope,
        payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError> {
        *self.calls.lock().map_err(|_| ConnectorError::Unavailable)? += 1;
        check_token(&self.provider, envelope, payload)?;
        let (money, payee) = Self::parse_transfer(envelope)?;
        let transfer_id = external_id("txn", &payload.idempotency_key);

        let mut transfers = self
            .transfers
            .lock()
            .map_err(|_| ConnectorError::Unavailable)?;
        let transfer = transfers
            .entry(transfer_id.clone())
            .or_insert_with(|| Transfer {
                transfer_id: transfer_id.clone(),
                money: money.clone(),
                payee,
                reversed: false,
            });
        info!(
            provider = %self.provider,
            transfer_id = %transfer.transfer_id,
            amount = %money,
            sandbox = self.sandbox,
            "transfer submitted"
        );

        Ok(Receipt {
            provider: self.provider.clone(),
            external_id: transfer_id,
            status: ReceiptStatus::Completed,
            occurred_at: Utc::now(),
            money_moved: !self.sandbox,
            metadata: BTreeMap::from([("amount".to_string(), money.to_string())]),
        })
    }

    async fn rollback(&self, receipt: &Receipt) -> Result<Receipt, ConnectorError> {
        if !self.rollback_supported {
            return Err(ConnectorError::Unsupported);
        }
        let mut transfers = self
            .transfers
            .lock()
            .map_err(|_| ConnectorError::Unavailable)?;
        let transfer = transfers
            .get_mut(&receipt.external_id)
            .ok_or_else(|| ConnectorError::NotFound(receipt.external_id.clone()))?;
        transfer.reversed = true;
        debug!(transfer_id = %transfer.transfer_id, "transfer reversed");

        Ok(Receipt {
            provider: self.provider.clone(),
            external_id: receipt.external_id.clone(),
            status: ReceiptStatus::Reversed,
            occurred_at: Utc::now(),
            money_moved: false,
            metadata: BTreeMap::new(),
        })
    }
}

/// Deterministic failing connector useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailConnector {
    provider: String,
    domain: String,
    error: ConnectorError,
}

impl AlwaysFailConnector {
    pub fn new(domain: impl Into<String>, error: ConnectorError) -> Self {
        let domain = domain.into();
        Self {
            provider: format!("{domain}-failing"),
            domain,
            error,
        }
    }
}

#[async_trait]
impl Connector for AlwaysFailConnector {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    async fn prepare(&self, _envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError> {
        Err(self.error.clone())
    }

    async fn execute(
        &self,
        _envelope: &ExecutionEnvelope,
        _payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError> {
        Err(self.error.clone())
    }

    async fn rollback(&self, _receipt: &Receipt) -> Result<Receipt, ConnectorError> {
        Err(self.error.clone())
    }
}

/// Delays every `execute` call before delegating.
pub struct SlowConnector {
    inner: Arc<dyn Connector>,
    delay: Duration,
}

impl SlowConnector {
    pub fn new(inner: Arc<dyn Connector>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl Connector for SlowConnector {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn domain(&self) -> &str {
        self.inner.domain()
    }

    fn reader(&self) -> Option<Arc<dyn Reader>> {
        self.inner.reader()
    }

    async fn prepare(&self, envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError> {
        self.inner.prepare(envelope).await
    }

    async fn execute(
        &self,
        envelope: &ExecutionEnvelope,
        payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(envelope, payload).await
    }

    async fn rollback(&self, receipt: &Receipt) -> Result<Receipt, ConnectorError> {
        self.inner.rollback(receipt).await
    }
}

/// Mints short-lived provider tokens restricted to the envelope's proven scopes.
pub struct ScopedTokenBroker {
    scopes: ScopeRegistry,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl ScopedTokenBroker {
    pub fn new(scopes: ScopeRegistry, ttl: ChronoDuration, clock: Arc<dyn Clock>) -> Self {
        Self { scopes, ttl, clock }
    }
}

#[async_trait]
impl TokenProvider for ScopedTokenBroker {
    async fn mint_access_token(
        &self,
        envelope: &ExecutionEnvelope,
        proof: &AuthorizationProof,
        provider: &str,
        scopes: &[Scope],
    ) -> Result<AccessToken, TokenError> {
        check_mint_request(envelope, proof, scopes)?;
        let provider_scopes = self.scopes.map_scopes(provider, scopes)?;

        let issued_at = self.clock.now();
        let token = AccessToken {
            token_id: format!("at-{}", Uuid::new_v4()),
            provider: provider.to_string(),
            envelope_id: envelope.envelope_id().to_string(),
            provider_scopes,
            issued_at,
            expires_at: issued_at + self.ttl,
        };
        debug!(
            envelope_id = envelope.envelope_id(),
            provider,
            scopes = token.provider_scopes.len(),
            "access token minted"
        );
        Ok(token)
    }
}
