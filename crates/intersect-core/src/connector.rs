use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::envelope::ExecutionEnvelope;
use crate::error::ConnectorError;
use crate::token::AccessToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Dry run accepted by the provider; nothing changed.
    Prepared,
    /// External effect performed.
    Completed,
    /// External effect reversed by a rollback.
    Reversed,
}

/// Provider acknowledgement of an external effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub provider: String,
    pub external_id: String,
    pub status: ReceiptStatus,
    pub occurred_at: DateTime<Utc>,
    /// False for sandbox providers and dry runs.
    pub money_moved: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Receipt {
    /// Copy safe for human display: masked external id, no provider metadata.
    pub fn redacted(&self) -> Receipt {
        let count = self.external_id.chars().count();
        let tail: String = self.external_id.chars().skip(count.saturating_sub(4)).collect();
        Receipt {
            provider: self.provider.clone(),
            external_id: format!("****{tail}"),
            status: self.status,
            occurred_at: self.occurred_at,
            money_moved: self.money_moved,
            metadata: BTreeMap::new(),
        }
    }
}

/// Everything a connector needs to perform the write.
///
/// `idempotency_key` is the attempt key; providers must treat repeated calls
/// with the same key as the same request.
#[derive(Debug, Clone)]
pub struct ConnectorPayload {
    pub idempotency_key: String,
    pub authorization_proof_id: String,
    pub access_token: Option<AccessToken>,
    pub parameters: BTreeMap<String, Value>,
}

/// Read-only query against a provider.
#[derive(Debug, Clone, Default)]
pub struct ReadQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Read capability. Never changes provider state.
#[async_trait]
pub trait Reader: Send + Sync {
    fn provider(&self) -> &str;

    async fn read(
        &self,
        envelope: &ExecutionEnvelope,
        query: &ReadQuery,
    ) -> Result<Vec<Value>, ConnectorError>;
}

/// Write capability for one action domain (`payment`, `calendar`, ...).
///
/// Implementations compose a [`Reader`] rather than extending it.
#[async_trait]
pub trait Connector: Send + Sync {
    fn provider(&self) -> &str;

    fn domain(&self) -> &str;

    fn reader(&self) -> Option<Arc<dyn Reader>> {
        None
    }

    /// Validate the envelope against the provider without side effects.
    async fn prepare(&self, envelope: &ExecutionEnvelope) -> Result<Receipt, ConnectorError>;

    async fn execute(
        &self,
        envelope: &ExecutionEnvelope,
        payload: &ConnectorPayload,
    ) -> Result<Receipt, ConnectorError>;

    async fn rollback(&self, receipt: &Receipt) -> Result<Receipt, ConnectorError>;
}

/// Connectors keyed by action domain.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.domain().to_string(), connector);
    }

    pub fn get(&self, domain: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(domain).cloned()
    }

    pub fn reader(&self, domain: &str) -> Option<Arc<dyn Reader>> {
        self.connectors.get(domain).and_then(|c| c.reader())
    }

    pub fn has(&self, domain: &str) -> bool {
        self.connectors.contains_key(domain)
    }
}
