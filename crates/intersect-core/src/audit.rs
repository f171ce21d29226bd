use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

use crate::digest::digest_json;
use crate::error::StorageError;
use crate::types::CircleId;

/// One audited transition, as submitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub trace_id: String,
    pub actor: Option<CircleId>,
    pub envelope_id: Option<String>,
    pub authorization_proof_id: Option<String>,
    pub outcome: Option<String>,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        trace_id: impl Into<String>,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            trace_id: trace_id.into(),
            actor: None,
            envelope_id: None,
            authorization_proof_id: None,
            outcome: None,
            detail: String::new(),
            occurred_at,
        }
    }

    pub fn actor(mut self, actor: &CircleId) -> Self {
        self.actor = Some(actor.clone());
        self
    }

    pub fn envelope(mut self, envelope_id: impl Into<String>) -> Self {
        self.envelope_id = Some(envelope_id.into());
        self
    }

    pub fn proof(mut self, proof_id: impl Into<String>) -> Self {
        self.authorization_proof_id = Some(proof_id.into());
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Hash-chained audit entry. Never mutated or deleted once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub index: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: AuditEvent,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Append-only audit store. No update or delete operations exist.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry, StorageError>;

    /// Every entry for `trace_id`, in append order.
    async fn query(&self, trace_id: &str) -> Result<Vec<AuditEntry>, StorageError>;
}

/// In-memory hash chain shared by the audit sinks.
#[derive(Debug, Default, Clone)]
pub struct AuditChain {
    entries: Vec<AuditEntry>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted entries, rejecting index gaps and broken hashes.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, StorageError> {
        let chain = Self { entries };

        for (expected_index, entry) in chain.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(StorageError::Integrity(format!(
                    "audit index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !chain.verify_chain() {
            return Err(StorageError::Integrity(
                "persisted audit hash-chain verification failed".to_string(),
            ));
        }

        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn query(&self, trace_id: &str) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.event.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                &entry.event,
                entry.recorded_at,
                previous_hash.as_deref(),
            );
            match expected {
                Ok(hash) if hash == entry.entry_hash => {}
                _ => return false,
            }
            if entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    /// Build the next entry without mutating the chain.
    pub fn build_entry(&self, event: AuditEvent) -> Result<AuditEntry, StorageError> {
        let index = self.entries.len() as u64;
        let recorded_at = event.occurred_at;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let entry_hash = compute_entry_hash(index, &event, recorded_at, previous_hash.as_deref())?;

        Ok(AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            recorded_at,
            event,
            previous_hash,
            entry_hash,
        })
    }

    /// Commit a pre-built entry once external durability has succeeded.
    pub fn commit_entry(&mut self, entry: AuditEntry) -> Result<(), StorageError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(StorageError::Integrity(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(StorageError::Integrity(
                "commit previous hash mismatch".to_string(),
            ));
        }

        let expected_hash = compute_entry_hash(
            entry.index,
            &entry.event,
            entry.recorded_at,
            entry.previous_hash.as_deref(),
        )?;
        if entry.entry_hash != expected_hash {
            return Err(StorageError::Integrity(
                "commit hash mismatch for audit entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(
    index: u64,
    event: &AuditEvent,
    recorded_at: DateTime<Utc>,
    previous_hash: Option<&str>,
) -> Result<String, StorageError> {
    digest_json(&serde_json::json!({
        "index": index,
        "event": event,
        "recorded_at": recorded_at,
        "previous_hash": previous_hash,
    }))
}

/// Process-local audit sink.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    chain: Mutex<AuditChain>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .chain
            .lock()
            .map_err(|_| StorageError::LockPoisoned("audit chain"))?
            .entries()
            .to_vec())
    }

    pub fn verify_chain(&self) -> Result<bool, StorageError> {
        Ok(self
            .chain
            .lock()
            .map_err(|_| StorageError::LockPoisoned("audit chain"))?
            .verify_chain())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<AuditEntry, StorageError> {
        let mut chain = self
            .chain
            .lock()
            .map_err(|_| StorageError::LockPoisoned("audit chain"))?;
        let entry = chain.build_entry(event)?;
        chain.commit_entry(entry.clone())?;
        Ok(entry)
    }

    async fn query(&self, trace_id: &str) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .chain
            .lock()
            .map_err(|_| StorageError::LockPoisoned("audit chain"))?
            .query(trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(trace: &str, kind: &str) -> AuditEvent {
        AuditEvent::new(trace, kind, Utc::now())
            .envelope("env-1")
            .outcome("ok")
    }

    #[tokio::test]
    async fn query_returns_trace_in_order() {
        let sink = MemoryAuditSink::new();
        sink.append(event("t-1", "sealed")).await.unwrap();
        sink.append(event("t-2", "sealed")).await.unwrap();
        sink.append(event("t-1", "authorized")).await.unwrap();

        let trace: Vec<String> = sink
            .query("t-1")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.event.event_type)
            .collect();
        assert_eq!(trace, vec!["sealed", "authorized"]);
        assert!(sink.verify_chain().unwrap());
    }

    #[test]
    fn detects_tampered_entries() {
        let mut chain = AuditChain::new();
        let entry = chain.build_entry(event("t-1", "settled_success")).unwrap();
        chain.commit_entry(entry).unwrap();
        let entry = chain.build_entry(event("t-1", "audit_closed")).unwrap();
        chain.commit_entry(entry).unwrap();
        assert!(chain.verify_chain());

        let mut tampered = chain.clone();
        tampered.entries[0].event.outcome = Some("rolled_back".to_string());
        assert!(!tampered.verify_chain());
        assert!(AuditChain::from_entries(tampered.entries).is_err());
    }

    #[test]
    fn commit_rejects_out_of_order_entries() {
        let mut chain = AuditChain::new();
        let first = chain.build_entry(event("t-1", "sealed")).unwrap();
        let stale = chain.build_entry(event("t-1", "authorized")).unwrap();
        chain.commit_entry(first).unwrap();
        assert!(matches!(
            chain.commit_entry(stale),
            Err(StorageError::Integrity(_))
        ));
    }
}
