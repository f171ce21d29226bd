//! Exactly-once bookkeeping for attempts.
//!
//! An attempt is keyed by `(envelope_id, action_hash, ordinal)`. The slot map is
//! guarded by one lock, which is the only serialization point per envelope: at
//! most one reservation per envelope is live at any time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::digest::digest_parts;
use crate::error::{ReserveError, StorageError};
use crate::outcome::{ExecuteResult, SettlementState};
use crate::storage::ReplayLog;

/// Deterministic attempt key, also sent to providers as their idempotency token.
pub fn attempt_key(envelope_id: &str, action_hash: &str, ordinal: u32) -> String {
    format!(
        "att-{}",
        &digest_parts(&[envelope_id, action_hash, &ordinal.to_string()])[..32]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Reserved,
    Settled,
    Failed,
    Blocked,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Reserved)
    }

    fn from_settlement(state: SettlementState) -> Self {
        match state {
            SettlementState::SettledSuccess => Self::Settled,
            SettlementState::SettledFailed => Self::Failed,
            SettlementState::SettledBlocked => Self::Blocked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub key: String,
    pub envelope_id: String,
    pub action_hash: String,
    pub ordinal: u32,
    pub state: AttemptState,
    pub money_moved: bool,
    pub result: Option<ExecuteResult>,
    pub reserved_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Exclusive right to run one attempt. Consumed by [`IdempotencyLedger::finalize`].
#[derive(Debug)]
pub struct Reservation {
    key: String,
    envelope_id: String,
    ordinal: u32,
}

impl Reservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn envelope_id(&self) -> &str {
        &self.envelope_id
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IdempotencyEvent {
    Reserved {
        key: String,
        envelope_id: String,
        action_hash: String,
        ordinal: u32,
        at: DateTime<Utc>,
    },
    Finalized {
        key: String,
        result: ExecuteResult,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct Slots {
    attempts: HashMap<String, AttemptRecord>,
    /// envelope_id -> key of the live reservation
    in_flight: HashMap<String, String>,
}

impl Slots {
    fn apply(&mut self, event: IdempotencyEvent, live: bool) {
        match event {
            IdempotencyEvent::Reserved {
                key,
                envelope_id,
                action_hash,
                ordinal,
                at,
            } => {
                if live {
                    self.in_flight.insert(envelope_id.clone(), key.clone());
                }
                self.attempts.insert(
                    key.clone(),
                    AttemptRecord {
                        key,
                        envelope_id,
                        action_hash,
                        ordinal,
                        state: AttemptState::Reserved,
                        money_moved: false,
                        result: None,
                        reserved_at: at,
                        finalized_at: None,
                    },
                );
            }
            IdempotencyEvent::Finalized { key, result, at } => {
                if let Some(record) = self.attempts.get_mut(&key) {
                    if self.in_flight.get(&record.envelope_id) == Some(&key) {
                        self.in_flight.remove(&record.envelope_id);
                    }
                    record.state = AttemptState::from_settlement(result.state);
                    record.money_moved = result.money_moved;
                    record.result = Some(result);
                    record.finalized_at = Some(at);
                }
            }
        }
    }
}

pub struct IdempotencyLedger {
    slots: Mutex<Slots>,
    log: ReplayLog<IdempotencyEvent>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyLedger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_log(ReplayLog::memory(), clock)
    }

    pub fn with_log(log: ReplayLog<IdempotencyEvent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            log,
            clock,
        }
    }

    /// Rebuild from a replay log after a restart.
    ///
    /// Attempts reserved but never finalized stay `reserved` and can never be
    /// re-run under the same ordinal; they no longer block the envelope, so a
    /// caller may continue with a new ordinal.
    pub fn restore(log: ReplayLog<IdempotencyEvent>, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let mut slots = Slots::default();
        for event in log.events()? {
            slots.apply(event, false);
        }
        let orphaned = slots
            .attempts
            .values()
            .filter(|record| record.state == AttemptState::Reserved)
            .count();
        if orphaned > 0 {
            warn!(orphaned, "idempotency ledger restored with unfinished attempts");
        }
        Ok(Self {
            slots: Mutex::new(slots),
            log,
            clock,
        })
    }

    pub fn reserve_attempt(
        &self,
        envelope_id: &str,
        action_hash: &str,
        ordinal: u32,
    ) -> Result<Reservation, ReserveError> {
        let key = attempt_key(envelope_id, action_hash, ordinal);
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::LockPoisoned("idempotency ledger"))?;

        if let Some(record) = slots.attempts.get(&key) {
            return match &record.result {
                Some(result) => {
                    debug!(envelope_id, key = %key, "attempt already terminal");
                    Err(ReserveError::AlreadyTerminal(Box::new(result.clone())))
                }
                None => Err(ReserveError::InFlight {
                    envelope_id: envelope_id.to_string(),
                }),
            };
        }

        if slots.in_flight.contains_key(envelope_id) {
            return Err(ReserveError::InFlight {
                envelope_id: envelope_id.to_string(),
            });
        }

        let event = IdempotencyEvent::Reserved {
            key: key.clone(),
            envelope_id: envelope_id.to_string(),
            action_hash: action_hash.to_string(),
            ordinal,
            at: self.clock.now(),
        };
        self.log.append(&event)?;
        slots.apply(event, true);

        info!(envelope_id, key = %key, ordinal, "attempt reserved");
        Ok(Reservation {
            key,
            envelope_id: envelope_id.to_string(),
            ordinal,
        })
    }

    /// Store the terminal result. The reservation is consumed, so this runs once.
    pub fn finalize(
        &self,
        reservation: Reservation,
        result: &ExecuteResult,
    ) -> Result<AttemptRecord, StorageError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::LockPoisoned("idempotency ledger"))?;

        let event = IdempotencyEvent::Finalized {
            key: reservation.key.clone(),
            result: result.clone(),
            at: self.clock.now(),
        };
        self.log.append(&event)?;
        slots.apply(event, true);

        info!(
            envelope_id = %reservation.envelope_id,
            key = %reservation.key,
            state = result.state.name(),
            money_moved = result.money_moved,
            "attempt finalized"
        );
        slots
            .attempts
            .get(&reservation.key)
            .cloned()
            .ok_or_else(|| StorageError::Integrity(format!("attempt '{}' vanished", reservation.key)))
    }

    pub fn lookup(&self, key: &str) -> Result<Option<AttemptRecord>, StorageError> {
        Ok(self
            .slots
            .lock()
            .map_err(|_| StorageError::LockPoisoned("idempotency ledger"))?
            .attempts
            .get(key)
            .cloned())
    }

    pub fn is_in_flight(&self, envelope_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .slots
            .lock()
            .map_err(|_| StorageError::LockPoisoned("idempotency ledger"))?
            .in_flight
            .contains_key(envelope_id))
    }

    /// Attempts left `reserved` by a crash, for operator reconciliation.
    pub fn unfinished(&self) -> Result<Vec<AttemptRecord>, StorageError> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::LockPoisoned("idempotency ledger"))?;
        let mut records: Vec<AttemptRecord> = slots
            .attempts
            .values()
            .filter(|record| {
                record.state == AttemptState::Reserved
                    && slots.in_flight.get(&record.envelope_id) != Some(&record.key)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.reserved_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::outcome::{BlockReason, SettlementState};
    use crate::types::Mode;

    fn result(envelope_id: &str, state: SettlementState, money_moved: bool) -> ExecuteResult {
        ExecuteResult {
            envelope_id: envelope_id.to_string(),
            trace_id: "t-1".to_string(),
            attempt_key: None,
            mode: Mode::Execute,
            state,
            block_reason: (state != SettlementState::SettledSuccess)
                .then_some(BlockReason::ConnectorFailed),
            message: String::new(),
            receipt: None,
            money_moved,
            rolled_back: false,
            rollback_failure: None,
        }
    }

    #[test]
    fn second_reservation_for_envelope_is_in_flight() {
        let ledger = IdempotencyLedger::new(Arc::new(SystemClock));
        let first = ledger.reserve_attempt("env-1", "h", 1).unwrap();
        assert!(matches!(
            ledger.reserve_attempt("env-1", "h", 1),
            Err(ReserveError::InFlight { .. })
        ));
        assert!(matches!(
            ledger.reserve_attempt("env-1", "h", 2),
            Err(ReserveError::InFlight { .. })
        ));
        assert!(ledger.reserve_attempt("env-2", "h", 1).is_ok());

        ledger
            .finalize(first, &result("env-1", SettlementState::SettledSuccess, true))
            .unwrap();
        assert!(!ledger.is_in_flight("env-1").unwrap());
    }

    #[test]
    fn terminal_attempt_returns_stored_result() {
        let ledger = IdempotencyLedger::new(Arc::new(SystemClock));
        let reservation = ledger.reserve_attempt("env-1", "h", 1).unwrap();
        let key = reservation.key().to_string();
        let stored = result("env-1", SettlementState::SettledSuccess, true);
        let record = ledger.finalize(reservation, &stored).unwrap();
        assert_eq!(record.state, AttemptState::Settled);
        assert!(record.money_moved);

        match ledger.reserve_attempt("env-1", "h", 1) {
            Err(ReserveError::AlreadyTerminal(prior)) => assert_eq!(*prior, stored),
            other => panic!("expected terminal replay, got {other:?}"),
        }
        assert_eq!(ledger.lookup(&key).unwrap().unwrap().state, AttemptState::Settled);
    }

    #[test]
    fn concurrent_reservations_admit_exactly_one() {
        let ledger = Arc::new(IdempotencyLedger::new(Arc::new(SystemClock)));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.reserve_attempt("env-race", "h", 1).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn restore_keeps_crashed_attempt_reserved_and_allows_new_ordinal() {
        let path = std::env::temp_dir()
            .join(format!("intersect-idem-{}", uuid::Uuid::new_v4()))
            .join("attempts.jsonl");
        {
            let ledger =
                IdempotencyLedger::with_log(ReplayLog::file(&path).unwrap(), Arc::new(SystemClock));
            let done = ledger.reserve_attempt("env-1", "h", 1).unwrap();
            ledger
                .finalize(done, &result("env-1", SettlementState::SettledFailed, false))
                .unwrap();
            let _crashed = ledger.reserve_attempt("env-1", "h", 2).unwrap();
        }

        let restored =
            IdempotencyLedger::restore(ReplayLog::file(&path).unwrap(), Arc::new(SystemClock)).unwrap();
        assert!(matches!(
            restored.reserve_attempt("env-1", "h", 1),
            Err(ReserveError::AlreadyTerminal(_))
        ));
        assert!(matches!(
            restored.reserve_attempt("env-1", "h", 2),
            Err(ReserveError::InFlight { .. })
        ));
        assert_eq!(restored.unfinished().unwrap().len(), 1);
        assert!(restored.reserve_attempt("env-1", "h", 3).is_ok());
    }
}
