//! Hard daily spend ceilings and attempt-rate limits per circle, intersection
//! and payee.
//!
//! Admission takes the lock of every affected key in sorted order, checks all
//! of them, and only then records the attempt and a pending hold on each. A
//! blocked admission changes nothing; an amount is never reduced to fit.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CapError, StorageError};
use crate::storage::ReplayLog;
use crate::types::{CircleId, IntersectionId, Money};

/// Independent cap domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CapScope {
    Circle(CircleId),
    Intersection(IntersectionId),
    Payee(String),
}

impl CapScope {
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CapScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Circle(id) => write!(f, "circle:{id}"),
            Self::Intersection(id) => write!(f, "intersection:{id}"),
            Self::Payee(id) => write!(f, "payee:{id}"),
        }
    }
}

/// Limits for one key. Absent entries mean "unlimited".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapLimits {
    /// Daily spend ceiling in minor units, per currency.
    pub daily_spend_minor: BTreeMap<String, u64>,
    pub max_attempts_per_day: Option<u32>,
}

impl CapLimits {
    pub fn with_daily_spend(mut self, currency: impl Into<String>, amount_minor: u64) -> Self {
        self.daily_spend_minor.insert(currency.into(), amount_minor);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts_per_day: u32) -> Self {
        self.max_attempts_per_day = Some(max_attempts_per_day);
        self
    }
}

/// Defaults per scope kind plus per-key overrides (`circle:alice`, `payee:P1`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsConfig {
    pub circle: CapLimits,
    pub intersection: CapLimits,
    pub payee: CapLimits,
    pub overrides: BTreeMap<String, CapLimits>,
}

impl CapsConfig {
    pub fn limits_for(&self, scope: &CapScope) -> &CapLimits {
        if let Some(limits) = self.overrides.get(&scope.key()) {
            return limits;
        }
        match scope {
            CapScope::Circle(_) => &self.circle,
            CapScope::Intersection(_) => &self.intersection,
            CapScope::Payee(_) => &self.payee,
        }
    }

    pub fn with_override(mut self, scope: &CapScope, limits: CapLimits) -> Self {
        self.overrides.insert(scope.key(), limits);
        self
    }
}

/// Per (key, currency, day) totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapRecord {
    pub spent_minor: u64,
    pub pending_minor: u64,
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct DayBook {
    attempts: u32,
    spent: BTreeMap<String, u64>,
    pending: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct KeyBook {
    days: BTreeMap<NaiveDate, DayBook>,
}

impl KeyBook {
    fn day(&mut self, day: NaiveDate) -> &mut DayBook {
        self.days.entry(day).or_default()
    }
}

/// Proof of admission. Consumed by [`CapsLedger::settle`], which releases the hold.
#[derive(Debug)]
pub struct CapAdmission {
    keys: Vec<String>,
    money: Option<Money>,
    day: NaiveDate,
}

impl CapAdmission {
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CapsEvent {
    Admitted {
        keys: Vec<String>,
        money: Option<Money>,
        day: NaiveDate,
        at: DateTime<Utc>,
    },
    Settled {
        keys: Vec<String>,
        money: Option<Money>,
        day: NaiveDate,
        money_moved: bool,
        at: DateTime<Utc>,
    },
}

pub struct CapsLedger {
    config: CapsConfig,
    books: Mutex<HashMap<String, Arc<Mutex<KeyBook>>>>,
    log: ReplayLog<CapsEvent>,
    clock: Arc<dyn Clock>,
}

impl CapsLedger {
    pub fn new(config: CapsConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_log(config, ReplayLog::memory(), clock)
    }

    pub fn with_log(config: CapsConfig, log: ReplayLog<CapsEvent>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            books: Mutex::new(HashMap::new()),
            log,
            clock,
        }
    }

    /// Rebuild totals from a replay log. Holds of admissions that never settled
    /// are kept, so a crash can only make the ledger more conservative.
    pub fn restore(
        config: CapsConfig,
        log: ReplayLog<CapsEvent>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let ledger = Self::with_log(config, ReplayLog::memory(), clock);
        for event in log.events()? {
            match event {
                CapsEvent::Admitted {
                    keys, money, day, ..
                } => {
                    for book in ledger.books_for(&keys)? {
                        let mut book = lock_book(&book)?;
                        apply_admission(book.day(day), money.as_ref());
                    }
                }
                CapsEvent::Settled {
                    keys,
                    money,
                    day,
                    money_moved,
                    ..
                } => {
                    for book in ledger.books_for(&keys)? {
                        let mut book = lock_book(&book)?;
                        apply_settlement(book.day(day), money.as_ref(), money_moved);
                    }
                }
            }
        }
        Ok(Self { log, ..ledger })
    }

    pub fn config(&self) -> &CapsConfig {
        &self.config
    }

    /// Admit one attempt against every key, or block without side effects.
    pub fn check_and_reserve(
        &self,
        scopes: &[CapScope],
        money: Option<&Money>,
        day: NaiveDate,
    ) -> Result<CapAdmission, CapError> {
        let mut scopes = scopes.to_vec();
        scopes.sort_by_key(CapScope::key);
        scopes.dedup();
        let keys: Vec<String> = scopes.iter().map(CapScope::key).collect();

        let books = self.books_for(&keys)?;
        let mut guards: Vec<MutexGuard<'_, KeyBook>> = Vec::with_capacity(books.len());
        for book in &books {
            guards.push(lock_book(book)?);
        }

        for (scope, guard) in scopes.iter().zip(guards.iter_mut()) {
            let limits = self.config.limits_for(scope);
            let totals = guard.day(day);

            if let Some(max_attempts) = limits.max_attempts_per_day {
                if totals.attempts >= max_attempts {
                    debug!(scope_key = %scope, max_attempts, "attempt rate limit reached");
                    return Err(CapError::RateLimited {
                        scope_key: scope.key(),
                        max_attempts,
                    });
                }
            }

            if let Some(money) = money {
                if let Some(&limit) = limits.daily_spend_minor.get(&money.currency) {
                    let spent = totals.spent.get(&money.currency).copied().unwrap_or(0);
                    let pending = totals.pending.get(&money.currency).copied().unwrap_or(0);
                    let committed = spent.saturating_add(pending);
                    if committed.saturating_add(money.amount_minor) > limit {
                        debug!(scope_key = %scope, committed, limit, "daily cap exceeded");
                        return Err(CapError::CapExceeded {
                            scope_key: scope.key(),
                            currency: money.currency.clone(),
                            limit_minor: limit,
                            attempted_minor: money.amount_minor,
                        });
                    }
                }
            }
        }

        self.log.append(&CapsEvent::Admitted {
            keys: keys.clone(),
            money: money.cloned(),
            day,
            at: self.clock.now(),
        })?;
        for guard in guards.iter_mut() {
            apply_admission(guard.day(day), money);
        }

        info!(keys = ?keys, %day, "caps admitted");
        Ok(CapAdmission {
            keys,
            money: money.cloned(),
            day,
        })
    }

    /// Release the hold; spend counts only when money actually moved.
    pub fn settle(&self, admission: CapAdmission, money_moved: bool) -> Result<(), CapError> {
        let books = self.books_for(&admission.keys)?;
        let mut guards: Vec<MutexGuard<'_, KeyBook>> = Vec::with_capacity(books.len());
        for book in &books {
            guards.push(lock_book(book)?);
        }

        self.log.append(&CapsEvent::Settled {
            keys: admission.keys.clone(),
            money: admission.money.clone(),
            day: admission.day,
            money_moved,
            at: self.clock.now(),
        })?;
        for guard in guards.iter_mut() {
            apply_settlement(guard.day(admission.day), admission.money.as_ref(), money_moved);
        }

        debug!(keys = ?admission.keys, money_moved, "caps settled");
        Ok(())
    }

    /// Totals for one key, currency and day.
    pub fn record(
        &self,
        scope: &CapScope,
        currency: &str,
        day: NaiveDate,
    ) -> Result<CapRecord, CapError> {
        let book = {
            let books = self
                .books
                .lock()
                .map_err(|_| StorageError::LockPoisoned("caps ledger"))?;
            match books.get(&scope.key()) {
                Some(book) => Arc::clone(book),
                None => return Ok(CapRecord::default()),
            }
        };
        let book = lock_book(&book)?;
        Ok(book
            .days
            .get(&day)
            .map(|totals| CapRecord {
                spent_minor: totals.spent.get(currency).copied().unwrap_or(0),
                pending_minor: totals.pending.get(currency).copied().unwrap_or(0),
                attempts: totals.attempts,
            })
            .unwrap_or_default())
    }

    /// Books for `keys` in the given (sorted) order, created on first use.
    fn books_for(&self, keys: &[String]) -> Result<Vec<Arc<Mutex<KeyBook>>>, StorageError> {
        let mut books = self
            .books
            .lock()
            .map_err(|_| StorageError::LockPoisoned("caps ledger"))?;
        Ok(keys
            .iter()
            .map(|key| Arc::clone(books.entry(key.clone()).or_default()))
            .collect())
    }
}

fn lock_book(book: &Arc<Mutex<KeyBook>>) -> Result<MutexGuard<'_, KeyBook>, StorageError> {
    book.lock()
        .map_err(|_| StorageError::LockPoisoned("caps key"))
}

fn apply_admission(totals: &mut DayBook, money: Option<&Money>) {
    totals.attempts = totals.attempts.saturating_add(1);
    if let Some(money) = money {
        let pending = totals.pending.entry(money.currency.clone()).or_insert(0);
        *pending = pending.saturating_add(money.amount_minor);
    }
}

fn apply_settlement(totals: &mut DayBook, money: Option<&Money>, money_moved: bool) {
    if let Some(money) = money {
        let pending = totals.pending.entry(money.currency.clone()).or_insert(0);
        *pending = pending.saturating_sub(money.amount_minor);
        if money_moved {
            let spent = totals.spent.entry(money.currency.clone()).or_insert(0);
            *spent = spent.saturating_add(money.amount_minor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn gbp(amount_minor: u64) -> Money {
        Money {
            amount_minor,
            currency: "GBP".to_string(),
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, 1).unwrap()
    }

    fn scopes() -> Vec<CapScope> {
        vec![
            CapScope::Circle(CircleId::new("alice")),
            CapScope::Intersection(IntersectionId::new("ix-1")),
            CapScope::Payee("P1".to_string()),
        ]
    }

    fn ledger(config: CapsConfig) -> CapsLedger {
        CapsLedger::new(config, Arc::new(SystemClock))
    }

    #[test]
    fn exceeding_any_key_blocks_without_side_effects() {
        let config = CapsConfig {
            payee: CapLimits::default().with_daily_spend("GBP", 150),
            ..CapsConfig::default()
        };
        let caps = ledger(config);

        let admission = caps.check_and_reserve(&scopes(), Some(&gbp(100)), day()).unwrap();
        caps.settle(admission, true).unwrap();

        let err = caps
            .check_and_reserve(&scopes(), Some(&gbp(100)), day())
            .unwrap_err();
        assert_eq!(
            err,
            CapError::CapExceeded {
                scope_key: "payee:P1".to_string(),
                currency: "GBP".to_string(),
                limit_minor: 150,
                attempted_minor: 100,
            }
        );

        let circle = caps
            .record(&CapScope::Circle(CircleId::new("alice")), "GBP", day())
            .unwrap();
        assert_eq!(circle, CapRecord { spent_minor: 100, pending_minor: 0, attempts: 1 });
    }

    #[test]
    fn attempts_count_even_when_no_money_moves() {
        let config = CapsConfig {
            circle: CapLimits::default().with_max_attempts(2),
            ..CapsConfig::default()
        };
        let caps = ledger(config);

        for _ in 0..2 {
            let admission = caps.check_and_reserve(&scopes(), Some(&gbp(10)), day()).unwrap();
            caps.settle(admission, false).unwrap();
        }
        assert!(matches!(
            caps.check_and_reserve(&scopes(), Some(&gbp(10)), day()),
            Err(CapError::RateLimited { max_attempts: 2, .. })
        ));

        let record = caps
            .record(&CapScope::Circle(CircleId::new("alice")), "GBP", day())
            .unwrap();
        assert_eq!(record.spent_minor, 0);
        assert_eq!(record.attempts, 2);

        let tomorrow = day().succ_opt().unwrap();
        assert!(caps.check_and_reserve(&scopes(), Some(&gbp(10)), tomorrow).is_ok());
    }

    #[test]
    fn pending_hold_prevents_joint_overrun() {
        let config = CapsConfig::default().with_override(
            &CapScope::Intersection(IntersectionId::new("ix-1")),
            CapLimits::default().with_daily_spend("GBP", 100),
        );
        let caps = ledger(config);

        let first = caps.check_and_reserve(&scopes(), Some(&gbp(60)), day()).unwrap();
        assert!(matches!(
            caps.check_and_reserve(&scopes(), Some(&gbp(60)), day()),
            Err(CapError::CapExceeded { .. })
        ));
        caps.settle(first, false).unwrap();
        assert!(caps.check_and_reserve(&scopes(), Some(&gbp(60)), day()).is_ok());
    }

    #[test]
    fn concurrent_admissions_never_exceed_cap() {
        let config = CapsConfig {
            intersection: CapLimits::default().with_daily_spend("GBP", 500),
            ..CapsConfig::default()
        };
        let caps = Arc::new(ledger(config));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let caps = Arc::clone(&caps);
                std::thread::spawn(move || {
                    caps.check_and_reserve(&scopes(), Some(&gbp(100)), day())
                        .map(|admission| caps.settle(admission, true))
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);

        let record = caps
            .record(&CapScope::Intersection(IntersectionId::new("ix-1")), "GBP", day())
            .unwrap();
        assert_eq!(record.spent_minor, 500);
    }

    #[test]
    fn restore_rebuilds_spend_and_keeps_unsettled_holds() {
        let path = std::env::temp_dir()
            .join(format!("intersect-caps-{}", uuid::Uuid::new_v4()))
            .join("caps.jsonl");
        let config = CapsConfig {
            payee: CapLimits::default().with_daily_spend("GBP", 300),
            ..CapsConfig::default()
        };
        {
            let caps = CapsLedger::with_log(
                config.clone(),
                ReplayLog::file(&path).unwrap(),
                Arc::new(SystemClock),
            );
            let settled = caps.check_and_reserve(&scopes(), Some(&gbp(100)), day()).unwrap();
            caps.settle(settled, true).unwrap();
            let _crashed = caps.check_and_reserve(&scopes(), Some(&gbp(150)), day()).unwrap();
        }

        let restored =
            CapsLedger::restore(config, ReplayLog::file(&path).unwrap(), Arc::new(SystemClock)).unwrap();
        let payee = restored
            .record(&CapScope::Payee("P1".to_string()), "GBP", day())
            .unwrap();
        assert_eq!(payee, CapRecord { spent_minor: 100, pending_minor: 150, attempts: 2 });
        assert!(matches!(
            restored.check_and_reserve(&scopes(), Some(&gbp(100)), day()),
            Err(CapError::CapExceeded { .. })
        ));
    }
}
