use chrono::{TimeZone, Utc};
use intersect_core::caps::{CapLimits, CapScope, CapsConfig, CapsLedger};
use intersect_core::clock::{Clock, ManualClock};
use intersect_core::envelope::{seal, ExecutionEnvelope, SealParams};
use intersect_core::types::{Action, CircleId, Mode, Money, Scope};
use proptest::prelude::*;
use std::sync::Arc;

fn arb_attempts() -> impl Strategy<Value = Vec<(u64, bool)>> {
    prop::collection::vec((1u64..400, any::<bool>()), 1..24)
}

fn sealed_transfer(amount_minor: u64) -> ExecutionEnvelope {
    seal(
        Action::transfer("ix-1", amount_minor, "GBP", "P1"),
        SealParams {
            trace_id: "trace-prop".to_string(),
            actor_circle_id: CircleId::new("alice"),
            contract_version: 1,
            mode: Mode::Execute,
            scopes: vec![Scope::write("finance")],
            authorization_proof_id: "proof-prop".to_string(),
            approval: None,
        },
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
    )
    .unwrap()
}

proptest! {
    /// Whatever mix of admitted, failed and settled attempts, spend stays under the cap.
    #[test]
    fn daily_spend_never_exceeds_cap(attempts in arb_attempts(), limit in 100u64..1_000) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let config = CapsConfig {
            circle: CapLimits::default().with_daily_spend("GBP", limit),
            ..CapsConfig::default()
        };
        let ledger = CapsLedger::new(config, Arc::clone(&clock));
        let scope = CapScope::Circle(CircleId::new("alice"));

        for (amount_minor, moved) in attempts {
            let money = Money { amount_minor, currency: "GBP".to_string() };
            if let Ok(admission) =
                ledger.check_and_reserve(std::slice::from_ref(&scope), Some(&money), clock.today())
            {
                ledger.settle(admission, moved).unwrap();
            }
        }

        let record = ledger.record(&scope, "GBP", clock.today()).unwrap();
        prop_assert!(record.spent_minor <= limit);
        prop_assert_eq!(record.pending_minor, 0);
    }

    /// Changing the amount after sealing always breaks the action hash.
    #[test]
    fn altered_amount_fails_hash_check(original in 1u64..1_000_000, altered in 1u64..1_000_000) {
        prop_assume!(original != altered);
        let envelope = sealed_transfer(original);
        prop_assert!(envelope.verify_hash().is_ok());

        let mut raw = serde_json::to_value(&envelope).unwrap();
        raw["action"]["parameters"]["amount_minor"] = serde_json::json!(altered);
        let tampered: ExecutionEnvelope = serde_json::from_value(raw).unwrap();
        prop_assert!(tampered.verify_hash().is_err());
    }
}
