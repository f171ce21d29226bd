use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{digest_json, digest_parts};
use crate::envelope::ExecutionEnvelope;
use crate::error::ApprovalError;
use crate::types::{IntersectionId, Scope, DOMAIN_CALENDAR};

/// Urgency and pressure vocabulary that may not appear in approval text.
const COERCIVE_TERMS: &[&str] = &[
    "urgent",
    "urgently",
    "immediately",
    "asap",
    "hurry",
    "now or never",
    "act now",
    "last chance",
    "final notice",
    "final warning",
    "limited time",
    "don't miss",
    "do not miss",
    "expires soon",
    "or else",
    "you must",
    "must approve",
    "penalty",
    "consequences",
    "overdue",
    "right away",
];

/// Return the coercive terms found in `text`, matched on word boundaries.
pub fn coercive_terms(text: &str) -> Vec<String> {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    let words: Vec<&str> = normalized.split_whitespace().collect();
    let padded = format!(" {} ", words.join(" "));

    let mut found: Vec<String> = COERCIVE_TERMS
        .iter()
        .filter(|term| padded.contains(&format!(" {term} ")))
        .map(|term| term.to_string())
        .collect();
    if text.contains('!') {
        found.push("!".to_string());
    }
    found
}

pub fn check_neutral_text(text: &str) -> Result<(), ApprovalError> {
    let found = coercive_terms(text);
    if found.is_empty() {
        Ok(())
    } else {
        Err(ApprovalError::NonNeutralLanguage(found))
    }
}

/// The exact content every approver sees. Built from structured envelope
/// fields only; free-text parameters such as event titles are never rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalBundle {
    pub envelope_id: String,
    pub action_hash: String,
    pub intersection_id: IntersectionId,
    pub contract_version: u64,
    pub action_type: String,
    pub scopes: Vec<Scope>,
    pub summary: String,
    /// Fixed wording of `summary` with every circle-supplied value replaced
    /// by `{}`. The neutrality check runs over this, not over the values.
    #[serde(default)]
    pub wording: String,
    pub created_at: DateTime<Utc>,
    pub bundle_hash: String,
}

#[derive(Serialize)]
struct BundleMaterial<'a> {
    envelope_id: &'a str,
    action_hash: &'a str,
    intersection_id: &'a IntersectionId,
    contract_version: u64,
    action_type: &'a str,
    scopes: &'a [Scope],
    summary: &'a str,
    created_at: DateTime<Utc>,
}

impl ApprovalBundle {
    pub fn from_envelope(
        envelope: &ExecutionEnvelope,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ApprovalError> {
        let Rendered { text: summary, wording } = summarize(envelope);
        check_neutral_text(&wording)?;

        let material = BundleMaterial {
            envelope_id: envelope.envelope_id(),
            action_hash: envelope.action_hash(),
            intersection_id: envelope.intersection_id(),
            contract_version: envelope.contract_version(),
            action_type: envelope.action().action_type(),
            scopes: envelope.scopes_used(),
            summary: &summary,
            created_at,
        };
        let bundle_hash = format!(
            "bnd-{}",
            &digest_parts(&[&digest_json(&material)?])[..32]
        );

        Ok(Self {
            envelope_id: envelope.envelope_id().to_string(),
            action_hash: envelope.action_hash().to_string(),
            intersection_id: envelope.intersection_id().clone(),
            contract_version: envelope.contract_version(),
            action_type: envelope.action().action_type().to_string(),
            scopes: envelope.scopes_used().to_vec(),
            summary,
            wording,
            created_at,
            bundle_hash,
        })
    }

    /// Text shown to an approver. Identical for every approver.
    pub fn text(&self) -> &str {
        &self.summary
    }

    pub fn wording(&self) -> &str {
        &self.wording
    }
}

/// Summary text alongside the fixed wording it was rendered from. Values
/// chosen by circles (payees, identifiers, scopes) only appear in `text`.
#[derive(Default)]
struct Rendered {
    text: String,
    wording: String,
}

impl Rendered {
    fn fixed(&mut self, wording: &str) -> &mut Self {
        self.text.push_str(wording);
        self.wording.push_str(wording);
        self
    }

    fn value(&mut self, value: impl std::fmt::Display) -> &mut Self {
        self.text.push_str(&value.to_string());
        self.wording.push_str(VALUE_SLOT);
        self
    }
}

const VALUE_SLOT: &str = "{}";

fn summarize(envelope: &ExecutionEnvelope) -> Rendered {
    let action = envelope.action();
    let scopes = envelope
        .scopes_used()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = Rendered::default();
    match (action.action_type(), action.money(), action.payee(), action.event_window()) {
        ("payment.transfer", Some(money), Some(payee), _) => {
            out.fixed("Transfer ").value(money).fixed(" to payee ").value(payee);
        }
        (_, _, _, Some((start, end))) if action.domain() == DOMAIN_CALENDAR => {
            out.fixed("Create a calendar event from ")
                .value(start.format("%Y-%m-%d %H:%M"))
                .fixed(" to ")
                .value(end.format("%Y-%m-%d %H:%M"))
                .fixed(" UTC");
        }
        (action_type, _, _, _) => {
            out.fixed("Perform ").value(action_type);
        }
    }

    out.fixed(" for intersection ")
        .value(envelope.intersection_id())
        .fixed(" under contract version ")
        .value(envelope.contract_version())
        .fixed(". Requested by ")
        .value(envelope.actor_circle_id())
        .fixed(". Scopes: ")
        .value(scopes)
        .fixed(".");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{seal, SealParams};
    use crate::types::{Action, CircleId, Mode};
    use chrono::TimeZone;

    fn sealed(action: Action, scope: Scope) -> ExecutionEnvelope {
        seal(
            action,
            SealParams {
                trace_id: "t-1".to_string(),
                actor_circle_id: CircleId::new("alice"),
                contract_version: 1,
                mode: Mode::Execute,
                scopes: vec![scope],
                authorization_proof_id: "proof-1".to_string(),
                approval: None,
            },
            Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn flags_urgency_on_word_boundaries() {
        assert_eq!(
            coercive_terms("Please approve IMMEDIATELY, last chance"),
            vec!["immediately".to_string(), "last chance".to_string()]
        );
        assert!(coercive_terms("Transfer 1.00 GBP to payee P1").is_empty());
        // substring of a longer word is not a match
        assert!(coercive_terms("Hurryville bakery payment").is_empty());
        assert!(check_neutral_text("Approve now!").is_err());
    }

    #[test]
    fn payee_names_are_not_scanned_as_wording() {
        for payee in ["Penalty Co", "Overdue Accounts Ltd", "Act Now Ltd!"] {
            let envelope = sealed(Action::transfer("ix-1", 100, "GBP", payee), Scope::write("finance"));
            let bundle = ApprovalBundle::from_envelope(&envelope, envelope.issued_at()).unwrap();
            assert!(bundle.text().contains(payee));
            assert!(!bundle.wording().contains(payee));
            assert!(coercive_terms(bundle.wording()).is_empty());
        }
    }

    #[test]
    fn calendar_summary_shows_start_and_end() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 23, 30, 0).unwrap();
        let end = start + chrono::Duration::minutes(90);
        let envelope = sealed(
            Action::create_event("ix-1", "Planning", start, end),
            Scope::write("calendar"),
        );
        let bundle = ApprovalBundle::from_envelope(&envelope, envelope.issued_at()).unwrap();
        assert!(bundle.text().starts_with(
            "Create a calendar event from 2026-06-01 23:30 to 2026-06-02 01:00 UTC"
        ));
        // free-text titles are never rendered
        assert!(!bundle.text().contains("Planning"));
    }
}
