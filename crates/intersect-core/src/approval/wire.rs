//! Portable approval token: `apv1.` + base64url(JSON claims), decodable offline.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApprovalError;
use crate::types::IntersectionId;

pub const TOKEN_PREFIX: &str = "apv1.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub token_id: String,
    pub action_hash: String,
    pub intersection_id: IntersectionId,
    pub action_summary: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenClaims {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn encode(&self) -> Result<String, ApprovalError> {
        let json = serde_json::to_vec(self).map_err(|e| ApprovalError::WireFormat(e.to_string()))?;
        Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
    }

    pub fn decode(token: &str) -> Result<Self, ApprovalError> {
        let body = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| ApprovalError::WireFormat("missing apv1 prefix".to_string()))?;
        let json = URL_SAFE_NO_PAD
            .decode(body.trim_end_matches('='))
            .map_err(|e| ApprovalError::WireFormat(format!("invalid base64: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| ApprovalError::WireFormat(format!("invalid claims: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn claims() -> TokenClaims {
        TokenClaims {
            token_id: "tok-1".to_string(),
            action_hash: "abc".to_string(),
            intersection_id: IntersectionId::new("ix-1"),
            action_summary: "Transfer 1.00 GBP to payee P1".to_string(),
            expires_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn decodes_what_it_encodes_and_checks_expiry() {
        let wire = claims().encode().unwrap();
        assert!(wire.starts_with("apv1."));
        assert!(!wire.contains('+') && !wire.contains('/'));

        let decoded = TokenClaims::decode(&wire).unwrap();
        assert_eq!(decoded, claims());
        assert!(!decoded.is_expired(decoded.expires_at - Duration::seconds(1)));
        assert!(decoded.is_expired(decoded.expires_at));
    }

    #[test]
    fn rejects_foreign_tokens() {
        assert!(matches!(TokenClaims::decode("apv2.e30"), Err(ApprovalError::WireFormat(_))));
        assert!(matches!(TokenClaims::decode("apv1.***"), Err(ApprovalError::WireFormat(_))));
        assert!(matches!(TokenClaims::decode("apv1.e30"), Err(ApprovalError::WireFormat(_))));
    }
}
