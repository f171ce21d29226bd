use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Identity/account boundary (person, household, institution).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircleId(String);

impl CircleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CircleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CircleId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a negotiated contract between circles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntersectionId(String);

impl IntersectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntersectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntersectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How far an envelope is allowed to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    SuggestOnly,
    Simulate,
    Execute,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Self::SuggestOnly => "suggest_only",
            Self::Simulate => "simulate",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeDirection {
    Read,
    Write,
}

/// A granted or requested capability, rendered as `name:read` / `name:write`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub direction: ScopeDirection,
}

impl Scope {
    pub fn read(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ScopeDirection::Read,
        }
    }

    pub fn write(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: ScopeDirection::Write,
        }
    }

    pub fn is_write(&self) -> bool {
        self.direction == ScopeDirection::Write
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            ScopeDirection::Read => "read",
            ScopeDirection::Write => "write",
        };
        write!(f, "{}:{}", self.name, direction)
    }
}

impl FromStr for Scope {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (name, direction) = value
            .rsplit_once(':')
            .ok_or_else(|| ValidationError::InvalidScope(value.to_string()))?;
        if name.is_empty() {
            return Err(ValidationError::InvalidScope(value.to_string()));
        }
        match direction {
            "read" => Ok(Self::read(name)),
            "write" => Ok(Self::write(name)),
            _ => Err(ValidationError::InvalidScope(value.to_string())),
        }
    }
}

/// Amount in minor units plus ISO currency code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: u64,
    pub currency: String,
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:02} {}",
            self.amount_minor / 100,
            self.amount_minor % 100,
            self.currency
        )
    }
}

pub const PARAM_AMOUNT_MINOR: &str = "amount_minor";
pub const PARAM_CURRENCY: &str = "currency";
pub const PARAM_PAYEE: &str = "payee";
pub const PARAM_START: &str = "start";
pub const PARAM_END: &str = "end";
pub const PARAM_TITLE: &str = "title";

pub const DOMAIN_PAYMENT: &str = "payment";
pub const DOMAIN_CALENDAR: &str = "calendar";

/// A proposed action against a shared resource. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    action_id: String,
    intersection_id: IntersectionId,
    action_type: String,
    parameters: BTreeMap<String, Value>,
}

impl Action {
    pub fn new(intersection_id: impl Into<IntersectionId>, action_type: impl Into<String>) -> Self {
        Self {
            action_id: Uuid::new_v4().to_string(),
            intersection_id: intersection_id.into(),
            action_type: action_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = action_id.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// `payment.transfer` of `amount_minor` to `payee`.
    pub fn transfer(
        intersection_id: impl Into<IntersectionId>,
        amount_minor: u64,
        currency: impl Into<String>,
        payee: impl Into<String>,
    ) -> Self {
        Self::new(intersection_id, "payment.transfer")
            .with_param(PARAM_AMOUNT_MINOR, amount_minor)
            .with_param(PARAM_CURRENCY, Value::String(currency.into()))
            .with_param(PARAM_PAYEE, Value::String(payee.into()))
    }

    /// `calendar.create_event` between `start` and `end`.
    pub fn create_event(
        intersection_id: impl Into<IntersectionId>,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self::new(intersection_id, "calendar.create_event")
            .with_param(PARAM_TITLE, Value::String(title.into()))
            .with_param(PARAM_START, start.to_rfc3339())
            .with_param(PARAM_END, end.to_rfc3339())
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn intersection_id(&self) -> &IntersectionId {
        &self.intersection_id
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Resource domain of the action type (`payment` for `payment.transfer`).
    pub fn domain(&self) -> &str {
        self.action_type
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.action_type)
    }

    /// Money moved by this action, if it carries an amount.
    pub fn money(&self) -> Option<Money> {
        let amount_minor = self.parameters.get(PARAM_AMOUNT_MINOR)?.as_u64()?;
        let currency = self.param_str(PARAM_CURRENCY)?;
        Some(Money {
            amount_minor,
            currency: currency.to_string(),
        })
    }

    pub fn payee(&self) -> Option<&str> {
        self.param_str(PARAM_PAYEE)
    }

    pub fn event_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = DateTime::parse_from_rfc3339(self.param_str(PARAM_START)?).ok()?;
        let end = DateTime::parse_from_rfc3339(self.param_str(PARAM_END)?).ok()?;
        Some((start.with_timezone(&Utc), end.with_timezone(&Utc)))
    }
}

/// Structural limit an action must fall within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ceiling {
    /// Events must start and end inside `[start_hour, end_hour)` UTC.
    TimeWindow { start_hour: u32, end_hour: u32 },
    /// Events may not run longer than `minutes`.
    MaxEventMinutes { minutes: i64 },
    /// A single action may not move more than `amount_minor` of `currency`.
    MaxAmount { currency: String, amount_minor: u64 },
    /// Payments may only go to listed payees.
    PayeeAllowlist { payees: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalPolicy {
    Single,
    Multi { threshold: u32 },
}

impl ApprovalPolicy {
    pub fn threshold(&self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Multi { threshold } => *threshold,
        }
    }

    pub fn requires_bundle(&self) -> bool {
        matches!(self, Self::Multi { .. })
    }
}

/// Versioned agreement between circles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    pub intersection_id: IntersectionId,
    pub version: u64,
    pub parties: Vec<CircleId>,
    pub scopes: Vec<Scope>,
    pub ceilings: Vec<Ceiling>,
    pub approval_policy: ApprovalPolicy,
}

impl Contract {
    pub fn new(
        intersection_id: impl Into<IntersectionId>,
        version: u64,
        parties: Vec<CircleId>,
    ) -> Self {
        Self {
            intersection_id: intersection_id.into(),
            version,
            parties,
            scopes: Vec::new(),
            ceilings: Vec::new(),
            approval_policy: ApprovalPolicy::Single,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scopes.push(scope);
        self
    }

    pub fn with_ceiling(mut self, ceiling: Ceiling) -> Self {
        self.ceilings.push(ceiling);
        self
    }

    pub fn with_approval_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.approval_policy = policy;
        self
    }

    pub fn is_party(&self, circle: &CircleId) -> bool {
        self.parties.contains(circle)
    }

    /// Exact match on name and direction; a write grant does not imply read.
    pub fn grants(&self, scope: &Scope) -> bool {
        self.scopes.contains(scope)
    }
}
