//! Governance hierarchy: customers, teams, virtual keys, budgets and rate limits

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::KeyRef;
use crate::{Error, Result};

/// Caller-facing access token carrying governance policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualKey {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Empty = every model the attached keys allow
    #[serde(default)]
    pub allowed_models: Vec<String>,

    #[serde(default)]
    pub team_id: Option<String>,

    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub budget_id: Option<String>,

    #[serde(default)]
    pub rate_limit_id: Option<String>,

    /// Natural ids of the provider keys this virtual key may use
    #[serde(default)]
    pub key_ids: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl VirtualKey {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            is_active: true,
            allowed_models: Vec::new(),
            team_id: None,
            customer_id: None,
            budget_id: None,
            rate_limit_id: None,
            key_ids: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("virtual key", &self.id)?;
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Virtual key {} must have a name",
                self.id
            )));
        }
        if self.team_id.is_some() && self.customer_id.is_some() {
            return Err(Error::Validation(format!(
                "Virtual key {} cannot belong to both a team and a customer",
                self.id
            )));
        }
        let mut seen = HashSet::new();
        for key_id in &self.key_ids {
            if !seen.insert(key_id) {
                return Err(Error::Conflict(format!(
                    "Virtual key {} lists key {} more than once",
                    self.id, key_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub budget_id: Option<String>,
}

impl Team {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            customer_id: None,
            budget_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("team", &self.id)?;
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!("Team {} must have a name", self.id)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: String,

    #[serde(default)]
    pub budget_id: Option<String>,
}

impl Customer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            budget_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("customer", &self.id)?;
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!(
                "Customer {} must have a name",
                self.id
            )));
        }
        Ok(())
    }
}

/// Spend ceiling owned by exactly one of {virtual key, team, customer}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub max_limit: f64,

    /// Reset window, e.g. `30d`
    pub reset_duration: String,

    #[serde(default)]
    pub current_usage: f64,

    pub last_reset: DateTime<Utc>,
}

impl Budget {
    pub fn new(id: impl Into<String>, max_limit: f64, reset_duration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_limit,
            reset_duration: reset_duration.into(),
            current_usage: 0.0,
            last_reset: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("budget", &self.id)?;
        if !self.max_limit.is_finite() || self.max_limit < 0.0 {
            return Err(Error::Validation(format!(
                "Budget {}: max limit must be a non-negative number",
                self.id
            )));
        }
        if !self.current_usage.is_finite() || self.current_usage < 0.0 {
            return Err(Error::Validation(format!(
                "Budget {}: current usage must be a non-negative number",
                self.id
            )));
        }
        parse_reset_duration(&self.reset_duration)?;
        Ok(())
    }
}

/// Request-rate ceiling owned by exactly one virtual key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub id: String,

    #[serde(default)]
    pub token_max_limit: Option<i64>,

    #[serde(default)]
    pub request_max_limit: Option<i64>,

    /// Window, e.g. `1m`
    pub reset_duration: String,

    #[serde(default)]
    pub token_current_usage: i64,

    #[serde(default)]
    pub request_current_usage: i64,

    pub last_reset: DateTime<Utc>,
}

impl RateLimit {
    pub fn new(id: impl Into<String>, reset_duration: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token_max_limit: None,
            request_max_limit: None,
            reset_duration: reset_duration.into(),
            token_current_usage: 0,
            request_current_usage: 0,
            last_reset: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_id("rate limit", &self.id)?;
        if self.token_max_limit.is_none() && self.request_max_limit.is_none() {
            return Err(Error::Validation(format!(
                "Rate limit {} must set a token or request limit",
                self.id
            )));
        }
        for limit in [self.token_max_limit, self.request_max_limit]
            .into_iter()
            .flatten()
        {
            if limit <= 0 {
                return Err(Error::Validation(format!(
                    "Rate limit {}: limits must be positive",
                    self.id
                )));
            }
        }
        parse_reset_duration(&self.reset_duration)?;
        Ok(())
    }
}

/// The single parent that owns a budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetOwner {
    VirtualKey(String),
    Team(String),
    Customer(String),
}

impl BudgetOwner {
    /// Resolve the owner from every parent row that references a budget.
    ///
    /// Zero or more than one referencing parent is a conflict.
    pub fn from_references(
        budget_id: &str,
        virtual_keys: &[String],
        teams: &[String],
        customers: &[String],
    ) -> Result<Self> {
        let total = virtual_keys.len() + teams.len() + customers.len();
        if total != 1 {
            return Err(Error::Conflict(format!(
                "Budget {} must be owned by exactly one virtual key, team or customer (found {})",
                budget_id, total
            )));
        }

        if let Some(id) = virtual_keys.first() {
            Ok(Self::VirtualKey(id.clone()))
        } else if let Some(id) = teams.first() {
            Ok(Self::Team(id.clone()))
        } else {
            Ok(Self::Customer(customers[0].clone()))
        }
    }
}

/// Relations to load alongside a governance read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expand {
    pub team: bool,
    pub customer: bool,
    pub budget: bool,
    pub rate_limit: bool,
    pub keys: bool,
    /// Teams of a customer
    pub teams: bool,
}

impl Expand {
    pub const NONE: Expand = Expand {
        team: false,
        customer: false,
        budget: false,
        rate_limit: false,
        keys: false,
        teams: false,
    };

    pub const ALL: Expand = Expand {
        team: true,
        customer: true,
        budget: true,
        rate_limit: true,
        keys: true,
        teams: true,
    };
}

/// Virtual key with its expanded relations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualKeyRecord {
    #[serde(flatten)]
    pub virtual_key: VirtualKey,
    pub team: Option<Team>,
    pub customer: Option<Customer>,
    pub budget: Option<Budget>,
    pub rate_limit: Option<RateLimit>,
    pub keys: Vec<KeyRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRecord {
    #[serde(flatten)]
    pub team: Team,
    pub customer: Option<Customer>,
    pub budget: Option<Budget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    #[serde(flatten)]
    pub customer: Customer,
    pub teams: Vec<Team>,
    pub budget: Option<Budget>,
}

/// Parse a reset window such as `30s`, `5m`, `1h`, `1d`, `1w`, `1M` or `1Y`.
///
/// Months count as 30 days and years as 365 days.
pub fn parse_reset_duration(value: &str) -> Result<chrono::Duration> {
    let invalid = || Error::Validation(format!("Invalid reset duration: {:?}", value));

    let value = value.trim();
    let unit = value.chars().last().ok_or_else(invalid)?;
    let amount: i64 = value[..value.len() - unit.len_utf8()]
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }

    let duration = match unit {
        's' => chrono::Duration::try_seconds(amount),
        'm' => chrono::Duration::try_minutes(amount),
        'h' => chrono::Duration::try_hours(amount),
        'd' => chrono::Duration::try_days(amount),
        'w' => chrono::Duration::try_weeks(amount),
        'M' => amount.checked_mul(30).and_then(chrono::Duration::try_days),
        'Y' => amount.checked_mul(365).and_then(chrono::Duration::try_days),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

fn require_id(entity: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} id must not be empty", entity)));
    }
    Ok(())
}
