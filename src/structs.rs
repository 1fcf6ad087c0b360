use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Largest amount a single transaction may carry (`numeric(12, 2)`).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(3_567_587_327, 232, 0, false, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored transaction. Rows are never updated once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: UserId,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
    pub category: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_confirmed: bool,
}

/// A validated transaction that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub category: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

impl FieldError {
    fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

/// Body of `POST /api/transactions`, as JSON or as a URL-encoded form.
///
/// Every field is optional here so that missing fields are reported by
/// [`TransactionRequest::validate`] together with the other problems.
#[derive(Debug, Default, Deserialize)]
pub struct TransactionRequest {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TransactionRequest {
    pub fn validate(self) -> Result<NewTransaction, Vec<FieldError>> {
        let mut errors = Vec::new();

        let amount = match self.amount {
            Some(amount) if amount <= Decimal::ZERO => {
                errors.push(FieldError::new("amount", "must be positive"));
                None
            }
            Some(amount) if amount > MAX_AMOUNT => {
                errors.push(FieldError::new("amount", "is too large"));
                None
            }
            Some(amount) if !in_cents(amount) => {
                errors.push(FieldError::new("amount", "must have at most two decimal places"));
                None
            }
            Some(amount) => Some(amount),
            None => {
                errors.push(FieldError::new("amount", "is required"));
                None
            }
        };

        let kind = match self.kind.as_deref().map(str::parse::<TransactionKind>) {
            Some(Ok(kind)) => Some(kind),
            Some(Err(_)) => {
                errors.push(FieldError::new("type", "must be income or expense"));
                None
            }
            None => {
                errors.push(FieldError::new("type", "is required"));
                None
            }
        };

        let category = match self.category.map(|c| c.trim().to_string()) {
            Some(category) if !category.is_empty() => Some(category),
            _ => {
                errors.push(FieldError::new("category", "must not be empty"));
                None
            }
        };

        match (amount, kind, category) {
            (Some(amount), Some(kind), Some(category)) if errors.is_empty() => Ok(NewTransaction {
                amount,
                kind,
                category,
                description: non_blank(self.description),
            }),
            _ => Err(errors),
        }
    }
}

/// Whether `amount` fits the two decimal places the ledger stores.
pub fn in_cents(amount: Decimal) -> bool {
    amount.normalize().scale() <= 2
}

/// Empty form fields arrive as `""`; treat them as absent.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
