//! Voice-assistant tool-call webhook.
//!
//! Every outcome of a recognised tool call is spoken back to the caller, so
//! failures are reported as result text with HTTP 200 rather than as error
//! statuses.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::ledger::{Admission, DbScope, LedgerStore, StoreError};
use crate::structs::{in_cents, non_blank, NewTransaction, TransactionKind, UserId, MAX_AMOUNT};
use crate::views::ViewInvalidator;

pub const SECRET_HEADER: &str = "x-vapi-secret";
pub const LOG_TRANSACTION: &str = "logTransaction";

const TOOL_CALLS: &str = "tool-calls";
const DEFAULT_CATEGORY: &str = "Other";

const USER_NOT_FOUND: &str = "Error: User ID not found.";
const BALANCE_UNAVAILABLE: &str = "I couldn't check your balance due to a system error.";
const DATABASE_ERROR: &str = "Database error. Check your server logs.";
const REPEAT_REQUEST: &str =
    "I didn't catch that. Please tell me the amount again and whether it was income or an expense.";

#[derive(Debug, Default, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub call: Option<Call>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub function: Option<FunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    /// Either a JSON object or a string holding one.
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    #[serde(default)]
    pub assistant_overrides: Option<Overrides>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Overrides {
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Call {
    /// Assistant override metadata wins over call metadata.
    fn user_id(&self) -> Option<UserId> {
        let from_overrides = self
            .assistant_overrides
            .as_ref()
            .and_then(|overrides| overrides.metadata.as_ref())
            .and_then(|metadata| non_blank(metadata.user_id.clone()));
        from_overrides
            .or_else(|| {
                self.metadata
                    .as_ref()
                    .and_then(|metadata| non_blank(metadata.user_id.clone()))
            })
            .map(UserId::new)
    }
}

#[derive(Debug, Deserialize)]
struct LogTransactionArgs {
    amount: Option<Decimal>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl LogTransactionArgs {
    fn decode(arguments: &Value) -> Option<Self> {
        let parsed = match arguments {
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        match parsed {
            Ok(args) => Some(args),
            Err(e) => {
                debug!(error = %e, "Undecodable tool arguments");
                None
            }
        }
    }

    fn into_new_transaction(self) -> Option<NewTransaction> {
        let amount = self.amount.filter(|amount| {
            *amount > Decimal::ZERO && *amount <= MAX_AMOUNT && in_cents(*amount)
        })?;
        let kind = self.kind.as_deref()?.trim().parse::<TransactionKind>().ok()?;
        Some(NewTransaction {
            amount,
            kind,
            category: non_blank(self.category).unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            description: non_blank(self.description),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub result: String,
}

/// Serializes to `{}` when there is nothing to say.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ToolResult>>,
}

impl WebhookReply {
    fn spoken(tool_call_id: &str, result: impl Into<String>) -> Self {
        Self {
            results: Some(vec![ToolResult {
                tool_call_id: tool_call_id.to_string(),
                result: result.into(),
            }]),
        }
    }
}

/// Checks the platform's shared secret. With no secret configured every
/// call is accepted.
pub fn verify_secret(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(expected), Some(presented)) => {
            Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
        }
    }
}

fn spoken_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

pub struct VoiceWebhook {
    ledger: Arc<dyn LedgerStore>,
    views: Arc<dyn ViewInvalidator>,
}

impl VoiceWebhook {
    pub fn new(ledger: Arc<dyn LedgerStore>, views: Arc<dyn ViewInvalidator>) -> Self {
        Self { ledger, views }
    }

    pub async fn process(&self, envelope: Envelope) -> WebhookReply {
        let Some(message) = envelope.message else {
            return WebhookReply::default();
        };
        if message.kind.as_deref() != Some(TOOL_CALLS) {
            return WebhookReply::default();
        }
        let Some(tool_call) = message.tool_calls.first() else {
            return WebhookReply::default();
        };
        let Some(function) = tool_call
            .function
            .as_ref()
            .filter(|function| function.name == LOG_TRANSACTION)
        else {
            debug!(tool_call_id = %tool_call.id, "Ignoring unrecognised tool call");
            return WebhookReply::default();
        };

        let Some(tx) = LogTransactionArgs::decode(&function.arguments)
            .and_then(LogTransactionArgs::into_new_transaction)
        else {
            return WebhookReply::spoken(&tool_call.id, REPEAT_REQUEST);
        };

        let Some(user) = message.call.as_ref().and_then(Call::user_id) else {
            warn!(tool_call_id = %tool_call.id, "Tool call without a user id");
            return WebhookReply::spoken(&tool_call.id, USER_NOT_FOUND);
        };

        WebhookReply::spoken(&tool_call.id, self.log_transaction(&user, tx).await)
    }

    async fn log_transaction(&self, user: &UserId, tx: NewTransaction) -> String {
        let kind = tx.kind;
        let label = tx.description.clone().unwrap_or_else(|| tx.category.clone());
        let amount = tx.amount;

        match self.ledger.admit(&DbScope::Service, user, tx).await {
            Ok(Admission::Admitted(stored)) => {
                info!(user = %user, transaction = %stored.id, kind = %kind, "Logged voice transaction");
                self.views.invalidate(user);
                format!(
                    "Done. I've logged {} rupees for {label}.",
                    spoken_amount(amount)
                )
            }
            Ok(Admission::Overdrawn(overdraft)) => {
                info!(user = %user, "Rejected voice expense over balance");
                format!(
                    "Transaction failed. You only have {} rupees available, but you tried to spend {}.",
                    spoken_amount(overdraft.available),
                    spoken_amount(overdraft.attempted)
                )
            }
            Err(e @ (StoreError::Pool(_) | StoreError::Fetch(_))) if kind == TransactionKind::Expense => {
                error!(user = %user, error = %e, "Balance check failed");
                BALANCE_UNAVAILABLE.to_string()
            }
            Err(e) => {
                error!(user = %user, error = %e, "Failed to store voice transaction");
                DATABASE_ERROR.to_string()
            }
        }
    }
}
