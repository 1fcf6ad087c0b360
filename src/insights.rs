//! Spending insights over a user's recent transactions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::balance::{BalanceSnapshot, LedgerEntry};
use crate::structs::{Transaction, TransactionKind};

#[derive(Debug, Clone, PartialEq)]
pub struct InsightRequest {
    /// Newest first.
    pub transactions: Vec<Transaction>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub insight: String,
    pub transaction_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum InsightError {
    /// Raised by providers backed by a remote model. The local summariser
    /// never fails.
    #[allow(dead_code)]
    #[error("insight provider failed: {0}")]
    Provider(String),
}

/// Turns transaction history into advice. Implementations backed by a
/// language model answer `query`; others may ignore it.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn generate(&self, request: InsightRequest) -> Result<Insight, InsightError>;
}

/// Summarises totals and the largest spending category without calling out
/// to any external service.
#[derive(Debug, Default)]
pub struct LocalInsights;

impl LocalInsights {
    pub fn new() -> Self {
        Self
    }
}

fn rupees(amount: Decimal) -> String {
    amount.round_dp(2).normalize().to_string()
}

#[async_trait]
impl InsightProvider for LocalInsights {
    async fn generate(&self, request: InsightRequest) -> Result<Insight, InsightError> {
        let count = request.transactions.len();
        if count == 0 {
            return Ok(Insight {
                insight: "There are no transactions to analyse yet.".to_string(),
                transaction_count: 0,
            });
        }
        if request.query.is_some() {
            debug!("Local insights do not answer free-form questions");
        }

        let snapshot =
            BalanceSnapshot::from_entries(request.transactions.iter().map(LedgerEntry::from));
        let mut sentences = vec![format!(
            "Across your last {count} transactions you earned {} rupees and spent {} rupees.",
            rupees(snapshot.income),
            rupees(snapshot.expense)
        )];

        let mut by_category: BTreeMap<&str, Decimal> = BTreeMap::new();
        for tx in request
            .transactions
            .iter()
            .filter(|tx| tx.kind == TransactionKind::Expense)
        {
            *by_category.entry(tx.category.as_str()).or_default() += tx.amount;
        }
        if let Some((category, spent)) = by_category.iter().max_by(|a, b| a.1.cmp(b.1)) {
            let share = (*spent * Decimal::ONE_HUNDRED / snapshot.expense).round();
            sentences.push(format!(
                "Your largest spending category is {category} at {} rupees, {share}% of your spending.",
                rupees(*spent)
            ));
        }

        if snapshot.balance < Decimal::ZERO {
            sentences.push("You spent more than you earned in this period.".to_string());
        } else if snapshot.income > Decimal::ZERO {
            let saved = (snapshot.balance * Decimal::ONE_HUNDRED / snapshot.income).round();
            sentences.push(format!("You kept {saved}% of your income."));
        }

        Ok(Insight {
            insight: sentences.join(" "),
            transaction_count: count,
        })
    }
}
