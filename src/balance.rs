//! Balance aggregation and the expense admission rule.
//!
//! This is the only place that defines what a user's balance is. The
//! dashboard summary and the admission check in the ledger stores both go
//! through [`BalanceSnapshot::from_entries`].

use rust_decimal::Decimal;
use serde::Serialize;

use crate::structs::{NewTransaction, Transaction, TransactionKind};

/// The `(amount, type)` projection of a stored transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub amount: Decimal,
    pub kind: TransactionKind,
}

impl LedgerEntry {
    pub fn new(amount: Decimal, kind: TransactionKind) -> Self {
        Self { amount, kind }
    }
}

impl From<&Transaction> for LedgerEntry {
    fn from(tx: &Transaction) -> Self {
        Self::new(tx.amount, tx.kind)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub income: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub expense: Decimal,
}

impl BalanceSnapshot {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = LedgerEntry>,
    {
        let (income, expense) = entries.into_iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(income, expense), entry| match entry.kind {
                TransactionKind::Income => (income + entry.amount, expense),
                TransactionKind::Expense => (income, expense + entry.amount),
            },
        );

        Self {
            balance: income - expense,
            income,
            expense,
        }
    }
}

/// An expense that would have taken the balance below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overdraft {
    pub available: Decimal,
    pub attempted: Decimal,
}

/// Income is always admitted. An expense is admitted only while
/// `balance - amount` stays non-negative.
pub fn admit(snapshot: &BalanceSnapshot, tx: &NewTransaction) -> Result<(), Overdraft> {
    match tx.kind {
        TransactionKind::Income => Ok(()),
        TransactionKind::Expense if snapshot.balance - tx.amount < Decimal::ZERO => Err(Overdraft {
            available: snapshot.balance,
            attempted: tx.amount,
        }),
        TransactionKind::Expense => Ok(()),
    }
}
