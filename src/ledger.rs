//! Durable transaction storage.
//!
//! The store is append-only from this service. Every call names a
//! [`DbScope`]: user-scoped calls run with the caller's identity and are
//! subject to row-level security, service calls run with elevated
//! credentials for exactly one database transaction.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::balance::{self, BalanceSnapshot, LedgerEntry, Overdraft};
use crate::structs::{NewTransaction, Transaction, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbScope {
    User(UserId),
    Service,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("could not get a database connection: {0}")]
    Pool(String),
    #[error("failed to read transactions: {0}")]
    Fetch(String),
    #[error("failed to insert transaction: {0}")]
    Insert(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(Transaction),
    Overdrawn(Overdraft),
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// All of `user`'s transactions, projected to `(amount, type)`.
    async fn entries(&self, scope: &DbScope, user: &UserId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// The newest `limit` transactions of `user`, newest first.
    async fn recent(
        &self,
        scope: &DbScope,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Stores `tx` unconditionally as a confirmed transaction.
    async fn insert(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError>;

    /// Stores `tx` only if [`balance::admit`] accepts it against the user's
    /// balance at that moment. Admissions for the same user are serialized,
    /// so two concurrent expenses cannot both spend the same balance.
    async fn admit(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Admission, StoreError>;
}

/// Whether `scope` may see rows owned by `user`.
fn visible(scope: &DbScope, user: &UserId) -> bool {
    match scope {
        DbScope::User(owner) => owner == user,
        DbScope::Service => true,
    }
}

/// Keeps transactions in process memory. Used for local development and
/// tests.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<Transaction>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(rows: &mut Vec<Transaction>, user: &UserId, tx: NewTransaction) -> Transaction {
        let stored = Transaction {
            id: Uuid::new_v4(),
            user_id: user.clone(),
            amount: tx.amount,
            kind: tx.kind,
            category: tx.category,
            description: tx.description,
            created_at: Utc::now(),
            is_confirmed: true,
        };
        rows.push(stored.clone());
        stored
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn entries(&self, scope: &DbScope, user: &UserId) -> Result<Vec<LedgerEntry>, StoreError> {
        if !visible(scope, user) {
            return Ok(Vec::new());
        }
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|tx| &tx.user_id == user)
            .map(LedgerEntry::from)
            .collect())
    }

    async fn recent(
        &self,
        scope: &DbScope,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        if !visible(scope, user) {
            return Ok(Vec::new());
        }
        let rows = self.rows.lock().await;
        // Rows are appended in creation order.
        Ok(rows
            .iter()
            .rev()
            .filter(|tx| &tx.user_id == user)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        if !visible(scope, user) {
            return Err(StoreError::Insert(
                "row violates row-level security policy".to_string(),
            ));
        }
        let mut rows = self.rows.lock().await;
        Ok(Self::store(&mut rows, user, tx))
    }

    async fn admit(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Admission, StoreError> {
        if !visible(scope, user) {
            return Err(StoreError::Insert(
                "row violates row-level security policy".to_string(),
            ));
        }
        let mut rows = self.rows.lock().await;
        let snapshot = BalanceSnapshot::from_entries(
            rows.iter()
                .filter(|row| &row.user_id == user)
                .map(LedgerEntry::from),
        );
        if let Err(overdraft) = balance::admit(&snapshot, &tx) {
            return Ok(Admission::Overdrawn(overdraft));
        }
        Ok(Admission::Admitted(Self::store(&mut rows, user, tx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::TransactionKind;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn tx(amount: i64, kind: TransactionKind) -> NewTransaction {
        NewTransaction {
            amount: Decimal::from(amount),
            kind,
            category: "Misc".to_string(),
            description: Some(format!("{kind} of {amount}")),
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let ledger = MemoryLedger::new();
        let user = UserId::new("u1");
        let scope = DbScope::User(user.clone());

        let stored = ledger
            .insert(&scope, &user, tx(100, TransactionKind::Income))
            .await
            .unwrap();
        assert!(stored.is_confirmed);
        assert_eq!(stored.user_id, user);

        let entries = ledger.entries(&scope, &user).await.unwrap();
        assert_eq!(
            entries,
            vec![LedgerEntry::new(Decimal::from(100), TransactionKind::Income)]
        );
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_and_limited() {
        let ledger = MemoryLedger::new();
        let user = UserId::new("u1");
        for amount in 1..=12 {
            ledger
                .insert(&DbScope::Service, &user, tx(amount, TransactionKind::Income))
                .await
                .unwrap();
        }
        ledger
            .insert(&DbScope::Service, &UserId::new("u2"), tx(99, TransactionKind::Income))
            .await
            .unwrap();

        let recent = ledger.recent(&DbScope::Service, &user, 10).await.unwrap();
        let amounts: Vec<_> = recent.iter().map(|t| t.amount).collect();
        let expected: Vec<_> = (3..=12).rev().map(Decimal::from).collect();
        assert_eq!(amounts, expected);
    }

    #[tokio::test]
    async fn test_user_scope_cannot_touch_other_users() {
        let ledger = MemoryLedger::new();
        let owner = UserId::new("owner");
        let intruder = DbScope::User(UserId::new("intruder"));
        ledger
            .insert(&DbScope::Service, &owner, tx(10, TransactionKind::Income))
            .await
            .unwrap();

        assert!(ledger.entries(&intruder, &owner).await.unwrap().is_empty());
        assert!(ledger.recent(&intruder, &owner, 10).await.unwrap().is_empty());
        assert!(ledger
            .insert(&intruder, &owner, tx(1, TransactionKind::Income))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_admit_rejects_overdraft() {
        let ledger = MemoryLedger::new();
        let user = UserId::new("u1");
        ledger
            .insert(&DbScope::Service, &user, tx(500, TransactionKind::Income))
            .await
            .unwrap();

        let outcome = ledger
            .admit(&DbScope::Service, &user, tx(600, TransactionKind::Expense))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Admission::Overdrawn(Overdraft {
                available: Decimal::from(500),
                attempted: Decimal::from(600),
            })
        );
        assert_eq!(ledger.entries(&DbScope::Service, &user).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_expenses_cannot_overdraw() {
        let ledger = Arc::new(MemoryLedger::new());
        let user = UserId::new("u1");
        ledger
            .insert(&DbScope::Service, &user, tx(500, TransactionKind::Income))
            .await
            .unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let user = user.clone();
                tokio::spawn(async move {
                    ledger
                        .admit(&DbScope::Service, &user, tx(300, TransactionKind::Expense))
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        for attempt in futures::future::join_all(attempts).await {
            if let Admission::Admitted(_) = attempt.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);

        let entries = ledger.entries(&DbScope::Service, &user).await.unwrap();
        assert_eq!(BalanceSnapshot::from_entries(entries).balance, Decimal::from(200));
    }
}
