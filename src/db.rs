use async_trait::async_trait;
use deadpool_postgres::tokio_postgres::{Error as PgError, Row};
use deadpool_postgres::{
    CreatePoolError, ManagerConfig, Pool, RecyclingMethod, Runtime, Transaction as DbTransaction,
};
use postgres::NoTls;
use tracing::warn;

use crate::balance::{self, BalanceSnapshot, LedgerEntry};
use crate::config::DatabaseSettings;
use crate::ledger::{Admission, DbScope, LedgerStore, StoreError};
use crate::structs::{NewTransaction, Transaction, TransactionKind, UserId};

const RETURNING: &str =
    "id, user_id, amount, type, category, description, created_at, is_confirmed";

fn get_db_config(settings: &DatabaseSettings) -> deadpool_postgres::Config {
    let mut config = deadpool_postgres::Config::new();

    config.user = Some(settings.user.clone());
    config.password = Some(settings.password.clone());
    config.dbname = Some(settings.dbname.clone());
    config.host = Some(settings.host.clone());
    config.port = Some(settings.port);

    config.manager =
        Some(ManagerConfig { recycling_method: RecyclingMethod::Fast });

    config
}

pub fn create_pool(settings: &DatabaseSettings) -> Result<Pool, CreatePoolError> {
    get_db_config(settings).create_pool(Some(Runtime::Tokio1), NoTls)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn transaction_from_row(row: &Row) -> Result<Transaction, StoreError> {
    let fetch = |e: PgError| StoreError::Fetch(e.to_string());
    let kind: String = row.try_get("type").map_err(fetch)?;

    Ok(Transaction {
        id: row.try_get("id").map_err(fetch)?,
        user_id: UserId::new(row.try_get::<_, String>("user_id").map_err(fetch)?),
        amount: row.try_get("amount").map_err(fetch)?,
        kind: kind
            .parse::<TransactionKind>()
            .map_err(|_| StoreError::Fetch(format!("unknown transaction type {kind:?}")))?,
        category: row.try_get("category").map_err(fetch)?,
        description: row.try_get("description").map_err(fetch)?,
        created_at: row.try_get("created_at").map_err(fetch)?,
        is_confirmed: row.try_get("is_confirmed").map_err(fetch)?,
    })
}

fn entry_from_row(row: &Row) -> Result<LedgerEntry, StoreError> {
    let kind: String = row
        .try_get("type")
        .map_err(|e| StoreError::Fetch(e.to_string()))?;
    Ok(LedgerEntry {
        amount: row
            .try_get("amount")
            .map_err(|e| StoreError::Fetch(e.to_string()))?,
        kind: kind
            .parse()
            .map_err(|_| StoreError::Fetch(format!("unknown transaction type {kind:?}")))?,
    })
}

/// Postgres-backed ledger. Every call runs inside its own database
/// transaction so that `SET LOCAL ROLE` and the claim setting end with it.
pub struct PgLedger {
    db: Pool,
    user_role: String,
    service_role: String,
}

impl PgLedger {
    pub fn new(db: Pool, settings: &DatabaseSettings) -> Self {
        Self {
            db,
            user_role: quote_ident(&settings.user_role),
            service_role: quote_ident(&settings.service_role),
        }
    }

    async fn get_database_connection(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.db
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    async fn apply_scope(
        &self,
        txn: &DbTransaction<'_>,
        scope: &DbScope,
    ) -> Result<(), PgError> {
        match scope {
            DbScope::User(user) => {
                txn.batch_execute(&format!("SET LOCAL ROLE {}", self.user_role))
                    .await?;
                txn.execute(
                    "SELECT set_config('request.jwt.claim.sub', $1, true)",
                    &[&user.as_str()],
                )
                .await?;
            }
            DbScope::Service => {
                txn.batch_execute(&format!("SET LOCAL ROLE {}", self.service_role))
                    .await?;
            }
        }
        Ok(())
    }

    async fn select_entries(
        txn: &DbTransaction<'_>,
        user: &UserId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = txn
            .query(
                "SELECT amount, type FROM transactions WHERE user_id = $1",
                &[&user.as_str()],
            )
            .await
            .map_err(|e| StoreError::Fetch(e.to_string()))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn insert_row(
        txn: &DbTransaction<'_>,
        user: &UserId,
        tx: &NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let row = txn
            .query_one(
                &format!(
                    "INSERT INTO transactions (user_id, amount, type, category, description, is_confirmed) \
                    VALUES ($1, $2, $3, $4, $5, true) RETURNING {RETURNING}"
                ),
                &[
                    &user.as_str(),
                    &tx.amount,
                    &tx.kind.as_ref(),
                    &tx.category,
                    &tx.description,
                ],
            )
            .await
            .map_err(|e| StoreError::Insert(e.to_string()))?;
        transaction_from_row(&row)
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn entries(&self, scope: &DbScope, user: &UserId) -> Result<Vec<LedgerEntry>, StoreError> {
        let fetch = |e: PgError| StoreError::Fetch(e.to_string());
        let mut connection = self.get_database_connection().await?;
        let txn = connection.transaction().await.map_err(fetch)?;
        self.apply_scope(&txn, scope).await.map_err(fetch)?;

        let entries = Self::select_entries(&txn, user).await?;
        txn.commit().await.map_err(fetch)?;
        Ok(entries)
    }

    async fn recent(
        &self,
        scope: &DbScope,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let fetch = |e: PgError| StoreError::Fetch(e.to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut connection = self.get_database_connection().await?;
        let txn = connection.transaction().await.map_err(fetch)?;
        self.apply_scope(&txn, scope).await.map_err(fetch)?;

        let rows = txn
            .query(
                &format!(
                    "SELECT {RETURNING} FROM transactions \
                    WHERE user_id = $1 \
                    ORDER BY created_at DESC \
                    LIMIT $2"
                ),
                &[&user.as_str(), &limit],
            )
            .await
            .map_err(fetch)?;
        txn.commit().await.map_err(fetch)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn insert(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        let failed = |e: PgError| StoreError::Insert(e.to_string());
        let mut connection = self.get_database_connection().await?;
        let txn = connection.transaction().await.map_err(failed)?;
        self.apply_scope(&txn, scope).await.map_err(failed)?;

        let stored = Self::insert_row(&txn, user, &tx).await?;
        txn.commit().await.map_err(failed)?;
        Ok(stored)
    }

    async fn admit(
        &self,
        scope: &DbScope,
        user: &UserId,
        tx: NewTransaction,
    ) -> Result<Admission, StoreError> {
        let fetch = |e: PgError| StoreError::Fetch(e.to_string());
        let mut connection = self.get_database_connection().await?;
        let txn = connection.transaction().await.map_err(fetch)?;
        self.apply_scope(&txn, scope).await.map_err(fetch)?;

        // Held until commit or rollback; serializes admissions per user.
        txn.execute(
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))",
            &[&user.as_str()],
        )
        .await
        .map_err(fetch)?;

        if tx.kind == TransactionKind::Expense {
            let snapshot = BalanceSnapshot::from_entries(Self::select_entries(&txn, user).await?);
            if let Err(overdraft) = balance::admit(&snapshot, &tx) {
                if let Err(e) = txn.rollback().await {
                    warn!(error = %e, "Rollback after rejected expense failed");
                }
                return Ok(Admission::Overdrawn(overdraft));
            }
        }

        let stored = Self::insert_row(&txn, user, &tx).await?;
        txn.commit()
            .await
            .map_err(|e| StoreError::Insert(e.to_string()))?;
        Ok(Admission::Admitted(stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DatabaseSettings {
        DatabaseSettings {
            user: "ledger".to_string(),
            password: "pw".to_string(),
            dbname: "ledger".to_string(),
            host: "db".to_string(),
            port: 6543,
            user_role: "authenticated".to_string(),
            service_role: "service_role".to_string(),
        }
    }

    #[test]
    fn test_db_config_from_settings() {
        let config = get_db_config(&settings());
        assert_eq!(config.host.as_deref(), Some("db"));
        assert_eq!(config.port, Some(6543));
        assert_eq!(config.dbname.as_deref(), Some("ledger"));
    }

    #[tokio::test]
    async fn test_pool_creation_is_lazy() {
        // No connection is attempted until the first checkout.
        assert!(create_pool(&settings()).is_ok());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("service_role"), "\"service_role\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    /// A ledger against the database named by `DB_*`, with `sql/schema.sql`
    /// applied. `None` when no database is configured.
    fn live_ledger() -> Option<PgLedger> {
        let host = std::env::var("DB_HOST").ok()?;
        let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
        let settings = DatabaseSettings {
            user: var("DB_USER", "postgres"),
            password: var("DB_PASSWORD", "postgres"),
            dbname: var("DB_NAME", "ledger"),
            host,
            port: var("DB_PORT", "5432").parse().unwrap(),
            user_role: var("DB_USER_ROLE", "authenticated"),
            service_role: var("DB_SERVICE_ROLE", "service_role"),
        };
        Some(PgLedger::new(create_pool(&settings).unwrap(), &settings))
    }

    fn new_tx(amount: i64, kind: TransactionKind) -> NewTransaction {
        NewTransaction {
            amount: rust_decimal::Decimal::from(amount),
            kind,
            category: "Integration".to_string(),
            description: None,
        }
    }

    fn fresh_user() -> UserId {
        UserId::new(format!("it-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "needs a Postgres database (DB_HOST)"]
    async fn test_pg_concurrent_expenses_cannot_overdraw() {
        let Some(ledger) = live_ledger() else { return };
        let ledger = std::sync::Arc::new(ledger);
        let user = fresh_user();
        ledger
            .insert(&DbScope::Service, &user, new_tx(500, TransactionKind::Income))
            .await
            .unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let ledger = std::sync::Arc::clone(&ledger);
                let user = user.clone();
                tokio::spawn(async move {
                    ledger
                        .admit(&DbScope::Service, &user, new_tx(300, TransactionKind::Expense))
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
        assert_eq!(
            BalanceSnapshot::from_entries(entries).balance,
            rust_decimal::Decimal::from(200)
        );
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database (DB_HOST)"]
    async fn test_pg_user_scope_is_row_level_secured() {
        let Some(ledger) = live_ledger() else { return };
        let owner = fresh_user();
        let intruder = DbScope::User(fresh_user());
        let stored = ledger
            .insert(&DbScope::User(owner.clone()), &owner, new_tx(75, TransactionKind::Income))
            .await
            .unwrap();
        assert!(stored.is_confirmed);

        let own = ledger.recent(&DbScope::User(owner.clone()), &owner, 10).await.unwrap();
        assert_eq!(own.len(), 1);
        assert_eq!(own[0].id, stored.id);

        assert!(ledger.entries(&intruder, &owner).await.unwrap().is_empty());
        assert!(ledger
            .insert(&intruder, &owner, new_tx(1, TransactionKind::Income))
            .await
            .is_err());
    }

    #[tokio::test]
    #[ignore = "needs a Postgres database (DB_HOST)"]
    async fn test_pg_admit_rejects_overdraft() {
        let Some(ledger) = live_ledger() else { return };
        let user = fresh_user();
        ledger
            .insert(&DbScope::Service, &user, new_tx(100, TransactionKind::Income))
            .await
            .unwrap();

        let outcome = ledger
            .admit(&DbScope::Service, &user, new_tx(150, TransactionKind::Expense))
            .await
            .unwrap();
        assert!(matches!(outcome, Admission::Overdrawn(_)));
        assert_eq!(ledger.entries(&DbScope::Service, &user).await.unwrap().len(), 1);
    }
}
