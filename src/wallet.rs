use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    /// Monetary balance, debited unconditionally (may go negative).
    Balance,
    /// Per-model usage quota, debited with a floor at zero.
    Quota,
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Quota accounts take precedence: a (user, model) quota row makes the
    /// reconciler debit usage units instead of money.
    async fn account_kind(&self, user_id: &str, model: &str) -> Result<AccountKind, String>;
    async fn debit(&self, user_id: &str, amount: Decimal) -> Result<(), String>;
    /// `quota = max(quota - usage, 0)`; a user never goes usage-negative.
    async fn debit_clamped(&self, user_id: &str, model: &str, usage: u64) -> Result<(), String>;
    async fn balance(&self, user_id: &str) -> Result<Decimal, String>;
    async fn quota(&self, user_id: &str, model: &str) -> Result<Option<u64>, String>;
}

#[derive(Default)]
struct MemoryWalletInner {
    balances: HashMap<String, Decimal>,
    quotas: HashMap<(String, String), u64>,
}

#[derive(Clone, Default)]
pub struct MemoryWalletStore {
    inner: Arc<RwLock<MemoryWalletInner>>,
}

impl MemoryWalletStore {
    pub async fn set_balance(&self, user_id: &str, balance: Decimal) {
        let mut guard = self.inner.write().await;
        guard.balances.insert(user_id.to_string(), balance);
    }

    pub async fn set_quota(&self, user_id: &str, model: &str, quota: u64) {
        let mut guard = self.inner.write().await;
        guard
            .quotas
            .insert((user_id.to_string(), model.to_string()), quota);
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn account_kind(&self, user_id: &str, model: &str) -> Result<AccountKind, String> {
        let guard = self.inner.read().await;
        if guard
            .quotas
            .contains_key(&(user_id.to_string(), model.to_string()))
        {
            Ok(AccountKind::Quota)
        } else {
            Ok(AccountKind::Balance)
        }
    }

    async fn debit(&self, user_id: &str, amount: Decimal) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let balance = guard
            .balances
            .entry(user_id.to_string())
            .or_insert(Decimal::ZERO);
        *balance -= amount;
        Ok(())
    }

    async fn debit_clamped(&self, user_id: &str, model: &str, usage: u64) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let quota = guard
            .quotas
            .entry((user_id.to_string(), model.to_string()))
            .or_insert(0);
        *quota = quota.saturating_sub(usage);
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<Decimal, String> {
        let guard = self.inner.read().await;
        Ok(guard.balances.get(user_id).copied().unwrap_or(Decimal::ZERO))
    }

    async fn quota(&self, user_id: &str, model: &str) -> Result<Option<u64>, String> {
        let guard = self.inner.read().await;
        Ok(guard
            .quotas
            .get(&(user_id.to_string(), model.to_string()))
            .copied())
    }
}

#[derive(Clone)]
pub struct SqliteWalletStore {
    pool: Pool<Sqlite>,
}

impl SqliteWalletStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS wallets (
                user_id TEXT PRIMARY KEY,
                balance TEXT NOT NULL DEFAULT '0'
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_quotas (
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                available_usage INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, model)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl WalletStore for SqliteWalletStore {
    async fn account_kind(&self, user_id: &str, model: &str) -> Result<AccountKind, String> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM model_quotas WHERE user_id = ? AND model = ?",
        )
        .bind(user_id)
        .bind(model)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(if count > 0 {
            AccountKind::Quota
        } else {
            AccountKind::Balance
        })
    }

    async fn debit(&self, user_id: &str, amount: Decimal) -> Result<(), String> {
        // Balances are decimal strings, so the subtraction happens here
        // rather than in SQL; the transaction keeps it atomic.
        let mut tx = self.pool.begin().await.map_err(|err| err.to_string())?;
        sqlx::query("INSERT INTO wallets (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| err.to_string())?;
        let (balance_text,): (String,) =
            sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|err| err.to_string())?;
        let balance = Decimal::from_str(&balance_text).map_err(|err| err.to_string())?;
        sqlx::query("UPDATE wallets SET balance = ? WHERE user_id = ?")
            .bind((balance - amount).to_string())
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| err.to_string())?;
        tx.commit().await.map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn debit_clamped(&self, user_id: &str, model: &str, usage: u64) -> Result<(), String> {
        sqlx::query(
            "UPDATE model_quotas SET available_usage = MAX(available_usage - ?, 0)
             WHERE user_id = ? AND model = ?",
        )
        .bind(usage as i64)
        .bind(user_id)
        .bind(model)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn balance(&self, user_id: &str) -> Result<Decimal, String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|err| err.to_string())?;
        match row {
            Some((text,)) => Decimal::from_str(&text).map_err(|err| err.to_string()),
            None => Ok(Decimal::ZERO),
        }
    }

    async fn quota(&self, user_id: &str, model: &str) -> Result<Option<u64>, String> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT available_usage FROM model_quotas WHERE user_id = ? AND model = ?",
        )
        .bind(user_id)
        .bind(model)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(row.map(|(usage,)| usage.max(0) as u64))
    }
}
