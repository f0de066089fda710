use crate::pricing::{CurrencyUnit, UnitPrices, UsageCounters};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One completed-or-failed generation. Counters grow monotonically while
/// the adapter streams; the reconciler flips `is_charged` exactly once.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub id: String,
    /// Upstream correlation id, when the provider reports one.
    pub chat_id: Option<String>,
    pub user_id: String,
    pub model: String,
    pub usage: UsageCounters,
    pub prices: UnitPrices,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub is_charged: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create(&self, record: UsageRecord) -> Result<(), String>;
    async fn get(&self, id: &str) -> Result<Option<UsageRecord>, String>;
    /// Merge streamed usage into the record with max(old, new) semantics.
    async fn record_progress(
        &self,
        id: &str,
        usage: UsageCounters,
        chat_id: Option<&str>,
    ) -> Result<(), String>;
    /// Capture final usage, unit prices and the finish timestamp.
    async fn finalize(
        &self,
        id: &str,
        usage: UsageCounters,
        prices: UnitPrices,
        finished_at: i64,
    ) -> Result<(), String>;
    async fn mark_charged(&self, id: &str) -> Result<(), String>;
    async fn list_uncharged_finished(&self) -> Result<Vec<UsageRecord>, String>;
}

#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<HashMap<String, UsageRecord>>>,
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, record: UsageRecord) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        guard.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UsageRecord>, String> {
        let guard = self.inner.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn record_progress(
        &self,
        id: &str,
        usage: UsageCounters,
        chat_id: Option<&str>,
    ) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(id) else {
            return Err(format!("usage record {id} not found"));
        };
        record.usage.merge_max(usage);
        if let Some(chat_id) = chat_id {
            record.chat_id = Some(chat_id.to_string());
        }
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        usage: UsageCounters,
        prices: UnitPrices,
        finished_at: i64,
    ) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(id) else {
            return Err(format!("usage record {id} not found"));
        };
        record.usage.merge_max(usage);
        record.prices = prices;
        record.finished_at = Some(finished_at);
        Ok(())
    }

    async fn mark_charged(&self, id: &str) -> Result<(), String> {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(id) else {
            return Err(format!("usage record {id} not found"));
        };
        record.is_charged = true;
        Ok(())
    }

    async fn list_uncharged_finished(&self) -> Result<Vec<UsageRecord>, String> {
        let guard = self.inner.read().await;
        Ok(guard
            .values()
            .filter(|r| r.finished_at.is_some() && !r.is_charged)
            .cloned()
            .collect())
    }
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: Pool<Sqlite>,
}

impl SqliteRecordStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS usage_records (
                id TEXT PRIMARY KEY,
                chat_id TEXT,
                user_id TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_tokens INTEGER NOT NULL DEFAULT 0,
                completion_tokens INTEGER NOT NULL DEFAULT 0,
                image_count INTEGER NOT NULL DEFAULT 0,
                prompt_price TEXT NOT NULL DEFAULT '0',
                completion_price TEXT NOT NULL DEFAULT '0',
                image_price TEXT NOT NULL DEFAULT '0',
                request_price TEXT NOT NULL DEFAULT '0',
                currency_unit TEXT NOT NULL DEFAULT 'usd',
                created_at INTEGER NOT NULL,
                finished_at INTEGER,
                is_charged INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_uncharged ON usage_records(finished_at, is_charged)",
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<UsageRecord, String> {
        let parse_price = |column: &str| -> Result<Decimal, String> {
            let text: String = row.try_get(column).map_err(|err| err.to_string())?;
            Decimal::from_str(&text).map_err(|err| err.to_string())
        };
        let currency: String = row.try_get("currency_unit").map_err(|err| err.to_string())?;
        Ok(UsageRecord {
            id: row.try_get("id").map_err(|err| err.to_string())?,
            chat_id: row.try_get("chat_id").map_err(|err| err.to_string())?,
            user_id: row.try_get("user_id").map_err(|err| err.to_string())?,
            model: row.try_get("model").map_err(|err| err.to_string())?,
            usage: UsageCounters {
                prompt_tokens: row
                    .try_get::<i64, _>("prompt_tokens")
                    .map_err(|err| err.to_string())? as u64,
                completion_tokens: row
                    .try_get::<i64, _>("completion_tokens")
                    .map_err(|err| err.to_string())? as u64,
                image_count: row
                    .try_get::<i64, _>("image_count")
                    .map_err(|err| err.to_string())? as u64,
            },
            prices: UnitPrices {
                prompt: parse_price("prompt_price")?,
                completion: parse_price("completion_price")?,
                image: parse_price("image_price")?,
                request: parse_price("request_price")?,
                currency_unit: CurrencyUnit::from_str(&currency)
                    .ok_or_else(|| format!("invalid currency unit: {currency}"))?,
            },
            created_at: row.try_get("created_at").map_err(|err| err.to_string())?,
            finished_at: row.try_get("finished_at").map_err(|err| err.to_string())?,
            is_charged: row.try_get::<i64, _>("is_charged").map_err(|err| err.to_string())? != 0,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create(&self, record: UsageRecord) -> Result<(), String> {
        sqlx::query(
            r#"INSERT INTO usage_records
               (id, chat_id, user_id, model, prompt_tokens, completion_tokens, image_count,
                prompt_price, completion_price, image_price, request_price, currency_unit,
                created_at, finished_at, is_charged)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.id)
        .bind(&record.chat_id)
        .bind(&record.user_id)
        .bind(&record.model)
        .bind(record.usage.prompt_tokens as i64)
        .bind(record.usage.completion_tokens as i64)
        .bind(record.usage.image_count as i64)
        .bind(record.prices.prompt.to_string())
        .bind(record.prices.completion.to_string())
        .bind(record.prices.image.to_string())
        .bind(record.prices.request.to_string())
        .bind(record.prices.currency_unit.as_str())
        .bind(record.created_at)
        .bind(record.finished_at)
        .bind(record.is_charged)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UsageRecord>, String> {
        let row = sqlx::query("SELECT * FROM usage_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        row.map(|row| Self::row_to_record(&row)).transpose()
    }

    async fn record_progress(
        &self,
        id: &str,
        usage: UsageCounters,
        chat_id: Option<&str>,
    ) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE usage_records SET
               prompt_tokens = MAX(prompt_tokens, ?),
               completion_tokens = MAX(completion_tokens, ?),
               image_count = MAX(image_count, ?),
               chat_id = COALESCE(?, chat_id)
               WHERE id = ?"#,
        )
        .bind(usage.prompt_tokens as i64)
        .bind(usage.completion_tokens as i64)
        .bind(usage.image_count as i64)
        .bind(chat_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn finalize(
        &self,
        id: &str,
        usage: UsageCounters,
        prices: UnitPrices,
        finished_at: i64,
    ) -> Result<(), String> {
        sqlx::query(
            r#"UPDATE usage_records SET
               prompt_tokens = MAX(prompt_tokens, ?),
               completion_tokens = MAX(completion_tokens, ?),
               image_count = MAX(image_count, ?),
               prompt_price = ?, completion_price = ?, image_price = ?, request_price = ?,
               currency_unit = ?, finished_at = ?
               WHERE id = ?"#,
        )
        .bind(usage.prompt_tokens as i64)
        .bind(usage.completion_tokens as i64)
        .bind(usage.image_count as i64)
        .bind(prices.prompt.to_string())
        .bind(prices.completion.to_string())
        .bind(prices.image.to_string())
        .bind(prices.request.to_string())
        .bind(prices.currency_unit.as_str())
        .bind(finished_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn mark_charged(&self, id: &str) -> Result<(), String> {
        sqlx::query("UPDATE usage_records SET is_charged = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }

    async fn list_uncharged_finished(&self) -> Result<Vec<UsageRecord>, String> {
        let rows = sqlx::query(
            "SELECT * FROM usage_records WHERE finished_at IS NOT NULL AND is_charged = 0",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        rows.iter().map(Self::row_to_record).collect()
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Single-writer handle an adapter uses to populate its usage record while
/// streaming. The adapter owns the recorder for the whole session; the
/// reconciler only sees the record after `finish` set `finished_at`.
///
/// Within one upstream call usage reports merge with max(old, new), since
/// providers may resend cumulative totals. Tool continuations are separate
/// upstream calls; `checkpoint` folds the finished leg into a committed
/// base so legs add up instead of shadowing each other.
pub struct UsageRecorder {
    store: Arc<dyn RecordStore>,
    record_id: String,
    base: UsageCounters,
    leg: UsageCounters,
    finished: bool,
}

impl UsageRecorder {
    pub async fn begin(
        store: Arc<dyn RecordStore>,
        user_id: &str,
        model: &str,
    ) -> Result<Self, String> {
        let record_id = format!("log_{}", uuid::Uuid::new_v4().simple());
        store
            .create(UsageRecord {
                id: record_id.clone(),
                chat_id: None,
                user_id: user_id.to_string(),
                model: model.to_string(),
                usage: UsageCounters::default(),
                prices: UnitPrices::default(),
                created_at: now_millis(),
                finished_at: None,
                is_charged: false,
            })
            .await?;
        Ok(Self {
            store,
            record_id,
            base: UsageCounters::default(),
            leg: UsageCounters::default(),
            finished: false,
        })
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    pub fn usage(&self) -> UsageCounters {
        UsageCounters {
            prompt_tokens: self.base.prompt_tokens + self.leg.prompt_tokens,
            completion_tokens: self.base.completion_tokens + self.leg.completion_tokens,
            image_count: self.base.image_count + self.leg.image_count,
        }
    }

    pub async fn set_chat_id(&mut self, chat_id: &str) {
        let usage = self.usage();
        if let Err(err) = self
            .store
            .record_progress(&self.record_id, usage, Some(chat_id))
            .await
        {
            tracing::warn!(record_id = %self.record_id, error = %err, "chat id update failed");
        }
    }

    pub async fn report(&mut self, incoming: UsageCounters) {
        self.leg.merge_max(incoming);
        let usage = self.usage();
        if let Err(err) = self
            .store
            .record_progress(&self.record_id, usage, None)
            .await
        {
            tracing::warn!(record_id = %self.record_id, error = %err, "usage update failed");
        }
    }

    /// Fold the current upstream leg into the committed base. Called
    /// between tool-continuation calls so each leg's usage adds up.
    pub fn checkpoint(&mut self) {
        self.base = self.usage();
        self.leg = UsageCounters::default();
    }

    /// Capture the catalog prices and finish timestamp. Safe to call more
    /// than once; only the first call takes effect.
    pub async fn finish(&mut self, prices: UnitPrices) {
        if self.finished {
            return;
        }
        self.finished = true;
        let usage = self.usage();
        if let Err(err) = self
            .store
            .finalize(&self.record_id, usage, prices, now_millis())
            .await
        {
            tracing::warn!(record_id = %self.record_id, error = %err, "usage finalize failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn progress_merges_with_max() {
        let store = Arc::new(MemoryRecordStore::default());
        let mut recorder = UsageRecorder::begin(store.clone(), "user-1", "gpt-test")
            .await
            .unwrap();
        for tokens in [10u64, 7, 15] {
            recorder
                .report(UsageCounters {
                    prompt_tokens: tokens,
                    completion_tokens: tokens,
                    image_count: 0,
                })
                .await;
        }
        let record = store.get(recorder.record_id()).await.unwrap().unwrap();
        assert_eq!(record.usage.completion_tokens, 15);
        assert_eq!(record.usage.prompt_tokens, 15);
    }

    #[tokio::test]
    async fn finish_is_idempotent_and_sets_finished_at() {
        let store = Arc::new(MemoryRecordStore::default());
        let mut recorder = UsageRecorder::begin(store.clone(), "user-1", "gpt-test")
            .await
            .unwrap();
        recorder.finish(UnitPrices::default()).await;
        let first = store.get(recorder.record_id()).await.unwrap().unwrap();
        recorder.finish(UnitPrices::default()).await;
        let second = store.get(recorder.record_id()).await.unwrap().unwrap();
        assert!(first.finished_at.is_some());
        assert_eq!(first.finished_at, second.finished_at);
    }

    #[tokio::test]
    async fn checkpoint_sums_across_legs() {
        let store = Arc::new(MemoryRecordStore::default());
        let mut recorder = UsageRecorder::begin(store.clone(), "user-1", "gpt-test")
            .await
            .unwrap();
        recorder
            .report(UsageCounters {
                prompt_tokens: 100,
                completion_tokens: 40,
                image_count: 0,
            })
            .await;
        recorder.checkpoint();
        recorder
            .report(UsageCounters {
                prompt_tokens: 150,
                completion_tokens: 20,
                image_count: 0,
            })
            .await;
        let record = store.get(recorder.record_id()).await.unwrap().unwrap();
        assert_eq!(record.usage.prompt_tokens, 250);
        assert_eq!(record.usage.completion_tokens, 60);
    }

    #[tokio::test]
    async fn unfinished_records_are_not_listed() {
        let store = MemoryRecordStore::default();
        let store_arc: Arc<dyn RecordStore> = Arc::new(store.clone());
        let mut recorder = UsageRecorder::begin(store_arc, "user-1", "gpt-test")
            .await
            .unwrap();
        assert!(store.list_uncharged_finished().await.unwrap().is_empty());
        recorder.finish(UnitPrices::default()).await;
        assert_eq!(store.list_uncharged_finished().await.unwrap().len(), 1);
    }
}
