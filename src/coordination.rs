use async_trait::async_trait;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Shared coordination keys: job locks and session closed-flags. Values are
/// cache-grade except the lock key, whose presence must survive its TTL.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomic set-if-absent. Returns false when the key already exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, String>;
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    async fn delete(&self, key: &str) -> Result<(), String>;
}

#[derive(Clone, Default)]
pub struct MemoryCoordinationStore {
    inner: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryCoordinationStore {
    fn is_live(entry: Option<&(String, Instant)>) -> bool {
        entry.is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, String> {
        let mut guard = self.inner.lock().await;
        if Self::is_live(guard.get(key)) {
            return Ok(false);
        }
        guard.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let guard = self.inner.lock().await;
        let entry = guard.get(key);
        if Self::is_live(entry) {
            Ok(entry.map(|(value, _)| value.clone()))
        } else {
            Ok(None)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        let mut guard = self.inner.lock().await;
        guard.remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteCoordinationStore {
    pool: Pool<Sqlite>,
}

impl SqliteCoordinationStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS coordination_keys (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(Self { pool })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl CoordinationStore for SqliteCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, String> {
        let now = Self::now();
        sqlx::query("DELETE FROM coordination_keys WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        let result = sqlx::query(
            "INSERT INTO coordination_keys (key, value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(value)
        .bind(now + ttl.as_secs() as i64)
        .execute(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM coordination_keys WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Self::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| err.to_string())?;
        Ok(row.map(|(value,)| value))
    }

    async fn delete(&self, key: &str) -> Result<(), String> {
        sqlx::query("DELETE FROM coordination_keys WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|err| err.to_string())?;
        Ok(())
    }
}

/// At-most-one concurrent run of a named job across worker processes.
/// Liveness after a crashed holder is bounded by the TTL, not immediate.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

const LOCK_KEY_PREFIX: &str = "job-lock";

impl DistributedLock {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Run `body` if no other instance holds the lock for `job_name`.
    /// Returns whether the body ran. The lock key is removed whether the
    /// body succeeds or fails; a contending caller never runs the body.
    pub async fn try_run<F, Fut>(
        &self,
        job_name: &str,
        ttl: Duration,
        body: F,
    ) -> Result<bool, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let key = format!("{LOCK_KEY_PREFIX}:{job_name}");
        let holder = uuid::Uuid::new_v4().to_string();
        if !self.store.set_if_absent(&key, &holder, ttl).await? {
            tracing::warn!(job = job_name, "job skipped, lock held by another instance");
            metrics::counter!("aigate_lock_contended_total").increment(1);
            return Ok(false);
        }
        body().await;
        self.store.delete(&key).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn only_one_of_concurrent_runs_executes() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::default());
        let lock = DistributedLock::new(store);
        let ran = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let ran = ran.clone();
            handles.push(tokio::spawn(async move {
                lock.try_run("job-a", Duration::from_secs(60), || async {
                    ran.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                })
                .await
                .unwrap()
            }));
        }
        let mut won = 0;
        for handle in handles {
            if handle.await.unwrap() {
                won += 1;
            }
        }
        assert_eq!(won, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_is_released_after_body() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::default());
        let lock = DistributedLock::new(store);
        assert!(
            lock.try_run("job-b", Duration::from_secs(60), || async {})
                .await
                .unwrap()
        );
        assert!(
            lock.try_run("job-b", Duration::from_secs(60), || async {})
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_self_heals_after_ttl() {
        let store = MemoryCoordinationStore::default();
        assert!(
            store
                .set_if_absent("job-lock:job-c", "dead-holder", Duration::from_secs(30))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_if_absent("job-lock:job-c", "other", Duration::from_secs(30))
                .await
                .unwrap()
        );
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(
            store
                .set_if_absent("job-lock:job-c", "other", Duration::from_secs(30))
                .await
                .unwrap()
        );
    }
}
