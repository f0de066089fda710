use crate::coordination::DistributedLock;
use crate::pricing::cost_of;
use crate::usage::RecordStore;
use crate::wallet::{AccountKind, WalletStore};
use std::sync::Arc;
use std::time::Duration;

const RECONCILE_JOB: &str = "usage-reconcile";

/// Settles finished-but-uncharged usage records against user accounts.
/// Runs periodically under a distributed lock so at most one instance
/// scans at a time; the scan itself is idempotent because each record is
/// re-read and charged at most once.
#[derive(Clone)]
pub struct UsageReconciler {
    records: Arc<dyn RecordStore>,
    wallets: Arc<dyn WalletStore>,
    lock: DistributedLock,
    lock_ttl: Duration,
}

impl UsageReconciler {
    pub fn new(
        records: Arc<dyn RecordStore>,
        wallets: Arc<dyn WalletStore>,
        lock: DistributedLock,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            records,
            wallets,
            lock,
            lock_ttl,
        }
    }

    /// One scheduled pass: skipped entirely when another instance holds
    /// the lock.
    pub async fn run(&self) {
        let this = self.clone();
        let result = self
            .lock
            .try_run(RECONCILE_JOB, self.lock_ttl, || async move {
                this.run_once().await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!(error = %err, "reconcile lock handling failed");
        }
    }

    /// Charge every finished, uncharged record. Callable directly in tests
    /// and by the lock-wrapped scheduler path.
    pub async fn run_once(&self) {
        let candidates = match self.records.list_uncharged_finished().await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::error!(error = %err, "uncharged record scan failed");
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }
        tracing::info!(count = candidates.len(), "reconciling usage records");
        for candidate in candidates {
            if let Err(err) = self.charge(&candidate.id).await {
                tracing::error!(record_id = %candidate.id, error = %err, "charge failed");
            }
        }
    }

    /// Re-reads the record before charging: the scan snapshot may be stale
    /// by the time this record's turn comes.
    async fn charge(&self, record_id: &str) -> Result<(), String> {
        let Some(record) = self.records.get(record_id).await? else {
            tracing::warn!(record_id, "record vanished between scan and charge");
            return Ok(());
        };
        if record.is_charged || record.finished_at.is_none() {
            return Ok(());
        }
        let cost = cost_of(&record.usage, &record.prices);
        // Marking first means a crash mid-charge forfeits revenue rather
        // than double-billing on the next pass.
        self.records.mark_charged(record_id).await?;
        match self
            .wallets
            .account_kind(&record.user_id, &record.model)
            .await?
        {
            AccountKind::Balance => {
                self.wallets.debit(&record.user_id, cost).await?;
            }
            AccountKind::Quota => {
                let tokens = record.usage.prompt_tokens
                    + record.usage.completion_tokens
                    + record.usage.image_count;
                self.wallets
                    .debit_clamped(&record.user_id, &record.model, tokens)
                    .await?;
            }
        }
        metrics::counter!("aigate_records_charged_total").increment(1);
        tracing::info!(
            record_id,
            user_id = %record.user_id,
            model = %record.model,
            cost = %cost,
            "usage record charged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use crate::pricing::{UnitPrices, UsageCounters};
    use crate::usage::{MemoryRecordStore, UsageRecorder};
    use crate::wallet::MemoryWalletStore;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn reconciler(
        records: Arc<dyn RecordStore>,
        wallets: Arc<MemoryWalletStore>,
    ) -> UsageReconciler {
        UsageReconciler::new(
            records,
            wallets,
            DistributedLock::new(Arc::new(MemoryCoordinationStore::default())),
            Duration::from_secs(600),
        )
    }

    fn prices() -> UnitPrices {
        UnitPrices {
            prompt: Decimal::from_str("0.06").unwrap(),
            completion: Decimal::from_str("0.1").unwrap(),
            ..UnitPrices::default()
        }
    }

    async fn finished_record(store: Arc<dyn RecordStore>, user: &str) -> String {
        let mut recorder = UsageRecorder::begin(store, user, "gpt-test").await.unwrap();
        recorder
            .report(UsageCounters {
                prompt_tokens: 50,
                completion_tokens: 10,
                image_count: 0,
            })
            .await;
        recorder.finish(prices()).await;
        recorder.record_id().to_string()
    }

    #[tokio::test]
    async fn charges_balance_from_captured_prices() {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
        let wallets = Arc::new(MemoryWalletStore::default());
        wallets.set_balance("user-1", Decimal::from(10)).await;
        let id = finished_record(records.clone(), "user-1").await;

        reconciler(records.clone(), wallets.clone()).run_once().await;

        // 50 * 0.06 / 1000 + 10 * 0.1 / 1000 = 0.004
        assert_eq!(
            wallets.balance("user-1").await.unwrap(),
            Decimal::from_str("9.996").unwrap()
        );
        assert!(records.get(&id).await.unwrap().unwrap().is_charged);
    }

    #[tokio::test]
    async fn second_pass_charges_nothing() {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
        let wallets = Arc::new(MemoryWalletStore::default());
        wallets.set_balance("user-1", Decimal::from(10)).await;
        finished_record(records.clone(), "user-1").await;

        let reconciler = reconciler(records, wallets.clone());
        reconciler.run_once().await;
        let after_first = wallets.balance("user-1").await.unwrap();
        reconciler.run_once().await;
        assert_eq!(wallets.balance("user-1").await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn quota_accounts_are_clamped_not_billed() {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
        let wallets = Arc::new(MemoryWalletStore::default());
        wallets.set_balance("user-1", Decimal::from(10)).await;
        wallets.set_quota("user-1", "gpt-test", 25).await;
        finished_record(records.clone(), "user-1").await;

        reconciler(records, wallets.clone()).run_once().await;

        // 60 tokens against a quota of 25 floors at zero.
        assert_eq!(wallets.quota("user-1", "gpt-test").await.unwrap(), Some(0));
        assert_eq!(wallets.balance("user-1").await.unwrap(), Decimal::from(10));
    }

    #[tokio::test]
    async fn unfinished_records_are_left_alone() {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
        let wallets = Arc::new(MemoryWalletStore::default());
        let recorder = UsageRecorder::begin(records.clone(), "user-1", "gpt-test")
            .await
            .unwrap();
        let id = recorder.record_id().to_string();

        reconciler(records.clone(), wallets).run_once().await;
        assert!(!records.get(&id).await.unwrap().unwrap().is_charged);
    }
}
