use crate::adapters::tools::{ToolRunner, WebSearchTool};
use crate::catalog::{ModelCatalog, ModelEntry};
use crate::config::RuntimeConfig;
use crate::coordination::{
    CoordinationStore, DistributedLock, MemoryCoordinationStore, SqliteCoordinationStore,
};
use crate::dispatch::Dispatcher;
use crate::handlers;
use crate::objectstore::{FsObjectStore, MemoryObjectStore, ObjectStore};
use crate::reconcile::UsageReconciler;
use crate::relay::{RelaySettings, StreamRelay};
use crate::ticket::TicketCache;
use crate::usage::{MemoryRecordStore, RecordStore, SqliteRecordStore};
use crate::wallet::{MemoryWalletStore, SqliteWalletStore, WalletStore};
use axum::Router;
use axum::routing::{get, post};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: RuntimeConfig,
    pub catalog: ModelCatalog,
    pub tickets: TicketCache,
    pub relay: StreamRelay,
    pub reconciler: UsageReconciler,
    pub records: Arc<dyn RecordStore>,
    pub wallets: Arc<dyn WalletStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl AppState {
    /// Production wiring: every store backed by the configured sqlite
    /// database.
    pub async fn from_config(config: RuntimeConfig) -> Result<Self, String> {
        let options = SqliteConnectOptions::from_str(&config.database_dsn)
            .map_err(|err| err.to_string())?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|err| err.to_string())?;
        let records: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(pool.clone()).await?);
        let coordination: Arc<dyn CoordinationStore> =
            Arc::new(SqliteCoordinationStore::new(pool.clone()).await?);
        let wallets: Arc<dyn WalletStore> = Arc::new(SqliteWalletStore::new(pool).await?);
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(
            config.objects_dir.clone(),
            config.public_base_url.clone(),
        ));
        let state = Self::assemble(config, records, coordination, wallets, objects).await?;
        state.load_models().await?;
        Ok(state)
    }

    /// In-memory wiring, used by tests and single-process deployments that
    /// can afford to lose state on restart.
    pub async fn in_memory(config: RuntimeConfig) -> Result<Self, String> {
        let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::default());
        let coordination: Arc<dyn CoordinationStore> =
            Arc::new(MemoryCoordinationStore::default());
        let wallets: Arc<dyn WalletStore> = Arc::new(MemoryWalletStore::default());
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::default());
        Self::assemble(config, records, coordination, wallets, objects).await
    }

    async fn assemble(
        config: RuntimeConfig,
        records: Arc<dyn RecordStore>,
        coordination: Arc<dyn CoordinationStore>,
        wallets: Arc<dyn WalletStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("aigate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| err.to_string())?;
        let mut tools: Vec<Arc<dyn ToolRunner>> = Vec::new();
        if let Some(endpoint) = &config.search_api_url {
            tools.push(Arc::new(WebSearchTool::new(
                http.clone(),
                endpoint.clone(),
                config.search_api_key.clone(),
            )));
        }
        let catalog = ModelCatalog::new();
        let tickets = TicketCache::new(
            coordination.clone(),
            Duration::from_secs(config.ticket_ttl_seconds),
        );
        let relay = StreamRelay::new(
            tickets.clone(),
            Dispatcher::new(catalog.clone(), tools),
            records.clone(),
            coordination.clone(),
            http,
            objects.clone(),
            config.rehost_images,
            RelaySettings {
                retry_times: config.relay_retry_times,
                retry_sleep: Duration::from_millis(config.relay_retry_sleep_ms),
            },
        );
        let reconciler = UsageReconciler::new(
            records.clone(),
            wallets.clone(),
            DistributedLock::new(coordination),
            Duration::from_secs(config.reconcile_lock_ttl_seconds),
        );
        Ok(Self {
            config,
            catalog,
            tickets,
            relay,
            reconciler,
            records,
            wallets,
            objects,
        })
    }

    /// Load the model catalog from the configured JSON file. A missing
    /// file leaves the catalog empty so the gateway can still boot.
    pub async fn load_models(&self) -> Result<(), String> {
        let raw = match tokio::fs::read(&self.config.models_file).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(file = %self.config.models_file, "models file not found");
                return Ok(());
            }
            Err(err) => return Err(err.to_string()),
        };
        let entries: Vec<ModelEntry> =
            serde_json::from_slice(&raw).map_err(|err| err.to_string())?;
        let count = entries.len();
        self.catalog.replace_all(entries).await?;
        tracing::info!(count, file = %self.config.models_file, "model catalog loaded");
        Ok(())
    }

    /// Periodic reconciliation. Every instance ticks; the distributed lock
    /// picks the one that actually scans.
    pub fn spawn_reconcile_loop(&self) {
        let reconciler = self.reconciler.clone();
        let period = Duration::from_secs(self.config.reconcile_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a rolling
            // restart does not stampede the scan.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                reconciler.run().await;
            }
        });
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/pre_check", post(handlers::pre_check))
        .route("/api/chat/stream", get(handlers::chat_stream))
        .route("/api/models", get(handlers::list_models))
        .route("/objects/{name}", get(handlers::get_object))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
