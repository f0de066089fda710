use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub database_dsn: String,
    /// TTL for staged request tickets, seconds.
    pub ticket_ttl_seconds: u64,
    /// Max redeliveries attempted when the client transport reports Full.
    pub relay_retry_times: u32,
    /// Fixed sleep between redelivery attempts, milliseconds.
    pub relay_retry_sleep_ms: u64,
    /// Interval between reconciliation passes, seconds.
    pub reconcile_interval_seconds: u64,
    /// TTL on the reconciliation job lock, seconds.
    pub reconcile_lock_ttl_seconds: u64,
    /// Rewrite upstream image URLs through the object store.
    pub rehost_images: bool,
    /// Directory the filesystem object store writes re-hosted assets to.
    pub objects_dir: String,
    /// Base URL prepended to re-hosted asset paths. Empty means the URLs
    /// stay relative to this gateway.
    pub public_base_url: String,
    /// Endpoint of the web search API behind the search tool. The tool is
    /// only registered when this is set.
    pub search_api_url: Option<String>,
    pub search_api_key: String,
    /// JSON file holding the model catalog entries.
    pub models_file: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("AIGATE_LISTEN", "0.0.0.0:8080"),
            database_dsn: env_or("AIGATE_DATABASE_DSN", "sqlite://data/aigate.db"),
            ticket_ttl_seconds: env_parsed("AIGATE_TICKET_TTL_SECONDS", 300),
            relay_retry_times: env_parsed("AIGATE_RELAY_RETRY_TIMES", 3),
            relay_retry_sleep_ms: env_parsed("AIGATE_RELAY_RETRY_SLEEP_MS", 500),
            reconcile_interval_seconds: env_parsed("AIGATE_RECONCILE_INTERVAL_SECONDS", 60),
            reconcile_lock_ttl_seconds: env_parsed("AIGATE_RECONCILE_LOCK_TTL_SECONDS", 600),
            rehost_images: env_parsed("AIGATE_REHOST_IMAGES", true),
            objects_dir: env_or("AIGATE_OBJECTS_DIR", "data/objects"),
            public_base_url: env_or("AIGATE_PUBLIC_BASE_URL", ""),
            search_api_url: std::env::var("AIGATE_SEARCH_API_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            search_api_key: env_or("AIGATE_SEARCH_API_KEY", ""),
            models_file: env_or("AIGATE_MODELS_FILE", "models.json"),
        }
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_parsed<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

/// Settings for OpenAI-compatible chat and image providers. Parsed from the
/// catalog entry's settings map when the model is registered.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ask the upstream to attach usage to streamed chunks.
    #[serde(default = "default_true")]
    pub include_usage: bool,
    /// Sentinel tag demarcating an inline reasoning channel, e.g. "think".
    #[serde(default)]
    pub reasoning_tag: Option<String>,
    /// Upper bound on tool-call continuation legs.
    #[serde(default = "default_tool_depth")]
    pub max_tool_depth: u32,
}

/// Settings for the signed-HMAC streaming provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedSettings {
    pub secret_id: String,
    pub secret_key: String,
    /// Upstream host. A scheme may be included; https is assumed when it
    /// is not.
    pub endpoint: String,
    #[serde(default = "default_signed_path")]
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Settings for the job-submission/poll image provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageJobSettings {
    pub api_key: String,
    pub base_url: String,
    #[serde(default = "default_submit_path")]
    pub submit_path: String,
    /// `{id}` is replaced with the submitted job id.
    #[serde(default = "default_result_path")]
    pub result_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_tool_depth() -> u32 {
    4
}

fn default_signed_path() -> String {
    "/chat/completions".to_string()
}

fn default_submit_path() -> String {
    "/submit/imagine".to_string()
}

fn default_result_path() -> String {
    "/task/{id}/fetch".to_string()
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_job_timeout_ms() -> u64 {
    300_000
}
