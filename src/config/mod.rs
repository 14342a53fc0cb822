mod env;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::sync::Arc;

/// Complete connector configuration.
///
/// Built once at startup (TOML file, then environment overrides) and shared
/// read-only as [`SharedConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub elba: ElbaConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    /// Present only when credentials are resolved through Nango.
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub nats: NatsConfig,
}

pub type SharedConfig = Arc<AppConfig>;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "ELBA_CONNECT_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for `X-Elba-Signature` verification.
    #[serde(default)]
    pub webhook_secret: String,
    /// Externally reachable base URL, used to build the OAuth redirect URI.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default = "default_oauth_state_expiry")]
    pub oauth_state_expiry_secs: i64,
}

fn default_port() -> u16 {
    3000
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_oauth_state_expiry() -> i64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            webhook_secret: String::new(),
            public_url: default_public_url(),
            oauth_state_expiry_secs: default_oauth_state_expiry(),
        }
    }
}

impl ServerConfig {
    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.public_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Base64-encoded 32-byte AES-256 key.
    #[serde(default)]
    pub encryption_key: String,
}

fn default_db_path() -> String {
    "organisations.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            encryption_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElbaConfig {
    #[serde(default = "default_elba_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_elba_url() -> String {
    "https://api.elba.io".to_string()
}

impl Default for ElbaConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_elba_url(),
            api_key: String::new(),
        }
    }
}

/// Vendor endpoints and the JSON paths used to read its user listing.
#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    #[serde(default)]
    pub api_base_url: String,
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_users_path")]
    pub users_path: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default)]
    pub fields: UserFieldPaths,
}

fn default_users_path() -> String {
    "/users".to_string()
}

fn default_page_size() -> u32 {
    200
}

fn default_page_size_param() -> String {
    "limit".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            auth_url: String::new(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            users_path: default_users_path(),
            page_size: default_page_size(),
            page_size_param: default_page_size_param(),
            cursor_param: default_cursor_param(),
            fields: UserFieldPaths::default(),
        }
    }
}

impl VendorConfig {
    /// OAuth install is available only when the vendor exposes an
    /// authorization endpoint and a client id.
    pub fn supports_oauth(&self) -> bool {
        !self.auth_url.is_empty() && !self.token_url.is_empty() && !self.client_id.is_empty()
    }
}

/// Dot-separated paths into the vendor's list-users response.
#[derive(Debug, Clone, Deserialize)]
pub struct UserFieldPaths {
    /// Path to the array of user objects.
    #[serde(default = "default_users_field")]
    pub users: String,
    #[serde(default = "default_id_field")]
    pub id: String,
    #[serde(default = "default_email_field")]
    pub email: String,
    #[serde(default = "default_display_name_field")]
    pub display_name: String,
    /// Path to an array of secondary emails, if the vendor has one.
    #[serde(default)]
    pub additional_emails: Option<String>,
    #[serde(default = "default_next_cursor_field")]
    pub next_cursor: String,
}

fn default_users_field() -> String {
    "users".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_email_field() -> String {
    "email".to_string()
}

fn default_display_name_field() -> String {
    "name".to_string()
}

fn default_next_cursor_field() -> String {
    "next_cursor".to_string()
}

impl Default for UserFieldPaths {
    fn default() -> Self {
        Self {
            users: default_users_field(),
            id: default_id_field(),
            email: default_email_field(),
            display_name: default_display_name_field(),
            additional_emails: None,
            next_cursor: default_next_cursor_field(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_nango_url")]
    pub base_url: String,
    /// Nango `provider_config_key` of the vendor integration.
    pub integration_id: String,
    pub secret_key: String,
}

fn default_nango_url() -> String {
    "https://api.nango.dev".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    3600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
        }
    }
}

/// Retry, concurrency and refresh tuning for the pipeline functions.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionsConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delete_concurrency")]
    pub delete_concurrency: usize,
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,
    #[serde(default = "default_refresh_backoff")]
    pub refresh_backoff_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_delete_concurrency() -> usize {
    5
}

fn default_refresh_window() -> u64 {
    30 * 60
}

fn default_refresh_backoff() -> u64 {
    15 * 60
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap() -> u64 {
    10 * 60
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delete_concurrency: default_delete_concurrency(),
            refresh_window_secs: default_refresh_window(),
            refresh_backoff_secs: default_refresh_backoff(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

impl FunctionsConfig {
    pub fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_window_secs as i64)
    }

    pub fn refresh_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_backoff_secs)
    }
}

/// NATS JetStream transport between the webhook server and the worker.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// When false the worker runs the HTTP surface in-process instead.
    #[serde(default = "default_nats_enabled")]
    pub enabled: bool,
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
    /// Redelivery timeout of an unacknowledged event. Progress is signalled
    /// at half this interval while its job is pending.
    #[serde(default = "default_ack_wait")]
    pub ack_wait_secs: u64,
    /// Events handed to the worker and not yet settled.
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: i64,
}

fn default_nats_enabled() -> bool {
    true
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_stream_name() -> String {
    "ELBA_CONNECT".to_string()
}

fn default_subject_prefix() -> String {
    "elba.connect".to_string()
}

fn default_max_age_days() -> i64 {
    7
}

fn default_ack_wait() -> u64 {
    60
}

fn default_max_ack_pending() -> i64 {
    10_000
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_nats_enabled(),
            url: default_nats_url(),
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            max_age_days: default_max_age_days(),
            ack_wait_secs: default_ack_wait(),
            max_ack_pending: default_max_ack_pending(),
        }
    }
}

impl AppConfig {
    /// Loads the TOML file named by `ELBA_CONNECT_CONFIG` (if set), applies
    /// environment overrides and checks required secrets.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => load_config(&path)?,
            Err(_) => AppConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fails when a secret every process needs is missing.
    pub fn validate(&self) -> Result<()> {
        if self.store.encryption_key.is_empty() {
            bail!("store.encryption_key is required (set ELBA_CONNECT_ENCRYPTION_KEY)");
        }
        if self.elba.api_key.is_empty() {
            bail!("elba.api_key is required (set ELBA_API_KEY)");
        }
        if self.vendor.api_base_url.is_empty() {
            bail!("vendor.api_base_url is required (set VENDOR_API_BASE_URL)");
        }
        if self.functions.max_attempts == 0 {
            bail!("functions.max_attempts must be at least 1");
        }
        if self.functions.delete_concurrency == 0 {
            bail!("functions.delete_concurrency must be at least 1");
        }
        if self.nats.enabled && self.nats.ack_wait_secs < 2 {
            bail!("nats.ack_wait_secs must be at least 2");
        }
        Ok(())
    }

    /// The webhook secret is only needed by processes that serve HTTP.
    pub fn require_webhook_secret(&self) -> Result<&str> {
        if self.server.webhook_secret.is_empty() {
            bail!("server.webhook_secret is required (set ELBA_WEBHOOK_SECRET)");
        }
        Ok(&self.server.webhook_secret)
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(self)
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config file '{}'", path))
}
