use super::{default_nango_url, AppConfig, BrokerConfig};
use tracing::warn;

impl AppConfig {
    /// Overrides file values with environment variables, read through
    /// `lookup` so tests can supply their own map.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parsed(&lookup, "ELBA_CONNECT_PORT") {
            self.server.port = v;
        }
        if let Some(v) = lookup("ELBA_WEBHOOK_SECRET") {
            self.server.webhook_secret = v;
        }
        if let Some(v) = lookup("ELBA_CONNECT_PUBLIC_URL") {
            self.server.public_url = v;
        }

        if let Some(v) = lookup("ELBA_CONNECT_DB_PATH") {
            self.store.db_path = v;
        }
        if let Some(v) = lookup("ELBA_CONNECT_ENCRYPTION_KEY") {
            self.store.encryption_key = v;
        }

        if let Some(v) = lookup("ELBA_API_BASE_URL") {
            self.elba.api_base_url = v;
        }
        if let Some(v) = lookup("ELBA_API_KEY") {
            self.elba.api_key = v;
        }

        if let Some(v) = lookup("VENDOR_API_BASE_URL") {
            self.vendor.api_base_url = v;
        }
        if let Some(v) = lookup("VENDOR_AUTH_URL") {
            self.vendor.auth_url = v;
        }
        if let Some(v) = lookup("VENDOR_TOKEN_URL") {
            self.vendor.token_url = v;
        }
        if let Some(v) = lookup("VENDOR_CLIENT_ID") {
            self.vendor.client_id = v;
        }
        if let Some(v) = lookup("VENDOR_CLIENT_SECRET") {
            self.vendor.client_secret = v;
        }
        if let Some(v) = lookup("VENDOR_SCOPES") {
            self.vendor.scopes = v.split_whitespace().map(str::to_string).collect();
        }

        // A secret key is what turns the broker on.
        if let Some(secret_key) = lookup("NANGO_SECRET_KEY") {
            let broker = self.broker.get_or_insert_with(|| BrokerConfig {
                base_url: default_nango_url(),
                integration_id: String::new(),
                secret_key: String::new(),
            });
            broker.secret_key = secret_key;
        }
        if let Some(broker) = self.broker.as_mut() {
            if let Some(v) = lookup("NANGO_BASE_URL") {
                broker.base_url = v;
            }
            if let Some(v) = lookup("NANGO_INTEGRATION_ID") {
                broker.integration_id = v;
            }
        }

        if let Some(v) = parsed(&lookup, "ELBA_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, "ELBA_MAX_ATTEMPTS") {
            self.functions.max_attempts = v;
        }
        if let Some(v) = parsed(&lookup, "ELBA_DELETE_CONCURRENCY") {
            self.functions.delete_concurrency = v;
        }

        if let Some(v) = parsed(&lookup, "NATS_ENABLED") {
            self.nats.enabled = v;
        }
        if let Some(v) = lookup("NATS_URL") {
            self.nats.url = v;
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
