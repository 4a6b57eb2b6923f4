use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Outbound proxy pool for upstream egress: comma-separated
    /// `socks5://…` URLs, rotated round-robin (see `ProxyPool`). Empty or
    /// absent means direct connections.
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Keep client SSE connections alive with heartbeat frames while a
    /// non-streaming upstream call is in flight, instead of making the
    /// client wait on a silent connection.
    pub keepalive_enabled: bool,
    /// Max number of key-rotation retries per request before giving up.
    pub max_retry: u32,
    /// Whether to surface the upstream's built-in web-search tool.
    pub web_search_enabled: bool,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub keepalive_enabled: Option<bool>,
    pub max_retry: Option<u32>,
    pub web_search_enabled: Option<bool>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.keepalive_enabled.is_some() {
            self.keepalive_enabled = other.keepalive_enabled;
        }
        if other.max_retry.is_some() {
            self.max_retry = other.max_retry;
        }
        if other.web_search_enabled.is_some() {
            self.web_search_enabled = other.web_search_enabled;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            keepalive_enabled: self.keepalive_enabled.unwrap_or(false),
            max_retry: self.max_retry.unwrap_or(2),
            web_search_enabled: self.web_search_enabled.unwrap_or(false),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            keepalive_enabled: Some(value.keepalive_enabled),
            max_retry: Some(value.max_retry),
            web_search_enabled: Some(value.web_search_enabled),
        }
    }
}
