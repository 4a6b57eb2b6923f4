use gproxy_common::GlobalConfig;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub config_json: JsonValue,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: i64,
    pub provider_id: i64,
    pub name: Option<String>,
    pub settings_json: JsonValue,
    pub secret_json: JsonValue,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UserKeyRow {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub label: Option<String>,
    /// Worker-key level override: disable upstream safety filtering for requests
    /// authenticated with this key (spec's `WorkerKey.safetyEnabled`, inverted).
    pub safety_enabled: bool,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ModelConfigRow {
    pub id: i64,
    pub provider_id: i64,
    pub model_id: String,
    pub category: String,
    pub daily_quota: Option<i64>,
    pub individual_quota: Option<i64>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderQuotaRow {
    pub id: i64,
    pub provider_id: i64,
    pub pro_quota: i64,
    pub flash_quota: i64,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CredentialQuotaStateRow {
    pub id: i64,
    pub credential_id: i64,
    /// Civil date the usage counters below were last rolled for, `"YYYY-MM-DD"`.
    pub usage_date: String,
    pub model_usage_json: JsonValue,
    pub category_usage_json: JsonValue,
    /// Last HTTP status that drove the credential unavailable, if any (400/401/403/429/5xx).
    pub error_status: Option<i32>,
    pub consecutive_429_json: JsonValue,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub global_config: Option<GlobalConfigRow>,
    pub providers: Vec<ProviderRow>,
    pub credentials: Vec<CredentialRow>,
    pub users: Vec<UserRow>,
    pub user_keys: Vec<UserKeyRow>,
    pub model_configs: Vec<ModelConfigRow>,
    pub provider_quotas: Vec<ProviderQuotaRow>,
    pub credential_quota_states: Vec<CredentialQuotaStateRow>,
}
