use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use time::OffsetDateTime;

use gproxy_common::GlobalConfig;
use gproxy_common::GlobalConfigPatch;
use gproxy_provider_core::{
    CategoryQuotas, CivilClock, Credential, CredentialPool, EventHub, KeyUsageState, ModelCatalog,
    ModelCategory, ModelConfig, ProxyPool, QuotaLedger, parse_civil_date,
};
use gproxy_storage::{
    CredentialQuotaStateRow, CredentialRow, ProviderRow, StorageSnapshot, UserKeyRow, UserRow,
};

pub struct ProviderRuntime {
    pub provider_id: String,
    /// Provider config as JSON for now (parsed into typed ProviderConfig later).
    pub config_json: ArcSwap<serde_json::Value>,
    pub pool: CredentialPool,
    /// Per-key daily usage and rotation cursor for this provider's credentials.
    pub quota: QuotaLedger,
    /// Known models and category-wide quotas for this provider.
    pub catalog: ModelCatalog,
}

impl ProviderRuntime {
    fn new(provider_id: String, config_json: serde_json::Value, events: EventHub) -> Self {
        Self {
            provider_id,
            config_json: ArcSwap::from_pointee(config_json),
            pool: CredentialPool::new(events),
            quota: QuotaLedger::new(CivilClock::default_offset()),
            catalog: ModelCatalog::new(CategoryQuotas::default()),
        }
    }

    /// Builds a runtime with quota/catalog state restored from a bootstrap
    /// snapshot, so a process restart doesn't silently zero out today's
    /// usage counters and model catalog.
    fn from_snapshot(
        provider_id: String,
        config_json: serde_json::Value,
        events: EventHub,
        category_quotas: CategoryQuotas,
        models: Vec<ModelConfig>,
        usage_states: HashMap<i64, KeyUsageState>,
    ) -> Self {
        Self {
            provider_id,
            config_json: ArcSwap::from_pointee(config_json),
            pool: CredentialPool::new(events),
            quota: QuotaLedger::from_parts(CivilClock::default_offset(), usage_states),
            catalog: ModelCatalog::from_parts(category_quotas, models),
        }
    }
}

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub providers: ArcSwap<HashMap<String, Arc<ProviderRuntime>>>,
    pub snapshot: ArcSwap<StorageSnapshot>,
    pub events: EventHub,
    /// Round-robin pool of outbound SOCKS5 proxies parsed from
    /// `global.proxy` (a comma-separated list). Rebuilt whenever the global
    /// config changes so an admin edit takes effect on the next dispatch.
    pub proxy_pool: ArcSwap<ProxyPool>,
}

pub struct CredentialInsertInput {
    pub id: i64,
    pub provider_name: String,
    pub provider_id: i64,
    pub name: Option<String>,
    pub settings_json: serde_json::Value,
    pub secret_json: serde_json::Value,
    pub enabled: bool,
}

impl AppState {
    pub async fn from_bootstrap(
        global: GlobalConfig,
        snapshot: StorageSnapshot,
        events: EventHub,
    ) -> anyhow::Result<Self> {
        let mut providers: HashMap<String, Arc<ProviderRuntime>> = HashMap::new();
        let mut provider_id_to_name: HashMap<i64, String> = HashMap::new();

        // Create per-provider runtimes, restoring quota/catalog state from
        // the persisted snapshot so a restart doesn't silently zero it out.
        for p in &snapshot.providers {
            provider_id_to_name.insert(p.id, p.name.clone());

            let category_quotas = snapshot
                .provider_quotas
                .iter()
                .find(|q| q.provider_id == p.id)
                .map(|q| CategoryQuotas {
                    pro_quota: q.pro_quota,
                    flash_quota: q.flash_quota,
                })
                .unwrap_or_default();

            let models: Vec<ModelConfig> = snapshot
                .model_configs
                .iter()
                .filter(|m| m.provider_id == p.id)
                .map(|m| ModelConfig {
                    id: m.model_id.clone(),
                    category: ModelCategory::from_persisted(&m.category),
                    daily_quota: m.daily_quota,
                    individual_quota: m.individual_quota,
                })
                .collect();

            let provider_credential_ids: std::collections::HashSet<i64> = snapshot
                .credentials
                .iter()
                .filter(|c| c.provider_id == p.id)
                .map(|c| c.id)
                .collect();
            let usage_states: HashMap<i64, KeyUsageState> = snapshot
                .credential_quota_states
                .iter()
                .filter(|row| provider_credential_ids.contains(&row.credential_id))
                .map(|row| {
                    let state = KeyUsageState::from_json_parts(
                        parse_civil_date(&row.usage_date),
                        &row.model_usage_json,
                        &row.category_usage_json,
                        &row.consecutive_429_json,
                    );
                    (row.credential_id, state)
                })
                .collect();

            let runtime = ProviderRuntime::from_snapshot(
                p.name.clone(),
                p.config_json.clone(),
                events.clone(),
                category_quotas,
                models,
                usage_states,
            );
            providers.insert(p.name.clone(), Arc::new(runtime));
        }

        // Load credentials into the corresponding provider pool (in-memory only).
        for c in &snapshot.credentials {
            if !c.enabled {
                continue;
            }
            let Some(provider_name) = provider_id_to_name.get(&c.provider_id) else {
                continue;
            };
            let Some(runtime) = providers.get(provider_name) else {
                continue;
            };
            let cred: Credential = serde_json::from_value(c.secret_json.clone())
                .with_context(|| format!("decode credential_json for credential_id={}", c.id))?;
            runtime.pool.insert(provider_name.clone(), c.id, cred).await;
        }

        let proxy_pool = ProxyPool::from_config(global.proxy.as_deref());

        Ok(Self {
            global: ArcSwap::from_pointee(global),
            providers: ArcSwap::from_pointee(providers),
            snapshot: ArcSwap::from_pointee(snapshot),
            events,
            proxy_pool: ArcSwap::from_pointee(proxy_pool),
        })
    }

    pub fn apply_global_config(&self, config: GlobalConfig) {
        self.proxy_pool
            .store(Arc::new(ProxyPool::from_config(config.proxy.as_deref())));
        self.global.store(Arc::new(config));
    }

    /// Picks the next outbound proxy in rotation, or `None` for a direct
    /// connection when the pool is empty.
    pub fn next_outbound_proxy(&self) -> Option<String> {
        self.proxy_pool.load().next_transport()
    }

    pub fn apply_provider_upsert(
        &self,
        id: i64,
        name: String,
        config_json: serde_json::Value,
        enabled: bool,
    ) {
        let now = OffsetDateTime::now_utc();

        // 1) Update snapshot (admin/proxy reads only).
        let mut snap = self.snapshot.load().as_ref().clone();
        match snap.providers.iter_mut().find(|p| p.name == name) {
            Some(p) => {
                p.id = id;
                p.config_json = config_json.clone();
                p.enabled = enabled;
                p.updated_at = now;
            }
            None => snap.providers.push(ProviderRow {
                id,
                name: name.clone(),
                config_json: config_json.clone(),
                enabled,
                updated_at: now,
            }),
        }
        self.snapshot.store(Arc::new(snap));

        // 2) Ensure a runtime exists (used by proxy engine for upstream IO).
        let mut map = self.providers.load().as_ref().clone();
        match map.get(&name) {
            Some(rt) => rt.config_json.store(Arc::new(config_json)),
            None => {
                map.insert(
                    name.clone(),
                    Arc::new(ProviderRuntime::new(
                        name.clone(),
                        config_json,
                        self.events.clone(),
                    )),
                );
                self.providers.store(Arc::new(map));
            }
        }
    }

    pub fn apply_provider_delete(&self, name: &str) {
        // Remove from snapshot (including credentials that belonged to the provider).
        let mut snap = self.snapshot.load().as_ref().clone();
        let provider_id = snap.providers.iter().find(|p| p.name == name).map(|p| p.id);
        snap.providers.retain(|p| p.name != name);
        if let Some(pid) = provider_id {
            snap.credentials.retain(|c| c.provider_id != pid);
        }
        self.snapshot.store(Arc::new(snap));

        // Remove runtime.
        let mut map = self.providers.load().as_ref().clone();
        map.remove(name);
        self.providers.store(Arc::new(map));
    }

    pub fn apply_credential_delete(&self, credential_id: i64) {
        let mut snap = self.snapshot.load().as_ref().clone();
        snap.credentials.retain(|c| c.id != credential_id);
        self.snapshot.store(Arc::new(snap));
        // Pool removal is handled by disabling (set_enabled=false); for delete we currently
        // just remove from the provider index by best-effort.
        // If needed, we can add a pool.delete(id) later.
    }

    pub async fn apply_credential_update(
        &self,
        credential_id: i64,
        name: Option<String>,
        settings_json: serde_json::Value,
        secret_json: serde_json::Value,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();

        // Update snapshot and find provider.
        let mut snap = self.snapshot.load().as_ref().clone();
        let Some(row) = snap.credentials.iter_mut().find(|c| c.id == credential_id) else {
            return Ok(());
        };
        row.name = name.clone();
        row.settings_json = settings_json;
        row.secret_json = secret_json.clone();
        row.updated_at = now;
        let provider_name = snap
            .providers
            .iter()
            .find(|p| p.id == row.provider_id)
            .map(|p| p.name.clone());
        let enabled = row.enabled;
        self.snapshot.store(Arc::new(snap));

        // If enabled, ensure pool has the latest credential material.
        if enabled {
            let Some(provider_name) = provider_name else {
                return Ok(());
            };
            let Some(runtime) = self.providers.load().get(&provider_name).cloned() else {
                return Ok(());
            };
            let cred: Credential = serde_json::from_value(secret_json).with_context(|| {
                format!("decode credential_json for credential_id={credential_id} provider={provider_name}")
            })?;
            runtime
                .pool
                .insert(provider_name.clone(), credential_id, cred)
                .await;
        }
        Ok(())
    }

    pub fn apply_global_config_patch(
        &self,
        patch: GlobalConfigPatch,
    ) -> anyhow::Result<GlobalConfig> {
        let current = self.global.load().as_ref().clone();
        let mut merged = GlobalConfigPatch::from(current);
        merged.overlay(patch);
        let next = merged.into_config()?;
        self.proxy_pool
            .store(Arc::new(ProxyPool::from_config(next.proxy.as_deref())));
        self.global.store(Arc::new(next.clone()));
        Ok(next)
    }

    pub async fn apply_credential_insert(
        &self,
        input: CredentialInsertInput,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        let CredentialInsertInput {
            id,
            provider_name,
            provider_id,
            name,
            settings_json,
            secret_json,
            enabled,
        } = input;

        // Update snapshot first.
        let mut snap = self.snapshot.load().as_ref().clone();
        snap.credentials.push(CredentialRow {
            id,
            provider_id,
            name,
            settings_json,
            secret_json: secret_json.clone(),
            enabled,
            created_at: now,
            updated_at: now,
        });
        self.snapshot.store(Arc::new(snap));

        // Update pool (enabled credentials only).
        if enabled {
            let Some(runtime) = self.providers.load().get(&provider_name).cloned() else {
                return Ok(());
            };
            let cred: Credential = serde_json::from_value(secret_json).with_context(|| {
                format!("decode credential_json for credential_id={id} provider={provider_name}")
            })?;
            runtime.pool.insert(provider_name, id, cred).await;
        }
        Ok(())
    }

    pub async fn apply_credential_enabled(
        &self,
        credential_id: i64,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        let Some(row) = snap.credentials.iter_mut().find(|c| c.id == credential_id) else {
            // Unknown in memory; nothing to do.
            return Ok(());
        };
        row.enabled = enabled;
        row.updated_at = now;

        // Resolve provider name for pool operation.
        let provider_name = snap
            .providers
            .iter()
            .find(|p| p.id == row.provider_id)
            .map(|p| p.name.clone());
        let secret_json = row.secret_json.clone();

        self.snapshot.store(Arc::new(snap));

        let Some(provider_name) = provider_name else {
            return Ok(());
        };
        let Some(runtime) = self.providers.load().get(&provider_name).cloned() else {
            return Ok(());
        };

        if enabled {
            // Ensure the credential exists in the pool (even if it was disabled at bootstrap).
            let cred: Credential = serde_json::from_value(secret_json).with_context(|| {
                format!("decode credential_json for credential_id={credential_id} provider={provider_name}")
            })?;
            runtime
                .pool
                .insert(provider_name.clone(), credential_id, cred)
                .await;
            runtime
                .pool
                .set_enabled(&provider_name, credential_id, true)
                .await;
        } else {
            runtime
                .pool
                .set_enabled(&provider_name, credential_id, false)
                .await;
        }

        Ok(())
    }

    pub fn apply_user_upsert(&self, id: i64, name: String, enabled: bool) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        match snap.users.iter_mut().find(|u| u.id == id) {
            Some(u) => {
                u.id = id;
                u.name = name;
                u.enabled = enabled;
                u.updated_at = now;
            }
            None => snap.users.push(UserRow {
                id,
                name,
                enabled,
                created_at: now,
                updated_at: now,
            }),
        }
        self.snapshot.store(Arc::new(snap));
    }

    pub fn apply_user_enabled(&self, user_id: i64, enabled: bool) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        if let Some(u) = snap.users.iter_mut().find(|u| u.id == user_id) {
            u.enabled = enabled;
            u.updated_at = now;
            self.snapshot.store(Arc::new(snap));
        }
    }

    pub fn apply_user_delete(&self, user_id: i64) {
        let mut snap = self.snapshot.load().as_ref().clone();
        snap.users.retain(|u| u.id != user_id);
        snap.user_keys.retain(|k| k.user_id != user_id);
        self.snapshot.store(Arc::new(snap));
    }

    pub fn apply_user_key_insert(
        &self,
        id: i64,
        user_id: i64,
        api_key: String,
        label: Option<String>,
        enabled: bool,
    ) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        snap.user_keys.push(UserKeyRow {
            id,
            user_id,
            api_key,
            label,
            safety_enabled: true,
            enabled,
            created_at: now,
            updated_at: now,
        });
        self.snapshot.store(Arc::new(snap));
    }

    pub fn apply_user_key_label(&self, user_key_id: i64, label: Option<String>) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        if let Some(k) = snap.user_keys.iter_mut().find(|k| k.id == user_key_id) {
            k.label = label;
            k.updated_at = now;
            self.snapshot.store(Arc::new(snap));
        }
    }

    pub fn apply_user_key_delete(&self, user_key_id: i64) {
        let mut snap = self.snapshot.load().as_ref().clone();
        snap.user_keys.retain(|k| k.id != user_key_id);
        self.snapshot.store(Arc::new(snap));
    }

    pub fn apply_user_key_enabled(&self, user_key_id: i64, enabled: bool) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        if let Some(k) = snap.user_keys.iter_mut().find(|k| k.id == user_key_id) {
            k.enabled = enabled;
            k.updated_at = now;
            self.snapshot.store(Arc::new(snap));
        }
    }

    /// Mirrors a persisted `credential_quota_states` upsert into the
    /// in-memory admin snapshot. The `id` on a freshly-inserted row is a
    /// placeholder (0): the snapshot is keyed on `credential_id` for this
    /// table and never read by primary key.
    pub fn apply_credential_quota_state(
        &self,
        credential_id: i64,
        usage_date: String,
        model_usage_json: serde_json::Value,
        category_usage_json: serde_json::Value,
        error_status: Option<i32>,
        consecutive_429_json: serde_json::Value,
    ) {
        let now = OffsetDateTime::now_utc();
        let mut snap = self.snapshot.load().as_ref().clone();
        match snap
            .credential_quota_states
            .iter_mut()
            .find(|row| row.credential_id == credential_id)
        {
            Some(row) => {
                row.usage_date = usage_date;
                row.model_usage_json = model_usage_json;
                row.category_usage_json = category_usage_json;
                row.error_status = error_status;
                row.consecutive_429_json = consecutive_429_json;
                row.updated_at = now;
            }
            None => snap.credential_quota_states.push(CredentialQuotaStateRow {
                id: 0,
                credential_id,
                usage_date,
                model_usage_json,
                category_usage_json,
                error_status,
                consecutive_429_json,
                updated_at: now,
            }),
        }
        self.snapshot.store(Arc::new(snap));
    }

    pub fn apply_user_key_safety_enabled(&self, user_key_id: i64, safety_enabled: bool) {
        let now = OffsetDateTime::now_utc();

        let mut snap = self.snapshot.load().as_ref().clone();
        if let Some(k) = snap.user_keys.iter_mut().find(|k| k.id == user_key_id) {
            k.safety_enabled = safety_enabled;
            k.updated_at = now;
            self.snapshot.store(Arc::new(snap));
        }
    }
}
