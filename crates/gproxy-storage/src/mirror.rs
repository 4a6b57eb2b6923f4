//! Debounced one-way mirror of the Store's logical state to a remote
//! backup, with optional symmetric encryption.
//!
//! Contract: local reads never wait on this. Every remote failure is logged
//! and swallowed — callers never see it. `RemoteMirror::notify_mutated` is
//! cheap (sets a flag, pokes a bounded channel) and safe to call from any
//! write path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use async_trait::async_trait;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use gproxy_common::GlobalConfig;
use gproxy_provider_core::Event;

use crate::snapshot::{
    CredentialQuotaStateRow, CredentialRow, GlobalConfigRow, ModelConfigRow, ProviderQuotaRow,
    ProviderRow, StorageSnapshot, UserKeyRow, UserRow,
};
use crate::storage::{
    LogQueryFilter, LogQueryResult, Storage, StorageResult, UsageAggregate, UsageAggregateFilter,
};

/// Default debounce window (`T_sync`): at most one upload per 5 minutes,
/// even under a storm of mutations.
pub const DEFAULT_SYNC_DEBOUNCE: Duration = Duration::from_secs(5 * 60);

/// Prefix written before the JSON payload (plaintext) so a downloaded blob
/// can be told apart from an encrypted one without any side-channel.
const MAGIC: &[u8] = b"GPXMIRR1";

#[derive(Debug, Clone, Default)]
pub struct RemoteMirrorConfig {
    /// Base URL of the remote backup object (a single PUT/GET target).
    pub remote_url: Option<String>,
    /// Bearer token for the remote, if it requires auth.
    pub auth_token: Option<String>,
    /// 32-byte AES-256-GCM key. When set, uploads are encrypted and
    /// downloads are decrypted; when absent, the mirror round-trips plain
    /// JSON.
    pub encryption_key: Option<[u8; 32]>,
    pub debounce: Duration,
}

impl RemoteMirrorConfig {
    /// Builds a config from already-resolved CLI/env values (the CLI/env
    /// parsing itself lives in `gproxy-core::bootstrap`, alongside every
    /// other setting's CLI > ENV > DB precedence).
    pub fn new(
        remote_url: Option<String>,
        auth_token: Option<String>,
        encryption_key_raw: Option<String>,
    ) -> Self {
        let remote_url = remote_url
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let auth_token = auth_token
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let encryption_key = encryption_key_raw.and_then(|v| parse_encryption_key(v.trim()));
        Self {
            remote_url,
            auth_token,
            encryption_key,
            debounce: DEFAULT_SYNC_DEBOUNCE,
        }
    }
}

/// Accepts either 32 raw bytes base64-encoded, or a 64-char hex string.
fn parse_encryption_key(raw: &str) -> Option<[u8; 32]> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(raw)
        && bytes.len() == 32
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Some(key);
    }
    if raw.len() == 64
        && let Ok(bytes) = (0..32)
            .map(|i| u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
    {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        return Some(key);
    }
    None
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct SnapshotDto {
    global_config: Option<GlobalConfigDto>,
    providers: Vec<ProviderDto>,
    credentials: Vec<CredentialDto>,
    users: Vec<UserDto>,
    user_keys: Vec<UserKeyDto>,
    #[serde(default)]
    model_configs: Vec<ModelConfigDto>,
    #[serde(default)]
    provider_quotas: Vec<ProviderQuotaDto>,
    #[serde(default)]
    credential_quota_states: Vec<CredentialQuotaStateDto>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalConfigDto {
    id: i64,
    config: GlobalConfig,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderDto {
    id: i64,
    name: String,
    config_json: serde_json::Value,
    enabled: bool,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialDto {
    id: i64,
    provider_id: i64,
    name: Option<String>,
    settings_json: serde_json::Value,
    secret_json: serde_json::Value,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserDto {
    id: i64,
    name: String,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserKeyDto {
    id: i64,
    user_id: i64,
    api_key: String,
    label: Option<String>,
    #[serde(default = "default_true")]
    safety_enabled: bool,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelConfigDto {
    id: i64,
    provider_id: i64,
    model_id: String,
    category: String,
    daily_quota: Option<i64>,
    individual_quota: Option<i64>,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProviderQuotaDto {
    id: i64,
    provider_id: i64,
    pro_quota: i64,
    flash_quota: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialQuotaStateDto {
    id: i64,
    credential_id: i64,
    usage_date: String,
    model_usage_json: serde_json::Value,
    category_usage_json: serde_json::Value,
    error_status: Option<i32>,
    consecutive_429_json: serde_json::Value,
    updated_at: i64,
}

impl From<&StorageSnapshot> for SnapshotDto {
    fn from(s: &StorageSnapshot) -> Self {
        Self {
            global_config: s.global_config.as_ref().map(|g| GlobalConfigDto {
                id: g.id,
                config: g.config.clone(),
                updated_at: g.updated_at.unix_timestamp(),
            }),
            providers: s
                .providers
                .iter()
                .map(|p| ProviderDto {
                    id: p.id,
                    name: p.name.clone(),
                    config_json: p.config_json.clone(),
                    enabled: p.enabled,
                    updated_at: p.updated_at.unix_timestamp(),
                })
                .collect(),
            credentials: s
                .credentials
                .iter()
                .map(|c| CredentialDto {
                    id: c.id,
                    provider_id: c.provider_id,
                    name: c.name.clone(),
                    settings_json: c.settings_json.clone(),
                    secret_json: c.secret_json.clone(),
                    enabled: c.enabled,
                    created_at: c.created_at.unix_timestamp(),
                    updated_at: c.updated_at.unix_timestamp(),
                })
                .collect(),
            users: s
                .users
                .iter()
                .map(|u| UserDto {
                    id: u.id,
                    name: u.name.clone(),
                    enabled: u.enabled,
                    created_at: u.created_at.unix_timestamp(),
                    updated_at: u.updated_at.unix_timestamp(),
                })
                .collect(),
            user_keys: s
                .user_keys
                .iter()
                .map(|k| UserKeyDto {
                    id: k.id,
                    user_id: k.user_id,
                    api_key: k.api_key.clone(),
                    label: k.label.clone(),
                    safety_enabled: k.safety_enabled,
                    enabled: k.enabled,
                    created_at: k.created_at.unix_timestamp(),
                    updated_at: k.updated_at.unix_timestamp(),
                })
                .collect(),
            model_configs: s
                .model_configs
                .iter()
                .map(|m| ModelConfigDto {
                    id: m.id,
                    provider_id: m.provider_id,
                    model_id: m.model_id.clone(),
                    category: m.category.clone(),
                    daily_quota: m.daily_quota,
                    individual_quota: m.individual_quota,
                    updated_at: m.updated_at.unix_timestamp(),
                })
                .collect(),
            provider_quotas: s
                .provider_quotas
                .iter()
                .map(|p| ProviderQuotaDto {
                    id: p.id,
                    provider_id: p.provider_id,
                    pro_quota: p.pro_quota,
                    flash_quota: p.flash_quota,
                    updated_at: p.updated_at.unix_timestamp(),
                })
                .collect(),
            credential_quota_states: s
                .credential_quota_states
                .iter()
                .map(|c| CredentialQuotaStateDto {
                    id: c.id,
                    credential_id: c.credential_id,
                    usage_date: c.usage_date.clone(),
                    model_usage_json: c.model_usage_json.clone(),
                    category_usage_json: c.category_usage_json.clone(),
                    error_status: c.error_status,
                    consecutive_429_json: c.consecutive_429_json.clone(),
                    updated_at: c.updated_at.unix_timestamp(),
                })
                .collect(),
        }
    }
}

fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("mirror encrypt failed: {e}"))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(key: &[u8; 32], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    if payload.len() < 12 {
        anyhow::bail!("mirror payload too short to be encrypted");
    }
    let (nonce_bytes, ciphertext) = payload.split_at(12);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow::anyhow!("mirror decrypt failed: {e}"))
}

/// Background debounced uploader. One instance per process; cheap to keep
/// alive for the whole lifetime of the server.
pub struct RemoteMirror {
    config: RemoteMirrorConfig,
    dirty: Arc<AtomicBool>,
    poke_tx: mpsc::Sender<()>,
    /// ETag/revision of the last accepted upload, used for a conditional
    /// PUT so we never silently clobber a concurrent writer's newer state.
    last_revision: Arc<Mutex<Option<String>>>,
    initial_sync_done: Arc<AtomicBool>,
    _handle: JoinHandle<()>,
}

impl RemoteMirror {
    /// Downloads the remote snapshot (if configured) and spawns the
    /// debounce-upload background task. Call once at startup, before
    /// accepting traffic, so a fresh deployment can restore from backup.
    ///
    /// Returns the downloaded snapshot (if any) alongside the handle; the
    /// caller decides whether/how to apply it (this module never writes to
    /// the local Store directly — that would bypass the single-writer
    /// discipline the rest of the Store enforces).
    pub async fn bootstrap(
        storage: Arc<dyn Storage>,
        config: RemoteMirrorConfig,
    ) -> (Arc<Self>, Option<StorageSnapshot>) {
        let initial_sync_done = Arc::new(AtomicBool::new(false));
        let last_revision = Arc::new(Mutex::new(None));

        let downloaded = if config.remote_url.is_some() {
            match download_once(&config).await {
                Ok(DownloadOutcome::NotFound) => {
                    initial_sync_done.store(true, Ordering::SeqCst);
                    None
                }
                Ok(DownloadOutcome::Found { snapshot, revision }) => {
                    initial_sync_done.store(true, Ordering::SeqCst);
                    *last_revision.lock().await = revision;
                    Some(snapshot)
                }
                Err(err) => {
                    eprintln!("remote mirror: startup download failed, continuing without it: {err}");
                    None
                }
            }
        } else {
            None
        };

        let (poke_tx, poke_rx) = mpsc::channel(1);
        let dirty = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_upload_loop(
            storage,
            config.clone(),
            poke_rx,
            dirty.clone(),
            last_revision.clone(),
        ));

        (
            Arc::new(Self {
                config,
                dirty,
                poke_tx,
                last_revision,
                initial_sync_done,
                _handle: handle,
            }),
            downloaded,
        )
    }

    /// Signal that the Store was just mutated. Never blocks, never touches
    /// the network; the background loop decides when to actually fire.
    pub fn notify_mutated(&self) {
        if self.config.remote_url.is_none() {
            return;
        }
        self.dirty.store(true, Ordering::SeqCst);
        let _ = self.poke_tx.try_send(());
    }

    pub fn initial_sync_complete(&self) -> bool {
        self.initial_sync_done.load(Ordering::SeqCst)
    }
}

async fn run_upload_loop(
    storage: Arc<dyn Storage>,
    config: RemoteMirrorConfig,
    mut poke_rx: mpsc::Receiver<()>,
    dirty: Arc<AtomicBool>,
    last_revision: Arc<Mutex<Option<String>>>,
) {
    let Some(_) = config.remote_url.as_deref() else {
        // No remote configured: drain forever without ever touching the network.
        while poke_rx.recv().await.is_some() {}
        return;
    };

    while poke_rx.recv().await.is_some() {
        // Debounce: sleep the full window once. Further pokes that land
        // while we sleep only keep `dirty` true — they never restart this
        // sleep, so a mutation storm still uploads at most once per window.
        tokio::time::sleep(config.debounce).await;
        while poke_rx.try_recv().is_ok() {}

        if !dirty.swap(false, Ordering::SeqCst) {
            continue;
        }

        match upload_once(storage.as_ref(), &config, &last_revision).await {
            Ok(()) => {}
            Err(err) => eprintln!("remote mirror: upload failed, will retry on next mutation: {err}"),
        }
    }
}

async fn upload_once(
    storage: &dyn Storage,
    config: &RemoteMirrorConfig,
    last_revision: &Mutex<Option<String>>,
) -> anyhow::Result<()> {
    let Some(url) = config.remote_url.as_deref() else {
        return Ok(());
    };

    let snapshot = storage
        .load_snapshot()
        .await
        .map_err(|e| anyhow::anyhow!("load snapshot for mirror upload: {e}"))?;
    let dto = SnapshotDto::from(&snapshot);
    let mut payload = MAGIC.to_vec();
    payload.extend_from_slice(&serde_json::to_vec(&dto)?);

    let body = match &config.encryption_key {
        Some(key) => encrypt(key, &payload)?,
        None => payload,
    };

    let client = wreq::Client::builder().build()?;
    let mut req = client.put(url).body(body);
    if let Some(token) = &config.auth_token {
        req = req.bearer_auth(token);
    }
    {
        let guard = last_revision.lock().await;
        if let Some(rev) = guard.as_deref() {
            req = req.header("If-Match", rev);
        }
    }

    let resp = req.send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("remote mirror upload rejected with status {}", resp.status());
    }
    let revision = resp
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    *last_revision.lock().await = revision;
    Ok(())
}

enum DownloadOutcome {
    NotFound,
    Found {
        snapshot: StorageSnapshot,
        revision: Option<String>,
    },
}

async fn download_once(config: &RemoteMirrorConfig) -> anyhow::Result<DownloadOutcome> {
    let Some(url) = config.remote_url.as_deref() else {
        return Ok(DownloadOutcome::NotFound);
    };

    let client = wreq::Client::builder().build()?;
    let mut req = client.get(url);
    if let Some(token) = &config.auth_token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await?;
    if resp.status().as_u16() == 404 {
        return Ok(DownloadOutcome::NotFound);
    }
    if !resp.status().is_success() {
        anyhow::bail!("remote mirror download failed with status {}", resp.status());
    }
    let revision = resp
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let bytes = resp.bytes().await?;

    let plaintext = if bytes.starts_with(MAGIC) {
        bytes.to_vec()
    } else {
        let Some(key) = config.encryption_key.as_ref() else {
            anyhow::bail!("remote mirror payload looks encrypted but no decryption key is set");
        };
        decrypt(key, &bytes)?
    };

    let json_part = plaintext
        .strip_prefix(MAGIC)
        .ok_or_else(|| anyhow::anyhow!("remote mirror payload missing magic prefix"))?;
    let dto: SnapshotDto = serde_json::from_slice(json_part)?;
    Ok(DownloadOutcome::Found {
        snapshot: dto_to_snapshot(dto),
        revision,
    })
}

fn dto_to_snapshot(dto: SnapshotDto) -> StorageSnapshot {
    use time::OffsetDateTime;
    let ts = |secs: i64| OffsetDateTime::from_unix_timestamp(secs).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    StorageSnapshot {
        global_config: dto.global_config.map(|g| GlobalConfigRow {
            id: g.id,
            config: g.config,
            updated_at: ts(g.updated_at),
        }),
        providers: dto
            .providers
            .into_iter()
            .map(|p| ProviderRow {
                id: p.id,
                name: p.name,
                config_json: p.config_json,
                enabled: p.enabled,
                updated_at: ts(p.updated_at),
            })
            .collect(),
        credentials: dto
            .credentials
            .into_iter()
            .map(|c| CredentialRow {
                id: c.id,
                provider_id: c.provider_id,
                name: c.name,
                settings_json: c.settings_json,
                secret_json: c.secret_json,
                enabled: c.enabled,
                created_at: ts(c.created_at),
                updated_at: ts(c.updated_at),
            })
            .collect(),
        users: dto
            .users
            .into_iter()
            .map(|u| UserRow {
                id: u.id,
                name: u.name,
                enabled: u.enabled,
                created_at: ts(u.created_at),
                updated_at: ts(u.updated_at),
            })
            .collect(),
        user_keys: dto
            .user_keys
            .into_iter()
            .map(|k| UserKeyRow {
                id: k.id,
                user_id: k.user_id,
                api_key: k.api_key,
                label: k.label,
                safety_enabled: k.safety_enabled,
                enabled: k.enabled,
                created_at: ts(k.created_at),
                updated_at: ts(k.updated_at),
            })
            .collect(),
        model_configs: dto
            .model_configs
            .into_iter()
            .map(|m| ModelConfigRow {
                id: m.id,
                provider_id: m.provider_id,
                model_id: m.model_id,
                category: m.category,
                daily_quota: m.daily_quota,
                individual_quota: m.individual_quota,
                updated_at: ts(m.updated_at),
            })
            .collect(),
        provider_quotas: dto
            .provider_quotas
            .into_iter()
            .map(|p| ProviderQuotaRow {
                id: p.id,
                provider_id: p.provider_id,
                pro_quota: p.pro_quota,
                flash_quota: p.flash_quota,
                updated_at: ts(p.updated_at),
            })
            .collect(),
        credential_quota_states: dto
            .credential_quota_states
            .into_iter()
            .map(|c| CredentialQuotaStateRow {
                id: c.id,
                credential_id: c.credential_id,
                usage_date: c.usage_date,
                model_usage_json: c.model_usage_json,
                category_usage_json: c.category_usage_json,
                error_status: c.error_status,
                consecutive_429_json: c.consecutive_429_json,
                updated_at: ts(c.updated_at),
            })
            .collect(),
    }
}

/// Wraps any `Storage` implementation and pokes a `RemoteMirror` after every
/// call that mutates persisted state. Read-only methods pass straight
/// through. This keeps the mirroring concern out of `SeaOrmStorage` itself —
/// the Store doesn't need to know a mirror exists.
pub struct MirroringStorage {
    inner: Arc<dyn Storage>,
    mirror: Arc<RemoteMirror>,
}

impl MirroringStorage {
    pub fn new(inner: Arc<dyn Storage>, mirror: Arc<RemoteMirror>) -> Self {
        Self { inner, mirror }
    }
}

#[async_trait]
impl Storage for MirroringStorage {
    async fn sync(&self) -> StorageResult<()> {
        self.inner.sync().await
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        self.inner.load_global_config().await
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()> {
        let r = self.inner.upsert_global_config(config).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        self.inner.load_snapshot().await
    }

    async fn upsert_provider(
        &self,
        name: &str,
        config_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        let r = self.inner.upsert_provider(name, config_json, enabled).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn delete_provider(&self, name: &str) -> StorageResult<()> {
        let r = self.inner.delete_provider(name).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn insert_credential(
        &self,
        provider_name: &str,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        let r = self
            .inner
            .insert_credential(provider_name, name, settings_json, secret_json, enabled)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn update_credential(
        &self,
        credential_id: i64,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
    ) -> StorageResult<()> {
        let r = self
            .inner
            .update_credential(credential_id, name, settings_json, secret_json)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn set_credential_enabled(&self, credential_id: i64, enabled: bool) -> StorageResult<()> {
        let r = self.inner.set_credential_enabled(credential_id, enabled).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn delete_credential(&self, credential_id: i64) -> StorageResult<()> {
        let r = self.inner.delete_credential(credential_id).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn upsert_user_by_id(
        &self,
        user_id: i64,
        name: &str,
        enabled: bool,
    ) -> StorageResult<()> {
        let r = self.inner.upsert_user_by_id(user_id, name, enabled).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn set_user_enabled(&self, user_id: i64, enabled: bool) -> StorageResult<()> {
        let r = self.inner.set_user_enabled(user_id, enabled).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn delete_user(&self, user_id: i64) -> StorageResult<()> {
        let r = self.inner.delete_user(user_id).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn insert_user_key(
        &self,
        user_id: i64,
        api_key: &str,
        label: Option<&str>,
        enabled: bool,
    ) -> StorageResult<i64> {
        let r = self
            .inner
            .insert_user_key(user_id, api_key, label, enabled)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn set_user_key_enabled(&self, user_key_id: i64, enabled: bool) -> StorageResult<()> {
        let r = self.inner.set_user_key_enabled(user_key_id, enabled).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn update_user_key_label(
        &self,
        user_key_id: i64,
        label: Option<&str>,
    ) -> StorageResult<()> {
        let r = self.inner.update_user_key_label(user_key_id, label).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn set_user_key_safety_enabled(
        &self,
        user_key_id: i64,
        safety_enabled: bool,
    ) -> StorageResult<()> {
        let r = self
            .inner
            .set_user_key_safety_enabled(user_key_id, safety_enabled)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn delete_user_key(&self, user_key_id: i64) -> StorageResult<()> {
        let r = self.inner.delete_user_key(user_key_id).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn upsert_model_config(
        &self,
        provider_name: &str,
        model_id: &str,
        category: &str,
        daily_quota: Option<i64>,
        individual_quota: Option<i64>,
    ) -> StorageResult<()> {
        let r = self
            .inner
            .upsert_model_config(provider_name, model_id, category, daily_quota, individual_quota)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn delete_model_config(&self, provider_name: &str, model_id: &str) -> StorageResult<()> {
        let r = self.inner.delete_model_config(provider_name, model_id).await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn set_category_quotas(
        &self,
        provider_name: &str,
        pro_quota: i64,
        flash_quota: i64,
    ) -> StorageResult<()> {
        let r = self
            .inner
            .set_category_quotas(provider_name, pro_quota, flash_quota)
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn upsert_credential_quota_state(
        &self,
        credential_id: i64,
        usage_date: &str,
        model_usage_json: &serde_json::Value,
        category_usage_json: &serde_json::Value,
        error_status: Option<i32>,
        consecutive_429_json: &serde_json::Value,
    ) -> StorageResult<()> {
        let r = self
            .inner
            .upsert_credential_quota_state(
                credential_id,
                usage_date,
                model_usage_json,
                category_usage_json,
                error_status,
                consecutive_429_json,
            )
            .await;
        if r.is_ok() {
            self.mirror.notify_mutated();
        }
        r
    }

    async fn append_event(&self, event: &Event) -> StorageResult<()> {
        // High-volume, non-config writes: mirroring these would make the
        // debounce window meaningless (every request would mark it dirty).
        // The mirror protects configuration/quota state, not traffic logs.
        self.inner.append_event(event).await
    }

    async fn aggregate_usage_tokens(
        &self,
        filter: UsageAggregateFilter,
    ) -> StorageResult<UsageAggregate> {
        self.inner.aggregate_usage_tokens(filter).await
    }

    async fn query_logs(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult> {
        self.inner.query_logs(filter).await
    }
}

impl std::fmt::Debug for RemoteMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMirror")
            .field("configured", &self.config.remote_url.is_some())
            .field("initial_sync_done", &self.initial_sync_complete())
            .finish()
    }
}
