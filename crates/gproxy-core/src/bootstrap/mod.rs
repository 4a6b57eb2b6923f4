use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use gproxy_common::{GlobalConfig, GlobalConfigPatch};
use gproxy_provider_core::{EventHub, ProviderRegistry, TerminalEventSink};
use gproxy_provider_impl::builtin_provider_seeds;
use gproxy_provider_impl::register_builtin_providers;
use gproxy_storage::{
    DbEventSink, MirroringStorage, RemoteMirror, RemoteMirrorConfig, SeaOrmStorage, Storage,
    StorageSnapshot,
};

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gproxy",
    version,
    about = "High-performance multi-provider LLM proxy"
)]
pub struct CliArgs {
    /// Database DSN (required to bootstrap the rest of config).
    #[arg(long, env = "GPROXY_DSN")]
    pub dsn: Option<String>,

    /// Bind host.
    #[arg(long, env = "GPROXY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "GPROXY_PORT")]
    pub port: Option<String>,

    /// Admin key (plaintext). Stored as hash in DB and memory.
    #[arg(long, env = "GPROXY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Outbound proxy pool for upstream requests: comma-separated
    /// `socks5://…` URLs, rotated round-robin per dispatch.
    #[arg(long, env = "GPROXY_PROXY")]
    pub proxy: Option<String>,

    /// Redact sensitive headers/body fields in emitted events.
    #[arg(long, env = "GPROXY_EVENT_REDACT_SENSITIVE")]
    pub event_redact_sensitive: Option<String>,

    /// Keep streaming clients alive with heartbeat frames while dispatching
    /// a non-streaming upstream call on their behalf.
    #[arg(long, env = "GPROXY_KEEPALIVE")]
    pub keepalive: Option<String>,

    /// Max key-rotation retries per request before giving up.
    #[arg(long, env = "GPROXY_MAX_RETRY")]
    pub max_retry: Option<String>,

    /// Surface the upstream's built-in web-search tool to clients.
    #[arg(long, env = "GPROXY_WEB_SEARCH")]
    pub web_search: Option<String>,

    /// Remote backup target the Store is debounce-mirrored to (a single
    /// PUT/GET object URL). Absent disables the mirror entirely.
    #[arg(long, env = "GPROXY_MIRROR_URL")]
    pub mirror_url: Option<String>,

    /// Bearer token for the remote mirror target, if it requires auth.
    #[arg(long, env = "GPROXY_MIRROR_TOKEN")]
    pub mirror_token: Option<String>,

    /// AES-256 key (base64 or 64-char hex) used to encrypt mirrored backups.
    /// Absent mirrors in plaintext JSON.
    #[arg(long, env = "GPROXY_MIRROR_ENCRYPTION_KEY")]
    pub mirror_encryption_key: Option<String>,
}

pub struct Bootstrap {
    /// The admin/event write path, wrapped so every mutating call pokes the
    /// remote mirror. Runtime hot paths still never touch this — they read
    /// from `AppState`'s in-memory snapshot.
    pub storage: Arc<dyn Storage>,
    pub state: Arc<AppState>,
    pub registry: Arc<ProviderRegistry>,
    pub mirror: Arc<RemoteMirror>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let dsn = sanitize_dsn_value(args.dsn.clone());
    let host = sanitize_optional_env_value(args.host.clone());
    let port = parse_u16_env_value(args.port.clone(), "GPROXY_PORT")?;
    let admin_key = sanitize_optional_env_value(args.admin_key.clone());
    let proxy = sanitize_optional_env_value(args.proxy.clone());
    let event_redact_sensitive = parse_bool_env_value(
        args.event_redact_sensitive.clone(),
        "GPROXY_EVENT_REDACT_SENSITIVE",
    )?;
    let keepalive_enabled = parse_bool_env_value(args.keepalive.clone(), "GPROXY_KEEPALIVE")?;
    let max_retry = parse_u32_env_value(args.max_retry.clone(), "GPROXY_MAX_RETRY")?;
    let web_search_enabled = parse_bool_env_value(args.web_search.clone(), "GPROXY_WEB_SEARCH")?;

    ensure_sqlite_parent_dir(&dsn)?;

    // 1) connect DB from CLI/ENV DSN (required).
    let storage = Arc::new(
        SeaOrmStorage::connect(&dsn)
            .await
            .context("connect storage")?,
    );
    storage.sync().await.context("schema sync")?;

    // 1.1) attempt one remote-mirror download before accepting traffic. Only
    // restore it into the local store when the local store is still empty
    // (first boot against a fresh volume) — a non-empty store always wins,
    // since the mirror is a one-way backup, not a second writer.
    let mirror_config = RemoteMirrorConfig::new(
        sanitize_optional_env_value(args.mirror_url.clone()),
        sanitize_optional_env_value(args.mirror_token.clone()),
        sanitize_optional_env_value(args.mirror_encryption_key.clone()),
    );
    let storage_for_mirror: Arc<dyn Storage> = storage.clone();
    let (mirror, downloaded) = RemoteMirror::bootstrap(storage_for_mirror, mirror_config).await;
    if let Some(restored) = downloaded {
        let local = storage.load_snapshot().await.context("load local snapshot")?;
        if local.providers.is_empty() && local.credentials.is_empty() && local.users.is_empty() {
            restore_snapshot(storage.as_ref(), restored)
                .await
                .context("restore snapshot from remote mirror")?;
        } else {
            eprintln!(
                "remote mirror: downloaded a backup but the local store already has data; ignoring it"
            );
        }
    }

    // 2) load DB global config (if any), then merge once: CLI > ENV > DB.
    // clap already applies CLI > ENV precedence for each field; we then overlay on DB.
    let db_global = storage
        .load_global_config()
        .await
        .context("load db global_config")?;

    let mut merged = db_global
        .map(|row| GlobalConfigPatch::from(row.config))
        .unwrap_or_default();

    // Select admin key source:
    // - CLI/ENV provided key wins and overwrites DB (hash stored)
    // - else, if DB missing admin_key_hash, generate one and persist (print plaintext once)
    let mut admin_key_hash_override: Option<String> = None;
    if let Some(key_plain) = admin_key.as_deref() {
        admin_key_hash_override = Some(hash_admin_key(key_plain));
    } else if merged.admin_key_hash.is_none() {
        let key_plain = generate_admin_key();
        eprintln!("generated admin key: {key_plain}");
        admin_key_hash_override = Some(hash_admin_key(&key_plain));
    }

    let cli_patch = GlobalConfigPatch {
        host,
        port,
        admin_key_hash: admin_key_hash_override,
        proxy,
        dsn: Some(dsn),
        event_redact_sensitive,
        keepalive_enabled,
        max_retry,
        web_search_enabled,
    };
    merged.overlay(cli_patch);

    let global: GlobalConfig = merged
        .into_config()
        .context("finalize merged global config")?;

    // 3) persist merged global config back to DB.
    storage
        .upsert_global_config(&global)
        .await
        .context("upsert global_config")?;

    // 3.1) bootstrap default user/key if needed (user0 + admin key as API key).
    // Bootstrap default user/key if needed (user_id=0, name=user0).
    storage
        .upsert_user_by_id(0, "user0", true)
        .await
        .context("upsert user0")?;
    let user0_id = 0_i64;
    // If it already exists (unique constraint), ignore the error.
    let _ = storage
        .insert_user_key(user0_id, &global.admin_key_hash, Some("bootstrap"), true)
        .await;

    // 3.2) seed builtin providers (bulletin list) into storage if missing.
    let existing_provider_names: HashSet<String> = storage
        .provider_names()
        .await
        .context("list provider names")?
        .into_iter()
        .collect();

    for seed in builtin_provider_seeds() {
        if existing_provider_names.contains(seed.name) {
            continue;
        }
        storage
            .upsert_provider(seed.name, &seed.config_json, seed.enabled)
            .await
            .with_context(|| format!("seed provider {}", seed.name))?;
    }

    // 4) load the rest of data once (providers/credentials/users/keys).
    let snapshot = storage.load_snapshot().await.context("load snapshot")?;

    // 5) build in-memory state (all runtime reads come from here).
    let events = EventHub::new(1024);
    events.add_sink(Arc::new(TerminalEventSink::new())).await;
    events
        .add_sink(Arc::new(DbEventSink::new(storage.clone())))
        .await;
    let state = AppState::from_bootstrap(global, snapshot, events.clone())
        .await
        .context("build app state")?;

    let mirrored_storage: Arc<dyn Storage> =
        Arc::new(MirroringStorage::new(storage.clone(), mirror.clone()));

    Ok(Bootstrap {
        storage: mirrored_storage,
        state: Arc::new(state),
        mirror,
        registry: Arc::new({
            let mut r = ProviderRegistry::new();
            register_builtin_providers(&mut r);
            r
        }),
    })
}

/// Replays a downloaded remote-mirror snapshot into the local store via the
/// normal `Storage` write methods (rather than a raw bulk insert), so every
/// usual invariant (unique constraints, generated ids) still applies. Only
/// called against an empty local store, so id collisions aren't a concern;
/// provider/credential ids are allowed to come out different from the
/// backup's — callers key on name/credential id after restore, not before.
async fn restore_snapshot(storage: &dyn Storage, snapshot: StorageSnapshot) -> anyhow::Result<()> {
    if let Some(row) = snapshot.global_config {
        storage
            .upsert_global_config(&row.config)
            .await
            .context("restore global_config")?;
    }

    let mut provider_name_by_old_id: HashMap<i64, String> = HashMap::new();
    for p in &snapshot.providers {
        storage
            .upsert_provider(&p.name, &p.config_json, p.enabled)
            .await
            .with_context(|| format!("restore provider {}", p.name))?;
        provider_name_by_old_id.insert(p.id, p.name.clone());
    }

    for c in &snapshot.credentials {
        let Some(provider_name) = provider_name_by_old_id.get(&c.provider_id) else {
            continue;
        };
        storage
            .insert_credential(
                provider_name,
                c.name.as_deref(),
                &c.settings_json,
                &c.secret_json,
                c.enabled,
            )
            .await
            .with_context(|| format!("restore credential for provider {provider_name}"))?;
    }

    for u in &snapshot.users {
        storage
            .upsert_user_by_id(u.id, &u.name, u.enabled)
            .await
            .with_context(|| format!("restore user {}", u.name))?;
    }

    for k in &snapshot.user_keys {
        // Best-effort: a duplicate key hash (unique constraint) just means
        // it already exists under a different user id — skip rather than fail.
        let _ = storage
            .insert_user_key(k.user_id, &k.key_hash, k.label.as_deref(), k.enabled)
            .await;
    }

    Ok(())
}

fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    // Treat them as "not set" so startup doesn't fail on URL parsing.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn sanitize_dsn_value(value: Option<String>) -> String {
    sanitize_optional_env_value(value).unwrap_or_else(default_dsn)
}

fn default_dsn() -> String {
    if let Some(data_dir) = sanitize_optional_env_value(std::env::var("GPROXY_DATA_DIR").ok()) {
        let dir = data_dir.trim_end_matches('/');
        return format!("sqlite://{dir}/gproxy.db?mode=rwc");
    }
    "sqlite://gproxy.db?mode=rwc".to_string()
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }

    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }

    let memory = normalized.to_ascii_lowercase();
    if memory == ":memory:" {
        return None;
    }

    Some(PathBuf::from(normalized))
}

fn parse_u16_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u16>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_u32_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u32>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<u32>()
        .with_context(|| format!("invalid {env_name} value: {raw}"))?;
    Ok(Some(parsed))
}

fn parse_bool_env_value(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    };
    Ok(Some(parsed))
}

fn hash_admin_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

fn generate_admin_key() -> String {
    // Random enough for a bootstrap key; stored only in memory/printed once.
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::sqlite_file_path_from_dsn;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://gproxy.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "gproxy.db");
    }

    #[test]
    fn sqlite_dsn_resolves_absolute_path() {
        let path = sqlite_file_path_from_dsn("sqlite://app/data/gproxy.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "/app/data/gproxy.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }
}
