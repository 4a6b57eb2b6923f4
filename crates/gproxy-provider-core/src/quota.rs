use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};
use tokio::sync::RwLock;

use crate::credential::{CredentialId, CredentialPool};

/// Default fixed civil-day offset, standing in for America/Los_Angeles.
/// No IANA timezone database is available in this dependency stack, so
/// civil-day resets use a configurable fixed UTC offset rather than true
/// DST-aware tracking.
pub const DEFAULT_CIVIL_OFFSET_HOURS: i8 = -8;

/// Consecutive-429 threshold at which a key is treated as quota-exhausted
/// for the remainder of the civil day (the escalation policy's reference
/// implementation).
pub const CONSECUTIVE_429_THRESHOLD: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCategory {
    Pro,
    Flash,
    Custom,
}

impl ModelCategory {
    /// Infers a category from a bare model id when it is absent from the
    /// catalog: "pro" in the name wins Pro, "flash" wins Flash, else Flash.
    pub fn infer(model_id: &str) -> Self {
        let lower = model_id.to_ascii_lowercase();
        if lower.contains("pro") {
            ModelCategory::Pro
        } else {
            ModelCategory::Flash
        }
    }

    /// Lowercase name used in persisted rows (`models_config.category`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCategory::Pro => "pro",
            ModelCategory::Flash => "flash",
            ModelCategory::Custom => "custom",
        }
    }

    /// Inverse of `as_str`; defaults to Flash for an unrecognized value
    /// rather than failing a bootstrap over a stale/foreign row.
    pub fn from_persisted(s: &str) -> Self {
        match s {
            "pro" => ModelCategory::Pro,
            "custom" => ModelCategory::Custom,
            _ => ModelCategory::Flash,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub category: ModelCategory,
    pub daily_quota: Option<i64>,
    pub individual_quota: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CategoryQuotas {
    pub pro_quota: i64,
    pub flash_quota: i64,
}

impl Default for CategoryQuotas {
    fn default() -> Self {
        Self {
            pro_quota: 50,
            flash_quota: 1500,
        }
    }
}

/// The set of known upstream models plus the two category-wide quotas.
/// Quotas of `0` mean unlimited, matching the convention upstream keys use
/// for their own per-model caps.
pub struct ModelCatalog {
    models: RwLock<HashMap<String, ModelConfig>>,
    category_quotas: RwLock<CategoryQuotas>,
}

impl ModelCatalog {
    pub fn new(category_quotas: CategoryQuotas) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            category_quotas: RwLock::new(category_quotas),
        }
    }

    /// Builds a catalog pre-populated from persisted rows, used at bootstrap
    /// to restore the model list and category quotas a restart would
    /// otherwise silently drop.
    pub fn from_parts(category_quotas: CategoryQuotas, configs: Vec<ModelConfig>) -> Self {
        let models = configs.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            models: RwLock::new(models),
            category_quotas: RwLock::new(category_quotas),
        }
    }

    pub async fn list(&self) -> Vec<ModelConfig> {
        let mut rows: Vec<ModelConfig> = self.models.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub async fn upsert(&self, config: ModelConfig) {
        self.models.write().await.insert(config.id.clone(), config);
    }

    pub async fn delete(&self, id: &str) {
        self.models.write().await.remove(id);
    }

    pub async fn model_config(&self, model_id: &str) -> Option<ModelConfig> {
        self.models.read().await.get(model_id).cloned()
    }

    pub async fn category_quotas(&self) -> CategoryQuotas {
        *self.category_quotas.read().await
    }

    pub async fn set_category_quotas(&self, pro_quota: i64, flash_quota: i64) {
        let mut guard = self.category_quotas.write().await;
        guard.pro_quota = pro_quota;
        guard.flash_quota = flash_quota;
    }

    pub async fn resolve_category(&self, model_id: &str) -> ModelCategory {
        match self.models.read().await.get(model_id) {
            Some(cfg) => cfg.category,
            None => ModelCategory::infer(model_id),
        }
    }
}

/// Resolves "today" in a fixed civil-day timezone.
#[derive(Debug, Clone, Copy)]
pub struct CivilClock {
    offset: UtcOffset,
}

impl CivilClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn default_offset() -> Self {
        Self::new(
            UtcOffset::from_hms(DEFAULT_CIVIL_OFFSET_HOURS, 0, 0)
                .expect("fixed civil offset is a constant in range"),
        )
    }

    pub fn today(&self) -> Date {
        OffsetDateTime::now_utc().to_offset(self.offset).date()
    }
}

impl Default for CivilClock {
    fn default() -> Self {
        Self::default_offset()
    }
}

/// Per-key usage counters for the current civil day, mirroring the
/// `usageDate`/`modelUsage`/`categoryUsage`/`consecutive429` fields of an
/// upstream key. A key whose `usage_date` has fallen behind today's date
/// is treated as having zero usage until actually written to.
#[derive(Debug, Clone, Default)]
pub struct KeyUsageState {
    pub usage_date: Option<Date>,
    pub model_usage: HashMap<String, i64>,
    pub category_usage: HashMap<ModelCategory, i64>,
    pub consecutive_429: HashMap<String, i64>,
}

impl KeyUsageState {
    fn roll_if_stale(&mut self, today: Date) {
        if self.usage_date != Some(today) {
            self.usage_date = Some(today);
            self.model_usage.clear();
            self.category_usage.clear();
            self.consecutive_429.clear();
        }
    }

    /// Splits the counters into the three JSON blobs an `upstream_keys` row
    /// persists them as.
    pub fn usage_json_parts(&self) -> (serde_json::Value, serde_json::Value, serde_json::Value) {
        (
            serde_json::to_value(&self.model_usage).unwrap_or(serde_json::Value::Null),
            serde_json::to_value(&self.category_usage).unwrap_or(serde_json::Value::Null),
            serde_json::to_value(&self.consecutive_429).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Inverse of `usage_json_parts`, used to rehydrate a key's counters
    /// from a persisted row at bootstrap.
    pub fn from_json_parts(
        usage_date: Option<Date>,
        model_usage_json: &serde_json::Value,
        category_usage_json: &serde_json::Value,
        consecutive_429_json: &serde_json::Value,
    ) -> Self {
        Self {
            usage_date,
            model_usage: serde_json::from_value(model_usage_json.clone()).unwrap_or_default(),
            category_usage: serde_json::from_value(category_usage_json.clone()).unwrap_or_default(),
            consecutive_429: serde_json::from_value(consecutive_429_json.clone()).unwrap_or_default(),
        }
    }
}

/// Formats a civil date as `"YYYY-MM-DD"`, the shape `upstream_keys.usage_date`
/// is stored as (no timezone-aware `Date` column type in this stack).
pub fn format_civil_date(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Inverse of `format_civil_date`. Returns `None` for anything malformed
/// rather than failing bootstrap over one bad row.
pub fn parse_civil_date(s: &str) -> Option<Date> {
    let mut parts = s.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u8 = parts.next()?.parse().ok()?;
    let day: u8 = parts.next()?.parse().ok()?;
    Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()
}

/// Tracks per-key daily usage and the provider rotation cursor, and
/// answers whether a key is within its caps for a model/category.
pub struct QuotaLedger {
    civil: CivilClock,
    states: RwLock<HashMap<CredentialId, KeyUsageState>>,
    cursors: RwLock<HashMap<String, usize>>,
}

impl QuotaLedger {
    pub fn new(civil: CivilClock) -> Self {
        Self {
            civil,
            states: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a ledger pre-populated with persisted per-key usage state,
    /// used at bootstrap so a process restart doesn't silently zero out
    /// today's quota counters.
    pub fn from_parts(civil: CivilClock, states: HashMap<CredentialId, KeyUsageState>) -> Self {
        Self {
            civil,
            states: RwLock::new(states),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn civil_clock(&self) -> CivilClock {
        self.civil
    }

    /// Snapshot of a key's usage state for persistence, keyed by the civil
    /// date it was last written for. Returns `None` when the key has no
    /// recorded usage yet today (nothing to persist).
    pub async fn export_state(&self, id: CredentialId) -> Option<(String, KeyUsageState)> {
        let states = self.states.read().await;
        let state = states.get(&id)?;
        let date = state.usage_date?;
        Some((format_civil_date(date), state.clone()))
    }

    /// Snapshot of a key's usage for today, applying the civil-day reset
    /// as a read-only dry run (it is only persisted once the key is
    /// actually written to, via `increment_usage`/`handle_429`).
    pub async fn usage_snapshot(&self, id: CredentialId) -> KeyUsageState {
        let today = self.civil.today();
        match self.states.read().await.get(&id) {
            Some(entry) if entry.usage_date == Some(today) => entry.clone(),
            _ => KeyUsageState {
                usage_date: Some(today),
                ..Default::default()
            },
        }
    }

    pub async fn is_within_caps(
        &self,
        id: CredentialId,
        category: ModelCategory,
        model: &str,
        quotas: CategoryQuotas,
        model_config: Option<&ModelConfig>,
    ) -> bool {
        let snapshot = self.usage_snapshot(id).await;
        match category {
            ModelCategory::Custom => {
                let cap = model_config.and_then(|c| c.daily_quota).unwrap_or(0);
                if cap <= 0 {
                    return true;
                }
                snapshot.model_usage.get(model).copied().unwrap_or(0) < cap
            }
            ModelCategory::Pro | ModelCategory::Flash => {
                let category_cap = match category {
                    ModelCategory::Pro => quotas.pro_quota,
                    ModelCategory::Flash => quotas.flash_quota,
                    ModelCategory::Custom => unreachable!(),
                };
                if category_cap > 0
                    && snapshot.category_usage.get(&category).copied().unwrap_or(0) >= category_cap
                {
                    return false;
                }
                if let Some(individual_cap) = model_config.and_then(|c| c.individual_quota)
                    && individual_cap > 0
                    && snapshot.model_usage.get(model).copied().unwrap_or(0) >= individual_cap
                {
                    return false;
                }
                true
            }
        }
    }

    /// Atomic read-modify-write: rolls the civil day forward if stale,
    /// bumps the model and category counters, and clears the
    /// consecutive-429 streak for this model.
    pub async fn increment_usage(&self, id: CredentialId, model: &str, category: ModelCategory) {
        let today = self.civil.today();
        let mut states = self.states.write().await;
        let entry = states.entry(id).or_default();
        entry.roll_if_stale(today);
        *entry.model_usage.entry(model.to_string()).or_insert(0) += 1;
        if matches!(category, ModelCategory::Pro | ModelCategory::Flash) {
            *entry.category_usage.entry(category).or_insert(0) += 1;
        }
        entry.consecutive_429.insert(model.to_string(), 0);
    }

    /// Reference escalation policy: once a model's consecutive-429 streak
    /// on this key reaches `CONSECUTIVE_429_THRESHOLD`, the key is treated
    /// as quota-exhausted for that category for the remainder of today
    /// rather than flagged with a separate error status. Returns whether
    /// this call triggered the escalation.
    pub async fn handle_429(
        &self,
        id: CredentialId,
        category: ModelCategory,
        model: &str,
        quotas: CategoryQuotas,
    ) -> bool {
        if !matches!(category, ModelCategory::Pro | ModelCategory::Flash) {
            return false;
        }
        let today = self.civil.today();
        let mut states = self.states.write().await;
        let entry = states.entry(id).or_default();
        entry.roll_if_stale(today);
        let counter = entry.consecutive_429.entry(model.to_string()).or_insert(0);
        *counter += 1;
        if *counter < CONSECUTIVE_429_THRESHOLD {
            return false;
        }
        let cap = match category {
            ModelCategory::Pro => quotas.pro_quota,
            ModelCategory::Flash => quotas.flash_quota,
            ModelCategory::Custom => unreachable!(),
        };
        let cap = if cap > 0 { cap } else { i64::MAX };
        entry.category_usage.insert(category, cap);
        true
    }

    pub async fn cursor(&self, provider: &str) -> usize {
        *self.cursors.read().await.get(provider).unwrap_or(&0)
    }

    pub async fn set_cursor(&self, provider: &str, cursor: usize) {
        self.cursors
            .write()
            .await
            .insert(provider.to_string(), cursor);
    }
}

/// Selects an upstream credential for a request: the heart of the
/// category-and-quota-aware rotation described in the key registry.
/// Borrows its collaborators rather than owning them, since callers
/// already hold `Arc<ProviderRuntime>` with these fields inline.
pub struct KeySelector<'a> {
    pool: &'a CredentialPool,
    ledger: &'a QuotaLedger,
    catalog: &'a ModelCatalog,
}

impl<'a> KeySelector<'a> {
    pub fn new(pool: &'a CredentialPool, ledger: &'a QuotaLedger, catalog: &'a ModelCatalog) -> Self {
        Self {
            pool,
            ledger,
            catalog,
        }
    }

    /// Scans active credentials for `provider` starting at the rotation
    /// cursor, wrapping at most once, and returns the first one within
    /// caps for `model`. Advances the cursor past the selected credential
    /// when `advance_cursor` is set.
    pub async fn select(
        &self,
        provider: &str,
        model: &str,
        advance_cursor: bool,
    ) -> Option<CredentialId> {
        let candidates = self.pool.active_candidates(provider).await;
        if candidates.is_empty() {
            return None;
        }
        let category = self.catalog.resolve_category(model).await;
        let quotas = self.catalog.category_quotas().await;
        let model_config = self.catalog.model_config(model).await;

        let n = candidates.len();
        let start = self.ledger.cursor(provider).await % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let id = candidates[idx];
            if self
                .ledger
                .is_within_caps(id, category, model, quotas, model_config.as_ref())
                .await
            {
                if advance_cursor {
                    self.ledger.set_cursor(provider, (idx + 1) % n).await;
                }
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_zero() -> CivilClock {
        CivilClock::new(UtcOffset::UTC)
    }

    #[test]
    fn infers_category_from_name() {
        assert_eq!(ModelCategory::infer("gemini-1.5-pro"), ModelCategory::Pro);
        assert_eq!(ModelCategory::infer("gemini-1.5-flash"), ModelCategory::Flash);
        assert_eq!(ModelCategory::infer("custom-thing"), ModelCategory::Flash);
    }

    #[tokio::test]
    async fn increment_usage_resets_on_new_civil_day() {
        let ledger = QuotaLedger::new(offset_zero());
        ledger.increment_usage(1, "gemini-1.5-flash", ModelCategory::Flash).await;
        let snap = ledger.usage_snapshot(1).await;
        assert_eq!(snap.model_usage.get("gemini-1.5-flash"), Some(&1));
        assert_eq!(snap.category_usage.get(&ModelCategory::Flash), Some(&1));
    }

    #[tokio::test]
    async fn category_cap_blocks_once_reached() {
        let ledger = QuotaLedger::new(offset_zero());
        let quotas = CategoryQuotas {
            pro_quota: 50,
            flash_quota: 1,
        };
        ledger.increment_usage(1, "gemini-1.5-flash", ModelCategory::Flash).await;
        let within = ledger
            .is_within_caps(1, ModelCategory::Flash, "gemini-1.5-flash", quotas, None)
            .await;
        assert!(!within);
    }

    #[tokio::test]
    async fn consecutive_429_escalates_after_threshold() {
        let ledger = QuotaLedger::new(offset_zero());
        let quotas = CategoryQuotas {
            pro_quota: 50,
            flash_quota: 1500,
        };
        let mut escalated = false;
        for _ in 0..CONSECUTIVE_429_THRESHOLD {
            escalated = ledger
                .handle_429(1, ModelCategory::Flash, "gemini-1.5-flash", quotas)
                .await;
        }
        assert!(escalated);
        let snap = ledger.usage_snapshot(1).await;
        assert_eq!(snap.category_usage.get(&ModelCategory::Flash), Some(&1500));
    }

    #[tokio::test]
    async fn unlimited_category_quota_never_blocks() {
        let ledger = QuotaLedger::new(offset_zero());
        let quotas = CategoryQuotas {
            pro_quota: 0,
            flash_quota: 0,
        };
        for _ in 0..10_000 {
            ledger.increment_usage(1, "gemini-1.5-flash", ModelCategory::Flash).await;
        }
        let within = ledger
            .is_within_caps(1, ModelCategory::Flash, "gemini-1.5-flash", quotas, None)
            .await;
        assert!(within);
    }
}
