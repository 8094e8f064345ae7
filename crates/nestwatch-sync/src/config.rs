use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nestwatch_adapters::{NotificationConfig, ProviderConfig};
use nestwatch_core::{Blacklist, Coordinates};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;

pub const PROVIDERS_FILE: &str = "providers.yaml";
pub const JOBS_FILE: &str = "jobs.yaml";
pub const GEOCODER_TABLE_FILE: &str = "geocoder.json";

/// Randomized pause between successive per-listing upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn is_zero(&self) -> bool {
        self.max_ms == 0
    }

    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub media_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_delay: DelayRange,
    pub media_delay: DelayRange,
    pub similarity_cache_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            media_dir: PathBuf::from("./media"),
            scheduler_enabled: false,
            sync_cron: "0 */15 * * * *".to_string(),
            user_agent: "nestwatch-bot/0.1".to_string(),
            http_timeout_secs: 20,
            detail_delay: DelayRange::new(1_000, 3_000),
            media_delay: DelayRange::new(500, 1_500),
            similarity_cache_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("NESTWATCH_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            media_dir: std::env::var("MEDIA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_dir),
            scheduler_enabled: std::env::var("NESTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            user_agent: std::env::var("NESTWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("NESTWATCH_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            detail_delay: DelayRange::new(
                env_parse("DETAIL_DELAY_MIN_MS").unwrap_or(defaults.detail_delay.min_ms),
                env_parse("DETAIL_DELAY_MAX_MS").unwrap_or(defaults.detail_delay.max_ms),
            ),
            media_delay: DelayRange::new(
                env_parse("MEDIA_DELAY_MIN_MS").unwrap_or(defaults.media_delay.min_ms),
                env_parse("MEDIA_DELAY_MAX_MS").unwrap_or(defaults.media_delay.max_ms),
            ),
            similarity_cache_ttl_secs: env_parse("SIMILARITY_CACHE_TTL_SECS")
                .unwrap_or(defaults.similarity_cache_ttl_secs),
        }
    }

    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        Self {
            media_dir: workspace_root.join("media"),
            workspace_root,
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderRegistry {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl ProviderRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing provider registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(PROVIDERS_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobProvider {
    pub id: String,
    pub url: String,
}

/// One saved search of one user.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<JobProvider>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Keep paginating past pages whose listings are all known.
    #[serde(default)]
    pub full_fetch: bool,
    #[serde(default)]
    pub home: Option<Coordinates>,
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    pub fn blacklist(&self) -> Blacklist {
        Blacklist::new(&self.blacklist)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRegistry {
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl JobRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing job registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(JOBS_FILE);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs.iter().filter(|j| j.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nestwatch_adapters::ProviderKind;

    #[test]
    fn job_registry_parses_with_defaults() {
        let registry = JobRegistry::from_yaml_str(
            r#"
jobs:
  - id: berlin-2br
    user_id: alex
    providers:
      - id: immo-fixture
        url: https://example.test/search?city=berlin
    blacklist: [WBS, Tausch]
    home: { latitude: 52.52, longitude: 13.405 }
    notifications:
      - kind: log
  - id: paused
    enabled: false
"#,
        )
        .unwrap();

        assert_eq!(registry.jobs.len(), 2);
        let job = &registry.jobs[0];
        assert!(job.enabled);
        assert!(!job.full_fetch);
        assert_eq!(job.providers[0].id, "immo-fixture");
        assert!(job.blacklist().matches("WBS erforderlich"));
        assert_eq!(job.home.map(|h| h.latitude), Some(52.52));
        assert_eq!(job.notifications, vec![NotificationConfig::Log]);
        assert_eq!(registry.enabled().count(), 1);
    }

    #[test]
    fn provider_registry_looks_up_by_id() {
        let registry = ProviderRegistry::from_yaml_str(
            r#"
providers:
  - id: immo-fixture
    kind: fixture
    fixture: fixtures/immo-fixture/listings.json
    required_fields: [title, price]
"#,
        )
        .unwrap();
        let provider = registry.get("immo-fixture").unwrap();
        assert_eq!(provider.kind, ProviderKind::Fixture);
        assert_eq!(provider.settings.required_fields, vec!["title", "price"]);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn shipped_workspace_files_parse() {
        let providers =
            ProviderRegistry::from_yaml_str(include_str!("../../../providers.yaml")).unwrap();
        let jobs = JobRegistry::from_yaml_str(include_str!("../../../jobs.yaml")).unwrap();
        for job in &jobs.jobs {
            for entry in &job.providers {
                assert!(providers.get(&entry.id).is_some(), "{} is not registered", entry.id);
            }
        }
        assert!(providers.get("kiez-html").is_some_and(|p| p.selectors.is_some()));
    }

    #[test]
    fn delay_range_samples_inside_bounds() {
        let range = DelayRange::new(10, 20);
        for _ in 0..50 {
            let d = range.sample().as_millis() as u64;
            assert!((10..=20).contains(&d));
        }
        assert_eq!(DelayRange::new(5, 5).sample(), Duration::from_millis(5));
        assert!(DelayRange::default().is_zero());
    }

    #[test]
    fn workspace_config_points_media_inside_root() {
        let config = SyncConfig::for_workspace("/srv/nestwatch");
        assert_eq!(config.media_dir, PathBuf::from("/srv/nestwatch/media"));
        assert!(config.database_url.is_none());
    }
}
