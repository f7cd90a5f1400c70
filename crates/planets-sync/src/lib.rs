//! Catalog-to-store synchronization: config, wiring, and the cycle scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use planets_catalog::{
    CatalogClient, FixtureCatalog, HttpClientConfig, RateLimit, SwapiClient, SwapiClientConfig,
    DEFAULT_CATALOG_URL,
};
use planets_core::SyncResult;
use planets_storage::{MemoryPlanetStore, PgPlanetStore, PgStoreConfig, PlanetStore};
use tracing::info;

mod reconcile;
mod scheduler;

pub use reconcile::{Reconciler, Reconciliation};
pub use scheduler::{
    CycleOutcome, CycleReport, EmptyFetchPolicy, Schedule, SchedulerOptions, SchedulerState, SyncError,
    SyncScheduler, SyncStatus, TriggerSource,
};

pub const CRATE_NAME: &str = "planets-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub catalog_url: String,
    /// Offline mode: read planets from this SWAPI page file instead of HTTP.
    pub catalog_fixture: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_requests_per_sec: Option<u32>,
    pub scheduler_enabled: bool,
    pub sync_interval_secs: u64,
    pub sync_cron: Option<String>,
    pub cycle_timeout_secs: u64,
    pub empty_fetch_policy: EmptyFetchPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            catalog_fixture: None,
            user_agent: "planets-sync/0.1".to_string(),
            http_timeout_secs: 20,
            http_max_requests_per_sec: None,
            scheduler_enabled: true,
            sync_interval_secs: 4 * 60 * 60,
            sync_cron: None,
            cycle_timeout_secs: 300,
            empty_fetch_policy: EmptyFetchPolicy::Skip,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset, blank, or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            database_url: var("DATABASE_URL"),
            catalog_url: var("SWAPI_CATALOG_URL").unwrap_or(defaults.catalog_url),
            catalog_fixture: var("SWAPI_CATALOG_FIXTURE").map(PathBuf::from),
            user_agent: var("SWAPI_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: var("SWAPI_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|&secs| secs > 0)
                .unwrap_or(defaults.http_timeout_secs),
            http_max_requests_per_sec: var("SWAPI_HTTP_MAX_RPS")
                .and_then(|v| v.parse().ok())
                .filter(|&rps| rps > 0),
            scheduler_enabled: var("SWAPI_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_interval_secs: var("SWAPI_SYNC_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|&secs| secs > 0)
                .unwrap_or(defaults.sync_interval_secs),
            sync_cron: var("SWAPI_SYNC_CRON"),
            cycle_timeout_secs: var("SWAPI_CYCLE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|&secs| secs > 0)
                .unwrap_or(defaults.cycle_timeout_secs),
            empty_fetch_policy: var("SWAPI_EMPTY_FETCH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.empty_fetch_policy),
        }
    }

    /// A cron expression takes precedence over the interval.
    pub fn schedule(&self) -> Schedule {
        match &self.sync_cron {
            Some(expr) => Schedule::Cron(expr.clone()),
            None => Schedule::Every(Duration::from_secs(self.sync_interval_secs)),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            empty_fetch: self.empty_fetch_policy,
            ..SchedulerOptions::default()
        }
    }

    pub fn swapi_client_config(&self) -> SwapiClientConfig {
        SwapiClientConfig {
            base_url: self.catalog_url.clone(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(self.user_agent.clone()),
                rate_limit: self.http_max_requests_per_sec.and_then(RateLimit::per_second),
                ..HttpClientConfig::default()
            },
            ..SwapiClientConfig::default()
        }
    }

    /// Human-readable summary with credentials stripped from the database URL.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let store = match &self.database_url {
            Some(url) => format!("postgres ({})", redact_url(url)),
            None => "memory".to_string(),
        };
        let catalog = match &self.catalog_fixture {
            Some(path) => format!("fixture ({})", path.display()),
            None => format!("swapi ({})", self.catalog_url),
        };
        let schedule = match self.schedule() {
            Schedule::Every(every) => format!("every {}s", every.as_secs()),
            Schedule::Cron(expr) => format!("cron {expr}"),
        };
        vec![
            ("store", store),
            ("catalog", catalog),
            ("user_agent", self.user_agent.clone()),
            ("http_timeout_secs", self.http_timeout_secs.to_string()),
            (
                "http_max_requests_per_sec",
                self.http_max_requests_per_sec
                    .map(|rps| rps.to_string())
                    .unwrap_or_else(|| "unlimited".to_string()),
            ),
            ("scheduler_enabled", self.scheduler_enabled.to_string()),
            ("schedule", schedule),
            ("cycle_timeout_secs", self.cycle_timeout_secs.to_string()),
            ("empty_fetch_policy", format!("{:?}", self.empty_fetch_policy).to_lowercase()),
        ]
    }
}

fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

pub fn build_catalog(config: &SyncConfig) -> Result<Arc<dyn CatalogClient>> {
    match &config.catalog_fixture {
        Some(path) => {
            info!(path = %path.display(), "using fixture catalog");
            Ok(Arc::new(FixtureCatalog::from_path(path.clone())))
        }
        None => {
            let client = SwapiClient::new(config.swapi_client_config()).context("building SWAPI client")?;
            info!(url = %client.planets_url(), "using SWAPI catalog");
            Ok(Arc::new(client))
        }
    }
}

/// Connects and migrates Postgres when configured, otherwise an empty memory store.
pub async fn build_store(config: &SyncConfig) -> Result<Arc<dyn PlanetStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgPlanetStore::connect(url, PgStoreConfig::default())
                .await
                .context("connecting to planet database")?;
            store.migrate().await.context("running planet migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory planet store");
            Ok(Arc::new(MemoryPlanetStore::new()))
        }
    }
}

pub fn build_scheduler(
    config: &SyncConfig,
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn PlanetStore>,
) -> SyncScheduler {
    SyncScheduler::new(catalog, store, config.scheduler_options())
}

/// One cycle against freshly built catalog and store, closed afterwards.
pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncResult> {
    let catalog = build_catalog(config)?;
    let store = build_store(config).await?;
    let scheduler = build_scheduler(config, catalog, store.clone());
    let outcome = scheduler.trigger_sync().await;
    scheduler.stop().await;
    store.close().await;
    Ok(outcome?)
}

pub async fn run_sync_once_from_env() -> Result<SyncResult> {
    run_sync_once(&SyncConfig::from_env()).await
}
