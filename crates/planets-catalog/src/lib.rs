//! Catalog client contract, the SWAPI HTTP client and a fixture-backed catalog.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use planets_core::SourceRecord;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "planets-catalog";

pub const DEFAULT_CATALOG_URL: &str = "https://swapi.dev/api";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("malformed catalog page {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("catalog pagination revisited {url}")]
    PaginationLoop { url: String },
    #[error("catalog returned more than {limit} pages")]
    TooManyPages { limit: usize },
    #[error("reading catalog fixture {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read-only upstream source of planets.
///
/// `fetch_all` returns the complete dataset; implementations exhaust any
/// pagination internally and keep no cursor between calls.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_all(&self) -> Result<Vec<SourceRecord>, CatalogError>;
}

/// Whether a failed catalog request is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Transient,
    Permanent,
}

/// SWAPI sheds load with 5xx and 429; anything else will not heal on its own.
pub fn retry_class_for_status(status: StatusCode) -> RetryClass {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RetryClass::Transient,
        s if s.is_server_error() => RetryClass::Transient,
        _ => RetryClass::Permanent,
    }
}

pub fn retry_class_for_error(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryClass::Transient
    } else {
        RetryClass::Permanent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based): doubles each time, capped.
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// At most `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            burst: requests,
            interval: Duration::from_secs(1) / requests,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Token bucket pacing every request a client sends, retries included.
#[derive(Debug)]
pub struct RequestPacer {
    limit: RateLimit,
    state: Mutex<PacerState>,
}

#[derive(Debug)]
struct PacerState {
    available: u32,
    /// Start of the interval currently being earned.
    since: Instant,
}

impl RequestPacer {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(PacerState {
                available: limit.burst,
                since: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            self.replenish(&mut state, now);
            if state.available > 0 {
                state.available -= 1;
                return;
            }
            let wait = self.limit.interval.saturating_sub(now.duration_since(state.since));
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }

    /// Credits whole intervals elapsed since `since`, keeping the partial one.
    fn replenish(&self, state: &mut PacerState, now: Instant) {
        if self.limit.interval.is_zero() {
            state.available = self.limit.burst;
            state.since = now;
            return;
        }
        let earned = now.duration_since(state.since).as_nanos() / self.limit.interval.as_nanos();
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        state.available = state.available.saturating_add(earned).min(self.limit.burst);
        state.since = if state.available == self.limit.burst {
            now
        } else {
            self.limit
                .interval
                .checked_mul(earned)
                .map_or(now, |credited| state.since + credited)
        };
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("catalog request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("catalog answered {status} for {url}")]
    Status { status: u16, url: String },
}

/// reqwest client shared by every page of a catalog walk.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building catalog http client")?,
            pacer: config.rate_limit.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub async fn get(&self, fetch_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("catalog_get", %fetch_id, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.acquire().await;
            }

            let (class, err) = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse { status, url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::Status {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (retry_class_for_status(status), err)
                }
                Err(err) => (retry_class_for_error(&err), FetchError::Transport(err)),
            };

            if class == RetryClass::Permanent || retry >= self.retry.max_retries {
                return Err(err);
            }
            let delay = self.retry.delay_before_retry(retry);
            debug!(error = %err, retry = retry + 1, delay_ms = delay.as_millis() as u64, "retrying catalog request");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// One page of `GET /planets/`.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapiPage {
    #[serde(default)]
    pub count: Option<usize>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub results: Vec<SwapiPlanet>,
}

/// The subset of SWAPI planet attributes the store keeps.
#[derive(Debug, Clone, Deserialize)]
pub struct SwapiPlanet {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub climate: String,
    #[serde(default)]
    pub terrain: String,
    #[serde(default)]
    pub films: Vec<String>,
}

impl From<SwapiPlanet> for SourceRecord {
    fn from(planet: SwapiPlanet) -> Self {
        SourceRecord {
            name: planet.name,
            climate: planet.climate,
            terrain: planet.terrain,
            works: planet.films,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwapiClientConfig {
    pub base_url: String,
    pub max_pages: usize,
    pub http: HttpClientConfig,
}

impl Default for SwapiClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CATALOG_URL.to_string(),
            max_pages: 100,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct SwapiClient {
    base_url: String,
    max_pages: usize,
    http: HttpFetcher,
}

impl SwapiClient {
    pub fn new(config: SwapiClientConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http)?;
        Ok(Self {
            base_url: config.base_url,
            max_pages: config.max_pages.max(1),
            http,
        })
    }

    pub fn planets_url(&self) -> String {
        format!("{}/planets/", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CatalogClient for SwapiClient {
    fn name(&self) -> &'static str {
        "swapi"
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRecord>, CatalogError> {
        let fetch_id = Uuid::new_v4();
        let mut next = Some(self.planets_url());
        let mut visited = HashSet::new();
        let mut records = Vec::new();
        let mut expected = None;

        while let Some(url) = next.take() {
            if visited.len() >= self.max_pages {
                return Err(CatalogError::TooManyPages {
                    limit: self.max_pages,
                });
            }
            if !visited.insert(url.clone()) {
                return Err(CatalogError::PaginationLoop { url });
            }

            let response = self.http.get(fetch_id, &url).await?;
            let page: SwapiPage = serde_json::from_slice(&response.body)
                .map_err(|source| CatalogError::Decode { url: url.clone(), source })?;

            expected = expected.or(page.count);
            records.extend(page.results.into_iter().map(SourceRecord::from));
            next = page.next.filter(|n| !n.trim().is_empty());
        }

        if let Some(expected) = expected.filter(|&n| n != records.len()) {
            warn!(%fetch_id, expected, received = records.len(), "catalog count does not match records received");
        }
        debug!(%fetch_id, pages = visited.len(), records = records.len(), "catalog fetch complete");
        Ok(records)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FixtureDocument {
    Page(SwapiPage),
    Planets(Vec<SwapiPlanet>),
}

#[derive(Debug, Clone)]
enum FixtureSource {
    Records(Vec<SourceRecord>),
    File(PathBuf),
}

/// Offline catalog. File fixtures hold a SWAPI page (or a bare list of
/// planets) and are re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FixtureCatalog {
    source: FixtureSource,
}

impl FixtureCatalog {
    pub fn from_records(records: Vec<SourceRecord>) -> Self {
        Self {
            source: FixtureSource::Records(records),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            source: FixtureSource::File(path.into()),
        }
    }

    async fn read_file(path: &Path) -> Result<Vec<SourceRecord>, CatalogError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| CatalogError::Fixture {
            path: path.display().to_string(),
            source,
        })?;
        let document: FixtureDocument =
            serde_json::from_slice(&bytes).map_err(|source| CatalogError::Decode {
                url: path.display().to_string(),
                source,
            })?;
        let planets = match document {
            FixtureDocument::Page(page) => page.results,
            FixtureDocument::Planets(planets) => planets,
        };
        Ok(planets.into_iter().map(SourceRecord::from).collect())
    }
}

#[async_trait]
impl CatalogClient for FixtureCatalog {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRecord>, CatalogError> {
        match &self.source {
            FixtureSource::Records(records) => Ok(records.clone()),
            FixtureSource::File(path) => Self::read_file(path).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use tokio::net::TcpListener;

    fn fixture_path() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/swapi/planets.json")
    }

    fn quick_http() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("planets-catalog-test".into()),
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            rate_limit: None,
        }
    }

    async fn spawn_catalog(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/api")
    }

    fn client_for(base_url: String) -> SwapiClient {
        SwapiClient::new(SwapiClientConfig {
            base_url,
            max_pages: 10,
            http: quick_http(),
        })
        .expect("client")
    }

    fn planet_json(name: &str, films: usize) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "climate": "temperate",
            "terrain": "grasslands",
            "films": (0..films).map(|i| format!("https://swapi.dev/api/films/{i}/")).collect::<Vec<_>>(),
        })
    }

    #[derive(Clone)]
    struct PagedState {
        base: Arc<Mutex<String>>,
    }

    async fn paged_planets(
        State(state): State<PagedState>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        let base = state.base.lock().await.clone();
        match query.get("page").map(String::as_str) {
            Some("2") => Json(serde_json::json!({
                "count": 3,
                "next": null,
                "results": [planet_json("Hoth", 1)],
            })),
            _ => Json(serde_json::json!({
                "count": 3,
                "next": format!("{base}/planets/?page=2"),
                "results": [planet_json("Tatooine", 5), planet_json("Alderaan", 2)],
            })),
        }
    }

    #[tokio::test]
    async fn swapi_client_exhausts_pagination() {
        let state = PagedState {
            base: Arc::new(Mutex::new(String::new())),
        };
        let app = Router::new()
            .route("/api/planets/", get(paged_planets))
            .with_state(state.clone());
        let base = spawn_catalog(app).await;
        *state.base.lock().await = base.clone();

        let records = client_for(base).fetch_all().await.expect("fetch");
        let names = records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Tatooine", "Alderaan", "Hoth"]);
        assert_eq!(records[0].works.len(), 5);
    }

    #[tokio::test]
    async fn swapi_client_retries_server_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let app = Router::new().route(
            "/api/planets/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        AxumStatus::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(serde_json::json!({"count": 1, "next": null, "results": [planet_json("Naboo", 4)]}))
                            .into_response()
                    }
                }
            }),
        );
        let base = spawn_catalog(app).await;

        let records = client_for(base).fetch_all().await.expect("fetch");
        assert_eq!(records.len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn swapi_client_does_not_retry_client_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let app = Router::new().route(
            "/api/planets/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::NOT_FOUND
                }
            }),
        );
        let base = spawn_catalog(app).await;

        let err = client_for(base).fetch_all().await.expect_err("404 must fail");
        assert!(matches!(
            err,
            CatalogError::Http(FetchError::Status { status: 404, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn swapi_client_rejects_malformed_pages() {
        let app = Router::new().route(
            "/api/planets/",
            get(|| async { "<html>maintenance</html>" }),
        );
        let base = spawn_catalog(app).await;

        let err = client_for(base).fetch_all().await.expect_err("html must fail");
        assert!(matches!(err, CatalogError::Decode { .. }));
    }

    #[tokio::test]
    async fn swapi_client_detects_pagination_loops() {
        let state = PagedState {
            base: Arc::new(Mutex::new(String::new())),
        };
        let app = Router::new()
            .route(
                "/api/planets/",
                get(|State(state): State<PagedState>| async move {
                    let base = state.base.lock().await.clone();
                    Json(serde_json::json!({"next": format!("{base}/planets/"), "results": []}))
                }),
            )
            .with_state(state.clone());
        let base = spawn_catalog(app).await;
        *state.base.lock().await = base.clone();

        let err = client_for(base).fetch_all().await.expect_err("loop must fail");
        assert!(matches!(err, CatalogError::PaginationLoop { .. }));
    }

    #[tokio::test]
    async fn fixture_catalog_reads_swapi_page_files() {
        let catalog = FixtureCatalog::from_path(fixture_path());
        let records = catalog.fetch_all().await.expect("fixture");
        assert_eq!(records.len(), 4);
        let tatooine = records.iter().find(|r| r.name == "Tatooine").expect("tatooine");
        assert_eq!(tatooine.climate, "arid");
        assert_eq!(tatooine.terrain, "desert");
        assert_eq!(tatooine.works.len(), 5);
    }

    #[tokio::test]
    async fn fixture_catalog_accepts_bare_planet_lists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("planets.json");
        std::fs::write(&path, r#"[{"name":"Kashyyyk","climate":"tropical","terrain":"jungle","films":[]}]"#)
            .expect("write");

        let records = FixtureCatalog::from_path(&path).fetch_all().await.expect("fixture");
        assert_eq!(records.len(), 1);
        assert!(records[0].works.is_empty());
    }

    #[tokio::test]
    async fn missing_fixture_file_is_a_catalog_error() {
        let err = FixtureCatalog::from_path("/nonexistent/planets.json")
            .fetch_all()
            .await
            .expect_err("missing file");
        assert!(matches!(err, CatalogError::Fixture { .. }));
    }

    #[test]
    fn missing_planet_name_decodes_as_empty() {
        let planet: SwapiPlanet = serde_json::from_str(r#"{"climate":"arid","films":["a"]}"#).expect("decode");
        let record = SourceRecord::from(planet);
        assert!(record.name.is_empty());
        assert_eq!(record.works, vec!["a".to_string()]);
    }

    #[test]
    fn default_retry_delays_double_up_to_the_ceiling() {
        let policy = RetryPolicy::default();
        let delays = (0..6).map(|r| policy.delay_before_retry(r).as_millis()).collect::<Vec<_>>();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 8_000]);
        assert_eq!(policy.delay_before_retry(40), Duration::from_secs(8));
    }

    #[test]
    fn load_shedding_statuses_are_transient() {
        assert_eq!(retry_class_for_status(StatusCode::TOO_MANY_REQUESTS), RetryClass::Transient);
        assert_eq!(retry_class_for_status(StatusCode::GATEWAY_TIMEOUT), RetryClass::Transient);
        assert_eq!(retry_class_for_status(StatusCode::NOT_FOUND), RetryClass::Permanent);
        assert_eq!(retry_class_for_status(StatusCode::UNAUTHORIZED), RetryClass::Permanent);
    }

    #[test]
    fn rate_limit_per_second_spreads_requests() {
        assert_eq!(RateLimit::per_second(0), None);
        assert_eq!(
            RateLimit::per_second(4),
            Some(RateLimit {
                burst: 4,
                interval: Duration::from_millis(250),
            })
        );
        let fast = RateLimit::per_second(5_000).expect("limit");
        assert_eq!(fast.interval, Duration::from_micros(200));
    }

    #[tokio::test]
    async fn pacer_waits_for_the_next_interval_once_burst_is_spent() {
        let pacer = RequestPacer::new(RateLimit {
            burst: 1,
            interval: Duration::from_millis(30),
        });
        let started = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn pacer_refills_with_sub_millisecond_intervals() {
        let pacer = RequestPacer::new(RateLimit {
            burst: 1,
            interval: Duration::from_micros(500),
        });
        tokio::time::timeout(Duration::from_millis(500), async {
            for _ in 0..20 {
                pacer.acquire().await;
            }
        })
        .await
        .expect("sub-millisecond pacing keeps refilling");
    }
}
