//! Crawl orchestration: pagination guards, monitor cycles, notifications.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockwatch_core::{diff, ChangeSet, Listing};
use dockwatch_extract::{FetchError, HttpPageFetcher, PageFetcher, SourceSpec};
use dockwatch_store::{HttpClientConfig, HttpFetcher, SnapshotStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dockwatch-monitor";

/// When to hand a change set to the notification sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    Always,
    #[default]
    OnChangeOnly,
}

/// One monitored source: the extraction spec plus crawl policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(flatten)]
    pub spec: SourceSpec,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Listings per page when the source paginates. None means the first
    /// page's record count is used.
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Hard ceiling on pages fetched per crawl, independent of what the
    /// source claims its total is.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub inter_page_delay_ms: u64,
    #[serde(default)]
    pub notify: NotifyPolicy,
    /// Whether an empty first page is trusted as "store has zero items".
    /// When false, an empty first page aborts the cycle instead of risking
    /// a false everything-removed report during a transient empty response.
    #[serde(default = "default_true")]
    pub empty_page_is_zero_inventory: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_max_pages() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

impl SourceRegistry {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceEntry> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn find(&self, source_key: &str) -> Option<&SourceEntry> {
        self.sources.iter().find(|s| s.spec.key == source_key)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub inter_source_delay_ms: u64,
    pub scheduler_enabled: bool,
    pub monitor_cron: String,
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("DOCKWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            sources_path: std::env::var("DOCKWATCH_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("DOCKWATCH_USER_AGENT")
                .unwrap_or_else(|_| "dockwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("DOCKWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            inter_source_delay_ms: std::env::var("DOCKWATCH_INTER_SOURCE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
            scheduler_enabled: std::env::var("DOCKWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            monitor_cron: std::env::var("DOCKWATCH_MONITOR_CRON")
                .unwrap_or_else(|_| "0 6 * * *".to_string()),
        }
    }
}

/// Cycle-aborting failures. Parse failures and non-first-page fetch
/// failures never reach here; they degrade inside the crawl.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("source {source_key} returned an empty first page")]
    EmptyFirstPage { source_key: String },
    #[error("unknown source {source_key}")]
    UnknownSource { source_key: String },
}

/// Crawl policy for one pagination run.
#[derive(Debug, Clone, Copy)]
pub struct PaginationPolicy {
    pub page_size: Option<u32>,
    pub max_pages: u32,
    pub inter_page_delay: Duration,
}

impl PaginationPolicy {
    pub fn for_entry(entry: &SourceEntry) -> Self {
        Self {
            page_size: entry.page_size,
            max_pages: entry.max_pages.max(1),
            inter_page_delay: Duration::from_millis(entry.inter_page_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlResult {
    pub listings: Vec<Listing>,
    pub pages_fetched: u32,
}

/// Pages to fetch given a declared total and a page size. Defaults to 1
/// when either signal is missing: without a reliable total, under-fetching
/// beats an unbounded crawl.
pub fn planned_pages(declared_total: Option<u32>, page_size: Option<u32>, max_pages: u32) -> u32 {
    let planned = match (declared_total, page_size) {
        (Some(total), Some(size)) if size > 0 => total.div_ceil(size),
        _ => 1,
    };
    planned.clamp(1, max_pages.max(1))
}

/// Drive repeated page fetches into one deduplicated snapshot.
///
/// Termination guarantees: at most `max_pages` fetches regardless of
/// upstream behavior, pages requested in strictly increasing order, no
/// page refetched, and no identity appears twice in the result.
///
/// A fetch failure on page 1 propagates; on any later page it is treated
/// as "zero listings" and the crawl stops with what it has. A page whose
/// listings are all already-seen identities is the signature of a
/// pagination redirect loop (the site served an earlier page again) and
/// stops the crawl immediately.
pub async fn crawl(
    fetcher: &dyn PageFetcher,
    policy: &PaginationPolicy,
) -> Result<CrawlResult, FetchError> {
    let first = fetcher.fetch_page(1).await?;
    if first.listings.is_empty() {
        return Ok(CrawlResult {
            listings: Vec::new(),
            pages_fetched: 1,
        });
    }

    let first_page_len = first.listings.len() as u32;
    let mut seen_identities: HashSet<String> = HashSet::new();
    let mut collected: Vec<Listing> = Vec::new();
    for listing in first.listings {
        if seen_identities.insert(listing.identity.clone()) {
            collected.push(listing);
        }
    }

    let page_size = policy.page_size.or(Some(first_page_len));
    let planned = planned_pages(first.declared_total, page_size, policy.max_pages);
    let mut pages_fetched = 1;

    for page in 2..=planned {
        if !policy.inter_page_delay.is_zero() {
            tokio::time::sleep(policy.inter_page_delay).await;
        }

        let batch = match fetcher.fetch_page(page).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(page, %err, "page fetch failed, keeping what was collected");
                break;
            }
        };
        pages_fetched += 1;

        if batch.listings.is_empty() {
            break;
        }

        let mut fresh = 0usize;
        for listing in batch.listings {
            if seen_identities.insert(listing.identity.clone()) {
                collected.push(listing);
                fresh += 1;
            }
        }

        if fresh == 0 {
            warn!(page, "page contained only already-seen listings, stopping (redirect loop)");
            break;
        }
    }

    debug_assert_eq!(seen_identities.len(), collected.len());
    Ok(CrawlResult {
        listings: collected,
        pages_fetched,
    })
}

/// Delivery failure from a notification sink. Swallowed and logged by the
/// monitor; the snapshot is already durable by the time delivery runs.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("notification rejected with status {status}")]
    Rejected { status: u16 },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, source: &SourceSpec, changes: &ChangeSet) -> Result<(), NotifyError>;
}

/// Sink that only logs the digest. Used for local runs and as the default
/// when email credentials are absent.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, source: &SourceSpec, changes: &ChangeSet) -> Result<(), NotifyError> {
        info!(
            source_key = %source.key,
            added = changes.added.len(),
            removed = changes.removed.len(),
            price_changed = changes.price_changed.len(),
            status_changed = changes.status_changed.len(),
            "inventory change report"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
    pub to: Vec<String>,
}

impl EmailConfig {
    /// None when credentials are not configured; callers fall back to the
    /// log sink with a warning rather than failing the cycle.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SENDGRID_API_KEY").ok()?;
        let from = std::env::var("SENDGRID_FROM_EMAIL").ok()?;
        let primary = std::env::var("SENDGRID_TO_EMAIL").ok()?;
        let mut to = vec![primary];
        if let Ok(second) = std::env::var("SENDGRID_TO_EMAIL_2") {
            to.push(second);
        }
        Some(Self {
            api_url: std::env::var("DOCKWATCH_MAIL_API_URL")
                .unwrap_or_else(|_| "https://api.sendgrid.com/v3/mail/send".to_string()),
            api_key,
            from,
            to,
        })
    }
}

/// Email sink posting an HTML digest to a SendGrid-style mail API.
pub struct EmailSink {
    client: reqwest::Client,
    config: EmailConfig,
}

impl EmailSink {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    async fn notify(&self, source: &SourceSpec, changes: &ChangeSet) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "personalizations": [{
                "to": self.config.to.iter().map(|email| serde_json::json!({"email": email})).collect::<Vec<_>>(),
                "subject": format!("Dockwatch - {} update", source.display_name),
            }],
            "from": {"email": self.config.from},
            "content": [{
                "type": "text/html",
                "value": render_digest(&source.display_name, changes),
            }],
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

const DIGEST_SECTION_CAP: usize = 5;

/// HTML digest of a change set: one capped section per non-empty bucket.
pub fn render_digest(display_name: &str, changes: &ChangeSet) -> String {
    let mut html = format!("<h2>{} - Inventory Update</h2>", display_name);

    digest_section(&mut html, "Added", changes.added.len(), || {
        changes
            .added
            .iter()
            .take(DIGEST_SECTION_CAP)
            .map(|l| format!("{} - {}", l.title, l.price))
            .collect()
    });
    digest_section(&mut html, "Removed", changes.removed.len(), || {
        changes
            .removed
            .iter()
            .take(DIGEST_SECTION_CAP)
            .map(|l| l.title.clone())
            .collect()
    });
    digest_section(&mut html, "Price Changes", changes.price_changed.len(), || {
        changes
            .price_changed
            .iter()
            .take(DIGEST_SECTION_CAP)
            .map(|c| format!("{}: {} to {}", c.listing.title, c.old_price, c.new_price))
            .collect()
    });
    digest_section(&mut html, "Status Changes", changes.status_changed.len(), || {
        changes
            .status_changed
            .iter()
            .take(DIGEST_SECTION_CAP)
            .map(|c| format!("{}: {} to {}", c.listing.title, c.old_status, c.new_status))
            .collect()
    });

    html.push_str("<hr><p><small>Automated notification from Dockwatch</small></p>");
    html
}

fn digest_section(html: &mut String, heading: &str, total: usize, lines: impl FnOnce() -> Vec<String>) {
    if total == 0 {
        return;
    }
    html.push_str(&format!("<h3>{} ({})</h3><ul>", heading, total));
    for line in lines() {
        html.push_str(&format!("<li>{}</li>", line));
    }
    if total > DIGEST_SECTION_CAP {
        html.push_str(&format!("<li>... and {} more</li>", total - DIGEST_SECTION_CAP));
    }
    html.push_str("</ul>");
}

/// Outcome of one completed monitor cycle for one source.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub source_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub listing_count: usize,
    pub changes: ChangeSet,
    pub notified: bool,
}

/// Per-source report inside a full registry run.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_key: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<SourceRunReport>,
}

/// Drives monitor cycles: load prior snapshot, crawl, diff, persist, notify.
///
/// Cycles for the same source are mutually exclusive; independent sources
/// may run concurrently. A cycle is linear (Idle, Crawling, Reconciling,
/// back to Idle) and never reads back state it wrote in the same cycle.
pub struct Monitor {
    store: SnapshotStore,
    http: Arc<HttpFetcher>,
    sink: Arc<dyn NotificationSink>,
    inter_source_delay: Duration,
    source_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Monitor {
    pub fn new(store: SnapshotStore, http: Arc<HttpFetcher>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            http,
            sink,
            inter_source_delay: Duration::ZERO,
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let store = SnapshotStore::new(config.data_dir.clone());
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let sink: Arc<dyn NotificationSink> = match EmailConfig::from_env() {
            Some(email) => Arc::new(EmailSink::new(email)),
            None => {
                warn!("email credentials not configured, change reports go to the log only");
                Arc::new(LogSink)
            }
        };
        Ok(Self {
            store,
            http,
            sink,
            inter_source_delay: Duration::from_millis(config.inter_source_delay_ms),
            source_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    async fn source_lock(&self, source_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.source_locks.lock().await;
        locks
            .entry(source_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One monitor cycle for one source, crawling over HTTP.
    pub async fn run_source(&self, entry: &SourceEntry) -> Result<RunOutcome, MonitorError> {
        let run_id = Uuid::new_v4();
        let fetcher = HttpPageFetcher::new(self.http.clone(), entry.spec.clone(), run_id);
        self.run_source_with(entry, &fetcher, run_id).await
    }

    /// Cycle body with an injected fetcher; tests substitute scripted page
    /// sequences here.
    pub async fn run_source_with(
        &self,
        entry: &SourceEntry,
        fetcher: &dyn PageFetcher,
        run_id: Uuid,
    ) -> Result<RunOutcome, MonitorError> {
        let lock = self.source_lock(&entry.spec.key).await;
        let _exclusive = lock.lock().await;

        let started_at = Utc::now();
        let policy = PaginationPolicy::for_entry(entry);

        let crawled = crawl(fetcher, &policy).await?;
        if crawled.listings.is_empty() && !entry.empty_page_is_zero_inventory {
            return Err(MonitorError::EmptyFirstPage {
                source_key: entry.spec.key.clone(),
            });
        }

        let previous = self.store.load(&entry.spec.key).await?;
        let changes = diff(previous.as_deref(), &crawled.listings);

        // The snapshot is durable before notification is attempted; a
        // delivery failure never rolls it back.
        self.store.save(&entry.spec.key, &crawled.listings).await?;

        let should_notify = match entry.notify {
            NotifyPolicy::Always => true,
            NotifyPolicy::OnChangeOnly => !changes.is_empty(),
        };
        let mut notified = false;
        if should_notify {
            match self.sink.notify(&entry.spec, &changes).await {
                Ok(()) => notified = true,
                Err(err) => {
                    warn!(source_key = %entry.spec.key, %err, "notification delivery failed");
                }
            }
        }

        let outcome = RunOutcome {
            run_id,
            source_key: entry.spec.key.clone(),
            started_at,
            finished_at: Utc::now(),
            pages_fetched: crawled.pages_fetched,
            listing_count: crawled.listings.len(),
            changes,
            notified,
        };
        info!(
            source_key = %outcome.source_key,
            %run_id,
            pages = outcome.pages_fetched,
            listings = outcome.listing_count,
            changes = outcome.changes.total_changes(),
            "monitor cycle completed"
        );
        Ok(outcome)
    }

    /// One pass over every enabled source, sequential with a politeness
    /// delay between sources. A single source's failure is reported, not
    /// fatal to the rest of the run.
    pub async fn run_all(&self, registry: &SourceRegistry) -> RunSummary {
        let started_at = Utc::now();
        let mut reports = Vec::new();
        let mut first = true;

        for entry in registry.enabled() {
            if !first && !self.inter_source_delay.is_zero() {
                tokio::time::sleep(self.inter_source_delay).await;
            }
            first = false;

            match self.run_source(entry).await {
                Ok(outcome) => reports.push(SourceRunReport {
                    source_key: entry.spec.key.clone(),
                    success: true,
                    error: None,
                    outcome: Some(outcome),
                }),
                Err(err) => {
                    warn!(source_key = %entry.spec.key, %err, "monitor cycle failed");
                    reports.push(SourceRunReport {
                        source_key: entry.spec.key.clone(),
                        success: false,
                        error: Some(err.to_string()),
                        outcome: None,
                    });
                }
            }
        }

        RunSummary {
            started_at,
            finished_at: Utc::now(),
            reports,
        }
    }
}

/// Cron-driven monitor runs. Returns None when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &MonitorConfig,
    monitor: Arc<Monitor>,
    registry: Arc<SourceRegistry>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.monitor_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let monitor = monitor.clone();
        let registry = registry.clone();
        Box::pin(async move {
            let summary = monitor.run_all(&registry).await;
            let failures = summary.reports.iter().filter(|r| !r.success).count();
            info!(
                sources = summary.reports.len(),
                failures, "scheduled monitor run finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dockwatch_extract::PageBatch;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).single().unwrap()
    }

    fn listing(title: &str, price: &str) -> Listing {
        Listing::new(title, price, None, "available", ts())
    }

    fn batch(listings: Vec<Listing>, declared_total: Option<u32>) -> PageBatch {
        PageBatch {
            listings,
            declared_total,
        }
    }

    fn fetch_err() -> FetchError {
        FetchError::HttpStatus {
            status: 503,
            url: "https://dealer.example.com/inventory".to_string(),
        }
    }

    /// Scripted fetcher: page N returns the Nth entry, anything beyond the
    /// script returns an empty page. Records every requested page number.
    struct ScriptedFetcher {
        pages: StdMutex<HashMap<u32, Result<PageBatch, FetchError>>>,
        requested: StdMutex<Vec<u32>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<(u32, Result<PageBatch, FetchError>)>) -> Self {
            Self {
                pages: StdMutex::new(pages.into_iter().collect()),
                requested: StdMutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<u32> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch_page(&self, page: u32) -> Result<PageBatch, FetchError> {
            self.requested.lock().unwrap().push(page);
            self.pages
                .lock()
                .unwrap()
                .remove(&page)
                .unwrap_or_else(|| Ok(PageBatch::default()))
        }
    }

    fn policy(page_size: Option<u32>, max_pages: u32) -> PaginationPolicy {
        PaginationPolicy {
            page_size,
            max_pages,
            inter_page_delay: Duration::ZERO,
        }
    }

    fn entry(key: &str) -> SourceEntry {
        SourceEntry {
            spec: SourceSpec {
                key: key.to_string(),
                display_name: key.to_string(),
                base_url: "https://dealer.example.com".to_string(),
                listing_url: "https://dealer.example.com/inventory".to_string(),
                page_url_template: None,
                identity_keeps_hyphens: false,
                selectors: Default::default(),
            },
            enabled: true,
            page_size: Some(50),
            max_pages: 20,
            inter_page_delay_ms: 0,
            notify: NotifyPolicy::OnChangeOnly,
            empty_page_is_zero_inventory: true,
        }
    }

    #[test]
    fn planned_pages_arithmetic_matches_declared_totals() {
        assert_eq!(planned_pages(Some(110), Some(50), 20), 3);
        assert_eq!(planned_pages(Some(100), Some(50), 20), 2);
        assert_eq!(planned_pages(Some(50), Some(50), 20), 1);
        assert_eq!(planned_pages(None, Some(50), 20), 1);
        assert_eq!(planned_pages(Some(110), None, 20), 1);
        assert_eq!(planned_pages(Some(10_000), Some(10), 20), 20);
    }

    #[tokio::test]
    async fn empty_first_page_returns_empty_without_fetching_page_two() {
        let fetcher = ScriptedFetcher::new(vec![(1, Ok(batch(vec![], Some(500))))]);
        let result = crawl(&fetcher, &policy(Some(50), 20)).await.expect("crawl");
        assert!(result.listings.is_empty());
        assert_eq!(fetcher.requested(), vec![1]);
    }

    #[tokio::test]
    async fn first_page_fetch_error_propagates() {
        let fetcher = ScriptedFetcher::new(vec![(1, Err(fetch_err()))]);
        let err = crawl(&fetcher, &policy(Some(50), 20)).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn later_page_fetch_error_keeps_what_was_collected() {
        let fetcher = ScriptedFetcher::new(vec![
            (1, Ok(batch(vec![listing("Boat A", "$1")], Some(3)))),
            (2, Err(fetch_err())),
            (3, Ok(batch(vec![listing("Boat C", "$3")], None))),
        ]);
        let result = crawl(&fetcher, &policy(Some(1), 20)).await.expect("crawl");
        assert_eq!(result.listings.len(), 1);
        assert_eq!(result.listings[0].title, "Boat A");
        // Page 3 is never requested once page 2 fails.
        assert_eq!(fetcher.requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn redirect_loop_terminates_after_one_all_duplicate_page() {
        let page_one = vec![listing("Boat A", "$1"), listing("Boat B", "$2")];
        let fetcher = ScriptedFetcher::new(vec![
            (1, Ok(batch(page_one.clone(), Some(1000)))),
            (2, Ok(batch(page_one.clone(), None))),
            (3, Ok(batch(page_one.clone(), None))),
            (4, Ok(batch(page_one.clone(), None))),
        ]);
        let result = crawl(&fetcher, &policy(Some(2), 20)).await.expect("crawl");
        assert_eq!(result.listings.len(), 2);
        assert_eq!(fetcher.requested(), vec![1, 2]);
    }

    #[tokio::test]
    async fn termination_is_bounded_by_max_pages_even_with_fresh_content() {
        let pages: Vec<_> = (1..=50)
            .map(|n| {
                (
                    n,
                    Ok(batch(
                        vec![listing(&format!("Boat {n}"), &format!("${n}"))],
                        Some(10_000),
                    )),
                )
            })
            .collect();
        let fetcher = ScriptedFetcher::new(pages);
        let result = crawl(&fetcher, &policy(Some(1), 5)).await.expect("crawl");
        assert_eq!(result.pages_fetched, 5);
        assert_eq!(fetcher.requested(), vec![1, 2, 3, 4, 5]);
        assert_eq!(result.listings.len(), 5);
    }

    #[tokio::test]
    async fn overlapping_pages_never_produce_duplicate_identities() {
        let shared = listing("Boat B", "$2");
        let fetcher = ScriptedFetcher::new(vec![
            (1, Ok(batch(vec![listing("Boat A", "$1"), shared.clone()], Some(6)))),
            (2, Ok(batch(vec![shared.clone(), listing("Boat C", "$3")], None))),
            (3, Ok(batch(vec![listing("Boat D", "$4")], None))),
        ]);
        let result = crawl(&fetcher, &policy(Some(2), 20)).await.expect("crawl");

        let mut identities: Vec<_> = result.listings.iter().map(|l| l.identity.clone()).collect();
        let before = identities.len();
        identities.sort();
        identities.dedup();
        assert_eq!(identities.len(), before);
        assert_eq!(result.listings.len(), 4);
    }

    #[tokio::test]
    async fn page_size_falls_back_to_first_page_count() {
        // 4 declared / 2 per first page -> 2 planned pages.
        let fetcher = ScriptedFetcher::new(vec![
            (1, Ok(batch(vec![listing("Boat A", "$1"), listing("Boat B", "$2")], Some(4)))),
            (2, Ok(batch(vec![listing("Boat C", "$3"), listing("Boat D", "$4")], None))),
            (3, Ok(batch(vec![listing("Boat E", "$5")], None))),
        ]);
        let result = crawl(&fetcher, &policy(None, 20)).await.expect("crawl");
        assert_eq!(result.listings.len(), 4);
        assert_eq!(fetcher.requested(), vec![1, 2]);
    }

    #[derive(Default)]
    struct RecordingSink {
        deliveries: StdMutex<Vec<(String, ChangeSet)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, source: &SourceSpec, changes: &ChangeSet) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected { status: 502 });
            }
            self.deliveries
                .lock()
                .unwrap()
                .push((source.key.clone(), changes.clone()));
            Ok(())
        }
    }

    fn monitor_with_sink(dir: &std::path::Path, sink: Arc<dyn NotificationSink>) -> Monitor {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        Monitor::new(SnapshotStore::new(dir), http, sink)
    }

    #[tokio::test]
    async fn first_cycle_persists_snapshot_and_reports_everything_added() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink.clone());
        let entry = entry("marks-marine");

        let fetcher = ScriptedFetcher::new(vec![(
            1,
            Ok(batch(vec![listing("Boat A", "$1"), listing("Boat B", "$2")], None)),
        )]);
        let outcome = monitor
            .run_source_with(&entry, &fetcher, Uuid::new_v4())
            .await
            .expect("cycle");

        assert_eq!(outcome.changes.added.len(), 2);
        assert!(outcome.notified);
        assert_eq!(sink.deliveries.lock().unwrap().len(), 1);

        let stored = monitor.store().load("marks-marine").await.expect("load").expect("some");
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn second_cycle_diffs_against_stored_snapshot_and_replaces_it() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink.clone());
        let entry = entry("marks-marine");

        let first = ScriptedFetcher::new(vec![(
            1,
            Ok(batch(vec![listing("Boat A", "$1"), listing("Boat B", "$2")], None)),
        )]);
        monitor
            .run_source_with(&entry, &first, Uuid::new_v4())
            .await
            .expect("first cycle");

        let second = ScriptedFetcher::new(vec![(
            1,
            Ok(batch(vec![listing("Boat B", "$2"), listing("Boat C", "$3")], None)),
        )]);
        let outcome = monitor
            .run_source_with(&entry, &second, Uuid::new_v4())
            .await
            .expect("second cycle");

        assert_eq!(outcome.changes.added.len(), 1);
        assert_eq!(outcome.changes.removed.len(), 1);
        assert_eq!(outcome.changes.removed[0].title, "Boat A");

        let stored = monitor.store().load("marks-marine").await.expect("load").expect("some");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|l| l.title != "Boat A"));
    }

    #[tokio::test]
    async fn unchanged_snapshot_skips_notification_under_on_change_policy() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink.clone());
        let entry = entry("marks-marine");

        let page = vec![listing("Boat A", "$1")];
        let first = ScriptedFetcher::new(vec![(1, Ok(batch(page.clone(), None)))]);
        monitor
            .run_source_with(&entry, &first, Uuid::new_v4())
            .await
            .expect("first cycle");

        let second = ScriptedFetcher::new(vec![(1, Ok(batch(page, None)))]);
        let outcome = monitor
            .run_source_with(&entry, &second, Uuid::new_v4())
            .await
            .expect("second cycle");

        assert!(outcome.changes.is_empty());
        assert!(!outcome.notified);
        assert_eq!(sink.deliveries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn always_policy_notifies_even_without_changes() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink.clone());
        let mut entry = entry("marks-marine");
        entry.notify = NotifyPolicy::Always;

        let page = vec![listing("Boat A", "$1")];
        let first = ScriptedFetcher::new(vec![(1, Ok(batch(page.clone(), None)))]);
        monitor
            .run_source_with(&entry, &first, Uuid::new_v4())
            .await
            .expect("first cycle");
        let second = ScriptedFetcher::new(vec![(1, Ok(batch(page, None)))]);
        let outcome = monitor
            .run_source_with(&entry, &second, Uuid::new_v4())
            .await
            .expect("second cycle");

        assert!(outcome.changes.is_empty());
        assert!(outcome.notified);
        assert_eq!(sink.deliveries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notification_failure_does_not_roll_back_the_snapshot_write() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let monitor = monitor_with_sink(dir.path(), sink);
        let entry = entry("marks-marine");

        let fetcher = ScriptedFetcher::new(vec![(1, Ok(batch(vec![listing("Boat A", "$1")], None)))]);
        let outcome = monitor
            .run_source_with(&entry, &fetcher, Uuid::new_v4())
            .await
            .expect("cycle succeeds despite notify failure");

        assert!(!outcome.notified);
        assert!(monitor.store().load("marks-marine").await.expect("load").is_some());
    }

    #[tokio::test]
    async fn untrusted_empty_first_page_aborts_without_overwriting_state() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink);
        let mut entry = entry("marks-marine");

        let seed = ScriptedFetcher::new(vec![(1, Ok(batch(vec![listing("Boat A", "$1")], None)))]);
        monitor
            .run_source_with(&entry, &seed, Uuid::new_v4())
            .await
            .expect("seed cycle");

        entry.empty_page_is_zero_inventory = false;
        let empty = ScriptedFetcher::new(vec![(1, Ok(batch(vec![], None)))]);
        let err = monitor
            .run_source_with(&entry, &empty, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::EmptyFirstPage { .. }));

        let stored = monitor.store().load("marks-marine").await.expect("load").expect("some");
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn trusted_empty_first_page_reports_full_removal() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(RecordingSink::default());
        let monitor = monitor_with_sink(dir.path(), sink);
        let entry = entry("marks-marine");

        let seed = ScriptedFetcher::new(vec![(1, Ok(batch(vec![listing("Boat A", "$1")], None)))]);
        monitor
            .run_source_with(&entry, &seed, Uuid::new_v4())
            .await
            .expect("seed cycle");

        let empty = ScriptedFetcher::new(vec![(1, Ok(batch(vec![], None)))]);
        let outcome = monitor
            .run_source_with(&entry, &empty, Uuid::new_v4())
            .await
            .expect("cycle");
        assert_eq!(outcome.changes.removed.len(), 1);
        let stored = monitor.store().load("marks-marine").await.expect("load").expect("some");
        assert!(stored.is_empty());
    }

    #[test]
    fn registry_yaml_round_trips_with_defaults() {
        let yaml = r#"
sources:
  - key: marks-marine
    display_name: Marks Leisure Time Marine
    base_url: https://marksleisuretimemarine.com
    listing_url: https://marksleisuretimemarine.com/inventory
    page_url_template: "https://marksleisuretimemarine.com/inventory?page={page}"
    page_size: 24
    notify: always
  - key: smith-boys
    display_name: Smith Boys
    base_url: https://smithboys.com
    listing_url: https://smithboys.com/boats
    enabled: false
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.enabled().count(), 1);

        let marks = registry.find("marks-marine").expect("entry");
        assert_eq!(marks.page_size, Some(24));
        assert_eq!(marks.max_pages, 20);
        assert_eq!(marks.notify, NotifyPolicy::Always);
        assert!(marks.empty_page_is_zero_inventory);

        let smith = registry.find("smith-boys").expect("entry");
        assert!(!smith.enabled);
        assert_eq!(smith.notify, NotifyPolicy::OnChangeOnly);
        assert!(!smith.spec.selectors.containers.is_empty());
    }

    #[test]
    fn digest_caps_each_section_at_five_lines() {
        let added: Vec<_> = (0..8).map(|n| listing(&format!("Boat {n}"), "$1")).collect();
        let changes = ChangeSet {
            added,
            ..ChangeSet::default()
        };
        let digest = render_digest("Marks Marine", &changes);
        assert!(digest.contains("Added (8)"));
        assert!(digest.contains("... and 3 more"));
        assert!(!digest.contains("Removed"));
        assert_eq!(digest.matches("<li>").count(), 6);
    }
}
