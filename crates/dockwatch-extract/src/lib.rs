//! Selector-driven listing extraction and the page-fetch boundary.
//!
//! Site-specific extraction is configuration, not polymorphism: every source
//! is a [`SourceSpec`] consumed by one generic extraction routine. The crawl
//! core only ever sees the [`PageFetcher`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dockwatch_core::{listing_identity, listing_identity_keep_hyphens, Listing};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use dockwatch_core::{derive_status_category, StatusCategory};
pub use dockwatch_store::FetchError;
use dockwatch_store::HttpFetcher;

pub const CRATE_NAME: &str = "dockwatch-extract";

/// Expected structure absent from a page. Absorbed at the page boundary:
/// callers degrade it to "zero listings found" instead of propagating.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
}

/// CSS selectors for one source, tried against its listing markup.
///
/// `containers` is a cascade: candidates are tried in order and the first
/// one that yields any records wins. The remaining selectors are evaluated
/// relative to each matched container element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorSet {
    pub containers: Vec<String>,
    #[serde(default = "SelectorSet::default_title")]
    pub title: String,
    #[serde(default = "SelectorSet::default_price")]
    pub price: String,
    #[serde(default = "SelectorSet::default_status")]
    pub status: String,
    #[serde(default = "SelectorSet::default_link")]
    pub link: String,
    /// Optional selector for a "Showing N results" style element; the first
    /// integer found in its text becomes the declared total.
    #[serde(default)]
    pub total_count: Option<String>,
}

impl SelectorSet {
    fn default_title() -> String {
        "h2, h3, .title, [class*=\"title\"]".to_string()
    }

    fn default_price() -> String {
        ".price, [class*=\"price\"]".to_string()
    }

    fn default_status() -> String {
        ".status, [class*=\"status\"]".to_string()
    }

    fn default_link() -> String {
        "a".to_string()
    }
}

impl Default for SelectorSet {
    /// Cascade covering the common inventory-listing markup patterns seen
    /// across dealer sites.
    fn default() -> Self {
        Self {
            containers: vec![
                ".boat-listing".to_string(),
                ".inventory-item".to_string(),
                ".boat-item".to_string(),
                "[class*=\"boat\"]".to_string(),
                "[data-boat]".to_string(),
                ".product-item".to_string(),
                ".listing".to_string(),
            ],
            title: Self::default_title(),
            price: Self::default_price(),
            status: Self::default_status(),
            link: Self::default_link(),
            total_count: None,
        }
    }
}

/// Everything needed to crawl and extract one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub key: String,
    pub display_name: String,
    /// Origin used to absolutize relative listing links.
    pub base_url: String,
    /// Page 1 of the inventory listing.
    pub listing_url: String,
    /// URL template for pages beyond the first, with a `{page}` placeholder.
    /// None means the source is treated as single-page.
    #[serde(default)]
    pub page_url_template: Option<String>,
    /// Keep `-` in listing identities, for sources whose titles differ only
    /// by hyphenated model numbers.
    #[serde(default)]
    pub identity_keeps_hyphens: bool,
    #[serde(default)]
    pub selectors: SelectorSet,
}

impl SourceSpec {
    pub fn page_url(&self, page: u32) -> String {
        if page <= 1 {
            return self.listing_url.clone();
        }
        match &self.page_url_template {
            Some(template) => template.replace("{page}", &page.to_string()),
            None => self.listing_url.clone(),
        }
    }
}

/// Raw extracted records for one page, plus the total-count signal when the
/// source surfaces one.
#[derive(Debug, Clone, Default)]
pub struct PageBatch {
    pub listings: Vec<Listing>,
    pub declared_total: Option<u32>,
}

/// Injected capability that produces one page of extracted records.
///
/// Fails with [`FetchError`] on network/timeout/non-2xx; the crawl core
/// treats any failure on page >= 2 as "zero listings, stop" and propagates
/// a page 1 failure unchanged.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, page: u32) -> Result<PageBatch, FetchError>;
}

/// Extract listings from one page of a source's HTML.
///
/// Records missing a title are dropped; within-page records that normalize
/// to the same identity are coalesced by the caller, not here.
pub fn extract_listings(
    html: &str,
    spec: &SourceSpec,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Listing>, ExtractError> {
    let document = Html::parse_document(html);

    for container in &spec.selectors.containers {
        let container_sel = parse_selector(container)?;
        let mut listings = Vec::new();

        for element in document.select(&container_sel) {
            let title = select_first_text(element, &spec.selectors.title)?;
            let Some(title) = title else { continue };

            let price = select_first_text(element, &spec.selectors.price)?.unwrap_or_default();
            // Without a status element, sale state still leaks through the
            // title ("2020 Lund 1675 - SOLD").
            let status = match select_first_text(element, &spec.selectors.status)? {
                Some(status) => status.to_ascii_lowercase(),
                None => derive_status_category(&title, "").as_str().to_string(),
            };
            let link = select_first_attr(element, &spec.selectors.link, "href")?
                .map(|href| absolutize_link(&spec.base_url, &href));

            let identity = if spec.identity_keeps_hyphens {
                listing_identity_keep_hyphens(&title, &price)
            } else {
                listing_identity(&title, &price)
            };
            listings.push(Listing {
                identity,
                title,
                price,
                link,
                status,
                fetched_at,
            });
        }

        if !listings.is_empty() {
            return Ok(listings);
        }
    }

    Ok(Vec::new())
}

/// Pull the declared result total out of a page, if the source's spec names
/// a selector for it and the element contains an integer.
pub fn extract_declared_total(html: &str, spec: &SourceSpec) -> Result<Option<u32>, ExtractError> {
    let Some(selector) = &spec.selectors.total_count else {
        return Ok(None);
    };
    let document = Html::parse_document(html);
    let sel = parse_selector(selector)?;
    let Some(element) = document.select(&sel).next() else {
        return Ok(None);
    };
    let text = element.text().collect::<String>();
    Ok(first_integer(&text))
}

fn first_integer(text: &str) -> Option<u32> {
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() {
            // Thousands separator inside a number ("1,234 boats").
            continue;
        } else if !current.is_empty() {
            break;
        }
    }
    current.parse().ok()
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn select_first_text(element: ElementRef<'_>, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(element
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    element: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(element
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn absolutize_link(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let base = base_url.trim_end_matches('/');
    if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

/// [`PageFetcher`] backed by the shared HTTP client and the generic
/// extraction routine. Extraction failures degrade to an empty batch; only
/// transport failures surface as [`FetchError`].
pub struct HttpPageFetcher {
    http: Arc<HttpFetcher>,
    spec: SourceSpec,
    run_id: Uuid,
}

impl HttpPageFetcher {
    pub fn new(http: Arc<HttpFetcher>, spec: SourceSpec, run_id: Uuid) -> Self {
        Self { http, spec, run_id }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(&self, page: u32) -> Result<PageBatch, FetchError> {
        let url = self.spec.page_url(page);
        let response = self.http.fetch_text(self.run_id, &self.spec.key, &url).await?;
        let html = response.body_text();
        let fetched_at = Utc::now();

        let listings = match extract_listings(&html, &self.spec, fetched_at) {
            Ok(listings) => listings,
            Err(err) => {
                warn!(source_key = %self.spec.key, page, %err, "extraction failed, treating page as empty");
                Vec::new()
            }
        };
        let declared_total = extract_declared_total(&html, &self.spec).unwrap_or_default();

        Ok(PageBatch {
            listings,
            declared_total,
        })
    }
}
