//! Core domain model and snapshot diff engine for Dockwatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dockwatch-core";

/// One externally observed product record.
///
/// Created fresh on every crawl cycle and never mutated afterwards; a new
/// snapshot replaces the stored one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub identity: String,
    pub title: String,
    /// Opaque display string ("$54,900"). Numeric normalization happens at
    /// diff time so the original formatting survives for reports.
    pub price: String,
    pub link: Option<String>,
    /// Free-text status as scraped; diffing compares the derived
    /// [`StatusCategory`], not this text, so wording churn is not a change.
    pub status: String,
    pub fetched_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(
        title: impl Into<String>,
        price: impl Into<String>,
        link: Option<String>,
        status: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let title = title.into();
        let price = price.into();
        Self {
            identity: listing_identity(&title, &price),
            title,
            price,
            link,
            status: status.into(),
            fetched_at,
        }
    }
}

/// Stable identity for a listing: lowercased title + price with everything
/// outside `[a-z0-9]` stripped. Pure and total; an empty title or price
/// degrades to an empty component rather than failing, which chips identity
/// uniqueness at the edges but keeps the crawl pipeline error-free.
pub fn listing_identity(title: &str, price: &str) -> String {
    let mut key = normalize_identity_fragment(title, false);
    key.push_str(&normalize_identity_fragment(price, false));
    key
}

/// Identity variant that also keeps `-`, for sources whose titles differ
/// only by hyphenated model numbers.
pub fn listing_identity_keep_hyphens(title: &str, price: &str) -> String {
    let mut key = normalize_identity_fragment(title, true);
    key.push_str(&normalize_identity_fragment(price, true));
    key
}

fn normalize_identity_fragment(input: &str, keep_hyphens: bool) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || (keep_hyphens && *c == '-'))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Price change for one identity present in both snapshots, carrying the
/// original display strings from each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceChange {
    pub listing: Listing,
    pub old_price: String,
    pub new_price: String,
}

/// Status change for one identity present in both snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub listing: Listing,
    pub old_status: String,
    pub new_status: String,
}

/// Categorized delta between two snapshots of one source. Computed for
/// exactly one snapshot pair, never accumulated across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: Vec<Listing>,
    pub removed: Vec<Listing>,
    pub price_changed: Vec<PriceChange>,
    pub status_changed: Vec<StatusChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.price_changed.is_empty()
            && self.status_changed.is_empty()
    }

    pub fn total_changes(&self) -> usize {
        self.added.len()
            + self.removed.len()
            + self.price_changed.len()
            + self.status_changed.len()
    }
}

/// Compare two snapshots by listing identity.
///
/// A missing or empty `previous` means first-run semantics: everything in
/// `current` is classified as added and no other buckets are computed.
/// Bucket ordering follows `current` iteration order (added, price_changed,
/// status_changed) or `previous` (removed) so identical inputs always
/// produce identical reports.
pub fn diff(previous: Option<&[Listing]>, current: &[Listing]) -> ChangeSet {
    let Some(previous) = previous.filter(|p| !p.is_empty()) else {
        return ChangeSet {
            added: current.to_vec(),
            ..ChangeSet::default()
        };
    };

    let old_by_identity: HashMap<&str, &Listing> = previous
        .iter()
        .map(|l| (l.identity.as_str(), l))
        .collect();
    let new_by_identity: HashMap<&str, &Listing> = current
        .iter()
        .map(|l| (l.identity.as_str(), l))
        .collect();

    let mut changes = ChangeSet::default();

    for listing in current {
        if !old_by_identity.contains_key(listing.identity.as_str()) {
            changes.added.push(listing.clone());
        }
    }

    for listing in previous {
        if !new_by_identity.contains_key(listing.identity.as_str()) {
            changes.removed.push(listing.clone());
        }
    }

    for new_listing in current {
        let Some(old_listing) = old_by_identity.get(new_listing.identity.as_str()) else {
            continue;
        };

        let old_numeric = normalize_numeric_price(&old_listing.price);
        let new_numeric = normalize_numeric_price(&new_listing.price);
        // A price that cannot be parsed on either side never registers as
        // changed.
        if !old_numeric.is_empty() && !new_numeric.is_empty() && old_numeric != new_numeric {
            changes.price_changed.push(PriceChange {
                listing: new_listing.clone(),
                old_price: old_listing.price.clone(),
                new_price: new_listing.price.clone(),
            });
        }

        let old_category = derive_status_category(&old_listing.title, &old_listing.status);
        let new_category = derive_status_category(&new_listing.title, &new_listing.status);
        if old_category != new_category {
            changes.status_changed.push(StatusChange {
                listing: new_listing.clone(),
                old_status: old_listing.status.clone(),
                new_status: new_listing.status.clone(),
            });
        }
    }

    changes
}

/// Strip everything but digits and decimal points from a display price.
pub fn normalize_numeric_price(display: &str) -> String {
    display
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect()
}

/// Sale-state category derived from a listing's combined title + status
/// text. Derived on demand, never stored on the listing; a badge rewording
/// ("For Sale" to "Available") keeps the category and so is not a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCategory {
    Sold,
    Pending,
    Available,
}

impl StatusCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCategory::Sold => "sold",
            StatusCategory::Pending => "pending",
            StatusCategory::Available => "available",
        }
    }
}

pub fn derive_status_category(title: &str, status: &str) -> StatusCategory {
    let text = format!("{} {}", title, status).to_ascii_lowercase();
    if text.contains("sold") {
        StatusCategory::Sold
    } else if text.contains("pending") || text.contains("under contract") {
        StatusCategory::Pending
    } else {
        StatusCategory::Available
    }
}
