//! Client-side reconciliation of discovery results with fanout events.
//!
//! A [`DiscoveryCache`] holds one viewer's ranked results and patches them as
//! events arrive, without going back to storage. Events that are not newer than
//! what the cache already saw are dropped, so duplicates and reordering are
//! harmless. Anything the cache cannot patch (a lag notice, closure, or a silent
//! connection) marks it stale, and the owner re-runs discovery and calls
//! [`DiscoveryCache::replace`].

use crate::core::{
    discovery::{Criteria, RankedListing, rank_order},
    fanout::{BusinessEvent, FanoutMessage, ListingEvent, MutationEvent},
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tracing::debug;

/// What applying a message did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Nothing changed
    Ignored,
    /// A listing entered the results
    Inserted,
    /// One or more cached rows changed in place
    Updated,
    /// A listing left the results
    Removed,
    /// The cache can no longer be trusted and must be refreshed
    Stale,
}

/// One viewer's discovery results kept fresh by events.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    criteria: Criteria,
    rows: Vec<RankedListing>,
    listing_versions: HashMap<i64, i64>,
    business_versions: HashMap<i64, i64>,
    heartbeat_timeout: Duration,
    last_heard: DateTime<Utc>,
    stale: bool,
}

impl DiscoveryCache {
    /// Creates a cache seeded with a discovery result fetched at `now`.
    #[must_use]
    pub fn new(
        criteria: Criteria,
        results: Vec<RankedListing>,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut cache = Self {
            criteria,
            rows: Vec::new(),
            listing_versions: HashMap::new(),
            business_versions: HashMap::new(),
            heartbeat_timeout,
            last_heard: now,
            stale: false,
        };
        cache.replace(results, now);
        cache
    }

    /// Current rows, nearest first
    #[must_use]
    pub fn rows(&self) -> &[RankedListing] {
        &self.rows
    }

    /// Query the cache answers
    #[must_use]
    pub const fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    /// Installs a fresh discovery result and clears the stale mark.
    pub fn replace(&mut self, results: Vec<RankedListing>, now: DateTime<Utc>) {
        self.listing_versions = results
            .iter()
            .map(|row| (row.listing.id, row.listing.version))
            .collect();
        self.business_versions.clear();
        self.rows = results;
        self.rows.sort_by(rank_order);
        self.rows.truncate(self.criteria.limit());
        self.prune_versions();
        self.last_heard = now;
        self.stale = false;
    }

    /// Records that the connection is alive.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heard = now;
    }

    /// Whether the owner must re-run discovery before trusting the rows.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.stale
            || (now - self.last_heard)
                .to_std()
                .is_ok_and(|silence| silence > self.heartbeat_timeout)
    }

    /// Applies one fanout message received at `now`.
    pub fn apply(&mut self, message: &FanoutMessage, now: DateTime<Utc>) -> CacheUpdate {
        match message {
            FanoutMessage::Event(event) => {
                self.last_heard = now;
                match event.as_ref() {
                    MutationEvent::Listing(e) => self.apply_listing(e, now),
                    MutationEvent::Business(e) => self.apply_business(e, now),
                }
            }
            FanoutMessage::Lagged(missed) => {
                debug!("Cache missed {} events, marking stale", missed);
                self.stale = true;
                CacheUpdate::Stale
            }
            FanoutMessage::Closed => {
                self.stale = true;
                CacheUpdate::Stale
            }
        }
    }

    fn apply_listing(&mut self, event: &ListingEvent, now: DateTime<Utc>) -> CacheUpdate {
        let id = event.listing.id;
        if self
            .listing_versions
            .get(&id)
            .is_some_and(|seen| event.listing.version <= *seen)
        {
            return CacheUpdate::Ignored;
        }

        let position = self.rows.iter().position(|row| row.listing.id == id);
        let ranked = self.criteria.rank(
            event.listing.clone(),
            &event.business_name,
            event.business_rating,
            now,
        );

        let update = match (position, ranked) {
            (Some(index), Some(row)) => {
                self.rows[index] = row;
                self.rows.sort_by(rank_order);
                CacheUpdate::Updated
            }
            (None, Some(row)) => {
                self.rows.push(row);
                self.rows.sort_by(rank_order);
                self.rows.truncate(self.criteria.limit());
                if self.holds_listing(id) {
                    CacheUpdate::Inserted
                } else {
                    CacheUpdate::Ignored
                }
            }
            (Some(index), None) => {
                self.rows.remove(index);
                CacheUpdate::Removed
            }
            (None, None) => return CacheUpdate::Ignored,
        };

        if self.holds_listing(id) {
            self.listing_versions.insert(id, event.listing.version);
        }
        self.prune_versions();
        update
    }

    fn apply_business(&mut self, event: &BusinessEvent, now: DateTime<Utc>) -> CacheUpdate {
        let business = &event.business;
        if self
            .business_versions
            .get(&business.id)
            .is_some_and(|seen| business.version <= *seen)
        {
            return CacheUpdate::Ignored;
        }

        let before = self.rows.len();
        let mut touched = false;
        let criteria = &self.criteria;
        self.rows = std::mem::take(&mut self.rows)
            .into_iter()
            .filter_map(|row| {
                if row.listing.business_id != business.id {
                    return Some(row);
                }
                touched = true;
                criteria.rank(row.listing, &business.name, business.average_rating, now)
            })
            .collect();
        if !touched {
            return CacheUpdate::Ignored;
        }
        self.rows.sort_by(rank_order);

        if self.rows.iter().any(|row| row.listing.business_id == business.id) {
            self.business_versions.insert(business.id, business.version);
        }
        self.prune_versions();

        if self.rows.len() < before {
            CacheUpdate::Removed
        } else {
            CacheUpdate::Updated
        }
    }

    fn holds_listing(&self, listing_id: i64) -> bool {
        self.rows.iter().any(|row| row.listing.id == listing_id)
    }

    /// Versions are only kept for rows currently in the result set.
    fn prune_versions(&mut self) {
        let listings: HashSet<i64> = self.rows.iter().map(|row| row.listing.id).collect();
        let businesses: HashSet<i64> = self
            .rows
            .iter()
            .map(|row| row.listing.business_id)
            .collect();
        self.listing_versions.retain(|id, _| listings.contains(id));
        self.business_versions.retain(|id, _| businesses.contains(id));
    }

    /// Number of rows whose versions are being tracked
    #[must_use]
    pub fn tracked_versions(&self) -> usize {
        self.listing_versions.len() + self.business_versions.len()
    }
}
