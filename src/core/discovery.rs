//! Geo discovery - "what can I pick up near me?"
//!
//! A query runs in two passes. Storage narrows candidates with cheap indexed
//! predicates (live, not expired, category, price, bounding box). Every
//! candidate then gets an exact haversine distance, the status is derived fresh
//! from its quantity, and the remaining filters run in memory through
//! [`Criteria::rank`], which the client cache reuses to re-evaluate rows after
//! an event.

use crate::{
    config::{DbPool, EngineConfig},
    core::{
        favorites::FavoriteSet,
        geo::{BoundingBox, Coordinate},
        status,
    },
    entities::{Business, ListingStatus, business, listing},
    errors::{Error, Result},
};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, TimeZone, Utc};
use sea_orm::{Condition, QueryOrder, prelude::*};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, sync::Arc};
use tracing::{debug, instrument};

/// Largest UTC offset accepted for the "tomorrow" bucket, in minutes
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Pickup-time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PickupBucket {
    /// No pickup-time constraint
    #[default]
    Any,
    /// Pickup window overlaps the next few hours
    Now,
    /// Pickup starts on the viewer's next calendar day
    Tomorrow,
}

impl PickupBucket {
    /// Parses a bucket name.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for anything but `any`, `now` or `tomorrow`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "any" | "all" => Ok(Self::Any),
            "now" => Ok(Self::Now),
            "tomorrow" => Ok(Self::Tomorrow),
            other => Err(Error::invalid(format!("Unknown pickup bucket '{other}'"))),
        }
    }
}

/// Inclusive price bounds; `None` leaves that side open
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceRange {
    /// Lowest acceptable price
    pub min: Option<f64>,
    /// Highest acceptable price
    pub max: Option<f64>,
}

impl PriceRange {
    /// Whether `price` lies within the bounds
    #[must_use]
    pub fn contains(&self, price: f64) -> bool {
        self.min.is_none_or(|min| price >= min) && self.max.is_none_or(|max| price <= max)
    }
}

/// Optional narrowing of a discovery query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilters {
    /// Exact category, case-insensitive
    pub category: Option<String>,
    /// Substring of the item or business name, case-insensitive
    pub search: Option<String>,
    /// Pickup-time bucket
    pub pickup: PickupBucket,
    /// Also return listings with no units left
    pub include_sold_out: bool,
    /// Price bounds
    pub price: PriceRange,
    /// Lowest acceptable business rating
    pub min_rating: Option<f64>,
    /// Viewer, for favorite flags
    pub viewer_id: Option<String>,
    /// Only favorited listings (requires `viewer_id`)
    pub favorites_only: bool,
    /// Viewer's UTC offset, used to find "tomorrow"
    pub utc_offset_minutes: i32,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl DiscoveryFilters {
    /// Checks the filters for contradictions and out-of-range values.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] or [`Error::InvalidAmount`] describing the
    /// first problem found.
    pub fn validate(&self) -> Result<()> {
        for bound in [self.price.min, self.price.max].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(Error::InvalidAmount { amount: bound });
            }
        }
        if let (Some(min), Some(max)) = (self.price.min, self.price.max)
            && min > max
        {
            return Err(Error::invalid("Minimum price exceeds maximum price"));
        }
        if let Some(rating) = self.min_rating
            && !(0.0..=5.0).contains(&rating)
        {
            return Err(Error::invalid("Minimum rating must be between 0 and 5"));
        }
        if self.favorites_only && self.viewer().is_none() {
            return Err(Error::invalid("Favorites filter needs a user id"));
        }
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(Error::invalid("UTC offset must be within +/- 14 hours"));
        }
        if self.limit == Some(0) {
            return Err(Error::invalid("Limit must be at least 1"));
        }
        Ok(())
    }

    /// Viewer id with surrounding whitespace removed, if non-blank
    #[must_use]
    pub fn viewer(&self) -> Option<&str> {
        self.viewer_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    fn category_key(&self) -> Option<String> {
        self.category
            .as_deref()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
    }

    fn search_key(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

/// A listing as seen by one viewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedListing {
    /// Stored listing row
    #[serde(flatten)]
    pub listing: listing::Model,
    /// Owning business name
    pub business_name: String,
    /// Owning business average rating
    pub business_rating: f64,
    /// Status derived from the current quantity, ignoring the stored value
    pub current_status: ListingStatus,
    /// Great-circle distance from the viewer
    pub distance_km: f64,
    /// Whether the viewer favorited the listing or its business
    pub is_favorite: bool,
}

/// Orders results by distance, then soonest pickup, then id.
#[must_use]
pub fn rank_order(a: &RankedListing, b: &RankedListing) -> Ordering {
    a.distance_km
        .total_cmp(&b.distance_km)
        .then_with(|| a.listing.pickup_start.cmp(&b.listing.pickup_start))
        .then_with(|| a.listing.id.cmp(&b.listing.id))
}

/// Everything needed to decide whether one listing belongs in one viewer's
/// results. Pure: no storage access.
#[derive(Debug, Clone)]
pub struct Criteria {
    viewer: Coordinate,
    radius_km: f64,
    filters: DiscoveryFilters,
    category: Option<String>,
    search: Option<String>,
    favorites: FavoriteSet,
    low_stock_threshold: i32,
    pickup_now_window: Duration,
    limit: usize,
}

impl Criteria {
    /// Validates the query and prepares it for evaluation.
    ///
    /// # Errors
    /// Returns an error for a non-positive radius or invalid filters.
    pub fn new(
        viewer: Coordinate,
        radius_km: f64,
        filters: DiscoveryFilters,
        favorites: FavoriteSet,
        config: &EngineConfig,
    ) -> Result<Self> {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(Error::invalid("Search radius must be a positive distance"));
        }
        filters.validate()?;
        let limit = effective_limit(filters.limit, config);
        Ok(Self {
            viewer,
            radius_km,
            category: filters.category_key(),
            search: filters.search_key(),
            filters,
            favorites,
            low_stock_threshold: config.low_stock_threshold,
            pickup_now_window: config.pickup_now_window(),
            limit,
        })
    }

    /// Viewer position
    #[must_use]
    pub const fn viewer(&self) -> Coordinate {
        self.viewer
    }

    /// Search radius in kilometres
    #[must_use]
    pub const fn radius_km(&self) -> f64 {
        self.radius_km
    }

    /// Filters the criteria were built from
    #[must_use]
    pub const fn filters(&self) -> &DiscoveryFilters {
        &self.filters
    }

    /// Maximum number of rows a result may hold, after applying the engine's
    /// default and cap
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Bounding box used to pre-filter storage
    #[must_use]
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::around(&self.viewer, self.radius_km)
    }

    /// Ranks `listing` for this viewer at `now`, or returns `None` if it does not
    /// belong in the results.
    #[must_use]
    pub fn rank(
        &self,
        listing: listing::Model,
        business_name: &str,
        business_rating: f64,
        now: DateTime<Utc>,
    ) -> Option<RankedListing> {
        if listing.is_archived || status::is_expired(listing.pickup_end, now) {
            return None;
        }

        let location = Coordinate::new(listing.latitude, listing.longitude).ok()?;
        let distance_km = self.viewer.distance_km(&location);
        if distance_km > self.radius_km {
            return None;
        }

        let current_status = status::derive_status(listing.quantity, self.low_stock_threshold);
        if current_status == ListingStatus::SoldOut && !self.filters.include_sold_out {
            return None;
        }

        if let Some(category) = &self.category
            && listing.category.to_lowercase() != *category
        {
            return None;
        }
        if let Some(search) = &self.search
            && !listing.name.to_lowercase().contains(search.as_str())
            && !business_name.to_lowercase().contains(search.as_str())
        {
            return None;
        }
        if !self.filters.price.contains(listing.price) {
            return None;
        }
        if let Some(min_rating) = self.filters.min_rating
            && business_rating < min_rating
        {
            return None;
        }
        if !self.in_pickup_bucket(&listing, now) {
            return None;
        }

        let is_favorite = self.favorites.covers(listing.id, listing.business_id);
        if self.filters.favorites_only && !is_favorite {
            return None;
        }

        Some(RankedListing {
            listing,
            business_name: business_name.to_string(),
            business_rating,
            current_status,
            distance_km,
            is_favorite,
        })
    }

    fn in_pickup_bucket(&self, listing: &listing::Model, now: DateTime<Utc>) -> bool {
        match self.filters.pickup {
            PickupBucket::Any => true,
            PickupBucket::Now => {
                listing.pickup_start <= now + self.pickup_now_window && listing.pickup_end > now
            }
            PickupBucket::Tomorrow => tomorrow_window(now, self.filters.utc_offset_minutes)
                .is_some_and(|(start, end)| {
                    listing.pickup_start >= start && listing.pickup_start < end
                }),
        }
    }
}

fn effective_limit(requested: Option<usize>, config: &EngineConfig) -> usize {
    requested
        .unwrap_or(config.default_discovery_limit)
        .min(config.max_discovery_limit)
}

/// Start and end, in UTC, of the calendar day after `now` at `utc_offset_minutes`.
#[must_use]
pub fn tomorrow_window(
    now: DateTime<Utc>,
    utc_offset_minutes: i32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let offset = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
    let tomorrow = now.with_timezone(&offset).date_naive().succ_opt()?;
    let start = offset
        .from_local_datetime(&tomorrow.and_time(NaiveTime::MIN))
        .single()?
        .with_timezone(&Utc);
    Some((start, start + Duration::days(1)))
}

/// Read-only geo search over live listings.
#[derive(Debug, Clone)]
pub struct DiscoveryIndex {
    db: DbPool,
    config: Arc<EngineConfig>,
}

impl DiscoveryIndex {
    /// Creates an index reading from `db`.
    #[must_use]
    pub const fn new(db: DbPool, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    /// Builds [`Criteria`] with this index's engine settings.
    pub fn criteria(
        &self,
        viewer: Coordinate,
        radius_km: f64,
        filters: DiscoveryFilters,
        favorites: FavoriteSet,
    ) -> Result<Criteria> {
        Criteria::new(viewer, radius_km, filters, favorites, &self.config)
    }

    /// Listings within `criteria`'s radius that pass its filters, nearest first,
    /// truncated to the requested limit. An empty result is not an error.
    #[instrument(skip(self, criteria), fields(radius_km = criteria.radius_km()))]
    pub async fn discover(
        &self,
        criteria: &Criteria,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedListing>> {
        let filters = criteria.filters();
        let bounds = criteria.bounding_box();

        let mut query = listing::Entity::find()
            .find_also_related(Business)
            .filter(listing::Column::IsArchived.eq(false))
            .filter(listing::Column::PickupEnd.gt(now))
            .filter(listing::Column::Latitude.between(bounds.min_latitude, bounds.max_latitude));
        if !bounds.longitude_ranges.is_empty() {
            let mut any_range = Condition::any();
            for range in &bounds.longitude_ranges {
                any_range = any_range.add(listing::Column::Longitude.between(range.min, range.max));
            }
            query = query.filter(any_range);
        }
        if !filters.include_sold_out {
            query = query.filter(listing::Column::Quantity.gt(0));
        }
        if let Some(category) = filters.category_key() {
            query = query.filter(listing::Column::Category.eq(category));
        }
        if let Some(min) = filters.price.min {
            query = query.filter(listing::Column::Price.gte(min));
        }
        if let Some(max) = filters.price.max {
            query = query.filter(listing::Column::Price.lte(max));
        }

        let candidates = query
            .order_by_asc(listing::Column::Id)
            .all(&*self.db)
            .await?;
        let scanned = candidates.len();

        let mut ranked: Vec<RankedListing> = candidates
            .into_iter()
            .filter_map(|(row, owner): (listing::Model, Option<business::Model>)| {
                let owner = owner?;
                criteria.rank(row, &owner.name, owner.average_rating, now)
            })
            .collect();
        ranked.sort_by(rank_order);
        ranked.truncate(criteria.limit());

        debug!(
            "Discovery scanned {} candidates and returned {}",
            scanned,
            ranked.len()
        );
        Ok(ranked)
    }
}
