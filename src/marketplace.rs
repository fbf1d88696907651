//! Service container wiring the engine components to one database and fanout.

use crate::{
    config::{DbPool, EngineConfig},
    core::{
        cache::DiscoveryCache,
        discovery::{Criteria, DiscoveryFilters, DiscoveryIndex, RankedListing},
        fanout::{Fanout, Subscription, Topic},
        favorites::{FavoriteSet, FavoritesLedger},
        geo::Coordinate,
        listing::ListingStore,
        reservation::ReservationCoordinator,
    },
    errors::Result,
};
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

/// Shared handle to every engine component. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Marketplace {
    db: DbPool,
    /// Engine tunables
    pub config: Arc<EngineConfig>,
    /// Mutation broadcast
    pub fanout: Fanout,
    /// Business-side listing writes
    pub listings: ListingStore,
    /// Purchase path
    pub reservations: ReservationCoordinator,
    /// Geo search
    pub discovery: DiscoveryIndex,
    /// User favorites
    pub favorites: FavoritesLedger,
}

/// Work done by one housekeeping sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Listings archived because their pickup window closed
    pub archived_listings: usize,
    /// Idempotency records past their TTL that were deleted
    pub purged_keys: u64,
}

impl Marketplace {
    /// Builds every component over `db`.
    #[must_use]
    pub fn new(db: DatabaseConnection, config: EngineConfig) -> Self {
        let db: DbPool = Arc::new(db);
        let config = Arc::new(config);
        let fanout = Fanout::new(config.fanout_capacity);
        Self {
            listings: ListingStore::new(
                Arc::clone(&db),
                fanout.clone(),
                config.low_stock_threshold,
            ),
            reservations: ReservationCoordinator::new(
                Arc::clone(&db),
                fanout.clone(),
                Arc::clone(&config),
            ),
            discovery: DiscoveryIndex::new(Arc::clone(&db), Arc::clone(&config)),
            favorites: FavoritesLedger::new(Arc::clone(&db)),
            fanout,
            config,
            db,
        }
    }

    /// Database handle
    #[must_use]
    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Builds discovery criteria, loading the viewer's favorites when a viewer
    /// id is given.
    pub async fn criteria(
        &self,
        viewer: Coordinate,
        radius_km: f64,
        filters: DiscoveryFilters,
    ) -> Result<Criteria> {
        filters.validate()?;
        let favorites = match filters.viewer() {
            Some(user_id) => self.favorites.favorite_set(user_id).await?,
            None => FavoriteSet::default(),
        };
        self.discovery
            .criteria(viewer, radius_km, filters, favorites)
    }

    /// Runs a discovery query for one viewer.
    pub async fn discover(
        &self,
        viewer: Coordinate,
        radius_km: f64,
        filters: DiscoveryFilters,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedListing>> {
        let criteria = self.criteria(viewer, radius_km, filters).await?;
        self.discovery.discover(&criteria, now).await
    }

    /// Subscribes to all listing events and seeds a cache with a fresh query.
    /// Subscribing first means no event between the query and the subscription
    /// is lost.
    pub async fn watch(
        &self,
        viewer: Coordinate,
        radius_km: f64,
        filters: DiscoveryFilters,
    ) -> Result<(DiscoveryCache, Subscription)> {
        let subscription = self.fanout.subscribe(Topic::AllListings);
        let criteria = self.criteria(viewer, radius_km, filters).await?;
        let now = Utc::now();
        let results = self.discovery.discover(&criteria, now).await?;
        let cache = DiscoveryCache::new(
            criteria,
            results,
            self.config.heartbeat_timeout(),
            now,
        );
        Ok((cache, subscription))
    }

    /// Re-runs the cache's query and installs the result.
    pub async fn refresh(&self, cache: &mut DiscoveryCache) -> Result<()> {
        let now = Utc::now();
        let results = self.discovery.discover(cache.criteria(), now).await?;
        cache.replace(results, now);
        Ok(())
    }

    /// Archives expired listings and purges expired idempotency keys.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        Ok(SweepReport {
            archived_listings: self.listings.archive_expired(now).await?,
            purged_keys: self.reservations.purge_expired_keys(now).await?,
        })
    }

    /// Runs [`Marketplace::sweep`] every `interval` until the runtime shuts down.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let marketplace = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match marketplace.sweep(Utc::now()).await {
                    Ok(report) if report != SweepReport::default() => {
                        info!(
                            "Sweep archived {} listings and purged {} keys",
                            report.archived_listings, report.purged_keys
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Sweep failed: {}", e),
                }
            }
        })
    }
}
