//! Listing store - durable listing records and the business-side write paths.
//!
//! Consumers only ever change a listing's quantity through the reservation
//! coordinator. The business-side writes here (create, restock, relocate,
//! archive) follow the same rules: every quantity change is a single conditional
//! statement, the status is re-derived in the same transaction, and a mutation
//! event is published after commit.

use crate::{
    config::DbPool,
    core::{
        business,
        fanout::{BusinessChange, Fanout, ListingChange, MutationEvent},
        geo::Coordinate,
        status::{self, StatusTransition},
    },
    entities::{Listing, ListingStatus, business as business_entity, listing},
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{QueryOrder, Set, TransactionTrait, prelude::*, sea_query::Expr};
use tracing::{debug, info, instrument};

/// Input for [`ListingStore::create_listing`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewListing {
    /// Owning business
    pub business_id: i64,
    /// Item name
    pub name: String,
    /// Description of the contents
    pub description: String,
    /// Food category
    pub category: String,
    /// Discounted price
    pub price: f64,
    /// Price before discount
    pub original_price: f64,
    /// Units on offer, at least one
    pub quantity: i32,
    /// Start of the pickup window
    pub pickup_start: DateTime<Utc>,
    /// End of the pickup window
    pub pickup_end: DateTime<Utc>,
    /// Pickup location; defaults to the business location
    pub location: Option<Coordinate>,
}

impl NewListing {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid("Listing name cannot be empty"));
        }
        if self.category.trim().is_empty() {
            return Err(Error::invalid("Listing category cannot be empty"));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(Error::InvalidAmount { amount: self.price });
        }
        if !self.original_price.is_finite() || self.original_price < self.price {
            return Err(Error::InvalidAmount {
                amount: self.original_price,
            });
        }
        if self.quantity < 1 {
            return Err(Error::InvalidQuantity {
                quantity: self.quantity,
            });
        }
        if self.pickup_start >= self.pickup_end {
            return Err(Error::invalid("Pickup window must start before it ends"));
        }
        Ok(())
    }
}

/// Finds a listing by its unique ID, archived or not.
pub async fn get_listing_by_id<C>(db: &C, listing_id: i64) -> Result<Option<listing::Model>>
where
    C: ConnectionTrait,
{
    Listing::find_by_id(listing_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Retrieves a business's listings, soonest pickup first.
pub async fn listings_for_business(
    db: &DatabaseConnection,
    business_id: i64,
    include_archived: bool,
) -> Result<Vec<listing::Model>> {
    let mut query = Listing::find().filter(listing::Column::BusinessId.eq(business_id));
    if !include_archived {
        query = query.filter(listing::Column::IsArchived.eq(false));
    }
    query
        .order_by_asc(listing::Column::PickupStart)
        .order_by_asc(listing::Column::Id)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Explains why a conditional listing update matched no row.
///
/// Must run on the same connection or transaction as the failed update so that
/// it observes the same state.
pub(crate) async fn diagnose_unmatched<C>(
    db: &C,
    listing_id: i64,
    requested: i32,
    now: DateTime<Utc>,
) -> Result<Error>
where
    C: ConnectionTrait,
{
    let error = match get_listing_by_id(db, listing_id).await? {
        None => Error::ListingNotFound { id: listing_id },
        Some(listing) if listing.is_archived => Error::ListingNotFound { id: listing_id },
        Some(listing) if status::is_expired(listing.pickup_end, now) => {
            Error::ListingExpired { id: listing_id }
        }
        Some(listing) => Error::InsufficientStock {
            requested,
            remaining: listing.quantity,
        },
    };
    Ok(error)
}

/// Re-derives the stored status from the stored quantity, writing it back if it
/// changed. Call inside the transaction that changed the quantity.
pub(crate) async fn sync_status<C>(
    db: &C,
    mut listing: listing::Model,
    low_stock_threshold: i32,
) -> Result<(listing::Model, Option<StatusTransition>)>
where
    C: ConnectionTrait,
{
    let change = status::transition(listing.status, listing.quantity, low_stock_threshold);
    if let Some(StatusTransition { to, .. }) = change {
        Listing::update_many()
            .col_expr(listing::Column::Status, Expr::value(to.as_str()))
            .filter(listing::Column::Id.eq(listing.id))
            .exec(db)
            .await?;
        listing.status = to;
    }
    Ok((listing, change))
}

/// Owner of all business-side listing and business writes.
#[derive(Debug, Clone)]
pub struct ListingStore {
    db: DbPool,
    fanout: Fanout,
    low_stock_threshold: i32,
}

impl ListingStore {
    /// Creates a store writing to `db` and publishing to `fanout`.
    #[must_use]
    pub const fn new(db: DbPool, fanout: Fanout, low_stock_threshold: i32) -> Self {
        Self {
            db,
            fanout,
            low_stock_threshold,
        }
    }

    /// Creates a business and announces it.
    #[instrument(skip(self))]
    pub async fn create_business(
        &self,
        name: &str,
        location: Coordinate,
    ) -> Result<business_entity::Model> {
        let created = business::insert_business(&*self.db, name, location).await?;
        info!("Created business {} ('{}')", created.id, created.name);
        self.fanout.publish(MutationEvent::business(
            BusinessChange::Inserted,
            created.clone(),
        ));
        Ok(created)
    }

    /// Moves a business and every unarchived listing it owns.
    #[instrument(skip(self))]
    pub async fn update_business_location(
        &self,
        business_id: i64,
        location: Coordinate,
    ) -> Result<business_entity::Model> {
        let txn = self.db.begin().await?;

        let now = Utc::now();
        let updated = business_entity::Entity::update_many()
            .col_expr(
                business_entity::Column::Latitude,
                Expr::value(location.latitude()),
            )
            .col_expr(
                business_entity::Column::Longitude,
                Expr::value(location.longitude()),
            )
            .col_expr(
                business_entity::Column::Version,
                Expr::col(business_entity::Column::Version).add(1),
            )
            .col_expr(business_entity::Column::UpdatedAt, Expr::value(now))
            .filter(business_entity::Column::Id.eq(business_id))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            return Err(Error::BusinessNotFound { id: business_id });
        }

        Listing::update_many()
            .col_expr(listing::Column::Latitude, Expr::value(location.latitude()))
            .col_expr(listing::Column::Longitude, Expr::value(location.longitude()))
            .col_expr(
                listing::Column::Version,
                Expr::col(listing::Column::Version).add(1),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::BusinessId.eq(business_id))
            .filter(listing::Column::IsArchived.eq(false))
            .exec(&txn)
            .await?;

        let moved = business::require_business(&txn, business_id).await?;
        let listings = Listing::find()
            .filter(listing::Column::BusinessId.eq(business_id))
            .filter(listing::Column::IsArchived.eq(false))
            .all(&txn)
            .await?;
        txn.commit().await?;

        info!(
            "Relocated business {} and {} listings",
            business_id,
            listings.len()
        );
        self.fanout.publish(MutationEvent::business(
            BusinessChange::Relocated,
            moved.clone(),
        ));
        for row in listings {
            self.fanout.publish(MutationEvent::listing(
                ListingChange::Relocated,
                row,
                &moved,
                None,
            ));
        }
        Ok(moved)
    }

    /// Validates and inserts a listing, deriving its initial status.
    ///
    /// # Errors
    /// Returns an error if:
    /// - The name or category is blank
    /// - A price is negative, not finite, or the discount price exceeds the original
    /// - The quantity is below one or the pickup window is empty
    /// - The business does not exist
    #[instrument(skip(self, new_listing), fields(business_id = new_listing.business_id))]
    pub async fn create_listing(&self, new_listing: NewListing) -> Result<listing::Model> {
        new_listing.validate()?;

        let owner = business::require_business(&*self.db, new_listing.business_id).await?;
        let location = match new_listing.location {
            Some(location) => location,
            None => Coordinate::new(owner.latitude, owner.longitude)?,
        };

        let now = Utc::now();
        let model = listing::ActiveModel {
            business_id: Set(owner.id),
            name: Set(new_listing.name.trim().to_string()),
            description: Set(new_listing.description.trim().to_string()),
            category: Set(new_listing.category.trim().to_lowercase()),
            price: Set(new_listing.price),
            original_price: Set(new_listing.original_price),
            quantity: Set(new_listing.quantity),
            initial_quantity: Set(new_listing.quantity),
            pickup_start: Set(new_listing.pickup_start),
            pickup_end: Set(new_listing.pickup_end),
            status: Set(status::derive_status(
                new_listing.quantity,
                self.low_stock_threshold,
            )),
            latitude: Set(location.latitude()),
            longitude: Set(location.longitude()),
            version: Set(1),
            is_archived: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        let created = model.insert(&*self.db).await?;

        info!(
            "Created listing {} '{}' with {} units",
            created.id, created.name, created.quantity
        );
        self.fanout.publish(MutationEvent::listing(
            ListingChange::Inserted,
            created.clone(),
            &owner,
            None,
        ));
        Ok(created)
    }

    /// Adds `units` to a live listing.
    ///
    /// `initial_quantity` is raised by the same amount instead of keeping its
    /// creation value. That keeps `quantity <= initial_quantity` true after the
    /// restock, and it lets a cancellation return units sold from the restock.
    ///
    /// # Errors
    /// Returns `InvalidQuantity` for `units < 1`, `ListingNotFound` for unknown or
    /// archived listings and `ListingExpired` once the pickup window has closed.
    #[instrument(skip(self))]
    pub async fn restock(&self, listing_id: i64, units: i32) -> Result<listing::Model> {
        if units < 1 {
            return Err(Error::InvalidQuantity { quantity: units });
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let result = Listing::update_many()
            .col_expr(
                listing::Column::Quantity,
                Expr::col(listing::Column::Quantity).add(units),
            )
            .col_expr(
                listing::Column::InitialQuantity,
                Expr::col(listing::Column::InitialQuantity).add(units),
            )
            .col_expr(
                listing::Column::Version,
                Expr::col(listing::Column::Version).add(1),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::Id.eq(listing_id))
            .filter(listing::Column::IsArchived.eq(false))
            .filter(listing::Column::PickupEnd.gt(now))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(diagnose_unmatched(&txn, listing_id, units, now).await?);
        }

        let refreshed = get_listing_by_id(&txn, listing_id)
            .await?
            .ok_or(Error::ListingNotFound { id: listing_id })?;
        let (restocked, change) = sync_status(&txn, refreshed, self.low_stock_threshold).await?;
        let owner = business::require_business(&txn, restocked.business_id).await?;
        txn.commit().await?;

        debug!(
            "Restocked listing {} by {} to {} units",
            listing_id, units, restocked.quantity
        );
        self.fanout.publish(MutationEvent::listing(
            ListingChange::Restocked,
            restocked.clone(),
            &owner,
            change.map(|c| c.from),
        ));
        Ok(restocked)
    }

    /// Removes a listing from sale. Reservations already made are unaffected.
    #[instrument(skip(self))]
    pub async fn archive_listing(&self, listing_id: i64) -> Result<listing::Model> {
        let now = Utc::now();
        let result = Listing::update_many()
            .col_expr(listing::Column::IsArchived, Expr::value(true))
            .col_expr(
                listing::Column::Version,
                Expr::col(listing::Column::Version).add(1),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::Id.eq(listing_id))
            .filter(listing::Column::IsArchived.eq(false))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(Error::ListingNotFound { id: listing_id });
        }

        let archived = get_listing_by_id(&*self.db, listing_id)
            .await?
            .ok_or(Error::ListingNotFound { id: listing_id })?;
        let owner = business::require_business(&*self.db, archived.business_id).await?;
        info!("Archived listing {}", listing_id);
        self.fanout.publish(MutationEvent::listing(
            ListingChange::Archived,
            archived.clone(),
            &owner,
            None,
        ));
        Ok(archived)
    }

    /// Archives every listing whose pickup window closed before `now` and returns
    /// how many were archived.
    ///
    /// Housekeeping only: readers never rely on this having run, they check
    /// `pickup_end` themselves.
    #[instrument(skip(self))]
    pub async fn archive_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = Listing::find()
            .filter(listing::Column::IsArchived.eq(false))
            .filter(listing::Column::PickupEnd.lte(now))
            .all(&*self.db)
            .await?;

        let mut archived = 0;
        for row in expired {
            // a concurrent archive is fine, the listing is gone either way
            match self.archive_listing(row.id).await {
                Ok(_) => archived += 1,
                Err(Error::ListingNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if archived > 0 {
            info!("Archived {} expired listings", archived);
        }
        Ok(archived)
    }

    /// Status currently stored for a listing, for diagnostics.
    pub async fn stored_status(&self, listing_id: i64) -> Result<ListingStatus> {
        get_listing_by_id(&*self.db, listing_id)
            .await?
            .map(|l| l.status)
            .ok_or(Error::ListingNotFound { id: listing_id })
    }
}
