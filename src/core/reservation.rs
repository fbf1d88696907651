//! Reservation coordinator - the only consumer-side writer of listing quantity.
//!
//! A purchase is a single conditional decrement:
//! `UPDATE listings SET quantity = quantity - q ... WHERE id = ? AND quantity >= q
//!  AND pickup_end > now AND NOT is_archived`.
//! The request succeeds iff a row was affected, so two buyers racing for the last
//! unit can never both win and quantity can never go below zero. The reservation
//! row, the status re-derivation, the business counters and the idempotency
//! record are written in the same transaction. Fanout happens after commit and
//! never influences the result.

use crate::{
    config::{DbPool, EngineConfig},
    core::{
        business,
        fanout::{BusinessChange, Fanout, ListingChange, MutationEvent},
        listing::{diagnose_unmatched, get_listing_by_id, sync_status},
        status::{self, StatusTransition},
    },
    entities::{
        IdempotencyKey, Listing, ListingStatus, Reservation, ReservationStatus, business as
        business_entity, idempotency_key, listing, reservation,
    },
    errors::{Error, Result},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    DatabaseTransaction, QueryOrder, Set, SqlErr, TransactionTrait, prelude::*, sea_query::Expr,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
const RETRY_BASE_DELAY_MS: u64 = 20;

/// A request to reserve units of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    /// Listing to reserve from
    pub listing_id: i64,
    /// User making the reservation
    pub user_id: String,
    /// Units wanted, at least one
    pub quantity: i32,
    /// Client key that makes retries of this request safe
    pub idempotency_key: Option<String>,
}

impl ReserveRequest {
    /// Builds a request without an idempotency key.
    #[must_use]
    pub fn new(listing_id: i64, user_id: impl Into<String>, quantity: i32) -> Self {
        Self {
            listing_id,
            user_id: user_id.into(),
            quantity,
            idempotency_key: None,
        }
    }

    /// Attaches an idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.quantity < 1 {
            return Err(Error::InvalidQuantity {
                quantity: self.quantity,
            });
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::invalid("User id cannot be empty"));
        }
        match &self.idempotency_key {
            Some(key) if key.trim().is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN => Err(
                Error::invalid(format!(
                    "Idempotency key must be 1-{MAX_IDEMPOTENCY_KEY_LEN} characters"
                )),
            ),
            _ => Ok(()),
        }
    }
}

/// Result of a successful reservation
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationOutcome {
    /// The reservation created by this request (or by the original request on replay)
    pub reservation: reservation::Model,
    /// Units left on the listing right after the decrement
    pub remaining_quantity: i32,
    /// Listing status right after the decrement
    pub listing_status: ListingStatus,
    /// Status change caused by this decrement, if any
    pub transition: Option<StatusTransition>,
    /// Whether this is a replay of an earlier request with the same key
    pub replayed: bool,
}

/// Rows committed by a reservation, kept for announcing after commit
struct Committed {
    listing: listing::Model,
    business: business_entity::Model,
}

/// Serialises purchase attempts against listing quantity.
#[derive(Debug, Clone)]
pub struct ReservationCoordinator {
    db: DbPool,
    fanout: Fanout,
    config: Arc<EngineConfig>,
}

impl ReservationCoordinator {
    /// Creates a coordinator over `db`, announcing through `fanout`.
    #[must_use]
    pub const fn new(db: DbPool, fanout: Fanout, config: Arc<EngineConfig>) -> Self {
        Self { db, fanout, config }
    }

    /// Reserves units of a listing.
    ///
    /// Each storage attempt is bounded by the configured timeout. Transient
    /// failures are retried with the same idempotency key, so a retry either
    /// replays a committed attempt or performs the first decrement; it never
    /// decrements twice. When the caller supplies no key one is generated for
    /// the duration of this call.
    ///
    /// # Errors
    /// - `InvalidQuantity` / `InvalidInput` for malformed requests, or a key reused
    ///   with different parameters
    /// - `ListingNotFound`, `ListingExpired`, `InsufficientStock` when the
    ///   conditional decrement matches no row
    /// - `StorageUnavailable` / `Timeout` once retries are exhausted
    #[instrument(skip(self), fields(listing_id = request.listing_id, quantity = request.quantity))]
    pub async fn reserve(&self, request: ReserveRequest) -> Result<ReservationOutcome> {
        request.validate()?;
        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut attempt: u32 = 0;
        loop {
            let now = Utc::now();
            let result = match tokio::time::timeout(
                self.config.storage_timeout(),
                self.try_reserve(&request, &key, now),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    millis: self.config.storage_timeout_ms,
                }),
            };

            match result {
                Ok((outcome, committed)) => {
                    if let Some(committed) = committed {
                        self.announce_sale(&outcome, committed);
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_storage_retries => {
                    attempt += 1;
                    warn!(
                        "Reservation attempt {} for listing {} failed transiently: {}. Retrying with the same key.",
                        attempt, request.listing_id, e
                    );
                    let delay = RETRY_BASE_DELAY_MS << attempt.min(6);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    debug!("Reservation for listing {} failed: {}", request.listing_id, e);
                    return Err(e);
                }
            }
        }
    }

    async fn try_reserve(
        &self,
        request: &ReserveRequest,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<(ReservationOutcome, Option<Committed>)> {
        let txn = self.db.begin().await?;

        if let Some(outcome) = self.replay(&txn, request, key, now).await? {
            txn.commit().await?;
            return Ok((outcome, None));
        }

        let decremented = Listing::update_many()
            .col_expr(
                listing::Column::Quantity,
                Expr::col(listing::Column::Quantity).sub(request.quantity),
            )
            .col_expr(
                listing::Column::Version,
                Expr::col(listing::Column::Version).add(1),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::Id.eq(request.listing_id))
            .filter(listing::Column::IsArchived.eq(false))
            .filter(listing::Column::PickupEnd.gt(now))
            .filter(listing::Column::Quantity.gte(request.quantity))
            .exec(&txn)
            .await?;

        if decremented.rows_affected == 0 {
            let cause = diagnose_unmatched(&txn, request.listing_id, request.quantity, now).await?;
            txn.rollback().await?;
            return Err(cause);
        }

        let refreshed = get_listing_by_id(&txn, request.listing_id)
            .await?
            .ok_or(Error::ListingNotFound {
                id: request.listing_id,
            })?;
        let (updated, transition) =
            sync_status(&txn, refreshed, self.config.low_stock_threshold).await?;

        let reservation = reservation::ActiveModel {
            listing_id: Set(updated.id),
            business_id: Set(updated.business_id),
            user_id: Set(request.user_id.trim().to_string()),
            quantity_reserved: Set(request.quantity),
            unit_price: Set(updated.price),
            status: Set(ReservationStatus::Confirmed),
            rating: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let owner = business::record_sale_atomic(
            &txn,
            updated.business_id,
            i64::from(request.quantity),
            updated.price * f64::from(request.quantity),
        )
        .await?;

        let record = idempotency_key::ActiveModel {
            key: Set(key.to_string()),
            listing_id: Set(request.listing_id),
            user_id: Set(request.user_id.trim().to_string()),
            quantity: Set(request.quantity),
            reservation_id: Set(reservation.id),
            remaining_quantity: Set(updated.quantity),
            created_at: Set(now),
        };
        if let Err(e) = record.insert(&txn).await {
            return Err(match e.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => Error::DuplicateRequest {
                    key: key.to_string(),
                },
                _ => e.into(),
            });
        }

        txn.commit().await?;

        info!(
            "Reserved {} of listing {} for user {} (reservation {}, {} left)",
            request.quantity, updated.id, reservation.user_id, reservation.id, updated.quantity
        );

        let outcome = ReservationOutcome {
            remaining_quantity: updated.quantity,
            listing_status: updated.status,
            transition,
            replayed: false,
            reservation,
        };
        Ok((
            outcome,
            Some(Committed {
                listing: updated,
                business: owner,
            }),
        ))
    }

    /// Returns the original outcome if `key` was already used within its TTL.
    async fn replay(
        &self,
        txn: &DatabaseTransaction,
        request: &ReserveRequest,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReservationOutcome>> {
        let Some(record) = IdempotencyKey::find_by_id(key.to_string()).one(txn).await? else {
            return Ok(None);
        };

        if self.key_expired(&record, now) {
            debug!("Idempotency key {} expired, treating request as new", key);
            IdempotencyKey::delete_by_id(key.to_string())
                .exec(txn)
                .await?;
            return Ok(None);
        }

        if record.listing_id != request.listing_id
            || record.user_id != request.user_id.trim()
            || record.quantity != request.quantity
        {
            return Err(Error::invalid(format!(
                "Idempotency key {key} was already used for a different request"
            )));
        }

        let reservation = Reservation::find_by_id(record.reservation_id)
            .one(txn)
            .await?
            .ok_or(Error::ReservationNotFound {
                id: record.reservation_id,
            })?;

        info!(
            "Replaying reservation {} for idempotency key {}",
            reservation.id, key
        );
        Ok(Some(ReservationOutcome {
            reservation,
            remaining_quantity: record.remaining_quantity,
            listing_status: status::derive_status(
                record.remaining_quantity,
                self.config.low_stock_threshold,
            ),
            transition: None,
            replayed: true,
        }))
    }

    fn key_expired(&self, record: &idempotency_key::Model, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.config.idempotency_ttl())
            .unwrap_or(chrono::Duration::MAX);
        record
            .created_at
            .checked_add_signed(ttl)
            .is_some_and(|expiry| expiry <= now)
    }

    fn announce_sale(&self, outcome: &ReservationOutcome, committed: Committed) {
        self.fanout.publish(MutationEvent::listing(
            ListingChange::Reserved,
            committed.listing,
            &committed.business,
            outcome.transition.map(|t| t.from),
        ));
        self.fanout.publish(MutationEvent::business(
            BusinessChange::SalesUpdated,
            committed.business,
        ));
    }

    /// Moves a pending reservation to confirmed once payment is settled.
    pub async fn confirm(&self, reservation_id: i64) -> Result<reservation::Model> {
        self.move_status(
            reservation_id,
            &[ReservationStatus::Pending],
            ReservationStatus::Confirmed,
        )
        .await
    }

    /// Marks a confirmed reservation as picked up.
    pub async fn collect(&self, reservation_id: i64) -> Result<reservation::Model> {
        self.move_status(
            reservation_id,
            &[ReservationStatus::Confirmed],
            ReservationStatus::Collected,
        )
        .await
    }

    async fn move_status(
        &self,
        reservation_id: i64,
        allowed_from: &[ReservationStatus],
        to: ReservationStatus,
    ) -> Result<reservation::Model> {
        let txn = self.db.begin().await?;
        set_reservation_status(&txn, reservation_id, allowed_from, to).await?;
        let updated = require_reservation(&txn, reservation_id).await?;
        txn.commit().await?;
        info!("Reservation {} is now {}", reservation_id, to.as_str());
        Ok(updated)
    }

    /// Cancels a pending or confirmed reservation and returns its units to the
    /// listing, reversing the business's sales counters.
    #[instrument(skip(self))]
    pub async fn cancel(&self, reservation_id: i64) -> Result<reservation::Model> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        set_reservation_status(
            &txn,
            reservation_id,
            &[ReservationStatus::Pending, ReservationStatus::Confirmed],
            ReservationStatus::Cancelled,
        )
        .await?;
        let cancelled = require_reservation(&txn, reservation_id).await?;
        let units = cancelled.quantity_reserved;

        let released = Listing::update_many()
            .col_expr(
                listing::Column::Quantity,
                Expr::col(listing::Column::Quantity).add(units),
            )
            .col_expr(
                listing::Column::Version,
                Expr::col(listing::Column::Version).add(1),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(now))
            .filter(listing::Column::Id.eq(cancelled.listing_id))
            .filter(
                Expr::col(listing::Column::InitialQuantity)
                    .gte(Expr::col(listing::Column::Quantity).add(units)),
            )
            .exec(&txn)
            .await?;

        let restored = if released.rows_affected == 0 {
            warn!(
                "Listing {} cannot take back {} units from reservation {}; units not returned",
                cancelled.listing_id, units, reservation_id
            );
            None
        } else {
            let refreshed = get_listing_by_id(&txn, cancelled.listing_id)
                .await?
                .ok_or(Error::ListingNotFound {
                    id: cancelled.listing_id,
                })?;
            Some(sync_status(&txn, refreshed, self.config.low_stock_threshold).await?)
        };

        let owner = business::record_sale_atomic(
            &txn,
            cancelled.business_id,
            -i64::from(units),
            -(cancelled.unit_price * f64::from(units)),
        )
        .await?;
        txn.commit().await?;

        info!(
            "Cancelled reservation {} and released {} units of listing {}",
            reservation_id, units, cancelled.listing_id
        );
        if let Some((listing, transition)) = restored {
            self.fanout.publish(MutationEvent::listing(
                ListingChange::Released,
                listing,
                &owner,
                transition.map(|t| t.from),
            ));
        }
        self.fanout.publish(MutationEvent::business(
            BusinessChange::SalesUpdated,
            owner,
        ));
        Ok(cancelled)
    }

    /// Records a 1-5 star rating for a collected reservation and folds it into
    /// the business's average. Each reservation can be rated once, by its owner.
    #[instrument(skip(self))]
    pub async fn rate(
        &self,
        reservation_id: i64,
        user_id: &str,
        stars: i32,
    ) -> Result<reservation::Model> {
        if !(1..=5).contains(&stars) {
            return Err(Error::invalid("Rating must be between 1 and 5 stars"));
        }

        let txn = self.db.begin().await?;
        let existing = require_reservation(&txn, reservation_id).await?;
        if existing.user_id != user_id.trim() {
            return Err(Error::invalid(format!(
                "Reservation {reservation_id} does not belong to user {user_id}"
            )));
        }
        if existing.status != ReservationStatus::Collected {
            return Err(Error::InvalidTransition {
                id: reservation_id,
                from: existing.status.as_str().to_string(),
                to: "rated".to_string(),
            });
        }

        let result = Reservation::update_many()
            .col_expr(reservation::Column::Rating, Expr::value(stars))
            .col_expr(reservation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(reservation::Column::Id.eq(reservation_id))
            .filter(reservation::Column::Rating.is_null())
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(Error::invalid(format!(
                "Reservation {reservation_id} has already been rated"
            )));
        }

        let owner = business::record_rating_atomic(&txn, existing.business_id, stars).await?;
        let rated = require_reservation(&txn, reservation_id).await?;
        txn.commit().await?;

        self.fanout.publish(MutationEvent::business(
            BusinessChange::RatingUpdated,
            owner,
        ));
        Ok(rated)
    }

    /// Finds a reservation by its unique ID.
    pub async fn get_reservation(&self, reservation_id: i64) -> Result<Option<reservation::Model>> {
        Reservation::find_by_id(reservation_id)
            .one(&*self.db)
            .await
            .map_err(Into::into)
    }

    /// Retrieves a user's reservations, newest first.
    pub async fn reservations_for_user(&self, user_id: &str) -> Result<Vec<reservation::Model>> {
        Reservation::find()
            .filter(reservation::Column::UserId.eq(user_id))
            .order_by_desc(reservation::Column::CreatedAt)
            .order_by_desc(reservation::Column::Id)
            .all(&*self.db)
            .await
            .map_err(Into::into)
    }

    /// Retrieves the reservations a business has to hand out, optionally narrowed
    /// to one status, oldest first.
    pub async fn reservations_for_business(
        &self,
        business_id: i64,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<reservation::Model>> {
        let mut query = Reservation::find().filter(reservation::Column::BusinessId.eq(business_id));
        if let Some(status) = status {
            query = query.filter(reservation::Column::Status.eq(status.as_str()));
        }
        query
            .order_by_asc(reservation::Column::CreatedAt)
            .order_by_asc(reservation::Column::Id)
            .all(&*self.db)
            .await
            .map_err(Into::into)
    }

    /// Deletes idempotency records older than the configured TTL and returns how
    /// many were removed.
    pub async fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<u64> {
        let ttl = chrono::Duration::from_std(self.config.idempotency_ttl())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let result = IdempotencyKey::delete_many()
            .filter(idempotency_key::Column::CreatedAt.lte(cutoff))
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            debug!("Purged {} expired idempotency keys", result.rows_affected);
        }
        Ok(result.rows_affected)
    }
}

async fn require_reservation<C>(db: &C, reservation_id: i64) -> Result<reservation::Model>
where
    C: ConnectionTrait,
{
    Reservation::find_by_id(reservation_id)
        .one(db)
        .await?
        .ok_or(Error::ReservationNotFound { id: reservation_id })
}

/// Conditionally moves a reservation between statuses in one statement.
async fn set_reservation_status<C>(
    db: &C,
    reservation_id: i64,
    allowed_from: &[ReservationStatus],
    to: ReservationStatus,
) -> Result<()>
where
    C: ConnectionTrait,
{
    let result = Reservation::update_many()
        .col_expr(reservation::Column::Status, Expr::value(to.as_str()))
        .col_expr(reservation::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(reservation::Column::Id.eq(reservation_id))
        .filter(reservation::Column::Status.is_in(allowed_from.iter().map(|s| s.as_str())))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        let current = require_reservation(db, reservation_id).await?;
        return Err(Error::InvalidTransition {
            id: reservation_id,
            from: current.status.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    #![allow(clippy::panic)]
    use super::*;
    use crate::core::fanout::{FanoutMessage, Topic};
    use crate::test_utils::*;
    use sea_orm::{DatabaseBackend, MockDatabase};

    #[tokio::test]
    async fn test_reserve_validation_happens_before_storage() -> Result<()> {
        // an empty mock database errors on any query, so these must not reach it
        let db = MockDatabase::new(DatabaseBackend::Sqlite).into_connection();
        let coordinator = ReservationCoordinator::new(
            Arc::new(db),
            Fanout::new(4),
            Arc::new(EngineConfig::default()),
        );

        let result = coordinator.reserve(ReserveRequest::new(1, "alice", 0)).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidQuantity { quantity: 0 }
        ));

        let result = coordinator.reserve(ReserveRequest::new(1, "  ", 1)).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidInput { .. }));

        let result = coordinator
            .reserve(ReserveRequest::new(1, "alice", 1).with_idempotency_key(""))
            .await;
        assert!(matches!(result.unwrap_err(), Error::InvalidInput { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_decrements_and_records_sale() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 5).await?;

        let outcome = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 2))
            .await?;
        assert!(!outcome.replayed);
        assert_eq!(outcome.remaining_quantity, 3);
        assert_eq!(outcome.listing_status, ListingStatus::Active);
        assert_eq!(outcome.reservation.quantity_reserved, 2);
        assert_eq!(outcome.reservation.status, ReservationStatus::Confirmed);
        assert_eq!(outcome.reservation.unit_price, listing.price);

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 3);
        assert_eq!(stored.version, listing.version + 1);

        let owner = business::require_business(ctx.db(), business.id).await?;
        assert_eq!(owner.total_sales, 2);
        assert_eq!(owner.total_revenue, listing.price * 2.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_scenario_b_low_stock_after_three_sales() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;
        assert_eq!(listing.status, ListingStatus::Active);

        let mut transitions = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let outcome = ctx
                .reservations
                .reserve(ReserveRequest::new(listing.id, user, 1))
                .await?;
            transitions.push(outcome.transition);
        }

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 2);
        assert_eq!(stored.status, ListingStatus::LowStock);
        assert_eq!(transitions[0], None);
        assert_eq!(transitions[1], None);
        assert_eq!(
            transitions[2],
            Some(StatusTransition {
                from: ListingStatus::Active,
                to: ListingStatus::LowStock
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_last_unit_sells_out() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 2).await?;

        let outcome = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 2))
            .await?;
        assert_eq!(outcome.remaining_quantity, 0);
        assert_eq!(outcome.listing_status, ListingStatus::SoldOut);

        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "bob", 1))
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::InsufficientStock {
                requested: 1,
                remaining: 0
            }
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_scenario_a_two_buyers_one_unit() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 1).await?;

        let first = {
            let coordinator = ctx.reservations.clone();
            tokio::spawn(async move {
                coordinator
                    .reserve(ReserveRequest::new(listing.id, "alice", 1))
                    .await
            })
        };
        let second = {
            let coordinator = ctx.reservations.clone();
            tokio::spawn(async move {
                coordinator
                    .reserve(ReserveRequest::new(listing.id, "bob", 1))
                    .await
            })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].remaining_quantity, 0);
        let losers: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(losers.len(), 1);
        assert!(matches!(losers[0], Error::InsufficientStock { .. }));

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 0);
        assert_eq!(stored.status, ListingStatus::SoldOut);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_overselling_under_contention() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let initial = 10;
        let (business, listing) = create_listing_with_quantity(&ctx, initial).await?;

        let mut handles = Vec::new();
        for i in 0..24 {
            let coordinator = ctx.reservations.clone();
            let units = (i % 3) + 1;
            handles.push(tokio::spawn(async move {
                coordinator
                    .reserve(ReserveRequest::new(listing.id, format!("user-{i}"), units))
                    .await
            }));
        }

        let mut sold = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert!(outcome.remaining_quantity >= 0);
                    sold += outcome.reservation.quantity_reserved;
                }
                Err(Error::InsufficientStock { .. }) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        assert!(sold <= initial);
        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert!(stored.quantity >= 0);
        assert_eq!(stored.quantity, initial - sold);
        assert!(status::is_consistent(&stored, 2));

        let reservations = ctx
            .reservations
            .reservations_for_business(business.id, None)
            .await?;
        let recorded: i32 = reservations.iter().map(|r| r.quantity_reserved).sum();
        assert_eq!(recorded, sold);
        Ok(())
    }

    /// Holds the only pooled connection for `hold`, so every storage call made
    /// meanwhile has to wait for it.
    fn block_storage(
        ctx: &crate::marketplace::Marketplace,
        hold: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let marketplace = ctx.clone();
        tokio::spawn(async move {
            let txn = marketplace.db().begin().await.unwrap();
            tokio::time::sleep(hold).await;
            txn.rollback().await.unwrap();
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_attempt_is_retried_with_same_key() -> Result<()> {
        let ctx = setup_marketplace_with(EngineConfig {
            storage_timeout_ms: 100,
            max_storage_retries: 5,
            ..test_engine_config()
        })
        .await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;

        let hold = Duration::from_millis(250);
        let blocker = block_storage(&ctx, hold);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let request =
            ReserveRequest::new(listing.id, "alice", 2).with_idempotency_key("slow-1");
        let outcome = ctx.reservations.reserve(request.clone()).await?;
        // a single attempt is bounded at 100ms, so finishing after the hold
        // means at least one attempt timed out and was retried
        assert!(started.elapsed() >= hold - Duration::from_millis(20));
        blocker.await.unwrap();

        assert!(!outcome.replayed);
        assert_eq!(outcome.remaining_quantity, 3);

        let again = ctx.reservations.reserve(request).await?;
        assert!(again.replayed);
        assert_eq!(again.reservation.id, outcome.reservation.id);

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 3);
        assert_eq!(ctx.reservations.reservations_for_user("alice").await?.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_without_retries_leaves_stock_untouched() -> Result<()> {
        let ctx = setup_marketplace_with(EngineConfig {
            storage_timeout_ms: 50,
            max_storage_retries: 0,
            ..test_engine_config()
        })
        .await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;

        let blocker = block_storage(&ctx, Duration::from_millis(200));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await;
        assert!(matches!(result.unwrap_err(), Error::Timeout { millis: 50 }));
        blocker.await.unwrap();

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 5);
        assert!(ctx.reservations.reservations_for_user("alice").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_idempotent_retry_returns_same_reservation() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;
        let request = ReserveRequest::new(listing.id, "alice", 2).with_idempotency_key("req-1");

        let first = ctx.reservations.reserve(request.clone()).await?;
        let second = ctx.reservations.reserve(request).await?;

        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.reservation.id, second.reservation.id);
        assert_eq!(second.remaining_quantity, 3);

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 3);
        assert_eq!(
            ctx.reservations.reservations_for_user("alice").await?.len(),
            1
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_retries_with_same_key_decrement_once() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let coordinator = ctx.reservations.clone();
            handles.push(tokio::spawn(async move {
                coordinator
                    .reserve(
                        ReserveRequest::new(listing.id, "alice", 1).with_idempotency_key("retry"),
                    )
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap()?.reservation.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_reused_key_with_different_request_is_rejected() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;

        ctx.reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1).with_idempotency_key("k"))
            .await?;
        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 2).with_idempotency_key("k"))
            .await;
        assert!(matches!(result.unwrap_err(), Error::InvalidInput { .. }));

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_key_is_treated_as_new_request() -> Result<()> {
        let config = EngineConfig {
            idempotency_ttl_secs: 0,
            ..test_engine_config()
        };
        let ctx = setup_marketplace_with(config).await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;
        let request = ReserveRequest::new(listing.id, "alice", 1).with_idempotency_key("old");

        let first = ctx.reservations.reserve(request.clone()).await?;
        let second = ctx.reservations.reserve(request).await?;
        assert!(!second.replayed);
        assert_ne!(first.reservation.id, second.reservation.id);
        assert_eq!(second.remaining_quantity, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_scenario_d_expired_listing_cannot_be_reserved() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;
        expire_listing(ctx.db(), listing.id).await?;

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.status, ListingStatus::Active);
        assert!(stored.quantity > 0);

        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await;
        assert!(matches!(result.unwrap_err(), Error::ListingExpired { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_and_archived_listings_are_not_found() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(404, "alice", 1))
            .await;
        assert!(matches!(
            result.unwrap_err(),
            Error::ListingNotFound { id: 404 }
        ));

        let (_, listing) = create_listing_with_quantity(&ctx, 5).await?;
        ctx.listings.archive_listing(listing.id).await?;
        let result = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await;
        assert!(matches!(result.unwrap_err(), Error::ListingNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_reserve_publishes_listing_and_business_events() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 3).await?;
        let mut subscription = ctx.fanout.subscribe(Topic::Business(business.id));

        ctx.reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await?;

        match subscription.recv().await {
            FanoutMessage::Event(event) => match event.as_ref() {
                MutationEvent::Listing(e) => {
                    assert_eq!(e.change, ListingChange::Reserved);
                    assert_eq!(e.listing.quantity, 2);
                    assert_eq!(e.listing.status, ListingStatus::LowStock);
                    assert_eq!(e.previous_status, Some(ListingStatus::Active));
                }
                other => panic!("unexpected event {other:?}"),
            },
            other => panic!("unexpected message {other:?}"),
        }
        match subscription.recv().await {
            FanoutMessage::Event(event) => match event.as_ref() {
                MutationEvent::Business(e) => {
                    assert_eq!(e.change, BusinessChange::SalesUpdated);
                    assert_eq!(e.business.total_sales, 1);
                }
                other => panic!("unexpected event {other:?}"),
            },
            other => panic!("unexpected message {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_returns_units_and_reverses_sale() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 2).await?;

        let outcome = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 2))
            .await?;
        assert_eq!(outcome.listing_status, ListingStatus::SoldOut);

        let cancelled = ctx.reservations.cancel(outcome.reservation.id).await?;
        assert_eq!(cancelled.status, ReservationStatus::Cancelled);

        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 2);
        assert_eq!(stored.status, ListingStatus::LowStock);

        let owner = business::require_business(ctx.db(), business.id).await?;
        assert_eq!(owner.total_sales, 0);
        assert!(owner.total_revenue.abs() < 1e-9);

        // a second cancel is an invalid transition and returns nothing
        let result = ctx.reservations.cancel(outcome.reservation.id).await;
        assert!(matches!(result.unwrap_err(), Error::InvalidTransition { .. }));
        let stored = get_listing_by_id(ctx.db(), listing.id).await?.unwrap();
        assert_eq!(stored.quantity, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_collect_then_rate() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 3).await?;
        let outcome = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await?;
        let id = outcome.reservation.id;

        // cannot rate before pickup
        assert!(matches!(
            ctx.reservations.rate(id, "alice", 5).await.unwrap_err(),
            Error::InvalidTransition { .. }
        ));

        let collected = ctx.reservations.collect(id).await?;
        assert_eq!(collected.status, ReservationStatus::Collected);
        assert!(matches!(
            ctx.reservations.cancel(id).await.unwrap_err(),
            Error::InvalidTransition { .. }
        ));

        assert!(matches!(
            ctx.reservations.rate(id, "alice", 6).await.unwrap_err(),
            Error::InvalidInput { .. }
        ));
        assert!(matches!(
            ctx.reservations.rate(id, "mallory", 5).await.unwrap_err(),
            Error::InvalidInput { .. }
        ));

        let rated = ctx.reservations.rate(id, "alice", 4).await?;
        assert_eq!(rated.rating, Some(4));
        assert!(matches!(
            ctx.reservations.rate(id, "alice", 5).await.unwrap_err(),
            Error::InvalidInput { .. }
        ));

        let owner = business::require_business(ctx.db(), business.id).await?;
        assert_eq!(owner.rating_count, 1);
        assert_eq!(owner.average_rating, 4.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_confirm_requires_pending() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 3).await?;
        let outcome = ctx
            .reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1))
            .await?;

        let result = ctx.reservations.confirm(outcome.reservation.id).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::InvalidTransition { ref from, .. } if from == "confirmed"
        ));
        assert!(matches!(
            ctx.reservations.confirm(999).await.unwrap_err(),
            Error::ReservationNotFound { id: 999 }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_expired_keys() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 3).await?;
        ctx.reservations
            .reserve(ReserveRequest::new(listing.id, "alice", 1).with_idempotency_key("a"))
            .await?;

        assert_eq!(ctx.reservations.purge_expired_keys(Utc::now()).await?, 0);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(ctx.reservations.purge_expired_keys(later).await?, 1);
        Ok(())
    }
}
