//! Shared test utilities for `RescueBag`.
//!
//! This module provides common helper functions for setting up test databases
//! and creating test entities with sensible defaults.

use crate::{
    config::{EngineConfig, database::create_tables},
    core::{business, geo::Coordinate, listing::NewListing},
    entities::{Listing, ListingStatus, business as business_entity, listing},
    errors::Result,
    marketplace::Marketplace,
};
use chrono::{Duration, Utc};
use sea_orm::{ConnectOptions, Database, DatabaseConnection, prelude::*, sea_query::Expr};

/// Default location of test businesses and listings
pub const TEST_LATITUDE: f64 = -1.2921;
/// Default location of test businesses and listings
pub const TEST_LONGITUDE: f64 = 36.8219;

const KM_PER_DEGREE: f64 = crate::core::geo::EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// Creates an in-memory `SQLite` database with all tables initialized.
/// This is the standard setup for all integration tests.
///
/// The pool holds exactly one connection, since every `SQLite` memory
/// connection is its own database.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let mut options = ConnectOptions::new("sqlite::memory:");
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    create_tables(&db).await?;
    Ok(db)
}

/// Engine settings for tests: default thresholds, generous storage bounds so
/// contention tests queue instead of timing out.
#[must_use]
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        storage_timeout_ms: 10_000,
        max_storage_retries: 5,
        ..EngineConfig::default()
    }
}

/// Sets up a marketplace over a fresh test database.
pub async fn setup_marketplace() -> Result<Marketplace> {
    setup_marketplace_with(test_engine_config()).await
}

/// Sets up a marketplace with custom engine settings.
pub async fn setup_marketplace_with(config: EngineConfig) -> Result<Marketplace> {
    let db = setup_test_db().await?;
    Ok(Marketplace::new(db, config))
}

/// Creates a test business at the default test location.
pub async fn create_test_business(
    db: &DatabaseConnection,
    name: &str,
) -> Result<business_entity::Model> {
    business::insert_business(db, name, Coordinate::new(TEST_LATITUDE, TEST_LONGITUDE)?).await
}

/// Builds listing input with sensible defaults.
///
/// # Defaults
/// * name: "Surprise Bag", category: "Bakery"
/// * price: 4.0, original price: 12.0
/// * pickup window: started 30 minutes ago, ends in 2 hours
/// * location: the business's
#[must_use]
pub fn new_listing_input(business_id: i64, quantity: i32) -> NewListing {
    let now = Utc::now();
    NewListing {
        business_id,
        name: "Surprise Bag".to_string(),
        description: "Assorted pastries from today".to_string(),
        category: "Bakery".to_string(),
        price: 4.0,
        original_price: 12.0,
        quantity,
        pickup_start: now - Duration::minutes(30),
        pickup_end: now + Duration::hours(2),
        location: None,
    }
}

/// Creates a business and one listing with `quantity` units.
/// Returns (business, listing).
pub async fn create_listing_with_quantity(
    ctx: &Marketplace,
    quantity: i32,
) -> Result<(business_entity::Model, listing::Model)> {
    let business = create_test_business(ctx.db(), "Test Bakery").await?;
    let listing = ctx
        .listings
        .create_listing(new_listing_input(business.id, quantity))
        .await?;
    Ok((business, listing))
}

/// Creates a listing with five units at `location`.
pub async fn create_listing_at(
    ctx: &Marketplace,
    business_id: i64,
    location: Coordinate,
) -> Result<listing::Model> {
    let mut input = new_listing_input(business_id, 5);
    input.location = Some(location);
    ctx.listings.create_listing(input).await
}

/// The point `km` kilometres due north of `origin`.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn north_of(origin: Coordinate, km: f64) -> Coordinate {
    Coordinate::new(origin.latitude() + km / KM_PER_DEGREE, origin.longitude()).unwrap()
}

/// A point roughly `km` kilometres due east of `origin`.
#[must_use]
#[allow(clippy::unwrap_used)]
pub fn east_of(origin: Coordinate, km: f64) -> Coordinate {
    let degrees = km / (KM_PER_DEGREE * origin.latitude().to_radians().cos());
    Coordinate::new(origin.latitude(), origin.longitude() + degrees).unwrap()
}

/// Overwrites a listing's quantity and stored status directly.
pub async fn set_quantity(
    db: &DatabaseConnection,
    listing_id: i64,
    quantity: i32,
    status: ListingStatus,
) -> Result<()> {
    Listing::update_many()
        .col_expr(listing::Column::Quantity, Expr::value(quantity))
        .col_expr(listing::Column::Status, Expr::value(status.as_str()))
        .filter(listing::Column::Id.eq(listing_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Moves a listing's pickup window into the past without touching its status.
pub async fn expire_listing(db: &DatabaseConnection, listing_id: i64) -> Result<()> {
    let now = Utc::now();
    Listing::update_many()
        .col_expr(
            listing::Column::PickupStart,
            Expr::value(now - Duration::hours(3)),
        )
        .col_expr(
            listing::Column::PickupEnd,
            Expr::value(now - Duration::minutes(1)),
        )
        .filter(listing::Column::Id.eq(listing_id))
        .exec(db)
        .await?;
    Ok(())
}

/// An unsaved business model, for pure tests.
#[must_use]
pub fn sample_business(id: i64) -> business_entity::Model {
    let now = Utc::now();
    business_entity::Model {
        id,
        name: format!("Business {id}"),
        latitude: TEST_LATITUDE,
        longitude: TEST_LONGITUDE,
        total_sales: 0,
        total_revenue: 0.0,
        average_rating: 4.5,
        rating_count: 2,
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

/// An unsaved listing model with five units at the test location, for pure tests.
#[must_use]
pub fn sample_listing(id: i64, business_id: i64) -> listing::Model {
    let now = Utc::now();
    listing::Model {
        id,
        business_id,
        name: "Surprise Bag".to_string(),
        description: "Assorted pastries from today".to_string(),
        category: "bakery".to_string(),
        price: 4.0,
        original_price: 12.0,
        quantity: 5,
        initial_quantity: 5,
        pickup_start: now - Duration::minutes(30),
        pickup_end: now + Duration::hours(2),
        status: ListingStatus::Active,
        latitude: TEST_LATITUDE,
        longitude: TEST_LONGITUDE,
        version: 1,
        is_archived: false,
        created_at: now,
        updated_at: now,
    }
}
