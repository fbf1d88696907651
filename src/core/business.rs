//! Business records and their derived counters.
//!
//! Sales and rating counters are only changed through the `*_atomic` helpers,
//! which issue single `UPDATE ... SET col = col + ?` statements and are meant to
//! run inside the same transaction as the reservation that causes them.

use crate::{
    config::BusinessSeed,
    core::geo::Coordinate,
    entities::{Business, business},
    errors::{Error, Result},
};
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::Expr};
use tracing::{info, instrument, warn};

/// Retrieves all businesses ordered alphabetically by name.
pub async fn get_all_businesses(db: &DatabaseConnection) -> Result<Vec<business::Model>> {
    Business::find()
        .order_by_asc(business::Column::Name)
        .all(db)
        .await
        .map_err(Into::into)
}

/// Finds a business by its unique ID.
pub async fn get_business_by_id<C>(db: &C, business_id: i64) -> Result<Option<business::Model>>
where
    C: ConnectionTrait,
{
    Business::find_by_id(business_id)
        .one(db)
        .await
        .map_err(Into::into)
}

/// Finds a business by its unique ID, failing with [`Error::BusinessNotFound`].
pub async fn require_business<C>(db: &C, business_id: i64) -> Result<business::Model>
where
    C: ConnectionTrait,
{
    get_business_by_id(db, business_id)
        .await?
        .ok_or(Error::BusinessNotFound { id: business_id })
}

/// Finds a business by exact name.
pub async fn get_business_by_name(
    db: &DatabaseConnection,
    name: &str,
) -> Result<Option<business::Model>> {
    Business::find()
        .filter(business::Column::Name.eq(name))
        .one(db)
        .await
        .map_err(Into::into)
}

/// Inserts a new business with zeroed counters.
///
/// # Errors
/// Returns an error if the name is blank or the insert fails.
pub async fn insert_business<C>(
    db: &C,
    name: &str,
    location: Coordinate,
) -> Result<business::Model>
where
    C: ConnectionTrait,
{
    if name.trim().is_empty() {
        return Err(Error::invalid("Business name cannot be empty"));
    }

    let now = chrono::Utc::now();
    let business = business::ActiveModel {
        name: Set(name.trim().to_string()),
        latitude: Set(location.latitude()),
        longitude: Set(location.longitude()),
        total_sales: Set(0),
        total_revenue: Set(0.0),
        average_rating: Set(0.0),
        rating_count: Set(0),
        version: Set(1),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    };
    business.insert(db).await.map_err(Into::into)
}

/// Atomically adds `units` and `revenue` (either may be negative, for a reversal)
/// to the business's sales counters.
///
/// Performs `UPDATE businesses SET total_sales = total_sales + ?, ...` rather than
/// read-modify-write, so concurrent reservations never lose updates.
pub async fn record_sale_atomic<C>(
    db: &C,
    business_id: i64,
    units: i64,
    revenue: f64,
) -> Result<business::Model>
where
    C: ConnectionTrait,
{
    let result = Business::update_many()
        .col_expr(
            business::Column::TotalSales,
            Expr::col(business::Column::TotalSales).add(units),
        )
        .col_expr(
            business::Column::TotalRevenue,
            Expr::col(business::Column::TotalRevenue).add(revenue),
        )
        .col_expr(
            business::Column::Version,
            Expr::col(business::Column::Version).add(1),
        )
        .col_expr(business::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(business::Column::Id.eq(business_id))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::BusinessNotFound { id: business_id });
    }
    require_business(db, business_id).await
}

/// Atomically folds a new `stars` rating into the running average.
pub async fn record_rating_atomic<C>(
    db: &C,
    business_id: i64,
    stars: i32,
) -> Result<business::Model>
where
    C: ConnectionTrait,
{
    // both right-hand sides read the pre-update row
    let new_average = Expr::col(business::Column::AverageRating)
        .mul(Expr::col(business::Column::RatingCount))
        .add(f64::from(stars))
        .div(Expr::col(business::Column::RatingCount).add(1));

    let result = Business::update_many()
        .col_expr(business::Column::AverageRating, new_average)
        .col_expr(
            business::Column::RatingCount,
            Expr::col(business::Column::RatingCount).add(1),
        )
        .col_expr(
            business::Column::Version,
            Expr::col(business::Column::Version).add(1),
        )
        .col_expr(business::Column::UpdatedAt, Expr::value(chrono::Utc::now()))
        .filter(business::Column::Id.eq(business_id))
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(Error::BusinessNotFound { id: business_id });
    }
    require_business(db, business_id).await
}

/// Creates configured businesses that do not exist yet, matched by name.
/// Returns how many were inserted.
#[instrument(skip(db, seeds))]
pub async fn seed_businesses(db: &DatabaseConnection, seeds: &[BusinessSeed]) -> Result<usize> {
    info!("Seeding businesses. Found {} configurations.", seeds.len());
    let mut inserted = 0;

    for seed in seeds {
        if get_business_by_name(db, seed.name.trim()).await?.is_some() {
            warn!("Business '{}' already exists. Skipping.", seed.name);
            continue;
        }
        let location = Coordinate::new(seed.latitude, seed.longitude)?;
        insert_business(db, &seed.name, location).await?;
        info!("Inserted business '{}'", seed.name);
        inserted += 1;
    }

    Ok(inserted)
}
