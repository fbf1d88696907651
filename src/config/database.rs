//! Database configuration module.
//!
//! This module handles `SQLite` database connection and table creation using `SeaORM`.
//! Tables are generated with `Schema::create_table_from_entity`, so the database
//! schema always matches the entity definitions without hand-written SQL.

use crate::entities::{Business, Favorite, IdempotencyKey, Listing, Reservation};
use crate::errors::Result;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Schema};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

/// Shared handle to the database connection pool
pub type DbPool = Arc<DatabaseConnection>;

const DEFAULT_DATABASE_URL: &str = "sqlite://data/rescue_bag.sqlite?mode=rwc";

/// Gets the database URL from environment variable or returns default `SQLite` path.
///
/// This function looks for `DATABASE_URL` in the environment and falls back to
/// a default local `SQLite` file if not found.
#[must_use]
pub fn get_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

/// Establishes a connection to the database named by `DATABASE_URL`.
///
/// Falls back to a default local `SQLite` file if no environment variable is set.
pub async fn create_connection() -> Result<DatabaseConnection> {
    let database_url = get_database_url();
    if let Some(parent) = sqlite_file_path(&database_url).and_then(Path::parent)
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Connecting to database at {}", database_url);
    Database::connect(&database_url).await.map_err(Into::into)
}

/// File path of a `sqlite://` URL, or `None` for in-memory and other databases.
fn sqlite_file_path(database_url: &str) -> Option<&Path> {
    let rest = database_url.strip_prefix("sqlite://")?;
    let path = rest.split('?').next()?;
    (!path.is_empty() && !path.contains(":memory:")).then(|| Path::new(path))
}

/// Creates all necessary database tables using `SeaORM`'s schema generation from entity definitions.
///
/// Statements use `IF NOT EXISTS`, so calling this on an initialised database is a no-op.
pub async fn create_tables(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let tables = [
        schema.create_table_from_entity(Business),
        schema.create_table_from_entity(Listing),
        schema.create_table_from_entity(Reservation),
        schema.create_table_from_entity(Favorite),
        schema.create_table_from_entity(IdempotencyKey),
    ];

    for mut table in tables {
        table.if_not_exists();
        db.execute(builder.build(&table)).await?;
    }

    info!("Database tables ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{
        business::Model as BusinessModel, favorite::Model as FavoriteModel,
        idempotency_key::Model as IdempotencyKeyModel, listing::Model as ListingModel,
        reservation::Model as ReservationModel,
    };
    use sea_orm::{EntityTrait, QuerySelect};

    #[tokio::test]
    async fn test_create_tables() -> Result<()> {
        let db = Database::connect("sqlite::memory:").await?;
        create_tables(&db).await?;

        // Test that tables exist by querying them
        let _: Vec<BusinessModel> = Business::find().limit(1).all(&db).await?;
        let _: Vec<ListingModel> = Listing::find().limit(1).all(&db).await?;
        let _: Vec<ReservationModel> = Reservation::find().limit(1).all(&db).await?;
        let _: Vec<FavoriteModel> = Favorite::find().limit(1).all(&db).await?;
        let _: Vec<IdempotencyKeyModel> = IdempotencyKey::find().limit(1).all(&db).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_create_tables_is_idempotent() -> Result<()> {
        let db = Database::connect("sqlite::memory:").await?;
        create_tables(&db).await?;
        create_tables(&db).await?;
        let _: Vec<ListingModel> = Listing::find().limit(1).all(&db).await?;
        Ok(())
    }

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite://data/rescue_bag.sqlite?mode=rwc"),
            Some(Path::new("data/rescue_bag.sqlite"))
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://localhost/db"), None);
    }
}
