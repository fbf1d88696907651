//! Listing entity - A discounted, quantity-bounded, time-boxed mystery bag.
//!
//! `quantity` is only ever changed through conditional, single-statement updates
//! (see `core::reservation` and `core::listing`). `status` is derived from
//! `quantity` and is rewritten in the same transaction as every quantity change.
//! Expiry is not stored: readers compare `pickup_end` with the current time.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Display status of a listing, derived from the remaining quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    /// More units left than the low-stock threshold
    #[sea_orm(string_value = "active")]
    Active,
    /// Between one unit and the low-stock threshold left
    #[sea_orm(string_value = "low-stock")]
    LowStock,
    /// Nothing left
    #[sea_orm(string_value = "sold-out")]
    SoldOut,
}

impl ListingStatus {
    /// Wire name of the status
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::LowStock => "low-stock",
            Self::SoldOut => "sold-out",
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "listings")]
pub struct Model {
    /// Unique identifier for the listing
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Owning business
    pub business_id: i64,
    /// Item name shown to consumers (e.g., "Bakery surprise bag")
    pub name: String,
    /// Free-form description of what the bag may contain
    pub description: String,
    /// Food category used by discovery filters (e.g., "bakery", "meals")
    pub category: String,
    /// Discounted price
    pub price: f64,
    /// Price before discount, never below `price`
    pub original_price: f64,
    /// Units currently available
    pub quantity: i32,
    /// Units ever offered: the creation quantity plus every restock. Never
    /// below `quantity`
    pub initial_quantity: i32,
    /// Start of the pickup window
    pub pickup_start: DateTimeUtc,
    /// End of the pickup window; the listing is expired from this instant on
    pub pickup_end: DateTimeUtc,
    /// Stored display status
    pub status: ListingStatus,
    /// Pickup latitude in decimal degrees
    pub latitude: f64,
    /// Pickup longitude in decimal degrees
    pub longitude: f64,
    /// Incremented on every write, used by clients to discard stale events
    pub version: i64,
    /// Soft delete flag, set by the business or by the expiry sweeper
    pub is_archived: bool,
    /// When the listing was created
    pub created_at: DateTimeUtc,
    /// When the listing was last modified
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Listing and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each listing belongs to one business
    #[sea_orm(
        belongs_to = "super::business::Entity",
        from = "Column::BusinessId",
        to = "super::business::Column::Id"
    )]
    Business,
    /// One listing has many reservations
    #[sea_orm(has_many = "super::reservation::Entity")]
    Reservations,
}

impl Related<super::business::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Business.def()
    }
}

impl Related<super::reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
