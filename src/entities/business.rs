//! Business entity - A shop or restaurant that lists surplus food.
//!
//! The sales and rating counters are derived values. They are only changed by
//! atomic column expressions inside reservation transactions, never set directly.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Business database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "businesses")]
pub struct Model {
    /// Unique identifier for the business
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Display name (e.g., "Corner Bakery")
    pub name: String,
    /// Latitude in decimal degrees
    pub latitude: f64,
    /// Longitude in decimal degrees
    pub longitude: f64,
    /// Units sold across all listings
    pub total_sales: i64,
    /// Revenue across all listings
    pub total_revenue: f64,
    /// Mean of all ratings received, 0.0 when unrated
    pub average_rating: f64,
    /// Number of ratings received
    pub rating_count: i64,
    /// Incremented on every write
    pub version: i64,
    /// When the business was created
    pub created_at: DateTimeUtc,
    /// When the business was last modified
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Business and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// One business has many listings
    #[sea_orm(has_many = "super::listing::Entity")]
    Listings,
}

impl Related<super::listing::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Listings.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
