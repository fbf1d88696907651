//! Reservation entity - A claim on units of a listing, the precursor to pickup.
//!
//! Reservations are inserted by the reservation coordinator in the same
//! transaction as the quantity decrement. After that only `status` (and a single
//! post-pickup `rating`) ever change.
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a reservation
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    /// Awaiting confirmation from the payment gateway
    #[sea_orm(string_value = "pending")]
    Pending,
    /// Units are held for the user
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    /// The bag has been picked up
    #[sea_orm(string_value = "collected")]
    Collected,
    /// The reservation was cancelled and its units returned
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl ReservationStatus {
    /// Wire name of the status
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Collected => "collected",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Reservation database model
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reservations")]
pub struct Model {
    /// Unique identifier for the reservation
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Reserved listing
    pub listing_id: i64,
    /// Business owning the listing at reservation time
    pub business_id: i64,
    /// User who reserved
    pub user_id: String,
    /// Units claimed, at least one
    pub quantity_reserved: i32,
    /// Listing price per unit when the reservation was made
    pub unit_price: f64,
    /// Lifecycle status
    pub status: ReservationStatus,
    /// Optional 1-5 star rating left after collection
    pub rating: Option<i32>,
    /// When the reservation was made
    pub created_at: DateTimeUtc,
    /// When the status last changed
    pub updated_at: DateTimeUtc,
}

/// Defines relationships between Reservation and other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Each reservation belongs to one listing
    #[sea_orm(
        belongs_to = "super::listing::Entity",
        from = "Column::ListingId",
        to = "super::listing::Column::Id"
    )]
    Listing,
}

impl Related<super::listing::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Listing.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
