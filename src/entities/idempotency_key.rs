//! Idempotency key entity - Short-lived mapping from a client request key to the
//! reservation it produced, so retried purchases replay instead of decrementing twice.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Idempotency record database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "idempotency_keys")]
pub struct Model {
    /// Client-supplied (or coordinator-generated) request key
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    /// Listing the original request targeted
    pub listing_id: i64,
    /// User of the original request
    pub user_id: String,
    /// Units of the original request
    pub quantity: i32,
    /// Reservation created by the original request
    pub reservation_id: i64,
    /// Units remaining right after the original decrement
    pub remaining_quantity: i32,
    /// When the key was recorded
    pub created_at: DateTimeUtc,
}

/// `IdempotencyKey` has no relationships with other entities
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
