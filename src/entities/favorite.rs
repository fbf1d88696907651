//! Favorite entity - A user's bookmark on a business or a single listing.
//!
//! The composite primary key makes a repeated favorite a no-op. `target_kind`
//! holds the wire name of a [`FavoriteKind`].

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// What kind of row a favorite points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FavoriteKind {
    /// A business
    Business,
    /// A single listing
    Listing,
}

impl FavoriteKind {
    /// Value stored in the `target_kind` column
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Listing => "listing",
        }
    }

    /// Parses a stored or user-supplied kind
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "business" => Some(Self::Business),
            "listing" => Some(Self::Listing),
            _ => None,
        }
    }
}

/// Favorite database model
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "favorites")]
pub struct Model {
    /// User who owns the favorite
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: String,
    /// Kind of the favorited row (`"business"` or `"listing"`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub target_kind: String,
    /// Id of the favorited business or listing
    #[sea_orm(primary_key, auto_increment = false)]
    pub target_id: i64,
    /// When the favorite was added
    pub created_at: DateTimeUtc,
}

impl Model {
    /// Typed view of `target_kind`
    #[must_use]
    pub fn kind(&self) -> Option<FavoriteKind> {
        FavoriteKind::parse(&self.target_kind)
    }
}

/// `Favorite` references its target loosely so that archived rows keep their history
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
