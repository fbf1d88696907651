//! Favorites ledger - users bookmarking businesses or single listings.
//!
//! Adding and removing are idempotent; the composite primary key absorbs a
//! duplicate add, so two concurrent adds of the same favorite leave one row.

use crate::{
    config::DbPool,
    core::{business, listing::get_listing_by_id},
    entities::{Favorite, FavoriteKind, favorite},
    errors::{Error, Result},
};
use chrono::Utc;
use sea_orm::{QueryOrder, Set, prelude::*, sea_query::OnConflict};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Something a user can favorite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum FavoriteTarget {
    /// A business, matching all of its listings
    Business(i64),
    /// One listing
    Listing(i64),
}

impl FavoriteTarget {
    /// Builds a target from a kind name (`"business"` / `"listing"`) and an id.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for an unknown kind.
    pub fn parse(kind: &str, id: i64) -> Result<Self> {
        match FavoriteKind::parse(kind) {
            Some(FavoriteKind::Business) => Ok(Self::Business(id)),
            Some(FavoriteKind::Listing) => Ok(Self::Listing(id)),
            None => Err(Error::invalid(format!("Unknown favorite kind '{kind}'"))),
        }
    }

    /// Kind of the target
    #[must_use]
    pub const fn kind(&self) -> FavoriteKind {
        match self {
            Self::Business(_) => FavoriteKind::Business,
            Self::Listing(_) => FavoriteKind::Listing,
        }
    }

    /// Id of the target row
    #[must_use]
    pub const fn id(&self) -> i64 {
        match self {
            Self::Business(id) | Self::Listing(id) => *id,
        }
    }

    fn from_model(model: &favorite::Model) -> Option<Self> {
        model.kind().map(|kind| match kind {
            FavoriteKind::Business => Self::Business(model.target_id),
            FavoriteKind::Listing => Self::Listing(model.target_id),
        })
    }
}

/// A user's favorites, loaded once per discovery request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FavoriteSet {
    businesses: HashSet<i64>,
    listings: HashSet<i64>,
}

impl FavoriteSet {
    /// Builds a set from targets.
    pub fn from_targets(targets: impl IntoIterator<Item = FavoriteTarget>) -> Self {
        let mut set = Self::default();
        for target in targets {
            match target {
                FavoriteTarget::Business(id) => set.businesses.insert(id),
                FavoriteTarget::Listing(id) => set.listings.insert(id),
            };
        }
        set
    }

    /// Whether a listing is favorited directly or through its business.
    #[must_use]
    pub fn covers(&self, listing_id: i64, business_id: i64) -> bool {
        self.listings.contains(&listing_id) || self.businesses.contains(&business_id)
    }

    /// Whether the set holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.businesses.is_empty() && self.listings.is_empty()
    }
}

/// Stores and answers questions about favorites.
#[derive(Debug, Clone)]
pub struct FavoritesLedger {
    db: DbPool,
}

impl FavoritesLedger {
    /// Creates a ledger over `db`.
    #[must_use]
    pub const fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Favorites `target` for `user_id`. Returns `false` if it already was.
    ///
    /// # Errors
    /// Returns an error for a blank user id or a target that does not exist.
    #[instrument(skip(self))]
    pub async fn add(&self, user_id: &str, target: FavoriteTarget) -> Result<bool> {
        let user_id = require_user(user_id)?;
        self.require_target(target).await?;

        let row = favorite::ActiveModel {
            user_id: Set(user_id.to_string()),
            target_kind: Set(target.kind().as_str().to_string()),
            target_id: Set(target.id()),
            created_at: Set(Utc::now()),
        };
        let inserted = Favorite::insert(row)
            .on_conflict(
                OnConflict::columns([
                    favorite::Column::UserId,
                    favorite::Column::TargetKind,
                    favorite::Column::TargetId,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        debug!("Favorite {:?} for {}: {} rows", target, user_id, inserted);
        Ok(inserted > 0)
    }

    /// Removes a favorite. Returns `false` if there was nothing to remove.
    #[instrument(skip(self))]
    pub async fn remove(&self, user_id: &str, target: FavoriteTarget) -> Result<bool> {
        let user_id = require_user(user_id)?;
        let result = Favorite::delete_many()
            .filter(favorite::Column::UserId.eq(user_id))
            .filter(favorite::Column::TargetKind.eq(target.kind().as_str()))
            .filter(favorite::Column::TargetId.eq(target.id()))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Whether `user_id` has favorited `target`.
    pub async fn contains(&self, user_id: &str, target: FavoriteTarget) -> Result<bool> {
        let found = Favorite::find_by_id((
            user_id.trim().to_string(),
            target.kind().as_str().to_string(),
            target.id(),
        ))
        .one(&*self.db)
        .await?;
        Ok(found.is_some())
    }

    /// Retrieves a user's favorites, most recent first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<FavoriteTarget>> {
        let rows = Favorite::find()
            .filter(favorite::Column::UserId.eq(user_id.trim()))
            .order_by_desc(favorite::Column::CreatedAt)
            .order_by_asc(favorite::Column::TargetId)
            .all(&*self.db)
            .await?;
        Ok(rows.iter().filter_map(FavoriteTarget::from_model).collect())
    }

    /// Loads a user's favorites as a lookup set.
    pub async fn favorite_set(&self, user_id: &str) -> Result<FavoriteSet> {
        Ok(FavoriteSet::from_targets(self.list_for_user(user_id).await?))
    }

    /// Users who favorited a listing directly, in id order.
    pub async fn favorited_by(&self, listing_id: i64) -> Result<Vec<String>> {
        let rows = Favorite::find()
            .filter(favorite::Column::TargetKind.eq(FavoriteKind::Listing.as_str()))
            .filter(favorite::Column::TargetId.eq(listing_id))
            .order_by_asc(favorite::Column::UserId)
            .all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(|row| row.user_id).collect())
    }

    async fn require_target(&self, target: FavoriteTarget) -> Result<()> {
        match target {
            FavoriteTarget::Business(id) => {
                business::require_business(&*self.db, id).await?;
            }
            FavoriteTarget::Listing(id) => {
                get_listing_by_id(&*self.db, id)
                    .await?
                    .ok_or(Error::ListingNotFound { id })?;
            }
        }
        Ok(())
    }
}

fn require_user(user_id: &str) -> Result<&str> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("User id cannot be empty"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            FavoriteTarget::parse("Business", 3).unwrap(),
            FavoriteTarget::Business(3)
        );
        assert_eq!(
            FavoriteTarget::parse("listing", 4).unwrap(),
            FavoriteTarget::Listing(4)
        );
        assert!(matches!(
            FavoriteTarget::parse("shop", 1).unwrap_err(),
            Error::InvalidInput { .. }
        ));
    }

    #[test]
    fn test_favorite_set_covers_business_listings() {
        let set = FavoriteSet::from_targets([
            FavoriteTarget::Business(1),
            FavoriteTarget::Listing(20),
        ]);
        assert!(set.covers(10, 1));
        assert!(set.covers(20, 2));
        assert!(!set.covers(30, 2));
        assert!(FavoriteSet::default().is_empty());
    }

    #[tokio::test]
    async fn test_add_is_idempotent() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 3).await?;

        assert!(ctx.favorites.add("alice", FavoriteTarget::Listing(listing.id)).await?);
        assert!(!ctx.favorites.add("alice", FavoriteTarget::Listing(listing.id)).await?);
        assert!(ctx.favorites.add("alice", FavoriteTarget::Business(business.id)).await?);

        let favorites = ctx.favorites.list_for_user("alice").await?;
        assert_eq!(favorites.len(), 2);
        assert!(favorites.contains(&FavoriteTarget::Listing(listing.id)));
        assert!(
            ctx.favorites
                .contains("alice", FavoriteTarget::Business(business.id))
                .await?
        );
        assert!(
            !ctx.favorites
                .contains("bob", FavoriteTarget::Business(business.id))
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_reports_change() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (_, listing) = create_listing_with_quantity(&ctx, 3).await?;
        let target = FavoriteTarget::Listing(listing.id);

        assert!(!ctx.favorites.remove("alice", target).await?);
        ctx.favorites.add("alice", target).await?;
        assert!(ctx.favorites.remove("alice", target).await?);
        assert!(!ctx.favorites.contains("alice", target).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_add_unknown_target_and_blank_user() -> Result<()> {
        let ctx = setup_marketplace().await?;
        assert!(matches!(
            ctx.favorites
                .add("alice", FavoriteTarget::Listing(5))
                .await
                .unwrap_err(),
            Error::ListingNotFound { id: 5 }
        ));
        assert!(matches!(
            ctx.favorites
                .add("alice", FavoriteTarget::Business(6))
                .await
                .unwrap_err(),
            Error::BusinessNotFound { id: 6 }
        ));
        assert!(matches!(
            ctx.favorites
                .add(" ", FavoriteTarget::Business(6))
                .await
                .unwrap_err(),
            Error::InvalidInput { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_favorited_by_lists_direct_fans() -> Result<()> {
        let ctx = setup_marketplace().await?;
        let (business, listing) = create_listing_with_quantity(&ctx, 3).await?;

        ctx.favorites
            .add("carol", FavoriteTarget::Listing(listing.id))
            .await?;
        ctx.favorites
            .add("alice", FavoriteTarget::Listing(listing.id))
            .await?;
        ctx.favorites
            .add("bob", FavoriteTarget::Business(business.id))
            .await?;

        assert_eq!(
            ctx.favorites.favorited_by(listing.id).await?,
            vec!["alice".to_string(), "carol".to_string()]
        );

        let set = ctx.favorites.favorite_set("bob").await?;
        assert!(set.covers(listing.id, business.id));
        Ok(())
    }
}
