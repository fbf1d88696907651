//! Listing status derivation.
//!
//! Status is a pure function of the remaining quantity and the low-stock
//! threshold. Expiry is deliberately not a status: it is checked at read time by
//! every caller against `pickup_end`, so a listing stored as `active` past its
//! window is still treated as gone.

use crate::entities::{ListingStatus, listing};
use chrono::{DateTime, Utc};

/// A status change caused by a quantity change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    /// Status before the quantity change
    pub from: ListingStatus,
    /// Status after the quantity change
    pub to: ListingStatus,
}

/// Derives the display status for `quantity` remaining units.
#[must_use]
pub const fn derive_status(quantity: i32, low_stock_threshold: i32) -> ListingStatus {
    if quantity <= 0 {
        ListingStatus::SoldOut
    } else if quantity <= low_stock_threshold {
        ListingStatus::LowStock
    } else {
        ListingStatus::Active
    }
}

/// Returns the transition implied by moving to `quantity`, or `None` if the
/// status stays the same.
#[must_use]
pub fn transition(
    previous: ListingStatus,
    quantity: i32,
    low_stock_threshold: i32,
) -> Option<StatusTransition> {
    let next = derive_status(quantity, low_stock_threshold);
    (next != previous).then_some(StatusTransition {
        from: previous,
        to: next,
    })
}

/// Whether the pickup window has closed at `now`.
#[must_use]
pub fn is_expired(pickup_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= pickup_end
}

/// Whether a listing can be reserved at `now`.
#[must_use]
pub fn is_purchasable(listing: &listing::Model, now: DateTime<Utc>) -> bool {
    !listing.is_archived && !is_expired(listing.pickup_end, now) && listing.quantity > 0
}

/// Whether the stored status agrees with the stored quantity.
#[must_use]
pub fn is_consistent(listing: &listing::Model, low_stock_threshold: i32) -> bool {
    listing.status == derive_status(listing.quantity, low_stock_threshold)
}
