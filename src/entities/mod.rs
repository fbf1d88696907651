//! Entity module - Contains all SeaORM entity definitions for the database.
//! These entities represent the database tables and their relationships.
//! Each entity has a Model struct for data and an Entity struct for operations.

pub mod business;
pub mod favorite;
pub mod idempotency_key;
pub mod listing;
pub mod reservation;

// Re-export specific types to avoid conflicts
pub use business::{Column as BusinessColumn, Entity as Business, Model as BusinessModel};
pub use favorite::{
    Column as FavoriteColumn, Entity as Favorite, FavoriteKind, Model as FavoriteModel,
};
pub use idempotency_key::{
    Column as IdempotencyKeyColumn, Entity as IdempotencyKey, Model as IdempotencyKeyModel,
};
pub use listing::{Column as ListingColumn, Entity as Listing, ListingStatus, Model as ListingModel};
pub use reservation::{
    Column as ReservationColumn, Entity as Reservation, Model as ReservationModel,
    ReservationStatus,
};
