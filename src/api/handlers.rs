//! JSON request handlers.

use super::error::{ApiError, status_for};
use crate::{
    core::{
        business,
        discovery::{DiscoveryFilters, PickupBucket, PriceRange, RankedListing},
        favorites::FavoriteTarget,
        geo::Coordinate,
        listing::{NewListing, get_listing_by_id},
        reservation::ReserveRequest,
    },
    entities::{business as business_entity, listing, reservation},
    errors::{Error, Result},
    marketplace::Marketplace,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

const DEFAULT_RADIUS_KM: f64 = 10.0;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Body of `POST /api/purchase`
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    /// Listing to buy from
    pub listing_id: i64,
    /// Buyer
    pub user_id: String,
    /// Units wanted
    pub quantity: i32,
    /// Optional retry key
    pub idempotency_key: Option<String>,
}

/// Result of a purchase attempt
#[derive(Debug, Serialize)]
pub struct PurchaseResponse {
    /// Whether units were reserved
    pub success: bool,
    /// Reservation created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i64>,
    /// Units left on the listing afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_quantity: Option<i32>,
    /// Why the purchase failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether this replays an earlier request
    pub replayed: bool,
}

#[instrument(skip(marketplace))]
pub(crate) async fn process_purchase(
    State(marketplace): State<Marketplace>,
    Json(body): Json<PurchaseRequest>,
) -> Response {
    let request = ReserveRequest {
        listing_id: body.listing_id,
        user_id: body.user_id,
        quantity: body.quantity,
        idempotency_key: body.idempotency_key,
    };
    match marketplace.reservations.reserve(request).await {
        Ok(outcome) => Json(PurchaseResponse {
            success: true,
            reservation_id: Some(outcome.reservation.id),
            remaining_quantity: Some(outcome.remaining_quantity),
            error: None,
            replayed: outcome.replayed,
        })
        .into_response(),
        Err(e) => (
            status_for(&e),
            Json(PurchaseResponse {
                success: false,
                reservation_id: None,
                remaining_quantity: None,
                error: Some(e.to_string()),
                replayed: false,
            }),
        )
            .into_response(),
    }
}

/// Query string of `GET /api/listings`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListingsQuery {
    /// Viewer latitude
    pub lat: Option<f64>,
    /// Viewer longitude
    pub lon: Option<f64>,
    /// Search radius
    pub max_distance_km: Option<f64>,
    /// Category filter
    pub category: Option<String>,
    /// Item or business name filter
    pub search_query: Option<String>,
    /// `any`, `now` or `tomorrow`
    pub pickup: Option<String>,
    /// Include listings with no units left
    pub include_sold_out: bool,
    /// Lowest price
    pub min_price: Option<f64>,
    /// Highest price
    pub max_price: Option<f64>,
    /// Lowest business rating
    pub min_rating: Option<f64>,
    /// Viewer id, for favorite flags
    pub user_id: Option<String>,
    /// Only favorited listings
    pub favorites_only: bool,
    /// Viewer's UTC offset in minutes
    pub utc_offset_minutes: i32,
    /// Maximum results
    pub limit: Option<usize>,
}

impl ListingsQuery {
    /// Splits the query into viewer, radius and filters.
    pub fn into_parts(self) -> Result<(Coordinate, f64, DiscoveryFilters)> {
        let (Some(lat), Some(lon)) = (self.lat, self.lon) else {
            return Err(Error::invalid("lat and lon are required"));
        };
        let viewer = Coordinate::new(lat, lon)?;
        let pickup = match self.pickup.as_deref() {
            Some(bucket) => PickupBucket::parse(bucket)?,
            None => PickupBucket::Any,
        };
        let filters = DiscoveryFilters {
            category: self.category,
            search: self.search_query,
            pickup,
            include_sold_out: self.include_sold_out,
            price: PriceRange {
                min: self.min_price,
                max: self.max_price,
            },
            min_rating: self.min_rating,
            viewer_id: self.user_id,
            favorites_only: self.favorites_only,
            utc_offset_minutes: self.utc_offset_minutes,
            limit: self.limit,
        };
        Ok((
            viewer,
            self.max_distance_km.unwrap_or(DEFAULT_RADIUS_KM),
            filters,
        ))
    }
}

pub(crate) async fn get_listings_with_distance(
    State(marketplace): State<Marketplace>,
    Query(query): Query<ListingsQuery>,
) -> ApiResult<Json<Vec<RankedListing>>> {
    let (viewer, radius_km, filters) = query.into_parts()?;
    let results = marketplace
        .discover(viewer, radius_km, filters, Utc::now())
        .await?;
    Ok(Json(results))
}

pub(crate) async fn get_listing(
    State(marketplace): State<Marketplace>,
    Path(listing_id): Path<i64>,
) -> ApiResult<Json<listing::Model>> {
    let found = get_listing_by_id(marketplace.db(), listing_id)
        .await?
        .ok_or(Error::ListingNotFound { id: listing_id })?;
    Ok(Json(found))
}

/// Body of `POST /api/businesses`
#[derive(Debug, Deserialize)]
pub struct CreateBusinessRequest {
    /// Display name
    pub name: String,
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
}

pub(crate) async fn create_business(
    State(marketplace): State<Marketplace>,
    Json(body): Json<CreateBusinessRequest>,
) -> ApiResult<(StatusCode, Json<business_entity::Model>)> {
    let location = Coordinate::new(body.latitude, body.longitude)?;
    let created = marketplace
        .listings
        .create_business(&body.name, location)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub(crate) async fn get_business(
    State(marketplace): State<Marketplace>,
    Path(business_id): Path<i64>,
) -> ApiResult<Json<business_entity::Model>> {
    Ok(Json(
        business::require_business(marketplace.db(), business_id).await?,
    ))
}

/// Body of `PUT /api/businesses/{id}/location`
#[derive(Debug, Deserialize)]
pub struct LocationRequest {
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
}

pub(crate) async fn update_business_location(
    State(marketplace): State<Marketplace>,
    Path(business_id): Path<i64>,
    Json(body): Json<LocationRequest>,
) -> ApiResult<Json<business_entity::Model>> {
    let location = Coordinate::new(body.latitude, body.longitude)?;
    let moved = marketplace
        .listings
        .update_business_location(business_id, location)
        .await?;
    Ok(Json(moved))
}

/// Body of `POST /api/listings`
#[derive(Debug, Deserialize)]
pub struct CreateListingRequest {
    /// Owning business
    pub business_id: i64,
    /// Item name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Category
    pub category: String,
    /// Discounted price
    pub price: f64,
    /// Price before discount
    pub original_price: f64,
    /// Units on offer
    pub quantity: i32,
    /// Start of pickup
    pub pickup_start: DateTime<Utc>,
    /// End of pickup
    pub pickup_end: DateTime<Utc>,
    /// Pickup latitude, defaults to the business's
    pub latitude: Option<f64>,
    /// Pickup longitude, defaults to the business's
    pub longitude: Option<f64>,
}

pub(crate) async fn create_listing(
    State(marketplace): State<Marketplace>,
    Json(body): Json<CreateListingRequest>,
) -> ApiResult<(StatusCode, Json<listing::Model>)> {
    let location = match (body.latitude, body.longitude) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)?),
        (None, None) => None,
        _ => return Err(Error::invalid("latitude and longitude must be given together").into()),
    };
    let created = marketplace
        .listings
        .create_listing(NewListing {
            business_id: body.business_id,
            name: body.name,
            description: body.description,
            category: body.category,
            price: body.price,
            original_price: body.original_price,
            quantity: body.quantity,
            pickup_start: body.pickup_start,
            pickup_end: body.pickup_end,
            location,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Body of `POST /api/listings/{id}/restock`
#[derive(Debug, Deserialize)]
pub struct RestockRequest {
    /// Units to add
    pub quantity: i32,
}

pub(crate) async fn restock_listing(
    State(marketplace): State<Marketplace>,
    Path(listing_id): Path<i64>,
    Json(body): Json<RestockRequest>,
) -> ApiResult<Json<listing::Model>> {
    Ok(Json(
        marketplace
            .listings
            .restock(listing_id, body.quantity)
            .await?,
    ))
}

pub(crate) async fn archive_listing(
    State(marketplace): State<Marketplace>,
    Path(listing_id): Path<i64>,
) -> ApiResult<Json<listing::Model>> {
    Ok(Json(marketplace.listings.archive_listing(listing_id).await?))
}

pub(crate) async fn get_reservation(
    State(marketplace): State<Marketplace>,
    Path(reservation_id): Path<i64>,
) -> ApiResult<Json<reservation::Model>> {
    let found = marketplace
        .reservations
        .get_reservation(reservation_id)
        .await?
        .ok_or(Error::ReservationNotFound { id: reservation_id })?;
    Ok(Json(found))
}

pub(crate) async fn user_reservations(
    State(marketplace): State<Marketplace>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<reservation::Model>>> {
    Ok(Json(
        marketplace
            .reservations
            .reservations_for_user(&user_id)
            .await?,
    ))
}

pub(crate) async fn confirm_reservation(
    State(marketplace): State<Marketplace>,
    Path(reservation_id): Path<i64>,
) -> ApiResult<Json<reservation::Model>> {
    Ok(Json(marketplace.reservations.confirm(reservation_id).await?))
}

pub(crate) async fn collect_reservation(
    State(marketplace): State<Marketplace>,
    Path(reservation_id): Path<i64>,
) -> ApiResult<Json<reservation::Model>> {
    Ok(Json(marketplace.reservations.collect(reservation_id).await?))
}

pub(crate) async fn cancel_reservation(
    State(marketplace): State<Marketplace>,
    Path(reservation_id): Path<i64>,
) -> ApiResult<Json<reservation::Model>> {
    Ok(Json(marketplace.reservations.cancel(reservation_id).await?))
}

/// Body of `POST /api/reservations/{id}/rate`
#[derive(Debug, Deserialize)]
pub struct RateRequest {
    /// Rating user, must own the reservation
    pub user_id: String,
    /// 1-5 stars
    pub stars: i32,
}

pub(crate) async fn rate_reservation(
    State(marketplace): State<Marketplace>,
    Path(reservation_id): Path<i64>,
    Json(body): Json<RateRequest>,
) -> ApiResult<Json<reservation::Model>> {
    Ok(Json(
        marketplace
            .reservations
            .rate(reservation_id, &body.user_id, body.stars)
            .await?,
    ))
}

/// Whether a favorite write changed anything
#[derive(Debug, Serialize)]
pub struct FavoriteResponse {
    /// The favorite exists after the call
    pub favorited: bool,
    /// The call changed stored state
    pub changed: bool,
}

pub(crate) async fn add_favorite(
    State(marketplace): State<Marketplace>,
    Path((user_id, kind, target_id)): Path<(String, String, i64)>,
) -> ApiResult<Json<FavoriteResponse>> {
    let target = FavoriteTarget::parse(&kind, target_id)?;
    let changed = marketplace.favorites.add(&user_id, target).await?;
    Ok(Json(FavoriteResponse {
        favorited: true,
        changed,
    }))
}

pub(crate) async fn remove_favorite(
    State(marketplace): State<Marketplace>,
    Path((user_id, kind, target_id)): Path<(String, String, i64)>,
) -> ApiResult<Json<FavoriteResponse>> {
    let target = FavoriteTarget::parse(&kind, target_id)?;
    let changed = marketplace.favorites.remove(&user_id, target).await?;
    Ok(Json(FavoriteResponse {
        favorited: false,
        changed,
    }))
}

pub(crate) async fn check_favorite(
    State(marketplace): State<Marketplace>,
    Path((user_id, kind, target_id)): Path<(String, String, i64)>,
) -> ApiResult<Json<FavoriteResponse>> {
    let target = FavoriteTarget::parse(&kind, target_id)?;
    let favorited = marketplace.favorites.contains(&user_id, target).await?;
    Ok(Json(FavoriteResponse {
        favorited,
        changed: false,
    }))
}

pub(crate) async fn list_favorites(
    State(marketplace): State<Marketplace>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<FavoriteTarget>>> {
    Ok(Json(marketplace.favorites.list_for_user(&user_id).await?))
}
