//! HTTP front end - axum router over a shared [`Marketplace`].

pub mod error;
pub mod handlers;
pub mod realtime;

use crate::{errors::Result, marketplace::Marketplace};
use axum::{
    Router,
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Builds the application router.
pub fn router(marketplace: Marketplace) -> Router {
    Router::new()
        .route("/api/purchase", post(handlers::process_purchase))
        .route(
            "/api/listings",
            get(handlers::get_listings_with_distance).post(handlers::create_listing),
        )
        .route(
            "/api/listings/{id}",
            get(handlers::get_listing).delete(handlers::archive_listing),
        )
        .route("/api/listings/{id}/restock", post(handlers::restock_listing))
        .route("/api/businesses", post(handlers::create_business))
        .route("/api/businesses/{id}", get(handlers::get_business))
        .route(
            "/api/businesses/{id}/location",
            put(handlers::update_business_location),
        )
        .route("/api/reservations/{id}", get(handlers::get_reservation))
        .route(
            "/api/reservations/{id}/confirm",
            post(handlers::confirm_reservation),
        )
        .route(
            "/api/reservations/{id}/collect",
            post(handlers::collect_reservation),
        )
        .route(
            "/api/reservations/{id}/cancel",
            post(handlers::cancel_reservation),
        )
        .route("/api/reservations/{id}/rate", post(handlers::rate_reservation))
        .route(
            "/api/users/{user_id}/reservations",
            get(handlers::user_reservations),
        )
        .route("/api/favorites/{user_id}", get(handlers::list_favorites))
        .route(
            "/api/favorites/{user_id}/{kind}/{target_id}",
            get(handlers::check_favorite)
                .put(handlers::add_favorite)
                .delete(handlers::remove_favorite),
        )
        .route("/api/realtime", get(realtime::realtime))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(marketplace)
}

/// Serves the router on `bind_address` until ctrl-c.
pub async fn serve(marketplace: Marketplace, bind_address: &str) -> Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(marketplace))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
