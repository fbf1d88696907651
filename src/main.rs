use dotenvy::dotenv;
use rescue_bag::{
    api,
    config::{database, settings},
    core::business,
    errors::Result,
    marketplace::Marketplace,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize tracing (as early as possible)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load .env file; env vars can also be set externally
    dotenv().ok();
    info!("Attempted to load .env file.");

    // 3. Load the application configuration
    let app_config = settings::load_default_config()
        .inspect_err(|e| error!("Failed to load configuration: {}", e))?;
    info!("Successfully processed application configuration.");

    // 4. Initialize database
    let db = database::create_connection()
        .await
        .inspect_err(|e| error!("Failed to connect to database: {}", e))?;
    database::create_tables(&db)
        .await
        .inspect(|()| info!("Database initialized successfully."))
        .inspect_err(|e| error!("Failed to initialize database: {}", e))?;

    // 5. Seed configured businesses
    business::seed_businesses(&db, &app_config.businesses)
        .await
        .inspect(|count| info!("Seeded {} businesses.", count))
        .inspect_err(|e| error!("Failed to seed businesses: {}", e))?;

    // 6. Start housekeeping and serve
    let marketplace = Marketplace::new(db, app_config.engine);
    let sweeper = marketplace.spawn_sweeper(app_config.server.sweep_interval());

    let served = api::serve(marketplace, &app_config.server.bind_address).await;
    sweeper.abort();
    served.inspect_err(|e| error!("Server stopped with error: {}", e))
}
