/// Database configuration and connection management
pub mod database;

/// Engine, server and seed configuration loading from config.toml
pub mod settings;

pub use database::DbPool;
pub use settings::{AppConfig, BusinessSeed, EngineConfig, ServerConfig};
