// Database module for the CertHub control plane.
// Provides the connection pool and one query module per aggregate.

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod audit;
pub mod auth_tokens;
pub mod certificates;
pub mod devices;
pub mod installed_certs;
pub mod jobs;
pub mod sessions;
pub mod users;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn new(url: &str) -> Self {
        DatabaseConfig {
            url: url.to_string(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

/// Creates a database connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await
}

/// Runs database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config() {
        let config = DatabaseConfig::new("postgres://localhost/certhub");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
    }
}
