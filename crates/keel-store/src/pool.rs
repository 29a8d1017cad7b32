//! Standardized Postgres pool configuration.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{StoreError, StoreResult};

/// Statement deadline applied to every pooled connection.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Database pool configuration.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Maximum connection lifetime; prevents stale connections.
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 5,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Create a Postgres pool with a per-statement deadline.
pub async fn create_pool(database_url: &str, config: DbPoolConfig) -> StoreResult<PgPool> {
    info!(
        max = config.max_connections,
        min = config.min_connections,
        "Creating database pool"
    );

    let connect = PgConnectOptions::from_str(database_url)
        .map_err(|e| StoreError::Corrupt(format!("bad database url: {e}")))?
        .options([(
            "statement_timeout",
            format!("{}", STATEMENT_TIMEOUT.as_millis()),
        )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect)
        .await?;

    info!("Database pool ready");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_consistent() {
        let config = DbPoolConfig::default();
        assert!(config.min_connections <= config.max_connections);
        assert!(config.acquire_timeout < config.max_lifetime);
    }
}
