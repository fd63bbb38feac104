// Postgres connection pool for the lock store.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

const APPLICATION_NAME: &str = "repomirrord";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { min_connections: 2, max_connections: 20, acquire_timeout: Duration::from_secs(10) }
    }
}

/// Open the pool and prove it with one round trip.
pub async fn create_pg_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let options = database_url
        .parse::<PgConnectOptions>()
        .context("lock store database url is not a valid PostgreSQL url")?
        .application_name(APPLICATION_NAME);
    if !transport_is_acceptable(options.get_host(), options.get_ssl_mode()) {
        bail!(
            "lock store at {} must be reached over TLS (sslmode=require, verify-ca or verify-full)",
            options.get_host()
        );
    }

    let pool = PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .context("failed to connect to the lock store database")?;
    check_pool_health(&pool).await?;
    Ok(pool)
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("lock store database did not answer a health check")?;
    Ok(())
}

/// Loopback connections may skip TLS; anything else needs a mode that
/// refuses to fall back to plaintext.
fn transport_is_acceptable(host: &str, mode: PgSslMode) -> bool {
    let loopback = matches!(host, "localhost" | "127.0.0.1" | "::1") || host.starts_with('/');
    loopback || matches!(mode, PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull)
}
