use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, PgPool};

/// Lock table schema, embedded at build time.
static LOCK_STORE_MIGRATIONS: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    LOCK_STORE_MIGRATIONS.run(pool).await.context("failed to migrate the repo_sync_locks table")
}
