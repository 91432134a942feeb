use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: creating pages table");

    // new_url is present exactly when the page has a draft in the CMS.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS pages (
            original_url TEXT PRIMARY KEY NOT NULL,
            capture_url TEXT NOT NULL,
            snapshot_timestamp TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'discovered'
                CHECK (status IN ('discovered', 'fetched', 'publish_failed', 'published', 'rewritten')),
            new_url TEXT,
            cms_post_id INTEGER,
            error_detail TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            discovered_at TEXT NOT NULL DEFAULT (datetime('now')),
            last_attempt_at TEXT,
            CHECK ((status IN ('published', 'rewritten')) = (new_url IS NOT NULL))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create pages table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_status ON pages(status)")
        .execute(pool)
        .await
        .context("Failed to create pages status index")?;

    Ok(())
}
