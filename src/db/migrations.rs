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

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    if current_version < 4 {
        debug!("Running migration v4");
        run_migration_v4(pool).await?;
        set_schema_version(pool, 4).await?;
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

/// v1: posts, media, and comments with their indexes.
async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scraped_posts (
            post_id INTEGER PRIMARY KEY,
            post_title TEXT NOT NULL,
            community_name TEXT NOT NULL,
            community_id INTEGER NOT NULL,
            author_name TEXT NOT NULL,
            author_id INTEGER NOT NULL,
            post_created TEXT NOT NULL,
            scraped_at TEXT NOT NULL,
            had_media INTEGER NOT NULL,
            media_count INTEGER NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create scraped_posts")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scraped_media (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NOT NULL,
            post_title TEXT NOT NULL,
            community_name TEXT NOT NULL,
            community_id INTEGER NOT NULL,
            author_name TEXT NOT NULL,
            author_id INTEGER NOT NULL,
            media_url TEXT NOT NULL,
            media_hash TEXT NOT NULL UNIQUE,
            file_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            media_type TEXT NOT NULL,
            post_url TEXT NOT NULL,
            post_score INTEGER NOT NULL,
            post_created TEXT NOT NULL,
            downloaded_at TEXT NOT NULL,
            UNIQUE(post_id, media_url)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create scraped_media")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scraped_comments (
            comment_id INTEGER PRIMARY KEY,
            post_id INTEGER NOT NULL,
            creator_id INTEGER NOT NULL,
            creator_name TEXT NOT NULL,
            content TEXT NOT NULL,
            path TEXT NOT NULL,
            score INTEGER NOT NULL,
            upvotes INTEGER NOT NULL,
            downvotes INTEGER NOT NULL,
            child_count INTEGER NOT NULL,
            published TEXT NOT NULL,
            updated TEXT,
            removed INTEGER NOT NULL,
            deleted INTEGER NOT NULL,
            distinguished INTEGER NOT NULL,
            scraped_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create scraped_comments")?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_media_hash ON scraped_media(media_hash)",
        "CREATE INDEX IF NOT EXISTS idx_media_post_id ON scraped_media(post_id)",
        "CREATE INDEX IF NOT EXISTS idx_media_community ON scraped_media(community_name)",
        "CREATE INDEX IF NOT EXISTS idx_media_downloaded_at ON scraped_media(downloaded_at)",
        "CREATE INDEX IF NOT EXISTS idx_posts_community ON scraped_posts(community_name)",
        "CREATE INDEX IF NOT EXISTS idx_posts_scraped_at ON scraped_posts(scraped_at)",
        "CREATE INDEX IF NOT EXISTS idx_comments_post_id ON scraped_comments(post_id)",
        "CREATE INDEX IF NOT EXISTS idx_comments_path ON scraped_comments(path)",
    ] {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("Failed to create index")?;
    }

    Ok(())
}

/// v2: tags and tag assignments.
async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS media_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            color TEXT,
            auto_generated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create media_tags")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS media_tag_assignments (
            media_id INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            assigned_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (media_id, tag_id),
            FOREIGN KEY (media_id) REFERENCES scraped_media(id) ON DELETE CASCADE,
            FOREIGN KEY (tag_id) REFERENCES media_tags(id) ON DELETE CASCADE
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create media_tag_assignments")?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_tags_name ON media_tags(name)",
        "CREATE INDEX IF NOT EXISTS idx_tag_assignments_media ON media_tag_assignments(media_id)",
        "CREATE INDEX IF NOT EXISTS idx_tag_assignments_tag ON media_tag_assignments(tag_id)",
    ] {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("Failed to create index")?;
    }

    Ok(())
}

/// v3: thumbnails and extended metadata.
async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS media_thumbnails (
            media_id INTEGER PRIMARY KEY,
            thumbnail_path TEXT NOT NULL,
            width INTEGER,
            height INTEGER,
            generated_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (media_id) REFERENCES scraped_media(id) ON DELETE CASCADE
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create media_thumbnails")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS media_metadata (
            media_id INTEGER PRIMARY KEY,
            width INTEGER,
            height INTEGER,
            duration_seconds REAL,
            format TEXT,
            codec TEXT,
            ai_classifications TEXT,
            nsfw_score REAL,
            analyzed_at TEXT,
            FOREIGN KEY (media_id) REFERENCES scraped_media(id) ON DELETE CASCADE
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create media_metadata")?;

    Ok(())
}

/// v4: scraper run tracking.
async fn run_migration_v4(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS scraper_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL DEFAULT (datetime('now')),
            completed_at TEXT,
            posts_processed INTEGER NOT NULL DEFAULT 0,
            media_downloaded INTEGER NOT NULL DEFAULT 0,
            errors_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running'
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create scraper_runs")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started ON scraper_runs(started_at)")
        .execute(pool)
        .await
        .context("Failed to create index")?;

    Ok(())
}
