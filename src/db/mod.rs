mod fts;
mod migrations;
mod models;
mod queries;

pub use fts::sanitize_match_query;
pub use models::*;
pub use queries::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::info;

/// Errors from catalog operations that callers must discriminate.
///
/// Anything not covered by a specific kind is carried through as a plain
/// database error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Content with this hash is already in the catalog.
    #[error("media with this content hash already exists")]
    DuplicateHash,
    /// This post already registered this media URL.
    #[error("this (post, media URL) pair already exists")]
    DuplicatePostUrl,
    /// The FTS5 subsystem did not initialize on this SQLite build.
    #[error("full-text search is not available")]
    SearchUnavailable,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    fts_available: bool,
}

impl Database {
    /// Open (creating if missing) the catalog, run migrations, and attempt
    /// to initialize the full-text index.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migrations fail. FTS
    /// initialization failure is not an error; it disables search.
    pub async fn new(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Concurrent writers (scrape loop + web API) otherwise surface
            // as immediate SQLITE_BUSY; WAL helps but writes still serialize.
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        migrations::run(&pool).await?;
        info!("Database migrations complete");

        let fts_available = fts::init(&pool).await?;
        if fts_available {
            info!("Full-text search enabled");
        }

        let db = Self {
            pool,
            fts_available,
        };
        db.verify_writable(path).await?;

        Ok(db)
    }

    async fn verify_writable(&self, path: &Path) -> Result<()> {
        // Detect deployment misconfigurations (e.g. a root-owned volume)
        // here rather than as "attempt to write a readonly database" later.
        // Beginning a transaction requires write capability on SQLite.
        let tx = self.pool.begin().await.with_context(|| {
            format!(
                "SQLite database is not writable (path: {}). Check volume mount permissions",
                path.display()
            )
        })?;

        tx.commit()
            .await
            .context("Failed to commit SQLite writability check")?;
        Ok(())
    }

    /// Whether the full-text subsystem initialized.
    #[must_use]
    pub const fn fts_available(&self) -> bool {
        self.fts_available
    }

    /// Rebuild the full-text index from the media table.
    ///
    /// # Errors
    ///
    /// Fails with `SearchUnavailable` if FTS never initialized, or with the
    /// underlying database error.
    pub async fn rebuild_search_index(&self) -> Result<()> {
        anyhow::ensure!(self.fts_available, StoreError::SearchUnavailable);
        fts::rebuild(&self.pool).await
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Pretend this SQLite build has no FTS5, for exercising the
    /// search-unavailable path.
    #[cfg(test)]
    fn with_fts_disabled(mut self) -> Self {
        self.fts_available = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_media(n: i64) -> NewMedia {
        NewMedia {
            post_id: n,
            post_title: format!("Post {n}"),
            community_name: "pics".to_string(),
            community_id: 3,
            author_name: "poster".to_string(),
            author_id: 7,
            media_url: format!("https://example.com/{n}.jpg"),
            media_hash: format!("hash-{n}"),
            file_name: format!("{n}_file.jpg"),
            file_path: format!("/tmp/media/pics/{n}_file.jpg"),
            file_size: 10,
            media_type: "image".to_string(),
            post_url: format!("https://example.com/{n}.jpg"),
            post_score: 1,
            post_created: "2024-05-01T12:00:00Z".to_string(),
        }
    }

    // An engine without FTS5: search reports unavailable, while inserts
    // and the aggregate queries keep working.
    #[tokio::test]
    async fn test_search_unavailable_without_fts() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Database::new(&temp_dir.path().join("test.sqlite"))
            .await
            .expect("database")
            .with_fts_disabled();

        for n in 1..=5 {
            save_media(db.pool(), &sample_media(n))
                .await
                .expect("insert still works without FTS");
        }

        let err = search_media(&db, "cat", 10, 0)
            .await
            .expect_err("search must report unavailable");
        assert!(matches!(err, StoreError::SearchUnavailable));

        let stats = get_stats(db.pool()).await.expect("stats");
        assert_eq!(stats.total_media, 5);
    }

    #[tokio::test]
    async fn test_rebuild_refused_without_fts() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Database::new(&temp_dir.path().join("test.sqlite"))
            .await
            .expect("database")
            .with_fts_disabled();

        let err = db.rebuild_search_index().await.expect_err("must refuse");
        assert!(err.to_string().contains("not available"));
    }
}
