//! Full-text search index over the media table.
//!
//! The index is an FTS5 virtual table kept in sync with `scraped_media` by
//! insert/update/delete triggers. FTS5 is an optional SQLite feature, so
//! initialization is allowed to fail: the store then runs with search
//! disabled and `search_media` reports it as unavailable.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Create the FTS5 table, its triggers, and backfill missing rows.
///
/// Returns `true` if the full-text subsystem is usable. Creation failures
/// are logged and reported as `false`, never propagated: the catalog must
/// stay functional on SQLite builds without FTS5.
pub async fn init(pool: &SqlitePool) -> Result<bool> {
    let created = sqlx::query(
        r"
        CREATE VIRTUAL TABLE IF NOT EXISTS media_search USING fts5(
            media_id UNINDEXED,
            post_title,
            community_name,
            creator_name,
            post_url
        )
        ",
    )
    .execute(pool)
    .await;

    if let Err(e) = created {
        warn!("FTS5 search index not available: {e}");
        warn!("Full-text search will be disabled; rebuild SQLite with FTS5 support to enable it");
        return Ok(false);
    }

    let triggers = [
        r"
        CREATE TRIGGER IF NOT EXISTS media_search_insert AFTER INSERT ON scraped_media BEGIN
            INSERT INTO media_search(rowid, media_id, post_title, community_name, creator_name, post_url)
            VALUES (new.id, new.id, new.post_title, new.community_name, new.author_name, new.post_url);
        END
        ",
        r"
        CREATE TRIGGER IF NOT EXISTS media_search_delete AFTER DELETE ON scraped_media BEGIN
            DELETE FROM media_search WHERE rowid = old.id;
        END
        ",
        r"
        CREATE TRIGGER IF NOT EXISTS media_search_update AFTER UPDATE ON scraped_media BEGIN
            UPDATE media_search
            SET post_title = new.post_title,
                community_name = new.community_name,
                creator_name = new.author_name,
                post_url = new.post_url
            WHERE rowid = new.id;
        END
        ",
    ];

    for trigger in triggers {
        if let Err(e) = sqlx::query(trigger).execute(pool).await {
            warn!("Failed to create FTS trigger: {e}");
            return Ok(false);
        }
    }

    // Backfill rows that predate the index (e.g. a database created before
    // FTS5 was available). Only missing rowids are inserted, so repeated
    // initialization is idempotent.
    let (media_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scraped_media")
        .fetch_one(pool)
        .await
        .context("Failed to count media for FTS backfill")?;

    if media_count > 0 {
        info!(media_count, "Ensuring FTS search index is populated");
        let backfilled = sqlx::query(
            r"
            INSERT INTO media_search(rowid, media_id, post_title, community_name, creator_name, post_url)
            SELECT id, id, post_title, community_name, author_name, post_url FROM scraped_media m
            WHERE NOT EXISTS (SELECT 1 FROM media_search s WHERE s.rowid = m.id)
            ",
        )
        .execute(pool)
        .await;

        if let Err(e) = backfilled {
            warn!("Failed to populate FTS index: {e}");
            return Ok(false);
        }
    }

    debug!("FTS5 search index initialized");
    Ok(true)
}

/// Drop all index rows and repopulate from the media table.
///
/// # Errors
///
/// Returns an error if the index cannot be rewritten.
pub async fn rebuild(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM media_search")
        .execute(pool)
        .await
        .context("Failed to clear FTS index")?;

    sqlx::query(
        r"
        INSERT INTO media_search(rowid, media_id, post_title, community_name, creator_name, post_url)
        SELECT id, id, post_title, community_name, author_name, post_url FROM scraped_media
        ",
    )
    .execute(pool)
    .await
    .context("Failed to repopulate FTS index")?;

    info!("FTS search index rebuilt");
    Ok(())
}

/// Sanitize a user query for safe use in an FTS5 MATCH clause.
///
/// The whole query is treated as a phrase: internal double quotes are
/// doubled and the result is wrapped in quotes, so FTS5 operator characters
/// in user input cannot change the query shape.
#[must_use]
pub fn sanitize_match_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let escaped = trimmed.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_simple() {
        assert_eq!(sanitize_match_query("cat"), "\"cat\"");
        assert_eq!(sanitize_match_query("beach sunset"), "\"beach sunset\"");
    }

    #[test]
    fn test_sanitize_quotes() {
        assert_eq!(sanitize_match_query("a \"b\" c"), "\"a \"\"b\"\" c\"");
    }

    #[test]
    fn test_sanitize_operators_are_inert() {
        assert_eq!(sanitize_match_query("cat* OR -dog"), "\"cat* OR -dog\"");
        assert_eq!(sanitize_match_query("title:cat"), "\"title:cat\"");
    }

    #[test]
    fn test_sanitize_empty_and_whitespace() {
        assert_eq!(sanitize_match_query(""), "");
        assert_eq!(sanitize_match_query("   \t"), "");
        assert_eq!(sanitize_match_query("  cat  "), "\"cat\"");
    }
}
