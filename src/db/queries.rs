use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{
    CommentRecord, CommunityCount, CreatorStat, MediaFilter, MediaMetadata, MediaRecord,
    NewMedia, NewMetadata, PostRecord, RunStatus, ScraperRun, StatsSummary, StorageBreakdown,
    StorageBucket, Tag, ThumbnailRecord, TimelineBucket, TimelinePeriod, TypeCount,
    UntaggedImage,
};
use super::{fts, Database, StoreError};
use crate::lemmy::{CommentView, PostView};

/// Sort fields allowed in media listing queries. Anything else is coerced
/// to download time rather than interpolated into SQL.
const ALLOWED_SORT_FIELDS: &[&str] = &["downloaded_at", "post_created", "file_size", "post_score"];

// ========== Posts ==========

/// Check whether a post has already been observed.
pub async fn post_exists(pool: &SqlitePool, post_id: i64) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM scraped_posts WHERE post_id = ?)")
            .bind(post_id)
            .fetch_one(pool)
            .await
            .context("Failed to check post existence")?;
    Ok(exists)
}

/// Record that a post has been processed, with or without media.
///
/// Idempotent: re-observation overwrites the media counters but never
/// creates a second row.
pub async fn mark_post_scraped(pool: &SqlitePool, post: &PostView, media_count: i64) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR REPLACE INTO scraped_posts (
            post_id, post_title, community_name, community_id,
            author_name, author_id, post_created, scraped_at,
            had_media, media_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'), ?, ?)
        ",
    )
    .bind(post.post.id)
    .bind(&post.post.name)
    .bind(&post.community.name)
    .bind(post.community.id)
    .bind(&post.creator.name)
    .bind(post.creator.id)
    .bind(&post.post.published)
    .bind(media_count > 0)
    .bind(media_count)
    .execute(pool)
    .await
    .context("Failed to mark post as scraped")?;

    Ok(())
}

pub async fn get_post(pool: &SqlitePool, post_id: i64) -> Result<Option<PostRecord>> {
    sqlx::query_as("SELECT * FROM scraped_posts WHERE post_id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post")
}

pub async fn count_posts(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scraped_posts")
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;
    Ok(count)
}

// ========== Media ==========

/// Check whether content with this hash is already in the catalog.
pub async fn media_exists(pool: &SqlitePool, hash: &str) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM scraped_media WHERE media_hash = ?)")
            .bind(hash)
            .fetch_one(pool)
            .await
            .context("Failed to check media existence")?;
    Ok(exists)
}

/// Insert a new media row, returning its surrogate id.
///
/// # Errors
///
/// `DuplicateHash` when the content hash is already present,
/// `DuplicatePostUrl` when this post already registered this URL.
pub async fn save_media(pool: &SqlitePool, media: &NewMedia) -> Result<i64, StoreError> {
    let result = sqlx::query(
        r"
        INSERT INTO scraped_media (
            post_id, post_title, community_name, community_id,
            author_name, author_id, media_url, media_hash,
            file_name, file_path, file_size, media_type,
            post_url, post_score, post_created, downloaded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
        ",
    )
    .bind(media.post_id)
    .bind(&media.post_title)
    .bind(&media.community_name)
    .bind(media.community_id)
    .bind(&media.author_name)
    .bind(media.author_id)
    .bind(&media.media_url)
    .bind(&media.media_hash)
    .bind(&media.file_name)
    .bind(&media.file_path)
    .bind(media.file_size)
    .bind(&media.media_type)
    .bind(&media.post_url)
    .bind(media.post_score)
    .bind(&media.post_created)
    .execute(pool)
    .await
    .map_err(map_media_unique_violation)?;

    Ok(result.last_insert_rowid())
}

/// Map a UNIQUE constraint violation on the media table to its error kind.
fn map_media_unique_violation(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message();
        if message.contains("scraped_media.media_hash") {
            return StoreError::DuplicateHash;
        }
        if message.contains("scraped_media.post_id") && message.contains("scraped_media.media_url")
        {
            return StoreError::DuplicatePostUrl;
        }
    }
    StoreError::Database(err)
}

pub async fn get_media_by_hash(pool: &SqlitePool, hash: &str) -> Result<Option<MediaRecord>> {
    sqlx::query_as("SELECT * FROM scraped_media WHERE media_hash = ?")
        .bind(hash)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch media by hash")
}

pub async fn get_media_by_id(pool: &SqlitePool, id: i64) -> Result<Option<MediaRecord>> {
    sqlx::query_as("SELECT * FROM scraped_media WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch media by id")
}

/// Look up the media a post already registered for a source URL.
pub async fn get_media_by_post_and_url(
    pool: &SqlitePool,
    post_id: i64,
    media_url: &str,
) -> Result<Option<MediaRecord>> {
    sqlx::query_as("SELECT * FROM scraped_media WHERE post_id = ? AND media_url = ?")
        .bind(post_id)
        .bind(media_url)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch media by post and URL")
}

/// List media with optional community/kind filters, a whitelisted sort, and
/// pagination. Returns the page of rows plus the unpaginated total.
pub async fn get_media_with_filters(
    pool: &SqlitePool,
    filter: &MediaFilter,
) -> Result<(Vec<MediaRecord>, i64)> {
    let mut clauses: Vec<&str> = Vec::new();
    if filter.community.is_some() {
        clauses.push("community_name = ?");
    }
    if filter.media_type.is_some() {
        clauses.push("media_type = ?");
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) FROM scraped_media{where_clause}");
    let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
    if let Some(community) = &filter.community {
        count_query = count_query.bind(community);
    }
    if let Some(media_type) = &filter.media_type {
        count_query = count_query.bind(media_type);
    }
    let (total,) = count_query
        .fetch_one(pool)
        .await
        .context("Failed to count filtered media")?;

    let sort_by = if ALLOWED_SORT_FIELDS.contains(&filter.sort_by.as_str()) {
        filter.sort_by.as_str()
    } else {
        "downloaded_at"
    };
    let sort_order = if filter.sort_order == "ASC" { "ASC" } else { "DESC" };

    let rows_sql = format!(
        "SELECT * FROM scraped_media{where_clause} ORDER BY {sort_by} {sort_order} LIMIT ? OFFSET ?"
    );
    let mut rows_query = sqlx::query_as::<_, MediaRecord>(&rows_sql);
    if let Some(community) = &filter.community {
        rows_query = rows_query.bind(community);
    }
    if let Some(media_type) = &filter.media_type {
        rows_query = rows_query.bind(media_type);
    }
    let rows = rows_query
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await
        .context("Failed to query filtered media")?;

    Ok((rows, total))
}

/// Full-text search across media, ranked by FTS5 relevance.
///
/// # Errors
///
/// `SearchUnavailable` when the full-text subsystem did not initialize.
pub async fn search_media(
    db: &Database,
    query: &str,
    limit: i64,
    offset: i64,
) -> Result<(Vec<MediaRecord>, i64), StoreError> {
    if !db.fts_available() {
        return Err(StoreError::SearchUnavailable);
    }

    let match_query = fts::sanitize_match_query(query);
    if match_query.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM media_search WHERE media_search MATCH ?")
            .bind(&match_query)
            .fetch_one(db.pool())
            .await?;

    let rows = sqlx::query_as(
        r"
        SELECT m.* FROM scraped_media m
        INNER JOIN media_search s ON m.id = s.rowid
        WHERE media_search MATCH ?
        ORDER BY s.rank
        LIMIT ? OFFSET ?
        ",
    )
    .bind(&match_query)
    .bind(limit)
    .bind(offset)
    .fetch_all(db.pool())
    .await?;

    Ok((rows, total))
}

// ========== Comments ==========

/// Upsert a comment by its id.
pub async fn save_comment(pool: &SqlitePool, comment: &CommentView) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR REPLACE INTO scraped_comments (
            comment_id, post_id, creator_id, creator_name, content, path,
            score, upvotes, downvotes, child_count, published, updated,
            removed, deleted, distinguished, scraped_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
        ",
    )
    .bind(comment.comment.id)
    .bind(comment.comment.post_id)
    .bind(comment.creator.id)
    .bind(&comment.creator.name)
    .bind(&comment.comment.content)
    .bind(&comment.comment.path)
    .bind(comment.counts.score)
    .bind(comment.counts.upvotes)
    .bind(comment.counts.downvotes)
    .bind(comment.counts.child_count)
    .bind(&comment.comment.published)
    .bind(&comment.comment.updated)
    .bind(comment.comment.removed)
    .bind(comment.comment.deleted)
    .bind(comment.comment.distinguished)
    .execute(pool)
    .await
    .context("Failed to save comment")?;

    Ok(())
}

/// Whether any comments have been stored for a post.
pub async fn comments_exist_for_post(pool: &SqlitePool, post_id: i64) -> Result<bool> {
    let (exists,): (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM scraped_comments WHERE post_id = ? LIMIT 1)")
            .bind(post_id)
            .fetch_one(pool)
            .await
            .context("Failed to check comments existence")?;
    Ok(exists)
}

/// Comments for a post in thread order, excluding removed and deleted rows.
pub async fn get_comments_for_post(
    pool: &SqlitePool,
    post_id: i64,
) -> Result<Vec<CommentRecord>> {
    sqlx::query_as(
        r"
        SELECT * FROM scraped_comments
        WHERE post_id = ? AND removed = 0 AND deleted = 0
        ORDER BY path ASC
        ",
    )
    .bind(post_id)
    .fetch_all(pool)
    .await
    .context("Failed to query comments")
}

// ========== Stats & aggregations ==========

pub async fn get_stats(pool: &SqlitePool) -> Result<StatsSummary> {
    let (total_media,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scraped_media")
        .fetch_one(pool)
        .await
        .context("Failed to count media")?;

    let (total_posts,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM scraped_posts")
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;

    let (total_size_bytes,): (i64,) =
        sqlx::query_as("SELECT COALESCE(SUM(file_size), 0) FROM scraped_media")
            .fetch_one(pool)
            .await
            .context("Failed to sum media size")?;

    let by_type: Vec<TypeCount> = sqlx::query_as(
        "SELECT media_type, COUNT(*) as count FROM scraped_media GROUP BY media_type",
    )
    .fetch_all(pool)
    .await
    .context("Failed to get media type counts")?;

    let top_communities: Vec<CommunityCount> = sqlx::query_as(
        r"
        SELECT community_name, COUNT(*) as count
        FROM scraped_media
        GROUP BY community_name
        ORDER BY count DESC
        LIMIT 10
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to get community counts")?;

    Ok(StatsSummary {
        total_media,
        total_posts,
        total_size_bytes,
        by_type,
        top_communities,
    })
}

/// Download counts and byte totals bucketed by period, newest first.
pub async fn get_timeline(
    pool: &SqlitePool,
    period: TimelinePeriod,
) -> Result<Vec<TimelineBucket>> {
    // The group expression comes from a closed enum, not user input.
    let sql = format!(
        r"
        SELECT {expr} as period,
               COUNT(*) as count,
               COALESCE(SUM(file_size), 0) as total_bytes
        FROM scraped_media
        GROUP BY period
        ORDER BY period DESC
        LIMIT 100
        ",
        expr = period.group_expr()
    );

    sqlx::query_as(&sql)
        .fetch_all(pool)
        .await
        .context("Failed to query timeline")
}

pub async fn get_top_creators(pool: &SqlitePool, limit: i64) -> Result<Vec<CreatorStat>> {
    sqlx::query_as(
        r"
        SELECT author_name,
               COUNT(*) as media_count,
               COALESCE(SUM(post_score), 0) as total_score,
               MAX(downloaded_at) as last_download
        FROM scraped_media
        GROUP BY author_name
        ORDER BY media_count DESC
        LIMIT ?
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to query top creators")
}

pub async fn get_storage_breakdown(pool: &SqlitePool) -> Result<StorageBreakdown> {
    let by_community: Vec<StorageBucket> = sqlx::query_as(
        r"
        SELECT community_name as name, COUNT(*) as count,
               COALESCE(SUM(file_size), 0) as total_bytes
        FROM scraped_media
        GROUP BY community_name
        ORDER BY total_bytes DESC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to query community storage breakdown")?;

    let by_type: Vec<StorageBucket> = sqlx::query_as(
        r"
        SELECT media_type as name, COUNT(*) as count,
               COALESCE(SUM(file_size), 0) as total_bytes
        FROM scraped_media
        GROUP BY media_type
        ORDER BY total_bytes DESC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to query type storage breakdown")?;

    Ok(StorageBreakdown {
        by_community,
        by_type,
    })
}

/// Communities with their media counts, busiest first.
pub async fn get_communities(pool: &SqlitePool) -> Result<Vec<CommunityCount>> {
    sqlx::query_as(
        r"
        SELECT community_name, COUNT(*) as count
        FROM scraped_media
        GROUP BY community_name
        ORDER BY count DESC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to query communities")
}

// ========== Tags ==========

pub async fn create_tag(
    pool: &SqlitePool,
    name: &str,
    color: &str,
    auto_generated: bool,
) -> Result<i64> {
    let result = sqlx::query("INSERT INTO media_tags (name, color, auto_generated) VALUES (?, ?, ?)")
        .bind(name)
        .bind(color)
        .bind(auto_generated)
        .execute(pool)
        .await
        .context("Failed to create tag")?;

    Ok(result.last_insert_rowid())
}

pub async fn get_tag_by_id(pool: &SqlitePool, tag_id: i64) -> Result<Option<Tag>> {
    sqlx::query_as("SELECT * FROM media_tags WHERE id = ?")
        .bind(tag_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch tag")
}

pub async fn get_tag_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Tag>> {
    sqlx::query_as("SELECT * FROM media_tags WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch tag by name")
}

pub async fn get_all_tags(pool: &SqlitePool) -> Result<Vec<Tag>> {
    sqlx::query_as("SELECT * FROM media_tags ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("Failed to query tags")
}

pub async fn delete_tag(pool: &SqlitePool, tag_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM media_tags WHERE id = ?")
        .bind(tag_id)
        .execute(pool)
        .await
        .context("Failed to delete tag")?;
    Ok(())
}

/// Assign a tag to a media item. Re-assignment is a no-op.
pub async fn assign_tag(pool: &SqlitePool, media_id: i64, tag_id: i64) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO media_tag_assignments (media_id, tag_id) VALUES (?, ?)")
        .bind(media_id)
        .bind(tag_id)
        .execute(pool)
        .await
        .context("Failed to assign tag")?;
    Ok(())
}

pub async fn unassign_tag(pool: &SqlitePool, media_id: i64, tag_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM media_tag_assignments WHERE media_id = ? AND tag_id = ?")
        .bind(media_id)
        .bind(tag_id)
        .execute(pool)
        .await
        .context("Failed to unassign tag")?;
    Ok(())
}

pub async fn get_tags_for_media(pool: &SqlitePool, media_id: i64) -> Result<Vec<Tag>> {
    sqlx::query_as(
        r"
        SELECT t.* FROM media_tags t
        INNER JOIN media_tag_assignments a ON t.id = a.tag_id
        WHERE a.media_id = ?
        ORDER BY t.name ASC
        ",
    )
    .bind(media_id)
    .fetch_all(pool)
    .await
    .context("Failed to query tags for media")
}

/// Image media with no tag assignments, newest downloads first.
pub async fn get_untagged_images(pool: &SqlitePool) -> Result<Vec<UntaggedImage>> {
    sqlx::query_as(
        r"
        SELECT m.id, m.file_path, m.post_title, m.community_name
        FROM scraped_media m
        LEFT JOIN media_tag_assignments a ON m.id = a.media_id
        WHERE a.media_id IS NULL AND m.media_type = 'image'
        ORDER BY m.downloaded_at DESC
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to query untagged images")
}

// ========== Thumbnails & metadata ==========

pub async fn save_thumbnail(
    pool: &SqlitePool,
    media_id: i64,
    thumbnail_path: &str,
    width: u32,
    height: u32,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR REPLACE INTO media_thumbnails (media_id, thumbnail_path, width, height, generated_at)
        VALUES (?, ?, ?, ?, datetime('now'))
        ",
    )
    .bind(media_id)
    .bind(thumbnail_path)
    .bind(width)
    .bind(height)
    .execute(pool)
    .await
    .context("Failed to save thumbnail")?;
    Ok(())
}

pub async fn get_thumbnail(pool: &SqlitePool, media_id: i64) -> Result<Option<ThumbnailRecord>> {
    sqlx::query_as("SELECT * FROM media_thumbnails WHERE media_id = ?")
        .bind(media_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch thumbnail")
}

pub async fn save_metadata(
    pool: &SqlitePool,
    media_id: i64,
    metadata: &NewMetadata,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR REPLACE INTO media_metadata
            (media_id, width, height, duration_seconds, format, codec,
             ai_classifications, nsfw_score, analyzed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
        ",
    )
    .bind(media_id)
    .bind(metadata.width)
    .bind(metadata.height)
    .bind(metadata.duration_seconds)
    .bind(&metadata.format)
    .bind(&metadata.codec)
    .bind(&metadata.ai_classifications)
    .bind(metadata.nsfw_score)
    .execute(pool)
    .await
    .context("Failed to save metadata")?;
    Ok(())
}

pub async fn get_metadata(pool: &SqlitePool, media_id: i64) -> Result<Option<MediaMetadata>> {
    sqlx::query_as("SELECT * FROM media_metadata WHERE media_id = ?")
        .bind(media_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch metadata")
}

// ========== Scraper runs ==========

/// Open a new run record in 'running' state, returning its id.
pub async fn start_run(pool: &SqlitePool) -> Result<i64> {
    let result =
        sqlx::query("INSERT INTO scraper_runs (status, started_at) VALUES ('running', datetime('now'))")
            .execute(pool)
            .await
            .context("Failed to start scraper run")?;
    Ok(result.last_insert_rowid())
}

pub async fn update_run(
    pool: &SqlitePool,
    run_id: i64,
    posts_processed: i64,
    media_downloaded: i64,
    errors_count: i64,
) -> Result<()> {
    sqlx::query(
        r"
        UPDATE scraper_runs
        SET posts_processed = ?, media_downloaded = ?, errors_count = ?
        WHERE id = ?
        ",
    )
    .bind(posts_processed)
    .bind(media_downloaded)
    .bind(errors_count)
    .bind(run_id)
    .execute(pool)
    .await
    .context("Failed to update scraper run")?;
    Ok(())
}

pub async fn complete_run(pool: &SqlitePool, run_id: i64, status: RunStatus) -> Result<()> {
    sqlx::query("UPDATE scraper_runs SET status = ?, completed_at = datetime('now') WHERE id = ?")
        .bind(status.as_str())
        .bind(run_id)
        .execute(pool)
        .await
        .context("Failed to complete scraper run")?;
    Ok(())
}

pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<ScraperRun>> {
    sqlx::query_as("SELECT * FROM scraper_runs ORDER BY started_at DESC, id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to query scraper runs")
}
