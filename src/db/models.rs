use serde::{Deserialize, Serialize};

/// Broad media classification used for admission policy and storage stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Other,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// A downloaded media file and its catalog row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaRecord {
    pub id: i64,
    pub post_id: i64,
    pub post_title: String,
    pub community_name: String,
    pub community_id: i64,
    pub author_name: String,
    pub author_id: i64,
    pub media_url: String,
    pub media_hash: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub media_type: String,
    /// URL the post carried for this media; for directly-linked media this
    /// is the source URL itself.
    pub post_url: String,
    pub post_score: i64,
    pub post_created: String,
    pub downloaded_at: String,
}

impl MediaRecord {
    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_str(&self.media_type)
    }
}

/// Data for inserting a new media row.
#[derive(Debug, Clone)]
pub struct NewMedia {
    pub post_id: i64,
    pub post_title: String,
    pub community_name: String,
    pub community_id: i64,
    pub author_name: String,
    pub author_id: i64,
    pub media_url: String,
    pub media_hash: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub media_type: String,
    pub post_url: String,
    pub post_score: i64,
    pub post_created: String,
}

/// A post observed by the scraper, with or without media.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostRecord {
    pub post_id: i64,
    pub post_title: String,
    pub community_name: String,
    pub community_id: i64,
    pub author_name: String,
    pub author_id: i64,
    pub post_created: String,
    pub scraped_at: String,
    pub had_media: bool,
    pub media_count: i64,
}

/// A stored comment. Removed/deleted rows are kept but filtered out of reads.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommentRecord {
    pub comment_id: i64,
    pub post_id: i64,
    pub creator_id: i64,
    pub creator_name: String,
    pub content: String,
    /// Materialized dotted path of ancestor comment ids, used for threading.
    pub path: String,
    pub score: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub child_count: i64,
    pub published: String,
    pub updated: Option<String>,
    pub removed: bool,
    pub deleted: bool,
    pub distinguished: bool,
    pub scraped_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub color: Option<String>,
    pub auto_generated: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ThumbnailRecord {
    pub media_id: i64,
    pub thumbnail_path: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub generated_at: String,
}

/// Extended per-media metadata filled in lazily after download.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaMetadata {
    pub media_id: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub format: Option<String>,
    pub codec: Option<String>,
    /// Serialized `Classification` JSON from the vision classifier.
    pub ai_classifications: Option<String>,
    pub nsfw_score: Option<f64>,
    pub analyzed_at: Option<String>,
}

/// Data for upserting extended metadata.
#[derive(Debug, Clone, Default)]
pub struct NewMetadata {
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_seconds: Option<f64>,
    pub format: Option<String>,
    pub codec: Option<String>,
    pub ai_classifications: Option<String>,
    pub nsfw_score: Option<f64>,
}

/// Terminal status of a scraper run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One row per scrape session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScraperRun {
    pub id: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub posts_processed: i64,
    pub media_downloaded: i64,
    pub errors_count: i64,
    pub status: String,
}

/// Filter options for media listing queries.
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    pub community: Option<String>,
    pub media_type: Option<String>,
    pub sort_by: String,
    pub sort_order: String,
    pub limit: i64,
    pub offset: i64,
}

/// Aggregation period for the download timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelinePeriod {
    Hour,
    Day,
    Week,
    Month,
}

impl TimelinePeriod {
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// SQLite strftime expression grouping `downloaded_at` into this period.
    #[must_use]
    pub fn group_expr(&self) -> &'static str {
        match self {
            Self::Hour => "strftime('%Y-%m-%d %H:00', downloaded_at)",
            Self::Day => "strftime('%Y-%m-%d', downloaded_at)",
            Self::Week => "strftime('%Y-W%W', downloaded_at)",
            Self::Month => "strftime('%Y-%m', downloaded_at)",
        }
    }
}

// ========== Aggregate query results ==========

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TypeCount {
    pub media_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CommunityCount {
    pub community_name: String,
    pub count: i64,
}

/// Headline statistics for the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total_media: i64,
    pub total_posts: i64,
    pub total_size_bytes: i64,
    pub by_type: Vec<TypeCount>,
    pub top_communities: Vec<CommunityCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimelineBucket {
    pub period: String,
    pub count: i64,
    pub total_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreatorStat {
    pub author_name: String,
    pub media_count: i64,
    pub total_score: i64,
    pub last_download: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StorageBucket {
    pub name: String,
    pub count: i64,
    pub total_bytes: i64,
}

/// Storage usage broken down by community and by media kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBreakdown {
    pub by_community: Vec<StorageBucket>,
    pub by_type: Vec<StorageBucket>,
}

/// An image with no tag assignments, as returned by the backfill query.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UntaggedImage {
    pub id: i64,
    pub file_path: String,
    pub post_title: String,
    pub community_name: String,
}
