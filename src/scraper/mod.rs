//! Scrape orchestration: drives pagination, seen-post policies, media
//! downloads, comment capture, and run accounting for one session.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, Database, MediaKind, MediaRecord, NewMetadata, RunStatus, StoreError};
use crate::downloader::{self, DownloadError, Downloader};
use crate::lemmy::{LemmyClient, PostView, PAGE_SIZE};
use crate::progress::Tracker;
use crate::tags::TagManager;
use crate::thumbnails::Generator;

/// Comment capture parameters: depth and size of the tree pulled per post.
const COMMENT_MAX_DEPTH: u32 = 10;
const COMMENT_LIMIT: u32 = 500;
const COMMENT_SORT: &str = "Top";

/// Terminal counters of one scrape session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub posts_processed: u64,
    pub media_downloaded: u64,
    pub errors: u64,
}

/// What to do with a post that is already in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeenAction {
    /// Threshold of consecutive seen posts reached; end the session.
    Stop,
    /// Skip this post and keep going.
    Skip,
    /// Re-observe the post (dedup makes this cheap).
    Process,
}

fn seen_action(
    stop_at_seen: bool,
    skip_seen: bool,
    consecutive_seen: u32,
    threshold: u32,
) -> SeenAction {
    if stop_at_seen && consecutive_seen >= threshold {
        return SeenAction::Stop;
    }
    if stop_at_seen || skip_seen {
        return SeenAction::Skip;
    }
    SeenAction::Process
}

/// Drives scrape sessions against one Lemmy instance.
pub struct Scraper {
    config: Arc<Config>,
    db: Database,
    client: LemmyClient,
    downloader: Downloader,
    tracker: Arc<Tracker>,
    thumbnails: Option<Generator>,
    tags: Option<Arc<TagManager>>,
    cancel: CancellationToken,
}

struct SessionCounters {
    posts_processed: u64,
    media_downloaded: u64,
    errors: u64,
    stopped: bool,
}

impl Scraper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        db: Database,
        client: LemmyClient,
        downloader: Downloader,
        tracker: Arc<Tracker>,
        thumbnails: Option<Generator>,
        tags: Option<Arc<TagManager>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            db,
            client,
            downloader,
            tracker,
            thumbnails,
            tags,
            cancel,
        }
    }

    /// Run one scrape session over all configured communities (or the
    /// instance's default feed) and record it in the runs table.
    ///
    /// Failures inside a post, media item, or comment batch are counted
    /// and logged, never propagated; only catalog-level failures are fatal.
    ///
    /// # Errors
    ///
    /// Returns an error when the run record itself cannot be maintained.
    pub async fn run_session(&self) -> Result<RunSummary> {
        let run_id = db::start_run(self.db.pool()).await?;
        self.tracker.start().await;

        let mut counters = SessionCounters {
            posts_processed: 0,
            media_downloaded: 0,
            errors: 0,
            stopped: false,
        };

        let result = self.scrape_all(&mut counters, run_id).await;

        db::update_run(
            self.db.pool(),
            run_id,
            counters.posts_processed as i64,
            counters.media_downloaded as i64,
            counters.errors as i64,
        )
        .await?;

        let status = match &result {
            Ok(()) => RunStatus::Completed,
            Err(e) => {
                error!("Scrape session failed: {e:#}");
                RunStatus::Failed
            }
        };
        db::complete_run(self.db.pool(), run_id, status).await?;
        self.tracker.stop().await;

        result?;

        info!(
            posts = counters.posts_processed,
            media = counters.media_downloaded,
            errors = counters.errors,
            "Scrape session finished"
        );

        Ok(RunSummary {
            posts_processed: counters.posts_processed,
            media_downloaded: counters.media_downloaded,
            errors: counters.errors,
        })
    }

    async fn scrape_all(&self, counters: &mut SessionCounters, run_id: i64) -> Result<()> {
        // An empty community list means the instance's default feed.
        let communities: Vec<Option<String>> = if self.config.lemmy.communities.is_empty() {
            vec![None]
        } else {
            self.config
                .lemmy
                .communities
                .iter()
                .map(|c| Some(c.clone()))
                .collect()
        };

        let total_feeds = communities.len();
        for (index, community) in communities.into_iter().enumerate() {
            if self.cancel.is_cancelled() || counters.stopped {
                break;
            }

            let label = community.as_deref().unwrap_or("(default feed)");
            self.tracker.set_community(label).await;
            self.tracker
                .set_progress(index as f64 / total_feeds as f64 * 100.0)
                .await;

            self.scrape_feed(community.as_deref(), counters).await;

            db::update_run(
                self.db.pool(),
                run_id,
                counters.posts_processed as i64,
                counters.media_downloaded as i64,
                counters.errors as i64,
            )
            .await?;
        }

        Ok(())
    }

    /// Page through one feed until the post budget, the end of the feed,
    /// or the seen-post policy stops us.
    async fn scrape_feed(&self, community: Option<&str>, counters: &mut SessionCounters) {
        let scraper_cfg = &self.config.scraper;
        let max_posts = u64::from(scraper_cfg.max_posts_per_run);
        let mut page = 1u32;
        let mut consecutive_seen = 0u32;

        loop {
            let posts = match self
                .client
                .get_page(community, &scraper_cfg.sort_type, page)
                .await
            {
                Ok(posts) => posts,
                Err(e) => {
                    warn!(community = community.unwrap_or("-"), page, "Feed fetch failed: {e}");
                    counters.errors += 1;
                    self.tracker.increment_errors().await;
                    return;
                }
            };
            let page_len = posts.len();
            debug!(community = community.unwrap_or("-"), page, posts = page_len, "Fetched page");

            for post in &posts {
                if self.cancel.is_cancelled() {
                    info!("Cancellation requested, finishing after current post");
                    counters.stopped = true;
                    break;
                }
                if counters.posts_processed >= max_posts {
                    counters.stopped = true;
                    break;
                }

                let known = match db::post_exists(self.db.pool(), post.post.id).await {
                    Ok(known) => known,
                    Err(e) => {
                        warn!(post_id = post.post.id, "Seen check failed: {e:#}");
                        counters.errors += 1;
                        self.tracker.increment_errors().await;
                        continue;
                    }
                };

                if known {
                    consecutive_seen += 1;
                    match seen_action(
                        scraper_cfg.stop_at_seen_posts,
                        scraper_cfg.skip_seen_posts,
                        consecutive_seen,
                        scraper_cfg.seen_posts_threshold,
                    ) {
                        SeenAction::Stop => {
                            info!(
                                consecutive_seen,
                                "Seen-post threshold reached, stopping session"
                            );
                            counters.stopped = true;
                            break;
                        }
                        SeenAction::Skip => {
                            debug!(post_id = post.post.id, "Skipping seen post");
                            continue;
                        }
                        SeenAction::Process => {}
                    }
                } else {
                    consecutive_seen = 0;
                }

                self.process_post(post, counters).await;
                counters.posts_processed += 1;
                self.tracker.increment_posts().await;
            }

            // A short page means the feed is exhausted.
            if !scraper_cfg.enable_pagination
                || counters.stopped
                || counters.posts_processed >= max_posts
                || (page_len as u32) < PAGE_SIZE
            {
                break;
            }
            page += 1;
        }
    }

    /// Handle a single post: download its media candidates, pull comments
    /// once media exists, then mark it scraped. Every failure inside is
    /// contained here.
    async fn process_post(&self, post: &PostView, counters: &mut SessionCounters) {
        let scraper_cfg = &self.config.scraper;
        debug!(post_id = post.post.id, title = %post.post.name, "Processing post");

        // Candidate URLs in priority order; the feed's own thumbnail is a
        // fallback when the post carries no direct media.
        let mut candidates: Vec<&str> = Vec::new();
        if let Some(url) = post.post.url.as_deref().filter(|u| !u.is_empty()) {
            candidates.push(url);
        }
        if let Some(url) = post.post.embed_video_url.as_deref().filter(|u| !u.is_empty()) {
            candidates.push(url);
        }
        if candidates.is_empty() {
            if let Some(url) = post.post.thumbnail_url.as_deref().filter(|u| !u.is_empty()) {
                candidates.push(url);
            }
        }

        let mut media_count = 0i64;
        for url in candidates {
            if !downloader::should_download(
                url,
                scraper_cfg.include_images,
                scraper_cfg.include_videos,
                scraper_cfg.include_other_media,
            ) {
                debug!(url, "Media kind disabled, skipping");
                continue;
            }

            match self.downloader.download_media(url, post).await {
                Ok(record) => {
                    media_count += 1;
                    counters.media_downloaded += 1;
                    self.tracker.increment_media().await;
                    self.post_process_media(&record, counters).await;
                }
                // The same (post, URL) pair from an earlier run; nothing to do.
                Err(DownloadError::Store(StoreError::DuplicatePostUrl)) => {
                    debug!(url, post_id = post.post.id, "Media URL already recorded");
                    media_count += 1;
                }
                Err(e) => {
                    warn!(url, post_id = post.post.id, "Download failed: {e}");
                    counters.errors += 1;
                    self.tracker.increment_errors().await;
                }
            }
        }

        if media_count > 0 {
            self.capture_comments(post, counters).await;
        }

        if let Err(e) = db::mark_post_scraped(self.db.pool(), post, media_count).await {
            warn!(post_id = post.post.id, "Failed to mark post scraped: {e:#}");
            counters.errors += 1;
            self.tracker.increment_errors().await;
        }
    }

    /// Derived artifacts after a media row exists: thumbnail, extended
    /// metadata, and auto-tags. All best-effort.
    async fn post_process_media(&self, record: &MediaRecord, counters: &mut SessionCounters) {
        let kind = record.kind().unwrap_or(MediaKind::Other);
        let media_path = std::path::Path::new(&record.file_path);

        let mut metadata = NewMetadata::default();
        let mut have_metadata = false;

        if let Some(generator) = &self.thumbnails {
            if matches!(kind, MediaKind::Image | MediaKind::Video) {
                match generator.generate(media_path, kind).await {
                    Ok((thumb_path, width, height)) => {
                        if let Err(e) = db::save_thumbnail(
                            self.db.pool(),
                            record.id,
                            &thumb_path.to_string_lossy(),
                            width,
                            height,
                        )
                        .await
                        {
                            warn!(media_id = record.id, "Failed to save thumbnail row: {e:#}");
                        }
                    }
                    Err(e) => {
                        warn!(media_id = record.id, "Thumbnail generation failed: {e}");
                        counters.errors += 1;
                        self.tracker.increment_errors().await;
                    }
                }
            }
        }

        if kind == MediaKind::Image {
            if let Ok((width, height)) = image_dimensions_of(media_path).await {
                metadata.width = Some(i64::from(width));
                metadata.height = Some(i64::from(height));
                have_metadata = true;
            }

            if let Some(tags) = &self.tags {
                match tags.auto_tag_media(record.id, &record.file_path).await {
                    Ok(Some(classification)) => {
                        metadata.nsfw_score = Some(classification.nsfw_score);
                        metadata.ai_classifications =
                            serde_json::to_string(&classification).ok();
                        have_metadata = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Classifier failures never unwind the media row.
                        warn!(media_id = record.id, "Auto-tagging failed: {e:#}");
                        counters.errors += 1;
                        self.tracker.increment_errors().await;
                    }
                }
            }
        }

        if have_metadata {
            if let Err(e) = db::save_metadata(self.db.pool(), record.id, &metadata).await {
                warn!(media_id = record.id, "Failed to save metadata: {e:#}");
            }
        }
    }

    /// Pull and store the comment tree once per post, after its media.
    async fn capture_comments(&self, post: &PostView, counters: &mut SessionCounters) {
        let post_id = post.post.id;

        match db::comments_exist_for_post(self.db.pool(), post_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(post_id, "Comment existence check failed: {e:#}");
                return;
            }
        }

        let comments = match self
            .client
            .get_comments(post_id, COMMENT_MAX_DEPTH, COMMENT_LIMIT, COMMENT_SORT)
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!(post_id, "Comment fetch failed: {e}");
                counters.errors += 1;
                self.tracker.increment_errors().await;
                return;
            }
        };

        let mut saved = 0usize;
        for comment in &comments {
            if comment.comment.removed || comment.comment.deleted {
                continue;
            }
            if let Err(e) = db::save_comment(self.db.pool(), comment).await {
                warn!(comment_id = comment.comment.id, "Failed to save comment: {e:#}");
                counters.errors += 1;
                self.tracker.increment_errors().await;
                continue;
            }
            saved += 1;
        }
        debug!(post_id, saved, "Stored comments");
    }
}

async fn image_dimensions_of(path: &std::path::Path) -> Result<(u32, u32)> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::image_dimensions(path))
        .await
        .context("dimension probe task failed")?
        .context("failed to read image dimensions")
}
