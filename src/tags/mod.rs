//! Tag management and auto-tagging.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::db::{self, Database, Tag};
use crate::recognition::{Classification, Classifier};

/// Fixed palette for deterministically colored auto-tags.
const TAG_COLORS: &[&str] = &[
    "#3B82F6", // blue
    "#10B981", // green
    "#F59E0B", // yellow
    "#EF4444", // red
    "#8B5CF6", // purple
    "#EC4899", // pink
    "#06B6D4", // cyan
    "#F97316", // orange
    "#14B8A6", // teal
    "#6366F1", // indigo
];

/// Handles tag normalization, creation, assignment, and auto-tagging.
pub struct TagManager {
    db: Database,
    classifier: Arc<dyn Classifier>,
    auto_tag: bool,
}

impl TagManager {
    pub fn new(db: Database, classifier: Arc<dyn Classifier>, auto_tag: bool) -> Self {
        Self {
            db,
            classifier,
            auto_tag,
        }
    }

    /// Classify an image and assign the resulting tags to its media row.
    ///
    /// Returns the classification so the caller can persist it alongside
    /// the media, or `None` when auto-tagging is disabled. Individual tag
    /// failures are logged and skipped; only the classification call itself
    /// is fatal.
    ///
    /// # Errors
    ///
    /// Returns an error when the classifier call fails.
    pub async fn auto_tag_media(
        &self,
        media_id: i64,
        image_path: &str,
    ) -> Result<Option<Classification>> {
        if !self.auto_tag {
            return Ok(None);
        }

        debug!(media_id, path = %image_path, "Auto-tagging media");

        let classification = self
            .classifier
            .classify(std::path::Path::new(image_path))
            .await
            .with_context(|| format!("failed to classify image for media {media_id}"))?;

        let mut names: Vec<String> = classification.labels.clone();
        names.extend(classification.categories.clone());
        names.dedup();

        let mut assigned = 0usize;
        let mut created = 0usize;
        let mut seen: Vec<String> = Vec::new();

        for raw_name in names {
            let Some(name) = normalize_tag_name(&raw_name) else {
                continue;
            };
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());

            let tag_id = match self.get_or_create(&name, true).await {
                Ok((id, was_created)) => {
                    if was_created {
                        created += 1;
                    }
                    id
                }
                Err(e) => {
                    warn!(tag = %name, "Failed to get or create tag: {e:#}");
                    continue;
                }
            };

            // assign_tag is INSERT OR IGNORE; re-assignment counts as success.
            if let Err(e) = db::assign_tag(self.db.pool(), media_id, tag_id).await {
                warn!(tag = %name, media_id, "Failed to assign tag: {e:#}");
                continue;
            }
            assigned += 1;
        }

        if assigned > 0 {
            info!(media_id, assigned, created, "Auto-tagged media");
        }

        Ok(Some(classification))
    }

    /// Create a tag by hand, or return the existing one with that name.
    ///
    /// # Errors
    ///
    /// Fails when the name normalizes to fewer than two characters, or on a
    /// database error.
    pub async fn create_user_tag(&self, name: &str, color: Option<&str>) -> Result<Tag> {
        let name = normalize_tag_name(name)
            .with_context(|| format!("tag name '{name}' is too short after normalization"))?;

        if let Some(existing) = db::get_tag_by_name(self.db.pool(), &name).await? {
            return Ok(existing);
        }

        let color = match color {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => color_for(&name).to_string(),
        };

        let id = db::create_tag(self.db.pool(), &name, &color, false).await?;
        db::get_tag_by_id(self.db.pool(), id)
            .await?
            .context("tag vanished after insert")
    }

    /// Auto-tag every image that currently has no tag assignments.
    ///
    /// Returns (succeeded, failed) counts.
    ///
    /// # Errors
    ///
    /// Fails when auto-tagging is disabled or the untagged listing fails;
    /// per-image classification failures are counted, not propagated.
    pub async fn backfill_untagged(&self) -> Result<(usize, usize)> {
        anyhow::ensure!(self.auto_tag, "auto-tagging is not enabled");

        let untagged = db::get_untagged_images(self.db.pool()).await?;
        let total = untagged.len();
        if total == 0 {
            info!("No untagged media found");
            return Ok((0, 0));
        }

        info!(total, "Auto-tagging untagged images");

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for (i, media) in untagged.iter().enumerate() {
            debug!(media_id = media.id, progress = i + 1, total, "Backfill item");
            match self.auto_tag_media(media.id, &media.file_path).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    warn!(media_id = media.id, "Backfill failed: {e:#}");
                    failed += 1;
                }
            }
        }

        info!(succeeded, failed, total, "Backfill complete");
        Ok((succeeded, failed))
    }

    async fn get_or_create(&self, name: &str, auto_generated: bool) -> Result<(i64, bool)> {
        if let Some(tag) = db::get_tag_by_name(self.db.pool(), name).await? {
            return Ok((tag.id, false));
        }
        let id = db::create_tag(self.db.pool(), name, color_for(name), auto_generated).await?;
        debug!(tag = %name, "Created auto-generated tag");
        Ok((id, true))
    }
}

/// Normalize a tag name to the `[a-z0-9-]{2,}` grammar.
///
/// Lowercases, trims, maps spaces and underscores to hyphens, and drops
/// every other character outside the grammar. Returns `None` when fewer
/// than two characters remain.
#[must_use]
pub fn normalize_tag_name(name: &str) -> Option<String> {
    let normalized: String = name
        .to_lowercase()
        .trim()
        .chars()
        .map(|c| if c == ' ' || c == '_' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    if normalized.len() < 2 {
        return None;
    }
    Some(normalized)
}

/// Deterministic palette color for a tag name.
#[must_use]
pub fn color_for(name: &str) -> &'static str {
    let mut hash: i64 = 0;
    for c in name.chars() {
        hash = (c as i64).wrapping_add((hash << 5).wrapping_sub(hash));
    }
    let index = hash.unsigned_abs() as usize % TAG_COLORS.len();
    TAG_COLORS[index]
}
