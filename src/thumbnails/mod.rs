//! Thumbnail generation for images and videos.
//!
//! Images are decoded and scaled in-process; videos hand one frame to an
//! external ffmpeg. Thumbnails are content-agnostic derivatives: the output
//! name is the media file's basename with a `.jpg` extension, so an
//! existing file short-circuits regeneration.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use thiserror::Error;
use tracing::debug;

use crate::db::MediaKind;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    /// The external frame extractor (ffmpeg) is not installed.
    #[error("frame extractor '{0}' not found, cannot generate video thumbnail")]
    NoExtractor(String),
    #[error("no thumbnail for media kind '{0}'")]
    UnsupportedKind(String),
    #[error("frame extraction failed: {0}")]
    ExtractorFailed(String),
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Generates JPEG previews constrained to configured dimensions.
#[derive(Debug, Clone)]
pub struct Generator {
    max_width: u32,
    max_height: u32,
    quality: u8,
    base_dir: PathBuf,
    ffmpeg_path: String,
}

impl Generator {
    pub fn new(
        max_width: u32,
        max_height: u32,
        quality: u8,
        base_dir: impl Into<PathBuf>,
        ffmpeg_path: impl Into<String>,
    ) -> Self {
        Self {
            max_width,
            max_height,
            quality,
            base_dir: base_dir.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Expected thumbnail path for a media file.
    #[must_use]
    pub fn thumbnail_path(&self, media_path: &Path) -> PathBuf {
        let stem = media_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();
        self.base_dir.join(format!("{stem}.jpg"))
    }

    /// Generate (or reuse) a thumbnail, returning its path and dimensions.
    ///
    /// # Errors
    ///
    /// `NoExtractor` for video input without ffmpeg installed;
    /// `UnsupportedKind` for media that is neither image nor video.
    pub async fn generate(
        &self,
        media_path: &Path,
        kind: MediaKind,
    ) -> Result<(PathBuf, u32, u32), ThumbnailError> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let thumb_path = self.thumbnail_path(media_path);

        // Regeneration is skipped when a thumbnail is already on disk.
        if tokio::fs::try_exists(&thumb_path).await.unwrap_or(false) {
            let existing = thumb_path.clone();
            let (width, height) =
                tokio::task::spawn_blocking(move || image::image_dimensions(existing))
                    .await
                    .map_err(|e| std::io::Error::other(e))??;
            debug!(path = %thumb_path.display(), width, height, "Thumbnail already exists");
            return Ok((thumb_path, width, height));
        }

        let (width, height) = match kind {
            MediaKind::Image => self.generate_image(media_path, &thumb_path).await?,
            MediaKind::Video => self.generate_video(media_path, &thumb_path).await?,
            MediaKind::Other => {
                return Err(ThumbnailError::UnsupportedKind(
                    kind.as_str().to_string(),
                ))
            }
        };

        Ok((thumb_path, width, height))
    }

    async fn generate_image(
        &self,
        image_path: &Path,
        thumb_path: &Path,
    ) -> Result<(u32, u32), ThumbnailError> {
        let image_path = image_path.to_path_buf();
        let thumb_path = thumb_path.to_path_buf();
        let (max_width, max_height, quality) = (self.max_width, self.max_height, self.quality);

        tokio::task::spawn_blocking(move || -> Result<(u32, u32), ThumbnailError> {
            let img = image::open(&image_path)?;
            // resize() fits within the bounds preserving aspect ratio;
            // JPEG output has no alpha, so flatten to RGB first.
            let thumbnail = img.resize(max_width, max_height, FilterType::Lanczos3).to_rgb8();
            let (width, height) = thumbnail.dimensions();

            let mut out = std::io::BufWriter::new(std::fs::File::create(&thumb_path)?);
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
            encoder.encode(
                thumbnail.as_raw(),
                width,
                height,
                image::ExtendedColorType::Rgb8,
            )?;

            Ok((width, height))
        })
        .await
        .map_err(|e| ThumbnailError::Io(std::io::Error::other(e)))?
    }

    async fn generate_video(
        &self,
        video_path: &Path,
        thumb_path: &Path,
    ) -> Result<(u32, u32), ThumbnailError> {
        let scale = format!(
            "scale='min({w},iw)':min'({h},ih)':force_original_aspect_ratio=decrease",
            w = self.max_width,
            h = self.max_height
        );

        let output = tokio::process::Command::new(&self.ffmpeg_path)
            .arg("-ss")
            .arg("00:00:01")
            .arg("-i")
            .arg(video_path)
            .arg("-vframes")
            .arg("1")
            .arg("-vf")
            .arg(&scale)
            .arg("-q:v")
            .arg("2")
            .arg("-y")
            .arg(thumb_path)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ThumbnailError::NoExtractor(self.ffmpeg_path.clone())
                } else {
                    ThumbnailError::Io(e)
                }
            })?;

        if !output.status.success() {
            return Err(ThumbnailError::ExtractorFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let thumb_path = thumb_path.to_path_buf();
        let dims = tokio::task::spawn_blocking(move || image::image_dimensions(thumb_path))
            .await
            .map_err(|e| ThumbnailError::Io(std::io::Error::other(e)))??;

        debug!(width = dims.0, height = dims.1, "Generated video thumbnail");
        Ok(dims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_path_replaces_extension() {
        let generator = Generator::new(400, 400, 85, "/thumbs", "ffmpeg");
        assert_eq!(
            generator.thumbnail_path(Path::new("/media/pics/123_cat.png")),
            PathBuf::from("/thumbs/123_cat.jpg")
        );
        assert_eq!(
            generator.thumbnail_path(Path::new("/media/pics/123_noext")),
            PathBuf::from("/thumbs/123_noext.jpg")
        );
    }

    #[tokio::test]
    async fn test_generate_image_thumbnail_and_reuse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let media_dir = temp.path().join("media");
        std::fs::create_dir_all(&media_dir).expect("mkdir");

        // 64x32 solid image, saved as PNG
        let source = media_dir.join("800_banner.png");
        let img = image::RgbImage::from_pixel(64, 32, image::Rgb([200, 40, 40]));
        img.save(&source).expect("save source");

        let generator = Generator::new(16, 16, 85, temp.path().join("thumbs"), "ffmpeg");

        let (path, width, height) = generator
            .generate(&source, MediaKind::Image)
            .await
            .expect("generate");
        assert!(path.ends_with("800_banner.jpg"));
        // Fit preserves the 2:1 aspect ratio within 16x16
        assert_eq!((width, height), (16, 8));

        // Second call returns the existing file's dimensions without error
        let modified_before = std::fs::metadata(&path).expect("metadata").modified().ok();
        let (path2, width2, height2) = generator
            .generate(&source, MediaKind::Image)
            .await
            .expect("regenerate");
        assert_eq!(path, path2);
        assert_eq!((width2, height2), (16, 8));
        let modified_after = std::fs::metadata(&path).expect("metadata").modified().ok();
        assert_eq!(modified_before, modified_after);
    }

    #[tokio::test]
    async fn test_generate_rejects_other_kind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let generator = Generator::new(400, 400, 85, temp.path(), "ffmpeg");
        let result = generator
            .generate(Path::new("/nonexistent/file.pdf"), MediaKind::Other)
            .await;
        assert!(matches!(result, Err(ThumbnailError::UnsupportedKind(_))));
    }

    #[tokio::test]
    async fn test_missing_extractor_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("clip.mp4");
        std::fs::write(&source, b"not really a video").expect("write");

        let generator = Generator::new(
            400,
            400,
            85,
            temp.path().join("thumbs"),
            "definitely-not-an-installed-binary",
        );
        let result = generator.generate(&source, MediaKind::Video).await;
        assert!(matches!(result, Err(ThumbnailError::NoExtractor(_))));
    }
}
