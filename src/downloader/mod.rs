//! Content-addressed media download pipeline.
//!
//! Validates source URLs against SSRF, streams bodies under a hard size
//! ceiling, hashes the exact bytes, deduplicates against the catalog, and
//! writes files atomically with owner-only permissions. The catalog row and
//! the on-disk file are kept consistent: a failed insert removes the file.

use std::io::Write;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use url::Host;

use crate::db::{self, Database, MediaKind, MediaRecord, NewMedia, StoreError};
use crate::lemmy::PostView;

/// Hard ceiling on a single downloaded file.
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid media URL: {0}")]
    InvalidUrl(String),
    #[error("file too large: {size} bytes exceeds limit of {limit}")]
    Oversize { size: u64, limit: u64 },
    #[error("download failed with status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("download failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("failed to store media file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] anyhow::Error),
}

/// Downloads media files and records them in the catalog.
#[derive(Debug, Clone)]
pub struct Downloader {
    db: Database,
    http: reqwest::Client,
    base_dir: PathBuf,
    max_file_size: u64,
}

impl Downloader {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(db: Database, base_dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        // Redirects are disabled so the SSRF check on the original host
        // cannot be bypassed by a redirect to a private address.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            db,
            http,
            base_dir: base_dir.into(),
            max_file_size: MAX_FILE_SIZE,
        })
    }

    /// Override the size ceiling. Exists for tests; production keeps
    /// [`MAX_FILE_SIZE`].
    #[must_use]
    pub fn with_max_file_size(mut self, limit: u64) -> Self {
        self.max_file_size = limit;
        self
    }

    /// Download one media URL for a post and persist it.
    ///
    /// Content already in the catalog (by hash) is not re-downloaded to
    /// disk; the existing record is returned instead.
    ///
    /// # Errors
    ///
    /// See [`DownloadError`]. `DuplicatePostUrl` surfaces as
    /// `Store(StoreError::DuplicatePostUrl)` and leaves no file behind.
    pub async fn download_media(
        &self,
        media_url: &str,
        post: &PostView,
    ) -> Result<MediaRecord, DownloadError> {
        if media_url.is_empty() {
            return Err(DownloadError::InvalidUrl("empty URL".to_string()));
        }
        let parsed = validate_url(media_url)?;

        // A post re-registering the same URL would collide on the composite
        // constraint only after the file was already overwritten on disk;
        // refuse it up front so no bytes move at all.
        if db::get_media_by_post_and_url(self.db.pool(), post.post.id, media_url)
            .await?
            .is_some()
        {
            return Err(StoreError::DuplicatePostUrl.into());
        }

        debug!(url = %media_url, post_id = post.post.id, "Downloading media");

        let response = self.http.get(media_url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::BadStatus(response.status()));
        }

        // Reject oversized files before reading the body when the server
        // declares a length.
        if let Some(length) = response.content_length() {
            if length > self.max_file_size {
                return Err(DownloadError::Oversize {
                    size: length,
                    limit: self.max_file_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Stream the body into memory, bailing as soon as the ceiling is
        // crossed rather than after buffering an arbitrary amount.
        let mut content: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if content.len() as u64 + chunk.len() as u64 > self.max_file_size {
                return Err(DownloadError::Oversize {
                    size: content.len() as u64 + chunk.len() as u64,
                    limit: self.max_file_size,
                });
            }
            content.extend_from_slice(&chunk);
        }

        let hash = hash_bytes(&content);

        if db::media_exists(self.db.pool(), &hash).await? {
            debug!(hash = %&hash[..16], "Media already exists, skipping download");
            if let Some(existing) = db::get_media_by_hash(self.db.pool(), &hash).await? {
                return Ok(existing);
            }
        }

        let kind = determine_media_kind(&content_type, media_url);
        let extension = file_extension(&content_type, media_url);

        // <post id>_<original basename>, or <post id><ext> when the URL
        // carries no usable name.
        let original_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        let mut file_name = format!("{}_{}", post.post.id, original_name);
        if !file_name.contains('.') {
            file_name = format!("{}{}", post.post.id, extension);
        }
        let file_name = sanitize_path_component(&file_name);

        let community_dir = self
            .base_dir
            .join(sanitize_path_component(&post.community.name));
        let file_path = community_dir.join(&file_name);

        let file_size = content.len() as i64;
        {
            let community_dir = community_dir.clone();
            let file_path = file_path.clone();
            tokio::task::spawn_blocking(move || write_atomic(&community_dir, &file_path, &content))
                .await
                .map_err(|e| std::io::Error::other(e))??;
        }

        let new_media = NewMedia {
            post_id: post.post.id,
            post_title: post.post.name.clone(),
            community_name: post.community.name.clone(),
            community_id: post.community.id,
            author_name: post.creator.name.clone(),
            author_id: post.creator.id,
            media_url: media_url.to_string(),
            media_hash: hash.clone(),
            file_name: file_name.clone(),
            file_path: file_path.to_string_lossy().into_owned(),
            file_size,
            media_type: kind.as_str().to_string(),
            // The post's own link when it has one; embeds and thumbnail
            // fallbacks otherwise record the fetched URL here too.
            post_url: post
                .post
                .url
                .clone()
                .unwrap_or_else(|| media_url.to_string()),
            post_score: post.counts.score,
            post_created: post.post.published.clone(),
        };

        let media_id = match db::save_media(self.db.pool(), &new_media).await {
            Ok(id) => id,
            Err(e) => {
                // Keep disk and catalog consistent: no row, no file.
                let _ = tokio::fs::remove_file(&file_path).await;
                if matches!(e, StoreError::DuplicateHash) {
                    // Lost a race with a concurrent download of the same bytes.
                    if let Some(existing) = db::get_media_by_hash(self.db.pool(), &hash).await? {
                        return Ok(existing);
                    }
                }
                return Err(e.into());
            }
        };

        info!(
            file = %file_name,
            kind = kind.as_str(),
            bytes = file_size,
            "Downloaded media"
        );

        let record = db::get_media_by_id(self.db.pool(), media_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("media row {media_id} vanished after insert"))?;
        Ok(record)
    }
}

/// Write `data` to `path` atomically: temp file in the same directory, then
/// rename into place. The directory is created owner-only (0700) and the
/// file lands owner read/write (0600).
fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".download-")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;

    // tempfile creates with 0600 on unix; make the invariant explicit.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Hex SHA-256 digest of the exact bytes.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Admission policy: whether a URL's media kind is enabled for download.
#[must_use]
pub fn should_download(url: &str, images: bool, videos: bool, other: bool) -> bool {
    match determine_media_kind("", url) {
        MediaKind::Image => images,
        MediaKind::Video => videos,
        MediaKind::Other => other,
    }
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];
const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".webm", ".mov", ".avi", ".mkv", ".m4v"];

/// Classify media from the Content-Type header and the URL suffix.
#[must_use]
pub fn determine_media_kind(content_type: &str, url: &str) -> MediaKind {
    let content_type = content_type.to_lowercase();
    let path = strip_query(url).to_lowercase();

    if content_type.contains("image") || IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return MediaKind::Image;
    }
    if content_type.contains("video") || VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return MediaKind::Video;
    }
    MediaKind::Other
}

/// File extension for a download; the URL suffix wins over Content-Type.
fn file_extension(content_type: &str, url: &str) -> String {
    let path = strip_query(url);
    if let Some(last_segment) = path.rsplit('/').next() {
        if let Some(dot) = last_segment.rfind('.') {
            let ext = &last_segment[dot..];
            if ext.len() > 1 {
                return ext.to_string();
            }
        }
    }

    let content_type = content_type.to_lowercase();
    let ext = if content_type.contains("jpeg") {
        ".jpg"
    } else if content_type.contains("png") {
        ".png"
    } else if content_type.contains("gif") {
        ".gif"
    } else if content_type.contains("webp") {
        ".webp"
    } else if content_type.contains("mp4") {
        ".mp4"
    } else if content_type.contains("webm") {
        ".webm"
    } else {
        ".bin"
    };
    ext.to_string()
}

fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Replace filesystem-hostile characters with underscores.
#[must_use]
pub fn sanitize_path_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Validate a media URL before fetching it.
///
/// Only http/https with a host are accepted, and hosts that are (or name)
/// loopback, link-local, or private addresses are rejected.
fn validate_url(raw: &str) -> Result<url::Url, DownloadError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| DownloadError::InvalidUrl(format!("unparseable URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(DownloadError::InvalidUrl(format!(
                "scheme '{scheme}' not allowed (only http and https)"
            )))
        }
    }

    match parsed.host() {
        None => Err(DownloadError::InvalidUrl("URL has no host".to_string())),
        Some(Host::Domain(domain)) => {
            let domain = domain.to_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(DownloadError::InvalidUrl(
                    "access to localhost is not allowed".to_string(),
                ));
            }
            Ok(parsed)
        }
        Some(Host::Ipv4(ip)) => {
            if is_blocked_v4(ip) {
                return Err(DownloadError::InvalidUrl(format!(
                    "access to reserved address {ip} is not allowed"
                )));
            }
            Ok(parsed)
        }
        Some(Host::Ipv6(ip)) => {
            if is_blocked_v6(&ip) {
                return Err(DownloadError::InvalidUrl(format!(
                    "access to reserved address {ip} is not allowed"
                )));
            }
            Ok(parsed)
        }
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_blocked_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    // fc00::/7 unique local, fe80::/10 link local
    ip.is_loopback()
        || ip.is_unspecified()
        || (segments[0] & 0xfe00) == 0xfc00
        || (segments[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_deterministic() {
        let a = hash_bytes(b"Hello \xe4\xb8\x96\xe7\x95\x8c");
        let b = hash_bytes(b"Hello \xe4\xb8\x96\xe7\x95\x8c");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_bytes(b"hello world"));
    }

    #[test]
    fn test_hash_bytes_known_empty_digest() {
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_determine_media_kind() {
        let cases = [
            ("image/jpeg", "https://example.com/file", MediaKind::Image),
            ("", "https://example.com/photo.jpg", MediaKind::Image),
            ("", "https://example.com/photo.webp", MediaKind::Image),
            ("", "https://example.com/PHOTO.JPG", MediaKind::Image),
            ("video/mp4", "https://example.com/file", MediaKind::Video),
            ("", "https://example.com/clip.webm", MediaKind::Video),
            ("", "https://example.com/VIDEO.Mp4", MediaKind::Video),
            ("", "https://example.com/clip.mkv", MediaKind::Video),
            ("application/pdf", "https://example.com/doc.pdf", MediaKind::Other),
            ("", "https://example.com/file", MediaKind::Other),
            // Query strings don't hide the extension
            ("", "https://example.com/a.png?size=large", MediaKind::Image),
        ];
        for (content_type, url, expected) in cases {
            assert_eq!(
                determine_media_kind(content_type, url),
                expected,
                "({content_type}, {url})"
            );
        }
    }

    #[test]
    fn test_file_extension() {
        let cases = [
            ("", "https://example.com/photo.jpg", ".jpg"),
            ("", "https://example.com/photo.jpg?size=large", ".jpg"),
            ("image/jpeg", "https://example.com/file", ".jpg"),
            ("image/png", "https://example.com/file", ".png"),
            ("video/webm", "https://example.com/file", ".webm"),
            // URL extension beats the header
            ("image/jpeg", "https://example.com/photo.png", ".png"),
            ("application/octet-stream", "https://example.com/file", ".bin"),
            ("", "https://example.com/file", ".bin"),
        ];
        for (content_type, url, expected) in cases {
            assert_eq!(
                file_extension(content_type, url),
                expected,
                "({content_type}, {url})"
            );
        }
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("technology"), "technology");
        assert_eq!(sanitize_path_component("tech/prog"), "tech_prog");
        assert_eq!(sanitize_path_component("a\\b:c*d?e\"f<g>h|i"), "a_b_c_d_e_f_g_h_i");
        assert_eq!(sanitize_path_component("pics@lemmy.ml"), "pics@lemmy.ml");
        assert_eq!(sanitize_path_component(""), "");
    }

    #[test]
    fn test_should_download() {
        assert!(should_download("https://x.com/a.jpg", true, false, false));
        assert!(!should_download("https://x.com/a.jpg", false, true, true));
        assert!(should_download("https://x.com/a.mp4", false, true, false));
        assert!(!should_download("https://x.com/a.mp4", true, false, true));
        assert!(should_download("https://x.com/a.pdf", false, false, true));
        assert!(!should_download("https://x.com/a.pdf", true, true, false));
        assert!(!should_download("https://x.com/a.jpg", false, false, false));
    }

    #[test]
    fn test_validate_url_schemes() {
        assert!(validate_url("https://example.com/a.jpg").is_ok());
        assert!(validate_url("http://example.com/a.jpg").is_ok());
        assert!(matches!(
            validate_url("javascript:alert(1)"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("data:image/png;base64,AAAA"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("ftp://example.com/a.jpg"),
            Err(DownloadError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(DownloadError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_validate_url_blocks_local_addresses() {
        for url in [
            "http://localhost/a.jpg",
            "http://127.0.0.1/a.jpg",
            "http://0.0.0.0/a.jpg",
            "http://10.1.2.3/a.jpg",
            "http://172.16.0.1/a.jpg",
            "http://172.31.255.1/a.jpg",
            "http://192.168.1.1/a.jpg",
            "http://169.254.0.1/a.jpg",
            "http://[::1]/a.jpg",
            "http://[fc00::1]/a.jpg",
            "http://[fd12::1]/a.jpg",
            "http://[fe80::1]/a.jpg",
        ] {
            assert!(
                matches!(validate_url(url), Err(DownloadError::InvalidUrl(_))),
                "{url} should be rejected"
            );
        }

        // Public addresses pass
        assert!(validate_url("http://172.32.0.1/a.jpg").is_ok());
        assert!(validate_url("http://8.8.8.8/a.jpg").is_ok());
        assert!(validate_url("http://[2606:4700::1]/a.jpg").is_ok());
    }
}
