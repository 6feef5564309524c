use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },
}

/// Application configuration loaded from a YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lemmy: LemmyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub run_mode: RunModeConfig,
    #[serde(default)]
    pub web_server: WebServerConfig,
    #[serde(default)]
    pub thumbnails: ThumbnailConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Lemmy instance and authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LemmyConfig {
    /// Instance hostname, e.g. "lemmy.ml".
    pub instance: String,
    pub username: String,
    pub password: String,
    /// Communities to scrape; empty means the instance's default feed.
    #[serde(default)]
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where downloaded media is written.
    pub base_directory: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite catalog file.
    pub path: String,
}

/// Scraping behavior settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScraperConfig {
    /// Maximum posts to process per run, across all pages.
    #[serde(default)]
    pub max_posts_per_run: u32,
    /// Stop once a run of already-seen posts is encountered.
    #[serde(default)]
    pub stop_at_seen_posts: bool,
    /// Skip seen posts but keep paging.
    #[serde(default)]
    pub skip_seen_posts: bool,
    /// Fetch multiple pages to get past the API's 50-post page size.
    #[serde(default)]
    pub enable_pagination: bool,
    /// Consecutive seen posts required before stopping.
    #[serde(default)]
    pub seen_posts_threshold: u32,
    /// Feed sort, e.g. "Hot", "New", "TopDay".
    #[serde(default)]
    pub sort_type: String,
    #[serde(default)]
    pub include_images: bool,
    #[serde(default)]
    pub include_videos: bool,
    #[serde(default)]
    pub include_other_media: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunModeConfig {
    /// "once" or "continuous".
    #[serde(default)]
    pub mode: String,
    /// Interval between sessions in continuous mode, e.g. "30m", "1h", "300s".
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_width: u32,
    #[serde(default)]
    pub max_height: u32,
    /// JPEG quality, 1-100.
    #[serde(default)]
    pub quality: u8,
    #[serde(default)]
    pub directory: String,
    /// Method for video thumbnails; only "ffmpeg" is implemented.
    #[serde(default)]
    pub video_method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "ollama" or "none".
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub ollama_url: String,
    #[serde(default)]
    pub model: String,
    /// Create tags from classifications automatically.
    #[serde(default)]
    pub auto_tag: bool,
    #[serde(default)]
    pub nsfw_detection: bool,
    #[serde(default)]
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Rebuild the FTS index on startup.
    #[serde(default)]
    pub rebuild_index: bool,
}

impl Config {
    /// Load configuration from a YAML file, apply defaults, and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// required field is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = serde_yaml::from_str(&data)?;
        config.set_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Validate that required fields are present and consistent.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lemmy.instance.is_empty() {
            return Err(ConfigError::MissingField("lemmy.instance"));
        }
        if self.lemmy.username.is_empty() {
            return Err(ConfigError::MissingField("lemmy.username"));
        }
        if self.lemmy.password.is_empty() {
            return Err(ConfigError::MissingField("lemmy.password"));
        }
        if self.storage.base_directory.is_empty() {
            return Err(ConfigError::MissingField("storage.base_directory"));
        }
        if self.database.path.is_empty() {
            return Err(ConfigError::MissingField("database.path"));
        }
        if self.run_mode.mode != "once" && self.run_mode.mode != "continuous" {
            return Err(ConfigError::InvalidValue {
                name: "run_mode.mode",
                message: format!("must be 'once' or 'continuous', got '{}'", self.run_mode.mode),
            });
        }
        if self.run_mode.mode == "continuous" {
            match self.run_mode.interval.as_deref() {
                None | Some("") => return Err(ConfigError::MissingField("run_mode.interval")),
                Some(raw) => {
                    parse_interval(raw).ok_or_else(|| ConfigError::InvalidValue {
                        name: "run_mode.interval",
                        message: format!("could not parse duration '{raw}' (expected e.g. \"30m\", \"1h\")"),
                    })?;
                }
            }
        }
        if self.thumbnails.quality > 100 {
            return Err(ConfigError::InvalidValue {
                name: "thumbnails.quality",
                message: "must be between 1 and 100".to_string(),
            });
        }
        Ok(())
    }

    /// Fill in defaults for optional fields and apply coercions.
    pub fn set_defaults(&mut self) {
        if self.scraper.max_posts_per_run == 0 {
            self.scraper.max_posts_per_run = 50;
        }
        if self.scraper.seen_posts_threshold == 0 {
            self.scraper.seen_posts_threshold = 5;
        }

        // Without pagination a single request is all we get, and the API
        // caps a page at 50 posts.
        if !self.scraper.enable_pagination && self.scraper.max_posts_per_run > 50 {
            self.scraper.max_posts_per_run = 50;
        }

        if self.scraper.sort_type.is_empty() {
            self.scraper.sort_type = "Hot".to_string();
        }
        self.scraper.sort_type = normalize_sort_type(&self.scraper.sort_type);

        // All kinds disabled is taken as "not configured", not "download nothing".
        if !self.scraper.include_images
            && !self.scraper.include_videos
            && !self.scraper.include_other_media
        {
            self.scraper.include_images = true;
            self.scraper.include_videos = true;
            self.scraper.include_other_media = true;
        }

        if self.run_mode.mode.is_empty() {
            self.run_mode.mode = "once".to_string();
        }

        if self.web_server.port == 0 {
            self.web_server.port = 8080;
        }
        if self.web_server.host.is_empty() {
            self.web_server.host = "localhost".to_string();
        }

        if self.thumbnails.max_width == 0 {
            self.thumbnails.max_width = 400;
        }
        if self.thumbnails.max_height == 0 {
            self.thumbnails.max_height = 400;
        }
        if self.thumbnails.quality == 0 {
            self.thumbnails.quality = 85;
        }
        if self.thumbnails.directory.is_empty() {
            self.thumbnails.directory = "./thumbnails".to_string();
        }
        if self.thumbnails.video_method.is_empty() {
            self.thumbnails.video_method = "ffmpeg".to_string();
        }

        if self.recognition.provider.is_empty() {
            self.recognition.provider = "ollama".to_string();
        }
        if self.recognition.ollama_url.is_empty() {
            self.recognition.ollama_url = "http://localhost:11434".to_string();
        }
        if self.recognition.model.is_empty() {
            self.recognition.model = "llama3.2-vision:latest".to_string();
        }
        if self.recognition.confidence_threshold == 0.0 {
            self.recognition.confidence_threshold = 0.6;
        }
    }

    /// Interval between continuous-mode sessions.
    ///
    /// Only meaningful after `validate()`; returns `None` in once mode.
    #[must_use]
    pub fn run_interval(&self) -> Option<Duration> {
        self.run_mode.interval.as_deref().and_then(parse_interval)
    }
}

/// Map user-friendly sort names onto Lemmy's SortType enum values.
fn normalize_sort_type(sort: &str) -> String {
    match sort.to_lowercase().as_str() {
        "hot" => "Hot",
        "new" => "New",
        "topday" => "TopDay",
        "topweek" => "TopWeek",
        "topmonth" => "TopMonth",
        "topyear" => "TopYear",
        "topall" => "TopAll",
        "active" => "Active",
        _ => return sort.to_string(),
    }
    .to_string()
}

/// Parse a duration like "300s", "30m", "2h", or a bare number of seconds.
fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (value, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: u64 = value.parse().ok()?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => value,
        "m" | "min" | "mins" => value * 60,
        "h" | "hr" | "hours" => value * 3600,
        _ => return None,
    };

    if secs == 0 {
        return None;
    }
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        let mut config = Config::default();
        config.lemmy.instance = "lemmy.example.com".to_string();
        config.lemmy.username = "harvester".to_string();
        config.lemmy.password = "hunter2".to_string();
        config.storage.base_directory = "./media".to_string();
        config.database.path = "./harvest.sqlite".to_string();
        config.run_mode.mode = "once".to_string();
        config
    }

    #[test]
    fn test_normalize_sort_type() {
        assert_eq!(normalize_sort_type("hot"), "Hot");
        assert_eq!(normalize_sort_type("Hot"), "Hot");
        assert_eq!(normalize_sort_type("TOPWEEK"), "TopWeek");
        assert_eq!(normalize_sort_type("active"), "Active");
        // Unknown values pass through untouched
        assert_eq!(normalize_sort_type("MostComments"), "MostComments");
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("300s"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_interval("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_interval("0s"), None);
        assert_eq!(parse_interval("fast"), None);
        assert_eq!(parse_interval(""), None);
    }

    #[test]
    fn test_defaults_applied() {
        let mut config = minimal_config();
        config.set_defaults();

        assert_eq!(config.scraper.max_posts_per_run, 50);
        assert_eq!(config.scraper.seen_posts_threshold, 5);
        assert_eq!(config.scraper.sort_type, "Hot");
        assert!(config.scraper.include_images);
        assert!(config.scraper.include_videos);
        assert!(config.scraper.include_other_media);
        assert_eq!(config.web_server.port, 8080);
        assert_eq!(config.web_server.host, "localhost");
        assert_eq!(config.thumbnails.max_width, 400);
        assert_eq!(config.thumbnails.quality, 85);
        assert_eq!(config.recognition.confidence_threshold, 0.6);
    }

    #[test]
    fn test_pagination_disabled_clamps_max_posts() {
        let mut config = minimal_config();
        config.scraper.max_posts_per_run = 200;
        config.scraper.enable_pagination = false;
        config.set_defaults();
        assert_eq!(config.scraper.max_posts_per_run, 50);

        // With pagination enabled the configured value survives
        let mut config = minimal_config();
        config.scraper.max_posts_per_run = 200;
        config.scraper.enable_pagination = true;
        config.set_defaults();
        assert_eq!(config.scraper.max_posts_per_run, 200);
    }

    #[test]
    fn test_include_flags_all_false_become_all_true() {
        let mut config = minimal_config();
        config.scraper.include_images = false;
        config.scraper.include_videos = false;
        config.scraper.include_other_media = false;
        config.set_defaults();
        assert!(config.scraper.include_images);
        assert!(config.scraper.include_videos);
        assert!(config.scraper.include_other_media);

        // A partially-enabled selection is respected
        let mut config = minimal_config();
        config.scraper.include_images = true;
        config.set_defaults();
        assert!(config.scraper.include_images);
        assert!(!config.scraper.include_videos);
        assert!(!config.scraper.include_other_media);
    }

    #[test]
    fn test_validate_missing_fields() {
        let mut config = minimal_config();
        config.lemmy.instance = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("lemmy.instance"))
        ));

        let mut config = minimal_config();
        config.database.path = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("database.path"))
        ));
    }

    #[test]
    fn test_validate_continuous_requires_interval() {
        let mut config = minimal_config();
        config.run_mode.mode = "continuous".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("run_mode.interval"))
        ));

        config.run_mode.interval = Some("30m".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.run_interval(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_validate_rejects_bad_mode() {
        let mut config = minimal_config();
        config.run_mode.mode = "sometimes".to_string();
        assert!(config.validate().is_err());
    }
}
