//! Vision classifier gateway.
//!
//! The classifier is a capability: anything that can turn image bytes into
//! a [`Classification`] satisfies the contract. The shipped implementation
//! talks to an Ollama-compatible `/api/generate` endpoint; a no-op
//! implementation stands in when recognition is disabled.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("vision API request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("vision API returned status {status}: {body}")]
    BadStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Result of analyzing one image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    pub labels: Vec<String>,
    pub categories: Vec<String>,
    /// Pose, clothing state, composition, setting and similar descriptors.
    pub characteristics: Vec<String>,
    pub description: String,
    /// One of sfw, suggestive, artistic_nudity, explicit; empty if unknown.
    pub maturity_level: String,
    pub nsfw_score: f64,
    pub confidence: f64,
}

/// Capability for turning image bytes into labels.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image_path: &Path) -> Result<Classification, ClassifyError>;
    async fn classify_bytes(&self, image_data: &[u8]) -> Result<Classification, ClassifyError>;
}

/// Classifier that never produces labels, for when recognition is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClassifier;

#[async_trait]
impl Classifier for NoopClassifier {
    async fn classify(&self, _image_path: &Path) -> Result<Classification, ClassifyError> {
        Ok(Classification::default())
    }

    async fn classify_bytes(&self, _image_data: &[u8]) -> Result<Classification, ClassifyError> {
        Ok(Classification::default())
    }
}

const CLASSIFY_PROMPT: &str = r#"Analyze this image objectively and provide detailed tagging information.

Provide:
1. Main objects, subjects, and people visible
2. Overall categories (e.g., landscape, portrait, meme, screenshot, art, photo)
3. Content characteristics (pose type, composition, setting, mood)
4. Descriptive tags that would help organize and search for this image
5. If applicable, maturity level: sfw, suggestive, artistic_nudity, explicit

Respond in JSON format:
{
    "objects": ["specific objects, people, or subjects"],
    "categories": ["primary categories"],
    "characteristics": ["descriptive characteristics"],
    "description": "detailed one-sentence description",
    "tags": ["comprehensive searchable tags"],
    "maturity_level": "sfw|suggestive|artistic_nudity|explicit"
}"#;

const NSFW_PROMPT: &str = "Is this image safe for work (SFW) or not safe for work (NSFW)?\n\
Rate the NSFW content on a scale of 0.0 (completely safe) to 1.0 (explicit content).\n\
Respond with only a number between 0.0 and 1.0.";

/// Classifier backed by an Ollama-compatible vision model endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClassifier {
    http: reqwest::Client,
    base_url: String,
    model: String,
    enable_nsfw: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaClassifier {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, model: &str, enable_nsfw: bool) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            enable_nsfw,
        })
    }

    async fn generate(&self, prompt: &str, image_b64: &str) -> Result<String, ClassifyError> {
        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "images": [image_b64],
                "stream": false,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::BadStatus { status, body });
        }

        let generated: GenerateResponse = response.json().await?;
        Ok(generated.response)
    }

    async fn detect_nsfw(&self, image_b64: &str) -> Result<f64, ClassifyError> {
        let response = self.generate(NSFW_PROMPT, image_b64).await?;
        Ok(parse_nsfw_score(&response))
    }
}

#[async_trait]
impl Classifier for OllamaClassifier {
    async fn classify(&self, image_path: &Path) -> Result<Classification, ClassifyError> {
        let image_data = tokio::fs::read(image_path).await?;
        self.classify_bytes(&image_data).await
    }

    async fn classify_bytes(&self, image_data: &[u8]) -> Result<Classification, ClassifyError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_data);
        debug!(
            image_bytes = image_data.len(),
            model = %self.model,
            "Requesting image classification"
        );

        let response = self.generate(CLASSIFY_PROMPT, &encoded).await?;

        let mut classification = match parse_model_response(&response) {
            Some(c) => {
                debug!(
                    labels = c.labels.len(),
                    categories = c.categories.len(),
                    "Parsed structured classification"
                );
                c
            }
            None => {
                warn!("Model response was not valid JSON, using fallback token parsing");
                fallback_parse(&response)
            }
        };

        if self.enable_nsfw {
            match self.detect_nsfw(&encoded).await {
                Ok(score) => classification.nsfw_score = score,
                Err(e) => warn!("NSFW detection failed: {e}"),
            }
        }

        info!(
            total_tags = classification.labels.len() + classification.categories.len(),
            "Classification complete"
        );
        Ok(classification)
    }
}

/// Extract the JSON object between the first `{` and last `}` of the model
/// text and decode it. The model output is the one place an open map is
/// tolerated; everything it yields is lifted into the typed struct here.
fn parse_model_response(response: &str) -> Option<Classification> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }

    let data: serde_json::Value = serde_json::from_str(&response[start..=end]).ok()?;

    let string_list = |key: &str| -> Vec<String> {
        data.get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let mut labels = string_list("objects");
    // Tags are folded into labels; they serve the same purpose downstream.
    labels.extend(string_list("tags"));

    Some(Classification {
        labels,
        categories: string_list("categories"),
        characteristics: string_list("characteristics"),
        description: data
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        maturity_level: data
            .get("maturity_level")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        nsfw_score: 0.0,
        confidence: 0.8,
    })
}

/// Words worth keeping when the model response has to be tokenized.
const COMMON_SUBJECTS: &[&str] = &[
    "photo", "image", "picture", "landscape", "portrait", "nature", "person", "people", "animal",
    "building", "sky", "water", "tree", "flower", "car", "food", "art", "meme", "screenshot",
    "text", "diagram",
];

/// Last-resort extraction when the model ignores the JSON instruction:
/// keep tokens from a small closed vocabulary, at reduced confidence.
fn fallback_parse(response: &str) -> Classification {
    let mut labels: Vec<String> = Vec::new();

    for word in response.split_whitespace() {
        let cleaned = word
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .to_lowercase();
        if cleaned.len() > 2
            && cleaned.len() < 20
            && COMMON_SUBJECTS.contains(&cleaned.as_str())
            && !labels.contains(&cleaned)
        {
            labels.push(cleaned);
        }
    }

    let description: String = response.chars().take(200).collect();

    Classification {
        labels,
        categories: vec!["general".to_string()],
        description,
        confidence: 0.5,
        ..Classification::default()
    }
}

/// Interpret the NSFW prompt's answer: a leading number clamped to [0, 1],
/// else keyword heuristics, else "uncertain".
fn parse_nsfw_score(response: &str) -> f64 {
    let trimmed = response.trim();
    let numeric_prefix: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    if let Ok(score) = numeric_prefix.parse::<f64>() {
        return score.clamp(0.0, 1.0);
    }

    let lower = trimmed.to_lowercase();
    if lower.contains("nsfw") || lower.contains("explicit") {
        return 0.9;
    }
    if lower.contains("sfw") || lower.contains("safe") {
        return 0.1;
    }
    0.5
}
