mod types;

pub use types::*;

use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// Page size ceiling of the post list endpoint.
pub const PAGE_SIZE: u32 = 50;

const USER_AGENT: &str = concat!("lemmy-media-harvester/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ApiError {
    /// The instance rejected the credentials or returned no token.
    #[error("authentication failed for instance {instance}")]
    AuthFailed { instance: String },
    /// Any non-2xx from the feed or comment endpoints.
    #[error("upstream returned status {status}")]
    Upstream { status: reqwest::StatusCode },
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Authenticated client for one Lemmy instance.
///
/// All requests carry the JWT obtained at login as a bearer token.
#[derive(Debug, Clone)]
pub struct LemmyClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl LemmyClient {
    /// Authenticate against an instance and return a ready client.
    ///
    /// `instance` may be a bare hostname ("lemmy.ml") or a full URL.
    ///
    /// # Errors
    ///
    /// `AuthFailed` when the login is rejected or no JWT is issued;
    /// `Upstream`/`Network` for transport-level failures.
    pub async fn authenticate(
        instance: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, ApiError> {
        let base_url = if instance.starts_with("http://") || instance.starts_with("https://") {
            instance.trim_end_matches('/').to_string()
        } else {
            format!("https://{instance}")
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()?;

        debug!(instance = %base_url, username, "Logging in to Lemmy instance");

        let response = http
            .post(format!("{base_url}/api/v3/user/login"))
            .json(&json!({
                "username_or_email": username,
                "password": password,
            }))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            return Err(ApiError::AuthFailed {
                instance: base_url,
            });
        }
        if !response.status().is_success() {
            return Err(ApiError::Upstream {
                status: response.status(),
            });
        }

        let login: LoginResponse = response.json().await?;
        let Some(token) = login.jwt.filter(|t| !t.is_empty()) else {
            return Err(ApiError::AuthFailed {
                instance: base_url,
            });
        };

        info!(instance = %base_url, "Authenticated with Lemmy instance");

        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Fetch one page of posts (at most [`PAGE_SIZE`]) from a community feed,
    /// or from the instance's default feed when no community is given.
    ///
    /// # Errors
    ///
    /// `Upstream` on any non-2xx response.
    pub async fn get_page(
        &self,
        community: Option<&str>,
        sort: &str,
        page: u32,
    ) -> Result<Vec<PostView>, ApiError> {
        let mut request = self
            .http
            .get(format!("{}/api/v3/post/list", self.base_url))
            .bearer_auth(&self.token)
            .query(&[
                ("sort", sort.to_string()),
                ("page", page.to_string()),
                ("limit", PAGE_SIZE.to_string()),
            ]);

        if let Some(community) = community {
            request = request.query(&[("community_name", community)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ApiError::Upstream {
                status: response.status(),
            });
        }

        let list: PostListResponse = response.json().await?;
        debug!(page, posts = list.posts.len(), "Fetched post page");
        Ok(list.posts)
    }

    /// Fetch the comment tree for a post.
    ///
    /// # Errors
    ///
    /// `Upstream` on any non-2xx response.
    pub async fn get_comments(
        &self,
        post_id: i64,
        max_depth: u32,
        limit: u32,
        sort: &str,
    ) -> Result<Vec<CommentView>, ApiError> {
        let response = self
            .http
            .get(format!("{}/api/v3/comment/list", self.base_url))
            .bearer_auth(&self.token)
            .query(&[
                ("post_id", post_id.to_string()),
                ("max_depth", max_depth.to_string()),
                ("limit", limit.to_string()),
                ("sort", sort.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::Upstream {
                status: response.status(),
            });
        }

        let list: CommentListResponse = response.json().await?;
        debug!(post_id, comments = list.comments.len(), "Fetched comments");
        Ok(list.comments)
    }
}
