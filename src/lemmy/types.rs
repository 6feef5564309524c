//! Typed views of the Lemmy v3 API responses.
//!
//! Only the fields the harvester consumes are deserialized; the API sends
//! considerably more.

use serde::{Deserialize, Serialize};

/// A post as returned by `GET /api/v3/post/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostView {
    pub post: Post,
    pub creator: Creator,
    pub community: Community,
    pub counts: PostCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    /// Lemmy calls the post title "name".
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub embed_video_url: Option<String>,
    pub published: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Creator {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCounts {
    pub score: i64,
    #[serde(default)]
    pub comments: i64,
}

/// A comment as returned by `GET /api/v3/comment/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentView {
    pub comment: Comment,
    pub creator: Creator,
    pub counts: CommentCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub content: String,
    /// Materialized dotted path of ancestor ids, e.g. "0.41.57".
    pub path: String,
    pub published: String,
    /// Present only when the comment was edited.
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub distinguished: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentCounts {
    pub score: i64,
    #[serde(default)]
    pub upvotes: i64,
    #[serde(default)]
    pub downvotes: i64,
    #[serde(default)]
    pub child_count: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    #[serde(default)]
    pub jwt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PostListResponse {
    pub posts: Vec<PostView>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommentListResponse {
    pub comments: Vec<CommentView>,
}
