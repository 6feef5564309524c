//! End-to-end scrape sessions against a mocked Lemmy instance.

use std::sync::Arc;

use lemmy_media_harvester::config::Config;
use lemmy_media_harvester::db::{self, Database};
use lemmy_media_harvester::downloader::Downloader;
use lemmy_media_harvester::lemmy::{
    Community, Creator, LemmyClient, Post, PostCounts, PostView,
};
use lemmy_media_harvester::progress::Tracker;
use lemmy_media_harvester::scraper::Scraper;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn post_view(post_id: i64, url: Option<String>) -> PostView {
    PostView {
        post: Post {
            id: post_id,
            name: format!("Post {post_id}"),
            url,
            thumbnail_url: None,
            embed_video_url: None,
            published: "2024-05-01T12:00:00Z".to_string(),
        },
        creator: Creator {
            id: 7,
            name: "poster".to_string(),
        },
        community: Community {
            id: 3,
            name: "pics".to_string(),
        },
        counts: PostCounts {
            score: 1,
            comments: 0,
        },
    }
}

fn test_config(temp_dir: &TempDir, instance: &str) -> Config {
    let mut config = Config::default();
    config.lemmy.instance = instance.to_string();
    config.lemmy.username = "harvester".to_string();
    config.lemmy.password = "hunter2".to_string();
    config.storage.base_directory = temp_dir
        .path()
        .join("media")
        .to_string_lossy()
        .into_owned();
    config.database.path = temp_dir
        .path()
        .join("test.sqlite")
        .to_string_lossy()
        .into_owned();
    config.run_mode.mode = "once".to_string();
    config.set_defaults();
    config
}

async fn mock_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v3/user/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jwt": "test-token"})))
        .mount(server)
        .await;
}

async fn build_scraper(config: Config, db: Database) -> Scraper {
    let client = LemmyClient::authenticate(
        &config.lemmy.instance,
        &config.lemmy.username,
        &config.lemmy.password,
    )
    .await
    .expect("login against mock");

    let downloader =
        Downloader::new(db.clone(), &config.storage.base_directory).expect("downloader");

    Scraper::new(
        Arc::new(config),
        db,
        client,
        downloader,
        Tracker::new(),
        None,
        None,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_stop_at_seen_threshold_halts_the_session() {
    let temp_dir = TempDir::new().expect("temp dir");
    let server = MockServer::start().await;
    mock_login(&server).await;

    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("db");

    // Posts 1..=10 are already in the catalog
    for id in 1..=10 {
        db::mark_post_scraped(db.pool(), &post_view(id, None), 0)
            .await
            .unwrap();
    }

    // The feed leads with one fresh post, then a run of seen ones
    let feed: Vec<PostView> = [11, 1, 2, 3, 4, 5, 12]
        .into_iter()
        .map(|id| post_view(id, None))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/v3/post/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"posts": feed})))
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir, &server.uri());
    config.scraper.stop_at_seen_posts = true;
    config.scraper.seen_posts_threshold = 3;

    let scraper = build_scraper(config, db.clone()).await;
    let summary = scraper.run_session().await.expect("session");

    // Only post 11 was processed; the session stopped at the third
    // consecutive seen post, before ever reaching 4, 5, or 12
    assert_eq!(summary.posts_processed, 1);
    assert!(db::post_exists(db.pool(), 11).await.unwrap());
    assert!(!db::post_exists(db.pool(), 12).await.unwrap());

    let runs = db::recent_runs(db.pool(), 1).await.unwrap();
    assert_eq!(runs[0].status, "completed");
    assert_eq!(runs[0].posts_processed, 1);
}

#[tokio::test]
async fn test_skip_seen_continues_past_known_posts() {
    let temp_dir = TempDir::new().expect("temp dir");
    let server = MockServer::start().await;
    mock_login(&server).await;

    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("db");

    for id in 1..=3 {
        db::mark_post_scraped(db.pool(), &post_view(id, None), 0)
            .await
            .unwrap();
    }

    let feed: Vec<PostView> = [1, 2, 3, 20, 21]
        .into_iter()
        .map(|id| post_view(id, None))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/v3/post/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"posts": feed})))
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir, &server.uri());
    config.scraper.skip_seen_posts = true;

    let scraper = build_scraper(config, db.clone()).await;
    let summary = scraper.run_session().await.expect("session");

    // Seen posts are skipped without ending the session
    assert_eq!(summary.posts_processed, 2);
    assert!(db::post_exists(db.pool(), 20).await.unwrap());
    assert!(db::post_exists(db.pool(), 21).await.unwrap());
}

#[tokio::test]
async fn test_pagination_disabled_requests_a_single_page() {
    let temp_dir = TempDir::new().expect("temp dir");
    let server = MockServer::start().await;
    mock_login(&server).await;

    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("db");

    // A full page of 50 fresh posts would invite a second request if
    // pagination were on
    let feed: Vec<PostView> = (100..150).map(|id| post_view(id, None)).collect();
    Mock::given(method("GET"))
        .and(path("/api/v3/post/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"posts": feed})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&temp_dir, &server.uri());
    config.scraper.enable_pagination = false;
    config.scraper.max_posts_per_run = 200;
    config.set_defaults();
    // The clamp bounds a pagination-less run to one API page
    assert_eq!(config.scraper.max_posts_per_run, 50);

    let scraper = build_scraper(config, db.clone()).await;
    let summary = scraper.run_session().await.expect("session");

    assert_eq!(summary.posts_processed, 50);
    server.verify().await;
}

#[tokio::test]
async fn test_media_and_comments_flow_through_a_session() {
    let temp_dir = TempDir::new().expect("temp dir");
    let server = MockServer::start().await;
    mock_login(&server).await;

    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("db");

    let image_url = format!("{}/media/cat.png", server.uri());
    let feed = vec![post_view(21, Some(image_url))];
    Mock::given(method("GET"))
        .and(path("/api/v3/post/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"posts": feed})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/media/cat.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"png bytes".to_vec())
                .insert_header("content-type", "image/png"),
        )
        .mount(&server)
        .await;

    // Three comments, one of them deleted upstream
    let comments = json!({"comments": [
        {
            "comment": {"id": 501, "post_id": 21, "content": "first", "path": "0.501",
                         "published": "2024-05-01T13:00:00Z", "removed": false,
                         "deleted": false, "distinguished": false},
            "creator": {"id": 11, "name": "alice"},
            "counts": {"score": 3, "upvotes": 3, "downvotes": 0, "child_count": 1}
        },
        {
            "comment": {"id": 502, "post_id": 21, "content": "reply", "path": "0.501.502",
                         "published": "2024-05-01T13:05:00Z", "removed": false,
                         "deleted": false, "distinguished": false},
            "creator": {"id": 12, "name": "bob"},
            "counts": {"score": 1, "upvotes": 1, "downvotes": 0, "child_count": 0}
        },
        {
            "comment": {"id": 503, "post_id": 21, "content": "", "path": "0.503",
                         "published": "2024-05-01T13:10:00Z", "removed": false,
                         "deleted": true, "distinguished": false},
            "creator": {"id": 13, "name": "carol"},
            "counts": {"score": 0, "upvotes": 0, "downvotes": 0, "child_count": 0}
        }
    ]});
    Mock::given(method("GET"))
        .and(path("/api/v3/comment/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(comments))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&temp_dir, &server.uri());
    let scraper = build_scraper(config, db.clone()).await;
    let summary = scraper.run_session().await.expect("session");

    assert_eq!(summary.posts_processed, 1);
    assert_eq!(summary.media_downloaded, 1);
    assert_eq!(summary.errors, 0);

    // Media row exists and the post is marked with its count
    let post = db::get_post(db.pool(), 21).await.unwrap().unwrap();
    assert!(post.had_media);
    assert_eq!(post.media_count, 1);

    // The deleted comment was dropped at capture time
    let readable = db::get_comments_for_post(db.pool(), 21).await.unwrap();
    assert_eq!(readable.len(), 2);
    assert_eq!(readable[0].comment_id, 501);
    assert_eq!(readable[0].path, "0.501");

    // A second session leaves comments untouched (already captured):
    // the mock's expect(1) verifies no second /comment/list call
    let config2 = test_config(&temp_dir, &server.uri());
    let scraper2 = build_scraper(config2, db.clone()).await;
    scraper2.run_session().await.expect("second session");
    server.verify().await;
}

#[tokio::test]
async fn test_failed_media_counts_as_error_not_abort() {
    let temp_dir = TempDir::new().expect("temp dir");
    let server = MockServer::start().await;
    mock_login(&server).await;

    let db = Database::new(&temp_dir.path().join("test.sqlite"))
        .await
        .expect("db");

    let broken_url = format!("{}/broken.jpg", server.uri());
    let good_url = format!("{}/good.jpg", server.uri());
    let feed = vec![
        post_view(31, Some(broken_url)),
        post_view(32, Some(good_url)),
    ];
    Mock::given(method("GET"))
        .and(path("/api/v3/post/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"posts": feed})))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/broken.jpg"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/good.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/comment/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"comments": []})))
        .mount(&server)
        .await;

    let config = test_config(&temp_dir, &server.uri());
    let scraper = build_scraper(config, db.clone()).await;
    let summary = scraper.run_session().await.expect("session");

    // The broken post is counted and logged; the session carries on
    assert_eq!(summary.posts_processed, 2);
    assert_eq!(summary.media_downloaded, 1);
    assert_eq!(summary.errors, 1);
    assert!(db::post_exists(db.pool(), 31).await.unwrap());
    assert!(db::post_exists(db.pool(), 32).await.unwrap());

    let runs = db::recent_runs(db.pool(), 1).await.unwrap();
    assert_eq!(runs[0].errors_count, 1);
    assert_eq!(runs[0].status, "completed");
}
