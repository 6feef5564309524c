//! Integration tests for the catalog store.

use lemmy_media_harvester::db::{
    self, Database, MediaFilter, NewMedia, NewMetadata, RunStatus, StoreError, TimelinePeriod,
};
use lemmy_media_harvester::lemmy::{
    Comment, CommentCounts, CommentView, Community, Creator, Post, PostCounts, PostView,
};
use tempfile::TempDir;

async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

fn post_view(post_id: i64, community: &str) -> PostView {
    PostView {
        post: Post {
            id: post_id,
            name: format!("Post {post_id}"),
            url: Some(format!("https://example.com/{post_id}.jpg")),
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
            name: community.to_string(),
        },
        counts: PostCounts {
            score: 42,
            comments: 0,
        },
    }
}

fn new_media(post_id: i64, url: &str, hash: &str) -> NewMedia {
    NewMedia {
        post_id,
        post_title: format!("Post {post_id}"),
        community_name: "pics".to_string(),
        community_id: 3,
        author_name: "poster".to_string(),
        author_id: 7,
        media_url: url.to_string(),
        media_hash: hash.to_string(),
        file_name: format!("{post_id}_file.jpg"),
        file_path: format!("/tmp/media/pics/{post_id}_file.jpg"),
        file_size: 1234,
        media_type: "image".to_string(),
        post_url: url.to_string(),
        post_score: 42,
        post_created: "2024-05-01T12:00:00Z".to_string(),
    }
}

fn comment_view(comment_id: i64, post_id: i64, removed: bool, deleted: bool) -> CommentView {
    CommentView {
        comment: Comment {
            id: comment_id,
            post_id,
            content: format!("comment {comment_id}"),
            path: format!("0.{comment_id}"),
            published: "2024-05-01T13:00:00Z".to_string(),
            updated: None,
            removed,
            deleted,
            distinguished: false,
        },
        creator: Creator {
            id: 11,
            name: "commenter".to_string(),
        },
        counts: CommentCounts {
            score: 5,
            upvotes: 6,
            downvotes: 1,
            child_count: 0,
        },
    }
}

#[tokio::test]
async fn test_mark_post_scraped_is_idempotent() {
    let (db, _temp_dir) = setup_db().await;
    let post = post_view(100, "pics");

    assert!(!db::post_exists(db.pool(), 100).await.unwrap());

    db::mark_post_scraped(db.pool(), &post, 2).await.unwrap();
    db::mark_post_scraped(db.pool(), &post, 2).await.unwrap();
    db::mark_post_scraped(db.pool(), &post, 3).await.unwrap();

    assert!(db::post_exists(db.pool(), 100).await.unwrap());
    assert_eq!(db::count_posts(db.pool()).await.unwrap(), 1);

    let stored = db::get_post(db.pool(), 100).await.unwrap().unwrap();
    assert_eq!(stored.media_count, 3);
    assert!(stored.had_media);
}

#[tokio::test]
async fn test_save_media_rejects_duplicate_hash() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();
    db::mark_post_scraped(db.pool(), &post_view(2, "pics"), 0)
        .await
        .unwrap();

    let first = new_media(1, "https://example.com/a.jpg", "hash-aaa");
    let id = db::save_media(db.pool(), &first).await.unwrap();
    assert!(id > 0);
    assert!(db::media_exists(db.pool(), "hash-aaa").await.unwrap());

    // Same bytes under a different URL and post
    let second = new_media(2, "https://example.com/b.jpg", "hash-aaa");
    let err = db::save_media(db.pool(), &second).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateHash));

    let existing = db::get_media_by_hash(db.pool(), "hash-aaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(existing.id, id);
}

#[tokio::test]
async fn test_save_media_rejects_duplicate_post_url() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();

    let first = new_media(1, "https://example.com/a.jpg", "hash-one");
    db::save_media(db.pool(), &first).await.unwrap();

    // Same (post, URL) with different content
    let second = new_media(1, "https://example.com/a.jpg", "hash-two");
    let err = db::save_media(db.pool(), &second).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicatePostUrl));
}

#[tokio::test]
async fn test_comments_upsert_and_filtered_reads() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(5, "pics"), 1)
        .await
        .unwrap();

    assert!(!db::comments_exist_for_post(db.pool(), 5).await.unwrap());

    db::save_comment(db.pool(), &comment_view(201, 5, false, false))
        .await
        .unwrap();
    db::save_comment(db.pool(), &comment_view(202, 5, true, false))
        .await
        .unwrap();
    db::save_comment(db.pool(), &comment_view(203, 5, false, true))
        .await
        .unwrap();
    // Upsert the first again; no duplicate row appears
    db::save_comment(db.pool(), &comment_view(201, 5, false, false))
        .await
        .unwrap();

    assert!(db::comments_exist_for_post(db.pool(), 5).await.unwrap());

    // Removed and deleted comments are stored but not readable
    let readable = db::get_comments_for_post(db.pool(), 5).await.unwrap();
    assert_eq!(readable.len(), 1);
    assert_eq!(readable[0].comment_id, 201);
}

#[tokio::test]
async fn test_search_finds_media_by_title() {
    let (db, _temp_dir) = setup_db().await;
    assert!(db.fts_available(), "bundled SQLite should include FTS5");

    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();

    let mut media = new_media(1, "https://example.com/cat.jpg", "hash-cat");
    media.post_title = "A very fluffy cat".to_string();
    db::save_media(db.pool(), &media).await.unwrap();

    let (rows, total) = db::search_media(&db, "fluffy", 10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].media_hash, "hash-cat");

    let (rows, total) = db::search_media(&db, "submarine", 10, 0).await.unwrap();
    assert_eq!(total, 0);
    assert!(rows.is_empty());

    // Empty queries return nothing rather than matching everything
    let (rows, _) = db::search_media(&db, "   ", 10, 0).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_search_index_follows_deletes() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();

    let mut media = new_media(1, "https://example.com/dog.jpg", "hash-dog");
    media.post_title = "Unique doggo".to_string();
    let id = db::save_media(db.pool(), &media).await.unwrap();

    let (_, total) = db::search_media(&db, "doggo", 10, 0).await.unwrap();
    assert_eq!(total, 1);

    sqlx::query("DELETE FROM scraped_media WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();

    let (_, total) = db::search_media(&db, "doggo", 10, 0).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn test_media_filters_and_sort_whitelist() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();
    db::mark_post_scraped(db.pool(), &post_view(2, "videos"), 0)
        .await
        .unwrap();

    let mut a = new_media(1, "https://example.com/a.jpg", "hash-a");
    a.file_size = 100;
    db::save_media(db.pool(), &a).await.unwrap();

    let mut b = new_media(2, "https://example.com/b.mp4", "hash-b");
    b.community_name = "videos".to_string();
    b.media_type = "video".to_string();
    b.file_size = 200;
    db::save_media(db.pool(), &b).await.unwrap();

    // Filter by community
    let filter = MediaFilter {
        community: Some("videos".to_string()),
        limit: 10,
        ..MediaFilter::default()
    };
    let (rows, total) = db::get_media_with_filters(db.pool(), &filter).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].media_hash, "hash-b");

    // Filter by kind
    let filter = MediaFilter {
        media_type: Some("image".to_string()),
        limit: 10,
        ..MediaFilter::default()
    };
    let (rows, total) = db::get_media_with_filters(db.pool(), &filter).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].media_hash, "hash-a");

    // Sort by size ascending
    let filter = MediaFilter {
        sort_by: "file_size".to_string(),
        sort_order: "ASC".to_string(),
        limit: 10,
        ..MediaFilter::default()
    };
    let (rows, _) = db::get_media_with_filters(db.pool(), &filter).await.unwrap();
    assert_eq!(rows[0].file_size, 100);
    assert_eq!(rows[1].file_size, 200);

    // A sort field outside the whitelist is coerced, not interpolated
    let filter = MediaFilter {
        sort_by: "id; DROP TABLE scraped_media".to_string(),
        sort_order: "sideways".to_string(),
        limit: 10,
        ..MediaFilter::default()
    };
    let (rows, total) = db::get_media_with_filters(db.pool(), &filter).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_stats_and_aggregations() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();

    for (i, hash) in ["h1", "h2", "h3"].iter().enumerate() {
        let mut media = new_media(1, &format!("https://example.com/{i}.jpg"), hash);
        media.file_size = 1000;
        if i == 2 {
            media.media_type = "video".to_string();
        }
        db::save_media(db.pool(), &media).await.unwrap();
    }

    let stats = db::get_stats(db.pool()).await.unwrap();
    assert_eq!(stats.total_media, 3);
    assert_eq!(stats.total_posts, 1);
    assert_eq!(stats.total_size_bytes, 3000);
    assert_eq!(stats.top_communities[0].community_name, "pics");

    let images = stats
        .by_type
        .iter()
        .find(|t| t.media_type == "image")
        .unwrap();
    assert_eq!(images.count, 2);

    let timeline = db::get_timeline(db.pool(), TimelinePeriod::Day).await.unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].count, 3);
    assert_eq!(timeline[0].total_bytes, 3000);

    let creators = db::get_top_creators(db.pool(), 5).await.unwrap();
    assert_eq!(creators.len(), 1);
    assert_eq!(creators[0].media_count, 3);

    let storage = db::get_storage_breakdown(db.pool()).await.unwrap();
    assert_eq!(storage.by_community.len(), 1);
    assert_eq!(storage.by_type.len(), 2);

    let communities = db::get_communities(db.pool()).await.unwrap();
    assert_eq!(communities[0].count, 3);
}

#[tokio::test]
async fn test_tag_lifecycle_and_cascades() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();
    let media_id = db::save_media(db.pool(), &new_media(1, "https://example.com/a.jpg", "h1"))
        .await
        .unwrap();

    let tag_id = db::create_tag(db.pool(), "sunset", "#F59E0B", true)
        .await
        .unwrap();
    let by_name = db::get_tag_by_name(db.pool(), "sunset").await.unwrap().unwrap();
    assert_eq!(by_name.id, tag_id);
    assert!(by_name.auto_generated);

    db::assign_tag(db.pool(), media_id, tag_id).await.unwrap();
    // Duplicate assignment is a no-op, not an error
    db::assign_tag(db.pool(), media_id, tag_id).await.unwrap();

    let tags = db::get_tags_for_media(db.pool(), media_id).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].name, "sunset");

    // Tagged images disappear from the untagged listing
    assert!(db::get_untagged_images(db.pool()).await.unwrap().is_empty());

    db::unassign_tag(db.pool(), media_id, tag_id).await.unwrap();
    let untagged = db::get_untagged_images(db.pool()).await.unwrap();
    assert_eq!(untagged.len(), 1);
    assert_eq!(untagged[0].id, media_id);

    // Deleting a tag cascades its assignments away
    db::assign_tag(db.pool(), media_id, tag_id).await.unwrap();
    db::delete_tag(db.pool(), tag_id).await.unwrap();
    assert!(db::get_tags_for_media(db.pool(), media_id).await.unwrap().is_empty());
    assert!(db::get_tag_by_id(db.pool(), tag_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_thumbnail_and_metadata_rows() {
    let (db, _temp_dir) = setup_db().await;
    db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
        .await
        .unwrap();
    let media_id = db::save_media(db.pool(), &new_media(1, "https://example.com/a.jpg", "h1"))
        .await
        .unwrap();

    db::save_thumbnail(db.pool(), media_id, "/thumbs/1_file.jpg", 400, 300)
        .await
        .unwrap();
    let thumb = db::get_thumbnail(db.pool(), media_id).await.unwrap().unwrap();
    assert_eq!(thumb.thumbnail_path, "/thumbs/1_file.jpg");
    assert_eq!(thumb.width, Some(400));

    let metadata = NewMetadata {
        width: Some(1920),
        height: Some(1080),
        nsfw_score: Some(0.1),
        ai_classifications: Some(r#"{"labels":["cat"]}"#.to_string()),
        ..NewMetadata::default()
    };
    db::save_metadata(db.pool(), media_id, &metadata).await.unwrap();
    let stored = db::get_metadata(db.pool(), media_id).await.unwrap().unwrap();
    assert_eq!(stored.width, Some(1920));
    assert_eq!(stored.nsfw_score, Some(0.1));
    assert!(stored.analyzed_at.is_some());
}

#[tokio::test]
async fn test_run_lifecycle() {
    let (db, _temp_dir) = setup_db().await;

    let run_id = db::start_run(db.pool()).await.unwrap();
    db::update_run(db.pool(), run_id, 10, 4, 1).await.unwrap();
    db::complete_run(db.pool(), run_id, RunStatus::Completed)
        .await
        .unwrap();

    let runs = db::recent_runs(db.pool(), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].posts_processed, 10);
    assert_eq!(runs[0].media_downloaded, 4);
    assert_eq!(runs[0].errors_count, 1);
    assert_eq!(runs[0].status, "completed");
    assert!(runs[0].completed_at.is_some());
}

#[tokio::test]
async fn test_reopen_preserves_data() {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("reopen.sqlite");

    {
        let db = Database::new(&db_path).await.unwrap();
        db::mark_post_scraped(db.pool(), &post_view(1, "pics"), 0)
            .await
            .unwrap();
        db::save_media(db.pool(), &new_media(1, "https://example.com/a.jpg", "h1"))
            .await
            .unwrap();
    }

    // Second open must not touch existing data (create-if-not-exists only)
    let db = Database::new(&db_path).await.unwrap();
    assert!(db::post_exists(db.pool(), 1).await.unwrap());
    assert!(db::media_exists(db.pool(), "h1").await.unwrap());
    let stats = db::get_stats(db.pool()).await.unwrap();
    assert_eq!(stats.total_media, 1);
}
