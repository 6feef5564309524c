//! Live scrape progress: a single writer, many WebSocket readers.
//!
//! Mutators take the write lock briefly, update the state, release, and
//! then publish an immutable snapshot into a bounded broadcast channel.
//! A full channel drops the snapshot: the counters are the source of truth
//! and the next published snapshot carries listeners up to date.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Bounded fan-out capacity; bursts beyond this are dropped, not queued.
const BROADCAST_CAPACITY: usize = 100;

/// Snapshot of the scraper's state, also the WebSocket wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    pub is_running: bool,
    pub current_community: String,
    pub posts_processed: u64,
    pub media_downloaded: u64,
    pub errors_count: u64,
    pub current_operation: String,
    /// Percent complete, 0-100; 0 when unknown.
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

/// Tracks scrape progress and fans snapshots out to listeners.
#[derive(Debug)]
pub struct Tracker {
    state: RwLock<Status>,
    tx: broadcast::Sender<Status>,
}

impl Tracker {
    /// Create a tracker and spawn its 1 Hz ETA recalculation loop.
    ///
    /// The loop holds only a weak reference, so dropping the last `Arc`
    /// stops it.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let tracker = Arc::new(Self {
            state: RwLock::new(Status::default()),
            tx,
        });

        let weak = Arc::downgrade(&tracker);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let Some(tracker) = weak.upgrade() else { break };
                tracker.update_eta().await;
            }
        });

        tracker
    }

    /// Subscribe to snapshot broadcasts.
    ///
    /// A lagging receiver observes `RecvError::Lagged` and simply resumes
    /// with the newest snapshot; counters never go backward within a run.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Status> {
        self.tx.subscribe()
    }

    /// Current snapshot.
    pub async fn status(&self) -> Status {
        self.state.read().await.clone()
    }

    /// Mark the beginning of a scrape session, resetting all counters.
    pub async fn start(&self) {
        {
            let mut state = self.state.write().await;
            *state = Status {
                is_running: true,
                started_at: Some(Utc::now()),
                ..Status::default()
            };
        }
        self.publish().await;
    }

    /// Mark the end of a scrape session.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            state.is_running = false;
            state.current_operation = "Completed".to_string();
            state.progress = 100.0;
        }
        self.publish().await;
    }

    pub async fn set_community(&self, community: &str) {
        {
            let mut state = self.state.write().await;
            state.current_community = community.to_string();
            state.current_operation = format!("Scraping {community}");
        }
        self.publish().await;
    }

    pub async fn set_operation(&self, operation: &str) {
        {
            let mut state = self.state.write().await;
            state.current_operation = operation.to_string();
        }
        self.publish().await;
    }

    pub async fn set_progress(&self, progress: f64) {
        {
            let mut state = self.state.write().await;
            state.progress = progress.clamp(0.0, 100.0);
        }
        self.publish().await;
    }

    pub async fn increment_posts(&self) {
        {
            let mut state = self.state.write().await;
            state.posts_processed += 1;
        }
        self.publish().await;
    }

    pub async fn increment_media(&self) {
        {
            let mut state = self.state.write().await;
            state.media_downloaded += 1;
        }
        self.publish().await;
    }

    pub async fn increment_errors(&self) {
        {
            let mut state = self.state.write().await;
            state.errors_count += 1;
        }
        self.publish().await;
    }

    /// Copy the snapshot out of the lock, then send; listener writes never
    /// happen under the state lock.
    async fn publish(&self) {
        let snapshot = self.state.read().await.clone();
        // No receivers, or a full channel, both mean "drop this snapshot".
        let _ = self.tx.send(snapshot);
    }

    /// Recompute the ETA from the average time per post so far.
    async fn update_eta(&self) {
        let mut state = self.state.write().await;
        if !state.is_running || state.posts_processed == 0 {
            return;
        }
        let Some(started_at) = state.started_at else {
            return;
        };

        let elapsed = Utc::now().signed_duration_since(started_at);
        let avg_per_post = elapsed / state.posts_processed as i32;

        // With no percent signal, assume we are halfway through.
        let estimated_total = if state.progress > 0.0 {
            (state.posts_processed as f64 / (state.progress / 100.0)) as u64
        } else {
            state.posts_processed * 2
        };

        let remaining = estimated_total.saturating_sub(state.posts_processed);
        let eta = avg_per_post * remaining as i32;
        state.eta = Some(format_eta(eta));
        debug!(remaining, eta = %state.eta.as_deref().unwrap_or(""), "Recomputed ETA");
    }
}

fn format_eta(eta: chrono::Duration) -> String {
    let minutes = eta.num_minutes();
    if minutes < 1 {
        "< 1 minute".to_string()
    } else if minutes < 60 {
        format!("{minutes} minutes")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}
