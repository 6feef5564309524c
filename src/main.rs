use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lemmy_media_harvester::config::Config;
use lemmy_media_harvester::db::{self, Database};
use lemmy_media_harvester::downloader::Downloader;
use lemmy_media_harvester::lemmy::LemmyClient;
use lemmy_media_harvester::progress::Tracker;
use lemmy_media_harvester::recognition::{Classifier, NoopClassifier, OllamaClassifier};
use lemmy_media_harvester::scraper::Scraper;
use lemmy_media_harvester::tags::TagManager;
use lemmy_media_harvester::thumbnails::Generator;
use lemmy_media_harvester::web;

/// Scrape Lemmy communities and archive their media.
#[derive(Parser)]
#[command(name = "lemmy-media-harvester", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print catalog statistics and exit
    #[arg(long)]
    stats: bool,

    /// Suppress the web server for this run
    #[arg(long)]
    no_web: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing(cli.verbose)?;

    info!("Starting lemmy-media-harvester");

    let mut config = Config::load(&cli.config).context("Failed to load configuration")?;
    if cli.no_web {
        config.web_server.enabled = false;
    }

    info!(
        instance = %config.lemmy.instance,
        communities = config.lemmy.communities.len(),
        sort = %config.scraper.sort_type,
        "Configuration loaded"
    );

    // Ensure data directories exist before anything opens them
    tokio::fs::create_dir_all(&config.storage.base_directory)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory: {}",
                config.storage.base_directory
            )
        })?;
    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let database = Database::new(Path::new(&config.database.path))
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized");

    if cli.stats {
        return print_stats(&database).await;
    }

    if config.search.rebuild_index {
        match database.rebuild_search_index().await {
            Ok(()) => info!("Search index rebuilt"),
            Err(e) => warn!("Could not rebuild search index: {e:#}"),
        }
    }

    let client = LemmyClient::authenticate(
        &config.lemmy.instance,
        &config.lemmy.username,
        &config.lemmy.password,
    )
    .await
    .context("Authentication failed")?;

    let config = Arc::new(config);
    let tracker = Tracker::new();
    let cancel = CancellationToken::new();

    let classifier: Arc<dyn Classifier> =
        if config.recognition.enabled && config.recognition.provider == "ollama" {
            info!(
                model = %config.recognition.model,
                url = %config.recognition.ollama_url,
                "Image recognition enabled"
            );
            Arc::new(OllamaClassifier::new(
                &config.recognition.ollama_url,
                &config.recognition.model,
                config.recognition.nsfw_detection,
            )?)
        } else {
            Arc::new(NoopClassifier)
        };

    let tags = Arc::new(TagManager::new(
        database.clone(),
        classifier,
        config.recognition.enabled && config.recognition.auto_tag,
    ));

    let thumbnails = config.thumbnails.enabled.then(|| {
        Generator::new(
            config.thumbnails.max_width,
            config.thumbnails.max_height,
            config.thumbnails.quality,
            &config.thumbnails.directory,
            "ffmpeg",
        )
    });

    // Web server runs alongside the scrape loop and is torn down after it
    let web_handle = if config.web_server.enabled {
        let web_config = config.clone();
        let web_db = database.clone();
        let web_tracker = tracker.clone();
        let web_tags = tags.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::serve(web_config, web_db, web_tracker, web_tags).await {
                error!("Web server error: {e:#}");
            }
        }))
    } else {
        info!("Web server disabled");
        None
    };

    let downloader = Downloader::new(database.clone(), &config.storage.base_directory)?;
    let scraper = Scraper::new(
        config.clone(),
        database,
        client,
        downloader,
        tracker,
        thumbnails,
        Some(tags),
        cancel.clone(),
    );

    // SIGINT/SIGTERM finish the current post and persist partial state
    spawn_signal_watcher(cancel.clone());

    if config.run_mode.mode == "continuous" {
        let interval = config
            .run_interval()
            .context("run_mode.interval is required for continuous mode")?;
        info!(interval_secs = interval.as_secs(), "Running continuously");

        while !cancel.is_cancelled() {
            if let Err(e) = scraper.run_session().await {
                error!("Scrape session error: {e:#}");
            }
            if cancel.is_cancelled() {
                break;
            }
            info!(secs = interval.as_secs(), "Sleeping until next session");
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.cancelled() => break,
            }
        }
    } else {
        scraper.run_session().await?;
    }

    if let Some(handle) = web_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn print_stats(database: &Database) -> Result<()> {
    let stats = db::get_stats(database.pool()).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    let runs = db::recent_runs(database.pool(), 10).await?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for run in runs {
            println!(
                "  #{} {} posts={} media={} errors={} ({})",
                run.id,
                run.started_at,
                run.posts_processed,
                run.media_downloaded,
                run.errors_count,
                run.status
            );
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "debug,sqlx=info,hyper=info"
    } else {
        "info,lemmy_media_harvester=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // Structured JSON logging when requested, pretty output otherwise
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

/// Cancel the scrape token on the first SIGINT or SIGTERM. The orchestrator
/// checks the token at post boundaries, so the current post completes and
/// its rows are persisted before the loop winds down.
fn spawn_signal_watcher(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut interrupt =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            let mut terminate =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            tokio::select! {
                _ = interrupt.recv() => info!("SIGINT received, finishing current post"),
                _ = terminate.recv() => info!("SIGTERM received, finishing current post"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Interrupt received, finishing current post");
        }

        cancel.cancel();
    });
}
