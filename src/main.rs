use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wayback_importer::config::Config;
use wayback_importer::db::Database;
use wayback_importer::importer::Pipeline;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting wayback-importer");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let domain = std::env::var("IMPORT_DOMAIN")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| std::env::args().nth(1))
        .context("No domain given: set IMPORT_DOMAIN or pass it as the first argument")?;

    info!(
        domain = %domain,
        wp_url = %config.wp_url,
        before = %config.before_date,
        rate_limit = config.rate_limit_per_sec,
        workers = config.worker_concurrency,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;

    info!(path = %config.database_path.display(), "Database initialized");

    let pipeline = Pipeline::new(config, db).context("Failed to initialize pipeline")?;

    // Stop scheduling new pages on Ctrl+C / SIGTERM; in-flight pages finish.
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested, finishing in-flight pages");
        cancel.cancel();
    });

    let summary = pipeline.run(&domain).await?;

    info!(
        captures = summary.discovery.captures,
        discovered = summary.discovery.inserted,
        published = summary.publish.published,
        failed = summary.publish.failed,
        skipped = summary.publish.skipped,
        rewritten = summary.rewrite.map_or(0, |r| r.rewritten),
        "Run complete"
    );
    info!(
        discovered = summary.counts.discovered,
        fetched = summary.counts.fetched,
        publish_failed = summary.counts.publish_failed,
        published = summary.counts.published,
        rewritten = summary.counts.rewritten,
        "Pages by status"
    );

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wayback_importer=debug"));

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

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
