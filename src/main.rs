use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audiogate::config::Config;
use audiogate::extract::{self, YtDlpExtractor};
use audiogate::pipeline::{Integration, Pipeline};
use audiogate::registry::TokenRegistry;
use audiogate::server::{build_router, AppState};
use audiogate::store::HttpRemoteStore;
use audiogate::sweeper::{spawn_sweeper, spawn_vault_refresher};
use audiogate::vault::VaultSync;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiogate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;

    // Check for required external tools (non-fatal: they may appear later in
    // a container entrypoint, and failures surface per-job anyway).
    let missing = extract::check_dependencies(&config.app.yt_dlp_path).await;
    for warning in &missing {
        tracing::warn!("missing dependency: {}", warning);
    }

    fs_err::create_dir_all(&config.app.download_dir)
        .context("failed to create download directory")?;

    let registry = Arc::new(TokenRegistry::new());
    let extractor = Arc::new(YtDlpExtractor::new(
        config.app.yt_dlp_path.clone(),
        config.app.audio_bitrate,
    ));

    // Remote store is optional; without it the vault stays unconfigured and
    // jobs run standalone.
    let (vault, integration) = match &config.storage {
        Some(storage) => {
            let remote = Arc::new(HttpRemoteStore::new(
                storage.url.clone(),
                storage.service_key.clone(),
            ));
            let vault = Arc::new(VaultSync::new(
                Some(remote.clone() as Arc<dyn audiogate::store::ObjectStore>),
                storage.cookie_bucket.clone(),
                storage.cookie_object.clone(),
                config.app.cookie_file.clone(),
            ));
            let integration = Integration {
                objects: remote.clone(),
                records: remote,
                audio_bucket: storage.audio_bucket.clone(),
            };
            (vault, Some(integration))
        }
        None => {
            tracing::info!("remote store not configured, vault sync and uploads disabled");
            (
                Arc::new(VaultSync::unconfigured(config.app.cookie_file.clone())),
                None,
            )
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        registry.clone(),
        extractor,
        vault.clone(),
        config.app.max_concurrent_extractions,
        config.app.download_dir.clone(),
        integration,
    ));

    // Supervised background loops, stopped via the shutdown token.
    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        registry.clone(),
        config.app.token_ttl,
        config.app.sweep_interval,
        shutdown.clone(),
    );
    let refresher = config.storage.as_ref().map(|storage| {
        spawn_vault_refresher(vault.clone(), storage.sync_interval, shutdown.clone())
    });

    let app = build_router(AppState {
        pipeline,
        registry,
        vault,
    });

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "audiogate listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install Ctrl+C handler");
            }
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // Let the loops observe the cancellation before exiting.
    shutdown.cancel();
    let _ = sweeper.await;
    if let Some(refresher) = refresher {
        let _ = refresher.await;
    }

    Ok(())
}
