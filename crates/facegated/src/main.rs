use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod api_error;
mod config;
mod engine;
mod http_interface;
mod rate_limiter;
mod reference;
mod store;
#[cfg(test)]
mod test_support;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        "facegated starting"
    );

    if config.verify_models {
        facegate_core::models::verify_models_dir(&config.model_dir)
            .context("model integrity check failed (set FACEGATE_VERIFY_MODELS=0 to skip)")?;
    } else {
        tracing::warn!("model checksum verification disabled");
    }

    let extractor = facegate_core::OnnxExtractor::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
    )
    .context("failed to load ONNX models")?;

    if config.allow_private_fetch {
        tracing::warn!("reference URLs may point at private and loopback hosts");
    }
    let engine = engine::spawn_engine(extractor, config.policy, config.fetch_limits())?;

    let store = store::AccountStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;
    tracing::info!(accounts = store.count_all().await?, "account store ready");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let app = http_interface::router(http_interface::AppState::new(config, engine, store));

    tracing::info!("facegated ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("facegated shutting down");
    Ok(())
}
