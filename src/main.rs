use std::sync::Arc;

use dirauth::{app, config, initialize_state, telemetry};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let config: Arc<config::Configuration> = config::Configuration::default().read()?;

    let otlp_logs = config
        .telemetry
        .otlp_endpoint
        .as_deref()
        .map(telemetry::setup_logging)
        .transpose()?;

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(otlp_logs)
        .init();

    let tracer = match config.telemetry.otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let provider = telemetry::setup_tracer(endpoint)?;
            opentelemetry::global::set_tracer_provider(provider.clone());
            Some(provider)
        },
        None => None,
    };

    let metrics = telemetry::setup_metrics_recorder()?;
    let state = match initialize_state(Arc::clone(&config), Some(metrics)) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "cannot build authentication engine");
            return Err(err.into());
        },
    };

    let listener = tokio::net::TcpListener::bind(&config.address).await?;
    tracing::info!(
        address = %config.address,
        version = config.version(),
        login = %config.login.path,
        "server started"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = tracer {
        if let Err(err) = provider.shutdown() {
            tracing::warn!(%err, "tracer provider did not shut down cleanly");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
