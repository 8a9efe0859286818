use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "eventlens=debug";

/// Initialize tracing with an `EnvFilter` from `RUST_LOG` and a fmt layer.
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    tracing::debug!(default_filter = DEFAULT_FILTER, "Telemetry initialized");
    Ok(())
}

pub async fn shutdown_telemetry() {
    tracing::debug!("Telemetry shutdown");
}
