use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use restraint_core::config::LogFormat;

const DEFAULT_FILTER: &str = "restraint=info,restraint_engine=debug";

/// Initialize tracing with an `EnvFilter` (`RUST_LOG`) and a plain or JSON
/// formatter.
pub fn init_telemetry(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?,
    }

    Ok(())
}
