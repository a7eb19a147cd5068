use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// Install the global subscriber, RUST_LOG wins over the default level
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()?;
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()?;
    }
    Ok(())
}
