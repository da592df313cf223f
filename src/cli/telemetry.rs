use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialise the subscriber. An explicit verbosity flag wins; otherwise
/// `RUST_LOG` applies, defaulting to `info` for the daemon's own crate.
///
/// # Errors
///
/// Returns an error if a subscriber is already installed.
pub fn init(level: Option<tracing::Level>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::new(format!("{}={level}", env!("CARGO_PKG_NAME"))),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(concat!(env!("CARGO_PKG_NAME"), "=info"))),
    };

    Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}
