use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a global subscriber printing to stderr.
///
/// The level is taken from `RUST_LOG` and falls back to `info`. Use
/// `RUST_LOG=tasuki=trace` to see every task being scheduled, reused, and
/// finished.
///
/// Fails if a global subscriber was already installed.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()?;

    Ok(())
}
