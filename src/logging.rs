use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Result, StoreError};

/// Installs the global `fmt` subscriber writing to stderr. The filter comes
/// from `RUST_LOG` and falls back to `rowmirror=info`.
pub fn init() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "rowmirror=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|err| StoreError::Logging(err.to_string()))
}
