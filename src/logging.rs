//! Log output setup.

use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` when set, otherwise `level` for this crate
/// and `warn` for everything else.
pub fn filter(level: &str) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,dielectric_daq={}", level))
        .map_err(|e| DaqError::Configuration(format!("invalid log level '{}': {}", level, e)))
}

/// Installs the global subscriber. `format` is `text` or `json`.
///
/// Fails if a subscriber is already installed.
pub fn init(level: &str, format: &str) -> AppResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(level)?)
        .with_target(false);

    let installed = match format {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| DaqError::Configuration(format!("cannot install logger: {}", e)))
}
