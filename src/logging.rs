//! Logging setup for host processes

use crate::error::{PipelineError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber
///
/// `RUST_LOG` wins when set; otherwise `cryoflow` logs at debug level when
/// `verbose`, info otherwise.
pub fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "cryoflow=debug" } else { "cryoflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| PipelineError::Internal(format!("Failed to set logging subscriber: {}", e)))
}
