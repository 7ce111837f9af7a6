use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `--log-level`/`EASEL_LOG` wins over
/// `RUST_LOG`; anything unparsable falls back to `info`.
pub fn init_logging(level: Option<&str>) {
    let directive = level
        .map(str::to_string)
        .filter(|value| !value.trim().is_empty())
        .or_else(|| env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());
    let filter_layer = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(filter_layer)
        .init();

    tracing::debug!(filter = %directive, "tracing initialised");
}
