use eyre::{Result, WrapErr};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::models::{LogFormat, LoggingConfig};

/// Initialize structured logging from the router configuration. The
/// `RUST_LOG` environment variable overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(&config.level)
            .wrap_err_with(|| format!("invalid log level: {}", config.level))
    })?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .init(),
    }

    Ok(())
}

/// Create a request-scoped tracing span.
pub fn request_span(method: &str, path: &str, request_id: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        http.method = method,
        http.path = path,
        request.id = request_id,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span for one backend attempt.
pub fn backend_span(address: &str, attempt: usize) -> tracing::Span {
    tracing::info_span!(
        "backend_attempt",
        backend.address = address,
        attempt,
        http.status_code = tracing::field::Empty,
    )
}
