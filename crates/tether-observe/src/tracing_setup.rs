//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! let config = tether_types::config::LoggingConfig::default();
//! tether_observe::tracing_setup::init_tracing(&config).unwrap();
//! // ...
//! tether_observe::tracing_setup::shutdown_tracing();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tether_types::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize the global tracing subscriber from `[logging]`.
///
/// - `RUST_LOG`, when set and valid, overrides `config.filter`.
/// - `config.json` switches the human-readable layer for JSON lines.
/// - `config.otel` additionally bridges spans to OpenTelemetry using a
///   stdout exporter.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set or the
/// configured filter directive does not parse.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), &config.filter)?;

    let text_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });

    let otel_layer = config.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("tether");

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    Ok(())
}

/// `RUST_LOG` wins when it parses; otherwise the configured directive.
fn build_filter(rust_log: Option<&str>, configured: &str) -> Result<EnvFilter, Box<dyn std::error::Error>> {
    if let Some(directive) = rust_log.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return Ok(filter);
        }
        eprintln!("Warning: ignoring invalid RUST_LOG directive '{directive}'");
    }
    Ok(EnvFilter::try_new(configured)?)
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_overrides_configured_filter() {
        let filter = build_filter(Some("tether=trace"), "info").unwrap();
        assert_eq!(filter.to_string(), "tether=trace");
    }

    #[test]
    fn configured_filter_used_without_rust_log() {
        let filter = build_filter(None, "warn,tether_core=debug").unwrap();
        assert!(filter.to_string().contains("tether_core=debug"));

        let filter = build_filter(Some("  "), "info").unwrap();
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn invalid_directives() {
        let filter = build_filter(Some("tether=[[["), "info").unwrap();
        assert_eq!(filter.to_string(), "info");
        assert!(build_filter(None, "tether=[[[").is_err());
    }

    #[test]
    fn shutdown_without_otel_is_noop() {
        shutdown_tracing();
    }
}
