//! Logging setup for the `sandkit` binary.
//!
//! Library code never calls into this module on its own — installing a
//! global subscriber is a decision that belongs to the final binary, not a
//! dependency. `sandkit` (the CLI) calls [`init_tracing`] once at startup.

use std::time::Instant;

use tracing::{info, instrument, Span};
use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` formatter honoring `RUST_LOG` (defaulting
/// to `info`), switching to JSON output when `SANDKIT_LOG_JSON=1`.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SANDKIT_LOG_JSON").ok().as_deref() == Some("1");

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .try_init()?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init()?;
    }
    Ok(())
}

#[cfg(feature = "otel")]
pub fn init_otel_tracer(
) -> Result<opentelemetry_sdk::trace::Tracer, Box<dyn std::error::Error + Send + Sync>> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime, Resource};

    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "sandkit".to_string());
    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")?),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource))
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

#[cfg(feature = "otel")]
pub fn shutdown_otel() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Tracks one `run()` invocation end to end for structured logging.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub start_time: Instant,
}

impl RunContext {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            start_time: Instant::now(),
        }
    }

    pub fn span(&self) -> Span {
        tracing::info_span!("sandkit_run", run_id = %self.run_id)
    }

    #[instrument(skip(self))]
    pub fn record_completion(&self, exit_code: i32) {
        let duration_ms = self.start_time.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            exit_code = exit_code,
            duration_ms = duration_ms,
            "sandbox run completed"
        );
    }
}
