//! Logging and optional OpenTelemetry export.
//!
//! Logs always go to stderr through `tracing_subscriber::fmt`, so command
//! output on stdout stays machine readable.
//!
//! | feature   | effect                                                   |
//! |-----------|----------------------------------------------------------|
//! | `tracing` | export spans                                             |
//! | `metrics` | export claim transitions, scan passes, holders, assignments |
//! | `otlp`    | OTLP/gRPC exporter at `OTEL_EXPORTER_OTLP_ENDPOINT`      |
//! | `stdout`  | stdout exporter                                          |
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 \
//!   cargo run -p nameplate-agent --features tracing,metrics,otlp -- claim
//! ```

#[cfg(all(feature = "otlp", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'tracing' or 'metrics' to be enabled.");

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "otlp")]
use opentelemetry_otlp::{Protocol, WithExportConfig};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "nameplate-agent";

#[cfg(any(feature = "otlp", feature = "stdout"))]
const EXPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors are printed, since logging may
    /// already be going through the providers being shut down.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .pretty(),
        );

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    #[cfg(feature = "tracing")]
    let (registry, tracer_provider) = {
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let provider = init_tracer()?;
        opentelemetry::global::set_tracer_provider(provider.clone());
        let layer = tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(scope.clone()))
            .with_error_records_to_exceptions(true);
        (registry.with(layer), provider)
    };

    #[cfg(feature = "metrics")]
    let meter_provider = {
        let provider = init_meter()?;
        opentelemetry::global::set_meter_provider(provider.clone());
        ClaimMetrics::install(opentelemetry::global::meter_with_scope(scope));
        provider
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "otlp")]
fn otlp_endpoint() -> anyhow::Result<String> {
    use anyhow::Context;

    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").context("missing `OTEL_EXPORTER_OTLP_ENDPOINT`")
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> opentelemetry_sdk::Resource {
    opentelemetry_sdk::Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_meter() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_reader(
        sdkmetrics::PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default())
            .with_interval(EXPORT_INTERVAL)
            .build(),
    );

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_reader(
            sdkmetrics::PeriodicReader::builder(exporter)
                .with_interval(EXPORT_INTERVAL)
                .build(),
        )
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder =
        builder.with_span_processor(batched(opentelemetry_stdout::SpanExporter::default()));

    #[cfg(feature = "otlp")]
    let builder = {
        use anyhow::Context;

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(otlp_endpoint()?)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batched(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "otlp", feature = "stdout")))]
fn batched<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: sdktrace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(EXPORT_INTERVAL)
                .build(),
        )
        .build()
}

#[cfg(feature = "metrics")]
struct ClaimMetrics {
    transitions: Counter<u64>,
    scan_passes: Counter<u64>,
    holding: UpDownCounter<i64>,
    assignments: Counter<u64>,
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<ClaimMetrics> = OnceLock::new();

#[cfg(feature = "metrics")]
impl ClaimMetrics {
    fn install(meter: Meter) {
        let _ = METRICS.set(Self {
            transitions: meter
                .u64_counter("claim_transitions")
                .with_description("Claim lifecycle state changes, by target state")
                .build(),
            scan_passes: meter
                .u64_counter("scan_passes")
                .with_description("Passes over the pool looking for a free slot")
                .build(),
            holding: meter
                .i64_up_down_counter("holding")
                .with_description("Slots currently held by this process")
                .build(),
            assignments: meter
                .u64_counter("assignments")
                .with_description("Names written into pool slots")
                .build(),
        });
    }
}

/// Runs `f` against the installed metrics. No-op without the `metrics`
/// feature, or before [`init_telemetry`].
#[cfg(feature = "metrics")]
fn record(f: impl FnOnce(&ClaimMetrics)) {
    if let Some(metrics) = METRICS.get() {
        f(metrics);
    }
}

pub fn record_claim_transition(state: &'static str) {
    #[cfg(feature = "metrics")]
    record(|m| m.transitions.add(1, &[KeyValue::new("state", state)]));
    #[cfg(not(feature = "metrics"))]
    let _ = state;
}

pub fn increment_scan_passes() {
    #[cfg(feature = "metrics")]
    record(|m| m.scan_passes.add(1, &[]));
}

pub fn increment_holding() {
    #[cfg(feature = "metrics")]
    record(|m| m.holding.add(1, &[]));
}

pub fn decrement_holding() {
    #[cfg(feature = "metrics")]
    record(|m| m.holding.add(-1, &[]));
}

pub fn increment_assignments(count: u64) {
    #[cfg(feature = "metrics")]
    record(|m| m.assignments.add(count, &[]));
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_before_init_is_a_no_op() {
        record_claim_transition("holding");
        increment_scan_passes();
        increment_holding();
        decrement_holding();
        increment_assignments(3);
        #[cfg(feature = "metrics")]
        assert!(METRICS.get().is_none());
    }
}
