#![allow(unused_imports)]
use opentelemetry::trace::{TraceContextExt, TraceId};
use tracing_opentelemetry::OpenTelemetrySpanExt;

///  Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

#[cfg(feature = "telemetry")]
pub fn init_tracer() -> crate::Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::{KeyValue, trace::TracerProvider as _};
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{Resource, runtime, trace as sdktrace};

    let otlp_endpoint =
        std::env::var("OPENTELEMETRY_ENDPOINT_URL").unwrap_or_else(|_| "http://localhost:4317".to_string());
    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint),
        )
        .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "mqtt-operator"),
        ])))
        .install_batch(runtime::Tokio)
        .map_err(|e| crate::Error::Other(format!("tracer setup failed: {e}")))?;
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider.tracer("mqtt-operator"))
}
