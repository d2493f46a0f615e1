use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How a process embedding the engine wants its logs and traces.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Reported as `service.name` on exported spans.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub default_filter: String,

    /// OTLP/HTTP base URL; the exporter appends `/v1/traces`.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Bearer token sent to the OTLP endpoint.
    #[serde(default)]
    pub otlp_token: Option<String>,
}

fn default_service_name() -> String {
    "cirrus".to_string()
}

fn default_filter() -> String {
    "info,cirrus_engine=debug".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            default_filter: default_filter(),
            otlp_endpoint: None,
            otlp_token: None,
        }
    }
}

impl TelemetryConfig {
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }

    fn otlp_headers(&self) -> std::collections::HashMap<String, String> {
        let mut headers = std::collections::HashMap::new();
        if let Some(token) = self.otlp_token.as_deref() {
            if !token.is_empty() {
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        headers
    }
}

/// Install the global subscriber: fmt output plus, when configured, OTLP span
/// export. The returned provider must be kept alive and shut down on exit.
pub fn init_tracing(cfg: &TelemetryConfig) -> anyhow::Result<Option<TracerProvider>> {
    let fmt_layer = tracing_subscriber::fmt::layer();

    let Some(endpoint) = cfg.otlp_endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(cfg.env_filter())
            .with(fmt_layer)
            .try_init()?;
        return Ok(None);
    };

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_headers(cfg.otlp_headers())
        .build()
    {
        Ok(e) => e,
        Err(err) => {
            eprintln!("failed to create OTLP exporter: {err}, falling back to stdout only");
            tracing_subscriber::registry()
                .with(cfg.env_filter())
                .with(fmt_layer)
                .try_init()?;
            return Ok(None);
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            cfg.service_name.clone(),
        )]))
        .build();

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(cfg.service_name.clone()));

    tracing_subscriber::registry()
        .with(cfg.env_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(endpoint, service_name = %cfg.service_name, "OTLP tracing enabled");
    Ok(Some(provider))
}

/// Test-friendly subscriber writing through the libtest capture. Safe to call
/// from every test; only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
