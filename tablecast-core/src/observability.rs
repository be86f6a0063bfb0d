//! Logging, tracing and metrics bootstrap
//!
//! All crates in the workspace log through `tracing`. Binaries and tests that
//! want output call [`init_telemetry`] once at startup. It installs:
//!
//! 1. an `EnvFilter` (from `RUST_LOG`, falling back to the configured level)
//! 2. a JSON `fmt` layer on stdout
//! 3. optionally an OpenTelemetry layer exporting spans over OTLP/gRPC
//! 4. optionally a global meter provider used by `ClientMetrics` and
//!    `BrokerMetrics`
//!
//! ```rust,no_run
//! use tablecast_core::TelemetryConfig;
//!
//! let config = TelemetryConfig::new("booking-frontend")
//!     .with_log_level("debug")
//!     .with_traces(false);
//! tablecast_core::init_telemetry(config).expect("telemetry");
//!
//! tracing::info!("ready");
//! tablecast_core::shutdown_telemetry();
//! ```

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Providers kept alive so they can be flushed on shutdown
struct Providers {
    tracer: Option<SdkTracerProvider>,
    meter: Option<SdkMeterProvider>,
}

static PROVIDERS: OnceLock<Providers> = OnceLock::new();

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name`
    pub service_name: String,
    pub service_version: String,
    /// OTLP/gRPC collector, e.g. `http://localhost:4317`
    pub otlp_endpoint: String,
    /// Export spans to the collector
    pub enable_traces: bool,
    /// Register a global meter provider exporting to the collector
    pub enable_metrics: bool,
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tablecast".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),
            enable_traces: true,
            enable_metrics: true,
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = endpoint.into();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_traces(mut self, enable: bool) -> Self {
        self.enable_traces = enable;
        self
    }

    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }

    /// Only local JSON logs, nothing exported
    pub fn local_only(self) -> Self {
        self.with_traces(false).with_metrics(false)
    }

    fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes(vec![
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    self.service_name.clone(),
                ),
                KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
                    self.service_version.clone(),
                ),
            ])
            .build()
    }
}

/// Install the global subscriber and, if enabled, the OTLP providers
///
/// Returns an error instead of panicking when called twice.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), BoxError> {
    if PROVIDERS.get().is_some() {
        return Err("telemetry already initialized".into());
    }

    let tracer_provider = if config.enable_traces {
        Some(build_tracer_provider(&config)?)
    } else {
        None
    };

    let meter_provider = if config.enable_metrics {
        let provider = build_meter_provider(&config)?;
        global::set_meter_provider(provider.clone());
        Some(provider)
    } else {
        None
    };

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .json();

    let telemetry_layer = tracer_provider.as_ref().map(|provider| {
        use opentelemetry::trace::TracerProvider as _;
        let tracer = provider.tracer(config.service_name.clone());
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(telemetry_layer)
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    if let Some(provider) = &tracer_provider {
        global::set_tracer_provider(provider.clone());
    }

    // Losing this race only means another thread finished init first.
    let _ = PROVIDERS.set(Providers {
        tracer: tracer_provider,
        meter: meter_provider,
    });

    tracing::info!(
        service_name = %config.service_name,
        otlp_endpoint = %config.otlp_endpoint,
        traces = config.enable_traces,
        metrics = config.enable_metrics,
        "Telemetry initialized"
    );
    Ok(())
}

fn build_tracer_provider(config: &TelemetryConfig) -> Result<SdkTracerProvider, BoxError> {
    use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(config.resource())
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .build())
}

fn build_meter_provider(config: &TelemetryConfig) -> Result<SdkMeterProvider, BoxError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.clone())
        .build()?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(30))
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(config.resource())
        .build())
}

/// Flush and stop the OTLP providers; a no-op if none were installed
pub fn shutdown_telemetry() {
    let Some(providers) = PROVIDERS.get() else {
        return;
    };
    tracing::info!("Shutting down telemetry");
    if let Some(tracer) = &providers.tracer {
        if let Err(e) = tracer.shutdown() {
            tracing::warn!(error = %e, "Tracer provider shutdown failed");
        }
    }
    if let Some(meter) = &providers.meter {
        if let Err(e) = meter.shutdown() {
            tracing::warn!(error = %e, "Meter provider shutdown failed");
        }
    }
}
