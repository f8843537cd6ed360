//! OpenTelemetry export of access spans
//!
//! Installs the same JSON log layer as [`crate::init_tracing`] plus an OTLP
//! trace exporter. Only compiled with the `telemetry` feature.

use crate::config::AccessSettings;
use crate::error::{AccessError, AccessResult};
use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{
    DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Registry};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub endpoint: String,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    /// Sampling rate (0.0 to 1.0)
    pub sampling_rate: f64,
    /// Cluster and node attributes added to the resource
    pub resource_attributes: Vec<(String, String)>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            service_name: "metric-access".to_string(),
            service_version: crate::VERSION.to_string(),
            environment: "development".to_string(),
            sampling_rate: 0.1,
            resource_attributes: vec![],
        }
    }
}

impl TelemetryConfig {
    /// Defaults overridden by the standard OTEL_* variables, tagged with the
    /// node's cluster identity
    pub fn from_env(settings: &AccessSettings) -> Self {
        let defaults = Self::default();
        Self {
            endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or(defaults.endpoint),
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: defaults.service_version,
            environment: settings.environment.clone(),
            sampling_rate: std::env::var("OTEL_TRACES_SAMPLER_ARG")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.sampling_rate),
            resource_attributes: vec![
                ("access.cluster".to_string(), settings.cluster_name.clone()),
                ("access.node_id".to_string(), settings.node_id()),
            ],
        }
    }
}

/// Install JSON logs plus the OTLP exporter as the global subscriber
pub fn init_telemetry(config: TelemetryConfig, debug: bool) -> AccessResult<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.endpoint);

    let mut resource_kvs = vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
        KeyValue::new(DEPLOYMENT_ENVIRONMENT, config.environment.clone()),
    ];
    for (key, value) in config.resource_attributes {
        resource_kvs.push(KeyValue::new(key, value));
    }

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(config.sampling_rate))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(resource_kvs)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| AccessError::Config(format!("otlp exporter: {}", e)))?;

    Registry::default()
        .with(crate::env_filter(debug))
        .with(tracing_subscriber::fmt::layer().json())
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()
        .map_err(|e| AccessError::Config(format!("tracing subscriber: {}", e)))?;
    Ok(())
}

/// Flush pending spans
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_carries_cluster_identity() {
        let settings = AccessSettings::builder().node_id("node-7").build();
        let config = TelemetryConfig::from_env(&settings);
        assert_eq!(config.environment, "production");
        assert!(config
            .resource_attributes
            .contains(&("access.node_id".to_string(), "node-7".to_string())));
        assert_eq!(TelemetryConfig::default().service_name, "metric-access");
    }
}
