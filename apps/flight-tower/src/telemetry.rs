//! Logging, span export and the Prometheus recorder for the tower process.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "flight-tower";
const DEFAULT_FILTER: &str = "info,tower_http=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
}

/// Every metric the tower emits, with its help text.
const CATALOG: &[(&str, Kind, &str)] = &[
    ("flight_tower_connections_total", Kind::Counter, "WebSocket connections registered"),
    ("flight_tower_connections_active", Kind::Gauge, "Connections currently registered"),
    ("flight_tower_flights_active", Kind::Gauge, "Open flights"),
    ("flight_tower_flights_created_total", Kind::Counter, "Flights created"),
    ("flight_tower_flights_paired_total", Kind::Counter, "Flights that reached two members"),
    ("flight_tower_signals_relayed_total", Kind::Counter, "Signal payloads queued for a peer"),
    ("flight_tower_invitations_total", Kind::Counter, "Invitations delivered"),
    ("flight_tower_presence_broadcasts_total", Kind::Counter, "Presence snapshots pushed"),
    ("flight_tower_client_errors_total", Kind::Counter, "Error frames sent, by reason"),
    ("flight_tower_liveness_evictions_total", Kind::Counter, "Connections dropped for missed probes"),
    ("flight_tower_origin_rejections_total", Kind::Counter, "Upgrades refused by the origin gate, by reason"),
];

/// Installed once from `main`. Dropping it flushes pending spans.
pub struct Telemetry {
    metrics: PrometheusHandle,
    spans: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(otel_stdout: bool) -> Result<Self> {
        let metrics = PrometheusBuilder::new()
            .add_global_label("service", SERVICE_NAME)
            .install_recorder()
            .context("failed to install Prometheus recorder")?;
        describe_metrics();

        let spans = otel_stdout.then(stdout_tracer_provider);
        let otel_layer = spans.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if spans.is_some() {
            info!("exporting spans to stdout");
        }
        Ok(Self { metrics, spans })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.spans.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "span exporter did not shut down cleanly");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_resource(
            Resource::builder()
                .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_metrics() {
    for &(name, kind, help) in CATALOG {
        match kind {
            Kind::Counter => describe_counter!(name, help),
            Kind::Gauge => describe_gauge!(name, help),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test_timeout::timeout]
    fn catalog_names_are_unique_and_typed_by_suffix() {
        let names: HashSet<_> = CATALOG.iter().map(|(name, ..)| *name).collect();
        assert_eq!(names.len(), CATALOG.len());
        for (name, kind, _) in CATALOG {
            assert!(name.starts_with("flight_tower_"));
            assert_eq!(name.ends_with("_total"), *kind == Kind::Counter, "{name}");
        }
    }
}
