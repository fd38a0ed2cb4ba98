use crate::{Error, MqttCluster};
use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, exemplar::HistogramWithExemplars, family::Family},
    registry::{Registry, Unit},
};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub cluster: ReconcileMetricsMqttCluster,
    pub retirement: RetirementMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("mqtt_cluster");
        let cluster = ReconcileMetricsMqttCluster::default().register(registry.sub_registry_with_prefix("reconcile"));
        let retirement = RetirementMetrics::default().register(registry.sub_registry_with_prefix("retirement"));
        Self {
            registry: Arc::new(registry),
            cluster,
            retirement,
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub trace_id: String,
}
impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::Other("Invalid trace ID".to_string()))
        } else {
            let trace_id = id.to_string();
            Ok(Self { trace_id })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub instance: String,
    pub role: String,
}

#[derive(Clone)]
pub struct ReconcileMetricsMqttCluster {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetricsMqttCluster {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.].into_iter()),
        }
    }
}

impl ReconcileMetricsMqttCluster {
    /// Register API metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("failures", "reconciliation errors", self.failures.clone());
        r.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn reconcile_failure(&self, cluster: &MqttCluster, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: cluster.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Node retirement activity
#[derive(Clone, Default)]
pub struct RetirementMetrics {
    pub evacuations: Family<RoleLabels, Counter>,
    pub scale_downs: Family<RoleLabels, Counter>,
}

impl RetirementMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "evacuations_started",
            "session evacuations started",
            self.evacuations.clone(),
        );
        r.register("scale_downs", "stale nodes removed", self.scale_downs.clone());
        self
    }

    pub fn evacuation_started(&self, cluster: &MqttCluster, role: &str) {
        self.evacuations
            .get_or_create(&RoleLabels {
                instance: cluster.name_any(),
                role: role.to_string(),
            })
            .inc();
    }

    pub fn scaled_down(&self, cluster: &MqttCluster, role: &str) {
        self.scale_downs
            .get_or_create(&RoleLabels {
                instance: cluster.name_any(),
                role: role.to_string(),
            })
            .inc();
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
