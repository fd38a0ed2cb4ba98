use crate::{Error, Metrics, MqttCluster, Result, config::OperatorConfig, mqttcluster};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, future::BoxFuture};
use k8s_openapi::api::apps::v1::{ReplicaSet, StatefulSet};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Config as ControllerConfig, Controller},
        events::Reporter,
        watcher::Config,
    },
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Operator settings
    pub config: OperatorConfig,
    /// Consecutive failures per object key, drives the error backoff
    pub failures: Arc<Mutex<Failures>>,
}

impl Context {
    /// Exponential backoff for a failing object, capped at 5 minutes
    pub fn backoff(&self, key: &str) -> Duration {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(key, Instant::now())
    }

    pub fn reset_backoff(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset(key);
    }
}

static MAX_BACKOFF: Duration = Duration::from_secs(300);

pub fn backoff_for(failures: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << failures.saturating_sub(1).min(6));
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Failure counters of the objects being reconciled.
///
/// A failing object is retried at least every 5 minutes, an entry idle
/// for twice as long belongs to a deleted object and is dropped.
#[derive(Debug, Default)]
pub struct Failures {
    entries: HashMap<String, (u32, Instant)>,
}

impl Failures {
    pub fn record(&mut self, key: &str, now: Instant) -> Duration {
        self.entries
            .retain(|_, (_, last)| now.saturating_duration_since(*last) <= MAX_BACKOFF * 2);
        let entry = self.entries.entry(key.to_string()).or_insert((0, now));
        entry.0 = entry.0.saturating_add(1);
        entry.1 = now;
        backoff_for(entry.0)
    }

    pub fn reset(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: common::context::get_reporter(),
        }
    }
}

/// Data owned by the Manager
#[derive(Clone, Default)]
pub struct Manager {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    metrics: Metrics,
}

/// Manager that owns a Controller for MqttCluster
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(config: OperatorConfig) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = common::context::get_client_async().await?;
        let manager = Manager::default();
        let context = Arc::new(Context {
            client: client.clone(),
            metrics: manager.metrics.clone(),
            diagnostics: manager.diagnostics.clone(),
            config: config.clone(),
            failures: Arc::new(Mutex::new(Failures::default())),
        });

        let clusters = Api::<MqttCluster>::all(client.clone());
        // Ensure CRD is installed before loop-watching
        clusters
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| {
                tracing::error!("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");
                Error::KubeError(e)
            })?;

        // All good. Start controller and return its future.
        let controller = Controller::new(clusters, Config::default().any_semantic())
            .owns(Api::<StatefulSet>::all(client.clone()), Config::default())
            .owns(Api::<ReplicaSet>::all(client), Config::default())
            .with_config(ControllerConfig::default().concurrency(config.concurrency))
            .shutdown_on_signal()
            .run(mqttcluster::reconcile, mqttcluster::error_policy, context)
            .filter_map(|x| async move { std::result::Result::ok(x) })
            .for_each(|_| futures::future::ready(()))
            .boxed();

        Ok((manager, controller))
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry)
            .map_err(|e| Error::Other(format!("metrics encoding failed: {e}")))?;
        Ok(buffer)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}
