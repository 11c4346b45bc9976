use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    InfoRefs,
    UploadPack,
    ReceivePack,
    LfsBatch,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LfsOutcomeLabels {
    pub outcome: LfsOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LfsOutcome {
    Download,
    Upload,
    Skipped,
    Error,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the server.
pub struct Metrics {
    // -- protocol endpoints --
    pub requests_total: Family<EndpointLabels, Counter>,
    pub request_duration_seconds: Family<EndpointLabels, Histogram>,

    // -- external git processes --
    pub git_spawns_total: Family<EndpointLabels, Counter>,
    pub git_failures_total: Counter,
    pub git_timeouts_total: Counter,

    // -- LFS batch --
    pub lfs_objects_total: Family<LfsOutcomeLabels, Counter>,

    // -- virtual mount --
    pub vfs_cache_bytes: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "gitdock_requests_total",
            "Protocol requests by endpoint",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "gitdock_request_duration_seconds",
            "Latency until the response starts, in seconds",
            request_duration_seconds.clone(),
        );

        let git_spawns_total = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "gitdock_git_spawns_total",
            "External git processes spawned by endpoint",
            git_spawns_total.clone(),
        );

        let git_failures_total = Counter::default();
        registry.register(
            "gitdock_git_failures_total",
            "External git processes that failed before streaming",
            git_failures_total.clone(),
        );

        let git_timeouts_total = Counter::default();
        registry.register(
            "gitdock_git_timeouts_total",
            "External git processes terminated by the execution timeout",
            git_timeouts_total.clone(),
        );

        let lfs_objects_total = Family::<LfsOutcomeLabels, Counter>::default();
        registry.register(
            "gitdock_lfs_objects_total",
            "LFS batch objects by negotiated outcome",
            lfs_objects_total.clone(),
        );

        let vfs_cache_bytes: Gauge = Gauge::default();
        registry.register(
            "gitdock_vfs_cache_bytes",
            "Bytes currently cached by the virtual mount layer",
            vfs_cache_bytes.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            git_spawns_total,
            git_failures_total,
            git_timeouts_total,
            lfs_objects_total,
            vfs_cache_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all server metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}
