use crate::k8s_types::K8sType;
use crate::manifest::ChildKind;
use crate::resource::ObjectIdRef;
use crate::runner::reconcile::ChildAction;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

use std::fmt::{self, Debug};

const NAMESPACE_AND_NAME: &[&str] = &["namespace", "name"];
const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];
const KIND_AND_ACTION: &[&str] = &["kind", "action"];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    total_events_received: IntCounter,
    reconcile_count_by_app: IntCounterVec,
    reconcile_errors_by_app: IntCounterVec,
    child_mutations: IntCounterVec,
    watcher_requests_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
    watch_events_by_type: IntCounterVec,
    queue_depth: IntGauge,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn id_labels<'a>(id: &ObjectIdRef<'a>) -> [&'a str; 2] {
    [id.namespace, id.name]
}

fn register<T>(registry: &Registry, collector: T) -> Result<T, prometheus::Error>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
    register(registry, vec)
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        // 5ms doubling up to ~10s
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12)?);
        let api_server_request_times =
            register(&registry, Histogram::with_opts(request_time_opts)?)?;

        let total_events_received = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "events_received",
                "total number of watch and list events processed by the operator",
            ))?,
        )?;

        let reconcile_count_by_app = counter_vec(
            &registry,
            "reconcile_passes",
            "the number of reconcile passes started for each Application",
            NAMESPACE_AND_NAME,
        )?;
        let reconcile_errors_by_app = counter_vec(
            &registry,
            "reconcile_errors",
            "the number of failed reconcile passes for each Application",
            NAMESPACE_AND_NAME,
        )?;
        let child_mutations = counter_vec(
            &registry,
            "child_mutations",
            "the number of create, update and delete calls issued for children",
            KIND_AND_ACTION,
        )?;
        let watcher_requests_by_type = counter_vec(
            &registry,
            "watcher_requests",
            "number of requests from watchers",
            API_VERSION_AND_KIND,
        )?;
        let watcher_errors_by_type = counter_vec(
            &registry,
            "watcher_errors",
            "number of errors from watchers",
            API_VERSION_AND_KIND,
        )?;
        let watch_events_by_type = counter_vec(
            &registry,
            "watch_events",
            "number of watch events received by watchers",
            API_VERSION_AND_KIND,
        )?;

        let queue_depth = register(
            &registry,
            IntGauge::with_opts(Opts::new(
                "queue_depth",
                "number of Applications that are waiting to be reconciled",
            ))?,
        )?;

        Ok(Metrics {
            registry,
            api_server_request_times,
            total_events_received,
            reconcile_count_by_app,
            reconcile_errors_by_app,
            child_mutations,
            watcher_requests_by_type,
            watcher_errors_by_type,
            watch_events_by_type,
            queue_depth,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
            watch_events: self.watch_events_by_type.with_label_values(labels),
        }
    }

    pub fn event_received(&self) {
        self.total_events_received.inc();
    }

    pub fn reconcile_started(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_count_by_app
            .with_label_values(&id_labels(id))
            .inc();
    }

    pub fn reconcile_error(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_errors_by_app
            .with_label_values(&id_labels(id))
            .inc();
    }

    /// Removes the per-Application series once the Application is gone
    pub fn application_deleted(&self, id: &ObjectIdRef<'_>) {
        let labels = id_labels(id);
        let _ = self.reconcile_count_by_app.remove_label_values(&labels);
        let _ = self.reconcile_errors_by_app.remove_label_values(&labels);
    }

    pub fn child_mutated(&self, kind: ChildKind, action: ChildAction) {
        self.child_mutations
            .with_label_values(&[kind.as_str(), action.as_str()])
            .inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn child_mutations_are_exported_by_kind_and_action() {
        let metrics = Metrics::new().expect("failed to create metrics");
        metrics.child_mutated(ChildKind::Service, ChildAction::Delete);
        metrics.reconcile_started(&ObjectIdRef::new("default", "shop"));
        metrics.set_queue_depth(3);

        let text = String::from_utf8(metrics.encode_as_text().unwrap()).unwrap();
        assert!(text.contains("child_mutations{action=\"delete\",kind=\"service\"} 1"), "{}", text);
        assert!(
            text.contains("reconcile_passes{name=\"shop\",namespace=\"default\"} 1"),
            "{}",
            text
        );
        assert!(text.contains("queue_depth 3"), "{}", text);
    }
}
