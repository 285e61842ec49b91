use crate::k8s_types::K8sType;

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};

use std::fmt::{self, Debug};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    osb_request_times: HistogramVec,
    total_watch_events_received: IntCounter,
    reconcile_counts: IntCounterVec,
    reconcile_errors: IntCounterVec,
    queue_depth: IntGaugeVec,
    watch_events_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

const CONTROLLER: &[&str] = &["controller"];
const CONTROLLER_AND_KIND: &[&str] = &["controller", "kind"];
const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        // 5ms .. ~20s
        let request_time_opts = HistogramOpts::new(
            "osb_request_time",
            "Total time from sending a request to a broker until its body is read",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12)?);
        let osb_request_times = HistogramVec::new(request_time_opts, &["operation"])?;
        registry.register(Box::new(osb_request_times.clone()))?;

        let watch_events_opts = Opts::new(
            "events_received",
            "total number of events processed by the controllers, including from watches and initial lists",
        );
        let total_watch_events_received = IntCounter::with_opts(watch_events_opts)?;
        registry.register(Box::new(total_watch_events_received.clone()))?;

        let reconcile_count_opts =
            Opts::new("reconcile_counts", "the number of reconciles started by each controller")
                .variable_label("controller");
        let reconcile_counts = IntCounterVec::new(reconcile_count_opts, CONTROLLER)?;
        registry.register(Box::new(reconcile_counts.clone()))?;

        let reconcile_error_opts = Opts::new(
            "reconcile_errors",
            "the number of failed reconciles by controller and error kind",
        )
        .variable_label("controller")
        .variable_label("kind");
        let reconcile_errors = IntCounterVec::new(reconcile_error_opts, CONTROLLER_AND_KIND)?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        let queue_depth_opts =
            Opts::new("queue_depth", "number of keys waiting in each work queue")
                .variable_label("controller");
        let queue_depth = IntGaugeVec::new(queue_depth_opts, CONTROLLER)?;
        registry.register(Box::new(queue_depth.clone()))?;

        let watch_event_opts =
            Opts::new("watch_events", "number of watch events received by watchers")
                .variable_label("apiVersion")
                .variable_label("kind");
        let watch_events_by_type = IntCounterVec::new(watch_event_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watch_events_by_type.clone()))?;

        let watcher_error_opts = Opts::new("watcher_errors", "number of errors from watchers")
            .variable_label("apiVersion")
            .variable_label("kind");
        let watcher_errors_by_type = IntCounterVec::new(watcher_error_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watcher_errors_by_type.clone()))?;

        Ok(Metrics {
            registry,
            osb_request_times,
            total_watch_events_received,
            reconcile_counts,
            reconcile_errors,
            queue_depth,
            watch_events_by_type,
            watcher_errors_by_type,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            osb_request_times: self.osb_request_times.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            total_events: self.total_watch_events_received.clone(),
            watch_events: self.watch_events_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
        }
    }

    pub fn queue_depth(&self, controller: &str) -> IntGauge {
        self.queue_depth.with_label_values(&[controller])
    }

    pub fn reconcile_started(&self, controller: &str) {
        self.reconcile_counts.with_label_values(&[controller]).inc();
    }

    pub fn reconcile_error(&self, controller: &str, kind: &str) {
        self.reconcile_errors
            .with_label_values(&[controller, kind])
            .inc();
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
    osb_request_times: HistogramVec,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self, operation: &str) -> prometheus::HistogramTimer {
        self.osb_request_times
            .with_label_values(&[operation])
            .start_timer()
    }
}

pub struct WatcherMetrics {
    total_events: IntCounter,
    watch_events: IntCounter,
    watcher_errors: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn event_received(&self) {
        self.total_events.inc();
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::v1beta1;

    #[test]
    fn metrics_are_created_successfully() {
        let metrics = Metrics::new().unwrap();
        metrics.reconcile_started("instance");
        metrics.reconcile_error("instance", "Transient");
        metrics.watcher_metrics(v1beta1::ServiceInstance).event_received();
        metrics.queue_depth("instance").set(3);
        let timer = metrics.client_metrics().request_started("provision_instance");
        timer.observe_duration();

        let text = String::from_utf8(metrics.encode_as_text().unwrap()).unwrap();
        assert!(text.contains("reconcile_counts{controller=\"instance\"} 1"));
        assert!(text.contains("queue_depth{controller=\"instance\"} 3"));
        assert!(text.contains("client_osb_request_time"));
    }
}
