use crate::handler::Reconciler;
use crate::k8s_types::K8sType;
use crate::resource::ObjectId;
use crate::runner::metrics::WatcherMetrics;
use crate::runner::WorkQueue;
use crate::store::{ListParams, Store, WatchEvent};

use futures_util::StreamExt;
use serde_json::Value;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait on an idle watch before checking whether we're still running
const WATCH_IDLE_CHECK: Duration = Duration::from_secs(1);

/// Feeds the queue of a reconciler from the objects of one kind. Objects of an owned kind are
/// queued by their own id, and objects of a related kind by whatever ids the reconciler maps
/// them to.
pub(crate) struct Informer {
    pub store: Arc<dyn Store>,
    pub reconciler: Arc<dyn Reconciler>,
    pub k8s_type: &'static K8sType,
    pub owned: bool,
    pub namespace: Option<String>,
    pub queue: WorkQueue,
    pub metrics: WatcherMetrics,
    pub running: Arc<AtomicBool>,
}

pub(crate) fn object_id(object: &Value) -> Option<ObjectId> {
    let meta = object.get("metadata")?;
    let name = meta.get("name").and_then(Value::as_str)?;
    let namespace = meta
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ObjectId::new(namespace, name))
}

impl Informer {
    fn in_scope(&self, object: &Value) -> bool {
        match (self.namespace.as_deref(), self.k8s_type.namespaced) {
            (Some(ns), true) => object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(|obj_ns| obj_ns == ns)
                .unwrap_or(false),
            _ => true,
        }
    }

    async fn enqueue(&self, object: &Value) {
        if !self.in_scope(object) {
            return;
        }
        if self.owned {
            match object_id(object) {
                Some(id) => self.queue.add(id),
                None => log::warn!("Ignoring {} without a name: {}", self.k8s_type, object),
            }
        } else {
            for key in self.reconciler.keys_for_related(self.k8s_type, object).await {
                self.queue.add(key);
            }
        }
    }

    fn list_params(&self) -> ListParams {
        if self.k8s_type.namespaced {
            ListParams::all().in_namespace(self.namespace.as_deref())
        } else {
            ListParams::all()
        }
    }

    pub(crate) async fn run(self) {
        log::info!(
            "Starting {} informer for {} (owned: {})",
            self.reconciler.name(),
            self.k8s_type,
            self.owned
        );
        // subscribe before listing so that nothing between the two is missed
        let mut events = self.store.watch(self.k8s_type);
        match self.store.list(self.k8s_type, &self.list_params()).await {
            Ok(objects) => {
                log::debug!("Initial list of {} returned {} objects", self.k8s_type, objects.len());
                for object in objects.iter() {
                    self.metrics.event_received();
                    self.enqueue(object).await;
                }
            }
            Err(err) => {
                self.metrics.error();
                log::error!("Failed to list {}: {}", self.k8s_type, err);
            }
        }

        while self.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(WATCH_IDLE_CHECK, events.next()).await {
                Ok(Some(event)) => {
                    self.metrics.event_received();
                    log::trace!("{} informer got event: {:?}", self.k8s_type, event);
                    match &event {
                        WatchEvent::Deleted(object) if self.owned => {
                            // the reconciler sees the object is gone, which is all it needs
                            self.enqueue(object).await;
                        }
                        other => self.enqueue(other.object()).await,
                    }
                }
                Ok(None) => {
                    self.metrics.error();
                    log::error!("Watch for {} ended unexpectedly, stopping controllers", self.k8s_type);
                    self.running.store(false, Ordering::Relaxed);
                    break;
                }
                Err(_) => {}
            }
        }
        log::info!("Stopped {} informer for {}", self.reconciler.name(), self.k8s_type);
    }
}

/// Periodically queues every object of the owned kinds
pub(crate) async fn resync(
    store: Arc<dyn Store>,
    reconciler: Arc<dyn Reconciler>,
    namespace: Option<String>,
    queue: WorkQueue,
    period: Duration,
    running: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately, and the informers have just listed everything
    interval.tick().await;
    while running.load(Ordering::Relaxed) {
        interval.tick().await;
        if !running.load(Ordering::Relaxed) {
            break;
        }
        log::debug!("Starting resync for {}", reconciler.name());
        for k8s_type in reconciler.owned_types() {
            let params = if k8s_type.namespaced {
                ListParams::all().in_namespace(namespace.as_deref())
            } else {
                ListParams::all()
            };
            match store.list(k8s_type, &params).await {
                Ok(objects) => objects
                    .iter()
                    .filter_map(object_id)
                    .for_each(|id| queue.add(id)),
                Err(err) => log::error!("Resync of {} failed to list objects: {}", k8s_type, err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_ids_are_read_from_metadata() {
        let namespaced = serde_json::json!({"metadata": {"namespace": "ns", "name": "a"}});
        assert_eq!(Some(ObjectId::new("ns", "a")), object_id(&namespaced));

        let cluster = serde_json::json!({"metadata": {"name": "broker"}});
        assert_eq!(Some(ObjectId::cluster("broker")), object_id(&cluster));

        assert_eq!(None, object_id(&serde_json::json!({"spec": {}})));
    }
}
