mod informer;
pub mod metrics;
mod queue;
mod server;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::queue::WorkQueue;

use crate::config::ControllerConfig;
use crate::controller::{self, ControllerContext};
use crate::error::Error;
use crate::events::LoggingRecorder;
use crate::handler::{ReconcileResult, Reconciler};
use crate::osb::HttpClientFactory;
use crate::store::Store;
use informer::Informer;
use metrics::Metrics;

use tokio::runtime::{Handle, Runtime};

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A handle to running controllers, which allows for shutting them down. Dropping the handle
/// also shuts them down.
pub struct ControllerHandle {
    running: Arc<AtomicBool>,
    queues: Vec<WorkQueue>,
}

impl std::ops::Drop for ControllerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ControllerHandle {
    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        for queue in self.queues.iter() {
            queue.shutdown();
        }
    }

    pub fn shutdown_now(self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct UnexpectedShutdownError;
impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Controllers shut down due to an unexpected error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

/// Starts the broker, instance and binding controllers against the given store, and blocks the
/// current thread until they shut down due to an error.
pub fn run_controllers(config: ControllerConfig, store: Arc<dyn Store>) -> Error {
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => return err.into(),
    };
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    let config = Arc::new(config);
    let clients = Arc::new(HttpClientFactory::new(Some(metrics.client_metrics())));
    let context = ControllerContext::new(config.clone(), store.clone(), clients, Arc::new(LoggingRecorder));
    let reconcilers = controller::standard_reconcilers(&context);

    runtime.block_on(async {
        let handle = start_controllers(&Handle::current(), &config, store, reconcilers, metrics);
        while handle.is_active() {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
    log::warn!("Controllers stopped, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(5));
    // the controllers never exit under normal circumstances
    Box::new(UnexpectedShutdownError)
}

/// Starts the reconcilers on the given runtime and returns immediately. Each reconciler gets its
/// own work queue, fed by an informer per owned and related kind, plus `worker_count` workers.
pub fn start_controllers(
    runtime: &Handle,
    config: &ControllerConfig,
    store: Arc<dyn Store>,
    reconcilers: Vec<Arc<dyn Reconciler>>,
    metrics: Metrics,
) -> ControllerHandle {
    log::debug!("Starting controllers with configuration: {:?}", config);
    let running = Arc::new(AtomicBool::new(true));
    let mut queues = Vec::with_capacity(reconcilers.len());

    for reconciler in reconcilers {
        let name = reconciler.name();
        let queue = WorkQueue::with_depth_gauge(
            config.retry_backoff.clone(),
            Some(metrics.queue_depth(name)),
        );
        queues.push(queue.clone());

        let owned = reconciler.owned_types().into_iter().map(|t| (t, true));
        let related = reconciler.related_types().into_iter().map(|t| (t, false));
        for (k8s_type, is_owned) in owned.chain(related) {
            let informer = Informer {
                store: store.clone(),
                reconciler: reconciler.clone(),
                k8s_type,
                owned: is_owned,
                namespace: config.namespace.clone(),
                queue: queue.clone(),
                metrics: metrics.watcher_metrics(k8s_type),
                running: running.clone(),
            };
            runtime.spawn(informer.run());
        }
        runtime.spawn(informer::resync(
            store.clone(),
            reconciler.clone(),
            config.namespace.clone(),
            queue.clone(),
            config.resync_period,
            running.clone(),
        ));

        for worker in 0..config.worker_count {
            runtime.spawn(run_worker(
                worker,
                reconciler.clone(),
                queue.clone(),
                metrics.clone(),
            ));
        }
        log::info!("Started {} controller with {} workers", name, config.worker_count);
    }

    if config.expose_metrics || config.expose_health {
        runtime.spawn(server::start(
            config.server_port,
            metrics,
            running.clone(),
            config.expose_metrics,
            config.expose_health,
        ));
    }
    ControllerHandle { running, queues }
}

async fn run_worker(worker: usize, reconciler: Arc<dyn Reconciler>, queue: WorkQueue, metrics: Metrics) {
    let name = reconciler.name();
    log::debug!("{} worker {} started", name, worker);
    while let Some(key) = queue.get().await {
        metrics.reconcile_started(name);
        let start_time = Instant::now();
        let result = reconciler.reconcile(&key).await;
        log::debug!(
            "{} finished reconciling {} in {}ms with result: {:?}",
            name,
            key,
            start_time.elapsed().as_millis(),
            result
        );
        match result {
            ReconcileResult::Done => queue.forget(&key),
            ReconcileResult::RequeueAfter(delay) => {
                queue.forget(&key);
                queue.add_after(key.clone(), delay);
            }
            ReconcileResult::RequeueWithBackoff => queue.add_rate_limited(key.clone()),
            ReconcileResult::Failed(err) => {
                metrics.reconcile_error(name, &format!("{:?}", err.kind));
                if err.kind.is_retryable() {
                    log::warn!("{} failed to reconcile {}, will retry: {}", name, key, err);
                    queue.add_rate_limited(key.clone());
                } else if err.is_stale_write() {
                    log::debug!("{} lost a write race on {}: {}", name, key, err);
                    queue.forget(&key);
                } else {
                    log::info!("{} gave up on {}: {}", name, key, err);
                    queue.forget(&key);
                }
            }
        }
        queue.done(&key);
    }
    log::debug!("{} worker {} stopped", name, worker);
}
