pub(crate) mod client;
mod informer;
mod metrics;
pub(crate) mod queue;
pub mod reconcile;
mod server;
pub mod store;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use self::client::Error as ClientError;
pub use self::informer::{EventType, ResourceMessage};
pub use self::metrics::Metrics;

use crate::config::{ClientConfig, OperatorConfig};
use crate::error::Error;
use crate::k8s_types::APPLICATION;
use crate::manifest::{ChildKind, ManifestFactory};
use crate::resource::ObjectId;
use crate::runner::queue::{Dequeued, Enqueued, WorkQueue};
use crate::runner::reconcile::{ReconcileSettings, Reconciler};
use client::Client;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often the operator loop wakes up to check whether it's been shut down
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A handle to a potentially running operator, which allows for shutting it down
pub struct OperatorHandle {
    running: Arc<AtomicBool>,
}

impl std::ops::Drop for OperatorHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl OperatorHandle {
    pub fn shutdown_now(self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct UnexpectedShutdownError;
impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Operator shutdown due to an unexpected error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts down
/// due to an error. The client configuration comes from the pod's service account, or the
/// kubeconfig file when running outside of the cluster.
pub fn run_operator(config: OperatorConfig, factory: impl ManifestFactory) -> Error {
    let client_config = {
        let user_agent = config.operator_name.as_str();
        let result = ClientConfig::from_service_account(user_agent)
            .map_err(Error::from)
            .or_else(|_| {
                log::debug!("No service account ClientConfig, trying kubeconfig instead");
                ClientConfig::from_kubeconfig(user_agent).map_err(Error::from)
            });
        match result {
            Ok(conf) => conf,
            Err(err) => return err,
        }
    };
    run_operator_with_client_config(config, client_config, factory)
}

/// Starts the operator and blocks the current thread indefinitely until the operator shuts down
/// due to an error.
pub fn run_operator_with_client_config(
    config: OperatorConfig,
    client_config: ClientConfig,
    factory: impl ManifestFactory,
) -> Error {
    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    let state = match create_operator_state(
        runtime.handle().clone(),
        Arc::new(AtomicBool::new(true)),
        config,
        client_config,
        Arc::new(factory),
    ) {
        Ok(state) => state,
        Err(err) => return err,
    };
    runtime.block_on(state.run());
    log::warn!("Operator stopped, shutting down runtime");
    runtime.shutdown_background();
    // the operator never exits under normal circumstances
    Box::new(UnexpectedShutdownError)
}

/// Starts the operator asynchronously using the provided runtime. This function will return
/// immediately with a handle that can be used to shutdown the operator at a later point. Will
/// return an error if it fails to create the http client due to invalid configuration.
pub fn start_operator_with_runtime(
    runtime: &Runtime,
    config: OperatorConfig,
    client_config: ClientConfig,
    factory: impl ManifestFactory,
) -> Result<OperatorHandle, Error> {
    let running = Arc::new(AtomicBool::new(true));
    let state = create_operator_state(
        runtime.handle().clone(),
        running.clone(),
        config,
        client_config,
        Arc::new(factory),
    )?;
    runtime.spawn(state.run());
    Ok(OperatorHandle { running })
}

/// Starts the watches and the metrics server, which all begin running in the background as soon
/// as this returns
fn create_operator_state(
    executor: Handle,
    running: Arc<AtomicBool>,
    config: OperatorConfig,
    client_config: ClientConfig,
    factory: Arc<dyn ManifestFactory>,
) -> Result<OperatorState, Error> {
    log::debug!("Starting operator with configuration: {:?}", config);
    let metrics = Metrics::new()?;
    let client = Client::new(client_config, metrics.client_metrics())?;

    let (tx, rx) = mpsc::channel::<ResourceMessage>(1024);
    let mut monitors = Vec::with_capacity(ChildKind::ALL.len() + 1);
    monitors.push(informer::start_application_monitor(
        &executor,
        config.namespace.clone(),
        client.clone(),
        tx.clone(),
        metrics.watcher_metrics(APPLICATION),
    ));
    for kind in ChildKind::ALL.iter() {
        let k8s_type = kind.k8s_type();
        monitors.push(informer::start_child_monitor(
            &executor,
            k8s_type,
            config.namespace.clone(),
            config.child_label_selector(),
            client.clone(),
            tx.clone(),
            metrics.watcher_metrics(k8s_type),
        ));
    }
    // the monitors hold the only senders, so the channel closes if all of them stop
    drop(tx);

    if config.expose_metrics || config.expose_health {
        monitors.push(executor.spawn(server::start(
            config.server_port,
            metrics.clone(),
            config.expose_metrics,
            config.expose_health,
        )));
    }

    let reconciler = Reconciler::new(
        Arc::new(client),
        factory,
        ReconcileSettings::from_config(&config),
    )
    .with_metrics(metrics.clone());
    let (queue_sender, queue_receiver) = mpsc::channel::<QueueMessage>(1024);

    Ok(OperatorState {
        running,
        executor,
        metrics,
        reconciler,
        receiver: rx,
        queue: WorkQueue::new(config.max_concurrent_reconciles, config.max_retry_interval),
        queue_sender,
        queue_receiver,
        in_progress: InFlightPasses::default(),
        background_tasks: monitors,
    })
}

/// Messages that the spawned passes and retry timers send back to the operator loop
#[derive(Debug)]
enum QueueMessage {
    PassFinished {
        id: ObjectId,
        round: u64,
        succeeded: bool,
    },
    RetryDue {
        id: ObjectId,
        round: u64,
    },
}

#[derive(Debug)]
struct InProgressPass {
    round: u64,
    handle: JoinHandle<()>,
    start_time: Instant,
}

/// The task handles of running passes. An aborted pass may still report that it finished, after
/// a newer pass for the same Application has started, so entries are keyed by round as well.
#[derive(Debug, Default)]
struct InFlightPasses(HashMap<ObjectId, InProgressPass>);

impl InFlightPasses {
    fn started(&mut self, id: ObjectId, round: u64, handle: JoinHandle<()>) {
        let pass = InProgressPass {
            round,
            handle,
            start_time: Instant::now(),
        };
        if let Some(previous) = self.0.insert(id, pass) {
            previous.handle.abort();
        }
    }

    /// Removes the pass for `round`. Returns None if the pass that's running now is a different
    /// one.
    fn finished(&mut self, id: &ObjectId, round: u64) -> Option<InProgressPass> {
        match self.0.get(id) {
            Some(pass) if pass.round == round => self.0.remove(id),
            _ => None,
        }
    }

    /// Aborts whichever pass is running for the Application and returns its round
    fn abort(&mut self, id: &ObjectId) -> Option<u64> {
        let pass = self.0.remove(id)?;
        pass.handle.abort();
        Some(pass.round)
    }

    fn abort_all(&mut self) {
        for (id, pass) in self.0.drain() {
            log::info!("Aborting in-flight reconcile of Application: {}", id);
            pass.handle.abort();
        }
    }
}

struct OperatorState {
    running: Arc<AtomicBool>,
    executor: Handle,
    metrics: Metrics,
    reconciler: Reconciler,
    receiver: Receiver<ResourceMessage>,
    queue: WorkQueue,
    queue_sender: Sender<QueueMessage>,
    queue_receiver: Receiver<QueueMessage>,
    in_progress: InFlightPasses,
    background_tasks: Vec<JoinHandle<()>>,
}

impl OperatorState {
    async fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            self.start_ready_passes();
            tokio::select! {
                message = self.receiver.recv() => match message {
                    Some(message) => self.handle_resource_message(message),
                    None => {
                        log::warn!("All informers have stopped, stopping operator");
                        self.running.store(false, Ordering::Relaxed);
                    }
                },
                Some(message) = self.queue_receiver.recv() => self.handle_queue_message(message),
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {}
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        log::info!("Shutting down operator");
        let interrupted = self.queue.drain_in_flight();
        log::debug!("{} passes were in flight at shutdown", interrupted.len());
        self.in_progress.abort_all();
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
    }

    fn handle_resource_message(&mut self, message: ResourceMessage) {
        self.metrics.event_received();
        let ResourceMessage {
            event_type,
            resource_type,
            application_id,
            application_generation,
        } = message;

        if event_type == EventType::Deleted && resource_type == APPLICATION {
            log::info!("Application: {} has been deleted", application_id);
            self.metrics.application_deleted(&application_id.as_id_ref());
            self.queue.forget(&application_id);
            self.update_queue_depth();
            return;
        }

        let id_for_log = application_id.clone();
        match self.queue.add(application_id, application_generation) {
            Enqueued::Queued => log::info!(
                "Queued Application: {} due to {:?} event on {}",
                id_for_log,
                event_type,
                resource_type
            ),
            Enqueued::MarkedDirty => log::debug!(
                "Application: {} will reconcile again after the current pass, due to {:?} on {}",
                id_for_log,
                event_type,
                resource_type
            ),
            Enqueued::AlreadyQueued => {
                log::trace!("Application: {} is already queued", id_for_log);
            }
            Enqueued::Superseded => {
                if let Some(round) = self.in_progress.abort(&id_for_log) {
                    log::info!(
                        "Aborted pass {} of Application: {} since generation {:?} was observed",
                        round,
                        id_for_log,
                        application_generation
                    );
                }
            }
        }
        self.update_queue_depth();
    }

    fn handle_queue_message(&mut self, message: QueueMessage) {
        match message {
            QueueMessage::PassFinished {
                id,
                round,
                succeeded,
            } => {
                let retry = self.queue.done(&id, round, succeeded);
                if let Some(pass) = self.in_progress.finished(&id, round) {
                    log::debug!(
                        "Finished pass {} for Application: {} in {}ms, succeeded: {}",
                        round,
                        id,
                        pass.start_time.elapsed().as_millis(),
                        succeeded
                    );
                }
                if let Some(delay) = retry {
                    self.schedule_retry(id, round, delay);
                }
            }
            QueueMessage::RetryDue { id, round } => {
                if self.queue.retry(&id, round) {
                    log::debug!("Retrying reconcile of Application: {}", id);
                } else {
                    log::debug!(
                        "Skipping retry of Application: {} since another pass ran in the meantime",
                        id
                    );
                }
            }
        }
        self.update_queue_depth();
    }

    fn start_ready_passes(&mut self) {
        while let Some(Dequeued { id, round }) = self.queue.pop() {
            log::debug!("Starting pass {} for Application: {}", round, id);
            let reconciler = self.reconciler.clone();
            let sender = self.queue_sender.clone();
            let pass_id = id.clone();
            let handle = self.executor.spawn(async move {
                let succeeded = reconciler.reconcile(pass_id.as_id_ref()).await.is_ok();
                let message = QueueMessage::PassFinished {
                    id: pass_id,
                    round,
                    succeeded,
                };
                if sender.send(message).await.is_err() {
                    log::debug!("Operator stopped before the pass finished");
                }
            });
            self.in_progress.started(id, round, handle);
        }
        self.update_queue_depth();
    }

    fn schedule_retry(&self, id: ObjectId, round: u64, delay: Duration) {
        log::info!(
            "Retrying reconcile of Application: {} in {}ms",
            id,
            delay.as_millis()
        );
        let sender = self.queue_sender.clone();
        self.executor.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(QueueMessage::RetryDue { id, round }).await;
        });
    }

    fn update_queue_depth(&self) {
        self.metrics.set_queue_depth(self.queue.len());
    }
}
