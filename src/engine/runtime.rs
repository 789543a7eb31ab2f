//! Notification delivery runtime.
//!
//! The notification bus may deliver from several threads at once. This module
//! provides a small, bounded, thread-based runtime that feeds notifications to
//! a shared [`ReconciliationEngine`] from a fixed pool of workers. Enqueueing
//! never blocks with [`NotificationRuntime::try_dispatch`]; a full queue is
//! reported as backpressure.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, error};

use crate::error::{ExecutionError, PollError, PollResult};
use crate::event::{EventKind, Notification};

use super::{Disposition, ReconciliationEngine};

const PATH: &str = "notifications";

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of delivery workers.
    pub workers: usize,
    /// Maximum queued notifications.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Deliver {
        notification: Notification,
        reply: Sender<PollResult<Disposition>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct WorkerPool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, engine: Arc<ReconciliationEngine>) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let engine = Arc::clone(&engine);
            let handle = thread::Builder::new()
                .name(format!("pollsync-worker-{idx}"))
                .spawn(move || loop {
                    match rx.recv() {
                        Ok(Job::Deliver { notification, reply }) => {
                            let result = engine.on_notification(&notification);
                            if let Err(e) = &result {
                                error!(kind = %notification.kind, id = %notification.id, error = %e, "notification processing failed");
                            }
                            let _ = reply.send(result);
                        }
                        Err(_) => break,

                        #[cfg(test)]
                        Ok(Job::Sleep { duration, reply }) => {
                            thread::sleep(duration);
                            let _ = reply.send(());
                        }
                    }
                })
                .expect("failed to spawn pollsync worker");
            handles.push(handle);
        }

        Self {
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    fn try_submit(&self, job: Job) -> PollResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PollError::Execution(ExecutionError::QueueFull {
                path: PATH.to_string(),
                capacity: self.queue_capacity,
            })),
            Err(TrySendError::Disconnected(_)) => Err(disconnected()),
        }
    }

    fn submit(&self, job: Job) -> PollResult<()> {
        self.tx.send(job).map_err(|_| disconnected())
    }

    fn shutdown(self) {
        // Close the channel: workers drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn disconnected() -> PollError {
    PollError::Execution(ExecutionError::Disconnected {
        path: PATH.to_string(),
    })
}

/// Handle to one dispatched notification.
#[derive(Debug)]
pub struct DeliveryHandle {
    rx: Receiver<PollResult<Disposition>>,
}

impl DeliveryHandle {
    fn ready(result: PollResult<Disposition>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    /// Waits for the engine to finish with the notification.
    pub fn join(self) -> PollResult<Disposition> {
        self.rx.recv().map_err(|_| disconnected())?
    }

    /// Waits with a timeout.
    pub fn join_timeout(self, timeout: Duration) -> PollResult<Disposition> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PollError::internal(format!(
                "notification not processed within {}ms",
                timeout.as_millis()
            )),
            RecvTimeoutError::Disconnected => disconnected(),
        })?
    }
}

/// Worker pool delivering notifications to a shared engine.
pub struct NotificationRuntime {
    engine: Arc<ReconciliationEngine>,
    pool: WorkerPool,
}

impl NotificationRuntime {
    /// Start the workers.
    pub fn new(engine: ReconciliationEngine, config: RuntimeConfig) -> Self {
        Self::with_shared(Arc::new(engine), config)
    }

    /// Start the workers over an engine shared with other callers.
    pub fn with_shared(engine: Arc<ReconciliationEngine>, config: RuntimeConfig) -> Self {
        let pool = WorkerPool::start(config.workers, config.queue_capacity, Arc::clone(&engine));
        debug!(workers = pool.workers.len(), capacity = pool.queue_capacity, "notification runtime started");
        Self { engine, pool }
    }

    /// Kinds the runtime forwards to the engine.
    #[must_use]
    pub fn subscriptions(&self) -> &'static [EventKind] {
        EventKind::SUBSCRIBED
    }

    /// Enqueue without blocking; fails with `QueueFull` under backpressure.
    pub fn try_dispatch(&self, notification: Notification) -> PollResult<DeliveryHandle> {
        if !notification.kind.is_subscribed() {
            return Ok(DeliveryHandle::ready(Ok(Disposition::Ignored)));
        }
        let (reply, rx) = bounded::<PollResult<Disposition>>(1);
        self.pool.try_submit(Job::Deliver { notification, reply })?;
        Ok(DeliveryHandle { rx })
    }

    /// Enqueue, waiting for queue space.
    pub fn dispatch(&self, notification: Notification) -> PollResult<DeliveryHandle> {
        if !notification.kind.is_subscribed() {
            return Ok(DeliveryHandle::ready(Ok(Disposition::Ignored)));
        }
        let (reply, rx) = bounded::<PollResult<Disposition>>(1);
        self.pool.submit(Job::Deliver { notification, reply })?;
        Ok(DeliveryHandle { rx })
    }

    /// Dispatch and wait for the outcome.
    pub fn deliver(&self, notification: Notification) -> PollResult<Disposition> {
        self.dispatch(notification)?.join()
    }

    /// The engine the workers drive.
    #[must_use]
    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Drain queued notifications and stop the workers.
    pub fn shutdown(self) {
        drop(self);
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> PollResult<Receiver<()>> {
        let (tx, rx) = bounded::<()>(1);
        self.pool.try_submit(Job::Sleep { duration, reply: tx })?;
        Ok(rx)
    }
}

impl Drop for NotificationRuntime {
    fn drop(&mut self) {
        let pool = std::mem::replace(
            &mut self.pool,
            WorkerPool {
                tx: bounded::<Job>(1).0,
                workers: Vec::new(),
                queue_capacity: 1,
            },
        );
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::IpAddr;

    use crate::config::{ConfigStore, ConfigStoreOptions, InMemoryConfigSource};
    use crate::engine::EngineConfig;
    use crate::model::{DistributionContext, Monitor, NodeId, Package, PollerConfiguration, Service};
    use crate::registry::MonitorCatalog;
    use crate::storage::{
        FileIpListResolver, InMemoryInventory, InMemoryLiveTree, InMemoryOutageStore, LiveTree,
        RecordingEventSender, StaticFilterService,
    };

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn runtime(config: RuntimeConfig) -> (NotificationRuntime, Arc<InMemoryLiveTree>) {
        let mut pkg = Package::new("all", "IPADDR != '0.0.0.0'");
        pkg.services.push(Service::new("ICMP"));
        let doc = PollerConfiguration {
            packages: vec![pkg],
            monitors: vec![Monitor::new("ICMP", "icmp")],
            ..PollerConfiguration::default()
        };
        let mut catalog = MonitorCatalog::new();
        catalog.declare("icmp", &[DistributionContext::All]);
        let addrs = (1..=50u8).map(|b| IpAddr::from([10, 0, 0, b])).collect();
        let store = ConfigStore::load(
            Arc::new(InMemoryConfigSource::new(&doc).unwrap()),
            catalog,
            Arc::new(StaticFilterService::new().with_filter("IPADDR != '0.0.0.0'", addrs)),
            Arc::new(FileIpListResolver::new()),
            ConfigStoreOptions::default(),
        )
        .unwrap();
        let tree = Arc::new(InMemoryLiveTree::new());
        let engine = ReconciliationEngine::new(
            Arc::new(store),
            Arc::clone(&tree) as Arc<dyn LiveTree>,
            Arc::new(InMemoryOutageStore::new()),
            Arc::new(InMemoryInventory::new()),
            Arc::new(RecordingEventSender::new()),
            EngineConfig::default(),
        );
        (NotificationRuntime::new(engine, config), tree)
    }

    fn gained(node: u32, addr: &str) -> Notification {
        Notification::new(EventKind::NodeGainedService)
            .with_node(NodeId::new(node))
            .with_interface(ip(addr))
            .with_service("ICMP")
    }

    #[test]
    fn concurrent_duplicates_schedule_once() {
        let (rt, tree) = runtime(RuntimeConfig {
            workers: 4,
            queue_capacity: 64,
        });
        let handles: Vec<_> = (0..16)
            .map(|_| rt.dispatch(gained(1, "10.0.0.1")).unwrap())
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_applied());
        }
        assert_eq!(tree.all_services().unwrap().len(), 1);
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let (rt, _tree) = runtime(RuntimeConfig {
            workers: 1,
            queue_capacity: 1,
        });
        let sleep = rt.submit_sleep(Duration::from_millis(200)).unwrap();
        // Give the worker time to pick up the sleep job, then fill the queue.
        thread::sleep(Duration::from_millis(50));
        let queued = rt.try_dispatch(gained(1, "10.0.0.1")).unwrap();

        let err = rt.try_dispatch(gained(1, "10.0.0.2")).unwrap_err();
        let PollError::Execution(ExecutionError::QueueFull { path, capacity }) = err else {
            panic!("expected QueueFull, got {err:?}");
        };
        assert_eq!(path, "notifications");
        assert_eq!(capacity, 1);

        sleep.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(queued.join().unwrap().is_applied());
    }

    #[test]
    fn unsubscribed_kinds_never_reach_workers() {
        let (rt, tree) = runtime(RuntimeConfig::default());
        let n = Notification::new(EventKind::ReloadDaemonConfigFailed).with_node(NodeId::new(1));
        assert_eq!(rt.try_dispatch(n).unwrap().join().unwrap(), Disposition::Ignored);
        assert!(tree.operations().unwrap().is_empty());
    }

    #[test]
    fn shutdown_drains_queue() {
        let (rt, tree) = runtime(RuntimeConfig {
            workers: 2,
            queue_capacity: 128,
        });
        for b in 1..=40u8 {
            let _ = rt.dispatch(gained(u32::from(b), &format!("10.0.0.{b}"))).unwrap();
        }
        rt.shutdown();
        assert_eq!(tree.all_services().unwrap().len(), 40);
    }

    #[test]
    fn join_reports_disconnected_when_reply_dropped() {
        let (tx, rx) = bounded::<PollResult<Disposition>>(1);
        drop(tx);
        let err = DeliveryHandle { rx }.join().unwrap_err();
        assert!(matches!(
            err,
            PollError::Execution(ExecutionError::Disconnected { .. })
        ));
    }
}
