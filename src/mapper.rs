use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// An executor owns one broker connection and serves every worker bound to
/// it. `stop` is synchronous from the mapper's point of view: when it
/// returns, the executor's internal tasks have exited.
pub trait Executor: Send + Sync + 'static {
    fn broker_id(&self) -> i32;

    fn stop(&self) -> impl Future<Output = ()> + Send;
}

/// The two operations the mapper needs from whatever provides broker
/// identity and broker-side connections.
pub trait Resolver: Send + Sync + 'static {
    /// Identifies a worker. For the consumer this is the topic/partition.
    type Key: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static;
    /// A resolved broker identity, carrying whatever the executor needs to
    /// talk to it.
    type Broker: Send + 'static;
    type Executor: Executor;

    fn resolve_broker(
        &self,
        key: &Self::Key,
    ) -> impl Future<Output = anyhow::Result<Self::Broker>> + Send;

    fn broker_id(&self, broker: &Self::Broker) -> i32;

    fn spawn_executor(
        &self,
        broker: Self::Broker,
    ) -> impl Future<Output = Self::Executor> + Send;
}

/// A worker's view of its current executor. `None` means no broker could be
/// resolved; the worker schedules a reassignment retry.
pub type Assignment<E> = Option<Arc<E>>;

pub enum MapperMsg<K, E> {
    WorkerSpawned(K, mpsc::Sender<Assignment<E>>),
    WorkerReassign(K),
    WorkerStopped(K),
}

struct WorkerEntry<E> {
    assignment_tx: mpsc::Sender<Assignment<E>>,
    executor: Option<i32>,
}

struct ExecutorEntry<E> {
    executor: Arc<E>,
    workers: usize,
}

struct MapperState<R: Resolver> {
    resolver: Arc<R>,
    workers: HashMap<R::Key, WorkerEntry<R::Executor>>,
    executors: HashMap<i32, ExecutorEntry<R::Executor>>,
}

struct MapperActor<R>(PhantomData<R>);

impl<R: Resolver> MapperActor<R> {
    /// Re-resolves the worker's broker and delivers the (possibly
    /// unchanged, possibly nil) assignment. Always pushes something so the
    /// worker can resume or schedule a retry.
    async fn assign(state: &mut MapperState<R>, key: &R::Key) {
        let Some(worker) = state.workers.get(key) else {
            return;
        };
        let current = worker.executor;
        let assignment_tx = worker.assignment_tx.clone();

        let resolver = state.resolver.clone();
        let assignment = match resolver.resolve_broker(key).await {
            Err(e) => {
                error!("failed to resolve broker for {}: {}", key, e);
                None
            }
            Ok(broker) => {
                let broker_id = resolver.broker_id(&broker);
                if current == Some(broker_id) {
                    Some(state.executors[&broker_id].executor.clone())
                } else {
                    if let Some(old) = current {
                        Self::release(state, old).await;
                    }
                    let executor = match state.executors.get_mut(&broker_id) {
                        Some(entry) => {
                            entry.workers += 1;
                            entry.executor.clone()
                        }
                        None => {
                            debug!("spawning executor for broker {}", broker_id);
                            let executor = Arc::new(resolver.spawn_executor(broker).await);
                            state.executors.insert(
                                broker_id,
                                ExecutorEntry {
                                    executor: executor.clone(),
                                    workers: 1,
                                },
                            );
                            executor
                        }
                    };
                    if let Some(worker) = state.workers.get_mut(key) {
                        worker.executor = Some(broker_id);
                    }
                    Some(executor)
                }
            }
        };

        debug!(
            "assigned broker {:?} to {}",
            assignment.as_ref().map(|e| e.broker_id()),
            key
        );
        // Capacity-1 channel: delivery completes before the next event for
        // this worker is handled. A send error means the worker is gone.
        let _ = assignment_tx.send(assignment).await;
    }

    async fn release(state: &mut MapperState<R>, broker_id: i32) {
        let Some(entry) = state.executors.get_mut(&broker_id) else {
            return;
        };
        entry.workers -= 1;
        if entry.workers == 0 {
            let entry = state.executors.remove(&broker_id).unwrap();
            info!("stopping executor for broker {}: no workers left", broker_id);
            entry.executor.stop().await;
        }
    }
}

impl<R: Resolver> Actor for MapperActor<R> {
    type Msg = MapperMsg<R::Key, R::Executor>;
    type State = MapperState<R>;
    type Arguments = Arc<R>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        resolver: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(MapperState {
            resolver,
            workers: HashMap::new(),
            executors: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            MapperMsg::WorkerSpawned(key, assignment_tx) => {
                debug!("worker spawned: {}", key);
                state.workers.insert(
                    key.clone(),
                    WorkerEntry {
                        assignment_tx,
                        executor: None,
                    },
                );
                Self::assign(state, &key).await;
            }
            MapperMsg::WorkerReassign(key) => {
                debug!("worker reassign: {}", key);
                Self::assign(state, &key).await;
            }
            MapperMsg::WorkerStopped(key) => {
                debug!("worker stopped: {}", key);
                if let Some(entry) = state.workers.remove(&key) {
                    if let Some(broker_id) = entry.executor {
                        Self::release(state, broker_id).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let executors: Vec<_> = state.executors.drain().map(|(_, e)| e.executor).collect();
        join_all(executors.iter().map(|e| e.stop())).await;
        Ok(())
    }
}

/// Owns the binding `worker -> executor`. Workers announce themselves and
/// their lifecycle transitions; the mapper resolves brokers, spawns or
/// reuses executors, and garbage-collects executors nobody uses.
pub struct Mapper<R: Resolver> {
    actor: ActorRef<MapperMsg<R::Key, R::Executor>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Resolver> Mapper<R> {
    pub async fn spawn(resolver: Arc<R>) -> anyhow::Result<Self> {
        let (actor, handle) = Actor::spawn(None, MapperActor::<R>(PhantomData), resolver)
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn mapper: {}", e))?;
        Ok(Self {
            actor,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn worker_spawned(&self, key: R::Key, assignment_tx: mpsc::Sender<Assignment<R::Executor>>) {
        let _ = self
            .actor
            .send_message(MapperMsg::WorkerSpawned(key, assignment_tx));
    }

    pub fn worker_reassign(&self, key: R::Key) {
        let _ = self.actor.send_message(MapperMsg::WorkerReassign(key));
    }

    pub fn worker_stopped(&self, key: R::Key) {
        let _ = self.actor.send_message(MapperMsg::WorkerStopped(key));
    }

    /// Stops the event loop and synchronously stops every live executor.
    pub async fn stop(&self) {
        self.actor.stop(None);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubExecutor {
        broker_id: i32,
        stopped: AtomicBool,
    }

    impl Executor for StubExecutor {
        fn broker_id(&self) -> i32 {
            self.broker_id
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    struct StubResolver {
        // worker name -> broker id; no entry means resolution fails
        routes: std::sync::Mutex<HashMap<String, i32>>,
    }

    impl StubResolver {
        fn new(routes: &[(&str, i32)]) -> Arc<Self> {
            Arc::new(Self {
                routes: std::sync::Mutex::new(
                    routes.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                ),
            })
        }

        fn set_route(&self, key: &str, broker_id: i32) {
            self.routes.lock().unwrap().insert(key.to_string(), broker_id);
        }
    }

    impl Resolver for StubResolver {
        type Key = String;
        type Broker = i32;
        type Executor = StubExecutor;

        async fn resolve_broker(&self, key: &String) -> anyhow::Result<i32> {
            self.routes
                .lock()
                .unwrap()
                .get(key)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no route for {}", key))
        }

        fn broker_id(&self, broker: &i32) -> i32 {
            *broker
        }

        async fn spawn_executor(&self, broker: i32) -> StubExecutor {
            StubExecutor {
                broker_id: broker,
                stopped: AtomicBool::new(false),
            }
        }
    }

    fn worker() -> (mpsc::Sender<Assignment<StubExecutor>>, mpsc::Receiver<Assignment<StubExecutor>>) {
        mpsc::channel(1)
    }

    #[tokio::test]
    async fn workers_on_same_broker_share_an_executor() {
        let resolver = StubResolver::new(&[("a", 1), ("b", 1)]);
        let mapper = Mapper::spawn(resolver).await.unwrap();

        let (tx_a, mut rx_a) = worker();
        let (tx_b, mut rx_b) = worker();
        mapper.worker_spawned("a".to_string(), tx_a);
        mapper.worker_spawned("b".to_string(), tx_b);

        let ex_a = rx_a.recv().await.unwrap().unwrap();
        let ex_b = rx_b.recv().await.unwrap().unwrap();
        assert_eq!(ex_a.broker_id(), 1);
        assert!(Arc::ptr_eq(&ex_a, &ex_b));

        mapper.stop().await;
    }

    #[tokio::test]
    async fn executor_stops_when_last_worker_leaves() {
        let resolver = StubResolver::new(&[("a", 1), ("b", 1)]);
        let mapper = Mapper::spawn(resolver.clone()).await.unwrap();

        let (tx_a, mut rx_a) = worker();
        let (tx_b, mut rx_b) = worker();
        mapper.worker_spawned("a".to_string(), tx_a);
        mapper.worker_spawned("b".to_string(), tx_b);
        let ex = rx_a.recv().await.unwrap().unwrap();
        rx_b.recv().await.unwrap().unwrap();

        // Move "a" to broker 2: broker 1 must survive, refcount is still 1.
        resolver.set_route("a", 2);
        mapper.worker_reassign("a".to_string());
        let ex2 = rx_a.recv().await.unwrap().unwrap();
        assert_eq!(ex2.broker_id(), 2);
        assert!(!ex.stopped.load(Ordering::SeqCst));

        // Last worker off broker 1: its executor stops.
        mapper.worker_stopped("b".to_string());
        mapper.worker_stopped("a".to_string());
        // Stopping the mapper flushes the queue.
        mapper.stop().await;
        assert!(ex.stopped.load(Ordering::SeqCst));
        assert!(ex2.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_resolution_delivers_nil_assignment() {
        let resolver = StubResolver::new(&[]);
        let mapper = Mapper::spawn(resolver.clone()).await.unwrap();

        let (tx, mut rx) = worker();
        mapper.worker_spawned("a".to_string(), tx);
        assert!(rx.recv().await.unwrap().is_none());

        // Route appears: the retrying worker gets a real executor.
        resolver.set_route("a", 3);
        mapper.worker_reassign("a".to_string());
        let ex = rx.recv().await.unwrap().unwrap();
        assert_eq!(ex.broker_id(), 3);

        mapper.stop().await;
    }

    #[tokio::test]
    async fn reassignment_to_same_broker_redelivers_assignment() {
        let resolver = StubResolver::new(&[("a", 1)]);
        let mapper = Mapper::spawn(resolver).await.unwrap();

        let (tx, mut rx) = worker();
        mapper.worker_spawned("a".to_string(), tx);
        let first = rx.recv().await.unwrap().unwrap();

        mapper.worker_reassign("a".to_string());
        let second = rx.recv().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        mapper.stop().await;
    }
}
