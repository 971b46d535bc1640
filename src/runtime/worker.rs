// src/runtime/worker.rs
//! Worker threads owning the pools
//!
//! Interpreter states are not thread-safe, so each worker thread owns one
//! [`Pool`] per configured location and runs every unit of work itself.
//! Hosts talk to workers through channels:
//!
//! ```text
//! WorkerGroup::submit ──round robin──► worker N
//!                                        ├─ select! { message, next timer }
//!                                        ├─ acquire → run → release
//!                                        └─ oneshot reply: Completion
//! ```
//!
//! Between messages a worker sleeps until its earliest eviction deadline,
//! so idle states are closed on time even with no traffic.

use crate::runtime::interpreter::{FailureKind, Interpreter};
use crate::runtime::monitor::Monitor;
use crate::runtime::pool::{Pool, PoolConfig, PoolStats};
use crate::runtime::state::StateId;
use crate::utils::config::Settings;
use crate::utils::errors::{PoolError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Outcome of one unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    /// Result code, [`RESULT_FAILED`](crate::runtime::executor::RESULT_FAILED) on failure
    pub code: i64,

    pub failure: Option<FailureKind>,

    /// Error message, when the location captures diagnostics
    pub diagnostic: Option<String>,

    /// State the work ran in
    pub state_id: StateId,

    pub worker: usize,
}

enum Message<W> {
    Run {
        location: String,
        work: W,
        reply: oneshot::Sender<Result<Completion>>,
    },
    Stats {
        reply: oneshot::Sender<BTreeMap<String, PoolStats>>,
    },
}

struct Worker<I: Interpreter> {
    id: usize,
    pools: HashMap<String, Pool<I>>,
}

impl<I> Worker<I>
where
    I: Interpreter,
    I::Work: Sized,
{
    fn new(id: usize, locations: &BTreeMap<String, PoolConfig>, monitor: Option<Arc<Monitor>>) -> Self {
        let pools = locations
            .iter()
            .map(|(name, config)| {
                let pool = Pool::new(name.clone(), config.clone(), monitor.clone());
                (name.clone(), pool)
            })
            .collect();
        Self { id, pools }
    }

    /// Main event loop, runs on the worker's own thread
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message<I::Work>>) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Worker {} failed to start its runtime: {}", self.id, e);
                return;
            }
        };

        debug!("Worker {} started", self.id);

        rt.block_on(async {
            loop {
                let deadline = self.next_deadline();
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => self.handle(message),
                        // every sender dropped
                        None => break,
                    },
                    _ = sleep_until(deadline) => {
                        self.expire(Instant::now());
                    }
                }
            }
        });

        let closed: usize = self.pools.values_mut().map(Pool::close_all).sum();
        debug!("Worker {} shutting down, closed {} states", self.id, closed);
    }

    fn handle(&mut self, message: Message<I::Work>) {
        match message {
            Message::Run {
                location,
                work,
                reply,
            } => {
                let completion = self.execute(&location, &work);
                if reply.send(completion).is_err() {
                    debug!("Worker {}: requester went away before completion", self.id);
                }
            }
            Message::Stats { reply } => {
                let stats = self
                    .pools
                    .iter()
                    .map(|(name, pool)| (name.clone(), pool.stats()))
                    .collect();
                if reply.send(stats).is_err() {
                    debug!("Worker {}: requester went away before stats", self.id);
                }
            }
        }
    }

    fn execute(&mut self, location: &str, work: &I::Work) -> Result<Completion> {
        let pool = self
            .pools
            .get_mut(location)
            .ok_or_else(|| PoolError::UnknownLocation(location.to_string()))?;

        let mut handle = pool.acquire()?;
        let code = handle.run(work);
        let completion = Completion {
            code,
            failure: handle.failure(),
            diagnostic: handle.take_diagnostic(),
            state_id: handle.state().id(),
            worker: self.id,
        };
        pool.release(handle);

        Ok(completion)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pools.values().filter_map(Pool::next_deadline).min()
    }

    fn expire(&mut self, now: Instant) {
        let closed: usize = self.pools.values_mut().map(|pool| pool.expire(now)).sum();
        if closed > 0 {
            debug!("Worker {} evicted {} states", self.id, closed);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to communicate with a worker thread
struct WorkerHandle<W> {
    sender: mpsc::UnboundedSender<Message<W>>,
    thread: JoinHandle<()>,
}

/// Fixed set of worker threads sharing one optional monitor
pub struct WorkerGroup<W> {
    workers: Vec<WorkerHandle<W>>,
    next: AtomicUsize,
    monitor: Option<Arc<Monitor>>,
}

impl<W: Send + 'static> WorkerGroup<W> {
    /// Spawn `settings.workers` threads, each with one pool per location
    pub fn start<I>(settings: &Settings, monitor: Option<Arc<Monitor>>) -> Result<Self>
    where
        I: Interpreter<Work = W> + 'static,
    {
        settings.validate()?;

        let locations: Arc<BTreeMap<String, PoolConfig>> = Arc::new(
            settings
                .locations
                .iter()
                .map(|(name, location)| (name.clone(), PoolConfig::from(location)))
                .collect(),
        );

        info!(
            "Starting {} workers for {} locations",
            settings.workers,
            locations.len()
        );

        let mut workers = Vec::with_capacity(settings.workers);
        for id in 0..settings.workers {
            let (sender, rx) = mpsc::unbounded_channel();
            let locations = Arc::clone(&locations);
            let monitor = monitor.clone();

            let thread = thread::Builder::new()
                .name(format!("lua-worker-{}", id))
                .spawn(move || Worker::<I>::new(id, &locations, monitor).run(rx))?;

            workers.push(WorkerHandle { sender, thread });
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            monitor,
        })
    }

    /// Run `work` in the pool of `location` on the next worker
    pub async fn submit(&self, location: &str, work: W) -> Result<Completion> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (reply, response) = oneshot::channel();

        self.workers[index]
            .sender
            .send(Message::Run {
                location: location.to_string(),
                work,
                reply,
            })
            .map_err(|_| PoolError::WorkerUnavailable(format!("worker {} stopped", index)))?;

        response.await.map_err(|_| {
            PoolError::WorkerUnavailable(format!("worker {} dropped the request", index))
        })?
    }

    /// Pool occupancy of every worker, indexed by worker
    pub async fn stats(&self) -> Result<Vec<BTreeMap<String, PoolStats>>> {
        let mut all = Vec::with_capacity(self.workers.len());
        for (index, worker) in self.workers.iter().enumerate() {
            let (reply, response) = oneshot::channel();
            worker
                .sender
                .send(Message::Stats { reply })
                .map_err(|_| PoolError::WorkerUnavailable(format!("worker {} stopped", index)))?;
            all.push(response.await.map_err(|_| {
                PoolError::WorkerUnavailable(format!("worker {} dropped the request", index))
            })?);
        }
        Ok(all)
    }
}

impl<W> WorkerGroup<W> {
    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop every worker and wait for its idle states to close
    pub fn shutdown(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        for (index, worker) in self.workers.drain(..).enumerate() {
            // a closed channel ends the worker loop
            drop(worker.sender);
            if worker.thread.join().is_err() {
                error!("Worker {} panicked", index);
            }
        }
    }
}

impl<W> Drop for WorkerGroup<W> {
    fn drop(&mut self) {
        self.join_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::RESULT_FAILED;
    use crate::runtime::mock::{Op, ScriptedInterpreter};
    use crate::utils::config::{LocationConfig, DEFAULT_LOCATION};
    use std::time::Duration;

    fn settings(workers: usize, location: LocationConfig) -> Settings {
        let mut settings = Settings {
            workers,
            ..Default::default()
        };
        settings.locations.insert("api".to_string(), location);
        settings
    }

    fn start(settings: &Settings, monitor: Option<Arc<Monitor>>) -> WorkerGroup<Vec<Op>> {
        WorkerGroup::start::<ScriptedInterpreter>(settings, monitor).unwrap()
    }

    #[tokio::test]
    async fn test_submit_runs_work() {
        let group = start(&settings(1, LocationConfig::default()), None);

        let completion = group
            .submit(DEFAULT_LOCATION, vec![Op::Alloc(8), Op::Return(42)])
            .await
            .unwrap();
        assert_eq!(completion.code, 42);
        assert_eq!(completion.failure, None);
        assert_eq!(completion.worker, 0);
    }

    #[tokio::test]
    async fn test_state_reused_on_same_worker() {
        let group = start(&settings(1, LocationConfig::default()), None);

        let first = group.submit("api", vec![Op::Return(1)]).await.unwrap();
        let second = group.submit("api", vec![Op::Return(2)]).await.unwrap();
        assert_eq!(first.state_id, second.state_id);

        let stats = group.stats().await.unwrap();
        assert_eq!(stats[0]["api"], PoolStats { live: 1, idle: 1, in_use: 0 });
        assert_eq!(stats[0][DEFAULT_LOCATION].live, 0);
    }

    #[tokio::test]
    async fn test_round_robin() {
        let group = start(&settings(3, LocationConfig::default()), None);
        assert_eq!(group.len(), 3);

        let mut workers = Vec::new();
        for _ in 0..6 {
            workers.push(group.submit("api", vec![]).await.unwrap().worker);
        }
        assert_eq!(workers, vec![0, 1, 2, 0, 1, 2]);
    }

    #[tokio::test]
    async fn test_unknown_location() {
        let group = start(&settings(1, LocationConfig::default()), None);

        let result = group.submit("missing", vec![]).await;
        assert!(matches!(result, Err(PoolError::UnknownLocation(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_failure_reported_with_diagnostic() {
        let group = start(
            &settings(
                1,
                LocationConfig {
                    memory_max: 1000,
                    diagnostic: true,
                    ..Default::default()
                },
            ),
            None,
        );

        let completion = group
            .submit("api", vec![Op::Alloc(1000), Op::Alloc(1)])
            .await
            .unwrap();
        assert_eq!(completion.code, RESULT_FAILED);
        assert_eq!(completion.failure, Some(FailureKind::OutOfMemory));
        assert_eq!(completion.diagnostic.as_deref(), Some("not enough memory"));

        let next = group.submit("api", vec![]).await.unwrap();
        assert_ne!(next.state_id, completion.state_id);
    }

    #[tokio::test]
    async fn test_worker_evicts_idle_states() {
        let monitor = Arc::new(Monitor::new());
        let group = start(
            &settings(
                1,
                LocationConfig {
                    idle_timeout_ms: 20,
                    ..Default::default()
                },
            ),
            Some(Arc::clone(&monitor)),
        );

        group.submit("api", vec![]).await.unwrap();
        assert_eq!(monitor.snapshot().states, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(monitor.snapshot().states, 0);
        assert_eq!(group.stats().await.unwrap()[0]["api"].live, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_states() {
        let monitor = Arc::new(Monitor::new());
        let group = start(&settings(2, LocationConfig::default()), Some(Arc::clone(&monitor)));

        group.submit("api", vec![Op::Alloc(64)]).await.unwrap();
        group.submit("api", vec![Op::Alloc(64)]).await.unwrap();
        assert_eq!(monitor.snapshot().states, 2);
        assert_eq!(monitor.snapshot().requests, 2);

        group.shutdown();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.states, 0);
        assert_eq!(snapshot.memory_used, 0);
        assert_eq!(snapshot.requests, 2);
    }

    #[tokio::test]
    async fn test_abandoned_stats_request_keeps_worker_running() {
        let group = start(&settings(1, LocationConfig::default()), None);

        let (reply, response) = oneshot::channel();
        drop(response);
        group.workers[0]
            .sender
            .send(Message::Stats { reply })
            .unwrap();

        let completion = group.submit("api", vec![Op::Return(5)]).await.unwrap();
        assert_eq!(completion.code, 5);
        assert_eq!(group.stats().await.unwrap()[0]["api"].live, 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = Settings {
            workers: 0,
            ..Default::default()
        };
        assert!(WorkerGroup::<Vec<Op>>::start::<ScriptedInterpreter>(&settings, None).is_err());
    }
}
