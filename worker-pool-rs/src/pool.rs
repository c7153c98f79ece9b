//! # Isolated Worker Pool
//!
//! Supervises one long-lived inference worker and multiplexes concurrent
//! calls onto it.
//!
//! - **Dispatch**: `call` registers a pending slot under a fresh correlation
//!   id and forwards the request on the worker's request queue.
//! - **Collection**: a task per worker incarnation resolves pending slots
//!   from the response queue; when the queue closes, every call in flight to
//!   that incarnation fails with [`PoolError::WorkerCrashed`].
//! - **Monitor**: a periodic loop reaps calls past their deadline and
//!   restarts a dead worker, spacing restarts by `restart_min_interval` and
//!   giving up after `max_restarts`. A pool past its budget is `Failed` for
//!   good and every call fails fast with [`PoolError::ResourceExhausted`].
//!
//! A pending slot is settled by whoever removes it from the pending map, so
//! a response, a timeout and a shutdown can race without double delivery.
//! Late responses for settled calls are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use shared_types::Blueprint;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{KillSwitch, WorkerChannel, WorkerRequest, WorkerResponse, WorkerSpawner};
use crate::error::{PoolError, Result};

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolStatus {
    /// Not started yet
    Idle,
    /// Worker is up and accepting calls
    Running,
    /// Worker died; waiting for the next restart window
    Restarting,
    /// Restart budget exhausted
    Failed,
    /// `stop` in progress
    ShuttingDown,
    /// Stopped
    Terminated,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Idle => write!(f, "IDLE"),
            PoolStatus::Running => write!(f, "RUNNING"),
            PoolStatus::Restarting => write!(f, "RESTARTING"),
            PoolStatus::Failed => write!(f, "FAILED"),
            PoolStatus::ShuttingDown => write!(f, "SHUTTING_DOWN"),
            PoolStatus::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Pool supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Period of the monitor loop
    pub monitor_interval: Duration,
    /// Minimum spacing between two worker starts
    pub restart_min_interval: Duration,
    /// Restarts allowed over the pool's lifetime
    pub max_restarts: u32,
}

/// Shortest monitor period; `tokio::time::interval` rejects zero.
const MIN_MONITOR_INTERVAL: Duration = Duration::from_millis(1);

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_millis(250),
            restart_min_interval: Duration::from_secs(1),
            max_restarts: 5,
        }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub status: PoolStatus,
    pub backend: String,
    pub generation: u64,
    pub restarts: u32,
    pub pending: usize,
    pub calls: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub crashed: u64,
    pub last_restart: Option<DateTime<Utc>>,
}

type CallResult = Result<Blueprint>;

struct PendingCall {
    tx: oneshot::Sender<CallResult>,
    deadline: Instant,
    timeout: Duration,
    generation: u64,
}

impl PendingCall {
    fn settle(self, result: CallResult) {
        // The caller may have gone away; nothing else to do then.
        let _ = self.tx.send(result);
    }
}

struct WorkerSlot {
    requests: mpsc::Sender<WorkerRequest>,
    kill: KillSwitch,
    generation: u64,
    alive: Arc<AtomicBool>,
}

struct RestartLedger {
    count: u32,
    last_start: Option<Instant>,
    last_restart_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    completed: AtomicU64,
    timeouts: AtomicU64,
    crashed: AtomicU64,
}

struct Inner {
    name: String,
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    pending: Mutex<HashMap<Uuid, PendingCall>>,
    worker: Mutex<Option<WorkerSlot>>,
    restarts: Mutex<RestartLedger>,
    generation: AtomicU64,
    restart_count: AtomicU32,
    counters: Counters,
    status_tx: watch::Sender<PoolStatus>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Supervised single-worker pool
pub struct IsolatedWorkerPool {
    inner: Arc<Inner>,
    status_rx: watch::Receiver<PoolStatus>,
    shutdown_tx: broadcast::Sender<()>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for IsolatedWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedWorkerPool")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl IsolatedWorkerPool {
    pub fn new<S: Into<String>>(name: S, spawner: Arc<dyn WorkerSpawner>, mut config: PoolConfig) -> Self {
        if config.monitor_interval < MIN_MONITOR_INTERVAL {
            warn!(
                requested = ?config.monitor_interval,
                "Monitor interval too short; clamping to {MIN_MONITOR_INTERVAL:?}"
            );
            config.monitor_interval = MIN_MONITOR_INTERVAL;
        }
        let (status_tx, status_rx) = watch::channel(PoolStatus::Idle);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            name: name.into(),
            config,
            spawner,
            pending: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            restarts: Mutex::new(RestartLedger {
                count: 0,
                last_start: None,
                last_restart_at: None,
            }),
            generation: AtomicU64::new(0),
            restart_count: AtomicU32::new(0),
            counters: Counters::default(),
            status_tx,
        });

        Self {
            inner,
            status_rx,
            shutdown_tx,
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the first worker and the monitor loop.
    pub async fn start(&self) -> Result<()> {
        match self.status() {
            PoolStatus::Idle => {}
            PoolStatus::Running | PoolStatus::Restarting => return Ok(()),
            PoolStatus::Failed => {
                return Err(PoolError::ResourceExhausted {
                    restarts: self.inner.restart_count.load(Ordering::SeqCst),
                })
            }
            PoolStatus::ShuttingDown | PoolStatus::Terminated => return Err(PoolError::ShuttingDown),
        }

        // Running before launch: a worker that dies instantly must still be
        // seen by its collector as a crash.
        self.inner.set_status(PoolStatus::Running);
        if let Err(e) = self.inner.clone().launch_worker().await {
            error!(pool = %self.inner.name, error = %e, "Failed to start worker");
            self.inner.set_status(PoolStatus::Idle);
            return Err(e);
        }

        let handle = tokio::spawn(self.inner.clone().monitor_loop(self.shutdown_tx.subscribe()));
        *lock(&self.monitor) = Some(handle);

        info!(
            pool = %self.inner.name,
            backend = %self.inner.spawner.describe(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Stops the monitor, kills the worker and fails every pending call.
    pub async fn stop(&self) {
        if matches!(self.status(), PoolStatus::Terminated) {
            return;
        }
        self.inner.set_status(PoolStatus::ShuttingDown);
        let _ = self.shutdown_tx.send(());

        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(pool = %self.inner.name, error = %e, "Monitor loop ended abnormally");
            }
        }

        // Drain before the kill so the collector finds nothing to fail.
        let drained = self.inner.drain_pending(|_| true);
        for call in drained {
            call.settle(Err(PoolError::ShuttingDown));
        }

        if let Some(slot) = lock(&self.inner.worker).take() {
            slot.alive.store(false, Ordering::SeqCst);
            slot.kill.fire();
        }

        self.inner.set_status(PoolStatus::Terminated);
        info!(pool = %self.inner.name, "Worker pool stopped");
    }

    /// Runs one inference call, failing with [`PoolError::Timeout`] once
    /// `timeout` elapses.
    pub async fn call(&self, prompt: &str, timeout: Duration) -> Result<Blueprint> {
        let inner = &self.inner;
        match self.status() {
            PoolStatus::Running => {}
            PoolStatus::Restarting => {
                return Err(PoolError::WorkerCrashed("worker is restarting".into()))
            }
            PoolStatus::Failed => {
                return Err(PoolError::ResourceExhausted {
                    restarts: inner.restart_count.load(Ordering::SeqCst),
                })
            }
            PoolStatus::Idle => return Err(PoolError::NotRunning),
            PoolStatus::ShuttingDown | PoolStatus::Terminated => return Err(PoolError::ShuttingDown),
        }

        let (requests, generation, alive) = {
            let worker = lock(&inner.worker);
            match worker.as_ref() {
                Some(slot) if slot.alive.load(Ordering::SeqCst) => {
                    (slot.requests.clone(), slot.generation, slot.alive.clone())
                }
                _ => return Err(PoolError::WorkerCrashed("no live worker".into())),
            }
        };

        let id = Uuid::new_v4();
        let deadline = Instant::now() + timeout;
        let (tx, mut rx) = oneshot::channel();
        lock(&inner.pending).insert(
            id,
            PendingCall {
                tx,
                deadline,
                timeout,
                generation,
            },
        );
        inner.counters.calls.fetch_add(1, Ordering::Relaxed);
        gauge!("tonecraft_worker_pending_calls", inner.pending_len() as f64, "pool" => inner.name.clone());

        // The collector flags the worker dead before draining, so a call
        // registered after the drain sees the flag here.
        if !alive.load(Ordering::SeqCst) {
            inner.settle(id, Err(PoolError::WorkerCrashed("worker died during dispatch".into())));
        } else {
            let request = WorkerRequest {
                id,
                prompt: prompt.to_string(),
            };
            if requests.send(request).await.is_err() {
                inner.settle(id, Err(PoolError::WorkerCrashed("request queue closed".into())));
            } else {
                debug!(pool = %inner.name, call_id = %id, generation, "Dispatched call");
            }
        }

        tokio::select! {
            result = &mut rx => result.unwrap_or(Err(PoolError::ShuttingDown)),
            _ = tokio::time::sleep_until(deadline) => {
                inner.expire(id);
                rx.await.unwrap_or(Err(PoolError::ShuttingDown))
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        *self.status_rx.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<PoolStatus> {
        self.status_rx.clone()
    }

    /// Kills the current worker as if it had crashed; the monitor restarts it.
    pub fn kill_worker(&self) -> bool {
        match lock(&self.inner.worker).as_ref() {
            Some(slot) => {
                warn!(pool = %self.inner.name, generation = slot.generation, "Killing worker on request");
                slot.kill.fire();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let ledger = lock(&inner.restarts);
        PoolStats {
            status: self.status(),
            backend: inner.spawner.describe(),
            generation: inner.generation.load(Ordering::SeqCst),
            restarts: ledger.count,
            pending: inner.pending_len(),
            calls: inner.counters.calls.load(Ordering::Relaxed),
            completed: inner.counters.completed.load(Ordering::Relaxed),
            timeouts: inner.counters.timeouts.load(Ordering::Relaxed),
            crashed: inner.counters.crashed.load(Ordering::Relaxed),
            last_restart: ledger.last_restart_at,
        }
    }
}

impl Drop for IsolatedWorkerPool {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(slot) = lock(&self.inner.worker).take() {
            slot.kill.fire();
        }
    }
}

impl Inner {
    fn set_status(&self, status: PoolStatus) {
        let previous = *self.status_tx.borrow();
        if previous != status {
            info!(pool = %self.name, from = %previous, to = %status, "Worker pool status changed");
            self.status_tx.send_replace(status);
        }
    }

    fn status(&self) -> PoolStatus {
        *self.status_tx.borrow()
    }

    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Settles `id` if still pending; a no-op otherwise.
    fn settle(&self, id: Uuid, result: CallResult) -> bool {
        let call = lock(&self.pending).remove(&id);
        match call {
            Some(call) => {
                match &result {
                    Ok(_) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(PoolError::WorkerCrashed(_)) => {
                        self.counters.crashed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {}
                }
                call.settle(result);
                true
            }
            None => false,
        }
    }

    fn expire(&self, id: Uuid) {
        let call = lock(&self.pending).remove(&id);
        if let Some(call) = call {
            self.timed_out(id, call);
        }
    }

    fn timed_out(&self, id: Uuid, call: PendingCall) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("tonecraft_worker_call_timeouts_total", 1, "pool" => self.name.clone());
        warn!(pool = %self.name, call_id = %id, timeout_ms = call.timeout.as_millis() as u64, "Worker call timed out");
        let after = call.timeout;
        call.settle(Err(PoolError::Timeout { id, after }));
    }

    fn drain_pending<F>(&self, mut predicate: F) -> Vec<PendingCall>
    where
        F: FnMut(&PendingCall) -> bool,
    {
        let mut pending = lock(&self.pending);
        let ids: Vec<Uuid> = pending
            .iter()
            .filter(|(_, call)| predicate(call))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    }

    /// Spawns a worker incarnation and its collector; returns its liveness flag.
    async fn launch_worker(self: Arc<Self>) -> Result<Arc<AtomicBool>> {
        let WorkerChannel {
            requests,
            responses,
            kill,
        } = self.spawner.spawn().await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let alive = Arc::new(AtomicBool::new(true));

        {
            let mut ledger = lock(&self.restarts);
            ledger.last_start = Some(Instant::now());
        }

        let previous = lock(&self.worker).replace(WorkerSlot {
            requests,
            kill,
            generation,
            alive: alive.clone(),
        });
        if let Some(old) = previous {
            old.kill.fire();
        }

        tokio::spawn(self.clone().collect_responses(responses, generation, alive.clone()));
        debug!(pool = %self.name, generation, "Worker launched");
        Ok(alive)
    }

    async fn collect_responses(
        self: Arc<Self>,
        mut responses: mpsc::Receiver<WorkerResponse>,
        generation: u64,
        alive: Arc<AtomicBool>,
    ) {
        while let Some(response) = responses.recv().await {
            let result = response.result.map_err(PoolError::Inference);
            if !self.settle(response.id, result) {
                debug!(pool = %self.name, call_id = %response.id, "Dropping response for settled call");
            }
        }

        // Liveness and Running/Restarting flips happen under the worker lock
        // so a restart cannot mark a dead incarnation as running.
        let orphaned = {
            let worker = lock(&self.worker);
            alive.store(false, Ordering::SeqCst);
            let orphaned = self.drain_pending(|call| call.generation == generation);
            let current = worker.as_ref().map(|slot| slot.generation) == Some(generation);
            if current && self.status() == PoolStatus::Running {
                error!(
                    pool = %self.name,
                    generation,
                    in_flight = orphaned.len(),
                    "Worker died"
                );
                self.set_status(PoolStatus::Restarting);
            }
            orphaned
        };
        for call in orphaned {
            self.counters.crashed.fetch_add(1, Ordering::Relaxed);
            call.settle(Err(PoolError::WorkerCrashed(format!(
                "worker generation {generation} exited"
            ))));
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(pool = %self.name, "Monitor loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.reap_expired();
                    if self.status() == PoolStatus::Restarting {
                        self.clone().try_restart().await;
                    }
                    gauge!("tonecraft_worker_pending_calls", self.pending_len() as f64, "pool" => self.name.clone());
                }
            }
        }
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(Uuid, PendingCall)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, call)| call.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        for (id, call) in expired {
            self.timed_out(id, call);
        }
    }

    async fn try_restart(self: Arc<Self>) {
        let (count, wait) = {
            let ledger = lock(&self.restarts);
            let since = ledger.last_start.map(|t| t.elapsed());
            let wait = match since {
                Some(elapsed) if elapsed < self.config.restart_min_interval => {
                    Some(self.config.restart_min_interval - elapsed)
                }
                _ => None,
            };
            (ledger.count, wait)
        };

        if count >= self.config.max_restarts {
            error!(
                pool = %self.name,
                max_restarts = self.config.max_restarts,
                "Too many restarts, giving up"
            );
            counter!("tonecraft_worker_pool_failed_total", 1, "pool" => self.name.clone());
            self.set_status(PoolStatus::Failed);
            for call in self.drain_pending(|_| true) {
                call.settle(Err(PoolError::ResourceExhausted { restarts: count }));
            }
            return;
        }

        if let Some(wait) = wait {
            debug!(pool = %self.name, wait_ms = wait.as_millis() as u64, "Restart deferred");
            return;
        }

        let attempt = count + 1;
        {
            let mut ledger = lock(&self.restarts);
            ledger.count = attempt;
            ledger.last_start = Some(Instant::now());
            ledger.last_restart_at = Some(Utc::now());
        }
        self.restart_count.store(attempt, Ordering::SeqCst);
        counter!("tonecraft_worker_restarts_total", 1, "pool" => self.name.clone());
        info!(pool = %self.name, attempt, max = self.config.max_restarts, "Restarting worker");

        match self.clone().launch_worker().await {
            Ok(alive) => {
                let _worker = lock(&self.worker);
                // Either a stop raced with the spawn or the new worker is already gone.
                if alive.load(Ordering::SeqCst) && self.status() == PoolStatus::Restarting {
                    self.set_status(PoolStatus::Running);
                }
            }
            Err(e) => {
                error!(pool = %self.name, attempt, error = %e, "Worker restart failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{InferenceBackend, InferenceError, KeywordInterpreter};
    use crate::task_worker::TaskSpawner;
    use async_trait::async_trait;

    fn fast_config() -> PoolConfig {
        PoolConfig {
            monitor_interval: Duration::from_millis(10),
            restart_min_interval: Duration::from_millis(20),
            max_restarts: 3,
        }
    }

    /// Sleeps for a long time on prompts starting with "slow".
    struct Sluggish;

    #[async_trait]
    impl InferenceBackend for Sluggish {
        async fn infer(&self, prompt: &str) -> std::result::Result<Blueprint, InferenceError> {
            if prompt.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            KeywordInterpreter::default().interpret(prompt)
        }
    }

    #[tokio::test]
    async fn call_round_trip() {
        let pool = IsolatedWorkerPool::new(
            "test",
            Arc::new(TaskSpawner::new(Arc::new(KeywordInterpreter::default()))),
            fast_config(),
        );
        assert!(matches!(pool.call("echo", Duration::from_secs(1)).await, Err(PoolError::NotRunning)));

        pool.start().await.unwrap();
        let blueprint = pool.call("spring reverb", Duration::from_secs(1)).await.unwrap();
        assert_eq!(blueprint.label, "spring reverb");

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.generation, 1);

        pool.stop().await;
        assert_eq!(pool.status(), PoolStatus::Terminated);
        assert!(matches!(pool.call("echo", Duration::from_secs(1)).await, Err(PoolError::ShuttingDown)));
    }

    #[tokio::test]
    async fn slow_call_times_out_once() {
        let pool = IsolatedWorkerPool::new("test", Arc::new(TaskSpawner::new(Arc::new(Sluggish))), fast_config());
        pool.start().await.unwrap();

        let err = pool.call("slow echo", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
        let stats = pool.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.pending, 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn inference_error_is_not_a_crash() {
        let pool = IsolatedWorkerPool::new(
            "test",
            Arc::new(TaskSpawner::new(Arc::new(KeywordInterpreter::default()))),
            fast_config(),
        );
        pool.start().await.unwrap();

        let err = pool.call("   ", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, PoolError::Inference(_)));
        assert_eq!(pool.status(), PoolStatus::Running);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_fails_pending_calls() {
        let pool = Arc::new(IsolatedWorkerPool::new(
            "test",
            Arc::new(TaskSpawner::new(Arc::new(Sluggish))),
            fast_config(),
        ));
        pool.start().await.unwrap();

        let caller = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call("slow plate", Duration::from_secs(10)).await })
        };
        while pool.stats().pending == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.stop().await;
        let result = caller.await.unwrap();
        assert!(matches!(result, Err(PoolError::ShuttingDown)));
    }
}
