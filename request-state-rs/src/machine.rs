//! # Request State Machine
//!
//! The single authority over request lifecycles. Each request lives in its
//! own async mutex, so transitions for one id are strictly ordered while
//! different ids never contend. Every mutation is written through to the
//! [`RequestStore`] before `advance` returns.
//!
//! A failed store write fails the `advance`, but the in-memory record keeps
//! the new state; a crash before the next successful write recovers the
//! older persisted version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use resilience::clock::elapsed_between;
use resilience::{SharedClock, SystemClock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};
use crate::request::{Request, Stage};
use crate::storage::RequestStore;

type Cell = Arc<Mutex<Request>>;

pub struct RequestStateMachine {
    requests: DashMap<Uuid, Cell>,
    store: Arc<dyn RequestStore>,
    clock: SharedClock,
}

impl std::fmt::Debug for RequestStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestStateMachine")
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl RequestStateMachine {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self::with_clock(store, SystemClock::shared())
    }

    pub fn with_clock(store: Arc<dyn RequestStore>, clock: SharedClock) -> Self {
        Self {
            requests: DashMap::new(),
            store,
            clock,
        }
    }

    /// Registers a new `Queued` request; it is persisted before this returns.
    pub async fn create(&self, prompt: &str, metadata: HashMap<String, String>) -> Result<Request> {
        let request = Request::new(prompt.to_string(), metadata, self.clock.now());
        let id = request.id;

        self.store
            .write(&request)
            .await
            .map_err(|source| StateError::Persistence { id, source })?;

        self.requests.insert(id, Arc::new(Mutex::new(request.clone())));
        counter!("tonecraft_requests_created_total", 1);
        gauge!("tonecraft_requests_tracked", self.requests.len() as f64);
        info!(request_id = %id, "Request created");
        Ok(request)
    }

    /// Moves `id` to `stage`, optionally recording a stage result and an error.
    ///
    /// Allowed: staying in the same stage (a retry record), moving to the
    /// immediate successor, or failing from any non-terminal stage. An error
    /// bumps the attempt counter.
    #[instrument(skip(self, result, error), fields(request_id = %id, to = %stage))]
    pub async fn advance(
        &self,
        id: Uuid,
        stage: Stage,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Request> {
        let cell = self.cell(id).ok_or(StateError::NotFound(id))?;
        let mut request = cell.lock().await;

        let from = request.stage;
        if !from.can_transition_to(stage) {
            warn!(from = %from, "Rejected stage transition");
            return Err(StateError::InvalidTransition { id, from, to: stage });
        }

        request.stage = stage;
        if let Some(result) = result {
            request.result = Some(result);
        }
        if let Some(error) = error {
            request.attempts += 1;
            request.last_error = Some(error);
        }
        request.updated_at = self.clock.now();

        counter!("tonecraft_request_transitions_total", 1, "stage" => stage.as_str());
        if from != stage {
            debug!(from = %from, attempts = request.attempts, "Stage advanced");
        }

        // In-memory state is already updated; a failed write only loses durability.
        if let Err(source) = self.store.write(&request).await {
            error!(error = %source, "Failed to persist request");
            return Err(StateError::Persistence { id, source });
        }

        Ok(request.clone())
    }

    pub async fn get(&self, id: Uuid) -> Option<Request> {
        let cell = self.cell(id)?;
        let request = cell.lock().await;
        Some(request.clone())
    }

    /// Non-terminal requests not updated for longer than `timeout`.
    pub async fn find_stuck(&self, timeout: Duration) -> Vec<Request> {
        let now = self.clock.now();
        let mut stuck = Vec::new();
        for cell in self.cells() {
            let request = cell.lock().await;
            if !request.is_terminal() && elapsed_between(request.updated_at, now) > timeout {
                stuck.push(request.clone());
            }
        }
        stuck.sort_by_key(|r| r.updated_at);
        stuck
    }

    /// Deletes terminal requests older than `max_age`; returns how many went.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for (id, cell) in self.entries() {
            let expired = {
                let request = cell.lock().await;
                request.is_terminal() && elapsed_between(request.updated_at, now) > max_age
            };
            if !expired {
                continue;
            }

            // Terminal records accept no further advances, so nothing can
            // change between the check and the delete.
            if let Err(e) = self.store.delete(id).await {
                warn!(request_id = %id, error = %e, "Failed to delete swept request");
                continue;
            }
            if self.requests.remove(&id).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Swept terminal requests");
            counter!("tonecraft_requests_swept_total", removed as u64);
        }
        gauge!("tonecraft_requests_tracked", self.requests.len() as f64);
        removed
    }

    /// Loads every persisted request not already tracked. Returns how many
    /// were loaded; unreadable records are skipped.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.store.list_ids().await.map_err(|source| StateError::Persistence {
            id: Uuid::nil(),
            source,
        })?;

        let mut loaded = 0;
        for id in ids {
            if self.requests.contains_key(&id) {
                continue;
            }
            match self.store.read(id).await {
                Ok(Some(request)) => {
                    self.requests
                        .entry(id)
                        .or_insert_with(|| Arc::new(Mutex::new(request)));
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(request_id = %id, error = %e, "Skipping unreadable request record"),
            }
        }

        gauge!("tonecraft_requests_tracked", self.requests.len() as f64);
        info!(loaded, "Recovered persisted requests");
        Ok(loaded)
    }

    /// Snapshot of every tracked request, oldest first.
    pub async fn list(&self) -> Vec<Request> {
        let mut all = Vec::with_capacity(self.requests.len());
        for cell in self.cells() {
            all.push(cell.lock().await.clone());
        }
        all.sort_by_key(|r| r.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn cell(&self, id: Uuid) -> Option<Cell> {
        self.requests.get(&id).map(|entry| entry.value().clone())
    }

    // Snapshots release the shard locks before any await.
    fn cells(&self) -> Vec<Cell> {
        self.requests.iter().map(|entry| entry.value().clone()).collect()
    }

    fn entries(&self) -> Vec<(Uuid, Cell)> {
        self.requests
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use resilience::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn machine() -> (RequestStateMachine, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::new());
        let machine = RequestStateMachine::with_clock(store.clone(), clock.clone());
        (machine, clock, store)
    }

    #[tokio::test]
    async fn create_persists_queued_request() {
        let (machine, _, store) = machine();
        let req = machine.create("warm pad", HashMap::new()).await.unwrap();
        assert_eq!(req.stage, Stage::Queued);
        assert_eq!(store.read(req.id).await.unwrap(), Some(req.clone()));
        assert_eq!(machine.get(req.id).await, Some(req));
    }

    #[tokio::test]
    async fn advance_enforces_transitions() {
        let (machine, clock, store) = machine();
        let req = machine.create("p", HashMap::new()).await.unwrap();

        let err = machine.advance(req.id, Stage::Ranking, None, None).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { from: Stage::Queued, to: Stage::Ranking, .. }));

        clock.advance(Duration::from_secs(1));
        let r = machine.advance(req.id, Stage::Interpreting, None, None).await.unwrap();
        assert!(r.updated_at > req.updated_at);

        let r = machine
            .advance(req.id, Stage::Interpreting, None, Some("timeout".into()))
            .await
            .unwrap();
        assert_eq!(r.attempts, 1);
        assert_eq!(r.last_error.as_deref(), Some("timeout"));

        let r = machine
            .advance(req.id, Stage::Failed, None, Some("gave up".into()))
            .await
            .unwrap();
        assert_eq!(r.attempts, 2);
        assert_eq!(store.read(req.id).await.unwrap().unwrap().stage, Stage::Failed);

        let err = machine.advance(req.id, Stage::Failed, None, None).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn advance_unknown_id() {
        let (machine, _, _) = machine();
        let err = machine.advance(Uuid::new_v4(), Stage::Interpreting, None, None).await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[tokio::test]
    async fn result_is_kept_until_replaced() {
        let (machine, _, _) = machine();
        let req = machine.create("p", HashMap::new()).await.unwrap();
        machine
            .advance(req.id, Stage::Interpreting, Some(serde_json::json!({"label": "x"})), None)
            .await
            .unwrap();
        let r = machine.advance(req.id, Stage::Ranking, None, None).await.unwrap();
        assert_eq!(r.result, Some(serde_json::json!({"label": "x"})));
    }

    #[tokio::test]
    async fn stuck_requests_are_found_until_terminal() {
        let (machine, clock, _) = machine();
        let stale = machine.create("stale", HashMap::new()).await.unwrap();
        machine.advance(stale.id, Stage::Interpreting, None, None).await.unwrap();

        clock.advance(Duration::from_secs(90));
        let fresh = machine.create("fresh", HashMap::new()).await.unwrap();

        let stuck = machine.find_stuck(Duration::from_secs(60)).await;
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, stale.id);
        assert_eq!(stuck[0].stage, Stage::Interpreting);
        // Read-only.
        assert_eq!(machine.get(stale.id).await.unwrap().stage, Stage::Interpreting);

        for stage in [Stage::Ranking, Stage::Refining, Stage::Finalizing, Stage::Complete] {
            machine.advance(stale.id, stage, None, None).await.unwrap();
        }
        clock.advance(Duration::from_secs(90));
        let stuck: Vec<Uuid> = machine
            .find_stuck(Duration::from_secs(60))
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(stuck, vec![fresh.id]);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_terminal_requests() {
        let (machine, clock, store) = machine();
        let done = machine.create("done", HashMap::new()).await.unwrap();
        machine.advance(done.id, Stage::Failed, None, Some("x".into())).await.unwrap();
        let active = machine.create("active", HashMap::new()).await.unwrap();

        assert_eq!(machine.sweep(Duration::from_secs(60)).await, 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(machine.sweep(Duration::from_secs(60)).await, 1);
        assert_eq!(machine.sweep(Duration::from_secs(60)).await, 0);

        assert!(machine.get(done.id).await.is_none());
        assert!(store.read(done.id).await.unwrap().is_none());
        assert!(machine.get(active.id).await.is_some());
    }

    #[tokio::test]
    async fn recover_reloads_persisted_requests() {
        let store = Arc::new(MemoryStore::new());
        let first = RequestStateMachine::new(store.clone());
        let req = first.create("resume me", HashMap::new()).await.unwrap();
        first.advance(req.id, Stage::Interpreting, None, None).await.unwrap();
        drop(first);

        let second = RequestStateMachine::new(store);
        assert_eq!(second.recover().await.unwrap(), 1);
        assert_eq!(second.recover().await.unwrap(), 0);
        let back = second.get(req.id).await.unwrap();
        assert_eq!(back.stage, Stage::Interpreting);
        second.advance(req.id, Stage::Ranking, None, None).await.unwrap();
    }

    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RequestStore for FlakyStore {
        async fn write(&self, request: &Request) -> std::result::Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.write(request).await
        }

        async fn read(&self, id: Uuid) -> std::result::Result<Option<Request>, StoreError> {
            self.inner.read(id).await
        }

        async fn delete(&self, id: Uuid) -> std::result::Result<(), StoreError> {
            self.inner.delete(id).await
        }

        async fn list_ids(&self) -> std::result::Result<Vec<Uuid>, StoreError> {
            self.inner.list_ids().await
        }
    }

    #[tokio::test]
    async fn failed_write_fails_advance_but_keeps_memory_state() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail: AtomicBool::new(false),
        });
        let machine = RequestStateMachine::new(store.clone());
        let req = machine.create("p", HashMap::new()).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        let err = machine.advance(req.id, Stage::Interpreting, None, None).await.unwrap_err();
        assert!(matches!(err, StateError::Persistence { .. }));

        assert_eq!(machine.get(req.id).await.unwrap().stage, Stage::Interpreting);
        assert_eq!(store.read(req.id).await.unwrap().unwrap().stage, Stage::Queued);

        let err = machine.create("q", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, StateError::Persistence { .. }));
        assert_eq!(machine.len(), 1);
    }
}
