//! # Orchestration Driver
//!
//! Walks each request through the pipeline:
//!
//! ```text
//! Queued -> Interpreting -> Ranking -> Refining -> Finalizing -> Complete
//!                 |            |          |            |
//!                 +------------+----------+------------+--> Failed
//! ```
//!
//! - **Interpreting** calls the worker pool behind the circuit breaker.
//!   Transient failures are recorded as same-stage retries and backed off;
//!   non-transient failures or an exhausted budget fail the request with the
//!   last error kept.
//! - **Ranking** asks the oracle for the best corpus preset.
//! - **Refining** runs the content generators in order.
//! - **Finalizing** stamps the preset and fills the response cache.
//!
//! Each stage's output is stored as the request's `result`, so a recovered
//! request resumes from whatever stage it had reached.
//!
//! All collaborators are constructed by the caller and injected through
//! [`Components`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use metrics::counter;
use oracle::Oracle;
use request_state::{Request, RequestStateMachine, Stage, StateError};
use resilience::logging::{log_structured_error, request_span};
use resilience::{CircuitBreaker, CircuitBreakerMetrics, RetryConfig, RetryPolicy, ServiceError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared_types::{Blueprint, Preset, TonecraftConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;
use worker_pool::{IsolatedWorkerPool, PoolError, PoolStats};

use crate::cache::{CacheStats, ResponseCache};
use crate::error::{OrchestratorError, Result};
use crate::generator::ContentGenerator;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for each inference call
    pub call_timeout: Duration,
    /// Budget and backoff for the Interpreting stage
    pub retry: RetryConfig,
    /// Non-terminal requests idle longer than this are failed as stale
    pub stuck_timeout: Duration,
    /// Terminal requests are deleted this long after their last update
    pub retention: Duration,
    pub maintenance_interval: Duration,
    pub cache_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            stuck_timeout: Duration::from_secs(120),
            retention: Duration::from_secs(86_400),
            maintenance_interval: Duration::from_secs(30),
            cache_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &TonecraftConfig) -> Self {
        Self {
            call_timeout: config.worker.call_timeout(),
            retry: RetryConfig {
                max_attempts: config.requests.max_stage_attempts,
                base_backoff: Duration::from_millis(config.requests.base_backoff_ms),
                max_backoff: Duration::from_millis(config.requests.max_backoff_ms),
                ..RetryConfig::default()
            },
            stuck_timeout: config.requests.stuck_timeout(),
            retention: config.requests.retention(),
            maintenance_interval: config.requests.maintenance_interval(),
            cache_enabled: config.cache.enabled,
        }
    }
}

/// Everything the driver orchestrates, built by the caller.
pub struct Components {
    pub machine: Arc<RequestStateMachine>,
    pub pool: Arc<IsolatedWorkerPool>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<ResponseCache<Preset>>,
    pub oracle: Arc<Oracle>,
    pub generators: Vec<Arc<dyn ContentGenerator>>,
}

/// What `submit` hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Served from the response cache; no request was created.
    Cached(Preset),
    /// Running in the background; `poll` the id.
    Accepted(Uuid),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Complete { preset: Preset },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatus {
    pub id: Uuid,
    pub stage: Stage,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub stale_failed: usize,
    pub swept: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub tracked: usize,
    pub active: usize,
    pub cache: CacheStats,
    pub breaker: CircuitBreakerMetrics,
    pub pool: PoolStats,
}

pub struct Orchestrator {
    machine: Arc<RequestStateMachine>,
    pool: Arc<IsolatedWorkerPool>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache<Preset>>,
    oracle: Arc<Oracle>,
    generators: Vec<Arc<dyn ContentGenerator>>,
    retry: RetryPolicy,
    config: OrchestratorConfig,
    /// Requests with a driver task running.
    active: DashSet<Uuid>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tracked", &self.machine.len())
            .field("active", &self.active.len())
            .field("generators", &self.generators.len())
            .finish()
    }
}

/// Drops a request from the active set when its driver task ends, panics included.
struct ActiveGuard {
    orchestrator: Arc<Orchestrator>,
    id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.orchestrator.active.remove(&self.id);
    }
}

/// Shortest maintenance period; `tokio::time::interval` rejects zero.
const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1);

impl Orchestrator {
    pub fn new(components: Components, mut config: OrchestratorConfig) -> Arc<Self> {
        if config.maintenance_interval < MIN_MAINTENANCE_INTERVAL {
            warn!(
                requested = ?config.maintenance_interval,
                "Maintenance interval too short; clamping to {MIN_MAINTENANCE_INTERVAL:?}"
            );
            config.maintenance_interval = MIN_MAINTENANCE_INTERVAL;
        }
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            machine: components.machine,
            pool: components.pool,
            breaker: components.breaker,
            cache: components.cache,
            oracle: components.oracle,
            generators: components.generators,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            active: DashSet::new(),
            shutdown,
        })
    }

    pub fn machine(&self) -> &RequestStateMachine {
        &self.machine
    }

    pub fn cache(&self) -> &ResponseCache<Preset> {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool(&self) -> &IsolatedWorkerPool {
        &self.pool
    }

    /// Serves `prompt` from the cache, or creates a request and starts
    /// driving it in the background.
    pub async fn submit(self: &Arc<Self>, prompt: &str) -> Result<Submission> {
        if let Some(preset) = self.cached(prompt) {
            return Ok(Submission::Cached(preset));
        }
        let request = self.machine.create(prompt, HashMap::new()).await?;
        self.launch(request.id);
        Ok(Submission::Accepted(request.id))
    }

    /// Like [`submit`](Self::submit) but waits up to `deadline` for the
    /// request to finish. On deadline the request keeps running and can
    /// still be polled.
    pub async fn submit_and_wait(self: &Arc<Self>, prompt: &str, deadline: Duration) -> Result<Preset> {
        if let Some(preset) = self.cached(prompt) {
            return Ok(preset);
        }
        let request = self.machine.create(prompt, HashMap::new()).await?;
        let id = request.id;
        let handle = self
            .launch(id)
            .ok_or_else(|| OrchestratorError::Internal(format!("request {id} already being driven")))?;

        match tokio::time::timeout(deadline, handle).await {
            Err(_) => Err(OrchestratorError::DeadlineExceeded { id, after: deadline }),
            Ok(Err(join)) => Err(OrchestratorError::Internal(format!("driver task for {id} aborted: {join}"))),
            Ok(Ok(finished)) => Self::final_preset(&finished?),
        }
    }

    /// Current stage and, once terminal, the preset or the failure.
    pub async fn poll(&self, id: Uuid) -> Result<RequestStatus> {
        let request = self.machine.get(id).await.ok_or(StateError::NotFound(id))?;
        let outcome = match request.stage {
            Stage::Complete => Outcome::Complete {
                preset: Self::final_preset(&request)?,
            },
            Stage::Failed => Outcome::Failed {
                error: request.last_error.clone().unwrap_or_else(|| "unknown error".into()),
            },
            _ => Outcome::Pending,
        };
        Ok(RequestStatus {
            id,
            stage: request.stage,
            attempts: request.attempts,
            updated_at: request.updated_at,
            outcome,
        })
    }

    /// Starts a driver for every tracked non-terminal request, typically
    /// right after [`RequestStateMachine::recover`]. Returns how many started.
    pub async fn resume(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for request in self.machine.list().await {
            if !request.is_terminal() && self.launch(request.id).is_some() {
                debug!(request_id = %request.id, stage = %request.stage, "Resuming request");
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed recovered requests");
        }
        resumed
    }

    /// One maintenance pass: fail stale requests, sweep old terminal ones,
    /// drop expired cache entries.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        for request in self.machine.find_stuck(self.config.stuck_timeout).await {
            let error = format!(
                "stale: no progress in {} for over {}s",
                request.stage,
                self.config.stuck_timeout.as_secs()
            );
            match self.machine.advance(request.id, Stage::Failed, None, Some(error)).await {
                Ok(_) => {
                    warn!(request_id = %request.id, stage = %request.stage, "Failed stale request");
                    counter!("tonecraft_requests_finished_total", 1, "outcome" => "stale");
                    report.stale_failed += 1;
                }
                // Finished between the scan and the advance.
                Err(StateError::InvalidTransition { .. }) => {}
                Err(e) => warn!(request_id = %request.id, error = %e, "Could not fail stale request"),
            }
        }

        report.swept = self.machine.sweep(self.config.retention).await;
        report.evicted = self.cache.evict_expired();
        report
    }

    /// Runs [`run_maintenance`](Self::run_maintenance) every
    /// `maintenance_interval` until [`shutdown`](Self::shutdown).
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.maintenance_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = this.run_maintenance().await;
                        if report != MaintenanceReport::default() {
                            info!(
                                stale_failed = report.stale_failed,
                                swept = report.swept,
                                evicted = report.evicted,
                                "Maintenance pass"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance loop stopped");
        })
    }

    /// Stops the maintenance loop and the worker pool. Requests cut off
    /// mid-inference stay non-terminal so a later `resume` picks them up.
    pub async fn shutdown(&self) {
        info!(active = self.active.len(), "Shutting down orchestrator");
        self.shutdown.send_replace(true);
        self.pool.stop().await;
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            tracked: self.machine.len(),
            active: self.active.len(),
            cache: self.cache.stats(),
            breaker: self.breaker.metrics(),
            pool: self.pool.stats(),
        }
    }

    fn cached(&self, prompt: &str) -> Option<Preset> {
        if !self.config.cache_enabled {
            return None;
        }
        let hit = self.cache.get(prompt);
        if hit.is_some() {
            debug!("Served prompt from cache");
        }
        hit
    }

    /// Spawns the driver for `id` unless one is already running.
    fn launch(self: &Arc<Self>, id: Uuid) -> Option<JoinHandle<Result<Request>>> {
        if !self.active.insert(id) {
            return None;
        }
        let guard = ActiveGuard {
            orchestrator: Arc::clone(self),
            id,
        };
        let span = request_span(&id.to_string());
        Some(tokio::spawn(
            async move {
                let result = guard.orchestrator.drive(id).await;
                if let Err(e) = &result {
                    log_structured_error(&e.to_error().request_id(id.to_string()));
                }
                drop(guard);
                result
            }
            .instrument(span),
        ))
    }

    async fn drive(&self, id: Uuid) -> Result<Request> {
        loop {
            let request = self.machine.get(id).await.ok_or(StateError::NotFound(id))?;
            let step = match request.stage {
                Stage::Complete | Stage::Failed => return Ok(request),
                Stage::Queued => self
                    .machine
                    .advance(id, Stage::Interpreting, None, None)
                    .await
                    .map_err(OrchestratorError::from),
                Stage::Interpreting => self.interpreting(&request).await,
                Stage::Ranking => self.ranking(&request).await,
                Stage::Refining => self.refining(&request).await,
                Stage::Finalizing => self.finalizing(&request).await,
            };

            match step {
                Ok(_) => {}
                // Something else (maintenance) settled the request first.
                Err(OrchestratorError::State(StateError::InvalidTransition { from, .. })) => {
                    debug!(stage = %from, "Request settled elsewhere, driver exiting");
                    return self
                        .machine
                        .get(id)
                        .await
                        .ok_or_else(|| StateError::NotFound(id).into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn interpreting(&self, request: &Request) -> Result<Request> {
        let id = request.id;
        match self.infer(&request.prompt).await {
            Ok(blueprint) => {
                debug!(slots = blueprint.slots.len(), label = %blueprint.label, "Prompt interpreted");
                let value = encode(&blueprint)?;
                Ok(self.machine.advance(id, Stage::Ranking, Some(value), None).await?)
            }
            // Leave the request where it is for the next process to resume.
            Err(e @ OrchestratorError::Pool(PoolError::ShuttingDown | PoolError::NotRunning)) => Err(e),
            Err(e) => {
                let attempts = request.attempts + 1;
                if !self.retry.should_retry(&e, attempts) {
                    return self.fail(id, &e).await;
                }

                let updated = self
                    .machine
                    .advance(id, Stage::Interpreting, None, Some(e.to_string()))
                    .await?;
                let delay = self.retry.backoff(updated.attempts);
                counter!("tonecraft_stage_retries_total", 1, "stage" => Stage::Interpreting.as_str());
                warn!(
                    attempts = updated.attempts,
                    max_attempts = self.retry.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Inference failed, retrying"
                );
                tokio::time::sleep(delay).await;
                Ok(updated)
            }
        }
    }

    /// One breaker-gated inference call. An error answered by the worker
    /// counts as a breaker success: the worker itself is healthy. A call the
    /// pool refused while stopping counts as neither.
    async fn infer(&self, prompt: &str) -> Result<Blueprint> {
        if !self.breaker.can_attempt() {
            return Err(OrchestratorError::CircuitOpen);
        }
        match self.pool.call(prompt, self.config.call_timeout).await {
            Ok(blueprint) => {
                self.breaker.record_success();
                Ok(blueprint)
            }
            Err(e @ PoolError::Inference(_)) => {
                self.breaker.record_success();
                Err(e.into())
            }
            Err(e @ (PoolError::ShuttingDown | PoolError::NotRunning)) => {
                self.breaker.record_abandoned();
                Err(e.into())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }

    async fn ranking(&self, request: &Request) -> Result<Request> {
        let blueprint: Blueprint = match stage_input(request) {
            Ok(blueprint) => blueprint,
            Err(e) => return self.fail(request.id, &e).await,
        };

        let selection = self.oracle.select(&blueprint);
        debug!(
            fallback = selection.is_fallback(),
            required = selection.required.len(),
            "Ranked corpus"
        );
        let value = encode(&selection.preset)?;
        Ok(self.machine.advance(request.id, Stage::Refining, Some(value), None).await?)
    }

    async fn refining(&self, request: &Request) -> Result<Request> {
        let mut preset: Preset = match stage_input(request) {
            Ok(preset) => preset,
            Err(e) => return self.fail(request.id, &e).await,
        };

        for generator in &self.generators {
            preset = match generator.generate(&request.prompt, preset).await {
                Ok(refined) => refined,
                Err(e) => return self.fail(request.id, &e.into()).await,
            };
            debug!(generator = generator.name(), "Applied content generator");
        }

        let value = encode(&preset)?;
        Ok(self.machine.advance(request.id, Stage::Finalizing, Some(value), None).await?)
    }

    async fn finalizing(&self, request: &Request) -> Result<Request> {
        let mut preset: Preset = match stage_input(request) {
            Ok(preset) => preset,
            Err(e) => return self.fail(request.id, &e).await,
        };

        if preset.name.trim().is_empty() {
            preset.name = request.prompt.trim().to_string();
        }
        preset
            .metadata
            .insert("prompt".into(), request.prompt.clone().into());

        let value = encode(&preset)?;
        let finished = self
            .machine
            .advance(request.id, Stage::Complete, Some(value), None)
            .await?;

        if self.config.cache_enabled {
            self.cache.put(&request.prompt, preset);
        }
        counter!("tonecraft_requests_finished_total", 1, "outcome" => "complete");
        info!(attempts = finished.attempts, "Request complete");
        Ok(finished)
    }

    async fn fail(&self, id: Uuid, error: &OrchestratorError) -> Result<Request> {
        log_structured_error(&error.to_error().request_id(id.to_string()));
        let failed = self
            .machine
            .advance(id, Stage::Failed, None, Some(error.to_string()))
            .await?;
        counter!("tonecraft_requests_finished_total", 1, "outcome" => "failed");
        Ok(failed)
    }

    fn final_preset(request: &Request) -> Result<Preset> {
        match request.stage {
            Stage::Complete => stage_input(request),
            Stage::Failed => Err(OrchestratorError::RequestFailed {
                id: request.id,
                error: request.last_error.clone().unwrap_or_else(|| "unknown error".into()),
            }),
            stage => Err(OrchestratorError::Internal(format!(
                "request {} stopped in non-terminal stage {stage}",
                request.id
            ))),
        }
    }
}

/// Decodes the output the previous stage left in `request.result`.
fn stage_input<T: DeserializeOwned>(request: &Request) -> Result<T> {
    let value = request.result.clone().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|source| OrchestratorError::CorruptStageInput {
        id: request.id,
        stage: request.stage,
        source,
    })
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| OrchestratorError::Internal(format!("encoding stage output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn request_at(stage: Stage, result: Option<serde_json::Value>) -> Request {
        let mut request = Request::new("dub echo".into(), HashMap::new(), Utc::now());
        request.stage = stage;
        request.result = result;
        request
    }

    #[test]
    fn config_follows_the_file_sections() {
        let mut file = TonecraftConfig::default();
        file.requests.max_stage_attempts = 7;
        file.requests.base_backoff_ms = 40;
        file.cache.enabled = false;
        file.worker.call_timeout_ms = 1500;

        let config = OrchestratorConfig::from_config(&file);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(40));
        assert_eq!(config.call_timeout, Duration::from_millis(1500));
        assert!(!config.cache_enabled);
    }

    #[test]
    fn stage_input_decodes_the_previous_output() {
        let blueprint = Blueprint::new("dub echo");
        let request = request_at(Stage::Ranking, Some(serde_json::to_value(&blueprint).unwrap()));
        let decoded: Blueprint = stage_input(&request).unwrap();
        assert_eq!(decoded, blueprint);
    }

    #[test]
    fn missing_stage_input_is_corrupt() {
        let request = request_at(Stage::Refining, None);
        let err = stage_input::<Preset>(&request).unwrap_err();
        assert!(matches!(err, OrchestratorError::CorruptStageInput { stage: Stage::Refining, .. }));
    }

    #[test]
    fn final_preset_by_stage() {
        let preset = Preset::empty("done", 2);
        let complete = request_at(Stage::Complete, Some(serde_json::to_value(&preset).unwrap()));
        assert_eq!(Orchestrator::final_preset(&complete).unwrap(), preset);

        let mut failed = request_at(Stage::Failed, None);
        failed.last_error = Some("worker crashed: eof".into());
        assert!(matches!(
            Orchestrator::final_preset(&failed),
            Err(OrchestratorError::RequestFailed { error, .. }) if error == "worker crashed: eof"
        ));

        let running = request_at(Stage::Ranking, None);
        assert!(matches!(Orchestrator::final_preset(&running), Err(OrchestratorError::Internal(_))));
    }
}
