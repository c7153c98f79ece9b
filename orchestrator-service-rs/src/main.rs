// orchestrator-service-rs/src/main.rs
// `tonecraft`: builds the pipeline from configuration, resumes any requests
// left over from a previous run, then turns each prompt (command-line
// arguments, or stdin lines when there are none) into a preset printed as
// one JSON document per line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use oracle::{Corpus, Oracle, RankingConfig, Vectorizer};
use orchestrator::{Components, Orchestrator, OrchestratorConfig, ParameterNudger, ResponseCache};
use request_state::{FileStore, MemoryStore, RequestStateMachine, RequestStore};
use resilience::{init_logging, CircuitBreaker, CircuitBreakerConfig};
use serde_json::json;
use shared_types::config::{StorageBackend, WorkerBackend};
use shared_types::{EngineCatalog, TonecraftConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use worker_pool::{
    IsolatedWorkerPool, KeywordInterpreter, PoolConfig, ProcessSpawner, TaskSpawner, WorkerSpawner,
};

/// How long resumed requests get to finish before the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = TonecraftConfig::load().context("loading configuration")?;
    init_logging(Some(config.logging.clone())).context("initialising logging")?;
    info!(environment = %config.system.environment, "Starting tonecraft");

    let catalog = Arc::new(EngineCatalog::new(
        config.system.slot_count,
        EngineCatalog::builtin().engines().to_vec(),
    ));

    let vectorizer = Vectorizer::new(config.oracle.tag_block_width);
    let corpus = match &config.oracle.corpus_path {
        Some(path) => Corpus::load(path, &vectorizer)
            .with_context(|| format!("loading corpus {}", path.display()))?,
        None => {
            warn!("No corpus configured; every request gets a synthesized default preset");
            Corpus::build(Vec::new(), &vectorizer)
        }
    };
    info!(entries = corpus.len(), "Corpus loaded");

    let oracle = Oracle::new(
        corpus,
        vectorizer,
        catalog.clone(),
        RankingConfig {
            top_k: config.oracle.top_k,
            similarity_weight: config.oracle.similarity_weight,
            match_weight: config.oracle.match_weight,
        },
    )
    .context("building similarity index")?;

    let spawner: Arc<dyn WorkerSpawner> = match config.worker.backend {
        WorkerBackend::Task => Arc::new(TaskSpawner::new(Arc::new(KeywordInterpreter::new(
            (*catalog).clone(),
        )))),
        WorkerBackend::Process => Arc::new(ProcessSpawner::new(
            config.worker.command.clone(),
            config.worker.args.clone(),
        )),
    };
    let pool = Arc::new(IsolatedWorkerPool::new(
        "inference",
        spawner,
        PoolConfig {
            monitor_interval: config.worker.monitor_interval(),
            restart_min_interval: config.worker.restart_min_interval(),
            max_restarts: config.worker.max_restarts,
        },
    ));
    pool.start().await.context("starting inference worker")?;

    let store: Arc<dyn RequestStore> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::File => Arc::new(
            FileStore::open(&config.storage.dir)
                .await
                .with_context(|| format!("opening request store {}", config.storage.dir.display()))?,
        ),
    };
    let machine = Arc::new(RequestStateMachine::new(store));
    let recovered = machine.recover().await.context("recovering persisted requests")?;

    let orchestrator = Orchestrator::new(
        Components {
            machine,
            pool,
            breaker: Arc::new(CircuitBreaker::new(
                "inference",
                CircuitBreakerConfig {
                    failure_threshold: config.breaker.failure_threshold,
                    recovery_timeout: config.breaker.recovery_timeout(),
                },
            )),
            cache: Arc::new(ResponseCache::new(config.cache.ttl())),
            oracle: Arc::new(oracle),
            generators: vec![Arc::new(ParameterNudger::new(catalog))],
        },
        OrchestratorConfig::from_config(&config),
    );

    let resumed = orchestrator.resume().await;
    info!(recovered, resumed, "Request state restored");
    let maintenance = orchestrator.spawn_maintenance();

    let per_prompt = per_prompt_deadline(&config);
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await.context("reading stdin")? {
            if !line.trim().is_empty() {
                run_prompt(&orchestrator, &line, per_prompt).await;
            }
        }
    } else {
        for prompt in &args {
            run_prompt(&orchestrator, prompt, per_prompt).await;
        }
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while orchestrator.stats().active > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(active = orchestrator.stats().active, "Exiting with requests still in flight");
    }

    orchestrator.shutdown().await;
    maintenance.await.context("joining maintenance loop")?;
    info!("tonecraft stopped");
    Ok(())
}

/// Enough time for every inference attempt plus its backoff.
fn per_prompt_deadline(config: &TonecraftConfig) -> Duration {
    let attempts = config.requests.max_stage_attempts.max(1);
    let per_attempt = config.worker.call_timeout() + Duration::from_millis(config.requests.max_backoff_ms);
    per_attempt * attempts + Duration::from_secs(5)
}

async fn run_prompt(orchestrator: &Arc<Orchestrator>, prompt: &str, deadline: Duration) {
    let line = match orchestrator.submit_and_wait(prompt, deadline).await {
        Ok(preset) => json!({ "prompt": prompt, "preset": preset }),
        Err(e) => {
            warn!(error = %e, "Prompt failed");
            json!({ "prompt": prompt, "error": e.to_string() })
        }
    };
    println!("{line}");
}
