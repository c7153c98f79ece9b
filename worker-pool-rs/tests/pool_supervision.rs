use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shared_types::Blueprint;
use tokio::sync::mpsc;
use worker_pool::{
    InferenceBackend, InferenceError, IsolatedWorkerPool, KeywordInterpreter, KillSwitch, PoolConfig,
    PoolError, PoolStatus, ProcessSpawner, TaskSpawner, WorkerChannel, WorkerSpawner,
};

fn config() -> PoolConfig {
    PoolConfig {
        monitor_interval: Duration::from_millis(10),
        restart_min_interval: Duration::from_millis(20),
        max_restarts: 3,
    }
}

async fn wait_for(pool: &IsolatedWorkerPool, status: PoolStatus) {
    let mut rx = pool.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != status {
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("pool never reached {status}"));
}

/// Blocks on prompts starting with "hold" until killed.
struct Holding;

#[async_trait]
impl InferenceBackend for Holding {
    async fn infer(&self, prompt: &str) -> Result<Blueprint, InferenceError> {
        if prompt.starts_with("hold") {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        KeywordInterpreter::default().interpret(prompt)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killing_the_worker_fails_every_pending_call_then_recovers() {
    let pool = Arc::new(IsolatedWorkerPool::new(
        "kill-test",
        Arc::new(TaskSpawner::new(Arc::new(Holding))),
        config(),
    ));
    pool.start().await.unwrap();

    const N: usize = 8;
    let mut callers = Vec::new();
    for i in 0..N {
        let pool = pool.clone();
        callers.push(tokio::spawn(async move {
            pool.call(&format!("hold {i}"), Duration::from_secs(30)).await
        }));
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.stats().pending < N {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all calls pending");

    assert!(pool.kill_worker());

    for caller in callers {
        let result = caller.await.unwrap();
        assert!(
            matches!(result, Err(PoolError::WorkerCrashed(_))),
            "unexpected {result:?}"
        );
    }

    wait_for(&pool, PoolStatus::Running).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.stats().generation < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker restarted");

    let blueprint = pool.call("tape echo", Duration::from_secs(2)).await.unwrap();
    assert_eq!(blueprint.label, "tape echo");

    let stats = pool.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.crashed, N as u64);
    assert_eq!(stats.pending, 0);
    pool.stop().await;
}

/// Hands out workers whose response queue is already closed.
struct StillBorn {
    spawned: AtomicU32,
}

#[async_trait]
impl WorkerSpawner for StillBorn {
    fn describe(&self) -> String {
        "still-born".into()
    }

    async fn spawn(&self) -> worker_pool::Result<WorkerChannel> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (requests, _req_rx) = mpsc::channel(1);
        let (_resp_tx, responses) = mpsc::channel(1);
        Ok(WorkerChannel {
            requests,
            responses,
            kill: KillSwitch::new(),
        })
    }
}

#[tokio::test]
async fn restart_budget_exhaustion_fails_fast() {
    let spawner = Arc::new(StillBorn {
        spawned: AtomicU32::new(0),
    });
    let pool = IsolatedWorkerPool::new("cap-test", spawner.clone(), config());
    pool.start().await.unwrap();

    wait_for(&pool, PoolStatus::Failed).await;
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1 + 3);
    assert_eq!(pool.stats().restarts, 3);

    let started = tokio::time::Instant::now();
    let err = tokio_test::assert_err!(pool.call("echo", Duration::from_secs(5)).await);
    assert!(matches!(err, PoolError::ResourceExhausted { restarts: 3 }));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Stays failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.status(), PoolStatus::Failed);
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn restarts_respect_minimum_spacing() {
    let spawner = Arc::new(StillBorn {
        spawned: AtomicU32::new(0),
    });
    let pool = IsolatedWorkerPool::new(
        "spacing-test",
        spawner.clone(),
        PoolConfig {
            restart_min_interval: Duration::from_millis(200),
            max_restarts: 10,
            ..config()
        },
    );
    pool.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let spawned = spawner.spawned.load(Ordering::SeqCst);
    assert!(spawned >= 2, "expected at least one restart, got {spawned}");
    assert!(spawned <= 4, "restarts not spaced: {spawned}");
    pool.stop().await;
}

#[tokio::test]
async fn child_process_worker_round_trip_and_restart() {
    let spawner = ProcessSpawner::new(env!("CARGO_BIN_EXE_tonecraft-worker"), Vec::new());
    let pool = IsolatedWorkerPool::new("process-test", Arc::new(spawner), config());
    pool.start().await.unwrap();

    let blueprint = pool.call("lush chorus", Duration::from_secs(10)).await.unwrap();
    assert_eq!(blueprint.label, "lush chorus");
    assert_eq!(blueprint.slots.len(), 1);

    assert!(pool.kill_worker());
    tokio::time::timeout(Duration::from_secs(10), async {
        while pool.stats().generation < 2 || pool.status() != PoolStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("process worker restarted");

    let blueprint = pool.call("plate reverb", Duration::from_secs(10)).await.unwrap();
    assert_eq!(blueprint.label, "plate reverb");
    pool.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_monitor_interval_still_restarts_a_killed_worker() {
    let pool = IsolatedWorkerPool::new(
        "zero-interval",
        Arc::new(TaskSpawner::new(Arc::new(KeywordInterpreter::default()))),
        PoolConfig {
            monitor_interval: Duration::ZERO,
            ..config()
        },
    );
    pool.start().await.unwrap();

    assert!(pool.kill_worker());
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.stats().generation < 2 || pool.status() != PoolStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker restarted under a clamped monitor interval");

    let blueprint = pool.call("tape echo", Duration::from_secs(2)).await.unwrap();
    assert_eq!(blueprint.label, "tape echo");
    pool.stop().await;
}
