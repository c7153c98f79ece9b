// worker-pool-rs/src/task_worker.rs
// In-process worker: a tokio task driving an InferenceBackend. A panic in the
// backend ends the task, which closes the response queue like a crash would.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::{KillSwitch, WorkerChannel, WorkerRequest, WorkerResponse, WorkerSpawner};
use crate::error::Result;
use crate::interpreter::InferenceBackend;

const QUEUE_DEPTH: usize = 256;

pub struct TaskSpawner {
    backend: Arc<dyn InferenceBackend>,
}

impl TaskSpawner {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl WorkerSpawner for TaskSpawner {
    fn describe(&self) -> String {
        "task".to_string()
    }

    async fn spawn(&self) -> Result<WorkerChannel> {
        let (req_tx, req_rx) = mpsc::channel(QUEUE_DEPTH);
        let (resp_tx, resp_rx) = mpsc::channel(QUEUE_DEPTH);
        let kill = KillSwitch::new();

        tokio::spawn(run_worker(self.backend.clone(), req_rx, resp_tx, kill.clone()));

        Ok(WorkerChannel {
            requests: req_tx,
            responses: resp_rx,
            kill,
        })
    }
}

async fn run_worker(
    backend: Arc<dyn InferenceBackend>,
    mut requests: mpsc::Receiver<WorkerRequest>,
    responses: mpsc::Sender<WorkerResponse>,
    kill: KillSwitch,
) {
    info!("Task worker started");
    loop {
        let request = tokio::select! {
            _ = kill.fired() => {
                info!("Task worker killed");
                return;
            }
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        debug!(call_id = %request.id, "Task worker handling request");
        let result = tokio::select! {
            _ = kill.fired() => {
                info!(call_id = %request.id, "Task worker killed mid-call");
                return;
            }
            result = backend.infer(&request.prompt) => result,
        };

        let response = WorkerResponse {
            id: request.id,
            result: result.map_err(|e| e.to_string()),
        };
        if responses.send(response).await.is_err() {
            break;
        }
    }
    info!("Task worker stopped");
}
