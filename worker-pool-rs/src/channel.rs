//! # Worker Channel
//!
//! The duplex link between the pool and one worker incarnation: a request
//! queue in, a response queue out, plus a kill switch. A worker is considered
//! dead as soon as its response queue closes, whatever the backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::Blueprint;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::error::Result;

/// One inference request as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: Uuid,
    pub prompt: String,
}

/// Reply correlated to a [`WorkerRequest`] by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    pub result: std::result::Result<Blueprint, String>,
}

/// Asks a running worker to terminate. Firing before the worker starts
/// listening still takes effect.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<Notify>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.0.notify_one();
    }

    pub async fn fired(&self) {
        self.0.notified().await
    }
}

/// A live worker as seen by the pool.
#[derive(Debug)]
pub struct WorkerChannel {
    pub requests: mpsc::Sender<WorkerRequest>,
    pub responses: mpsc::Receiver<WorkerResponse>,
    pub kill: KillSwitch,
}

/// Starts fresh worker incarnations for the supervisor.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Short backend name for logs.
    fn describe(&self) -> String;

    async fn spawn(&self) -> Result<WorkerChannel>;
}
