//! # Worker Pool
//!
//! Crash-isolated inference for Tonecraft. [`IsolatedWorkerPool`] supervises
//! a single worker behind a [`WorkerSpawner`]; the worker is either a tokio
//! task ([`TaskSpawner`]) or a child process speaking line-delimited JSON
//! ([`ProcessSpawner`], see the `tonecraft-worker` binary).

pub mod channel;
pub mod error;
pub mod interpreter;
pub mod pool;
pub mod process_worker;
pub mod task_worker;

pub use channel::{KillSwitch, WorkerChannel, WorkerRequest, WorkerResponse, WorkerSpawner};
pub use error::{PoolError, Result};
pub use interpreter::{InferenceBackend, InferenceError, KeywordInterpreter};
pub use pool::{IsolatedWorkerPool, PoolConfig, PoolStats, PoolStatus};
pub use process_worker::ProcessSpawner;
pub use task_worker::TaskSpawner;
