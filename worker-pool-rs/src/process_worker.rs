//! # Child-Process Worker
//!
//! Runs inference in a separate OS process so a crash cannot take the
//! service down. Requests and responses are single-line JSON documents on the
//! child's stdin and stdout; stderr is inherited for the child's own logs.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::channel::{KillSwitch, WorkerChannel, WorkerRequest, WorkerResponse, WorkerSpawner};
use crate::error::{PoolError, Result};

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: String,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    fn describe(&self) -> String {
        format!("process:{}", self.program)
    }

    async fn spawn(&self) -> Result<WorkerChannel> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {}", self.program, e)))?;

        let pid = child.id();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn("child stdout unavailable".into()))?;

        let (req_tx, mut req_rx) = mpsc::channel::<WorkerRequest>(QUEUE_DEPTH);
        let (resp_tx, resp_rx) = mpsc::channel::<WorkerResponse>(QUEUE_DEPTH);
        let kill = KillSwitch::new();

        let writer = tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                let mut line = match serde_json::to_vec(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(call_id = %request.id, error = %e, "Failed to encode worker request");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdin.write_all(&line).await {
                    warn!(error = %e, "Worker stdin closed");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(error = %e, "Worker stdin flush failed");
                    break;
                }
            }
        });

        // The reader owns the only response sender: child stdout reaching EOF
        // is what the pool observes as the worker dying.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<WorkerResponse>(&line) {
                        Ok(response) => {
                            if resp_tx.send(response).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Discarding malformed worker output"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Failed reading worker stdout");
                        break;
                    }
                }
            }
        });

        let watchdog_kill = kill.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!(pid = ?pid, %status, "Worker process exited"),
                        Err(e) => error!(pid = ?pid, error = %e, "Failed waiting on worker process"),
                    }
                }
                _ = watchdog_kill.fired() => {
                    info!(pid = ?pid, "Killing worker process");
                    if let Err(e) = child.kill().await {
                        error!(pid = ?pid, error = %e, "Failed to kill worker process");
                    }
                }
            }
            writer.abort();
        });

        info!(pid = ?pid, program = %self.program, "Spawned worker process");

        Ok(WorkerChannel {
            requests: req_tx,
            responses: resp_rx,
            kill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spawner = ProcessSpawner::new("/nonexistent/tonecraft-worker", Vec::new());
        let err = spawner.spawn().await.unwrap_err();
        assert!(matches!(err, PoolError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_exit_closes_responses() {
        let spawner = ProcessSpawner::new("true", Vec::new());
        let mut channel = spawner.spawn().await.unwrap();
        assert!(channel.responses.recv().await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_child() {
        let spawner = ProcessSpawner::new("cat", Vec::new());
        let mut channel = spawner.spawn().await.unwrap();
        channel.kill.fire();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), channel.responses.recv())
            .await
            .expect("stdout closes after kill");
        assert!(closed.is_none());
    }
}
