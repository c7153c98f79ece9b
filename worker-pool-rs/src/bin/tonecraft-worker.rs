// worker-pool-rs/src/bin/tonecraft-worker.rs
// Crash-isolated inference worker. Reads one JSON WorkerRequest per line on
// stdin and answers with one JSON WorkerResponse per line on stdout. Logs go
// to stderr so they never interleave with the protocol.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use worker_pool::{InferenceBackend, KeywordInterpreter, WorkerRequest, WorkerResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let interpreter = KeywordInterpreter::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!(pid = std::process::id(), "tonecraft-worker ready");

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed request line");
                continue;
            }
        };

        debug!(call_id = %request.id, "Interpreting prompt");
        let response = WorkerResponse {
            id: request.id,
            result: interpreter
                .infer(&request.prompt)
                .await
                .map_err(|e| e.to_string()),
        };

        let mut out = serde_json::to_vec(&response).context("encoding response")?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("writing stdout")?;
        stdout.flush().await.context("flushing stdout")?;
    }

    info!("stdin closed, tonecraft-worker exiting");
    Ok(())
}
