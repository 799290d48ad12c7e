//! Readiness probing.
//!
//! A ready check is polled every `interval` until it succeeds or `timeout`
//! elapses. Polling is cancellable so a probe left over from a replaced
//! process can never report on its successor.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service::{ReadyCheck, ReadyProbe};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadyError {
    #[error("Ready check timed out")]
    TimedOut,
    #[error("Ready check cancelled")]
    Cancelled,
    #[error("Invalid ready check configuration: {0}")]
    Invalid(String),
}

enum Prober {
    Command(String),
    Url { client: reqwest::Client, url: String },
}

impl Prober {
    fn new(probe: &ReadyProbe) -> Result<Self, ReadyError> {
        match probe {
            ReadyProbe::Command(command) => {
                if command.trim().is_empty() {
                    return Err(ReadyError::Invalid("empty command".to_string()));
                }
                Ok(Prober::Command(command.clone()))
            }
            ReadyProbe::Url(url) => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|err| ReadyError::Invalid(err.to_string()))?;
                Ok(Prober::Url {
                    client,
                    url: url.clone(),
                })
            }
        }
    }

    // One attempt. Errors count as "not ready yet".
    async fn attempt(&self) -> bool {
        match self {
            // Run through the shell so checks may use pipes, `&&` and variables.
            Prober::Command(command) => {
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                match status {
                    Ok(status) => status.success(),
                    Err(err) => {
                        debug!("ready command {} failed to run: {}", command, err);
                        false
                    }
                }
            }
            Prober::Url { client, url } => match client.get(url).send().await {
                Ok(response) => response.status().is_success(),
                Err(err) => {
                    debug!("ready url {} unreachable: {}", url, err);
                    false
                }
            },
        }
    }
}

/// Polls `check` until it passes, the timeout elapses, or `cancel` fires.
pub async fn wait_until_ready(
    check: &ReadyCheck,
    cancel: &CancellationToken,
) -> Result<(), ReadyError> {
    let prober = Prober::new(&check.probe)?;
    let interval = check.interval.max(Duration::from_millis(1));
    let deadline = Instant::now() + check.timeout;

    loop {
        let tick = (Instant::now() + interval).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReadyError::Cancelled),
            _ = tokio::time::sleep_until(tick) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadyError::TimedOut);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReadyError::Cancelled),
            passed = tokio::time::timeout(deadline - now, prober.attempt()) => {
                if let Ok(true) = passed {
                    return Ok(());
                }
            }
        }
    }
}
