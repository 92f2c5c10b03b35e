//! Generic loop for cursor-driven stages.
//!
//! A stage hands the driver one batch at a time and says how long to wait
//! before the next one. The driver owns the sleeping and the cancellation:
//! a batch in flight always completes, and a tripped token ends the loop at
//! the next wait.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    BatchInFlight,
    BackoffWait(Duration),
    Terminated,
}

/// Minimum waits applied between batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPolicy {
    pub min_retry_wait: Duration,
    pub min_error_wait: Duration,
    pub min_backoff_wait: Duration,
    pub idle_wait: Duration,
}

impl Default for DriverPolicy {
    fn default() -> Self {
        Self {
            min_retry_wait: Duration::from_millis(200),
            min_error_wait: Duration::from_millis(1000),
            min_backoff_wait: Duration::from_millis(1000),
            idle_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVerdict {
    Continue { wait: Duration },
    Finished,
}

#[async_trait]
pub trait BatchStep: Send {
    async fn run_batch(&mut self) -> Result<BatchVerdict>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverReport {
    pub batches: usize,
    #[serde(skip)]
    pub slept: Vec<Duration>,
    pub cancelled: bool,
}

pub struct StageDriver {
    stage: &'static str,
    cancel: CancellationToken,
    state: DriverState,
}

impl StageDriver {
    pub fn new(stage: &'static str, cancel: CancellationToken) -> Self {
        Self {
            stage,
            cancel,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs `step` until it reports `Finished`, the token is cancelled, or a
    /// batch returns an error (which is propagated).
    pub async fn run<S: BatchStep + ?Sized>(&mut self, step: &mut S) -> Result<DriverReport> {
        let mut report = DriverReport::default();
        loop {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            self.state = DriverState::BatchInFlight;
            let verdict = match step.run_batch().await {
                Ok(verdict) => verdict,
                Err(err) => {
                    self.state = DriverState::Terminated;
                    return Err(err);
                }
            };
            report.batches += 1;

            let wait = match verdict {
                BatchVerdict::Finished => break,
                BatchVerdict::Continue { wait } => wait,
            };
            if wait.is_zero() {
                self.state = DriverState::Idle;
                continue;
            }

            self.state = DriverState::BackoffWait(wait);
            debug!(stage = self.stage, wait_ms = wait.as_millis() as u64, "driver waiting");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    report.slept.push(wait);
                    self.state = DriverState::Idle;
                }
            }
        }
        self.state = DriverState::Terminated;
        info!(
            stage = self.stage,
            batches = report.batches,
            cancelled = report.cancelled,
            "driver stopped"
        );
        Ok(report)
    }
}
