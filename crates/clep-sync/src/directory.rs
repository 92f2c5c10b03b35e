//! Cursor-driven crawl of the secondary phone directory.
//!
//! The directory is a dense, sequential id space. Each batch looks up the
//! window `[cursor, cursor + batch_size)` concurrently, persists one record per
//! id that resolved, and moves the cursor past the contiguous prefix of
//! resolved ids with a single compare-and-set. Ids that did not resolve are
//! retried in the next window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clep_adapters::{ApiError, DirectoryApi};
use clep_core::{
    normalize_phone, DirectoryCursor, DirectoryRecord, FetchOutcome, RecordOutcome, SkipReason,
};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{BatchStep, BatchVerdict, DriverPolicy, StageDriver};
use crate::store::PipelineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub upper_bound: i64,
    pub start_cursor: i64,
    pub final_cursor: i64,
    pub stored: usize,
    pub not_found: usize,
    pub retried: usize,
    pub backoffs: usize,
    pub batches: usize,
    pub cancelled: bool,
}

pub struct DirectoryCrawler {
    store: Arc<dyn PipelineStore>,
    api: Arc<dyn DirectoryApi>,
    policy: DriverPolicy,
    start_id: i64,
    batch_size: usize,
}

impl DirectoryCrawler {
    pub fn new(store: Arc<dyn PipelineStore>, api: Arc<dyn DirectoryApi>, start_id: i64) -> Self {
        Self {
            store,
            api,
            policy: DriverPolicy::default(),
            start_id,
            batch_size: 10,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_policy(mut self, policy: DriverPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upstream maximum id. Bounds a run exclusively.
    pub async fn fetch_latest_arka_id(&self) -> Result<i64> {
        self.api
            .latest_id()
            .await
            .context("fetching latest directory id")
    }

    /// Creates the cursor at the start id, or raises it there when lower.
    pub async fn bootstrap_cursor(&self) -> Result<DirectoryCursor> {
        let cursor = self.store.ensure_cursor(self.start_id).await?;
        debug!(next_fetch_id = cursor.next_fetch_id, "directory cursor ready");
        Ok(cursor)
    }

    /// Resolves one id. Already-recorded ids are answered from storage.
    pub async fn fetch_id(&self, arka_id: i64) -> Result<FetchOutcome> {
        self.fetch_id_at(arka_id, Utc::now()).await
    }

    async fn fetch_id_at(&self, arka_id: i64, now: DateTime<Utc>) -> Result<FetchOutcome> {
        if let Some(existing) = self.store.find_directory_record(arka_id).await? {
            return Ok(match existing.outcome {
                RecordOutcome::Stored => FetchOutcome::Stored {
                    arka_id,
                    external_id: existing.external_id,
                },
                RecordOutcome::NotFound => FetchOutcome::Skipped {
                    arka_id,
                    reason: SkipReason::NotFound,
                },
            });
        }

        match self.api.lookup(arka_id).await {
            Ok(entry) => {
                let phone = entry.phone.as_deref().and_then(normalize_phone);
                let record = DirectoryRecord::stored(arka_id, entry.external_id.clone(), phone, now);
                self.store.insert_directory_record(&record).await?;
                Ok(FetchOutcome::Stored {
                    arka_id,
                    external_id: entry.external_id,
                })
            }
            Err(ApiError::NotFound) => {
                self.store
                    .insert_directory_record(&DirectoryRecord::not_found(arka_id, now))
                    .await?;
                Ok(FetchOutcome::Skipped {
                    arka_id,
                    reason: SkipReason::NotFound,
                })
            }
            Err(ApiError::Invalid(detail)) => Ok(FetchOutcome::Skipped {
                arka_id,
                reason: SkipReason::Other(detail),
            }),
            Err(ApiError::RateLimited { retry_after }) => {
                let wait = retry_after.unwrap_or(self.policy.min_backoff_wait);
                Ok(FetchOutcome::Backoff {
                    reason: "rate_limited".to_string(),
                    until: now + chrono::Duration::from_std(wait)?,
                })
            }
            Err(err @ ApiError::Transient(_)) => Ok(FetchOutcome::Error {
                reason: err.reason(),
            }),
        }
    }

    /// Looks up the id at the cursor, optionally advancing past it on progress.
    pub async fn fetch_next(&self, advance_cursor: bool) -> Result<FetchOutcome> {
        let cursor = self.bootstrap_cursor().await?;
        let outcome = self.fetch_id(cursor.next_fetch_id).await?;
        if advance_cursor && outcome.is_progress() {
            self.store
                .advance_cursor(cursor.next_fetch_id, cursor.next_fetch_id + 1)
                .await?;
        }
        Ok(outcome)
    }

    /// Minimum wait an outcome asks for before the next batch.
    pub fn required_wait(&self, outcome: &FetchOutcome, now: DateTime<Utc>) -> Duration {
        match outcome {
            FetchOutcome::Stored { .. } => Duration::ZERO,
            FetchOutcome::Skipped {
                reason: SkipReason::NotFound,
                ..
            } => Duration::ZERO,
            FetchOutcome::Skipped { .. } => self.policy.min_retry_wait,
            FetchOutcome::Error { .. } => self.policy.min_error_wait,
            FetchOutcome::Backoff { until, .. } => {
                let remaining = (*until - now).to_std().unwrap_or(Duration::ZERO);
                ceil_millis(remaining).max(self.policy.min_backoff_wait)
            }
        }
    }

    /// Crawls until the cursor reaches the upstream maximum or `cancel` trips.
    pub async fn run(&self, cancel: CancellationToken) -> Result<CrawlSummary> {
        let upper_bound = self.fetch_latest_arka_id().await?;
        let cursor = self.bootstrap_cursor().await?;
        info!(
            upper_bound,
            next_fetch_id = cursor.next_fetch_id,
            "directory crawl starting"
        );

        let mut window = CrawlWindow {
            crawler: self,
            upper_bound,
            summary: CrawlSummary {
                upper_bound,
                start_cursor: cursor.next_fetch_id,
                final_cursor: cursor.next_fetch_id,
                ..CrawlSummary::default()
            },
        };
        let report = StageDriver::new("crawl-directory", cancel)
            .run(&mut window)
            .await?;

        let mut summary = window.summary;
        summary.batches = report.batches;
        summary.cancelled = report.cancelled;
        info!(
            final_cursor = summary.final_cursor,
            stored = summary.stored,
            not_found = summary.not_found,
            cancelled = summary.cancelled,
            "directory crawl stopped"
        );
        Ok(summary)
    }
}

fn ceil_millis(duration: Duration) -> Duration {
    let millis = duration.as_micros().div_ceil(1000);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

struct CrawlWindow<'a> {
    crawler: &'a DirectoryCrawler,
    upper_bound: i64,
    summary: CrawlSummary,
}

#[async_trait]
impl<'a> BatchStep for CrawlWindow<'a> {
    async fn run_batch(&mut self) -> Result<BatchVerdict> {
        let crawler = self.crawler;
        let cursor = crawler.bootstrap_cursor().await?.next_fetch_id;
        self.summary.final_cursor = cursor;
        if cursor >= self.upper_bound {
            return Ok(BatchVerdict::Finished);
        }

        let end = (cursor + crawler.batch_size as i64).min(self.upper_bound);
        let now = Utc::now();
        let outcomes: Vec<FetchOutcome> = join_all((cursor..end).map(|arka_id| async move {
            match crawler.fetch_id_at(arka_id, now).await {
                Ok(outcome) => outcome,
                // No progress; retried after the error floor.
                Err(err) => FetchOutcome::Error {
                    reason: format!("{err:#}"),
                },
            }
        }))
        .await;

        let mut wait = Duration::ZERO;
        for (arka_id, outcome) in (cursor..end).zip(&outcomes) {
            match outcome {
                FetchOutcome::Stored { .. } => self.summary.stored += 1,
                FetchOutcome::Skipped {
                    reason: SkipReason::NotFound,
                    ..
                } => self.summary.not_found += 1,
                FetchOutcome::Skipped { reason, .. } => {
                    self.summary.retried += 1;
                    warn!(arka_id, reason = %reason, "directory record skipped, retrying");
                }
                FetchOutcome::Backoff { reason, until } => {
                    self.summary.backoffs += 1;
                    warn!(arka_id, reason = %reason, until = %until, "directory asked to back off");
                }
                FetchOutcome::Error { reason } => {
                    self.summary.retried += 1;
                    warn!(arka_id, reason = %reason, "directory lookup failed, retrying");
                }
            }
            wait = wait.max(crawler.required_wait(outcome, now));
        }

        let progressed = outcomes.iter().take_while(|o| o.is_progress()).count() as i64;
        if progressed > 0 {
            let next = cursor + progressed;
            if crawler.store.advance_cursor(cursor, next).await? {
                self.summary.final_cursor = next;
            } else {
                debug!(cursor, next, "cursor moved concurrently, reloading");
            }
        }

        if self.summary.final_cursor >= self.upper_bound {
            return Ok(BatchVerdict::Finished);
        }
        if progressed == 0 && wait.is_zero() {
            wait = crawler.policy.idle_wait;
        }
        Ok(BatchVerdict::Continue { wait })
    }
}
