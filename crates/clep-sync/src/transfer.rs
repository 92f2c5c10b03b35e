use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clep_adapters::{ApiError, ListingApi};
use clep_core::{DirectoryRecord, NewListing, TransferOutcome, TransferState};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::PipelineStore;

/// One way of moving directory phones onto listings. `step` is called until
/// its outcome says to stop.
#[async_trait]
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn step(&self) -> Result<TransferOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exhausted,
    Halt,
}

fn flow_of(outcome: &TransferOutcome) -> Flow {
    match outcome {
        TransferOutcome::BulkTransferred { .. }
        | TransferOutcome::Transferred { .. }
        | TransferOutcome::AlreadyHadPhone { .. }
        | TransferOutcome::Unmatched { .. } => Flow::Continue,
        TransferOutcome::Skipped => Flow::Exhausted,
        TransferOutcome::Deferred { .. } | TransferOutcome::Error { .. } => Flow::Halt,
    }
}

pub struct BulkTransfer {
    store: Arc<dyn PipelineStore>,
    source: String,
    batch_size: usize,
}

impl BulkTransfer {
    pub fn new(store: Arc<dyn PipelineStore>, source: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            source: source.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub async fn transfer_missing_posts(&self) -> Result<TransferOutcome> {
        let count = self
            .store
            .bulk_transfer_phones(&self.source, self.batch_size)
            .await?;
        if count == 0 {
            return Ok(TransferOutcome::Skipped);
        }
        info!(count, "bulk phone transfer");
        Ok(TransferOutcome::BulkTransferred { count })
    }
}

#[async_trait]
impl MatchStrategy for BulkTransfer {
    fn name(&self) -> &'static str {
        "bulk"
    }

    async fn step(&self) -> Result<TransferOutcome> {
        self.transfer_missing_posts().await
    }
}

pub struct PerRecordTransfer {
    store: Arc<dyn PipelineStore>,
    api: Arc<dyn ListingApi>,
    source: String,
    default_backoff: Duration,
}

impl PerRecordTransfer {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        api: Arc<dyn ListingApi>,
        source: impl Into<String>,
        default_backoff: Duration,
    ) -> Self {
        Self {
            store,
            api,
            source: source.into(),
            default_backoff,
        }
    }

    pub async fn transfer_one(&self) -> Result<TransferOutcome> {
        let now = Utc::now();
        if let Some(until) = self.store.active_transfer_deferral(now).await? {
            return Ok(TransferOutcome::Deferred {
                reason: "deferral_active".to_string(),
                until,
            });
        }
        let Some(record) = self.store.next_transfer_candidate(now).await? else {
            return Ok(TransferOutcome::Skipped);
        };
        let (Some(external_id), Some(phone)) = (record.external_id.clone(), record.phone.clone())
        else {
            // Candidates always carry both; close anything that slipped through.
            self.store
                .set_transfer_state(record.arka_id, TransferState::Unmatched, Some("incomplete"))
                .await?;
            return Ok(TransferOutcome::Unmatched {
                external_id: record.external_id.unwrap_or_default(),
            });
        };

        if let Some(listing) = self
            .store
            .find_listing_by_external_id(&self.source, &external_id)
            .await?
        {
            let phone_set = self.store.set_listing_phone(listing.id, &phone).await?;
            let note = if phone_set { "phone_set" } else { "listing_had_phone" };
            self.store
                .set_transfer_state(record.arka_id, TransferState::Transferred, Some(note))
                .await?;
            if !phone_set {
                return Ok(TransferOutcome::AlreadyHadPhone { external_id });
            }
            return Ok(TransferOutcome::Transferred { external_id, phone });
        }

        self.import_listing(&record, external_id, phone).await
    }

    /// The listing is unknown locally: fetch its detail and create it with the phone.
    async fn import_listing(
        &self,
        record: &DirectoryRecord,
        external_id: String,
        phone: String,
    ) -> Result<TransferOutcome> {
        let detail = match self.api.fetch_detail(&external_id).await {
            Ok(detail) => detail,
            Err(ApiError::NotFound) => return self.unmatched(record, external_id, "not_found").await,
            Err(ApiError::Invalid(reason)) => {
                return self.unmatched(record, external_id, &reason).await
            }
            Err(ApiError::RateLimited { retry_after }) => {
                let until = Utc::now()
                    + chrono::Duration::from_std(retry_after.unwrap_or(self.default_backoff))?;
                self.store
                    .defer_transfer(record.arka_id, until, "rate_limited")
                    .await?;
                return Ok(TransferOutcome::Deferred {
                    reason: "rate_limited".to_string(),
                    until,
                });
            }
            Err(err @ ApiError::Transient(_)) => {
                return Ok(TransferOutcome::Error {
                    reason: err.reason(),
                })
            }
        };

        let Some(scope) = detail.scope else {
            return self
                .unmatched(record, external_id, "detail without scope")
                .await;
        };
        let new = NewListing::new(&self.source, &external_id, scope);
        self.store.enqueue_listings(std::slice::from_ref(&new)).await?;
        self.store.save_listing_detail(new.id, &detail).await?;
        self.store.set_listing_phone(new.id, &phone).await?;
        self.store
            .set_transfer_state(record.arka_id, TransferState::Transferred, Some("imported"))
            .await?;
        info!(external_id = %external_id, arka_id = record.arka_id, "listing imported for transfer");
        Ok(TransferOutcome::Transferred { external_id, phone })
    }

    async fn unmatched(
        &self,
        record: &DirectoryRecord,
        external_id: String,
        reason: &str,
    ) -> Result<TransferOutcome> {
        self.store
            .set_transfer_state(record.arka_id, TransferState::Unmatched, Some(reason))
            .await?;
        warn!(external_id = %external_id, arka_id = record.arka_id, reason, "transfer unmatched");
        Ok(TransferOutcome::Unmatched { external_id })
    }
}

#[async_trait]
impl MatchStrategy for PerRecordTransfer {
    fn name(&self) -> &'static str {
        "per_record"
    }

    async fn step(&self) -> Result<TransferOutcome> {
        self.transfer_one().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyReport {
    pub strategy: String,
    pub steps: usize,
    pub transferred: u64,
    pub already_had_phone: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub strategies: Vec<StrategyReport>,
    pub halted: Option<TransferOutcome>,
    pub cancelled: bool,
}

/// Runs strategies in order, each to its natural end. A halting outcome
/// (deferral or error) stops the whole run.
pub struct TransferMatcher {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl TransferMatcher {
    pub fn new(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> TransferSummary {
        let mut summary = TransferSummary::default();
        for strategy in &self.strategies {
            let mut report = StrategyReport {
                strategy: strategy.name().to_string(),
                ..StrategyReport::default()
            };
            let halted = loop {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break None;
                }
                let outcome = match strategy.step().await {
                    Ok(outcome) => outcome,
                    Err(err) => TransferOutcome::Error {
                        reason: format!("{err:#}"),
                    },
                };
                report.steps += 1;
                match &outcome {
                    TransferOutcome::BulkTransferred { count } => report.transferred += count,
                    TransferOutcome::Transferred { .. } => report.transferred += 1,
                    TransferOutcome::AlreadyHadPhone { .. } => report.already_had_phone += 1,
                    TransferOutcome::Unmatched { .. } => report.unmatched += 1,
                    _ => {}
                }
                match flow_of(&outcome) {
                    Flow::Continue => continue,
                    Flow::Exhausted => break None,
                    Flow::Halt => break Some(outcome),
                }
            };
            info!(
                strategy = %report.strategy,
                steps = report.steps,
                transferred = report.transferred,
                "transfer strategy finished"
            );
            summary.strategies.push(report);
            if let Some(outcome) = halted {
                warn!(outcome = ?outcome, "transfer halted");
                summary.halted = Some(outcome);
                break;
            }
            if summary.cancelled {
                break;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{detail, MockListingApi};
    use clep_core::{Listing, ScopeCombination};

    const SOURCE: &str = "classifieds";

    async fn listing(store: &MemoryStore, external_id: &str, phone: Option<&str>) -> Listing {
        let new = NewListing::new(SOURCE, external_id, ScopeCombination::new(1, 10));
        store.enqueue_listings(&[new.clone()]).await.unwrap();
        store.save_listing_detail(new.id, &detail(external_id)).await.unwrap();
        if let Some(phone) = phone {
            store.set_listing_phone(new.id, phone).await.unwrap();
        }
        store.load_listing(new.id).await.unwrap().unwrap()
    }

    fn record(store: &MemoryStore, arka_id: i64, external_id: &str, phone: &str) {
        store
            .put_directory_record(DirectoryRecord::stored(
                arka_id,
                Some(external_id.to_string()),
                Some(phone.to_string()),
                Utc::now(),
            ))
            .unwrap();
    }

    fn state_of(store: &MemoryStore, arka_id: i64) -> TransferState {
        store
            .directory_records()
            .unwrap()
            .into_iter()
            .find(|r| r.arka_id == arka_id)
            .unwrap()
            .transfer_state
    }

    #[tokio::test]
    async fn bulk_transfer_is_idempotent_once_skipped() {
        let store = Arc::new(MemoryStore::new());
        let a = listing(&store, "a", None).await;
        let b = listing(&store, "b", None).await;
        record(&store, 1, "a", "0911");
        record(&store, 2, "b", "0922");
        record(&store, 3, "missing", "0933");

        let bulk = BulkTransfer::new(store.clone(), SOURCE, 1);
        assert_eq!(
            bulk.transfer_missing_posts().await.unwrap(),
            TransferOutcome::BulkTransferred { count: 1 }
        );
        assert_eq!(
            bulk.transfer_missing_posts().await.unwrap(),
            TransferOutcome::BulkTransferred { count: 1 }
        );
        assert_eq!(bulk.transfer_missing_posts().await.unwrap(), TransferOutcome::Skipped);
        let snapshot = store.listings().unwrap();
        assert_eq!(bulk.transfer_missing_posts().await.unwrap(), TransferOutcome::Skipped);
        assert_eq!(store.listings().unwrap(), snapshot);

        assert_eq!(store.load_listing(a.id).await.unwrap().unwrap().phone.as_deref(), Some("0911"));
        assert_eq!(store.load_listing(b.id).await.unwrap().unwrap().phone.as_deref(), Some("0922"));
        assert_eq!(state_of(&store, 3), TransferState::NotTransferred);
    }

    #[tokio::test]
    async fn per_record_covers_present_missing_and_gone_listings() {
        let store = Arc::new(MemoryStore::new());
        let with_phone = listing(&store, "has", Some("0900")).await;
        record(&store, 1, "has", "0911");
        record(&store, 2, "remote", "0922");
        record(&store, 3, "gone", "0933");
        let api = Arc::new(MockListingApi::default());
        api.set_detail(detail("remote"));
        api.fail_detail("gone", ApiError::NotFound);

        let per_record = PerRecordTransfer::new(store.clone(), api, SOURCE, Duration::from_secs(60));
        assert_eq!(
            per_record.transfer_one().await.unwrap(),
            TransferOutcome::AlreadyHadPhone {
                external_id: "has".into()
            }
        );
        assert_eq!(state_of(&store, 1), TransferState::Transferred);
        assert_eq!(
            store.load_listing(with_phone.id).await.unwrap().unwrap().phone.as_deref(),
            Some("0900")
        );

        assert!(matches!(
            per_record.transfer_one().await.unwrap(),
            TransferOutcome::Transferred { ref external_id, .. } if external_id == "remote"
        ));
        let imported = store
            .find_listing_by_external_id(SOURCE, "remote")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imported.phone.as_deref(), Some("0922"));
        assert_eq!(imported.fetch_status, clep_core::FetchStatus::Fetched);

        assert_eq!(
            per_record.transfer_one().await.unwrap(),
            TransferOutcome::Unmatched {
                external_id: "gone".into()
            }
        );
        assert_eq!(state_of(&store, 3), TransferState::Unmatched);
        assert_eq!(per_record.transfer_one().await.unwrap(), TransferOutcome::Skipped);
    }

    #[tokio::test]
    async fn deferral_stops_the_per_record_loop_immediately() {
        let store = Arc::new(MemoryStore::new());
        record(&store, 1, "busy", "0911");
        record(&store, 2, "other", "0922");
        let api = Arc::new(MockListingApi::default());
        api.fail_detail(
            "busy",
            ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
        );
        api.set_detail(detail("other"));

        let matcher = TransferMatcher::new(vec![
            Box::new(BulkTransfer::new(store.clone(), SOURCE, 500)),
            Box::new(PerRecordTransfer::new(
                store.clone(),
                api.clone(),
                SOURCE,
                Duration::from_secs(60),
            )),
        ]);
        let summary = matcher.run(&CancellationToken::new()).await;

        assert!(matches!(summary.halted, Some(TransferOutcome::Deferred { .. })));
        assert_eq!(summary.strategies.len(), 2);
        assert_eq!(summary.strategies[1].steps, 1);
        assert_eq!(api.detail_calls("other"), 0);

        // The persisted deferral keeps later runs from touching anything.
        let again = matcher.run(&CancellationToken::new()).await;
        assert!(matches!(again.halted, Some(TransferOutcome::Deferred { .. })));
        assert_eq!(api.detail_calls("busy"), 1);
        assert_eq!(state_of(&store, 2), TransferState::NotTransferred);
    }

    #[tokio::test]
    async fn transient_errors_halt_without_closing_the_record() {
        let store = Arc::new(MemoryStore::new());
        record(&store, 1, "flaky", "0911");
        let api = Arc::new(MockListingApi::default());
        api.fail_detail("flaky", ApiError::Transient("reset".into()));

        let matcher = TransferMatcher::new(vec![Box::new(PerRecordTransfer::new(
            store.clone(),
            api,
            SOURCE,
            Duration::from_secs(60),
        ))]);
        let summary = matcher.run(&CancellationToken::new()).await;
        assert!(matches!(summary.halted, Some(TransferOutcome::Error { .. })));
        assert_eq!(state_of(&store, 1), TransferState::NotTransferred);
    }

    #[tokio::test]
    async fn bulk_then_per_record_run_to_completion() {
        let store = Arc::new(MemoryStore::new());
        listing(&store, "a", None).await;
        record(&store, 1, "a", "0911");
        record(&store, 2, "gone", "0922");
        let api = Arc::new(MockListingApi::default());
        api.fail_detail("gone", ApiError::NotFound);

        let matcher = TransferMatcher::new(vec![
            Box::new(BulkTransfer::new(store.clone(), SOURCE, 500)),
            Box::new(PerRecordTransfer::new(store.clone(), api, SOURCE, Duration::from_secs(60))),
        ]);
        let summary = matcher.run(&CancellationToken::new()).await;
        assert_eq!(summary.halted, None);
        assert_eq!(summary.strategies[0].transferred, 1);
        assert_eq!(summary.strategies[1].unmatched, 1);
        assert_eq!(summary.strategies[1].steps, 2);
    }

    #[tokio::test]
    async fn listings_that_kept_their_phone_are_not_counted_as_transferred() {
        let store = Arc::new(MemoryStore::new());
        let kept = listing(&store, "kept", Some("0900")).await;
        listing(&store, "fresh", None).await;
        record(&store, 1, "kept", "0911");
        record(&store, 2, "fresh", "0922");

        let matcher = TransferMatcher::new(vec![Box::new(PerRecordTransfer::new(
            store.clone(),
            Arc::new(MockListingApi::default()),
            SOURCE,
            Duration::from_secs(60),
        ))]);
        let summary = matcher.run(&CancellationToken::new()).await;

        assert_eq!(summary.halted, None);
        assert_eq!(summary.strategies[0].transferred, 1);
        assert_eq!(summary.strategies[0].already_had_phone, 1);
        assert_eq!(
            store.load_listing(kept.id).await.unwrap().unwrap().phone.as_deref(),
            Some("0900")
        );
    }
}
