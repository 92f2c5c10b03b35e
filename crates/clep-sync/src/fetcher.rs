use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clep_adapters::{ApiError, ListingApi};
use clep_core::{FetchStatus, Listing};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::PipelineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchPostsSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rate_limited: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemResult {
    Succeeded,
    Failed,
    RateLimited,
}

/// Drains the listing queue one bounded batch per call.
pub struct ListingFetcher {
    store: Arc<dyn PipelineStore>,
    api: Arc<dyn ListingApi>,
    batch_size: usize,
    concurrency: usize,
    max_attempts: i32,
    lease: Duration,
}

impl ListingFetcher {
    pub fn new(store: Arc<dyn PipelineStore>, api: Arc<dyn ListingApi>) -> Self {
        Self {
            store,
            api,
            batch_size: 25,
            concurrency: 10,
            max_attempts: 3,
            lease: Duration::from_secs(600),
        }
    }

    pub fn with_batch(mut self, batch_size: usize, concurrency: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, max_attempts: i32, lease: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.lease = lease;
        self
    }

    pub async fn fetch_next_posts(&self) -> Result<FetchPostsSummary> {
        let claimed = self
            .store
            .claim_queued_listings(self.batch_size, self.lease)
            .await?;
        let mut summary = FetchPostsSummary {
            attempted: claimed.len(),
            ..FetchPostsSummary::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }

        let results: Vec<ItemResult> = stream::iter(claimed)
            .map(|listing| async move { self.fetch_one(&listing).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for result in results {
            match result {
                ItemResult::Succeeded => summary.succeeded += 1,
                ItemResult::Failed => summary.failed += 1,
                ItemResult::RateLimited => summary.rate_limited += 1,
            }
        }
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rate_limited = summary.rate_limited,
            "fetch batch complete"
        );
        Ok(summary)
    }

    async fn fetch_one(&self, listing: &Listing) -> ItemResult {
        match self.try_fetch_one(listing).await {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    external_id = %listing.external_id,
                    reason = %format!("{err:#}"),
                    "listing fetch bookkeeping failed"
                );
                ItemResult::Failed
            }
        }
    }

    async fn try_fetch_one(&self, listing: &Listing) -> Result<ItemResult> {
        let err = match self.api.fetch_detail(&listing.external_id).await {
            Ok(detail) => {
                self.store.save_listing_detail(listing.id, &detail).await?;
                return Ok(ItemResult::Succeeded);
            }
            Err(err) => err,
        };

        if let ApiError::RateLimited { .. } = err {
            self.store.release_listing_claim(listing.id).await?;
            return Ok(ItemResult::RateLimited);
        }

        let terminal = err == ApiError::NotFound;
        let status = self
            .store
            .record_fetch_failure(listing.id, &err.reason(), self.max_attempts, terminal)
            .await?;
        warn!(
            external_id = %listing.external_id,
            reason = %err.reason(),
            attempts = listing.fetch_attempts + 1,
            gave_up = status == FetchStatus::Failed,
            "listing fetch failed"
        );
        Ok(ItemResult::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{detail, MockListingApi};
    use chrono::Utc;
    use clep_core::{JobStatus, NewListing, ScopeCombination};

    async fn seeded(ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let listings: Vec<NewListing> = ids
            .iter()
            .map(|id| NewListing::new("classifieds", id, ScopeCombination::new(1, 10)))
            .collect();
        store.enqueue_listings(&listings).await.unwrap();
        store
    }

    #[tokio::test]
    async fn partial_failures_do_not_block_the_batch() {
        let store = seeded(&["ok", "gone", "slow", "busy"]).await;
        let api = Arc::new(MockListingApi::default());
        api.set_detail(detail("ok"));
        api.fail_detail("gone", ApiError::NotFound);
        api.fail_detail("slow", ApiError::Transient("timeout".into()));
        api.fail_detail("busy", ApiError::RateLimited { retry_after: None });

        let fetcher = ListingFetcher::new(store.clone(), api);
        let summary = fetcher.fetch_next_posts().await.unwrap();
        assert_eq!(
            summary,
            FetchPostsSummary {
                attempted: 4,
                succeeded: 1,
                failed: 2,
                rate_limited: 1,
            }
        );

        let by_id = |id: &str| {
            store
                .listings()
                .unwrap()
                .into_iter()
                .find(|l| l.external_id == id)
                .unwrap()
        };
        assert_eq!(by_id("ok").fetch_status, FetchStatus::Fetched);
        assert_eq!(by_id("gone").fetch_status, FetchStatus::Failed);
        assert_eq!(by_id("slow").fetch_status, FetchStatus::Queued);
        assert_eq!(by_id("slow").fetch_attempts, 1);
        assert_eq!(by_id("busy").fetch_status, FetchStatus::Queued);
        assert_eq!(by_id("busy").fetch_attempts, 0);

        let jobs = store.jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].listing_id, by_id("ok").id);
        assert_eq!(jobs[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn transient_failures_give_up_at_the_attempt_cap() {
        let store = seeded(&["flaky"]).await;
        let api = Arc::new(MockListingApi::default());
        api.fail_detail("flaky", ApiError::Transient("502".into()));
        let fetcher = ListingFetcher::new(store.clone(), api).with_retry(2, Duration::from_secs(600));

        fetcher.fetch_next_posts().await.unwrap();
        fetcher.fetch_next_posts().await.unwrap();
        let third = fetcher.fetch_next_posts().await.unwrap();

        assert_eq!(third.attempted, 0);
        let listing = store.listings().unwrap().remove(0);
        assert_eq!(listing.fetch_status, FetchStatus::Failed);
        assert_eq!(listing.fetch_attempts, 2);
    }

    #[tokio::test]
    async fn claims_respect_the_batch_size_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let mut listings: Vec<Listing> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| {
                let new = NewListing::new("classifieds", id, ScopeCombination::new(1, 10));
                Listing::queued(&new, Utc::now())
            })
            .collect();
        // Oldest first is the reverse of id order.
        listings.sort_by(|a, b| b.id.cmp(&a.id));
        let base = Utc::now() - chrono::Duration::hours(1);
        for (age, listing) in listings.iter_mut().enumerate() {
            listing.created_at = base + chrono::Duration::minutes(age as i64);
            store.put_listing(listing.clone()).unwrap();
        }
        let oldest: Vec<String> = listings[..2].iter().map(|l| l.external_id.clone()).collect();
        let newest: Vec<String> = listings[2..].iter().map(|l| l.external_id.clone()).collect();

        let api = Arc::new(MockListingApi::default());
        for listing in &listings {
            api.set_detail(detail(&listing.external_id));
        }
        let fetcher = ListingFetcher::new(store.clone(), api.clone()).with_batch(2, 2);

        assert_eq!(fetcher.fetch_next_posts().await.unwrap().succeeded, 2);
        for id in &oldest {
            assert_eq!(api.detail_calls(id), 1, "{id} should be in the first batch");
        }
        for id in &newest {
            assert_eq!(api.detail_calls(id), 0, "{id} should wait for the second batch");
        }
        let status_of = |id: &str| {
            store
                .listings()
                .unwrap()
                .into_iter()
                .find(|l| l.external_id == id)
                .unwrap()
                .fetch_status
        };
        assert!(newest.iter().all(|id| status_of(id) == FetchStatus::Queued));

        assert_eq!(fetcher.fetch_next_posts().await.unwrap().succeeded, 2);
        assert_eq!(fetcher.fetch_next_posts().await.unwrap().attempted, 0);
    }
}
