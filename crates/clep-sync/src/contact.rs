use std::sync::Arc;

use anyhow::Result;
use clep_adapters::{ApiError, ListingApi};
use clep_core::{normalize_phone, ListingDescriptor};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::PipelineStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContactTick {
    Stored(ListingDescriptor),
    Failed {
        listing: ListingDescriptor,
        reason: String,
    },
}

/// Pulls contact info for at most one listing per tick. The caller's
/// invocation cadence is the rate limit.
pub struct ContactFetcher {
    store: Arc<dyn PipelineStore>,
    api: Arc<dyn ListingApi>,
    max_attempts: i32,
}

impl ContactFetcher {
    pub fn new(store: Arc<dyn PipelineStore>, api: Arc<dyn ListingApi>, max_attempts: i32) -> Self {
        Self {
            store,
            api,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn tick(&self) -> Result<Option<ContactTick>> {
        let Some(listing) = self.store.next_contact_candidate(self.max_attempts).await? else {
            return Ok(None);
        };

        match self.api.fetch_contact(&listing.external_id).await {
            Ok(contact) => {
                let phone = contact.phone.as_deref().and_then(normalize_phone);
                self.store.save_contact(listing.id, phone.as_deref()).await?;
                info!(
                    external_id = %listing.external_id,
                    has_phone = phone.is_some(),
                    "contact stored"
                );
                let mut descriptor = listing.descriptor();
                descriptor.phone = descriptor.phone.or(phone);
                Ok(Some(ContactTick::Stored(descriptor)))
            }
            Err(ApiError::NotFound) => {
                self.store.save_contact(listing.id, None).await?;
                info!(external_id = %listing.external_id, "contact not found upstream");
                Ok(Some(ContactTick::Stored(listing.descriptor())))
            }
            Err(err) => {
                let count_attempt = !matches!(err, ApiError::RateLimited { .. });
                self.store
                    .record_contact_failure(listing.id, &err.reason(), count_attempt)
                    .await?;
                warn!(
                    external_id = %listing.external_id,
                    reason = %err.reason(),
                    "contact fetch failed"
                );
                Ok(Some(ContactTick::Failed {
                    listing: listing.descriptor(),
                    reason: err.reason(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{detail, MockListingApi};
    use clep_core::{NewListing, ScopeCombination};

    async fn fetched(store: &MemoryStore, ids: &[&str]) {
        for id in ids {
            let new = NewListing::new("classifieds", id, ScopeCombination::new(1, 10));
            store.enqueue_listings(&[new.clone()]).await.unwrap();
            store.save_listing_detail(new.id, &detail(id)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn one_contact_call_per_tick() {
        let store = Arc::new(MemoryStore::new());
        fetched(&store, &["a", "b"]).await;
        let api = Arc::new(MockListingApi::default());
        api.set_contact("a", Ok(Some("0912 345 6789")));
        api.set_contact("b", Ok(None));

        let fetcher = ContactFetcher::new(store.clone(), api.clone(), 3);
        let first = fetcher.tick().await.unwrap().unwrap();
        assert_eq!(api.contact_calls(), 1);
        let second = fetcher.tick().await.unwrap().unwrap();
        assert_eq!(api.contact_calls(), 2);
        assert!(fetcher.tick().await.unwrap().is_none());
        assert_eq!(api.contact_calls(), 2);

        let phones: Vec<Option<String>> = [first, second]
            .into_iter()
            .map(|tick| match tick {
                ContactTick::Stored(d) => d.phone,
                ContactTick::Failed { .. } => panic!("unexpected failure"),
            })
            .collect();
        assert!(phones.contains(&Some("09123456789".to_string())));
        assert!(phones.contains(&None));
        assert!(store.listings().unwrap().iter().all(|l| l.has_contact));
    }

    #[tokio::test]
    async fn rate_limits_do_not_consume_attempts() {
        let store = Arc::new(MemoryStore::new());
        fetched(&store, &["a"]).await;
        let api = Arc::new(MockListingApi::default());
        api.set_contact("a", Err(ApiError::RateLimited { retry_after: None }));

        let fetcher = ContactFetcher::new(store.clone(), api.clone(), 1);
        for _ in 0..3 {
            let tick = fetcher.tick().await.unwrap().unwrap();
            assert!(matches!(tick, ContactTick::Failed { ref reason, .. } if reason == "rate_limited"));
        }
        assert_eq!(store.listings().unwrap()[0].contact_attempts, 0);

        api.set_contact("a", Err(ApiError::Transient("reset".into())));
        fetcher.tick().await.unwrap();
        assert!(fetcher.tick().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unfetched_listings_are_not_eligible() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue_listings(&[NewListing::new("classifieds", "q", ScopeCombination::new(1, 1))])
            .await
            .unwrap();
        let fetcher = ContactFetcher::new(store, Arc::new(MockListingApi::default()), 3);
        assert!(fetcher.tick().await.unwrap().is_none());
    }
}
