use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clep_adapters::MediaDownloader;
use clep_core::{Listing, ListingMedia, MediaAsset};
use clep_storage::MediaStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::store::PipelineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaSyncSummary {
    pub listings: usize,
    pub assets_synced: usize,
    pub assets_failed: usize,
    pub listings_completed: usize,
}

pub struct MediaSyncer {
    store: Arc<dyn PipelineStore>,
    downloader: Arc<dyn MediaDownloader>,
    media_store: MediaStore,
    batch_size: usize,
    max_attempts: i32,
}

impl MediaSyncer {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        downloader: Arc<dyn MediaDownloader>,
        media_store: MediaStore,
    ) -> Self {
        Self {
            store,
            downloader,
            media_store,
            batch_size: 10,
            max_attempts: 3,
        }
    }

    pub fn with_limits(mut self, batch_size: usize, max_attempts: i32) -> Self {
        self.batch_size = batch_size.max(1);
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn sync_next_batch(&self) -> Result<MediaSyncSummary> {
        let listings = self
            .store
            .listings_pending_media(self.batch_size, self.max_attempts)
            .await?;
        let mut summary = MediaSyncSummary {
            listings: listings.len(),
            ..MediaSyncSummary::default()
        };

        for listing in &listings {
            let (synced, failed) = self.sync_listing(listing).await?;
            summary.assets_synced += synced;
            summary.assets_failed += failed;

            let complete = failed == 0;
            let closed = self
                .store
                .record_media_pass(listing.id, complete, self.max_attempts)
                .await?;
            if closed {
                summary.listings_completed += 1;
                if !complete {
                    warn!(
                        external_id = %listing.external_id,
                        failed,
                        "giving up on remaining media after repeated failures"
                    );
                }
            }
        }

        info!(
            listings = summary.listings,
            synced = summary.assets_synced,
            failed = summary.assets_failed,
            "media batch complete"
        );
        Ok(summary)
    }

    /// Returns (synced, failed) counts for this pass.
    async fn sync_listing(&self, listing: &Listing) -> Result<(usize, usize)> {
        let done = self.store.synced_media_positions(listing.id).await?;
        let mut synced = 0;
        let mut failed = 0;

        for (position, asset) in listing.media.iter().enumerate() {
            let position = i32::try_from(position).context("media position overflow")?;
            if done.contains(&position) {
                continue;
            }
            match self.sync_asset(listing, position, asset).await {
                Ok(()) => synced += 1,
                Err(err) => {
                    failed += 1;
                    warn!(
                        external_id = %listing.external_id,
                        position,
                        reason = %format!("{err:#}"),
                        "media asset failed"
                    );
                }
            }
        }
        Ok((synced, failed))
    }

    async fn sync_asset(&self, listing: &Listing, position: i32, asset: &MediaAsset) -> Result<()> {
        let url = asset
            .preferred_url()
            .context("asset has neither url nor thumbnail")?;
        let bytes = self
            .downloader
            .download(url)
            .await
            .with_context(|| format!("downloading {url}"))?;
        let now = Utc::now();
        let stored = self
            .media_store
            .store_bytes(
                now,
                &listing.external_id,
                &MediaStore::extension_for_url(url),
                &bytes,
            )
            .await?;
        self.store
            .save_listing_media(&ListingMedia {
                listing_id: listing.id,
                position,
                source_url: url.to_string(),
                thumbnail_url: asset.thumbnail_url.clone(),
                content_hash: stored.content_hash,
                stored_path: stored.relative_path.to_string_lossy().into_owned(),
                byte_size: i64::try_from(stored.byte_size).context("media size overflow")?,
                synced_at: now,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{detail, MockMediaDownloader};
    use clep_adapters::ApiError;
    use clep_core::{NewListing, ScopeCombination};

    async fn listing_with_media(store: &MemoryStore, id: &str, urls: &[(Option<&str>, Option<&str>)]) {
        let new = NewListing::new("classifieds", id, ScopeCombination::new(1, 10));
        store.enqueue_listings(&[new.clone()]).await.unwrap();
        let mut detail = detail(id);
        detail.media = urls
            .iter()
            .map(|(url, thumb)| MediaAsset {
                url: url.map(ToString::to_string),
                thumbnail_url: thumb.map(ToString::to_string),
            })
            .collect();
        store.save_listing_detail(new.id, &detail).await.unwrap();
    }

    #[tokio::test]
    async fn failed_assets_are_skipped_and_retried_later() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        listing_with_media(
            &store,
            "a",
            &[
                (Some("https://cdn.example/1.jpg"), None),
                (None, Some("https://cdn.example/2-thumb.png")),
                (Some("https://cdn.example/3.jpg"), None),
            ],
        )
        .await;
        let downloader = Arc::new(MockMediaDownloader::default());
        downloader.serve("https://cdn.example/1.jpg", b"one");
        downloader.serve("https://cdn.example/2-thumb.png", b"two");
        downloader.fail("https://cdn.example/3.jpg", ApiError::Transient("reset".into()));

        let syncer = MediaSyncer::new(store.clone(), downloader.clone(), MediaStore::new(dir.path()));
        let first = syncer.sync_next_batch().await.unwrap();
        assert_eq!(first.assets_synced, 2);
        assert_eq!(first.assets_failed, 1);
        assert_eq!(first.listings_completed, 0);
        assert!(!store.listings().unwrap()[0].has_media);

        downloader.serve("https://cdn.example/3.jpg", b"three");
        let second = syncer.sync_next_batch().await.unwrap();
        assert_eq!(second.assets_synced, 1);
        assert_eq!(second.listings_completed, 1);

        let media = store.listing_media().unwrap();
        assert_eq!(media.len(), 3);
        assert_eq!(media[1].source_url, "https://cdn.example/2-thumb.png");
        assert!(media[1].stored_path.ends_with(".png"));
        assert!(dir.path().join(&media[0].stored_path).exists());
        assert!(store.listings().unwrap()[0].has_media);
        assert_eq!(downloader.calls("https://cdn.example/1.jpg"), 1);
    }

    #[tokio::test]
    async fn listings_close_at_the_attempt_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        listing_with_media(&store, "a", &[(None, None)]).await;
        listing_with_media(&store, "b", &[]).await;

        let syncer = MediaSyncer::new(
            store.clone(),
            Arc::new(MockMediaDownloader::default()),
            MediaStore::new(dir.path()),
        )
        .with_limits(10, 2);
        let first = syncer.sync_next_batch().await.unwrap();
        assert_eq!(first.listings, 2);
        assert_eq!(first.listings_completed, 1);

        let second = syncer.sync_next_batch().await.unwrap();
        assert_eq!(second.listings, 1);
        assert_eq!(second.listings_completed, 1);
        assert_eq!(syncer.sync_next_batch().await.unwrap().listings, 0);
        assert!(store.listings().unwrap().iter().all(|l| l.has_media));
    }
}
