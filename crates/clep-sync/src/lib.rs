//! CLEP pipeline stages, their shared persistence contract, and the wiring
//! that builds each stage from [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clep_adapters::{
    DirectoryApi, HttpDirectoryApi, HttpListingApi, HttpMediaDownloader, ListingApi,
    MediaDownloader,
};
use clep_core::StageRunRecord;
use clep_storage::{HttpClientConfig, HttpFetcher, MediaStore, TokenBucketConfig};
use serde::Serialize;
use uuid::Uuid;

pub mod analyzer;
pub mod config;
pub mod contact;
pub mod directory;
pub mod driver;
pub mod fetcher;
pub mod harvester;
pub mod media;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use analyzer::{AnalysisSummary, AnalysisWorker, ContentAnalyzer};
pub use config::{AnalysisRules, PipelineConfig, ScopeRegistry};
pub use contact::{ContactFetcher, ContactTick};
pub use directory::{CrawlSummary, DirectoryCrawler};
pub use driver::{BatchStep, BatchVerdict, DriverPolicy, DriverReport, DriverState, StageDriver};
pub use fetcher::{FetchPostsSummary, ListingFetcher};
pub use harvester::{HarvestSummary, Harvester};
pub use media::{MediaSyncSummary, MediaSyncer};
pub use store::{MemoryStore, PgStore, PipelineStatus, PipelineStore};
pub use transfer::{
    BulkTransfer, MatchStrategy, PerRecordTransfer, TransferMatcher, TransferSummary,
};

pub const CRATE_NAME: &str = "clep-sync";

/// Everything a stage needs: the store, the upstream clients and config.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn PipelineStore>,
    listing_api: Arc<dyn ListingApi>,
    directory_api: Arc<dyn DirectoryApi>,
    media: Arc<dyn MediaDownloader>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PipelineStore>,
        listing_api: Arc<dyn ListingApi>,
        directory_api: Arc<dyn DirectoryApi>,
        media: Arc<dyn MediaDownloader>,
    ) -> Self {
        Self {
            config,
            store,
            listing_api,
            directory_api,
            media,
        }
    }

    /// HTTP clients built from config, backed by the given store.
    pub fn with_store(config: PipelineConfig, store: Arc<dyn PipelineStore>) -> Result<Self> {
        let base = HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            per_api_concurrency: config.fetch_concurrency.max(1),
            ..HttpClientConfig::default()
        };
        let listing_http = Arc::new(HttpFetcher::new(base.clone()).context("listing http client")?);
        let directory_http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                per_api_concurrency: config.directory_batch_size.max(1),
                token_bucket: config.directory_rps.map(TokenBucketConfig::per_second),
                ..base
            })
            .context("directory http client")?,
        );

        Ok(Self::new(
            config.clone(),
            store,
            Arc::new(HttpListingApi::new(
                config.listing_api_base_url.clone(),
                listing_http.clone(),
            )),
            Arc::new(HttpDirectoryApi::new(
                config.directory_api_base_url.clone(),
                directory_http,
            )),
            Arc::new(HttpMediaDownloader::new(listing_http)),
        ))
    }

    /// Postgres-backed pipeline for `config.database_url`.
    pub async fn connect(config: PipelineConfig) -> Result<Self> {
        let store = PgStore::connect(&config.database_url).await?;
        Self::with_store(config, Arc::new(store))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn PipelineStore> {
        self.store.clone()
    }

    pub fn harvester(&self) -> Result<Harvester> {
        let registry = ScopeRegistry::load(&self.config.scopes_path())?;
        Ok(Harvester::new(
            self.store.clone(),
            self.listing_api.clone(),
            registry,
            self.config.listing_source.clone(),
        )
        .with_limits(self.config.harvest_concurrency, self.config.harvest_max_pages))
    }

    pub fn listing_fetcher(&self) -> ListingFetcher {
        ListingFetcher::new(self.store.clone(), self.listing_api.clone())
            .with_batch(self.config.fetch_batch_size, self.config.fetch_concurrency)
            .with_retry(
                self.config.max_fetch_attempts,
                Duration::from_secs(self.config.fetch_lease_secs),
            )
    }

    pub fn contact_fetcher(&self) -> ContactFetcher {
        ContactFetcher::new(
            self.store.clone(),
            self.listing_api.clone(),
            self.config.max_contact_attempts,
        )
    }

    pub fn media_syncer(&self) -> MediaSyncer {
        MediaSyncer::new(
            self.store.clone(),
            self.media.clone(),
            MediaStore::new(self.config.media_dir.clone()),
        )
        .with_limits(self.config.media_batch_size, self.config.max_media_attempts)
    }

    pub fn analysis_worker(&self) -> Result<AnalysisWorker> {
        let rules = AnalysisRules::load(&self.config.analysis_rules_path())?;
        Ok(
            AnalysisWorker::new(self.store.clone(), ContentAnalyzer::new(rules)?)
                .with_lease(Duration::from_secs(self.config.analysis_lease_secs)),
        )
    }

    pub fn directory_crawler(&self) -> DirectoryCrawler {
        DirectoryCrawler::new(
            self.store.clone(),
            self.directory_api.clone(),
            self.config.directory_start_id,
        )
        .with_batch_size(self.config.directory_batch_size)
    }

    pub fn transfer_matcher(&self) -> TransferMatcher {
        TransferMatcher::new(vec![
            Box::new(BulkTransfer::new(
                self.store.clone(),
                self.config.listing_source.clone(),
                self.config.transfer_bulk_size,
            )),
            Box::new(PerRecordTransfer::new(
                self.store.clone(),
                self.listing_api.clone(),
                self.config.listing_source.clone(),
                Duration::from_secs(self.config.transfer_default_backoff_secs),
            )),
        ])
    }

    /// Appends a stage run with its serialized summary.
    pub async fn record_run<T: Serialize>(
        &self,
        stage: &str,
        started_at: DateTime<Utc>,
        summary: &T,
    ) -> Result<StageRunRecord> {
        let run = StageRunRecord {
            run_id: Uuid::new_v4(),
            stage: stage.to_string(),
            started_at,
            finished_at: Utc::now(),
            summary: serde_json::to_value(summary).context("serializing stage summary")?,
        };
        self.store.record_stage_run(&run).await?;
        Ok(run)
    }
}
