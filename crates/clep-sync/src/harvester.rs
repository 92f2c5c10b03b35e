use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clep_adapters::ListingApi;
use clep_core::{NewListing, ScopeCombination};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ScopeRegistry;
use crate::store::PipelineStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestSummary {
    pub enqueued: u64,
    pub combinations: usize,
    pub locations: usize,
    pub categories: usize,
    pub failed_combinations: usize,
}

/// Walks every allowed scope combination and enqueues listing ids not yet known.
pub struct Harvester {
    store: Arc<dyn PipelineStore>,
    api: Arc<dyn ListingApi>,
    registry: ScopeRegistry,
    source: String,
    concurrency: usize,
    max_pages: u32,
}

impl Harvester {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        api: Arc<dyn ListingApi>,
        registry: ScopeRegistry,
        source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            registry,
            source: source.into(),
            concurrency: 4,
            max_pages: 20,
        }
    }

    pub fn with_limits(mut self, concurrency: usize, max_pages: u32) -> Self {
        self.concurrency = concurrency.max(1);
        self.max_pages = max_pages.max(1);
        self
    }

    pub async fn harvest_allowed_scopes(&self) -> Result<HarvestSummary> {
        let combinations = self.registry.combinations();
        let mut summary = HarvestSummary {
            combinations: combinations.len(),
            locations: combinations
                .iter()
                .map(|c| c.location_id)
                .collect::<HashSet<_>>()
                .len(),
            categories: combinations
                .iter()
                .map(|c| c.category_id)
                .collect::<HashSet<_>>()
                .len(),
            ..HarvestSummary::default()
        };

        let results: Vec<(ScopeCombination, u64, Result<()>)> = stream::iter(combinations)
            .map(|scope| async move {
                let (enqueued, result) = self.harvest_combination(scope).await;
                (scope, enqueued, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (scope, enqueued, result) in results {
            summary.enqueued += enqueued;
            match result {
                Ok(()) => {}
                Err(err) => {
                    summary.failed_combinations += 1;
                    warn!(
                        location_id = scope.location_id,
                        category_id = scope.category_id,
                        reason = %format!("{err:#}"),
                        "harvest combination failed"
                    );
                }
            }
        }

        if summary.combinations > 0 && summary.failed_combinations == summary.combinations {
            bail!(
                "every harvest combination failed ({} of {})",
                summary.failed_combinations,
                summary.combinations
            );
        }
        info!(
            enqueued = summary.enqueued,
            combinations = summary.combinations,
            failed = summary.failed_combinations,
            "harvest complete"
        );
        Ok(summary)
    }

    /// Paginates one combination. Ids collected before a page failure are
    /// still enqueued; the failure is then reported for the combination.
    async fn harvest_combination(&self, scope: ScopeCombination) -> (u64, Result<()>) {
        let mut seen = HashSet::new();
        let mut collected = Vec::new();
        let mut page_error = None;

        for page in 1..=self.max_pages {
            match self.api.search(scope, page).await {
                Ok(result) => {
                    for external_id in result.external_ids.iter() {
                        if seen.insert(external_id.clone()) {
                            collected.push(external_id.clone());
                        }
                    }
                    if !result.has_next() {
                        break;
                    }
                }
                Err(err) => {
                    page_error = Some((page, err));
                    break;
                }
            }
        }

        let enqueued = match self.enqueue_new(scope, &collected).await {
            Ok(enqueued) => enqueued,
            Err(err) => return (0, Err(err.context(format!("enqueueing ids for {scope}")))),
        };
        match page_error {
            Some((page, err)) => (
                enqueued,
                Err(err).with_context(|| format!("search page {page} for {scope}")),
            ),
            None => (enqueued, Ok(())),
        }
    }

    async fn enqueue_new(&self, scope: ScopeCombination, external_ids: &[String]) -> Result<u64> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let known = self
            .store
            .known_external_ids(&self.source, external_ids)
            .await?;
        let fresh: Vec<NewListing> = external_ids
            .iter()
            .filter(|id| !known.contains(*id))
            .map(|id| NewListing::new(&self.source, id, scope))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        self.store.enqueue_listings(&fresh).await
    }
}
