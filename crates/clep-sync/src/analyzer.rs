//! Rule-based content analysis of fetched listings, driven by the
//! PENDING → PROCESSING → COMPLETED/FAILED job queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clep_core::{normalize_phone, AnalysisJob, AnalysisReport, Listing};
use regex::Regex;
use scraper::Html;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AnalysisRules;
use crate::store::PipelineStore;

#[derive(Debug, Clone)]
pub struct ContentAnalyzer {
    rules: AnalysisRules,
    phone_pattern: Regex,
}

impl ContentAnalyzer {
    pub fn new(rules: AnalysisRules) -> Result<Self> {
        let phone_pattern =
            Regex::new(r"\+?\d[\d\s\-().]{5,}\d").context("compiling phone pattern")?;
        Ok(Self {
            rules,
            phone_pattern,
        })
    }

    /// Strips markup from a description fragment.
    pub fn flatten_html(fragment: &str) -> String {
        let doc = Html::parse_fragment(fragment);
        doc.root_element()
            .text()
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn analyze(&self, listing: &Listing, now: DateTime<Utc>) -> Result<AnalysisReport> {
        if listing.payload.is_none() {
            bail!("listing {} has no fetched detail", listing.external_id);
        }

        let mut text = listing.title.clone().unwrap_or_default();
        if let Some(description) = &listing.description {
            text.push(' ');
            text.push_str(&Self::flatten_html(description));
        }
        let lowered = text.to_lowercase();

        let tags: BTreeSet<String> = self
            .rules
            .tags
            .iter()
            .filter(|rule| contains_any(&lowered, &rule.contains_any))
            .map(|rule| rule.tag.clone())
            .collect();
        let risk_flags: BTreeSet<String> = self
            .rules
            .risks
            .iter()
            .filter(|rule| contains_any(&lowered, &rule.contains_any))
            .map(|rule| rule.risk_flag.clone())
            .collect();

        let mut phones_in_text = Vec::new();
        for candidate in self.phone_pattern.find_iter(&text) {
            if let Some(phone) = normalize_phone(candidate.as_str()) {
                if !phones_in_text.contains(&phone) {
                    phones_in_text.push(phone);
                }
            }
        }

        Ok(AnalysisReport {
            word_count: text
                .split_whitespace()
                .filter(|word| word.chars().any(char::is_alphanumeric))
                .count(),
            tags: tags.into_iter().collect(),
            risk_flags: risk_flags.into_iter().collect(),
            phones_in_text,
            price_bucket: self.price_bucket(listing.price),
            analyzed_at: now,
        })
    }

    fn price_bucket(&self, price: Option<f64>) -> Option<String> {
        let price = price?;
        self.rules
            .price_buckets
            .iter()
            .find(|bucket| bucket.max.map_or(true, |max| price <= max))
            .map(|bucket| bucket.label.clone())
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| !needle.is_empty() && haystack.contains(&needle.to_lowercase()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisSummary {
    pub processed: usize,
    pub failed: usize,
}

pub struct AnalysisWorker {
    store: Arc<dyn PipelineStore>,
    analyzer: ContentAnalyzer,
    lease: Duration,
}

impl AnalysisWorker {
    pub fn new(store: Arc<dyn PipelineStore>, analyzer: ContentAnalyzer) -> Self {
        Self {
            store,
            analyzer,
            lease: Duration::from_secs(600),
        }
    }

    /// How long a PROCESSING job may sit before another worker reclaims it.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Claims up to `limit` pending jobs and drives each to a terminal state.
    /// `processed` counts every claimed job, `failed` the ones that ended FAILED.
    pub async fn process_pending_jobs(&self, limit: usize) -> Result<AnalysisSummary> {
        let jobs = self.store.claim_pending_jobs(limit, self.lease).await?;
        let mut summary = AnalysisSummary::default();
        for job in &jobs {
            summary.processed += 1;
            let Err(err) = self.process_job(job).await else {
                continue;
            };
            summary.failed += 1;
            let detail = format!("{err:#}");
            warn!(job_id = %job.id, listing_id = %job.listing_id, reason = %detail, "analysis job failed");
            // Left PROCESSING; reclaimed once the lease runs out.
            if let Err(err) = self.store.fail_job(job, &detail).await {
                warn!(job_id = %job.id, reason = %format!("{err:#}"), "recording analysis failure failed");
            }
        }
        if !jobs.is_empty() {
            info!(processed = summary.processed, failed = summary.failed, "analysis batch complete");
        }
        Ok(summary)
    }

    async fn process_job(&self, job: &AnalysisJob) -> Result<()> {
        let listing = self
            .store
            .load_listing(job.listing_id)
            .await?
            .with_context(|| format!("listing {} not found", job.listing_id))?;
        let report = self.analyzer.analyze(&listing, Utc::now())?;
        self.store.complete_job(job, &report).await
    }
}
