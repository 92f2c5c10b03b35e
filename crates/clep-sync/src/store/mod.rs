//! Durable pipeline state.
//!
//! Every mutation that hands out work (fetch queue, analysis jobs, directory
//! cursor) is a conditional update on the expected prior state, so two
//! instances of a stage racing on the same rows never both win.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clep_core::{
    AnalysisJob, AnalysisReport, DirectoryCursor, DirectoryRecord, FetchStatus, Listing,
    ListingDetail, ListingMedia, NewListing, StageRunRecord, TransferState,
};
use serde::Serialize;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Row counts across all stages, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub listings_queued: i64,
    pub listings_fetching: i64,
    pub listings_fetched: i64,
    pub listings_failed: i64,
    pub missing_contact: i64,
    pub missing_media: i64,
    pub jobs_pending: i64,
    pub jobs_processing: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub directory_cursor: Option<i64>,
    pub directory_records: i64,
    pub transfers_pending: i64,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// The subset of `external_ids` already present for `source`.
    async fn known_external_ids(
        &self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashSet<String>>;

    /// Insert-if-absent; returns how many rows were new.
    async fn enqueue_listings(&self, listings: &[NewListing]) -> Result<u64>;

    /// Moves up to `limit` queued listings (oldest first) to `fetching`.
    /// `fetching` claims older than `lease` are handed out again.
    async fn claim_queued_listings(&self, limit: usize, lease: Duration) -> Result<Vec<Listing>>;

    /// Stores detail, marks the listing fetched and creates its analysis job.
    async fn save_listing_detail(&self, listing_id: Uuid, detail: &ListingDetail) -> Result<()>;

    /// Counts a failed attempt. The listing goes back to `queued` unless
    /// `terminal` or the attempt cap is reached, in which case it is `failed`.
    async fn record_fetch_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        max_attempts: i32,
        terminal: bool,
    ) -> Result<FetchStatus>;

    /// Returns a claimed listing to the queue without counting an attempt.
    async fn release_listing_claim(&self, listing_id: Uuid) -> Result<()>;

    async fn next_contact_candidate(&self, max_attempts: i32) -> Result<Option<Listing>>;

    async fn save_contact(&self, listing_id: Uuid, phone: Option<&str>) -> Result<()>;

    async fn record_contact_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        count_attempt: bool,
    ) -> Result<()>;

    async fn listings_pending_media(&self, limit: usize, max_attempts: i32) -> Result<Vec<Listing>>;

    async fn synced_media_positions(&self, listing_id: Uuid) -> Result<HashSet<i32>>;

    async fn save_listing_media(&self, media: &ListingMedia) -> Result<()>;

    /// Closes the listing's media when `complete`, otherwise counts an attempt
    /// and closes it once `max_attempts` is reached. Returns whether it closed.
    async fn record_media_pass(
        &self,
        listing_id: Uuid,
        complete: bool,
        max_attempts: i32,
    ) -> Result<bool>;

    /// Moves up to `limit` PENDING jobs (oldest first) to PROCESSING.
    /// PROCESSING jobs untouched for longer than `lease` are handed out again.
    async fn claim_pending_jobs(&self, limit: usize, lease: Duration) -> Result<Vec<AnalysisJob>>;

    async fn load_listing(&self, listing_id: Uuid) -> Result<Option<Listing>>;

    async fn complete_job(&self, job: &AnalysisJob, report: &AnalysisReport) -> Result<()>;

    async fn fail_job(&self, job: &AnalysisJob, error: &str) -> Result<()>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>>;

    /// Creates the cursor at `start_id`, or raises it to `start_id` when lower.
    async fn ensure_cursor(&self, start_id: i64) -> Result<DirectoryCursor>;

    async fn load_cursor(&self) -> Result<Option<DirectoryCursor>>;

    /// Compare-and-set; never moves the cursor backwards.
    async fn advance_cursor(&self, expected: i64, next: i64) -> Result<bool>;

    async fn find_directory_record(&self, arka_id: i64) -> Result<Option<DirectoryRecord>>;

    /// Insert-if-absent; returns whether the record was new.
    async fn insert_directory_record(&self, record: &DirectoryRecord) -> Result<bool>;

    /// Copies phones from NOT_TRANSFERRED directory records onto up to `limit`
    /// phoneless listings sharing the external id, marking the records
    /// TRANSFERRED. Returns the number of listings updated.
    async fn bulk_transfer_phones(&self, source: &str, limit: usize) -> Result<u64>;

    /// Latest still-active deferral among NOT_TRANSFERRED records.
    async fn active_transfer_deferral(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    async fn next_transfer_candidate(&self, now: DateTime<Utc>) -> Result<Option<DirectoryRecord>>;

    async fn find_listing_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Listing>>;

    /// Sets the phone only when the listing has none; returns whether it did.
    async fn set_listing_phone(&self, listing_id: Uuid, phone: &str) -> Result<bool>;

    /// Moves a record to `state`, clearing any deferral.
    async fn set_transfer_state(
        &self,
        arka_id: i64,
        state: TransferState,
        note: Option<&str>,
    ) -> Result<()>;

    async fn defer_transfer(&self, arka_id: i64, until: DateTime<Utc>, reason: &str) -> Result<()>;

    async fn record_stage_run(&self, run: &StageRunRecord) -> Result<()>;

    async fn status(&self) -> Result<PipelineStatus>;
}
