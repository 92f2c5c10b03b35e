use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clep_core::{
    AnalysisJob, AnalysisReport, DirectoryCursor, DirectoryRecord, FetchStatus, JobStatus,
    Listing, ListingDetail, ListingMedia, NewListing, StageRunRecord, TransferState,
};
use uuid::Uuid;

use super::{PipelineStatus, PipelineStore};

#[derive(Debug, Default)]
struct MemoryState {
    listings: HashMap<Uuid, Listing>,
    media: BTreeMap<(Uuid, i32), ListingMedia>,
    jobs: HashMap<Uuid, AnalysisJob>,
    cursor: Option<DirectoryCursor>,
    records: BTreeMap<i64, DirectoryRecord>,
    runs: Vec<StageRunRecord>,
    job_failure_faults: usize,
}

/// Process-local store. The mutex makes every claim a compare-and-set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    pub fn listings(&self) -> Result<Vec<Listing>> {
        let mut listings: Vec<Listing> = self.state()?.listings.values().cloned().collect();
        listings.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(listings)
    }

    pub fn directory_records(&self) -> Result<Vec<DirectoryRecord>> {
        Ok(self.state()?.records.values().cloned().collect())
    }

    pub fn listing_media(&self) -> Result<Vec<ListingMedia>> {
        Ok(self.state()?.media.values().cloned().collect())
    }

    pub fn jobs(&self) -> Result<Vec<AnalysisJob>> {
        Ok(self.state()?.jobs.values().cloned().collect())
    }

    pub fn stage_runs(&self) -> Result<Vec<StageRunRecord>> {
        Ok(self.state()?.runs.clone())
    }

    /// Replaces a listing wholesale; lets tests arrange arbitrary state.
    pub fn put_listing(&self, listing: Listing) -> Result<()> {
        self.state()?.listings.insert(listing.id, listing);
        Ok(())
    }

    pub fn put_job(&self, job: AnalysisJob) -> Result<()> {
        self.state()?.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn put_directory_record(&self, record: DirectoryRecord) -> Result<()> {
        self.state()?.records.insert(record.arka_id, record);
        Ok(())
    }

    /// The next `count` calls to `fail_job` error without writing.
    pub fn reject_next_job_failures(&self, count: usize) -> Result<()> {
        self.state()?.job_failure_faults = count;
        Ok(())
    }
}

fn take_job_failure_fault(state: &mut MemoryState) -> Result<()> {
    if state.job_failure_faults > 0 {
        state.job_failure_faults -= 1;
        bail!("analysis_jobs write rejected");
    }
    Ok(())
}

fn oldest_first(listings: &mut [&mut Listing]) {
    listings.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn known_external_ids(
        &self,
        source: &str,
        external_ids: &[String],
    ) -> Result<HashSet<String>> {
        let state = self.state()?;
        let wanted: HashSet<&str> = external_ids.iter().map(String::as_str).collect();
        Ok(state
            .listings
            .values()
            .filter(|l| l.source == source && wanted.contains(l.external_id.as_str()))
            .map(|l| l.external_id.clone())
            .collect())
    }

    async fn enqueue_listings(&self, listings: &[NewListing]) -> Result<u64> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut inserted = 0;
        for new in listings {
            if state.listings.contains_key(&new.id) {
                continue;
            }
            state.listings.insert(new.id, Listing::queued(new, now));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_queued_listings(&self, limit: usize, lease: Duration) -> Result<Vec<Listing>> {
        let mut state = self.state()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)?;
        let mut claimable: Vec<&mut Listing> = state
            .listings
            .values_mut()
            .filter(|l| match l.fetch_status {
                FetchStatus::Queued => true,
                FetchStatus::Fetching => l.claimed_at.is_some_and(|at| at + lease < now),
                _ => false,
            })
            .collect();
        oldest_first(&mut claimable);
        Ok(claimable
            .into_iter()
            .take(limit)
            .map(|listing| {
                listing.fetch_status = FetchStatus::Fetching;
                listing.claimed_at = Some(now);
                listing.updated_at = now;
                listing.clone()
            })
            .collect())
    }

    async fn save_listing_detail(&self, listing_id: Uuid, detail: &ListingDetail) -> Result<()> {
        let mut state = self.state()?;
        let now = Utc::now();
        let Some(listing) = state.listings.get_mut(&listing_id) else {
            bail!("listing {listing_id} does not exist");
        };
        listing.apply_detail(detail, now);
        if !state.jobs.values().any(|j| j.listing_id == listing_id) {
            let job = AnalysisJob::pending(listing_id, now);
            state.jobs.insert(job.id, job);
        }
        Ok(())
    }

    async fn record_fetch_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        max_attempts: i32,
        terminal: bool,
    ) -> Result<FetchStatus> {
        let mut state = self.state()?;
        let Some(listing) = state.listings.get_mut(&listing_id) else {
            bail!("listing {listing_id} does not exist");
        };
        listing.fetch_attempts += 1;
        listing.last_error = Some(reason.to_string());
        listing.claimed_at = None;
        listing.updated_at = Utc::now();
        listing.fetch_status = if terminal || listing.fetch_attempts >= max_attempts {
            FetchStatus::Failed
        } else {
            FetchStatus::Queued
        };
        Ok(listing.fetch_status)
    }

    async fn release_listing_claim(&self, listing_id: Uuid) -> Result<()> {
        let mut state = self.state()?;
        if let Some(listing) = state.listings.get_mut(&listing_id) {
            if listing.fetch_status == FetchStatus::Fetching {
                listing.fetch_status = FetchStatus::Queued;
                listing.claimed_at = None;
                listing.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn next_contact_candidate(&self, max_attempts: i32) -> Result<Option<Listing>> {
        let state = self.state()?;
        Ok(state
            .listings
            .values()
            .filter(|l| {
                l.fetch_status == FetchStatus::Fetched
                    && l.phone.is_none()
                    && !l.has_contact
                    && l.contact_attempts < max_attempts
            })
            .min_by(|a, b| {
                (a.contact_attempts, a.created_at, a.id).cmp(&(b.contact_attempts, b.created_at, b.id))
            })
            .cloned())
    }

    async fn save_contact(&self, listing_id: Uuid, phone: Option<&str>) -> Result<()> {
        let mut state = self.state()?;
        let Some(listing) = state.listings.get_mut(&listing_id) else {
            bail!("listing {listing_id} does not exist");
        };
        listing.has_contact = true;
        if listing.phone.is_none() {
            listing.phone = phone.map(ToString::to_string);
        }
        listing.updated_at = Utc::now();
        Ok(())
    }

    async fn record_contact_failure(
        &self,
        listing_id: Uuid,
        reason: &str,
        count_attempt: bool,
    ) -> Result<()> {
        let mut state = self.state()?;
        let Some(listing) = state.listings.get_mut(&listing_id) else {
            bail!("listing {listing_id} does not exist");
        };
        if count_attempt {
            listing.contact_attempts += 1;
        }
        listing.last_error = Some(reason.to_string());
        listing.updated_at = Utc::now();
        Ok(())
    }

    async fn listings_pending_media(&self, limit: usize, max_attempts: i32) -> Result<Vec<Listing>> {
        let state = self.state()?;
        let mut pending: Vec<&Listing> = state
            .listings
            .values()
            .filter(|l| {
                l.fetch_status == FetchStatus::Fetched
                    && !l.has_media
                    && l.media_attempts < max_attempts
            })
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn synced_media_positions(&self, listing_id: Uuid) -> Result<HashSet<i32>> {
        let state = self.state()?;
        Ok(state
            .media
            .keys()
            .filter(|(id, _)| *id == listing_id)
            .map(|(_, position)| *position)
            .collect())
    }

    async fn save_listing_media(&self, media: &ListingMedia) -> Result<()> {
        let mut state = self.state()?;
        state
            .media
            .entry((media.listing_id, media.position))
            .or_insert_with(|| media.clone());
        Ok(())
    }

    async fn record_media_pass(
        &self,
        listing_id: Uuid,
        complete: bool,
        max_attempts: i32,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let Some(listing) = state.listings.get_mut(&listing_id) else {
            bail!("listing {listing_id} does not exist");
        };
        if !complete {
            listing.media_attempts += 1;
        }
        listing.has_media = complete || listing.media_attempts >= max_attempts;
        listing.updated_at = Utc::now();
        Ok(listing.has_media)
    }

    async fn claim_pending_jobs(&self, limit: usize, lease: Duration) -> Result<Vec<AnalysisJob>> {
        let mut state = self.state()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)?;
        let mut pending: Vec<&mut AnalysisJob> = state
            .jobs
            .values_mut()
            .filter(|j| match j.status {
                JobStatus::Pending => true,
                JobStatus::Processing => j.updated_at + lease < now,
                _ => false,
            })
            .collect();
        pending.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn load_listing(&self, listing_id: Uuid) -> Result<Option<Listing>> {
        Ok(self.state()?.listings.get(&listing_id).cloned())
    }

    async fn complete_job(&self, job: &AnalysisJob, report: &AnalysisReport) -> Result<()> {
        let mut state = self.state()?;
        let now = Utc::now();
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == JobStatus::Processing => {
                stored.status = JobStatus::Completed;
                stored.last_error = None;
                stored.updated_at = now;
            }
            _ => bail!("job {} is not being processed", job.id),
        }
        if let Some(listing) = state.listings.get_mut(&job.listing_id) {
            listing.analysis = Some(report.clone());
            listing.analyzed = true;
            listing.updated_at = now;
        }
        Ok(())
    }

    async fn fail_job(&self, job: &AnalysisJob, error: &str) -> Result<()> {
        let mut state = self.state()?;
        take_job_failure_fault(&mut state)?;
        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.status == JobStatus::Processing => {
                stored.status = JobStatus::Failed;
                stored.last_error = Some(error.to_string());
                stored.updated_at = Utc::now();
                Ok(())
            }
            _ => bail!("job {} is not being processed", job.id),
        }
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<AnalysisJob>> {
        Ok(self.state()?.jobs.get(&job_id).cloned())
    }

    async fn ensure_cursor(&self, start_id: i64) -> Result<DirectoryCursor> {
        let mut state = self.state()?;
        let now = Utc::now();
        let cursor = match state.cursor {
            Some(cursor) if cursor.next_fetch_id >= start_id => cursor,
            _ => DirectoryCursor {
                next_fetch_id: start_id,
                updated_at: now,
            },
        };
        state.cursor = Some(cursor);
        Ok(cursor)
    }

    async fn load_cursor(&self) -> Result<Option<DirectoryCursor>> {
        Ok(self.state()?.cursor)
    }

    async fn advance_cursor(&self, expected: i64, next: i64) -> Result<bool> {
        let mut state = self.state()?;
        match state.cursor.as_mut() {
            Some(cursor) if cursor.next_fetch_id == expected && next > expected => {
                cursor.next_fetch_id = next;
                cursor.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_directory_record(&self, arka_id: i64) -> Result<Option<DirectoryRecord>> {
        Ok(self.state()?.records.get(&arka_id).cloned())
    }

    async fn insert_directory_record(&self, record: &DirectoryRecord) -> Result<bool> {
        let mut state = self.state()?;
        if state.records.contains_key(&record.arka_id) {
            return Ok(false);
        }
        state.records.insert(record.arka_id, record.clone());
        Ok(true)
    }

    async fn bulk_transfer_phones(&self, source: &str, limit: usize) -> Result<u64> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let now = Utc::now();

        let mut by_external: HashMap<String, Uuid> = HashMap::new();
        for listing in state.listings.values() {
            if listing.source == source && listing.phone.is_none() {
                by_external.insert(listing.external_id.clone(), listing.id);
            }
        }

        let mut updated = 0u64;
        for record in state.records.values_mut() {
            if updated as usize >= limit {
                break;
            }
            if !record.is_transfer_candidate() {
                continue;
            }
            let (Some(external_id), Some(phone)) = (&record.external_id, &record.phone) else {
                continue;
            };
            let Some(listing_id) = by_external.get(external_id).copied() else {
                continue;
            };
            let Some(listing) = state.listings.get_mut(&listing_id) else {
                continue;
            };
            if listing.phone.is_some() {
                continue;
            }
            listing.phone = Some(phone.clone());
            listing.updated_at = now;
            updated += 1;
            record.transfer_state = TransferState::Transferred;
            record.deferred_until = None;
            record.transfer_note = Some("bulk".to_string());
        }
        Ok(updated)
    }

    async fn active_transfer_deferral(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state()?
            .records
            .values()
            .filter(|r| r.transfer_state == TransferState::NotTransferred)
            .filter_map(|r| r.deferred_until)
            .filter(|until| *until > now)
            .max())
    }

    async fn next_transfer_candidate(&self, now: DateTime<Utc>) -> Result<Option<DirectoryRecord>> {
        Ok(self
            .state()?
            .records
            .values()
            .find(|r| r.is_transfer_candidate() && r.deferred_until.map_or(true, |u| u <= now))
            .cloned())
    }

    async fn find_listing_by_external_id(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<Listing>> {
        Ok(self
            .state()?
            .listings
            .values()
            .find(|l| l.source == source && l.external_id == external_id)
            .cloned())
    }

    async fn set_listing_phone(&self, listing_id: Uuid, phone: &str) -> Result<bool> {
        let mut state = self.state()?;
        match state.listings.get_mut(&listing_id) {
            Some(listing) if listing.phone.is_none() => {
                listing.phone = Some(phone.to_string());
                listing.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_transfer_state(
        &self,
        arka_id: i64,
        state: TransferState,
        note: Option<&str>,
    ) -> Result<()> {
        let mut guard = self.state()?;
        let Some(record) = guard.records.get_mut(&arka_id) else {
            bail!("directory record {arka_id} does not exist");
        };
        record.transfer_state = state;
        record.deferred_until = None;
        record.transfer_note = note.map(ToString::to_string);
        Ok(())
    }

    async fn defer_transfer(&self, arka_id: i64, until: DateTime<Utc>, reason: &str) -> Result<()> {
        let mut state = self.state()?;
        let Some(record) = state.records.get_mut(&arka_id) else {
            bail!("directory record {arka_id} does not exist");
        };
        record.deferred_until = Some(until);
        record.transfer_note = Some(reason.to_string());
        Ok(())
    }

    async fn record_stage_run(&self, run: &StageRunRecord) -> Result<()> {
        self.state()?.runs.push(run.clone());
        Ok(())
    }

    async fn status(&self) -> Result<PipelineStatus> {
        let state = self.state()?;
        let mut status = PipelineStatus {
            directory_cursor: state.cursor.map(|c| c.next_fetch_id),
            directory_records: state.records.len() as i64,
            ..PipelineStatus::default()
        };
        for listing in state.listings.values() {
            match listing.fetch_status {
                FetchStatus::Queued => status.listings_queued += 1,
                FetchStatus::Fetching => status.listings_fetching += 1,
                FetchStatus::Fetched => status.listings_fetched += 1,
                FetchStatus::Failed => status.listings_failed += 1,
            }
            if listing.fetch_status == FetchStatus::Fetched {
                if listing.phone.is_none() && !listing.has_contact {
                    status.missing_contact += 1;
                }
                if !listing.has_media {
                    status.missing_media += 1;
                }
            }
        }
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => status.jobs_pending += 1,
                JobStatus::Processing => status.jobs_processing += 1,
                JobStatus::Completed => status.jobs_completed += 1,
                JobStatus::Failed => status.jobs_failed += 1,
            }
        }
        status.transfers_pending = state
            .records
            .values()
            .filter(|r| r.is_transfer_candidate())
            .count() as i64;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clep_core::ScopeCombination;

    fn new_listing(external_id: &str) -> NewListing {
        NewListing::new("classifieds", external_id, ScopeCombination::new(1, 2))
    }

    #[tokio::test]
    async fn enqueue_is_insert_if_absent() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .enqueue_listings(&[new_listing("a"), new_listing("b")])
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .enqueue_listings(&[new_listing("b"), new_listing("c")])
                .await
                .unwrap(),
            1
        );
        let known = store
            .known_external_ids("classifieds", &["a".into(), "z".into()])
            .await
            .unwrap();
        assert_eq!(known, HashSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn cursor_bootstrap_only_ever_raises() {
        let store = MemoryStore::new();
        assert_eq!(store.ensure_cursor(100).await.unwrap().next_fetch_id, 100);
        assert!(store.advance_cursor(100, 140).await.unwrap());
        assert_eq!(store.ensure_cursor(120).await.unwrap().next_fetch_id, 140);
        assert_eq!(store.ensure_cursor(200).await.unwrap().next_fetch_id, 200);
        assert!(!store.advance_cursor(140, 150).await.unwrap());
        assert!(!store.advance_cursor(200, 199).await.unwrap());
        assert_eq!(store.load_cursor().await.unwrap().unwrap().next_fetch_id, 200);
    }

    #[tokio::test]
    async fn stale_fetch_claims_are_reclaimed_after_the_lease() {
        let store = MemoryStore::new();
        store.enqueue_listings(&[new_listing("a")]).await.unwrap();
        let lease = Duration::from_secs(60);
        assert_eq!(store.claim_queued_listings(5, lease).await.unwrap().len(), 1);
        assert!(store.claim_queued_listings(5, lease).await.unwrap().is_empty());

        let mut listing = store.listings().unwrap().remove(0);
        listing.claimed_at = Some(Utc::now() - chrono::Duration::seconds(120));
        store.put_listing(listing).unwrap();
        assert_eq!(store.claim_queued_listings(5, lease).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn directory_records_are_never_duplicated() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store
            .insert_directory_record(&DirectoryRecord::not_found(7, now))
            .await
            .unwrap());
        assert!(!store
            .insert_directory_record(&DirectoryRecord::stored(7, Some("x".into()), None, now))
            .await
            .unwrap());
        let records = store.directory_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, clep_core::RecordOutcome::NotFound);
    }
}
